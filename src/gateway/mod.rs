//! Order gateway seam
//!
//! The engine only ever sees `OrderGateway`; paper and broker adapters sit
//! behind it. Every call the engine makes goes through [`TimedGateway`] so a
//! hung broker surfaces as `GatewayError::Timeout` instead of stalling the
//! control loop.

pub mod paper;

pub use paper::{GatewayCall, PaperGateway};

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use crate::error::GatewayError;
use crate::models::{OrderId, OrderRequest, OrderStatus};

#[async_trait]
pub trait OrderGateway: Send + Sync {
    async fn place(&self, request: &OrderRequest) -> Result<OrderId, GatewayError>;

    async fn cancel(&self, order_id: &OrderId) -> Result<(), GatewayError>;

    async fn status(&self, order_id: &OrderId) -> Result<OrderStatus, GatewayError>;
}

/// Bounds every gateway call with a timeout
#[derive(Clone)]
pub struct TimedGateway {
    inner: Arc<dyn OrderGateway>,
    limit: Duration,
}

impl TimedGateway {
    pub fn new(inner: Arc<dyn OrderGateway>, limit: Duration) -> Self {
        Self { inner, limit }
    }

    pub async fn place(&self, request: &OrderRequest) -> Result<OrderId, GatewayError> {
        timeout(self.limit, self.inner.place(request))
            .await
            .map_err(|_| GatewayError::Timeout(self.limit))?
    }

    pub async fn cancel(&self, order_id: &OrderId) -> Result<(), GatewayError> {
        timeout(self.limit, self.inner.cancel(order_id))
            .await
            .map_err(|_| GatewayError::Timeout(self.limit))?
    }

    pub async fn status(&self, order_id: &OrderId) -> Result<OrderStatus, GatewayError> {
        timeout(self.limit, self.inner.status(order_id))
            .await
            .map_err(|_| GatewayError::Timeout(self.limit))?
    }
}
