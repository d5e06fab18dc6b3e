use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use super::{PriceFeed, PriceTable};
use crate::error::Result;
use crate::models::Instrument;

/// Anything that can return last traded prices for a batch of ids
#[async_trait]
pub trait QuoteSource: Send + Sync {
    async fn last_prices(&self, ids: &[String]) -> anyhow::Result<HashMap<String, f64>>;
}

/// REST polling feed: one batched quote request per `poll()`
///
/// A failed request is logged and leaves the previous prices in place, so
/// callers see stale values rather than an error.
pub struct PollingFeed {
    source: Arc<dyn QuoteSource>,
    table: PriceTable,
    ids: Vec<String>,
}

impl PollingFeed {
    pub fn new(source: Arc<dyn QuoteSource>, index_id: impl Into<String>, table: PriceTable) -> Self {
        Self {
            source,
            table,
            ids: vec![index_id.into()],
        }
    }
}

#[async_trait]
impl PriceFeed for PollingFeed {
    async fn poll(&mut self) -> Result<()> {
        match self.source.last_prices(&self.ids).await {
            Ok(prices) => {
                for (id, price) in prices {
                    self.table.update(&id, price);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, ids = ?self.ids, "Quote poll failed, keeping last prices");
            }
        }
        Ok(())
    }

    fn latest(&self, id: &str) -> Option<f64> {
        self.table.latest(id)
    }

    async fn subscribe(&mut self, instruments: &[Instrument]) -> Result<()> {
        for inst in instruments {
            if !self.ids.contains(&inst.id) {
                self.ids.push(inst.id.clone());
            }
        }
        Ok(())
    }
}
