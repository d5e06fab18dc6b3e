use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use super::OrderGateway;
use crate::error::GatewayError;
use crate::feed::PriceTable;
use crate::models::{OrderId, OrderKind, OrderRequest, OrderSide, OrderState, OrderStatus};

/// One call received by the paper broker
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayCall {
    Place { order_id: OrderId, request: OrderRequest },
    Cancel { order_id: OrderId, instrument_id: Option<String> },
    Status { order_id: OrderId, instrument_id: Option<String> },
}

impl GatewayCall {
    pub fn instrument_id(&self) -> Option<&str> {
        match self {
            GatewayCall::Place { request, .. } => Some(&request.instrument_id),
            GatewayCall::Cancel { instrument_id, .. } | GatewayCall::Status { instrument_id, .. } => {
                instrument_id.as_deref()
            }
        }
    }
}

#[derive(Debug, Clone)]
struct PaperOrder {
    request: OrderRequest,
    state: OrderState,
    fill_price: Option<f64>,
}

/// In-memory broker for paper trading and tests
///
/// Market orders fill immediately at the table's latest price (rejected when
/// there is none). Stop orders rest until a status query finds the price
/// through the trigger (buy: at or above, sell: at or below), then fill at
/// that price. Cancelling a filled order is rejected, like a real broker.
pub struct PaperGateway {
    prices: PriceTable,
    orders: Mutex<HashMap<OrderId, PaperOrder>>,
    calls: Mutex<Vec<GatewayCall>>,
}

impl PaperGateway {
    pub fn new(prices: PriceTable) -> Self {
        Self {
            prices,
            orders: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Every call received so far, in order
    pub fn calls(&self) -> Vec<GatewayCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Resting stop orders for one instrument
    pub fn live_stop_count(&self, instrument_id: &str) -> usize {
        let orders = self.orders.lock().unwrap_or_else(|e| e.into_inner());
        orders
            .values()
            .filter(|o| {
                o.state == OrderState::Pending
                    && o.request.kind.is_stop()
                    && o.request.instrument_id == instrument_id
            })
            .count()
    }

    pub fn live_order_count(&self) -> usize {
        let orders = self.orders.lock().unwrap_or_else(|e| e.into_inner());
        orders
            .values()
            .filter(|o| o.state == OrderState::Pending)
            .count()
    }

    pub fn order_trigger(&self, order_id: &OrderId) -> Option<f64> {
        let orders = self.orders.lock().unwrap_or_else(|e| e.into_inner());
        orders.get(order_id).and_then(|o| match o.request.kind {
            OrderKind::Stop { trigger, .. } => Some(trigger),
            OrderKind::Market => None,
        })
    }

    pub fn order_state(&self, order_id: &OrderId) -> Option<OrderState> {
        let orders = self.orders.lock().unwrap_or_else(|e| e.into_inner());
        orders.get(order_id).map(|o| o.state)
    }

    fn record(&self, call: GatewayCall) {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(call);
    }

    fn instrument_of(&self, order_id: &OrderId) -> Option<String> {
        let orders = self.orders.lock().unwrap_or_else(|e| e.into_inner());
        orders.get(order_id).map(|o| o.request.instrument_id.clone())
    }
}

fn crossed(side: OrderSide, price: f64, trigger: f64) -> bool {
    match side {
        OrderSide::Buy => price >= trigger,
        OrderSide::Sell => price <= trigger,
    }
}

#[async_trait]
impl OrderGateway for PaperGateway {
    async fn place(&self, request: &OrderRequest) -> Result<OrderId, GatewayError> {
        let order_id = OrderId(format!("paper-{}", Uuid::new_v4()));
        self.record(GatewayCall::Place {
            order_id: order_id.clone(),
            request: request.clone(),
        });

        let order = match request.kind {
            OrderKind::Market => {
                let price = self.prices.latest(&request.instrument_id).ok_or_else(|| {
                    GatewayError::Rejected(format!("no price for {}", request.instrument_id))
                })?;
                PaperOrder {
                    request: request.clone(),
                    state: OrderState::Filled,
                    fill_price: Some(price),
                }
            }
            OrderKind::Stop { .. } => PaperOrder {
                request: request.clone(),
                state: OrderState::Pending,
                fill_price: None,
            },
        };

        tracing::debug!(
            order = %order_id,
            instrument = %request.instrument_id,
            side = %request.side,
            kind = ?request.kind,
            "📝 Paper order accepted"
        );
        self.orders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(order_id.clone(), order);
        Ok(order_id)
    }

    async fn cancel(&self, order_id: &OrderId) -> Result<(), GatewayError> {
        self.record(GatewayCall::Cancel {
            order_id: order_id.clone(),
            instrument_id: self.instrument_of(order_id),
        });

        let mut orders = self.orders.lock().unwrap_or_else(|e| e.into_inner());
        let order = orders
            .get_mut(order_id)
            .ok_or_else(|| GatewayError::UnknownOrder(order_id.to_string()))?;
        match order.state {
            OrderState::Pending => {
                order.state = OrderState::Cancelled;
                Ok(())
            }
            OrderState::Cancelled => Ok(()),
            OrderState::Filled => Err(GatewayError::Rejected(format!(
                "order {} already filled",
                order_id
            ))),
            OrderState::Rejected => Err(GatewayError::Rejected(format!(
                "order {} was rejected",
                order_id
            ))),
        }
    }

    async fn status(&self, order_id: &OrderId) -> Result<OrderStatus, GatewayError> {
        self.record(GatewayCall::Status {
            order_id: order_id.clone(),
            instrument_id: self.instrument_of(order_id),
        });

        let mut orders = self.orders.lock().unwrap_or_else(|e| e.into_inner());
        let order = orders
            .get_mut(order_id)
            .ok_or_else(|| GatewayError::UnknownOrder(order_id.to_string()))?;

        if order.state == OrderState::Pending {
            if let OrderKind::Stop { trigger, .. } = order.request.kind {
                if let Some(price) = self.prices.latest(&order.request.instrument_id) {
                    if crossed(order.request.side, price, trigger) {
                        order.state = OrderState::Filled;
                        order.fill_price = Some(price);
                    }
                }
            }
        }

        Ok(OrderStatus {
            state: order.state,
            avg_fill_price: order.fill_price,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests_support::instrument;
    use crate::models::OptionKind;

    #[tokio::test]
    async fn test_market_fills_at_latest_or_rejects() {
        let table = PriceTable::new();
        let gw = PaperGateway::new(table.clone());
        let ce = instrument("CE1", OptionKind::Call, 24500.0);

        let req = OrderRequest::market(&ce, OrderSide::Sell, 75);
        assert!(matches!(gw.place(&req).await, Err(GatewayError::Rejected(_))));

        table.update("CE1", 198.5);
        let id = gw.place(&req).await.unwrap();
        assert_eq!(gw.status(&id).await.unwrap(), OrderStatus::filled(198.5));
    }

    #[tokio::test]
    async fn test_stop_fills_once_crossed() {
        let table = PriceTable::new();
        let gw = PaperGateway::new(table.clone());
        let ce = instrument("CE1", OptionKind::Call, 24500.0);
        table.update("CE1", 200.0);

        let id = gw
            .place(&OrderRequest::stop(&ce, OrderSide::Buy, 75, 242.0, 5.0))
            .await
            .unwrap();
        assert_eq!(gw.live_stop_count("CE1"), 1);
        assert_eq!(gw.status(&id).await.unwrap().state, OrderState::Pending);

        table.update("CE1", 243.0);
        assert_eq!(gw.status(&id).await.unwrap(), OrderStatus::filled(243.0));
        assert_eq!(gw.live_stop_count("CE1"), 0);

        // too late to cancel
        assert!(matches!(gw.cancel(&id).await, Err(GatewayError::Rejected(_))));
    }

    #[test]
    fn test_cancel_pending_and_unknown() {
        let table = PriceTable::new();
        let gw = PaperGateway::new(table);
        let pe = instrument("PE1", OptionKind::Put, 24500.0);

        let id = tokio_test::block_on(
            gw.place(&OrderRequest::stop(&pe, OrderSide::Buy, 75, 242.0, 5.0)),
        )
        .unwrap();
        tokio_test::block_on(gw.cancel(&id)).unwrap();
        assert_eq!(gw.order_state(&id), Some(OrderState::Cancelled));
        assert_eq!(gw.live_order_count(), 0);

        let missing = OrderId::from("nope");
        assert!(matches!(
            tokio_test::block_on(gw.cancel(&missing)),
            Err(GatewayError::UnknownOrder(_))
        ));
        assert_eq!(gw.calls().len(), 3);
        assert_eq!(gw.calls()[1].instrument_id(), Some("PE1"));
    }
}
