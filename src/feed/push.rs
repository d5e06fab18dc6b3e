use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{PriceFeed, PriceTable};
use crate::error::Result;
use crate::models::Instrument;

/// A single last-traded-price update from a streaming source
#[derive(Debug, Clone, PartialEq)]
pub struct Tick {
    pub id: String,
    pub price: f64,
}

/// Feed backed by a background ingest task
///
/// Whatever produces ticks (a broker websocket, a replay) sends them on the
/// channel; the ingest task writes them into the table. `subscribe` forwards
/// the leg ids to the producer so it can widen its subscription.
pub struct PushFeed {
    table: PriceTable,
    ingest: JoinHandle<()>,
    subscriptions: Option<mpsc::UnboundedSender<Vec<String>>>,
}

impl PushFeed {
    pub fn spawn(table: PriceTable, mut ticks: mpsc::Receiver<Tick>) -> Self {
        let writer = table.clone();
        let ingest = tokio::spawn(async move {
            let mut count: u64 = 0;
            while let Some(tick) = ticks.recv().await {
                writer.update(&tick.id, tick.price);
                count += 1;
            }
            tracing::info!(ticks = count, "Push feed closed");
        });
        Self {
            table,
            ingest,
            subscriptions: None,
        }
    }

    /// Route subscription requests back to the producer
    pub fn with_subscriptions(mut self, tx: mpsc::UnboundedSender<Vec<String>>) -> Self {
        self.subscriptions = Some(tx);
        self
    }

    pub fn is_connected(&self) -> bool {
        !self.ingest.is_finished()
    }
}

impl Drop for PushFeed {
    fn drop(&mut self) {
        self.ingest.abort();
    }
}

#[async_trait]
impl PriceFeed for PushFeed {
    fn latest(&self, id: &str) -> Option<f64> {
        self.table.latest(id)
    }

    async fn subscribe(&mut self, instruments: &[Instrument]) -> Result<()> {
        let ids: Vec<String> = instruments.iter().map(|i| i.id.clone()).collect();
        if let Some(tx) = &self.subscriptions {
            if tx.send(ids.clone()).is_err() {
                tracing::warn!(?ids, "Push producer gone, subscription dropped");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OptionKind;

    #[tokio::test]
    async fn test_ticks_land_in_table() {
        let (tx, rx) = mpsc::channel(16);
        let mut feed = PushFeed::spawn(PriceTable::new(), rx);

        tx.send(Tick { id: "A".into(), price: 10.0 }).await.unwrap();
        tx.send(Tick { id: "A".into(), price: 11.0 }).await.unwrap();
        drop(tx);

        // wait for the ingest task to drain and exit
        while feed.is_connected() {
            tokio::task::yield_now().await;
        }
        feed.poll().await.unwrap();
        assert_eq!(feed.latest("A"), Some(11.0));
        assert_eq!(feed.latest("B"), None);
    }

    #[tokio::test]
    async fn test_subscribe_forwards_ids() {
        let (_tx, rx) = mpsc::channel(1);
        let (sub_tx, mut sub_rx) = mpsc::unbounded_channel();
        let mut feed = PushFeed::spawn(PriceTable::new(), rx).with_subscriptions(sub_tx);

        let ce = crate::catalog::tests_support::instrument("CE1", OptionKind::Call, 24500.0);
        feed.subscribe(&[ce]).await.unwrap();
        assert_eq!(sub_rx.recv().await, Some(vec!["CE1".to_string()]));
    }
}
