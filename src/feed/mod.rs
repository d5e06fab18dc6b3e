//! Price feeds
//!
//! A feed answers "latest price for this instrument id, if known". `None`
//! is a transient gap, never an error. Concrete feeds write into a shared
//! [`PriceTable`]; the orchestrator calls `poll()` once per iteration and
//! then reads.

pub mod polling;
pub mod price_table;
pub mod push;
pub mod simulator;

pub use polling::{PollingFeed, QuoteSource};
pub use price_table::PriceTable;
pub use push::{PushFeed, Tick};
pub use simulator::{PriceSimulator, SimTick, SimulatedFeed};

use async_trait::async_trait;

use crate::error::Result;
use crate::models::Instrument;

#[async_trait]
pub trait PriceFeed: Send + Sync {
    /// Advance / refresh the feed; called at most once per loop iteration
    async fn poll(&mut self) -> Result<()> {
        Ok(())
    }

    /// Latest known price for an instrument (or index) id
    fn latest(&self, id: &str) -> Option<f64>;

    /// Start tracking the session's legs
    async fn subscribe(&mut self, _instruments: &[Instrument]) -> Result<()> {
        Ok(())
    }
}
