//! Instrument catalogs and strike selection

pub mod instrument_master;
pub mod strike_selector;

pub use instrument_master::InstrumentMasterCatalog;
pub use strike_selector::{atm_strike, Selection, StrikeSelector};

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::error::Result;
use crate::models::{Instrument, OptionKind};

/// Source of listed option contracts for an underlying
#[async_trait]
pub trait InstrumentCatalog: Send + Sync {
    async fn contracts(&self, underlying: &str) -> Result<Vec<Instrument>>;
}

/// Fixed in-memory contract list
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    contracts: Vec<Instrument>,
}

impl StaticCatalog {
    /// CE/PE pairs at `width` strikes either side of `center`
    pub fn grid(
        underlying: &str,
        center: f64,
        increment: f64,
        width: u32,
        expiry: NaiveDate,
        lot_size: u32,
    ) -> Self {
        let center = atm_strike(center, increment);
        let width = width as i64;
        let contracts = (-width..=width)
            .flat_map(|i| {
                let strike = center + i as f64 * increment;
                [OptionKind::Call, OptionKind::Put].map(|kind| Instrument {
                    id: format!("SIM|{}|{}|{}|{}", underlying, expiry, strike, kind),
                    symbol: Some(format!(
                        "{}{}{}{}",
                        underlying,
                        expiry.format("%d%b%y").to_string().to_uppercase(),
                        strike,
                        kind
                    )),
                    underlying: underlying.to_string(),
                    kind,
                    strike,
                    expiry,
                    lot_size,
                })
            })
            .collect();
        Self { contracts }
    }

    pub fn into_contracts(self) -> Vec<Instrument> {
        self.contracts
    }
}

#[async_trait]
impl InstrumentCatalog for StaticCatalog {
    async fn contracts(&self, underlying: &str) -> Result<Vec<Instrument>> {
        Ok(self
            .contracts
            .iter()
            .filter(|c| c.underlying == underlying)
            .cloned()
            .collect())
    }
}
