use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use std::path::Path;

use super::InstrumentCatalog;
use crate::error::{EngineError, Result};
use crate::models::{Instrument, OptionKind};

/// One row of a broker instrument-master dump (all fields arrive as strings)
#[derive(Debug, Clone, Deserialize)]
struct MasterRow {
    token: String,
    symbol: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    expiry: String,
    #[serde(default)]
    strike: String,
    #[serde(default)]
    lotsize: String,
    #[serde(default)]
    instrumenttype: String,
    #[serde(default)]
    exch_seg: String,
}

/// Catalog backed by an instrument-master JSON file
///
/// Only index options on the derivatives segment are kept. Strikes are
/// listed in paise and expiries as `20OCT2026`. Ids are the bare exchange
/// tokens until [`with_segment`](Self::with_segment) qualifies them.
#[derive(Debug, Clone, Default)]
pub struct InstrumentMasterCatalog {
    contracts: Vec<Instrument>,
}

impl InstrumentMasterCatalog {
    pub async fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading instrument master {}", path.display()))?;
        let catalog = Self::from_json(&raw)?;
        tracing::info!(
            path = %path.display(),
            contracts = catalog.contracts.len(),
            "📚 Instrument master loaded"
        );
        Ok(catalog)
    }

    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        let rows: Vec<MasterRow> =
            serde_json::from_str(raw).context("instrument master is not a JSON array of rows")?;
        let contracts = rows.into_iter().filter_map(parse_row).collect();
        Ok(Self { contracts })
    }

    /// Rewrite ids as `<segment>|<token>`, the key format the REST gateway expects
    pub fn with_segment(mut self, segment: &str) -> Self {
        for contract in &mut self.contracts {
            if !contract.id.contains('|') {
                contract.id = format!("{}|{}", segment, contract.id);
            }
        }
        self
    }

    pub fn len(&self) -> usize {
        self.contracts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contracts.is_empty()
    }
}

fn parse_row(row: MasterRow) -> Option<Instrument> {
    if row.exch_seg != "NFO" || row.instrumenttype != "OPTIDX" {
        return None;
    }
    let kind = if row.symbol.ends_with("CE") {
        OptionKind::Call
    } else if row.symbol.ends_with("PE") {
        OptionKind::Put
    } else {
        return None;
    };
    let expiry = match NaiveDate::parse_from_str(&row.expiry, "%d%b%Y") {
        Ok(d) => d,
        Err(e) => {
            tracing::debug!(symbol = %row.symbol, expiry = %row.expiry, error = %e, "Skipping row with bad expiry");
            return None;
        }
    };
    let strike = row.strike.trim().parse::<f64>().ok()? / 100.0;
    let lot_size = row.lotsize.trim().parse::<u32>().ok()?;

    Some(Instrument {
        id: row.token,
        symbol: Some(row.symbol),
        underlying: row.name,
        kind,
        strike: strike.floor(),
        expiry,
        lot_size,
    })
}

#[async_trait]
impl InstrumentCatalog for InstrumentMasterCatalog {
    async fn contracts(&self, underlying: &str) -> Result<Vec<Instrument>> {
        let matching: Vec<Instrument> = self
            .contracts
            .iter()
            .filter(|c| c.underlying == underlying)
            .cloned()
            .collect();
        if matching.is_empty() {
            return Err(EngineError::Catalog(format!(
                "no index options for {} in instrument master",
                underlying
            )));
        }
        Ok(matching)
    }
}
