use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Thread-safe last-traded-price table
///
/// Shared between feed producers (simulator, REST poller, push ingest task)
/// and readers (orchestrator, paper gateway). Last write wins.
#[derive(Clone, Default)]
pub struct PriceTable {
    data: Arc<RwLock<HashMap<String, f64>>>,
}

impl PriceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a price; non-finite or negative values are dropped
    pub fn update(&self, id: &str, price: f64) {
        if !price.is_finite() || price < 0.0 {
            tracing::debug!(id, price, "Ignoring invalid price");
            return;
        }
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        data.insert(id.to_string(), price);
    }

    pub fn latest(&self, id: &str) -> Option<f64> {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        data.get(id).copied()
    }

    /// Drop a price so readers see a gap
    pub fn clear(&self, id: &str) {
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        data.remove(id);
    }

    pub fn len(&self) -> usize {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
