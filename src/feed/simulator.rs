use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::PI;

use super::{PriceFeed, PriceTable};
use crate::config::SimulatorConfig;
use crate::error::Result;
use crate::models::{round1, Instrument, OptionKind};

/// One simulated observation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimTick {
    pub spot: f64,
    pub ce: f64,
    pub pe: f64,
}

/// Seeded random walk of spot with first-order option premiums
///
/// Each tick: spot moves by a Gaussian step, CE gains and PE loses
/// `delta_sensitivity` per point of spot move, both decay by
/// `theta_decay`, and neither drops below `min_premium`.
pub struct PriceSimulator {
    rng: StdRng,
    params: SimulatorConfig,
    spot: f64,
    ce: f64,
    pe: f64,
}

impl PriceSimulator {
    pub fn new(params: SimulatorConfig) -> Self {
        Self {
            rng: StdRng::seed_from_u64(params.seed),
            spot: params.start_spot,
            ce: params.base_premium,
            pe: params.base_premium,
            params,
        }
    }

    /// Current values without advancing
    pub fn current(&self) -> SimTick {
        SimTick {
            spot: round1(self.spot),
            ce: round1(self.ce),
            pe: round1(self.pe),
        }
    }

    /// Standard normal sample (Box-Muller)
    fn standard_normal(&mut self) -> f64 {
        let u1: f64 = self.rng.gen_range(f64::EPSILON..1.0);
        let u2: f64 = self.rng.gen();
        (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
    }

    pub fn tick(&mut self) -> SimTick {
        let p = &self.params;
        let (sigma, sens, theta, floor) =
            (p.spot_sigma, p.delta_sensitivity, p.theta_decay, p.min_premium);

        let ds = self.standard_normal() * sigma;
        self.spot += ds;
        self.ce = (self.ce + sens * ds - theta).max(floor);
        self.pe = (self.pe - sens * ds - theta).max(floor);

        self.current()
    }
}

/// Simulator published through a `PriceTable`, one tick per `poll()`
pub struct SimulatedFeed {
    sim: PriceSimulator,
    table: PriceTable,
    index_id: String,
    ce_id: Option<String>,
    pe_id: Option<String>,
}

impl SimulatedFeed {
    pub fn new(params: SimulatorConfig, index_id: impl Into<String>, table: PriceTable) -> Self {
        let feed = Self {
            sim: PriceSimulator::new(params),
            table,
            index_id: index_id.into(),
            ce_id: None,
            pe_id: None,
        };
        feed.publish(feed.sim.current());
        feed
    }

    pub fn table(&self) -> &PriceTable {
        &self.table
    }

    fn publish(&self, tick: SimTick) {
        self.table.update(&self.index_id, tick.spot);
        if let Some(id) = &self.ce_id {
            self.table.update(id, tick.ce);
        }
        if let Some(id) = &self.pe_id {
            self.table.update(id, tick.pe);
        }
    }
}

#[async_trait]
impl PriceFeed for SimulatedFeed {
    async fn poll(&mut self) -> Result<()> {
        let tick = self.sim.tick();
        self.publish(tick);
        tracing::trace!(spot = tick.spot, ce = tick.ce, pe = tick.pe, "Simulated tick");
        Ok(())
    }

    fn latest(&self, id: &str) -> Option<f64> {
        self.table.latest(id)
    }

    async fn subscribe(&mut self, instruments: &[Instrument]) -> Result<()> {
        for inst in instruments {
            match inst.kind {
                OptionKind::Call => self.ce_id = Some(inst.id.clone()),
                OptionKind::Put => self.pe_id = Some(inst.id.clone()),
            }
        }
        self.publish(self.sim.current());
        Ok(())
    }
}
