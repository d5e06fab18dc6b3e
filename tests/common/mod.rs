//! Common test utilities and fixtures
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{FixedOffset, NaiveDate, TimeZone};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

use straddlebot::catalog::StaticCatalog;
use straddlebot::config::SessionConfig;
use straddlebot::engine::{SessionReport, StrategyOrchestrator, TokioClock};
use straddlebot::feed::{PriceFeed, PriceTable};
use straddlebot::gateway::{OrderGateway, PaperGateway};
use straddlebot::{
    GatewayError, Instrument, OptionKind, OrderId, OrderKind, OrderRequest, OrderState,
    OrderStatus, Result,
};

pub const INDEX_ID: &str = "IDX|NIFTY";
pub const SPOT: f64 = 24500.0;

pub fn ist() -> FixedOffset {
    FixedOffset::east_opt(330 * 60).unwrap()
}

/// Session date used by every scenario (a Thursday)
pub fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 10, 15).unwrap()
}

/// The listed weekly expiry the selector should pick
pub fn expiry() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 10, 20).unwrap()
}

pub fn catalog() -> StaticCatalog {
    StaticCatalog::grid("NIFTY", SPOT, 50.0, 4, expiry(), 75)
}

pub fn leg_id(kind: OptionKind) -> String {
    format!("SIM|NIFTY|{}|{}|{}", expiry(), SPOT, kind)
}

pub fn clock_at(hour: u32, minute: u32) -> Arc<TokioClock> {
    let start = ist()
        .with_ymd_and_hms(2026, 10, 15, hour, minute, 0)
        .unwrap();
    Arc::new(TokioClock::starting_at(start))
}

pub fn session() -> SessionConfig {
    SessionConfig {
        index_id: INDEX_ID.to_string(),
        ..Default::default()
    }
}

/// Leg prices for one feed poll; `None` is a gap
#[derive(Debug, Clone, Copy)]
pub struct Frame {
    pub ce: Option<f64>,
    pub pe: Option<f64>,
}

pub fn frames(prices: &[(f64, f64)]) -> Vec<Frame> {
    prices
        .iter()
        .map(|&(ce, pe)| Frame {
            ce: Some(ce),
            pe: Some(pe),
        })
        .collect()
}

/// Feed that replays scripted leg prices
///
/// Before the legs are subscribed each poll only publishes the spot. After
/// that every poll applies the next frame; frame 0 is therefore the price
/// seen at entry. Once the script runs out the last prices stay in place.
pub struct ScriptedFeed {
    table: PriceTable,
    spot: Option<f64>,
    frames: VecDeque<Frame>,
    ce_id: Option<String>,
    pe_id: Option<String>,
    pub polls: u64,
}

impl ScriptedFeed {
    pub fn new(table: PriceTable, frames: Vec<Frame>) -> Self {
        Self {
            table,
            spot: Some(SPOT),
            frames: frames.into(),
            ce_id: None,
            pe_id: None,
            polls: 0,
        }
    }

    pub fn without_spot(mut self) -> Self {
        self.spot = None;
        self
    }

    fn apply(&self, id: &Option<String>, price: Option<f64>) {
        if let Some(id) = id {
            match price {
                Some(p) => self.table.update(id, p),
                None => self.table.clear(id),
            }
        }
    }
}

#[async_trait]
impl PriceFeed for ScriptedFeed {
    async fn poll(&mut self) -> Result<()> {
        self.polls += 1;
        if let Some(spot) = self.spot {
            self.table.update(INDEX_ID, spot);
        }
        if self.ce_id.is_none() && self.pe_id.is_none() {
            return Ok(());
        }
        if let Some(frame) = self.frames.pop_front() {
            self.apply(&self.ce_id, frame.ce);
            self.apply(&self.pe_id, frame.pe);
        }
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
        Ok(())
    }
}

/// Paper broker wrapper with fault injection and a live-stop high-water mark
pub struct TestGateway {
    pub paper: Arc<PaperGateway>,
    failing_places: AtomicU32,
    max_live_stops: AtomicUsize,
    places: AtomicUsize,
    reuse_id_at: AtomicUsize,
    last_id: Mutex<Option<OrderId>>,
    market_places: AtomicUsize,
    market_limit: AtomicUsize,
    stop_race: AtomicBool,
    raced: Mutex<Option<OrderId>>,
}

impl TestGateway {
    pub fn new(table: PriceTable) -> Self {
        Self {
            paper: Arc::new(PaperGateway::new(table)),
            failing_places: AtomicU32::new(0),
            max_live_stops: AtomicUsize::new(0),
            places: AtomicUsize::new(0),
            reuse_id_at: AtomicUsize::new(0),
            last_id: Mutex::new(None),
            market_places: AtomicUsize::new(0),
            market_limit: AtomicUsize::new(usize::MAX),
            stop_race: AtomicBool::new(false),
            raced: Mutex::new(None),
        }
    }

    /// The next `n` place calls fail with a transport error
    pub fn fail_next_places(&self, n: u32) {
        self.failing_places.store(n, Ordering::SeqCst);
    }

    /// The `n`th place call (1-based) is accepted but answered with the previous order id
    pub fn reuse_id_on_place(&self, n: usize) {
        self.reuse_id_at.store(n, Ordering::SeqCst);
    }

    /// Market orders after the first `n` are rejected
    pub fn reject_markets_after(&self, n: usize) {
        self.market_limit.store(n, Ordering::SeqCst);
    }

    /// The next status query on a resting stop reports it working, and the
    /// broker fills it just before the following cancel arrives
    pub fn race_next_stop_fill(&self) {
        self.stop_race.store(true, Ordering::SeqCst);
    }

    /// Most resting stops ever seen on a single instrument
    pub fn max_live_stops(&self) -> usize {
        self.max_live_stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OrderGateway for TestGateway {
    async fn place(&self, request: &OrderRequest) -> std::result::Result<OrderId, GatewayError> {
        let remaining = self.failing_places.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_places.store(remaining - 1, Ordering::SeqCst);
            return Err(GatewayError::Transport("connection reset".into()));
        }
        if request.kind == OrderKind::Market {
            let n = self.market_places.fetch_add(1, Ordering::SeqCst);
            if n >= self.market_limit.load(Ordering::SeqCst) {
                return Err(GatewayError::Rejected("RMS: order blocked".into()));
            }
        }
        let n = self.places.fetch_add(1, Ordering::SeqCst) + 1;
        let mut id = self.paper.place(request).await?;
        let live = self.paper.live_stop_count(&request.instrument_id);
        self.max_live_stops.fetch_max(live, Ordering::SeqCst);

        let mut last = self.last_id.lock().unwrap();
        if n == self.reuse_id_at.load(Ordering::SeqCst) {
            if let Some(previous) = last.clone() {
                id = previous;
            }
        }
        *last = Some(id.clone());
        Ok(id)
    }

    async fn cancel(&self, order_id: &OrderId) -> std::result::Result<(), GatewayError> {
        let raced = {
            let mut slot = self.raced.lock().unwrap();
            if slot.as_ref() == Some(order_id) {
                slot.take()
            } else {
                None
            }
        };
        if raced.is_some() {
            // the exchange matches the stop before the cancel lands
            self.paper.status(order_id).await?;
        }
        self.paper.cancel(order_id).await
    }

    async fn status(&self, order_id: &OrderId) -> std::result::Result<OrderStatus, GatewayError> {
        let resting_stop = self.paper.order_trigger(order_id).is_some()
            && self.paper.order_state(order_id) == Some(OrderState::Pending);
        if resting_stop && self.stop_race.swap(false, Ordering::SeqCst) {
            *self.raced.lock().unwrap() = Some(order_id.clone());
            return Ok(OrderStatus::pending());
        }
        self.paper.status(order_id).await
    }
}

/// Everything a scripted session needs, sharing one price table
pub struct Harness {
    pub table: PriceTable,
    pub gateway: Arc<TestGateway>,
}

impl Harness {
    pub fn new() -> Self {
        let table = PriceTable::new();
        let gateway = Arc::new(TestGateway::new(table.clone()));
        Self { table, gateway }
    }

    pub fn orchestrator(
        &self,
        config: SessionConfig,
        feed: ScriptedFeed,
        clock: Arc<TokioClock>,
    ) -> StrategyOrchestrator {
        StrategyOrchestrator::new(config, Box::new(feed), self.gateway.clone(), clock).unwrap()
    }

    pub fn feed(&self, frames: Vec<Frame>) -> ScriptedFeed {
        ScriptedFeed::new(self.table.clone(), frames)
    }

    /// Run a full session against the default catalog
    pub async fn run(
        &self,
        config: SessionConfig,
        frames: Vec<Frame>,
        clock: Arc<TokioClock>,
    ) -> Result<SessionReport> {
        let (_tx, rx) = watch::channel(false);
        self.orchestrator(config, self.feed(frames), clock)
            .run(&catalog(), rx)
            .await
    }

    /// Gateway calls that touched one instrument
    pub fn calls_for(&self, id: &str) -> Vec<straddlebot::gateway::GatewayCall> {
        self.gateway
            .paper
            .calls()
            .into_iter()
            .filter(|c| c.instrument_id() == Some(id))
            .collect()
    }
}
