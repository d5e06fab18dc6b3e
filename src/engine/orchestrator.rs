//! Time-gated session driver
//!
//! One task owns the whole session: it waits for the entry time, resolves
//! the straddle, opens both legs and then runs a fixed-interval control
//! loop until the legs are closed, the basket trail locks in profit, the
//! exit time arrives or shutdown is requested. Every terminal path goes
//! through the forced exit, which retries a bounded number of times.

use chrono::{DateTime, FixedOffset, NaiveDate};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval_at, sleep, Duration, Instant, MissedTickBehavior};

use super::basket::{basket_pnl, BasketTrailTracker, TrailDecision, TrailState};
use super::clock::Clock;
use super::leg::{ExitReason, Leg, LegContext, LegEvent, TrailRule};
use crate::catalog::{InstrumentCatalog, Selection, StrikeSelector};
use crate::config::{EntryMode, SessionConfig};
use crate::error::{EngineError, Result};
use crate::feed::PriceFeed;
use crate::gateway::{OrderGateway, TimedGateway};
use crate::models::{round1, Instrument, OptionKind, OrderId, PositionSide};

/// Why a session stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionEnd {
    AllLegsClosed,
    TrailLock,
    EndOfDay,
    Shutdown,
    /// Exit time had already passed before entry
    MissedEntry,
}

#[derive(Debug, Clone, Serialize)]
pub struct LegSummary {
    pub kind: OptionKind,
    pub instrument_id: String,
    pub quantity: u32,
    pub entry_price: Option<f64>,
    pub exit_price: Option<f64>,
    pub realized_pnl: f64,
    pub reason: Option<ExitReason>,
}

impl LegSummary {
    fn from_leg(leg: &Leg) -> Self {
        let closed = leg.closed();
        Self {
            kind: leg.kind(),
            instrument_id: leg.instrument.id.clone(),
            quantity: leg.quantity,
            entry_price: leg.entry_price(),
            exit_price: closed.and_then(|c| c.exit_price),
            realized_pnl: closed.map(|c| c.realized_pnl).unwrap_or(0.0),
            reason: closed.map(|c| c.reason),
        }
    }
}

/// Outcome of one session
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub spot: Option<f64>,
    pub strike: Option<f64>,
    pub expiry: Option<NaiveDate>,
    pub legs: Vec<LegSummary>,
    pub basket_pnl: f64,
    pub trail: TrailState,
    pub end: SessionEnd,
    pub iterations: u64,
}

impl SessionReport {
    fn not_started(end: SessionEnd) -> Self {
        Self {
            spot: None,
            strike: None,
            expiry: None,
            legs: Vec::new(),
            basket_pnl: 0.0,
            trail: TrailState::default(),
            end,
            iterations: 0,
        }
    }

    pub fn leg(&self, kind: OptionKind) -> Option<&LegSummary> {
        self.legs.iter().find(|l| l.kind == kind)
    }
}

/// Leg index of the other side of the straddle
fn sibling(i: usize) -> usize {
    1 - i
}

/// A broker order id may belong to one leg only
fn check_order_ownership(legs: &[Leg]) -> Result<()> {
    let mut owners: HashMap<&OrderId, OptionKind> = HashMap::new();
    for leg in legs {
        for id in leg.live_orders() {
            if let Some(other) = owners.insert(id, leg.kind()) {
                return Err(EngineError::InvariantViolation(format!(
                    "order {} tracked by both {} and {}",
                    id,
                    other,
                    leg.kind()
                )));
            }
        }
    }
    Ok(())
}

pub struct StrategyOrchestrator {
    config: SessionConfig,
    feed: Box<dyn PriceFeed>,
    gateway: TimedGateway,
    clock: Arc<dyn Clock>,
    wait_for_entry: bool,
}

impl StrategyOrchestrator {
    pub fn new(
        config: SessionConfig,
        feed: Box<dyn PriceFeed>,
        gateway: Arc<dyn OrderGateway>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let gateway = TimedGateway::new(gateway, config.gateway_timeout());
        Ok(Self {
            config,
            feed,
            gateway,
            clock,
            wait_for_entry: true,
        })
    }

    /// Enter immediately instead of waiting for the configured entry time
    pub fn skip_entry_wait(mut self) -> Self {
        self.wait_for_entry = false;
        self
    }

    fn now(&self) -> DateTime<FixedOffset> {
        self.clock.now()
    }

    fn past_exit(&self) -> bool {
        self.now().time() >= self.config.exit_time
    }

    pub async fn run(
        mut self,
        catalog: &dyn InstrumentCatalog,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<SessionReport> {
        tracing::info!(
            underlying = %self.config.underlying,
            side = %self.config.side,
            entry = %self.config.entry_time,
            exit = %self.config.exit_time,
            "🚀 Session starting"
        );

        if self.wait_for_entry && !self.wait_until_entry(&mut shutdown).await {
            tracing::info!("⚠️  Shutdown before entry, nothing opened");
            return Ok(SessionReport::not_started(SessionEnd::Shutdown));
        }
        if self.past_exit() {
            tracing::warn!(now = %self.now(), "Exit time already passed, not entering");
            return Ok(SessionReport::not_started(SessionEnd::MissedEntry));
        }

        let selection = self.resolve(catalog).await?;
        let mut legs = self.build_legs(&selection).await?;
        let ctx = LegContext {
            stop_rule: self.config.stop_rule(),
            stop_limit_offset: self.config.stop_limit_offset,
        };
        let trail_rule = self.config.trail_rule();
        let mut tracker =
            BasketTrailTracker::new(self.config.arm_threshold, self.config.trail_step);

        let opened = self
            .drive_all(&mut legs, &ctx)
            .await
            .and_then(|()| check_order_ownership(&legs));
        if let Err(e) = opened {
            return self.halt(&mut legs, &ctx, e).await;
        }

        let poll = self.config.poll_interval();
        let mut ticker = interval_at(Instant::now() + poll, poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut iterations: u64 = 0;

        let end = loop {
            if *shutdown.borrow() {
                break SessionEnd::Shutdown;
            }
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    // a dropped sender counts as shutdown
                    if changed.is_err() || *shutdown.borrow() {
                        break SessionEnd::Shutdown;
                    }
                    continue;
                }
            }
            iterations += 1;

            if self.past_exit() {
                break SessionEnd::EndOfDay;
            }

            if let Err(e) = self.feed.poll().await {
                tracing::warn!(error = %e, "Feed poll failed");
            }

            match self.step(&mut legs, &mut tracker, &ctx, trail_rule.as_ref()).await {
                Ok(Some(end)) => break end,
                Ok(None) => {}
                Err(e) => return self.halt(&mut legs, &ctx, e).await,
            }
        };

        if end != SessionEnd::AllLegsClosed {
            let reason = match end {
                SessionEnd::TrailLock => ExitReason::TrailLock,
                SessionEnd::Shutdown => ExitReason::Shutdown,
                _ => ExitReason::EndOfDay,
            };
            self.force_exit(&mut legs, &ctx, reason).await?;
        }

        let report = SessionReport {
            spot: Some(selection.spot),
            strike: Some(selection.strike),
            expiry: Some(selection.expiry),
            legs: legs.iter().map(LegSummary::from_leg).collect(),
            basket_pnl: basket_pnl(legs.iter().map(|l| l.realized_pnl().unwrap_or(0.0))),
            trail: tracker.state(),
            end,
            iterations,
        };
        tracing::info!(
            end = ?report.end,
            pnl = report.basket_pnl,
            iterations,
            "🏁 Session finished"
        );
        Ok(report)
    }

    /// Coarse wait until entry time; false if shutdown arrived first
    async fn wait_until_entry(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        loop {
            if *shutdown.borrow() {
                return false;
            }
            let now = self.now();
            let remaining = match self
                .config
                .entry_time
                .signed_duration_since(now.time())
                .to_std()
            {
                Ok(d) if !d.is_zero() => d,
                _ => return true,
            };
            tracing::debug!(now = %now.time(), ?remaining, "Waiting for entry time");
            let nap = remaining.min(self.config.entry_wait_poll());
            tokio::select! {
                _ = sleep(nap) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    /// Poll the feed until every id has a price or the wait window closes
    async fn wait_for_prices(&mut self, ids: &[&str]) -> Result<Vec<f64>> {
        let deadline = Instant::now() + self.config.price_wait_timeout();
        let nap = self.config.poll_interval().min(Duration::from_secs(1));
        loop {
            if let Err(e) = self.feed.poll().await {
                tracing::warn!(error = %e, "Feed poll failed");
            }
            let prices: Vec<Option<f64>> = ids.iter().map(|id| self.feed.latest(id)).collect();
            if prices.iter().all(Option::is_some) {
                return Ok(prices.into_iter().flatten().collect());
            }
            if Instant::now() >= deadline {
                let missing: Vec<&str> = ids
                    .iter()
                    .zip(&prices)
                    .filter(|(_, p)| p.is_none())
                    .map(|(id, _)| *id)
                    .collect();
                return Err(EngineError::PriceUnavailable(missing.join(",")));
            }
            sleep(nap).await;
        }
    }

    async fn resolve(&mut self, catalog: &dyn InstrumentCatalog) -> Result<Selection> {
        let index_id = self.config.index_id.clone();
        let spot = self.wait_for_prices(&[index_id.as_str()]).await?[0];
        let contracts = catalog.contracts(&self.config.underlying).await?;
        tracing::info!(spot, contracts = contracts.len(), "Resolving straddle");

        let selector = StrikeSelector::new(self.config.strike_increment, self.config.expiry.clone());
        let selection = selector.select(&contracts, spot, self.now().date_naive())?;

        self.feed
            .subscribe(&[selection.ce.clone(), selection.pe.clone()])
            .await?;
        Ok(selection)
    }

    fn quantity_for(&self, instrument: &Instrument) -> u32 {
        self.config
            .quantity
            .unwrap_or(instrument.lot_size * self.config.lot_multiplier)
    }

    async fn build_legs(&mut self, selection: &Selection) -> Result<Vec<Leg>> {
        let ids = [selection.ce.id.as_str(), selection.pe.id.as_str()];
        let cmp = self.wait_for_prices(&ids).await?;
        let side = self.config.side;

        let mut legs = Vec::with_capacity(2);
        for (instrument, price) in [selection.ce.clone(), selection.pe.clone()].into_iter().zip(cmp) {
            let quantity = self.quantity_for(&instrument);
            let mut leg = Leg::new(instrument, side, quantity)?;
            leg.observe(Some(price));
            if let EntryMode::Breakout { pct } = self.config.entry {
                let trigger = match side {
                    PositionSide::Long => price * (1.0 + pct / 100.0),
                    PositionSide::Short => price * (1.0 - pct / 100.0),
                };
                leg = leg.with_entry_trigger(round1(trigger));
            }
            tracing::info!(
                leg = %leg.kind(),
                instrument = %leg.instrument.id,
                price,
                quantity,
                entry_trigger = ?leg.entry_trigger(),
                "Leg prepared"
            );
            legs.push(leg);
        }
        Ok(legs)
    }

    /// One control-loop iteration after the feed has been polled
    async fn step(
        &mut self,
        legs: &mut [Leg],
        tracker: &mut BasketTrailTracker,
        ctx: &LegContext,
        trail_rule: Option<&TrailRule>,
    ) -> Result<Option<SessionEnd>> {
        for leg in legs.iter_mut() {
            let price = self.feed.latest(&leg.instrument.id);
            leg.observe(price);
            let Some(price) = price else {
                tracing::debug!(leg = %leg.kind(), "No price this tick");
                continue;
            };
            if !leg.is_open() || leg.exit_request().is_some() {
                continue;
            }
            if let Some(rule) = trail_rule {
                if leg.trail(price, rule) {
                    tracing::info!(leg = %leg.kind(), price, stop = ?leg.stop_trigger(), "📈 Leg stop trailed up");
                }
            }
            if leg.stop_hit(price) {
                tracing::info!(leg = %leg.kind(), price, trigger = ?leg.stop_trigger(), "🛑 Stop hit");
                leg.request_exit(ExitReason::StopLoss);
            }
        }

        self.drive_all(legs, ctx).await?;
        check_order_ownership(legs)?;

        for leg in legs.iter() {
            if let Some(unprotected) = leg
                .open_position()
                .filter(|p| p.protective.is_none() && p.exit_order.is_none())
                .and_then(|p| p.unprotected_for())
            {
                tracing::error!(
                    leg = %leg.kind(),
                    unprotected_secs = unprotected.as_secs_f64(),
                    "Open leg has no protective stop"
                );
            }
        }

        if legs.iter().all(Leg::is_closed) {
            return Ok(Some(SessionEnd::AllLegsClosed));
        }

        let contributions: Option<Vec<f64>> = legs.iter().map(Leg::pnl_contribution).collect();
        let Some(contributions) = contributions else {
            return Ok(None);
        };
        let pnl = basket_pnl(contributions);
        let any_open = legs.iter().any(Leg::is_open);

        match tracker.evaluate(pnl, any_open) {
            TrailDecision::Hold => Ok(None),
            TrailDecision::Armed { locked_floor, last_step } => {
                tracing::info!(pnl, locked_floor, last_step, "🔒 Basket trail armed");
                Ok(None)
            }
            TrailDecision::Advanced { locked_floor, last_step } => {
                tracing::info!(pnl, locked_floor, last_step, "🔒 Basket trail advanced");
                Ok(None)
            }
            TrailDecision::Exit { pnl, locked_floor } => {
                tracing::info!(pnl, locked_floor, "💰 Basket fell to locked floor, exiting");
                Ok(Some(SessionEnd::TrailLock))
            }
        }
    }

    /// Drive every leg, propagating sibling reactions within the same iteration
    ///
    /// Gateway failures are logged and left for the next iteration; anything
    /// else is returned.
    async fn drive_all(&self, legs: &mut [Leg], ctx: &LegContext) -> Result<()> {
        let mut queue: Vec<usize> = (0..legs.len()).rev().collect();
        while let Some(i) = queue.pop() {
            let mut events = Vec::new();
            let outcome = legs[i].drive(&self.gateway, ctx, &mut events).await;

            for event in &events {
                let j = sibling(i);
                match event {
                    LegEvent::Closed {
                        reason: ExitReason::StopLoss,
                        ..
                    } => {
                        if legs[j].move_to_cost() {
                            tracing::info!(
                                leg = %legs[j].kind(),
                                stop = ?legs[j].stop_trigger(),
                                "↩️  Sibling stopped out, stop moved to cost"
                            );
                            queue.push(j);
                        }
                    }
                    LegEvent::Entered { .. }
                        if self.config.cancel_sibling_on_fill && legs[j].is_pending() =>
                    {
                        tracing::info!(leg = %legs[j].kind(), "Sibling filled first, cancelling entry");
                        legs[j].request_exit(ExitReason::EntryCancelled);
                        queue.push(j);
                    }
                    _ => {}
                }
            }

            match outcome {
                Ok(()) => {}
                Err(EngineError::Gateway(e)) => {
                    tracing::warn!(leg = %legs[i].kind(), error = %e, "Gateway call failed, retrying next tick");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Close every remaining leg, retrying up to `max_exit_attempts` times
    async fn force_exit(&mut self, legs: &mut [Leg], ctx: &LegContext, reason: ExitReason) -> Result<()> {
        for leg in legs.iter_mut() {
            leg.request_exit(reason);
        }
        tracing::info!(%reason, "⏹️  Forcing exit");

        let attempts = self.config.max_exit_attempts.max(1);
        for attempt in 1..=attempts {
            if let Err(e) = self.feed.poll().await {
                tracing::warn!(error = %e, "Feed poll failed during exit");
            }
            for leg in legs.iter_mut() {
                leg.observe(self.feed.latest(&leg.instrument.id));
            }
            if let Err(e) = self.drive_all(legs, ctx).await {
                tracing::error!(attempt, error = %e, "Forced exit step failed");
            }
            if legs.iter().all(Leg::is_closed) {
                return Ok(());
            }
            tracing::warn!(attempt, attempts, "Legs still open after exit attempt");
            sleep(self.config.poll_interval()).await;
        }

        let open: Vec<String> = legs
            .iter()
            .filter(|l| !l.is_closed())
            .map(|l| l.kind().to_string())
            .collect();
        tracing::error!(legs = ?open, "❌ Forced exit gave up with legs open");
        Err(EngineError::ExitIncomplete(open.join(",")))
    }

    /// Invariant broken: flatten what we can, then surface the original error
    async fn halt(&mut self, legs: &mut [Leg], ctx: &LegContext, err: EngineError) -> Result<SessionReport> {
        tracing::error!(error = %err, "❌ Halting session");
        if let Err(exit_err) = self.force_exit(legs, ctx, ExitReason::Halted).await {
            tracing::error!(error = %exit_err, "Exit after halt incomplete");
        }
        Err(err)
    }
}
