//! Per-leg order / protective-stop state machine
//!
//! A leg moves PendingEntry -> Open -> Closed and never back. While open it
//! owns at most one live protective stop order: any replacement cancels the
//! old order first and only places the new one once the cancel is
//! confirmed. Exits close the leg only once the exit order is reported
//! filled. Gateway failures leave the state where it was, so the next
//! control-loop iteration simply retries.

use serde::Serialize;
use std::fmt;
use tokio::time::{Duration, Instant};

use crate::error::{EngineError, GatewayError, Result};
use crate::gateway::TimedGateway;
use crate::models::{
    round1, Instrument, OptionKind, OrderId, OrderRequest, OrderState, PositionSide,
};

/// Initial stop placement
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StopRule {
    pub pct: f64,
    /// Fixed distance in points; takes precedence over `pct`
    pub points: Option<f64>,
    /// Stop is never closer to entry than this many points
    pub min_points: f64,
}

impl StopRule {
    pub fn initial_trigger(&self, side: PositionSide, entry: f64) -> f64 {
        let distance = self
            .points
            .unwrap_or(entry * self.pct / 100.0)
            .max(self.min_points);
        match side {
            PositionSide::Short => round1(entry + distance),
            PositionSide::Long => round1((entry - distance).max(0.0)),
        }
    }
}

/// Stepwise trail for bought legs
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrailRule {
    pub step_up_pct: f64,
    pub trail_inc_pct: f64,
}

impl TrailRule {
    /// Stop implied by `price`, or None while no full step has been reached
    pub fn trailed_trigger(&self, entry: f64, initial_stop: f64, price: f64) -> Option<f64> {
        let step_size = entry * self.step_up_pct / 100.0;
        if step_size <= 0.0 {
            return None;
        }
        let steps = ((price - entry) / step_size).floor();
        if steps < 1.0 {
            return None;
        }
        Some(round1(
            initial_stop + initial_stop * (self.trail_inc_pct / 100.0) * steps,
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExitReason {
    StopLoss,
    TrailLock,
    EndOfDay,
    Shutdown,
    Halted,
    NeverFilled,
    EntryCancelled,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExitReason::StopLoss => "stop-loss",
            ExitReason::TrailLock => "trail-lock",
            ExitReason::EndOfDay => "end-of-day",
            ExitReason::Shutdown => "shutdown",
            ExitReason::Halted => "halted",
            ExitReason::NeverFilled => "never-filled",
            ExitReason::EntryCancelled => "entry-cancelled",
        };
        f.write_str(s)
    }
}

/// A live order at the gateway together with the price it was placed at
#[derive(Debug, Clone, PartialEq)]
pub struct LiveOrder {
    pub id: OrderId,
    pub trigger: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct OpenPosition {
    pub entry_price: f64,
    pub initial_stop: f64,
    pub stop_trigger: f64,
    pub protective: Option<LiveOrder>,
    /// Market exit sent but not yet reported filled
    pub exit_order: Option<LiveOrder>,
    unprotected_since: Option<Instant>,
}

impl OpenPosition {
    /// How long the leg has been open without a live stop
    pub fn unprotected_for(&self) -> Option<Duration> {
        self.unprotected_since.map(|t| t.elapsed())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClosedLeg {
    pub entry_price: Option<f64>,
    pub exit_price: Option<f64>,
    pub realized_pnl: f64,
    pub reason: ExitReason,
}

#[derive(Debug, Clone)]
pub enum LegState {
    PendingEntry { order: Option<LiveOrder> },
    Open(OpenPosition),
    Closed(ClosedLeg),
}

/// Things that happened to a leg while it was driven against the gateway
#[derive(Debug, Clone, PartialEq)]
pub enum LegEvent {
    EntryPlaced { order: OrderId },
    Entered { price: f64, stop: f64 },
    StopPlaced { order: OrderId, trigger: f64 },
    StopCancelled { order: OrderId },
    Closed { reason: ExitReason, exit_price: Option<f64>, pnl: f64 },
}

/// Per-session parameters the leg needs when talking to the gateway
#[derive(Debug, Clone, Copy)]
pub struct LegContext {
    pub stop_rule: StopRule,
    pub stop_limit_offset: f64,
}

#[derive(Debug, Clone)]
pub struct Leg {
    pub instrument: Instrument,
    pub side: PositionSide,
    pub quantity: u32,
    state: LegState,
    last_price: Option<f64>,
    exit_request: Option<ExitReason>,
    entry_trigger: Option<f64>,
}

impl Leg {
    pub fn new(instrument: Instrument, side: PositionSide, quantity: u32) -> Result<Self> {
        let lot_size = instrument.lot_size;
        if quantity == 0 || lot_size == 0 || quantity % lot_size != 0 {
            return Err(EngineError::InvalidQuantity { quantity, lot_size });
        }
        Ok(Self {
            instrument,
            side,
            quantity,
            state: LegState::PendingEntry { order: None },
            last_price: None,
            exit_request: None,
            entry_trigger: None,
        })
    }

    /// Enter through a stop order at `trigger` instead of at market
    pub fn with_entry_trigger(mut self, trigger: f64) -> Self {
        self.entry_trigger = Some(round1(trigger));
        self
    }

    pub fn kind(&self) -> OptionKind {
        self.instrument.kind
    }

    pub fn state(&self) -> &LegState {
        &self.state
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.state, LegState::PendingEntry { .. })
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, LegState::Open(_))
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, LegState::Closed(_))
    }

    pub fn last_price(&self) -> Option<f64> {
        self.last_price
    }

    pub fn entry_trigger(&self) -> Option<f64> {
        self.entry_trigger
    }

    pub fn exit_request(&self) -> Option<ExitReason> {
        self.exit_request
    }

    pub fn entry_price(&self) -> Option<f64> {
        match &self.state {
            LegState::Open(p) => Some(p.entry_price),
            LegState::Closed(c) => c.entry_price,
            LegState::PendingEntry { .. } => None,
        }
    }

    pub fn stop_trigger(&self) -> Option<f64> {
        match &self.state {
            LegState::Open(p) => Some(p.stop_trigger),
            _ => None,
        }
    }

    pub fn open_position(&self) -> Option<&OpenPosition> {
        match &self.state {
            LegState::Open(p) => Some(p),
            _ => None,
        }
    }

    /// Id of the live protective order, if any
    pub fn protective_order(&self) -> Option<&OrderId> {
        self.open_position()
            .and_then(|p| p.protective.as_ref())
            .map(|o| &o.id)
    }

    /// Id of a working exit order, if any
    pub fn exit_order(&self) -> Option<&OrderId> {
        self.open_position()
            .and_then(|p| p.exit_order.as_ref())
            .map(|o| &o.id)
    }

    /// Every order this leg currently tracks at the gateway
    pub fn live_orders(&self) -> Vec<&OrderId> {
        match &self.state {
            LegState::PendingEntry { order } => order.iter().map(|o| &o.id).collect(),
            LegState::Open(p) => p
                .protective
                .iter()
                .chain(p.exit_order.iter())
                .map(|o| &o.id)
                .collect(),
            LegState::Closed(_) => Vec::new(),
        }
    }

    pub fn closed(&self) -> Option<&ClosedLeg> {
        match &self.state {
            LegState::Closed(c) => Some(c),
            _ => None,
        }
    }

    pub fn realized_pnl(&self) -> Option<f64> {
        self.closed().map(|c| c.realized_pnl)
    }

    /// Record the latest feed observation; gaps keep the previous value
    pub fn observe(&mut self, price: Option<f64>) {
        if let Some(p) = price {
            self.last_price = Some(p);
        }
    }

    pub fn unrealized_pnl(&self) -> Option<f64> {
        match &self.state {
            LegState::Open(p) => self
                .last_price
                .map(|price| self.side.pnl(p.entry_price, price, self.quantity)),
            _ => None,
        }
    }

    /// This leg's share of basket P&L; None while an open leg has never been priced
    pub fn pnl_contribution(&self) -> Option<f64> {
        match &self.state {
            LegState::PendingEntry { .. } => Some(0.0),
            LegState::Open(_) => self.unrealized_pnl(),
            LegState::Closed(c) => Some(c.realized_pnl),
        }
    }

    /// True when an open leg's price has moved through its stop
    pub fn stop_hit(&self, price: f64) -> bool {
        match &self.state {
            LegState::Open(p) => self.side.stop_crossed(price, p.stop_trigger),
            _ => false,
        }
    }

    /// Ask for the leg to be closed on the next drive; the first reason sticks
    pub fn request_exit(&mut self, reason: ExitReason) {
        if self.is_closed() || self.exit_request.is_some() {
            return;
        }
        self.exit_request = Some(reason);
    }

    /// Tighten the stop to `proposed`; returns false (no-op) unless it reduces risk
    pub fn tighten_stop(&mut self, proposed: f64) -> bool {
        if self.exit_request.is_some() {
            return false;
        }
        let side = self.side;
        match &mut self.state {
            LegState::Open(p) if side.tightens(p.stop_trigger, proposed) => {
                p.stop_trigger = round1(proposed);
                true
            }
            _ => false,
        }
    }

    /// Sibling was stopped out: floor further loss at the entry price
    pub fn move_to_cost(&mut self) -> bool {
        match self.entry_price() {
            Some(entry) if self.is_open() => self.tighten_stop(entry),
            _ => false,
        }
    }

    /// Ratchet a bought leg's stop by whole steps of favourable movement
    pub fn trail(&mut self, price: f64, rule: &TrailRule) -> bool {
        let proposed = match &self.state {
            LegState::Open(p) => rule.trailed_trigger(p.entry_price, p.initial_stop, price),
            _ => None,
        };
        proposed.map(|s| self.tighten_stop(s)).unwrap_or(false)
    }

    /// PendingEntry -> Open at a confirmed fill price
    pub fn fill_entry(&mut self, price: f64, rule: &StopRule) -> Result<f64> {
        if !self.is_pending() {
            return Err(EngineError::InvariantViolation(format!(
                "{} entry filled twice",
                self.kind()
            )));
        }
        let stop = rule.initial_trigger(self.side, price);
        self.state = LegState::Open(OpenPosition {
            entry_price: price,
            initial_stop: stop,
            stop_trigger: stop,
            protective: None,
            exit_order: None,
            unprotected_since: Some(Instant::now()),
        });
        Ok(stop)
    }

    /// Any state -> Closed; realized P&L is fixed here and never changes
    pub fn close(&mut self, exit_price: Option<f64>, reason: ExitReason) -> f64 {
        if let LegState::Closed(c) = &self.state {
            return c.realized_pnl;
        }
        let entry_price = self.entry_price();
        let realized_pnl = match (entry_price, exit_price) {
            (Some(entry), Some(exit)) => round1(self.side.pnl(entry, exit, self.quantity)),
            _ => 0.0,
        };
        self.state = LegState::Closed(ClosedLeg {
            entry_price,
            exit_price,
            realized_pnl,
            reason,
        });
        self.exit_request = None;
        realized_pnl
    }

    fn attach_stop(&mut self, id: OrderId, trigger: f64) -> Result<()> {
        let kind = self.kind();
        match &mut self.state {
            LegState::Open(p) => {
                if let Some(existing) = &p.protective {
                    return Err(EngineError::InvariantViolation(format!(
                        "{} already has live stop {} while placing {}",
                        kind, existing.id, id
                    )));
                }
                p.protective = Some(LiveOrder {
                    id,
                    trigger: Some(trigger),
                });
                p.unprotected_since = None;
                Ok(())
            }
            _ => Err(EngineError::InvariantViolation(format!(
                "{} stop attached while not open",
                kind
            ))),
        }
    }

    fn detach_stop(&mut self) -> Option<LiveOrder> {
        match &mut self.state {
            LegState::Open(p) => {
                let old = p.protective.take();
                if old.is_some() {
                    p.unprotected_since = Some(Instant::now());
                }
                old
            }
            _ => None,
        }
    }

    /// Push pending work for this leg through the gateway
    ///
    /// Performs at most one logical transition chain per call: entry
    /// placement/confirmation, protective stop reconciliation, or exit.
    /// Events are appended even when a later call in the chain fails.
    pub async fn drive(
        &mut self,
        gateway: &TimedGateway,
        ctx: &LegContext,
        events: &mut Vec<LegEvent>,
    ) -> Result<()> {
        if self.is_pending() {
            self.drive_entry(gateway, ctx, events).await?;
        }
        if self.is_open() {
            if let Some(reason) = self.exit_request {
                self.drive_exit(gateway, reason, events).await?;
            } else {
                self.reconcile_stop(gateway, ctx, events).await?;
            }
        }
        Ok(())
    }

    async fn drive_entry(
        &mut self,
        gateway: &TimedGateway,
        ctx: &LegContext,
        events: &mut Vec<LegEvent>,
    ) -> Result<()> {
        let order = match &self.state {
            LegState::PendingEntry { order } => order.clone(),
            _ => return Ok(()),
        };

        let order = match order {
            Some(order) => order,
            None => {
                if let Some(reason) = self.abandon_reason() {
                    self.close_and_record(None, reason, events);
                    return Ok(());
                }
                let request = match self.entry_trigger {
                    Some(trigger) => OrderRequest::stop(
                        &self.instrument,
                        self.side.entry_side(),
                        self.quantity,
                        trigger,
                        ctx.stop_limit_offset,
                    ),
                    None => {
                        OrderRequest::market(&self.instrument, self.side.entry_side(), self.quantity)
                    }
                };
                let id = gateway.place(&request).await?;
                tracing::info!(
                    leg = %self.kind(),
                    order = %id,
                    side = %request.side,
                    quantity = self.quantity,
                    trigger = ?self.entry_trigger,
                    "Entry order placed"
                );
                let live = LiveOrder {
                    id: id.clone(),
                    trigger: self.entry_trigger,
                };
                self.state = LegState::PendingEntry {
                    order: Some(live.clone()),
                };
                events.push(LegEvent::EntryPlaced { order: id });
                live
            }
        };

        let status = gateway.status(&order.id).await?;
        match status.state {
            OrderState::Filled => {
                let Some(price) = status
                    .fill_price()
                    .or(order.trigger)
                    .or(self.last_price)
                else {
                    tracing::warn!(leg = %self.kind(), "Entry filled but no price known yet");
                    return Ok(());
                };
                let stop = self.fill_entry(price, &ctx.stop_rule)?;
                tracing::info!(leg = %self.kind(), entry = price, stop, "Leg open");
                events.push(LegEvent::Entered { price, stop });
            }
            OrderState::Rejected | OrderState::Cancelled => {
                tracing::warn!(
                    leg = %self.kind(),
                    order = %order.id,
                    state = ?status.state,
                    "Entry order not live, will re-place"
                );
                self.state = LegState::PendingEntry { order: None };
                if let Some(reason) = self.abandon_reason() {
                    self.close_and_record(None, reason, events);
                }
            }
            OrderState::Pending => {
                if let Some(reason) = self.abandon_reason() {
                    gateway.cancel(&order.id).await?;
                    tracing::info!(leg = %self.kind(), order = %order.id, "Pending entry cancelled");
                    self.close_and_record(None, reason, events);
                }
            }
        }
        Ok(())
    }

    fn abandon_reason(&self) -> Option<ExitReason> {
        self.exit_request.map(|r| match r {
            ExitReason::EntryCancelled => ExitReason::EntryCancelled,
            _ => ExitReason::NeverFilled,
        })
    }

    async fn reconcile_stop(
        &mut self,
        gateway: &TimedGateway,
        ctx: &LegContext,
        events: &mut Vec<LegEvent>,
    ) -> Result<()> {
        let (stop_trigger, live) = match &self.state {
            LegState::Open(p) => (p.stop_trigger, p.protective.clone()),
            _ => return Ok(()),
        };

        if let Some(live) = live {
            if live.trigger == Some(stop_trigger) {
                return Ok(());
            }
            if let Err(err) = gateway.cancel(&live.id).await {
                return self.collect_filled_stop(gateway, &live, err, events).await;
            }
            self.detach_stop();
            tracing::info!(leg = %self.kind(), order = %live.id, "Protective stop cancelled");
            events.push(LegEvent::StopCancelled { order: live.id });
        }

        let request = OrderRequest::stop(
            &self.instrument,
            self.side.exit_side(),
            self.quantity,
            stop_trigger,
            ctx.stop_limit_offset,
        );
        let id = gateway.place(&request).await?;
        self.attach_stop(id.clone(), stop_trigger)?;
        tracing::info!(leg = %self.kind(), order = %id, trigger = stop_trigger, "Protective stop placed");
        events.push(LegEvent::StopPlaced {
            order: id,
            trigger: stop_trigger,
        });
        Ok(())
    }

    /// A cancel failed: if the stop already executed, that execution is our exit
    async fn collect_filled_stop(
        &mut self,
        gateway: &TimedGateway,
        live: &LiveOrder,
        cancel_err: GatewayError,
        events: &mut Vec<LegEvent>,
    ) -> Result<()> {
        let status = gateway.status(&live.id).await?;
        if status.state == OrderState::Filled {
            let price = status.fill_price().or(live.trigger).or(self.last_price);
            self.close_and_record(price, ExitReason::StopLoss, events);
            return Ok(());
        }
        if matches!(status.state, OrderState::Cancelled | OrderState::Rejected) {
            // already gone at the broker
            self.detach_stop();
            events.push(LegEvent::StopCancelled {
                order: live.id.clone(),
            });
            return Ok(());
        }
        Err(cancel_err.into())
    }

    async fn drive_exit(
        &mut self,
        gateway: &TimedGateway,
        reason: ExitReason,
        events: &mut Vec<LegEvent>,
    ) -> Result<()> {
        if let Some(exit) = self.open_position().and_then(|p| p.exit_order.clone()) {
            return self.confirm_exit(gateway, &exit, reason, events).await;
        }

        let live = self.open_position().and_then(|p| p.protective.clone());

        if let Some(live) = live {
            if reason == ExitReason::StopLoss {
                let status = gateway.status(&live.id).await?;
                if status.state == OrderState::Filled {
                    let price = status.fill_price().or(live.trigger).or(self.last_price);
                    self.close_and_record(price, reason, events);
                    return Ok(());
                }
            }
            if let Err(err) = gateway.cancel(&live.id).await {
                return self.collect_filled_stop(gateway, &live, err, events).await;
            }
            self.detach_stop();
            events.push(LegEvent::StopCancelled { order: live.id });
            if !self.is_open() {
                return Ok(());
            }
        }

        let request = OrderRequest::market(&self.instrument, self.side.exit_side(), self.quantity);
        let id = gateway.place(&request).await?;
        tracing::info!(leg = %self.kind(), order = %id, %reason, "Exit order placed");

        let exit = LiveOrder { id, trigger: None };
        if let LegState::Open(p) = &mut self.state {
            p.exit_order = Some(exit.clone());
        }
        self.confirm_exit(gateway, &exit, reason, events).await
    }

    /// Close on a reported fill; a dead exit order is dropped so the next drive re-places it
    async fn confirm_exit(
        &mut self,
        gateway: &TimedGateway,
        exit: &LiveOrder,
        reason: ExitReason,
        events: &mut Vec<LegEvent>,
    ) -> Result<()> {
        let status = gateway.status(&exit.id).await?;
        match status.state {
            OrderState::Filled => {
                let price = status
                    .fill_price()
                    .or(self.last_price)
                    .or(self.stop_trigger());
                self.close_and_record(price, reason, events);
                Ok(())
            }
            OrderState::Pending => {
                tracing::info!(leg = %self.kind(), order = %exit.id, "Exit order working");
                Ok(())
            }
            OrderState::Rejected | OrderState::Cancelled => {
                if let LegState::Open(p) = &mut self.state {
                    p.exit_order = None;
                }
                Err(GatewayError::Rejected(format!(
                    "exit order {} {:?}",
                    exit.id, status.state
                ))
                .into())
            }
        }
    }

    fn close_and_record(
        &mut self,
        exit_price: Option<f64>,
        reason: ExitReason,
        events: &mut Vec<LegEvent>,
    ) {
        let pnl = self.close(exit_price, reason);
        tracing::info!(
            leg = %self.kind(),
            %reason,
            exit = ?exit_price,
            pnl,
            "Leg closed"
        );
        events.push(LegEvent::Closed {
            reason,
            exit_price,
            pnl,
        });
    }
}
