pub mod basket;
pub mod clock;
pub mod leg;
pub mod orchestrator;

pub use basket::{basket_pnl, BasketTrailTracker, TrailDecision, TrailState};
pub use clock::{Clock, SystemClock, TokioClock};
pub use leg::{ExitReason, Leg, LegContext, LegEvent, LegState, StopRule, TrailRule};
pub use orchestrator::{LegSummary, SessionEnd, SessionReport, StrategyOrchestrator};
