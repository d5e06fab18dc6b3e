use serde::{Deserialize, Serialize};

use crate::models::round1;

/// Arm / lock / trail ratchet over combined basket P&L
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BasketTrailTracker {
    pub arm_threshold: f64,
    pub trail_step: f64,
    state: TrailState,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct TrailState {
    pub armed: bool,
    pub locked_floor: f64,
    pub last_step_reached: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrailDecision {
    Hold,
    Armed { locked_floor: f64, last_step: f64 },
    Advanced { locked_floor: f64, last_step: f64 },
    /// P&L fell back to the locked floor; close every open leg
    Exit { pnl: f64, locked_floor: f64 },
}

/// Combined P&L: sum of realized and unrealized, rounded to one decimal
pub fn basket_pnl(contributions: impl IntoIterator<Item = f64>) -> f64 {
    round1(contributions.into_iter().sum())
}

impl BasketTrailTracker {
    pub fn new(arm_threshold: f64, trail_step: f64) -> Self {
        Self {
            arm_threshold,
            trail_step,
            state: TrailState::default(),
        }
    }

    pub fn state(&self) -> TrailState {
        self.state
    }

    pub fn is_armed(&self) -> bool {
        self.state.armed
    }

    fn step_floor(&self, pnl: f64) -> f64 {
        (pnl / self.trail_step).floor() * self.trail_step
    }

    /// Feed one basket P&L observation
    ///
    /// Exit only fires while at least one leg is still open; arming and
    /// trailing are evaluated first, so a single observation can arm and
    /// never exit on the same tick (the floor trails one step behind).
    pub fn evaluate(&mut self, pnl: f64, any_open: bool) -> TrailDecision {
        if !self.state.armed {
            if pnl < self.arm_threshold {
                return TrailDecision::Hold;
            }
            let last_step = self.step_floor(pnl);
            self.state = TrailState {
                armed: true,
                locked_floor: (last_step - self.trail_step).max(0.0),
                last_step_reached: last_step,
            };
            return TrailDecision::Armed {
                locked_floor: self.state.locked_floor,
                last_step,
            };
        }

        let step = self.step_floor(pnl);
        if step > self.state.last_step_reached {
            self.state.last_step_reached = step;
            self.state.locked_floor = self.state.locked_floor.max(step - self.trail_step);
            return TrailDecision::Advanced {
                locked_floor: self.state.locked_floor,
                last_step: step,
            };
        }

        if any_open && pnl <= self.state.locked_floor {
            return TrailDecision::Exit {
                pnl,
                locked_floor: self.state.locked_floor,
            };
        }

        TrailDecision::Hold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_arm_trail_and_exit_sequence() {
        let mut tracker = BasketTrailTracker::new(5000.0, 5000.0);

        assert_eq!(tracker.evaluate(4999.9, true), TrailDecision::Hold);
        assert_eq!(
            tracker.evaluate(5000.0, true),
            TrailDecision::Armed {
                locked_floor: 0.0,
                last_step: 5000.0
            }
        );
        assert_eq!(
            tracker.evaluate(10400.0, true),
            TrailDecision::Advanced {
                locked_floor: 5000.0,
                last_step: 10000.0
            }
        );
        assert_eq!(
            tracker.evaluate(4800.0, true),
            TrailDecision::Exit {
                pnl: 4800.0,
                locked_floor: 5000.0
            }
        );
    }

    #[test]
    fn test_arming_on_large_jump_locks_one_step_behind() {
        let mut tracker = BasketTrailTracker::new(5000.0, 5000.0);
        assert_eq!(
            tracker.evaluate(12300.0, true),
            TrailDecision::Armed {
                locked_floor: 5000.0,
                last_step: 10000.0
            }
        );
        assert!(matches!(tracker.evaluate(5000.0, true), TrailDecision::Exit { .. }));
    }

    #[test]
    fn test_no_exit_when_all_closed() {
        let mut tracker = BasketTrailTracker::new(5000.0, 5000.0);
        tracker.evaluate(10000.0, true);
        assert_eq!(tracker.evaluate(-2000.0, false), TrailDecision::Hold);
        assert!(tracker.is_armed());
    }

    #[test]
    fn test_floor_is_never_negative() {
        let mut tracker = BasketTrailTracker::new(1000.0, 5000.0);
        tracker.evaluate(1200.0, true);
        assert_eq!(tracker.state().locked_floor, 0.0);
        assert_eq!(tracker.state().last_step_reached, 0.0);
        assert!(matches!(tracker.evaluate(0.0, true), TrailDecision::Exit { .. }));
    }

    #[test]
    fn test_ratchet_never_loosens() {
        for seed in 0..20 {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut tracker = BasketTrailTracker::new(5000.0, 5000.0);
            let mut pnl = 0.0;
            let mut prev = tracker.state();
            for _ in 0..500 {
                pnl += rng.gen_range(-900.0..1000.0);
                tracker.evaluate(round1(pnl), true);
                let now = tracker.state();
                if prev.armed {
                    assert!(now.armed);
                    assert!(now.locked_floor >= prev.locked_floor);
                    assert!(now.last_step_reached >= prev.last_step_reached);
                }
                prev = now;
            }
        }
    }

    #[test]
    fn test_basket_pnl_rounds() {
        assert_eq!(basket_pnl([1500.04, -250.0]), 1250.0);
        assert_eq!(basket_pnl(Vec::<f64>::new()), 0.0);
    }
}
