//! Session configuration
//!
//! Loaded from an optional TOML file layered under `STRADDLE__*` environment
//! variables (e.g. `STRADDLE__SESSION__STOP_LOSS_PCT=20`). Every field has a
//! default, so an empty source yields the standard NIFTY weekly short straddle.

use chrono::{FixedOffset, NaiveDate, NaiveTime, Weekday};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::engine::leg::{StopRule, TrailRule};
use crate::error::{EngineError, Result};
use crate::models::PositionSide;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub session: SessionConfig,
    pub simulator: SimulatorConfig,
    pub broker: BrokerConfig,
}

/// How the target expiry is picked from the catalog
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "rule", rename_all = "lowercase")]
pub enum ExpiryRule {
    /// Earliest listed expiry on or after today
    #[default]
    Nearest,
    /// This-or-next occurrence of a weekday ("tue", "thursday", ...)
    Weekday { day: String },
    /// An explicit date
    Fixed { date: NaiveDate },
}

/// How legs are opened
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum EntryMode {
    /// Market order at entry time
    #[default]
    Market,
    /// Stop entry order `pct` percent beyond the price at entry time
    Breakout { pct: f64 },
}

/// Stepwise trail for bought legs
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct LegTrailConfig {
    /// Price rise (as % of entry) that counts as one step
    pub step_up_pct: f64,
    /// Stop raise per step, as % of the initial stop
    pub trail_inc_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub index_id: String,
    pub underlying: String,
    pub strike_increment: f64,
    pub expiry: ExpiryRule,
    pub side: PositionSide,
    pub entry: EntryMode,
    pub entry_time: NaiveTime,
    pub exit_time: NaiveTime,
    /// Exchange-local offset from UTC (IST = 330)
    pub utc_offset_minutes: i32,
    pub stop_loss_pct: f64,
    /// Fixed-distance stop; overrides `stop_loss_pct` when set
    pub stop_loss_points: Option<f64>,
    pub min_stop_points: f64,
    pub stop_limit_offset: f64,
    pub leg_trail: Option<LegTrailConfig>,
    pub arm_threshold: f64,
    pub trail_step: f64,
    pub lot_multiplier: u32,
    /// Explicit per-leg quantity; must be a multiple of the lot size
    pub quantity: Option<u32>,
    pub cancel_sibling_on_fill: bool,
    pub poll_interval_ms: u64,
    pub entry_wait_poll_secs: u64,
    pub price_wait_timeout_secs: u64,
    pub gateway_timeout_ms: u64,
    pub max_exit_attempts: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            index_id: "NSE_INDEX|Nifty 50".to_string(),
            underlying: "NIFTY".to_string(),
            strike_increment: 50.0,
            expiry: ExpiryRule::Nearest,
            side: PositionSide::Short,
            entry: EntryMode::Market,
            entry_time: NaiveTime::from_hms_opt(10, 30, 0).expect("valid entry time"),
            exit_time: NaiveTime::from_hms_opt(15, 25, 0).expect("valid exit time"),
            utc_offset_minutes: 330,
            stop_loss_pct: 21.0,
            stop_loss_points: None,
            min_stop_points: 0.0,
            stop_limit_offset: 5.0,
            leg_trail: None,
            arm_threshold: 5000.0,
            trail_step: 5000.0,
            lot_multiplier: 1,
            quantity: None,
            cancel_sibling_on_fill: false,
            poll_interval_ms: 5000,
            entry_wait_poll_secs: 5,
            price_wait_timeout_secs: 30,
            gateway_timeout_ms: 10_000,
            max_exit_attempts: 20,
        }
    }
}

impl SessionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn entry_wait_poll(&self) -> Duration {
        Duration::from_secs(self.entry_wait_poll_secs)
    }

    pub fn price_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.price_wait_timeout_secs)
    }

    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_millis(self.gateway_timeout_ms)
    }

    pub fn utc_offset(&self) -> Result<FixedOffset> {
        FixedOffset::east_opt(self.utc_offset_minutes * 60).ok_or_else(|| {
            EngineError::Config(format!("invalid utc offset {}", self.utc_offset_minutes))
        })
    }

    pub fn stop_rule(&self) -> StopRule {
        StopRule {
            pct: self.stop_loss_pct,
            points: self.stop_loss_points,
            min_points: self.min_stop_points,
        }
    }

    /// Leg trail only applies to bought legs
    pub fn trail_rule(&self) -> Option<TrailRule> {
        match (self.side, self.leg_trail) {
            (PositionSide::Long, Some(t)) => Some(TrailRule {
                step_up_pct: t.step_up_pct,
                trail_inc_pct: t.trail_inc_pct,
            }),
            _ => None,
        }
    }

    pub fn expiry_weekday(&self) -> Result<Option<Weekday>> {
        match &self.expiry {
            ExpiryRule::Weekday { day } => day
                .parse::<Weekday>()
                .map(Some)
                .map_err(|_| EngineError::Config(format!("unknown weekday '{}'", day))),
            _ => Ok(None),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.strike_increment <= 0.0 {
            return Err(EngineError::Config("strike_increment must be positive".into()));
        }
        if self.exit_time <= self.entry_time {
            return Err(EngineError::Config(format!(
                "exit_time {} must be after entry_time {}",
                self.exit_time, self.entry_time
            )));
        }
        if self.stop_loss_pct <= 0.0 && self.stop_loss_points.is_none() {
            return Err(EngineError::Config("stop_loss_pct must be positive".into()));
        }
        if matches!(self.stop_loss_points, Some(p) if p <= 0.0) {
            return Err(EngineError::Config("stop_loss_points must be positive".into()));
        }
        if self.arm_threshold <= 0.0 {
            return Err(EngineError::Config("arm_threshold must be positive".into()));
        }
        if self.trail_step <= 0.0 {
            return Err(EngineError::Config("trail_step must be positive".into()));
        }
        if self.lot_multiplier == 0 {
            return Err(EngineError::Config("lot_multiplier must be at least 1".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(EngineError::Config("poll_interval_ms must be positive".into()));
        }
        if let EntryMode::Breakout { pct } = self.entry {
            if pct <= 0.0 {
                return Err(EngineError::Config("breakout pct must be positive".into()));
            }
        }
        if let Some(t) = self.leg_trail {
            if t.step_up_pct <= 0.0 || t.trail_inc_pct <= 0.0 {
                return Err(EngineError::Config("leg_trail percentages must be positive".into()));
            }
        }
        self.utc_offset()?;
        self.expiry_weekday()?;
        Ok(())
    }
}

/// Parameters for the deterministic rehearsal feed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SimulatorConfig {
    pub seed: u64,
    pub start_spot: f64,
    pub base_premium: f64,
    pub lot_size: u32,
    pub spot_sigma: f64,
    pub delta_sensitivity: f64,
    pub theta_decay: f64,
    pub min_premium: f64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            start_spot: 24500.0,
            base_premium: 200.0,
            lot_size: 75,
            spot_sigma: 6.0,
            delta_sensitivity: 0.5,
            theta_decay: 0.2,
            min_premium: 0.5,
        }
    }
}

/// REST broker adapter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub base_url: String,
    pub access_token: Option<String>,
    pub product: String,
    pub requests_per_minute: u32,
    pub request_timeout_secs: u64,
    /// Segment prefix for instrument-master tokens (`NSE_FO|<token>`)
    pub fo_segment: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.upstox.com".to_string(),
            access_token: None,
            product: "D".to_string(),
            requests_per_minute: 250,
            request_timeout_secs: 10,
            fo_segment: "NSE_FO".to_string(),
        }
    }
}

/// Load configuration from file and environment variables
///
/// Priority (highest to lowest):
/// 1. Environment variables (prefixed with STRADDLE__)
/// 2. Configuration file (TOML format)
/// 3. Default values
pub fn load_config(config_path: Option<&str>) -> Result<AppConfig> {
    let mut builder = Config::builder();

    if let Some(path) = config_path {
        if Path::new(path).exists() {
            builder = builder.add_source(File::with_name(path).required(false));
        } else {
            tracing::warn!(path, "Config file not found, using defaults and environment");
        }
    }

    builder = builder.add_source(
        Environment::with_prefix("STRADDLE")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    );

    let config: AppConfig = builder.build()?.try_deserialize()?;
    config.session.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_short_straddle() {
        let cfg = SessionConfig::default();
        assert_eq!(cfg.stop_loss_pct, 21.0);
        assert_eq!(cfg.arm_threshold, 5000.0);
        assert_eq!(cfg.trail_step, 5000.0);
        assert_eq!(cfg.side, PositionSide::Short);
        assert_eq!(cfg.entry_time, NaiveTime::from_hms_opt(10, 30, 0).unwrap());
        assert!(cfg.validate().is_ok());
        assert!(cfg.trail_rule().is_none());
    }

    #[test]
    fn test_validate_rejects_non_positive_arm_threshold() {
        for arm_threshold in [0.0, -500.0] {
            let cfg = SessionConfig {
                arm_threshold,
                ..Default::default()
            };
            assert!(matches!(cfg.validate(), Err(EngineError::Config(msg)) if msg.contains("arm_threshold")));
        }
    }

    #[test]
    fn test_validate_rejects_inverted_window() {
        let cfg = SessionConfig {
            exit_time: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_bad_weekday() {
        let cfg = SessionConfig {
            expiry: ExpiryRule::Weekday { day: "someday".into() },
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = SessionConfig {
            expiry: ExpiryRule::Weekday { day: "tue".into() },
            ..Default::default()
        };
        assert_eq!(cfg.expiry_weekday().unwrap(), Some(Weekday::Tue));
    }

    #[test]
    fn test_trail_rule_only_for_long() {
        let trail = LegTrailConfig {
            step_up_pct: 30.0,
            trail_inc_pct: 15.0,
        };
        let short = SessionConfig {
            leg_trail: Some(trail),
            ..Default::default()
        };
        assert!(short.trail_rule().is_none());

        let long = SessionConfig {
            side: PositionSide::Long,
            leg_trail: Some(trail),
            ..Default::default()
        };
        assert!(long.trail_rule().is_some());
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let cfg = load_config(None).unwrap();
        assert_eq!(cfg.session.underlying, "NIFTY");
        assert_eq!(cfg.simulator.seed, 42);
    }
}
