use chrono::{Datelike, Duration, NaiveDate, Weekday};

use crate::config::ExpiryRule;
use crate::error::{EngineError, Result};
use crate::models::{Instrument, OptionKind};

/// Strike and contracts chosen for a session
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub spot: f64,
    pub strike: f64,
    pub expiry: NaiveDate,
    pub ce: Instrument,
    pub pe: Instrument,
}

/// Nearest strike on the exchange grid (half rounds away from zero)
pub fn atm_strike(spot: f64, increment: f64) -> f64 {
    (spot / increment).round() * increment
}

/// This-or-next occurrence of `day` counting from `today`
pub fn next_weekday(today: NaiveDate, day: Weekday) -> NaiveDate {
    let ahead = (7 + day.num_days_from_monday() as i64
        - today.weekday().num_days_from_monday() as i64)
        % 7;
    today + Duration::days(ahead)
}

pub fn select_expiry(
    contracts: &[Instrument],
    today: NaiveDate,
    rule: &ExpiryRule,
) -> Result<NaiveDate> {
    let listed = |date: NaiveDate| contracts.iter().any(|c| c.expiry == date);

    match rule {
        ExpiryRule::Nearest => contracts
            .iter()
            .map(|c| c.expiry)
            .filter(|e| *e >= today)
            .min()
            .ok_or(EngineError::NoExpiryFound(today)),
        ExpiryRule::Weekday { day } => {
            let day = day
                .parse::<Weekday>()
                .map_err(|_| EngineError::Config(format!("unknown weekday '{}'", day)))?;
            let target = next_weekday(today, day);
            if listed(target) {
                Ok(target)
            } else {
                Err(EngineError::NoExpiryFound(target))
            }
        }
        ExpiryRule::Fixed { date } => {
            if *date >= today && listed(*date) {
                Ok(*date)
            } else {
                Err(EngineError::NoExpiryFound(*date))
            }
        }
    }
}

/// Exact CE/PE match at `strike` for `expiry`
pub fn resolve_legs(
    contracts: &[Instrument],
    strike: f64,
    expiry: NaiveDate,
) -> Result<(Instrument, Instrument)> {
    let find = |kind: OptionKind| {
        contracts
            .iter()
            .find(|c| c.kind == kind && c.expiry == expiry && (c.strike - strike).abs() < 1e-6)
            .cloned()
    };
    match (find(OptionKind::Call), find(OptionKind::Put)) {
        (Some(ce), Some(pe)) => Ok((ce, pe)),
        _ => Err(EngineError::NoStrikeMatch { strike, expiry }),
    }
}

/// ATM strike / expiry resolution over a catalog snapshot
#[derive(Debug, Clone)]
pub struct StrikeSelector {
    pub increment: f64,
    pub rule: ExpiryRule,
}

impl StrikeSelector {
    pub fn new(increment: f64, rule: ExpiryRule) -> Self {
        Self { increment, rule }
    }

    pub fn select(&self, contracts: &[Instrument], spot: f64, today: NaiveDate) -> Result<Selection> {
        let strike = atm_strike(spot, self.increment);
        let expiry = select_expiry(contracts, today, &self.rule)?;
        let (ce, pe) = resolve_legs(contracts, strike, expiry)?;

        tracing::info!(spot, strike, %expiry, ce = %ce.id, pe = %pe.id, "🎯 Strike selected");

        Ok(Selection {
            spot,
            strike,
            expiry,
            ce,
            pe,
        })
    }
}
