use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Call or put
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum OptionKind {
    #[serde(rename = "CE")]
    Call,
    #[serde(rename = "PE")]
    Put,
}

impl fmt::Display for OptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionKind::Call => write!(f, "CE"),
            OptionKind::Put => write!(f, "PE"),
        }
    }
}

/// A resolved option contract
///
/// Immutable for the lifetime of a session once the strike selector hands it out.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Instrument {
    pub id: String,              // exchange-qualified key / token
    pub symbol: Option<String>,  // broker trading symbol, when the catalog has one
    pub underlying: String,
    pub kind: OptionKind,
    pub strike: f64,
    pub expiry: NaiveDate,
    pub lot_size: u32,
}

/// Whether a leg is sold to open or bought to open
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    #[default]
    Short,
    Long,
}

impl PositionSide {
    /// Order side that opens the position
    pub fn entry_side(self) -> OrderSide {
        match self {
            PositionSide::Short => OrderSide::Sell,
            PositionSide::Long => OrderSide::Buy,
        }
    }

    /// Order side that closes the position (and that protective stops use)
    pub fn exit_side(self) -> OrderSide {
        match self {
            PositionSide::Short => OrderSide::Buy,
            PositionSide::Long => OrderSide::Sell,
        }
    }

    /// Directional P&L of `quantity` units entered at `entry` and marked at `price`
    pub fn pnl(self, entry: f64, price: f64, quantity: u32) -> f64 {
        let per_unit = match self {
            PositionSide::Short => entry - price,
            PositionSide::Long => price - entry,
        };
        per_unit * quantity as f64
    }

    /// True once `price` has moved through `trigger` against the position
    pub fn stop_crossed(self, price: f64, trigger: f64) -> bool {
        match self {
            PositionSide::Short => price >= trigger,
            PositionSide::Long => price <= trigger,
        }
    }

    /// True if moving a stop from `current` to `proposed` reduces risk
    pub fn tightens(self, current: f64, proposed: f64) -> bool {
        match self {
            PositionSide::Short => proposed < current,
            PositionSide::Long => proposed > current,
        }
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionSide::Short => write!(f, "short"),
            PositionSide::Long => write!(f, "long"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Broker-assigned order identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderId(pub String);

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OrderId {
    fn from(s: &str) -> Self {
        OrderId(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum OrderKind {
    Market,
    /// Stop-limit: triggers at `trigger`, rests at `limit`
    Stop { trigger: f64, limit: f64 },
}

impl OrderKind {
    pub fn is_stop(&self) -> bool {
        matches!(self, OrderKind::Stop { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderRequest {
    pub instrument_id: String,
    pub symbol: Option<String>,
    pub side: OrderSide,
    pub quantity: u32,
    pub kind: OrderKind,
}

impl OrderRequest {
    pub fn market(instrument: &Instrument, side: OrderSide, quantity: u32) -> Self {
        Self {
            instrument_id: instrument.id.clone(),
            symbol: instrument.symbol.clone(),
            side,
            quantity,
            kind: OrderKind::Market,
        }
    }

    /// Stop order whose limit sits `offset` beyond the trigger in the direction of the fill
    pub fn stop(
        instrument: &Instrument,
        side: OrderSide,
        quantity: u32,
        trigger: f64,
        offset: f64,
    ) -> Self {
        let trigger = round1(trigger);
        let limit = match side {
            OrderSide::Buy => round1(trigger + offset),
            OrderSide::Sell => round1((trigger - offset).max(0.0)),
        };
        Self {
            instrument_id: instrument.id.clone(),
            symbol: instrument.symbol.clone(),
            side,
            quantity,
            kind: OrderKind::Stop { trigger, limit },
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderState {
    Pending,
    Filled,
    Cancelled,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderStatus {
    pub state: OrderState,
    pub avg_fill_price: Option<f64>,
}

impl OrderStatus {
    pub fn pending() -> Self {
        Self {
            state: OrderState::Pending,
            avg_fill_price: None,
        }
    }

    pub fn filled(price: f64) -> Self {
        Self {
            state: OrderState::Filled,
            avg_fill_price: Some(price),
        }
    }

    /// Fill price, ignoring the zero placeholder some brokers report
    pub fn fill_price(&self) -> Option<f64> {
        self.avg_fill_price.filter(|p| *p > 0.0)
    }
}

/// Round to one decimal place (exchange tick granularity used for triggers)
pub fn round1(x: f64) -> f64 {
    (x * 10.0).round() / 10.0
}
