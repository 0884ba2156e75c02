//! Price bars, ticks and the trading timeframe.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Trading timeframe. Entry timeouts are counted in bars of this timeframe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Timeframe {
    M1,
    M5,
    M15,
    M30,
    #[default]
    H1,
    H4,
    D1,
}

impl Timeframe {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "M1" => Some(Self::M1),
            "M5" => Some(Self::M5),
            "M15" => Some(Self::M15),
            "M30" => Some(Self::M30),
            "H1" => Some(Self::H1),
            "H4" => Some(Self::H4),
            "D1" => Some(Self::D1),
            _ => None,
        }
    }

    /// Length of one bar in seconds.
    pub fn seconds(&self) -> i64 {
        match self {
            Self::M1 => 60,
            Self::M5 => 300,
            Self::M15 => 900,
            Self::M30 => 1_800,
            Self::H1 => 3_600,
            Self::H4 => 14_400,
            Self::D1 => 86_400,
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::M1 => "M1",
            Self::M5 => "M5",
            Self::M15 => "M15",
            Self::M30 => "M30",
            Self::H1 => "H1",
            Self::H4 => "H4",
            Self::D1 => "D1",
        };
        f.write_str(s)
    }
}

/// A closed OHLC candle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    /// Bar open time
    pub time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub timeframe: Timeframe,
}

impl Bar {
    pub fn new(time: DateTime<Utc>, open: f64, high: f64, low: f64, close: f64) -> Self {
        Self {
            time,
            open,
            high,
            low,
            close,
            timeframe: Timeframe::default(),
        }
    }

    /// Reject bars with non-finite prices or an inverted range.
    pub fn is_valid(&self) -> bool {
        [self.open, self.high, self.low, self.close]
            .iter()
            .all(|p| p.is_finite() && *p > 0.0)
            && self.high >= self.low
    }
}

/// Top-of-book price update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub time: DateTime<Utc>,
    pub bid: f64,
    pub ask: f64,
}

impl Tick {
    pub fn quote(&self) -> Quote {
        Quote {
            bid: self.bid,
            ask: self.ask,
        }
    }
}

/// Last known bid/ask.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quote {
    pub bid: f64,
    pub ask: f64,
}

impl Quote {
    /// Quote collapsed onto a single price (used when only bar closes are known).
    pub fn flat(price: f64) -> Self {
        Self {
            bid: price,
            ask: price,
        }
    }

    /// Price at which a position in `direction` would be opened.
    pub fn entry_price(&self, direction: super::TradeDirection) -> f64 {
        match direction {
            super::TradeDirection::Short => self.bid,
            _ => self.ask,
        }
    }

    /// Price at which a position in `direction` is valued/closed.
    pub fn exit_price(&self, direction: super::TradeDirection) -> f64 {
        match direction {
            super::TradeDirection::Short => self.ask,
            _ => self.bid,
        }
    }
}
