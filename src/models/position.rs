//! Position record as seen by the exit manager, refreshed from the ledger each cycle.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::TradeDirection;

/// Broker-assigned position identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Ticket(pub u64);

impl std::fmt::Display for Ticket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Open position tagged to this strategy instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionRecord {
    pub ticket: Ticket,

    pub direction: TradeDirection,

    /// Remaining volume in lots
    pub volume: Decimal,

    pub open_price: f64,

    /// Broker-side stop, if any
    #[serde(default)]
    pub stop_loss: Option<f64>,

    /// Broker-side target, if any
    #[serde(default)]
    pub take_profit: Option<f64>,

    pub open_time: DateTime<Utc>,

    /// Consecutive evaluation cycles spent beyond the step-out threshold
    #[serde(default)]
    pub bars_under_threshold: u32,

    /// Strategy tag the position was opened under
    pub tag: String,
}

impl PositionRecord {
    /// Unrealized move in price units, positive when in profit.
    pub fn profit_distance(&self, price: f64) -> f64 {
        self.direction.favourable(self.open_price, price)
    }

    /// Adverse excursion in price units, positive when in loss.
    pub fn adverse_distance(&self, price: f64) -> f64 {
        -self.profit_distance(price)
    }

    /// True when `price` has reached the stop level.
    pub fn stop_breached(&self, price: f64) -> bool {
        match self.stop_loss {
            Some(stop) => self.direction.favourable(stop, price) <= 0.0,
            None => false,
        }
    }

    /// Minutes the position has been open at `now`.
    pub fn held_minutes(&self, now: DateTime<Utc>) -> i64 {
        (now - self.open_time).num_minutes()
    }
}

/// Open position counts per side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PositionCounts {
    pub long: usize,
    pub short: usize,
}

impl PositionCounts {
    pub fn from_records<'a, I>(records: I) -> Self
    where
        I: IntoIterator<Item = &'a PositionRecord>,
    {
        records.into_iter().fold(Self::default(), |mut acc, p| {
            match p.direction {
                TradeDirection::Long => acc.long += 1,
                TradeDirection::Short => acc.short += 1,
                TradeDirection::None => {}
            }
            acc
        })
    }

    pub fn total(&self) -> usize {
        self.long + self.short
    }

    pub fn side(&self, direction: TradeDirection) -> usize {
        match direction {
            TradeDirection::Long => self.long,
            TradeDirection::Short => self.short,
            TradeDirection::None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn make_position(direction: TradeDirection, open: f64, stop: Option<f64>) -> PositionRecord {
        PositionRecord {
            ticket: Ticket(1),
            direction,
            volume: dec!(0.10),
            open_price: open,
            stop_loss: stop,
            take_profit: None,
            open_time: Utc.with_ymd_and_hms(2024, 1, 2, 9, 0, 0).unwrap(),
            bars_under_threshold: 0,
            tag: "test".to_string(),
        }
    }

    #[test]
    fn test_profit_distance_is_signed() {
        let long = make_position(TradeDirection::Long, 1.1000, None);
        let short = make_position(TradeDirection::Short, 1.1000, None);

        assert!((long.profit_distance(1.1050) - 0.0050).abs() < 1e-12);
        assert!((short.profit_distance(1.1050) + 0.0050).abs() < 1e-12);
        assert!((short.adverse_distance(1.1050) - 0.0050).abs() < 1e-12);
    }

    #[test]
    fn test_stop_breach() {
        let long = make_position(TradeDirection::Long, 1.1000, Some(1.0950));
        assert!(!long.stop_breached(1.0951));
        assert!(long.stop_breached(1.0950));
        assert!(long.stop_breached(1.0900));

        let short = make_position(TradeDirection::Short, 1.1000, Some(1.1050));
        assert!(!short.stop_breached(1.1049));
        assert!(short.stop_breached(1.1060));

        let naked = make_position(TradeDirection::Long, 1.1000, None);
        assert!(!naked.stop_breached(0.5));
    }

    #[test]
    fn test_held_minutes() {
        let pos = make_position(TradeDirection::Long, 1.1, None);
        let now = Utc.with_ymd_and_hms(2024, 1, 2, 10, 30, 0).unwrap();
        assert_eq!(pos.held_minutes(now), 90);
    }

    #[test]
    fn test_position_counts() {
        let mut short = make_position(TradeDirection::Short, 1.1, None);
        short.ticket = Ticket(2);
        let records = vec![
            make_position(TradeDirection::Long, 1.1, None),
            make_position(TradeDirection::Long, 1.2, None),
            short,
        ];

        let counts = PositionCounts::from_records(&records);
        assert_eq!(counts.long, 2);
        assert_eq!(counts.short, 1);
        assert_eq!(counts.total(), 3);
        assert_eq!(counts.side(TradeDirection::None), 0);
    }
}
