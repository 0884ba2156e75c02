//! Two-bar indicator snapshot and the alignment/momentum predicates built on it.

use serde::{Deserialize, Serialize};

use crate::models::{Timeframe, TradeDirection};
use crate::retry::{retry_with_backoff, RetryPolicy};

use super::{IndicatorError, IndicatorKind, IndicatorProvider};

/// One row of indicator output for a single bar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndicatorValues {
    pub ema_fast: f64,
    pub ema_mid: f64,
    pub ema_slow: f64,
    pub macd_main: f64,
    pub macd_signal: f64,
    pub atr: f64,
}

impl IndicatorValues {
    pub fn get(&self, kind: IndicatorKind) -> f64 {
        match kind {
            IndicatorKind::EmaFast => self.ema_fast,
            IndicatorKind::EmaMid => self.ema_mid,
            IndicatorKind::EmaSlow => self.ema_slow,
            IndicatorKind::MacdMain => self.macd_main,
            IndicatorKind::MacdSignal => self.macd_signal,
            IndicatorKind::Atr => self.atr,
        }
    }

    fn set(&mut self, kind: IndicatorKind, value: f64) {
        match kind {
            IndicatorKind::EmaFast => self.ema_fast = value,
            IndicatorKind::EmaMid => self.ema_mid = value,
            IndicatorKind::EmaSlow => self.ema_slow = value,
            IndicatorKind::MacdMain => self.macd_main = value,
            IndicatorKind::MacdSignal => self.macd_signal = value,
            IndicatorKind::Atr => self.atr = value,
        }
    }

    fn empty() -> Self {
        Self {
            ema_fast: f64::NAN,
            ema_mid: f64::NAN,
            ema_slow: f64::NAN,
            macd_main: f64::NAN,
            macd_signal: f64::NAN,
            atr: f64::NAN,
        }
    }

    /// MACD main minus signal.
    pub fn macd_spread(&self) -> f64 {
        self.macd_main - self.macd_signal
    }
}

/// Indicator values for the last closed bar (`current`, shift 0) and the
/// bar before it (`previous`, shift 1).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndicatorSnapshot {
    pub current: IndicatorValues,
    pub previous: IndicatorValues,
}

impl IndicatorSnapshot {
    pub fn new(current: IndicatorValues, previous: IndicatorValues) -> Self {
        Self { current, previous }
    }

    /// Read all twelve values through the retry helper.
    ///
    /// Any value still unavailable after the retry budget aborts the load;
    /// the caller must skip its cycle without touching state.
    pub fn load<P: IndicatorProvider + ?Sized>(
        provider: &P,
        symbol: &str,
        timeframe: Timeframe,
        policy: &RetryPolicy,
    ) -> Result<Self, IndicatorError> {
        let mut rows = [IndicatorValues::empty(), IndicatorValues::empty()];

        for (shift, row) in rows.iter_mut().enumerate() {
            for kind in IndicatorKind::ALL {
                let value = retry_with_backoff(policy, "indicator read", || {
                    provider.value(symbol, timeframe, kind, shift)
                })?;
                row.set(kind, value);
            }
        }

        let [current, previous] = rows;
        Ok(Self { current, previous })
    }

    /// Current ATR.
    pub fn atr(&self) -> f64 {
        self.current.atr
    }

    // ==================== EMA ====================

    /// Fast/mid/slow EMAs stacked in the trade direction on the current bar.
    pub fn ema_aligned(&self, direction: TradeDirection) -> bool {
        let s = direction.sign();
        if s == 0.0 {
            return false;
        }
        let c = &self.current;
        s * (c.ema_fast - c.ema_mid) > 0.0 && s * (c.ema_mid - c.ema_slow) > 0.0
    }

    // ==================== MACD ====================

    /// Main beyond signal in the trade direction.
    pub fn macd_beyond_signal(&self, direction: TradeDirection) -> bool {
        direction.sign() * self.current.macd_spread() > 0.0
    }

    /// Main moved further in the trade direction versus the previous bar.
    pub fn macd_rising(&self, direction: TradeDirection) -> bool {
        direction.sign() * (self.current.macd_main - self.previous.macd_main) > 0.0
    }

    /// Main on the trade direction's side of zero.
    pub fn macd_past_zero(&self, direction: TradeDirection) -> bool {
        direction.sign() * self.current.macd_main > 0.0
    }

    /// Main beyond signal and still strengthening against the previous bar.
    pub fn macd_confirms(&self, direction: TradeDirection) -> bool {
        self.macd_beyond_signal(direction) && self.macd_rising(direction)
    }

    /// Main crossed the signal line against `held` on the current bar.
    pub fn macd_crossed_against(&self, held: TradeDirection) -> bool {
        let s = held.sign();
        if s == 0.0 {
            return false;
        }
        s * self.previous.macd_spread() >= 0.0 && s * self.current.macd_spread() < 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::FeedIndicators;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn bar_time(i: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap() + Duration::hours(i)
    }

    fn values(fast: f64, mid: f64, slow: f64, main: f64, signal: f64) -> IndicatorValues {
        IndicatorValues {
            ema_fast: fast,
            ema_mid: mid,
            ema_slow: slow,
            macd_main: main,
            macd_signal: signal,
            atr: 0.0010,
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 2,
            initial_interval_ms: 0,
            max_interval_ms: 0,
        }
    }

    #[test]
    fn test_ema_alignment() {
        let snap = IndicatorSnapshot::new(
            values(1.3, 1.2, 1.1, 0.0, 0.0),
            values(1.3, 1.2, 1.1, 0.0, 0.0),
        );
        assert!(snap.ema_aligned(TradeDirection::Long));
        assert!(!snap.ema_aligned(TradeDirection::Short));
        assert!(!snap.ema_aligned(TradeDirection::None));

        let tangled = IndicatorSnapshot::new(
            values(1.3, 1.1, 1.2, 0.0, 0.0),
            values(1.3, 1.1, 1.2, 0.0, 0.0),
        );
        assert!(!tangled.ema_aligned(TradeDirection::Long));
    }

    #[test]
    fn test_macd_confirmation() {
        let snap = IndicatorSnapshot::new(
            values(0.0, 0.0, 0.0, 0.0020, 0.0010),
            values(0.0, 0.0, 0.0, 0.0015, 0.0012),
        );
        assert!(snap.macd_confirms(TradeDirection::Long));
        assert!(!snap.macd_confirms(TradeDirection::Short));
        assert!(snap.macd_past_zero(TradeDirection::Long));

        // Beyond signal but weakening
        let fading = IndicatorSnapshot::new(
            values(0.0, 0.0, 0.0, 0.0020, 0.0010),
            values(0.0, 0.0, 0.0, 0.0025, 0.0012),
        );
        assert!(!fading.macd_confirms(TradeDirection::Long));
    }

    #[test]
    fn test_macd_cross_against_long() {
        let snap = IndicatorSnapshot::new(
            values(0.0, 0.0, 0.0, 0.0008, 0.0012),
            values(0.0, 0.0, 0.0, 0.0014, 0.0011),
        );
        assert!(snap.macd_crossed_against(TradeDirection::Long));
        assert!(!snap.macd_crossed_against(TradeDirection::Short));
    }

    #[test]
    fn test_load_reads_both_shifts() {
        let mut feed = FeedIndicators::new();
        feed.publish("EURUSD", Timeframe::H1, bar_time(0), values(1.0, 0.9, 0.8, 0.1, 0.05));
        feed.publish("EURUSD", Timeframe::H1, bar_time(1), values(1.1, 1.0, 0.9, 0.2, 0.10));

        let snap = IndicatorSnapshot::load(&feed, "EURUSD", Timeframe::H1, &fast_retry()).unwrap();
        assert_eq!(snap.current.ema_fast, 1.1);
        assert_eq!(snap.previous.ema_fast, 1.0);
        assert_eq!(snap.atr(), 0.0010);
    }

    #[test]
    fn test_load_fails_without_previous_bar() {
        let mut feed = FeedIndicators::new();
        feed.publish("EURUSD", Timeframe::H1, bar_time(0), values(1.0, 0.9, 0.8, 0.1, 0.05));

        let err = IndicatorSnapshot::load(&feed, "EURUSD", Timeframe::H1, &fast_retry()).unwrap_err();
        assert!(matches!(err, IndicatorError::Unavailable { shift: 1, .. }));
    }
}
