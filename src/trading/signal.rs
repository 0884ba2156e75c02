//! EMA crossover detection on the last closed bar.

use crate::indicators::IndicatorSnapshot;
use crate::models::TradeDirection;

/// Crossover flags for one bar. At most one is set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CrossSignal {
    pub bullish: bool,
    pub bearish: bool,
}

impl CrossSignal {
    pub fn direction(&self) -> TradeDirection {
        if self.bullish {
            TradeDirection::Long
        } else if self.bearish {
            TradeDirection::Short
        } else {
            TradeDirection::None
        }
    }
}

/// Stateless fast/slow EMA cross detector, gated by the mid EMA.
pub struct SignalDetector;

impl SignalDetector {
    /// Bullish when fast crosses above slow and closes above mid; bearish is
    /// the mirror. Equal values on the previous bar count as "not yet crossed".
    pub fn detect(snapshot: &IndicatorSnapshot) -> CrossSignal {
        let prev = &snapshot.previous;
        let curr = &snapshot.current;

        let bullish = prev.ema_fast <= prev.ema_slow
            && curr.ema_fast > curr.ema_slow
            && curr.ema_fast > curr.ema_mid;

        let bearish = !bullish
            && prev.ema_fast >= prev.ema_slow
            && curr.ema_fast < curr.ema_slow
            && curr.ema_fast < curr.ema_mid;

        CrossSignal { bullish, bearish }
    }
}
