//! Indicator provider interface.
//!
//! Indicator math (EMA, MACD, ATR) lives outside this crate. The core only
//! asks for a value of a given kind at shift 0 (last closed bar) or shift 1
//! (the bar before).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::debug;

use crate::models::Timeframe;

use super::IndicatorValues;

/// Indicator series the core consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndicatorKind {
    EmaFast,
    EmaMid,
    EmaSlow,
    MacdMain,
    MacdSignal,
    Atr,
}

impl IndicatorKind {
    pub const ALL: [IndicatorKind; 6] = [
        IndicatorKind::EmaFast,
        IndicatorKind::EmaMid,
        IndicatorKind::EmaSlow,
        IndicatorKind::MacdMain,
        IndicatorKind::MacdSignal,
        IndicatorKind::Atr,
    ];
}

/// Errors surfaced by an indicator provider.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum IndicatorError {
    #[error("indicator {kind:?} unavailable at shift {shift}")]
    Unavailable { kind: IndicatorKind, shift: usize },
}

/// Source of indicator values for a symbol/timeframe.
pub trait IndicatorProvider {
    fn value(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        kind: IndicatorKind,
        shift: usize,
    ) -> Result<f64, IndicatorError>;
}

/// In-memory provider holding the two most recent indicator rows per
/// symbol/timeframe, published alongside bar events.
#[derive(Debug, Default)]
pub struct FeedIndicators {
    // (symbol, timeframe) -> [shift 0, shift 1], each row keyed by bar open time
    rows: HashMap<(String, Timeframe), [Option<(DateTime<Utc>, IndicatorValues)>; 2]>,
}

impl FeedIndicators {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish the row for the bar opened at `bar_time`.
    ///
    /// A newer bar shifts the current row to shift 1. Publishing the same bar
    /// again only replaces shift 0, and an older bar is ignored.
    pub fn publish(
        &mut self,
        symbol: &str,
        timeframe: Timeframe,
        bar_time: DateTime<Utc>,
        values: IndicatorValues,
    ) {
        let slot = self
            .rows
            .entry((symbol.to_string(), timeframe))
            .or_insert([None, None]);

        match slot[0].map(|(time, _)| time) {
            Some(latest) if bar_time == latest => slot[0] = Some((bar_time, values)),
            Some(latest) if bar_time < latest => {
                debug!(symbol, time = %bar_time, "Stale indicator row ignored");
            }
            _ => {
                slot[1] = slot[0].take();
                slot[0] = Some((bar_time, values));
            }
        }
    }

    fn row(&self, symbol: &str, timeframe: Timeframe, shift: usize) -> Option<&IndicatorValues> {
        self.rows
            .get(&(symbol.to_string(), timeframe))
            .and_then(|slot| slot.get(shift))
            .and_then(|row| row.as_ref())
            .map(|(_, values)| values)
    }
}

impl IndicatorProvider for FeedIndicators {
    fn value(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        kind: IndicatorKind,
        shift: usize,
    ) -> Result<f64, IndicatorError> {
        self.row(symbol, timeframe, shift)
            .map(|row| row.get(kind))
            .filter(|v| v.is_finite())
            .ok_or(IndicatorError::Unavailable { kind, shift })
    }
}
