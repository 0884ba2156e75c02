//! Staged entry state machine.
//!
//! One sequencer per symbol. After a crossover it stages up to three
//! tranche entries, each behind its own confirmation gate, and handles
//! timeout/extension of the sequence. It is the only writer of the
//! sequence direction and fill count.

use tracing::{debug, info, warn};

use crate::indicators::IndicatorSnapshot;
use crate::models::{Bar, PositionCounts, TradeDirection};

use super::config::EntryConfig;
use super::history::BarHistory;

/// Maximum tranches per sequence.
pub const MAX_TRANCHES: u8 = 3;

/// Per-symbol sequence record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntrySequenceState {
    direction: TradeDirection,
    entries_filled: u8,
    sequence_start_bar: u64,
    last_fill_bar: Option<u64>,
    timed_out: bool,
}

impl EntrySequenceState {
    pub fn direction(&self) -> TradeDirection {
        self.direction
    }

    pub fn entries_filled(&self) -> u8 {
        self.entries_filled
    }

    pub fn sequence_start_bar(&self) -> u64 {
        self.sequence_start_bar
    }

    pub fn last_fill_bar(&self) -> Option<u64> {
        self.last_fill_bar
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    pub fn is_idle(&self) -> bool {
        self.direction.is_none()
    }

    /// Bar the timeout is measured from.
    fn timeout_reference(&self) -> u64 {
        match self.last_fill_bar {
            Some(bar) if self.entries_filled > 0 => bar,
            _ => self.sequence_start_bar,
        }
    }
}

/// What happened to a crossover signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalDisposition {
    /// Idle -> Active
    Activated,
    /// Same direction as the active sequence; count preserved
    Continued,
    /// Opposing positions still open
    Rejected,
    /// Opposing signal on a sequence with no open positions
    Restarted,
}

/// Result of the per-bar timeout check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutOutcome {
    /// Not timed out, or nothing active
    None,
    /// Fills exist; no more tranches will be added
    Dormant,
    /// No fills but alignment holds; start moved to the current bar
    Extended,
    /// No fills and alignment broken; back to Idle
    Cancelled,
}

/// Gate that allowed a tranche.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrancheTrigger {
    /// Tranche 0: EMA alignment and MACD confirmation
    Confirmation,
    /// Tranche 1: prior-bar extreme broken within tolerance
    Breakout,
    /// Tranche 2: close-to-close continuation
    Continuation,
    /// Tranche 2: adverse excursion since start exceeded the threshold
    DrawdownOverride,
}

impl std::fmt::Display for TrancheTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Confirmation => "confirmation",
            Self::Breakout => "breakout",
            Self::Continuation => "continuation",
            Self::DrawdownOverride => "drawdown_override",
        };
        f.write_str(s)
    }
}

/// Market inputs for one tranche evaluation.
pub struct EntryContext<'a> {
    /// Index of the bar being processed
    pub bar_index: u64,
    /// Closed bar being processed
    pub bar: &'a Bar,
    /// Bar before it, if known
    pub previous_bar: Option<&'a Bar>,
    pub snapshot: &'a IndicatorSnapshot,
    /// Closed bars including `bar`
    pub history: &'a BarHistory,
    /// Price value of one point
    pub point: f64,
}

/// Entry sequencer for one symbol.
#[derive(Debug, Clone)]
pub struct EntrySequencer {
    config: EntryConfig,
    state: EntrySequenceState,
}

impl EntrySequencer {
    pub fn new(config: EntryConfig) -> Self {
        Self {
            config,
            state: EntrySequenceState::default(),
        }
    }

    pub fn state(&self) -> &EntrySequenceState {
        &self.state
    }

    // ==================== Lifecycle ====================

    /// React to a crossover on `bar_index` given the currently open positions.
    pub fn on_signal(
        &mut self,
        signal: TradeDirection,
        counts: PositionCounts,
        bar_index: u64,
    ) -> Option<SignalDisposition> {
        if signal.is_none() {
            return None;
        }

        if counts.side(signal.opposite()) > 0 {
            warn!(
                signal = %signal,
                opposing = counts.side(signal.opposite()),
                "Signal rejected: opposing positions still open"
            );
            return Some(SignalDisposition::Rejected);
        }

        if self.state.direction == signal {
            debug!(direction = %signal, filled = self.state.entries_filled, "Signal repeats active sequence");
            return Some(SignalDisposition::Continued);
        }

        let disposition = if self.state.is_idle() {
            SignalDisposition::Activated
        } else {
            SignalDisposition::Restarted
        };

        self.state = EntrySequenceState {
            direction: signal,
            entries_filled: 0,
            sequence_start_bar: bar_index,
            last_fill_bar: None,
            timed_out: false,
        };

        info!(direction = %signal, bar = bar_index, ?disposition, "Entry sequence started");
        Some(disposition)
    }

    /// Reset to Idle once every tagged position of a filled sequence is gone.
    ///
    /// Returns true when the state was reset.
    pub fn sync_positions(&mut self, counts: PositionCounts) -> bool {
        if self.state.is_idle() || self.state.entries_filled == 0 || counts.total() > 0 {
            return false;
        }

        info!(
            direction = %self.state.direction,
            filled = self.state.entries_filled,
            "All tagged positions closed, sequence back to idle"
        );
        self.reset();
        true
    }

    /// Apply the bar-count timeout.
    pub fn check_timeout(&mut self, bar_index: u64, snapshot: &IndicatorSnapshot) -> TimeoutOutcome {
        if self.state.is_idle() || self.state.timed_out {
            return TimeoutOutcome::None;
        }

        let elapsed = bar_index.saturating_sub(self.state.timeout_reference());
        if elapsed <= self.config.timeout_bars {
            return TimeoutOutcome::None;
        }

        if self.state.entries_filled > 0 {
            self.state.timed_out = true;
            info!(
                direction = %self.state.direction,
                filled = self.state.entries_filled,
                elapsed,
                "Entry sequence timed out, no further tranches"
            );
            return TimeoutOutcome::Dormant;
        }

        if snapshot.ema_aligned(self.state.direction) {
            self.state.sequence_start_bar = bar_index;
            debug!(direction = %self.state.direction, bar = bar_index, "Entry sequence extended");
            TimeoutOutcome::Extended
        } else {
            info!(direction = %self.state.direction, "Entry sequence cancelled: alignment lost");
            self.reset();
            TimeoutOutcome::Cancelled
        }
    }

    /// Record a confirmed fill for the next tranche.
    pub fn record_fill(&mut self, bar_index: u64) {
        if self.state.is_idle() || self.state.entries_filled >= MAX_TRANCHES {
            return;
        }
        self.state.entries_filled += 1;
        self.state.last_fill_bar = Some(bar_index);
    }

    pub fn reset(&mut self) {
        self.state = EntrySequenceState::default();
    }

    // ==================== Tranche Gates ====================

    /// Gate for the next tranche on this bar, if one may be placed.
    pub fn next_tranche(&self, ctx: &EntryContext<'_>) -> Option<TrancheTrigger> {
        let state = &self.state;
        if state.is_idle() || state.timed_out || state.entries_filled >= MAX_TRANCHES {
            return None;
        }
        // One tranche per bar
        if state.last_fill_bar == Some(ctx.bar_index) {
            return None;
        }

        match state.entries_filled {
            0 => self.first_tranche(ctx),
            1 => self.breakout_tranche(ctx),
            _ => self.third_tranche(ctx),
        }
    }

    fn first_tranche(&self, ctx: &EntryContext<'_>) -> Option<TrancheTrigger> {
        let dir = self.state.direction;
        (ctx.snapshot.ema_aligned(dir) && ctx.snapshot.macd_confirms(dir))
            .then_some(TrancheTrigger::Confirmation)
    }

    fn breakout_tranche(&self, ctx: &EntryContext<'_>) -> Option<TrancheTrigger> {
        let dir = self.state.direction;
        let prev = ctx.previous_bar?;
        let tol = self.config.breakout_tolerance;

        let broke = match dir {
            TradeDirection::Long => ctx.bar.close > prev.high * (1.0 - tol),
            TradeDirection::Short => ctx.bar.close < prev.low * (1.0 + tol),
            TradeDirection::None => false,
        };

        let snap = ctx.snapshot;
        (broke && snap.macd_past_zero(dir) && snap.macd_rising(dir) && snap.ema_aligned(dir))
            .then_some(TrancheTrigger::Breakout)
    }

    fn third_tranche(&self, ctx: &EntryContext<'_>) -> Option<TrancheTrigger> {
        let dir = self.state.direction;
        let snap = ctx.snapshot;
        if !snap.ema_aligned(dir) {
            return None;
        }

        if let Some(prev) = ctx.previous_bar {
            let target = prev.close * (1.0 + dir.sign() * self.config.continuation_pct);
            if dir.favourable(target, ctx.bar.close) >= 0.0 && snap.macd_confirms(dir) {
                return Some(TrancheTrigger::Continuation);
            }
        }

        let excursion = self.adverse_excursion(ctx)?;
        let threshold = self.config.drawdown_threshold_points * ctx.point;
        if excursion > threshold && snap.macd_beyond_signal(dir) {
            debug!(excursion, threshold, "Drawdown override unlocked");
            return Some(TrancheTrigger::DrawdownOverride);
        }

        None
    }

    /// Worst extreme since the sequence started (bounded by the lookback)
    /// back to the current close, measured against the sequence direction.
    fn adverse_excursion(&self, ctx: &EntryContext<'_>) -> Option<f64> {
        let since_start = ctx.bar_index.saturating_sub(self.state.sequence_start_bar) + 1;
        let window = (since_start as usize).min(self.config.drawdown_lookback_bars);

        match self.state.direction {
            TradeDirection::Long => ctx.history.highest_high(window).map(|h| h - ctx.bar.close),
            TradeDirection::Short => ctx.history.lowest_low(window).map(|l| ctx.bar.close - l),
            TradeDirection::None => None,
        }
    }
}
