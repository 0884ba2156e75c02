//! Per-symbol engine: wires indicators, the entry sequencer, the risk sizer
//! and the exit manager to a broker.
//!
//! Two cadences drive it:
//! - `on_bar` for each closed candle: exits, then signal detection, timeout
//!   and at most one tranche entry
//! - `on_tick` for each price update: exits only
//!
//! Nothing here is fatal. Every failure turns into a skipped cycle plus a
//! log record.

use chrono::{DateTime, Datelike, Duration, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::api::{Broker, GatewayError, OrderRequest};
use crate::indicators::{IndicatorProvider, IndicatorSnapshot};
use crate::metrics::SessionStats;
use crate::models::{Bar, PositionRecord, Quote, Ticket, Tick, TradeDirection};
use crate::trading::{
    BarHistory, EngineConfig, EntryContext, EntrySequenceState, EntrySequencer, ExitCycle,
    ExitManager, ExitReport, RiskSizer, SignalDetector, SignalDisposition, TimeoutOutcome,
    TrancheTrigger,
};

/// Why a cycle was skipped without touching state.
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    InvalidBar,
    InvalidTick,
    StaleTick,
    IndicatorsUnavailable,
    LedgerUnavailable,
}

/// Result of a tranche attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryOutcome {
    Filled {
        ticket: Ticket,
        tranche: u8,
        trigger: TrancheTrigger,
        volume: Decimal,
    },
    /// Sizer returned zero
    ZeroSize,
    /// No usable stop level (ATR unavailable and no swing stop)
    NoStop,
    /// Gateway refused or could not be reached; tranche not counted
    Failed(GatewayError),
}

/// What one processed bar did.
#[derive(Debug, Clone, PartialEq)]
pub struct BarReport {
    pub bar_index: u64,
    pub signal: TradeDirection,
    pub disposition: Option<SignalDisposition>,
    pub timeout: TimeoutOutcome,
    pub entry: Option<EntryOutcome>,
    /// Sequence went back to Idle because every position closed
    pub sequence_reset: bool,
    pub exits: ExitReport,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BarOutcome {
    Processed(BarReport),
    /// Bar time did not advance past the last processed bar
    Duplicate,
    Skipped(SkipReason),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub exits: ExitReport,
    pub sequence_reset: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Evaluated(TickReport),
    Skipped(SkipReason),
}

/// Signal-and-risk engine for one symbol.
pub struct Engine<P, B> {
    config: EngineConfig,
    provider: P,
    broker: B,
    sequencer: EntrySequencer,
    exits: ExitManager,
    sizer: RiskSizer,
    history: BarHistory,

    // Runtime state
    bar_index: u64,
    last_bar_time: Option<DateTime<Utc>>,
    last_tick_time: Option<DateTime<Utc>>,
    quote: Option<(Quote, DateTime<Utc>)>,
    stats: SessionStats,
}

impl<P: IndicatorProvider, B: Broker> Engine<P, B> {
    pub fn new(config: EngineConfig, provider: P, broker: B) -> Self {
        let point = config.point();
        Self {
            sequencer: EntrySequencer::new(config.entry.clone()),
            exits: ExitManager::new(config.exit.clone(), point),
            sizer: RiskSizer::new(config.risk.clone(), config.instrument.clone()),
            history: BarHistory::new(config.history_capacity()),
            config,
            provider,
            broker,
            bar_index: 0,
            last_bar_time: None,
            last_tick_time: None,
            quote: None,
            stats: SessionStats::default(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn provider_mut(&mut self) -> &mut P {
        &mut self.provider
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    pub fn broker_mut(&mut self) -> &mut B {
        &mut self.broker
    }

    pub fn sequence(&self) -> &EntrySequenceState {
        self.sequencer.state()
    }

    /// Open time of the last processed bar.
    pub fn last_bar_time(&self) -> Option<DateTime<Utc>> {
        self.last_bar_time
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    pub fn tracked_positions(&self) -> impl Iterator<Item = &PositionRecord> {
        self.exits.positions()
    }

    // ==================== Bar Cadence ====================

    /// Handle a closed bar. Re-delivery of an already processed bar is a no-op.
    pub fn on_bar(&mut self, bar: Bar) -> BarOutcome {
        if !bar.is_valid() {
            warn!(time = %bar.time, "Invalid bar ignored");
            self.stats.bars_skipped += 1;
            return BarOutcome::Skipped(SkipReason::InvalidBar);
        }
        if self.last_bar_time.is_some_and(|last| bar.time <= last) {
            debug!(time = %bar.time, "Bar already processed");
            self.stats.duplicate_bars += 1;
            return BarOutcome::Duplicate;
        }

        let snapshot = match self.load_snapshot() {
            Ok(s) => s,
            Err(reason) => {
                self.stats.bars_skipped += 1;
                return BarOutcome::Skipped(reason);
            }
        };
        let positions = match self.ledger_positions() {
            Ok(p) => p,
            Err(reason) => {
                self.stats.bars_skipped += 1;
                return BarOutcome::Skipped(reason);
            }
        };

        // Inputs are complete; commit the bar
        self.bar_index += 1;
        let bar_index = self.bar_index;
        let close_time = bar.time + Duration::seconds(self.config.timeframe.seconds());
        self.last_bar_time = Some(bar.time);
        self.history.push(bar.clone());
        self.stats.bars_processed += 1;

        let quote = match self.quote {
            Some((q, at)) if at >= close_time => q,
            _ => Quote::flat(bar.close),
        };

        let cycle = ExitCycle {
            now: close_time,
            quote,
            snapshot: &snapshot,
            bar_time: Some(bar.time),
        };
        let exits = self.exits.evaluate(positions, &cycle, &mut self.broker);
        self.record_exits(&exits);

        let counts = self.exits.counts();
        let sequence_reset = self.sequencer.sync_positions(counts);

        let signal = SignalDetector::detect(&snapshot).direction();
        let disposition = self.sequencer.on_signal(signal, counts, bar_index);
        if !signal.is_none() {
            self.stats.signals += 1;
        }
        match disposition {
            Some(SignalDisposition::Activated) | Some(SignalDisposition::Restarted) => {
                self.stats.sequences_started += 1
            }
            Some(SignalDisposition::Rejected) => self.stats.signals_rejected += 1,
            _ => {}
        }

        let timeout = self.sequencer.check_timeout(bar_index, &snapshot);
        if timeout == TimeoutOutcome::Cancelled {
            self.stats.sequences_cancelled += 1;
        }

        let entry = self.try_entry(&bar, &snapshot, quote);

        BarOutcome::Processed(BarReport {
            bar_index,
            signal,
            disposition,
            timeout,
            entry,
            sequence_reset,
            exits,
        })
    }

    fn try_entry(&mut self, bar: &Bar, snapshot: &IndicatorSnapshot, quote: Quote) -> Option<EntryOutcome> {
        let ctx = EntryContext {
            bar_index: self.bar_index,
            bar,
            previous_bar: self.history.previous(),
            snapshot,
            history: &self.history,
            point: self.config.point(),
        };
        let trigger = self.sequencer.next_tranche(&ctx)?;

        let direction = self.sequencer.state().direction();
        let tranche = self.sequencer.state().entries_filled();
        let entry_price = quote.entry_price(direction);
        let atr = snapshot.atr();

        let Some(stop) = self.exits.initial_stop(direction, entry_price, atr, &self.history) else {
            warn!(direction = %direction, atr, "No usable stop, skipping entry");
            return Some(EntryOutcome::NoStop);
        };

        let balance = match self.broker.balance() {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "Balance unavailable, skipping entry");
                self.stats.gateway_failures += 1;
                return Some(EntryOutcome::Failed(e));
            }
        };

        let stop_distance = (entry_price - stop).abs();
        let volume = self.sizer.size(balance, stop_distance, bar.time.month());
        if volume <= Decimal::ZERO {
            info!(direction = %direction, stop_distance, "Sizer returned zero, skipping entry");
            self.stats.zero_size_skips += 1;
            return Some(EntryOutcome::ZeroSize);
        }

        let request = OrderRequest::market(
            &self.config.symbol,
            direction,
            volume,
            self.config.exit.broker_stop.then_some(stop),
            self.exits.initial_target(direction, entry_price, atr),
            &self.config.tag,
        );

        match self.broker.place_order(&request) {
            Ok(receipt) => {
                self.sequencer.record_fill(self.bar_index);
                self.stats.tranches_filled += 1;
                info!(
                    ticket = %receipt.ticket,
                    direction = %direction,
                    tranche,
                    trigger = %trigger,
                    volume = %volume,
                    price = receipt.fill_price,
                    stop,
                    "Tranche filled"
                );
                Some(EntryOutcome::Filled {
                    ticket: receipt.ticket,
                    tranche,
                    trigger,
                    volume,
                })
            }
            Err(e) => {
                warn!(
                    direction = %direction,
                    tranche,
                    error = %e,
                    transient = e.is_transient(),
                    "Order failed, tranche not counted"
                );
                self.stats.orders_failed += 1;
                self.stats.gateway_failures += 1;
                Some(EntryOutcome::Failed(e))
            }
        }
    }

    // ==================== Tick Cadence ====================

    /// Handle a price update: run the exit rules only.
    pub fn on_tick(&mut self, tick: &Tick) -> TickOutcome {
        let valid = tick.bid.is_finite() && tick.ask.is_finite() && tick.bid > 0.0 && tick.ask >= tick.bid;
        if !valid {
            return TickOutcome::Skipped(SkipReason::InvalidTick);
        }
        if self.last_tick_time.is_some_and(|last| tick.time < last) {
            return TickOutcome::Skipped(SkipReason::StaleTick);
        }
        self.last_tick_time = Some(tick.time);
        self.quote = Some((tick.quote(), tick.time));

        let snapshot = match self.load_snapshot() {
            Ok(s) => s,
            Err(reason) => return TickOutcome::Skipped(reason),
        };
        let positions = match self.ledger_positions() {
            Ok(p) => p,
            Err(reason) => return TickOutcome::Skipped(reason),
        };

        let cycle = ExitCycle {
            now: tick.time,
            quote: tick.quote(),
            snapshot: &snapshot,
            bar_time: self.last_bar_time,
        };
        let exits = self.exits.evaluate(positions, &cycle, &mut self.broker);
        self.record_exits(&exits);
        self.stats.ticks_processed += 1;

        let sequence_reset = self.sequencer.sync_positions(self.exits.counts());
        TickOutcome::Evaluated(TickReport {
            exits,
            sequence_reset,
        })
    }

    // ==================== Helpers ====================

    fn load_snapshot(&self) -> Result<IndicatorSnapshot, SkipReason> {
        IndicatorSnapshot::load(
            &self.provider,
            &self.config.symbol,
            self.config.timeframe,
            &self.config.retry,
        )
        .map_err(|e| {
            warn!(error = %e, "Indicators unavailable, skipping cycle");
            SkipReason::IndicatorsUnavailable
        })
    }

    fn ledger_positions(&mut self) -> Result<Vec<PositionRecord>, SkipReason> {
        self.broker.open_positions(&self.config.tag).map_err(|e| {
            warn!(error = %e, "Position ledger unavailable, skipping cycle");
            self.stats.gateway_failures += 1;
            SkipReason::LedgerUnavailable
        })
    }

    fn record_exits(&mut self, report: &ExitReport) {
        self.stats.positions_closed += report.closed.len() as u64;
        self.stats.partial_closes += report.reduced.len() as u64;
        self.stats.stops_moved += report.stops_moved as u64;
        self.stats.gateway_failures += report.failures as u64;
    }
}
