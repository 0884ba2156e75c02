//! Exit rules evaluated over every tagged open position.
//!
//! Each cycle runs, per position: stop breach poll, ATR take-profit,
//! ATR loss (when no broker-side stop), step-out counting and the trailing
//! ratchet. A momentum-reversal rule then closes at most one position per
//! bar. Planned actions go through the execution gateway; a failure is
//! logged and the same rule simply fires again on the next cycle.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::api::ExecutionGateway;
use crate::indicators::IndicatorSnapshot;
use crate::models::{PositionCounts, PositionRecord, Quote, Ticket, TradeDirection};

use super::config::{ExitConfig, StopMode, TrailMode};
use super::history::BarHistory;

/// Why a position (or part of it) was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Price reached the recorded stop level
    StopBreached,
    /// Profit reached the ATR take-profit multiple
    TakeProfit,
    /// Loss reached the ATR stop multiple (no broker-side stop)
    AtrStopLoss,
    /// Sustained adverse excursion
    StepOut,
    /// MACD crossed against the held side
    MomentumReversal,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::StopBreached => "stop_breached",
            Self::TakeProfit => "take_profit",
            Self::AtrStopLoss => "atr_stop_loss",
            Self::StepOut => "step_out",
            Self::MomentumReversal => "momentum_reversal",
        };
        f.write_str(s)
    }
}

/// One gateway call planned for this cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum ExitAction {
    Close {
        ticket: Ticket,
        fraction: Decimal,
        reason: ExitReason,
    },
    Trail {
        ticket: Ticket,
        stop_loss: f64,
        take_profit: Option<f64>,
    },
}

/// Market inputs for one evaluation cycle.
pub struct ExitCycle<'a> {
    pub now: DateTime<Utc>,
    pub quote: Quote,
    pub snapshot: &'a IndicatorSnapshot,
    /// Open time of the last processed bar; keys the once-per-bar reversal rule
    pub bar_time: Option<DateTime<Utc>>,
}

/// Outcome of one evaluation cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExitReport {
    pub closed: Vec<(Ticket, ExitReason)>,
    pub reduced: Vec<(Ticket, ExitReason)>,
    pub stops_moved: usize,
    pub failures: usize,
    /// Tracked positions after the cycle
    pub remaining: usize,
}

impl ExitReport {
    pub fn is_quiet(&self) -> bool {
        self.closed.is_empty() && self.reduced.is_empty() && self.stops_moved == 0 && self.failures == 0
    }
}

/// Exit manager for one symbol's tagged positions.
pub struct ExitManager {
    config: ExitConfig,
    point: f64,
    tracked: BTreeMap<Ticket, PositionRecord>,
    last_reversal_bar: Option<DateTime<Utc>>,
}

impl ExitManager {
    pub fn new(config: ExitConfig, point: f64) -> Self {
        Self {
            config,
            point,
            tracked: BTreeMap::new(),
            last_reversal_bar: None,
        }
    }

    pub fn config(&self) -> &ExitConfig {
        &self.config
    }

    pub fn positions(&self) -> impl Iterator<Item = &PositionRecord> {
        self.tracked.values()
    }

    pub fn counts(&self) -> PositionCounts {
        PositionCounts::from_records(self.tracked.values())
    }

    // ==================== Entry Levels ====================

    /// Stop level for a new position, computed once at entry.
    ///
    /// Swing mode falls back to the ATR stop when the swing level is not on
    /// the losing side of the entry price.
    pub fn initial_stop(
        &self,
        direction: TradeDirection,
        entry_price: f64,
        atr: f64,
        history: &BarHistory,
    ) -> Option<f64> {
        let s = direction.sign();
        if s == 0.0 {
            return None;
        }
        let buffer = self.config.stop_buffer_points * self.point;

        if self.config.stop_mode == StopMode::Swing {
            let n = self.config.swing_lookback_bars;
            let swing = match direction {
                TradeDirection::Long => history.lowest_low(n).map(|low| low - buffer),
                _ => history.highest_high(n).map(|high| high + buffer),
            };
            if let Some(stop) = swing.filter(|stop| s * (entry_price - stop) > 0.0) {
                return Some(stop);
            }
            debug!(direction = %direction, "Swing stop unusable, using ATR stop");
        }

        if !(atr.is_finite() && atr > 0.0) {
            return None;
        }
        Some(entry_price - s * (atr * self.config.stop_atr_multiplier + buffer))
    }

    /// Broker-side target for a new position, if configured.
    pub fn initial_target(&self, direction: TradeDirection, entry_price: f64, atr: f64) -> Option<f64> {
        if !self.config.broker_take_profit || direction.is_none() || !(atr.is_finite() && atr > 0.0) {
            return None;
        }
        Some(entry_price + direction.sign() * atr * self.config.take_profit_atr_multiplier)
    }

    // ==================== Evaluation ====================

    /// Replace the local view with the ledger's, carrying step-out counters
    /// and never loosening a stop already tightened locally.
    pub fn refresh(&mut self, positions: Vec<PositionRecord>) {
        let mut next = BTreeMap::new();
        for mut pos in positions {
            if let Some(known) = self.tracked.get(&pos.ticket) {
                pos.bars_under_threshold = known.bars_under_threshold;
                if let Some(local) = known.stop_loss {
                    if pos.direction.tightens(pos.stop_loss, local) {
                        pos.stop_loss = Some(local);
                    }
                }
            }
            next.insert(pos.ticket, pos);
        }
        self.tracked = next;
    }

    /// Refresh, plan and execute one cycle.
    pub fn evaluate<G: ExecutionGateway + ?Sized>(
        &mut self,
        positions: Vec<PositionRecord>,
        cycle: &ExitCycle<'_>,
        gateway: &mut G,
    ) -> ExitReport {
        self.refresh(positions);
        let actions = self.plan(cycle);
        self.execute(actions, cycle, gateway)
    }

    /// Decide this cycle's actions. Updates step-out counters.
    pub fn plan(&mut self, cycle: &ExitCycle<'_>) -> Vec<ExitAction> {
        let mut actions = Vec::new();
        let atr = cycle.snapshot.atr();
        let atr_ok = atr.is_finite() && atr > 0.0;

        for pos in self.tracked.values_mut() {
            let price = cycle.quote.exit_price(pos.direction);

            if pos.stop_breached(price) {
                warn!(ticket = %pos.ticket, price, stop = ?pos.stop_loss, "Stop breached, force closing");
                actions.push(close_all(pos.ticket, ExitReason::StopBreached));
                continue;
            }

            if !atr_ok {
                continue;
            }

            let profit_atr = pos.profit_distance(price) / atr;
            if profit_atr >= self.config.take_profit_atr_multiplier {
                actions.push(close_all(pos.ticket, ExitReason::TakeProfit));
                continue;
            }
            if !self.config.broker_stop && -profit_atr >= self.config.stop_atr_multiplier {
                actions.push(close_all(pos.ticket, ExitReason::AtrStopLoss));
                continue;
            }

            if pos.adverse_distance(price) >= atr * self.config.step_out_threshold_atr {
                pos.bars_under_threshold += 1;
            } else {
                pos.bars_under_threshold = 0;
            }
            if pos.bars_under_threshold >= self.config.step_out_cycles {
                actions.push(ExitAction::Close {
                    ticket: pos.ticket,
                    fraction: self.config.step_out_fraction,
                    reason: ExitReason::StepOut,
                });
                continue;
            }

            if profit_atr >= self.config.trail_activation_atr {
                let distance = match self.config.trail_mode {
                    TrailMode::FixedPoints => self.config.trail_points * self.point,
                    TrailMode::Atr => atr * self.config.trail_atr_multiplier,
                };
                let candidate = price - pos.direction.sign() * distance;
                if pos.direction.tightens(pos.stop_loss, candidate) {
                    actions.push(ExitAction::Trail {
                        ticket: pos.ticket,
                        stop_loss: candidate,
                        take_profit: pos.take_profit,
                    });
                }
            }
        }

        if let Some(action) = self.plan_reversal(cycle, &actions) {
            actions.push(action);
        }
        actions
    }

    /// Close the most recently opened position of the majority side when
    /// MACD crosses against it with enough spread. Once per bar.
    fn plan_reversal(&self, cycle: &ExitCycle<'_>, planned: &[ExitAction]) -> Option<ExitAction> {
        let bar_time = cycle.bar_time?;
        if self.last_reversal_bar == Some(bar_time) {
            return None;
        }

        let spread = cycle.snapshot.current.macd_spread();
        if !(spread.abs() >= self.config.reversal_macd_gate) {
            return None;
        }

        let closing = |ticket: Ticket| {
            planned
                .iter()
                .any(|a| matches!(a, ExitAction::Close { ticket: t, .. } if *t == ticket))
        };
        let candidates: Vec<&PositionRecord> =
            self.tracked.values().filter(|p| !closing(p.ticket)).collect();

        let counts = PositionCounts::from_records(candidates.iter().copied());
        let sides: &[TradeDirection] = if counts.long > counts.short {
            &[TradeDirection::Long]
        } else if counts.short > counts.long {
            &[TradeDirection::Short]
        } else {
            &[TradeDirection::Long, TradeDirection::Short]
        };

        let side = sides
            .iter()
            .copied()
            .find(|side| counts.side(*side) > 0 && cycle.snapshot.macd_crossed_against(*side))?;

        let min_hold = self.config.reversal_min_hold_minutes;
        let target = candidates
            .into_iter()
            .filter(|p| p.direction == side && p.held_minutes(cycle.now) >= min_hold)
            .max_by_key(|p| (p.open_time, p.ticket))?;

        info!(
            ticket = %target.ticket,
            side = %side,
            spread,
            "MACD reversed against held side"
        );
        Some(close_all(target.ticket, ExitReason::MomentumReversal))
    }

    /// Send planned actions through the gateway and update the local view
    /// for the ones that succeeded.
    pub fn execute<G: ExecutionGateway + ?Sized>(
        &mut self,
        actions: Vec<ExitAction>,
        cycle: &ExitCycle<'_>,
        gateway: &mut G,
    ) -> ExitReport {
        let mut report = ExitReport::default();

        for action in actions {
            match action {
                ExitAction::Close {
                    ticket,
                    fraction,
                    reason,
                } => match gateway.close_position(ticket, fraction) {
                    Ok(()) => {
                        if reason == ExitReason::MomentumReversal {
                            self.last_reversal_bar = cycle.bar_time;
                        }
                        if fraction >= Decimal::ONE {
                            self.tracked.remove(&ticket);
                            info!(ticket = %ticket, reason = %reason, "Position closed");
                            report.closed.push((ticket, reason));
                        } else {
                            if let Some(pos) = self.tracked.get_mut(&ticket) {
                                pos.volume -= pos.volume * fraction;
                                pos.bars_under_threshold = 0;
                            }
                            info!(ticket = %ticket, reason = %reason, fraction = %fraction, "Position reduced");
                            report.reduced.push((ticket, reason));
                        }
                    }
                    Err(e) => {
                        warn!(
                            ticket = %ticket,
                            reason = %reason,
                            error = %e,
                            transient = e.is_transient(),
                            "Close failed, will retry next cycle"
                        );
                        report.failures += 1;
                    }
                },
                ExitAction::Trail {
                    ticket,
                    stop_loss,
                    take_profit,
                } => match gateway.modify_stops(ticket, Some(stop_loss), take_profit) {
                    Ok(()) => {
                        if let Some(pos) = self.tracked.get_mut(&ticket) {
                            pos.stop_loss = Some(stop_loss);
                        }
                        debug!(ticket = %ticket, stop_loss, "Trailing stop tightened");
                        report.stops_moved += 1;
                    }
                    Err(e) => {
                        warn!(ticket = %ticket, error = %e, transient = e.is_transient(), "Stop modify failed, will retry next cycle");
                        report.failures += 1;
                    }
                },
            }
        }

        report.remaining = self.tracked.len();
        report
    }
}

fn close_all(ticket: Ticket, reason: ExitReason) -> ExitAction {
    ExitAction::Close {
        ticket,
        fraction: Decimal::ONE,
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{GatewayError, OrderReceipt, OrderRequest};
    use crate::indicators::IndicatorValues;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    #[derive(Default)]
    struct MockGateway {
        closes: Vec<(Ticket, Decimal)>,
        modifies: Vec<(Ticket, Option<f64>)>,
        fail: bool,
    }

    impl ExecutionGateway for MockGateway {
        fn place_order(&mut self, _request: &OrderRequest) -> Result<OrderReceipt, GatewayError> {
            Err(GatewayError::Rejected("not used".into()))
        }

        fn close_position(&mut self, ticket: Ticket, fraction: Decimal) -> Result<(), GatewayError> {
            if self.fail {
                return Err(GatewayError::Unreachable("down".into()));
            }
            self.closes.push((ticket, fraction));
            Ok(())
        }

        fn modify_stops(
            &mut self,
            ticket: Ticket,
            stop_loss: Option<f64>,
            _take_profit: Option<f64>,
        ) -> Result<(), GatewayError> {
            if self.fail {
                return Err(GatewayError::Unreachable("down".into()));
            }
            self.modifies.push((ticket, stop_loss));
            Ok(())
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 3, 8, 0, 0).unwrap()
    }

    fn make_position(ticket: u64, direction: TradeDirection, open: f64, minutes: i64) -> PositionRecord {
        PositionRecord {
            ticket: Ticket(ticket),
            direction,
            volume: dec!(1),
            open_price: open,
            stop_loss: None,
            take_profit: None,
            open_time: t0() + Duration::minutes(minutes),
            bars_under_threshold: 0,
            tag: "test".to_string(),
        }
    }

    fn values(macd_main: f64, macd_signal: f64) -> IndicatorValues {
        IndicatorValues {
            ema_fast: 1.1,
            ema_mid: 1.1,
            ema_slow: 1.1,
            macd_main,
            macd_signal,
            atr: 0.0010,
        }
    }

    fn quiet_macd() -> IndicatorSnapshot {
        IndicatorSnapshot::new(values(0.0005, 0.0003), values(0.0004, 0.0003))
    }

    fn make_manager() -> ExitManager {
        ExitManager::new(ExitConfig::default(), 0.00001)
    }

    fn run(
        manager: &mut ExitManager,
        positions: &[PositionRecord],
        price: f64,
        snapshot: &IndicatorSnapshot,
        gateway: &mut MockGateway,
    ) -> ExitReport {
        let cycle = ExitCycle {
            now: t0() + Duration::hours(5),
            quote: Quote::flat(price),
            snapshot,
            bar_time: Some(t0() + Duration::hours(4)),
        };
        manager.evaluate(positions.to_vec(), &cycle, gateway)
    }

    #[test]
    fn test_step_out_needs_consecutive_breaches() {
        let mut manager = make_manager();
        let mut gw = MockGateway::default();
        let positions = vec![make_position(1, TradeDirection::Long, 1.1000, 0)];
        let snap = quiet_macd();

        // 6 points adverse vs 5 point threshold (0.5 ATR)
        let report = run(&mut manager, &positions, 1.0994, &snap, &mut gw);
        assert!(report.is_quiet());
        assert!(gw.closes.is_empty());

        let report = run(&mut manager, &positions, 1.0993, &snap, &mut gw);
        assert_eq!(report.reduced, vec![(Ticket(1), ExitReason::StepOut)]);
        assert_eq!(gw.closes, vec![(Ticket(1), dec!(0.5))]);
    }

    #[test]
    fn test_step_out_counter_resets_on_recovery() {
        let mut manager = make_manager();
        let mut gw = MockGateway::default();
        let positions = vec![make_position(1, TradeDirection::Short, 1.1000, 0)];
        let snap = quiet_macd();

        run(&mut manager, &positions, 1.1006, &snap, &mut gw);
        run(&mut manager, &positions, 1.1002, &snap, &mut gw);
        run(&mut manager, &positions, 1.1006, &snap, &mut gw);
        assert!(gw.closes.is_empty());
        assert_eq!(manager.positions().next().map(|p| p.bars_under_threshold), Some(1));
    }

    #[test]
    fn test_trailing_stop_only_tightens() {
        let mut manager = make_manager();
        let mut gw = MockGateway::default();
        let positions = vec![make_position(1, TradeDirection::Long, 1.1000, 0)];
        let snap = quiet_macd();

        // Below activation: 0.5 ATR profit
        run(&mut manager, &positions, 1.1005, &snap, &mut gw);
        assert!(gw.modifies.is_empty());

        run(&mut manager, &positions, 1.1015, &snap, &mut gw);
        run(&mut manager, &positions, 1.1012, &snap, &mut gw);
        run(&mut manager, &positions, 1.1030, &snap, &mut gw);

        let stops: Vec<f64> = gw.modifies.iter().filter_map(|(_, s)| *s).collect();
        assert_eq!(stops.len(), 2);
        assert!((stops[0] - 1.1000).abs() < 1e-9);
        assert!((stops[1] - 1.1015).abs() < 1e-9);
        assert!(stops.windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn test_local_stop_survives_stale_ledger() {
        let mut manager = make_manager();
        let mut gw = MockGateway::default();
        let positions = vec![make_position(1, TradeDirection::Long, 1.1000, 0)];
        let snap = quiet_macd();

        run(&mut manager, &positions, 1.1030, &snap, &mut gw);
        // Ledger still reports no stop; the local ratchet keeps 1.1015
        run(&mut manager, &positions, 1.1020, &snap, &mut gw);
        assert_eq!(gw.modifies.len(), 1);
        let stop = manager.positions().next().and_then(|p| p.stop_loss).unwrap();
        assert!((stop - 1.1015).abs() < 1e-9);
    }

    #[test]
    fn test_take_profit_in_atr_multiples() {
        let mut manager = make_manager();
        let mut gw = MockGateway::default();
        let positions = vec![make_position(1, TradeDirection::Short, 1.1000, 0)];

        let report = run(&mut manager, &positions, 1.0955, &quiet_macd(), &mut gw);
        assert_eq!(report.closed, vec![(Ticket(1), ExitReason::TakeProfit)]);
        assert_eq!(report.remaining, 0);
    }

    #[test]
    fn test_atr_loss_only_without_broker_stop() {
        let positions = vec![make_position(1, TradeDirection::Long, 1.1000, 0)];

        let mut manager = make_manager();
        let mut gw = MockGateway::default();
        let report = run(&mut manager, &positions, 1.0975, &quiet_macd(), &mut gw);
        assert!(!report.closed.iter().any(|(_, r)| *r == ExitReason::AtrStopLoss));

        let mut manager = ExitManager::new(
            ExitConfig {
                broker_stop: false,
                ..ExitConfig::default()
            },
            0.00001,
        );
        let report = run(&mut manager, &positions, 1.0975, &quiet_macd(), &mut gw);
        assert_eq!(report.closed, vec![(Ticket(1), ExitReason::AtrStopLoss)]);
    }

    #[test]
    fn test_breached_stop_force_closes() {
        let mut manager = make_manager();
        let mut gw = MockGateway::default();
        let mut pos = make_position(1, TradeDirection::Long, 1.1000, 0);
        pos.stop_loss = Some(1.0990);

        let report = run(&mut manager, &[pos], 1.0985, &quiet_macd(), &mut gw);
        assert_eq!(report.closed, vec![(Ticket(1), ExitReason::StopBreached)]);
    }

    #[test]
    fn test_reversal_closes_exactly_one() {
        let mut manager = make_manager();
        let mut gw = MockGateway::default();
        let positions = vec![
            make_position(1, TradeDirection::Long, 1.1000, 0),
            make_position(2, TradeDirection::Long, 1.1000, 60),
            make_position(3, TradeDirection::Long, 1.1000, 120),
        ];
        let crossed = IndicatorSnapshot::new(values(0.0001, 0.0005), values(0.0006, 0.0004));

        let report = run(&mut manager, &positions, 1.1000, &crossed, &mut gw);
        assert_eq!(report.closed, vec![(Ticket(3), ExitReason::MomentumReversal)]);
        assert_eq!(gw.closes, vec![(Ticket(3), Decimal::ONE)]);

        // Same bar again: nothing more
        let report = run(&mut manager, &positions[..2], 1.1000, &crossed, &mut gw);
        assert!(report.closed.is_empty());
        assert_eq!(gw.closes.len(), 1);
    }

    #[test]
    fn test_reversal_below_gate_ignored() {
        let mut manager = make_manager();
        let mut gw = MockGateway::default();
        let positions = vec![make_position(1, TradeDirection::Long, 1.1000, 0)];
        // Crossed, but |spread| = 0.0001 < 0.0002
        let weak = IndicatorSnapshot::new(values(0.0004, 0.0005), values(0.0006, 0.0004));

        let report = run(&mut manager, &positions, 1.1000, &weak, &mut gw);
        assert!(report.is_quiet());
    }

    #[test]
    fn test_reversal_picks_majority_side() {
        let mut manager = make_manager();
        let mut gw = MockGateway::default();
        let positions = vec![
            make_position(1, TradeDirection::Short, 1.1000, 0),
            make_position(2, TradeDirection::Short, 1.1000, 30),
            make_position(3, TradeDirection::Long, 1.1000, 60),
        ];
        // Bullish MACD cross: against shorts
        let crossed = IndicatorSnapshot::new(values(0.0006, 0.0002), values(0.0001, 0.0003));

        let report = run(&mut manager, &positions, 1.1000, &crossed, &mut gw);
        assert_eq!(report.closed, vec![(Ticket(2), ExitReason::MomentumReversal)]);
    }

    #[test]
    fn test_reversal_respects_min_hold() {
        let mut manager = ExitManager::new(
            ExitConfig {
                reversal_min_hold_minutes: 600,
                ..ExitConfig::default()
            },
            0.00001,
        );
        let mut gw = MockGateway::default();
        let positions = vec![make_position(1, TradeDirection::Long, 1.1000, 0)];
        let crossed = IndicatorSnapshot::new(values(0.0001, 0.0005), values(0.0006, 0.0004));

        let report = run(&mut manager, &positions, 1.1000, &crossed, &mut gw);
        assert!(report.closed.is_empty());
    }

    #[test]
    fn test_failed_close_retried_next_cycle() {
        let mut manager = make_manager();
        let mut gw = MockGateway {
            fail: true,
            ..MockGateway::default()
        };
        let mut pos = make_position(1, TradeDirection::Long, 1.1000, 0);
        pos.stop_loss = Some(1.0990);

        let report = run(&mut manager, &[pos.clone()], 1.0985, &quiet_macd(), &mut gw);
        assert_eq!(report.failures, 1);
        assert_eq!(report.remaining, 1);

        gw.fail = false;
        let report = run(&mut manager, &[pos], 1.0985, &quiet_macd(), &mut gw);
        assert_eq!(report.closed, vec![(Ticket(1), ExitReason::StopBreached)]);
    }

    #[test]
    fn test_initial_stop_modes() {
        let manager = make_manager();
        let history = BarHistory::new(5);

        // 2 ATR + 50 points below entry
        let stop = manager
            .initial_stop(TradeDirection::Long, 1.1000, 0.0010, &history)
            .unwrap();
        assert!((stop - 1.0975).abs() < 1e-9);
        assert_eq!(manager.initial_stop(TradeDirection::Short, 1.1, f64::NAN, &history), None);

        let swing = ExitManager::new(
            ExitConfig {
                stop_mode: StopMode::Swing,
                ..ExitConfig::default()
            },
            0.00001,
        );
        let mut history = BarHistory::new(5);
        history.push(crate::models::Bar::new(t0(), 1.1000, 1.1010, 1.0980, 1.1000));
        let stop = swing
            .initial_stop(TradeDirection::Long, 1.1000, 0.0010, &history)
            .unwrap();
        assert!((stop - 1.0975).abs() < 1e-9);

        // Swing high below a short entry: falls back to ATR
        let stop = swing
            .initial_stop(TradeDirection::Short, 1.1050, 0.0010, &history)
            .unwrap();
        assert!((stop - 1.1075).abs() < 1e-9);
    }
}
