//! JSON-lines market feed driving the engine with the paper broker.
//!
//! One event per line:
//! - `{"type":"bar","time":…,"open":…,"high":…,"low":…,"close":…,"indicators":{…}}`
//! - `{"type":"tick","time":…,"bid":…,"ask":…}`
//!
//! Blank lines and lines starting with `#` are ignored. Malformed lines are
//! logged and skipped.

use std::future::Future;

use anyhow::{Context, Result};
use chrono::Duration;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, info, warn};

use crate::api::{PaperBroker, PositionLedger};
use crate::engine::{BarOutcome, Engine, TickOutcome};
use crate::indicators::{FeedIndicators, IndicatorValues};
use crate::metrics::{MetricsCalculator, SessionReport};
use crate::models::{Bar, Quote, Tick};

pub type PaperEngine = Engine<FeedIndicators, PaperBroker>;

/// One line of the market feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MarketEvent {
    Bar {
        #[serde(flatten)]
        bar: Bar,
        indicators: IndicatorValues,
    },
    Tick(Tick),
}

/// Line counts for one feed run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedSummary {
    pub events: u64,
    pub malformed: u64,
    /// Stopped by the shutdown signal rather than end of input
    pub interrupted: bool,
}

/// Parse one feed line. `Ok(None)` for blank and comment lines.
pub fn parse_event(line: &str) -> Result<Option<MarketEvent>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let event = serde_json::from_str(line).context("Failed to parse market event")?;
    Ok(Some(event))
}

/// Feed one event into the engine.
///
/// Bar events publish their indicator row and move the paper quote to the
/// close before the engine sees the bar. Ticks move the quote first too, so
/// broker-side stops fill before the exit rules run.
pub fn apply_event(engine: &mut PaperEngine, event: MarketEvent) {
    match event {
        MarketEvent::Bar { bar, indicators } => {
            let fresh = engine.last_bar_time().map_or(true, |last| bar.time > last);
            if fresh && bar.is_valid() {
                let symbol = engine.config().symbol.clone();
                let timeframe = engine.config().timeframe;
                engine.provider_mut().publish(&symbol, timeframe, bar.time, indicators);

                let close_time = bar.time + Duration::seconds(timeframe.seconds());
                engine.broker_mut().set_quote(Quote::flat(bar.close), close_time);
            }

            let time = bar.time;
            match engine.on_bar(bar) {
                BarOutcome::Processed(report) => debug!(
                    time = %time,
                    bar = report.bar_index,
                    signal = %report.signal,
                    entry = ?report.entry,
                    "Bar processed"
                ),
                BarOutcome::Duplicate => debug!(time = %time, "Duplicate bar"),
                BarOutcome::Skipped(reason) => debug!(time = %time, ?reason, "Bar skipped"),
            }
        }
        MarketEvent::Tick(tick) => {
            if tick.bid.is_finite() && tick.ask.is_finite() && tick.ask >= tick.bid {
                engine.broker_mut().set_quote(tick.quote(), tick.time);
            }
            match engine.on_tick(&tick) {
                TickOutcome::Evaluated(report) if !report.exits.is_quiet() => debug!(
                    time = %tick.time,
                    closed = report.exits.closed.len(),
                    reduced = report.exits.reduced.len(),
                    stops_moved = report.exits.stops_moved,
                    "Exit cycle acted"
                ),
                TickOutcome::Skipped(reason) => debug!(time = %tick.time, ?reason, "Tick skipped"),
                _ => {}
            }
        }
    }
}

/// Drive the engine from a line-oriented reader until end of input or
/// until `shutdown` resolves.
pub async fn run_feed<R, S>(engine: &mut PaperEngine, reader: R, shutdown: S) -> Result<FeedSummary>
where
    R: AsyncBufRead + Unpin,
    S: Future<Output = ()>,
{
    let mut summary = FeedSummary::default();
    let mut lines = reader.lines();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                info!("Shutdown signal received, stopping feed");
                summary.interrupted = true;
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read market feed")? else {
                    break;
                };
                match parse_event(&line) {
                    Ok(Some(event)) => {
                        summary.events += 1;
                        apply_event(engine, event);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(error = %e, line = %line, "Malformed feed line skipped");
                        summary.malformed += 1;
                    }
                }
            }
        }
    }

    info!(
        events = summary.events,
        malformed = summary.malformed,
        interrupted = summary.interrupted,
        "Feed finished"
    );
    Ok(summary)
}

/// End-of-run report from the engine counters and the paper broker's closes.
pub fn session_report(engine: &PaperEngine) -> SessionReport {
    let broker = engine.broker();
    let pnls: Vec<Decimal> = broker.closed_trades().iter().map(|t| t.pnl).collect();
    let initial_balance = broker.initial_balance();

    SessionReport {
        symbol: engine.config().symbol.clone(),
        initial_balance,
        final_balance: broker.balance().unwrap_or(initial_balance),
        open_positions: broker.open_count(),
        unrealized_pnl: broker.unrealized_pnl(),
        stats: engine.stats().clone(),
        pnl: MetricsCalculator::summarize(&pnls, initial_balance),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::models::TradeDirection;
    use crate::trading::EngineConfig;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn make_engine() -> PaperEngine {
        let mut config = EngineConfig::default();
        config.retry = RetryPolicy {
            max_attempts: 1,
            initial_interval_ms: 0,
            max_interval_ms: 0,
        };
        let broker = PaperBroker::new(config.instrument.clone(), dec!(10000));
        Engine::new(config, FeedIndicators::new(), broker)
    }

    fn bar_line(hour: u32, close: f64, ind: [f64; 5]) -> String {
        format!(
            r#"{{"type":"bar","time":"2024-04-01T{:02}:00:00Z","open":{c},"high":{h},"low":{l},"close":{c},"indicators":{{"ema_fast":{},"ema_mid":{},"ema_slow":{},"macd_main":{},"macd_signal":{},"atr":0.001}}}}"#,
            hour,
            ind[0],
            ind[1],
            ind[2],
            ind[3],
            ind[4],
            c = close,
            h = close + 0.0003,
            l = close - 0.0003,
        )
    }

    const WARM: [f64; 5] = [1.0990, 1.0995, 1.1000, -0.0001, 0.0000];
    const CROSS: [f64; 5] = [1.1012, 1.1008, 1.1005, 0.0003, 0.0001];

    #[test]
    fn test_parse_events() {
        let bar = parse_event(&bar_line(3, 1.1, WARM)).unwrap().unwrap();
        match bar {
            MarketEvent::Bar { bar, indicators } => {
                assert_eq!(bar.close, 1.1);
                assert_eq!(indicators.macd_main, -0.0001);
            }
            other => panic!("expected bar, got {:?}", other),
        }

        let tick = parse_event(r#"{"type":"tick","time":"2024-04-01T05:10:00Z","bid":1.1,"ask":1.1002}"#)
            .unwrap()
            .unwrap();
        assert!(matches!(tick, MarketEvent::Tick(t) if t.ask == 1.1002));

        assert!(parse_event("   ").unwrap().is_none());
        assert!(parse_event("# comment").unwrap().is_none());
        assert!(parse_event(r#"{"type":"quote"}"#).is_err());
    }

    #[test]
    fn test_feed_runs_sequence_to_take_profit() {
        let input = [
            bar_line(0, 1.1000, WARM),
            bar_line(1, 1.1000, WARM),
            "not json".to_string(),
            bar_line(2, 1.1010, CROSS),
            // Re-delivered bar must not shift the indicator rows
            bar_line(2, 1.1010, CROSS),
            r#"{"type":"tick","time":"2024-04-01T03:30:00Z","bid":1.1060,"ask":1.1061}"#.to_string(),
        ]
        .join("\n");

        let mut engine = make_engine();
        let summary = tokio_test::block_on(run_feed(
            &mut engine,
            input.as_bytes(),
            std::future::pending::<()>(),
        ))
        .unwrap();

        assert_eq!(summary.events, 5);
        assert_eq!(summary.malformed, 1);
        assert!(!summary.interrupted);

        let stats = engine.stats();
        assert_eq!(stats.tranches_filled, 1);
        assert_eq!(stats.duplicate_bars, 1);
        assert_eq!(stats.positions_closed, 1);
        assert!(engine.sequence().is_idle());

        let report = session_report(&engine);
        assert_eq!(report.pnl.trades, 1);
        assert_eq!(report.open_positions, 0);
        assert_eq!(report.unrealized_pnl, Decimal::ZERO);
        assert!(report.final_balance > dec!(10000));
    }

    #[test]
    fn test_report_marks_open_position_at_last_quote() {
        let mut engine = make_engine();
        apply_event(&mut engine, bar_event(0, 1.1000, WARM));
        apply_event(&mut engine, bar_event(1, 1.1000, WARM));
        apply_event(&mut engine, bar_event(2, 1.1010, CROSS));
        assert_eq!(engine.stats().tranches_filled, 1);

        // 20 points in profit on the bid, below the take-profit distance
        let tick = r#"{"type":"tick","time":"2024-04-01T03:10:00Z","bid":1.1030,"ask":1.1031}"#;
        apply_event(&mut engine, parse_event(tick).unwrap().unwrap());

        let report = session_report(&engine);
        assert_eq!(report.open_positions, 1);
        assert_eq!(report.final_balance, dec!(10000));
        assert!(report.unrealized_pnl > Decimal::ZERO);
        assert_eq!(report.unrealized_pnl, engine.broker().unrealized_pnl());
    }

    fn bar_event(hour: i64, close: f64, ind: [f64; 5]) -> MarketEvent {
        let time = Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap() + Duration::hours(hour);
        MarketEvent::Bar {
            bar: Bar::new(time, close, close + 0.0003, close - 0.0003, close),
            indicators: IndicatorValues {
                ema_fast: ind[0],
                ema_mid: ind[1],
                ema_slow: ind[2],
                macd_main: ind[3],
                macd_signal: ind[4],
                atr: 0.001,
            },
        }
    }

    #[test]
    fn test_first_bar_redelivered_stays_unprocessed() {
        let mut engine = make_engine();
        apply_event(&mut engine, bar_event(0, 1.1000, WARM));
        apply_event(&mut engine, bar_event(0, 1.1000, WARM));

        // Only one row exists for this symbol, so the bar cannot be evaluated
        assert_eq!(engine.stats().bars_processed, 0);
        assert_eq!(engine.stats().bars_skipped, 2);

        apply_event(&mut engine, bar_event(1, 1.1000, WARM));
        assert_eq!(engine.stats().bars_processed, 1);
    }

    #[test]
    fn test_skipped_bar_redelivered_keeps_previous_row() {
        let mut engine = make_engine();
        apply_event(&mut engine, bar_event(0, 1.1000, WARM));
        apply_event(&mut engine, bar_event(1, 1.1000, WARM));
        assert_eq!(engine.stats().bars_processed, 1);

        // Crossover bar first arrives with a broken ATR and is skipped
        let mut broken = bar_event(2, 1.1010, CROSS);
        if let MarketEvent::Bar { indicators, .. } = &mut broken {
            indicators.atr = f64::NAN;
        }
        apply_event(&mut engine, broken);
        assert_eq!(engine.stats().bars_skipped, 2);
        assert!(engine.sequence().is_idle());

        // Re-delivery still compares against bar 1, so the cross is seen
        apply_event(&mut engine, bar_event(2, 1.1010, CROSS));
        assert_eq!(engine.stats().bars_processed, 2);
        assert_eq!(engine.stats().signals, 1);
        assert_eq!(engine.stats().tranches_filled, 1);
        assert_eq!(engine.sequence().direction(), TradeDirection::Long);
    }

    #[test]
    fn test_shutdown_stops_feed() {
        let mut engine = make_engine();
        let input = bar_line(0, 1.1, WARM);
        let summary = tokio_test::block_on(run_feed(&mut engine, input.as_bytes(), async {})).unwrap();
        assert!(summary.interrupted);
        assert_eq!(summary.events, 0);
    }
}
