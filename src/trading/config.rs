//! Engine configuration. Supplied once at start and immutable thereafter.

use std::path::Path;

use anyhow::{ensure, Context, Result};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::models::Timeframe;
use crate::retry::{RetryPolicy, MAX_RETRY_ATTEMPTS, MAX_RETRY_INTERVAL_MS};

/// Maximum number of month overrides honoured by the risk sizer.
pub const MAX_MONTH_OVERRIDES: usize = 3;

/// Complete configuration for one symbol's engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Instrument symbol
    pub symbol: String,

    /// Trading timeframe; timeouts are counted in these bars
    pub timeframe: Timeframe,

    /// Tag marking positions as belonging to this strategy instance
    pub tag: String,

    pub periods: IndicatorPeriods,
    pub instrument: InstrumentSpec,
    pub risk: RiskParameters,
    pub entry: EntryConfig,
    pub exit: ExitConfig,

    /// Retry budget for indicator reads
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            symbol: "EURUSD".to_string(),
            timeframe: Timeframe::H1,
            tag: "trendstack".to_string(),
            periods: IndicatorPeriods::default(),
            instrument: InstrumentSpec::default(),
            risk: RiskParameters::default(),
            entry: EntryConfig::default(),
            exit: ExitConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Load from a JSON file; missing fields fall back to defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.symbol.is_empty(), "symbol must not be empty");
        ensure!(!self.tag.is_empty(), "tag must not be empty");

        let p = &self.periods;
        ensure!(p.ema_fast > 0 && p.macd_fast > 0 && p.macd_signal > 0 && p.atr > 0, "indicator periods must be > 0");
        ensure!(
            p.ema_fast < p.ema_mid && p.ema_mid < p.ema_slow,
            "EMA periods must be fast < mid < slow, got {}/{}/{}",
            p.ema_fast,
            p.ema_mid,
            p.ema_slow
        );
        ensure!(p.macd_fast < p.macd_slow, "MACD fast period must be below slow period");

        let inst = &self.instrument;
        ensure!(inst.lot_step > Decimal::ZERO, "lot_step must be > 0");
        ensure!(inst.lot_min > Decimal::ZERO, "lot_min must be > 0");
        ensure!(inst.lot_min <= inst.lot_max, "lot_min must be <= lot_max");

        let risk = &self.risk;
        ensure!(risk.base_risk_pct > Decimal::ZERO, "base_risk_pct must be > 0");
        ensure!(
            risk.month_overrides.len() <= MAX_MONTH_OVERRIDES,
            "at most {} month overrides are supported, got {}",
            MAX_MONTH_OVERRIDES,
            risk.month_overrides.len()
        );
        for o in &risk.month_overrides {
            ensure!((1..=12).contains(&o.month), "override month {} out of range", o.month);
            ensure!(o.multiplier > Decimal::ZERO, "override multiplier must be > 0");
        }

        let entry = &self.entry;
        ensure!(entry.timeout_bars > 0, "entry timeout must be at least one bar");
        ensure!(entry.drawdown_lookback_bars > 0, "drawdown lookback must be > 0");
        ensure!(entry.breakout_tolerance >= 0.0, "breakout tolerance must be >= 0");

        let exit = &self.exit;
        ensure!(exit.stop_atr_multiplier > 0.0, "stop ATR multiplier must be > 0");
        ensure!(exit.take_profit_atr_multiplier > 0.0, "take-profit ATR multiplier must be > 0");
        ensure!(exit.step_out_cycles > 0, "step-out cycles must be > 0");
        ensure!(
            exit.step_out_fraction > Decimal::ZERO && exit.step_out_fraction <= Decimal::ONE,
            "step-out fraction must be in (0, 1]"
        );
        ensure!(exit.reversal_macd_gate >= 0.0, "reversal MACD gate must be >= 0");

        let retry = &self.retry;
        ensure!(
            retry.max_attempts <= MAX_RETRY_ATTEMPTS,
            "retry max_attempts must be <= {}",
            MAX_RETRY_ATTEMPTS
        );
        ensure!(
            retry.initial_interval_ms <= retry.max_interval_ms
                && retry.max_interval_ms <= MAX_RETRY_INTERVAL_MS,
            "retry intervals must satisfy initial <= max <= {} ms",
            MAX_RETRY_INTERVAL_MS
        );

        Ok(())
    }

    /// Price value of one point (minimum price increment).
    pub fn point(&self) -> f64 {
        self.instrument.point()
    }

    /// Bars kept in history for swing stops and drawdown tracking.
    pub fn history_capacity(&self) -> usize {
        self.entry
            .drawdown_lookback_bars
            .max(self.exit.swing_lookback_bars)
            + 2
    }
}

/// Periods the upstream indicator source computes with. The feed carries
/// finished values, so these are only validated and logged at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndicatorPeriods {
    pub ema_fast: u32,
    pub ema_mid: u32,
    pub ema_slow: u32,
    pub macd_fast: u32,
    pub macd_slow: u32,
    pub macd_signal: u32,
    pub atr: u32,
}

impl Default for IndicatorPeriods {
    fn default() -> Self {
        Self {
            ema_fast: 8,
            ema_mid: 21,
            ema_slow: 55,
            macd_fast: 12,
            macd_slow: 26,
            macd_signal: 9,
            atr: 14,
        }
    }
}

/// Contract properties of the traded instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentSpec {
    /// Minimum price increment
    pub tick_size: Decimal,

    /// Account-currency value of one tick for one lot
    pub tick_value: Decimal,

    /// Price distance the unit value is expressed for
    pub reference_unit: Decimal,

    pub lot_min: Decimal,
    pub lot_max: Decimal,
    pub lot_step: Decimal,
}

impl Default for InstrumentSpec {
    fn default() -> Self {
        Self {
            tick_size: dec!(0.00001),
            tick_value: dec!(1),
            reference_unit: dec!(1),
            lot_min: dec!(0.01),
            lot_max: dec!(50),
            lot_step: dec!(0.01),
        }
    }
}

impl InstrumentSpec {
    pub fn point(&self) -> f64 {
        self.tick_size.to_f64().unwrap_or(0.0)
    }

    /// Value of a one reference-unit price move for one lot, if the tick
    /// properties allow it.
    pub fn unit_value(&self) -> Option<Decimal> {
        if self.tick_size <= Decimal::ZERO || self.tick_value <= Decimal::ZERO {
            return None;
        }
        let value = self.reference_unit / self.tick_size * self.tick_value;
        (value > Decimal::ZERO).then_some(value)
    }
}

/// Per-month risk multiplier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthOverride {
    /// Calendar month, 1-12
    pub month: u32,
    pub multiplier: Decimal,
}

/// Account risk settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskParameters {
    /// Percentage of balance risked per tranche (1.0 = 1%)
    pub base_risk_pct: Decimal,

    /// Ordered overrides; the first matching month wins
    pub month_overrides: Vec<MonthOverride>,
}

impl Default for RiskParameters {
    fn default() -> Self {
        Self {
            base_risk_pct: dec!(1.0),
            month_overrides: Vec::new(),
        }
    }
}

/// Staged entry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EntryConfig {
    /// Bars without a fill before the sequence times out
    pub timeout_bars: u64,

    /// Tolerance band around the prior bar's extreme (0.01 = 1%)
    pub breakout_tolerance: f64,

    /// Minimum close-to-close move for a continuation entry (0.01 = 1%)
    pub continuation_pct: f64,

    /// Adverse excursion, in points, that unlocks the drawdown entry
    pub drawdown_threshold_points: f64,

    /// Upper bound on bars scanned for the adverse excursion
    pub drawdown_lookback_bars: usize,
}

impl Default for EntryConfig {
    fn default() -> Self {
        Self {
            timeout_bars: 12,
            breakout_tolerance: 0.01,
            continuation_pct: 0.01,
            drawdown_threshold_points: 150.0,
            drawdown_lookback_bars: 100,
        }
    }
}

/// How the initial stop is placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopMode {
    /// ATR x multiplier + buffer from the entry price
    Atr,
    /// Recent swing extreme +/- buffer
    Swing,
}

/// How the trailing distance is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrailMode {
    FixedPoints,
    Atr,
}

/// Exit rule settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitConfig {
    // === Initial stop / target ===
    pub stop_mode: StopMode,
    pub stop_atr_multiplier: f64,
    pub stop_buffer_points: f64,
    pub swing_lookback_bars: usize,
    pub take_profit_atr_multiplier: f64,

    /// Send the stop with the order; otherwise the ATR loss rule closes
    pub broker_stop: bool,

    /// Send the ATR target with the order
    pub broker_take_profit: bool,

    // === Trailing ===
    /// Profit, in ATR multiples, before trailing starts
    pub trail_activation_atr: f64,
    pub trail_mode: TrailMode,
    pub trail_points: f64,
    pub trail_atr_multiplier: f64,

    // === Step-out ===
    /// Adverse excursion, in ATR multiples, counted as a breach
    pub step_out_threshold_atr: f64,

    /// Consecutive breaching cycles before a partial close
    pub step_out_cycles: u32,

    /// Fraction of the position closed on step-out
    pub step_out_fraction: Decimal,

    // === Momentum reversal ===
    /// Minimum |MACD main - signal| for a reversal to count
    pub reversal_macd_gate: f64,

    /// Minimum holding time before a reversal close (0 = off)
    pub reversal_min_hold_minutes: i64,
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            stop_mode: StopMode::Atr,
            stop_atr_multiplier: 2.0,
            stop_buffer_points: 50.0,
            swing_lookback_bars: 10,
            take_profit_atr_multiplier: 4.0,
            broker_stop: true,
            broker_take_profit: false,

            trail_activation_atr: 1.0,
            trail_mode: TrailMode::Atr,
            trail_points: 200.0,
            trail_atr_multiplier: 1.5,

            step_out_threshold_atr: 0.5,
            step_out_cycles: 2,
            step_out_fraction: dec!(0.5),

            reversal_macd_gate: 0.0002,
            reversal_min_hold_minutes: 0,
        }
    }
}
