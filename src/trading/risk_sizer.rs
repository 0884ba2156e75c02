//! Risk-based position sizing: a fixed percentage of balance lost at the stop.

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;

use super::config::{InstrumentSpec, RiskParameters};

/// Intermediate values of one sizing calculation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SizingBreakdown {
    /// Risk percentage after the month override
    pub effective_risk_pct: Decimal,

    /// Account currency at risk
    pub risk_amount: Decimal,

    /// Account-currency value of a one reference-unit move for one lot
    pub unit_value: Decimal,

    /// Lots before lot-step rounding and clamping
    pub raw_size: Decimal,

    /// Final volume in lots (zero means do not trade)
    pub size: Decimal,
}

impl SizingBreakdown {
    fn rejected(effective_risk_pct: Decimal) -> Self {
        Self {
            effective_risk_pct,
            risk_amount: Decimal::ZERO,
            unit_value: Decimal::ZERO,
            raw_size: Decimal::ZERO,
            size: Decimal::ZERO,
        }
    }
}

/// Calculator for tranche volumes.
#[derive(Debug, Clone)]
pub struct RiskSizer {
    risk: RiskParameters,
    instrument: InstrumentSpec,
}

impl RiskSizer {
    pub fn new(risk: RiskParameters, instrument: InstrumentSpec) -> Self {
        Self { risk, instrument }
    }

    /// Base risk times the first override matching `month` (1-12).
    pub fn effective_risk_pct(&self, month: u32) -> Decimal {
        let multiplier = self
            .risk
            .month_overrides
            .iter()
            .find(|o| o.month == month)
            .map(|o| o.multiplier)
            .unwrap_or(Decimal::ONE);
        self.risk.base_risk_pct * multiplier
    }

    pub fn unit_value(&self) -> Option<Decimal> {
        self.instrument.unit_value()
    }

    /// Volume so that a move of `stop_distance` costs the effective risk.
    ///
    /// Returns zero for a non-positive balance or stop distance, or when the
    /// instrument's tick properties are unusable.
    pub fn size(&self, balance: Decimal, stop_distance: f64, month: u32) -> Decimal {
        self.breakdown(balance, stop_distance, month).size
    }

    /// Same as [`RiskSizer::size`] with every intermediate value exposed.
    pub fn breakdown(&self, balance: Decimal, stop_distance: f64, month: u32) -> SizingBreakdown {
        let effective_risk_pct = self.effective_risk_pct(month);

        let Some(stop) = Decimal::from_f64(stop_distance).filter(|d| *d > Decimal::ZERO) else {
            return SizingBreakdown::rejected(effective_risk_pct);
        };
        if balance <= Decimal::ZERO || effective_risk_pct <= Decimal::ZERO {
            return SizingBreakdown::rejected(effective_risk_pct);
        }
        let Some(unit_value) = self.unit_value() else {
            return SizingBreakdown::rejected(effective_risk_pct);
        };

        let Some(risk_amount) = balance
            .checked_mul(effective_risk_pct)
            .and_then(|r| r.checked_div(dec!(100)))
        else {
            return SizingBreakdown::rejected(effective_risk_pct);
        };

        // A stop too small to price rounds the loss per lot to zero
        let loss_per_lot = match stop.checked_mul(unit_value) {
            Some(v) if v > Decimal::ZERO => v,
            _ => return SizingBreakdown::rejected(effective_risk_pct),
        };

        // Overflow only happens for absurdly large sizes; the lot cap applies
        let raw_size = risk_amount
            .checked_div(loss_per_lot)
            .unwrap_or(Decimal::MAX);

        SizingBreakdown {
            effective_risk_pct,
            risk_amount,
            unit_value,
            raw_size,
            size: self.normalize_volume(raw_size),
        }
    }

    /// Floor to the lot step, then clamp into `[lot_min, lot_max]`.
    pub fn normalize_volume(&self, raw: Decimal) -> Decimal {
        let inst = &self.instrument;
        if raw <= Decimal::ZERO || inst.lot_step <= Decimal::ZERO {
            return Decimal::ZERO;
        }

        let Some(steps) = raw.checked_div(inst.lot_step) else {
            return inst.lot_max.normalize();
        };
        let stepped = steps.floor() * inst.lot_step;
        stepped.max(inst.lot_min).min(inst.lot_max).normalize()
    }
}
