//! Realized P&L summary: win rate, profit factor, drawdown, dispersion.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use statrs::statistics::Statistics;

/// Summary of a series of realized P&Ls.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PnlSummary {
    pub trades: u32,
    pub winning: u32,
    pub losing: u32,
    pub total_pnl: Decimal,
    pub win_rate: f64,
    pub avg_win: Decimal,
    pub avg_loss: Decimal,
    pub profit_factor: f64,
    pub expectancy: Decimal,
    /// Mean realized P&L per close
    pub mean: f64,
    /// Sample standard deviation of realized P&Ls
    pub std_dev: f64,
    /// Largest peak-to-trough drop of cumulative P&L, account currency
    pub max_drawdown: Decimal,
    /// Same drop relative to the peak (starting balance included)
    pub max_drawdown_pct: f64,
}

/// Calculator for session P&L statistics.
pub struct MetricsCalculator;

impl MetricsCalculator {
    /// Summarize realized P&Ls in close order, starting from `initial_balance`.
    pub fn summarize(pnls: &[Decimal], initial_balance: Decimal) -> PnlSummary {
        let mut summary = PnlSummary::default();
        if pnls.is_empty() {
            return summary;
        }

        let (wins, losses): (Vec<Decimal>, Vec<Decimal>) =
            pnls.iter().partition(|&&p| p > Decimal::ZERO);

        summary.trades = pnls.len() as u32;
        summary.winning = wins.len() as u32;
        summary.losing = losses.len() as u32;
        summary.total_pnl = pnls.iter().copied().sum();
        summary.win_rate = wins.len() as f64 / pnls.len() as f64;

        if !wins.is_empty() {
            summary.avg_win = wins.iter().copied().sum::<Decimal>() / Decimal::from(wins.len() as u32);
        }
        if !losses.is_empty() {
            summary.avg_loss = losses.iter().map(|l| l.abs()).sum::<Decimal>()
                / Decimal::from(losses.len() as u32);
        }

        let gross_profit: Decimal = wins.iter().copied().sum();
        let gross_loss: Decimal = losses.iter().map(|l| l.abs()).sum();
        if gross_loss > Decimal::ZERO {
            summary.profit_factor =
                gross_profit.to_f64().unwrap_or(0.0) / gross_loss.to_f64().unwrap_or(1.0);
        }

        summary.expectancy = summary.total_pnl / Decimal::from(summary.trades);

        let values: Vec<f64> = pnls.iter().filter_map(|p| p.to_f64()).collect();
        summary.mean = values.clone().mean();
        if values.len() >= 2 {
            summary.std_dev = values.std_dev();
        }

        Self::drawdown(&mut summary, pnls, initial_balance);
        summary
    }

    fn drawdown(summary: &mut PnlSummary, pnls: &[Decimal], initial_balance: Decimal) {
        let mut equity = initial_balance;
        let mut peak = initial_balance;

        for pnl in pnls {
            equity += pnl;
            if equity > peak {
                peak = equity;
            }

            let dd = peak - equity;
            if dd > summary.max_drawdown {
                summary.max_drawdown = dd;
            }
            if peak > Decimal::ZERO {
                let dd_pct = dd.to_f64().unwrap_or(0.0) / peak.to_f64().unwrap_or(1.0);
                if dd_pct > summary.max_drawdown_pct {
                    summary.max_drawdown_pct = dd_pct;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_summarize_pnls() {
        let pnls = vec![
            dec!(100), // Win
            dec!(-50), // Loss
            dec!(200), // Win
            dec!(-30), // Loss
            dec!(150), // Win
        ];
        let s = MetricsCalculator::summarize(&pnls, dec!(1000));

        assert_eq!(s.winning, 3);
        assert_eq!(s.losing, 2);
        assert_eq!(s.total_pnl, dec!(370));
        assert_eq!(s.avg_loss, dec!(40));
        assert!((s.win_rate - 0.6).abs() < 0.001);
        assert!((s.profit_factor - 450.0 / 80.0).abs() < 1e-9);
        assert!((s.mean - 74.0).abs() < 1e-9);
        assert!(s.std_dev > 0.0);
    }

    #[test]
    fn test_drawdown_from_balance() {
        let pnls = vec![
            dec!(100), // Equity: 1100, Peak: 1100
            dec!(-80), // Equity: 1020
            dec!(-20), // Equity: 1000, DD: 100
            dec!(150), // Equity: 1150, Peak: 1150
        ];
        let s = MetricsCalculator::summarize(&pnls, dec!(1000));

        assert_eq!(s.max_drawdown, dec!(100));
        assert!((s.max_drawdown_pct - 100.0 / 1100.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_series() {
        let s = MetricsCalculator::summarize(&[], dec!(1000));
        assert_eq!(s, PnlSummary::default());
    }
}
