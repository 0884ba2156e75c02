//! Session counters kept by the engine and the end-of-run report.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;

use super::PnlSummary;

/// Counters updated as bars and ticks are processed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub bars_processed: u64,
    pub bars_skipped: u64,
    pub duplicate_bars: u64,
    pub ticks_processed: u64,
    pub signals: u64,
    pub signals_rejected: u64,
    pub sequences_started: u64,
    pub sequences_cancelled: u64,
    pub tranches_filled: u64,
    pub orders_failed: u64,
    pub zero_size_skips: u64,
    pub positions_closed: u64,
    pub partial_closes: u64,
    pub stops_moved: u64,
    pub gateway_failures: u64,
}

/// Final report printed when a run ends.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub symbol: String,
    pub initial_balance: Decimal,
    pub final_balance: Decimal,
    pub open_positions: usize,
    /// Mark-to-market P&L of the positions still open at the last quote
    pub unrealized_pnl: Decimal,
    pub stats: SessionStats,
    pub pnl: PnlSummary,
}

impl std::fmt::Display for SessionReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = &self.stats;
        let ret = if self.initial_balance > Decimal::ZERO {
            (self.final_balance - self.initial_balance) / self.initial_balance * dec!(100)
        } else {
            Decimal::ZERO
        };

        writeln!(f, "\n{:=^50}", format!(" SESSION {} ", self.symbol))?;
        writeln!(f, "Initial Balance:  {:.2}", self.initial_balance)?;
        writeln!(f, "Final Balance:    {:.2} ({:.2}%)", self.final_balance, ret)?;
        writeln!(f, "Open Positions:   {} (open P&L: {:.2})", self.open_positions, self.unrealized_pnl)?;
        writeln!(f)?;
        writeln!(f, "Bars:             {} (skipped: {}, duplicate: {})",
            s.bars_processed, s.bars_skipped, s.duplicate_bars)?;
        writeln!(f, "Ticks:            {}", s.ticks_processed)?;
        writeln!(f, "Signals:          {} (rejected: {})", s.signals, s.signals_rejected)?;
        writeln!(f, "Sequences:        {} (cancelled: {})", s.sequences_started, s.sequences_cancelled)?;
        writeln!(f, "Tranches Filled:  {} (failed: {}, zero size: {})",
            s.tranches_filled, s.orders_failed, s.zero_size_skips)?;
        writeln!(f, "Closes:           {} full, {} partial", s.positions_closed, s.partial_closes)?;
        writeln!(f, "Stops Moved:      {}", s.stops_moved)?;
        writeln!(f, "Gateway Failures: {}", s.gateway_failures)?;
        writeln!(f)?;
        writeln!(f, "Realized P&L:     {:.2} over {} closes", self.pnl.total_pnl, self.pnl.trades)?;
        writeln!(f, "Win Rate:         {:.1}%", self.pnl.win_rate * 100.0)?;
        writeln!(f, "Profit Factor:    {:.2}", self.pnl.profit_factor)?;
        writeln!(f, "Mean / Std Dev:   {:.2} / {:.2}", self.pnl.mean, self.pnl.std_dev)?;
        writeln!(f, "Max Drawdown:     {:.2} ({:.2}%)",
            self.pnl.max_drawdown, self.pnl.max_drawdown_pct * 100.0)?;
        writeln!(f, "{:=^50}", "")?;
        Ok(())
    }
}
