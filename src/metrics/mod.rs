//! Session statistics and realized P&L summaries.

mod calculator;
mod stats;

pub use calculator::{MetricsCalculator, PnlSummary};
pub use stats::{SessionReport, SessionStats};
