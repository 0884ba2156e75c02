//! Data models for bars, ticks, trade direction and tagged positions.

mod bar;
mod position;
mod trade;

pub use bar::{Bar, Quote, Tick, Timeframe};
pub use position::{PositionCounts, PositionRecord, Ticket};
pub use trade::TradeDirection;
