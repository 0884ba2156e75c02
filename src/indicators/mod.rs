//! Indicator access: the external provider interface, a feed-backed
//! implementation and the two-bar snapshot consumed by the trading core.

mod provider;
mod snapshot;

pub use provider::{FeedIndicators, IndicatorError, IndicatorKind, IndicatorProvider};
pub use snapshot::{IndicatorSnapshot, IndicatorValues};
