//! Trade direction shared by the signal detector, sequencer and exit manager.

use serde::{Deserialize, Serialize};

/// Net direction of a sequence or a position.
///
/// Long/short arithmetic is written once against [`TradeDirection::sign`]
/// (`profit = sign * (current - open)`) instead of mirrored branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeDirection {
    #[default]
    None,
    Long,
    Short,
}

impl TradeDirection {
    /// +1 for long, -1 for short, 0 when flat.
    pub fn sign(&self) -> f64 {
        match self {
            TradeDirection::Long => 1.0,
            TradeDirection::Short => -1.0,
            TradeDirection::None => 0.0,
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            TradeDirection::Long => TradeDirection::Short,
            TradeDirection::Short => TradeDirection::Long,
            TradeDirection::None => TradeDirection::None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, TradeDirection::None)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TradeDirection::Long => "LONG",
            TradeDirection::Short => "SHORT",
            TradeDirection::None => "NONE",
        }
    }

    /// Signed distance `price - reference` measured in this direction's favour.
    pub fn favourable(&self, reference: f64, price: f64) -> f64 {
        self.sign() * (price - reference)
    }

    /// True when `candidate` is a tighter stop than `current` for this direction.
    pub fn tightens(&self, current: Option<f64>, candidate: f64) -> bool {
        match current {
            None => true,
            Some(level) => self.sign() * (candidate - level) > 0.0,
        }
    }
}

impl std::fmt::Display for TradeDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
