//! Order and gateway types shared by every execution backend.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{Ticket, TradeDirection};

/// Market order request for one tranche.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Client-side id, unique per request
    pub client_id: Uuid,
    pub symbol: String,
    pub direction: TradeDirection,
    /// Volume in lots
    pub volume: Decimal,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    /// Strategy tag attached to the resulting position
    pub tag: String,
}

impl OrderRequest {
    pub fn market(
        symbol: &str,
        direction: TradeDirection,
        volume: Decimal,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
        tag: &str,
    ) -> Self {
        Self {
            client_id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            direction,
            volume,
            stop_loss,
            take_profit,
            tag: tag.to_string(),
        }
    }
}

/// Fill confirmation for a placed order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderReceipt {
    pub ticket: Ticket,
    pub client_id: Uuid,
    pub fill_price: f64,
    pub volume: Decimal,
}

/// Errors surfaced by an execution gateway or position ledger.
///
/// None of these are fatal; the engine logs them and tries again on a
/// later cycle.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GatewayError {
    #[error("order rejected: {0}")]
    Rejected(String),

    #[error("gateway unreachable: {0}")]
    Unreachable(String),

    #[error("unknown ticket {0}")]
    UnknownTicket(Ticket),

    #[error("invalid volume {0}")]
    InvalidVolume(Decimal),
}

impl GatewayError {
    /// Whether a later attempt could succeed without operator action.
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Unreachable(_))
    }
}
