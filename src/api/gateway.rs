//! Broker-facing seams: order execution and the tagged position ledger.
//!
//! Calls are synchronous. A failed call is reported back to the caller and
//! never retried inside the gateway.

use rust_decimal::Decimal;

use crate::models::{PositionRecord, Ticket};

use super::{GatewayError, OrderReceipt, OrderRequest};

/// Places, closes and modifies orders.
pub trait ExecutionGateway {
    fn place_order(&mut self, request: &OrderRequest) -> Result<OrderReceipt, GatewayError>;

    /// Close `fraction` (0, 1] of the position's current volume.
    fn close_position(&mut self, ticket: Ticket, fraction: Decimal) -> Result<(), GatewayError>;

    /// Replace the position's stop and target.
    fn modify_stops(
        &mut self,
        ticket: Ticket,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    ) -> Result<(), GatewayError>;
}

/// Read-only view of the account.
pub trait PositionLedger {
    /// Open positions carrying `tag`.
    fn open_positions(&self, tag: &str) -> Result<Vec<PositionRecord>, GatewayError>;

    /// Account balance in account currency.
    fn balance(&self) -> Result<Decimal, GatewayError>;
}

/// A broker that both executes and reports.
pub trait Broker: ExecutionGateway + PositionLedger {}

impl<T: ExecutionGateway + PositionLedger> Broker for T {}
