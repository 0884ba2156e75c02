//! In-process paper broker: fills at the last quote, tracks positions and
//! realized P&L in memory.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info};

use crate::models::{PositionRecord, Quote, Ticket, TradeDirection};
use crate::trading::InstrumentSpec;

use super::{ExecutionGateway, GatewayError, OrderReceipt, OrderRequest, PositionLedger};

/// A fully or partially closed slice of a position.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClosedTrade {
    pub ticket: Ticket,
    pub direction: TradeDirection,
    pub volume: Decimal,
    pub open_price: f64,
    pub close_price: f64,
    pub pnl: Decimal,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

/// Paper execution backend.
pub struct PaperBroker {
    instrument: InstrumentSpec,
    initial_balance: Decimal,
    balance: Decimal,
    quote: Option<Quote>,
    clock: DateTime<Utc>,
    next_ticket: u64,
    positions: BTreeMap<Ticket, PositionRecord>,
    closed: Vec<ClosedTrade>,
}

impl PaperBroker {
    pub fn new(instrument: InstrumentSpec, initial_balance: Decimal) -> Self {
        Self {
            instrument,
            initial_balance,
            balance: initial_balance,
            quote: None,
            clock: DateTime::<Utc>::MIN_UTC,
            next_ticket: 1,
            positions: BTreeMap::new(),
            closed: Vec::new(),
        }
    }

    pub fn initial_balance(&self) -> Decimal {
        self.initial_balance
    }

    pub fn closed_trades(&self) -> &[ClosedTrade] {
        &self.closed
    }

    pub fn open_count(&self) -> usize {
        self.positions.len()
    }

    /// Advance the paper clock and price. Broker-side stops and targets
    /// touched by the new quote are filled at that quote.
    pub fn set_quote(&mut self, quote: Quote, time: DateTime<Utc>) {
        self.quote = Some(quote);
        if time > self.clock {
            self.clock = time;
        }

        let triggered: Vec<Ticket> = self
            .positions
            .values()
            .filter(|p| {
                let price = quote.exit_price(p.direction);
                let target_hit = p
                    .take_profit
                    .map(|tp| p.direction.favourable(tp, price) >= 0.0)
                    .unwrap_or(false);
                p.stop_breached(price) || target_hit
            })
            .map(|p| p.ticket)
            .collect();

        for ticket in triggered {
            if let Some(pos) = self.positions.remove(&ticket) {
                info!(ticket = %ticket, direction = %pos.direction, "Broker-side stop/target filled");
                let volume = pos.volume;
                self.settle(pos, volume, quote);
            }
        }
    }

    /// Unrealized P&L of all open positions at the last quote.
    pub fn unrealized_pnl(&self) -> Decimal {
        let Some(quote) = self.quote else {
            return Decimal::ZERO;
        };
        self.positions
            .values()
            .map(|p| self.pnl_at(p, p.volume, quote.exit_price(p.direction)))
            .sum()
    }

    fn pnl_at(&self, pos: &PositionRecord, volume: Decimal, price: f64) -> Decimal {
        let distance = Decimal::from_f64(pos.profit_distance(price)).unwrap_or(Decimal::ZERO);
        let unit_value = self.instrument.unit_value().unwrap_or(Decimal::ZERO);
        distance * volume * unit_value
    }

    fn settle(&mut self, pos: PositionRecord, volume: Decimal, quote: Quote) {
        let close_price = quote.exit_price(pos.direction);
        let pnl = self.pnl_at(&pos, volume, close_price);
        self.balance += pnl;

        self.closed.push(ClosedTrade {
            ticket: pos.ticket,
            direction: pos.direction,
            volume,
            open_price: pos.open_price,
            close_price,
            pnl,
            opened_at: pos.open_time,
            closed_at: self.clock,
        });
    }

    fn current_quote(&self) -> Result<Quote, GatewayError> {
        self.quote
            .ok_or_else(|| GatewayError::Unreachable("no quote received yet".to_string()))
    }
}

impl ExecutionGateway for PaperBroker {
    fn place_order(&mut self, request: &OrderRequest) -> Result<OrderReceipt, GatewayError> {
        if request.volume <= Decimal::ZERO {
            return Err(GatewayError::InvalidVolume(request.volume));
        }
        if request.direction.is_none() {
            return Err(GatewayError::Rejected("order has no direction".to_string()));
        }

        let quote = self.current_quote()?;
        let fill_price = quote.entry_price(request.direction);
        let ticket = Ticket(self.next_ticket);
        self.next_ticket += 1;

        self.positions.insert(
            ticket,
            PositionRecord {
                ticket,
                direction: request.direction,
                volume: request.volume,
                open_price: fill_price,
                stop_loss: request.stop_loss,
                take_profit: request.take_profit,
                open_time: self.clock,
                bars_under_threshold: 0,
                tag: request.tag.clone(),
            },
        );

        debug!(ticket = %ticket, client_id = %request.client_id, price = fill_price, "Paper fill");
        Ok(OrderReceipt {
            ticket,
            client_id: request.client_id,
            fill_price,
            volume: request.volume,
        })
    }

    fn close_position(&mut self, ticket: Ticket, fraction: Decimal) -> Result<(), GatewayError> {
        if fraction <= Decimal::ZERO || fraction > Decimal::ONE {
            return Err(GatewayError::InvalidVolume(fraction));
        }
        let quote = self.current_quote()?;
        let Some(mut pos) = self.positions.remove(&ticket) else {
            return Err(GatewayError::UnknownTicket(ticket));
        };

        let inst = &self.instrument;
        let stepped = (pos.volume * fraction / inst.lot_step).floor() * inst.lot_step;
        let close_volume = stepped.max(inst.lot_min).min(pos.volume);
        let remainder = pos.volume - close_volume;

        if remainder < inst.lot_min {
            let volume = pos.volume;
            self.settle(pos, volume, quote);
            return Ok(());
        }

        let slice = pos.clone();
        self.settle(slice, close_volume, quote);
        pos.volume = remainder;
        self.positions.insert(ticket, pos);
        Ok(())
    }

    fn modify_stops(
        &mut self,
        ticket: Ticket,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    ) -> Result<(), GatewayError> {
        let pos = self
            .positions
            .get_mut(&ticket)
            .ok_or(GatewayError::UnknownTicket(ticket))?;
        pos.stop_loss = stop_loss;
        pos.take_profit = take_profit;
        Ok(())
    }
}

impl PositionLedger for PaperBroker {
    fn open_positions(&self, tag: &str) -> Result<Vec<PositionRecord>, GatewayError> {
        Ok(self
            .positions
            .values()
            .filter(|p| p.tag == tag)
            .cloned()
            .collect())
    }

    fn balance(&self) -> Result<Decimal, GatewayError> {
        Ok(self.balance)
    }
}
