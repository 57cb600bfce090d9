//! Execution engine - transactional position opens and closes

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::info;
use uuid::Uuid;

use crate::error::{EngineError, ExecutionError};
use crate::ledger::{Position, PositionStatus, Trade, TradeAction};
use crate::provider::OrderExecutionProvider;
use crate::risk::ApprovedOrder;
use crate::store::{CloseTransaction, OpenTransaction, PersistenceStore};

/// Applies approved decisions against the capital ledger. Each operation is
/// a single atomic store transaction; a failure anywhere leaves cash and the
/// position set unchanged.
pub struct ExecutionEngine {
    store: Arc<dyn PersistenceStore>,
    venue: Arc<dyn OrderExecutionProvider>,
}

impl ExecutionEngine {
    pub fn new(store: Arc<dyn PersistenceStore>, venue: Arc<dyn OrderExecutionProvider>) -> Self {
        Self { store, venue }
    }

    /// Open a position (or merge a pyramid add-on into an existing one).
    ///
    /// margin = capital x size_fraction (validated upstream), notional =
    /// margin x leverage, quantity = notional / fill price. Margin plus the
    /// entry fee leave cash in one transaction.
    pub async fn open(
        &self,
        bot_id: Uuid,
        order: &ApprovedOrder,
        market_price: Decimal,
    ) -> Result<Position, EngineError> {
        let ledger = self
            .store
            .ledger(bot_id)
            .await?
            .ok_or(EngineError::Execution(ExecutionError::InsufficientData(format!(
                "no ledger for bot {bot_id}"
            ))))?;

        let notional = order.margin * order.leverage;
        if market_price <= Decimal::ZERO || notional <= Decimal::ZERO {
            return Err(EngineError::Execution(ExecutionError::InsufficientData(
                "non-positive price or notional".into(),
            )));
        }
        let quantity = notional / market_price;

        let fill = self.venue.open(&order.symbol, order.side, quantity, market_price).await?;
        let needed = order.margin + fill.fee;
        if ledger.cash < needed {
            return Err(EngineError::Execution(ExecutionError::InsufficientFunds {
                needed,
                available: ledger.cash,
            }));
        }

        let now = Utc::now();
        let position = match order.add_on_to {
            Some(position_id) => {
                let existing = self
                    .store
                    .open_positions(bot_id)
                    .await?
                    .into_iter()
                    .find(|p| p.id == position_id)
                    .ok_or(EngineError::Execution(ExecutionError::PositionNotFound(
                        position_id,
                    )))?;
                merge_add_on(existing, quantity, fill.price, order)
            }
            None => Position {
                id: Uuid::new_v4(),
                bot_id,
                symbol: order.symbol.clone(),
                side: order.side,
                quantity,
                leverage: order.leverage,
                entry_price: fill.price,
                current_price: fill.price,
                stop_loss: order.stop_loss,
                take_profit: order.take_profit,
                margin: order.margin,
                entry_count: 1,
                status: PositionStatus::Open,
                opened_at: now,
                closed_at: None,
            },
        };

        let trade = Trade {
            id: Uuid::new_v4(),
            position_id: position.id,
            bot_id,
            symbol: order.symbol.clone(),
            side: order.side,
            action: TradeAction::Entry,
            price: fill.price,
            quantity,
            fee: fill.fee,
            realized_pnl: Decimal::ZERO,
            reason: order.reasoning.clone(),
            executed_at: now,
        };

        self.store
            .apply_open(OpenTransaction {
                bot_id,
                position: position.clone(),
                trade,
                cash_delta: -(order.margin + fill.fee),
            })
            .await?;

        info!(
            bot = %bot_id,
            symbol = %order.symbol,
            side = %order.side,
            %quantity,
            price = %fill.price,
            margin = %order.margin,
            add_on = order.add_on_to.is_some(),
            "position opened"
        );
        Ok(position)
    }

    /// Close an open position at the current market price.
    ///
    /// realized PnL = (exit - entry) x quantity, sign-flipped for shorts;
    /// margin + PnL - exit fee return to cash. Closing a non-open position
    /// fails with `AlreadyClosed`.
    pub async fn close(
        &self,
        position: &Position,
        market_price: Decimal,
        reason: &str,
    ) -> Result<Trade, EngineError> {
        if !position.is_open() {
            return Err(EngineError::Execution(ExecutionError::AlreadyClosed(position.id)));
        }

        let fill = self
            .venue
            .close(&position.symbol, position.side, position.quantity, market_price)
            .await?;
        let realized_pnl = position.unrealized_pnl(fill.price);
        let now = Utc::now();

        let trade = Trade {
            id: Uuid::new_v4(),
            position_id: position.id,
            bot_id: position.bot_id,
            symbol: position.symbol.clone(),
            side: position.side,
            action: TradeAction::Exit,
            price: fill.price,
            quantity: position.quantity,
            fee: fill.fee,
            realized_pnl,
            reason: reason.to_string(),
            executed_at: now,
        };

        self.store
            .apply_close(CloseTransaction {
                bot_id: position.bot_id,
                position_id: position.id,
                exit_price: fill.price,
                trade: trade.clone(),
                cash_delta: position.margin + realized_pnl - fill.fee,
                closed_at: now,
            })
            .await?;

        info!(
            bot = %position.bot_id,
            symbol = %position.symbol,
            side = %position.side,
            price = %fill.price,
            pnl = %realized_pnl,
            reason,
            "position closed"
        );
        Ok(trade)
    }
}

/// Merge an approved add-on into the existing open position: volume-weighted
/// entry, summed quantity and margin, bumped entry count.
fn merge_add_on(
    mut position: Position,
    quantity: Decimal,
    fill_price: Decimal,
    order: &ApprovedOrder,
) -> Position {
    let total_quantity = position.quantity + quantity;
    if total_quantity > Decimal::ZERO {
        position.entry_price = (position.entry_price * position.quantity + fill_price * quantity)
            / total_quantity;
    }
    position.quantity = total_quantity;
    position.margin += order.margin;
    position.entry_count += 1;
    position.current_price = fill_price;
    position.stop_loss = order.stop_loss;
    position.take_profit = order.take_profit;
    position
}
