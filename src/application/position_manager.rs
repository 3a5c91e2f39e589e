//! Durable position lifecycle.
//!
//! Every mutating operation runs inside one repository transaction that
//! commits before the call returns, so observers never see a half-recorded
//! lifecycle step (a funding event without its accrual, a close without its
//! trades).

use crate::application::detector::Opportunity;
use crate::application::executor::ExecutionResult;
use crate::domain::errors::PositionError;
use crate::domain::ports::ExchangeAdapter;
use crate::domain::position::{
    FundingEvent, Position, PositionStatus, Trade, TradeAction, TradeStatus,
};
use crate::domain::types::{OrderResult, PositionSide};
use crate::infrastructure::persistence::database::Database;
use crate::infrastructure::persistence::repositories::{funding_events, positions, trades};
use anyhow::Result;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

const DEFAULT_LEVERAGE: u32 = 5;

pub struct PositionManager {
    db: Database,
    exchanges: HashMap<String, Arc<dyn ExchangeAdapter>>,
}

impl PositionManager {
    pub fn new(db: Database, exchanges: HashMap<String, Arc<dyn ExchangeAdapter>>) -> Self {
        Self { db, exchanges }
    }

    /// Persist a new position from a successful two-leg entry.
    pub async fn create_position(
        &self,
        opportunity: &Opportunity,
        execution: &ExecutionResult,
        size_usd: Decimal,
    ) -> Result<Position> {
        let (true, Some(long_order), Some(short_order)) = (
            execution.success,
            execution.long_order.as_ref(),
            execution.short_order.as_ref(),
        ) else {
            return Err(PositionError::InvalidExecutionResult.into());
        };

        let leverage_long = self
            .venue_leverage(&opportunity.long_exchange, &opportunity.symbol)
            .await;
        let leverage_short = self
            .venue_leverage(&opportunity.short_exchange, &opportunity.symbol)
            .await;

        let position = Position {
            id: Uuid::new_v4().to_string(),
            pair: opportunity.symbol.clone(),
            long_exchange: opportunity.long_exchange.clone(),
            short_exchange: opportunity.short_exchange.clone(),
            size_usd,
            long_size: Some(long_order.filled_size),
            short_size: Some(short_order.filled_size),
            long_entry_price: long_order.effective_price(),
            short_entry_price: short_order.effective_price(),
            leverage_long,
            leverage_short,
            entry_timestamp: Utc::now(),
            entry_funding_spread: Some(opportunity.spread),
            status: PositionStatus::Open,
            close_timestamp: None,
            realized_pnl: None,
            funding_collected: Decimal::ZERO,
            total_fees: long_order.fee + short_order.fee,
            long_close_price: None,
            short_close_price: None,
            notes: None,
        };

        let mut tx = self.db.begin().await?;

        // The partial unique index backs this up; checking first gives the
        // caller a typed invariant error instead of a constraint failure.
        if positions::get_open_for_pair(&mut tx, &opportunity.symbol)
            .await?
            .is_some()
        {
            return Err(PositionError::PairOccupied(opportunity.symbol.clone()).into());
        }

        positions::insert(&mut tx, &position).await?;
        trades::insert(
            &mut tx,
            &leg_trade(
                &position.id,
                long_order,
                &opportunity.long_exchange,
                PositionSide::Long,
                TradeAction::Open,
            ),
        )
        .await?;
        trades::insert(
            &mut tx,
            &leg_trade(
                &position.id,
                short_order,
                &opportunity.short_exchange,
                PositionSide::Short,
                TradeAction::Open,
            ),
        )
        .await?;

        tx.commit().await?;

        info!(
            "Position created: {} {} long={} short={} size=${}",
            position.id,
            position.pair,
            position.long_exchange,
            position.short_exchange,
            size_usd
        );

        Ok(position)
    }

    /// Close a position and settle realized P&L:
    /// `(long_close − long_entry)·long_size + (short_entry − short_close)·short_size
    ///  + funding_collected − total_fees`.
    pub async fn close_position(
        &self,
        position_id: &str,
        execution: &ExecutionResult,
    ) -> Result<Position> {
        let mut tx = self.db.begin().await?;

        let position = positions::get_by_id(&mut tx, position_id)
            .await?
            .ok_or_else(|| PositionError::NotFound(position_id.to_string()))?;
        if !position.is_open() {
            return Err(PositionError::NotOpen(position_id.to_string()).into());
        }

        let mut close_fees = Decimal::ZERO;
        let mut long_close_price = None;
        let mut short_close_price = None;

        if let Some(long_order) = &execution.long_order {
            long_close_price = long_order.effective_price();
            close_fees += long_order.fee;
            trades::insert(
                &mut tx,
                &leg_trade(
                    position_id,
                    long_order,
                    &position.long_exchange,
                    PositionSide::Long,
                    TradeAction::Close,
                ),
            )
            .await?;
        }
        if let Some(short_order) = &execution.short_order {
            short_close_price = short_order.effective_price();
            close_fees += short_order.fee;
            trades::insert(
                &mut tx,
                &leg_trade(
                    position_id,
                    short_order,
                    &position.short_exchange,
                    PositionSide::Short,
                    TradeAction::Close,
                ),
            )
            .await?;
        }

        let mut long_pnl = Decimal::ZERO;
        if let (Some(entry), Some(close), Some(size)) =
            (position.long_entry_price, long_close_price, position.long_size)
        {
            long_pnl = (close - entry) * size;
        }
        let mut short_pnl = Decimal::ZERO;
        if let (Some(entry), Some(close), Some(size)) = (
            position.short_entry_price,
            short_close_price,
            position.short_size,
        ) {
            short_pnl = (entry - close) * size;
        }

        let total_fees = position.total_fees + close_fees;
        let realized_pnl = long_pnl + short_pnl + position.funding_collected - total_fees;

        positions::mark_closed(
            &mut tx,
            position_id,
            PositionStatus::Closed,
            realized_pnl,
            long_close_price,
            short_close_price,
            total_fees,
            None,
            Utc::now(),
        )
        .await?;

        tx.commit().await?;

        info!(
            "Position closed: {} realized_pnl={} funding_collected={}",
            position_id, realized_pnl, position.funding_collected
        );

        let mut conn = self.db.pool.acquire().await?;
        positions::get_by_id(&mut conn, position_id)
            .await?
            .ok_or_else(|| PositionError::NotFound(position_id.to_string()).into())
    }

    /// Terminal state for a position that lost a leg to liquidation.
    pub async fn mark_liquidated(
        &self,
        position_id: &str,
        liquidated_exchange: &str,
        surviving_close: Option<&ExecutionResult>,
    ) -> Result<Position> {
        let mut tx = self.db.begin().await?;

        let position = positions::get_by_id(&mut tx, position_id)
            .await?
            .ok_or_else(|| PositionError::NotFound(position_id.to_string()))?;

        let mut realized_pnl = position.funding_collected - position.total_fees;
        let mut long_close_price = None;
        let mut short_close_price = None;

        if let Some(close) = surviving_close.filter(|c| c.success) {
            if let Some(order) = &close.long_order
                && let (Some(entry), Some(price)) =
                    (position.long_entry_price, order.average_price)
            {
                realized_pnl += (price - entry) * order.filled_size;
                long_close_price = Some(price);
            }
            if let Some(order) = &close.short_order
                && let (Some(entry), Some(price)) =
                    (position.short_entry_price, order.average_price)
            {
                realized_pnl += (entry - price) * order.filled_size;
                short_close_price = Some(price);
            }
        }

        positions::mark_closed(
            &mut tx,
            position_id,
            PositionStatus::Liquidated,
            realized_pnl,
            long_close_price,
            short_close_price,
            position.total_fees,
            Some(&format!("Liquidated on {}", liquidated_exchange)),
            Utc::now(),
        )
        .await?;

        tx.commit().await?;

        warn!(
            "Position liquidated: {} on {} realized_pnl={}",
            position_id, liquidated_exchange, realized_pnl
        );

        let mut conn = self.db.pool.acquire().await?;
        positions::get_by_id(&mut conn, position_id)
            .await?
            .ok_or_else(|| PositionError::NotFound(position_id.to_string()).into())
    }

    /// Record one funding settlement. The event row and the accrual update
    /// commit together.
    pub async fn record_funding_payment(
        &self,
        position_id: &str,
        exchange: &str,
        side: PositionSide,
        funding_rate: Decimal,
        payment_usd: Decimal,
        position_size: Decimal,
    ) -> Result<FundingEvent> {
        let mut tx = self.db.begin().await?;

        let position = positions::get_by_id(&mut tx, position_id)
            .await?
            .ok_or_else(|| PositionError::NotFound(position_id.to_string()))?;

        let event = FundingEvent {
            id: Uuid::new_v4().to_string(),
            position_id: position_id.to_string(),
            exchange: exchange.to_string(),
            pair: position.pair.clone(),
            side,
            funding_rate,
            payment_usd,
            position_size,
            timestamp: Utc::now(),
        };

        funding_events::insert(&mut tx, &event).await?;
        let accrued = positions::add_funding(&mut tx, position_id, payment_usd).await?;

        tx.commit().await?;

        info!(
            "Funding recorded: {} on {} rate={} payment={} accrued={}",
            position_id, exchange, funding_rate, payment_usd, accrued
        );

        Ok(event)
    }

    pub async fn get_open_positions(&self) -> Result<Vec<Position>> {
        let mut conn = self.db.pool.acquire().await?;
        positions::get_open(&mut conn).await
    }

    pub async fn get_position(&self, position_id: &str) -> Result<Option<Position>> {
        let mut conn = self.db.pool.acquire().await?;
        positions::get_by_id(&mut conn, position_id).await
    }

    pub async fn get_position_for_pair(&self, pair: &str) -> Result<Option<Position>> {
        let mut conn = self.db.pool.acquire().await?;
        positions::get_open_for_pair(&mut conn, pair).await
    }

    pub async fn get_trades(&self, position_id: &str) -> Result<Vec<Trade>> {
        let mut conn = self.db.pool.acquire().await?;
        trades::for_position(&mut conn, position_id).await
    }

    pub async fn get_funding_events(&self, position_id: &str) -> Result<Vec<FundingEvent>> {
        let mut conn = self.db.pool.acquire().await?;
        funding_events::for_position(&mut conn, position_id).await
    }

    /// Compare every locally OPEN position against venue truth. Read-only;
    /// callers decide what to do with the issues.
    pub async fn reconcile_with_exchanges(&self) -> Result<Vec<String>> {
        let mut issues = Vec::new();
        let open = self.get_open_positions().await?;

        for position in &open {
            for (exchange, side) in [
                (&position.long_exchange, "Long"),
                (&position.short_exchange, "Short"),
            ] {
                match self.exchanges.get(exchange) {
                    Some(venue) => match venue.get_position(&position.pair).await {
                        Ok(Some(venue_position)) if !venue_position.size.is_zero() => {}
                        Ok(_) => issues.push(format!(
                            "Position {}: {} leg missing on {}",
                            position.id, side, exchange
                        )),
                        Err(e) => issues.push(format!(
                            "Position {}: error checking {} leg on {} - {}",
                            position.id, side, exchange, e
                        )),
                    },
                    None => issues.push(format!(
                        "Position {}: {} leg references unknown exchange {}",
                        position.id, side, exchange
                    )),
                }
            }
        }

        if issues.is_empty() {
            info!("Reconciliation OK: {} open positions checked", open.len());
        } else {
            warn!("Reconciliation found {} issues: {:?}", issues.len(), issues);
        }

        Ok(issues)
    }

    async fn venue_leverage(&self, exchange: &str, symbol: &str) -> u32 {
        let Some(venue) = self.exchanges.get(exchange) else {
            return DEFAULT_LEVERAGE;
        };
        match venue.get_position(symbol).await {
            Ok(Some(position)) => position.leverage,
            _ => DEFAULT_LEVERAGE,
        }
    }
}

fn leg_trade(
    position_id: &str,
    order: &OrderResult,
    exchange: &str,
    side: PositionSide,
    action: TradeAction,
) -> Trade {
    Trade {
        id: Uuid::new_v4().to_string(),
        position_id: position_id.to_string(),
        exchange: exchange.to_string(),
        pair: order.symbol.clone(),
        side,
        action,
        order_type: order.order_type,
        price: order.effective_price(),
        size: order.filled_size,
        fee: order.fee,
        order_id: Some(order.order_id.clone()),
        status: if order.is_filled() {
            TradeStatus::Filled
        } else {
            TradeStatus::Failed
        },
        created_at: Utc::now(),
        executed_at: Some(order.timestamp),
        latency_ms: None,
        error_message: None,
    }
}
