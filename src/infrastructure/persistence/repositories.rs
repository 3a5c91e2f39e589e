//! Row-level operations for the position lifecycle tables.
//!
//! Every function takes a `&mut SqliteConnection` so callers can compose
//! several operations inside one transaction; nothing here commits.

use crate::domain::position::{
    FundingEvent, Position, PositionStatus, Trade, TradeAction, TradeStatus,
};
use crate::domain::types::{OrderType, PositionSide};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use std::str::FromStr;

fn decimal(row: &SqliteRow, column: &str) -> Result<Decimal> {
    let raw: String = row.try_get(column)?;
    Decimal::from_str(&raw).with_context(|| format!("bad decimal in column {}", column))
}

fn opt_decimal(row: &SqliteRow, column: &str) -> Result<Option<Decimal>> {
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|s| {
        Decimal::from_str(&s).with_context(|| format!("bad decimal in column {}", column))
    })
    .transpose()
}

fn position_side(raw: &str) -> PositionSide {
    if raw == "SHORT" {
        PositionSide::Short
    } else {
        PositionSide::Long
    }
}

pub mod positions {
    use super::*;

    fn map_row(row: &SqliteRow) -> Result<Position> {
        let status: String = row.try_get("status")?;
        Ok(Position {
            id: row.try_get("id")?,
            pair: row.try_get("pair")?,
            long_exchange: row.try_get("long_exchange")?,
            short_exchange: row.try_get("short_exchange")?,
            size_usd: decimal(row, "size_usd")?,
            long_size: opt_decimal(row, "long_size")?,
            short_size: opt_decimal(row, "short_size")?,
            long_entry_price: opt_decimal(row, "long_entry_price")?,
            short_entry_price: opt_decimal(row, "short_entry_price")?,
            leverage_long: row.try_get::<i64, _>("leverage_long")? as u32,
            leverage_short: row.try_get::<i64, _>("leverage_short")? as u32,
            entry_timestamp: row.try_get("entry_timestamp")?,
            entry_funding_spread: opt_decimal(row, "entry_funding_spread")?,
            status: status.parse()?,
            close_timestamp: row.try_get("close_timestamp")?,
            realized_pnl: opt_decimal(row, "realized_pnl")?,
            funding_collected: decimal(row, "funding_collected")?,
            total_fees: decimal(row, "total_fees")?,
            long_close_price: opt_decimal(row, "long_close_price")?,
            short_close_price: opt_decimal(row, "short_close_price")?,
            notes: row.try_get("notes")?,
        })
    }

    pub async fn insert(conn: &mut SqliteConnection, position: &Position) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO positions (
                id, pair, long_exchange, short_exchange, size_usd,
                long_size, short_size, long_entry_price, short_entry_price,
                leverage_long, leverage_short, entry_timestamp,
                entry_funding_spread, status, funding_collected, total_fees, notes
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&position.id)
        .bind(&position.pair)
        .bind(&position.long_exchange)
        .bind(&position.short_exchange)
        .bind(position.size_usd.to_string())
        .bind(position.long_size.map(|d| d.to_string()))
        .bind(position.short_size.map(|d| d.to_string()))
        .bind(position.long_entry_price.map(|d| d.to_string()))
        .bind(position.short_entry_price.map(|d| d.to_string()))
        .bind(position.leverage_long as i64)
        .bind(position.leverage_short as i64)
        .bind(position.entry_timestamp)
        .bind(position.entry_funding_spread.map(|d| d.to_string()))
        .bind(position.status.to_string())
        .bind(position.funding_collected.to_string())
        .bind(position.total_fees.to_string())
        .bind(&position.notes)
        .execute(conn)
        .await
        .context("Failed to insert position")?;

        Ok(())
    }

    pub async fn get_by_id(conn: &mut SqliteConnection, id: &str) -> Result<Option<Position>> {
        let row = sqlx::query("SELECT * FROM positions WHERE id = ?")
            .bind(id)
            .fetch_optional(conn)
            .await?;
        row.as_ref().map(map_row).transpose()
    }

    pub async fn get_open(conn: &mut SqliteConnection) -> Result<Vec<Position>> {
        let rows = sqlx::query(
            "SELECT * FROM positions WHERE status = 'OPEN' ORDER BY entry_timestamp DESC",
        )
        .fetch_all(conn)
        .await?;
        rows.iter().map(map_row).collect()
    }

    pub async fn get_open_for_pair(
        conn: &mut SqliteConnection,
        pair: &str,
    ) -> Result<Option<Position>> {
        let row = sqlx::query("SELECT * FROM positions WHERE pair = ? AND status = 'OPEN'")
            .bind(pair)
            .fetch_optional(conn)
            .await?;
        row.as_ref().map(map_row).transpose()
    }

    pub async fn get_closed(
        conn: &mut SqliteConnection,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Position>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM positions
            WHERE status IN ('CLOSED', 'LIQUIDATED')
            ORDER BY close_timestamp DESC LIMIT ? OFFSET ?
            "#,
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(conn)
        .await?;
        rows.iter().map(map_row).collect()
    }

    pub async fn count_open(conn: &mut SqliteConnection) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM positions WHERE status = 'OPEN'")
            .fetch_one(conn)
            .await?;
        Ok(row.try_get("count")?)
    }

    pub async fn mark_closed(
        conn: &mut SqliteConnection,
        id: &str,
        status: PositionStatus,
        realized_pnl: Decimal,
        long_close_price: Option<Decimal>,
        short_close_price: Option<Decimal>,
        total_fees: Decimal,
        notes: Option<&str>,
        close_timestamp: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE positions SET
                status = ?, realized_pnl = ?, long_close_price = ?,
                short_close_price = ?, total_fees = ?, notes = COALESCE(?, notes),
                close_timestamp = ?
            WHERE id = ?
            "#,
        )
        .bind(status.to_string())
        .bind(realized_pnl.to_string())
        .bind(long_close_price.map(|d| d.to_string()))
        .bind(short_close_price.map(|d| d.to_string()))
        .bind(total_fees.to_string())
        .bind(notes)
        .bind(close_timestamp)
        .bind(id)
        .execute(conn)
        .await
        .context("Failed to close position")?;

        Ok(())
    }

    /// Add a funding payment to the accrued total. Decimals are stored as
    /// text, so the addition happens here rather than in SQL; callers run
    /// this inside the same transaction as the event insert.
    pub async fn add_funding(
        conn: &mut SqliteConnection,
        id: &str,
        amount: Decimal,
    ) -> Result<Decimal> {
        let row = sqlx::query("SELECT funding_collected FROM positions WHERE id = ?")
            .bind(id)
            .fetch_one(&mut *conn)
            .await
            .context("Position not found for funding update")?;
        let current = Decimal::from_str(row.try_get::<String, _>("funding_collected")?.as_str())
            .unwrap_or_default();
        let updated = current + amount;

        sqlx::query("UPDATE positions SET funding_collected = ? WHERE id = ?")
            .bind(updated.to_string())
            .bind(id)
            .execute(conn)
            .await?;

        Ok(updated)
    }

    pub async fn total_realized_pnl(conn: &mut SqliteConnection) -> Result<Decimal> {
        let rows = sqlx::query(
            "SELECT realized_pnl FROM positions WHERE status IN ('CLOSED', 'LIQUIDATED')",
        )
        .fetch_all(conn)
        .await?;

        let mut total = Decimal::ZERO;
        for row in rows {
            if let Some(raw) = row.try_get::<Option<String>, _>("realized_pnl")? {
                total += Decimal::from_str(&raw).unwrap_or_default();
            }
        }
        Ok(total)
    }

    pub async fn total_funding_collected(conn: &mut SqliteConnection) -> Result<Decimal> {
        let rows = sqlx::query("SELECT funding_collected FROM positions")
            .fetch_all(conn)
            .await?;

        let mut total = Decimal::ZERO;
        for row in rows {
            total +=
                Decimal::from_str(row.try_get::<String, _>("funding_collected")?.as_str())
                    .unwrap_or_default();
        }
        Ok(total)
    }
}

pub mod trades {
    use super::*;

    fn map_row(row: &SqliteRow) -> Result<Trade> {
        let side: String = row.try_get("side")?;
        let action: String = row.try_get("action")?;
        let order_type: String = row.try_get("order_type")?;
        let status: String = row.try_get("status")?;

        Ok(Trade {
            id: row.try_get("id")?,
            position_id: row.try_get("position_id")?,
            exchange: row.try_get("exchange")?,
            pair: row.try_get("pair")?,
            side: position_side(&side),
            action: action.parse::<TradeAction>()?,
            order_type: if order_type == "MARKET" {
                OrderType::Market
            } else {
                OrderType::Limit
            },
            price: opt_decimal(row, "price")?,
            size: decimal(row, "size")?,
            fee: decimal(row, "fee")?,
            order_id: row.try_get("order_id")?,
            status: status.parse::<TradeStatus>()?,
            created_at: row.try_get("created_at")?,
            executed_at: row.try_get("executed_at")?,
            latency_ms: row.try_get("latency_ms")?,
            error_message: row.try_get("error_message")?,
        })
    }

    pub async fn insert(conn: &mut SqliteConnection, trade: &Trade) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trades (
                id, position_id, exchange, pair, side, action, order_type,
                price, size, fee, order_id, status, created_at, executed_at,
                latency_ms, error_message
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&trade.id)
        .bind(&trade.position_id)
        .bind(&trade.exchange)
        .bind(&trade.pair)
        .bind(trade.side.to_string())
        .bind(trade.action.to_string())
        .bind(trade.order_type.to_string())
        .bind(trade.price.map(|d| d.to_string()))
        .bind(trade.size.to_string())
        .bind(trade.fee.to_string())
        .bind(&trade.order_id)
        .bind(trade.status.to_string())
        .bind(trade.created_at)
        .bind(trade.executed_at)
        .bind(trade.latency_ms)
        .bind(&trade.error_message)
        .execute(conn)
        .await
        .context("Failed to insert trade")?;

        Ok(())
    }

    pub async fn for_position(
        conn: &mut SqliteConnection,
        position_id: &str,
    ) -> Result<Vec<Trade>> {
        let rows = sqlx::query("SELECT * FROM trades WHERE position_id = ? ORDER BY created_at")
            .bind(position_id)
            .fetch_all(conn)
            .await?;
        rows.iter().map(map_row).collect()
    }

    pub async fn recent(conn: &mut SqliteConnection, limit: i64) -> Result<Vec<Trade>> {
        let rows = sqlx::query("SELECT * FROM trades ORDER BY created_at DESC LIMIT ?")
            .bind(limit)
            .fetch_all(conn)
            .await?;
        rows.iter().map(map_row).collect()
    }
}

pub mod funding_events {
    use super::*;

    fn map_row(row: &SqliteRow) -> Result<FundingEvent> {
        let side: String = row.try_get("side")?;
        Ok(FundingEvent {
            id: row.try_get("id")?,
            position_id: row.try_get("position_id")?,
            exchange: row.try_get("exchange")?,
            pair: row.try_get("pair")?,
            side: position_side(&side),
            funding_rate: decimal(row, "funding_rate")?,
            payment_usd: decimal(row, "payment_usd")?,
            position_size: decimal(row, "position_size")?,
            timestamp: row.try_get("timestamp")?,
        })
    }

    pub async fn insert(conn: &mut SqliteConnection, event: &FundingEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO funding_events (
                id, position_id, exchange, pair, side,
                funding_rate, payment_usd, position_size, timestamp
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&event.id)
        .bind(&event.position_id)
        .bind(&event.exchange)
        .bind(&event.pair)
        .bind(event.side.to_string())
        .bind(event.funding_rate.to_string())
        .bind(event.payment_usd.to_string())
        .bind(event.position_size.to_string())
        .bind(event.timestamp)
        .execute(conn)
        .await
        .context("Failed to insert funding event")?;

        Ok(())
    }

    pub async fn for_position(
        conn: &mut SqliteConnection,
        position_id: &str,
    ) -> Result<Vec<FundingEvent>> {
        let rows =
            sqlx::query("SELECT * FROM funding_events WHERE position_id = ? ORDER BY timestamp")
                .bind(position_id)
                .fetch_all(conn)
                .await?;
        rows.iter().map(map_row).collect()
    }

    pub async fn recent(conn: &mut SqliteConnection, limit: i64) -> Result<Vec<FundingEvent>> {
        let rows = sqlx::query("SELECT * FROM funding_events ORDER BY timestamp DESC LIMIT ?")
            .bind(limit)
            .fetch_all(conn)
            .await?;
        rows.iter().map(map_row).collect()
    }

    pub async fn total_for_position(
        conn: &mut SqliteConnection,
        position_id: &str,
    ) -> Result<Decimal> {
        let rows = sqlx::query("SELECT payment_usd FROM funding_events WHERE position_id = ?")
            .bind(position_id)
            .fetch_all(conn)
            .await?;

        let mut total = Decimal::ZERO;
        for row in rows {
            total += Decimal::from_str(row.try_get::<String, _>("payment_usd")?.as_str())
                .unwrap_or_default();
        }
        Ok(total)
    }
}

pub mod system_state {
    use super::*;

    pub async fn get(conn: &mut SqliteConnection, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM system_state WHERE key = ?")
            .bind(key)
            .fetch_optional(conn)
            .await?;
        Ok(row.map(|r| r.try_get("value")).transpose()?)
    }

    pub async fn set(conn: &mut SqliteConnection, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO system_state (key, value, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now())
        .execute(conn)
        .await
        .context("Failed to set system state")?;

        Ok(())
    }

    pub async fn delete(conn: &mut SqliteConnection, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM system_state WHERE key = ?")
            .bind(key)
            .execute(conn)
            .await?;
        Ok(())
    }
}
