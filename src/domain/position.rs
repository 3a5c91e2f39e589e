use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::domain::types::{OrderType, PositionSide};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionStatus {
    Open,
    Closed,
    Liquidated,
}

impl PositionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PositionStatus::Closed | PositionStatus::Liquidated)
    }
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionStatus::Open => write!(f, "OPEN"),
            PositionStatus::Closed => write!(f, "CLOSED"),
            PositionStatus::Liquidated => write!(f, "LIQUIDATED"),
        }
    }
}

impl FromStr for PositionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OPEN" => Ok(PositionStatus::Open),
            "CLOSED" => Ok(PositionStatus::Closed),
            "LIQUIDATED" => Ok(PositionStatus::Liquidated),
            _ => anyhow::bail!("unknown position status: {}", s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeAction {
    Open,
    Close,
}

impl fmt::Display for TradeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeAction::Open => write!(f, "OPEN"),
            TradeAction::Close => write!(f, "CLOSE"),
        }
    }
}

impl FromStr for TradeAction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OPEN" => Ok(TradeAction::Open),
            "CLOSE" => Ok(TradeAction::Close),
            _ => anyhow::bail!("unknown trade action: {}", s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeStatus {
    Pending,
    Filled,
    Cancelled,
    Failed,
}

impl fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeStatus::Pending => write!(f, "PENDING"),
            TradeStatus::Filled => write!(f, "FILLED"),
            TradeStatus::Cancelled => write!(f, "CANCELLED"),
            TradeStatus::Failed => write!(f, "FAILED"),
        }
    }
}

impl FromStr for TradeStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TradeStatus::Pending),
            "FILLED" => Ok(TradeStatus::Filled),
            "CANCELLED" => Ok(TradeStatus::Cancelled),
            "FAILED" => Ok(TradeStatus::Failed),
            _ => anyhow::bail!("unknown trade status: {}", s),
        }
    }
}

/// A hedged two-leg position: long on one venue, short on another.
///
/// Created only on a successful two-leg entry; reaches a terminal status
/// (CLOSED or LIQUIDATED) exactly once. At most one non-terminal position
/// exists per pair — enforced in the database with a partial unique index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub pair: String,
    pub long_exchange: String,
    pub short_exchange: String,
    pub size_usd: Decimal,
    pub long_size: Option<Decimal>,
    pub short_size: Option<Decimal>,
    pub long_entry_price: Option<Decimal>,
    pub short_entry_price: Option<Decimal>,
    pub leverage_long: u32,
    pub leverage_short: u32,
    pub entry_timestamp: DateTime<Utc>,
    pub entry_funding_spread: Option<Decimal>,
    pub status: PositionStatus,
    pub close_timestamp: Option<DateTime<Utc>>,
    pub realized_pnl: Option<Decimal>,
    pub funding_collected: Decimal,
    pub total_fees: Decimal,
    pub long_close_price: Option<Decimal>,
    pub short_close_price: Option<Decimal>,
    pub notes: Option<String>,
}

impl Position {
    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    /// Mark-to-market P&L at the given prices, including funding and fees.
    pub fn unrealized_pnl(
        &self,
        long_current_price: Decimal,
        short_current_price: Decimal,
    ) -> Decimal {
        let (Some(long_entry), Some(short_entry)) = (self.long_entry_price, self.short_entry_price)
        else {
            return Decimal::ZERO;
        };
        let (Some(long_size), Some(short_size)) = (self.long_size, self.short_size) else {
            return Decimal::ZERO;
        };

        let long_pnl = (long_current_price - long_entry) * long_size;
        let short_pnl = (short_entry - short_current_price) * short_size;
        long_pnl + short_pnl + self.funding_collected - self.total_fees
    }
}

/// One executed leg order, entry or exit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    pub position_id: String,
    pub exchange: String,
    pub pair: String,
    pub side: PositionSide,
    pub action: TradeAction,
    pub order_type: OrderType,
    pub price: Option<Decimal>,
    pub size: Decimal,
    pub fee: Decimal,
    pub order_id: Option<String>,
    pub status: TradeStatus,
    pub created_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
    pub latency_ms: Option<i64>,
    pub error_message: Option<String>,
}

/// A funding settlement credited to or debited from a position.
///
/// `payment_usd` is signed from the position's perspective: positive means
/// the position received the payment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingEvent {
    pub id: String,
    pub position_id: String,
    pub exchange: String,
    pub pair: String,
    pub side: PositionSide,
    pub funding_rate: Decimal,
    pub payment_usd: Decimal,
    pub position_size: Decimal,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn open_position() -> Position {
        Position {
            id: "p1".to_string(),
            pair: "BTC/USDT:USDT".to_string(),
            long_exchange: "alpha".to_string(),
            short_exchange: "beta".to_string(),
            size_usd: dec!(10000),
            long_size: Some(dec!(0.2)),
            short_size: Some(dec!(0.2)),
            long_entry_price: Some(dec!(50000)),
            short_entry_price: Some(dec!(50010)),
            leverage_long: 5,
            leverage_short: 5,
            entry_timestamp: Utc::now(),
            entry_funding_spread: Some(dec!(0.0025)),
            status: PositionStatus::Open,
            close_timestamp: None,
            realized_pnl: None,
            funding_collected: dec!(12.50),
            total_fees: dec!(8),
            long_close_price: None,
            short_close_price: None,
            notes: None,
        }
    }

    #[test]
    fn unrealized_pnl_includes_funding_and_fees() {
        let position = open_position();
        // Long leg +100 (0.2 × 500), short leg -98 (0.2 × 490), +12.50 funding, -8 fees
        let pnl = position.unrealized_pnl(dec!(50500), dec!(50500));
        assert_eq!(pnl, dec!(100) - dec!(98) + dec!(12.50) - dec!(8));
    }

    #[test]
    fn unrealized_pnl_is_zero_without_entry_data() {
        let mut position = open_position();
        position.long_entry_price = None;
        assert_eq!(position.unrealized_pnl(dec!(1), dec!(1)), Decimal::ZERO);
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            PositionStatus::Open,
            PositionStatus::Closed,
            PositionStatus::Liquidated,
        ] {
            assert_eq!(status.to_string().parse::<PositionStatus>().unwrap(), status);
        }
        assert!(PositionStatus::Closed.is_terminal());
        assert!(!PositionStatus::Open.is_terminal());
    }
}
