use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// The side that closes a position opened with `self`.
    pub fn opposite(&self) -> OrderSide {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Limit,
    Market,
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderType::Limit => write!(f, "LIMIT"),
            OrderType::Market => write!(f, "MARKET"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    Long,
    Short,
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionSide::Long => write!(f, "LONG"),
            PositionSide::Short => write!(f, "SHORT"),
        }
    }
}

/// Funding rate snapshot for a perpetual contract on one venue.
///
/// `interval_hours` varies per venue (1, 2, 4 or 8); `daily_rate` is the
/// normalization used for every cross-venue comparison.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingRate {
    pub exchange: String,
    pub symbol: String,
    pub rate: Decimal,
    pub predicted_rate: Option<Decimal>,
    pub next_funding_time: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
    pub interval_hours: u32,
    pub mark_price: Option<Decimal>,
    pub index_price: Option<Decimal>,
}

impl FundingRate {
    pub fn periods_per_day(&self) -> Decimal {
        Decimal::from(24) / Decimal::from(self.interval_hours)
    }

    /// `rate × 24 / interval_hours` — the cross-venue comparison basis.
    pub fn daily_rate(&self) -> Decimal {
        self.rate * self.periods_per_day()
    }

    pub fn annualized_percent(&self) -> Decimal {
        self.daily_rate() * Decimal::from(365) * Decimal::from(100)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OrderBookLevel {
    pub price: Decimal,
    pub size: Decimal,
}

/// Order book snapshot. Bids descending, asks ascending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBook {
    pub exchange: String,
    pub symbol: String,
    pub bids: Vec<OrderBookLevel>,
    pub asks: Vec<OrderBookLevel>,
    pub timestamp: DateTime<Utc>,
}

impl OrderBook {
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first().map(|l| l.price)
    }

    pub fn mid_price(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid + ask) / Decimal::from(2)),
            _ => None,
        }
    }

    pub fn spread(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some(ask - bid),
            _ => None,
        }
    }

    /// Total size across the top `levels` of one side.
    pub fn depth(&self, side: OrderSide, levels: usize) -> Decimal {
        let book = match side {
            OrderSide::Buy => &self.bids,
            OrderSide::Sell => &self.asks,
        };
        book.iter().take(levels).map(|l| l.size).sum()
    }
}

/// Order to be placed on a venue. Limit orders require a price.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub size: Decimal,
    pub price: Option<Decimal>,
    pub reduce_only: bool,
}

impl Order {
    pub fn limit(symbol: impl Into<String>, side: OrderSide, size: Decimal, price: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type: OrderType::Limit,
            size,
            price: Some(price),
            reduce_only: false,
        }
    }

    pub fn market_reduce_only(symbol: impl Into<String>, side: OrderSide, size: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type: OrderType::Market,
            size,
            price: None,
            reduce_only: true,
        }
    }
}

/// Result of an order placement or status query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    pub order_id: String,
    pub exchange: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub status: OrderStatus,
    pub size: Decimal,
    pub filled_size: Decimal,
    pub price: Option<Decimal>,
    pub average_price: Option<Decimal>,
    pub fee: Decimal,
    pub fee_currency: String,
    pub timestamp: DateTime<Utc>,
}

impl OrderResult {
    pub fn is_filled(&self) -> bool {
        self.status == OrderStatus::Filled
    }

    pub fn is_open(&self) -> bool {
        matches!(
            self.status,
            OrderStatus::Pending | OrderStatus::Open | OrderStatus::PartiallyFilled
        )
    }

    /// Fill price preferred for bookkeeping.
    pub fn effective_price(&self) -> Option<Decimal> {
        self.average_price.or(self.price)
    }
}

/// Live position as reported by a venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenuePosition {
    pub exchange: String,
    pub symbol: String,
    pub side: PositionSide,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub mark_price: Decimal,
    pub liquidation_price: Option<Decimal>,
    pub unrealized_pnl: Decimal,
    pub leverage: u32,
    pub margin_type: String,
    pub timestamp: DateTime<Utc>,
}

impl VenuePosition {
    pub fn notional_value(&self) -> Decimal {
        self.size * self.mark_price
    }
}

/// Account fee tier on a venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeTier {
    pub exchange: String,
    pub tier: String,
    pub maker_fee: Decimal,
    pub taker_fee: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueBalance {
    pub currency: String,
    pub total: Decimal,
    pub free: Decimal,
    pub used: Decimal,
}
