use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;

/// Alert severity levels, shared by the alert port and the ALERT event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertSeverity::Info => write!(f, "INFO"),
            AlertSeverity::Warning => write!(f, "WARNING"),
            AlertSeverity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Events fanned out by the coordinator over the broadcast bus.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum EngineEvent {
    #[serde(rename = "ENGINE_STATUS")]
    EngineStatus {
        status: String,
        connected_exchanges: Vec<String>,
        last_scan: Option<DateTime<Utc>>,
        error: Option<String>,
    },

    #[serde(rename = "POSITION_UPDATE")]
    PositionUpdate {
        position_id: String,
        status: String,
        unrealized_pnl: Option<Decimal>,
        funding_collected: Decimal,
    },

    #[serde(rename = "TRADE_EXECUTED")]
    TradeExecuted {
        position_id: String,
        exchange: String,
        side: String,
        price: Decimal,
        size: Decimal,
        fee: Decimal,
    },

    #[serde(rename = "FUNDING_RATE_UPDATE")]
    FundingRateUpdate {
        exchange: String,
        pair: String,
        rate: Decimal,
        predicted: Option<Decimal>,
        next_funding_time: DateTime<Utc>,
        interval_hours: u32,
        mark_price: Option<Decimal>,
        index_price: Option<Decimal>,
    },

    #[serde(rename = "PRICE_UPDATE")]
    PriceUpdate {
        exchange: String,
        pair: String,
        mark_price: Decimal,
        index_price: Option<Decimal>,
    },

    #[serde(rename = "OPPORTUNITY")]
    Opportunity {
        symbol: String,
        long_exchange: String,
        short_exchange: String,
        spread: Decimal,
        expected_profit: Decimal,
    },

    #[serde(rename = "ALERT")]
    Alert {
        severity: AlertSeverity,
        title: String,
        message: String,
    },

    #[serde(rename = "HEARTBEAT")]
    Heartbeat,
}

/// An event plus the UTC instant it was published.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventEnvelope {
    #[serde(flatten)]
    pub event: EngineEvent,
    pub timestamp: DateTime<Utc>,
}
