use crate::domain::events::AlertSeverity;
use crate::domain::position::Position;
use crate::domain::types::{
    FeeTier, FundingRate, Order, OrderBook, OrderResult, VenueBalance, VenuePosition,
};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;

/// Unified surface over one perpetual-futures venue.
///
/// Implementations are long-lived shared references and must be safe for
/// concurrent calls; retry and circuit-breaker state is confined behind this
/// boundary.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn name(&self) -> &str;
    fn is_connected(&self) -> bool;
    fn is_testnet(&self) -> bool;

    async fn connect(&self) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;

    async fn get_funding_rate(&self, symbol: &str) -> Result<FundingRate>;
    async fn get_funding_rates(&self, symbols: &[String]) -> Result<HashMap<String, FundingRate>>;
    async fn get_orderbook(&self, symbol: &str, depth: usize) -> Result<OrderBook>;

    async fn place_order(&self, order: &Order) -> Result<OrderResult>;
    async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<bool>;
    async fn cancel_all_orders(&self, symbol: Option<&str>) -> Result<usize>;
    async fn get_order(&self, order_id: &str, symbol: &str) -> Result<OrderResult>;
    async fn get_open_orders(&self, symbol: Option<&str>) -> Result<Vec<OrderResult>>;

    async fn get_positions(&self) -> Result<Vec<VenuePosition>>;
    async fn get_position(&self, symbol: &str) -> Result<Option<VenuePosition>>;
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()>;

    async fn get_balance(&self, currency: &str) -> Result<VenueBalance>;
    async fn get_fee_tier(&self) -> Result<FeeTier>;
}

/// Outbound alert sink. Transports (Telegram, email, ...) live behind this
/// seam; the engine only knows severities and text.
#[async_trait]
pub trait Alerter: Send + Sync {
    async fn send(&self, severity: AlertSeverity, title: &str, message: &str);
}

/// Alerter that writes to the log, used when no transport is configured.
pub struct LogAlerter;

#[async_trait]
impl Alerter for LogAlerter {
    async fn send(&self, severity: AlertSeverity, title: &str, message: &str) {
        match severity {
            AlertSeverity::Info => tracing::info!("ALERT [{}] {}", title, message),
            AlertSeverity::Warning => tracing::warn!("ALERT [{}] {}", title, message),
            AlertSeverity::Critical => tracing::error!("ALERT [{}] {}", title, message),
        }
    }
}

/// Position lifecycle observers, invoked sequentially in registration order.
#[async_trait]
pub trait PositionListener: Send + Sync {
    async fn on_position_opened(&self, _position: &Position) {}
    async fn on_position_closed(&self, _position: &Position, _reason: &str) {}
}
