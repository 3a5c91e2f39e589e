#![allow(dead_code)]

use chrono::{Duration as ChronoDuration, Utc};
use perparb::application::coordinator::TradingCoordinator;
use perparb::application::detector::{Opportunity, SpreadDetector};
use perparb::application::executor::ExecutionResult;
use perparb::config::{Config, TradingConfig};
use perparb::domain::events::EventEnvelope;
use perparb::domain::ports::{ExchangeAdapter, LogAlerter};
use perparb::domain::types::{FundingRate, OrderResult, OrderSide, OrderStatus, OrderType};
use perparb::infrastructure::event_bus::EventBus;
use perparb::infrastructure::mock::MockVenue;
use perparb::infrastructure::persistence::database::Database;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub const BTC: &str = "BTC/USDT:USDT";

pub fn funding_rate(
    exchange: &str,
    symbol: &str,
    rate: Decimal,
    interval_hours: u32,
    to_funding: ChronoDuration,
) -> FundingRate {
    FundingRate {
        exchange: exchange.to_string(),
        symbol: symbol.to_string(),
        rate,
        predicted_rate: None,
        next_funding_time: Utc::now() + to_funding,
        timestamp: Utc::now(),
        interval_hours,
        mark_price: Some(dec!(50000)),
        index_price: Some(dec!(50000)),
    }
}

pub async fn memory_db() -> Database {
    Database::new("sqlite::memory:").await.expect("in-memory database")
}

pub fn filled_order(
    exchange: &str,
    symbol: &str,
    side: OrderSide,
    size: Decimal,
    price: Decimal,
    fee: Decimal,
) -> OrderResult {
    OrderResult {
        order_id: format!("{}-test", exchange),
        exchange: exchange.to_string(),
        symbol: symbol.to_string(),
        side,
        order_type: OrderType::Limit,
        status: OrderStatus::Filled,
        size,
        filled_size: size,
        price: Some(price),
        average_price: Some(price),
        fee,
        fee_currency: "USDT".to_string(),
        timestamp: Utc::now(),
    }
}

/// A successful two-leg execution: long on `alpha`, short on `beta`.
pub fn entry_execution(
    long_price: Decimal,
    short_price: Decimal,
    size: Decimal,
    fee_per_leg: Decimal,
) -> ExecutionResult {
    ExecutionResult {
        success: true,
        long_order: Some(filled_order(
            "alpha",
            BTC,
            OrderSide::Buy,
            size,
            long_price,
            fee_per_leg,
        )),
        short_order: Some(filled_order(
            "beta",
            BTC,
            OrderSide::Sell,
            size,
            short_price,
            fee_per_leg,
        )),
        error_message: None,
        execution_time_ms: 5,
    }
}

pub fn btc_opportunity(size_usd: Decimal) -> Opportunity {
    let detector = SpreadDetector::new(Arc::new(TradingConfig::default()));
    let long = funding_rate("alpha", BTC, dec!(-0.0005), 8, ChronoDuration::minutes(30));
    let short = funding_rate("beta", BTC, dec!(0.0020), 8, ChronoDuration::minutes(30));
    detector.synthesize(BTC, &long, &short, size_usd, Utc::now())
}

pub fn fast_config() -> Config {
    let mut trading = TradingConfig::default();
    trading.order_fill_timeout_seconds = 1;
    trading.poll_interval_secs = 1;
    Config {
        exchanges: vec!["alpha".to_string(), "beta".to_string()],
        symbols: vec![BTC.to_string()],
        database_url: "sqlite::memory:".to_string(),
        simulation_mode: true,
        trading,
    }
}

/// Two scripted venues with a strong BTC spread and liquid books:
/// alpha is the long side, beta the short side.
pub async fn scripted_pair(to_funding: ChronoDuration) -> (Arc<MockVenue>, Arc<MockVenue>) {
    let alpha = Arc::new(MockVenue::new("alpha"));
    let beta = Arc::new(MockVenue::new("beta"));

    alpha
        .set_funding_rate(funding_rate("alpha", BTC, dec!(-0.0005), 8, to_funding))
        .await;
    beta.set_funding_rate(funding_rate("beta", BTC, dec!(0.0020), 8, to_funding))
        .await;

    alpha.set_book_around(BTC, dec!(50000), dec!(2)).await;
    beta.set_book_around(BTC, dec!(50010), dec!(5)).await;

    (alpha, beta)
}

pub struct Harness {
    pub coordinator: Arc<TradingCoordinator>,
    pub db: Database,
    pub alpha: Arc<MockVenue>,
    pub beta: Arc<MockVenue>,
    pub events: broadcast::Receiver<EventEnvelope>,
}

pub async fn build_harness(
    config: Config,
    alpha: Arc<MockVenue>,
    beta: Arc<MockVenue>,
) -> Harness {
    let db = memory_db().await;
    let bus = Arc::new(EventBus::default());
    let events = bus.subscribe();

    let mut exchanges: HashMap<String, Arc<dyn ExchangeAdapter>> = HashMap::new();
    exchanges.insert("alpha".to_string(), alpha.clone());
    exchanges.insert("beta".to_string(), beta.clone());

    let coordinator =
        TradingCoordinator::new(config, exchanges, db.clone(), bus, Arc::new(LogAlerter));

    Harness {
        coordinator,
        db,
        alpha,
        beta,
        events,
    }
}

/// Poll a condition until it holds or the timeout elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Drain everything currently buffered on the event stream.
pub fn drain_events(rx: &mut broadcast::Receiver<EventEnvelope>) -> Vec<EventEnvelope> {
    let mut events = Vec::new();
    while let Ok(envelope) = rx.try_recv() {
        events.push(envelope);
    }
    events
}
