//! Scriptable in-memory venue adapter.
//!
//! Backs the test suite and the binary's simulation mode: rates, books,
//! positions and fill behavior are all settable from outside, and every
//! trading call is recorded for assertions. Calls run through the same
//! retry + circuit-breaker guard a real adapter would use.

use crate::domain::errors::VenueError;
use crate::domain::ports::ExchangeAdapter;
use crate::domain::types::{
    FeeTier, FundingRate, Order, OrderBook, OrderBookLevel, OrderResult, OrderSide, OrderStatus,
    OrderType, VenueBalance, VenuePosition,
};
use crate::infrastructure::core::circuit_breaker::{CircuitBreaker, RetryPolicy, with_retry};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng;
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::info;

/// How limit orders behave after placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillBehavior {
    /// Fill on placement.
    Immediate,
    /// Stay OPEN until cancelled.
    Never,
    /// Fill after N status polls.
    AfterPolls(u32),
}

struct TrackedOrder {
    result: OrderResult,
    polls_until_fill: Option<u32>,
}

#[derive(Default)]
struct VenueState {
    rates: HashMap<String, FundingRate>,
    books: HashMap<String, OrderBook>,
    positions: HashMap<String, VenuePosition>,
    open_orders: HashMap<String, TrackedOrder>,
    placed: Vec<Order>,
    cancelled: Vec<String>,
    cancel_all_calls: u32,
    leverage_calls: Vec<(String, u32)>,
    fail_remaining: u32,
    fail_after_successes: u32,
    rate_limit_remaining: u32,
}

pub struct MockVenue {
    name: String,
    taker_fee: Decimal,
    fill_behavior: RwLock<FillBehavior>,
    state: RwLock<VenueState>,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    connected: AtomicBool,
    order_seq: AtomicU64,
}

impl MockVenue {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            breaker: CircuitBreaker::with_defaults(&name),
            // Tests drive failures through this policy; keep backoff short.
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(5),
            },
            name,
            taker_fee: dec!(0.0004),
            fill_behavior: RwLock::new(FillBehavior::Immediate),
            state: RwLock::new(VenueState::default()),
            connected: AtomicBool::new(true),
            order_seq: AtomicU64::new(1),
        }
    }

    // ---- scripting surface --------------------------------------------

    pub async fn set_funding_rate(&self, rate: FundingRate) {
        self.state.write().await.rates.insert(rate.symbol.clone(), rate);
    }

    pub async fn set_orderbook(&self, book: OrderBook) {
        self.state.write().await.books.insert(book.symbol.clone(), book);
    }

    pub async fn set_position(&self, position: VenuePosition) {
        self.state
            .write()
            .await
            .positions
            .insert(position.symbol.clone(), position);
    }

    pub async fn remove_position(&self, symbol: &str) {
        self.state.write().await.positions.remove(symbol);
    }

    pub async fn set_fill_behavior(&self, behavior: FillBehavior) {
        *self.fill_behavior.write().await = behavior;
    }

    /// Make the next `n` guarded calls fail with a transport error.
    pub async fn fail_next(&self, n: u32) {
        self.state.write().await.fail_remaining = n;
    }

    /// Let `successes` guarded calls through before `fail_next`-style
    /// failures begin.
    pub async fn fail_after(&self, successes: u32, failures: u32) {
        let mut state = self.state.write().await;
        state.fail_after_successes = successes;
        state.fail_remaining = failures;
    }

    /// Make the next `n` guarded calls fail with a rate-limit error.
    pub async fn rate_limit_next(&self, n: u32) {
        self.state.write().await.rate_limit_remaining = n;
    }

    pub async fn placed_orders(&self) -> Vec<Order> {
        self.state.read().await.placed.clone()
    }

    pub async fn cancelled_orders(&self) -> Vec<String> {
        self.state.read().await.cancelled.clone()
    }

    pub async fn cancel_all_calls(&self) -> u32 {
        self.state.read().await.cancel_all_calls
    }

    pub async fn leverage_calls(&self) -> Vec<(String, u32)> {
        self.state.read().await.leverage_calls.clone()
    }

    /// Convenience for scripting a symmetric book around a mid price.
    pub async fn set_book_around(&self, symbol: &str, mid: Decimal, level_size: Decimal) {
        let tick = mid / Decimal::from(1000);
        let book = OrderBook {
            exchange: self.name.clone(),
            symbol: symbol.to_string(),
            bids: (1..=5)
                .map(|i| OrderBookLevel {
                    price: mid - tick * Decimal::from(i),
                    size: level_size,
                })
                .collect(),
            asks: (1..=5)
                .map(|i| OrderBookLevel {
                    price: mid + tick * Decimal::from(i),
                    size: level_size,
                })
                .collect(),
            timestamp: Utc::now(),
        };
        self.set_orderbook(book).await;
    }

    /// Random-walk funding rates for simulation mode.
    pub fn spawn_simulated_rates(
        self: Arc<Self>,
        symbols: Vec<String>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let venue = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                for symbol in &symbols {
                    let jitter: f64 = rand::rng().random_range(-0.0005..0.0005);
                    let rate = Decimal::from_f64(jitter).unwrap_or_default();
                    let mark = if symbol.contains("BTC") {
                        Decimal::from(96_000)
                    } else {
                        Decimal::from(3_400)
                    };
                    venue
                        .set_funding_rate(FundingRate {
                            exchange: venue.name.clone(),
                            symbol: symbol.clone(),
                            rate,
                            predicted_rate: None,
                            next_funding_time: Utc::now() + ChronoDuration::hours(8),
                            timestamp: Utc::now(),
                            interval_hours: 8,
                            mark_price: Some(mark),
                            index_price: Some(mark),
                        })
                        .await;
                    venue
                        .set_book_around(symbol, mark, Decimal::from(10))
                        .await;
                }
            }
        })
    }

    // ---- internals -----------------------------------------------------

    /// Consume injected failures before doing real work, so calls exercise
    /// the retry + breaker path the way a live transport would.
    async fn guard(&self) -> Result<()> {
        with_retry(&self.breaker, &self.retry, || async {
            let mut state = self.state.write().await;
            if state.fail_after_successes > 0 {
                state.fail_after_successes -= 1;
                return Ok(());
            }
            if state.rate_limit_remaining > 0 {
                state.rate_limit_remaining -= 1;
                return Err(VenueError::RateLimited {
                    exchange: self.name.clone(),
                    retry_after_secs: 1,
                }
                .into());
            }
            if state.fail_remaining > 0 {
                state.fail_remaining -= 1;
                return Err(VenueError::Transport {
                    exchange: self.name.clone(),
                    reason: "injected failure".to_string(),
                }
                .into());
            }
            Ok(())
        })
        .await
    }

    fn next_order_id(&self) -> String {
        format!(
            "{}-{}",
            self.name,
            self.order_seq.fetch_add(1, Ordering::SeqCst)
        )
    }

    async fn execution_price(&self, order: &Order) -> Decimal {
        if let Some(price) = order.price {
            return price;
        }
        let state = self.state.read().await;
        state
            .books
            .get(&order.symbol)
            .and_then(|b| b.mid_price())
            .unwrap_or(Decimal::ZERO)
    }
}

#[async_trait]
impl ExchangeAdapter for MockVenue {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn is_testnet(&self) -> bool {
        true
    }

    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn get_funding_rate(&self, symbol: &str) -> Result<FundingRate> {
        self.guard().await?;
        let state = self.state.read().await;
        state.rates.get(symbol).cloned().ok_or_else(|| {
            VenueError::InvalidData {
                exchange: self.name.clone(),
                symbol: symbol.to_string(),
                reason: "no funding rate".to_string(),
            }
            .into()
        })
    }

    async fn get_funding_rates(&self, symbols: &[String]) -> Result<HashMap<String, FundingRate>> {
        self.guard().await?;
        let state = self.state.read().await;
        Ok(symbols
            .iter()
            .filter_map(|s| state.rates.get(s).map(|r| (s.clone(), r.clone())))
            .collect())
    }

    async fn get_orderbook(&self, symbol: &str, _depth: usize) -> Result<OrderBook> {
        self.guard().await?;
        let state = self.state.read().await;
        state.books.get(symbol).cloned().ok_or_else(|| {
            VenueError::InvalidData {
                exchange: self.name.clone(),
                symbol: symbol.to_string(),
                reason: "no orderbook".to_string(),
            }
            .into()
        })
    }

    async fn place_order(&self, order: &Order) -> Result<OrderResult> {
        self.guard().await?;

        let price = self.execution_price(order).await;
        let fill_behavior = *self.fill_behavior.read().await;
        // Market orders always execute; scripted behavior shapes limits.
        let fills_now =
            order.order_type == OrderType::Market || fill_behavior == FillBehavior::Immediate;

        let order_id = self.next_order_id();
        let result = OrderResult {
            order_id: order_id.clone(),
            exchange: self.name.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            order_type: order.order_type,
            status: if fills_now {
                OrderStatus::Filled
            } else {
                OrderStatus::Open
            },
            size: order.size,
            filled_size: if fills_now { order.size } else { Decimal::ZERO },
            price: order.price,
            average_price: if fills_now { Some(price) } else { None },
            fee: if fills_now {
                order.size * price * self.taker_fee
            } else {
                Decimal::ZERO
            },
            fee_currency: "USDT".to_string(),
            timestamp: Utc::now(),
        };

        let mut state = self.state.write().await;
        state.placed.push(order.clone());
        if !fills_now {
            let polls_until_fill = match fill_behavior {
                FillBehavior::AfterPolls(n) => Some(n),
                _ => None,
            };
            state.open_orders.insert(
                order_id,
                TrackedOrder {
                    result: result.clone(),
                    polls_until_fill,
                },
            );
        }

        Ok(result)
    }

    async fn cancel_order(&self, order_id: &str, _symbol: &str) -> Result<bool> {
        self.guard().await?;
        let mut state = self.state.write().await;
        state.cancelled.push(order_id.to_string());
        Ok(state.open_orders.remove(order_id).is_some())
    }

    async fn cancel_all_orders(&self, symbol: Option<&str>) -> Result<usize> {
        self.guard().await?;
        let mut state = self.state.write().await;
        state.cancel_all_calls += 1;
        let before = state.open_orders.len();
        match symbol {
            Some(symbol) => state.open_orders.retain(|_, o| o.result.symbol != symbol),
            None => state.open_orders.clear(),
        }
        Ok(before - state.open_orders.len())
    }

    async fn get_order(&self, order_id: &str, _symbol: &str) -> Result<OrderResult> {
        self.guard().await?;
        let mut state = self.state.write().await;
        let Some(tracked) = state.open_orders.get_mut(order_id) else {
            return Err(VenueError::InvalidData {
                exchange: self.name.clone(),
                symbol: order_id.to_string(),
                reason: "unknown order".to_string(),
            }
            .into());
        };

        if let Some(remaining) = tracked.polls_until_fill {
            if remaining <= 1 {
                let mut filled = tracked.result.clone();
                filled.status = OrderStatus::Filled;
                filled.filled_size = filled.size;
                filled.average_price = filled.price;
                filled.fee = filled.size * filled.price.unwrap_or_default() * self.taker_fee;
                state.open_orders.remove(order_id);
                return Ok(filled);
            }
            tracked.polls_until_fill = Some(remaining - 1);
        }

        Ok(tracked.result.clone())
    }

    async fn get_open_orders(&self, symbol: Option<&str>) -> Result<Vec<OrderResult>> {
        self.guard().await?;
        let state = self.state.read().await;
        Ok(state
            .open_orders
            .values()
            .filter(|o| symbol.is_none_or(|s| o.result.symbol == s))
            .map(|o| o.result.clone())
            .collect())
    }

    async fn get_positions(&self) -> Result<Vec<VenuePosition>> {
        self.guard().await?;
        Ok(self.state.read().await.positions.values().cloned().collect())
    }

    async fn get_position(&self, symbol: &str) -> Result<Option<VenuePosition>> {
        self.guard().await?;
        Ok(self.state.read().await.positions.get(symbol).cloned())
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        self.guard().await?;
        self.state
            .write()
            .await
            .leverage_calls
            .push((symbol.to_string(), leverage));
        Ok(())
    }

    async fn get_balance(&self, currency: &str) -> Result<VenueBalance> {
        self.guard().await?;
        Ok(VenueBalance {
            currency: currency.to_string(),
            total: Decimal::from(1_000_000),
            free: Decimal::from(1_000_000),
            used: Decimal::ZERO,
        })
    }

    async fn get_fee_tier(&self) -> Result<FeeTier> {
        self.guard().await?;
        Ok(FeeTier {
            exchange: self.name.clone(),
            tier: "regular".to_string(),
            maker_fee: dec!(0.0002),
            taker_fee: self.taker_fee,
        })
    }
}

/// Wire one mock venue per configured exchange name for simulation mode.
pub fn simulated_venues(names: &[String]) -> HashMap<String, Arc<MockVenue>> {
    let mut venues = HashMap::new();
    for name in names {
        info!("Simulation: wiring mock venue '{}'", name);
        venues.insert(name.clone(), Arc::new(MockVenue::new(name.clone())));
    }
    venues
}
