//! Two-leg order execution.
//!
//! Entry places the leg with the thinner book first: if a leg is going to
//! fail, it should fail before the easier leg has committed capital. Any
//! failure after the first leg fills triggers a best-effort market unwind so
//! no unpaired leg survives the call.

use crate::application::detector::Opportunity;
use crate::config::TradingConfig;
use crate::domain::errors::VenueError;
use crate::domain::ports::ExchangeAdapter;
use crate::domain::types::{Order, OrderResult, OrderSide};
use anyhow::Result;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Levels of book depth compared when ordering the legs.
const DEPTH_LEVELS: usize = 5;
/// Cadence of order-status polling while a limit leg is working.
const FILL_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Outcome of an entry or exit attempt.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub success: bool,
    pub long_order: Option<OrderResult>,
    pub short_order: Option<OrderResult>,
    pub error_message: Option<String>,
    pub execution_time_ms: u64,
}

impl ExecutionResult {
    fn failure(error: impl Into<String>, started: Instant) -> Self {
        Self {
            success: false,
            long_order: None,
            short_order: None,
            error_message: Some(error.into()),
            execution_time_ms: started.elapsed().as_millis() as u64,
        }
    }
}

struct Leg {
    exchange: String,
    side: OrderSide,
    mid: Decimal,
}

pub struct ExecutionEngine {
    exchanges: HashMap<String, Arc<dyn ExchangeAdapter>>,
    config: Arc<TradingConfig>,
    pending_orders: AtomicUsize,
}

impl ExecutionEngine {
    pub fn new(
        exchanges: HashMap<String, Arc<dyn ExchangeAdapter>>,
        config: Arc<TradingConfig>,
    ) -> Self {
        Self {
            exchanges,
            config,
            pending_orders: AtomicUsize::new(0),
        }
    }

    pub fn pending_orders(&self) -> usize {
        self.pending_orders.load(Ordering::SeqCst)
    }

    fn venue(&self, name: &str) -> Result<&Arc<dyn ExchangeAdapter>> {
        self.exchanges
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("unknown exchange: {}", name))
    }

    /// Open both legs of a hedge. On return, either both legs are filled or
    /// no net position from this call remains on any venue (modulo a logged
    /// emergency-close failure).
    pub async fn execute_entry(
        &self,
        opportunity: &Opportunity,
        size_usd: Decimal,
    ) -> ExecutionResult {
        let started = Instant::now();
        info!(
            "Executing entry: {} long={} short={} size=${} daily_spread={}",
            opportunity.symbol,
            opportunity.long_exchange,
            opportunity.short_exchange,
            size_usd,
            opportunity.daily_spread
        );

        self.set_leverage_both(opportunity).await;

        let symbol = opportunity.symbol.as_str();
        let long_book = match self.fetch_book(&opportunity.long_exchange, symbol).await {
            Ok(book) => book,
            Err(e) => return self.venue_failure(e, started),
        };
        let short_book = match self.fetch_book(&opportunity.short_exchange, symbol).await {
            Ok(book) => book,
            Err(e) => return self.venue_failure(e, started),
        };

        let (Some(long_mid), Some(short_mid)) = (long_book.mid_price(), short_book.mid_price())
        else {
            warn!("Entry aborted: orderbook missing price data for {}", symbol);
            return ExecutionResult::failure(
                "Orderbook missing price data (empty bids or asks)",
                started,
            );
        };

        // The long leg crosses the asks, the short leg crosses the bids;
        // the thinner crossed side goes first. Ties keep the long leg first.
        let long_depth = long_book.depth(OrderSide::Sell, DEPTH_LEVELS);
        let short_depth = short_book.depth(OrderSide::Buy, DEPTH_LEVELS);

        let (first, second) = if long_depth <= short_depth {
            (
                Leg {
                    exchange: opportunity.long_exchange.clone(),
                    side: OrderSide::Buy,
                    mid: long_mid,
                },
                Leg {
                    exchange: opportunity.short_exchange.clone(),
                    side: OrderSide::Sell,
                    mid: short_mid,
                },
            )
        } else {
            (
                Leg {
                    exchange: opportunity.short_exchange.clone(),
                    side: OrderSide::Sell,
                    mid: short_mid,
                },
                Leg {
                    exchange: opportunity.long_exchange.clone(),
                    side: OrderSide::Buy,
                    mid: long_mid,
                },
            )
        };

        // First leg: limit at mid, nothing to unwind if it fails.
        let first_size = size_usd / first.mid;
        info!(
            "First leg: {} {} {} @ {}",
            first.exchange, first.side, first_size, first.mid
        );
        let first_result = match self
            .fill_with_timeout(&first.exchange, symbol, first.side, first_size, first.mid)
            .await
        {
            Ok(Some(result)) => result,
            Ok(None) => {
                warn!("First leg failed to fill on {}", first.exchange);
                return ExecutionResult::failure("First leg failed to fill", started);
            }
            Err(e) => return self.venue_failure(e, started),
        };
        info!(
            "First leg filled on {}: size={} price={:?}",
            first.exchange, first_result.filled_size, first_result.average_price
        );

        // Second leg prices off a fresh book; the first fill takes time and
        // the stale mid may no longer be crossable.
        let second_mid = match self.fetch_book(&second.exchange, symbol).await {
            Ok(book) => book.mid_price(),
            Err(e) => {
                self.emergency_close(&first.exchange, symbol, first.side, first_result.filled_size)
                    .await;
                return self.venue_failure_with_leg(e, first_result, first.side, started);
            }
        };
        let Some(second_mid) = second_mid else {
            error!(
                "Second leg orderbook on {} missing price, closing first leg",
                second.exchange
            );
            self.emergency_close(&first.exchange, symbol, first.side, first_result.filled_size)
                .await;
            return self.result_with_leg(
                first_result,
                first.side,
                "Second leg orderbook missing price data, first leg closed",
                started,
            );
        };

        let second_size = size_usd / second_mid;
        info!(
            "Second leg: {} {} {} @ {}",
            second.exchange, second.side, second_size, second_mid
        );
        let second_result = match self
            .fill_with_timeout(&second.exchange, symbol, second.side, second_size, second_mid)
            .await
        {
            Ok(Some(result)) => result,
            Ok(None) => {
                error!(
                    "Second leg failed on {}, closing first leg on {}",
                    second.exchange, first.exchange
                );
                self.emergency_close(&first.exchange, symbol, first.side, first_result.filled_size)
                    .await;
                return self.result_with_leg(
                    first_result,
                    first.side,
                    "Second leg failed, first leg closed",
                    started,
                );
            }
            Err(e) => {
                self.emergency_close(&first.exchange, symbol, first.side, first_result.filled_size)
                    .await;
                return self.venue_failure_with_leg(e, first_result, first.side, started);
            }
        };
        info!(
            "Second leg filled on {}: size={} price={:?}",
            second.exchange, second_result.filled_size, second_result.average_price
        );

        let (long_order, short_order) = if first.side == OrderSide::Buy {
            (first_result, second_result)
        } else {
            (second_result, first_result)
        };

        ExecutionResult {
            success: true,
            long_order: Some(long_order),
            short_order: Some(short_order),
            error_message: None,
            execution_time_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// Close both legs concurrently with market reduce-only orders. Either
    /// leg's failure is captured rather than propagated; success requires
    /// both closes.
    pub async fn execute_exit(
        &self,
        symbol: &str,
        long_exchange: &str,
        short_exchange: &str,
        long_size: Decimal,
        short_size: Decimal,
    ) -> ExecutionResult {
        let started = Instant::now();
        info!(
            "Executing exit: {} long={}({}) short={}({})",
            symbol, long_exchange, long_size, short_exchange, short_size
        );

        let close_long = async {
            match self
                .close_leg(long_exchange, symbol, OrderSide::Sell, long_size)
                .await
            {
                Ok(result) => Some(result),
                Err(e) => {
                    error!("Long close failed on {}: {}", long_exchange, e);
                    None
                }
            }
        };
        let close_short = async {
            match self
                .close_leg(short_exchange, symbol, OrderSide::Buy, short_size)
                .await
            {
                Ok(result) => Some(result),
                Err(e) => {
                    error!("Short close failed on {}: {}", short_exchange, e);
                    None
                }
            }
        };

        let (long_order, short_order) = tokio::join!(close_long, close_short);
        let success = long_order.is_some() && short_order.is_some();

        ExecutionResult {
            success,
            long_order,
            short_order,
            error_message: (!success).then(|| "One or both close orders failed".to_string()),
            execution_time_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// Place a limit order and poll it until filled, terminal, or timed out.
    /// A timeout cancels the order. `Ok(None)` means the leg did not fill.
    async fn fill_with_timeout(
        &self,
        exchange: &str,
        symbol: &str,
        side: OrderSide,
        size: Decimal,
        price: Decimal,
    ) -> Result<Option<OrderResult>> {
        let adapter = self.venue(exchange)?;
        let order = Order::limit(symbol, side, size, price);

        self.pending_orders.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .drive_order(adapter, &order, exchange, symbol)
            .await;
        self.pending_orders.fetch_sub(1, Ordering::SeqCst);
        outcome
    }

    async fn drive_order(
        &self,
        adapter: &Arc<dyn ExchangeAdapter>,
        order: &Order,
        exchange: &str,
        symbol: &str,
    ) -> Result<Option<OrderResult>> {
        let mut result = adapter.place_order(order).await?;
        if result.is_filled() {
            return Ok(Some(result));
        }

        let timeout = Duration::from_secs(self.config.order_fill_timeout_seconds);
        let deadline = Instant::now() + timeout;

        while Instant::now() < deadline {
            tokio::time::sleep(FILL_POLL_INTERVAL).await;

            result = adapter.get_order(&result.order_id, symbol).await?;
            if result.is_filled() {
                return Ok(Some(result));
            }
            if !result.is_open() {
                // Cancelled or rejected out from under us.
                return Ok(None);
            }
        }

        warn!(
            "Order {} on {} unfilled after {:?}, cancelling",
            result.order_id, exchange, timeout
        );
        adapter.cancel_order(&result.order_id, symbol).await?;
        Ok(None)
    }

    async fn close_leg(
        &self,
        exchange: &str,
        symbol: &str,
        side: OrderSide,
        size: Decimal,
    ) -> Result<OrderResult> {
        let adapter = self.venue(exchange)?;
        let order = Order::market_reduce_only(symbol, side, size);
        adapter.place_order(&order).await
    }

    /// Unwind a filled first leg. Failures are logged, never re-raised: the
    /// surrounding operation has already failed and must report as such.
    async fn emergency_close(
        &self,
        exchange: &str,
        symbol: &str,
        entry_side: OrderSide,
        size: Decimal,
    ) {
        warn!(
            "Emergency close on {}: {} {} {}",
            exchange, symbol, entry_side, size
        );
        match self
            .close_leg(exchange, symbol, entry_side.opposite(), size)
            .await
        {
            Ok(_) => info!("Emergency close completed on {}", exchange),
            Err(e) => error!("Emergency close failed on {}: {}", exchange, e),
        }
    }

    async fn set_leverage_both(&self, opportunity: &Opportunity) {
        for exchange in [&opportunity.long_exchange, &opportunity.short_exchange] {
            let leverage = self.config.leverage_for(exchange, &opportunity.symbol);
            let Ok(adapter) = self.venue(exchange) else {
                continue;
            };
            if let Err(e) = adapter.set_leverage(&opportunity.symbol, leverage).await {
                warn!(
                    "Failed to set leverage {} on {} for {}: {}",
                    leverage, exchange, opportunity.symbol, e
                );
            }
        }
    }

    async fn fetch_book(
        &self,
        exchange: &str,
        symbol: &str,
    ) -> Result<crate::domain::types::OrderBook> {
        self.venue(exchange)?.get_orderbook(symbol, 10).await
    }

    fn venue_failure(&self, error: anyhow::Error, started: Instant) -> ExecutionResult {
        let message = if let Some(VenueError::CircuitBreakerOpen { .. }) =
            error.downcast_ref::<VenueError>()
        {
            format!("Circuit breaker open: {}", error)
        } else {
            error.to_string()
        };
        error!("Entry execution failed: {}", message);
        ExecutionResult::failure(message, started)
    }

    fn venue_failure_with_leg(
        &self,
        error: anyhow::Error,
        leg: OrderResult,
        leg_side: OrderSide,
        started: Instant,
    ) -> ExecutionResult {
        let mut result = self.venue_failure(error, started);
        match leg_side {
            OrderSide::Buy => result.long_order = Some(leg),
            OrderSide::Sell => result.short_order = Some(leg),
        }
        result
    }

    fn result_with_leg(
        &self,
        leg: OrderResult,
        leg_side: OrderSide,
        error: &str,
        started: Instant,
    ) -> ExecutionResult {
        let mut result = ExecutionResult::failure(error, started);
        match leg_side {
            OrderSide::Buy => result.long_order = Some(leg),
            OrderSide::Sell => result.short_order = Some(leg),
        }
        result
    }
}
