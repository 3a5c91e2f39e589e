//! Funding-rate scanner.
//!
//! Keeps the latest `FundingRate` per `(venue, symbol)` in a cache and
//! refreshes it on a fixed cadence, fetching every venue concurrently so a
//! slow or failing venue never blocks the others. Each completed refresh
//! pushes one full snapshot downstream over a bounded channel, which keeps
//! delivery ordered: the next tick cannot publish until the previous
//! snapshot has been taken off the channel.

use crate::domain::ports::ExchangeAdapter;
use crate::domain::types::FundingRate;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::Sender;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Full cache snapshot: venue → symbol → latest rate.
pub type RateSnapshot = HashMap<String, HashMap<String, FundingRate>>;

/// A venue's cache is considered stale after this long without an update.
const STALE_AFTER_SECS: i64 = 120;
/// Upper bound on a single venue fetch.
const FETCH_DEADLINE: Duration = Duration::from_secs(15);

/// Per-venue feed health, as reported by `exchange_status`.
#[derive(Debug, Clone)]
pub struct ExchangeStatus {
    pub connected: bool,
    pub last_update: Option<DateTime<Utc>>,
    pub seconds_ago: Option<i64>,
    pub stale: bool,
}

pub struct FundingRateScanner {
    exchanges: HashMap<String, Arc<dyn ExchangeAdapter>>,
    poll_interval: Duration,
    rates: RwLock<RateSnapshot>,
    last_update: RwLock<HashMap<String, DateTime<Utc>>>,
    symbols: RwLock<Vec<String>>,
    snapshot_tx: RwLock<Option<Sender<RateSnapshot>>>,
    running: AtomicBool,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl FundingRateScanner {
    pub fn new(
        exchanges: HashMap<String, Arc<dyn ExchangeAdapter>>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            exchanges,
            poll_interval,
            rates: RwLock::new(HashMap::new()),
            last_update: RwLock::new(HashMap::new()),
            symbols: RwLock::new(Vec::new()),
            snapshot_tx: RwLock::new(None),
            running: AtomicBool::new(false),
            poll_task: Mutex::new(None),
        }
    }

    /// Begin polling. Performs a seed fetch (and pushes the seed snapshot)
    /// before the background loop starts ticking.
    pub async fn start(self: Arc<Self>, symbols: Vec<String>, on_update: Sender<RateSnapshot>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Scanner already running");
            return;
        }

        info!(
            "Scanner starting. Symbols: {:?}, exchanges: {:?}, interval: {:?}",
            symbols,
            self.exchanges.keys().collect::<Vec<_>>(),
            self.poll_interval
        );

        *self.symbols.write().await = symbols;
        *self.snapshot_tx.write().await = Some(on_update);

        // Seed the cache so consumers get data before the first tick.
        self.scan_once().await;

        let scanner = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(scanner.poll_interval).await;
                if !scanner.running.load(Ordering::SeqCst) {
                    break;
                }
                scanner.scan_once().await;
            }
            info!("Scanner poll loop stopped");
        });
        *self.poll_task.lock().await = Some(handle);
    }

    /// Cancel polling. Safe to call from any state.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.poll_task.lock().await.take() {
            handle.abort();
        }
        info!("Scanner stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// One fetch + publish cycle: all venues concurrently, failures skipped,
    /// cache merged, a single snapshot pushed downstream.
    pub async fn scan_once(&self) {
        let symbols = self.symbols.read().await.clone();
        if symbols.is_empty() {
            return;
        }

        let fetches = self.exchanges.iter().map(|(name, venue)| {
            let name = name.clone();
            let venue = Arc::clone(venue);
            let symbols = symbols.clone();
            async move {
                let result =
                    tokio::time::timeout(FETCH_DEADLINE, venue.get_funding_rates(&symbols)).await;
                (name, result)
            }
        });

        let results = join_all(fetches).await;
        let now = Utc::now();

        for (name, result) in results {
            match result {
                Ok(Ok(venue_rates)) => {
                    let mut cache = self.rates.write().await;
                    let entry = cache.entry(name.clone()).or_default();
                    for (symbol, rate) in venue_rates {
                        entry.insert(symbol, rate);
                    }
                    self.last_update.write().await.insert(name, now);
                }
                Ok(Err(e)) => {
                    // Stale cache entries stay; consumers see the stale flag.
                    error!("Scanner: fetch from {} failed: {}", name, e);
                }
                Err(_) => {
                    error!(
                        "Scanner: fetch from {} timed out after {:?}",
                        name, FETCH_DEADLINE
                    );
                }
            }
        }

        let snapshot = self.rates.read().await.clone();
        let tx = self.snapshot_tx.read().await.clone();
        if let Some(tx) = tx
            && let Err(e) = tx.send(snapshot).await
        {
            error!("Scanner: snapshot delivery failed: {}", e);
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    }

    pub async fn get_rate(&self, exchange: &str, symbol: &str) -> Option<FundingRate> {
        self.rates
            .read()
            .await
            .get(exchange)
            .and_then(|r| r.get(symbol))
            .cloned()
    }

    pub async fn get_rates(&self) -> RateSnapshot {
        self.rates.read().await.clone()
    }

    pub async fn get_rates_for_symbol(&self, symbol: &str) -> HashMap<String, FundingRate> {
        self.rates
            .read()
            .await
            .iter()
            .filter_map(|(exchange, rates)| {
                rates.get(symbol).map(|r| (exchange.clone(), r.clone()))
            })
            .collect()
    }

    /// Earliest next funding instant for a symbol across venues.
    pub async fn get_next_funding_time(&self, symbol: &str) -> Option<DateTime<Utc>> {
        self.rates
            .read()
            .await
            .values()
            .filter_map(|rates| rates.get(symbol))
            .map(|r| r.next_funding_time)
            .min()
    }

    pub async fn get_time_to_funding(&self, symbol: &str) -> Option<i64> {
        self.get_next_funding_time(symbol)
            .await
            .map(|t| (t - Utc::now()).num_seconds())
    }

    pub async fn monitored_symbols(&self) -> Vec<String> {
        self.symbols.read().await.clone()
    }

    pub async fn exchange_status(&self) -> HashMap<String, ExchangeStatus> {
        let now = Utc::now();
        let last_update = self.last_update.read().await;

        self.exchanges
            .iter()
            .map(|(name, venue)| {
                let status = match last_update.get(name) {
                    Some(at) => {
                        let seconds_ago = (now - *at).num_seconds();
                        ExchangeStatus {
                            connected: venue.is_connected(),
                            last_update: Some(*at),
                            seconds_ago: Some(seconds_ago),
                            stale: seconds_ago > STALE_AFTER_SECS,
                        }
                    }
                    None => ExchangeStatus {
                        connected: false,
                        last_update: None,
                        seconds_ago: None,
                        stale: true,
                    },
                };
                (name.clone(), status)
            })
            .collect()
    }
}
