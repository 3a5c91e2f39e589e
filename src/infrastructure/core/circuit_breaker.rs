use crate::domain::errors::VenueError;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// Consecutive failures before the breaker opens.
pub const CB_THRESHOLD: usize = 5;
/// How long an open breaker rejects calls before probing again.
pub const CB_RESET: Duration = Duration::from_secs(60);

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,   // Normal operation - requests pass through
    Open,     // Failure threshold breached - reject all requests
    HalfOpen, // Reset timeout elapsed - allow a probe request
}

/// Per-venue circuit breaker guarding adapter calls.
///
/// A single success in the half-open state closes the breaker.
pub struct CircuitBreaker {
    state: Arc<RwLock<BreakerInner>>,
    failure_threshold: usize,
    reset_timeout: Duration,
    name: String,
}

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: usize,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: usize, reset_timeout: Duration) -> Self {
        Self {
            state: Arc::new(RwLock::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            })),
            failure_threshold,
            reset_timeout,
            name: name.into(),
        }
    }

    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CB_THRESHOLD, CB_RESET)
    }

    /// Reject fast while the breaker is open. Once the reset timeout has
    /// elapsed the breaker moves to half-open and lets one attempt through.
    pub async fn check(&self) -> Result<(), VenueError> {
        let mut inner = self.state.write().await;

        if inner.state != CircuitState::Open {
            return Ok(());
        }

        if let Some(opened_at) = inner.opened_at
            && opened_at.elapsed() >= self.reset_timeout
        {
            info!(
                "CircuitBreaker [{}]: Transitioning Open -> HalfOpen (reset timeout elapsed)",
                self.name
            );
            inner.state = CircuitState::HalfOpen;
            return Ok(());
        }

        Err(VenueError::CircuitBreakerOpen {
            exchange: self.name.clone(),
            consecutive_failures: inner.consecutive_failures,
        })
    }

    pub async fn record_success(&self) {
        let mut inner = self.state.write().await;
        if inner.state != CircuitState::Closed {
            info!("CircuitBreaker [{}]: Closed on success", self.name);
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    pub async fn record_failure(&self) {
        let mut inner = self.state.write().await;
        inner.consecutive_failures += 1;

        match inner.state {
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.failure_threshold {
                    error!(
                        "CircuitBreaker [{}]: Transitioning Closed -> Open ({} failures)",
                        self.name, inner.consecutive_failures
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                warn!(
                    "CircuitBreaker [{}]: Probe failed, reopening",
                    self.name
                );
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
            }
            CircuitState::Open => {}
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.state.read().await.state
    }
}

/// Retry schedule for venue calls: exponential backoff from `base_delay`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt)
    }
}

/// Run a venue operation behind a breaker with exponential-backoff retries.
///
/// Rate-limit errors always retry with backoff and do not count toward the
/// breaker; any other failure is recorded. An open breaker rejects without
/// invoking the operation at all.
pub async fn with_retry<T, F, Fut>(
    breaker: &CircuitBreaker,
    policy: &RetryPolicy,
    mut operation: F,
) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    breaker.check().await?;

    let mut last_error = None;
    for attempt in 0..policy.max_attempts {
        match operation().await {
            Ok(value) => {
                breaker.record_success().await;
                return Ok(value);
            }
            Err(e) => {
                let rate_limited = matches!(
                    e.downcast_ref::<VenueError>(),
                    Some(VenueError::RateLimited { .. })
                );

                if rate_limited {
                    warn!(
                        "Rate limit hit (attempt {}/{}), backing off",
                        attempt + 1,
                        policy.max_attempts
                    );
                } else {
                    breaker.record_failure().await;
                    warn!(
                        "Venue call failed (attempt {}/{}): {}",
                        attempt + 1,
                        policy.max_attempts,
                        e
                    );
                }
                last_error = Some(e);

                if attempt + 1 < policy.max_attempts {
                    tokio::time::sleep(policy.delay_for(attempt)).await;
                }
            }
        }
    }

    Err(last_error.expect("at least one attempt ran"))
}
