use thiserror::Error;

/// Errors surfaced by venue adapters.
///
/// Adapters attach these as the source of their `anyhow` chains so callers
/// can branch on the category with `downcast_ref` (the executor
/// short-circuits on `CircuitBreakerOpen`, the retry helper exempts
/// `RateLimited` from breaker accounting).
#[derive(Debug, Clone, Error)]
pub enum VenueError {
    #[error("{exchange} circuit breaker is open after {consecutive_failures} consecutive failures")]
    CircuitBreakerOpen {
        exchange: String,
        consecutive_failures: usize,
    },

    #[error("rate limit exceeded on {exchange}, retry after {retry_after_secs}s")]
    RateLimited {
        exchange: String,
        retry_after_secs: u64,
    },

    #[error("invalid market data for {symbol} on {exchange}: {reason}")]
    InvalidData {
        exchange: String,
        symbol: String,
        reason: String,
    },

    #[error("{exchange} request failed: {reason}")]
    Transport { exchange: String, reason: String },
}

/// Invariant violations in the position lifecycle. These indicate a caller
/// bug and are never swallowed.
#[derive(Debug, Clone, Error)]
pub enum PositionError {
    #[error("position not found: {0}")]
    NotFound(String),

    #[error("position is not open: {0}")]
    NotOpen(String),

    #[error("an open position already exists for {0}")]
    PairOccupied(String),

    #[error("cannot create position from failed execution")]
    InvalidExecutionResult,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn venue_error_messages_carry_context() {
        let err = VenueError::CircuitBreakerOpen {
            exchange: "alpha".to_string(),
            consecutive_failures: 5,
        };
        let msg = err.to_string();
        assert!(msg.contains("alpha"));
        assert!(msg.contains("5 consecutive failures"));
    }

    #[test]
    fn venue_error_survives_anyhow_downcast() {
        let err: anyhow::Error = VenueError::RateLimited {
            exchange: "beta".to_string(),
            retry_after_secs: 2,
        }
        .into();
        assert!(matches!(
            err.downcast_ref::<VenueError>(),
            Some(VenueError::RateLimited { .. })
        ));
    }
}
