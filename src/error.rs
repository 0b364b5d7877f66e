//! Error types for the exit engine

use thiserror::Error;

/// Result type alias using our custom Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the exit engine
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // RPC / reserve source errors
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("RPC timeout after {0}ms")]
    RpcTimeout(u64),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Reserve read failed for pool {0}")]
    ReserveRead(String),

    // Execution errors
    #[error("Swap execution failed: {0}")]
    Execution(String),

    #[error("Pool drained, no liquidity to swap against: {0}")]
    PoolDrained(String),

    #[error("Swap confirmed but realized zero output (tx {0})")]
    ZeroOutput(String),

    #[error("Swap outcome unknown after confirmation timeout (tx {tx_ref:?})")]
    AmbiguousOutcome { tx_ref: Option<String> },

    #[error("Slippage exceeded: expected {expected}, got {actual}")]
    SlippageExceeded { expected: u64, actual: u64 },

    // Subscription errors (best-effort paths)
    #[error("Log subscription failed: {0}")]
    Subscription(String),

    // Position management errors
    #[error("Position not found: {0}")]
    PositionNotFound(String),

    #[error("Position checkpoint failed: {0}")]
    Checkpoint(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    /// Recoverable-transient: retried with backoff, never terminal by itself.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Rpc(_)
                | Error::RpcTimeout(_)
                | Error::RateLimited(_)
                | Error::ReserveRead(_)
                | Error::Execution(_)
                | Error::ZeroOutput(_)
                | Error::SlippageExceeded { .. }
        )
    }

    /// Rate-limit errors get a long fixed cooldown and a higher retry ceiling.
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Error::RateLimited(_))
    }

    /// Recoverable-structural: a small bounded number of retries, then loss.
    pub fn is_pool_drained(&self) -> bool {
        matches!(self, Error::PoolDrained(_))
    }

    /// Confirmed-but-void: consumed a confirmation but produced nothing.
    /// Treated as a failed attempt, never as a success.
    pub fn is_zero_output(&self) -> bool {
        matches!(self, Error::ZeroOutput(_))
    }

    /// Ambiguous: needs an explicit post-hoc status check before retrying.
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, Error::AmbiguousOutcome { .. })
    }
}

// Conversion from serde_json errors
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

// Conversion from I/O errors
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taxonomy_classification() {
        assert!(Error::RateLimited("429".into()).is_rate_limit());
        assert!(Error::RateLimited("429".into()).is_transient());
        assert!(Error::PoolDrained("pool".into()).is_pool_drained());
        assert!(!Error::PoolDrained("pool".into()).is_transient());
        assert!(Error::ZeroOutput("sig".into()).is_zero_output());
        assert!(Error::AmbiguousOutcome { tx_ref: None }.is_ambiguous());
        assert!(!Error::PositionNotFound("x".into()).is_transient());
        assert!(!Error::Internal("x".into()).is_transient());
    }
}
