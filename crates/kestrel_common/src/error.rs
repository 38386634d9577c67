use thiserror::Error;

/// Convenience alias for `Result<T, KestrelError>`.
pub type KestrelResult<T> = Result<T, KestrelError>;

/// Top-level error type that the layer-specific errors convert into.
///
/// Fatal conditions (registry exhaustion, out-of-order replay insertions,
/// horizon-invariant violations) are deliberately *not* represented here:
/// continuing past them would silently corrupt visibility semantics, so
/// they panic instead. Everything in this enum is recoverable at the
/// requesting transaction's level.
#[derive(Error, Debug)]
pub enum KestrelError {
    #[error("Distributed coordination error: {0}")]
    Distributed(#[from] DistributedError),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("maximum prepared transactions ({0}) already in progress")]
    PreparedLimit(usize),
}

impl KestrelError {
    /// Whether the failing operation may simply be retried by the client.
    pub fn is_retryable(&self) -> bool {
        matches!(self, KestrelError::Distributed(_))
    }
}

/// Failures talking to the distributed timestamp authority.
///
/// These surface as query-level errors: the requesting transaction fails
/// and retries at a higher level.
#[derive(Error, Debug)]
pub enum DistributedError {
    #[error("connection to timestamp authority failed: {0}")]
    ConnectionFailure(String),
}

/// Errors taking a snapshot.
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("snapshot buffer allocation failed ({needed} entries requested)")]
    BufferExhausted { needed: usize },

    #[error("standby replay has not reached a consistent state yet")]
    StandbyNotReady,
}

/// Rejected configuration values, reported at startup sizing.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("max_backends must be at least 1")]
    ZeroBackends,

    #[error("compress_min_density_pct must be in 1..=100, got {0}")]
    InvalidDensity(u32),

    #[error("compress_span_factor must be at least 1")]
    ZeroSpanFactor,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let e: KestrelError =
            DistributedError::ConnectionFailure("authority at 10.0.0.1:7000 unreachable".into())
                .into();
        assert!(e.is_retryable());

        let e: KestrelError = SnapshotError::BufferExhausted { needed: 1 << 20 }.into();
        assert!(!e.is_retryable());
    }

    #[test]
    fn test_display_carries_context() {
        let e = DistributedError::ConnectionFailure("timed out".into());
        assert!(e.to_string().contains("timed out"));
    }
}
