//! Error taxonomy for fleet operations

use thiserror::Error;

/// Errors surfaced by fleet operations
#[derive(Debug, Error)]
pub enum FleetError {
    /// No free port or subdomain left in the allocation window
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    /// Bind conflict that survived the one recovery attempt
    #[error("port {0} is in use and could not be reclaimed")]
    PortUnavailable(u16),

    /// Failure reported by the proxy-rental provider
    #[error("provider error: {0}")]
    UpstreamProvider(String),

    /// Entry lookup failed
    #[error("fleet entry {0} not found")]
    NotFound(u64),

    /// Entry exists but belongs to another user
    #[error("fleet entry {0} is not owned by the caller")]
    NotOwned(u64),

    /// Network-level connect failure while relaying or probing
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Bounded I/O deadline elapsed
    #[error("timed out connecting to {0}")]
    Timeout(String),

    /// Rejected settings update
    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    /// Operation needs an upstream binding the entry does not have
    #[error("fleet entry {0} has no upstream endpoint")]
    NoUpstream(u64),

    /// Persistence failure
    #[error("store error: {0}")]
    Store(String),

    /// Gateway routing file could not be rewritten
    #[error("gateway config error: {0}")]
    Gateway(String),

    /// Batch larger than the bulk-import cap
    #[error("bulk import limited to {max} credentials, got {got}")]
    BatchTooLarge { max: usize, got: usize },
}

impl FleetError {
    /// True when the error means the entry itself is gone or foreign,
    /// as opposed to a transient operational failure.
    pub fn is_lookup_failure(&self) -> bool {
        matches!(self, FleetError::NotFound(_) | FleetError::NotOwned(_))
    }
}

/// Convenience alias used throughout the crate
pub type Result<T> = std::result::Result<T, FleetError>;
