//! Error types for the mail router.

use std::time::Duration;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Mailbox ingestion errors.
///
/// `Connection` and `Auth` are fatal to a watch session. `Transient` is
/// retried with backoff by the caller.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Cannot reach {host}:{port}: {reason}")]
    Connection {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("Authentication failed for {user}: {reason}")]
    Auth { user: String, reason: String },

    #[error("Transient I/O error: {0}")]
    Transient(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl SourceError {
    /// Whether the operation may succeed if tried again.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Whether the error must end the watch session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Auth { .. })
    }
}

impl From<std::io::Error> for SourceError {
    fn from(e: std::io::Error) -> Self {
        Self::Transient(e.to_string())
    }
}

/// Classification provider errors. Always absorbed by the fallback chain.
#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("Provider {provider} timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },

    #[error("Provider {provider} returned HTTP {status}")]
    Status { provider: String, status: u16 },

    #[error("Provider {provider} request failed: {reason}")]
    Request { provider: String, reason: String },

    #[error("Malformed response from {provider}: {reason}")]
    Malformed { provider: String, reason: String },

    #[error("Provider {provider} found no signal in the message")]
    NoSignal { provider: String },
}

/// Outbound delivery errors.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Invalid address {address}: {reason}")]
    Address { address: String, reason: String },

    #[error("Failed to build message: {0}")]
    Build(String),

    #[error("SMTP transport error: {reason}")]
    Transport { reason: String, permanent: bool },
}

impl DeliveryError {
    /// Only transient transport failures are worth resending.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { permanent: false, .. })
    }
}

/// Processing ledger errors.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Ledger IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Ledger serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Watch control-plane errors.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("A watch session is already {status}")]
    AlreadyRunning { status: String },

    #[error("No watch session is running")]
    NotRunning,

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Why a watch cycle ended early.
#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl CycleError {
    /// Fatal errors stop the session; the rest count toward the failed-cycle limit.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Source(e) => e.is_fatal(),
            Self::Ledger(_) => true,
        }
    }
}
