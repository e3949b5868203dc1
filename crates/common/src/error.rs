use thiserror::Error;

use crate::{EntryId, LifecycleState, RegimeKind};

#[derive(Debug, Error)]
pub enum Error {
    /// Data source unreachable or returned nothing usable. Retry next tick.
    #[error("Data unavailable: {0}")]
    DataUnavailable(String),

    /// Not enough history to fill an indicator window. Skip this tick.
    #[error("Insufficient data: need {needed} bars, have {available}")]
    InsufficientData { needed: usize, available: usize },

    #[error("Strategy '{strategy}' is incompatible: {reason}")]
    IncompatibleStrategy { strategy: String, reason: String },

    #[error("Strategy '{strategy}' failed: {reason}")]
    StrategyRuntime { strategy: String, reason: String },

    /// Two writers raced on the same (strategy, regime). Indicates a
    /// synchronization bug, never a recoverable condition.
    #[error("Registry conflict on '{strategy}' in {regime}: expected {expected}, found {found:?}")]
    RegistryConflict {
        strategy: String,
        regime: RegimeKind,
        expected: LifecycleState,
        found: Option<LifecycleState>,
    },

    #[error("Invalid lifecycle transition {from} -> {to}")]
    InvalidTransition {
        from: LifecycleState,
        to: LifecycleState,
    },

    #[error("Unknown registry entry {0}")]
    UnknownEntry(EntryId),

    #[error("Strategy '{strategy}' is already {state} in {regime}")]
    AlreadyRegistered {
        strategy: String,
        regime: RegimeKind,
        state: LifecycleState,
    },

    #[error("Series span mismatch: {0}")]
    SpanMismatch(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Exchange API error: {0}")]
    Exchange(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Faults that are absorbed at the component boundary and only mean
    /// "no change this cycle".
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::DataUnavailable(_) | Error::InsufficientData { .. } | Error::Timeout(_)
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
