//! Error types for the scheduling engine.

/// Top-level error type for engine operations that are not covered by the
/// typed plan/cancel results (recovery, configuration loading).
#[derive(Debug, thiserror::Error)]
pub enum AgendaError {
    /// Appointment store failure.
    #[error("store error: {0}")]
    Store(#[from] crate::store::StoreError),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, AgendaError>;
