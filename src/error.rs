//! Error taxonomy for the assistant engine.
//!
//! Storage and sync failures are recovered locally with logging; engine
//! errors are surfaced to callers so the user can be told inference is
//! unavailable; history quota errors stay fully internal to the pruning
//! cascade.

use thiserror::Error;

/// The durable entry store is inaccessible.
///
/// Callers must treat this as "no cached knowledge", not crash.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

/// Why a single sync source was skipped. Per-source, never fatal.
#[derive(Debug, Error)]
pub enum SyncSkip {
    #[error("fetch failed: {0}")]
    FetchFailed(String),

    #[error("invalid document format: {0}")]
    FormatInvalid(String),

    #[error(transparent)]
    Storage(#[from] StoreError),
}

/// Errors surfaced by the engine lifecycle manager.
#[derive(Debug, Error, Clone)]
pub enum EngineError {
    /// Worker construction or model load failed. The state machine resets
    /// so the caller may retry.
    #[error("engine initialization failed: {0}")]
    InitFailed(String),

    /// Chat was requested before the engine reached the ready state.
    #[error("engine is not ready")]
    NotReady,

    /// The worker task went away mid-operation.
    #[error("inference worker is gone")]
    WorkerGone,

    /// The model backend reported a generation error.
    #[error("generation failed: {0}")]
    Generation(String),
}

/// A durable history write failed.
#[derive(Debug, Error)]
pub enum HistoryWriteError {
    /// Storage quota exhausted. Triggers the pruning cascade; never
    /// propagated to callers.
    #[error("storage quota exceeded")]
    QuotaExceeded,

    #[error("write failed: {0}")]
    Io(String),
}

impl From<std::io::Error> for HistoryWriteError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::StorageFull | std::io::ErrorKind::QuotaExceeded => {
                HistoryWriteError::QuotaExceeded
            }
            _ => HistoryWriteError::Io(e.to_string()),
        }
    }
}
