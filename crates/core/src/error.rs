//! Engine-wide error type.
//!
//! Sub-components that are pure (sanitizer, fingerprinter, splitter, tag
//! extractor) never return `Result` — only the store, scheduler, and
//! searcher surfaces can fail, and only for the reasons enumerated here.

use thiserror::Error;

/// Semantic error kinds surfaced across the store/scheduler/searcher boundary.
///
/// An oversize-input kind is intentionally absent: it is handled locally by
/// truncation with a sentinel and never surfaces to a caller.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("transient storage error: {0}")]
    StorageTransient(String),

    #[error("fatal storage error: {0}")]
    StorageFatal(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out")]
    Timeout,
}

pub type EngineResult<T> = Result<T, EngineError>;

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        if is_transient(&e) {
            EngineError::StorageTransient(e.to_string())
        } else {
            EngineError::StorageFatal(e.to_string())
        }
    }
}

/// SQLite busy/locked errors are transient and worth retrying; anything
/// else (constraint violations, corruption, type mismatches) is fatal.
fn is_transient(e: &rusqlite::Error) -> bool {
    match e {
        rusqlite::Error::SqliteFailure(err, _) => matches!(
            err.code,
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
        ),
        _ => false,
    }
}
