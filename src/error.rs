//! Tagged error variants for the batch driver.
//!
//! Mirrors the original implementation's `UnmatchedPendingSessionError` /
//! `DatabaseOutOfSyncError` (see `original_source/lib/raw_event_processor.py`),
//! but as a closed `thiserror` enum instead of exceptions thrown across
//! arbitrary call boundaries.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("serial {serial}: multiple pending sessions found where at most one is allowed")]
    UnmatchedPendingSession { serial: String },

    #[error("serial {serial}: pending session store is out of sync with the in-memory index")]
    StoreOutOfSync { serial: String },

    #[error("serial {serial}: unreachable transition for action {action}")]
    UnreachableTransition { serial: String, action: String },

    #[error("database error: {0}")]
    Db(#[from] tokio_postgres::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
