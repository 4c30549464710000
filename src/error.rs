//! Error types for the coverage engine

use thiserror::Error;

use crate::key::StationId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// A stored value could not be decoded into an aggregate record
    #[error("Corrupt record: {reason}")]
    CorruptRecord { reason: String },

    /// Key bytes that do not follow the cell key layout
    #[error("Invalid key: {reason}")]
    InvalidKey { reason: String },

    /// The store for a station could not be opened
    #[error("Store for station {station} unavailable: {source}")]
    StoreUnavailable {
        station: StationId,
        #[source]
        source: fjall::Error,
    },

    #[error("Store error: {0}")]
    Store(#[from] fjall::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A rollup pass stopped at a batch boundary because of shutdown
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Rollup workers are gone")]
    WorkerGone,

    #[error("Task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl Error {
    pub fn corrupt(reason: impl Into<String>) -> Self {
        Error::CorruptRecord {
            reason: reason.into(),
        }
    }

    pub fn invalid_key(reason: impl Into<String>) -> Self {
        Error::InvalidKey {
            reason: reason.into(),
        }
    }

    /// Errors confined to a single cell; scans log these and move on
    pub fn is_per_cell(&self) -> bool {
        matches!(self, Error::CorruptRecord { .. } | Error::InvalidKey { .. })
    }
}
