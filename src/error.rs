/// Indexer Error Taxonomy
///
/// Transient infrastructure failures (daemon, store) bubble up to the sync
/// controller which turns them into a delay-and-retry. Logical/data errors
/// (duplicate hashes, malformed messages) are handled where they are detected
/// and never reach this type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IndexerError {
    /// RPC transport failure or non-success status from the daemon
    #[error("daemon rpc error: {0}")]
    Daemon(String),

    #[error("store error: {0}")]
    Store(#[from] rocksdb::Error),

    #[error("record codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("duplicate key in {collection}: {key}")]
    DuplicateKey { collection: &'static str, key: String },

    #[error("restore requires a block height")]
    MissingHeight,

    #[error("invalid rescan request: {0}")]
    InvalidRescan(String),

    /// Raised by interruptible delays once the guard is aborted
    #[error("block processor aborted")]
    Aborted,

    #[error("background task failed: {0}")]
    Task(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl IndexerError {
    /// Store-level uniqueness violation surfaced at pass level.
    /// Treated as index corruption by the sync controller (deep restore).
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, IndexerError::DuplicateKey { .. })
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, IndexerError::Aborted)
    }
}

impl From<tokio::task::JoinError> for IndexerError {
    fn from(err: tokio::task::JoinError) -> Self {
        IndexerError::Task(err.to_string())
    }
}

impl From<reqwest::Error> for IndexerError {
    fn from(err: reqwest::Error) -> Self {
        IndexerError::Daemon(err.to_string())
    }
}

impl From<config::ConfigError> for IndexerError {
    fn from(err: config::ConfigError) -> Self {
        IndexerError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, IndexerError>;
