//! Error taxonomy shared by the chain source, the ledger repository and the engine

/// Failure of a single call against the remote chain source
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl SourceError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, SourceError::NotFound(_))
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            SourceError::Malformed(e.to_string())
        } else {
            // Timeouts, refused connections and broken bodies all land here
            SourceError::Transport(e.to_string())
        }
    }
}

impl From<serde_json::Error> for SourceError {
    fn from(e: serde_json::Error) -> Self {
        SourceError::Malformed(e.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("chain source: {0}")]
    Source(#[from] SourceError),

    #[error("block {0} is already indexed")]
    Conflict(String),

    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] duckdb::Error),

    #[error("block {hash} has height {found}, expected {expected}")]
    OutOfOrder {
        hash: String,
        expected: i64,
        found: i64,
    },

    #[error("shutdown requested")]
    Cancelled,
}

impl IndexError {
    /// Whether the error must halt the process rather than be retried in place.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, IndexError::Cancelled)
    }
}

pub type IndexResult<T> = std::result::Result<T, IndexError>;
