use thiserror::Error;

/// Result type for chunkstore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the chunkstore library
#[derive(Error, Debug)]
pub enum Error {
    /// Every region failed a racing read of the head item
    #[error("unable to get item: {key} (all regions failed: {})", .failures.join("; "))]
    TotalUnavailability {
        /// Logical key that could not be read
        key: String,
        /// One entry per region describing why it failed
        failures: Vec<String>,
    },

    /// A head item references a block that could not be fetched or decoded
    #[error("block {index} of {metadata} for key {key} is unreadable: {reason}")]
    BlockCorruption {
        /// Logical key whose head item holds the marker
        key: String,
        /// The original marker string, suitable for `ChunkStore::clean`
        metadata: String,
        /// Index of the first unreadable block
        index: u64,
        /// Why the block was unreadable
        reason: String,
    },

    /// A block write failed part way through a put
    #[error("put of {key} failed writing block {index} of {block_id}: {reason}")]
    PartialWriteFailure {
        /// Logical key being written
        key: String,
        /// Block namespace id of the aborted write
        block_id: String,
        /// Index of the failing block
        index: u64,
        /// Why the write failed
        reason: String,
    },

    /// A call against a single region failed
    #[error("{operation} in region {region} failed: {reason}")]
    RegionFailure {
        /// Region the call was sent to
        region: String,
        /// Wire operation name
        operation: String,
        /// HTTP status or transport reason
        reason: String,
    },

    /// A block metadata marker string is malformed
    #[error("Invalid block metadata: {0}")]
    InvalidMarker(String),

    /// An item returned by the store could not be decoded
    #[error("Invalid item: {0}")]
    InvalidItem(String),

    /// Configuration is incomplete or inconsistent
    #[error("Configuration error: {0}")]
    Config(String),

    /// The HTTP transport could not complete a request
    #[error("Transport error: {0}")]
    Transport(String),

    /// Errors related to JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<Box<dyn std::error::Error + Send + Sync>> for Error {
    fn from(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        Error::Transport(err.to_string())
    }
}

impl Error {
    /// Returns true when the error means stored data is inconsistent and the
    /// caller should consider re-putting the key or cleaning its blocks
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::BlockCorruption { .. } | Error::PartialWriteFailure { .. })
    }
}
