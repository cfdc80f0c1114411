use thiserror::Error;
use tracing::{debug, error};

/// Errors surfaced by the allocator and the cached-range index.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("allocation of {requested} bytes cannot be satisfied (capacity {capacity})")]
    OutOfCapacity { requested: usize, capacity: usize },

    #[error("invalid cache configuration: {0}")]
    InvalidConfig(String),
}

/// Errors surfaced while materializing compressed streams into the cache.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("malformed compression block at offset {offset}: {reason}")]
    BadFormat { offset: u64, reason: String },

    #[error("input ended inside the compression block starting at offset {offset}")]
    Truncated { offset: u64 },

    #[error("seek offset {0} does not fall on a compression block boundary")]
    InvalidSeek(u64),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
}

impl StreamError {
    pub fn log_error(&self) {
        match self {
            StreamError::BadFormat { offset, reason } => {
                error!(target: "striadb::stream", offset, reason = %reason, "Malformed compression block");
            }
            StreamError::Truncated { offset } => {
                error!(target: "striadb::stream", offset, "Truncated compression block");
            }
            StreamError::InvalidSeek(offset) => {
                error!(target: "striadb::stream", offset, "Seek off compression block boundary");
            }
            StreamError::Io(e) => {
                error!(target: "striadb::stream", error = %e, "Stream read failed");
                debug!(target: "striadb::stream", error = ?e, "Stream read error details");
            }
            StreamError::Cache(e) => {
                error!(target: "striadb::stream", error = %e, "Cache rejected stream buffers");
            }
        }
    }
}
