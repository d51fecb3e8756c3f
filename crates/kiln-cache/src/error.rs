//! Error types for the materialization layer.

use thiserror::Error;

/// Errors surfaced by the disk cache and materialization driver.
///
/// Clone: one fetch outcome is broadcast to every waiter on the key.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The remote store has no value under the requested key.
    #[error("not found in remote store")]
    NotFound,

    /// Network or HTTP-level failure talking to the remote store.
    #[error("remote store transport error: {0}")]
    Transport(String),

    /// The fetched blob is not a decodable cache entry.
    #[error("malformed cache entry: {0}")]
    Malformed(String),

    /// A local disk operation failed.
    #[error("disk error: {0}")]
    Io(String),

    /// This caller's wait on an in-flight fetch expired. The fetch itself
    /// keeps running for the other waiters.
    #[error("timed out waiting for object fetch")]
    Timeout,
}

/// Result type for materialization operations.
pub type Result<T> = std::result::Result<T, CacheError>;
