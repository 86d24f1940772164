//! Error types for the cache layer

use thiserror::Error;

/// Errors surfaced by the cache manager and its modules
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("cache manager is not initialized")]
    NotInitialized,

    #[error("cache manager is already initialized")]
    AlreadyInitialized,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("failed to connect to remote file system: {0}")]
    Connect(String),

    #[error("remote file system error: {0}")]
    Remote(String),

    #[error("local I/O error: {0}")]
    LocalIo(String),

    #[error("operation canceled")]
    Canceled,

    #[error("cache manager is shutting down")]
    Shutdown,

    #[error("internal invariant broken: {0}")]
    Internal(String),
}

/// Errors reported by a DFS client implementation.
///
/// The SDK behind the `DfsClient` seam reports these; the cache layer maps
/// them onto [`CacheError`] before they reach a caller.
#[derive(Error, Debug, Clone)]
pub enum DfsError {
    #[error("remote path not found: {0}")]
    NotFound(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("remote I/O failed: {0}")]
    Io(String),

    #[error("operation not supported: {0}")]
    Unsupported(String),
}

impl From<DfsError> for CacheError {
    fn from(e: DfsError) -> Self {
        match e {
            DfsError::NotFound(p) => CacheError::NotFound(p),
            DfsError::Connect(msg) => CacheError::Connect(msg),
            DfsError::Io(msg) => CacheError::Remote(msg),
            DfsError::Unsupported(msg) => CacheError::Remote(msg),
        }
    }
}

impl From<std::io::Error> for CacheError {
    fn from(e: std::io::Error) -> Self {
        CacheError::LocalIo(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dfs_error_mapping() {
        let e: CacheError = DfsError::NotFound("/a".into()).into();
        assert!(matches!(e, CacheError::NotFound(_)));

        let e: CacheError = DfsError::Connect("refused".into()).into();
        assert!(matches!(e, CacheError::Connect(_)));

        let e: CacheError = DfsError::Io("reset".into()).into();
        assert!(matches!(e, CacheError::Remote(_)));
    }

    #[test]
    fn test_display_messages() {
        let e = CacheError::InvalidArgument("empty path list".into());
        assert_eq!(e.to_string(), "invalid argument: empty path list");
        assert_eq!(CacheError::Canceled.to_string(), "operation canceled");
    }
}
