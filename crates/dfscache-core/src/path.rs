//! Deterministic local cache paths
//!
//! Cached files are stored under the configured root in a two-level
//! directory structure derived from the SHA-256 of the owning file system
//! and the remote path, for even distribution.
//!
//! # File Layout
//! ```text
//! <root>/
//! └── ab/
//!     └── cd/
//!         └── ef123456...      # cached file
//!         └── ef123456....tmp  # staging file during download
//! ```

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::types::FileSystemDescriptor;

/// Extension used for staging files that are renamed into place on success
pub const STAGING_EXTENSION: &str = "tmp";

/// Deterministic local path for a remote file.
///
/// The same (descriptor, remote path) pair always maps to the same local
/// path, across restarts.
pub fn local_cache_path(
    root: &Path,
    descriptor: &FileSystemDescriptor,
    remote_path: &str,
) -> PathBuf {
    let mut hasher = Sha256::new();
    hasher.update(descriptor.key().as_bytes());
    hasher.update([0u8]);
    hasher.update(remote_path.as_bytes());
    let hash = hex::encode(hasher.finalize());

    // SHA-256 yields 64 hex characters; two-level fan-out keeps directories small
    let dir1 = &hash[0..2];
    let dir2 = &hash[2..4];
    let filename = &hash[4..];

    root.join(dir1).join(dir2).join(filename)
}

/// Staging sibling of a cache path, written during download and renamed
/// into place on success
pub fn staging_path(final_path: &Path) -> PathBuf {
    final_path.with_extension(STAGING_EXTENSION)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> FileSystemDescriptor {
        FileSystemDescriptor::new("hdfs", "nn1", 8020)
    }

    #[test]
    fn test_path_deterministic() {
        let root = Path::new("/cache");
        let a = local_cache_path(root, &descriptor(), "/data/part-0001.parquet");
        let b = local_cache_path(root, &descriptor(), "/data/part-0001.parquet");
        assert_eq!(a, b);
        assert!(a.starts_with(root));
    }

    #[test]
    fn test_path_distinct_per_file_and_remote() {
        let root = Path::new("/cache");
        let a = local_cache_path(root, &descriptor(), "/data/a.dat");
        let b = local_cache_path(root, &descriptor(), "/data/b.dat");
        assert_ne!(a, b);

        let other = FileSystemDescriptor::new("hdfs", "nn2", 8020);
        let c = local_cache_path(root, &other, "/data/a.dat");
        assert_ne!(a, c);
    }

    #[test]
    fn test_two_level_layout() {
        let root = Path::new("/cache");
        let p = local_cache_path(root, &descriptor(), "/x");
        let rel: Vec<_> = p.strip_prefix(root).unwrap().components().collect();
        assert_eq!(rel.len(), 3);
    }

    #[test]
    fn test_staging_path_sibling() {
        let root = Path::new("/cache");
        let p = local_cache_path(root, &descriptor(), "/x");
        let s = staging_path(&p);
        assert_eq!(s.parent(), p.parent());
        assert_eq!(s.extension().unwrap(), "tmp");
        assert_ne!(s, p);
    }
}
