//! DFS client seam
//!
//! The cache layer does not implement a distributed file system client; it
//! consumes one through the traits here. A production deployment plugs in a
//! vendor SDK; tests and local development use [`LocalDfs`], which serves a
//! directory tree through the same interface.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::debug;

use dfscache_core::types::FileSystemDescriptor;
use dfscache_core::DfsError;

/// Metadata for a remote path
#[derive(Clone, Debug)]
pub struct RemoteStat {
    /// Remote path the record describes
    pub path: String,
    /// Size in bytes
    pub size: u64,
    /// Modification time, milliseconds since the epoch
    pub modified_ms: u64,
    /// Whether the path is a directory
    pub is_dir: bool,
}

/// An open remote file stream
pub trait DfsFile: Send {
    /// Read into `buf` from the current offset; 0 means end of file
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, DfsError>;

    /// Positional read that does not move the current offset
    fn pread(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, DfsError>;

    /// Write from `buf` at the current offset
    fn write(&mut self, buf: &[u8]) -> Result<usize, DfsError>;

    /// Seek to an absolute offset
    fn seek(&mut self, offset: u64) -> Result<(), DfsError>;

    /// Current offset
    fn tell(&mut self) -> Result<u64, DfsError>;
}

/// A connected client handle for one remote file system.
///
/// Handles are not shared between threads; the connection pool hands each
/// borrower exclusive access until release.
pub trait DfsClient: Send {
    /// Stat a remote path
    fn stat(&mut self, path: &str) -> Result<RemoteStat, DfsError>;

    /// Check whether a remote path exists
    fn exists(&mut self, path: &str) -> Result<bool, DfsError>;

    /// Open a remote file for reading
    fn open(&mut self, path: &str) -> Result<Box<dyn DfsFile>, DfsError>;

    /// Create a remote file for writing
    fn create(&mut self, path: &str) -> Result<Box<dyn DfsFile>, DfsError>;

    /// Rename a remote path
    fn rename(&mut self, from: &str, to: &str) -> Result<(), DfsError>;

    /// Delete a remote path
    fn delete(&mut self, path: &str) -> Result<(), DfsError>;
}

/// Creates client handles from a descriptor; the connect seam of the SDK
pub trait DfsClientFactory: Send + Sync {
    fn connect(&self, descriptor: &FileSystemDescriptor) -> Result<Box<dyn DfsClient>, DfsError>;
}

// === Local directory-backed implementation ===

/// A DFS client serving a local directory tree.
///
/// Remote paths are resolved relative to the configured root.
pub struct LocalDfs {
    root: PathBuf,
}

impl LocalDfs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

impl DfsClient for LocalDfs {
    fn stat(&mut self, path: &str) -> Result<RemoteStat, DfsError> {
        let full = self.resolve(path);
        let meta = std::fs::metadata(&full).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DfsError::NotFound(path.to_string())
            } else {
                DfsError::Io(e.to_string())
            }
        })?;

        let modified_ms = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        Ok(RemoteStat {
            path: path.to_string(),
            size: meta.len(),
            modified_ms,
            is_dir: meta.is_dir(),
        })
    }

    fn exists(&mut self, path: &str) -> Result<bool, DfsError> {
        Ok(self.resolve(path).exists())
    }

    fn open(&mut self, path: &str) -> Result<Box<dyn DfsFile>, DfsError> {
        let full = self.resolve(path);
        let file = File::open(&full).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DfsError::NotFound(path.to_string())
            } else {
                DfsError::Io(e.to_string())
            }
        })?;
        Ok(Box::new(LocalDfsFile { file }))
    }

    fn create(&mut self, path: &str) -> Result<Box<dyn DfsFile>, DfsError> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).map_err(|e| DfsError::Io(e.to_string()))?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&full)
            .map_err(|e| DfsError::Io(e.to_string()))?;
        Ok(Box::new(LocalDfsFile { file }))
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<(), DfsError> {
        std::fs::rename(self.resolve(from), self.resolve(to))
            .map_err(|e| DfsError::Io(e.to_string()))
    }

    fn delete(&mut self, path: &str) -> Result<(), DfsError> {
        let full = self.resolve(path);
        let res = if full.is_dir() {
            std::fs::remove_dir_all(&full)
        } else {
            std::fs::remove_file(&full)
        };
        res.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DfsError::NotFound(path.to_string())
            } else {
                DfsError::Io(e.to_string())
            }
        })
    }
}

struct LocalDfsFile {
    file: File,
}

impl DfsFile for LocalDfsFile {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, DfsError> {
        self.file.read(buf).map_err(|e| DfsError::Io(e.to_string()))
    }

    fn pread(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, DfsError> {
        let pos = self
            .file
            .stream_position()
            .map_err(|e| DfsError::Io(e.to_string()))?;
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| DfsError::Io(e.to_string()))?;
        let n = self.file.read(buf).map_err(|e| DfsError::Io(e.to_string()))?;
        self.file
            .seek(SeekFrom::Start(pos))
            .map_err(|e| DfsError::Io(e.to_string()))?;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, DfsError> {
        self.file.write(buf).map_err(|e| DfsError::Io(e.to_string()))
    }

    fn seek(&mut self, offset: u64) -> Result<(), DfsError> {
        self.file
            .seek(SeekFrom::Start(offset))
            .map(|_| ())
            .map_err(|e| DfsError::Io(e.to_string()))
    }

    fn tell(&mut self) -> Result<u64, DfsError> {
        self.file
            .stream_position()
            .map_err(|e| DfsError::Io(e.to_string()))
    }
}

/// Factory mapping descriptors to local directory roots.
///
/// Unregistered descriptors fail to connect, which mirrors an unreachable
/// remote.
#[derive(Default)]
pub struct LocalDfsFactory {
    roots: RwLock<HashMap<String, PathBuf>>,
}

impl LocalDfsFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `root` for connections matching `descriptor`
    pub fn register(&self, descriptor: &FileSystemDescriptor, root: impl AsRef<Path>) {
        debug!("registering local backend {} -> {:?}", descriptor, root.as_ref());
        self.roots
            .write()
            .insert(descriptor.key(), root.as_ref().to_path_buf());
    }
}

impl DfsClientFactory for LocalDfsFactory {
    fn connect(&self, descriptor: &FileSystemDescriptor) -> Result<Box<dyn DfsClient>, DfsError> {
        let roots = self.roots.read();
        match roots.get(&descriptor.key()) {
            Some(root) => Ok(Box::new(LocalDfs::new(root.clone()))),
            None => Err(DfsError::Connect(format!(
                "no backend registered for {}",
                descriptor
            ))),
        }
    }
}
