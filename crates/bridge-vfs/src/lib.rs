//! Sandboxed filesystem view with a path whitelist and optional read-only
//! enforcement.
//!
//! [`SafeFs`] resolves request paths lexically (no filesystem access during
//! resolution, which protects against symlink probing), rejects traversal
//! above the root, applies an optional whitelist of allowed prefixes, and
//! can wrap returned handles so every write fails.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod error;
mod path;

pub use error::{VfsError, VfsResult};
pub use path::normalize;

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A read-only filesystem view rooted at a directory.
#[derive(Debug, Clone)]
pub struct SafeFs {
    root: PathBuf,
    whitelist: Vec<PathBuf>,
    read_only: bool,
}

impl SafeFs {
    /// Create a view rooted at `root` with no whitelist, read-only.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            whitelist: Vec::new(),
            read_only: true,
        }
    }

    /// Restrict access to paths equal to or below the given relative
    /// prefixes. An empty whitelist permits every path under the root.
    #[must_use]
    pub fn with_whitelist<I, P>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.whitelist = entries.into_iter().map(Into::into).collect();
        self
    }

    /// Toggle write rejection on returned handles.
    #[must_use]
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// The sandbox root on the host filesystem.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a request path to a host path without opening it.
    ///
    /// # Errors
    ///
    /// Returns [`VfsError::PermissionDenied`] when the normalized path
    /// would escape the root or misses the whitelist.
    pub fn resolve(&self, name: &str) -> VfsResult<PathBuf> {
        let normalized = normalize(name)?;

        if !self.whitelist.is_empty() {
            let allowed = self.whitelist.iter().any(|entry| {
                normalized == *entry || normalized.starts_with(entry)
            });
            if !allowed {
                return Err(VfsError::PermissionDenied(format!(
                    "path not in whitelist: {name}"
                )));
            }
        }

        Ok(self.root.join(normalized))
    }

    /// Open a file inside the sandbox.
    ///
    /// # Errors
    ///
    /// Returns [`VfsError::PermissionDenied`] on traversal or whitelist
    /// misses, [`VfsError::NotFound`] when the file does not exist.
    pub fn open(&self, name: &str) -> VfsResult<SafeFile> {
        let host_path = self.resolve(name)?;
        let file = File::open(&host_path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => VfsError::NotFound(name.to_string()),
            _ => VfsError::Io(e),
        })?;
        Ok(SafeFile {
            inner: file,
            writable: !self.read_only,
        })
    }

    /// Read a whole file inside the sandbox.
    ///
    /// # Errors
    ///
    /// Same as [`open`](Self::open), plus I/O failures while reading.
    pub fn read(&self, name: &str) -> VfsResult<Vec<u8>> {
        let mut file = self.open(name)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).map_err(VfsError::Io)?;
        Ok(buf)
    }
}

/// A file handle whose write surface can be disabled.
#[derive(Debug)]
pub struct SafeFile {
    inner: File,
    writable: bool,
}

impl Read for SafeFile {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Seek for SafeFile {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.inner.seek(pos)
    }
}

impl Write for SafeFile {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if !self.writable {
            return Err(std::io::Error::other(VfsError::WriteNotPermitted));
        }
        self.inner.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if !self.writable {
            return Err(std::io::Error::other(VfsError::WriteNotPermitted));
        }
        self.inner.flush()
    }
}
