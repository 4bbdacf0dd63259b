//! Document root resolution and read-only file mapping.
//!
//! A validated request target is appended to the document root, checked with
//! `stat`, and mapped into memory. The mapping lives in a `MappedFile` owned
//! by the connection and is released when that value is dropped.

use memmap2::Mmap;
use std::fs::{self, File};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Longest resolved path, including the document root.
pub const FILENAME_LEN: usize = 200;

/// Served for targets that name a directory with a trailing slash.
const INDEX_FILE: &str = "index.html";

/// World-readable permission bit.
const OTHER_READ: u32 = 0o004;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no such file: {0}")]
    NotFound(PathBuf),
    #[error("file is not world-readable: {0}")]
    Forbidden(PathBuf),
    #[error("target is a directory: {0}")]
    IsDirectory(PathBuf),
    #[error("resolved path exceeds {FILENAME_LEN} bytes")]
    PathTooLong,
    #[error("target escapes the document root: {0}")]
    Traversal(String),
    #[error("failed to map {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

/// A read-only view of a file's bytes.
///
/// Empty files carry no mapping.
#[derive(Debug)]
pub struct MappedFile {
    map: Option<Mmap>,
}

impl MappedFile {
    fn open(path: &Path, len: u64) -> io::Result<Self> {
        if len == 0 {
            return Ok(Self { map: None });
        }
        let file = File::open(path)?;
        // SAFETY: read-only mapping; served files must not be truncated
        // while a response referencing them is in flight.
        let map = unsafe { Mmap::map(&file)? };
        Ok(Self { map: Some(map) })
    }

    pub fn len(&self) -> usize {
        self.map.as_ref().map_or(0, |m| m.len())
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.map.as_deref().unwrap_or(&[])
    }
}

/// The directory all request targets are resolved against.
#[derive(Debug, Clone)]
pub struct DocRoot {
    root: PathBuf,
}

impl DocRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Map `target` (which starts with `/`) to a file under the root.
    pub fn resolve(&self, target: &str) -> Result<MappedFile, ResolveError> {
        if target.split('/').any(|segment| segment == "..") {
            return Err(ResolveError::Traversal(target.to_string()));
        }

        let mut real = self.root.as_os_str().to_os_string();
        real.push(target);
        if target.ends_with('/') {
            real.push(INDEX_FILE);
        }
        if real.len() >= FILENAME_LEN {
            return Err(ResolveError::PathTooLong);
        }
        let real = PathBuf::from(real);

        let meta = fs::metadata(&real).map_err(|_| ResolveError::NotFound(real.clone()))?;
        if meta.permissions().mode() & OTHER_READ == 0 {
            return Err(ResolveError::Forbidden(real));
        }
        if meta.is_dir() {
            return Err(ResolveError::IsDirectory(real));
        }

        MappedFile::open(&real, meta.len()).map_err(|source| ResolveError::Io { path: real, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::Permissions;

    fn write_file(dir: &Path, name: &str, contents: &[u8], mode: u32) {
        let path = dir.join(name);
        fs::write(&path, contents).unwrap();
        fs::set_permissions(&path, Permissions::from_mode(mode)).unwrap();
    }

    #[test]
    fn test_resolve_maps_file() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "hello.html", b"<p>hello</p>", 0o644);

        let root = DocRoot::new(dir.path());
        let file = root.resolve("/hello.html").unwrap();
        assert_eq!(file.len(), 12);
        assert_eq!(file.as_bytes(), b"<p>hello</p>");
    }

    #[test]
    fn test_trailing_slash_serves_index() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "index.html", b"index", 0o644);

        let root = DocRoot::new(dir.path());
        assert_eq!(root.resolve("/").unwrap().as_bytes(), b"index");
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let root = DocRoot::new(dir.path());
        assert!(matches!(
            root.resolve("/missing.html"),
            Err(ResolveError::NotFound(_))
        ));
    }

    #[test]
    fn test_not_world_readable() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "secret.html", b"secret", 0o600);

        let root = DocRoot::new(dir.path());
        assert!(matches!(
            root.resolve("/secret.html"),
            Err(ResolveError::Forbidden(_))
        ));
    }

    #[test]
    fn test_directory_target() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("docs");
        fs::create_dir(&sub).unwrap();
        fs::set_permissions(&sub, Permissions::from_mode(0o755)).unwrap();

        let root = DocRoot::new(dir.path());
        assert!(matches!(
            root.resolve("/docs"),
            Err(ResolveError::IsDirectory(_))
        ));
    }

    #[test]
    fn test_path_too_long() {
        let root = DocRoot::new("/srv/www");
        let target = format!("/{}", "a".repeat(FILENAME_LEN));
        assert!(matches!(
            root.resolve(&target),
            Err(ResolveError::PathTooLong)
        ));
    }

    #[test]
    fn test_traversal_rejected() {
        let root = DocRoot::new("/srv/www");
        assert!(matches!(
            root.resolve("/../etc/passwd"),
            Err(ResolveError::Traversal(_))
        ));
    }

    #[test]
    fn test_empty_file_has_no_mapping() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "empty.html", b"", 0o644);

        let root = DocRoot::new(dir.path());
        let file = root.resolve("/empty.html").unwrap();
        assert!(file.is_empty());
        assert_eq!(file.as_bytes(), b"");
    }
}
