//! File-based storage backend for persistent arenas.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// A file-based storage backend.
///
/// The file only ever grows: appends go to the end and existing bytes are
/// never rewritten, so an offset handed out once stays valid for the life of
/// the file.
///
/// # Durability
///
/// - `flush()` pushes buffered bytes to the OS
/// - `sync()` calls `File::sync_all()` so data and length are on disk
///
/// # Example
///
/// ```no_run
/// use stratadb_storage::{StorageBackend, FileBackend};
/// use std::path::Path;
///
/// let mut backend = FileBackend::open(Path::new("arena.db")).unwrap();
/// let offset = backend.append(b"node bytes").unwrap();
/// backend.sync().unwrap();
/// ```
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    file: Mutex<File>,
    len: AtomicU64,
}

impl FileBackend {
    /// Opens the file at `path`, creating it if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or created.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Self::from_file(path, file)
    }

    /// Opens an existing file, failing if it is missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the file does not exist or cannot be opened.
    pub fn open_existing(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Self::from_file(path, file)
    }

    /// Opens or creates the file, creating parent directories if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if directories cannot be created or the file cannot be opened.
    pub fn open_with_create_dirs(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::open(path)
    }

    fn from_file(path: &Path, file: File) -> StorageResult<Self> {
        let len = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            len: AtomicU64::new(len),
        })
    }

    /// Returns the path to the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StorageBackend for FileBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let size = self.len.load(Ordering::Acquire);
        let end = offset.saturating_add(len as u64);
        if offset > size || end > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }

        let mut buffer = vec![0u8; len];
        if len > 0 {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut buffer)?;
        }
        Ok(buffer)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let mut file = self.file.lock();
        let offset = self.len.load(Ordering::Acquire);
        if !data.is_empty() {
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(data)?;
            // publish the new length only once the bytes are in place
            self.len.store(offset + data.len() as u64, Ordering::Release);
        }
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.file.lock().flush()?;
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.len.load(Ordering::Acquire))
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_open_creates_empty_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("arena.db");

        let backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.size().unwrap(), 0);
        assert!(path.exists());
        assert_eq!(backend.path(), path);
    }

    #[test]
    fn file_open_existing_requires_file() {
        let dir = tempdir().unwrap();
        let result = FileBackend::open_existing(&dir.path().join("missing.db"));
        assert!(matches!(result, Err(StorageError::Io(_))));
    }

    #[test]
    fn file_appends_are_contiguous() {
        let dir = tempdir().unwrap();
        let mut backend = FileBackend::open(&dir.path().join("arena.db")).unwrap();

        assert_eq!(backend.append(b"abc").unwrap(), 0);
        assert_eq!(backend.append(b"defgh").unwrap(), 3);
        assert_eq!(backend.append(b"").unwrap(), 8);
        assert_eq!(backend.read_at(2, 4).unwrap(), b"cdef");
        assert!(backend.read_at(2, 0).unwrap().is_empty());
    }

    #[test]
    fn file_read_past_end_fails() {
        let dir = tempdir().unwrap();
        let mut backend = FileBackend::open(&dir.path().join("arena.db")).unwrap();
        backend.append(b"hello").unwrap();

        assert!(matches!(
            backend.read_at(4, 2),
            Err(StorageError::ReadPastEnd { size: 5, .. })
        ));
    }

    #[test]
    fn file_reopen_continues_at_end() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("arena.db");

        {
            let mut backend = FileBackend::open(&path).unwrap();
            backend.append(b"generation-1").unwrap();
            backend.sync().unwrap();
        }

        let mut backend = FileBackend::open_existing(&path).unwrap();
        assert_eq!(backend.size().unwrap(), 12);
        let offset = backend.append(b"generation-2").unwrap();
        assert_eq!(offset, 12);
        backend.flush().unwrap();
        assert_eq!(backend.read_at(0, 12).unwrap(), b"generation-1");
        assert_eq!(backend.read_at(12, 12).unwrap(), b"generation-2");
    }

    #[test]
    fn file_create_with_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("path").join("arena.db");

        let backend = FileBackend::open_with_create_dirs(&path).unwrap();
        assert_eq!(backend.size().unwrap(), 0);
        assert!(path.exists());
    }
}
