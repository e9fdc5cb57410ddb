//! Positional file I/O
//!
//! Offset-addressed reads and writes over a plain file handle, shared by the
//! data file and the metadata file. Reads and writes never move a cursor, so
//! one handle can serve concurrent callers.

use pagetick_common::{Error, Result};
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

/// Raw file handle with positional I/O
#[derive(Debug)]
pub struct RawFile {
    file: File,
    path: PathBuf,
    read_only: bool,
}

impl RawFile {
    /// Open an existing file
    pub fn open(path: impl AsRef<Path>, read_only: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut options = OpenOptions::new();
        options.read(true);
        if !read_only {
            options.write(true);
        }

        let file = options.open(&path)?;

        Ok(Self {
            file,
            path,
            read_only,
        })
    }

    /// Create (or truncate) a file and set its size
    pub fn create(path: impl AsRef<Path>, size: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        Self::sized(file, path, size)
    }

    /// Create a file that must not exist yet
    ///
    /// Fails with an `AlreadyExists` I/O error when the path is taken, which
    /// is how exclusive ownership of a file is claimed across processes.
    pub fn create_new(path: impl AsRef<Path>, size: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;

        Self::sized(file, path, size)
    }

    fn sized(file: File, path: PathBuf, size: u64) -> Result<Self> {
        file.set_len(size).map_err(|e| {
            Error::Storage(format!("failed to set size for {}: {}", path.display(), e))
        })?;

        Ok(Self {
            file,
            path,
            read_only: false,
        })
    }

    /// Get the current file size
    pub fn size(&self) -> Result<u64> {
        let metadata = self.file.metadata().map_err(|e| {
            Error::Storage(format!(
                "failed to get metadata for {}: {}",
                self.path.display(),
                e
            ))
        })?;
        Ok(metadata.len())
    }

    /// Get the file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if the handle was opened read-only
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Read up to `buf.len()` bytes at the given offset
    ///
    /// Stops early at end of file and returns the number of bytes read; the
    /// unread tail of `buf` is left untouched.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read_at(&mut buf[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    return Err(Error::Storage(format!(
                        "read failed on {}: {}",
                        self.path.display(),
                        e
                    )));
                }
            }
        }
        Ok(filled)
    }

    /// Read exactly `buf.len()` bytes at the given offset
    pub fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let n = self.read_at(offset, buf)?;
        if n < buf.len() {
            return Err(Error::Storage(format!(
                "short read on {} at offset {}: wanted {} bytes, got {}",
                self.path.display(),
                offset,
                buf.len(),
                n
            )));
        }
        Ok(())
    }

    /// Read the whole file
    pub fn read_all(&self) -> Result<Vec<u8>> {
        let size = usize::try_from(self.size()?)
            .map_err(|_| Error::storage("file too large to read into memory"))?;
        let mut buf = vec![0u8; size];
        let n = self.read_at(0, &mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Write all of `buf` at the given offset
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }

        self.file.write_all_at(buf, offset).map_err(|e| {
            Error::Storage(format!("write failed on {}: {}", self.path.display(), e))
        })
    }

    /// Sync data and metadata to disk
    pub fn sync(&self) -> Result<()> {
        self.file.sync_all().map_err(|e| {
            Error::Storage(format!("sync failed on {}: {}", self.path.display(), e))
        })
    }

    /// Sync data only (not metadata) to disk
    pub fn sync_data(&self) -> Result<()> {
        self.file.sync_data().map_err(|e| {
            Error::Storage(format!("sync_data failed on {}: {}", self.path.display(), e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_create_write_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("raw.bin");

        let file = RawFile::create(&path, 1024).unwrap();
        assert_eq!(file.size().unwrap(), 1024);

        file.write_at(512, b"hello").unwrap();
        let mut buf = [0u8; 5];
        file.read_exact_at(512, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_read_past_end_is_short() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("raw.bin");

        let file = RawFile::create(&path, 8).unwrap();
        let mut buf = [0xFFu8; 16];
        assert_eq!(file.read_at(0, &mut buf).unwrap(), 8);
        assert!(file.read_exact_at(0, &mut buf).is_err());
    }

    #[test]
    fn test_create_new_is_exclusive() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("exclusive.bin");

        let _first = RawFile::create_new(&path, 0).unwrap();
        match RawFile::create_new(&path, 0) {
            Err(Error::DiskIo(e)) => assert_eq!(e.kind(), ErrorKind::AlreadyExists),
            other => panic!("expected AlreadyExists, got {other:?}"),
        }
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ro.bin");
        RawFile::create(&path, 16).unwrap();

        let file = RawFile::open(&path, true).unwrap();
        assert!(matches!(file.write_at(0, b"x"), Err(Error::ReadOnly)));
    }
}
