//! Paged data file
//!
//! Provides page-granular access to the data file:
//! - Creation with a superblock in page 0
//! - Page read/write by page number
//! - Superblock refresh on close

use crate::layout::{FIRST_DATA_PAGE, Superblock, pages_for};
use crate::raw_io::RawFile;
use bytes::{Bytes, BytesMut};
use pagetick_common::{AccessMode, Error, FileCreateProps, FileSpaceStrategy, Result};
use parking_lot::RwLock;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;
use uuid::Uuid;

/// A data file opened for page access
#[derive(Debug)]
pub struct DataFile {
    /// Raw file handle
    file: RawFile,
    /// Superblock (cached)
    superblock: RwLock<Superblock>,
    /// Statistics
    stats: DataFileStats,
}

/// Data file statistics
#[derive(Debug, Default)]
pub struct DataFileStats {
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
}

impl DataFile {
    /// Create a new data file, truncating anything at `path`
    pub fn create(path: impl AsRef<Path>, props: &FileCreateProps) -> Result<Self> {
        Self::create_with_uuid(path, props, Uuid::new_v4())
    }

    /// Create a new data file with a caller-chosen UUID
    pub fn create_with_uuid(
        path: impl AsRef<Path>,
        props: &FileCreateProps,
        file_uuid: Uuid,
    ) -> Result<Self> {
        props.validate()?;

        let mut superblock = Superblock::new(props.page_size, props.space_strategy)?;
        superblock.file_uuid = file_uuid;
        superblock.update_checksum();
        let file = RawFile::create(&path, u64::from(props.page_size))?;
        file.write_at(0, &superblock.to_bytes())?;
        file.sync()?;

        debug!(
            "Created data file {} (page size {}, {} strategy)",
            file.path().display(),
            props.page_size,
            props.space_strategy
        );

        Ok(Self {
            file,
            superblock: RwLock::new(superblock),
            stats: DataFileStats::default(),
        })
    }

    /// Open an existing data file
    pub fn open(path: impl AsRef<Path>, mode: AccessMode) -> Result<Self> {
        let file = RawFile::open(&path, !mode.is_writable())?;

        let mut buf = vec![0u8; Superblock::ENCODED_SIZE];
        file.read_exact_at(0, &mut buf)?;
        let superblock = Superblock::from_bytes(&buf)?;

        Ok(Self {
            file,
            superblock: RwLock::new(superblock),
            stats: DataFileStats::default(),
        })
    }

    /// Get the file path
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Check if the file was opened read-only
    pub fn is_read_only(&self) -> bool {
        self.file.is_read_only()
    }

    /// Get a copy of the cached superblock
    pub fn superblock(&self) -> Superblock {
        self.superblock.read().clone()
    }

    /// Get the page size
    pub fn page_size(&self) -> u32 {
        self.superblock.read().page_size
    }

    /// Get the space strategy chosen at creation
    pub fn space_strategy(&self) -> FileSpaceStrategy {
        self.superblock.read().space_strategy
    }

    /// Get the file UUID
    pub fn file_uuid(&self) -> Uuid {
        self.superblock.read().file_uuid
    }

    /// Number of pages currently in the file, superblock included
    pub fn page_count(&self) -> Result<u64> {
        let page_size = self.page_size();
        let on_disk = pages_for(self.file.size()?, page_size);
        Ok(on_disk.max(self.superblock.read().page_count))
    }

    /// Get statistics
    pub fn stats(&self) -> &DataFileStats {
        &self.stats
    }

    /// Byte offset of a data page
    fn page_start(page: u64, page_size: u32) -> Result<u64> {
        if page < FIRST_DATA_PAGE {
            return Err(Error::invalid_argument(format!(
                "page {page} holds the superblock"
            )));
        }
        page.checked_mul(u64::from(page_size)).ok_or_else(|| {
            Error::invalid_argument(format!("page {page} lies past the largest file offset"))
        })
    }

    /// Read a page
    ///
    /// Pages past the end of the file read as zeros.
    pub fn read_page(&self, page: u64) -> Result<Bytes> {
        let page_size = self.page_size();
        let start = Self::page_start(page, page_size)?;
        let mut buf = BytesMut::zeroed(page_size as usize);
        let n = self.file.read_at(start, &mut buf)?;

        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        self.stats.bytes_read.fetch_add(n as u64, Ordering::Relaxed);

        Ok(buf.freeze())
    }

    /// Write a full page
    pub fn write_page(&self, page: u64, data: &[u8]) -> Result<()> {
        let page_size = self.page_size();
        let start = Self::page_start(page, page_size)?;
        if data.len() != page_size as usize {
            return Err(Error::invalid_argument(format!(
                "page {} write of {} bytes, page size is {}",
                page,
                data.len(),
                page_size
            )));
        }

        self.file.write_at(start, data)?;

        {
            let mut sb = self.superblock.write();
            sb.page_count = sb.page_count.max(page + 1);
        }

        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_written
            .fetch_add(data.len() as u64, Ordering::Relaxed);

        Ok(())
    }

    /// Sync all pending writes to disk
    pub fn sync(&self) -> Result<()> {
        self.file.sync()
    }

    /// Rewrite the superblock with the current page count and sync
    pub fn update_superblock(&self) -> Result<()> {
        let page_count = self.page_count()?;
        let mut sb = self.superblock.write();
        sb.record_close(page_count);

        self.file.write_at(0, &sb.to_bytes())?;
        self.file.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use tempfile::tempdir;

    #[test]
    fn test_create_and_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.pgt");

        let uuid = {
            let file = DataFile::create(&path, &FileCreateProps::paged(512)).unwrap();
            assert_eq!(file.page_size(), 512);
            assert_eq!(file.page_count().unwrap(), 1);
            file.file_uuid()
        };

        let file = DataFile::open(&path, AccessMode::ReadOnly).unwrap();
        assert_eq!(file.file_uuid(), uuid);
        assert_eq!(file.space_strategy(), FileSpaceStrategy::Paged);
        assert!(file.is_read_only());
    }

    #[test]
    fn test_page_write_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.pgt");
        let file = DataFile::create(&path, &FileCreateProps::paged(512)).unwrap();

        let mut page = vec![0u8; 512];
        rand::thread_rng().fill(&mut page[..]);
        file.write_page(3, &page).unwrap();

        assert_eq!(file.read_page(3).unwrap().as_ref(), page.as_slice());
        assert_eq!(file.page_count().unwrap(), 4);
        // Gap pages read as zeros
        assert!(file.read_page(2).unwrap().iter().all(|&b| b == 0));
        assert!(file.read_page(10).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_superblock_page_not_addressable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.pgt");
        let file = DataFile::create(&path, &FileCreateProps::paged(512)).unwrap();

        assert!(matches!(file.read_page(0), Err(Error::InvalidArgument(_))));
        assert!(matches!(
            file.write_page(0, &[0u8; 512]),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            file.write_page(1, &[0u8; 100]),
            Err(Error::InvalidArgument(_))
        ));

        // Byte offset does not fit in u64
        assert!(matches!(
            file.read_page(u64::MAX),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_update_superblock_persists_page_count() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.pgt");
        {
            let file = DataFile::create(&path, &FileCreateProps::paged(512)).unwrap();
            file.write_page(5, &[7u8; 512]).unwrap();
            file.update_superblock().unwrap();
        }

        let file = DataFile::open(&path, AccessMode::ReadWrite).unwrap();
        let sb = file.superblock();
        assert_eq!(sb.page_count, 6);
        assert_eq!(sb.close_count, 1);
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.pgt");
        DataFile::create(&path, &FileCreateProps::paged(512)).unwrap();

        let file = DataFile::open(&path, AccessMode::ReadOnly).unwrap();
        assert!(matches!(
            file.write_page(1, &[0u8; 512]),
            Err(Error::ReadOnly)
        ));
    }
}
