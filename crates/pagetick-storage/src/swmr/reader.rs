//! Metadata file reader
//!
//! Loads the header, then the index it points to. A writer never reuses a
//! slot or index region before `max_lag` ticks have passed, so a reader that
//! keeps up with the ticks always reads a consistent pair.

use super::codec::{HEADER_SIZE, IndexEntry, MetadataHeader, MetadataIndex, MetadataSnapshot};
use crate::raw_io::RawFile;
use bytes::{Bytes, BytesMut};
use pagetick_common::{Error, Result, SwmrConfig};
use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::Path;
use tracing::debug;
use uuid::Uuid;

/// Reader side of a metadata file
#[derive(Debug)]
pub struct MetadataReader {
    file: RawFile,
    page_size: u32,
    file_uuid: Uuid,
    snapshot: MetadataSnapshot,
}

impl MetadataReader {
    /// Open the metadata file read-only and load the current snapshot
    ///
    /// A missing metadata file means no writer has the data file open.
    pub fn open(config: &SwmrConfig, page_size: u32, file_uuid: Uuid) -> Result<Self> {
        let path = config.md_file_path();
        let file = RawFile::open(path, true).map_err(|e| match e {
            Error::DiskIo(io) if io.kind() == ErrorKind::NotFound => Error::NoWriterPresent {
                md_file_path: path.to_path_buf(),
            },
            other => other,
        })?;

        let mut reader = Self {
            file,
            page_size,
            file_uuid,
            snapshot: MetadataSnapshot::Unpublished,
        };
        reader.snapshot = reader.load()?;

        debug!(
            "Opened metadata file {} at {}",
            path.display(),
            reader.snapshot.tick_num()
        );
        Ok(reader)
    }

    /// Metadata file path
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// The snapshot loaded by the last refresh
    pub fn snapshot(&self) -> &MetadataSnapshot {
        &self.snapshot
    }

    /// Read the snapshot currently on disk
    pub fn load(&self) -> Result<MetadataSnapshot> {
        let mut buf = [0u8; HEADER_SIZE];
        let n = self.file.read_at(0, &mut buf)?;
        let Some(header) = MetadataHeader::decode(&buf[..n])? else {
            return Ok(MetadataSnapshot::Unpublished);
        };

        if header.page_size != self.page_size {
            return Err(Error::corrupt(format!(
                "metadata page size {} differs from data file page size {}",
                header.page_size, self.page_size
            )));
        }
        if header.file_uuid != self.file_uuid {
            return Err(Error::corrupt(format!(
                "metadata file belongs to {}, not {}",
                header.file_uuid, self.file_uuid
            )));
        }

        let file_len = self.file.size()?;
        if header.index_end() > file_len {
            return Err(Error::corrupt(format!(
                "metadata file is {} bytes, index ends at {}",
                file_len,
                header.index_end()
            )));
        }
        let len = usize::try_from(header.index_length)
            .map_err(|_| Error::corrupt("index length out of range"))?;
        let mut region = vec![0u8; len];
        let n = self.file.read_at(header.index_offset, &mut region)?;
        region.truncate(n);
        let index = MetadataIndex::decode(&region, &header)?;

        Ok(MetadataSnapshot::Published { header, index })
    }

    /// Load the current snapshot and report the pages it changed
    ///
    /// A page is reported when its entry is new, points to a different
    /// image, or disappeared. Nothing is reported when the tick did not
    /// advance. On error the previous snapshot is kept.
    pub fn refresh(&mut self) -> Result<Vec<u64>> {
        let next = self.load()?;
        if next.tick_num() <= self.snapshot.tick_num() {
            return Ok(Vec::new());
        }

        let changed = changed_pages(self.snapshot.entries(), next.entries());
        self.snapshot = next;
        Ok(changed)
    }

    /// Read and verify the image an entry points to
    pub fn read_image(&self, entry: &IndexEntry) -> Result<Bytes> {
        let (start, _) = entry.checked_image_range(self.page_size, self.file.size()?)?;
        let mut buf = BytesMut::zeroed(entry.length as usize);
        let n = self.file.read_at(start, &mut buf)?;
        buf.truncate(n);
        entry.verify(&buf)?;
        Ok(buf.freeze())
    }
}

/// Pages whose entries differ between two sorted indexes
fn changed_pages(old: &[IndexEntry], new: &[IndexEntry]) -> Vec<u64> {
    let mut changed = BTreeSet::new();

    for entry in new {
        let unchanged = old
            .binary_search_by_key(&entry.data_page_offset, |e| e.data_page_offset)
            .is_ok_and(|idx| old[idx] == *entry);
        if !unchanged {
            changed.insert(entry.data_page_offset);
        }
    }
    for entry in old {
        if new
            .binary_search_by_key(&entry.data_page_offset, |e| e.data_page_offset)
            .is_err()
        {
            changed.insert(entry.data_page_offset);
        }
    }

    changed.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swmr::codec::{PageImage, index_encoded_len};
    use crate::swmr::writer::MetadataWriter;
    use pagetick_common::TickNum;
    use tempfile::tempdir;

    const PAGE: u32 = 512;

    fn image(page: u64, fill: u8) -> PageImage {
        PageImage::new(page, vec![fill; PAGE as usize])
    }

    fn entry(page: u64, slot: u64) -> IndexEntry {
        IndexEntry {
            data_page_offset: page,
            md_file_page_offset: slot,
            length: PAGE,
            checksum: 0,
        }
    }

    #[test]
    fn test_missing_metadata_file_means_no_writer() {
        let dir = tempdir().unwrap();
        let config = SwmrConfig::reader(dir.path().join("md").to_string_lossy().into_owned());

        assert!(matches!(
            MetadataReader::open(&config, PAGE, Uuid::new_v4()),
            Err(Error::NoWriterPresent { .. })
        ));
    }

    #[test]
    fn test_reader_follows_writer() {
        let dir = tempdir().unwrap();
        let md = dir.path().join("md").to_string_lossy().into_owned();
        let uuid = Uuid::new_v4();

        let mut writer = MetadataWriter::create(&SwmrConfig::writer(md.clone()), PAGE, uuid).unwrap();
        let mut reader = MetadataReader::open(&SwmrConfig::reader(md), PAGE, uuid).unwrap();
        assert_eq!(reader.snapshot(), &MetadataSnapshot::Unpublished);

        writer
            .publish(TickNum(1), &[image(1, 0x01), image(2, 0x02), image(3, 0x03)])
            .unwrap();
        assert_eq!(reader.refresh().unwrap(), vec![1, 2, 3]);

        writer.publish(TickNum(2), &[image(2, 0x22)]).unwrap();
        assert_eq!(reader.refresh().unwrap(), vec![2]);
        assert_eq!(reader.snapshot().tick_num(), TickNum(2));

        // No new tick, nothing to invalidate
        assert!(reader.refresh().unwrap().is_empty());

        let entry = *reader.snapshot().lookup(2).unwrap();
        let data = reader.read_image(&entry).unwrap();
        assert!(data.iter().all(|&b| b == 0x22));
    }

    #[test]
    fn test_foreign_metadata_file_rejected() {
        let dir = tempdir().unwrap();
        let md = dir.path().join("md").to_string_lossy().into_owned();

        let mut writer =
            MetadataWriter::create(&SwmrConfig::writer(md.clone()), PAGE, Uuid::new_v4()).unwrap();
        writer.publish(TickNum(1), &[]).unwrap();

        let err = MetadataReader::open(&SwmrConfig::reader(md), PAGE, Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, Error::CorruptMetadataFile(_)));
    }

    #[test]
    fn test_oversized_index_rejected_before_reading() {
        let dir = tempdir().unwrap();
        let md = dir.path().join("md");
        let uuid = Uuid::new_v4();

        let count = u32::MAX;
        let header = MetadataHeader {
            page_size: PAGE,
            reserved_pages: 1,
            tick_num: TickNum(1),
            index_offset: u64::from(PAGE),
            index_length: index_encoded_len(count),
            index_entry_count: count,
            file_uuid: uuid,
        };
        let mut file = vec![0u8; 2 * PAGE as usize];
        file[..HEADER_SIZE].copy_from_slice(&header.encode());
        std::fs::write(&md, &file).unwrap();

        let config = SwmrConfig::reader(md.to_string_lossy().into_owned());
        let err = MetadataReader::open(&config, PAGE, uuid).unwrap_err();
        assert!(matches!(err, Error::CorruptMetadataFile(_)));
    }

    #[test]
    fn test_image_past_end_of_file_rejected() {
        let dir = tempdir().unwrap();
        let md = dir.path().join("md").to_string_lossy().into_owned();
        let uuid = Uuid::new_v4();

        let mut writer = MetadataWriter::create(&SwmrConfig::writer(md.clone()), PAGE, uuid).unwrap();
        writer.publish(TickNum(1), &[image(1, 0x01)]).unwrap();
        let reader = MetadataReader::open(&SwmrConfig::reader(md), PAGE, uuid).unwrap();

        let mut entry = *reader.snapshot().lookup(1).unwrap();
        entry.md_file_page_offset = u64::MAX / 256;
        assert!(matches!(
            reader.read_image(&entry),
            Err(Error::CorruptMetadataFile(_))
        ));

        entry.md_file_page_offset = 1 << 20;
        assert!(matches!(
            reader.read_image(&entry),
            Err(Error::CorruptMetadataFile(_))
        ));
    }

    #[test]
    fn test_changed_pages() {
        let old = [entry(1, 10), entry(2, 11), entry(4, 12)];
        let new = [entry(1, 10), entry(2, 13), entry(3, 14)];
        assert_eq!(changed_pages(&old, &new), vec![2, 3, 4]);
        assert!(changed_pages(&new, &new).is_empty());
    }
}
