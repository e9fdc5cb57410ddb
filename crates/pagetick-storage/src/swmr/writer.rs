//! Metadata file writer
//!
//! Publishes one snapshot per tick. Page images go to freshly allocated
//! slots, then the index, then the header. Each publish is staged on a copy
//! of the writer state and committed only after the header is durable, so a
//! failed tick leaves the previous snapshot and in-memory state untouched.

use super::codec::{IndexEntry, MetadataHeader, MetadataIndex, PageImage};
use super::delayed::DelayedRetirementList;
use super::tick::PublishStats;
use crate::layout::{page_offset, pages_for};
use crate::raw_io::RawFile;
use crate::space::{Extent, PageAllocator};
use pagetick_common::{Error, Result, SwmrConfig, TickNum, compute_crc32c};
use std::collections::{BTreeMap, VecDeque};
use std::io::ErrorKind;
use std::path::Path;
use tracing::{debug, info};
use uuid::Uuid;

/// In-memory state mirrored by the last published snapshot
#[derive(Clone, Debug)]
struct WriterState {
    tick_num: TickNum,
    index: BTreeMap<u64, IndexEntry>,
    index_extent: Option<Extent>,
    allocator: PageAllocator,
    delayed: DelayedRetirementList,
    /// Superseded index regions with their retirement tick
    retired_indexes: VecDeque<(TickNum, Extent)>,
}

/// Writer side of a metadata file
#[derive(Debug)]
pub struct MetadataWriter {
    file: RawFile,
    page_size: u32,
    reserved_pages: u32,
    max_lag: u32,
    file_uuid: Uuid,
    state: WriterState,
}

impl WriterState {
    fn new(reserved_pages: u32) -> Self {
        Self {
            tick_num: TickNum::ZERO,
            index: BTreeMap::new(),
            index_extent: None,
            allocator: PageAllocator::new(u64::from(reserved_pages)),
            delayed: DelayedRetirementList::new(),
            retired_indexes: VecDeque::new(),
        }
    }
}

impl MetadataWriter {
    /// Create the metadata file exclusively
    ///
    /// The file is sized to the reserved pages and left zero-filled, which
    /// readers decode as "nothing published yet". An existing file means
    /// another writer owns the data file.
    pub fn create(config: &SwmrConfig, page_size: u32, file_uuid: Uuid) -> Result<Self> {
        let path = config.md_file_path();
        let size = page_offset(u64::from(config.md_pages_reserved), page_size);

        let file = RawFile::create_new(path, size).map_err(|e| match e {
            Error::DiskIo(io) if io.kind() == ErrorKind::AlreadyExists => {
                Error::WriterAlreadyPresent {
                    md_file_path: path.to_path_buf(),
                }
            }
            other => other,
        })?;
        file.sync()?;

        info!(
            "Created metadata file {} ({} reserved pages of {} bytes)",
            path.display(),
            config.md_pages_reserved,
            page_size
        );

        Ok(Self {
            file,
            page_size,
            reserved_pages: config.md_pages_reserved,
            max_lag: config.max_lag,
            file_uuid,
            state: WriterState::new(config.md_pages_reserved),
        })
    }

    /// Metadata file path
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Tick of the last successful publish
    pub fn tick_num(&self) -> TickNum {
        self.state.tick_num
    }

    /// Entries of the last published index
    pub fn index(&self) -> impl Iterator<Item = &IndexEntry> {
        self.state.index.values()
    }

    /// Entries waiting on the delayed list
    pub fn delayed(&self) -> &DelayedRetirementList {
        &self.state.delayed
    }

    /// Free extents in the metadata file
    pub fn free_extents(&self) -> &[Extent] {
        self.state.allocator.free_extents()
    }

    /// Publish a snapshot at `tick`
    ///
    /// `images` carries the pages modified since the previous tick. Images
    /// identical to their published entry are not rewritten.
    pub fn publish(&mut self, tick: TickNum, images: &[PageImage]) -> Result<PublishStats> {
        if tick <= self.state.tick_num {
            return Err(Error::invalid_argument(format!(
                "{tick} does not advance past {}",
                self.state.tick_num
            )));
        }

        let mut next = self.state.clone();

        let released = next.delayed.release_expired(tick);
        for delayed in &released {
            next.allocator.free(delayed.entry.extent(self.page_size))?;
        }
        while let Some(&(retire_at, extent)) = next.retired_indexes.front() {
            if retire_at > tick {
                break;
            }
            next.retired_indexes.pop_front();
            next.allocator.free(extent)?;
        }

        let mut inserted = 0;
        let mut pages_written = 0;
        for image in images {
            let length = u32::try_from(image.content.len()).map_err(|_| {
                Error::invalid_argument(format!(
                    "page {} image too large",
                    image.data_page_offset
                ))
            })?;
            if length == 0 {
                return Err(Error::invalid_argument(format!(
                    "page {} image is empty",
                    image.data_page_offset
                )));
            }

            if let Some(old) = next.index.get(&image.data_page_offset).copied() {
                if old.matches(&image.content) {
                    continue;
                }
                next.delayed.push(old, tick, self.max_lag);
                inserted += 1;
            }

            let extent = next
                .allocator
                .allocate(pages_for(u64::from(length), self.page_size))?;
            self.file
                .write_at(page_offset(extent.start, self.page_size), &image.content)?;

            next.index.insert(
                image.data_page_offset,
                IndexEntry {
                    data_page_offset: image.data_page_offset,
                    md_file_page_offset: extent.start,
                    length,
                    checksum: compute_crc32c(&image.content),
                },
            );
            pages_written += 1;
        }

        let index = MetadataIndex {
            tick_num: tick,
            entries: next.index.values().copied().collect(),
        };
        let encoded = index.encode();
        let index_extent = next
            .allocator
            .allocate(pages_for(encoded.len() as u64, self.page_size))?;
        let index_offset = page_offset(index_extent.start, self.page_size);
        self.file.write_at(index_offset, &encoded)?;
        if let Some(old) = next.index_extent.replace(index_extent) {
            next.retired_indexes
                .push_back((tick.plus(u64::from(self.max_lag)), old));
        }

        self.file.sync_data()?;

        let index_entry_count = u32::try_from(index.entries.len())
            .map_err(|_| Error::storage("too many index entries"))?;
        let header = MetadataHeader {
            page_size: self.page_size,
            reserved_pages: self.reserved_pages,
            tick_num: tick,
            index_offset,
            index_length: encoded.len() as u64,
            index_entry_count,
            file_uuid: self.file_uuid,
        };
        self.file.write_at(0, &header.encode())?;
        self.file.sync_data()?;

        next.tick_num = tick;
        self.state = next;

        let stats = PublishStats {
            tick_num: tick,
            pages_written,
            inserted,
            removed: released.len(),
            index_entries: index.entries.len(),
        };
        debug!(
            "Published {}: {} pages written, {} delayed, {} released, {} entries",
            tick, stats.pages_written, stats.inserted, stats.removed, stats.index_entries
        );
        Ok(stats)
    }

    /// Delete the metadata file
    pub fn remove(self) -> Result<()> {
        let path = self.file.path().to_path_buf();
        drop(self.file);
        std::fs::remove_file(&path)?;
        info!("Removed metadata file {}", path.display());
        Ok(())
    }
}
