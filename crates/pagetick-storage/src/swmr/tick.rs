//! Tick state machine
//!
//! One tick on the writer collects the pages modified since the previous
//! tick, publishes them, schedules their write-back to the data file and
//! writes back pages whose delay has expired. One tick on a reader reloads
//! the metadata file and evicts the pages the new snapshot changed.

use super::codec::PageImage;
use super::reader::MetadataReader;
use super::writer::MetadataWriter;
use crate::data_file::DataFile;
use crate::page_buffer::PageBuffer;
use derive_more::Display;
use pagetick_common::{Error, FileRole, Result, TickNum};
use serde::Serialize;
use tracing::{debug, warn};

/// Outcome of a writer tick
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PublishStats {
    /// Tick published
    pub tick_num: TickNum,
    /// Page images written to new slots
    pub pages_written: usize,
    /// Superseded entries added to the delayed list
    pub inserted: usize,
    /// Delayed entries released back to the allocator
    pub removed: usize,
    /// Entries in the published index
    pub index_entries: usize,
}

/// Outcome of a reader tick
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RefreshStats {
    /// Tick of the snapshot now loaded
    pub tick_num: TickNum,
    /// Pages evicted from the page buffer
    pub pages_invalidated: usize,
    /// Entries in the loaded index
    pub index_entries: usize,
}

/// Outcome of one tick
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum TickReport {
    Published(PublishStats),
    Refreshed(RefreshStats),
}

impl TickReport {
    /// Tick the report describes
    #[must_use]
    pub const fn tick_num(&self) -> TickNum {
        match self {
            Self::Published(stats) => stats.tick_num,
            Self::Refreshed(stats) => stats.tick_num,
        }
    }
}

/// Tick controller phase
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Display)]
pub enum TickPhase {
    #[default]
    #[display("idle")]
    Idle,
    /// A publish (writer) or refresh (reader) is in progress
    #[display("publishing")]
    Publishing,
}

/// Metadata file endpoint driven by the controller
#[derive(Debug)]
pub enum TickEndpoint {
    Writer(MetadataWriter),
    Reader(MetadataReader),
}

/// Drives ticks for one open SWMR file
#[derive(Debug)]
pub struct TickController {
    endpoint: TickEndpoint,
    phase: TickPhase,
    tick_num: TickNum,
    max_lag: u32,
}

impl TickController {
    /// Controller for a writer that has published nothing yet
    pub fn writer(writer: MetadataWriter, max_lag: u32) -> Self {
        Self {
            tick_num: writer.tick_num(),
            endpoint: TickEndpoint::Writer(writer),
            phase: TickPhase::Idle,
            max_lag,
        }
    }

    /// Controller for a reader, starting at the snapshot it loaded
    pub fn reader(reader: MetadataReader, max_lag: u32) -> Self {
        Self {
            tick_num: reader.snapshot().tick_num(),
            endpoint: TickEndpoint::Reader(reader),
            phase: TickPhase::Idle,
            max_lag,
        }
    }

    /// Current phase
    pub fn phase(&self) -> TickPhase {
        self.phase
    }

    /// Last completed tick
    pub fn tick_num(&self) -> TickNum {
        self.tick_num
    }

    /// Role of the endpoint
    pub fn role(&self) -> FileRole {
        match self.endpoint {
            TickEndpoint::Writer(_) => FileRole::Writer,
            TickEndpoint::Reader(_) => FileRole::Reader,
        }
    }

    /// The metadata endpoint
    pub fn endpoint(&self) -> &TickEndpoint {
        &self.endpoint
    }

    /// Run one tick
    pub fn advance(&mut self, data: &DataFile, buffer: &PageBuffer) -> Result<TickReport> {
        if self.phase != TickPhase::Idle {
            return Err(Error::storage(format!("tick already {}", self.phase)));
        }

        self.phase = TickPhase::Publishing;
        let result = match self.role() {
            FileRole::Writer => self.publish(data, buffer).map(TickReport::Published),
            FileRole::Reader => self.refresh(buffer).map(TickReport::Refreshed),
        };
        self.phase = TickPhase::Idle;
        result
    }

    fn publish(&mut self, data: &DataFile, buffer: &PageBuffer) -> Result<PublishStats> {
        let TickEndpoint::Writer(writer) = &mut self.endpoint else {
            return Err(Error::ReadOnly);
        };

        let tick = self.tick_num.next();
        let modified = buffer.tick_list();
        let images: Vec<PageImage> = modified
            .iter()
            .map(|p| PageImage::new(p.page, p.data.clone()))
            .collect();

        let stats = writer.publish(tick, &images)?;
        self.tick_num = tick;
        // Pages written during the publish keep their newer content modified
        buffer.mark_published(&modified, tick.plus(u64::from(self.max_lag)));

        for due in buffer.due_for_writeback(tick) {
            data.write_page(due.page, &due.data)?;
            buffer.mark_clean(&due);
        }

        Ok(stats)
    }

    fn refresh(&mut self, buffer: &PageBuffer) -> Result<RefreshStats> {
        let TickEndpoint::Reader(reader) = &mut self.endpoint else {
            return Err(Error::storage("refresh on a writer"));
        };

        let changed = match reader.refresh() {
            Ok(changed) => changed,
            Err(e) => {
                warn!(
                    "Failed to refresh {} at {}: {}",
                    reader.path().display(),
                    self.tick_num,
                    e
                );
                return Err(e);
            }
        };

        for page in &changed {
            buffer.invalidate(*page);
        }

        let snapshot = reader.snapshot();
        self.tick_num = snapshot.tick_num();
        let stats = RefreshStats {
            tick_num: self.tick_num,
            pages_invalidated: changed.len(),
            index_entries: snapshot.entries().len(),
        };
        debug!(
            "Refreshed to {}: {} pages invalidated",
            stats.tick_num, stats.pages_invalidated
        );
        Ok(stats)
    }

    /// Final writer tick followed by write-back of every buffered page
    ///
    /// Returns the metadata writer so the caller can remove its file.
    pub(crate) fn finish(
        mut self,
        data: &DataFile,
        buffer: &PageBuffer,
    ) -> (Result<()>, Option<MetadataWriter>) {
        if self.role() == FileRole::Reader {
            return (Ok(()), None);
        }

        let published = self.advance(data, buffer).map(|_| ());
        let written = write_back_all(data, buffer);
        let writer = match self.endpoint {
            TickEndpoint::Writer(writer) => Some(writer),
            TickEndpoint::Reader(_) => None,
        };
        (published.and(written), writer)
    }
}

/// Write every page the data file has not seen yet
pub fn write_back_all(data: &DataFile, buffer: &PageBuffer) -> Result<()> {
    for page in buffer.unwritten() {
        data.write_page(page.page, &page.data)?;
        buffer.mark_clean(&page);
    }
    data.sync()
}
