//! Open files
//!
//! A [`FileHandle`] is what callers hold. Every handle to the same SWMR file
//! in one registry shares a single [`SharedFile`]: one data file handle, one
//! page buffer and one tick controller. The state is torn down when the last
//! handle closes.

use crate::data_file::DataFile;
use crate::layout::FIRST_DATA_PAGE;
use crate::page_buffer::PageBuffer;
use crate::raw_io::RawFile;
use crate::swmr::codec::{MetadataSnapshot, decode_snapshot};
use crate::swmr::reader::MetadataReader;
use crate::swmr::registry::{FileId, FileRegistry};
use crate::swmr::tick::{TickController, TickEndpoint, TickReport, write_back_all};
use crate::swmr::writer::MetadataWriter;
use bytes::Bytes;
use pagetick_common::{
    AccessMode, Error, FileAccessProps, FileCreateProps, FileRole, FileSpaceStrategy, Result,
    SwmrConfig, TickNum,
};
use parking_lot::Mutex;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Check that a file can run the SWMR protocol
///
/// SWMR needs page-aligned file space and a page buffer that holds at least
/// one page.
pub(crate) fn check_prerequisites(
    strategy: FileSpaceStrategy,
    page_size: u32,
    props: &FileAccessProps,
) -> Result<()> {
    if strategy != FileSpaceStrategy::Paged {
        return Err(Error::PrerequisiteNotMet(format!(
            "SWMR needs the paged space strategy, file uses {strategy}"
        )));
    }
    check_page_buffer(props, Some(page_size))
}

/// Check that page buffering is enabled, and large enough when the page
/// size is known
pub(crate) fn check_page_buffer(props: &FileAccessProps, page_size: Option<u32>) -> Result<()> {
    let Some(size) = props.page_buffer_size() else {
        return Err(Error::PrerequisiteNotMet(
            "SWMR needs page buffering enabled".into(),
        ));
    };
    if let Some(page_size) = page_size
        && size < page_size as usize
    {
        return Err(Error::PrerequisiteNotMet(format!(
            "page buffer of {size} bytes cannot hold a {page_size} byte page"
        )));
    }
    Ok(())
}

#[derive(Debug)]
struct SharedInner {
    ticks: Option<TickController>,
    closed: bool,
}

/// State shared by every handle to one open file
#[derive(Debug)]
pub(crate) struct SharedFile {
    path: PathBuf,
    data: DataFile,
    buffer: Option<PageBuffer>,
    swmr: Option<SwmrConfig>,
    role: Option<FileRole>,
    inner: Mutex<SharedInner>,
}

impl SharedFile {
    fn new(
        path: &Path,
        data: DataFile,
        access_props: &FileAccessProps,
        ticks: Option<TickController>,
    ) -> Self {
        let page_size = data.page_size() as usize;
        let buffer = access_props
            .page_buffer_size()
            .map(|size| PageBuffer::new(size, page_size));
        let role = ticks.as_ref().map(TickController::role);

        Self {
            path: path.to_path_buf(),
            data,
            buffer,
            swmr: access_props.swmr_config().cloned(),
            role,
            inner: Mutex::new(SharedInner {
                ticks,
                closed: false,
            }),
        }
    }

    /// Create a data file without SWMR
    pub(crate) fn create_plain(
        path: &Path,
        create_props: &FileCreateProps,
        access_props: &FileAccessProps,
    ) -> Result<Self> {
        let data = DataFile::create(path, create_props)?;
        Ok(Self::new(path, data, access_props, None))
    }

    /// Open a data file without SWMR
    pub(crate) fn open_plain(
        path: &Path,
        mode: AccessMode,
        access_props: &FileAccessProps,
    ) -> Result<Self> {
        let data = DataFile::open(path, mode)?;
        Ok(Self::new(path, data, access_props, None))
    }

    /// Create a data file and its metadata file as the writer
    ///
    /// The metadata file is claimed first so an existing writer's data file
    /// is never truncated. Nothing is published until the first tick.
    pub(crate) fn create_writer(
        path: &Path,
        create_props: &FileCreateProps,
        access_props: &FileAccessProps,
        config: &SwmrConfig,
    ) -> Result<Self> {
        let file_uuid = Uuid::new_v4();
        let writer = MetadataWriter::create(config, create_props.page_size, file_uuid)?;

        let data = match DataFile::create_with_uuid(path, create_props, file_uuid) {
            Ok(data) => data,
            Err(e) => {
                if let Err(cleanup) = writer.remove() {
                    warn!("Failed to remove metadata file after create error: {}", cleanup);
                }
                return Err(e);
            }
        };

        info!("Created {} as SWMR writer", path.display());
        let ticks = TickController::writer(writer, config.max_lag);
        Ok(Self::new(path, data, access_props, Some(ticks)))
    }

    /// Open an existing data file for SWMR in the given role
    pub(crate) fn open_swmr(
        path: &Path,
        mode: AccessMode,
        access_props: &FileAccessProps,
        config: &SwmrConfig,
    ) -> Result<Self> {
        let data = DataFile::open(path, mode)?;
        check_prerequisites(data.space_strategy(), data.page_size(), access_props)?;

        if config.is_writer {
            let writer = MetadataWriter::create(config, data.page_size(), data.file_uuid())?;
            let shared = Self::new(
                path,
                data,
                access_props,
                Some(TickController::writer(writer, config.max_lag)),
            );

            // Readers that open before the first explicit tick see an empty
            // snapshot rather than no writer
            if let Err(e) = shared.end_tick() {
                if let Err(cleanup) = shared.close() {
                    warn!("Failed to clean up after initial publish error: {}", cleanup);
                }
                return Err(e);
            }

            info!("Opened {} as SWMR writer", path.display());
            Ok(shared)
        } else {
            let reader = MetadataReader::open(config, data.page_size(), data.file_uuid())?;
            info!(
                "Opened {} as SWMR reader at {}",
                path.display(),
                reader.snapshot().tick_num()
            );
            let ticks = TickController::reader(reader, config.max_lag);
            Ok(Self::new(path, data, access_props, Some(ticks)))
        }
    }

    pub(crate) fn role(&self) -> Option<FileRole> {
        self.role
    }

    pub(crate) fn page_size(&self) -> u32 {
        self.data.page_size()
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn end_tick(&self) -> Result<TickReport> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(Error::NotSwmrConfigured);
        }
        let (Some(ticks), Some(buffer)) = (inner.ticks.as_mut(), self.buffer.as_ref()) else {
            return Err(Error::NotSwmrConfigured);
        };
        ticks.advance(&self.data, buffer)
    }

    fn tick_num(&self) -> TickNum {
        self.inner
            .lock()
            .ticks
            .as_ref()
            .map_or(TickNum::ZERO, TickController::tick_num)
    }

    fn check_page(page: u64) -> Result<()> {
        if page < FIRST_DATA_PAGE {
            return Err(Error::invalid_argument(format!(
                "page {page} holds the superblock"
            )));
        }
        Ok(())
    }

    fn read_page(&self, page: u64) -> Result<Bytes> {
        Self::check_page(page)?;

        if let Some(buffer) = &self.buffer
            && let Some(data) = buffer.get(page)
        {
            return Ok(data);
        }

        let from_metadata = {
            let inner = self.inner.lock();
            match inner.ticks.as_ref().map(TickController::endpoint) {
                Some(TickEndpoint::Reader(reader)) => reader
                    .snapshot()
                    .lookup(page)
                    .map(|entry| reader.read_image(entry))
                    .transpose()?,
                _ => None,
            }
        };

        let data = match from_metadata {
            Some(image) => image,
            None => self.data.read_page(page)?,
        };
        if let Some(buffer) = &self.buffer {
            buffer.insert(page, data.clone());
        }
        Ok(data)
    }

    fn write_page(&self, page: u64, data: Bytes) -> Result<()> {
        if self.role == Some(FileRole::Reader) || self.data.is_read_only() {
            return Err(Error::ReadOnly);
        }
        Self::check_page(page)?;
        let page_size = self.page_size() as usize;
        if data.len() != page_size {
            return Err(Error::invalid_argument(format!(
                "page {} write of {} bytes, page size is {}",
                page,
                data.len(),
                page_size
            )));
        }

        match &self.buffer {
            Some(buffer) => {
                buffer.write(page, data);
                Ok(())
            }
            None => self.data.write_page(page, &data),
        }
    }

    fn flush(&self) -> Result<()> {
        match self.role {
            Some(FileRole::Writer) => self.end_tick().map(|_| ()),
            Some(FileRole::Reader) => Ok(()),
            None if self.data.is_read_only() => Ok(()),
            None => match &self.buffer {
                Some(buffer) => write_back_all(&self.data, buffer),
                None => self.data.sync(),
            },
        }
    }

    /// Tear down the shared state
    ///
    /// A writer publishes a final tick, writes every buffered page back,
    /// rewrites the superblock and deletes the metadata file. Closing twice
    /// is a no-op.
    pub(crate) fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Ok(());
        }
        inner.closed = true;

        let result = match (inner.ticks.take(), &self.buffer) {
            (Some(ticks), Some(buffer)) if ticks.role() == FileRole::Writer => {
                let (mut result, writer) = ticks.finish(&self.data, buffer);
                result = result.and(self.data.update_superblock());
                if let Some(writer) = writer {
                    let removed = writer.remove();
                    result = result.and(removed);
                }
                result
            }
            (Some(_), _) => Ok(()),
            (None, _) if self.data.is_read_only() => Ok(()),
            (None, Some(buffer)) => {
                write_back_all(&self.data, buffer).and_then(|()| self.data.update_superblock())
            }
            (None, None) => self.data.update_superblock(),
        };

        match &result {
            Ok(()) => debug!("Closed {}", self.path.display()),
            Err(e) => error!("Failed to close {}: {}", self.path.display(), e),
        }
        result
    }
}

/// A handle to an open data file
#[derive(Debug)]
pub struct FileHandle {
    shared: Arc<SharedFile>,
    registration: Option<(FileRegistry, FileId)>,
    access_props: FileAccessProps,
    closed: bool,
}

impl FileHandle {
    pub(crate) fn new(
        shared: Arc<SharedFile>,
        registration: Option<(FileRegistry, FileId)>,
        access_props: &FileAccessProps,
    ) -> Self {
        Self {
            shared,
            registration,
            access_props: access_props.clone(),
            closed: false,
        }
    }

    pub(crate) fn shared(&self) -> &Arc<SharedFile> {
        &self.shared
    }

    /// Data file path
    pub fn path(&self) -> &Path {
        self.shared.path()
    }

    /// Page size of the data file
    pub fn page_size(&self) -> u32 {
        self.shared.page_size()
    }

    /// Role adopted for this file, `None` without SWMR
    ///
    /// A second open in the same registry adopts the role of the first,
    /// whatever role its configuration asked for.
    pub fn role(&self) -> Option<FileRole> {
        self.shared.role()
    }

    /// SWMR configuration the shared file state was opened with
    ///
    /// This is the first opener's configuration. A handle that adopted
    /// already open state may have passed a different one; its own is in
    /// [`access_props`](Self::access_props).
    pub fn swmr_config(&self) -> Option<&SwmrConfig> {
        self.shared.swmr.as_ref()
    }

    /// Access properties this handle was opened with
    pub fn access_props(&self) -> &FileAccessProps {
        &self.access_props
    }

    /// Page buffer, if page buffering is enabled
    pub fn page_buffer(&self) -> Option<&PageBuffer> {
        self.shared.buffer.as_ref()
    }

    /// Data file
    pub fn data_file(&self) -> &DataFile {
        &self.shared.data
    }

    /// Last completed tick
    pub fn tick_num(&self) -> TickNum {
        self.shared.tick_num()
    }

    /// Run one tick: publish on the writer, refresh on a reader
    pub fn end_tick(&self) -> Result<TickReport> {
        self.shared.end_tick()
    }

    /// Flush pending writes
    ///
    /// On a SWMR writer this is an explicit tick.
    pub fn flush(&self) -> Result<()> {
        self.shared.flush()
    }

    /// Read a data page
    pub fn read_page(&self, page: u64) -> Result<Bytes> {
        self.shared.read_page(page)
    }

    /// Write a full data page
    pub fn write_page(&self, page: u64, data: impl Into<Bytes>) -> Result<()> {
        self.shared.write_page(page, data.into())
    }

    /// Decode the metadata file as it is on disk now
    pub fn read_metadata_file(&self) -> Result<MetadataSnapshot> {
        let config = self.swmr_config().ok_or(Error::NotSwmrConfigured)?;
        let path = config.md_file_path();
        let file = RawFile::open(path, true).map_err(|e| match e {
            Error::DiskIo(io) if io.kind() == ErrorKind::NotFound => Error::NoWriterPresent {
                md_file_path: path.to_path_buf(),
            },
            other => other,
        })?;
        decode_snapshot(&file.read_all()?)
    }

    /// Close the handle
    ///
    /// The shared state is torn down when the last handle closes.
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        self.release()
    }

    fn release(&self) -> Result<()> {
        match &self.registration {
            Some((registry, id)) => registry.release(*id),
            None => self.shared.close(),
        }
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        if !self.closed
            && let Err(e) = self.release()
        {
            warn!(
                "Error closing {} on drop: {}",
                self.shared.path().display(),
                e
            );
        }
    }
}
