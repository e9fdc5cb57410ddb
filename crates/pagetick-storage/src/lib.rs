//! pagetick Storage Engine - SWMR access to paged data files
//!
//! This crate implements the storage side of pagetick including:
//! - Paged data files with a superblock
//! - Page buffering with delayed write-back
//! - Metadata file encoding and space management
//! - Tick-driven publish (writer) and refresh (reader)
//! - Same-process sharing of open files

pub mod data_file;
pub mod file;
pub mod layout;
pub mod page_buffer;
pub mod raw_io;
pub mod space;
pub mod swmr;

// Re-exports
pub use data_file::{DataFile, DataFileStats};
pub use file::FileHandle;
pub use layout::{FIRST_DATA_PAGE, FORMAT_VERSION, MAGIC, Superblock};
pub use page_buffer::{BufferedPage, PageBuffer, PageBufferStats, PageState};
pub use raw_io::RawFile;
pub use space::{Extent, PageAllocator};
pub use swmr::{
    FileId, FileRegistry, IndexEntry, MetadataHeader, MetadataIndex, MetadataSnapshot,
    PublishStats, RefreshStats, TickPhase, TickReport, TickScheduler, decode_snapshot,
};
