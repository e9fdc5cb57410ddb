//! Single-writer/multiple-reader coordination
//!
//! The writer publishes, once per tick, a snapshot of the pages it changed
//! into a metadata file next to the data file. Readers reload the snapshot on
//! their own ticks and drop the pages it changed from their page buffer.
//!
//! # Design
//!
//! ```text
//!   writer process                         reader processes
//!  ┌──────────────────┐                   ┌──────────────────┐
//!  │ PageBuffer       │                   │ PageBuffer       │
//!  │  tick list ──────┼─> MetadataWriter  │  evict changed <─┼─ MetadataReader
//!  │  delayed pages   │        │          │                  │        ^
//!  └────────┬─────────┘        v          └──────────────────┘        │
//!           │            metadata file ───────────────────────────────┘
//!           v            (images, index, header)
//!       data file  <── written back max_lag ticks after publication
//! ```
//!
//! # Publish order
//! 1. Release delayed slots whose retirement tick has come
//! 2. Write changed page images to new slots
//! 3. Write the index, sync
//! 4. Write the header, sync

pub mod codec;
pub mod delayed;
pub mod reader;
pub mod registry;
pub mod scheduler;
pub mod tick;
pub mod writer;

pub use codec::{
    IndexEntry, MetadataHeader, MetadataIndex, MetadataSnapshot, PageImage, decode_snapshot,
};
pub use delayed::{DelayedEntry, DelayedRetirementList};
pub use reader::MetadataReader;
pub use registry::{FileId, FileRegistry};
pub use scheduler::TickScheduler;
pub use tick::{PublishStats, RefreshStats, TickController, TickPhase, TickReport};
pub use writer::MetadataWriter;
