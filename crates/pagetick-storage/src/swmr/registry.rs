//! Open-file registry
//!
//! Resolves the role a process plays for a file and makes repeated opens of
//! the same file share one state. Files are identified by device and inode,
//! so different paths to the same file resolve to the same entry.

use crate::file::{FileHandle, SharedFile, check_page_buffer, check_prerequisites};
use pagetick_common::{
    AccessMode, Error, FileAccessProps, FileCreateProps, FileRole, Result,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Identity of an open file
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FileId {
    pub dev: u64,
    pub ino: u64,
}

impl FileId {
    /// Identity of the file at `path`
    pub fn of(path: impl AsRef<Path>) -> Result<Self> {
        let metadata = std::fs::metadata(path)?;
        Ok(Self {
            dev: metadata.dev(),
            ino: metadata.ino(),
        })
    }
}

#[derive(Debug)]
struct RegistryEntry {
    shared: Arc<SharedFile>,
    ref_count: u32,
}

/// Process-local table of files open with SWMR
///
/// Cloning yields another handle to the same table.
#[derive(Clone, Debug, Default)]
pub struct FileRegistry {
    entries: Arc<Mutex<HashMap<FileId, RegistryEntry>>>,
}

impl FileRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of open handles to the file at `path`
    pub fn open_count(&self, path: impl AsRef<Path>) -> u32 {
        let Ok(id) = FileId::of(path) else {
            return 0;
        };
        self.entries.lock().get(&id).map_or(0, |e| e.ref_count)
    }

    /// Number of distinct files open
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Check if no file is open
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Create a data file
    ///
    /// With SWMR configured the caller becomes the writer and the metadata
    /// file is created alongside. Nothing is published until the first tick.
    pub fn create(
        &self,
        path: impl AsRef<Path>,
        create_props: &FileCreateProps,
        access_props: &FileAccessProps,
    ) -> Result<FileHandle> {
        let path = path.as_ref();
        create_props.validate()?;

        let Some(config) = access_props.swmr_config() else {
            let shared = SharedFile::create_plain(path, create_props, access_props)?;
            return Ok(FileHandle::new(Arc::new(shared), None, access_props));
        };

        check_prerequisites(
            create_props.space_strategy,
            create_props.page_size,
            access_props,
        )?;
        if !config.is_writer {
            return Err(Error::invalid_argument(
                "creating a SWMR file requires the writer role",
            ));
        }

        let mut entries = self.entries.lock();
        if let Ok(id) = FileId::of(path)
            && entries.contains_key(&id)
        {
            return Err(Error::FileAlreadyOpen(path.to_path_buf()));
        }

        let shared = Arc::new(SharedFile::create_writer(
            path,
            create_props,
            access_props,
            config,
        )?);
        let id = match FileId::of(path) {
            Ok(id) => id,
            Err(e) => {
                if let Err(cleanup) = shared.close() {
                    warn!("Failed to close {} after error: {}", path.display(), cleanup);
                }
                return Err(e);
            }
        };
        entries.insert(
            id,
            RegistryEntry {
                shared: Arc::clone(&shared),
                ref_count: 1,
            },
        );

        Ok(FileHandle::new(shared, Some((self.clone(), id)), access_props))
    }

    /// Open an existing data file
    ///
    /// With SWMR configured the role comes from the configuration, unless
    /// the file is already open in this registry: then the existing state
    /// and its role are shared.
    pub fn open(
        &self,
        path: impl AsRef<Path>,
        mode: AccessMode,
        access_props: &FileAccessProps,
    ) -> Result<FileHandle> {
        let path = path.as_ref();

        let Some(config) = access_props.swmr_config() else {
            let shared = SharedFile::open_plain(path, mode, access_props)?;
            return Ok(FileHandle::new(Arc::new(shared), None, access_props));
        };

        check_page_buffer(access_props, None)?;
        let requested = FileRole::from_is_writer(config.is_writer);
        match (requested, mode) {
            (FileRole::Writer, AccessMode::ReadOnly) => {
                return Err(Error::invalid_argument(
                    "SWMR writer needs read-write access",
                ));
            }
            (FileRole::Reader, AccessMode::ReadWrite) => {
                return Err(Error::invalid_argument("SWMR reader needs read-only access"));
            }
            _ => {}
        }

        let id = FileId::of(path)?;
        let mut entries = self.entries.lock();

        if let Some(entry) = entries.get_mut(&id) {
            check_page_buffer(access_props, Some(entry.shared.page_size()))?;
            if let Some(existing) = entry.shared.role()
                && existing != requested
            {
                warn!(
                    "{} requested as {}, sharing existing {} state",
                    path.display(),
                    requested,
                    existing
                );
            }
            entry.ref_count += 1;
            debug!(
                "Reusing open state for {} ({} handles)",
                path.display(),
                entry.ref_count
            );
            let shared = Arc::clone(&entry.shared);
            return Ok(FileHandle::new(shared, Some((self.clone(), id)), access_props));
        }

        let shared = Arc::new(SharedFile::open_swmr(path, mode, access_props, config)?);
        entries.insert(
            id,
            RegistryEntry {
                shared: Arc::clone(&shared),
                ref_count: 1,
            },
        );

        Ok(FileHandle::new(shared, Some((self.clone(), id)), access_props))
    }

    /// Drop one reference, closing the shared state on the last one
    pub(crate) fn release(&self, id: FileId) -> Result<()> {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(&id) else {
            return Ok(());
        };

        entry.ref_count -= 1;
        if entry.ref_count > 0 {
            return Ok(());
        }

        // Close under the registry lock so a new open cannot race the
        // metadata file removal
        let result = entry.shared.close();
        entries.remove(&id);
        result
    }
}
