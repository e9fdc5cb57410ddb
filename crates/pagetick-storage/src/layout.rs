//! Data file layout definitions
//!
//! Data file layout:
//! ```text
//! +------------------+  Page 0 (offset 0)
//! |   Superblock     |  Magic, version, UUID, page size, space strategy
//! +------------------+  Page 1
//! |   Data pages     |  Addressed by page number, `page_size` bytes each
//! |       ...        |
//! +------------------+
//! ```
//!
//! The metadata file that accompanies a SWMR writer has its own layout,
//! see [`crate::swmr::codec`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use pagetick_common::{
    Error, FileSpaceStrategy, MIN_PAGE_SIZE, Result, compute_crc32c, verify_crc32c,
};
use uuid::Uuid;

/// Magic number for the pagetick data file format
pub const MAGIC: [u8; 8] = *b"PGTKDATA";

/// Current data file format version
pub const FORMAT_VERSION: u32 = 1;

/// Page number of the superblock
pub const SUPERBLOCK_PAGE: u64 = 0;

/// First page number available for data
pub const FIRST_DATA_PAGE: u64 = 1;

/// Byte offset of a page
#[inline]
#[must_use]
pub const fn page_offset(page: u64, page_size: u32) -> u64 {
    page * page_size as u64
}

/// Number of pages needed to hold `len` bytes
#[inline]
#[must_use]
pub const fn pages_for(len: u64, page_size: u32) -> u64 {
    len.div_ceil(page_size as u64)
}

/// Superblock stored in page 0 of every data file
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Superblock {
    /// Magic number for format identification
    pub magic: [u8; 8],
    /// Format version
    pub version: u32,
    /// Unique file identifier, echoed in the metadata file header
    pub file_uuid: Uuid,
    /// Page size in bytes
    pub page_size: u32,
    /// File space strategy chosen at creation
    pub space_strategy: FileSpaceStrategy,
    /// Number of pages in the file, superblock included
    pub page_count: u64,
    /// Creation timestamp (Unix epoch)
    pub created_at: u64,
    /// Last close timestamp
    pub last_close: u64,
    /// Number of times the file was closed after writing
    pub close_count: u64,
    /// Reserved for future use
    pub reserved: [u8; 64],
    /// Checksum of superblock (excluding this field)
    pub checksum: u32,
}

impl Superblock {
    /// Offset of the checksum field within the encoded superblock:
    /// magic(8) + version(4) + file_uuid(16) + page_size(4) +
    /// space_strategy(4) + page_count(8) + created_at(8) + last_close(8) +
    /// close_count(8) + reserved(64) = 132
    const CHECKSUM_OFFSET: usize = 132;

    /// Encoded size in bytes
    pub const ENCODED_SIZE: usize = Self::CHECKSUM_OFFSET + 4;

    /// Create a superblock for a new, empty file
    pub fn new(page_size: u32, space_strategy: FileSpaceStrategy) -> Result<Self> {
        if page_size < MIN_PAGE_SIZE || !page_size.is_power_of_two() {
            return Err(Error::Storage(format!(
                "page size {page_size} must be a power of two >= {MIN_PAGE_SIZE}"
            )));
        }

        let now = unix_now();
        let mut sb = Self {
            magic: MAGIC,
            version: FORMAT_VERSION,
            file_uuid: Uuid::new_v4(),
            page_size,
            space_strategy,
            page_count: FIRST_DATA_PAGE,
            created_at: now,
            last_close: now,
            close_count: 0,
            reserved: [0u8; 64],
            checksum: 0,
        };

        sb.update_checksum();
        Ok(sb)
    }

    /// Serialize superblock to bytes
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::ENCODED_SIZE);

        buf.put_slice(&self.magic);
        buf.put_u32_le(self.version);
        buf.put_slice(self.file_uuid.as_bytes());
        buf.put_u32_le(self.page_size);
        buf.put_u32_le(u32::from(self.space_strategy.as_u8()));
        buf.put_u64_le(self.page_count);
        buf.put_u64_le(self.created_at);
        buf.put_u64_le(self.last_close);
        buf.put_u64_le(self.close_count);
        buf.put_slice(&self.reserved);
        buf.put_u32_le(self.checksum);

        buf.freeze()
    }

    /// Parse superblock from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::ENCODED_SIZE {
            return Err(Error::Storage("superblock too small".into()));
        }

        let mut buf = data;

        let mut magic = [0u8; 8];
        buf.copy_to_slice(&mut magic);
        if magic != MAGIC {
            return Err(Error::Storage("invalid superblock magic".into()));
        }

        let version = buf.get_u32_le();
        if version != FORMAT_VERSION {
            return Err(Error::Storage(format!(
                "unsupported format version: {version}"
            )));
        }

        let mut uuid_bytes = [0u8; 16];
        buf.copy_to_slice(&mut uuid_bytes);
        let file_uuid = Uuid::from_bytes(uuid_bytes);

        let page_size = buf.get_u32_le();
        let strategy_tag = buf.get_u32_le();
        let space_strategy = u8::try_from(strategy_tag)
            .ok()
            .and_then(FileSpaceStrategy::from_u8)
            .ok_or_else(|| {
                Error::Storage(format!("unknown space strategy tag {strategy_tag}"))
            })?;
        let page_count = buf.get_u64_le();
        let created_at = buf.get_u64_le();
        let last_close = buf.get_u64_le();
        let close_count = buf.get_u64_le();

        let mut reserved = [0u8; 64];
        buf.copy_to_slice(&mut reserved);

        let checksum = buf.get_u32_le();

        let sb = Self {
            magic,
            version,
            file_uuid,
            page_size,
            space_strategy,
            page_count,
            created_at,
            last_close,
            close_count,
            reserved,
            checksum,
        };

        if !verify_crc32c(&sb.to_bytes()[..Self::CHECKSUM_OFFSET], checksum) {
            return Err(Error::Storage("superblock checksum mismatch".into()));
        }

        sb.validate()?;
        Ok(sb)
    }

    /// Compute checksum of superblock (CRC32C)
    fn compute_checksum(&self) -> u32 {
        let bytes = self.to_bytes();
        compute_crc32c(&bytes[..Self::CHECKSUM_OFFSET])
    }

    /// Update the checksum field after modifying other fields
    pub fn update_checksum(&mut self) {
        self.checksum = self.compute_checksum();
    }

    /// Record a close after writing
    pub fn record_close(&mut self, page_count: u64) {
        self.page_count = page_count.max(FIRST_DATA_PAGE);
        self.last_close = unix_now();
        self.close_count += 1;
        self.update_checksum();
    }

    /// Validate superblock consistency
    pub fn validate(&self) -> Result<()> {
        if self.page_size < MIN_PAGE_SIZE || !self.page_size.is_power_of_two() {
            return Err(Error::Storage(format!(
                "invalid page size {}",
                self.page_size
            )));
        }
        if self.page_count < FIRST_DATA_PAGE {
            return Err(Error::Storage("page count excludes the superblock".into()));
        }
        Ok(())
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
