//! Metadata file encoding
//!
//! ```text
//! +--------------------+  offset 0
//! |  Header (64 B)     |  magic, version, page size, tick, index location, crc
//! +--------------------+  reserved_pages * page_size
//! |  Page images       |  one slot per published page, `length` bytes each
//! |  Index regions     |  magic, tick, entries sorted by data page, crc
//! |       ...          |
//! +--------------------+
//! ```
//!
//! All integers are little-endian. The header is written last during a
//! publish, so a reader that sees a valid header also sees the index and page
//! images it points to.

use crate::layout::page_offset;
use crate::space::Extent;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use pagetick_common::{Error, MIN_PAGE_SIZE, Result, TickNum, compute_crc32c, verify_crc32c};
use serde::Serialize;
use uuid::Uuid;

/// Magic number at the start of the metadata file header
pub const HEADER_MAGIC: [u8; 4] = *b"PTKH";

/// Magic number at the start of every index region
pub const INDEX_MAGIC: [u8; 4] = *b"PTKI";

/// Metadata file format version
pub const METADATA_FORMAT_VERSION: u32 = 1;

/// Encoded header size
pub const HEADER_SIZE: usize = 64;

/// Encoded index entry size
pub const INDEX_ENTRY_SIZE: usize = 24;

/// Index region bytes besides its entries: magic(4) + tick(8) + count(4) + crc(4)
pub const INDEX_OVERHEAD: usize = 20;

/// Location and checksum of one published page image
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct IndexEntry {
    /// Page number in the data file
    pub data_page_offset: u64,
    /// Page number in the metadata file where the image starts
    pub md_file_page_offset: u64,
    /// Image length in bytes
    pub length: u32,
    /// CRC32C of the image
    pub checksum: u32,
}

impl IndexEntry {
    /// Metadata file pages occupied by the image
    #[must_use]
    pub const fn extent(&self, page_size: u32) -> Extent {
        Extent::new(
            self.md_file_page_offset,
            (self.length as u64).div_ceil(page_size as u64),
        )
    }

    /// Byte range `(start, end)` of the image in the metadata file
    ///
    /// `None` when the entry points past any addressable offset.
    #[must_use]
    pub const fn image_range(&self, page_size: u32) -> Option<(u64, u64)> {
        let Some(start) = self.md_file_page_offset.checked_mul(page_size as u64) else {
            return None;
        };
        match start.checked_add(self.length as u64) {
            Some(end) => Some((start, end)),
            None => None,
        }
    }

    /// Image byte range, rejecting entries that end past `file_len`
    pub fn checked_image_range(&self, page_size: u32, file_len: u64) -> Result<(u64, u64)> {
        match self.image_range(page_size) {
            Some((start, end)) if end <= file_len => Ok((start, end)),
            _ => Err(Error::corrupt(format!(
                "page {} image at metadata page {} ({} bytes) runs past the end of the {} byte metadata file",
                self.data_page_offset, self.md_file_page_offset, self.length, file_len
            ))),
        }
    }

    /// Check an image read back from the metadata file
    pub fn verify(&self, image: &[u8]) -> Result<()> {
        if image.len() != self.length as usize {
            return Err(Error::corrupt(format!(
                "page {} image is {} bytes, index says {}",
                self.data_page_offset,
                image.len(),
                self.length
            )));
        }
        if !verify_crc32c(image, self.checksum) {
            return Err(Error::corrupt(format!(
                "page {} image checksum mismatch: computed={:08x}, stored={:08x}",
                self.data_page_offset,
                compute_crc32c(image),
                self.checksum
            )));
        }
        Ok(())
    }

    /// Check if `content` is the image this entry describes
    #[must_use]
    pub fn matches(&self, content: &[u8]) -> bool {
        content.len() == self.length as usize && verify_crc32c(content, self.checksum)
    }
}

/// A page handed to the writer for publication
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageImage {
    /// Page number in the data file
    pub data_page_offset: u64,
    /// Page content
    pub content: Bytes,
}

impl PageImage {
    /// Create a page image
    pub fn new(data_page_offset: u64, content: impl Into<Bytes>) -> Self {
        Self {
            data_page_offset,
            content: content.into(),
        }
    }
}

/// Metadata file header
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MetadataHeader {
    /// Page size shared by the data file and the metadata file
    pub page_size: u32,
    /// Pages at the head of the metadata file reserved for the header
    pub reserved_pages: u32,
    /// Tick of the snapshot this header describes
    pub tick_num: TickNum,
    /// Byte offset of the index region
    pub index_offset: u64,
    /// Byte length of the index region
    pub index_length: u64,
    /// Number of entries in the index
    pub index_entry_count: u32,
    /// UUID of the data file this metadata file belongs to
    pub file_uuid: Uuid,
}

impl MetadataHeader {
    /// Offset of the checksum field:
    /// magic(4) + version(4) + page_size(4) + reserved_pages(4) + tick(8) +
    /// index_offset(8) + index_length(8) + entry_count(4) + uuid(16) = 60
    const CHECKSUM_OFFSET: usize = 60;

    /// Byte offset just past the index region
    #[must_use]
    pub const fn index_end(&self) -> u64 {
        self.index_offset.saturating_add(self.index_length)
    }

    /// Serialize the header
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE);

        buf.put_slice(&HEADER_MAGIC);
        buf.put_u32_le(METADATA_FORMAT_VERSION);
        buf.put_u32_le(self.page_size);
        buf.put_u32_le(self.reserved_pages);
        buf.put_u64_le(self.tick_num.get());
        buf.put_u64_le(self.index_offset);
        buf.put_u64_le(self.index_length);
        buf.put_u32_le(self.index_entry_count);
        buf.put_slice(self.file_uuid.as_bytes());

        let checksum = compute_crc32c(&buf[..Self::CHECKSUM_OFFSET]);
        buf.put_u32_le(checksum);

        let mut out = [0u8; HEADER_SIZE];
        out.copy_from_slice(&buf);
        out
    }

    /// Parse a header
    ///
    /// Returns `Ok(None)` when the magic bytes are all zero: the metadata
    /// file exists but nothing has been published yet.
    pub fn decode(data: &[u8]) -> Result<Option<Self>> {
        if data.len() < HEADER_SIZE {
            return Err(Error::corrupt(format!(
                "header truncated: {} of {} bytes",
                data.len(),
                HEADER_SIZE
            )));
        }

        let mut buf = &data[..HEADER_SIZE];

        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        if magic == [0u8; 4] {
            return Ok(None);
        }
        if magic != HEADER_MAGIC {
            return Err(Error::corrupt(format!("bad header magic {magic:02x?}")));
        }

        let stored = u32::from_le_bytes([
            data[Self::CHECKSUM_OFFSET],
            data[Self::CHECKSUM_OFFSET + 1],
            data[Self::CHECKSUM_OFFSET + 2],
            data[Self::CHECKSUM_OFFSET + 3],
        ]);
        let computed = compute_crc32c(&data[..Self::CHECKSUM_OFFSET]);
        if stored != computed {
            return Err(Error::corrupt(format!(
                "header checksum mismatch: computed={computed:08x}, stored={stored:08x}"
            )));
        }

        let version = buf.get_u32_le();
        if version != METADATA_FORMAT_VERSION {
            return Err(Error::corrupt(format!(
                "unsupported metadata file version {version}"
            )));
        }

        let page_size = buf.get_u32_le();
        let reserved_pages = buf.get_u32_le();
        let tick_num = TickNum(buf.get_u64_le());
        let index_offset = buf.get_u64_le();
        let index_length = buf.get_u64_le();
        let index_entry_count = buf.get_u32_le();
        let mut uuid_bytes = [0u8; 16];
        buf.copy_to_slice(&mut uuid_bytes);

        let header = Self {
            page_size,
            reserved_pages,
            tick_num,
            index_offset,
            index_length,
            index_entry_count,
            file_uuid: Uuid::from_bytes(uuid_bytes),
        };
        header.validate()?;
        Ok(Some(header))
    }

    fn validate(&self) -> Result<()> {
        if self.page_size < MIN_PAGE_SIZE || !self.page_size.is_power_of_two() {
            return Err(Error::corrupt(format!("invalid page size {}", self.page_size)));
        }
        if self.reserved_pages == 0 {
            return Err(Error::corrupt("no pages reserved for the header"));
        }
        if self.index_offset % u64::from(self.page_size) != 0 {
            return Err(Error::corrupt(format!(
                "index offset {} is not page aligned",
                self.index_offset
            )));
        }
        if self.index_offset < page_offset(u64::from(self.reserved_pages), self.page_size) {
            return Err(Error::corrupt(format!(
                "index offset {} lies in the reserved region",
                self.index_offset
            )));
        }
        if self.index_offset.checked_add(self.index_length).is_none() {
            return Err(Error::corrupt(format!(
                "index at offset {} with length {} overflows",
                self.index_offset, self.index_length
            )));
        }
        if self.index_length != index_encoded_len(self.index_entry_count) {
            return Err(Error::corrupt(format!(
                "index length {} does not fit {} entries",
                self.index_length, self.index_entry_count
            )));
        }
        Ok(())
    }
}

/// Byte length of an index region holding `count` entries
#[must_use]
pub const fn index_encoded_len(count: u32) -> u64 {
    (INDEX_OVERHEAD + INDEX_ENTRY_SIZE * count as usize) as u64
}

/// Published index: one entry per page, sorted by data page
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MetadataIndex {
    /// Tick that published this index
    pub tick_num: TickNum,
    /// Entries sorted by `data_page_offset`
    pub entries: Vec<IndexEntry>,
}

impl MetadataIndex {
    /// Find the entry for a data page
    #[must_use]
    pub fn lookup(&self, data_page_offset: u64) -> Option<&IndexEntry> {
        self.entries
            .binary_search_by_key(&data_page_offset, |e| e.data_page_offset)
            .ok()
            .map(|idx| &self.entries[idx])
    }

    /// Serialize the index region
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf =
            BytesMut::with_capacity(INDEX_OVERHEAD + INDEX_ENTRY_SIZE * self.entries.len());

        buf.put_slice(&INDEX_MAGIC);
        buf.put_u64_le(self.tick_num.get());
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u32_le(self.entries.len() as u32);
        for entry in &self.entries {
            buf.put_u64_le(entry.data_page_offset);
            buf.put_u64_le(entry.md_file_page_offset);
            buf.put_u32_le(entry.length);
            buf.put_u32_le(entry.checksum);
        }
        let checksum = compute_crc32c(&buf);
        buf.put_u32_le(checksum);

        buf.to_vec()
    }

    /// Parse an index region described by `header`
    pub fn decode(data: &[u8], header: &MetadataHeader) -> Result<Self> {
        let expected = index_encoded_len(header.index_entry_count);
        if data.len() as u64 != expected {
            return Err(Error::corrupt(format!(
                "index region is {} bytes, expected {}",
                data.len(),
                expected
            )));
        }

        let body_len = data.len() - 4;
        let mut tail = &data[body_len..];
        let stored = tail.get_u32_le();
        let computed = compute_crc32c(&data[..body_len]);
        if stored != computed {
            return Err(Error::corrupt(format!(
                "index checksum mismatch: computed={computed:08x}, stored={stored:08x}"
            )));
        }

        let mut buf = &data[..body_len];
        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        if magic != INDEX_MAGIC {
            return Err(Error::corrupt(format!("bad index magic {magic:02x?}")));
        }

        let tick_num = TickNum(buf.get_u64_le());
        if tick_num != header.tick_num {
            return Err(Error::corrupt(format!(
                "index is from {tick_num}, header is at {}",
                header.tick_num
            )));
        }

        let count = buf.get_u32_le();
        if count != header.index_entry_count {
            return Err(Error::corrupt(format!(
                "index holds {count} entries, header says {}",
                header.index_entry_count
            )));
        }

        let reserved = u64::from(header.reserved_pages);
        let mut entries: Vec<IndexEntry> = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let entry = IndexEntry {
                data_page_offset: buf.get_u64_le(),
                md_file_page_offset: buf.get_u64_le(),
                length: buf.get_u32_le(),
                checksum: buf.get_u32_le(),
            };
            if entry.md_file_page_offset < reserved {
                return Err(Error::corrupt(format!(
                    "page {} image lies in the reserved region",
                    entry.data_page_offset
                )));
            }
            if entry.length == 0 {
                return Err(Error::corrupt(format!(
                    "page {} image is empty",
                    entry.data_page_offset
                )));
            }
            if entries
                .last()
                .is_some_and(|prev| prev.data_page_offset >= entry.data_page_offset)
            {
                return Err(Error::corrupt("index entries out of order"));
            }
            entries.push(entry);
        }

        Ok(Self { tick_num, entries })
    }
}

/// One decoded view of a metadata file
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetadataSnapshot {
    /// The metadata file exists but nothing has been published
    Unpublished,
    /// A published header and the index it points to
    Published {
        header: MetadataHeader,
        index: MetadataIndex,
    },
}

impl MetadataSnapshot {
    /// Tick of the snapshot, zero when nothing is published
    #[must_use]
    pub const fn tick_num(&self) -> TickNum {
        match self {
            Self::Unpublished => TickNum::ZERO,
            Self::Published { header, .. } => header.tick_num,
        }
    }

    /// Published header, if any
    #[must_use]
    pub const fn header(&self) -> Option<&MetadataHeader> {
        match self {
            Self::Unpublished => None,
            Self::Published { header, .. } => Some(header),
        }
    }

    /// Index entries, empty when nothing is published
    #[must_use]
    pub fn entries(&self) -> &[IndexEntry] {
        match self {
            Self::Unpublished => &[],
            Self::Published { index, .. } => &index.entries,
        }
    }

    /// Find the entry for a data page
    #[must_use]
    pub fn lookup(&self, data_page_offset: u64) -> Option<&IndexEntry> {
        match self {
            Self::Unpublished => None,
            Self::Published { index, .. } => index.lookup(data_page_offset),
        }
    }
}

/// Decode a whole metadata file image
pub fn decode_snapshot(image: &[u8]) -> Result<MetadataSnapshot> {
    let Some(header) = MetadataHeader::decode(image)? else {
        return Ok(MetadataSnapshot::Unpublished);
    };

    let start = usize::try_from(header.index_offset)
        .map_err(|_| Error::corrupt("index offset out of range"))?;
    let len = usize::try_from(header.index_length)
        .map_err(|_| Error::corrupt("index length out of range"))?;
    let region = start
        .checked_add(len)
        .and_then(|end| image.get(start..end))
        .ok_or_else(|| {
            Error::corrupt(format!(
                "metadata file is {} bytes, index ends at {}",
                image.len(),
                header.index_end()
            ))
        })?;
    let index = MetadataIndex::decode(region, &header)?;

    for entry in &index.entries {
        entry.checked_image_range(header.page_size, image.len() as u64)?;
    }

    Ok(MetadataSnapshot::Published { header, index })
}

/// Slice a page image out of a whole metadata file image and verify it
pub fn page_image(image: &[u8], entry: &IndexEntry, page_size: u32) -> Result<Bytes> {
    let (start, end) = entry.checked_image_range(page_size, image.len() as u64)?;
    // Both bounds are within `image`, so they fit in usize
    let data = &image[start as usize..end as usize];
    entry.verify(data)?;
    Ok(Bytes::copy_from_slice(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: u32 = 512;

    fn sample_header(tick: u64, count: u32) -> MetadataHeader {
        MetadataHeader {
            page_size: PAGE,
            reserved_pages: 1,
            tick_num: TickNum(tick),
            index_offset: u64::from(PAGE) * 3,
            index_length: index_encoded_len(count),
            index_entry_count: count,
            file_uuid: Uuid::new_v4(),
        }
    }

    /// Build a metadata file image with one image page per entry
    fn sample_image(tick: u64, pages: &[(u64, u8)]) -> Vec<u8> {
        let count = u32::try_from(pages.len()).unwrap();
        let page = PAGE as usize;
        let mut header = sample_header(tick, count);
        header.index_offset = u64::from(PAGE) * (1 + pages.len() as u64);

        let mut file = vec![0u8; page * (2 + pages.len())];
        let mut entries = Vec::new();
        for (i, (data_page, fill)) in pages.iter().enumerate() {
            let content = vec![*fill; page];
            let md_page = 1 + i as u64;
            file[page * (1 + i)..page * (2 + i)].copy_from_slice(&content);
            entries.push(IndexEntry {
                data_page_offset: *data_page,
                md_file_page_offset: md_page,
                length: PAGE,
                checksum: compute_crc32c(&content),
            });
        }

        let index = MetadataIndex {
            tick_num: TickNum(tick),
            entries,
        };
        let encoded = index.encode();
        let start = header.index_offset as usize;
        file[start..start + encoded.len()].copy_from_slice(&encoded);
        file[..HEADER_SIZE].copy_from_slice(&header.encode());
        file
    }

    #[test]
    fn test_header_roundtrip() {
        let header = sample_header(7, 2);
        let bytes = header.encode();
        assert_eq!(MetadataHeader::decode(&bytes).unwrap(), Some(header));
    }

    #[test]
    fn test_zeroed_header_is_unpublished() {
        let file = vec![0u8; PAGE as usize];
        assert_eq!(MetadataHeader::decode(&file).unwrap(), None);
        assert_eq!(decode_snapshot(&file).unwrap(), MetadataSnapshot::Unpublished);
        assert_eq!(MetadataSnapshot::Unpublished.tick_num(), TickNum::ZERO);
    }

    #[test]
    fn test_header_corruption_detected() {
        let mut bytes = sample_header(7, 2).encode();
        bytes[20] ^= 0x01;
        assert!(matches!(
            MetadataHeader::decode(&bytes),
            Err(Error::CorruptMetadataFile(_))
        ));

        let mut bytes = sample_header(7, 2).encode();
        bytes[0] = b'X';
        assert!(MetadataHeader::decode(&bytes).is_err());

        assert!(MetadataHeader::decode(&bytes[..10]).is_err());
    }

    #[test]
    fn test_header_rejects_reserved_index_offset() {
        let mut header = sample_header(1, 0);
        header.index_offset = 0;
        assert!(MetadataHeader::decode(&header.encode()).is_err());

        header.index_offset = u64::from(PAGE) + 8;
        assert!(MetadataHeader::decode(&header.encode()).is_err());
    }

    #[test]
    fn test_snapshot_decode() {
        let file = sample_image(4, &[(2, 0xAA), (9, 0xBB)]);
        let snapshot = decode_snapshot(&file).unwrap();

        assert_eq!(snapshot.tick_num(), TickNum(4));
        assert_eq!(snapshot.entries().len(), 2);
        assert!(snapshot.lookup(5).is_none());

        let entry = snapshot.lookup(9).unwrap();
        let image = page_image(&file, entry, PAGE).unwrap();
        assert!(image.iter().all(|&b| b == 0xBB));
    }

    #[test]
    fn test_truncated_index_is_corrupt() {
        let file = sample_image(4, &[(2, 0xAA), (9, 0xBB)]);
        let header = MetadataHeader::decode(&file).unwrap().unwrap();
        let cut = (header.index_offset + header.index_length) as usize - 1;

        assert!(matches!(
            decode_snapshot(&file[..cut]),
            Err(Error::CorruptMetadataFile(_))
        ));
    }

    #[test]
    fn test_index_tick_mismatch_is_corrupt() {
        let mut file = sample_image(4, &[(2, 0xAA)]);
        let mut header = MetadataHeader::decode(&file).unwrap().unwrap();
        header.tick_num = TickNum(5);
        file[..HEADER_SIZE].copy_from_slice(&header.encode());

        let err = decode_snapshot(&file).unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_image_checksum_verified() {
        let mut file = sample_image(4, &[(2, 0xAA)]);
        let snapshot = decode_snapshot(&file).unwrap();
        let entry = *snapshot.lookup(2).unwrap();

        file[PAGE as usize + 3] ^= 0xFF;
        assert!(page_image(&file, &entry, PAGE).is_err());
        assert!(!entry.matches(&file[PAGE as usize..2 * PAGE as usize]));
    }

    #[test]
    fn test_entry_extent() {
        let entry = IndexEntry {
            data_page_offset: 1,
            md_file_page_offset: 4,
            length: PAGE + 1,
            checksum: 0,
        };
        assert_eq!(entry.extent(PAGE), Extent::new(4, 2));
        assert_eq!(
            entry.image_range(PAGE),
            Some((4 * u64::from(PAGE), 5 * u64::from(PAGE) + 1))
        );
    }

    #[test]
    fn test_entry_past_addressable_range_is_corrupt() {
        let mut file = sample_image(4, &[(2, 0xAA)]);
        let mut header = MetadataHeader::decode(&file).unwrap().unwrap();
        let mut index = MetadataIndex::decode(
            &file[header.index_offset as usize..][..header.index_length as usize],
            &header,
        )
        .unwrap();

        // Valid checksums around an offset whose byte position overflows u64
        index.entries[0].md_file_page_offset = u64::MAX / 256;
        assert_eq!(index.entries[0].image_range(PAGE), None);
        let encoded = index.encode();
        let start = header.index_offset as usize;
        file[start..start + encoded.len()].copy_from_slice(&encoded);

        let err = decode_snapshot(&file).unwrap_err();
        assert!(matches!(err, Error::CorruptMetadataFile(_)));
        assert!(matches!(
            page_image(&file, &index.entries[0], PAGE),
            Err(Error::CorruptMetadataFile(_))
        ));

        // An index region ending past u64::MAX is rejected with the header
        header.index_offset = u64::MAX - u64::from(PAGE) + 1;
        file[..HEADER_SIZE].copy_from_slice(&header.encode());
        assert!(matches!(
            decode_snapshot(&file),
            Err(Error::CorruptMetadataFile(_))
        ));
    }
}
