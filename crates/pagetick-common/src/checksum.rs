//! Checksum utilities for pagetick
//!
//! Every on-disk structure (data-file superblock, metadata header, metadata
//! index, page images) is protected by CRC32C.

/// Quick CRC32C computation
#[inline]
#[must_use]
pub fn compute_crc32c(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
}

/// Quick CRC32C verification
#[inline]
#[must_use]
pub fn verify_crc32c(data: &[u8], expected: u32) -> bool {
    crc32c::crc32c(data) == expected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify() {
        let data = b"page image";
        let crc = compute_crc32c(data);
        assert!(verify_crc32c(data, crc));
        assert!(!verify_crc32c(b"page imagf", crc));
    }
}
