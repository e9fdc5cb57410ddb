//! Metadata file space management
//!
//! Page images and index regions in the metadata file live in extents of
//! whole pages. Freed extents are kept sorted and coalesced; allocation is
//! first-fit, growing the file at its end when nothing fits.

use pagetick_common::{Error, Result};

/// A contiguous range of pages
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Extent {
    /// Starting page number
    pub start: u64,
    /// Number of pages in the extent
    pub length: u64,
}

impl Extent {
    /// Create a new extent
    #[must_use]
    pub const fn new(start: u64, length: u64) -> Self {
        Self { start, length }
    }

    /// Get the ending page number (exclusive)
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.start + self.length
    }

    /// Check if this extent contains a page
    #[must_use]
    pub const fn contains(&self, page: u64) -> bool {
        page >= self.start && page < self.end()
    }

    /// Check if two extents overlap
    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.start < other.end() && other.start < self.end()
    }

    /// Try to merge with an adjacent extent
    #[must_use]
    pub const fn try_merge(&self, other: &Self) -> Option<Self> {
        if self.end() == other.start {
            Some(Self::new(self.start, self.length + other.length))
        } else if other.end() == self.start {
            Some(Self::new(other.start, self.length + other.length))
        } else {
            None
        }
    }
}

/// First-fit page allocator over a free-extent list
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageAllocator {
    /// Pages below this are never handed out
    reserved: u64,
    /// One past the highest page ever allocated
    end_of_allocation: u64,
    /// Free extents, sorted by start and never adjacent
    free: Vec<Extent>,
}

impl PageAllocator {
    /// Create an allocator that never hands out the first `reserved` pages
    #[must_use]
    pub const fn new(reserved: u64) -> Self {
        Self {
            reserved,
            end_of_allocation: reserved,
            free: Vec::new(),
        }
    }

    /// One past the highest page ever allocated
    #[must_use]
    pub const fn end_of_allocation(&self) -> u64 {
        self.end_of_allocation
    }

    /// Total free pages below the end of allocation
    #[must_use]
    pub fn free_pages(&self) -> u64 {
        self.free.iter().map(|e| e.length).sum()
    }

    /// Free extents in page order
    #[must_use]
    pub fn free_extents(&self) -> &[Extent] {
        &self.free
    }

    /// Allocate `count` contiguous pages
    pub fn allocate(&mut self, count: u64) -> Result<Extent> {
        if count == 0 {
            return Err(Error::invalid_argument("cannot allocate zero pages"));
        }

        if let Some(idx) = self.free.iter().position(|e| e.length >= count) {
            let hole = self.free[idx];
            let extent = Extent::new(hole.start, count);
            if hole.length == count {
                self.free.remove(idx);
            } else {
                self.free[idx] = Extent::new(hole.start + count, hole.length - count);
            }
            return Ok(extent);
        }

        // Extend the trailing hole when it touches the end of allocation
        let start = match self.free.last() {
            Some(last) if last.end() == self.end_of_allocation => {
                let start = last.start;
                self.free.pop();
                start
            }
            _ => self.end_of_allocation,
        };
        let extent = Extent::new(start, count);
        self.end_of_allocation = extent.end();
        Ok(extent)
    }

    /// Return an extent to the free list
    pub fn free(&mut self, extent: Extent) -> Result<()> {
        if extent.length == 0 {
            return Ok(());
        }
        if extent.start < self.reserved || extent.end() > self.end_of_allocation {
            return Err(Error::storage(format!(
                "extent {}..{} outside allocated range {}..{}",
                extent.start,
                extent.end(),
                self.reserved,
                self.end_of_allocation
            )));
        }

        let idx = self.free.partition_point(|e| e.start < extent.start);
        let overlaps_prev = idx > 0 && self.free[idx - 1].overlaps(&extent);
        let overlaps_next = self.free.get(idx).is_some_and(|e| e.overlaps(&extent));
        if overlaps_prev || overlaps_next {
            return Err(Error::storage(format!(
                "double free of extent {}..{}",
                extent.start,
                extent.end()
            )));
        }

        let mut merged = extent;
        let mut insert_at = idx;
        if let Some(next) = self.free.get(idx)
            && let Some(m) = merged.try_merge(next)
        {
            merged = m;
            self.free.remove(idx);
        }
        if idx > 0
            && let Some(m) = self.free[idx - 1].try_merge(&merged)
        {
            merged = m;
            insert_at = idx - 1;
            self.free.remove(insert_at);
        }
        self.free.insert(insert_at, merged);
        Ok(())
    }
}
