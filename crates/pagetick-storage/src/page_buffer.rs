//! Page buffer
//!
//! Application-level cache of file pages. Besides ordinary LRU caching it
//! tracks the lifecycle a page goes through under SWMR:
//!
//! ```text
//! write_page ──> Modified ──(tick publishes it)──> Delayed { until }
//!                   ^                                   │
//!                   └──────── write_page ───────────────┤
//!                                                       v
//!                            Clean <──(written back at `until`)
//! ```
//!
//! Modified and delayed pages are pinned: only clean pages are evicted. The
//! buffer may therefore grow past its capacity while many pages are pinned.

use bytes::Bytes;
use pagetick_common::TickNum;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lifecycle state of a buffered page
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageState {
    /// Matches the data file
    Clean,
    /// Modified since the last tick, not yet published
    Modified,
    /// Published, waiting to be written back to the data file
    Delayed { until: TickNum },
}

impl PageState {
    /// Check if the page may be evicted
    pub const fn is_evictable(self) -> bool {
        matches!(self, Self::Clean)
    }
}

/// Individual buffer entry with LRU tracking
#[derive(Debug)]
struct BufferEntry {
    data: Bytes,
    /// Last access time for LRU eviction
    last_access: AtomicU64,
    state: PageState,
    /// Clock value of the last `write`
    generation: u64,
}

impl BufferEntry {
    fn new(data: Bytes, clock: u64, state: PageState) -> Self {
        Self {
            data,
            last_access: AtomicU64::new(clock),
            state,
            generation: clock,
        }
    }

    fn touch(&self, clock: u64) {
        self.last_access.store(clock, Ordering::Relaxed);
    }
}

/// A copy of a pinned page taken for publication or write-back
///
/// `generation` identifies the write that produced `data`. State changes
/// keyed on it are skipped when the page has been written again since.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferedPage {
    pub page: u64,
    pub generation: u64,
    pub data: Bytes,
}

/// Page buffer statistics
#[derive(Debug, Default)]
pub struct PageBufferStats {
    /// Number of buffer hits
    pub hits: AtomicU64,
    /// Number of buffer misses
    pub misses: AtomicU64,
    /// Number of clean pages evicted for capacity
    pub evictions: AtomicU64,
    /// Number of pages dropped by explicit invalidation
    pub invalidations: AtomicU64,
    /// Number of pages written back to the data file
    pub writebacks: AtomicU64,
}

impl PageBufferStats {
    /// Calculate hit ratio (0.0 to 1.0)
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }
}

/// LRU page buffer keyed by page number
#[derive(Debug)]
pub struct PageBuffer {
    entries: RwLock<HashMap<u64, BufferEntry>>,
    /// Capacity in bytes
    capacity: usize,
    page_size: usize,
    /// Logical clock for LRU ordering
    clock: AtomicU64,
    stats: PageBufferStats,
}

impl PageBuffer {
    /// Create a page buffer holding `capacity` bytes of `page_size` pages
    pub fn new(capacity: usize, page_size: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            capacity,
            page_size,
            clock: AtomicU64::new(0),
            stats: PageBufferStats::default(),
        }
    }

    /// Get buffer statistics
    pub fn stats(&self) -> &PageBufferStats {
        &self.stats
    }

    /// Capacity in bytes
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of pages the capacity holds
    pub fn max_pages(&self) -> usize {
        (self.capacity / self.page_size.max(1)).max(1)
    }

    /// Number of buffered pages
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Check if the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Advance the logical clock and return the new value
    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Look up a page
    pub fn get(&self, page: u64) -> Option<Bytes> {
        let entries = self.entries.read();
        if let Some(entry) = entries.get(&page) {
            entry.touch(self.tick());
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            Some(entry.data.clone())
        } else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// State of a buffered page
    pub fn state(&self, page: u64) -> Option<PageState> {
        self.entries.read().get(&page).map(|e| e.state)
    }

    /// Check if a page is buffered
    pub fn contains(&self, page: u64) -> bool {
        self.entries.read().contains_key(&page)
    }

    /// Insert a clean page read from storage
    ///
    /// A pinned page already in the buffer is left alone.
    pub fn insert(&self, page: u64, data: Bytes) {
        let clock = self.tick();
        let mut entries = self.entries.write();

        if entries.get(&page).is_some_and(|e| !e.state.is_evictable()) {
            return;
        }
        entries.remove(&page);
        self.make_room(&mut entries);
        entries.insert(page, BufferEntry::new(data, clock, PageState::Clean));
    }

    /// Record a page modification
    ///
    /// The page is pinned until a tick publishes it.
    pub fn write(&self, page: u64, data: Bytes) {
        let clock = self.tick();
        let mut entries = self.entries.write();

        if let Some(entry) = entries.get_mut(&page) {
            entry.data = data;
            entry.state = PageState::Modified;
            entry.generation = clock;
            entry.touch(clock);
            return;
        }

        self.make_room(&mut entries);
        entries.insert(page, BufferEntry::new(data, clock, PageState::Modified));
    }

    fn collect(&self, keep: impl Fn(PageState) -> bool) -> Vec<BufferedPage> {
        let entries = self.entries.read();
        let mut pages: Vec<_> = entries
            .iter()
            .filter(|(_, e)| keep(e.state))
            .map(|(page, e)| BufferedPage {
                page: *page,
                generation: e.generation,
                data: e.data.clone(),
            })
            .collect();
        pages.sort_unstable_by_key(|p| p.page);
        pages
    }

    /// Pages modified since the last tick, in page order
    pub fn tick_list(&self) -> Vec<BufferedPage> {
        self.collect(|state| state == PageState::Modified)
    }

    /// Move published pages to delayed write-back until `until`
    ///
    /// A page rewritten after `tick_list` stays modified for the next tick.
    pub fn mark_published(&self, pages: &[BufferedPage], until: TickNum) {
        let mut entries = self.entries.write();
        for published in pages {
            if let Some(entry) = entries.get_mut(&published.page)
                && entry.state == PageState::Modified
                && entry.generation == published.generation
            {
                entry.state = PageState::Delayed { until };
            }
        }
    }

    /// Delayed pages whose write-back is due at `tick`
    pub fn due_for_writeback(&self, tick: TickNum) -> Vec<BufferedPage> {
        self.collect(|state| matches!(state, PageState::Delayed { until } if until <= tick))
    }

    /// Every page not yet written back to the data file, in page order
    pub fn unwritten(&self) -> Vec<BufferedPage> {
        self.collect(|state| !state.is_evictable())
    }

    /// Mark a page clean after `written` reached the data file
    ///
    /// Returns false, leaving the page pinned, when it was written again
    /// after the copy was taken.
    pub fn mark_clean(&self, written: &BufferedPage) -> bool {
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get_mut(&written.page)
            && !entry.state.is_evictable()
            && entry.generation == written.generation
        {
            entry.state = PageState::Clean;
            self.stats.writebacks.fetch_add(1, Ordering::Relaxed);
            return true;
        }
        false
    }

    /// Drop a page from the buffer, whatever its state
    pub fn invalidate(&self, page: u64) -> Option<Bytes> {
        let removed = self.entries.write().remove(&page);
        if removed.is_some() {
            self.stats.invalidations.fetch_add(1, Ordering::Relaxed);
        }
        removed.map(|e| e.data)
    }

    /// Clear all entries from the buffer
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Evict clean LRU pages until one more page fits
    fn make_room(&self, entries: &mut HashMap<u64, BufferEntry>) {
        while entries.len() >= self.max_pages() {
            let Some(victim) = Self::find_lru_clean(entries) else {
                break;
            };
            entries.remove(&victim);
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn find_lru_clean(entries: &HashMap<u64, BufferEntry>) -> Option<u64> {
        entries
            .iter()
            .filter(|(_, e)| e.state.is_evictable())
            .min_by_key(|(_, e)| e.last_access.load(Ordering::Relaxed))
            .map(|(page, _)| *page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(byte: u8) -> Bytes {
        Bytes::from(vec![byte; 512])
    }

    #[test]
    fn test_insert_and_get() {
        let buffer = PageBuffer::new(4096, 512);
        buffer.insert(1, page(1));

        assert_eq!(buffer.get(1), Some(page(1)));
        assert_eq!(buffer.get(2), None);
        assert_eq!(buffer.stats().hits.load(Ordering::Relaxed), 1);
        assert_eq!(buffer.stats().misses.load(Ordering::Relaxed), 1);
        assert!((buffer.stats().hit_ratio() - 0.5).abs() < 0.01);
    }

    #[test]
    fn test_lru_eviction_of_clean_pages() {
        let buffer = PageBuffer::new(1024, 512);
        assert_eq!(buffer.max_pages(), 2);

        buffer.insert(1, page(1));
        buffer.insert(2, page(2));
        buffer.get(1);
        buffer.insert(3, page(3));

        assert!(buffer.contains(1));
        assert!(!buffer.contains(2));
        assert!(buffer.contains(3));
        assert_eq!(buffer.stats().evictions.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_modified_pages_are_pinned() {
        let buffer = PageBuffer::new(1024, 512);

        buffer.write(1, page(1));
        buffer.write(2, page(2));
        buffer.insert(3, page(3));

        // Nothing clean to evict, so the buffer overflows
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.state(1), Some(PageState::Modified));

        // A clean read never replaces a pinned page
        buffer.insert(1, page(9));
        assert_eq!(buffer.get(1), Some(page(1)));
    }

    #[test]
    fn test_tick_list_and_publish() {
        let buffer = PageBuffer::new(8192, 512);
        buffer.insert(4, page(4));
        buffer.write(7, page(7));
        buffer.write(2, page(2));

        let list = buffer.tick_list();
        assert_eq!(list.iter().map(|p| p.page).collect::<Vec<_>>(), vec![2, 7]);

        buffer.mark_published(&list, TickNum(5));
        assert!(buffer.tick_list().is_empty());
        assert_eq!(buffer.state(7), Some(PageState::Delayed { until: TickNum(5) }));

        assert!(buffer.due_for_writeback(TickNum(4)).is_empty());
        let due = buffer.due_for_writeback(TickNum(5));
        assert_eq!(due.len(), 2);

        assert!(buffer.mark_clean(&due[0]));
        assert_eq!(buffer.state(2), Some(PageState::Clean));
        assert_eq!(buffer.unwritten().len(), 1);
    }

    #[test]
    fn test_rewrite_after_publish_is_modified_again() {
        let buffer = PageBuffer::new(8192, 512);
        buffer.write(3, page(1));
        buffer.mark_published(&buffer.tick_list(), TickNum(4));
        buffer.write(3, page(2));

        assert_eq!(buffer.state(3), Some(PageState::Modified));
        let list = buffer.tick_list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].data, page(2));
    }

    #[test]
    fn test_write_during_publish_stays_modified() {
        let buffer = PageBuffer::new(8192, 512);
        buffer.write(3, page(1));
        let snapshot = buffer.tick_list();

        // Rewritten between taking the tick list and marking it published
        buffer.write(3, page(2));
        buffer.mark_published(&snapshot, TickNum(4));

        assert_eq!(buffer.state(3), Some(PageState::Modified));
        assert_eq!(buffer.tick_list()[0].data, page(2));
    }

    #[test]
    fn test_write_during_writeback_stays_pinned() {
        let buffer = PageBuffer::new(8192, 512);
        buffer.write(5, page(1));
        buffer.mark_published(&buffer.tick_list(), TickNum(2));
        let due = buffer.due_for_writeback(TickNum(2));

        buffer.write(5, page(2));
        assert!(!buffer.mark_clean(&due[0]));
        assert_eq!(buffer.state(5), Some(PageState::Modified));
        assert_eq!(buffer.stats().writebacks.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_invalidate() {
        let buffer = PageBuffer::new(8192, 512);
        buffer.insert(1, page(1));
        buffer.write(2, page(2));

        assert_eq!(buffer.invalidate(1), Some(page(1)));
        assert!(buffer.invalidate(2).is_some());
        assert!(buffer.invalidate(3).is_none());
        assert!(buffer.is_empty());
        assert_eq!(buffer.stats().invalidations.load(Ordering::Relaxed), 2);
    }
}
