//! Delayed retirement of superseded metadata slots
//!
//! A reader may still be reading a snapshot that references a slot the
//! writer just superseded. The slot is therefore only returned to the
//! allocator `max_lag` ticks after it left the index.

use super::codec::IndexEntry;
use pagetick_common::TickNum;
use serde::Serialize;
use std::collections::VecDeque;

/// A superseded index entry waiting to be released
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct DelayedEntry {
    /// The entry as it was last published
    pub entry: IndexEntry,
    /// First tick at which the slot may be reused
    pub retire_at_tick: TickNum,
}

/// FIFO of superseded entries ordered by retirement tick
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DelayedRetirementList {
    entries: VecDeque<DelayedEntry>,
}

impl DelayedRetirementList {
    /// Create an empty list
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries waiting
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if nothing is waiting
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in retirement order
    pub fn iter(&self) -> impl Iterator<Item = &DelayedEntry> {
        self.entries.iter()
    }

    /// Add an entry superseded at `tick`
    pub fn push(&mut self, entry: IndexEntry, tick: TickNum, max_lag: u32) {
        let retire_at_tick = tick.plus(u64::from(max_lag));
        debug_assert!(
            self.entries
                .back()
                .is_none_or(|last| last.retire_at_tick <= retire_at_tick)
        );
        self.entries.push_back(DelayedEntry {
            entry,
            retire_at_tick,
        });
    }

    /// Remove and return every entry due at `tick`
    pub fn release_expired(&mut self, tick: TickNum) -> Vec<DelayedEntry> {
        let due = self
            .entries
            .iter()
            .take_while(|d| d.retire_at_tick <= tick)
            .count();
        self.entries.drain(..due).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(page: u64) -> IndexEntry {
        IndexEntry {
            data_page_offset: page,
            md_file_page_offset: page + 10,
            length: 512,
            checksum: 0,
        }
    }

    #[test]
    fn test_entries_retire_after_max_lag() {
        let mut list = DelayedRetirementList::new();
        list.push(entry(1), TickNum(4), 3);
        list.push(entry(2), TickNum(4), 3);
        list.push(entry(3), TickNum(5), 3);

        assert!(list.release_expired(TickNum(6)).is_empty());

        let released = list.release_expired(TickNum(7));
        assert_eq!(released.len(), 2);
        assert_eq!(released[0].retire_at_tick, TickNum(7));
        assert_eq!(list.len(), 1);

        assert_eq!(list.release_expired(TickNum(100)).len(), 1);
        assert!(list.is_empty());
    }
}
