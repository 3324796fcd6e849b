use usm_common::http2::HTTP2_MAX_PATH_LEN;
use usm_common::ConnTuple;

use crate::maps::LruMap;

pub const HTTP2_DYNAMIC_TABLE_CLEANUP_THRESHOLD: u64 = 300;
pub const HTTP2_DYNAMIC_TABLE_CLEANUP_ITERATIONS: u64 = 10;

/// Key of one stored header value: the directional tuple whose encoder
/// inserted it, and its insertion number.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DynamicTableIndex {
    pub tuple: ConnTuple,
    pub index: u64,
}

/// Value of an interesting header inserted with incremental indexing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DynamicTableEntry {
    /// Static index of the header name (method, path or status).
    pub original_index: u8,
    pub buffer: [u8; HTTP2_MAX_PATH_LEN],
    pub length: u8,
    pub is_huffman_encoded: bool,
}

impl DynamicTableEntry {
    pub fn new(original_index: u8, value: &[u8], is_huffman_encoded: bool) -> Self {
        let length = value.len().min(HTTP2_MAX_PATH_LEN);
        let mut buffer = [0; HTTP2_MAX_PATH_LEN];
        buffer[..length].copy_from_slice(&value[..length]);
        DynamicTableEntry {
            original_index,
            buffer,
            length: length as u8,
            is_huffman_encoded,
        }
    }

    pub fn value(&self) -> &[u8] {
        &self.buffer[..self.length as usize]
    }
}

/// `value` counts insertions so far, `previous` is the oldest insertion
/// that may still be stored.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DynamicCounter {
    pub value: u64,
    pub previous: u64,
}

impl DynamicCounter {
    /// Maps a wire index above the static table to an insertion number.
    /// Index 62 is the newest insertion.
    pub fn internal_index(&self, raw_index: u64) -> Option<u64> {
        let relative = raw_index.checked_sub(super::hpack::MAX_STATIC_TABLE_INDEX)?;
        if relative == 0 || relative > self.value {
            return None;
        }
        Some(self.value - relative)
    }
}

/// Per-tuple HPACK dynamic tables.
///
/// Only values of interesting headers are stored, but every insertion the
/// peer makes bumps the counter so wire indices stay aligned.
pub struct DynamicTable {
    entries: LruMap<DynamicTableIndex, DynamicTableEntry>,
    counters: LruMap<ConnTuple, DynamicCounter>,
}

impl DynamicTable {
    pub fn new(max_entries: usize, max_counters: usize) -> Self {
        DynamicTable {
            entries: LruMap::with_max_entries("http2_dynamic_table", max_entries),
            counters: LruMap::with_max_entries("http2_dynamic_counter_table", max_counters),
        }
    }

    pub fn counter(&self, tuple: &ConnTuple) -> DynamicCounter {
        self.counters.lookup_or_init(tuple, DynamicCounter::default)
    }

    pub fn set_counter(&self, tuple: &ConnTuple, counter: DynamicCounter) {
        self.counters.update(*tuple, counter);
    }

    pub fn lookup(&self, tuple: &ConnTuple, index: u64) -> Option<DynamicTableEntry> {
        self.entries.lookup(&DynamicTableIndex {
            tuple: *tuple,
            index,
        })
    }

    pub fn insert(&self, tuple: &ConnTuple, index: u64, entry: DynamicTableEntry) {
        self.entries.update(
            DynamicTableIndex {
                tuple: *tuple,
                index,
            },
            entry,
        );
    }

    /// Evicts the oldest entries until at most
    /// `HTTP2_DYNAMIC_TABLE_CLEANUP_THRESHOLD` insertions lie behind the
    /// head. Each round deletes up to `HTTP2_DYNAMIC_TABLE_CLEANUP_ITERATIONS`.
    /// Returns how many insertion numbers were retired.
    pub fn clean(&self, tuple: &ConnTuple) -> u64 {
        let Some(mut counter) = self.counters.lookup(tuple) else {
            return 0;
        };
        let start = counter.previous;
        while counter.value - counter.previous > HTTP2_DYNAMIC_TABLE_CLEANUP_THRESHOLD {
            let end = (counter.previous + HTTP2_DYNAMIC_TABLE_CLEANUP_ITERATIONS)
                .min(counter.value - HTTP2_DYNAMIC_TABLE_CLEANUP_THRESHOLD);
            for index in counter.previous..end {
                self.entries.delete(&DynamicTableIndex {
                    tuple: *tuple,
                    index,
                });
            }
            counter.previous = end;
        }
        if counter.previous != start {
            self.counters.update(*tuple, counter);
        }
        counter.previous - start
    }

    /// Drops the counter and every entry still live for the tuple.
    pub fn purge(&self, tuple: &ConnTuple) {
        let Some(counter) = self.counters.delete(tuple) else {
            return;
        };
        for index in counter.previous..counter.value {
            self.entries.delete(&DynamicTableIndex {
                tuple: *tuple,
                index,
            });
        }
    }

    /// Number of stored values for the tuple.
    pub fn live_entries(&self, tuple: &ConnTuple) -> usize {
        let Some(counter) = self.counters.lookup(tuple) else {
            return 0;
        };
        (counter.previous..counter.value)
            .filter(|&index| self.lookup(tuple, index).is_some())
            .count()
    }
}
