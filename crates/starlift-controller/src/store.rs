//! Bounded cache of transferred payloads.
//!
//! Every payload the orchestrator reassembles is kept here under its
//! export id so a transfer can be inspected or replayed after the fact.
//! When the store is full the oldest entry is evicted.

use starlift_core::codec::{DecodeError, decode};
use starlift_core::id::ExportId;
use starlift_core::model::PlatformSnapshot;

/// A single stored payload.
#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub export_id: ExportId,
    pub platform: String,
    pub stored_at_ms: u64,
    /// Encoded payload, header included.
    pub data: Vec<u8>,
}

impl StoredSnapshot {
    pub fn decode(&self) -> Result<PlatformSnapshot, DecodeError> {
        decode(&self.data)
    }
}

/// Fixed-capacity ring of stored payloads.
#[derive(Debug)]
pub struct SnapshotStore {
    entries: Vec<Option<StoredSnapshot>>,
    /// Write position (wraps around).
    head: usize,
    len: usize,
    /// Total payloads ever stored (including evicted).
    total_stored: u64,
}

impl SnapshotStore {
    /// A capacity of 0 is clamped to 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: (0..capacity).map(|_| None).collect(),
            head: 0,
            len: 0,
            total_stored: 0,
        }
    }

    /// Store a payload. Re-storing an export id replaces the earlier entry.
    pub fn insert(&mut self, entry: StoredSnapshot) {
        if let Some(existing) = self
            .entries
            .iter_mut()
            .flatten()
            .find(|e| e.export_id == entry.export_id)
        {
            *existing = entry;
            self.total_stored += 1;
            return;
        }
        self.entries[self.head] = Some(entry);
        self.head = (self.head + 1) % self.capacity();
        if self.len < self.capacity() {
            self.len += 1;
        }
        self.total_stored += 1;
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn total_stored(&self) -> u64 {
        self.total_stored
    }

    pub fn get(&self, export_id: ExportId) -> Option<&StoredSnapshot> {
        self.entries.iter().flatten().find(|e| e.export_id == export_id)
    }

    /// Entries from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &StoredSnapshot> {
        let start = if self.len < self.capacity() { 0 } else { self.head };
        (0..self.len).filter_map(move |i| self.entries[(start + i) % self.capacity()].as_ref())
    }

    pub fn latest(&self) -> Option<&StoredSnapshot> {
        self.iter().last()
    }
}
