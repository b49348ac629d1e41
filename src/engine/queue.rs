// src/engine/queue.rs

//! Internal queue of units waiting for a free slot.

use std::time::{Duration, Instant};

use crate::types::UnitId;

#[derive(Debug, Clone)]
struct QueuedUnit {
    id: UnitId,
    seq: u64,
    enqueued_at: Instant,
}

/// Units awaiting launch, deduplicated by id.
///
/// Each entry carries an arrival sequence number; the core orders launch
/// candidates by (layer, sequence).
#[derive(Debug, Clone, Default)]
pub struct UnitQueue {
    entries: Vec<QueuedUnit>,
    next_seq: u64,
}

impl UnitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `id`. Returns `false` if it was already queued.
    pub fn push(&mut self, id: UnitId) -> bool {
        if self.contains(&id) {
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.push(QueuedUnit {
            id,
            seq,
            enqueued_at: Instant::now(),
        });
        true
    }

    /// Remove `id`, returning how long it waited.
    pub fn remove(&mut self, id: &str) -> Option<Duration> {
        let idx = self.entries.iter().position(|e| e.id == id)?;
        let entry = self.entries.remove(idx);
        Some(entry.enqueued_at.elapsed())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.iter().any(|e| e.id == id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `(id, arrival sequence)` pairs in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.entries.iter().map(|e| (e.id.as_str(), e.seq))
    }

    /// Ids in arrival order.
    pub fn ids(&self) -> Vec<UnitId> {
        self.entries.iter().map(|e| e.id.clone()).collect()
    }
}
