//! LRU cache of parsed chunks, governed by the memory tracker.

use std::collections::HashMap;
use std::sync::Arc;

use crate::chunk::{Chunk, Vector};
use crate::error::MemoryError;
use crate::memory::{MemoryTracker, TaskId};

/// The byte accounting a cache applies to a chunk before insertion: typed
/// buffers plus string index arrays, with the shared byte backing store
/// counted once.
pub fn estimate_size(columns: &[Vector], buffer_len: usize) -> usize {
    crate::chunk::estimate_size(columns, buffer_len)
}

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Byte budget of this cache. Eviction keeps `memory_used` at or below it.
    pub max_memory_bytes: usize,
    /// Rows per chunk, used by callers to derive chunk indices.
    pub chunk_size: usize,
}

/// A chunk cache keyed by chunk index with least-recently-used eviction.
///
/// Invariant: after any operation, `memory_used` equals the sum of the
/// cached chunks' `size_bytes`.
#[derive(Debug)]
pub struct ChunkCache {
    chunks: HashMap<usize, Chunk>,
    /// Recency order, least-recent first.
    recency: Vec<usize>,
    memory_used: usize,
    max_memory_bytes: usize,
    tracker: Arc<MemoryTracker>,
    task: TaskId,
}

impl ChunkCache {
    /// A cache registered as `task` with `tracker`.
    pub fn new(options: &CacheOptions, tracker: Arc<MemoryTracker>, task: TaskId) -> Self {
        Self {
            chunks: HashMap::new(),
            recency: vec![],
            memory_used: 0,
            max_memory_bytes: options.max_memory_bytes,
            tracker,
            task,
        }
    }

    /// Returns the chunk if cached and marks it most-recently-used.
    pub fn get(&mut self, index: usize) -> Option<&Chunk> {
        if !self.chunks.contains_key(&index) {
            return None;
        }
        self.touch(index);
        self.chunks.get(&index)
    }

    /// Returns the chunk without promoting it.
    pub fn peek(&self, index: usize) -> Option<&Chunk> {
        self.chunks.get(&index)
    }

    /// Inserts a chunk, evicting least-recent entries until it fits.
    ///
    /// Re-inserting an index first retires the old entry's size. A chunk
    /// larger than the whole budget is still inserted (the cache then holds
    /// only that chunk); the memory tracker saw the reservation up front.
    pub fn set(&mut self, index: usize, chunk: Chunk) {
        if let Some(old) = self.chunks.remove(&index) {
            self.memory_used -= old.size_bytes();
            self.recency.retain(|i| *i != index);
        }
        let incoming = chunk.size_bytes();
        while !self.recency.is_empty() && self.memory_used + incoming > self.max_memory_bytes {
            let victim = self.recency.remove(0);
            if let Some(evicted) = self.chunks.remove(&victim) {
                self.memory_used -= evicted.size_bytes();
                tracing::debug!(chunk = victim, bytes = evicted.size_bytes(), "evicted chunk");
            }
        }
        self.memory_used += incoming;
        self.chunks.insert(index, chunk);
        self.recency.push(index);
        self.tracker.update_usage(self.task, self.memory_used);
    }

    fn touch(&mut self, index: usize) {
        self.recency.retain(|i| *i != index);
        self.recency.push(index);
    }

    /// Discards every entry and reports zero usage to the tracker.
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.recency.clear();
        self.memory_used = 0;
        self.tracker.update_usage(self.task, 0);
    }

    /// Clears the cache and releases the task's reservation.
    pub fn destroy(mut self) {
        self.clear();
        self.tracker.release_allocation(self.task);
    }

    /// Forwards an allocation request to the tracker, surfacing denial as a
    /// [`MemoryError`] value.
    pub fn check_allocation(&self, bytes: usize) -> std::result::Result<usize, MemoryError> {
        let outcome = self.tracker.request_allocation(self.task, bytes);
        match outcome.error {
            Some(error) => Err(error),
            None => Ok(outcome.allocated_bytes),
        }
    }

    pub fn memory_used(&self) -> usize {
        self.memory_used
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Cached chunk indices, least-recent first.
    pub fn recency(&self) -> &[usize] {
        &self.recency
    }
}

impl Drop for ChunkCache {
    fn drop(&mut self) {
        self.tracker.release_allocation(self.task);
    }
}
