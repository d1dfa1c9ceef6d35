use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use seed_proto::{Message, StreamKey};

use super::{Storage, StorageError, check_next_sequence};

/// In-memory storage for tests and for running without a database file.
///
/// Each stream is a `Vec` indexed by sequence, which is valid because
/// persisted sequences are gap-free from 0. All state sits behind one
/// `Arc<Mutex<_>>`, so the sequence check and the append in
/// [`Storage::insert`] are atomic. `insert` and `last_sequence` are O(1);
/// fetches are O(`max_count`).
#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<HashMap<StreamKey, Vec<Message>>>>,
}

impl MemoryStorage {
    /// Create a new empty `MemoryStorage`
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of streams with at least one message.
    pub fn stream_count(&self) -> usize {
        self.lock().values().filter(|log| !log.is_empty()).count()
    }

    /// Total number of messages across all streams.
    pub fn message_count(&self) -> usize {
        self.lock().values().map(Vec::len).sum()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<StreamKey, Vec<Message>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Storage for MemoryStorage {
    fn last_sequence(&self, key: &StreamKey) -> Result<Option<u64>, StorageError> {
        Ok(self.lock().get(key).and_then(|log| log.len().checked_sub(1)).map(|last| last as u64))
    }

    fn insert(&self, message: &Message) -> Result<(), StorageError> {
        let mut streams = self.lock();
        let log = streams.entry(message.stream_key).or_default();

        let last = log.len().checked_sub(1).map(|last| last as u64);
        check_next_sequence(last, message.sequence)?;

        // Bytes clone is a refcount bump
        log.push(message.clone());

        debug_assert_eq!(log.len() as u64 - 1, message.sequence);
        Ok(())
    }

    fn fetch_range(
        &self,
        key: &StreamKey,
        from: u64,
        max_count: usize,
    ) -> Result<Vec<Message>, StorageError> {
        let streams = self.lock();
        let Some(log) = streams.get(key) else {
            return Ok(Vec::new());
        };

        let start = usize::try_from(from).unwrap_or(usize::MAX);
        if start >= log.len() {
            return Ok(Vec::new());
        }
        let end = start.saturating_add(max_count).min(log.len());

        Ok(log[start..end].to_vec())
    }

    fn fetch_history(
        &self,
        key: &StreamKey,
        up_to: Option<u64>,
        max_count: usize,
    ) -> Result<Vec<Message>, StorageError> {
        let streams = self.lock();
        let Some(log) = streams.get(key) else {
            return Ok(Vec::new());
        };

        // Exclusive end of the window
        let end = up_to
            .and_then(|up_to| usize::try_from(up_to).ok())
            .map_or(log.len(), |up_to| up_to.saturating_add(1).min(log.len()));

        Ok(log[..end].iter().rev().take(max_count).cloned().collect())
    }
}
