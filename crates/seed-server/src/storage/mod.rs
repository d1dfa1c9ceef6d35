//! Persistence gateway for chat messages.
//!
//! Trait-based abstraction over an append-only, per-stream ordered log. The
//! trait is synchronous; the async engine calls it from the blocking pool.
//!
//! Logically every backend is one table keyed by the unique pair
//! `(stream_key, sequence)` with the columns of [`Message`]. The access paths
//! are "max sequence for a stream", "append", "ascending range from a
//! sequence" and "descending page ending at a sequence".

mod chaotic;
mod error;
mod memory;
mod redb;

pub use chaotic::ChaoticStorage;
pub use error::StorageError;
pub use memory::MemoryStorage;
use seed_proto::{Message, StreamKey};

pub use self::redb::RedbStorage;

/// Storage abstraction for ordered per-stream message logs.
///
/// Must be Clone (shared by every stream worker), Send + Sync, and
/// synchronous. Implementations share internal state via Arc, so clones access
/// the same underlying storage.
pub trait Storage: Clone + Send + Sync + 'static {
    /// Highest persisted sequence for a stream. `None` if nothing is stored.
    fn last_sequence(&self, key: &StreamKey) -> Result<Option<u64>, StorageError>;

    /// Append a message to its stream's log.
    ///
    /// # Invariants
    ///
    /// - Pre: `message.sequence == last_sequence + 1` (or `0` for an empty
    ///   stream), otherwise [`StorageError::SequenceConflict`] and no write.
    /// - Post: the message is durable at `message.sequence`.
    /// - The check and the append are atomic with respect to other callers.
    fn insert(&self, message: &Message) -> Result<(), StorageError>;

    /// Up to `max_count` messages with `sequence >= from`, ascending.
    fn fetch_range(
        &self,
        key: &StreamKey,
        from: u64,
        max_count: usize,
    ) -> Result<Vec<Message>, StorageError>;

    /// Up to `max_count` messages with `sequence <= up_to`, descending.
    ///
    /// `None` starts from the newest message.
    fn fetch_history(
        &self,
        key: &StreamKey,
        up_to: Option<u64>,
        max_count: usize,
    ) -> Result<Vec<Message>, StorageError>;
}

/// Run a storage operation on the blocking pool.
///
/// A panicked or cancelled task surfaces as [`StorageError::Io`].
pub(crate) async fn blocking<S, T, F>(storage: &S, op: F) -> Result<T, StorageError>
where
    S: Storage,
    T: Send + 'static,
    F: FnOnce(&S) -> Result<T, StorageError> + Send + 'static,
{
    let storage = storage.clone();

    tokio::task::spawn_blocking(move || op(&storage))
        .await
        .map_err(|e| StorageError::Io(format!("storage task failed: {e}")))?
}

/// Validate that `got` directly follows `last`.
pub(crate) fn check_next_sequence(last: Option<u64>, got: u64) -> Result<(), StorageError> {
    let expected = last.map_or(0, |last| last + 1);
    if got != expected {
        return Err(StorageError::SequenceConflict { expected, got });
    }
    Ok(())
}
