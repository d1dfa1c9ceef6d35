//! Redb-backed durable storage implementation.
//!
//! Uses Redb's ACID transactions with Copy-on-Write for crash safety.
//! All messages survive server restarts.

use std::{path::Path, sync::Arc};

use bytes::Bytes;
use redb::{Database, ReadableTable, TableDefinition};
use seed_proto::{CONTENT_IV_LEN, Message, SIGNATURE_LEN, STREAM_KEY_LEN, StreamKey};

use super::{Storage, StorageError, check_next_sequence};

/// Table: messages
/// Key: (stream_key: 32 bytes, sequence: u64 BE) [40 bytes]
/// Value: signature (32) + content IV (12) + content
const MESSAGES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("messages");

const KEY_LEN: usize = STREAM_KEY_LEN + 8;
const HEADER_LEN: usize = SIGNATURE_LEN + CONTENT_IV_LEN;

/// Durable storage backed by Redb.
///
/// Thread-safe through Redb's internal locking. Write transactions are
/// serialized by Redb, which makes the sequence check in `insert` atomic with
/// the append. Clone is cheap (Arc).
#[derive(Clone)]
pub struct RedbStorage {
    db: Arc<Database>,
}

impl RedbStorage {
    /// Open or create a Redb database at the given path.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the database cannot be opened or created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let db = Database::create(path.as_ref()).map_err(io)?;

        let txn = db.begin_write().map_err(io)?;
        {
            let _ = txn.open_table(MESSAGES).map_err(io)?;
        }
        txn.commit().map_err(io)?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Highest sequence for a stream, read from the last key in its range.
    fn compute_last_sequence<T: ReadableTable<&'static [u8], &'static [u8]>>(
        table: &T,
        key: &StreamKey,
    ) -> Result<Option<u64>, StorageError> {
        let start = encode_message_key(key, 0);
        let end = encode_message_key(key, u64::MAX);

        let mut range = table.range(start.as_slice()..=end.as_slice()).map_err(io)?;

        match range.next_back() {
            Some(entry) => {
                let (stored_key, _) = entry.map_err(io)?;
                Ok(Some(decode_sequence(stored_key.value())?))
            },
            None => Ok(None),
        }
    }
}

impl Storage for RedbStorage {
    fn last_sequence(&self, key: &StreamKey) -> Result<Option<u64>, StorageError> {
        let txn = self.db.begin_read().map_err(io)?;
        let table = txn.open_table(MESSAGES).map_err(io)?;

        Self::compute_last_sequence(&table, key)
    }

    fn insert(&self, message: &Message) -> Result<(), StorageError> {
        let txn = self.db.begin_write().map_err(io)?;

        {
            let mut table = txn.open_table(MESSAGES).map_err(io)?;

            let last = Self::compute_last_sequence(&table, &message.stream_key)?;
            check_next_sequence(last, message.sequence)?;

            let key = encode_message_key(&message.stream_key, message.sequence);
            let value = encode_message_value(message);
            table.insert(key.as_slice(), value.as_slice()).map_err(io)?;
        }

        txn.commit().map_err(io)?;

        Ok(())
    }

    fn fetch_range(
        &self,
        key: &StreamKey,
        from: u64,
        max_count: usize,
    ) -> Result<Vec<Message>, StorageError> {
        let txn = self.db.begin_read().map_err(io)?;
        let table = txn.open_table(MESSAGES).map_err(io)?;

        let start = encode_message_key(key, from);
        let end = encode_message_key(key, u64::MAX);

        let results = table.range(start.as_slice()..=end.as_slice()).map_err(io)?;

        let mut messages = Vec::with_capacity(max_count.min(128));
        for result in results.take(max_count) {
            let (stored_key, value) = result.map_err(io)?;
            let sequence = decode_sequence(stored_key.value())?;
            messages.push(decode_message_value(*key, sequence, value.value())?);
        }

        Ok(messages)
    }

    fn fetch_history(
        &self,
        key: &StreamKey,
        up_to: Option<u64>,
        max_count: usize,
    ) -> Result<Vec<Message>, StorageError> {
        let txn = self.db.begin_read().map_err(io)?;
        let table = txn.open_table(MESSAGES).map_err(io)?;

        let start = encode_message_key(key, 0);
        let end = encode_message_key(key, up_to.unwrap_or(u64::MAX));

        let results = table.range(start.as_slice()..=end.as_slice()).map_err(io)?;

        let mut messages = Vec::with_capacity(max_count.min(128));
        for result in results.rev().take(max_count) {
            let (stored_key, value) = result.map_err(io)?;
            let sequence = decode_sequence(stored_key.value())?;
            messages.push(decode_message_value(*key, sequence, value.value())?);
        }

        Ok(messages)
    }
}

fn io(err: impl std::fmt::Display) -> StorageError {
    StorageError::Io(err.to_string())
}

/// Encode (stream_key, sequence) as a 40-byte key.
///
/// Layout: [stream_key: 32 bytes][sequence: 8 bytes BE]
/// Lexicographic ordering groups a stream's messages and orders them by
/// sequence.
fn encode_message_key(key: &StreamKey, sequence: u64) -> [u8; KEY_LEN] {
    let mut encoded = [0u8; KEY_LEN];
    encoded[..STREAM_KEY_LEN].copy_from_slice(key.as_bytes());
    encoded[STREAM_KEY_LEN..].copy_from_slice(&sequence.to_be_bytes());
    encoded
}

/// Sequence component of a stored key.
fn decode_sequence(stored: &[u8]) -> Result<u64, StorageError> {
    stored
        .get(STREAM_KEY_LEN..)
        .and_then(|tail| <[u8; 8]>::try_from(tail).ok())
        .map(u64::from_be_bytes)
        .ok_or_else(|| {
            StorageError::Serialization(format!("message key has length {}", stored.len()))
        })
}

fn encode_message_value(message: &Message) -> Vec<u8> {
    let mut value = Vec::with_capacity(HEADER_LEN + message.content.len());
    value.extend_from_slice(&message.signature);
    value.extend_from_slice(&message.content_iv);
    value.extend_from_slice(&message.content);
    value
}

fn decode_message_value(
    stream_key: StreamKey,
    sequence: u64,
    value: &[u8],
) -> Result<Message, StorageError> {
    if value.len() < HEADER_LEN {
        return Err(StorageError::Serialization(format!(
            "message value too short: {} bytes",
            value.len()
        )));
    }

    let (signature, rest) = value.split_at(SIGNATURE_LEN);
    let (content_iv, content) = rest.split_at(CONTENT_IV_LEN);

    let signature = <[u8; SIGNATURE_LEN]>::try_from(signature)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    let content_iv = <[u8; CONTENT_IV_LEN]>::try_from(content_iv)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;

    Ok(Message {
        sequence,
        stream_key,
        signature,
        content: Bytes::copy_from_slice(content),
        content_iv,
    })
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn key(byte: u8) -> StreamKey {
        StreamKey::from_bytes([byte; STREAM_KEY_LEN])
    }

    fn message(stream: u8, sequence: u64, content: &[u8]) -> Message {
        Message {
            sequence,
            stream_key: key(stream),
            signature: [7u8; SIGNATURE_LEN],
            content: Bytes::copy_from_slice(content),
            content_iv: [9u8; CONTENT_IV_LEN],
        }
    }

    #[test]
    fn message_key_orders_by_sequence() {
        let low = encode_message_key(&key(1), 1);
        let high = encode_message_key(&key(1), 256);
        assert!(low < high);
        assert_eq!(decode_sequence(&high).unwrap(), 256);

        let other_stream = encode_message_key(&key(2), 0);
        assert!(high < other_stream);
    }

    #[test]
    fn short_value_is_serialization_error() {
        let err = decode_message_value(key(1), 0, &[0u8; 10]).unwrap_err();
        assert!(matches!(err, StorageError::Serialization(_)));
    }

    #[test]
    fn insert_sequential() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();

        for i in 0..3 {
            storage.insert(&message(1, i, &[i as u8; 16])).unwrap();
        }

        assert_eq!(storage.last_sequence(&key(1)).unwrap(), Some(2));
        assert_eq!(storage.last_sequence(&key(2)).unwrap(), None);
    }

    #[test]
    fn insert_conflict_leaves_log_unchanged() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();

        for i in 0..5 {
            storage.insert(&message(1, i, b"x")).unwrap();
        }

        match storage.insert(&message(1, 7, b"late")) {
            Err(StorageError::SequenceConflict { expected: 5, got: 7 }) => {},
            other => panic!("Expected SequenceConflict, got: {other:?}"),
        }

        assert_eq!(storage.last_sequence(&key(1)).unwrap(), Some(4));
        assert_eq!(storage.fetch_range(&key(1), 0, 100).unwrap().len(), 5);
    }

    #[test]
    fn fetch_range_pagination() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();

        for i in 0..20 {
            storage.insert(&message(1, i, &[i as u8; 4])).unwrap();
        }
        storage.insert(&message(2, 0, b"other")).unwrap();

        let batch1 = storage.fetch_range(&key(1), 0, 10).unwrap();
        assert_eq!(batch1.len(), 10);
        assert_eq!(batch1[0].sequence, 0);
        assert_eq!(batch1[9].sequence, 9);

        let batch2 = storage.fetch_range(&key(1), 10, 100).unwrap();
        assert_eq!(batch2.len(), 10);
        assert_eq!(batch2[9].sequence, 19);

        assert!(storage.fetch_range(&key(1), 20, 10).unwrap().is_empty());
    }

    #[test]
    fn fetch_history_descending() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();

        for i in 0..10 {
            storage.insert(&message(1, i, b"m")).unwrap();
        }
        storage.insert(&message(2, 0, b"other")).unwrap();

        let latest = storage.fetch_history(&key(1), None, 3).unwrap();
        assert_eq!(latest.iter().map(|m| m.sequence).collect::<Vec<_>>(), vec![9, 8, 7]);

        let older = storage.fetch_history(&key(1), Some(2), 10).unwrap();
        assert_eq!(older.iter().map(|m| m.sequence).collect::<Vec<_>>(), vec![2, 1, 0]);
        assert!(older.iter().all(|m| m.stream_key == key(1)));
    }

    #[test]
    fn message_roundtrip() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();

        let original = message(1, 0, b"hello world");
        storage.insert(&original).unwrap();

        let loaded = storage.fetch_range(&key(1), 0, 10).unwrap();
        assert_eq!(loaded, vec![original]);
    }

    #[test]
    fn empty_content_roundtrip() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();

        storage.insert(&message(1, 0, b"")).unwrap();
        let loaded = storage.fetch_range(&key(1), 0, 1).unwrap();
        assert!(loaded[0].content.is_empty());
    }

    #[test]
    fn survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.redb");

        {
            let storage = RedbStorage::open(&path).unwrap();
            storage.insert(&message(1, 0, b"a")).unwrap();
            storage.insert(&message(1, 1, b"b")).unwrap();
        }

        let storage = RedbStorage::open(&path).unwrap();
        assert_eq!(storage.last_sequence(&key(1)).unwrap(), Some(1));
        assert!(storage.insert(&message(1, 1, b"again")).unwrap_err().is_conflict());
        storage.insert(&message(1, 2, b"c")).unwrap();
    }
}
