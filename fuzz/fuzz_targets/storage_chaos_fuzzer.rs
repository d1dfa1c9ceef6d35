//! Fuzz target for the message log under storage failures
//!
//! Drives inserts and reads against `ChaoticStorage` wrapping
//! `MemoryStorage`, with arbitrary nonces and failure rates.
//!
//! # Invariants
//!
//! - Storage NEVER panics on injected errors
//! - An insert succeeds only for the next expected nonce
//! - A failed insert never writes
//! - Whatever IS in storage forms the gap-free range `0..=last`

#![no_main]

use arbitrary::Arbitrary;
use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use seed_proto::{Message, StreamKey};
use seed_server::storage::{ChaoticStorage, MemoryStorage, Storage, StorageError};

#[derive(Debug, Clone, Arbitrary)]
struct ChaosScenario {
    /// Seed for ChaoticStorage RNG (deterministic failures)
    chaos_seed: u64,
    /// Failure rate 0-9 maps to 0%-90%
    failure_rate_tenth: u8,
    /// Sequence of operations to perform
    operations: Vec<ChaosOperation>,
}

#[derive(Debug, Clone, Arbitrary)]
enum ChaosOperation {
    /// Insert the nonce the stream expects next
    InsertNext { stream: u8 },
    /// Insert an arbitrary nonce
    InsertAt { stream: u8, nonce: u64 },
    /// Ascending read
    FetchRange { stream: u8, from: u64, limit: u8 },
    /// Descending read
    FetchHistory { stream: u8, up_to: Option<u64>, limit: u8 },
}

fn key(stream: u8) -> StreamKey {
    StreamKey::from_bytes([stream % 4; 32])
}

fn message(stream: u8, nonce: u64) -> Message {
    Message {
        sequence: nonce,
        stream_key: key(stream),
        signature: [stream; 32],
        content: Bytes::copy_from_slice(&nonce.to_be_bytes()),
        content_iv: [0u8; 12],
    }
}

fuzz_target!(|scenario: ChaosScenario| {
    let failure_rate = (scenario.failure_rate_tenth % 10) as f64 / 10.0;
    let storage = ChaoticStorage::with_seed(MemoryStorage::new(), failure_rate, scenario.chaos_seed);

    for op in scenario.operations {
        match op {
            ChaosOperation::InsertNext { stream } => {
                let next = storage.inner().last_sequence(&key(stream)).ok().flatten().map_or(0, |l| l + 1);
                let _ = storage.insert(&message(stream, next));
            },
            ChaosOperation::InsertAt { stream, nonce } => {
                let before = storage.inner().last_sequence(&key(stream)).ok().flatten();
                let expected = before.map_or(0, |l| l + 1);

                match storage.insert(&message(stream, nonce)) {
                    Ok(()) => assert_eq!(nonce, expected, "insert accepted a wrong nonce"),
                    Err(StorageError::SequenceConflict { expected: e, got }) => {
                        assert_eq!(e, expected);
                        assert_eq!(got, nonce);
                    },
                    Err(_) => {},
                }

                if nonce != expected {
                    let after = storage.inner().last_sequence(&key(stream)).ok().flatten();
                    assert_eq!(before, after, "rejected insert changed the log");
                }
            },
            ChaosOperation::FetchRange { stream, from, limit } => {
                if let Ok(page) = storage.fetch_range(&key(stream), from, limit as usize) {
                    assert!(page.len() <= limit as usize);
                    assert!(page.windows(2).all(|w| w[0].sequence + 1 == w[1].sequence));
                    assert!(page.first().is_none_or(|m| m.sequence >= from));
                }
            },
            ChaosOperation::FetchHistory { stream, up_to, limit } => {
                if let Ok(page) = storage.fetch_history(&key(stream), up_to, limit as usize) {
                    assert!(page.len() <= limit as usize);
                    assert!(page.windows(2).all(|w| w[0].sequence == w[1].sequence + 1));
                    if let Some(up_to) = up_to {
                        assert!(page.first().is_none_or(|m| m.sequence <= up_to));
                    }
                }
            },
        }
    }

    // INVARIANT: every stream holds exactly 0..=last
    for stream in 0..4u8 {
        if let Ok(Some(last)) = storage.inner().last_sequence(&key(stream)) {
            let all = storage.inner().fetch_range(&key(stream), 0, usize::MAX).unwrap_or_default();
            assert_eq!(all.len() as u64, last + 1);
            for (i, m) in all.iter().enumerate() {
                assert_eq!(m.sequence, i as u64, "gap in stream {stream}");
            }
        }
    }
});
