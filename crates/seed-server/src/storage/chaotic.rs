//! Chaotic storage wrapper for fault injection testing
//!
//! Delegates to an underlying backend but fails a configurable fraction of
//! operations with [`StorageError::Io`]. Used to check that storage faults
//! surface as failed publishes without corrupting the log.

use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicUsize, Ordering},
};

use seed_proto::{Message, StreamKey};

use super::{Storage, StorageError};

/// Storage wrapper that randomly injects failures.
///
/// Failures are decided before the inner call, so a failed `insert` never
/// writes. The RNG is shared between clones, which keeps the failure pattern
/// deterministic for a given seed and call order.
#[derive(Clone)]
pub struct ChaoticStorage<S: Storage> {
    inner: S,
    /// Failure rate (0.0 = never fail, 1.0 = always fail)
    failure_rate: f64,
    rng: Arc<Mutex<ChaoticRng>>,
    operation_count: Arc<AtomicUsize>,
}

/// Linear congruential generator, reproducible from its seed.
struct ChaoticRng {
    state: u64,
}

impl ChaoticRng {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    /// Next value in [0.0, 1.0)
    fn next(&mut self) -> f64 {
        // Numerical Recipes constants
        const A: u64 = 1_664_525;
        const C: u64 = 1_013_904_223;
        const M: u64 = 1u64 << 32;

        self.state = (A.wrapping_mul(self.state).wrapping_add(C)) % M;
        (self.state as f64) / (M as f64)
    }
}

impl<S: Storage> ChaoticStorage<S> {
    /// Wrap `inner` with a fixed default seed.
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn new(inner: S, failure_rate: f64) -> Self {
        Self::with_seed(inner, failure_rate, 0x1234_5678_9ABC_DEF0)
    }

    /// Wrap `inner` with an explicit seed for reproducible chaos.
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn with_seed(inner: S, failure_rate: f64, seed: u64) -> Self {
        assert!(
            (0.0..=1.0).contains(&failure_rate),
            "failure_rate must be between 0.0 and 1.0, got {failure_rate}"
        );

        Self {
            inner,
            failure_rate,
            rng: Arc::new(Mutex::new(ChaoticRng::new(seed))),
            operation_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Underlying storage (for checking invariants after chaos).
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Total number of storage operations attempted, failed or not.
    pub fn operation_count(&self) -> usize {
        self.operation_count.load(Ordering::Relaxed)
    }

    fn inject(&self) -> Result<(), StorageError> {
        self.operation_count.fetch_add(1, Ordering::Relaxed);

        let roll = self.rng.lock().unwrap_or_else(PoisonError::into_inner).next();
        if roll < self.failure_rate {
            return Err(StorageError::Io("chaotic failure injection".to_string()));
        }
        Ok(())
    }
}

impl<S: Storage> Storage for ChaoticStorage<S> {
    fn last_sequence(&self, key: &StreamKey) -> Result<Option<u64>, StorageError> {
        self.inject()?;
        self.inner.last_sequence(key)
    }

    fn insert(&self, message: &Message) -> Result<(), StorageError> {
        self.inject()?;
        self.inner.insert(message)
    }

    fn fetch_range(
        &self,
        key: &StreamKey,
        from: u64,
        max_count: usize,
    ) -> Result<Vec<Message>, StorageError> {
        self.inject()?;
        self.inner.fetch_range(key, from, max_count)
    }

    fn fetch_history(
        &self,
        key: &StreamKey,
        up_to: Option<u64>,
        max_count: usize,
    ) -> Result<Vec<Message>, StorageError> {
        self.inject()?;
        self.inner.fetch_history(key, up_to, max_count)
    }
}
