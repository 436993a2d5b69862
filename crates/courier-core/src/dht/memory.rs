//! In-process DHT
//!
//! Shared by every node in a test or simulation. Honors slot replacement,
//! first-writer-wins permanent values and TTL expiry against an injected
//! clock. A node can be switched offline to exercise failure paths.
//!
//! Permanent values must be [`SignedRecord`]s that verify under their key.
//! First-writer-wins is scoped to the signer, so another identity writing
//! the same `(key, tag)` first cannot block the rightful owner.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use super::{Dht, DhtKey, SignedRecord, MAX_VALUE_SIZE};
use crate::clock::SharedClock;
use crate::error::{CourierError, CourierResult};
use crate::identity::{DilithiumVerifier, Fingerprint, Verifier};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Slot {
    Replaceable(u64),
    Permanent { tag: String, signer: Fingerprint },
}

#[derive(Debug, Clone)]
struct StoredValue {
    slot: Slot,
    value: Vec<u8>,
    /// Unix seconds; `None` never expires
    expires_at: Option<u64>,
}

/// Thread-safe in-memory [`Dht`].
pub struct MemoryDht {
    clock: SharedClock,
    verifier: Arc<dyn Verifier>,
    values: Mutex<HashMap<DhtKey, Vec<StoredValue>>>,
    online: AtomicBool,
    failing_keys: Mutex<HashSet<DhtKey>>,
    puts: AtomicU64,
    gets: AtomicU64,
}

impl MemoryDht {
    /// Create an empty, online DHT.
    pub fn new(clock: SharedClock) -> Self {
        Self::with_verifier(clock, Arc::new(DilithiumVerifier))
    }

    /// As [`MemoryDht::new`], checking permanent values with `verifier`.
    pub fn with_verifier(clock: SharedClock, verifier: Arc<dyn Verifier>) -> Self {
        Self {
            clock,
            verifier,
            values: Mutex::new(HashMap::new()),
            online: AtomicBool::new(true),
            failing_keys: Mutex::new(HashSet::new()),
            puts: AtomicU64::new(0),
            gets: AtomicU64::new(0),
        }
    }

    /// Toggle reachability. While offline every operation fails with a
    /// network error and [`Dht::is_ready`] reports false.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Make reads of a single key fail with a network error.
    pub fn fail_key(&self, key: DhtKey) {
        self.failing_keys.lock().insert(key);
    }

    /// Undo [`MemoryDht::fail_key`].
    pub fn heal_key(&self, key: &DhtKey) {
        self.failing_keys.lock().remove(key);
    }

    /// Number of put operations served
    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::Relaxed)
    }

    /// Number of get operations served
    pub fn get_count(&self) -> u64 {
        self.gets.load(Ordering::Relaxed)
    }

    /// Number of live values under `key`
    pub fn value_count(&self, key: &DhtKey) -> usize {
        let now = self.clock.now_secs();
        self.values
            .lock()
            .get(key)
            .map(|stored| stored.iter().filter(|v| is_live(v, now)).count())
            .unwrap_or(0)
    }

    fn check_online(&self) -> CourierResult<()> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CourierError::Network("DHT node is offline".to_string()))
        }
    }

    fn check_size(value: &[u8]) -> CourierResult<()> {
        if value.len() > MAX_VALUE_SIZE {
            return Err(CourierError::Param(format!(
                "value of {} bytes exceeds DHT limit of {}",
                value.len(),
                MAX_VALUE_SIZE
            )));
        }
        Ok(())
    }
}

fn is_live(value: &StoredValue, now: u64) -> bool {
    value.expires_at.map_or(true, |at| now < at)
}

#[async_trait]
impl Dht for MemoryDht {
    async fn put(
        &self,
        key: &DhtKey,
        value: Vec<u8>,
        ttl: Duration,
        slot: u64,
    ) -> CourierResult<()> {
        self.check_online()?;
        Self::check_size(&value)?;
        self.puts.fetch_add(1, Ordering::Relaxed);

        let now = self.clock.now_secs();
        let expires_at = now.saturating_add(ttl.as_secs());
        let mut values = self.values.lock();
        let stored = values.entry(*key).or_default();
        stored.retain(|v| is_live(v, now) && v.slot != Slot::Replaceable(slot));
        stored.push(StoredValue {
            slot: Slot::Replaceable(slot),
            value,
            expires_at: Some(expires_at),
        });
        trace!(?key, slot, "Stored replaceable value");
        Ok(())
    }

    async fn put_permanent(&self, key: &DhtKey, value: Vec<u8>, tag: &str) -> CourierResult<()> {
        self.check_online()?;
        Self::check_size(&value)?;
        let signer = SignedRecord::decode(&value)?.open(key, self.verifier.as_ref())?;
        self.puts.fetch_add(1, Ordering::Relaxed);

        let slot = Slot::Permanent {
            tag: tag.to_string(),
            signer,
        };
        let mut values = self.values.lock();
        let stored = values.entry(*key).or_default();
        if stored.iter().any(|v| v.slot == slot) {
            trace!(?key, tag, signer = %signer.short(), "Permanent value already present, ignoring write");
            return Ok(());
        }
        stored.push(StoredValue {
            slot,
            value,
            expires_at: None,
        });
        Ok(())
    }

    async fn get(&self, key: &DhtKey) -> CourierResult<Vec<Vec<u8>>> {
        self.check_online()?;
        if self.failing_keys.lock().contains(key) {
            return Err(CourierError::Network(format!("lookup of {:?} failed", key)));
        }
        self.gets.fetch_add(1, Ordering::Relaxed);

        let now = self.clock.now_secs();
        let mut values = self.values.lock();
        let Some(stored) = values.get_mut(key) else {
            return Ok(Vec::new());
        };
        stored.retain(|v| is_live(v, now));
        Ok(stored.iter().map(|v| v.value.clone()).collect())
    }

    fn is_ready(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}
