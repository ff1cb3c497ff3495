//! Two cache tiers in front of the message store.
//!
//! The local tier lives inside one process and keeps a value for a few
//! minutes. The shared tier is visible to every process of the farm and
//! keeps a value for days. A miss in the local tier is filled from the shared
//! tier; a miss in the shared tier is filled by the loader under a
//! short-lived lock so that only one process rebuilds a given key at a time.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(10);

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }
}

impl ManualClock {
    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock()
    }
}

struct LocalEntry<T> {
    expires_at: Instant,
    value: Arc<T>,
}

/// Process-local tier.
pub struct LocalCache<T> {
    entries: Mutex<HashMap<String, LocalEntry<T>>>,
    clock: Arc<dyn Clock>,
}

impl<T> LocalCache<T> {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<T>> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.expires_at > now => Some(Arc::clone(&entry.value)),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn set(&self, key: &str, value: Arc<T>, ttl: Duration) {
        let expires_at = self.clock.now() + ttl;
        self.entries
            .lock()
            .insert(key.to_string(), LocalEntry { expires_at, value });
    }

    pub fn delete(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    /// Cache-aside read. The lock is not held while `loader` runs.
    pub fn get_or_load<F>(&self, key: &str, ttl: Duration, loader: F) -> Result<Arc<T>>
    where
        F: FnOnce() -> Result<T>,
    {
        if let Some(value) = self.get(key) {
            debug!(key, "local cache hit");
            return Ok(value);
        }
        debug!(key, "local cache miss");
        let value = Arc::new(loader()?);
        self.set(key, Arc::clone(&value), ttl);
        Ok(value)
    }
}

/// Value read from the shared tier. `expired` entries are past their TTL
/// but still inside the stale grace period.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedEntry {
    pub payload: String,
    pub expired: bool,
}

/// Fleet-wide key-value tier.
pub trait SharedCache: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<SharedEntry>>;
    fn set(&self, key: &str, payload: &str, ttl: Duration) -> Result<()>;
    /// Remove the key outright, stale copy included.
    fn delete(&self, key: &str) -> Result<()>;
    /// Take the named lock for `owner` unless another holder's lock is
    /// still live.
    fn try_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool>;
    /// Release the lock only while `owner` still holds it.
    fn unlock(&self, key: &str, owner: &str) -> Result<()>;
}

struct MemoryEntry {
    payload: String,
    expires_at: Instant,
}

struct MemoryLock {
    owner: String,
    expires_at: Instant,
}

/// In-process shared tier, for tests and single-process deployments.
pub struct MemorySharedCache {
    entries: Mutex<HashMap<String, MemoryEntry>>,
    locks: Mutex<HashMap<String, MemoryLock>>,
    stale_grace: Duration,
    clock: Arc<dyn Clock>,
}

impl MemorySharedCache {
    pub fn new(stale_grace: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            stale_grace,
            clock,
        }
    }
}

impl SharedCache for MemorySharedCache {
    fn get(&self, key: &str) -> Result<Option<SharedEntry>> {
        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get(key) else {
            return Ok(None);
        };
        if entry.expires_at + self.stale_grace <= now {
            entries.remove(key);
            return Ok(None);
        }
        Ok(Some(SharedEntry {
            payload: entry.payload.clone(),
            expired: entry.expires_at <= now,
        }))
    }

    fn set(&self, key: &str, payload: &str, ttl: Duration) -> Result<()> {
        let expires_at = self.clock.now() + ttl;
        self.entries.lock().insert(
            key.to_string(),
            MemoryEntry {
                payload: payload.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    fn try_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let now = self.clock.now();
        let mut locks = self.locks.lock();
        match locks.get(key) {
            Some(lock) if lock.expires_at > now => Ok(false),
            _ => {
                locks.insert(
                    key.to_string(),
                    MemoryLock {
                        owner: owner.to_string(),
                        expires_at: now + ttl,
                    },
                );
                Ok(true)
            }
        }
    }

    fn unlock(&self, key: &str, owner: &str) -> Result<()> {
        let mut locks = self.locks.lock();
        if locks.get(key).is_some_and(|lock| lock.owner == owner) {
            locks.remove(key);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StampedePolicy {
    pub lock_ttl: Duration,
    pub lock_wait: Duration,
}

/// Shared-tier payload: the value plus the purge marker that was live when
/// its loader started.
#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
    purge: Option<&'a str>,
    value: &'a T,
}

#[derive(Deserialize)]
struct Envelope<T> {
    purge: Option<String>,
    value: T,
}

/// Typed access to a [`SharedCache`] with the stampede guard applied on miss.
///
/// Every purge leaves a marker next to the key. An entry only counts when it
/// was loaded under the marker that is live now, so a refill that read the
/// store before a purge can never publish its result after it.
#[derive(Clone)]
pub struct SharedTier {
    cache: Arc<dyn SharedCache>,
    policy: StampedePolicy,
}

impl SharedTier {
    pub fn new(cache: Arc<dyn SharedCache>, policy: StampedePolicy) -> Self {
        Self { cache, policy }
    }

    /// Drop `key` and record a fresh purge marker. `hold_for` must cover the
    /// TTL of any entry written before the purge.
    pub fn purge(&self, key: &str, hold_for: Duration) -> Result<()> {
        // Marker first: a refill that stores after the delete still sees it.
        self.cache
            .set(&purge_key(key), &new_token(), hold_for)
            .with_context(|| format!("failed to mark shared cache key {key} as purged"))?;
        self.cache
            .delete(key)
            .with_context(|| format!("failed to delete shared cache key {key}"))
    }

    /// Cache-aside read guarded against stampedes.
    ///
    /// On a miss only the lock holder runs `loader`. Everyone else serves the
    /// stale copy when there is one, or waits up to `lock_wait` for the
    /// holder's result and runs `loader` unguarded if it never shows up.
    pub fn get_or_load<T, F>(&self, key: &str, ttl: Duration, loader: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<T>,
    {
        let mut stale = None;
        if let Some((value, expired)) = self.read_current::<T>(key) {
            if !expired {
                debug!(key, "shared cache hit");
                return Ok(value);
            }
            stale = Some(value);
        }
        debug!(key, "shared cache miss");

        let lock_key = lock_key(key);
        let owner = new_token();
        if self.cache.try_lock(&lock_key, &owner, self.policy.lock_ttl)? {
            let result = self.fill_locked(key, ttl, loader);
            if let Err(err) = self.cache.unlock(&lock_key, &owner) {
                warn!(key, error = %err, "failed to release shared cache lock");
            }
            return result;
        }

        if let Some(value) = stale {
            warn!(key, "refill in progress elsewhere; serving stale value");
            return Ok(value);
        }

        let deadline = Instant::now() + self.policy.lock_wait;
        while Instant::now() < deadline {
            thread::sleep(LOCK_POLL_INTERVAL);
            if let Some((value, false)) = self.read_current::<T>(key) {
                debug!(key, "shared cache filled by lock holder");
                return Ok(value);
            }
        }

        warn!(
            key,
            waited_ms = self.policy.lock_wait.as_millis() as u64,
            "timed out waiting for shared cache refill; loading without lock"
        );
        let marker = self.read_marker(key);
        let value = loader()?;
        self.write(key, &value, ttl, marker.as_deref());
        Ok(value)
    }

    fn fill_locked<T, F>(&self, key: &str, ttl: Duration, loader: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<T>,
    {
        // Read before the loader touches the store.
        let marker = self.read_marker(key);
        // Another holder may have finished between our miss and our lock.
        if let Some((value, false)) = self.read_current::<T>(key) {
            return Ok(value);
        }
        let value = loader()?;
        self.write(key, &value, ttl, marker.as_deref());
        Ok(value)
    }

    /// Decoded entry and its `expired` flag, if it was loaded under the live
    /// purge marker.
    fn read_current<T: DeserializeOwned>(&self, key: &str) -> Option<(T, bool)> {
        let marker = self.read_marker(key);
        let entry = self.read(key)?;
        let envelope = decode::<Envelope<T>>(key, &entry.payload)?;
        if envelope.purge != marker {
            debug!(key, "shared cache entry predates the last purge");
            return None;
        }
        Some((envelope.value, entry.expired))
    }

    fn read_marker(&self, key: &str) -> Option<String> {
        self.read(&purge_key(key)).map(|entry| entry.payload)
    }

    fn read(&self, key: &str) -> Option<SharedEntry> {
        match self.cache.get(key) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(key, error = %err, "shared cache read failed; treating as miss");
                None
            }
        }
    }

    fn write<T: Serialize>(&self, key: &str, value: &T, ttl: Duration, marker: Option<&str>) {
        let envelope = EnvelopeRef {
            purge: marker,
            value,
        };
        let payload = match serde_json::to_string(&envelope) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(key, error = %err, "failed to encode shared cache value");
                return;
            }
        };
        if let Err(err) = self.cache.set(key, &payload, ttl) {
            warn!(key, error = %err, "shared cache write failed");
        }
    }
}

pub fn lock_key(key: &str) -> String {
    format!("{key}:lock")
}

pub fn purge_key(key: &str) -> String {
    format!("{key}:purged")
}

/// Token unique across processes and calls; names lock owners and purges.
pub fn new_token() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default();
    format!(
        "{}-{nanos:x}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

fn decode<T: DeserializeOwned>(key: &str, payload: &str) -> Option<T> {
    match serde_json::from_str(payload) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(key, error = %err, "undecodable shared cache payload; treating as miss");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::bail;

    use super::*;

    fn policy() -> StampedePolicy {
        StampedePolicy {
            lock_ttl: Duration::from_secs(300),
            lock_wait: Duration::from_millis(50),
        }
    }

    #[test]
    fn local_cache_expires_after_ttl() {
        let clock = Arc::new(ManualClock::default());
        let cache: LocalCache<String> = LocalCache::new(clock.clone());
        let loads = AtomicUsize::new(0);
        let load = || {
            loads.fetch_add(1, Ordering::SeqCst);
            Ok("value".to_string())
        };

        cache
            .get_or_load("k", Duration::from_secs(60), load)
            .expect("first");
        cache
            .get_or_load("k", Duration::from_secs(60), load)
            .expect("second");
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        clock.advance(Duration::from_secs(61));
        cache
            .get_or_load("k", Duration::from_secs(60), load)
            .expect("third");
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn local_cache_does_not_store_loader_errors() {
        let cache: LocalCache<String> = LocalCache::new(Arc::new(SystemClock));
        let error = cache
            .get_or_load("k", Duration::from_secs(60), || bail!("database down"))
            .expect_err("must fail");
        assert!(error.to_string().contains("database down"));
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn memory_shared_cache_keeps_stale_copy_for_grace_period() {
        let clock = Arc::new(ManualClock::default());
        let cache = MemorySharedCache::new(Duration::from_secs(30), clock.clone());
        cache.set("k", "v", Duration::from_secs(10)).expect("set");

        let fresh = cache.get("k").expect("get").expect("entry");
        assert!(!fresh.expired);

        clock.advance(Duration::from_secs(15));
        let stale = cache.get("k").expect("get").expect("entry");
        assert!(stale.expired);

        clock.advance(Duration::from_secs(30));
        assert!(cache.get("k").expect("get").is_none());
    }

    #[test]
    fn memory_shared_cache_lock_expires() {
        let clock = Arc::new(ManualClock::default());
        let cache = MemorySharedCache::new(Duration::ZERO, clock.clone());
        assert!(cache.try_lock("l", "a", Duration::from_secs(5)).expect("lock"));
        assert!(!cache.try_lock("l", "b", Duration::from_secs(5)).expect("lock"));
        clock.advance(Duration::from_secs(6));
        assert!(cache.try_lock("l", "b", Duration::from_secs(5)).expect("lock"));
        cache.unlock("l", "b").expect("unlock");
        assert!(cache.try_lock("l", "c", Duration::from_secs(5)).expect("lock"));
    }

    #[test]
    fn memory_shared_cache_unlock_ignores_other_owners() {
        let clock = Arc::new(ManualClock::default());
        let cache = MemorySharedCache::new(Duration::ZERO, clock.clone());
        assert!(cache.try_lock("l", "stuck", Duration::from_secs(5)).expect("lock"));
        clock.advance(Duration::from_secs(6));
        assert!(cache.try_lock("l", "current", Duration::from_secs(5)).expect("take over"));

        cache.unlock("l", "stuck").expect("late unlock");
        assert!(!cache.try_lock("l", "third", Duration::from_secs(5)).expect("still held"));
    }

    #[test]
    fn shared_tier_serves_stale_while_lock_is_held() {
        let clock = Arc::new(ManualClock::default());
        let cache = Arc::new(MemorySharedCache::new(Duration::from_secs(60), clock.clone()));
        let tier = SharedTier::new(cache.clone(), policy());
        let _: String = tier
            .get_or_load("k", Duration::from_secs(10), || Ok("old".to_string()))
            .expect("fill");
        clock.advance(Duration::from_secs(11));
        assert!(
            cache
                .try_lock(&lock_key("k"), "elsewhere", Duration::from_secs(300))
                .expect("lock")
        );

        let value: String = tier
            .get_or_load("k", Duration::from_secs(10), || Ok("new".to_string()))
            .expect("get");
        assert_eq!(value, "old");
    }

    #[test]
    fn shared_tier_loads_unguarded_after_lock_wait_times_out() {
        let cache = Arc::new(MemorySharedCache::new(Duration::ZERO, Arc::new(SystemClock)));
        let tier = SharedTier::new(cache.clone(), policy());
        assert!(
            cache
                .try_lock(&lock_key("k"), "elsewhere", Duration::from_secs(300))
                .expect("lock")
        );

        let value: String = tier
            .get_or_load("k", Duration::from_secs(10), || Ok("loaded".to_string()))
            .expect("get");
        assert_eq!(value, "loaded");

        let cached: String = tier
            .get_or_load("k", Duration::from_secs(10), || Ok("reloaded".to_string()))
            .expect("cached");
        assert_eq!(cached, "loaded");
    }

    #[test]
    fn shared_tier_treats_undecodable_payload_as_miss() {
        let cache = Arc::new(MemorySharedCache::new(Duration::ZERO, Arc::new(SystemClock)));
        let tier = SharedTier::new(cache.clone(), policy());
        cache
            .set("k", "not json", Duration::from_secs(10))
            .expect("set");

        let value: Vec<u32> = tier
            .get_or_load("k", Duration::from_secs(10), || Ok(vec![1, 2]))
            .expect("get");
        assert_eq!(value, vec![1, 2]);
    }

    #[test]
    fn shared_tier_releases_lock_when_loader_fails() {
        let cache = Arc::new(MemorySharedCache::new(Duration::ZERO, Arc::new(SystemClock)));
        let tier = SharedTier::new(cache.clone(), policy());
        let result: Result<String> =
            tier.get_or_load("k", Duration::from_secs(10), || bail!("scan failed"));
        assert!(result.is_err());
        assert!(
            cache
                .try_lock(&lock_key("k"), "next", Duration::from_secs(1))
                .expect("lock")
        );
    }

    #[test]
    fn purge_during_refill_discards_the_refilled_value() {
        let cache = Arc::new(MemorySharedCache::new(Duration::ZERO, Arc::new(SystemClock)));
        let refiller = SharedTier::new(cache.clone(), policy());
        let writer = SharedTier::new(cache.clone(), policy());

        // The store is read, then a write commits and purges before the
        // refiller publishes.
        let value: String = refiller
            .get_or_load("k", Duration::from_secs(60), || {
                writer
                    .purge("k", Duration::from_secs(60))
                    .expect("purge");
                Ok("old".to_string())
            })
            .expect("refill");
        assert_eq!(value, "old");

        let after: String = SharedTier::new(cache, policy())
            .get_or_load("k", Duration::from_secs(60), || Ok("new".to_string()))
            .expect("after purge");
        assert_eq!(after, "new");
    }

    #[test]
    fn purge_drops_the_entry_for_every_reader() {
        let cache = Arc::new(MemorySharedCache::new(Duration::from_secs(60), Arc::new(SystemClock)));
        let tier = SharedTier::new(cache.clone(), policy());
        let _: String = tier
            .get_or_load("k", Duration::from_secs(60), || Ok("old".to_string()))
            .expect("fill");
        tier.purge("k", Duration::from_secs(60)).expect("purge");

        assert!(cache.get("k").expect("get").is_none());
        let value: String = tier
            .get_or_load("k", Duration::from_secs(60), || Ok("new".to_string()))
            .expect("refill");
        assert_eq!(value, "new");
    }

    #[test]
    fn shared_tier_runs_loader_once_under_concurrent_misses() {
        let cache = Arc::new(MemorySharedCache::new(Duration::ZERO, Arc::new(SystemClock)));
        let tier = SharedTier::new(
            cache,
            StampedePolicy {
                lock_ttl: Duration::from_secs(300),
                lock_wait: Duration::from_secs(5),
            },
        );
        let loads = Arc::new(AtomicUsize::new(0));

        let handles = (0..8)
            .map(|_| {
                let tier = tier.clone();
                let loads = Arc::clone(&loads);
                thread::spawn(move || {
                    tier.get_or_load("k", Duration::from_secs(60), || {
                        loads.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(100));
                        Ok(vec!["snapshot".to_string()])
                    })
                })
            })
            .collect::<Vec<_>>();

        for handle in handles {
            let value = handle.join().expect("join").expect("get");
            assert_eq!(value, vec!["snapshot".to_string()]);
        }
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }
}
