// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Concurrent `app-id -> {name, space, org}` cache with TTL, async miss-fill
//! and optional bulk preload.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use metrics::{counter, gauge};
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::appclient::AppLookup;
use crate::error::NozzleError;
use crate::telemetry;

/// Expiration sentinel meaning "never expires".
pub const NEVER: i64 = i64::MAX;

const PERIODIC_RELOAD_PERIOD: Duration = Duration::from_secs(300);

/// Resolved application identity. Immutable once constructed; `space` and
/// `org` fall back to `"not_found"` when the lookup can resolve the app but
/// not its containing space/org.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppInfo {
    pub guid: String,
    pub name: String,
    pub space: String,
    pub org: String,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: AppInfo,
    expiration: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CacheState {
    Uninitialized,
    Preloading,
    Ready,
}

impl From<u8> for CacheState {
    fn from(v: u8) -> Self {
        match v {
            0 => CacheState::Uninitialized,
            1 => CacheState::Preloading,
            _ => CacheState::Ready,
        }
    }
}

/// Construction-time configuration, sourced from `NOZZLE_APP_CACHE_*`.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub capacity: usize,
    pub ttl: Duration,
    pub preload_ttl: Duration,
    pub enable_preload: bool,
    pub refill_channel_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 50_000,
            ttl: Duration::from_secs(6 * 3600),
            preload_ttl: Duration::from_secs(24 * 3600),
            enable_preload: true,
            refill_channel_capacity: 1_000,
        }
    }
}

struct Inner {
    map: HashMap<String, CacheEntry>,
    heap: BinaryHeap<Reverse<(i64, String)>>,
    capacity: usize,
}

impl Inner {
    fn evict_one(&mut self, now: i64) {
        loop {
            let top = match self.heap.peek() {
                Some(Reverse((exp, guid))) => (*exp, guid.clone()),
                None => break,
            };
            match self.map.get(&top.1) {
                Some(entry) if entry.expiration == top.0 => {
                    if top.0 < now {
                        self.heap.pop();
                        self.map.remove(&top.1);
                        return;
                    }
                    break; // smallest expiration is still in the future: nothing expired
                }
                _ => {
                    self.heap.pop(); // stale heap entry, superseded or already evicted
                }
            }
        }
        if let Some(key) = self.random_resident_key() {
            self.map.remove(&key);
        }
    }

    fn random_resident_key(&self) -> Option<String> {
        if self.map.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..self.map.len());
        self.map.keys().nth(idx).cloned()
    }

    fn insert(&mut self, guid: String, entry: CacheEntry) {
        if !self.map.contains_key(&guid) && self.map.len() >= self.capacity {
            self.evict_one(now_ns());
        }
        self.heap.push(Reverse((entry.expiration, guid.clone())));
        self.map.insert(guid, entry);
    }
}

fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Jitter uniform in `[0, ttl/4)`, so a bulk preload does not expire in a
/// synchronized mass re-resolution.
fn expiration_with_jitter(ttl: Duration) -> i64 {
    let ttl_ns = ttl.as_nanos() as i64;
    let quarter = (ttl_ns / 4).max(1);
    let jitter = rand::thread_rng().gen_range(0..quarter);
    now_ns().saturating_add(ttl_ns).saturating_add(jitter)
}

/// Concurrent app identity cache. Cloning is cheap: it shares the same
/// underlying state and background tasks.
pub struct AppInfoCache {
    inner: RwLock<Inner>,
    state: AtomicU8,
    in_flight: Mutex<HashSet<String>>,
    refill_tx: mpsc::Sender<String>,
    ttl: Duration,
}

impl AppInfoCache {
    /// Builds the cache and spawns its background tasks: the refill worker
    /// always, and — if `config.enable_preload` — the one-shot bulk preload
    /// plus its 5-minute periodic reload.
    pub fn new(config: CacheConfig, lookup: Arc<dyn AppLookup>) -> Arc<Self> {
        let (refill_tx, refill_rx) = mpsc::channel(config.refill_channel_capacity);
        let cache = Arc::new(Self {
            inner: RwLock::new(Inner {
                map: HashMap::new(),
                heap: BinaryHeap::new(),
                capacity: config.capacity,
            }),
            state: AtomicU8::new(if config.enable_preload { 1 } else { 2 }),
            in_flight: Mutex::new(HashSet::new()),
            refill_tx,
            ttl: config.ttl,
        });

        tokio::spawn(Self::refill_task(Arc::clone(&cache), lookup.clone(), refill_rx));

        if config.enable_preload {
            let preload_cache = Arc::clone(&cache);
            let preload_lookup = lookup.clone();
            let preload_ttl = config.preload_ttl;
            tokio::spawn(async move {
                Self::preload(&preload_cache, preload_lookup.as_ref(), preload_ttl).await;
                preload_cache.state.store(2, Ordering::SeqCst);
                let reload_cache = preload_cache;
                loop {
                    tokio::time::sleep(PERIODIC_RELOAD_PERIOD).await;
                    Self::preload(&reload_cache, preload_lookup.as_ref(), preload_ttl).await;
                }
            });
        }

        cache
    }

    async fn preload(cache: &Arc<Self>, lookup: &dyn AppLookup, ttl: Duration) {
        match lookup.list_all().await {
            Ok(apps) => {
                let mut inner = cache.inner.write().unwrap_or_else(|e| e.into_inner());
                for app in apps {
                    let expiration = expiration_with_jitter(ttl);
                    inner.insert(app.guid.clone(), CacheEntry { value: app, expiration });
                }
                gauge!(telemetry::CACHE_SIZE).set(inner.map.len() as f64);
                info!(entries = inner.map.len(), "app cache preload complete");
            }
            Err(e) => {
                error!(error = %e, "app cache preload failed; degrading to per-key resolution");
            }
        }
    }

    async fn refill_task(
        cache: Arc<Self>,
        lookup: Arc<dyn AppLookup>,
        mut rx: mpsc::Receiver<String>,
    ) {
        while let Some(guid) = rx.recv().await {
            let result = lookup.lookup_one(&guid).await;
            {
                let mut in_flight = cache.in_flight.lock().unwrap_or_else(|e| e.into_inner());
                in_flight.remove(&guid);
            }
            match result {
                Ok(info) => cache.set(&guid, info, cache.ttl),
                Err(source) => {
                    let error = NozzleError::Lookup { guid: guid.clone(), source };
                    counter!(telemetry::CACHE_ERRORS).increment(1);
                    warn!(guid = %guid, error = %error, "app lookup failed");
                }
            }
        }
    }

    fn state(&self) -> CacheState {
        CacheState::from(self.state.load(Ordering::SeqCst))
    }

    /// Non-blocking lookup, bounded in time regardless of remote latency.
    /// Queues a miss-fill on absence and always returns immediately.
    pub fn get(&self, guid: &str) -> Option<AppInfo> {
        if self.state() == CacheState::Preloading {
            return None;
        }

        let now = now_ns();
        {
            let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = inner.map.get(guid) {
                if entry.expiration >= now {
                    return Some(entry.value.clone());
                }
            }
        }

        self.queue_refill(guid);
        None
    }

    fn queue_refill(&self, guid: &str) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !in_flight.insert(guid.to_string()) {
            return; // already has an outstanding lookup (F5)
        }
        match self.refill_tx.try_send(guid.to_string()) {
            Ok(()) => counter!(telemetry::CACHE_MISS).increment(1),
            Err(_) => {
                in_flight.remove(guid);
                debug!(guid = %guid, "refill channel full, dropping miss");
            }
        }
    }

    /// Inserts or replaces an entry with `now + ttl + jitter` expiration.
    pub fn set(&self, guid: &str, info: AppInfo, ttl: Duration) {
        let expiration = expiration_with_jitter(ttl);
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.insert(guid.to_string(), CacheEntry { value: info, expiration });
        gauge!(telemetry::CACHE_SIZE).set(inner.map.len() as f64);
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tracing_test::{logs_contain, traced_test};

    struct FakeLookup {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AppLookup for FakeLookup {
        async fn list_all(&self) -> anyhow::Result<Vec<AppInfo>> {
            Ok(vec![])
        }

        async fn lookup_one(&self, guid: &str) -> anyhow::Result<AppInfo> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(AppInfo {
                guid: guid.to_string(),
                name: "app".to_string(),
                space: "space".to_string(),
                org: "org".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn miss_then_resolved_after_refill() {
        let lookup = Arc::new(FakeLookup { calls: AtomicUsize::new(0) });
        let cache = AppInfoCache::new(
            CacheConfig { enable_preload: false, ..Default::default() },
            lookup,
        );
        assert!(cache.get("G1").is_none());
        for _ in 0..50 {
            if cache.get("G1").is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("entry never resolved");
    }

    #[test]
    fn expired_entries_never_served() {
        let inner = Inner {
            map: HashMap::new(),
            heap: BinaryHeap::new(),
            capacity: 10,
        };
        let cache = AppInfoCache {
            inner: RwLock::new(inner),
            state: AtomicU8::new(2),
            in_flight: Mutex::new(HashSet::new()),
            refill_tx: mpsc::channel(1).0,
            ttl: Duration::from_secs(1),
        };
        cache.set(
            "G1",
            AppInfo {
                guid: "G1".to_string(),
                name: "n".to_string(),
                space: "s".to_string(),
                org: "o".to_string(),
            },
            Duration::from_nanos(1),
        );
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("G1").is_none());
    }

    #[test]
    fn preloading_state_always_returns_absent() {
        let inner = Inner {
            map: HashMap::new(),
            heap: BinaryHeap::new(),
            capacity: 10,
        };
        let cache = AppInfoCache {
            inner: RwLock::new(inner),
            state: AtomicU8::new(1),
            in_flight: Mutex::new(HashSet::new()),
            refill_tx: mpsc::channel(1).0,
            ttl: Duration::from_secs(1),
        };
        assert!(cache.get("anything").is_none());
    }

    struct FailingLookup;

    #[async_trait]
    impl AppLookup for FailingLookup {
        async fn list_all(&self) -> anyhow::Result<Vec<AppInfo>> {
            Ok(vec![])
        }

        async fn lookup_one(&self, _guid: &str) -> anyhow::Result<AppInfo> {
            anyhow::bail!("management API unreachable")
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn failed_lookup_logs_once_and_does_not_poison_the_cache() {
        let cache = AppInfoCache::new(
            CacheConfig { enable_preload: false, ..Default::default() },
            Arc::new(FailingLookup),
        );
        assert!(cache.get("G1").is_none());
        for _ in 0..50 {
            if logs_contain("app lookup failed") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(logs_contain("app lookup failed"));
        // The failed guid re-queues on the next request rather than being stuck.
        assert!(cache.get("G1").is_none());
    }

    #[test]
    fn random_eviction_bounds_final_size() {
        let mut inner = Inner {
            map: HashMap::new(),
            heap: BinaryHeap::new(),
            capacity: 10,
        };
        for i in 0..1000 {
            inner.insert(
                format!("G{i}"),
                CacheEntry {
                    value: AppInfo {
                        guid: format!("G{i}"),
                        name: "n".to_string(),
                        space: "s".to_string(),
                        org: "o".to_string(),
                    },
                    expiration: NEVER,
                },
            );
        }
        assert_eq!(inner.map.len(), 10);
    }
}
