//! TTL-bounded cache of rendered enrichment strings
//!
//! Entries are evicted lazily: an expired entry is removed by the read that
//! finds it. [`GeoCache::sweep_expired`] drops every expired entry at once for
//! hosts that run a periodic sweep.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::{log_debug, log_info};

/// Source of "now" in unix seconds
pub trait Clock: Send + Sync {
    fn now(&self) -> u64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }
}

/// Clock moved by hand, for tests and replay tooling
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start: u64) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    pub fn set(&self, now: u64) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: u64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub ip: String,
    pub rendered: String,
    pub inserted_at: u64,
}

impl CacheEntry {
    /// An entry is stale once it is strictly older than `ttl`
    fn is_expired(&self, now: u64, ttl: u64) -> bool {
        now.saturating_sub(self.inserted_at) > ttl
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheSnapshot {
    saved_at: u64,
    ttl_seconds: u64,
    entries: Vec<CacheEntry>,
}

pub struct GeoCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    ttl: u64,
    clock: Arc<dyn Clock>,
}

impl GeoCache {
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl: ttl.as_secs(),
            clock,
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl)
    }

    // A poisoned lock only means another thread panicked mid-insert; the map
    // itself is still a valid map.
    fn lock(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fetch the rendered string for `ip`, evicting it if it has expired
    pub fn get(&self, ip: &str) -> Option<String> {
        let now = self.clock.now();
        let mut entries = self.lock();

        let entry = entries.get(ip)?;
        if !entry.is_expired(now, self.ttl) {
            return Some(entry.rendered.clone());
        }

        entries.remove(ip);
        log_debug!("Geo cache entry expired for {}", ip);
        None
    }

    /// Insert or overwrite the entry for `ip`
    pub fn put(&self, ip: &str, rendered: &str) {
        let entry = CacheEntry {
            ip: ip.to_string(),
            rendered: rendered.to_string(),
            inserted_at: self.clock.now(),
        };
        self.lock().insert(ip.to_string(), entry);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drop every entry, e.g. on unload
    pub fn purge(&self) {
        let mut entries = self.lock();
        let count = entries.len();
        entries.clear();
        log_debug!("Purged {} geo cache entries", count);
    }

    /// Remove all expired entries, returning how many were dropped
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now, self.ttl));
        before - entries.len()
    }

    /// Write all live entries to a JSON snapshot
    pub async fn save_to_file(&self, path: &Path) -> Result<usize> {
        let now = self.clock.now();
        let entries: Vec<CacheEntry> = self
            .lock()
            .values()
            .filter(|entry| !entry.is_expired(now, self.ttl))
            .cloned()
            .collect();

        let count = entries.len();
        let snapshot = CacheSnapshot {
            saved_at: now,
            ttl_seconds: self.ttl,
            entries,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create cache directory {}", parent.display()))?;
        }

        let data = serde_json::to_string_pretty(&snapshot)?;
        tokio::fs::write(path, data)
            .await
            .with_context(|| format!("Failed to write geo cache snapshot {}", path.display()))?;

        log_info!("Saved {} geo cache entries to {}", count, path.display());
        Ok(count)
    }

    /// Restore entries from a snapshot, skipping those already expired.
    ///
    /// A missing file is not an error and restores nothing.
    pub async fn load_from_file(&self, path: &Path) -> Result<usize> {
        if !path.exists() {
            log_info!("No geo cache snapshot at {}, starting empty", path.display());
            return Ok(0);
        }

        let data = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read geo cache snapshot {}", path.display()))?;
        let snapshot: CacheSnapshot = serde_json::from_str(&data)
            .with_context(|| format!("Invalid geo cache snapshot {}", path.display()))?;

        let now = self.clock.now();
        let mut entries = self.lock();
        let mut restored = 0;
        for entry in snapshot.entries {
            if entry.is_expired(now, self.ttl) {
                continue;
            }
            entries.insert(entry.ip.clone(), entry);
            restored += 1;
        }

        log_info!("Restored {} geo cache entries from {}", restored, path.display());
        Ok(restored)
    }
}

/// Periodically drop expired entries until the runtime shuts down
pub fn spawn_sweeper(cache: Arc<GeoCache>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = cache.sweep_expired();
            if removed > 0 {
                log_debug!("Geo cache sweep removed {} expired entries", removed);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const PARIS: &str = "City: Paris, Region: IDF, Country: FR, Org: ExampleNet";

    fn cache_at(ttl: u64, start: u64) -> (GeoCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start));
        let cache = GeoCache::with_clock(Duration::from_secs(ttl), clock.clone());
        (cache, clock)
    }

    #[test]
    fn test_hit_within_ttl_and_miss_after() {
        let (cache, clock) = cache_at(100, 0);
        cache.put("203.0.113.5", PARIS);

        clock.set(50);
        assert_eq!(cache.get("203.0.113.5").as_deref(), Some(PARIS));

        clock.set(150);
        assert_eq!(cache.get("203.0.113.5"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_entry_at_exact_ttl_is_still_served() {
        let (cache, clock) = cache_at(100, 1_000);
        cache.put("198.51.100.7", "City: Berlin");
        clock.advance(100);
        assert!(cache.get("198.51.100.7").is_some());
        clock.advance(1);
        assert!(cache.get("198.51.100.7").is_none());
    }

    #[test]
    fn test_reput_after_expiry_leaves_single_entry() {
        let (cache, clock) = cache_at(10, 0);
        cache.put("2001:db8::1", "City: Oslo");
        clock.set(20);
        assert!(cache.get("2001:db8::1").is_none());

        cache.put("2001:db8::1", "City: Bergen");
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("2001:db8::1").as_deref(), Some("City: Bergen"));
    }

    #[test]
    fn test_upsert_last_write_wins() {
        let (cache, _clock) = cache_at(100, 0);
        cache.put("192.0.2.1", "A");
        cache.put("192.0.2.1", "B");
        assert_eq!(cache.get("192.0.2.1").as_deref(), Some("B"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_overwrite_refreshes_timestamp() {
        let (cache, clock) = cache_at(100, 0);
        cache.put("192.0.2.1", "A");
        clock.set(90);
        cache.put("192.0.2.1", "B");
        clock.set(150);
        assert_eq!(cache.get("192.0.2.1").as_deref(), Some("B"));
    }

    #[test]
    fn test_sweep_and_purge() {
        let (cache, clock) = cache_at(100, 0);
        cache.put("192.0.2.1", "old");
        clock.set(80);
        cache.put("192.0.2.2", "new");
        clock.set(150);

        assert_eq!(cache.sweep_expired(), 1);
        assert_eq!(cache.len(), 1);

        cache.purge();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_concurrent_writers() {
        let (cache, _clock) = cache_at(100, 0);
        let cache = Arc::new(cache);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for j in 0..100 {
                        cache.put(&format!("10.0.{}.{}", i, j), "City: Somewhere");
                        assert!(cache.get(&format!("10.0.{}.{}", i, j)).is_some());
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.len(), 800);
    }

    #[tokio::test]
    async fn test_snapshot_round_trip_drops_expired() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache").join("geo-cache.json");

        let (cache, clock) = cache_at(100, 0);
        cache.put("203.0.113.5", PARIS);
        clock.set(60);
        cache.put("203.0.113.6", "City: Lyon");
        assert_eq!(cache.save_to_file(&path).await.unwrap(), 2);

        let (restored, restored_clock) = cache_at(100, 120);
        assert_eq!(restored.load_from_file(&path).await.unwrap(), 1);
        assert_eq!(restored.get("203.0.113.6").as_deref(), Some("City: Lyon"));
        assert!(restored.get("203.0.113.5").is_none());

        restored_clock.set(200);
        assert!(restored.get("203.0.113.6").is_none());
    }

    #[tokio::test]
    async fn test_missing_snapshot_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, _clock) = cache_at(100, 0);
        let restored = cache.load_from_file(&dir.path().join("absent.json")).await.unwrap();
        assert_eq!(restored, 0);
    }
}
