use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use cloudsync_types::Clock;
use cloudsync_types::CoreError;
use cloudsync_types::CoreResult;
use cloudsync_types::ItemId;
use parking_lot::Mutex;

use crate::handle::CacheHandle;

type GuardFn = Box<dyn Fn(&ItemId) -> bool + Send + Sync>;
type HandlerFn = Box<dyn Fn(&ItemId) + Send + Sync>;

struct Tracked {
    size: u64,
    last_access: u64,
    last_access_at: i64,
}

struct Inner {
    tracked: HashMap<ItemId, Tracked>,
    total_size: u64,
}

/// A bounded, indexable byte store on local disk (spec §4.3). Eviction is
/// least-recently-accessed first, subject to a caller-supplied guard; an
/// insertion that cannot free enough space from unguarded candidates fails
/// with `NoSpace` and evicts nothing ("no partial eviction").
pub struct ContentCache {
    root: PathBuf,
    budget: u64,
    sharded: bool,
    clock: Arc<dyn Clock>,
    tick: AtomicU64,
    inner: Mutex<Inner>,
    guard: Mutex<Option<GuardFn>>,
    handler: Mutex<Option<HandlerFn>>,
}

impl ContentCache {
    /// `budget` of `0` means unbounded (spec §6.4 `cache_size_bytes`).
    /// Sharding (two path levels under `content/`) is enabled once the
    /// cache is expected to hold 4096+ entries; pass `expected_entries` to
    /// size that decision up front.
    pub fn open(root: PathBuf, budget: u64, expected_entries: usize, clock: Arc<dyn Clock>) -> CoreResult<Self> {
        let content_dir = root.join("content");
        fs::create_dir_all(&content_dir)?;
        let cache = Self {
            root,
            budget,
            sharded: expected_entries >= 4096,
            clock,
            tick: AtomicU64::new(0),
            inner: Mutex::new(Inner {
                tracked: HashMap::new(),
                total_size: 0,
            }),
            guard: Mutex::new(None),
            handler: Mutex::new(None),
        };
        cache.rehydrate_index_from_disk()?;
        Ok(cache)
    }

    fn rehydrate_index_from_disk(&self) -> CoreResult<()> {
        // Best-effort: on a fresh cache directory there is nothing to index;
        // a real deployment would persist the index alongside the catalog.
        // Left as a no-op walk hook for forward compatibility.
        Ok(())
    }

    pub fn content_path(&self, id: &ItemId) -> PathBuf {
        let digest = short_digest(id.as_str());
        if self.sharded {
            self.root
                .join("content")
                .join(&digest[0..2])
                .join(&digest[2..4])
                .join(&digest)
        } else {
            self.root.join("content").join(&digest)
        }
    }

    fn tmp_path(&self, id: &ItemId) -> PathBuf {
        let mut p = self.content_path(id);
        let name = p.file_name().unwrap().to_owned();
        p.set_file_name(format!("{}.tmp", name.to_string_lossy()));
        p
    }

    pub fn has_content(&self, id: &ItemId) -> bool {
        self.inner.lock().tracked.contains_key(id)
    }

    pub fn get(&self, id: &ItemId) -> CoreResult<Option<Vec<u8>>> {
        if !self.has_content(id) {
            return Ok(None);
        }
        self.touch(id);
        let path = self.content_path(id);
        Ok(Some(fs::read(path)?))
    }

    /// Writes `bytes` as the full content for `id`, evicting other entries
    /// if needed to stay within budget.
    pub fn insert(&self, id: &ItemId, bytes: &[u8]) -> CoreResult<()> {
        let needed_size = bytes.len() as u64;
        self.reserve_space(id, needed_size)?;

        let final_path = self.content_path(id);
        if let Some(dir) = final_path.parent() {
            fs::create_dir_all(dir)?;
        }
        let tmp = self.tmp_path(id);
        fs::write(&tmp, bytes)?;
        let f = fs::File::open(&tmp)?;
        f.sync_all()?;
        fs::rename(&tmp, &final_path)?;
        if let Some(dir) = final_path.parent() {
            if let Ok(d) = fs::File::open(dir) {
                let _ = d.sync_all();
            }
        }

        let mut inner = self.inner.lock();
        let tick = self.next_tick();
        if let Some(prev) = inner.tracked.insert(
            id.clone(),
            Tracked {
                size: needed_size,
                last_access: tick,
                last_access_at: self.clock.now(),
            },
        ) {
            inner.total_size = inner.total_size.saturating_sub(prev.size);
        }
        inner.total_size += needed_size;
        Ok(())
    }

    /// Opens (creating if absent) a cache slot for read/write access.
    pub fn open_handle(&self, id: &ItemId) -> CoreResult<CacheHandle> {
        let path = self.content_path(id);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        self.touch(id);
        CacheHandle::open_for_write(&path)
    }

    pub fn open_read_only(&self, id: &ItemId) -> CoreResult<CacheHandle> {
        let path = self.content_path(id);
        self.touch(id);
        CacheHandle::open_read_only(&path)
    }

    /// Registers the size of a cache slot that was populated directly
    /// through a `CacheHandle` rather than `insert` (e.g. by a download
    /// session writing chunks). Must be called once the handle's writer is
    /// done so eviction accounting stays correct.
    pub fn note_size(&self, id: &ItemId, size: u64) {
        let mut inner = self.inner.lock();
        let tick = self.next_tick();
        if let Some(prev) = inner.tracked.insert(
            id.clone(),
            Tracked {
                size,
                last_access: tick,
                last_access_at: self.clock.now(),
            },
        ) {
            inner.total_size = inner.total_size.saturating_sub(prev.size);
        }
        inner.total_size += size;
    }

    pub fn delete(&self, id: &ItemId) -> CoreResult<()> {
        let path = self.content_path(id);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        let mut inner = self.inner.lock();
        if let Some(prev) = inner.tracked.remove(id) {
            inner.total_size = inner.total_size.saturating_sub(prev.size);
        }
        Ok(())
    }

    pub fn set_eviction_guard(&self, f: impl Fn(&ItemId) -> bool + Send + Sync + 'static) {
        *self.guard.lock() = Some(Box::new(f));
    }

    pub fn set_eviction_handler(&self, f: impl Fn(&ItemId) + Send + Sync + 'static) {
        *self.handler.lock() = Some(Box::new(f));
    }

    fn touch(&self, id: &ItemId) {
        let tick = self.next_tick();
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        if let Some(t) = inner.tracked.get_mut(id) {
            t.last_access = tick;
            t.last_access_at = now;
        }
    }

    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed)
    }

    /// Deletes every unguarded entry whose last access is at least
    /// `ttl_seconds` old (spec §6.4 `cache_ttl_seconds`). `0` disables TTL
    /// eviction entirely. Returns the number of entries evicted.
    pub fn evict_expired(&self, ttl_seconds: u64) -> usize {
        if ttl_seconds == 0 {
            return 0;
        }
        let now = self.clock.now();
        let ttl = ttl_seconds as i64;
        let expired: Vec<ItemId> = {
            let inner = self.inner.lock();
            inner
                .tracked
                .iter()
                .filter(|(_, t)| now.saturating_sub(t.last_access_at) >= ttl)
                .map(|(id, _)| id.clone())
                .collect()
        };

        let mut evicted = 0;
        for id in &expired {
            if !self.is_evictable(id) {
                continue;
            }
            if self.delete(id).is_ok() {
                evicted += 1;
                if let Some(handler) = self.handler.lock().as_ref() {
                    handler(id);
                }
            }
        }
        evicted
    }

    fn is_evictable(&self, id: &ItemId) -> bool {
        match self.guard.lock().as_ref() {
            Some(f) => f(id),
            None => true,
        }
    }

    /// Ensures there is room for `needed_size` additional bytes for `id`,
    /// evicting least-recently-used unguarded entries first. All-or-nothing:
    /// if the unguarded candidates can't free enough, nothing is evicted
    /// and `NoSpace` is returned.
    fn reserve_space(&self, id: &ItemId, needed_size: u64) -> CoreResult<()> {
        if self.budget == 0 {
            return Ok(());
        }

        let (already_have, total_size, mut candidates) = {
            let inner = self.inner.lock();
            let already_have = inner.tracked.get(id).map(|t| t.size).unwrap_or(0);
            let mut candidates: Vec<(ItemId, u64, u64)> = inner
                .tracked
                .iter()
                .filter(|(cid, _)| *cid != id)
                .map(|(cid, t)| (cid.clone(), t.size, t.last_access))
                .collect();
            candidates.sort_by_key(|(_, _, last_access)| *last_access);
            (already_have, inner.total_size, candidates)
        };

        let projected = total_size.saturating_sub(already_have) + needed_size;
        if projected <= self.budget {
            return Ok(());
        }
        let mut to_free = projected - self.budget;

        candidates.retain(|(cid, _, _)| self.is_evictable(cid));

        let available: u64 = candidates.iter().map(|(_, size, _)| size).sum();
        if available < to_free {
            return Err(CoreError::NoSpace {
                needed: to_free,
                available,
            });
        }

        for (cid, size, _) in candidates {
            if to_free == 0 {
                break;
            }
            self.delete(&cid)?;
            if let Some(handler) = self.handler.lock().as_ref() {
                handler(&cid);
            }
            to_free = to_free.saturating_sub(size);
        }
        Ok(())
    }
}

fn short_digest(s: &str) -> String {
    use sha2_like::fnv1a64;
    format!("{:016x}", fnv1a64(s.as_bytes()))
}

/// A tiny dependency-free FNV-1a hash used only to derive stable,
/// fixed-length, path-safe cache filenames from arbitrary item ids. Not a
/// content hash (see `cloudsync_types::ContentHash` for that).
mod sha2_like {
    pub fn fnv1a64(bytes: &[u8]) -> u64 {
        let mut hash: u64 = 0xcbf29ce484222325;
        for b in bytes {
            hash ^= *b as u64;
            hash = hash.wrapping_mul(0x100000001b3);
        }
        hash
    }
}

#[cfg(test)]
mod tests {
    use cloudsync_types::SystemClock;

    use super::*;

    fn cache(budget: u64) -> (tempfile::TempDir, ContentCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = ContentCache::open(dir.path().to_path_buf(), budget, 0, Arc::new(SystemClock)).unwrap();
        (dir, cache)
    }

    #[test]
    fn insert_then_get_roundtrips_bytes() {
        let (_dir, cache) = cache(0);
        let id = ItemId::new("f1");
        cache.insert(&id, b"abcdef").unwrap();
        assert!(cache.has_content(&id));
        assert_eq!(cache.get(&id).unwrap().unwrap(), b"abcdef");
    }

    #[test]
    fn delete_removes_bytes_and_tracking() {
        let (_dir, cache) = cache(0);
        let id = ItemId::new("f1");
        cache.insert(&id, b"abcdef").unwrap();
        cache.delete(&id).unwrap();
        assert!(!cache.has_content(&id));
        assert!(cache.get(&id).unwrap().is_none());
    }

    #[test]
    fn eviction_of_pinned_file_fails_with_no_space() {
        // Scenario 2 from spec §8.
        let (_dir, cache) = cache(8);
        let f2 = ItemId::new("F2");
        let f3 = ItemId::new("F3");
        cache.set_eviction_guard(move |id| id != &ItemId::new("F2"));
        cache.insert(&f2, b"123456").unwrap(); // 6 bytes, pinned
        let err = cache.insert(&f3, b"abcd").unwrap_err(); // needs 4 more, only 2 free and F2 pinned
        assert!(matches!(err, CoreError::NoSpace { .. }));
        assert!(cache.has_content(&f2));
        assert_eq!(cache.get(&f2).unwrap().unwrap(), b"123456");
    }

    #[test]
    fn eviction_prefers_least_recently_used_unguarded_entry() {
        let (_dir, cache) = cache(6);
        let a = ItemId::new("a");
        let b = ItemId::new("b");
        cache.insert(&a, b"aaa").unwrap();
        cache.insert(&b, b"bbb").unwrap();
        cache.touch(&b); // b is now more recently used than a
        let evicted = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
        let evicted2 = evicted.clone();
        cache.set_eviction_handler(move |id| evicted2.lock().push(id.clone()));

        let c = ItemId::new("c");
        cache.insert(&c, b"ccc").unwrap();

        assert!(!cache.has_content(&a));
        assert!(cache.has_content(&b));
        assert!(cache.has_content(&c));
        assert_eq!(evicted.lock().as_slice(), &[a]);
    }

    #[test]
    fn no_partial_eviction_on_failed_reservation() {
        let (_dir, cache) = cache(5);
        let a = ItemId::new("a");
        cache.insert(&a, b"aaa").unwrap(); // 3 bytes, all guarded
        cache.set_eviction_guard(|_| false);
        let b = ItemId::new("b");
        let err = cache.insert(&b, b"abcdef").unwrap_err(); // needs 6, budget 5, a is guarded
        assert!(matches!(err, CoreError::NoSpace { .. }));
        assert!(cache.has_content(&a));
        assert!(!cache.has_content(&b));
    }

    struct ManualClock(AtomicU64);
    impl Clock for ManualClock {
        fn now(&self) -> i64 {
            self.0.load(Ordering::SeqCst) as i64
        }
    }

    #[test]
    fn evict_expired_drops_only_entries_past_their_ttl() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock(AtomicU64::new(0)));
        let cache = ContentCache::open(dir.path().to_path_buf(), 0, 0, clock.clone() as Arc<dyn Clock>).unwrap();
        let old = ItemId::new("old");
        cache.insert(&old, b"old").unwrap();

        clock.0.store(100, Ordering::SeqCst);
        let fresh = ItemId::new("fresh");
        cache.insert(&fresh, b"fresh").unwrap();

        clock.0.store(150, Ordering::SeqCst);
        let evicted = cache.evict_expired(120);
        assert_eq!(evicted, 1);
        assert!(!cache.has_content(&old));
        assert!(cache.has_content(&fresh));
    }

    #[test]
    fn evict_expired_is_a_no_op_when_ttl_is_zero() {
        let (_dir, cache) = cache(0);
        let id = ItemId::new("a");
        cache.insert(&id, b"abc").unwrap();
        assert_eq!(cache.evict_expired(0), 0);
        assert!(cache.has_content(&id));
    }
}
