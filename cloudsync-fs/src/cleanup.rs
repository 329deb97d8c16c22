//! The cache-cleanup background task (spec §5: "a periodic cache-cleanup
//! task: 1 worker"). Sweeps TTL-expired content out of the cache and
//! samples subsystem activity for stall detection, on a fixed interval,
//! mirroring `DeltaEngine::run`'s host-driven `tokio::spawn` shape rather
//! than spawning its own thread.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use cloudsync_cache::ContentCache;

use crate::Telemetry;

/// Drives [`ContentCache::evict_expired`] and [`Telemetry::note_activity_sample`]
/// on a fixed interval. Built by [`crate::Core::open`]; a host drives it with
/// `tokio::spawn(cache_cleanup.run(interval, shutdown))` alongside the delta
/// engine's own loop.
pub struct CacheCleanup {
    cache: Arc<ContentCache>,
    telemetry: Arc<Telemetry>,
    ttl_seconds: u64,
}

impl CacheCleanup {
    pub fn new(cache: Arc<ContentCache>, telemetry: Arc<Telemetry>, ttl_seconds: u64) -> Self {
        Self { cache, telemetry, ttl_seconds }
    }

    /// Runs one sweep: TTL eviction, then an activity sample. Exposed
    /// separately from [`Self::run`] so tests can drive a sweep without a
    /// sleeping background loop.
    pub fn sweep(&self) -> usize {
        self.telemetry.note_activity_sample();
        self.cache.evict_expired(self.ttl_seconds)
    }

    /// Loops [`Self::sweep`] until `shutdown` becomes true, sleeping
    /// `interval` between sweeps.
    pub async fn run(&self, interval: Duration, shutdown: Arc<AtomicBool>) {
        while !shutdown.load(Ordering::SeqCst) {
            let evicted = self.sweep();
            if evicted > 0 {
                tracing::debug!(evicted, "cache cleanup sweep evicted expired entries");
            }
            tokio::time::sleep(interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use bytes::Bytes;
    use cloudsync_cache::ContentCache;
    use cloudsync_metadata::MetadataStore;
    use cloudsync_metadata::StateManager;
    use cloudsync_sync::ConflictStrategy;
    use cloudsync_transfer::DownloadManager;
    use cloudsync_transfer::RetryConfig;
    use cloudsync_transfer::UploadManager;
    use cloudsync_types::ChunkAck;
    use cloudsync_types::Clock;
    use cloudsync_types::ContentStream;
    use cloudsync_types::CoreResult;
    use cloudsync_types::DriveItem;
    use cloudsync_types::DriveItemKind;
    use cloudsync_types::ETag;
    use cloudsync_types::ItemId;
    use cloudsync_types::RemoteClient;
    use cloudsync_types::SystemClock;

    use super::*;
    use cloudsync_sync::DeltaEngine;

    struct NoopRemote;
    #[async_trait]
    impl RemoteClient for NoopRemote {
        async fn get_item(&self, id: &ItemId) -> CoreResult<DriveItem> {
            Ok(DriveItem {
                id: id.clone(),
                name: String::new(),
                size: 0,
                etag: ETag::empty(),
                parent_id: ItemId::empty(),
                mod_time: 0,
                kind: DriveItemKind::Folder { child_count: 0 },
            })
        }
        async fn get_content(&self, _id: &ItemId, _range: Option<(u64, u64)>) -> CoreResult<ContentStream> {
            Ok(ContentStream { bytes: Bytes::new(), total_size: 0, etag: ETag::empty() })
        }
        async fn put_content(&self, id: &ItemId, _bytes: Bytes, _if_match_etag: Option<&ETag>) -> CoreResult<DriveItem> {
            self.get_item(id).await
        }
        async fn create_upload_session(&self, _id: &ItemId) -> CoreResult<String> {
            Ok(String::new())
        }
        async fn put_chunk(&self, _upload_url: &str, _range: (u64, u64), _total_size: u64, _bytes: Bytes) -> CoreResult<Result<ChunkAck, DriveItem>> {
            Ok(Ok(ChunkAck { bytes_received: 0 }))
        }
        async fn remove(&self, _id: &ItemId) -> CoreResult<()> {
            Ok(())
        }
        async fn delta(&self, _cursor: Option<String>) -> CoreResult<cloudsync_types::DeltaPage> {
            Ok(cloudsync_types::DeltaPage { changes: Vec::new(), next_cursor: None })
        }
    }

    fn telemetry_harness(cache: Arc<ContentCache>, clock: Arc<dyn Clock>) -> Arc<Telemetry> {
        let store = Arc::new(MetadataStore::open_in_memory().unwrap());
        let state = Arc::new(StateManager::new(store, clock.clone()));
        let remote: Arc<dyn RemoteClient> = Arc::new(NoopRemote);
        let downloads = Arc::new(DownloadManager::new(1, 4, state.clone(), cache.clone(), remote.clone(), clock.clone(), RetryConfig::default()));
        let uploads = Arc::new(UploadManager::new(1, 4, state.clone(), cache.clone(), remote.clone(), clock.clone(), RetryConfig::default()));
        let delta = Arc::new(DeltaEngine::new(
            state,
            cache,
            remote,
            clock.clone(),
            downloads.clone(),
            uploads.clone(),
            ConflictStrategy::KeepBoth,
            std::time::Duration::from_secs(3600),
        ));
        Arc::new(Telemetry::new(downloads, uploads, delta, clock))
    }

    #[test]
    fn sweep_evicts_expired_content_and_samples_activity() {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(ContentCache::open(dir.path().to_path_buf(), 0, 0, clock.clone()).unwrap());
        let id = ItemId::new("f1");
        cache.insert(&id, b"stale").unwrap();

        let telemetry = telemetry_harness(cache.clone(), clock);
        let cleanup = CacheCleanup::new(cache.clone(), telemetry.clone(), 0);

        // ttl_seconds = 0 disables eviction.
        assert_eq!(cleanup.sweep(), 0);
        assert!(cache.has_content(&id));

        let cleanup = CacheCleanup::new(cache.clone(), telemetry, 1_000_000);
        assert_eq!(cleanup.sweep(), 0, "nothing is old enough to expire under a generous ttl");
        assert!(cache.has_content(&id));
    }
}
