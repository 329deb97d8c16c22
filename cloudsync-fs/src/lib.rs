//! POSIX operation surface, bootstrap/recovery, telemetry, cache cleanup,
//! and configuration: the crate an out-of-scope kernel bridge links
//! against.

mod bootstrap;
mod cleanup;
mod config;
mod fsops;
mod name;
mod telemetry;

use std::sync::Arc;

use cloudsync_cache::ContentCache;
use cloudsync_metadata::MetadataStore;
use cloudsync_metadata::StateManager;
use cloudsync_metadata::TransitionOptions;
use cloudsync_sync::ChangeTrigger;
use cloudsync_sync::DeltaEngine;
use cloudsync_transfer::DownloadManager;
use cloudsync_transfer::UploadManager;
use cloudsync_types::Clock;
use cloudsync_types::RemoteClient;
use cloudsync_types::SystemClock;

pub use bootstrap::BootstrapReport;
pub use cleanup::CacheCleanup;
pub use config::Config;
pub use fsops::FileAttr;
pub use fsops::FsOps;
pub use fsops::Filesystem;
pub use fsops::DEFAULT_FS_TIMEOUT;
pub use telemetry::Telemetry;
pub use telemetry::TelemetrySnapshot;

/// A fully wired core instance: the `FsOps` surface plus the background
/// subsystems (delta reconciliation, telemetry, cache cleanup) a host binds
/// to its own lifecycle. Built by [`Core::open`], which implements
/// SPEC_FULL §4.9's bootstrap sequence end to end.
pub struct Core {
    pub fs: Arc<Filesystem>,
    pub delta: Arc<DeltaEngine>,
    pub telemetry: Arc<Telemetry>,
    pub cache_cleanup: Arc<CacheCleanup>,
    pub change_trigger: ChangeTrigger,
    pub bootstrap_report: BootstrapReport,
}

impl Core {
    /// Opens the catalog and content cache at `config.cache_dir`, recovers
    /// any journaled sessions from a prior run, and returns a ready-to-use
    /// `Filesystem` plus the `DeltaEngine`/`CacheCleanup` a host should
    /// drive via `tokio::spawn(delta.run(...))` and
    /// `tokio::spawn(cache_cleanup.run(...))`.
    pub fn open(config: Config, remote: Arc<dyn RemoteClient>) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.cache_dir)?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let store = Arc::new(MetadataStore::open(&config.metadata_db_path())?);
        let state = Arc::new(StateManager::new(store.clone(), clock.clone()));
        let cache = Arc::new(ContentCache::open(config.cache_dir.clone(), config.cache_size_bytes, 0, clock.clone())?);

        let retry = config.retry_config();
        let downloads = Arc::new(DownloadManager::new(
            config.download_workers,
            config.download_queue_depth,
            state.clone(),
            cache.clone(),
            remote.clone(),
            clock.clone(),
            retry.clone(),
        ));
        let uploads = Arc::new(UploadManager::new(
            config.upload_workers,
            config.upload_queue_depth,
            state.clone(),
            cache.clone(),
            remote.clone(),
            clock.clone(),
            retry,
        ));

        cache.set_eviction_guard({
            let state = state.clone();
            move |id| match state.store().try_get(id) {
                Ok(Some(entry)) => {
                    !entry.pin.is_always()
                        && !matches!(
                            entry.state,
                            cloudsync_types::ItemState::Hydrating
                                | cloudsync_types::ItemState::DirtyLocal
                                | cloudsync_types::ItemState::Conflict
                        )
                }
                _ => true,
            }
        });
        cache.set_eviction_handler({
            let state = state.clone();
            move |id| {
                if let Err(e) = state.transition(id, cloudsync_types::ItemState::Ghost, TransitionOptions::new()) {
                    tracing::warn!(id = %id.as_str(), error = %e, "failed to mark evicted entry as ghost");
                }
            }
        });

        let bootstrap_report = bootstrap::run(&store, &downloads, &uploads)?;

        let delta = Arc::new(DeltaEngine::new(
            state.clone(),
            cache.clone(),
            remote.clone(),
            clock.clone(),
            downloads.clone(),
            uploads.clone(),
            config.conflict_strategy,
            config.fallback_poll_interval(),
        ));
        let (change_trigger, _rx) = ChangeTrigger::new();

        let telemetry = Arc::new(Telemetry::new(downloads.clone(), uploads.clone(), delta.clone(), clock.clone()));
        let cache_cleanup = Arc::new(CacheCleanup::new(cache.clone(), telemetry.clone(), config.cache_ttl_seconds));
        let fs = Arc::new(Filesystem::new(state, cache, remote, downloads, uploads, clock, config));

        Ok(Self { fs, delta, telemetry, cache_cleanup, change_trigger, bootstrap_report })
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use bytes::Bytes;
    use cloudsync_types::ChunkAck;
    use cloudsync_types::ContentStream;
    use cloudsync_types::CoreResult;
    use cloudsync_types::DeltaPage;
    use cloudsync_types::DriveItem;
    use cloudsync_types::DriveItemKind;
    use cloudsync_types::ETag;
    use cloudsync_types::ItemId;

    use super::*;

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
        async fn delta(&self, _cursor: Option<String>) -> CoreResult<DeltaPage> {
            Ok(DeltaPage { changes: Vec::new(), next_cursor: None })
        }
    }

    #[test]
    fn core_open_bootstraps_an_empty_catalog_with_no_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.cache_dir = dir.path().to_path_buf();
        config.download_workers = 1;
        config.upload_workers = 1;

        let remote: Arc<dyn RemoteClient> = Arc::new(NoopRemote);
        let core = Core::open(config, remote).unwrap();
        assert!(!core.bootstrap_report.cursor_present);
        assert_eq!(core.telemetry.snapshot().delta_pages_applied, 0);
    }
}
