use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;

use cloudsync_cache::ContentCache;
use cloudsync_metadata::StateManager;
use cloudsync_metadata::TransitionOptions;
use cloudsync_transfer::UploadManager;
use cloudsync_transfer::UploadPriority;
use cloudsync_types::Clock;
use cloudsync_types::CoreResult;
use cloudsync_types::DriveItem;
use cloudsync_types::Entry;
use cloudsync_types::ItemId;
use cloudsync_types::ItemState;

/// Policy applied once an item reaches `CONFLICT` (spec §4.7).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    LocalWins,
    RemoteWins,
    KeepBoth,
}

/// Applies one of the three conflict strategies to a `CONFLICT` entry,
/// given the remote snapshot that caused the conflict. Never itself
/// produces a conflicting entry: `KeepBoth`'s sibling copy is always a
/// plain `HYDRATED` entry seeded straight from the remote side.
pub struct ConflictResolver {
    state: Arc<StateManager>,
    cache: Arc<ContentCache>,
    clock: Arc<dyn Clock>,
}

impl ConflictResolver {
    pub fn new(state: Arc<StateManager>, cache: Arc<ContentCache>, clock: Arc<dyn Clock>) -> Self {
        Self { state, cache, clock }
    }

    pub fn resolve(
        &self,
        id: &ItemId,
        remote: &DriveItem,
        strategy: ConflictStrategy,
        uploads: &UploadManager,
    ) -> CoreResult<()> {
        match strategy {
            ConflictStrategy::LocalWins => self.resolve_local_wins(id, remote, uploads),
            ConflictStrategy::RemoteWins => self.resolve_remote_wins(id, remote),
            ConflictStrategy::KeepBoth => self.resolve_keep_both(id, remote, uploads),
        }
    }

    /// Server state is ignored; the local upload is retried against the new
    /// remote etag as its baseline.
    fn resolve_local_wins(&self, id: &ItemId, remote: &DriveItem, uploads: &UploadManager) -> CoreResult<()> {
        self.state.store().update(id, |e| {
            e.etag = remote.etag.clone();
            Ok(())
        })?;
        self.state.transition(id, ItemState::DirtyLocal, TransitionOptions::new().force())?;
        uploads.queue(id.clone(), UploadPriority::High)
    }

    /// Local bytes are dropped; the item becomes `GHOST` and rehydrates on
    /// next access.
    fn resolve_remote_wins(&self, id: &ItemId, remote: &DriveItem) -> CoreResult<()> {
        self.state.store().update(id, |e| {
            e.etag = remote.etag.clone();
            e.size = remote.size;
            Ok(())
        })?;
        self.state.transition(id, ItemState::Ghost, TransitionOptions::new().force())?;
        self.cache.delete(id)?;
        Ok(())
    }

    /// The remote version is materialized into a new sibling entry; the
    /// local entry stays `DIRTY_LOCAL` and is re-queued with the new
    /// baseline etag. Both are visible to the user.
    fn resolve_keep_both(&self, id: &ItemId, remote: &DriveItem, uploads: &UploadManager) -> CoreResult<()> {
        let local = self.state.store().get(id)?;
        let now = self.clock.now();
        let copy_id = ItemId::new_local();
        let copy_name = format!("{} (conflict copy {now})", local.name);
        let mut copy = Entry::new_file(copy_id.clone(), local.parent_id.clone(), copy_name, now);
        copy.state = ItemState::Hydrated;
        copy.etag = remote.etag.clone();
        copy.size = remote.size;
        copy.remote_id = remote.id.clone();
        self.state.store().save(&copy)?;
        self.state.store().add_child(&local.parent_id, &copy)?;

        self.state.store().update(id, |e| {
            e.etag = remote.etag.clone();
            Ok(())
        })?;
        self.state.transition(id, ItemState::DirtyLocal, TransitionOptions::new().force())?;
        uploads.queue(id.clone(), UploadPriority::High)
    }
}

#[cfg(test)]
mod tests {
    use cloudsync_cache::ContentCache;
    use cloudsync_metadata::MetadataStore;
    use cloudsync_types::DriveItemKind;
    use cloudsync_types::ETag;
    use cloudsync_types::SystemClock;

    use super::*;

    fn harness() -> (Arc<StateManager>, Arc<ContentCache>) {
        let store = Arc::new(MetadataStore::open_in_memory().unwrap());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let state = Arc::new(StateManager::new(store, clock.clone()));
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(ContentCache::open(dir.path().to_path_buf(), 0, 0, clock).unwrap());
        (state, cache)
    }

    fn remote_item(id: &ItemId, etag: &str) -> DriveItem {
        DriveItem {
            id: id.clone(),
            name: "f".into(),
            size: 10,
            etag: ETag::new(etag),
            parent_id: ItemId::new("root"),
            mod_time: 0,
            kind: DriveItemKind::File { quickxor_hash: cloudsync_types::ContentHash::empty() },
        }
    }

    #[test]
    fn remote_wins_drops_local_edit_and_returns_to_ghost() {
        let (state, cache) = harness();
        let mut f = Entry::new_file(ItemId::new("f1"), ItemId::new("root"), "f".into(), 0);
        f.state = ItemState::Conflict;
        f.etag = ETag::new("e1");
        state.store().save(&f).unwrap();
        cache.insert(&f.id, b"stale").unwrap();

        let resolver = ConflictResolver::new(state.clone(), cache.clone(), Arc::new(SystemClock));
        let uploads_store = Arc::new(MetadataStore::open_in_memory().unwrap());
        let _ = uploads_store; // not exercised on this path

        let item = remote_item(&f.id, "e2");
        resolver.resolve_remote_wins(&f.id, &item).unwrap();
        let updated = state.store().get(&f.id).unwrap();
        assert_eq!(updated.state, ItemState::Ghost);
        assert_eq!(updated.etag.as_str(), "e2");
        assert!(!cache.has_content(&f.id));
    }

    #[test]
    fn keep_both_creates_a_hydrated_sibling_and_requeues_local_as_dirty() {
        let (state, cache) = harness();
        let mut f = Entry::new_file(ItemId::new("f1"), ItemId::new("root"), "f".into(), 0);
        f.state = ItemState::Conflict;
        f.etag = ETag::new("e1");
        state.store().save(&f).unwrap();
        let root = Entry::new_directory(ItemId::new("root"), ItemId::empty(), String::new(), 0);
        state.store().save(&root).unwrap();
        state.store().add_child(&root.id, &f).unwrap();

        let remote: Arc<dyn cloudsync_types::RemoteClient> = Arc::new(NoopRemote);
        let uploads = UploadManager::new(
            1,
            4,
            state.clone(),
            cache.clone(),
            remote,
            Arc::new(SystemClock),
            cloudsync_transfer::RetryConfig::default(),
        );
        let resolver = ConflictResolver::new(state.clone(), cache, Arc::new(SystemClock));

        let item = remote_item(&f.id, "e2");
        resolver.resolve(&f.id, &item, ConflictStrategy::KeepBoth, &uploads).unwrap();
        uploads.stop(std::time::Duration::from_secs(5));

        let updated = state.store().get(&f.id).unwrap();
        assert_eq!(updated.state, ItemState::DirtyLocal);
        assert_eq!(updated.etag.as_str(), "e2");

        let parent = state.store().get(&root.id).unwrap();
        assert_eq!(parent.children.len(), 2);
        let copy_id = parent.children.iter().find(|c| *c != &f.id).unwrap();
        let copy = state.store().get(copy_id).unwrap();
        assert_eq!(copy.state, ItemState::Hydrated);
        assert!(copy.name.contains("conflict copy"));
    }

    struct NoopRemote;
    #[async_trait::async_trait]
    impl cloudsync_types::RemoteClient for NoopRemote {
        async fn get_item(&self, id: &ItemId) -> CoreResult<DriveItem> {
            Ok(remote_item(id, "e2"))
        }
        async fn get_content(&self, _id: &ItemId, _range: Option<(u64, u64)>) -> CoreResult<cloudsync_types::ContentStream> {
            Ok(cloudsync_types::ContentStream {
                bytes: bytes::Bytes::new(),
                total_size: 0,
                etag: ETag::empty(),
            })
        }
        async fn put_content(&self, id: &ItemId, _bytes: bytes::Bytes, _if_match_etag: Option<&ETag>) -> CoreResult<DriveItem> {
            Ok(remote_item(id, "e3"))
        }
        async fn create_upload_session(&self, _id: &ItemId) -> CoreResult<String> {
            Ok(String::new())
        }
        async fn put_chunk(
            &self,
            _upload_url: &str,
            _range: (u64, u64),
            _total_size: u64,
            _bytes: bytes::Bytes,
        ) -> CoreResult<Result<cloudsync_types::ChunkAck, DriveItem>> {
            Ok(Err(remote_item(&ItemId::new("f1"), "e3")))
        }
        async fn remove(&self, _id: &ItemId) -> CoreResult<()> {
            Ok(())
        }
        async fn delta(&self, _cursor: Option<String>) -> CoreResult<cloudsync_types::DeltaPage> {
            Ok(cloudsync_types::DeltaPage { changes: Vec::new(), next_cursor: None })
        }
    }
}
