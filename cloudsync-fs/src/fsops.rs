use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Builder;
use tokio::runtime::Runtime;

use cloudsync_cache::ContentCache;
use cloudsync_metadata::StateManager;
use cloudsync_metadata::TransitionOptions;
use cloudsync_transfer::DownloadManager;
use cloudsync_transfer::UploadManager;
use cloudsync_transfer::UploadPriority;
use cloudsync_types::Clock;
use cloudsync_types::ContentHash;
use cloudsync_types::CoreError;
use cloudsync_types::CoreResult;
use cloudsync_types::Entry;
use cloudsync_types::ItemId;
use cloudsync_types::ItemState;
use cloudsync_types::ItemType;
use cloudsync_types::RemoteClient;
use cloudsync_types::S_IFDIR;
use cloudsync_types::S_IFREG;

use crate::config::Config;
use crate::name;

/// Attribute/entry cache timeout handed back on every `FsOps` result (spec
/// §6.1's "default `timeout` constant `DEFAULT_FS_TIMEOUT`").
pub const DEFAULT_FS_TIMEOUT: Duration = Duration::from_secs(60);

/// Polling granularity of `open`'s blocking wait on a download it just
/// enqueued (spec §5 suspension points: "Download `wait(id)` polls until
/// Completed or Errored, ~100ms granularity").
const OPEN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// The subset of `Entry` a kernel bridge needs for a `getattr` reply (spec
/// §4.8).
#[derive(Clone, Copy, Debug)]
pub struct FileAttr {
    pub size: u64,
    pub mode: u32,
    pub mtime: i64,
    pub nlink: u32,
}

impl From<&Entry> for FileAttr {
    fn from(e: &Entry) -> Self {
        Self { size: e.size, mode: e.mode, mtime: e.mtime(), nlink: e.nlink() }
    }
}

/// POSIX operation handlers (spec §4.8). Exact wire marshalling is a bridge
/// concern; every method here describes a contract, not a kernel message.
pub trait FsOps: Send + Sync {
    fn lookup(&self, parent: &ItemId, name: &str) -> CoreResult<Entry>;
    fn getattr(&self, id: &ItemId) -> CoreResult<FileAttr>;
    fn mknod(&self, parent: &ItemId, name: &str, mode: u32) -> CoreResult<Entry>;
    fn mkdir(&self, parent: &ItemId, name: &str, mode: u32) -> CoreResult<Entry>;
    fn open(&self, id: &ItemId) -> CoreResult<()>;
    fn read(&self, id: &ItemId, offset: u64, len: usize) -> CoreResult<Vec<u8>>;
    fn write(&self, id: &ItemId, offset: u64, bytes: &[u8]) -> CoreResult<usize>;
    fn flush(&self, id: &ItemId) -> CoreResult<()>;
    fn fsync(&self, id: &ItemId) -> CoreResult<()>;
    fn unlink(&self, parent: &ItemId, name: &str) -> CoreResult<()>;
    fn rename(&self, src_parent: &ItemId, src_name: &str, dst_parent: &ItemId, dst_name: &str) -> CoreResult<()>;
}

/// Glues `MetadataStore`/`StateManager`, `ContentCache`, the transfer
/// managers, and the `RemoteClient` behind the `FsOps` surface. One
/// instance is shared across every kernel bridge thread; all state it owns
/// beyond those components is the in-memory "has pending local writes" set
/// (spec §4.8 `write`: "marks hasChanges"), since that flag is cheap to
/// lose on a crash and is not part of the persisted `Entry` schema.
pub struct Filesystem {
    state: Arc<StateManager>,
    cache: Arc<ContentCache>,
    remote: Arc<dyn RemoteClient>,
    downloads: Arc<DownloadManager>,
    uploads: Arc<UploadManager>,
    clock: Arc<dyn Clock>,
    config: Config,
    rt: Runtime,
    dirty: Mutex<HashSet<ItemId>>,
    offline: AtomicBool,
}

impl Filesystem {
    pub fn new(
        state: Arc<StateManager>,
        cache: Arc<ContentCache>,
        remote: Arc<dyn RemoteClient>,
        downloads: Arc<DownloadManager>,
        uploads: Arc<UploadManager>,
        clock: Arc<dyn Clock>,
        config: Config,
    ) -> Self {
        let rt = Builder::new_current_thread().enable_all().build().expect("build fsops runtime");
        Self {
            state,
            cache,
            remote,
            downloads,
            uploads,
            clock,
            config,
            rt,
            dirty: Mutex::new(HashSet::new()),
            offline: AtomicBool::new(false),
        }
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    fn find_child(&self, parent: &ItemId, name: &str) -> CoreResult<Entry> {
        let parent_entry = self.state.store().get(parent)?;
        for child_id in &parent_entry.children {
            if let Some(child) = self.state.store().try_get(child_id)? {
                if child.name == name {
                    return Ok(child);
                }
            }
        }
        Err(CoreError::NotFound(format!("{name} in {parent}")))
    }

    fn create_entry(&self, parent: &ItemId, name: &str, mode: u32, item_type: ItemType) -> CoreResult<Entry> {
        name::validate(name, &self.config.name_denylist)?;
        let parent_entry = self.state.store().get(parent)?;

        let now = self.clock.now();
        let id = ItemId::new_local();
        let mut entry = match item_type {
            ItemType::File => Entry::new_file(id.clone(), parent.clone(), name.to_string(), now),
            ItemType::Directory => Entry::new_directory(id.clone(), parent.clone(), name.to_string(), now),
        };
        // New local entries have no remote counterpart yet; DIRTY_LOCAL is
        // reached, forced, the first time their content is flushed (spec
        // §4.8 mknod/mkdir: "virtual until remote confirms").
        entry.state = ItemState::Virtual;
        entry.virtual_item = true;
        entry.pending_remote = parent_entry.remote_id.is_empty();
        entry.mode = match item_type {
            ItemType::File => S_IFREG | (mode & 0o7777),
            ItemType::Directory => S_IFDIR | (mode & 0o7777),
        };
        self.state.store().save(&entry)?;
        self.state.store().add_child(parent, &entry)?;
        if item_type == ItemType::File {
            self.cache.open_handle(&id)?;
        }
        Ok(entry)
    }
}

impl FsOps for Filesystem {
    fn lookup(&self, parent: &ItemId, name: &str) -> CoreResult<Entry> {
        self.find_child(parent, name)
    }

    fn getattr(&self, id: &ItemId) -> CoreResult<FileAttr> {
        Ok(FileAttr::from(&self.state.store().get(id)?))
    }

    fn mknod(&self, parent: &ItemId, name: &str, mode: u32) -> CoreResult<Entry> {
        self.create_entry(parent, name, mode, ItemType::File)
    }

    fn mkdir(&self, parent: &ItemId, name: &str, mode: u32) -> CoreResult<Entry> {
        self.create_entry(parent, name, mode, ItemType::Directory)
    }

    /// Directories never block (spec §4.8): their content is the children
    /// list already resident in the catalog. Files block until the
    /// download this call enqueues reaches a terminal state, unless cached
    /// bytes already validate against `content_hash`, or the core is
    /// offline and configured to serve stale cached bytes anyway.
    fn open(&self, id: &ItemId) -> CoreResult<()> {
        let entry = self.state.store().get(id)?;
        if entry.item_type == ItemType::Directory {
            return Ok(());
        }

        let offline = self.is_offline();
        if let Some(bytes) = self.cache.get(id)? {
            if ContentHash::of(&bytes) == entry.content_hash {
                return Ok(());
            }
            if offline && self.config.offline_mode_allow_cached_stale {
                return Ok(());
            }
            if offline {
                return Err(CoreError::Transient(format!("{id} is offline with only stale cached content")));
            }
        } else if offline {
            return Err(CoreError::NotFound(format!("{id} has no cached content and the core is offline")));
        }

        self.downloads.queue(id.clone())?;
        loop {
            let refreshed = self.state.store().get(id)?;
            match refreshed.state {
                ItemState::Hydrated => return Ok(()),
                ItemState::Error => {
                    let message = refreshed
                        .last_error
                        .map(|e| e.message)
                        .unwrap_or_else(|| "download failed".to_string());
                    return Err(CoreError::Transient(message));
                }
                _ => std::thread::sleep(OPEN_POLL_INTERVAL),
            }
        }
    }

    fn read(&self, id: &ItemId, offset: u64, len: usize) -> CoreResult<Vec<u8>> {
        let mut handle = self.cache.open_read_only(id)?;
        handle.read_at(offset, len)
    }

    fn write(&self, id: &ItemId, offset: u64, bytes: &[u8]) -> CoreResult<usize> {
        let mut handle = self.cache.open_handle(id)?;
        let written = handle.write_at(offset, bytes)?;
        let new_len = handle.len()?;
        self.cache.note_size(id, new_len);
        self.state.store().update(id, |e| {
            if new_len > e.size {
                e.size = new_len;
            }
            Ok(())
        })?;
        self.dirty.lock().insert(id.clone());
        Ok(written)
    }

    /// Recomputes `content_hash` from whatever is in the cache slot and
    /// queues a High-priority upload. Returns without waiting for the
    /// upload to land (spec §4.8: "Returns without awaiting the upload").
    fn flush(&self, id: &ItemId) -> CoreResult<()> {
        if !self.dirty.lock().remove(id) {
            return Ok(());
        }
        let bytes = self.cache.get(id)?.unwrap_or_default();
        let hash = ContentHash::of(&bytes);
        let entry = self.state.store().update(id, |e| {
            e.content_hash = hash.clone();
            Ok(())
        })?;

        let opts = if entry.state == ItemState::Virtual {
            TransitionOptions::new().force()
        } else {
            TransitionOptions::new()
        };
        self.state.transition(id, ItemState::DirtyLocal, opts)?;
        self.uploads.queue(id.clone(), UploadPriority::High)
    }

    fn fsync(&self, id: &ItemId) -> CoreResult<()> {
        {
            let mut handle = self.cache.open_handle(id)?;
            handle.sync()?;
        }
        self.flush(id)
    }

    fn unlink(&self, parent: &ItemId, name: &str) -> CoreResult<()> {
        let child = self.find_child(parent, name)?;
        let was_dir = child.item_type == ItemType::Directory;

        if !child.remote_id.is_empty() {
            let remote = self.remote.clone();
            let remote_id = child.remote_id.clone();
            self.rt.block_on(async move { remote.remove(&remote_id).await })?;
        }

        self.state.transition(&child.id, ItemState::Deleted, TransitionOptions::new().force())?;
        self.state.store().remove_child(parent, &child.id, was_dir)?;
        self.cache.delete(&child.id)?;
        self.state.store().delete_row(&child.id)?;
        self.dirty.lock().remove(&child.id);
        Ok(())
    }

    /// Updates the local catalog only. `RemoteClient` has no move/rename
    /// primitive (spec §6.2 lists `get_item`/`get_content`/`put_content`/
    /// `create_upload_session`/`put_chunk`/`remove`/`delta`), so a
    /// server-side rename rides along on the next upload for files; a bare
    /// directory rename with a confirmed remote id is reconciled the next
    /// time the delta feed reports the move.
    fn rename(&self, src_parent: &ItemId, src_name: &str, dst_parent: &ItemId, dst_name: &str) -> CoreResult<()> {
        name::validate(dst_name, &self.config.name_denylist)?;
        let child = self.find_child(src_parent, src_name)?;
        let was_dir = child.item_type == ItemType::Directory;
        let cross_directory = src_parent != dst_parent;

        if cross_directory {
            self.state.store().remove_child(src_parent, &child.id, was_dir)?;
        }
        self.state.store().update(&child.id, |e| {
            e.parent_id = dst_parent.clone();
            e.name = dst_name.to_string();
            Ok(())
        })?;
        if cross_directory {
            let updated = self.state.store().get(&child.id)?;
            self.state.store().add_child(dst_parent, &updated)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use bytes::Bytes;
    use cloudsync_metadata::MetadataStore;
    use cloudsync_types::ChunkAck;
    use cloudsync_types::ContentStream;
    use cloudsync_types::CoreResult as Res;
    use cloudsync_types::DeltaPage;
    use cloudsync_types::DriveItem;
    use cloudsync_types::DriveItemKind;
    use cloudsync_types::ETag;
    use cloudsync_types::SystemClock;
    use cloudsync_transfer::RetryConfig;

    use super::*;

    struct StubRemote;
    #[async_trait]
    impl RemoteClient for StubRemote {
        async fn get_item(&self, id: &ItemId) -> Res<DriveItem> {
            Ok(DriveItem {
                id: id.clone(),
                name: "f".into(),
                size: 6,
                etag: ETag::new("e2"),
                parent_id: ItemId::new("root"),
                mod_time: 0,
                kind: DriveItemKind::File { quickxor_hash: ContentHash::empty() },
            })
        }
        async fn get_content(&self, _id: &ItemId, _range: Option<(u64, u64)>) -> Res<ContentStream> {
            Ok(ContentStream { bytes: Bytes::from_static(b"abcdef"), total_size: 6, etag: ETag::new("e2") })
        }
        async fn put_content(&self, id: &ItemId, _bytes: Bytes, _if_match_etag: Option<&ETag>) -> Res<DriveItem> {
            self.get_item(id).await
        }
        async fn create_upload_session(&self, _id: &ItemId) -> Res<String> {
            unimplemented!()
        }
        async fn put_chunk(&self, _upload_url: &str, _range: (u64, u64), _total_size: u64, _bytes: Bytes) -> Res<Result<ChunkAck, DriveItem>> {
            unimplemented!()
        }
        async fn remove(&self, _id: &ItemId) -> Res<()> {
            Ok(())
        }
        async fn delta(&self, _cursor: Option<String>) -> Res<DeltaPage> {
            Ok(DeltaPage { changes: Vec::new(), next_cursor: None })
        }
    }

    fn harness() -> (Filesystem, Arc<StateManager>, ItemId) {
        let store = Arc::new(MetadataStore::open_in_memory().unwrap());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let state = Arc::new(StateManager::new(store.clone(), clock.clone()));
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(ContentCache::open(dir.path().to_path_buf(), 0, 0, clock.clone()).unwrap());
        let remote: Arc<dyn RemoteClient> = Arc::new(StubRemote);
        let downloads = Arc::new(DownloadManager::new(1, 4, state.clone(), cache.clone(), remote.clone(), clock.clone(), RetryConfig::default()));
        let uploads = Arc::new(UploadManager::new(1, 4, state.clone(), cache.clone(), remote.clone(), clock.clone(), RetryConfig::default()));

        let root = Entry::new_directory(ItemId::new("root"), ItemId::empty(), String::new(), 0);
        state.store().save(&root).unwrap();

        let fs = Filesystem::new(state.clone(), cache, remote, downloads, uploads, clock, Config::default());
        (fs, state, root.id)
    }

    #[test]
    fn mknod_creates_a_virtual_entry_pending_remote() {
        let (fs, state, root) = harness();
        let entry = fs.mknod(&root, "new.txt", 0o644).unwrap();
        assert_eq!(entry.state, ItemState::Virtual);
        assert!(entry.pending_remote);
        let parent = state.store().get(&root).unwrap();
        assert_eq!(parent.children, vec![entry.id]);
    }

    #[test]
    fn mknod_rejects_a_denylisted_name() {
        let (fs, _state, root) = harness();
        assert!(fs.mknod(&root, "CON", 0o644).is_err());
    }

    #[test]
    fn write_then_flush_marks_dirty_local_and_queues_upload() {
        let (fs, state, root) = harness();
        let entry = fs.mknod(&root, "new.txt", 0o644).unwrap();
        fs.write(&entry.id, 0, b"hello!").unwrap();
        fs.flush(&entry.id).unwrap();

        let updated = state.store().get(&entry.id).unwrap();
        assert_eq!(updated.state, ItemState::DirtyLocal);
        assert_eq!(updated.size, 6);
    }

    #[test]
    fn open_on_a_ghost_file_blocks_until_hydrated() {
        let (fs, state, root) = harness();
        let f = Entry::new_file(ItemId::new("f1"), root.clone(), "f".into(), 0);
        state.store().save(&f).unwrap();
        state.store().add_child(&root, &f).unwrap();

        fs.open(&f.id).unwrap();
        let updated = state.store().get(&f.id).unwrap();
        assert_eq!(updated.state, ItemState::Hydrated);
        assert_eq!(fs.read(&f.id, 0, 6).unwrap(), b"abcdef");
    }

    #[test]
    fn open_on_a_directory_never_blocks() {
        let (fs, state, root) = harness();
        let d = Entry::new_directory(ItemId::new("d1"), root.clone(), "d".into(), 0);
        state.store().save(&d).unwrap();
        state.store().add_child(&root, &d).unwrap();
        fs.open(&d.id).unwrap();
    }

    #[test]
    fn unlink_tombstones_the_entry_and_detaches_it_from_the_parent() {
        let (fs, state, root) = harness();
        let f = Entry::new_file(ItemId::new("f1"), root.clone(), "f".into(), 0);
        state.store().save(&f).unwrap();
        state.store().add_child(&root, &f).unwrap();

        fs.unlink(&root, "f").unwrap();
        let updated = state.store().get(&f.id).unwrap();
        assert_eq!(updated.state, ItemState::Deleted);
        let parent = state.store().get(&root).unwrap();
        assert!(parent.children.is_empty());
    }

    #[test]
    fn rename_within_the_same_directory_only_changes_the_name() {
        let (fs, state, root) = harness();
        let f = Entry::new_file(ItemId::new("f1"), root.clone(), "f".into(), 0);
        state.store().save(&f).unwrap();
        state.store().add_child(&root, &f).unwrap();

        fs.rename(&root, "f", &root, "g").unwrap();
        let updated = state.store().get(&f.id).unwrap();
        assert_eq!(updated.name, "g");
        let parent = state.store().get(&root).unwrap();
        assert_eq!(parent.children, vec![f.id]);
    }
}
