use std::sync::atomic::AtomicI64;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;

use cloudsync_cache::ContentCache;
use cloudsync_metadata::StateManager;
use cloudsync_metadata::TransitionOptions;
use cloudsync_transfer::DownloadManager;
use cloudsync_transfer::UploadManager;
use cloudsync_types::Clock;
use cloudsync_types::CoreResult;
use cloudsync_types::DriveItem;
use cloudsync_types::DriveItemChange;
use cloudsync_types::Entry;
use cloudsync_types::ItemId;
use cloudsync_types::ItemState;
use cloudsync_types::ItemType;
use cloudsync_types::RemoteClient;

use crate::conflict::ConflictResolver;
use crate::conflict::ConflictStrategy;

const DELTA_BUCKET: &str = "delta";
const CURSOR_KEY: &str = "deltaLink";

/// A "poll now" signal from a realtime push transport (spec §1: out of
/// scope itself, but the engine consumes it). Firing it wakes a blocked
/// `DeltaEngine::run` loop immediately instead of waiting out the fallback
/// interval.
#[derive(Clone)]
pub struct ChangeTrigger {
    tx: watch::Sender<u64>,
}

impl ChangeTrigger {
    pub fn new() -> (Self, watch::Receiver<u64>) {
        let (tx, rx) = watch::channel(0);
        (Self { tx }, rx)
    }

    pub fn fire(&self) {
        self.tx.send_modify(|v| *v = v.wrapping_add(1));
    }
}

/// Orphan children observed before their parent arrived in the feed (spec
/// §5: "children may be applied before their parent exists during delta
/// replay; the engine tolerates this by holding orphan children until the
/// parent arrives").
struct OrphanHold {
    by_parent: Mutex<std::collections::HashMap<ItemId, Vec<DriveItem>>>,
}

impl OrphanHold {
    fn new() -> Self {
        Self { by_parent: Mutex::new(std::collections::HashMap::new()) }
    }

    fn hold(&self, item: DriveItem) {
        self.by_parent.lock().entry(item.parent_id.clone()).or_default().push(item);
    }

    fn take_waiting_on(&self, parent_id: &ItemId) -> Vec<DriveItem> {
        self.by_parent.lock().remove(parent_id).unwrap_or_default()
    }

    fn unresolved_count(&self) -> usize {
        self.by_parent.lock().values().map(|v| v.len()).sum()
    }
}

/// Reconciles the local catalog with the server's change feed (spec §4.6).
/// The one async entry point in the workspace: `run()` alternates
/// `poll_once()` with a `select!` over a fallback timer and a
/// `ChangeTrigger`.
pub struct DeltaEngine {
    state: Arc<StateManager>,
    cache: Arc<ContentCache>,
    remote: Arc<dyn RemoteClient>,
    clock: Arc<dyn Clock>,
    downloads: Arc<DownloadManager>,
    uploads: Arc<UploadManager>,
    resolver: ConflictResolver,
    strategy: ConflictStrategy,
    fallback_poll_interval: Duration,
    orphans: OrphanHold,

    pub pages_applied: AtomicU64,
    pub last_poll_at: AtomicI64,
    pub conflicts_total: AtomicU64,
}

impl DeltaEngine {
    pub fn new(
        state: Arc<StateManager>,
        cache: Arc<ContentCache>,
        remote: Arc<dyn RemoteClient>,
        clock: Arc<dyn Clock>,
        downloads: Arc<DownloadManager>,
        uploads: Arc<UploadManager>,
        strategy: ConflictStrategy,
        fallback_poll_interval: Duration,
    ) -> Self {
        let resolver = ConflictResolver::new(state.clone(), cache.clone(), clock.clone());
        Self {
            state,
            cache,
            remote,
            clock,
            downloads,
            uploads,
            resolver,
            strategy,
            fallback_poll_interval,
            orphans: OrphanHold::new(),
            pages_applied: AtomicU64::new(0),
            last_poll_at: AtomicI64::new(0),
            conflicts_total: AtomicU64::new(0),
        }
    }

    fn load_cursor(&self) -> CoreResult<Option<String>> {
        self.state.store().kv_get(DELTA_BUCKET, CURSOR_KEY)
    }

    fn save_cursor(&self, cursor: &str) -> CoreResult<()> {
        self.state.store().kv_set(DELTA_BUCKET, CURSOR_KEY, cursor)
    }

    /// Applies one page of the change feed. Returns `(changes_applied,
    /// should_continue)`; `should_continue` is true when the page was
    /// non-empty, signalling there is likely more backlog worth fetching
    /// before falling back to the idle wait.
    pub async fn poll_once(&self) -> CoreResult<(usize, bool)> {
        let cursor = self.load_cursor()?;
        let page = self.remote.delta(cursor).await?;
        self.last_poll_at.store(self.clock.now(), Ordering::SeqCst);

        let applied = page.changes.len();
        for change in page.changes {
            if let Err(e) = self.apply_change(change) {
                tracing::warn!(error = %e, "delta page application failed; cursor not advanced");
                return Err(e);
            }
        }

        if let Some(cursor) = page.next_cursor {
            self.save_cursor(&cursor)?;
        }
        self.pages_applied.fetch_add(1, Ordering::SeqCst);

        if self.orphans.unresolved_count() > 0 {
            tracing::warn!(count = self.orphans.unresolved_count(), "delta page left orphaned children unresolved");
        }

        Ok((applied, applied > 0))
    }

    /// Loops `poll_once` forever, waiting on a fallback timer or an
    /// external `ChangeTrigger` between pages. Exits when `shutdown`
    /// becomes true.
    pub async fn run(&self, mut trigger: watch::Receiver<u64>, shutdown: Arc<std::sync::atomic::AtomicBool>) {
        while !shutdown.load(Ordering::SeqCst) {
            match self.poll_once().await {
                Ok((_, true)) => continue,
                Ok((_, false)) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "delta poll failed, backing off");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.fallback_poll_interval) => {}
                _ = trigger.changed() => {}
            }
        }
    }

    fn apply_change(&self, change: DriveItemChange) -> CoreResult<()> {
        match change {
            DriveItemChange::Deleted { id } => self.apply_delete(&id),
            DriveItemChange::Upserted(item) => self.apply_upsert(item),
        }
    }

    fn apply_delete(&self, id: &ItemId) -> CoreResult<()> {
        let prev = match self.state.store().try_get(id)? {
            Some(e) => e,
            None => return Ok(()),
        };

        if matches!(prev.state, ItemState::DirtyLocal | ItemState::Conflict) {
            match self.strategy {
                ConflictStrategy::RemoteWins => self.finish_delete(id, &prev),
                ConflictStrategy::LocalWins | ConflictStrategy::KeepBoth => {
                    self.conflicts_total.fetch_add(1, Ordering::SeqCst);
                    self.state.transition(
                        id,
                        ItemState::Conflict,
                        TransitionOptions::new()
                            .force()
                            .with_transition_error("remote delete while local edit pending", false),
                    )?;
                    Ok(())
                }
            }
        } else {
            self.finish_delete(id, &prev)
        }
    }

    fn finish_delete(&self, id: &ItemId, prev: &Entry) -> CoreResult<()> {
        self.state.transition(id, ItemState::Deleted, TransitionOptions::new().force())?;
        if !prev.parent_id.is_empty() {
            self.state
                .store()
                .remove_child(&prev.parent_id, id, prev.item_type == ItemType::Directory)?;
        }
        self.cache.delete(id)?;
        Ok(())
    }

    fn apply_upsert(&self, item: DriveItem) -> CoreResult<()> {
        let prev = self.state.store().try_get(&item.id)?;
        match prev {
            None => self.insert_new(item),
            Some(prev) if prev.parent_id != item.parent_id || prev.name != item.name => {
                self.apply_move(prev, item)
            }
            Some(prev) if prev.etag.as_str() != item.etag.as_str() => self.apply_etag_change(prev, item),
            Some(prev) => self.apply_same_etag(prev, item),
        }
    }

    fn insert_new(&self, item: DriveItem) -> CoreResult<()> {
        if !item.parent_id.is_empty() && self.state.store().try_get(&item.parent_id)?.is_none() {
            self.orphans.hold(item);
            return Ok(());
        }

        let now = self.clock.now();
        let mut entry = if item.is_folder() {
            Entry::new_directory(item.id.clone(), item.parent_id.clone(), item.name.clone(), now)
        } else {
            Entry::new_file(item.id.clone(), item.parent_id.clone(), item.name.clone(), now)
        };
        entry.remote_id = item.id.clone();
        entry.etag = item.etag.clone();
        entry.size = item.size;
        entry.last_modified = Some(item.mod_time);
        entry.pending_remote = false;
        self.state.store().save(&entry)?;
        if !entry.parent_id.is_empty() {
            self.state.store().add_child(&entry.parent_id, &entry)?;
        }

        for waiting in self.orphans.take_waiting_on(&entry.id) {
            self.insert_new(waiting)?;
        }
        Ok(())
    }

    fn apply_move(&self, prev: Entry, item: DriveItem) -> CoreResult<()> {
        let was_dir = prev.item_type == ItemType::Directory;
        if prev.parent_id != item.parent_id && !prev.parent_id.is_empty() {
            self.state.store().remove_child(&prev.parent_id, &prev.id, was_dir)?;
        }
        self.state.store().update(&prev.id, |e| {
            e.parent_id = item.parent_id.clone();
            e.name = item.name.clone();
            e.etag = item.etag.clone();
            e.size = item.size;
            e.last_modified = Some(item.mod_time);
            Ok(())
        })?;
        if !item.parent_id.is_empty() {
            let updated = self.state.store().get(&prev.id)?;
            self.state.store().add_child(&item.parent_id, &updated)?;
        }
        Ok(())
    }

    fn apply_etag_change(&self, prev: Entry, item: DriveItem) -> CoreResult<()> {
        if matches!(prev.state, ItemState::DirtyLocal | ItemState::Conflict) {
            self.conflicts_total.fetch_add(1, Ordering::SeqCst);
            self.state.transition(
                &prev.id,
                ItemState::Conflict,
                TransitionOptions::new()
                    .force()
                    .with_transition_error("remote etag changed while local edit pending", false),
            )?;
            self.resolver.resolve(&prev.id, &item, self.strategy, &self.uploads)?;
            return Ok(());
        }

        self.state.store().update(&prev.id, |e| {
            e.etag = item.etag.clone();
            e.size = item.size;
            e.last_modified = Some(item.mod_time);
            Ok(())
        })?;
        self.state.transition(&prev.id, ItemState::Ghost, TransitionOptions::new())?;
        self.cache.delete(&prev.id)?;

        if prev.pin.is_always() {
            self.state.transition(
                &prev.id,
                ItemState::Hydrating,
                TransitionOptions::new().with_hydration_event(),
            )?;
            self.downloads.queue(prev.id.clone())?;
        }
        Ok(())
    }

    fn apply_same_etag(&self, _prev: Entry, _item: DriveItem) -> CoreResult<()> {
        // Identical etag: GHOST stays GHOST (lazy hydration), HYDRATED has
        // no content change. Nothing to do.
        Ok(())
    }
}
