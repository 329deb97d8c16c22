use std::sync::Arc;

use cloudsync_types::Clock;
use cloudsync_types::ContentHash;
use cloudsync_types::CoreError;
use cloudsync_types::CoreResult;
use cloudsync_types::ETag;
use cloudsync_types::Entry;
use cloudsync_types::ItemId;
use cloudsync_types::ItemState;
use cloudsync_types::LastError;

use crate::store::MetadataStore;

/// What kind of transfer event a transition's metadata should be attached
/// to, per spec §4.2 (`with_hydration_event` vs `with_upload_event`).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EventKind {
    Hydration,
    Upload,
}

/// Options accepted by `StateManager::transition`, mirroring spec §4.2's
/// option list verbatim.
#[derive(Default)]
pub struct TransitionOptions {
    pub event_kind: Option<EventKind>,
    pub worker_id: Option<String>,
    pub transition_error: Option<(String, bool)>,
    pub content_hash: Option<ContentHash>,
    pub etag: Option<ETag>,
    pub size: Option<u64>,
    pub force: bool,
    pub clear_pending_remote: bool,
}

impl TransitionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hydration_event(mut self) -> Self {
        self.event_kind = Some(EventKind::Hydration);
        self
    }

    pub fn with_upload_event(mut self) -> Self {
        self.event_kind = Some(EventKind::Upload);
        self
    }

    pub fn with_worker(mut self, id: impl Into<String>) -> Self {
        self.worker_id = Some(id.into());
        self
    }

    pub fn with_transition_error(mut self, message: impl Into<String>, temporary: bool) -> Self {
        self.transition_error = Some((message.into(), temporary));
        self
    }

    pub fn with_content_hash(mut self, hash: ContentHash) -> Self {
        self.content_hash = Some(hash);
        self
    }

    pub fn with_etag(mut self, etag: ETag) -> Self {
        self.etag = Some(etag);
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn force(mut self) -> Self {
        self.force = true;
        self
    }

    pub fn clear_pending_remote(mut self) -> Self {
        self.clear_pending_remote = true;
        self
    }
}

/// Single entry point enforcing the allowed transitions of spec §3.3,
/// stamping timestamps, worker ids, and error snapshots (spec §4.2). All
/// `Entry::state` mutation in the system is required to pass through here.
pub struct StateManager {
    store: Arc<MetadataStore>,
    clock: Arc<dyn Clock>,
}

impl StateManager {
    pub fn new(store: Arc<MetadataStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn store(&self) -> &Arc<MetadataStore> {
        &self.store
    }

    pub fn transition(
        &self,
        id: &ItemId,
        target: ItemState,
        opts: TransitionOptions,
    ) -> CoreResult<Entry> {
        let now = self.clock.now();
        self.store.update(id, |entry| {
            let current = entry.state;

            if current == target && !opts.force {
                // No-op re-entry, except worker-id dedup below still needs
                // handling for HYDRATING/UPLOADING re-events with a
                // different worker id (spec §4.2 "Worker deduplication").
                if current == ItemState::Hydrating || current == ItemState::DirtyLocal {
                    dedup_worker(entry, &opts);
                }
                return Ok(());
            }

            if !opts.force && !current.allows(target) {
                return Err(CoreError::InvalidTransition {
                    id: id.clone(),
                    from: format!("{current:?}"),
                    to: format!("{target:?}"),
                });
            }
            if current == ItemState::Virtual && !opts.force {
                return Err(CoreError::InvalidTransition {
                    id: id.clone(),
                    from: "Virtual".into(),
                    to: format!("{target:?}"),
                });
            }

            entry.state = target;
            entry.updated_at = now;

            match target {
                ItemState::Hydrating => {
                    entry.hydration.worker_id = opts.worker_id.clone().unwrap_or_default();
                    entry.hydration.started_at = Some(now);
                    entry.hydration.completed_at = None;
                }
                ItemState::Hydrated => {
                    entry.hydration.completed_at = Some(now);
                    entry.last_hydrated = Some(now);
                    if let Some(hash) = &opts.content_hash {
                        entry.content_hash = hash.clone();
                    }
                    if let Some(etag) = &opts.etag {
                        entry.etag = etag.clone();
                    }
                    if let Some(size) = opts.size {
                        entry.size = size;
                    }
                    entry.last_error = None;
                    entry.hydration.error = None;
                    entry.upload.completed_at = Some(now);
                    if opts.clear_pending_remote {
                        entry.pending_remote = false;
                    }
                }
                ItemState::Error => {
                    let (message, temporary) = opts
                        .transition_error
                        .clone()
                        .unwrap_or_else(|| ("unspecified error".into(), false));
                    let err = LastError {
                        message,
                        occurred_at: now,
                        temporary,
                    };
                    match opts.event_kind {
                        Some(EventKind::Upload) => entry.upload.error = Some(err.clone()),
                        _ => entry.hydration.error = Some(err.clone()),
                    }
                    entry.last_error = Some(err);
                    match opts.event_kind {
                        Some(EventKind::Upload) => entry.upload.completed_at = Some(now),
                        _ => entry.hydration.completed_at = Some(now),
                    }
                }
                ItemState::Deleted => {
                    entry.children.clear();
                    entry.subdir_count = 0;
                    entry.last_hydrated = None;
                    entry.last_uploaded = None;
                }
                ItemState::DirtyLocal => {
                    entry.upload.worker_id = opts.worker_id.clone().unwrap_or_default();
                }
                ItemState::Conflict => {
                    if let Some((message, temporary)) = &opts.transition_error {
                        entry.last_error = Some(LastError {
                            message: message.clone(),
                            occurred_at: now,
                            temporary: *temporary,
                        });
                    }
                }
                ItemState::Ghost | ItemState::Virtual => {}
            }

            Ok(())
        })
    }
}

/// Spec §4.2: "if current state = HYDRATING (or UPLOADING analog) and an
/// event requests the same state with a *different* worker_id, the
/// existing worker_id is retained and the call is treated as idempotent."
fn dedup_worker(entry: &mut Entry, opts: &TransitionOptions) {
    let (existing, incoming) = match entry.state {
        ItemState::Hydrating => (&mut entry.hydration.worker_id, &opts.worker_id),
        ItemState::DirtyLocal => (&mut entry.upload.worker_id, &opts.worker_id),
        _ => return,
    };
    if existing.is_empty() {
        if let Some(id) = incoming {
            *existing = id.clone();
        }
    }
    // Otherwise: existing worker id wins, call is a no-op.
}
