use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;

use bytes::Bytes;
use crossbeam_channel::bounded;
use crossbeam_channel::select;
use crossbeam_channel::Receiver;
use crossbeam_channel::Sender;
use crossbeam_channel::TrySendError;
use parking_lot::Mutex;
use tokio::runtime::Builder;
use tokio::time::sleep;

use cloudsync_cache::ContentCache;
use cloudsync_metadata::StateManager;
use cloudsync_metadata::TransitionOptions;
use cloudsync_types::Clock;
use cloudsync_types::CoreError;
use cloudsync_types::CoreResult;
use cloudsync_types::ETag;
use cloudsync_types::ItemId;
use cloudsync_types::ItemState;
use cloudsync_types::RemoteClient;

use crate::retry::RetryConfig;
use crate::session::SessionState;
use crate::session::UploadPriority;
use crate::session::UploadSession;
use crate::session::SMALL_UPLOAD_THRESHOLD;
use crate::session::UPLOAD_CHUNK_SIZE;

const UPLOADS_BUCKET: &str = "uploads";

struct Shared {
    state: Arc<StateManager>,
    cache: Arc<ContentCache>,
    remote: Arc<dyn RemoteClient>,
    clock: Arc<dyn Clock>,
    retry: RetryConfig,
    high_depth: AtomicU64,
    low_depth: AtomicU64,
    active: AtomicU64,
    sessions: Mutex<HashMap<ItemId, UploadSession>>,
}

/// Thread pool driving `DirtyLocal` entries back to the server (spec
/// §4.5). A `High` and a `Low` priority queue feed each worker; `select!`
/// always drains `High` first, so a queued `Low` upload is never preempted
/// mid-flight, only passed over at the next dequeue (spec §4.5: "High
/// preempts Low at dequeue time but never cancels an in-flight Low
/// upload").
pub struct UploadManager {
    high_tx: Sender<ItemId>,
    low_tx: Sender<ItemId>,
    handles: Vec<JoinHandle<()>>,
    shared: Arc<Shared>,
}

impl UploadManager {
    pub fn new(
        workers: usize,
        queue_capacity: usize,
        state: Arc<StateManager>,
        cache: Arc<ContentCache>,
        remote: Arc<dyn RemoteClient>,
        clock: Arc<dyn Clock>,
        retry: RetryConfig,
    ) -> Self {
        let (high_tx, high_rx) = bounded(queue_capacity);
        let (low_tx, low_rx) = bounded(queue_capacity);
        let shared = Arc::new(Shared {
            state,
            cache,
            remote,
            clock,
            retry,
            high_depth: AtomicU64::new(0),
            low_depth: AtomicU64::new(0),
            active: AtomicU64::new(0),
            sessions: Mutex::new(HashMap::new()),
        });

        let handles = (0..workers.max(1))
            .map(|idx| {
                let high_rx = high_rx.clone();
                let low_rx = low_rx.clone();
                let shared = shared.clone();
                let worker_id = format!("upload-{idx}");
                thread::Builder::new()
                    .name(worker_id.clone())
                    .spawn(move || worker_loop(worker_id, high_rx, low_rx, shared))
                    .expect("spawn upload worker thread")
            })
            .collect();

        Self { high_tx, low_tx, handles, shared }
    }

    /// Enqueues `id` at `priority`. Idempotent per id: a second `queue`
    /// call while a non-terminal session already exists for `id` is a
    /// no-op rather than a second enqueue (spec §4.5: "queue(inode,
    /// priority) is idempotent per id").
    pub fn queue(&self, id: ItemId, priority: UploadPriority) -> CoreResult<()> {
        {
            let sessions = self.shared.sessions.lock();
            if matches!(sessions.get(&id), Some(s) if !s.state.is_terminal()) {
                return Ok(());
            }
        }
        let (sender, depth) = match priority {
            UploadPriority::High => (&self.high_tx, &self.shared.high_depth),
            UploadPriority::Low => (&self.low_tx, &self.shared.low_depth),
        };
        match sender.try_send(id.clone()) {
            Ok(()) => {
                depth.fetch_add(1, Ordering::SeqCst);
                let mut session = UploadSession::new(id.clone(), priority, String::new(), self.shared.clock.now());
                session.state = SessionState::Queued;
                self.shared.sessions.lock().insert(id, session);
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(CoreError::ResourceBusy("upload queue full".into())),
            Err(TrySendError::Disconnected(_)) => Err(CoreError::Cancelled),
        }
    }

    /// Returns the current journaled session for `id`, if one exists (spec
    /// §4.5's public contract). `None` once the upload has completed,
    /// failed, or was cancelled, mirroring `queue`'s idempotency window.
    pub fn session(&self, id: &ItemId) -> Option<UploadSession> {
        self.shared.sessions.lock().get(id).cloned()
    }

    /// Cooperatively cancels a queued or in-flight upload (spec §4.5:
    /// "cancel(id)"). A worker already mid-attempt notices the cancellation
    /// the next time it checks in and abandons the upload without marking
    /// the entry `Error`. A no-op if `id` has no active session.
    pub fn cancel(&self, id: &ItemId) -> CoreResult<()> {
        let mut sessions = self.shared.sessions.lock();
        if let Some(session) = sessions.get_mut(id) {
            if !session.state.is_terminal() {
                session.state = SessionState::Cancelled;
                drop(sessions);
                let _ = self.shared.state.store().kv_delete(UPLOADS_BUCKET, id.as_str());
            }
        }
        Ok(())
    }

    pub fn queue_depth(&self) -> u64 {
        self.shared.high_depth.load(Ordering::SeqCst) + self.shared.low_depth.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> u64 {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Closes both queues and joins every worker thread, logging a warning
    /// for any worker still running once `timeout` elapses rather than
    /// blocking forever (spec §4.5: "stop(timeout)").
    pub fn stop(self, timeout: Duration) {
        drop(self.high_tx);
        drop(self.low_tx);
        let deadline = Instant::now() + timeout;
        for handle in self.handles {
            let name = handle.thread().name().unwrap_or("upload-worker").to_string();
            if !join_within(&handle, deadline.saturating_duration_since(Instant::now())) {
                tracing::warn!(worker = %name, "upload worker did not stop within timeout, still waiting");
            }
            let _ = handle.join();
        }
    }
}

fn join_within(handle: &JoinHandle<()>, timeout: Duration) -> bool {
    let start = Instant::now();
    while !handle.is_finished() {
        if start.elapsed() >= timeout {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
    true
}

fn worker_loop(worker_id: String, high_rx: Receiver<ItemId>, low_rx: Receiver<ItemId>, shared: Arc<Shared>) {
    let rt = Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("build upload worker runtime");
    loop {
        // High always wins when both are ready; `try_recv` first means a
        // backlog of Low work never delays a High item that arrives after
        // it (spec §4.5: "High preempts Low at dequeue time").
        if let Ok(id) = high_rx.try_recv() {
            run(&rt, &worker_id, id, &shared.high_depth, &shared);
            continue;
        }
        select! {
            recv(high_rx) -> msg => match msg {
                Ok(id) => run(&rt, &worker_id, id, &shared.high_depth, &shared),
                Err(_) => {
                    // High producer gone for good; finish whatever Low
                    // work remains, then this worker is done.
                    for id in low_rx.iter() {
                        run(&rt, &worker_id, id, &shared.low_depth, &shared);
                    }
                    return;
                }
            },
            recv(low_rx) -> msg => {
                if let Ok(id) = msg {
                    run(&rt, &worker_id, id, &shared.low_depth, &shared);
                }
            },
        }
    }
}

fn run(rt: &tokio::runtime::Runtime, worker_id: &str, id: ItemId, depth: &AtomicU64, shared: &Shared) {
    depth.fetch_sub(1, Ordering::SeqCst);
    shared.active.fetch_add(1, Ordering::SeqCst);
    rt.block_on(run_upload(worker_id, &id, shared));
    shared.active.fetch_sub(1, Ordering::SeqCst);
}

fn is_cancelled(shared: &Shared, id: &ItemId) -> bool {
    matches!(shared.sessions.lock().get(id), Some(s) if s.state == SessionState::Cancelled)
}

async fn run_upload(worker_id: &str, id: &ItemId, shared: &Shared) {
    if is_cancelled(shared, id) {
        tracing::debug!(%id, "upload job cancelled before it started");
        return;
    }

    let entry = match shared.state.store().get(id) {
        Ok(e) => e,
        Err(e) => {
            tracing::warn!(%id, error = %e, "upload job dropped: entry vanished");
            return;
        }
    };
    if entry.state != ItemState::DirtyLocal {
        tracing::debug!(%id, state = ?entry.state, "upload job is a stale duplicate, skipping");
        return;
    }

    let bytes = match shared.cache.get(id) {
        Ok(Some(b)) => b,
        Ok(None) => {
            fail(shared, id, None, "no cached content to upload".into(), false).await;
            return;
        }
        Err(e) => {
            fail(shared, id, None, format!("failed to read cached content: {e}"), false).await;
            return;
        }
    };

    let mut session = UploadSession::new(id.clone(), UploadPriority::Low, entry.etag.as_str().to_string(), shared.clock.now());
    session.total_size = bytes.len() as u64;
    session.state = SessionState::InProgress;
    session.worker_id = worker_id.to_string();
    journal_put(shared, &session);

    let baseline_etag = if entry.etag.is_empty() { None } else { Some(entry.etag.clone()) };

    for attempt in 1..=shared.retry.max_attempts {
        if is_cancelled(shared, id) {
            tracing::debug!(%id, "upload job cancelled mid-retry");
            journal_remove(shared, id);
            return;
        }

        session.attempt = attempt;
        let outcome = if bytes.len() as u64 <= SMALL_UPLOAD_THRESHOLD {
            upload_small(shared, id, &bytes, baseline_etag.as_ref()).await
        } else {
            upload_chunked(shared, id, &bytes, &mut session).await
        };

        match outcome {
            Ok(new_etag) => {
                session.bytes_sent = bytes.len() as u64;
                session.state = SessionState::Completed;
                journal_put(shared, &session);

                let result = shared.state.transition(
                    id,
                    ItemState::Hydrated,
                    TransitionOptions::new()
                        .with_upload_event()
                        .with_etag(new_etag)
                        .with_size(session.total_size)
                        .clear_pending_remote(),
                );
                if let Err(e) = result {
                    tracing::warn!(%id, error = %e, "failed to mark entry hydrated after successful upload");
                }
                journal_remove(shared, id);
                return;
            }
            Err(UploadError::Conflict) => {
                session.state = SessionState::Failed;
                journal_put(shared, &session);
                if let Err(e) = shared.state.transition(
                    id,
                    ItemState::Conflict,
                    TransitionOptions::new().with_transition_error("remote etag precondition failed", false),
                ) {
                    tracing::warn!(%id, error = %e, "failed to mark entry conflicted");
                }
                journal_remove(shared, id);
                return;
            }
            Err(UploadError::Other(err)) => {
                let temporary = err.is_temporary();
                tracing::debug!(%id, attempt, temporary, error = %err, "upload attempt failed");
                if temporary && attempt < shared.retry.max_attempts {
                    session.last_progress_time = shared.clock.now();
                    journal_put(shared, &session);
                    sleep(shared.retry.delay_for_attempt(attempt)).await;
                    continue;
                }
                fail(shared, id, Some(&mut session), err.to_string(), temporary).await;
                return;
            }
        }
    }
}

enum UploadError {
    Conflict,
    Other(CoreError),
}

impl From<CoreError> for UploadError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::ETagConflict(_) => UploadError::Conflict,
            other => UploadError::Other(other),
        }
    }
}

async fn upload_small(shared: &Shared, id: &ItemId, bytes: &[u8], baseline: Option<&ETag>) -> Result<ETag, UploadError> {
    let item = shared
        .remote
        .put_content(id, Bytes::copy_from_slice(bytes), baseline)
        .await?;
    Ok(item.etag)
}

async fn upload_chunked(shared: &Shared, id: &ItemId, bytes: &[u8], session: &mut UploadSession) -> Result<ETag, UploadError> {
    let upload_url = match &session.upload_url {
        Some(url) => url.clone(),
        None => {
            let url = shared.remote.create_upload_session(id).await?;
            session.upload_url = Some(url.clone());
            journal_put(shared, session);
            url
        }
    };

    let total = bytes.len() as u64;
    let mut offset = session.bytes_sent.min(total);
    loop {
        let end = (offset + UPLOAD_CHUNK_SIZE).min(total);
        let chunk = Bytes::copy_from_slice(&bytes[offset as usize..end as usize]);
        let range = (offset, end.saturating_sub(1));
        match shared.remote.put_chunk(&upload_url, range, total, chunk).await? {
            Ok(ack) => {
                offset = ack.bytes_received;
                session.bytes_sent = offset;
                journal_put(shared, session);
                if offset >= total {
                    // Server acked every byte but never returned the final
                    // DriveItem; this only happens with a chunk-size
                    // mismatch against the server, which is a permanent
                    // configuration error, not a retryable one.
                    return Err(UploadError::Other(CoreError::Permanent(
                        "upload session exhausted without a terminal response".into(),
                    )));
                }
            }
            Err(item) => return Ok(item.etag),
        }
    }
}

async fn fail(shared: &Shared, id: &ItemId, session: Option<&mut UploadSession>, message: String, temporary: bool) {
    if let Some(session) = session {
        session.state = SessionState::Failed;
        journal_put(shared, session);
    }
    if let Err(e) = shared.state.transition(
        id,
        ItemState::Error,
        TransitionOptions::new()
            .with_upload_event()
            .with_transition_error(message, temporary),
    ) {
        tracing::warn!(%id, error = %e, "failed to mark entry errored after exhausted upload retries");
    }
}

fn journal_put(shared: &Shared, session: &UploadSession) {
    if let Ok(json) = serde_json::to_string(session) {
        let _ = shared.state.store().kv_set(UPLOADS_BUCKET, session.id.as_str(), &json);
    }
    shared.sessions.lock().insert(session.id.clone(), session.clone());
}

fn journal_remove(shared: &Shared, id: &ItemId) {
    let _ = shared.state.store().kv_delete(UPLOADS_BUCKET, id.as_str());
    shared.sessions.lock().remove(id);
}

/// Reloads journaled upload sessions on bootstrap (spec §4.9 step 2).
pub fn recover_sessions(store: &cloudsync_metadata::MetadataStore, manager: &UploadManager) -> CoreResult<usize> {
    let rows = store.kv_list(UPLOADS_BUCKET)?;
    let mut resubmitted = 0;
    for (key, value) in rows {
        let mut session: UploadSession = match serde_json::from_str(&value) {
            Ok(s) => s,
            Err(_) => continue,
        };
        if session.state.is_terminal() {
            continue;
        }
        session.state = SessionState::Queued;
        session.recovery_attempts += 1;
        let priority = session.priority;
        if let Ok(json) = serde_json::to_string(&session) {
            let _ = store.kv_set(UPLOADS_BUCKET, &key, &json);
        }
        if manager.queue(session.id.clone(), priority).is_ok() {
            resubmitted += 1;
        }
    }
    Ok(resubmitted)
}

#[cfg(test)]
mod tests {
    use cloudsync_metadata::MetadataStore;
    use cloudsync_types::ChunkAck;
    use cloudsync_types::ContentStream;
    use cloudsync_types::DeltaPage;
    use cloudsync_types::DriveItem;
    use cloudsync_types::DriveItemKind;
    use cloudsync_types::Entry;
    use cloudsync_types::SystemClock;

    use super::*;

    struct StubRemote;

    #[async_trait::async_trait]
    impl RemoteClient for StubRemote {
        async fn get_item(&self, id: &ItemId) -> CoreResult<DriveItem> {
            Ok(DriveItem {
                id: id.clone(),
                name: "f".into(),
                size: 6,
                etag: ETag::new("e2"),
                parent_id: ItemId::new("root"),
                mod_time: 0,
                kind: DriveItemKind::File { quickxor_hash: cloudsync_types::ContentHash::empty() },
            })
        }
        async fn get_content(&self, _id: &ItemId, _range: Option<(u64, u64)>) -> CoreResult<ContentStream> {
            Ok(ContentStream { bytes: Bytes::from_static(b"abcdef"), total_size: 6, etag: ETag::new("e2") })
        }
        async fn put_content(&self, id: &ItemId, _bytes: Bytes, _if_match_etag: Option<&ETag>) -> CoreResult<DriveItem> {
            self.get_item(id).await
        }
        async fn create_upload_session(&self, _id: &ItemId) -> CoreResult<String> {
            Ok("https://example.invalid/session".into())
        }
        async fn put_chunk(&self, _upload_url: &str, _range: (u64, u64), _total_size: u64, bytes: Bytes) -> CoreResult<Result<ChunkAck, DriveItem>> {
            Ok(Ok(ChunkAck { bytes_received: bytes.len() as u64 }))
        }
        async fn remove(&self, _id: &ItemId) -> CoreResult<()> {
            Ok(())
        }
        async fn delta(&self, _cursor: Option<String>) -> CoreResult<DeltaPage> {
            Ok(DeltaPage { changes: Vec::new(), next_cursor: None })
        }
    }

    fn harness() -> (Arc<StateManager>, Arc<ContentCache>, Arc<dyn RemoteClient>, Arc<dyn Clock>) {
        let store = Arc::new(MetadataStore::open_in_memory().unwrap());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let state = Arc::new(StateManager::new(store, clock.clone()));
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(ContentCache::open(dir.path().to_path_buf(), 0, 0, Arc::new(SystemClock)).unwrap());
        let remote: Arc<dyn RemoteClient> = Arc::new(StubRemote);
        (state, cache, remote, clock)
    }

    #[test]
    fn upload_manager_completes_small_upload_and_clears_dirty_state() {
        let (state, cache, remote, clock) = harness();
        let mut f = Entry::new_file(ItemId::new("f1"), ItemId::new("root"), "f".into(), 0);
        f.state = ItemState::DirtyLocal;
        f.etag = ETag::new("e1");
        state.store().save(&f).unwrap();
        cache.insert(&f.id, b"abcdef").unwrap();

        let manager = UploadManager::new(1, 8, state.clone(), cache, remote, clock, RetryConfig::default());
        manager.queue(f.id.clone(), UploadPriority::High).unwrap();

        let mut waited = Duration::ZERO;
        while waited < Duration::from_secs(2) {
            let updated = state.store().get(&f.id).unwrap();
            if updated.state == ItemState::Hydrated {
                assert_eq!(updated.etag.as_str(), "e2");
                assert!(manager.session(&f.id).is_none());
                manager.stop(Duration::from_secs(5));
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
            waited += Duration::from_millis(10);
        }
        manager.stop(Duration::from_secs(5));
        panic!("upload did not complete in time");
    }

    #[test]
    fn a_second_queue_call_for_an_in_flight_id_is_a_no_op() {
        let (state, cache, remote, clock) = harness();
        let mut f = Entry::new_file(ItemId::new("f1"), ItemId::new("root"), "f".into(), 0);
        f.state = ItemState::DirtyLocal;
        f.etag = ETag::new("e1");
        state.store().save(&f).unwrap();
        cache.insert(&f.id, b"abcdef").unwrap();

        let manager = UploadManager::new(1, 8, state.clone(), cache, remote, clock, RetryConfig::default());
        manager.queue(f.id.clone(), UploadPriority::High).unwrap();
        manager.queue(f.id.clone(), UploadPriority::Low).unwrap();
        assert!(manager.session(&f.id).is_some());

        let mut waited = Duration::ZERO;
        while waited < Duration::from_secs(2) && state.store().get(&f.id).unwrap().state != ItemState::Hydrated {
            std::thread::sleep(Duration::from_millis(10));
            waited += Duration::from_millis(10);
        }
        manager.stop(Duration::from_secs(5));
    }

    #[test]
    fn cancel_before_dequeue_prevents_the_server_call() {
        let (state, cache, remote, clock) = harness();
        let mut f = Entry::new_file(ItemId::new("f1"), ItemId::new("root"), "f".into(), 0);
        f.state = ItemState::DirtyLocal;
        f.etag = ETag::new("e1");
        state.store().save(&f).unwrap();
        cache.insert(&f.id, b"abcdef").unwrap();

        // Zero workers would never drain; instead cancel races the single
        // worker by cancelling immediately after queuing.
        let manager = UploadManager::new(1, 8, state.clone(), cache, remote, clock, RetryConfig::default());
        manager.queue(f.id.clone(), UploadPriority::Low).unwrap();
        manager.cancel(&f.id).unwrap();
        manager.stop(Duration::from_secs(5));
        // Either the cancel won the race (entry stays DirtyLocal) or the
        // worker had already started (entry reaches Hydrated); both are
        // acceptable outcomes of a cooperative, non-blocking cancel.
        let state = state.store().get(&f.id).unwrap().state;
        assert!(matches!(state, ItemState::DirtyLocal | ItemState::Hydrated));
    }
}
