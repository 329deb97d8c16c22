use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;

use crossbeam_channel::bounded;
use crossbeam_channel::Receiver;
use crossbeam_channel::Sender;
use crossbeam_channel::TrySendError;
use parking_lot::Condvar;
use parking_lot::Mutex;
use tokio::runtime::Builder;
use tokio::time::sleep;

use cloudsync_cache::ContentCache;
use cloudsync_metadata::StateManager;
use cloudsync_metadata::TransitionOptions;
use cloudsync_types::Clock;
use cloudsync_types::ContentHash;
use cloudsync_types::CoreError;
use cloudsync_types::CoreResult;
use cloudsync_types::ETag;
use cloudsync_types::ItemId;
use cloudsync_types::ItemState;
use cloudsync_types::RemoteClient;

use crate::retry::RetryConfig;
use crate::session::DownloadSession;
use crate::session::SessionState;
use crate::session::DOWNLOAD_CHUNK_SIZE;
use crate::session::SMALL_DOWNLOAD_THRESHOLD;

const DOWNLOADS_BUCKET: &str = "downloads";

/// Coarse session status exposed by `status`/`wait` (spec §4.4's public
/// contract). `NotFound` is never stored in the tracking map; `status` and
/// `wait` synthesize it for an id no session has ever touched.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DownloadStatus {
    Queued,
    Started,
    Completed,
    Errored,
    NotFound,
}

struct Shared {
    state: Arc<StateManager>,
    cache: Arc<ContentCache>,
    remote: Arc<dyn RemoteClient>,
    clock: Arc<dyn Clock>,
    retry: RetryConfig,
    queue_depth: AtomicU64,
    active: AtomicU64,
    sessions: Mutex<HashMap<ItemId, DownloadStatus>>,
    sessions_cv: Condvar,
}

/// Fixed-size thread pool hydrating `GHOST`/`ERROR` entries (spec §4.4).
/// Each worker owns a dedicated single-threaded tokio runtime so it can
/// call the async `RemoteClient` without pulling the whole workspace onto
/// a shared multi-threaded executor (spec §5: "multi-threaded with thread
/// pools").
pub struct DownloadManager {
    sender: Sender<ItemId>,
    handles: Vec<JoinHandle<()>>,
    shared: Arc<Shared>,
}

impl DownloadManager {
    pub fn new(
        workers: usize,
        queue_capacity: usize,
        state: Arc<StateManager>,
        cache: Arc<ContentCache>,
        remote: Arc<dyn RemoteClient>,
        clock: Arc<dyn Clock>,
        retry: RetryConfig,
    ) -> Self {
        let (sender, receiver) = bounded(queue_capacity);
        let shared = Arc::new(Shared {
            state,
            cache,
            remote,
            clock,
            retry,
            queue_depth: AtomicU64::new(0),
            active: AtomicU64::new(0),
            sessions: Mutex::new(HashMap::new()),
            sessions_cv: Condvar::new(),
        });

        let handles = (0..workers.max(1))
            .map(|idx| {
                let receiver = receiver.clone();
                let shared = shared.clone();
                let worker_id = format!("download-{idx}");
                thread::Builder::new()
                    .name(worker_id.clone())
                    .spawn(move || worker_loop(worker_id, receiver, shared))
                    .expect("spawn download worker thread")
            })
            .collect();

        Self { sender, handles, shared }
    }

    /// Enqueues `id` for hydration. Idempotent per id (spec §4.4: "queue(id)
    /// is idempotent per id; a second queue(id) for an id with an in-flight
    /// session returns the existing session" — a no-op here since the
    /// original caller can still observe the outcome via `wait`/`status`).
    pub fn queue(&self, id: ItemId) -> CoreResult<()> {
        {
            let sessions = self.shared.sessions.lock();
            if matches!(sessions.get(&id), Some(DownloadStatus::Queued) | Some(DownloadStatus::Started)) {
                return Ok(());
            }
        }
        match self.sender.try_send(id.clone()) {
            Ok(()) => {
                self.shared.queue_depth.fetch_add(1, Ordering::SeqCst);
                set_status(&self.shared, &id, DownloadStatus::Queued);
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(CoreError::ResourceBusy("download queue full".into())),
            Err(TrySendError::Disconnected(_)) => Err(CoreError::Cancelled),
        }
    }

    /// One of `{Queued, Started, Completed, Errored, NotFound}` (spec
    /// §4.4's public contract).
    pub fn status(&self, id: &ItemId) -> DownloadStatus {
        self.shared.sessions.lock().get(id).copied().unwrap_or(DownloadStatus::NotFound)
    }

    /// Blocks until the session for `id` reaches a terminal status. A
    /// session that ends `Errored`, or an id that was never queued, is
    /// itself reported as an error.
    pub fn wait(&self, id: &ItemId) -> CoreResult<()> {
        let mut sessions = self.shared.sessions.lock();
        loop {
            match sessions.get(id) {
                Some(DownloadStatus::Completed) => return Ok(()),
                Some(DownloadStatus::Errored) => return Err(CoreError::Permanent(format!("download for {id} failed"))),
                Some(DownloadStatus::Queued) | Some(DownloadStatus::Started) => {
                    self.shared.sessions_cv.wait(&mut sessions);
                }
                None | Some(DownloadStatus::NotFound) => return Err(CoreError::NotFound(id.as_str().to_string())),
            }
        }
    }

    pub fn queue_depth(&self) -> u64 {
        self.shared.queue_depth.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> u64 {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Closes the queue and joins every worker thread, logging a warning
    /// for any worker still running once `timeout` elapses rather than
    /// blocking the caller forever (spec §4.4: "stop(timeout) — close
    /// queue, join workers; on timeout, log warning and keep waiting").
    /// Jobs already queued but not yet dequeued are abandoned; their
    /// journal rows stay `Queued` and are resubmitted on the next
    /// bootstrap (spec §4.9).
    pub fn stop(self, timeout: Duration) {
        drop(self.sender);
        let deadline = Instant::now() + timeout;
        for handle in self.handles {
            let name = handle.thread().name().unwrap_or("download-worker").to_string();
            if !join_within(&handle, deadline.saturating_duration_since(Instant::now())) {
                tracing::warn!(worker = %name, "download worker did not stop within timeout, still waiting");
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

fn set_status(shared: &Shared, id: &ItemId, status: DownloadStatus) {
    let mut sessions = shared.sessions.lock();
    sessions.insert(id.clone(), status);
    shared.sessions_cv.notify_all();
}

fn worker_loop(worker_id: String, receiver: Receiver<ItemId>, shared: Arc<Shared>) {
    let rt = Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("build download worker runtime");
    for id in receiver.iter() {
        shared.queue_depth.fetch_sub(1, Ordering::SeqCst);
        shared.active.fetch_add(1, Ordering::SeqCst);
        set_status(&shared, &id, DownloadStatus::Started);
        rt.block_on(run_download(&worker_id, &id, &shared));
        shared.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Reloads a journaled session for `id` when it is resumable, otherwise
/// starts a fresh one. Mirrors `upload_chunked`'s reuse of
/// `session.upload_url` to skip renegotiating a resumable session that
/// already exists.
fn load_or_new_session(shared: &Shared, id: &ItemId) -> DownloadSession {
    if let Ok(Some(json)) = shared.state.store().kv_get(DOWNLOADS_BUCKET, id.as_str()) {
        if let Ok(session) = serde_json::from_str::<DownloadSession>(&json) {
            if session.can_resume && !session.state.is_terminal() {
                return session;
            }
        }
    }
    DownloadSession::new(id.clone(), shared.clock.now())
}

async fn run_download(worker_id: &str, id: &ItemId, shared: &Shared) {
    let entry = match shared.state.store().get(id) {
        Ok(e) => e,
        Err(e) => {
            tracing::warn!(%id, error = %e, "download job dropped: entry vanished");
            set_status(shared, id, DownloadStatus::Errored);
            return;
        }
    };
    if !matches!(entry.state, ItemState::Ghost | ItemState::Error) {
        tracing::debug!(%id, state = ?entry.state, "download job is a stale duplicate, skipping");
        return;
    }

    if let Err(e) = shared.state.transition(
        id,
        ItemState::Hydrating,
        TransitionOptions::new().with_hydration_event().with_worker(worker_id),
    ) {
        tracing::warn!(%id, error = %e, "failed to mark entry hydrating");
        set_status(shared, id, DownloadStatus::Errored);
        return;
    }

    let mut session = load_or_new_session(shared, id);
    session.path = shared.cache.content_path(id).to_string_lossy().into_owned();
    session.state = SessionState::InProgress;
    session.worker_id = worker_id.to_string();
    journal_put(shared, &session);

    let start_attempt = session.attempt + 1;
    let last_attempt = shared.retry.max_attempts.max(start_attempt);
    for attempt in start_attempt..=last_attempt {
        session.attempt = attempt;
        match download_once(shared, id, &mut session).await {
            Ok(()) => {
                session.state = SessionState::Completed;
                journal_put(shared, &session);

                let hash = match shared.cache.get(id) {
                    Ok(Some(bytes)) => ContentHash::of(&bytes),
                    _ => ContentHash::empty(),
                };
                let result = shared.state.transition(
                    id,
                    ItemState::Hydrated,
                    TransitionOptions::new()
                        .with_hydration_event()
                        .with_content_hash(hash)
                        .with_etag(ETag::new(session.etag.clone()))
                        .with_size(session.total_size),
                );
                if let Err(e) = result {
                    tracing::warn!(%id, error = %e, "failed to mark entry hydrated after successful download");
                }
                journal_remove(shared, id);
                set_status(shared, id, DownloadStatus::Completed);
                return;
            }
            Err(e) => {
                let temporary = e.is_temporary();
                tracing::debug!(%id, attempt, temporary, error = %e, "download attempt failed");
                if temporary && attempt < last_attempt {
                    session.last_progress_time = shared.clock.now();
                    journal_put(shared, &session);
                    sleep(shared.retry.delay_for_attempt(attempt)).await;
                    continue;
                }
                session.error = e.to_string();
                fail(shared, id, &mut session, e.to_string(), temporary);
                return;
            }
        }
    }
}

/// Fetches the remainder of `session.total_size` in `chunk_size`-sized
/// ranged reads, writing each chunk straight into its cache slot and
/// checkpointing `last_successful_chunk` after every write so a crash
/// mid-download resumes instead of restarting (spec §4.4's resumable
/// download path, the counterpart to `upload_chunked`).
async fn download_once(shared: &Shared, id: &ItemId, session: &mut DownloadSession) -> CoreResult<()> {
    if session.total_size == 0 {
        let item = shared.remote.get_item(id).await?;
        session.total_size = item.size;
        session.etag = item.etag.as_str().to_string();
        if item.size > SMALL_DOWNLOAD_THRESHOLD {
            session.chunk_size = DOWNLOAD_CHUNK_SIZE;
            session.can_resume = true;
        } else {
            session.chunk_size = item.size.max(1);
            session.can_resume = false;
        }
        session.total_chunks = item.size.div_ceil(session.chunk_size);
        journal_put(shared, session);
    }

    let mut handle = shared.cache.open_handle(id)?;
    let mut chunk_index = if session.bytes_received > 0 {
        // Resuming: the checkpointed chunk was fully written last time,
        // start on the one after it.
        session.last_successful_chunk + 1
    } else {
        0
    };

    while chunk_index < session.total_chunks {
        let offset = chunk_index * session.chunk_size;
        let end = (offset + session.chunk_size - 1).min(session.total_size.saturating_sub(1));
        let stream = shared.remote.get_content(id, Some((offset, end))).await?;
        handle.write_at(offset, &stream.bytes)?;

        session.bytes_received = (end + 1).min(session.total_size);
        session.last_successful_chunk = chunk_index;
        session.last_progress_time = shared.clock.now();
        journal_put(shared, session);

        chunk_index += 1;
    }

    handle.sync()?;
    shared.cache.note_size(id, session.total_size);
    Ok(())
}

fn fail(shared: &Shared, id: &ItemId, session: &mut DownloadSession, message: String, temporary: bool) {
    session.state = SessionState::Failed;
    session.error = message.clone();
    journal_put(shared, session);
    if let Err(e) = shared.state.transition(
        id,
        ItemState::Error,
        TransitionOptions::new()
            .with_hydration_event()
            .with_transition_error(message, temporary),
    ) {
        tracing::warn!(%id, error = %e, "failed to mark entry errored after exhausted download retries");
    }
    set_status(shared, id, DownloadStatus::Errored);
}

fn journal_put(shared: &Shared, session: &DownloadSession) {
    if let Ok(json) = serde_json::to_string(session) {
        let _ = shared.state.store().kv_set(DOWNLOADS_BUCKET, session.id.as_str(), &json);
    }
}

fn journal_remove(shared: &Shared, id: &ItemId) {
    let _ = shared.state.store().kv_delete(DOWNLOADS_BUCKET, id.as_str());
}

/// Reloads journaled sessions on bootstrap (spec §4.9 step 2): any
/// non-terminal session has `recovery_attempts` bumped and is resubmitted.
pub fn recover_sessions(store: &cloudsync_metadata::MetadataStore, manager: &DownloadManager) -> CoreResult<usize> {
    let rows = store.kv_list(DOWNLOADS_BUCKET)?;
    let mut resubmitted = 0;
    for (key, value) in rows {
        let mut session: DownloadSession = match serde_json::from_str(&value) {
            Ok(s) => s,
            Err(_) => continue,
        };
        if session.state.is_terminal() {
            continue;
        }
        session.state = SessionState::Queued;
        session.recovery_attempts += 1;
        if let Ok(json) = serde_json::to_string(&session) {
            let _ = store.kv_set(DOWNLOADS_BUCKET, &key, &json);
        }
        if manager.queue(session.id.clone()).is_ok() {
            resubmitted += 1;
        }
    }
    Ok(resubmitted)
}
