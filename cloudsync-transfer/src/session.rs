use serde::Deserialize;
use serde::Serialize;

use cloudsync_types::ItemId;

/// Lifecycle of a journaled transfer session (spec §4.4/§4.5's session
/// structure). Only `Queued`/`InProgress` sessions are re-submitted on
/// bootstrap (spec §4.9 step 2); the rest are terminal.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum SessionState {
    Queued,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Failed | SessionState::Cancelled)
    }
}

/// Journaled record of one download attempt, persisted under the `kv`
/// bucket `"downloads"` keyed by item id so an in-flight download survives
/// a process restart (spec §4.4 step 7, §4.9 step 2). `last_successful_chunk`
/// and `can_resume` mirror `UploadSession::upload_url`/`bytes_sent`'s role
/// for the upload side: they let a resubmitted session pick up a chunked
/// transfer mid-way instead of restarting from byte zero.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadSession {
    pub id: ItemId,
    pub state: SessionState,
    pub attempt: u32,
    pub path: String,
    pub bytes_received: u64,
    pub total_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u64,
    pub last_successful_chunk: u64,
    pub can_resume: bool,
    pub etag: String,
    pub error: String,
    pub last_progress_time: i64,
    pub recovery_attempts: u32,
    pub worker_id: String,
}

impl DownloadSession {
    pub fn new(id: ItemId, now: i64) -> Self {
        Self {
            id,
            state: SessionState::Queued,
            attempt: 0,
            path: String::new(),
            bytes_received: 0,
            total_size: 0,
            chunk_size: 0,
            total_chunks: 0,
            last_successful_chunk: 0,
            can_resume: false,
            etag: String::new(),
            error: String::new(),
            last_progress_time: now,
            recovery_attempts: 0,
            worker_id: String::new(),
        }
    }
}

/// Upload priority (spec §4.5: "two-priority queue, High preempts Low at
/// dequeue time but never cancels an in-flight Low upload").
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum UploadPriority {
    High,
    Low,
}

/// Journaled record of one upload attempt, bucket `"uploads"` (spec §4.5
/// step 6, §4.9 step 2). `upload_url` is set once a resumable session has
/// been created; its absence means the manager has not yet decided between
/// the small-PUT and chunked-resumable strategies.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UploadSession {
    pub id: ItemId,
    pub state: SessionState,
    pub priority: UploadPriority,
    pub attempt: u32,
    pub bytes_sent: u64,
    pub total_size: u64,
    pub upload_url: Option<String>,
    pub baseline_etag: String,
    pub last_progress_time: i64,
    pub recovery_attempts: u32,
    pub worker_id: String,
}

impl UploadSession {
    pub fn new(id: ItemId, priority: UploadPriority, baseline_etag: String, now: i64) -> Self {
        Self {
            id,
            state: SessionState::Queued,
            priority,
            attempt: 0,
            bytes_sent: 0,
            total_size: 0,
            upload_url: None,
            baseline_etag,
            last_progress_time: now,
            recovery_attempts: 0,
            worker_id: String::new(),
        }
    }
}

/// Above this size a resumable (chunked) upload session is used instead of
/// a single `put_content` call (spec §4.5 step 2: "small-file upload path"
/// vs chunked-resumable).
pub const SMALL_UPLOAD_THRESHOLD: u64 = 4 * 1024 * 1024;

/// Chunk size used for the resumable upload path.
pub const UPLOAD_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// Above this size a download is fetched in `DOWNLOAD_CHUNK_SIZE` ranged
/// `get_content` calls instead of one unranged call, so a restart resumes
/// from `last_successful_chunk` instead of re-fetching the whole item
/// (spec §4.4's download-side counterpart to the upload resumable path).
pub const SMALL_DOWNLOAD_THRESHOLD: u64 = 4 * 1024 * 1024;

/// Chunk size used for the resumable download path.
pub const DOWNLOAD_CHUNK_SIZE: u64 = 4 * 1024 * 1024;
