//! Download and upload worker pools (spec §4.4/§4.5). Each manager is a
//! fixed-size OS thread pool fed by a bounded `crossbeam-channel` queue;
//! every worker bridges into the async `RemoteClient` capability via its
//! own single-threaded tokio runtime. Retry/backoff, session journaling,
//! and bootstrap recovery live here alongside the managers themselves.

mod download;
mod retry;
mod session;
mod upload;

pub use download::recover_sessions as recover_download_sessions;
pub use download::DownloadManager;
pub use download::DownloadStatus;
pub use retry::RetryConfig;
pub use session::DownloadSession;
pub use session::SessionState;
pub use session::UploadPriority;
pub use session::UploadSession;
pub use session::DOWNLOAD_CHUNK_SIZE;
pub use session::SMALL_DOWNLOAD_THRESHOLD;
pub use session::SMALL_UPLOAD_THRESHOLD;
pub use session::UPLOAD_CHUNK_SIZE;
pub use upload::recover_sessions as recover_upload_sessions;
pub use upload::UploadManager;
