use cloudsync_metadata::MetadataStore;
use cloudsync_transfer::recover_download_sessions;
use cloudsync_transfer::recover_upload_sessions;
use cloudsync_transfer::DownloadManager;
use cloudsync_transfer::UploadManager;
use cloudsync_types::CoreResult;

/// Outcome of [`run`], surfaced so a caller can log what recovery found
/// without the bootstrap sequence itself doing any logging decisions
/// beyond the warnings each recovered subsystem already emits.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BootstrapReport {
    pub downloads_resubmitted: usize,
    pub uploads_resubmitted: usize,
    pub cursor_present: bool,
}

/// Runs steps 2-3 of the startup sequence (SPEC_FULL §4.9); step 1
/// (migration check, orphan sweep) already happened inside
/// [`MetadataStore::open`] before this is called, and step 4's orphan
/// count is logged from there too.
///
/// Journaled sessions left in a non-terminal state by a previous,
/// uncleanly-stopped process are requeued with their `recovery_attempts`
/// counter bumped; the persisted delta cursor is checked only to report
/// whether "synchronize from latest" will happen on first poll.
pub fn run(store: &MetadataStore, downloads: &DownloadManager, uploads: &UploadManager) -> CoreResult<BootstrapReport> {
    let downloads_resubmitted = recover_download_sessions(store, downloads)?;
    let uploads_resubmitted = recover_upload_sessions(store, uploads)?;
    let cursor_present = store.kv_get("delta", "deltaLink")?.is_some();

    if downloads_resubmitted > 0 || uploads_resubmitted > 0 {
        tracing::info!(downloads_resubmitted, uploads_resubmitted, "resubmitted journaled sessions from a previous run");
    }
    if !cursor_present {
        tracing::info!("no persisted delta cursor; will synchronize from latest on first poll");
    }

    Ok(BootstrapReport { downloads_resubmitted, uploads_resubmitted, cursor_present })
}
