use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use cloudsync_sync::DeltaEngine;
use cloudsync_transfer::DownloadManager;
use cloudsync_transfer::UploadManager;
use cloudsync_types::Clock;

/// A point-in-time snapshot of [`Telemetry`] (spec §2 "no behavior, only
/// observation").
#[derive(Clone, Copy, Debug, Default)]
pub struct TelemetrySnapshot {
    pub download_queue_depth: u64,
    pub download_active: u64,
    pub upload_queue_depth: u64,
    pub upload_active: u64,
    pub delta_pages_applied: u64,
    pub delta_last_poll_at: i64,
    pub conflicts_total: u64,
    pub stalls_total: u64,
}

/// How long a session may go without progress before it counts as a stall
/// (SPEC_FULL §4.10).
const STALL_THRESHOLD_SECS: i64 = 30;

/// Cheap, lock-free counters observing the download/upload/delta
/// subsystems. Owns no behavior: every field is read straight off the
/// managers it wraps.
pub struct Telemetry {
    downloads: Arc<DownloadManager>,
    uploads: Arc<UploadManager>,
    delta: Arc<DeltaEngine>,
    clock: Arc<dyn Clock>,
    stalls_total: AtomicU64,
    last_active_change_at: AtomicU64,
    last_fingerprint: AtomicU64,
}

impl Telemetry {
    pub fn new(downloads: Arc<DownloadManager>, uploads: Arc<UploadManager>, delta: Arc<DeltaEngine>, clock: Arc<dyn Clock>) -> Self {
        let last_active_change_at = clock.now();
        Self {
            downloads,
            uploads,
            delta,
            clock,
            stalls_total: AtomicU64::new(0),
            last_active_change_at: AtomicU64::new(last_active_change_at as u64),
            // No sample taken yet; any real fingerprint differs from this.
            last_fingerprint: AtomicU64::new(u64::MAX),
        }
    }

    /// A cheap combined signal of in-flight work across the subsystems this
    /// telemetry wraps. Two samples with the same fingerprint mean nothing
    /// observable moved between them.
    fn activity_fingerprint(&self) -> u64 {
        self.downloads
            .queue_depth()
            .wrapping_add(self.downloads.active().wrapping_mul(1_000_003))
            .wrapping_add(self.uploads.queue_depth().wrapping_mul(31))
            .wrapping_add(self.uploads.active().wrapping_mul(97))
            .wrapping_add(self.delta.pages_applied.load(Ordering::SeqCst))
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            download_queue_depth: self.downloads.queue_depth(),
            download_active: self.downloads.active(),
            upload_queue_depth: self.uploads.queue_depth(),
            upload_active: self.uploads.active(),
            delta_pages_applied: self.delta.pages_applied.load(Ordering::SeqCst),
            delta_last_poll_at: self.delta.last_poll_at.load(Ordering::SeqCst),
            conflicts_total: self.delta.conflicts_total.load(Ordering::SeqCst),
            stalls_total: self.stalls_total.load(Ordering::SeqCst),
        }
    }

    /// Called periodically by the cache-cleanup worker (spec §5: "a
    /// periodic cache-cleanup task: 1 worker") to notice a download/upload
    /// subsystem stuck with the same activity fingerprint for longer than
    /// [`STALL_THRESHOLD_SECS`] without anything completing. An idle system
    /// (fingerprint `0`, nothing queued or active) is never a stall.
    pub fn note_activity_sample(&self) {
        self.note_fingerprint_sample(self.activity_fingerprint());
    }

    fn note_fingerprint_sample(&self, fingerprint: u64) {
        let now = self.clock.now();
        let prev_fingerprint = self.last_fingerprint.swap(fingerprint, Ordering::SeqCst);

        if fingerprint != prev_fingerprint || fingerprint == 0 {
            self.last_active_change_at.store(now as u64, Ordering::SeqCst);
            return;
        }

        let last_change = self.last_active_change_at.load(Ordering::SeqCst) as i64;
        if now - last_change >= STALL_THRESHOLD_SECS {
            self.record_stall();
            // Reset so a stall that persists across several samples is
            // only counted once per STALL_THRESHOLD_SECS window.
            self.last_active_change_at.store(now as u64, Ordering::SeqCst);
        }
    }

    pub fn record_stall(&self) {
        self.stalls_total.fetch_add(1, Ordering::SeqCst);
    }
}
