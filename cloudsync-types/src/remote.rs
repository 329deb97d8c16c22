use async_trait::async_trait;
use bytes::Bytes;

use crate::drive_item::DriveItem;
use crate::drive_item::DriveItemChange;
use crate::error::CoreResult;
use crate::ids::ETag;
use crate::ids::ItemId;

/// A chunk of downloaded content plus the metadata the download session
/// needs to track progress and validate the final result (spec §6.2
/// `get_content`).
pub struct ContentStream {
    pub bytes: Bytes,
    pub total_size: u64,
    pub etag: ETag,
}

/// Returned by `put_chunk` for all but the final chunk of a resumable
/// upload (spec §6.2).
#[derive(Clone, Debug)]
pub struct ChunkAck {
    pub bytes_received: u64,
}

/// One page of the change feed (spec §4.6, §6.2 `delta`).
pub struct DeltaPage {
    pub changes: Vec<DriveItemChange>,
    pub next_cursor: Option<String>,
}

/// The out-of-scope HTTP/JSON transport collaborator (spec §1, §6.2). The
/// core only ever calls through this trait; a concrete implementation
/// (OAuth, retries-at-the-wire, connection pooling) lives outside this
/// workspace. Implementations must be safe under concurrent use (spec §5
/// "Network transport: caller-supplied; must be safe under concurrent
/// use").
#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn get_item(&self, id: &ItemId) -> CoreResult<DriveItem>;

    /// `range` is an inclusive byte range `(start, end)`, or `None` for the
    /// whole object.
    async fn get_content(
        &self,
        id: &ItemId,
        range: Option<(u64, u64)>,
    ) -> CoreResult<ContentStream>;

    /// Small-file upload path (spec §4.5 step 2). `if_match_etag` is the
    /// upload's baseline etag; the server returns `CoreError::ETagConflict`
    /// (HTTP 412) on a stale baseline.
    async fn put_content(
        &self,
        id: &ItemId,
        bytes: Bytes,
        if_match_etag: Option<&ETag>,
    ) -> CoreResult<DriveItem>;

    async fn create_upload_session(&self, id: &ItemId) -> CoreResult<String>;

    /// `range` is the inclusive byte range this chunk covers within the
    /// final object. Returns the finished `DriveItem` on the final chunk.
    async fn put_chunk(
        &self,
        upload_url: &str,
        range: (u64, u64),
        total_size: u64,
        bytes: Bytes,
    ) -> CoreResult<Result<ChunkAck, DriveItem>>;

    async fn remove(&self, id: &ItemId) -> CoreResult<()>;

    async fn delta(&self, cursor: Option<String>) -> CoreResult<DeltaPage>;
}
