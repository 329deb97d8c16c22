use serde::Deserialize;
use serde::Serialize;

use crate::ids::ContentHash;
use crate::ids::ETag;
use crate::ids::ItemId;

/// The wire type returned by `RemoteClient::get_item` and embedded in
/// delta pages (spec §6.2). Distinct from `Entry`: this is the tagged
/// variant the remote API hands us, not our local catalog record (spec §9
/// design note: model struct-embedding / duck-typed `*DriveItem` as tagged
/// variants distinct from `Entry`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DriveItem {
    pub id: ItemId,
    pub name: String,
    pub size: u64,
    pub etag: ETag,
    pub parent_id: ItemId,
    pub mod_time: i64,
    pub kind: DriveItemKind,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum DriveItemKind {
    File { quickxor_hash: ContentHash },
    Folder { child_count: u32 },
}

impl DriveItem {
    pub fn is_folder(&self) -> bool {
        matches!(self.kind, DriveItemKind::Folder { .. })
    }
}

/// One row of a delta feed page (spec §4.6, §6.2 `delta()`). A deleted item
/// carries only its id.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum DriveItemChange {
    Upserted(DriveItem),
    Deleted { id: ItemId },
}

impl DriveItemChange {
    pub fn id(&self) -> &ItemId {
        match self {
            DriveItemChange::Upserted(item) => &item.id,
            DriveItemChange::Deleted { id } => id,
        }
    }
}
