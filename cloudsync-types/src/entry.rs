use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use crate::ids::ContentHash;
use crate::ids::ETag;
use crate::ids::ItemId;
use crate::state::ItemState;
use crate::state::LastError;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ItemType {
    File,
    Directory,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum OverlayPolicy {
    RemoteWins,
    LocalWins,
    Merged,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum PinMode {
    Unset,
    Always,
    Never,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Pin {
    pub mode: Option<PinMode>,
    pub since: Option<i64>,
}

impl Pin {
    pub fn unset() -> Self {
        Self { mode: None, since: None }
    }

    pub fn is_always(&self) -> bool {
        matches!(self.mode, Some(PinMode::Always))
    }

    pub fn is_never(&self) -> bool {
        matches!(self.mode, Some(PinMode::Never))
    }
}

/// The last hydration or upload attempt recorded against an `Entry`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TransferEvent {
    pub worker_id: String,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub error: Option<LastError>,
}

impl TransferEvent {
    pub fn is_in_flight(&self) -> bool {
        self.started_at.is_some() && self.completed_at.is_none()
    }
}

/// The catalog record (spec §3.1). Owned exclusively by `MetadataStore`;
/// all mutation goes through `StateManager::transition` or
/// `MetadataStore::update`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Entry {
    pub id: ItemId,
    pub remote_id: ItemId,
    pub parent_id: ItemId,
    pub name: String,
    pub item_type: ItemType,
    pub state: ItemState,
    pub overlay_policy: OverlayPolicy,
    pub virtual_item: bool,
    pub pending_remote: bool,
    pub size: u64,
    pub etag: ETag,
    pub content_hash: ContentHash,
    pub mode: u32,
    pub xattrs: BTreeMap<String, Vec<u8>>,
    pub children: Vec<ItemId>,
    pub subdir_count: u32,
    pub pin: Pin,
    pub last_modified: Option<i64>,
    pub last_hydrated: Option<i64>,
    pub last_uploaded: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
    pub hydration: TransferEvent,
    pub upload: TransferEvent,
    pub last_error: Option<LastError>,
}

/// POSIX mode bits used when minting new entries.
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFREG: u32 = 0o100000;

impl Entry {
    pub fn new_file(id: ItemId, parent_id: ItemId, name: String, now: i64) -> Self {
        Self {
            id,
            remote_id: ItemId::empty(),
            parent_id,
            name,
            item_type: ItemType::File,
            state: ItemState::Ghost,
            overlay_policy: OverlayPolicy::RemoteWins,
            virtual_item: false,
            pending_remote: false,
            size: 0,
            etag: ETag::empty(),
            content_hash: ContentHash::empty(),
            mode: S_IFREG | 0o644,
            xattrs: BTreeMap::new(),
            children: Vec::new(),
            subdir_count: 0,
            pin: Pin::unset(),
            last_modified: None,
            last_hydrated: None,
            last_uploaded: None,
            created_at: now,
            updated_at: now,
            hydration: TransferEvent::default(),
            upload: TransferEvent::default(),
            last_error: None,
        }
    }

    pub fn new_directory(id: ItemId, parent_id: ItemId, name: String, now: i64) -> Self {
        let mut e = Self::new_file(id, parent_id, name, now);
        e.item_type = ItemType::Directory;
        e.mode = S_IFDIR | 0o755;
        e.state = ItemState::Hydrated;
        e
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_empty()
    }

    /// nlink per spec §4.8 getattr: 1 for files, 2+subdir_count for dirs.
    pub fn nlink(&self) -> u32 {
        match self.item_type {
            ItemType::File => 1,
            ItemType::Directory => 2 + self.subdir_count,
        }
    }

    pub fn mtime(&self) -> i64 {
        self.last_modified.unwrap_or(self.updated_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directories_start_hydrated() {
        let d = Entry::new_directory(ItemId::new("d1"), ItemId::empty(), "dir".into(), 0);
        assert_eq!(d.state, ItemState::Hydrated);
        assert_eq!(d.nlink(), 2);
    }

    #[test]
    fn files_start_ghost() {
        let f = Entry::new_file(ItemId::new("f1"), ItemId::new("root"), "f".into(), 0);
        assert_eq!(f.state, ItemState::Ghost);
        assert_eq!(f.nlink(), 1);
    }
}
