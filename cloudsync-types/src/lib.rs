//! Shared entities, wire types, and capability traits for the cloudsync
//! core: the item identifier and hash newtypes, the `Entry` catalog record,
//! the item state machine, the error taxonomy, and the `RemoteClient` /
//! `Clock` capabilities the core consumes.

mod clock;
mod drive_item;
mod entry;
mod error;
mod ids;
mod remote;
mod state;

pub use clock::Clock;
pub use clock::SystemClock;
pub use drive_item::DriveItem;
pub use drive_item::DriveItemChange;
pub use drive_item::DriveItemKind;
pub use entry::Entry;
pub use entry::ItemType;
pub use entry::OverlayPolicy;
pub use entry::Pin;
pub use entry::PinMode;
pub use entry::TransferEvent;
pub use entry::S_IFDIR;
pub use entry::S_IFREG;
pub use error::CoreError;
pub use error::CoreResult;
pub use ids::ContentHash;
pub use ids::ETag;
pub use ids::ItemId;
pub use remote::ChunkAck;
pub use remote::ContentStream;
pub use remote::DeltaPage;
pub use remote::RemoteClient;
pub use state::ItemState;
pub use state::LastError;
