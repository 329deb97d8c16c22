//! Durable metadata catalog (`MetadataStore`) and item state machine
//! (`StateManager`) — spec §4.1/§4.2.

mod state_manager;
mod store;

pub use state_manager::EventKind;
pub use state_manager::StateManager;
pub use state_manager::TransitionOptions;
pub use store::MetadataStore;
