//! Delta reconciliation engine and conflict resolver (spec §4.6/§4.7).
//! `DeltaEngine::run` is the one async entry point in the workspace.

mod conflict;
mod engine;

pub use conflict::ConflictResolver;
pub use conflict::ConflictStrategy;
pub use engine::ChangeTrigger;
pub use engine::DeltaEngine;
