// questkeeper-core/src/stores/mod.rs

//! Client-side mirrors of server-held game state.
//!
//! The game server is the source of truth; these stores are refreshed
//! copies the UI reads between turns. They are updated by the sync pass
//! after tool batches and by the backup poll, never written speculatively.

pub mod combat;
pub mod game;
