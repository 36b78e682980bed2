// questkeeper-core/src/models/mod.rs

//! Canonical message and tool shapes.
//!
//! Every provider adapter converts between these types and its own wire
//! format at its boundary; nothing outside `providers` sees provider JSON.

pub mod chat;
pub mod tools;
