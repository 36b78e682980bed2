// questkeeper-core/src/mcp/mod.rs

//! Connection to the external game-state server.
//!
//! [`client`] owns the child process and the MCP session; [`envelope`] holds
//! the tolerant decoding rules for the `{"content": [...]}` result envelopes
//! every tool answer arrives in.

pub mod client;
pub mod envelope;

pub use client::{GameServerClient, ToolClient};
