//! Harness control-plane protocol
//!
//! Wire types shared between the gateway and its clients (TUI mux, launcher,
//! and any other control-plane consumer). Framed as LF-terminated JSON lines;
//! see each module for the envelope shapes.

use uuid::Uuid;

pub mod client;
pub mod command;
pub mod events;
pub mod server;
pub mod types;

pub use client::{ClientEnvelope, SignalKind};
pub use command::{CommandRequest, ScopeFilter, StreamFilter};
pub use events::DomainEvent;
pub use server::ServerEnvelope;
pub use types::*;

/// Generate a new unique id.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
