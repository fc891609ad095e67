//! Gateway → Client envelopes.

use serde::{Deserialize, Serialize};

use crate::events::DomainEvent;

/// One line of the control-plane wire protocol, sent by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServerEnvelope {
    #[serde(rename = "auth.ok")]
    AuthOk,
    #[serde(rename = "auth.fail")]
    AuthFail { reason: String },

    #[serde(rename = "command.result")]
    CommandResult {
        request_id: String,
        result: serde_json::Value,
    },
    #[serde(rename = "command.error")]
    CommandError {
        request_id: String,
        message: String,
    },

    #[serde(rename = "pty.output")]
    PtyOutput {
        session_id: String,
        output_cursor: u64,
        chunk_base64: String,
    },
    #[serde(rename = "pty.event")]
    PtyEvent {
        session_id: String,
        event: serde_json::Value,
    },
    #[serde(rename = "pty.exit")]
    PtyExit {
        session_id: String,
        code: Option<i32>,
        signal: Option<String>,
    },

    #[serde(rename = "stream.event")]
    StreamEvent {
        subscription_id: String,
        cursor: u64,
        event: DomainEvent,
    },
}
