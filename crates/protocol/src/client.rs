//! Client → Gateway envelopes.

use serde::{Deserialize, Serialize};

use crate::command::CommandRequest;

/// Signal a client can request be delivered to a PTY's foreground process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Interrupt,
    Terminate,
    Eof,
}

/// One line of the control-plane wire protocol, sent by a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClientEnvelope {
    Auth {
        token: String,
    },
    Command {
        request_id: String,
        #[serde(flatten)]
        command: CommandRequest,
    },
    #[serde(rename = "pty.input")]
    PtyInput {
        session_id: String,
        data_base64: String,
    },
    #[serde(rename = "pty.resize")]
    PtyResize {
        session_id: String,
        cols: u16,
        rows: u16,
    },
    #[serde(rename = "pty.signal")]
    PtySignal {
        session_id: String,
        kind: SignalKind,
    },
}
