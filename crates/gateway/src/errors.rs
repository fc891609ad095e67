//! Domain error taxonomy. Every variant's `Display` is the exact
//! message text a client should see inside a `command.error` envelope.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    // -- not-found --
    #[error("directory not found: {0}")]
    DirectoryNotFound(String),
    #[error("conversation not found: {0}")]
    ConversationNotFound(String),
    #[error("repository not found: {0}")]
    RepositoryNotFound(String),
    #[error("task not found: {0}")]
    TaskNotFound(String),
    #[error("session not found: {0}")]
    SessionNotFound(String),

    // -- conflict --
    #[error("session already exists: {0}")]
    SessionAlreadyExists(String),
    #[error("task not ready to claim: {0}")]
    TaskNotReadyToClaim(String),
    #[error("session is claimed by {controller_type}:{controller_id}")]
    SessionClaimed {
        controller_type: String,
        controller_id: String,
    },

    // -- state --
    #[error("session is not live")]
    SessionNotLive,
    #[error("directory is archived: {0}")]
    DirectoryArchived(String),
    #[error("session snapshot unavailable")]
    SessionSnapshotUnavailable,

    // -- validation --
    #[error("invalid value for {field}: {reason}")]
    Validation { field: String, reason: String },
    #[error("unsupported command type")]
    UnsupportedCommandType,

    // -- auth --
    #[error("authentication required")]
    AuthenticationRequired,
    #[error("invalid auth token")]
    InvalidAuthToken,

    // -- capacity (never surfaced to the client; the connection is destroyed) --
    #[error("connection buffer overflow")]
    ConnectionBufferOverflow,

    // -- upstream (logged, never propagated) --
    #[error("upstream failure: {0}")]
    Upstream(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Render the way `command.error`'s `message` field does: `Error: <message>`.
    pub fn as_command_error_message(&self) -> String {
        format!("Error: {}", self)
    }
}

impl From<rusqlite::Error> for GatewayError {
    fn from(e: rusqlite::Error) -> Self {
        GatewayError::Internal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_error_message_is_prefixed() {
        let err = GatewayError::SessionAlreadyExists("abc".to_string());
        assert_eq!(err.as_command_error_message(), "Error: session already exists: abc");
    }

    #[test]
    fn claimed_message_names_the_controller() {
        let err = GatewayError::SessionClaimed {
            controller_type: "agent".to_string(),
            controller_id: "owner".to_string(),
        };
        assert_eq!(err.to_string(), "session is claimed by agent:owner");
    }
}
