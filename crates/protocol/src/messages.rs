//! Push-channel and management message definitions for TermHub.
//!
//! This module defines the message types exchanged over the push-delivery
//! channel between the hub and connected participants, plus the
//! method-agnostic request/response shapes for session management
//! operations. All messages are serialized as JSON.

use serde::{Deserialize, Serialize};

/// Default SSH port used when a create request omits one.
pub const DEFAULT_SSH_PORT: u16 = 22;

// ============================================================================
// Push-channel messages
// ============================================================================

/// Messages sent by a participant over the push channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Raw input for a session's shell. Forwarded verbatim only when the
    /// sender is the session's current controller.
    Input {
        /// Session the input is destined for.
        session_id: String,
        /// Raw text to forward to the shell's input.
        data: String,
    },
}

impl ClientMessage {
    /// Parse a raw push-channel frame.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// Messages delivered to participants over the push channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// A chunk of terminal output from a session's shell.
    TerminalOutput {
        /// Session that produced the output.
        session_id: String,
        /// Output text (lossily decoded; the observer's display layer owns
        /// escape-sequence interpretation).
        data: String,
    },
    /// The session's shell ended or the session was closed.
    TerminalClosed {
        /// Session that closed.
        session_id: String,
    },
    /// A malformed or undeliverable client message.
    Error {
        /// Human-readable description of what was wrong.
        message: String,
    },
}

impl ServerMessage {
    /// Serialize for the push channel.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ============================================================================
// Management operations
// ============================================================================

/// Request to open a new shared terminal session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSessionRequest {
    /// Participant creating (and initially controlling) the session.
    pub owner: String,
    /// Remote host to connect to.
    pub host: String,
    /// Remote port (default 22).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Login username on the remote host.
    pub username: String,
    /// Password credential, if using password authentication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Path to a private key file, if using key authentication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<String>,
    /// Use the local SSH agent for authentication.
    #[serde(default)]
    pub use_agent: bool,
    /// Terminal type requested for the PTY (default "xterm").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub term: Option<String>,
    /// Initial terminal width in columns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cols: Option<u16>,
    /// Initial terminal height in rows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<u16>,
}

fn default_port() -> u16 {
    DEFAULT_SSH_PORT
}

/// Response confirming session creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSessionResponse {
    /// Identifier of the newly allocated session.
    pub session_id: String,
}

/// Addressing shape shared by attach/detach/control/close requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTarget {
    /// Session the operation applies to.
    pub session_id: String,
    /// Participant performing (or affected by) the operation.
    pub participant: String,
}

/// Machine-readable reason attached to a failed management operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The referenced session does not exist (or has expired).
    SessionNotFound,
    /// The participant is not an observer of the session.
    NotAnObserver,
    /// The sender does not hold input control.
    NotController,
    /// No credential was supplied with a create request.
    AuthenticationMissing,
    /// The supplied credential was rejected by the remote host.
    AuthenticationFailed,
    /// The remote endpoint could not be reached.
    EndpointUnreachable,
}

/// Success/failure envelope returned by management operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationOutcome {
    /// Whether the operation took effect.
    pub ok: bool,
    /// Set only on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
}

impl OperationOutcome {
    /// A successful outcome.
    pub fn ok() -> Self {
        Self { ok: true, reason: None }
    }

    /// A failed outcome with the given reason.
    pub fn failed(reason: FailureReason) -> Self {
        Self { ok: false, reason: Some(reason) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_message_shape() {
        let msg = ClientMessage::Input {
            session_id: "s-1".to_string(),
            data: "ls -la\n".to_string(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "input");
        assert_eq!(json["session_id"], "s-1");
        assert_eq!(json["data"], "ls -la\n");
    }

    #[test]
    fn test_input_message_parse() {
        let raw = r#"{"type": "input", "session_id": "abc", "data": "echo hi\n"}"#;
        let msg = ClientMessage::from_json(raw).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Input {
                session_id: "abc".to_string(),
                data: "echo hi\n".to_string(),
            }
        );
    }

    #[test]
    fn test_malformed_client_message_rejected() {
        assert!(ClientMessage::from_json("not json").is_err());
        assert!(ClientMessage::from_json(r#"{"type": "launch_missiles"}"#).is_err());
        assert!(ClientMessage::from_json(r#"{"data": "no type tag"}"#).is_err());
    }

    #[test]
    fn test_terminal_output_shape() {
        let msg = ServerMessage::TerminalOutput {
            session_id: "s-2".to_string(),
            data: "hello\r\n".to_string(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "terminal_output");
        assert_eq!(json["session_id"], "s-2");
        assert_eq!(json["data"], "hello\r\n");
    }

    #[test]
    fn test_terminal_closed_shape() {
        let msg = ServerMessage::TerminalClosed {
            session_id: "s-3".to_string(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "terminal_closed");
        assert_eq!(json["session_id"], "s-3");
        assert!(json.get("data").is_none());
    }

    #[test]
    fn test_error_notice_shape() {
        let msg = ServerMessage::Error {
            message: "malformed message".to_string(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["message"], "malformed message");
    }

    #[test]
    fn test_server_message_roundtrip() {
        let original = ServerMessage::TerminalOutput {
            session_id: "s-4".to_string(),
            data: "x".to_string(),
        };
        let json = original.to_json().unwrap();
        let parsed: ServerMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(original, parsed);
    }

    #[test]
    fn test_create_request_defaults() {
        let raw = r#"{"owner": "ada", "host": "10.0.0.5", "username": "deploy"}"#;
        let req: CreateSessionRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(req.port, DEFAULT_SSH_PORT);
        assert!(req.password.is_none());
        assert!(req.key_path.is_none());
        assert!(!req.use_agent);
        assert!(req.term.is_none());
    }

    #[test]
    fn test_create_request_full() {
        let raw = r#"{
            "owner": "ada",
            "host": "10.0.0.5",
            "port": 2222,
            "username": "deploy",
            "key_path": "/home/ada/.ssh/id_ed25519",
            "term": "xterm-256color",
            "cols": 120,
            "rows": 40
        }"#;
        let req: CreateSessionRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(req.port, 2222);
        assert_eq!(req.key_path.as_deref(), Some("/home/ada/.ssh/id_ed25519"));
        assert_eq!(req.cols, Some(120));
        assert_eq!(req.rows, Some(40));
    }

    #[test]
    fn test_outcome_ok_omits_reason() {
        let json = serde_json::to_value(OperationOutcome::ok()).unwrap();
        assert_eq!(json["ok"], true);
        assert!(json.get("reason").is_none());
    }

    #[test]
    fn test_outcome_failure_reason_encoding() {
        let json =
            serde_json::to_value(OperationOutcome::failed(FailureReason::SessionNotFound)).unwrap();
        assert_eq!(json["ok"], false);
        assert_eq!(json["reason"], "session_not_found");
    }

    #[test]
    fn test_failure_reason_encodings() {
        let cases = [
            (FailureReason::NotAnObserver, "not_an_observer"),
            (FailureReason::NotController, "not_controller"),
            (FailureReason::AuthenticationMissing, "authentication_missing"),
            (FailureReason::AuthenticationFailed, "authentication_failed"),
            (FailureReason::EndpointUnreachable, "endpoint_unreachable"),
        ];
        for (reason, expected) in cases {
            let json = serde_json::to_value(reason).unwrap();
            assert_eq!(json, expected);
        }
    }
}
