//! Session status and the durable snapshot record.
//!
//! The snapshot is the transport-free representation of a session: it is
//! what the durable cache stores, what listings return, and what survives a
//! process restart. Live handles (the shell channel, the streaming task)
//! are deliberately absent from this shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for a session.
pub type SessionId = String;

/// Lifecycle state of a session.
///
/// The state machine is acyclic: `Connecting` may move to `Connected` or
/// `Error`; any state may move to `Closed`; nothing ever re-enters
/// `Connecting`. A session whose connection failed is recreated, not
/// retried in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Record allocated, transport acquisition in flight.
    Connecting,
    /// Shell is live and streaming.
    Connected,
    /// Connect or shell start failed, or the record was restored from a
    /// snapshot after a restart. Terminal for streaming.
    Error,
    /// Torn down. Terminal.
    Closed,
}

impl SessionStatus {
    /// Whether the session can never stream again.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionStatus::Error | SessionStatus::Closed)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        match (self, next) {
            (Connecting, Connected) | (Connecting, Error) => true,
            (Connecting, Closed) | (Connected, Closed) | (Error, Closed) => true,
            _ => false,
        }
    }
}

/// The persisted, transport-free snapshot of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Opaque unique identifier, assigned at creation.
    pub session_id: SessionId,
    /// Participant who created the session.
    pub owner: String,
    /// Remote host.
    pub host: String,
    /// Remote port.
    pub port: u16,
    /// Login username on the remote host.
    pub username: String,
    /// Current lifecycle state.
    pub status: SessionStatus,
    /// Participant holding exclusive input rights, if any.
    pub controller: Option<String>,
    /// Participants currently receiving the output stream.
    pub observers: Vec<String>,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
    /// Refreshed by any attach/detach/control change or successful I/O.
    pub last_activity: DateTime<Utc>,
    /// Set only when `status` is [`SessionStatus::Error`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl SessionRecord {
    /// Allocate a fresh record for `owner` targeting `username@host:port`.
    ///
    /// The owner starts as the sole observer and the controller; the state
    /// machine starts in `Connecting`.
    pub fn new(
        session_id: SessionId,
        owner: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
    ) -> Self {
        let owner = owner.into();
        let now = Utc::now();
        Self {
            session_id,
            owner: owner.clone(),
            host: host.into(),
            port,
            username: username.into(),
            status: SessionStatus::Connecting,
            controller: Some(owner.clone()),
            observers: vec![owner],
            created_at: now,
            last_activity: now,
            error_message: None,
        }
    }

    /// Whether `participant` currently observes this session.
    pub fn is_observer(&self, participant: &str) -> bool {
        self.observers.iter().any(|o| o == participant)
    }

    /// Whether `participant` currently holds input control.
    pub fn is_controller(&self, participant: &str) -> bool {
        self.controller.as_deref() == Some(participant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_value(SessionStatus::Connecting).unwrap(),
            "connecting"
        );
        assert_eq!(
            serde_json::to_value(SessionStatus::Connected).unwrap(),
            "connected"
        );
        assert_eq!(serde_json::to_value(SessionStatus::Error).unwrap(), "error");
        assert_eq!(serde_json::to_value(SessionStatus::Closed).unwrap(), "closed");
    }

    #[test]
    fn test_status_terminality() {
        assert!(!SessionStatus::Connecting.is_terminal());
        assert!(!SessionStatus::Connected.is_terminal());
        assert!(SessionStatus::Error.is_terminal());
        assert!(SessionStatus::Closed.is_terminal());
    }

    #[test]
    fn test_valid_transitions() {
        use SessionStatus::*;
        assert!(Connecting.can_transition(Connected));
        assert!(Connecting.can_transition(Error));
        assert!(Connecting.can_transition(Closed));
        assert!(Connected.can_transition(Closed));
        assert!(Error.can_transition(Closed));
    }

    #[test]
    fn test_no_reentry_into_connecting() {
        use SessionStatus::*;
        for state in [Connecting, Connected, Error, Closed] {
            assert!(!state.can_transition(Connecting));
        }
    }

    #[test]
    fn test_terminal_states_are_sinks() {
        use SessionStatus::*;
        assert!(!Closed.can_transition(Connected));
        assert!(!Closed.can_transition(Error));
        assert!(!Error.can_transition(Connected));
        // Teardown of a failed record is the one move out of Error.
        assert!(Error.can_transition(Closed));
    }

    #[test]
    fn test_connected_cannot_error_directly() {
        // An unrecoverable I/O failure tears the session down to Closed;
        // Error is reserved for connect-time failures and restored records.
        assert!(!SessionStatus::Connected.can_transition(SessionStatus::Error));
    }

    #[test]
    fn test_new_record_initial_shape() {
        let record = SessionRecord::new("sid-1".to_string(), "ada", "10.0.0.5", 22, "deploy");
        assert_eq!(record.status, SessionStatus::Connecting);
        assert_eq!(record.controller.as_deref(), Some("ada"));
        assert_eq!(record.observers, vec!["ada".to_string()]);
        assert!(record.error_message.is_none());
        assert_eq!(record.created_at, record.last_activity);
    }

    #[test]
    fn test_membership_helpers() {
        let mut record = SessionRecord::new("sid-2".to_string(), "ada", "h", 22, "u");
        assert!(record.is_observer("ada"));
        assert!(record.is_controller("ada"));
        assert!(!record.is_observer("grace"));

        record.observers.push("grace".to_string());
        assert!(record.is_observer("grace"));
        assert!(!record.is_controller("grace"));
    }

    #[test]
    fn test_record_json_roundtrip() {
        let record = SessionRecord::new("sid-3".to_string(), "ada", "example.net", 2200, "ops");
        let json = serde_json::to_string(&record).unwrap();
        let parsed: SessionRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(record, parsed);
    }

    #[test]
    fn test_record_snapshot_fields() {
        // The persisted shape carries exactly the documented metadata and
        // never any live handle.
        let record = SessionRecord::new("sid-4".to_string(), "ada", "example.net", 22, "ops");
        let json = serde_json::to_value(&record).unwrap();
        let obj = json.as_object().unwrap();
        for field in [
            "session_id",
            "owner",
            "host",
            "port",
            "username",
            "status",
            "controller",
            "observers",
            "created_at",
            "last_activity",
        ] {
            assert!(obj.contains_key(field), "missing field {field}");
        }
        // error_message is omitted while unset
        assert!(!obj.contains_key("error_message"));
    }
}
