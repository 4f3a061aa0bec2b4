//! Session management module.
//!
//! A [`Session`] pairs the durable record (what gets persisted and listed)
//! with the ephemeral live state that never leaves this process: the shell
//! input sender and the shared activity clock. All mutation goes through
//! the manager's per-session critical section; the streaming task only
//! reads observer snapshots and touches the activity clock.

pub mod broadcaster;
pub mod manager;

pub use broadcaster::StreamTask;
pub use manager::TerminalSessionManager;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;

use protocol::{FailureReason, SessionId, SessionRecord, SessionStatus};

use crate::transport::TransportError;

/// Errors from session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The session was not found (or has expired).
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// The participant does not observe the session.
    #[error("participant {participant} is not an observer of session {session_id}")]
    NotAnObserver {
        /// Session the operation referenced.
        session_id: SessionId,
        /// Participant that was rejected.
        participant: String,
    },

    /// The participant does not hold input control.
    #[error("participant {participant} does not control session {session_id}")]
    NotController {
        /// Session the input referenced.
        session_id: SessionId,
        /// Sender whose input was dropped.
        participant: String,
    },

    /// The session has no live shell to write to.
    #[error("session not connected: {0}")]
    NotConnected(SessionId),

    /// A transport-level failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl SessionError {
    /// Machine-readable reason for management responses.
    pub fn reason(&self) -> FailureReason {
        match self {
            SessionError::NotFound(_) => FailureReason::SessionNotFound,
            SessionError::NotAnObserver { .. } => FailureReason::NotAnObserver,
            SessionError::NotController { .. } => FailureReason::NotController,
            SessionError::NotConnected(_) => FailureReason::SessionNotFound,
            SessionError::Transport(TransportError::AuthenticationMissing) => {
                FailureReason::AuthenticationMissing
            }
            SessionError::Transport(TransportError::AuthenticationFailed(_)) => {
                FailureReason::AuthenticationFailed
            }
            SessionError::Transport(_) => FailureReason::EndpointUnreachable,
        }
    }
}

/// Internal signals from streaming tasks back to the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The session's shell process ended; tear the session down.
    ShellExited(SessionId),
}

/// Shared activity timestamp between the manager's operation paths and the
/// streaming task. Epoch milliseconds in an atomic so the hot path never
/// takes the session lock.
pub struct ActivityClock(AtomicU64);

impl ActivityClock {
    /// Current wall clock in epoch milliseconds.
    pub fn now_millis() -> u64 {
        Utc::now().timestamp_millis().max(0) as u64
    }

    /// A clock starting at `at`.
    pub fn starting_at(at: DateTime<Utc>) -> Self {
        Self(AtomicU64::new(at.timestamp_millis().max(0) as u64))
    }

    /// Record activity now.
    pub fn touch(&self) {
        self.0.store(Self::now_millis(), Ordering::Relaxed);
    }

    /// Last recorded activity in epoch milliseconds.
    pub fn last_millis(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    /// Last recorded activity as a timestamp.
    pub fn last(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.last_millis() as i64).unwrap_or_else(Utc::now)
    }

    /// How long since the last recorded activity.
    pub fn idle_for(&self) -> Duration {
        Duration::from_millis(Self::now_millis().saturating_sub(self.last_millis()))
    }

    /// Test hook for aging a session without waiting.
    #[cfg(test)]
    pub(crate) fn set_last_millis(&self, millis: u64) {
        self.0.store(millis, Ordering::Relaxed);
    }
}

/// One shared terminal session: the durable record plus live-only state.
pub struct Session {
    record: SessionRecord,
    /// Input sender for the live shell; absent until connected, dropped on
    /// close. Never persisted.
    input: Option<mpsc::Sender<Vec<u8>>>,
    activity: Arc<ActivityClock>,
}

impl Session {
    /// Wrap a record; the activity clock starts from its `last_activity`.
    pub fn new(record: SessionRecord) -> Self {
        let activity = Arc::new(ActivityClock::starting_at(record.last_activity));
        Self {
            record,
            input: None,
            activity,
        }
    }

    /// The underlying record (live `last_activity` not yet folded in).
    pub fn record(&self) -> &SessionRecord {
        &self.record
    }

    /// A snapshot of the record with `last_activity` synced from the clock.
    pub fn snapshot(&self) -> SessionRecord {
        let mut record = self.record.clone();
        record.last_activity = self.activity.last();
        record
    }

    /// Shared handle to the activity clock.
    pub fn activity(&self) -> Arc<ActivityClock> {
        Arc::clone(&self.activity)
    }

    /// Record activity now.
    pub fn touch(&self) {
        self.activity.touch();
    }

    /// Move the state machine to `next`. Invalid transitions are refused
    /// and logged; entering a non-error state clears `error_message`.
    pub fn set_status(&mut self, next: SessionStatus) -> bool {
        if !self.record.status.can_transition(next) {
            tracing::debug!(
                session_id = %self.record.session_id,
                from = ?self.record.status,
                to = ?next,
                "refused invalid status transition"
            );
            return false;
        }
        self.record.status = next;
        if next != SessionStatus::Error {
            self.record.error_message = None;
        }
        true
    }

    /// Transition to `Error` with a message. No-op when the state machine
    /// forbids it (e.g. the session was already closed).
    pub fn mark_error(&mut self, message: impl Into<String>) -> bool {
        if !self.record.status.can_transition(SessionStatus::Error) {
            return false;
        }
        self.record.status = SessionStatus::Error;
        self.record.error_message = Some(message.into());
        true
    }

    /// Attach the live shell's input sender.
    pub fn attach_input(&mut self, input: mpsc::Sender<Vec<u8>>) {
        self.input = Some(input);
    }

    /// Drop the live shell's input sender, closing the shell's stdin.
    pub fn clear_input(&mut self) {
        self.input = None;
    }

    /// The live shell's input sender, when connected.
    pub fn input(&self) -> Option<&mpsc::Sender<Vec<u8>>> {
        self.input.as_ref()
    }

    /// Add `participant` to the observers (idempotent).
    pub fn add_observer(&mut self, participant: &str) {
        if !self.record.is_observer(participant) {
            self.record.observers.push(participant.to_string());
        }
    }

    /// Remove `participant` from the observers. A departing controller
    /// loses control with no implicit handoff. Returns the number of
    /// observers left.
    pub fn remove_observer(&mut self, participant: &str) -> usize {
        self.record.observers.retain(|o| o != participant);
        if self.record.controller.as_deref() == Some(participant) {
            self.record.controller = None;
        }
        self.record.observers.len()
    }

    /// Hand input control to `participant`. Fails unless they observe the
    /// session; the previous controller is silently displaced.
    pub fn set_controller(&mut self, participant: &str) -> bool {
        if !self.record.is_observer(participant) {
            return false;
        }
        self.record.controller = Some(participant.to_string());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(SessionRecord::new(
            "sid".to_string(),
            "ada",
            "host",
            22,
            "ops",
        ))
    }

    #[test]
    fn test_initial_invariant() {
        let s = session();
        assert_eq!(s.record().observers, vec!["ada".to_string()]);
        assert_eq!(s.record().controller.as_deref(), Some("ada"));
    }

    #[test]
    fn test_controller_always_an_observer() {
        let mut s = session();

        // An outsider can never become controller.
        assert!(!s.set_controller("grace"));
        assert_eq!(s.record().controller.as_deref(), Some("ada"));

        s.add_observer("grace");
        assert!(s.set_controller("grace"));
        assert_eq!(s.record().controller.as_deref(), Some("grace"));
        assert!(s.record().is_observer("grace"));
    }

    #[test]
    fn test_detaching_controller_clears_control() {
        let mut s = session();
        s.add_observer("grace");
        assert!(s.set_controller("grace"));

        let remaining = s.remove_observer("grace");
        assert_eq!(remaining, 1);
        // No implicit handoff.
        assert_eq!(s.record().controller, None);
    }

    #[test]
    fn test_invariant_under_adversarial_orderings() {
        let mut s = session();
        let check = |s: &Session| {
            if let Some(c) = &s.record().controller {
                assert!(s.record().is_observer(c), "controller {c} not an observer");
            }
        };

        s.add_observer("grace");
        check(&s);
        s.add_observer("grace"); // duplicate attach is idempotent
        assert_eq!(s.record().observers.len(), 2);
        check(&s);
        s.set_controller("grace");
        check(&s);
        s.remove_observer("ada");
        check(&s);
        s.set_controller("ada"); // no longer an observer, must fail
        assert_eq!(s.record().controller.as_deref(), Some("grace"));
        check(&s);
        s.remove_observer("grace");
        check(&s);
        assert_eq!(s.record().controller, None);
        assert!(s.record().observers.is_empty());
    }

    #[test]
    fn test_set_status_enforces_state_machine() {
        let mut s = session();
        assert!(s.set_status(SessionStatus::Connected));
        assert!(!s.set_status(SessionStatus::Connected));
        assert!(!s.set_status(SessionStatus::Error));
        assert!(s.set_status(SessionStatus::Closed));
        assert!(!s.set_status(SessionStatus::Connected));
    }

    #[test]
    fn test_mark_error_sets_message() {
        let mut s = session();
        assert!(s.mark_error("connection refused"));
        assert_eq!(s.record().status, SessionStatus::Error);
        assert_eq!(s.record().error_message.as_deref(), Some("connection refused"));
    }

    #[test]
    fn test_mark_error_refused_after_close() {
        let mut s = session();
        s.set_status(SessionStatus::Closed);
        assert!(!s.mark_error("too late"));
        assert_eq!(s.record().status, SessionStatus::Closed);
        assert!(s.record().error_message.is_none());
    }

    #[test]
    fn test_connected_clears_error_message() {
        let mut s = session();
        s.record.error_message = Some("stale".to_string());
        assert!(s.set_status(SessionStatus::Connected));
        assert!(s.record().error_message.is_none());
    }

    #[test]
    fn test_snapshot_syncs_activity() {
        let s = session();
        let before = s.snapshot().last_activity;
        std::thread::sleep(Duration::from_millis(5));
        s.touch();
        let after = s.snapshot().last_activity;
        assert!(after > before);
    }

    #[test]
    fn test_activity_clock_idle_measurement() {
        let clock = ActivityClock::starting_at(Utc::now() - chrono::Duration::seconds(90));
        assert!(clock.idle_for() >= Duration::from_secs(89));

        clock.touch();
        assert!(clock.idle_for() < Duration::from_secs(1));
    }

    #[test]
    fn test_error_reasons() {
        let err = SessionError::NotFound("x".to_string());
        assert_eq!(err.reason(), FailureReason::SessionNotFound);

        let err = SessionError::NotController {
            session_id: "x".to_string(),
            participant: "p".to_string(),
        };
        assert_eq!(err.reason(), FailureReason::NotController);

        let err = SessionError::Transport(TransportError::AuthenticationMissing);
        assert_eq!(err.reason(), FailureReason::AuthenticationMissing);

        let err = SessionError::Transport(TransportError::Unreachable("x".to_string()));
        assert_eq!(err.reason(), FailureReason::EndpointUnreachable);
    }
}
