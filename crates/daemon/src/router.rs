//! Push-channel message routing.
//!
//! Thin plumbing between a participant's push channel and the session
//! manager: raw frames are parsed into the closed [`ClientMessage`] set,
//! dispatched, and failures are answered with an error notice where the
//! protocol calls for one. Input from a non-controller is dropped and
//! logged, never escalated.

use std::sync::Arc;

use protocol::{ClientMessage, ServerMessage};

use crate::delivery::ChannelSink;
use crate::session::{SessionError, TerminalSessionManager};
use crate::transport::Dial;

/// Routes push-channel traffic from participants to the session manager.
pub struct MessageRouter<D: Dial> {
    manager: Arc<TerminalSessionManager<D>>,
    sink: Arc<ChannelSink>,
}

impl<D: Dial> MessageRouter<D> {
    /// Create a router over the given manager and delivery sink.
    pub fn new(manager: Arc<TerminalSessionManager<D>>, sink: Arc<ChannelSink>) -> Self {
        Self { manager, sink }
    }

    /// Handle one raw frame arriving on `sender`'s push channel.
    ///
    /// Malformed frames are answered with an error notice and otherwise
    /// ignored.
    pub async fn handle_raw(&self, sender: &str, raw: &str) {
        match ClientMessage::from_json(raw) {
            Ok(message) => self.handle_message(sender, message).await,
            Err(e) => {
                tracing::debug!(
                    sender = %sender,
                    error = %e,
                    "malformed push-channel message"
                );
                self.send_error(sender, format!("malformed message: {e}"))
                    .await;
            }
        }
    }

    /// Dispatch a parsed client message.
    pub async fn handle_message(&self, sender: &str, message: ClientMessage) {
        match message {
            ClientMessage::Input { session_id, data } => {
                match self.manager.write_input(&session_id, sender, &data).await {
                    Ok(()) => {}
                    Err(SessionError::NotController { .. }) => {
                        // Control is cooperative, not security-enforced:
                        // input from a non-controller is dropped and logged.
                        tracing::info!(
                            session_id = %session_id,
                            sender = %sender,
                            "dropped input from non-controller"
                        );
                    }
                    Err(e) => {
                        tracing::debug!(
                            session_id = %session_id,
                            sender = %sender,
                            error = %e,
                            "input rejected"
                        );
                        self.send_error(sender, e.to_string()).await;
                    }
                }
            }
        }
    }

    async fn send_error(&self, participant: &str, message: String) {
        if let Err(e) = self
            .sink
            .deliver(participant, ServerMessage::Error { message })
            .await
        {
            tracing::debug!(
                participant = %participant,
                error = %e,
                "could not deliver error notice"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SessionConfig, ShellConfig};
    use crate::session::manager::test_util::{FakeDialer, FakeDialerHandles};
    use crate::store::{MemoryStore, Store};
    use crate::transport::TransportPool;
    use protocol::{CreateSessionRequest, SessionStatus};
    use std::time::Duration;
    use tokio::time::timeout;

    async fn setup() -> (
        MessageRouter<FakeDialer>,
        Arc<TerminalSessionManager<FakeDialer>>,
        Arc<ChannelSink>,
        FakeDialerHandles,
    ) {
        let (dialer, handles) = FakeDialer::new();
        let pool = Arc::new(TransportPool::new(dialer, 4));
        let store = Arc::new(Store::Memory(MemoryStore::new()));
        let sink = Arc::new(ChannelSink::new());
        let shell_cfg = ShellConfig {
            read_timeout_ms: 50,
            poll_interval_ms: 10,
            ..ShellConfig::default()
        };
        let manager = Arc::new(TerminalSessionManager::new(
            pool,
            store,
            Arc::clone(&sink),
            SessionConfig::default(),
            shell_cfg,
        ));
        manager.start().await;
        let router = MessageRouter::new(Arc::clone(&manager), Arc::clone(&sink));
        (router, manager, sink, handles)
    }

    fn request(owner: &str) -> CreateSessionRequest {
        CreateSessionRequest {
            owner: owner.to_string(),
            host: "host-a".to_string(),
            port: 22,
            username: "ops".to_string(),
            password: Some("secret".to_string()),
            key_path: None,
            use_agent: false,
            term: None,
            cols: None,
            rows: None,
        }
    }

    async fn wait_connected(manager: &TerminalSessionManager<FakeDialer>, id: &str) {
        for _ in 0..200 {
            if let Some(record) = manager.get_session(id).await {
                if record.status == SessionStatus::Connected {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("session {id} never connected");
    }

    #[tokio::test]
    async fn test_malformed_frame_gets_error_notice() {
        let (router, _manager, sink, _handles) = setup().await;
        let mut rx = sink.register("ada").await;

        router.handle_raw("ada", "{definitely not json").await;

        let notice = timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        match notice {
            ServerMessage::Error { message } => assert!(message.contains("malformed")),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_message_type_gets_error_notice() {
        let (router, _manager, sink, _handles) = setup().await;
        let mut rx = sink.register("ada").await;

        router
            .handle_raw("ada", r#"{"type": "resize", "cols": 80}"#)
            .await;

        assert!(matches!(
            timeout(Duration::from_millis(500), rx.recv())
                .await
                .unwrap()
                .unwrap(),
            ServerMessage::Error { .. }
        ));
    }

    #[tokio::test]
    async fn test_controller_input_forwarded() {
        let (router, manager, _sink, mut handles) = setup().await;

        let id = manager.create_session(request("ada")).await;
        let mut shell = handles.ends_rx.recv().await.unwrap();
        wait_connected(&manager, &id).await;

        let frame = format!(r#"{{"type": "input", "session_id": "{id}", "data": "ls\n"}}"#);
        router.handle_raw("ada", &frame).await;

        let written = timeout(Duration::from_millis(500), shell.input_rx.recv())
            .await
            .expect("timed out")
            .expect("input channel closed");
        assert_eq!(written, b"ls\n".to_vec());
    }

    #[tokio::test]
    async fn test_non_controller_input_silently_dropped() {
        let (router, manager, sink, mut handles) = setup().await;
        let mut grace_rx = sink.register("grace").await;

        let id = manager.create_session(request("ada")).await;
        let mut shell = handles.ends_rx.recv().await.unwrap();
        wait_connected(&manager, &id).await;
        manager.attach_viewer(&id, "grace").await;

        let frame = format!(r#"{{"type": "input", "session_id": "{id}", "data": "whoami\n"}}"#);
        router.handle_raw("grace", &frame).await;

        // Dropped: no shell input, and no error notice back either.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(shell.input_rx.try_recv().is_err());
        assert!(grace_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_input_for_unknown_session_gets_error_notice() {
        let (router, _manager, sink, _handles) = setup().await;
        let mut rx = sink.register("ada").await;

        router
            .handle_raw(
                "ada",
                r#"{"type": "input", "session_id": "ghost", "data": "x"}"#,
            )
            .await;

        let notice = timeout(Duration::from_millis(500), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        match notice {
            ServerMessage::Error { message } => assert!(message.contains("not found")),
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
