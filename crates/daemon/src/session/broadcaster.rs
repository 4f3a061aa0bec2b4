//! Per-session output streaming.
//!
//! One task per connected session continuously drains the shell's output
//! and fans it out to every current observer through the push-delivery
//! sink. Reads are bounded so the task stays responsive to cancellation;
//! the timeout and the idle poll cadence come from configuration.
//!
//! Delivery failures are isolated per observer: a participant without a
//! working push channel misses output but keeps their observer membership.
//! Membership changes go only through the session manager.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use protocol::{ServerMessage, SessionId};

use crate::delivery::ChannelSink;
use crate::transport::ShellEvent;

use super::{ActivityClock, Session, SessionEvent};

/// A running stream task and its cancellation token, owned by the manager
/// in a map parallel to the session records.
pub struct StreamTask {
    /// Join handle for the streaming task.
    pub handle: JoinHandle<()>,
    /// Cancels the streaming loop.
    pub cancel: CancellationToken,
}

/// Everything a stream task needs besides the shell output itself.
pub struct StreamParams {
    /// Session the output belongs to.
    pub session_id: SessionId,
    /// The session record, read for observer snapshots only.
    pub session: Arc<Mutex<Session>>,
    /// Push-delivery sink for fan-out.
    pub sink: Arc<ChannelSink>,
    /// Signal channel back to the manager.
    pub events: mpsc::UnboundedSender<SessionEvent>,
    /// Shared activity clock, touched on every successful read.
    pub activity: Arc<ActivityClock>,
    /// Bounded-read timeout.
    pub read_timeout: Duration,
    /// Pause between idle iterations.
    pub poll_interval: Duration,
}

/// Spawn the streaming task for a freshly connected session.
pub fn spawn_stream(params: StreamParams, output: mpsc::Receiver<ShellEvent>) -> StreamTask {
    let cancel = CancellationToken::new();
    let token = cancel.clone();

    let StreamParams {
        session_id,
        session,
        sink,
        events,
        activity,
        read_timeout,
        poll_interval,
    } = params;

    let handle = tokio::spawn(async move {
        let mut output = output;
        let mut shell_exited = false;

        'stream: loop {
            let read = tokio::select! {
                _ = token.cancelled() => break 'stream,
                read = tokio::time::timeout(read_timeout, output.recv()) => read,
            };

            match read {
                // Nothing available within the bounded timeout. An idle
                // shell is not an error and does not count as activity.
                Err(_elapsed) => {
                    tokio::select! {
                        _ = token.cancelled() => break 'stream,
                        _ = tokio::time::sleep(poll_interval) => {}
                    }
                }
                // Output channel gone: the reader pump ended without a
                // clean exit event.
                Ok(None) => {
                    tracing::debug!(session_id = %session_id, "shell output channel closed");
                    shell_exited = true;
                    break 'stream;
                }
                Ok(Some(event)) => {
                    let mut next = Some(event);
                    while let Some(event) = next.take() {
                        match event {
                            ShellEvent::Stdout(bytes) | ShellEvent::Stderr(bytes) => {
                                activity.touch();
                                let data = String::from_utf8_lossy(&bytes).into_owned();
                                let observers =
                                    session.lock().await.record().observers.clone();
                                deliver_to_all(
                                    &sink,
                                    &observers,
                                    &session_id,
                                    ServerMessage::TerminalOutput {
                                        session_id: session_id.clone(),
                                        data,
                                    },
                                )
                                .await;
                            }
                            ShellEvent::Exited(code) => {
                                tracing::info!(
                                    session_id = %session_id,
                                    exit_code = ?code,
                                    "shell process exited"
                                );
                                shell_exited = true;
                                break 'stream;
                            }
                        }
                        // Drain already-buffered output before pausing again.
                        next = output.try_recv().ok();
                    }
                }
            }
        }

        // One terminal notice to every observer, on both the exit and the
        // cancellation path.
        let observers = session.lock().await.record().observers.clone();
        deliver_to_all(
            &sink,
            &observers,
            &session_id,
            ServerMessage::TerminalClosed {
                session_id: session_id.clone(),
            },
        )
        .await;

        if shell_exited {
            let _ = events.send(SessionEvent::ShellExited(session_id.clone()));
        }

        tracing::debug!(session_id = %session_id, "output stream task ended");
    });

    StreamTask { handle, cancel }
}

/// Best-effort fan-out of one message to a set of observers.
async fn deliver_to_all(
    sink: &ChannelSink,
    observers: &[String],
    session_id: &str,
    message: ServerMessage,
) {
    for observer in observers {
        if let Err(e) = sink.deliver(observer, message.clone()).await {
            tracing::warn!(
                session_id = %session_id,
                observer = %observer,
                error = %e,
                "failed to deliver session output"
            );
        }
    }
}
