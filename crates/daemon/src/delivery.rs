//! Push-delivery channel to connected participants.
//!
//! The session layer fans terminal output out through this registry: one
//! bounded channel per connected participant. Slow consumers are handled by
//! dropping their own messages (try_send) rather than blocking the fan-out
//! for everyone else; backpressure transitions and drop counts are tracked
//! per participant.
//!
//! Delivery is best-effort. A failed delivery never changes who observes a
//! session; membership changes go only through the session manager.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::RwLock;

use protocol::ServerMessage;

/// Unique identifier for a participant.
pub type ParticipantId = String;

/// Default channel capacity for a participant's outbound queue.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Delivery failures, reported to the caller but never fatal to a session.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// The participant has no registered push channel.
    #[error("participant not connected: {0}")]
    NotConnected(ParticipantId),

    /// The participant's queue was full; the message was dropped.
    #[error("participant lagging, message dropped: {0}")]
    Lagged(ParticipantId),
}

/// Statistics about a participant's delivery handling.
#[derive(Debug, Clone, Default)]
pub struct DeliveryStats {
    /// Total messages delivered successfully.
    pub messages_sent: u64,
    /// Messages dropped because the participant was slow.
    pub messages_dropped: u64,
    /// Whether the participant is currently experiencing backpressure.
    pub is_backpressured: bool,
}

/// A registered participant's outbound queue.
struct ParticipantHandle {
    tx: mpsc::Sender<ServerMessage>,
    stats: DeliveryStats,
    backpressured: AtomicBool,
}

impl ParticipantHandle {
    fn new(capacity: usize) -> (Self, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                stats: DeliveryStats::default(),
                backpressured: AtomicBool::new(false),
            },
            rx,
        )
    }

    fn try_send(&mut self, participant: &str, message: ServerMessage) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => {
                self.stats.messages_sent += 1;
                if self.backpressured.swap(false, Ordering::Relaxed) {
                    tracing::debug!(
                        participant = %participant,
                        "participant recovered from backpressure"
                    );
                }
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.stats.messages_dropped += 1;
                if !self.backpressured.swap(true, Ordering::Relaxed) {
                    tracing::warn!(
                        participant = %participant,
                        dropped = self.stats.messages_dropped,
                        "participant is backpressured, dropping messages"
                    );
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(participant = %participant, "participant channel closed");
                false
            }
        }
    }

    fn stats(&self) -> DeliveryStats {
        let mut stats = self.stats.clone();
        stats.is_backpressured = self.backpressured.load(Ordering::Relaxed);
        stats
    }
}

/// Registry of per-participant push channels.
pub struct ChannelSink {
    participants: RwLock<HashMap<ParticipantId, ParticipantHandle>>,
}

impl ChannelSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self {
            participants: RwLock::new(HashMap::new()),
        }
    }

    /// Register a participant's push channel, returning the receiving end.
    ///
    /// Re-registering replaces the previous channel (latest connection
    /// wins).
    pub async fn register(&self, participant: impl Into<ParticipantId>) -> mpsc::Receiver<ServerMessage> {
        self.register_with_capacity(participant, DEFAULT_CHANNEL_CAPACITY)
            .await
    }

    /// Register with a specific queue capacity.
    pub async fn register_with_capacity(
        &self,
        participant: impl Into<ParticipantId>,
        capacity: usize,
    ) -> mpsc::Receiver<ServerMessage> {
        let participant = participant.into();
        let (handle, rx) = ParticipantHandle::new(capacity);
        let mut participants = self.participants.write().await;
        participants.insert(participant.clone(), handle);
        tracing::debug!(participant = %participant, "registered push channel");
        rx
    }

    /// Remove a participant's push channel, returning final statistics.
    pub async fn unregister(&self, participant: &str) -> Option<DeliveryStats> {
        let mut participants = self.participants.write().await;
        participants.remove(participant).map(|h| h.stats())
    }

    /// Deliver one message to one participant.
    pub async fn deliver(
        &self,
        participant: &str,
        message: ServerMessage,
    ) -> Result<(), DeliveryError> {
        let mut participants = self.participants.write().await;
        let Some(handle) = participants.get_mut(participant) else {
            return Err(DeliveryError::NotConnected(participant.to_string()));
        };

        if handle.tx.is_closed() {
            participants.remove(participant);
            return Err(DeliveryError::NotConnected(participant.to_string()));
        }

        if handle.try_send(participant, message) {
            Ok(())
        } else {
            Err(DeliveryError::Lagged(participant.to_string()))
        }
    }

    /// Number of registered participants.
    pub async fn connected_count(&self) -> usize {
        self.participants.read().await.len()
    }

    /// Statistics for one participant.
    pub async fn stats(&self, participant: &str) -> Option<DeliveryStats> {
        self.participants
            .read()
            .await
            .get(participant)
            .map(|h| h.stats())
    }
}

impl Default for ChannelSink {
    fn default() -> Self {
        Self::new()
    }
}
