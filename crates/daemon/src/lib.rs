//! # TermHub Daemon Library
//!
//! This crate provides the shared remote-terminal session service for
//! TermHub: it opens remote shell connections on behalf of requesting
//! participants, lets several participants watch one live session, hands
//! exclusive input control between them, persists session metadata for
//! discovery across restarts, and reclaims idle sessions.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Terminal Session Manager                     │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌──────────────┐  ┌───────────────┐  ┌─────────────────────┐  │
//! │  │   Session    │  │    Stream     │  │   Snapshot Store    │  │
//! │  │   Records    │  │    Tasks      │  │   (durable cache)   │  │
//! │  └──────────────┘  └───────────────┘  └─────────────────────┘  │
//! │                                                                 │
//! │  ┌───────────────────────────────────────────────────────────┐ │
//! │  │                     Message Router                        │ │
//! │  └───────────────────────────────────────────────────────────┘ │
//! │                                                                 │
//! │  ┌───────────────────┐  ┌──────────────────────────────────┐   │
//! │  │  Transport Pool   │  │     Push-Delivery Sink           │   │
//! │  │  (SSH, pooled)    │  │     (per-participant queues)     │   │
//! │  └───────────────────┘  └──────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! One streaming task runs per live session; a single idle reaper closes
//! sessions inactive past the configured timeout. Session records and their
//! tasks live in parallel maps owned by the manager, so a record never
//! references its own task.
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`transport`]: SSH transport and the per-endpoint connection pool
//! - [`session`]: Session records, the manager, and output streaming
//! - [`delivery`]: Push-delivery channels to connected participants
//! - [`store`]: Durable snapshot store (Redis or in-memory)
//! - [`router`]: Push-channel message routing

pub mod config;
pub mod delivery;
pub mod router;
pub mod session;
pub mod store;
pub mod transport;

// Re-export protocol for convenience
pub use protocol;

// Re-export config types for convenience
pub use config::Config;

// Re-export session types for convenience
pub use session::{Session, SessionError, SessionEvent, TerminalSessionManager};

// Re-export transport types for convenience
pub use transport::{
    AuthMethod, Dial, Endpoint, PtyRequest, ShellEvent, ShellHandle, SshDialer, SshTransport,
    Transport, TransportError, TransportPool,
};

// Re-export delivery types for convenience
pub use delivery::{ChannelSink, DeliveryError, DeliveryStats, ParticipantId};

// Re-export store types for convenience
pub use store::{MemoryStore, RedisStore, Store, StoreError};

// Re-export router types for convenience
pub use router::MessageRouter;
