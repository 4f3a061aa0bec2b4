//! # TermHub Protocol Library
//!
//! This crate provides the shared message and record definitions for the
//! TermHub shared-terminal system.
//!
//! ## Overview
//!
//! The protocol crate is the boundary between the session service and its
//! collaborators, providing:
//!
//! - **Push-channel messages**: the tagged message set exchanged with
//!   connected participants (input, terminal output, close/error notices)
//! - **Management types**: request/response shapes for session lifecycle
//!   operations, independent of any particular transport mapping
//! - **Session records**: the durable, transport-free snapshot of a session
//!   used for listing and restart-time discovery
//!
//! All wire shapes are plain JSON; the message enums are closed sums so
//! handling code matches exhaustively instead of probing string-keyed maps.
//!
//! ## Modules
//!
//! - [`messages`]: push-channel and management message definitions
//! - [`session`]: session status state machine and the snapshot record

pub mod messages;
pub mod session;

pub use messages::{
    ClientMessage, CreateSessionRequest, CreateSessionResponse, FailureReason, OperationOutcome,
    ServerMessage, SessionTarget, DEFAULT_SSH_PORT,
};
pub use session::{SessionId, SessionRecord, SessionStatus};
