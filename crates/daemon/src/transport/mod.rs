//! Remote shell transport layer.
//!
//! This module defines the transport abstraction the session layer runs on:
//! an authenticated connection to a remote host over which PTY-backed shells
//! can be opened. The concrete SSH implementation lives in [`ssh`]; the
//! connection pool in [`pool`] reuses live transports across sessions that
//! target the same endpoint.

pub mod pool;
pub mod ssh;

pub use pool::TransportPool;
pub use ssh::{SshDialer, SshTransport};

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// A remote target, and the key transports are pooled under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// Remote host name or address.
    pub host: String,
    /// Remote port.
    pub port: u16,
    /// Login username.
    pub username: String,
}

impl Endpoint {
    /// Create an endpoint for `username@host:port`.
    pub fn new(host: impl Into<String>, port: u16, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.host, self.port)
    }
}

/// Errors from transport connect, shell start, and I/O paths.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No credential was supplied.
    #[error("no authentication method supplied")]
    AuthenticationMissing,

    /// The remote host rejected the supplied credential.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The endpoint could not be reached at the network level.
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),

    /// The channel or PTY/shell request failed after connecting.
    #[error("failed to start shell: {0}")]
    ShellStart(String),

    /// A previously live transport is no longer usable.
    #[error("transport dead: {0}")]
    Dead(String),

    /// The shell's input channel has gone away.
    #[error("shell input channel closed")]
    ChannelClosed,
}

/// Exactly one way of authenticating a transport connection.
#[derive(Debug, Clone)]
pub enum AuthMethod {
    /// Password authentication.
    Password(String),
    /// Private key file authentication.
    KeyFile(PathBuf),
    /// Authenticate with keys held by the local SSH agent.
    Agent,
}

impl AuthMethod {
    /// Build a method from the optional credential fields of a create
    /// request. Precedence when several are supplied: password, key file,
    /// agent. Supplying none is an error.
    pub fn from_parts(
        password: Option<String>,
        key_path: Option<String>,
        use_agent: bool,
    ) -> Result<Self, TransportError> {
        if let Some(password) = password {
            return Ok(AuthMethod::Password(password));
        }
        if let Some(path) = key_path {
            return Ok(AuthMethod::KeyFile(PathBuf::from(path)));
        }
        if use_agent {
            return Ok(AuthMethod::Agent);
        }
        Err(TransportError::AuthenticationMissing)
    }
}

/// PTY parameters for a shell request.
#[derive(Debug, Clone)]
pub struct PtyRequest {
    /// Terminal type (e.g. "xterm").
    pub term: String,
    /// Terminal width in columns.
    pub cols: u16,
    /// Terminal height in rows.
    pub rows: u16,
}

impl Default for PtyRequest {
    fn default() -> Self {
        Self {
            term: "xterm".to_string(),
            cols: 80,
            rows: 24,
        }
    }
}

/// Output produced by a running shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellEvent {
    /// Bytes from the shell's standard output.
    Stdout(Vec<u8>),
    /// Bytes from the shell's standard error.
    Stderr(Vec<u8>),
    /// The shell process ended, with its exit code when known.
    Exited(Option<u32>),
}

/// Handles to one live shell: an input sender and an output receiver.
///
/// The input side is cheaply cloneable and may be written from the session
/// layer; the output side is owned by the session's streaming task. Reads
/// are bounded (`tokio::time::timeout` around `recv`), so an idle shell
/// yields nothing rather than blocking indefinitely.
pub struct ShellHandle {
    /// Raw bytes forwarded to the shell's stdin.
    pub input: mpsc::Sender<Vec<u8>>,
    /// Ordered stream of shell output and the final exit event.
    pub output: mpsc::Receiver<ShellEvent>,
}

/// A live authenticated connection to a remote host.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Cheap, non-blocking liveness check.
    fn is_alive(&self) -> bool;

    /// Open a new PTY-backed shell over this connection. Transports support
    /// multiplexed channels, so several shells may run over one connection.
    async fn open_shell(&self, pty: &PtyRequest) -> Result<ShellHandle, TransportError>;

    /// Release the connection. Idempotent; safe to call repeatedly.
    async fn disconnect(&self);
}

/// Establishes transports. Split from [`Transport`] so the pool can be
/// exercised without a network.
#[async_trait]
pub trait Dial: Send + Sync + 'static {
    /// Transport type produced by this dialer.
    type Transport: Transport;

    /// Connect and authenticate against `endpoint`.
    async fn dial(
        &self,
        endpoint: &Endpoint,
        auth: &AuthMethod,
    ) -> Result<Self::Transport, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_display() {
        let endpoint = Endpoint::new("10.0.0.5", 2222, "deploy");
        assert_eq!(endpoint.to_string(), "deploy@10.0.0.5:2222");
    }

    #[test]
    fn test_endpoint_equality_is_pool_key() {
        let a = Endpoint::new("h", 22, "u");
        let b = Endpoint::new("h", 22, "u");
        let c = Endpoint::new("h", 23, "u");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_auth_none_supplied_fails() {
        let result = AuthMethod::from_parts(None, None, false);
        assert!(matches!(result, Err(TransportError::AuthenticationMissing)));
    }

    #[test]
    fn test_auth_single_methods() {
        assert!(matches!(
            AuthMethod::from_parts(Some("pw".into()), None, false),
            Ok(AuthMethod::Password(_))
        ));
        assert!(matches!(
            AuthMethod::from_parts(None, Some("/k".into()), false),
            Ok(AuthMethod::KeyFile(_))
        ));
        assert!(matches!(
            AuthMethod::from_parts(None, None, true),
            Ok(AuthMethod::Agent)
        ));
    }

    #[test]
    fn test_auth_precedence_password_first() {
        let method = AuthMethod::from_parts(Some("pw".into()), Some("/k".into()), true).unwrap();
        assert!(matches!(method, AuthMethod::Password(_)));

        let method = AuthMethod::from_parts(None, Some("/k".into()), true).unwrap();
        assert!(matches!(method, AuthMethod::KeyFile(_)));
    }

    #[test]
    fn test_pty_request_defaults() {
        let pty = PtyRequest::default();
        assert_eq!(pty.term, "xterm");
        assert_eq!(pty.cols, 80);
        assert_eq!(pty.rows, 24);
    }
}
