//! Transport pool.
//!
//! Caches one transport per endpoint so repeated sessions to the same host
//! reuse a live connection. Entries are insertion-ordered; when the pool is
//! full the oldest dead entry is evicted. A transport still in use is never
//! evicted to make room: the pool prefers running over its bound to
//! force-closing a connection a session may depend on.

use std::sync::Arc;

use tokio::sync::Mutex;

use super::{AuthMethod, Dial, Endpoint, PtyRequest, ShellHandle, Transport, TransportError};

/// Pool of live transports keyed by endpoint.
pub struct TransportPool<D: Dial> {
    dialer: D,
    entries: Mutex<Vec<(Endpoint, Arc<D::Transport>)>>,
    max_entries: usize,
}

impl<D: Dial> TransportPool<D> {
    /// Create a pool bounded at `max_entries` transports.
    pub fn new(dialer: D, max_entries: usize) -> Self {
        Self {
            dialer,
            entries: Mutex::new(Vec::new()),
            max_entries,
        }
    }

    /// Return a live transport for `endpoint`, reusing a cached one when it
    /// is still alive, otherwise discarding the stale entry and dialing
    /// fresh.
    pub async fn acquire(
        &self,
        endpoint: &Endpoint,
        auth: &AuthMethod,
    ) -> Result<Arc<D::Transport>, TransportError> {
        let mut entries = self.entries.lock().await;

        if let Some(pos) = entries.iter().position(|(e, _)| e == endpoint) {
            if entries[pos].1.is_alive() {
                tracing::debug!(endpoint = %endpoint, "reusing pooled transport");
                return Ok(Arc::clone(&entries[pos].1));
            }
            tracing::debug!(endpoint = %endpoint, "discarding dead pooled transport");
            entries.remove(pos);
        }

        let transport = Arc::new(self.dialer.dial(endpoint, auth).await?);

        if entries.len() >= self.max_entries {
            if let Some(pos) = entries.iter().position(|(_, t)| !t.is_alive()) {
                let (evicted, dead) = entries.remove(pos);
                dead.disconnect().await;
                tracing::debug!(endpoint = %evicted, "evicted oldest dead transport");
            } else {
                tracing::warn!(
                    size = entries.len(),
                    max = self.max_entries,
                    "transport pool over bound with no dead entry to evict"
                );
            }
        }

        entries.push((endpoint.clone(), Arc::clone(&transport)));
        Ok(transport)
    }

    /// Open a shell on a pooled transport.
    ///
    /// A cached connection can die between the liveness check and the
    /// channel open; that case is retried once on a fresh connection before
    /// the error surfaces.
    pub async fn open_shell(
        &self,
        endpoint: &Endpoint,
        auth: &AuthMethod,
        pty: &PtyRequest,
    ) -> Result<ShellHandle, TransportError> {
        let transport = self.acquire(endpoint, auth).await?;
        match transport.open_shell(pty).await {
            Ok(shell) => Ok(shell),
            Err(TransportError::Dead(reason)) => {
                tracing::warn!(
                    endpoint = %endpoint,
                    reason = %reason,
                    "pooled transport died; retrying on a fresh connection"
                );
                self.discard(endpoint).await;
                let fresh = self.acquire(endpoint, auth).await?;
                fresh.open_shell(pty).await
            }
            Err(e) => Err(e),
        }
    }

    /// Drop the entry for `endpoint`, disconnecting it.
    async fn discard(&self, endpoint: &Endpoint) {
        let removed = {
            let mut entries = self.entries.lock().await;
            entries
                .iter()
                .position(|(e, _)| e == endpoint)
                .map(|pos| entries.remove(pos))
        };
        if let Some((_, transport)) = removed {
            transport.disconnect().await;
        }
    }

    /// Number of tracked transports.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Whether the pool tracks no transports.
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Disconnect and drop every tracked transport. Process shutdown only.
    pub async fn close(&self) {
        let drained: Vec<_> = {
            let mut entries = self.entries.lock().await;
            entries.drain(..).collect()
        };
        for (endpoint, transport) in drained {
            tracing::debug!(endpoint = %endpoint, "closing pooled transport");
            transport.disconnect().await;
        }
    }
}
