//! Session manager for shared remote terminal sessions.
//!
//! The manager owns every session record and, in a parallel map keyed by
//! session id, the streaming task attached to it. Records never reference
//! their tasks directly; cancellation goes through the manager, which keeps
//! the record/task relationship acyclic.
//!
//! All record mutation happens inside a per-session critical section (one
//! `Mutex<Session>` per record); cross-session operations like listing
//! never block other sessions. Nothing suspends while a critical section is
//! held: snapshot writes to the durable cache happen after the lock is
//! released.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use protocol::{CreateSessionRequest, SessionId, SessionRecord, SessionStatus};

use crate::config::{SessionConfig, ShellConfig};
use crate::delivery::ChannelSink;
use crate::store::Store;
use crate::transport::{AuthMethod, Dial, Endpoint, PtyRequest, ShellHandle, TransportPool};

use super::broadcaster::{spawn_stream, StreamParams, StreamTask};
use super::{Session, SessionError, SessionEvent};

/// Orchestrates create/attach/detach/control/close for every session, plus
/// the idle reaper and restart-time restore.
pub struct TerminalSessionManager<D: Dial> {
    /// Session records, one critical section each.
    sessions: DashMap<SessionId, Arc<Mutex<Session>>>,
    /// Streaming tasks, parallel to `sessions`.
    tasks: DashMap<SessionId, StreamTask>,
    pool: Arc<TransportPool<D>>,
    store: Arc<Store>,
    sink: Arc<ChannelSink>,
    session_cfg: SessionConfig,
    shell_cfg: ShellConfig,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
    background: Mutex<Vec<JoinHandle<()>>>,
    shutdown_token: CancellationToken,
}

impl<D: Dial> TerminalSessionManager<D> {
    /// Create a manager. Call [`start`](Self::start) to launch the idle
    /// reaper and the shell-exit handler.
    pub fn new(
        pool: Arc<TransportPool<D>>,
        store: Arc<Store>,
        sink: Arc<ChannelSink>,
        session_cfg: SessionConfig,
        shell_cfg: ShellConfig,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            sessions: DashMap::new(),
            tasks: DashMap::new(),
            pool,
            store,
            sink,
            session_cfg,
            shell_cfg,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            background: Mutex::new(Vec::new()),
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Launch the background loops: the idle reaper and the handler for
    /// shell-exit signals from streaming tasks.
    pub async fn start(self: &Arc<Self>) {
        let mut background = self.background.lock().await;

        let manager = Arc::clone(self);
        background.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(manager.session_cfg.reap_interval());
            loop {
                tokio::select! {
                    _ = manager.shutdown_token.cancelled() => break,
                    _ = interval.tick() => {
                        manager.reap_idle_sessions().await;
                    }
                }
            }
        }));

        let manager = Arc::clone(self);
        background.push(tokio::spawn(async move {
            let mut events = match manager.events_rx.lock().await.take() {
                Some(rx) => rx,
                None => return,
            };
            loop {
                tokio::select! {
                    _ = manager.shutdown_token.cancelled() => break,
                    event = events.recv() => match event {
                        Some(SessionEvent::ShellExited(session_id)) => {
                            tracing::info!(
                                session_id = %session_id,
                                "shell exited; tearing session down"
                            );
                            manager.close_session(&session_id).await;
                        }
                        None => break,
                    }
                }
            }
        }));

        tracing::debug!("session manager background loops started");
    }

    /// Create a session for the request's owner and launch the
    /// connect-and-stream sequence in the background.
    ///
    /// Returns as soon as the record exists; the caller is never blocked on
    /// network I/O. Connect failures (including a missing credential) land
    /// the session in `Error` with a populated `error_message`.
    pub async fn create_session(self: &Arc<Self>, request: CreateSessionRequest) -> SessionId {
        let session_id = Uuid::new_v4().to_string();
        let record = SessionRecord::new(
            session_id.clone(),
            request.owner.clone(),
            request.host.clone(),
            request.port,
            request.username.clone(),
        );
        let session = Arc::new(Mutex::new(Session::new(record)));
        self.sessions.insert(session_id.clone(), Arc::clone(&session));
        self.persist(&session).await;

        let endpoint = Endpoint::new(request.host, request.port, request.username);
        tracing::info!(
            session_id = %session_id,
            owner = %request.owner,
            endpoint = %endpoint,
            "created terminal session"
        );

        let pty = PtyRequest {
            term: request
                .term
                .unwrap_or_else(|| self.shell_cfg.term.clone()),
            cols: request.cols.unwrap_or(self.shell_cfg.cols),
            rows: request.rows.unwrap_or(self.shell_cfg.rows),
        };

        match AuthMethod::from_parts(request.password, request.key_path, request.use_agent) {
            Ok(auth) => {
                let manager = Arc::clone(self);
                let id = session_id.clone();
                tokio::spawn(async move {
                    manager.connect_session(id, endpoint, auth, pty).await;
                });
            }
            Err(e) => {
                {
                    let mut guard = session.lock().await;
                    guard.mark_error(e.to_string());
                }
                self.persist(&session).await;
                tracing::error!(
                    session_id = %session_id,
                    error = %e,
                    "terminal session rejected"
                );
            }
        }

        session_id
    }

    /// Background half of session creation: acquire a pooled transport,
    /// start the shell, attach the input path, and spawn the stream task.
    async fn connect_session(
        self: Arc<Self>,
        session_id: SessionId,
        endpoint: Endpoint,
        auth: AuthMethod,
        pty: PtyRequest,
    ) {
        match self.pool.open_shell(&endpoint, &auth, &pty).await {
            Ok(shell) => self.attach_shell(session_id, shell).await,
            Err(e) => {
                let Some(session) = self.get_arc(&session_id) else {
                    return;
                };
                {
                    let mut guard = session.lock().await;
                    guard.mark_error(e.to_string());
                }
                self.persist(&session).await;
                tracing::error!(
                    session_id = %session_id,
                    error = %e,
                    "terminal session connection failed"
                );
            }
        }
    }

    /// Wire a freshly opened shell into its session and start streaming.
    async fn attach_shell(self: &Arc<Self>, session_id: SessionId, shell: ShellHandle) {
        let Some(session) = self.get_arc(&session_id) else {
            // Closed while connecting; dropping the handle closes the shell.
            tracing::debug!(
                session_id = %session_id,
                "session gone before connect finished; dropping shell"
            );
            return;
        };

        let ShellHandle { input, output } = shell;

        let activity = {
            let mut guard = session.lock().await;
            if !guard.set_status(SessionStatus::Connected) {
                tracing::debug!(
                    session_id = %session_id,
                    status = ?guard.record().status,
                    "session no longer connecting; dropping shell"
                );
                return;
            }
            guard.attach_input(input);
            guard.touch();
            guard.activity()
        };

        let task = spawn_stream(
            StreamParams {
                session_id: session_id.clone(),
                session: Arc::clone(&session),
                sink: Arc::clone(&self.sink),
                events: self.events_tx.clone(),
                activity,
                read_timeout: self.shell_cfg.read_timeout(),
                poll_interval: self.shell_cfg.poll_interval(),
            },
            output,
        );
        self.tasks.insert(session_id.clone(), task);

        // The session may have been closed between setting Connected and
        // registering the task; sweep up the task we just started.
        if !self.sessions.contains_key(&session_id) {
            if let Some((_, task)) = self.tasks.remove(&session_id) {
                task.cancel.cancel();
                let _ = task.handle.await;
            }
            return;
        }

        self.persist(&session).await;
        tracing::info!(session_id = %session_id, "terminal session connected");
    }

    /// Add `participant` to the session's observers. Does not grant
    /// control. Returns false when the session does not exist.
    pub async fn attach_viewer(&self, session_id: &str, participant: &str) -> bool {
        let Some(session) = self.get_arc(session_id) else {
            return false;
        };
        {
            let mut guard = session.lock().await;
            guard.add_observer(participant);
            guard.touch();
        }
        self.persist(&session).await;
        tracing::debug!(
            session_id = %session_id,
            participant = %participant,
            "viewer attached"
        );
        true
    }

    /// Remove `participant` from the session's observers. A departing
    /// controller loses control with no implicit handoff; when the last
    /// observer leaves, the session is closed.
    pub async fn detach_viewer(&self, session_id: &str, participant: &str) {
        let Some(session) = self.get_arc(session_id) else {
            return;
        };
        let remaining = {
            let mut guard = session.lock().await;
            let remaining = guard.remove_observer(participant);
            guard.touch();
            remaining
        };
        tracing::debug!(
            session_id = %session_id,
            participant = %participant,
            remaining,
            "viewer detached"
        );

        if remaining == 0 {
            tracing::info!(
                session_id = %session_id,
                "last observer detached; closing session"
            );
            self.close_session(session_id).await;
        } else {
            self.persist(&session).await;
        }
    }

    /// Hand exclusive input control to `participant`. Succeeds only for a
    /// current observer; the previous controller is silently displaced.
    pub async fn set_controller(&self, session_id: &str, participant: &str) -> bool {
        let Some(session) = self.get_arc(session_id) else {
            return false;
        };
        let granted = {
            let mut guard = session.lock().await;
            let granted = guard.set_controller(participant);
            if granted {
                guard.touch();
            }
            granted
        };
        if granted {
            self.persist(&session).await;
            tracing::debug!(
                session_id = %session_id,
                participant = %participant,
                "input control handed over"
            );
        }
        granted
    }

    /// Forward raw input to the session's shell iff `participant` is the
    /// current controller.
    pub async fn write_input(
        &self,
        session_id: &str,
        participant: &str,
        data: &str,
    ) -> Result<(), SessionError> {
        let Some(session) = self.get_arc(session_id) else {
            return Err(SessionError::NotFound(session_id.to_string()));
        };
        let input = {
            let guard = session.lock().await;
            if !guard.record().is_controller(participant) {
                return Err(SessionError::NotController {
                    session_id: session_id.to_string(),
                    participant: participant.to_string(),
                });
            }
            match guard.input() {
                Some(input) => input.clone(),
                None => return Err(SessionError::NotConnected(session_id.to_string())),
            }
        };

        input
            .send(data.as_bytes().to_vec())
            .await
            .map_err(|_| SessionError::Transport(crate::transport::TransportError::ChannelClosed))?;

        session.lock().await.touch();
        Ok(())
    }

    /// Close a session: cancel its streaming task, release the shell, and
    /// drop the record and its durable snapshot. Idempotent.
    ///
    /// The streaming task is always cancelled and joined before anything
    /// else so no stale reader survives on a transport the pool may hand to
    /// another session.
    pub async fn close_session(&self, session_id: &str) {
        if let Some((_, task)) = self.tasks.remove(session_id) {
            task.cancel.cancel();
            if let Err(e) = task.handle.await {
                tracing::debug!(
                    session_id = %session_id,
                    error = %e,
                    "stream task ended abnormally"
                );
            }
        }

        let Some((_, session)) = self.sessions.remove(session_id) else {
            return;
        };

        {
            let mut guard = session.lock().await;
            guard.set_status(SessionStatus::Closed);
            guard.clear_input();
        }

        if let Err(e) = self.store.delete(session_id).await {
            tracing::warn!(
                session_id = %session_id,
                error = %e,
                "failed to delete session snapshot"
            );
        }

        tracing::info!(session_id = %session_id, "closed terminal session");
    }

    /// Snapshot of one session.
    pub async fn get_session(&self, session_id: &str) -> Option<SessionRecord> {
        let session = self.get_arc(session_id)?;
        let snapshot = session.lock().await.snapshot();
        Some(snapshot)
    }

    /// Snapshot of all sessions, optionally restricted to those observed
    /// by `participant`.
    pub async fn list_sessions(&self, participant: Option<&str>) -> Vec<SessionRecord> {
        let arcs: Vec<_> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut records = Vec::with_capacity(arcs.len());
        for session in arcs {
            let snapshot = session.lock().await.snapshot();
            if let Some(participant) = participant {
                if !snapshot.is_observer(participant) {
                    continue;
                }
            }
            records.push(snapshot);
        }
        records
    }

    /// Number of tracked sessions.
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Repopulate session metadata from durable snapshots after a process
    /// restart.
    ///
    /// A restored record always starts with `status` forced to `Error`: a
    /// transport is never assumed alive across a restart, and the session
    /// must be recreated to stream again. Returns how many records were
    /// restored.
    pub async fn restore_on_startup(&self) -> usize {
        let records = match self.store.load_all().await {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(error = %e, "durable cache unavailable; nothing restored");
                return 0;
            }
        };

        let mut restored = 0;
        for mut record in records {
            if self.sessions.contains_key(&record.session_id) {
                continue;
            }
            record.status = SessionStatus::Error;
            record.error_message =
                Some("restored after restart; shell connection was not re-established".to_string());

            let session_id = record.session_id.clone();
            self.sessions
                .insert(session_id.clone(), Arc::new(Mutex::new(Session::new(record))));
            restored += 1;
            tracing::info!(session_id = %session_id, "restored terminal session metadata");
        }

        if restored > 0 {
            tracing::info!(count = restored, "restored session metadata from durable cache");
        }
        restored
    }

    /// Close every session idle past the configured timeout. Returns how
    /// many were closed. Called periodically by the reaper loop; public so
    /// a sweep can also be driven directly.
    pub async fn reap_idle_sessions(&self) -> usize {
        let idle_timeout = self.session_cfg.idle_timeout();

        let arcs: Vec<_> = self
            .sessions
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let mut to_close = Vec::new();
        for (session_id, session) in arcs {
            let idle = session.lock().await.activity().idle_for();
            if idle > idle_timeout {
                to_close.push(session_id);
            }
        }

        let count = to_close.len();
        for session_id in to_close {
            tracing::info!(
                session_id = %session_id,
                "auto-closing inactive terminal session"
            );
            self.close_session(&session_id).await;
        }
        count
    }

    /// Stop the background loops, close every session, and release the
    /// transport pool.
    pub async fn shutdown(&self) {
        self.shutdown_token.cancel();

        let handles: Vec<_> = self.background.lock().await.drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }

        let ids: Vec<SessionId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for session_id in ids {
            self.close_session(&session_id).await;
        }

        self.pool.close().await;
        tracing::info!("session manager stopped");
    }

    fn get_arc(&self, session_id: &str) -> Option<Arc<Mutex<Session>>> {
        self.sessions
            .get(session_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Persist a session snapshot, degrading to in-memory-only operation
    /// when the durable cache is down.
    async fn persist(&self, session: &Arc<Mutex<Session>>) {
        let snapshot = { session.lock().await.snapshot() };
        if let Err(e) = self.store.save(&snapshot).await {
            tracing::warn!(
                session_id = %snapshot.session_id,
                error = %e,
                "durable cache unavailable; continuing in-memory"
            );
        }
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use crate::transport::{
        AuthMethod, Dial, Endpoint, PtyRequest, ShellEvent, ShellHandle, Transport, TransportError,
    };

    /// The far ends of a fake shell, for tests to script.
    pub struct ShellEnds {
        pub endpoint: Endpoint,
        pub input_rx: mpsc::Receiver<Vec<u8>>,
        pub output_tx: mpsc::Sender<ShellEvent>,
    }

    pub struct FakeTransport {
        endpoint: Endpoint,
        alive: Arc<AtomicBool>,
        ends_tx: mpsc::UnboundedSender<ShellEnds>,
    }

    #[async_trait::async_trait]
    impl Transport for FakeTransport {
        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        async fn open_shell(&self, _pty: &PtyRequest) -> Result<ShellHandle, TransportError> {
            let (input_tx, input_rx) = mpsc::channel(64);
            let (output_tx, output_rx) = mpsc::channel(64);
            let _ = self.ends_tx.send(ShellEnds {
                endpoint: self.endpoint.clone(),
                input_rx,
                output_tx,
            });
            Ok(ShellHandle {
                input: input_tx,
                output: output_rx,
            })
        }

        async fn disconnect(&self) {
            self.alive.store(false, Ordering::SeqCst);
        }
    }

    /// Shared handle for scripting the next dial to fail.
    pub type FailNext = Arc<std::sync::Mutex<Option<TransportError>>>;

    pub struct FakeDialer {
        pub dial_count: Arc<AtomicUsize>,
        pub fail_next: FailNext,
        ends_tx: mpsc::UnboundedSender<ShellEnds>,
    }

    pub struct FakeDialerHandles {
        pub ends_rx: mpsc::UnboundedReceiver<ShellEnds>,
        pub dial_count: Arc<AtomicUsize>,
        pub fail_next: FailNext,
    }

    impl FakeDialer {
        pub fn new() -> (Self, FakeDialerHandles) {
            let (ends_tx, ends_rx) = mpsc::unbounded_channel();
            let dial_count = Arc::new(AtomicUsize::new(0));
            let fail_next: FailNext = Arc::new(std::sync::Mutex::new(None));
            (
                Self {
                    dial_count: Arc::clone(&dial_count),
                    fail_next: Arc::clone(&fail_next),
                    ends_tx,
                },
                FakeDialerHandles {
                    ends_rx,
                    dial_count,
                    fail_next,
                },
            )
        }
    }

    #[async_trait::async_trait]
    impl Dial for FakeDialer {
        type Transport = FakeTransport;

        async fn dial(
            &self,
            endpoint: &Endpoint,
            _auth: &AuthMethod,
        ) -> Result<FakeTransport, TransportError> {
            if let Some(err) = self.fail_next.lock().unwrap().take() {
                return Err(err);
            }
            self.dial_count.fetch_add(1, Ordering::SeqCst);
            Ok(FakeTransport {
                endpoint: endpoint.clone(),
                alive: Arc::new(AtomicBool::new(true)),
                ends_tx: self.ends_tx.clone(),
            })
        }
    }
}
