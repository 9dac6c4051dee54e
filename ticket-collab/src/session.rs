//! Room session: one ticket thread, its replicated log, presence and the
//! driver task that connects them to peers, the cache and the canonical
//! store.
//!
//! ```text
//!             facade calls (sync, short lock)
//!                        │
//!                        ▼
//!  ┌───────────────── RoomSession ─────────────────┐
//!  │ Mutex<SessionState>                           │
//!  │   CommentDoc · PresenceState                  │
//!  │   ConnectionManager · PendingWriteQueue       │
//!  └──────────┬────────────────────────────────────┘
//!             │ Command (unbounded mpsc)
//!             ▼
//!  ┌─────────── driver task ───────────┐
//!  │ PeerLink      retry / health /    │──► PeerTransport
//!  │ seen peers    typing / flush      │──► CanonicalStore
//!  └───────────────────────────────────┘
//! ```
//!
//! Facade calls never await: they mutate state under a `std::sync::Mutex`
//! and hand network work to the driver. The driver owns the transport link
//! and every timer, so stopping it cancels all of them at once.

use std::collections::{BTreeSet, HashSet};
use std::future::pending;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{sleep_until, Instant};
use uuid::Uuid;

use crate::cache::LocalCache;
use crate::comment::{Comment, RoomId};
use crate::config::SessionConfig;
use crate::connection::{ConnectionAction, ConnectionEvent, ConnectionManager, ConnectionStatus};
use crate::document::{ChangeOrigin, CommentDoc, DocChange, ObserverToken};
use crate::error::{CollabError, StoreError, TransportError};
use crate::presence::{ActiveUser, AwarenessMessage, LocalIdentity, PresenceState, PresenceUpdate};
use crate::protocol::{MessageType, SyncMessage};
use crate::reconcile::{CanonicalStore, PendingWrite, PendingWriteQueue, RetryOutcome};
use crate::transport::{PeerLink, PeerTransport};

/// Shared collaborators every session of a registry uses.
#[derive(Clone)]
pub struct SessionDeps {
    pub transport: Arc<dyn PeerTransport>,
    pub cache: Arc<dyn LocalCache>,
    pub store: Arc<dyn CanonicalStore>,
    pub config: SessionConfig,
}

/// Notifications for consumers of a room.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Comments became visible.
    CommentsChanged { origin: ChangeOrigin, added: Vec<Uuid> },
    /// Active users or typing state changed.
    PresenceChanged,
    StatusChanged(ConnectionStatus),
    /// Canonical history was merged into the log.
    HistoryLoaded { merged: usize },
    /// A canonical write hit the attempt bound. The comment stays visible
    /// locally; only the durable copy is missing.
    WriteAbandoned {
        comment_id: Uuid,
        attempts: u32,
        last_error: StoreError,
    },
}

struct SessionState {
    doc: CommentDoc,
    presence: PresenceState,
    connection: ConnectionManager,
    pending: PendingWriteQueue,
    history_loaded: bool,
    torn_down: bool,
}

enum WriteKind {
    Initial(Comment),
    Retry(PendingWrite),
}

enum Command {
    /// Forward a frame to the peers, if connected.
    Send(SyncMessage),
    /// First canonical append of a locally authored comment.
    WriteCanonical(Comment),
    /// Arm or disarm the typing auto-clear timer.
    TypingTimer(bool),
    Connection(ConnectionEvent),
    ConnectFinished {
        attempt: u64,
        result: Result<PeerLink, TransportError>,
    },
    WriteFinished {
        kind: WriteKind,
        result: Result<(), StoreError>,
    },
    HistoryFinished(Result<Vec<Comment>, StoreError>),
}

/// One live room. Shared by every handle the registry gives out.
pub struct RoomSession {
    room_id: RoomId,
    identity: LocalIdentity,
    state: Mutex<SessionState>,
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<SessionEvent>,
    shutdown: watch::Sender<bool>,
    cache: Arc<dyn LocalCache>,
}

impl RoomSession {
    /// Build the session, hydrate it from the cache and spawn its driver.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(room_id: RoomId, identity: LocalIdentity, deps: SessionDeps) -> Arc<Self> {
        let config = deps.config.clone();
        let mut doc = CommentDoc::new();
        match deps.cache.load(&room_id) {
            Ok(Some(snapshot)) => match doc.load_state(&snapshot) {
                Ok(ids) => log::info!("Hydrated room {room_id} with {} cached comments", ids.len()),
                Err(e) => log::warn!("Discarding unreadable cache for room {room_id}: {e}"),
            },
            Ok(None) => {}
            Err(e) => log::warn!("Cache load failed for room {room_id}: {e}"),
        }

        let state = SessionState {
            doc,
            presence: PresenceState::new(&identity),
            connection: ConnectionManager::new(&config),
            pending: PendingWriteQueue::new(
                config.pending_queue_capacity,
                config.max_write_attempts,
                config.flush_interval(),
            ),
            history_loaded: false,
            torn_down: false,
        };

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let session = Arc::new(Self {
            room_id,
            identity,
            state: Mutex::new(state),
            commands: command_tx.clone(),
            events,
            shutdown,
            cache: deps.cache.clone(),
        });

        let driver = Driver {
            session: session.clone(),
            transport: deps.transport,
            store: deps.store,
            config,
            commands: command_tx,
            link: None,
            attempt: 0,
            seen_peers: HashSet::new(),
            retry_at: None,
            health_at: None,
            awaiting_pong: false,
            health_interval: None,
            typing_clear_at: None,
            history_in_flight: false,
            history_failures: 0,
            history_retry_at: None,
            writes_in_flight: 0,
        };
        tokio::spawn(driver.run(command_rx, shutdown_rx));

        session
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        // A panic while holding the lock leaves the state usable: every
        // mutation is a single CRDT transaction or a plain field update.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn command(&self, command: Command) {
        if self.commands.send(command).is_err() {
            log::debug!("Driver of room {} is gone, dropping command", self.room_id);
        }
    }

    fn persist(&self, doc: &CommentDoc) {
        if let Err(e) = self.cache.persist(&self.room_id, &doc.encode_state()) {
            log::warn!("Failed to cache room {}: {e}", self.room_id);
        }
    }

    /// Write-through: cache first, then observers, then subscribers.
    fn commit(&self, state: &SessionState, origin: ChangeOrigin, added: Vec<Uuid>) -> Option<SessionEvent> {
        if added.is_empty() {
            return None;
        }
        self.persist(&state.doc);
        let change = DocChange { origin, added };
        state.doc.notify(&change);
        Some(SessionEvent::CommentsChanged {
            origin: change.origin,
            added: change.added,
        })
    }

    // ─── Facade operations ──────────────────────────────────────────

    /// Apply a validated comment locally, then broadcast it and schedule
    /// the canonical write. A comment the log rejects is never written to
    /// the canonical store.
    pub fn add_comment(&self, comment: Comment) -> Result<Comment, CollabError> {
        let event = {
            let mut state = self.lock();
            if state.torn_down {
                return Err(CollabError::SessionClosed);
            }
            if state.doc.contains(&comment.id) {
                // Already applied: nothing to broadcast or store again.
                return Ok(comment);
            }
            let update = state.doc.append_comment(&comment)?;
            let event = self.commit(&state, ChangeOrigin::Local, vec![comment.id]);
            // Queued under the lock so a later teardown still finds the write.
            self.command(Command::Send(SyncMessage::update(
                self.identity.peer_handle,
                &self.room_id,
                update,
            )));
            self.command(Command::WriteCanonical(comment.clone()));
            event
        };
        if let Some(event) = event {
            self.emit(event);
        }
        Ok(comment)
    }

    /// Set the local typing flag; it is cleared automatically after the
    /// typing idle timeout.
    pub fn set_typing(&self, typing: bool) -> Result<(), CollabError> {
        let msg = {
            let mut state = self.lock();
            if state.torn_down {
                return Err(CollabError::SessionClosed);
            }
            state.presence.set_local_typing(typing)
        };
        self.command(Command::TypingTimer(typing));
        if let Some(msg) = msg {
            self.broadcast_awareness(&msg);
            self.emit(SessionEvent::PresenceChanged);
        }
        Ok(())
    }

    /// Change the name other viewers see for this handle.
    pub fn set_display_name(&self, user_name: &str) -> Result<(), CollabError> {
        let msg = {
            let mut state = self.lock();
            if state.torn_down {
                return Err(CollabError::SessionClosed);
            }
            state.presence.set_local_presence(PresenceUpdate {
                user_name: Some(user_name.to_string()),
                typing: None,
            })
        };
        if let Some(msg) = msg {
            self.broadcast_awareness(&msg);
            self.emit(SessionEvent::PresenceChanged);
        }
        Ok(())
    }

    pub fn force_reconnect(&self) {
        self.command(Command::Connection(ConnectionEvent::ForceReconnect));
    }

    /// Environment online / offline signal.
    pub fn set_network_available(&self, available: bool) {
        let event = if available {
            ConnectionEvent::NetworkOnline
        } else {
            ConnectionEvent::NetworkOffline
        };
        self.command(Command::Connection(event));
    }

    fn broadcast_awareness(&self, msg: &AwarenessMessage) {
        match SyncMessage::awareness(self.identity.peer_handle, &self.room_id, msg) {
            Ok(frame) => self.command(Command::Send(frame)),
            Err(e) => log::warn!("Failed to encode presence: {e}"),
        }
    }

    // ─── Views ──────────────────────────────────────────────────────

    pub fn comments(&self) -> Vec<Comment> {
        self.lock().doc.to_ordered_list()
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.lock().doc.contains(id)
    }

    pub fn active_users(&self) -> Vec<ActiveUser> {
        self.lock().presence.active_users()
    }

    pub fn typing_users(&self) -> BTreeSet<String> {
        self.lock().presence.typing_users()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.lock().connection.status()
    }

    pub fn retry_count(&self) -> u32 {
        self.lock().connection.retry_count()
    }

    pub fn pending_write_count(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn history_loaded(&self) -> bool {
        self.lock().history_loaded
    }

    pub fn is_torn_down(&self) -> bool {
        self.lock().torn_down
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Register a log observer. Callbacks run with the session locked and
    /// must not call back into it.
    pub fn observe<F>(&self, callback: F) -> ObserverToken
    where
        F: Fn(&DocChange) + Send + Sync + 'static,
    {
        self.lock().doc.observe(callback)
    }

    pub fn unobserve(&self, token: ObserverToken) -> bool {
        self.lock().doc.unobserve(token)
    }

    // ─── Teardown ───────────────────────────────────────────────────

    /// Stop the driver (cancelling every timer and closing the link), flush
    /// the cache and drop all observers. Idempotent.
    ///
    /// Canonical writes still outstanding keep being retried by the driver
    /// after this returns, until they land or are reported abandoned.
    pub(crate) fn teardown(&self) {
        {
            let mut state = self.lock();
            if state.torn_down {
                return;
            }
            state.torn_down = true;
            state.connection.handle(ConnectionEvent::Teardown);
            state.doc.clear_observers();
            self.persist(&state.doc);
        }
        // send_replace never fails, even with the driver already gone.
        self.shutdown.send_replace(true);
        log::info!("Room {} torn down", self.room_id);
    }
}

// ───────────────────────────────────────────────────────────────────
// Driver
// ───────────────────────────────────────────────────────────────────

struct Driver {
    session: Arc<RoomSession>,
    transport: Arc<dyn PeerTransport>,
    store: Arc<dyn CanonicalStore>,
    config: SessionConfig,
    commands: mpsc::UnboundedSender<Command>,
    link: Option<PeerLink>,
    /// Incremented per connect so stale results can be told apart.
    attempt: u64,
    /// Peers we already answered with our own SyncStep1 on this link.
    seen_peers: HashSet<Uuid>,
    retry_at: Option<Instant>,
    health_at: Option<Instant>,
    awaiting_pong: bool,
    health_interval: Option<std::time::Duration>,
    typing_clear_at: Option<Instant>,
    history_in_flight: bool,
    /// Consecutive failed history loads; spaces the next attempt.
    history_failures: u32,
    history_retry_at: Option<Instant>,
    /// First-attempt canonical writes not yet answered by the store.
    writes_in_flight: usize,
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => pending().await,
    }
}

async fn recv_frame(link: &mut Option<PeerLink>) -> Option<SyncMessage> {
    match link {
        Some(link) => link.inbound.recv().await,
        None => pending().await,
    }
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let room_id = self.session.room_id.clone();
        log::info!("Session driver for room {room_id} started");

        self.apply(ConnectionEvent::Start);
        self.load_history();

        let mut flush = tokio::time::interval(self.config.flush_interval());
        flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => {}

                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },

                frame = recv_frame(&mut self.link) => match frame {
                    Some(msg) => self.handle_frame(msg),
                    None => {
                        log::info!("Transport lost for room {room_id}");
                        self.drop_link();
                        self.apply(ConnectionEvent::TransportLost);
                    }
                },

                _ = wait_until(self.retry_at) => {
                    self.retry_at = None;
                    self.apply(ConnectionEvent::RetryTimerFired);
                }

                _ = wait_until(self.health_at) => self.health_tick(),

                _ = wait_until(self.typing_clear_at) => {
                    self.typing_clear_at = None;
                    self.clear_typing();
                }

                _ = flush.tick() => {
                    self.flush(false);
                    self.retry_history();
                    self.expire_idle_peers();
                }
            }
        }

        self.leave();
        self.drain(&mut commands).await;
        log::info!("Session driver for room {room_id} stopped");
    }

    /// After teardown: finish every outstanding canonical write. The link
    /// is gone and presence is frozen; only the store is still talked to.
    async fn drain(&mut self, commands: &mut mpsc::UnboundedReceiver<Command>) {
        self.retry_at = None;
        self.health_at = None;
        self.typing_clear_at = None;

        let mut flush = tokio::time::interval(self.config.flush_interval());
        flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            while let Ok(cmd) = commands.try_recv() {
                self.handle_draining(cmd);
            }
            let outstanding = self.writes_in_flight + self.session.lock().pending.len();
            if outstanding == 0 {
                break;
            }
            log::trace!(
                "Room {} draining {outstanding} canonical writes",
                self.session.room_id
            );

            tokio::select! {
                cmd = commands.recv() => {
                    if let Some(cmd) = cmd {
                        self.handle_draining(cmd);
                    }
                }
                _ = flush.tick() => self.retry_due(false),
            }
        }
    }

    fn handle_draining(&mut self, command: Command) {
        match command {
            Command::WriteCanonical(comment) => self.spawn_write(WriteKind::Initial(comment)),
            Command::WriteFinished { kind, result } => self.write_finished(kind, result),
            // A link that completes now is dropped unused.
            Command::ConnectFinished { .. } => {}
            Command::Send(_)
            | Command::TypingTimer(_)
            | Command::Connection(_)
            | Command::HistoryFinished(_) => {}
        }
    }

    // ─── Connection state machine ───────────────────────────────────

    fn apply(&mut self, event: ConnectionEvent) {
        let actions = self.session.lock().connection.handle(event);
        for action in actions {
            self.execute(action);
        }
    }

    fn execute(&mut self, action: ConnectionAction) {
        match action {
            ConnectionAction::Connect => self.connect(),
            ConnectionAction::Disconnect => self.leave(),
            ConnectionAction::ScheduleRetry(delay) => {
                log::info!("Reconnecting room {} in {delay:?}", self.session.room_id);
                self.retry_at = Some(Instant::now() + delay);
            }
            ConnectionAction::ScheduleHealthCheck(interval) => {
                self.health_interval = Some(interval);
                self.awaiting_pong = false;
                self.health_at = Some(Instant::now() + interval);
            }
            ConnectionAction::CancelTimers => {
                self.retry_at = None;
                self.health_at = None;
                self.health_interval = None;
                self.awaiting_pong = false;
            }
            ConnectionAction::StatusChanged(status) => {
                self.session.emit(SessionEvent::StatusChanged(status));
                if status == ConnectionStatus::Connected {
                    self.on_connected();
                }
            }
        }
    }

    fn connect(&mut self) {
        self.drop_link();
        self.attempt += 1;
        let attempt = self.attempt;
        let join = self
            .transport
            .join(&self.session.room_id, self.session.identity.peer_handle);
        let timeout = self.config.connect_timeout();
        let commands = self.commands.clone();
        tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, join).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::HandshakeTimeout),
            };
            let _ = commands.send(Command::ConnectFinished { attempt, result });
        });
    }

    fn on_connected(&mut self) {
        let room_id = self.session.room_id.clone();
        let peer = self.session.identity.peer_handle;
        log::info!("Room {room_id} connected");

        self.seen_peers.clear();
        let (sv, join) = {
            let state = self.session.lock();
            (state.doc.state_vector(), state.presence.join_message())
        };
        self.send(SyncMessage::sync_step1(peer, &room_id, sv));
        self.send_awareness(&join);

        self.flush(true);
        self.load_history();
    }

    fn health_tick(&mut self) {
        if self.awaiting_pong {
            log::warn!("Health check timed out for room {}", self.session.room_id);
            self.health_at = None;
            self.awaiting_pong = false;
            self.drop_link();
            self.apply(ConnectionEvent::HealthCheckFailed);
            return;
        }

        let peer = self.session.identity.peer_handle;
        let heartbeat = self.session.lock().presence.heartbeat_message();
        self.send(SyncMessage::ping(peer, &self.session.room_id));
        self.send_awareness(&heartbeat);
        self.awaiting_pong = true;
        self.health_at = Some(Instant::now() + self.config.health_check_timeout());
    }

    fn note_inbound_activity(&mut self) {
        if self.awaiting_pong {
            self.awaiting_pong = false;
            if let Some(interval) = self.health_interval {
                self.health_at = Some(Instant::now() + interval);
            }
        }
    }

    // ─── Link I/O ───────────────────────────────────────────────────

    fn send(&mut self, msg: SyncMessage) {
        let Some(link) = &self.link else {
            return;
        };
        match link.outbound.try_send(msg) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(msg)) => {
                log::warn!(
                    "Outbound buffer full in room {}, dropping {:?}",
                    self.session.room_id,
                    msg.msg_type
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.drop_link();
                self.apply(ConnectionEvent::TransportLost);
            }
        }
    }

    fn send_awareness(&mut self, msg: &AwarenessMessage) {
        match SyncMessage::awareness(self.session.identity.peer_handle, &self.session.room_id, msg) {
            Ok(frame) => self.send(frame),
            Err(e) => log::warn!("Failed to encode presence: {e}"),
        }
    }

    /// Best-effort `Leave`, then drop the link.
    fn leave(&mut self) {
        if let Some(link) = &self.link {
            let leave = self.session.lock().presence.leave_message();
            if let Ok(frame) =
                SyncMessage::awareness(self.session.identity.peer_handle, &self.session.room_id, &leave)
            {
                let _ = link.outbound.try_send(frame);
            }
        }
        self.drop_link();
    }

    fn drop_link(&mut self) {
        if self.link.take().is_some() {
            self.seen_peers.clear();
            let changed = self.session.lock().presence.clear_remote();
            if changed {
                self.session.emit(SessionEvent::PresenceChanged);
            }
        }
    }

    fn handle_frame(&mut self, msg: SyncMessage) {
        self.note_inbound_activity();
        if msg.room_id != self.session.room_id {
            log::warn!("Ignoring frame for room {} in room {}", msg.room_id, self.session.room_id);
            return;
        }

        match msg.msg_type {
            MessageType::SyncStep1 => {
                let peer = self.session.identity.peer_handle;
                let room_id = self.session.room_id.clone();
                let reply = {
                    let state = self.session.lock();
                    match state.doc.diff_since(&msg.payload) {
                        Ok(diff) => Some((diff, state.doc.state_vector(), state.presence.join_message())),
                        Err(e) => {
                            log::warn!("Bad state vector from {}: {e}", msg.peer_id);
                            None
                        }
                    }
                };
                if let Some((diff, sv, join)) = reply {
                    self.send(SyncMessage::sync_step2(peer, &room_id, diff));
                    if self.seen_peers.insert(msg.peer_id) {
                        self.send(SyncMessage::sync_step1(peer, &room_id, sv));
                        self.send_awareness(&join);
                    }
                }
            }

            MessageType::SyncStep2 | MessageType::Update => {
                let event = {
                    let mut state = self.session.lock();
                    match state.doc.merge_remote(&msg.payload) {
                        Ok(outcome) => self.session.commit(&state, ChangeOrigin::Remote, outcome.added),
                        Err(e) => {
                            log::warn!("Dropping bad update from {}: {e}", msg.peer_id);
                            None
                        }
                    }
                };
                if let Some(event) = event {
                    log::debug!("Merged remote update from {} in room {}", msg.peer_id, self.session.room_id);
                    self.session.emit(event);
                }
            }

            MessageType::Awareness => match msg.awareness_message() {
                Ok(awareness) => {
                    let changed = self.session.lock().presence.handle_message(&awareness);
                    log::trace!("Presence {awareness:?} in room {}", self.session.room_id);
                    if changed {
                        self.session.emit(SessionEvent::PresenceChanged);
                    }
                }
                Err(e) => log::warn!("Bad presence frame from {}: {e}", msg.peer_id),
            },

            MessageType::PeerJoined => {
                log::debug!("Peer {} joined room {}", msg.peer_id, self.session.room_id);
            }

            MessageType::PeerLeft => {
                self.seen_peers.remove(&msg.peer_id);
                let changed = self
                    .session
                    .lock()
                    .presence
                    .handle_message(&AwarenessMessage::Leave { peer_handle: msg.peer_id });
                if changed {
                    self.session.emit(SessionEvent::PresenceChanged);
                }
            }

            MessageType::Ping | MessageType::Pong => {}
        }
    }

    // ─── Commands ───────────────────────────────────────────────────

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Send(msg) => self.send(msg),

            Command::WriteCanonical(comment) => {
                self.spawn_write(WriteKind::Initial(comment));
            }

            Command::TypingTimer(typing) => {
                self.typing_clear_at = typing.then(|| Instant::now() + self.config.typing_idle_timeout());
            }

            Command::Connection(event) => self.apply(event),

            Command::ConnectFinished { attempt, result } => {
                if attempt != self.attempt {
                    // Superseded by a newer connect; dropping the link closes it.
                    return;
                }
                match result {
                    Ok(link) => {
                        self.link = Some(link);
                        self.apply(ConnectionEvent::ConnectSucceeded);
                    }
                    Err(e) => {
                        log::warn!("Connect failed for room {}: {e}", self.session.room_id);
                        self.apply(ConnectionEvent::ConnectFailed);
                    }
                }
            }

            Command::WriteFinished { kind, result } => self.write_finished(kind, result),

            Command::HistoryFinished(result) => self.history_finished(result),
        }
    }

    fn clear_typing(&mut self) {
        let msg = self.session.lock().presence.set_local_typing(false);
        if let Some(msg) = msg {
            self.send_awareness(&msg);
            self.session.emit(SessionEvent::PresenceChanged);
        }
    }

    fn expire_idle_peers(&mut self) {
        let removed = self
            .session
            .lock()
            .presence
            .cleanup_idle_peers(self.config.presence_idle_timeout());
        if !removed.is_empty() {
            log::debug!("Expired {} idle peers in room {}", removed.len(), self.session.room_id);
            self.session.emit(SessionEvent::PresenceChanged);
        }
    }

    // ─── Reconciliation ─────────────────────────────────────────────

    fn load_history(&mut self) {
        if self.history_in_flight || self.session.lock().history_loaded {
            return;
        }
        self.history_in_flight = true;
        self.history_retry_at = None;
        let list = self.store.list_comments(self.session.room_id.ticket_id());
        let commands = self.commands.clone();
        tokio::spawn(async move {
            let _ = commands.send(Command::HistoryFinished(list.await));
        });
    }

    fn history_finished(&mut self, result: Result<Vec<Comment>, StoreError>) {
        self.history_in_flight = false;
        let history = match result {
            Ok(history) => history,
            Err(e) => {
                self.history_failures += 1;
                let delay = self.session.lock().pending.retry_spacing(self.history_failures);
                log::warn!(
                    "History load failed for room {}: {e}; retrying in {delay:?}",
                    self.session.room_id
                );
                self.history_retry_at = Some(Instant::now() + delay);
                return;
            }
        };
        self.history_failures = 0;

        let (merged, event) = {
            let mut state = self.session.lock();
            state.history_loaded = true;
            match state.doc.merge_history(&history) {
                Ok(inserted) => {
                    let merged = inserted.len();
                    (merged, self.session.commit(&state, ChangeOrigin::History, inserted))
                }
                Err(e) => {
                    log::error!("Failed to merge history for room {}: {e}", self.session.room_id);
                    (0, None)
                }
            }
        };
        log::info!(
            "Loaded {} canonical comments for room {} ({merged} new)",
            history.len(),
            self.session.room_id
        );
        if let Some(event) = event {
            self.session.emit(event);
        }
        self.session.emit(SessionEvent::HistoryLoaded { merged });
    }

    /// Retry a failed history load once its spacing has elapsed. A connect
    /// retries it immediately.
    fn retry_history(&mut self) {
        let due = self.history_retry_at.is_some_and(|at| at <= Instant::now());
        if due && self.session.lock().connection.network_available() {
            self.load_history();
        }
    }

    fn spawn_write(&mut self, kind: WriteKind) {
        let comment = match &kind {
            WriteKind::Initial(comment) => {
                self.writes_in_flight += 1;
                comment.clone()
            }
            WriteKind::Retry(write) => write.comment.clone(),
        };
        let append = self.store.append_comment(self.session.room_id.ticket_id(), comment);
        let commands = self.commands.clone();
        tokio::spawn(async move {
            let result = append.await;
            let _ = commands.send(Command::WriteFinished { kind, result });
        });
    }

    /// Retry due pending writes; `force` retries all of them (on connect).
    fn flush(&mut self, force: bool) {
        if !force && !self.session.lock().connection.network_available() {
            return;
        }
        self.retry_due(force);
    }

    fn retry_due(&mut self, force: bool) {
        let due = self.session.lock().pending.take_due(Instant::now(), force);
        if !due.is_empty() {
            log::debug!("Retrying {} pending writes for room {}", due.len(), self.session.room_id);
        }
        for write in due {
            self.spawn_write(WriteKind::Retry(write));
        }
    }

    fn write_finished(&mut self, kind: WriteKind, result: Result<(), StoreError>) {
        let now = Instant::now();
        if matches!(kind, WriteKind::Initial(_)) {
            self.writes_in_flight = self.writes_in_flight.saturating_sub(1);
        }
        let abandoned = {
            let mut state = self.session.lock();
            match (kind, result) {
                (WriteKind::Initial(comment), Ok(())) => {
                    log::debug!("Comment {} stored canonically", comment.id);
                    None
                }
                (WriteKind::Initial(comment), Err(e)) => {
                    log::warn!("Canonical write of {} failed: {e}; queued for retry", comment.id);
                    let ticket_id = comment.ticket_id.clone();
                    state.pending.enqueue(ticket_id, comment, e, now).err()
                }
                (WriteKind::Retry(write), Ok(())) => {
                    log::info!(
                        "Pending comment {} stored after {} attempts",
                        write.comment.id,
                        write.attempts + 1
                    );
                    state.pending.complete(write);
                    None
                }
                (WriteKind::Retry(write), Err(e)) => match state.pending.retry_failed(write, e, now) {
                    RetryOutcome::Requeued => None,
                    RetryOutcome::Abandoned(write) => Some(write),
                },
            }
        };

        if let Some(write) = abandoned {
            log::error!(
                "Giving up on canonical write of comment {} after {} attempts: {}",
                write.comment.id,
                write.attempts,
                write.last_error
            );
            self.session.emit(SessionEvent::WriteAbandoned {
                comment_id: write.comment.id,
                attempts: write.attempts,
                last_error: write.last_error,
            });
        }
    }
}
