//! WebSocket session server: authority for sessions, relay for operations.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Connection ── SessionManager ── Session (docs, locks, chat)
//! Client B ──┘        │                │
//!                     │                └── Persistence (ops + snapshots)
//!                     ▼
//!              BroadcastGroup (per session)
//!                     │
//!          ┌──────────┼───────────┐
//!          ▼          ▼           ▼
//!       Client A   Client B    Client C
//! ```
//!
//! The first frame of a connection must be `Join` or `Create`. After that
//! every accepted operation is acknowledged to its sender and relayed to
//! everyone else. A connection that lags behind its broadcast receiver gets
//! a fresh full sync instead of the frames it missed.
//!
//! A heartbeat task sweeps expired locks, idle presence and compactable
//! tombstones.

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tandem_core::{AppliedResult, Operation, ReleaseReason, SiteId};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, Evict, Frame, RoomManager};
use crate::config::ServerConfig;
use crate::document::DocumentSnapshot;
use crate::error::CollabError;
use crate::protocol::{AckStatus, AdminPayload, ChatPayload, CommentPayload, Envelope, Payload};
use crate::session::{LeaveOutcome, LeaveReason, SessionManager, SessionSettings, SyncPayload};
use crate::storage::Persistence;

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub operations_applied: u64,
    pub operations_rejected: u64,
    pub persisted_operations: u64,
    pub persisted_snapshots: u64,
}

struct ServerState {
    config: ServerConfig,
    sessions: SessionManager,
    rooms: RoomManager,
    stats: RwLock<ServerStats>,
    store: Option<Arc<dyn Persistence>>,
    /// (session, participant) → serial of the connection speaking for it.
    owners: RwLock<HashMap<(Uuid, Uuid), u64>>,
    next_serial: AtomicU64,
}

impl ServerState {
    async fn broadcast(&self, session: Uuid, origin: Option<Uuid>, envelope: &Envelope) {
        let Some(room) = self.rooms.get(&session).await else {
            return;
        };
        if let Err(e) = room.broadcast(origin, envelope) {
            log::error!("Broadcast to session {session} failed: {e}");
        }
    }

    async fn persist_operation(&self, document: Uuid, op: &Operation) {
        let Some(store) = &self.store else {
            return;
        };
        match store.append_operation(document, op) {
            Ok(()) => self.stats.write().await.persisted_operations += 1,
            Err(e) => log::error!("Failed to persist operation {} on {document}: {e}", op.id),
        }
    }

    async fn persist_snapshots(&self, snapshots: &[DocumentSnapshot]) {
        let Some(store) = &self.store else {
            return;
        };
        for snapshot in snapshots {
            match store.save_snapshot(snapshot) {
                Ok(()) => {
                    self.stats.write().await.persisted_snapshots += 1;
                    log::info!("Persisted snapshot of document {}", snapshot.id);
                }
                Err(e) => log::error!("Failed to persist snapshot of {}: {e}", snapshot.id),
            }
        }
    }

    /// Clamp client-requested settings to the server's limits.
    fn cap_settings(&self, mut settings: SessionSettings) -> SessionSettings {
        settings.max_participants = settings.max_participants.min(self.config.max_participants);
        let max_ttl = self.config.lock_ttl.as_millis() as u64;
        settings.lock_ttl_ms = settings.lock_ttl_ms.min(max_ttl);
        settings
    }

    /// One heartbeat's worth of housekeeping.
    async fn maintain(&self) {
        let now = tandem_core::now_millis();
        for (session, document, lock) in self.sessions.expire_locks(now).await {
            let env = Envelope::new(
                session,
                Uuid::nil(),
                Payload::LockReleased {
                    lock,
                    reason: ReleaseReason::Expired,
                },
            )
            .for_document(document);
            self.broadcast(session, None, &env).await;
        }
        for (session, presence) in self.sessions.sweep_presence(now).await {
            let env = Envelope::new(session, presence.participant, Payload::PresenceState(presence));
            self.broadcast(session, None, &env).await;
        }
        let (points, dropped) = self.sessions.compact().await;
        if dropped > 0 {
            log::debug!("Heartbeat compaction dropped {dropped} tombstones");
        }
        for (session, safe) in points {
            if !safe.is_empty() {
                self.broadcast(session, None, &Envelope::new(session, Uuid::nil(), Payload::SafePoints(safe)))
                    .await;
            }
        }
    }

    /// Announce a departure and tidy up after it.
    async fn after_leave(&self, session: Uuid, participant: Uuid, room: &BroadcastGroup, outcome: LeaveOutcome) {
        room.remove_member(&participant).await;
        for (document, lock) in outcome.released {
            let env = Envelope::new(
                session,
                participant,
                Payload::LockReleased {
                    lock,
                    reason: ReleaseReason::Disconnect,
                },
            )
            .for_document(document);
            self.broadcast(session, None, &env).await;
        }
        self.broadcast(session, None, &Envelope::new(session, participant, Payload::Left { participant }))
            .await;
        if outcome.empty {
            self.persist_snapshots(&outcome.snapshots).await;
        }
        if outcome.closed {
            self.rooms.remove(&session).await;
            log::info!("Session {session} closed");
        } else {
            self.rooms.remove_if_empty(&session).await;
        }
    }
}

/// The session server.
pub struct SyncServer {
    state: Arc<ServerState>,
}

impl SyncServer {
    pub fn new(config: ServerConfig) -> Self {
        Self::build(config, None)
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Server that persists operations and snapshots to `store`.
    pub fn with_store(config: ServerConfig, store: Arc<dyn Persistence>) -> Self {
        Self::build(config, Some(store))
    }

    fn build(config: ServerConfig, store: Option<Arc<dyn Persistence>>) -> Self {
        let rooms = RoomManager::new(config.broadcast_capacity);
        Self {
            state: Arc::new(ServerState {
                config,
                sessions: SessionManager::new(SiteId::new()),
                rooms,
                stats: RwLock::new(ServerStats::default()),
                store,
                owners: RwLock::new(HashMap::new()),
                next_serial: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.state.sessions
    }

    pub async fn stats(&self) -> ServerStats {
        self.state.stats.read().await.clone()
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), CollabError> {
        let listener = TcpListener::bind(&self.state.config.bind_addr).await?;
        log::info!("Session server listening on {}", self.state.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), CollabError> {
        let heartbeat = tokio::spawn(Self::heartbeat(
            self.state.clone(),
            Duration::from_secs(self.state.config.heartbeat_secs.max(1)),
        ));

        let result = loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => break Err(CollabError::from(e)),
            };
            log::debug!("New TCP connection from {addr}");
            let state = self.state.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(state, stream, addr).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        };

        heartbeat.abort();
        result
    }

    async fn heartbeat(state: Arc<ServerState>, every: Duration) {
        let mut ticker = tokio::time::interval(every);
        // The first tick fires immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            state.maintain().await;
        }
    }

    async fn handle_connection(state: Arc<ServerState>, stream: TcpStream, addr: SocketAddr) -> Result<(), CollabError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = state.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut conn = Connection {
            state: state.clone(),
            serial: state.next_serial.fetch_add(1, Ordering::Relaxed),
            membership: None,
            closing: false,
        };
        let mut broadcast_rx: Option<broadcast::Receiver<Frame>> = None;

        let result: Result<(), CollabError> = loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            {
                                let mut s = state.stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += data.len() as u64;
                            }
                            let reply = match Envelope::decode(&data) {
                                Ok(env) => conn.dispatch(env, &mut broadcast_rx).await,
                                Err(e) => {
                                    log::warn!("Failed to decode frame from {addr}: {e}");
                                    Some(Envelope::error(Uuid::nil(), &e))
                                }
                            };
                            if let Some(reply) = reply {
                                if let Err(e) = send(&mut ws_sender, &reply).await {
                                    break Err(e);
                                }
                            }
                            if conn.closing {
                                break Ok(());
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break Ok(());
                        }

                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = ws_sender.send(Message::Pong(data)).await {
                                break Err(e.into());
                            }
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break Err(e.into());
                        }

                        _ => {}
                    }
                }

                frame = async {
                    match broadcast_rx.as_mut() {
                        Some(rx) => rx.recv().await,
                        // Not in a session yet.
                        None => std::future::pending().await,
                    }
                } => {
                    let Some(me) = conn.participant() else {
                        continue;
                    };
                    match frame {
                        Ok(frame) => {
                            if frame.is_from(&me) {
                                continue;
                            }
                            if let Err(e) = ws_sender.send(Message::Binary(frame.bytes.to_vec().into())).await {
                                break Err(e.into());
                            }
                            if frame.evicts(&me) {
                                log::info!("Participant {me} evicted, closing {addr}");
                                conn.membership = None;
                                break Ok(());
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Participant {me} lagged by {n} frames, resyncing");
                            if let Some(resync) = conn.resync(n).await {
                                if let Err(e) = send(&mut ws_sender, &resync).await {
                                    break Err(e);
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break Ok(()),
                    }
                }
            }
        };

        conn.cleanup().await;
        let _ = ws_sender.close().await;
        state.stats.write().await.active_connections -= 1;
        result
    }
}

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

async fn send(sink: &mut WsSink, envelope: &Envelope) -> Result<(), CollabError> {
    let bytes = envelope.encode()?;
    sink.send(Message::Binary(bytes.into())).await?;
    Ok(())
}

#[derive(Clone)]
struct Membership {
    session: Uuid,
    participant: Uuid,
    room: Arc<BroadcastGroup>,
}

/// Per-connection state.
struct Connection {
    state: Arc<ServerState>,
    serial: u64,
    membership: Option<Membership>,
    /// Close after the current reply.
    closing: bool,
}

impl Connection {
    fn participant(&self) -> Option<Uuid> {
        self.membership.as_ref().map(|m| m.participant)
    }

    /// Handle one envelope; errors go back to the sender.
    async fn dispatch(&mut self, env: Envelope, rx: &mut Option<broadcast::Receiver<Frame>>) -> Option<Envelope> {
        let request = env.id;
        let session = env.session_id;
        let kind = env.msg_type;
        match self.route(env, rx).await {
            Ok(reply) => reply,
            Err(e) => {
                log::debug!("{kind:?} from {:?} refused: {e}", self.participant());
                Some(Envelope::error(session, &e).in_reply_to(request))
            }
        }
    }

    async fn route(&mut self, env: Envelope, rx: &mut Option<broadcast::Receiver<Frame>>) -> Result<Option<Envelope>, CollabError> {
        let Some(membership) = self.membership.clone() else {
            return self.route_unjoined(env, rx).await;
        };
        let Membership {
            session,
            participant: me,
            room,
        } = membership;
        let Envelope {
            id: request,
            document_id,
            payload,
            ..
        } = env;
        let document = || document_id.ok_or_else(|| CollabError::Protocol("missing document id".into()));
        let sessions = &self.state.sessions;

        match payload {
            Payload::Ping => Ok(Some(Envelope::pong(Uuid::nil()).in_reply_to(request))),
            Payload::Pong => Ok(None),

            Payload::Operation(op) => self.operation(session, me, &room, document()?, op).await,

            Payload::Cursor(update) | Payload::Selection(update) | Payload::Presence(update) => {
                if let Some(presence) = sessions.update_presence(session, me, update).await? {
                    log::trace!("Presence update from {me} in {session}");
                    room.broadcast(Some(me), &Envelope::new(session, me, Payload::PresenceState(presence)))?;
                }
                Ok(None)
            }

            Payload::SyncRequest => {
                let payload = sessions.with_session(session, |s| s.sync_payload(me)).await?;
                Ok(Some(sync_response(session, payload).in_reply_to(request)))
            }

            Payload::Chat(chat) => self.chat(session, me, &room, request, chat).await,

            Payload::Leave => {
                let outcome = sessions.leave_session(session, me, LeaveReason::Left).await?;
                self.state.owners.write().await.remove(&(session, me));
                self.state.after_leave(session, me, &room, outcome).await;
                self.membership = None;
                self.closing = true;
                Ok(None)
            }

            Payload::Share { name, kind, content } => {
                let snapshot = sessions
                    .share_document(session, me, name, kind, content.as_deref())
                    .await?;
                self.state.persist_snapshots(std::slice::from_ref(&snapshot)).await;
                let env = Envelope::new(session, me, Payload::Shared(Box::new(snapshot.clone())))
                    .for_document(snapshot.id)
                    .in_reply_to(request);
                room.broadcast(None, &env)?;
                Ok(None)
            }

            Payload::LockRequest(lock_request) => {
                let doc = document()?;
                let decision = sessions
                    .with_session(session, |s| s.request_lock(me, doc, lock_request))
                    .await?;
                if decision.is_granted() {
                    let env = Envelope::new(session, me, Payload::LockResponse(decision.clone())).for_document(doc);
                    room.broadcast(Some(me), &env)?;
                }
                Ok(Some(
                    Envelope::new(session, Uuid::nil(), Payload::LockResponse(decision))
                        .for_document(doc)
                        .in_reply_to(request),
                ))
            }

            Payload::ReleaseLock { lock } => {
                let doc = document()?;
                let released = sessions.release_lock(session, me, doc, lock).await?;
                let env = Envelope::new(
                    session,
                    me,
                    Payload::LockReleased {
                        lock: released,
                        reason: ReleaseReason::Explicit,
                    },
                )
                .for_document(doc);
                room.broadcast(None, &env)?;
                Ok(None)
            }

            Payload::Comment(comment) => self.comment(session, me, &room, document()?, comment).await,

            Payload::Frontier(frontier) => {
                sessions.with_session(session, |s| s.report_frontier(me, frontier)).await?;
                Ok(None)
            }

            Payload::Admin(admin) => self.admin(session, me, &room, admin).await,

            Payload::Join(_) | Payload::Create { .. } => {
                Err(CollabError::Protocol("connection already belongs to a session".into()))
            }

            other => Err(CollabError::Protocol(format!(
                "{:?} is not accepted from clients",
                other.message_type()
            ))),
        }
    }

    async fn route_unjoined(&mut self, env: Envelope, rx: &mut Option<broadcast::Receiver<Frame>>) -> Result<Option<Envelope>, CollabError> {
        let request = env.id;
        match env.payload {
            Payload::Join(join) => {
                let session = env.session_id;
                let room = self.state.rooms.get_or_create(session).await;
                // Subscribe before taking the snapshot so nothing falls in
                // between; anything seen twice is deduplicated downstream.
                let receiver = room.subscribe();
                let payload = match self.state.sessions.join_session(session, join).await {
                    Ok(payload) => payload,
                    Err(e) => {
                        self.state.rooms.remove_if_empty(&session).await;
                        log::info!("Join to session {session} refused: {e}");
                        return Err(e);
                    }
                };
                self.enter(payload, room, receiver, request, rx).await
            }

            Payload::Create { name, owner, settings } => {
                let settings = self.state.cap_settings(settings);
                let payload = self.state.sessions.create_session(name, owner, settings).await?;
                let room = self.state.rooms.get_or_create(payload.session.id).await;
                let receiver = room.subscribe();
                self.enter(payload, room, receiver, request, rx).await
            }

            Payload::Ping => Ok(Some(Envelope::pong(Uuid::nil()).in_reply_to(request))),

            other => Err(CollabError::Protocol(format!(
                "{:?} before joining a session",
                other.message_type()
            ))),
        }
    }

    async fn enter(
        &mut self,
        payload: SyncPayload,
        room: Arc<BroadcastGroup>,
        receiver: broadcast::Receiver<Frame>,
        request: Uuid,
        rx: &mut Option<broadcast::Receiver<Frame>>,
    ) -> Result<Option<Envelope>, CollabError> {
        let session = payload.session.id;
        let me = payload.me.clone();
        room.insert_member(me.clone()).await;
        self.state.owners.write().await.insert((session, me.id), self.serial);
        *rx = Some(receiver);
        self.membership = Some(Membership {
            session,
            participant: me.id,
            room: room.clone(),
        });
        room.broadcast(Some(me.id), &Envelope::new(session, me.id, Payload::Joined(me.clone())))?;
        log::info!("Participant {} ({}) entered session {session} as {}", me.name, me.id, me.role);
        Ok(Some(sync_response(session, payload).in_reply_to(request)))
    }

    async fn operation(
        &self,
        session: Uuid,
        me: Uuid,
        room: &BroadcastGroup,
        document: Uuid,
        op: Operation,
    ) -> Result<Option<Envelope>, CollabError> {
        let op_id = op.id;
        let result = match self.state.sessions.receive_operation(session, me, document, op.clone()).await {
            Ok(result) => result,
            Err(e) => {
                self.state.stats.write().await.operations_rejected += 1;
                return Err(e);
            }
        };
        let status = match result {
            AppliedResult::AlreadyApplied => {
                log::trace!("Duplicate operation {op_id} from {me}");
                return Ok(Some(Envelope::ack(session, document, op_id, AckStatus::Duplicate)));
            }
            AppliedResult::Deferred => AckStatus::Deferred,
            AppliedResult::Applied(applied) => {
                self.state.stats.write().await.operations_applied += applied.len() as u64;
                for a in &applied {
                    self.state.persist_operation(document, &a.op).await;
                }
                AckStatus::Applied
            }
        };
        room.broadcast(Some(me), &Envelope::operation(session, me, document, op))?;
        Ok(Some(Envelope::ack(session, document, op_id, status)))
    }

    async fn chat(
        &self,
        session: Uuid,
        me: Uuid,
        room: &BroadcastGroup,
        request: Uuid,
        chat: ChatPayload,
    ) -> Result<Option<Envelope>, CollabError> {
        let sessions = &self.state.sessions;
        let updated = match chat {
            ChatPayload::Send { content, kind } => {
                let message = sessions.send_message(session, me, content, kind).await?;
                room.broadcast(None, &Envelope::new(session, me, Payload::Chat(ChatPayload::Message(message))))?;
                return Ok(None);
            }
            ChatPayload::History { before, limit } => {
                let page = sessions.with_session(session, |s| s.chat_page(me, before, limit)).await?;
                return Ok(Some(
                    Envelope::new(session, Uuid::nil(), Payload::Chat(ChatPayload::Page(page))).in_reply_to(request),
                ));
            }
            ChatPayload::React { message, emoji } => {
                sessions.with_session(session, |s| s.add_reaction(me, message, &emoji)).await?
            }
            ChatPayload::Unreact { message, emoji } => {
                sessions.with_session(session, |s| s.remove_reaction(me, message, &emoji)).await?
            }
            ChatPayload::Edit { message, content } => {
                sessions.with_session(session, |s| s.edit_message(me, message, content)).await?
            }
            ChatPayload::Message(_) | ChatPayload::Updated(_) | ChatPayload::Page(_) => {
                return Err(CollabError::Protocol("chat state is server-issued".into()));
            }
        };
        room.broadcast(None, &Envelope::new(session, me, Payload::Chat(ChatPayload::Updated(updated))))?;
        Ok(None)
    }

    async fn comment(
        &self,
        session: Uuid,
        me: Uuid,
        room: &BroadcastGroup,
        document: Uuid,
        comment: CommentPayload,
    ) -> Result<Option<Envelope>, CollabError> {
        let sessions = &self.state.sessions;
        let (origin, payload) = match comment {
            CommentPayload::Add(comment) => {
                let Some(stored) = sessions
                    .with_session(session, |s| s.receive_comment(me, document, comment))
                    .await?
                else {
                    return Ok(None);
                };
                (Some(me), CommentPayload::Add(stored))
            }
            CommentPayload::Reply { comment, content } => {
                let thread = sessions
                    .with_session(session, |s| {
                        s.reply_comment(me, document, comment, content)?;
                        s.document(&document)
                            .and_then(|d| d.comment(&comment))
                            .cloned()
                            .ok_or(CollabError::not_found("comment", comment))
                    })
                    .await?;
                (None, CommentPayload::Updated(thread))
            }
            CommentPayload::Resolve { comment } => {
                let thread = sessions
                    .with_session(session, |s| s.resolve_comment(me, document, comment))
                    .await?;
                (None, CommentPayload::Updated(thread))
            }
            CommentPayload::Updated(_) => {
                return Err(CollabError::Protocol("comment state is server-issued".into()));
            }
        };
        room.broadcast(origin, &Envelope::new(session, me, Payload::Comment(payload)).for_document(document))?;
        Ok(None)
    }

    async fn admin(
        &mut self,
        session: Uuid,
        me: Uuid,
        room: &BroadcastGroup,
        admin: AdminPayload,
    ) -> Result<Option<Envelope>, CollabError> {
        let sessions = &self.state.sessions;
        match admin {
            AdminPayload::Kick { participant } => {
                let outcome = sessions.kick(session, me, participant).await?;
                self.state.owners.write().await.remove(&(session, participant));
                room.remove_member(&participant).await;
                for (document, lock) in outcome.released {
                    let env = Envelope::new(
                        session,
                        participant,
                        Payload::LockReleased {
                            lock,
                            reason: ReleaseReason::Disconnect,
                        },
                    )
                    .for_document(document);
                    room.broadcast(None, &env)?;
                }
                let env = Envelope::new(session, me, Payload::Admin(AdminPayload::Kicked { participant, by: me }));
                room.broadcast_evicting(Evict::Member(participant), &env)?;
                Ok(None)
            }
            AdminPayload::ChangeRole { participant, role } => {
                let updated = sessions.change_role(session, me, participant, role).await?;
                room.update_member(updated.clone()).await;
                room.broadcast(None, &Envelope::new(session, me, Payload::Admin(AdminPayload::RoleChanged(updated))))?;
                Ok(None)
            }
            AdminPayload::EndSession => {
                let snapshots = sessions.end_session(session, me).await?;
                self.state.persist_snapshots(&snapshots).await;
                let ended = Envelope::new(session, me, Payload::Admin(AdminPayload::SessionEnded));
                room.broadcast_evicting(Evict::Everyone, &ended)?;
                self.state.rooms.remove(&session).await;
                self.state.owners.write().await.retain(|(s, _), _| *s != session);
                self.membership = None;
                self.closing = true;
                Ok(Some(ended))
            }
            AdminPayload::Kicked { .. } | AdminPayload::RoleChanged(_) | AdminPayload::SessionEnded => {
                Err(CollabError::Protocol("admin notices are server-issued".into()))
            }
        }
    }

    /// Full state for a participant whose receiver lagged.
    async fn resync(&self, missed: u64) -> Option<Envelope> {
        let membership = self.membership.as_ref()?;
        membership.room.record_dropped(missed);
        let me = membership.participant;
        match self
            .state
            .sessions
            .with_session(membership.session, |s| s.sync_payload(me))
            .await
        {
            Ok(payload) => Some(sync_response(membership.session, payload)),
            Err(e) => {
                log::warn!("Resync for {me} failed: {e}");
                None
            }
        }
    }

    /// Leave the session if the connection dropped while in it.
    async fn cleanup(&mut self) {
        let Some(Membership {
            session,
            participant,
            room,
        }) = self.membership.take()
        else {
            return;
        };
        {
            // A reconnect may already have taken over this participant.
            let mut owners = self.state.owners.write().await;
            if owners.get(&(session, participant)) != Some(&self.serial) {
                log::debug!("Participant {participant} moved to a newer connection");
                return;
            }
            owners.remove(&(session, participant));
        }
        match self
            .state
            .sessions
            .leave_session(session, participant, LeaveReason::Disconnected)
            .await
        {
            Ok(outcome) => self.state.after_leave(session, participant, &room, outcome).await,
            Err(e) => {
                log::debug!("Cleanup for {participant} in {session}: {e}");
                room.remove_member(&participant).await;
                self.state.rooms.remove_if_empty(&session).await;
            }
        }
    }
}

fn sync_response(session: Uuid, payload: SyncPayload) -> Envelope {
    Envelope::new(session, Uuid::nil(), Payload::SyncResponse(Box::new(payload)))
}
