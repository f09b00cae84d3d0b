//! WebSocket replica client.
//!
//! A [`SyncClient`] holds a full replica of one session: every shared
//! document, the roster, presence and chat. Local edits apply to the
//! replica immediately and go out in the background; each operation stays
//! in the [`OfflineQueue`] until the server acknowledges it.
//!
//! When the link drops (transport error, or no traffic for
//! `missed_heartbeats` heartbeats) the client reconnects with exponential
//! backoff, rejoins, rebuilds each document from the state it gets back,
//! then applies and re-sends every unacknowledged operation on top. There
//! is no log replay.
//!
//! ```text
//!   edit() ──► Replica ──► OfflineQueue ──► writer task ──► WebSocket
//!                 ▲                                             │
//!                 └──────────── reader task ◄───────────────────┘
//!                                   │ link lost
//!                                   ▼
//!                              supervisor ── backoff ── rejoin + resync
//! ```

use futures_util::{SinkExt, StreamExt};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tandem_core::{
    AppliedResult, Lock, LockDecision, LockKind, LockRequest, OpId, Operation, ReleaseReason, SiteId, TextEdit,
    VectorClock,
};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::chat::{ChatChannel, ChatMessage, ChatPage, MessageKind, DEFAULT_PAGE_SIZE};
use crate::config::ClientConfig;
use crate::document::{Comment, CommentAnchor, DocumentKind, DocumentSnapshot, Edit, SharedDocument};
use crate::error::CollabError;
use crate::participant::{Participant, Permissions, Role};
use crate::presence::{Presence, PresenceRoom, PresenceStatus, PresenceThrottle, PresenceUpdate};
use crate::protocol::{AdminPayload, ChatPayload, CommentPayload, Envelope, Payload, WireError};
use crate::request::{PendingRequest, RequestTable};
use crate::session::{JoinRequest, SessionInfo, SessionSettings, SyncPayload};

const OUTGOING_BUFFER: usize = 1024;
const EVENT_BUFFER: usize = 1024;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Joined (or rejoined) and holding the full session state.
    Connected,
    Disconnected,
    Reconnecting { attempt: u32, delay: Duration },
    /// Reconnect attempts exhausted or refused; the client stays offline.
    GaveUp,
    /// A full state was merged into the replica.
    Synced { documents: usize },
    RemoteOperation { document: Uuid, op: OpId },
    /// The server refused one of our operations.
    OperationRejected { document: Uuid, op: OpId, error: WireError },
    PresenceChanged(Presence),
    ParticipantJoined(Participant),
    ParticipantLeft(Uuid),
    RoleChanged(Participant),
    DocumentShared { document: Uuid, name: String },
    LockGranted { document: Uuid, lock: Lock },
    LockReleased { document: Uuid, lock: Lock, reason: ReleaseReason },
    CommentChanged { document: Uuid, comment: Comment },
    ChatMessage(ChatMessage),
    ChatUpdated(ChatMessage),
    Kicked { by: Uuid },
    SessionEnded,
    ServerError(WireError),
}

// ───────────────────────────────────────────────────────────────────
// Offline queue
// ───────────────────────────────────────────────────────────────────

/// A local operation the server has not acknowledged yet.
#[derive(Debug, Clone)]
pub struct QueuedOperation {
    pub document: Uuid,
    pub op: Operation,
    /// Envelope id of the latest send, for matching error replies.
    request: Option<Uuid>,
    queued_at: Instant,
}

/// Unacknowledged local operations, oldest first.
///
/// Operations leave the queue when the server acknowledges or rejects
/// them. Everything still queued is re-sent, in order, after a resync.
#[derive(Debug)]
pub struct OfflineQueue {
    queue: VecDeque<QueuedOperation>,
    max_size: usize,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Returns false when the queue is full.
    pub fn enqueue(&mut self, document: Uuid, op: Operation) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(QueuedOperation {
            document,
            op,
            request: None,
            queued_at: Instant::now(),
        });
        true
    }

    /// Build a send for `op` and remember its envelope id.
    pub fn envelope_for(&mut self, op: &OpId, session: Uuid, sender: Uuid) -> Option<Envelope> {
        let entry = self.queue.iter_mut().find(|q| q.op.id == *op)?;
        let env = Envelope::operation(session, sender, entry.document, entry.op.clone());
        entry.request = Some(env.id);
        Some(env)
    }

    /// Envelopes for everything queued, oldest first.
    pub fn outgoing(&mut self, session: Uuid, sender: Uuid) -> Vec<Envelope> {
        self.queue
            .iter_mut()
            .map(|entry| {
                let env = Envelope::operation(session, sender, entry.document, entry.op.clone());
                entry.request = Some(env.id);
                env
            })
            .collect()
    }

    pub fn acknowledge(&mut self, op: &OpId) -> bool {
        self.take(op).is_some()
    }

    fn take(&mut self, op: &OpId) -> Option<QueuedOperation> {
        let index = self.queue.iter().position(|q| q.op.id == *op)?;
        self.queue.remove(index)
    }

    /// Remove the operation whose latest send was `request`, together with
    /// every later operation of the same site on the same document. Those
    /// carry counters past the refused one and can never become ready
    /// anywhere.
    pub fn reject(&mut self, request: &Uuid) -> Vec<QueuedOperation> {
        let Some(index) = self.queue.iter().position(|q| q.request.as_ref() == Some(request)) else {
            return Vec::new();
        };
        let (document, site) = (self.queue[index].document, self.queue[index].op.site());
        let mut rejected = Vec::new();
        let mut kept = VecDeque::with_capacity(self.queue.len());
        for (i, entry) in self.queue.drain(..).enumerate() {
            if i >= index && entry.document == document && entry.op.site() == site {
                rejected.push(entry);
            } else {
                kept.push_back(entry);
            }
        }
        self.queue = kept;
        rejected
    }

    /// Queued operations on `document`, oldest first.
    pub fn pending_for(&self, document: &Uuid) -> Vec<Operation> {
        self.queue
            .iter()
            .filter(|q| q.document == *document)
            .map(|q| q.op.clone())
            .collect()
    }

    pub fn remaining(&self) -> usize {
        self.max_size.saturating_sub(self.queue.len())
    }

    /// Age of the oldest unacknowledged operation.
    pub fn oldest_age(&self) -> Option<Duration> {
        self.queue.front().map(|q| q.queued_at.elapsed())
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

// ───────────────────────────────────────────────────────────────────
// Replica
// ───────────────────────────────────────────────────────────────────

struct Replica {
    site: SiteId,
    session: Option<SessionInfo>,
    me: Option<Participant>,
    participants: HashMap<Uuid, Participant>,
    documents: BTreeMap<Uuid, SharedDocument>,
    presence: PresenceRoom,
    throttle: PresenceThrottle,
    chat: ChatChannel,
    unacked: OfflineQueue,
}

impl Replica {
    fn new(site: SiteId, config: &ClientConfig) -> Self {
        Self {
            site,
            session: None,
            me: None,
            participants: HashMap::new(),
            documents: BTreeMap::new(),
            presence: PresenceRoom::new(),
            throttle: PresenceThrottle::new(config.presence_interval),
            chat: ChatChannel::new(),
            unacked: OfflineQueue::new(config.queue_capacity),
        }
    }

    fn session_id(&self) -> Uuid {
        self.session.as_ref().map_or(Uuid::nil(), |s| s.id)
    }

    fn me_id(&self) -> Uuid {
        self.me.as_ref().map_or(Uuid::nil(), |p| p.id)
    }

    /// Adopt a full state. Each known document is rebuilt from the
    /// server's snapshot and the still unacknowledged local operations are
    /// replayed on top, so anything the server never accepted is gone.
    /// Returns the document count and the queued operations that could not
    /// be replayed.
    fn apply_sync(&mut self, payload: SyncPayload) -> (usize, Vec<QueuedOperation>) {
        self.session = Some(payload.session);
        self.me = Some(payload.me);
        self.participants = payload.participants.into_iter().map(|p| (p.id, p)).collect();
        let documents = payload.documents.len();
        let mut lost = Vec::new();
        for snapshot in payload.documents {
            let id = snapshot.id;
            match self.documents.get_mut(&id) {
                Some(doc) => {
                    let pending = self.unacked.pending_for(&id);
                    for op in doc.reset(self.site, snapshot, &pending) {
                        log::warn!("Local operation {} no longer applies to {id}", op.id);
                        lost.extend(self.unacked.take(&op.id));
                    }
                }
                None => {
                    self.documents
                        .insert(id, SharedDocument::from_snapshot(self.site, snapshot));
                }
            }
        }
        self.presence = PresenceRoom::new();
        for presence in payload.presence {
            self.presence.upsert(presence);
        }
        for message in payload.chat.messages {
            self.chat.upsert(message);
        }
        (documents, lost)
    }

    /// Drop a refused operation and its same-site successors, and move to
    /// a fresh site so later edits do not queue up behind the gap.
    fn reject(&mut self, request: &Uuid) -> Vec<QueuedOperation> {
        let rejected = self.unacked.reject(request);
        if !rejected.is_empty() {
            self.site = SiteId::new();
            log::info!("Continuing as site {} after a rejected operation", self.site);
        }
        rejected
    }

    /// Per-document clocks, for the server's compaction bookkeeping.
    fn frontier(&self) -> Vec<(Uuid, VectorClock)> {
        self.documents
            .iter()
            .map(|(id, doc)| (*id, doc.clock().clone()))
            .collect()
    }

    fn document_mut(&mut self, id: &Uuid) -> Result<&mut SharedDocument, CollabError> {
        self.documents
            .get_mut(id)
            .ok_or(CollabError::not_found("document", *id))
    }

    fn require(&self, required: Permissions) -> Result<&Participant, CollabError> {
        let me = self
            .me
            .as_ref()
            .ok_or_else(|| CollabError::Connection("not joined".into()))?;
        if !me.can(required) {
            return Err(CollabError::Permission {
                participant: me.id,
                required,
            });
        }
        Ok(me)
    }
}

/// Upper bound on the operations an edit produces.
fn op_estimate(edit: &Edit) -> usize {
    match edit {
        Edit::Insert { text, .. } => text.chars().count(),
        Edit::Delete { range } => range.len(),
        Edit::Format { .. } => 1,
    }
}

// ───────────────────────────────────────────────────────────────────
// Connection machinery
// ───────────────────────────────────────────────────────────────────

struct Link {
    generation: u64,
    outgoing: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
}

struct Inner {
    config: ClientConfig,
    identity: Mutex<JoinRequest>,
    state: RwLock<ConnectionState>,
    replica: Mutex<Replica>,
    link: Mutex<Option<Link>>,
    generation: AtomicU64,
    requests: RequestTable<Payload>,
    lock_requests: RequestTable<LockDecision>,
    events: mpsc::Sender<SyncEvent>,
    lost: mpsc::UnboundedSender<u64>,
    /// Offline on purpose; the supervisor leaves the link down.
    paused: AtomicBool,
    /// Kicked, left or the session ended. No way back.
    ended: AtomicBool,
    shutdown: CancellationToken,
    last_seen: Mutex<Instant>,
}

impl Inner {
    fn emit(&self, event: SyncEvent) {
        if let Err(mpsc::error::TrySendError::Full(event)) = self.events.try_send(event) {
            log::warn!("Event queue full, dropping {event:?}");
        }
    }

    async fn send(&self, env: &Envelope) -> Result<(), CollabError> {
        let outgoing = self
            .link
            .lock()
            .await
            .as_ref()
            .map(|link| link.outgoing.clone())
            .ok_or_else(|| CollabError::Connection("not connected".into()))?;
        outgoing
            .send(env.encode()?)
            .await
            .map_err(|_| CollabError::Connection("link closed".into()))
    }

    async fn is_connected(&self) -> bool {
        *self.state.read().await == ConnectionState::Connected
    }

    /// Open a WebSocket, send `first` (join or create) and wait for the
    /// full state. The reader task merges the state before the reply is
    /// released here.
    async fn establish(self: &Arc<Self>, first: Payload, session: Uuid) -> Result<(), CollabError> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (ws_stream, _) = tokio_tungstenite::connect_async(self.config.url.as_str()).await?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(OUTGOING_BUFFER);
        let cancel = self.shutdown.child_token();

        // Writer task: forward the outgoing channel to the WebSocket
        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    data = out_rx.recv() => {
                        let Some(data) = data else { break };
                        if let Err(e) = ws_writer.send(Message::Binary(data.into())).await {
                            log::warn!("WebSocket write failed: {e}");
                            break;
                        }
                    }
                }
            }
            let _ = ws_writer.close().await;
            writer_cancel.cancel();
        });

        // Reader task: apply everything the server sends
        let inner = self.clone();
        let reader_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    msg = ws_reader.next() => match msg {
                        Some(Ok(Message::Binary(data))) => {
                            inner.touch().await;
                            match Envelope::decode(&data) {
                                Ok(env) => inner.handle(env).await,
                                Err(e) => log::warn!("Dropping undecodable frame: {e}"),
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            log::warn!("WebSocket read failed: {e}");
                            break;
                        }
                        Some(Ok(_)) => inner.touch().await,
                    }
                }
            }
            reader_cancel.cancel();
            inner.link_lost(generation).await;
        });

        tokio::spawn(self.clone().heartbeat(cancel.clone()));

        *self.last_seen.lock().await = Instant::now();
        *self.link.lock().await = Some(Link {
            generation,
            outgoing: out_tx,
            cancel: cancel.clone(),
        });

        let sender = self.replica.lock().await.me_id();
        let env = Envelope::new(session, sender, first);
        let pending = self.requests.register(env.id, self.config.request_timeout);
        let joined = match self.send(&env).await {
            Ok(()) => pending.wait().await,
            Err(e) => Err(e),
        };
        if let Err(e) = joined {
            cancel.cancel();
            return Err(e);
        }

        {
            // Flip to connected and push the backlog under the replica lock
            // so no edit slips between the two.
            let mut replica = self.replica.lock().await;
            let (session, me) = (replica.session_id(), replica.me_id());
            let backlog = replica.unacked.outgoing(session, me);
            *self.state.write().await = ConnectionState::Connected;
            if !backlog.is_empty() {
                log::info!("Re-sending {} unacknowledged operations", backlog.len());
            }
            for env in &backlog {
                if let Err(e) = self.send(env).await {
                    log::warn!("Re-send interrupted: {e}");
                    break;
                }
            }
            let frontier = Envelope::new(session, me, Payload::Frontier(replica.frontier()));
            if let Err(e) = self.send(&frontier).await {
                log::debug!("Frontier not sent: {e}");
            }
        }
        log::info!("Connected to {}", self.config.url);
        self.emit(SyncEvent::Connected);
        Ok(())
    }

    async fn touch(&self) {
        *self.last_seen.lock().await = Instant::now();
    }

    async fn link_lost(&self, generation: u64) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        {
            let mut link = self.link.lock().await;
            if link.as_ref().is_some_and(|l| l.generation == generation) {
                *link = None;
            }
        }
        let was = {
            let mut state = self.state.write().await;
            let was = *state;
            if was == ConnectionState::Connected {
                *state = if self.stays_offline() {
                    ConnectionState::Disconnected
                } else {
                    ConnectionState::Reconnecting
                };
            }
            was
        };
        self.requests.fail_all(CollabError::Connection("link lost".into()));
        self.lock_requests.fail_all(CollabError::Connection("link lost".into()));
        if was == ConnectionState::Connected {
            log::warn!("Lost connection to {}", self.config.url);
            self.emit(SyncEvent::Disconnected);
            if !self.stays_offline() {
                let _ = self.lost.send(generation);
            }
        }
    }

    fn stays_offline(&self) -> bool {
        self.paused.load(Ordering::SeqCst) || self.ended.load(Ordering::SeqCst) || self.shutdown.is_cancelled()
    }

    async fn drop_link(&self) {
        if let Some(link) = self.link.lock().await.take() {
            link.cancel.cancel();
        }
    }

    async fn heartbeat(self: Arc<Self>, cancel: CancellationToken) {
        let mut beat = tokio::time::interval(self.config.heartbeat.max(Duration::from_millis(1)));
        let mut presence = tokio::time::interval(self.config.presence_interval.max(Duration::from_millis(1)));
        let silence_limit = self.config.heartbeat * self.config.missed_heartbeats.max(1);
        // The first tick fires immediately.
        beat.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = beat.tick() => {
                    let silent = self.last_seen.lock().await.elapsed();
                    if silent > silence_limit {
                        log::warn!("No traffic for {silent:?}, dropping the link");
                        cancel.cancel();
                        break;
                    }
                    let sender = self.replica.lock().await.me_id();
                    if let Err(e) = self.send(&Envelope::ping(sender)).await {
                        log::debug!("Heartbeat not sent: {e}");
                    }
                    self.report_frontier().await;
                }
                _ = presence.tick() => self.flush_presence().await,
            }
        }
    }

    /// Tell the server how far each local replica has got. Skipped until
    /// the backlog of a rejoin has gone out, since the report must not
    /// claim operations the server has yet to see.
    async fn report_frontier(&self) {
        if !self.is_connected().await {
            return;
        }
        let env = {
            let replica = self.replica.lock().await;
            Envelope::new(replica.session_id(), replica.me_id(), Payload::Frontier(replica.frontier()))
        };
        if let Err(e) = self.send(&env).await {
            log::debug!("Frontier not sent: {e}");
        }
    }

    async fn flush_presence(&self) {
        let (update, session, sender) = {
            let mut replica = self.replica.lock().await;
            if !replica.throttle.has_pending() {
                return;
            }
            let Some(update) = replica.throttle.flush(Instant::now()) else {
                return;
            };
            (update, replica.session_id(), replica.me_id())
        };
        if !self.is_connected().await {
            return;
        }
        if let Err(e) = self.send(&Envelope::new(session, sender, Payload::Presence(update))).await {
            log::debug!("Presence not sent: {e}");
        }
    }

    /// Long-lived task that turns lost links into reconnects.
    async fn supervise(self: Arc<Self>, mut lost: mpsc::UnboundedReceiver<u64>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                signal = lost.recv() => {
                    let Some(generation) = signal else { break };
                    if generation != self.generation.load(Ordering::SeqCst) {
                        continue;
                    }
                    self.reconnect_with_backoff().await;
                }
            }
        }
    }

    async fn reconnect_with_backoff(self: &Arc<Self>) {
        let policy = self.config.backoff;
        let mut attempt = 1;
        loop {
            if self.stays_offline() {
                return;
            }
            if policy.exhausted(attempt) {
                log::error!("Giving up after {} reconnect attempts", attempt - 1);
                self.give_up().await;
                return;
            }
            let delay = policy.delay(attempt);
            *self.state.write().await = ConnectionState::Reconnecting;
            self.emit(SyncEvent::Reconnecting { attempt, delay });
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            if self.stays_offline() {
                return;
            }
            match self.rejoin().await {
                Ok(()) => {
                    log::info!("Reconnected after {attempt} attempt(s)");
                    return;
                }
                Err(e) if e.is_retryable() => {
                    log::warn!("Reconnect attempt {attempt} failed: {e}");
                    attempt += 1;
                }
                Err(e) => {
                    log::error!("Rejoin refused: {e}");
                    self.give_up().await;
                    return;
                }
            }
        }
    }

    async fn give_up(&self) {
        *self.state.write().await = ConnectionState::Disconnected;
        self.emit(SyncEvent::GaveUp);
    }

    async fn rejoin(self: &Arc<Self>) -> Result<(), CollabError> {
        let session = self.replica.lock().await.session_id();
        let identity = self.identity.lock().await.clone();
        self.establish(Payload::Join(identity), session).await
    }

    /// Leave for good after a kick or session end.
    async fn end(&self, event: SyncEvent) {
        self.ended.store(true, Ordering::SeqCst);
        *self.state.write().await = ConnectionState::Disconnected;
        self.drop_link().await;
        self.emit(event);
    }

    // ─── inbound ───

    async fn handle(&self, env: Envelope) {
        let reply_to = env.reply_to;
        match env.payload {
            Payload::Error(error) => self.on_error(reply_to, error).await,
            Payload::LockResponse(decision) => {
                if let (LockDecision::Granted(lock), Some(document)) = (&decision, env.document_id) {
                    let mut replica = self.replica.lock().await;
                    if let Ok(doc) = replica.document_mut(&document) {
                        doc.mirror_lock(lock.clone());
                        self.emit(SyncEvent::LockGranted {
                            document,
                            lock: lock.clone(),
                        });
                    }
                }
                if let Some(request) = reply_to {
                    self.lock_requests.resolve(request, Ok(decision));
                }
            }
            payload => {
                let reply = reply_to.map(|request| (request, payload.clone()));
                self.apply(env.document_id, env.sender, payload).await;
                if let Some((request, payload)) = reply {
                    self.requests.resolve(request, Ok(payload));
                }
            }
        }
    }

    async fn on_error(&self, reply_to: Option<Uuid>, error: WireError) {
        if let Some(request) = reply_to {
            let (rejected, site) = {
                let mut replica = self.replica.lock().await;
                let rejected = replica.reject(&request);
                (rejected, replica.site)
            };
            if !rejected.is_empty() {
                for entry in &rejected {
                    log::warn!("Operation {} rejected: {error:?}", entry.op.id);
                    self.emit(SyncEvent::OperationRejected {
                        document: entry.document,
                        op: entry.op.id,
                        error: error.clone(),
                    });
                }
                // The replica still shows the refused edit. Rejoin under the
                // new site and rebuild from the server's state.
                self.identity.lock().await.site = site;
                self.drop_link().await;
                return;
            }
            if self.requests.resolve(request, Err(error.clone().into()))
                || self.lock_requests.resolve(request, Err(error.clone().into()))
            {
                return;
            }
        }
        log::warn!("Server error: {error:?}");
        self.emit(SyncEvent::ServerError(error));
    }

    async fn apply(&self, document: Option<Uuid>, sender: Uuid, payload: Payload) {
        let mut guard = self.replica.lock().await;
        let replica = &mut *guard;
        let me = replica.me_id();

        match payload {
            Payload::Operation(op) => {
                let Some(doc_id) = document else {
                    log::warn!("Operation {} without a document", op.id);
                    return;
                };
                let Some(doc) = replica.documents.get_mut(&doc_id) else {
                    log::debug!("Operation {} for unknown document {doc_id}", op.id);
                    return;
                };
                let op_id = op.id;
                match doc.apply_remote(Some(sender), op) {
                    Ok(AppliedResult::Applied(applied)) => {
                        for a in &applied {
                            if let Some(edit) = TextEdit::from_applied(a) {
                                replica.presence.shift(doc_id, &edit);
                            }
                            self.emit(SyncEvent::RemoteOperation {
                                document: doc_id,
                                op: a.op.id,
                            });
                        }
                    }
                    Ok(_) => log::trace!("Operation {op_id} duplicate or parked"),
                    Err(e) => log::warn!("Dropping remote operation {op_id}: {e}"),
                }
            }

            Payload::Ack { op, .. } => {
                if !replica.unacked.acknowledge(&op) {
                    log::trace!("Ack for unknown operation {op}");
                }
            }

            Payload::PresenceState(presence) => {
                if presence.participant != me && replica.presence.upsert(presence.clone()) {
                    self.emit(SyncEvent::PresenceChanged(presence));
                }
            }

            Payload::SyncResponse(payload) => {
                let (documents, lost) = replica.apply_sync(*payload);
                let me = replica.me_id();
                self.identity.lock().await.participant.get_or_insert(me);
                for entry in lost {
                    self.emit(SyncEvent::OperationRejected {
                        document: entry.document,
                        op: entry.op.id,
                        error: WireError::Validation("no longer applies after resync".into()),
                    });
                }
                self.emit(SyncEvent::Synced { documents });
            }

            Payload::Joined(participant) => {
                replica.presence.join(participant.id, participant.site);
                replica.participants.insert(participant.id, participant.clone());
                self.emit(SyncEvent::ParticipantJoined(participant));
            }

            Payload::Left { participant } => {
                replica.participants.remove(&participant);
                replica.presence.leave(&participant);
                self.emit(SyncEvent::ParticipantLeft(participant));
            }

            Payload::Shared(snapshot) => {
                let id = snapshot.id;
                let name = snapshot.name.clone();
                match replica.documents.get_mut(&id) {
                    Some(doc) => {
                        doc.merge_snapshot(&snapshot);
                    }
                    None => {
                        replica
                            .documents
                            .insert(id, SharedDocument::from_snapshot(replica.site, *snapshot));
                    }
                }
                self.emit(SyncEvent::DocumentShared { document: id, name });
            }

            Payload::LockReleased { lock, reason } => {
                let Some(doc_id) = document else { return };
                if let Ok(doc) = replica.document_mut(&doc_id) {
                    doc.forget_lock(&lock.id);
                    self.emit(SyncEvent::LockReleased {
                        document: doc_id,
                        lock,
                        reason,
                    });
                }
            }

            Payload::Comment(comment) => {
                let Some(doc_id) = document else { return };
                let Ok(doc) = replica.document_mut(&doc_id) else { return };
                let (changed, comment) = match comment {
                    CommentPayload::Add(c) => (doc.insert_comment(c.clone()), c),
                    CommentPayload::Updated(c) => (doc.update_comment(c.clone()), c),
                    other => {
                        log::debug!("Ignoring client-side comment request {other:?}");
                        return;
                    }
                };
                if changed {
                    let comment = doc.comment(&comment.id).cloned().unwrap_or(comment);
                    self.emit(SyncEvent::CommentChanged {
                        document: doc_id,
                        comment,
                    });
                }
            }

            Payload::Chat(ChatPayload::Message(message)) => {
                if replica.chat.insert(message.clone()) {
                    self.emit(SyncEvent::ChatMessage(message));
                }
            }
            Payload::Chat(ChatPayload::Updated(message)) => {
                replica.chat.upsert(message.clone());
                self.emit(SyncEvent::ChatUpdated(message));
            }
            Payload::Chat(_) => {}

            Payload::Admin(AdminPayload::Kicked { participant, by }) => {
                if participant == me {
                    drop(guard);
                    log::warn!("Kicked from the session by {by}");
                    self.end(SyncEvent::Kicked { by }).await;
                } else {
                    replica.participants.remove(&participant);
                    replica.presence.leave(&participant);
                    self.emit(SyncEvent::ParticipantLeft(participant));
                }
            }
            Payload::Admin(AdminPayload::RoleChanged(participant)) => {
                if participant.id == me {
                    replica.me = Some(participant.clone());
                }
                replica.participants.insert(participant.id, participant.clone());
                self.emit(SyncEvent::RoleChanged(participant));
            }
            Payload::Admin(AdminPayload::SessionEnded) => {
                drop(guard);
                log::info!("Session ended");
                self.end(SyncEvent::SessionEnded).await;
            }

            Payload::SafePoints(points) => {
                for (doc_id, safe) in points {
                    let Some(doc) = replica.documents.get_mut(&doc_id) else {
                        continue;
                    };
                    // Parked operations may still anchor on those tombstones.
                    if doc.text().deferred_len() > 0 {
                        continue;
                    }
                    let safe = safe.meet(doc.clock());
                    let dropped = doc.compact(&safe);
                    if dropped > 0 {
                        log::trace!("Dropped {dropped} tombstones from {doc_id}");
                    }
                }
            }

            Payload::Ping | Payload::Pong => {}

            other => log::debug!("Ignoring {:?}", other.message_type()),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// SyncClient
// ───────────────────────────────────────────────────────────────────

/// Handle to a replica of one session.
///
/// Dropping the handle stops every background task.
pub struct SyncClient {
    inner: Arc<Inner>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
}

impl SyncClient {
    /// Create a session on the server and join it as its owner.
    pub async fn create(
        config: ClientConfig,
        name: impl Into<String>,
        owner: JoinRequest,
        settings: SessionSettings,
    ) -> Result<Self, CollabError> {
        let first = Payload::Create {
            name: name.into(),
            owner: owner.clone(),
            settings,
        };
        Self::start(config, owner, first, Uuid::nil()).await
    }

    /// Join an existing session.
    pub async fn join(config: ClientConfig, session: Uuid, identity: JoinRequest) -> Result<Self, CollabError> {
        let first = Payload::Join(identity.clone());
        Self::start(config, identity, first, session).await
    }

    async fn start(config: ClientConfig, identity: JoinRequest, first: Payload, session: Uuid) -> Result<Self, CollabError> {
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let (lost_tx, lost_rx) = mpsc::unbounded_channel();
        let replica = Replica::new(identity.site, &config);
        let inner = Arc::new(Inner {
            config,
            identity: Mutex::new(identity),
            state: RwLock::new(ConnectionState::Connecting),
            replica: Mutex::new(replica),
            link: Mutex::new(None),
            generation: AtomicU64::new(0),
            requests: RequestTable::new(),
            lock_requests: RequestTable::new(),
            events: event_tx,
            lost: lost_tx,
            paused: AtomicBool::new(false),
            ended: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            last_seen: Mutex::new(Instant::now()),
        });

        if let Err(e) = inner.establish(first, session).await {
            *inner.state.write().await = ConnectionState::Disconnected;
            inner.shutdown.cancel();
            return Err(e);
        }
        tokio::spawn(inner.clone().supervise(lost_rx));

        Ok(Self {
            inner,
            event_rx: Some(event_rx),
        })
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.inner.state.read().await
    }

    pub async fn session_id(&self) -> Uuid {
        self.inner.replica.lock().await.session_id()
    }

    pub async fn session(&self) -> Option<SessionInfo> {
        self.inner.replica.lock().await.session.clone()
    }

    pub async fn me(&self) -> Option<Participant> {
        self.inner.replica.lock().await.me.clone()
    }

    pub async fn participants(&self) -> Vec<Participant> {
        self.inner.replica.lock().await.participants.values().cloned().collect()
    }

    pub async fn presence_of(&self, participant: &Uuid) -> Option<Presence> {
        self.inner.replica.lock().await.presence.get(participant).cloned()
    }

    pub async fn document_ids(&self) -> Vec<Uuid> {
        self.inner.replica.lock().await.documents.keys().copied().collect()
    }

    pub async fn snapshot(&self, document: &Uuid) -> Option<DocumentSnapshot> {
        self.inner
            .replica
            .lock()
            .await
            .documents
            .get(document)
            .map(SharedDocument::snapshot)
    }

    pub async fn render(&self, document: &Uuid) -> Option<String> {
        self.inner.replica.lock().await.documents.get(document).map(SharedDocument::render)
    }

    /// Latest text of `document`, readable without waiting on the replica.
    pub async fn text_view(&self, document: &Uuid) -> Option<watch::Receiver<Arc<str>>> {
        self.inner
            .replica
            .lock()
            .await
            .documents
            .get(document)
            .map(SharedDocument::text_view)
    }

    pub async fn comments(&self, document: &Uuid) -> Vec<Comment> {
        self.inner
            .replica
            .lock()
            .await
            .documents
            .get(document)
            .map(|d| d.comments().to_vec())
            .unwrap_or_default()
    }

    pub async fn messages(&self) -> Vec<ChatMessage> {
        let replica = self.inner.replica.lock().await;
        replica.chat.page(None, replica.chat.len()).messages
    }

    /// Operations sent (or waiting to be) that the server has not
    /// acknowledged.
    pub async fn unacked_len(&self) -> usize {
        self.inner.replica.lock().await.unacked.len()
    }

    // ─── editing ───

    /// Apply an edit locally and send it. Works offline: the operations
    /// wait in the queue until the next resync.
    pub async fn edit(&self, document: Uuid, edit: Edit) -> Result<Vec<OpId>, CollabError> {
        let mut guard = self.inner.replica.lock().await;
        let replica = &mut *guard;
        let me = replica.require(Permissions::WRITE)?.id;
        if replica.unacked.remaining() < op_estimate(&edit) {
            return Err(CollabError::Connection("offline queue full".into()));
        }
        let applied = replica.document_mut(&document)?.apply_local(me, edit)?;

        let mut ids = Vec::with_capacity(applied.len());
        for a in applied {
            if let Some(text_edit) = TextEdit::from_applied(&a) {
                replica.presence.shift(document, &text_edit);
            }
            ids.push(a.op.id);
            replica.unacked.enqueue(document, a.op);
        }

        if self.inner.is_connected().await {
            let session = replica.session_id();
            for id in &ids {
                let Some(env) = replica.unacked.envelope_for(id, session, me) else {
                    continue;
                };
                if let Err(e) = self.inner.send(&env).await {
                    log::debug!("Operation {id} stays queued: {e}");
                    break;
                }
            }
        }
        Ok(ids)
    }

    // ─── presence ───

    /// Throttled and coalesced; dropped while offline.
    pub async fn update_presence(&self, update: PresenceUpdate) -> Result<(), CollabError> {
        if !self.inner.is_connected().await {
            self.inner.replica.lock().await.throttle.clear();
            return Ok(());
        }
        let (ready, session, me) = {
            let mut replica = self.inner.replica.lock().await;
            let ready = replica.throttle.offer(update, Instant::now());
            (ready, replica.session_id(), replica.me_id())
        };
        match ready {
            Some(update) => self.inner.send(&Envelope::new(session, me, Payload::Presence(update))).await,
            None => Ok(()),
        }
    }

    pub async fn set_cursor(&self, document: Uuid, offset: usize) -> Result<(), CollabError> {
        let clock = self.document_clock(&document).await?;
        self.update_presence(PresenceUpdate::cursor(document, offset, clock)).await
    }

    pub async fn set_selection(&self, document: Uuid, range: Range<usize>) -> Result<(), CollabError> {
        let clock = self.document_clock(&document).await?;
        self.update_presence(PresenceUpdate::selection(document, range, clock)).await
    }

    pub async fn set_status(&self, status: PresenceStatus) -> Result<(), CollabError> {
        self.update_presence(PresenceUpdate::status(status)).await
    }

    async fn document_clock(&self, document: &Uuid) -> Result<tandem_core::VectorClock, CollabError> {
        let mut replica = self.inner.replica.lock().await;
        Ok(replica.document_mut(document)?.clock().clone())
    }

    // ─── requests ───

    async fn online(&self) -> Result<(Uuid, Uuid), CollabError> {
        if !self.inner.is_connected().await {
            return Err(CollabError::Connection("offline".into()));
        }
        let replica = self.inner.replica.lock().await;
        Ok((replica.session_id(), replica.me_id()))
    }

    async fn request(&self, env: Envelope) -> Result<Payload, CollabError> {
        let pending = self.inner.requests.register(env.id, self.inner.config.request_timeout);
        self.inner.send(&env).await?;
        pending.wait().await
    }

    /// Ask the server for a lock. The returned request resolves to the
    /// decision and may be abandoned with [`PendingRequest::cancel`].
    pub async fn request_lock(
        &self,
        document: Uuid,
        range: Option<Range<usize>>,
        kind: LockKind,
    ) -> Result<PendingRequest<LockDecision>, CollabError> {
        let (session, me) = self.online().await?;
        let request = LockRequest::new(me, range, kind);
        let env = Envelope::new(session, me, Payload::LockRequest(request)).for_document(document);
        let pending = self.inner.lock_requests.register(env.id, self.inner.config.request_timeout);
        self.inner.send(&env).await?;
        Ok(pending)
    }

    pub async fn release_lock(&self, document: Uuid, lock: Uuid) -> Result<(), CollabError> {
        let (session, me) = self.online().await?;
        self.inner
            .send(&Envelope::new(session, me, Payload::ReleaseLock { lock }).for_document(document))
            .await
    }

    /// Share a document with the session and wait until it is registered.
    pub async fn share_document(
        &self,
        name: impl Into<String>,
        kind: DocumentKind,
        content: Option<&str>,
    ) -> Result<DocumentSnapshot, CollabError> {
        let (session, me) = self.online().await?;
        let env = Envelope::new(
            session,
            me,
            Payload::Share {
                name: name.into(),
                kind,
                content: content.map(str::to_string),
            },
        );
        match self.request(env).await? {
            Payload::Shared(snapshot) => Ok(*snapshot),
            other => Err(CollabError::Protocol(format!("unexpected reply {:?}", other.message_type()))),
        }
    }

    /// Fetch the full state again and merge it.
    pub async fn resync(&self) -> Result<(), CollabError> {
        let (session, me) = self.online().await?;
        self.request(Envelope::new(session, me, Payload::SyncRequest)).await?;
        Ok(())
    }

    pub async fn send_message(&self, content: impl Into<String>) -> Result<(), CollabError> {
        self.chat(ChatPayload::Send {
            content: content.into(),
            kind: MessageKind::Text,
        })
        .await
    }

    pub async fn react(&self, message: Uuid, emoji: impl Into<String>) -> Result<(), CollabError> {
        self.chat(ChatPayload::React {
            message,
            emoji: emoji.into(),
        })
        .await
    }

    pub async fn unreact(&self, message: Uuid, emoji: impl Into<String>) -> Result<(), CollabError> {
        self.chat(ChatPayload::Unreact {
            message,
            emoji: emoji.into(),
        })
        .await
    }

    pub async fn edit_message(&self, message: Uuid, content: impl Into<String>) -> Result<(), CollabError> {
        self.chat(ChatPayload::Edit {
            message,
            content: content.into(),
        })
        .await
    }

    async fn chat(&self, chat: ChatPayload) -> Result<(), CollabError> {
        let (session, me) = self.online().await?;
        self.inner.send(&Envelope::new(session, me, Payload::Chat(chat))).await
    }

    /// One page of chat backlog from the server.
    pub async fn chat_history(&self, before: Option<Uuid>, limit: Option<usize>) -> Result<ChatPage, CollabError> {
        let (session, me) = self.online().await?;
        let env = Envelope::new(
            session,
            me,
            Payload::Chat(ChatPayload::History {
                before,
                limit: limit.unwrap_or(DEFAULT_PAGE_SIZE),
            }),
        );
        match self.request(env).await? {
            Payload::Chat(ChatPayload::Page(page)) => Ok(page),
            other => Err(CollabError::Protocol(format!("unexpected reply {:?}", other.message_type()))),
        }
    }

    /// Comment on `document`. Applied locally, then sent.
    pub async fn add_comment(
        &self,
        document: Uuid,
        content: impl Into<String>,
        anchor: CommentAnchor,
    ) -> Result<Comment, CollabError> {
        let (session, me) = self.online().await?;
        let comment = {
            let mut replica = self.inner.replica.lock().await;
            replica.require(Permissions::CHAT)?;
            replica.document_mut(&document)?.add_comment(me, content, anchor).clone()
        };
        let env = Envelope::new(session, me, Payload::Comment(CommentPayload::Add(comment.clone()))).for_document(document);
        self.inner.send(&env).await?;
        Ok(comment)
    }

    pub async fn reply_comment(&self, document: Uuid, comment: Uuid, content: impl Into<String>) -> Result<(), CollabError> {
        let (session, me) = self.online().await?;
        let payload = CommentPayload::Reply {
            comment,
            content: content.into(),
        };
        self.inner
            .send(&Envelope::new(session, me, Payload::Comment(payload)).for_document(document))
            .await
    }

    pub async fn resolve_comment(&self, document: Uuid, comment: Uuid) -> Result<(), CollabError> {
        let (session, me) = self.online().await?;
        self.inner
            .send(&Envelope::new(session, me, Payload::Comment(CommentPayload::Resolve { comment })).for_document(document))
            .await
    }

    // ─── moderation ───

    pub async fn kick(&self, participant: Uuid) -> Result<(), CollabError> {
        self.admin(AdminPayload::Kick { participant }).await
    }

    pub async fn change_role(&self, participant: Uuid, role: Role) -> Result<(), CollabError> {
        self.admin(AdminPayload::ChangeRole { participant, role }).await
    }

    /// End the session for everyone. Owner only.
    pub async fn end_session(&self) -> Result<(), CollabError> {
        self.admin(AdminPayload::EndSession).await
    }

    async fn admin(&self, admin: AdminPayload) -> Result<(), CollabError> {
        let (session, me) = self.online().await?;
        self.inner.send(&Envelope::new(session, me, Payload::Admin(admin))).await
    }

    // ─── link control ───

    /// Go offline and stay offline. Edits keep working and queue up.
    pub async fn disconnect(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
        let was = {
            let mut state = self.inner.state.write().await;
            std::mem::replace(&mut *state, ConnectionState::Disconnected)
        };
        self.inner.drop_link().await;
        if was != ConnectionState::Disconnected {
            log::info!("Disconnected on request");
            self.inner.emit(SyncEvent::Disconnected);
        }
    }

    /// Come back online now: rejoin, resync and re-send the queue.
    pub async fn reconnect(&self) -> Result<(), CollabError> {
        if self.inner.ended.load(Ordering::SeqCst) {
            return Err(CollabError::Connection("session is over for this client".into()));
        }
        self.inner.paused.store(false, Ordering::SeqCst);
        *self.inner.state.write().await = ConnectionState::Reconnecting;
        let result = self.inner.rejoin().await;
        if result.is_err() {
            *self.inner.state.write().await = ConnectionState::Disconnected;
        }
        result
    }

    /// Drop the current link and let the supervisor reconnect.
    pub async fn force_reconnect(&self) {
        self.inner.drop_link().await;
    }

    /// Leave the session and stop.
    pub async fn leave(&self) -> Result<(), CollabError> {
        let sent = match self.online().await {
            Ok((session, me)) => self.inner.send(&Envelope::new(session, me, Payload::Leave)).await,
            Err(e) => Err(e),
        };
        self.inner.ended.store(true, Ordering::SeqCst);
        *self.inner.state.write().await = ConnectionState::Disconnected;
        // Give the writer a moment to flush the leave frame.
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.inner.drop_link().await;
        self.inner.shutdown.cancel();
        sent
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}
