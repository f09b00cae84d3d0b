//! Sessions: roster, shared documents, presence and chat.
//!
//! [`Session`] is the synchronous engine. Every mutating method checks the
//! caller's permissions, updates state and publishes a
//! [`SessionEvent`]. [`SessionManager`] owns many sessions behind async
//! locks and is what the server and embedders talk to.
//!
//! ```text
//! SessionManager
//!   └── Session (Mutex)
//!         ├── participants      id → Participant
//!         ├── documents         id → SharedDocument
//!         ├── presence          PresenceRoom
//!         ├── chat              ChatChannel
//!         └── known clocks      (participant, document) → VectorClock
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::sync::Arc;
use tandem_core::{
    safe_point, AppliedResult, Lock, LockDecision, LockKind, LockRequest, Operation,
    ReleaseReason, SiteId, TextEdit, VectorClock, DEFAULT_LOCK_TTL_MS,
};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::chat::{ChatChannel, ChatMessage, ChatPage, MessageKind, DEFAULT_PAGE_SIZE};
use crate::document::{Comment, CommentAnchor, CommentReply, DocumentKind, DocumentSnapshot, Edit, SharedDocument};
use crate::error::CollabError;
use crate::events::{EventBus, SessionEvent, Subscription};
use crate::participant::{Participant, Permissions, Role};
use crate::presence::{Presence, PresenceRoom, PresenceUpdate, AWAY_AFTER, IDLE_AFTER};

// ───────────────────────────────────────────────────────────────────
// Settings and wire-facing records
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Role given to identified participants joining for the first time.
    pub default_role: Role,
    pub max_participants: usize,
    pub enable_chat: bool,
    /// Persistent sessions outlive their last participant.
    pub persistent: bool,
    /// Unix millis after which nobody may join.
    pub expires_at: Option<u64>,
    pub require_auth: bool,
    /// Participants without an id join as guests.
    pub allow_anonymous: bool,
    pub password: Option<String>,
    pub lock_ttl_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            default_role: Role::Editor,
            max_participants: 50,
            enable_chat: true,
            persistent: true,
            expires_at: None,
            require_auth: false,
            allow_anonymous: true,
            password: None,
            lock_ttl_ms: DEFAULT_LOCK_TTL_MS,
        }
    }
}

/// Public description of a session. Never carries the password.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: Uuid,
    pub name: String,
    pub owner: Uuid,
    pub created_at: u64,
    pub default_role: Role,
    pub max_participants: usize,
    pub enable_chat: bool,
    pub persistent: bool,
    pub expires_at: Option<u64>,
    pub require_auth: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    /// `None` joins anonymously.
    pub participant: Option<Uuid>,
    pub name: String,
    pub site: SiteId,
    pub credential: Option<String>,
}

impl JoinRequest {
    pub fn new(participant: Uuid, name: impl Into<String>, site: SiteId) -> Self {
        Self {
            participant: Some(participant),
            name: name.into(),
            site,
            credential: None,
        }
    }

    pub fn anonymous(name: impl Into<String>, site: SiteId) -> Self {
        Self {
            participant: None,
            name: name.into(),
            site,
            credential: None,
        }
    }

    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }
}

/// Everything a joining or resyncing replica needs: full state, not history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncPayload {
    pub session: SessionInfo,
    pub me: Participant,
    pub participants: Vec<Participant>,
    pub documents: Vec<DocumentSnapshot>,
    pub presence: Vec<Presence>,
    pub chat: ChatPage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaveReason {
    Left,
    /// Connection dropped; the participant may come back.
    Disconnected,
    Kicked,
}

#[derive(Debug, Clone, Default)]
pub struct LeaveOutcome {
    /// Locks the participant held, by document.
    pub released: Vec<(Uuid, Lock)>,
    /// Nobody is left in the session.
    pub empty: bool,
    /// The session was torn down as a result.
    pub closed: bool,
    /// Final document states when the session became empty.
    pub snapshots: Vec<DocumentSnapshot>,
}

// ───────────────────────────────────────────────────────────────────
// Session
// ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Session {
    id: Uuid,
    name: String,
    owner: Uuid,
    created_at: u64,
    settings: SessionSettings,
    /// Site of this replica; documents created here use it.
    site: SiteId,
    participants: HashMap<Uuid, Participant>,
    /// Roles survive leaving, so a returning participant keeps theirs.
    known_roles: HashMap<Uuid, Role>,
    documents: BTreeMap<Uuid, SharedDocument>,
    presence: PresenceRoom,
    chat: ChatChannel,
    /// Lower bound of what each participant has seen, per document.
    known_clocks: HashMap<(Uuid, Uuid), VectorClock>,
    /// Every site a participant has joined with. A replica that moves to a
    /// new site still owns the operations queued under its old ones.
    site_owners: HashMap<SiteId, Uuid>,
    ended: bool,
    events: EventBus,
}

impl Session {
    /// New session with `owner` as its only participant.
    pub fn create(
        name: impl Into<String>,
        owner: JoinRequest,
        settings: SessionSettings,
        site: SiteId,
        events: EventBus,
    ) -> Self {
        let owner_id = owner.participant.unwrap_or_else(Uuid::new_v4);
        let id = Uuid::new_v4();
        let mut session = Self {
            id,
            name: name.into(),
            owner: owner_id,
            created_at: tandem_core::now_millis(),
            settings,
            site,
            participants: HashMap::new(),
            known_roles: HashMap::from([(owner_id, Role::Owner)]),
            documents: BTreeMap::new(),
            presence: PresenceRoom::new(),
            chat: ChatChannel::new(),
            known_clocks: HashMap::new(),
            site_owners: HashMap::from([(owner.site, owner_id)]),
            ended: false,
            events,
        };
        let participant = Participant::new(owner_id, owner.name, Role::Owner, owner.site);
        session.presence.join(owner_id, owner.site);
        session.participants.insert(owner_id, participant.clone());
        session.events.publish(SessionEvent::SessionCreated { session: id, owner: owner_id });
        session.events.publish(SessionEvent::ParticipantJoined { session: id, participant });
        log::info!("Session {id} created by {owner_id}");
        session
    }

    // ─── accessors ───

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> Uuid {
        self.owner
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            name: self.name.clone(),
            owner: self.owner,
            created_at: self.created_at,
            default_role: self.settings.default_role,
            max_participants: self.settings.max_participants,
            enable_chat: self.settings.enable_chat,
            persistent: self.settings.persistent,
            expires_at: self.settings.expires_at,
            require_auth: self.settings.require_auth,
        }
    }

    pub fn participant(&self, id: &Uuid) -> Option<&Participant> {
        self.participants.get(id)
    }

    pub fn participants(&self) -> impl Iterator<Item = &Participant> {
        self.participants.values()
    }

    pub fn document(&self, id: &Uuid) -> Option<&SharedDocument> {
        self.documents.get(id)
    }

    pub fn documents(&self) -> impl Iterator<Item = &SharedDocument> {
        self.documents.values()
    }

    pub fn presence(&self) -> &PresenceRoom {
        &self.presence
    }

    pub fn chat(&self) -> &ChatChannel {
        &self.chat
    }

    fn require(&self, id: Uuid, required: Permissions) -> Result<&Participant, CollabError> {
        let participant = self
            .participants
            .get(&id)
            .ok_or(CollabError::not_found("participant", id))?;
        if !participant.can(required) {
            log::debug!("Participant {id} denied: needs {required:?}");
            return Err(CollabError::Permission { participant: id, required });
        }
        Ok(participant)
    }

    fn ensure_open(&self) -> Result<(), CollabError> {
        if self.ended {
            return Err(CollabError::not_found("session", self.id));
        }
        Ok(())
    }

    // ─── lifecycle ───

    /// Admit a participant and hand back the full state.
    pub fn join(&mut self, request: JoinRequest) -> Result<SyncPayload, CollabError> {
        self.ensure_open()?;
        if let Some(expires_at) = self.settings.expires_at {
            if tandem_core::now_millis() >= expires_at {
                return Err(CollabError::Authentication("session expired".into()));
            }
        }
        self.authenticate(&request)?;

        let (id, role) = match request.participant {
            Some(id) => {
                let role = self
                    .known_roles
                    .get(&id)
                    .copied()
                    .unwrap_or(self.settings.default_role);
                (id, role)
            }
            None if self.settings.allow_anonymous => (Uuid::new_v4(), Role::Guest),
            None => return Err(CollabError::Authentication("anonymous access disabled".into())),
        };

        let rejoin = self.participants.contains_key(&id);
        if !rejoin && self.participants.len() >= self.settings.max_participants {
            log::warn!("Session {} full, refusing {}", self.id, request.name);
            return Err(CollabError::Capacity {
                session: self.id,
                max: self.settings.max_participants,
            });
        }

        if let Some(holder) = self.site_owners.get(&request.site) {
            if *holder != id {
                return Err(CollabError::Protocol(format!(
                    "site {} belongs to another participant",
                    request.site
                )));
            }
        }

        let participant = Participant::new(id, request.name, role, request.site);
        self.site_owners.insert(request.site, id);
        self.known_roles.insert(id, role);
        self.participants.insert(id, participant.clone());
        self.presence.join(id, request.site);
        // A returning replica may still hold offline edits anchored on
        // tombstones it saw before it dropped. Its retained clock only moves
        // on when it reports a frontier.
        for (doc_id, doc) in &self.documents {
            self.known_clocks
                .entry((id, *doc_id))
                .or_insert_with(|| doc.clock().clone());
        }

        log::info!(
            "Participant {} ({id}) {} session {} as {role}",
            participant.name,
            if rejoin { "rejoined" } else { "joined" },
            self.id
        );
        self.events.publish(SessionEvent::ParticipantJoined {
            session: self.id,
            participant: participant.clone(),
        });
        self.sync_payload(id)
    }

    fn authenticate(&self, request: &JoinRequest) -> Result<(), CollabError> {
        match (&self.settings.password, &request.credential) {
            (Some(expected), Some(given)) if expected == given => Ok(()),
            (Some(_), _) => Err(CollabError::Authentication("invalid credential".into())),
            (None, None) if self.settings.require_auth => {
                Err(CollabError::Authentication("credential required".into()))
            }
            (None, _) => Ok(()),
        }
    }

    pub fn leave(&mut self, participant: Uuid, reason: LeaveReason) -> Result<LeaveOutcome, CollabError> {
        if self.participants.remove(&participant).is_none() {
            return Err(CollabError::not_found("participant", participant));
        }
        self.presence.leave(&participant);

        let mut outcome = LeaveOutcome::default();
        for (doc_id, doc) in self.documents.iter_mut() {
            for lock in doc.release_locks_of(participant) {
                self.events.publish(SessionEvent::LockReleased {
                    session: self.id,
                    document: *doc_id,
                    lock: lock.clone(),
                    reason: ReleaseReason::Disconnect,
                });
                outcome.released.push((*doc_id, lock));
            }
        }
        // A dropped replica may still hold unsent edits anchored on old
        // tombstones, so its clock keeps holding back compaction.
        if reason != LeaveReason::Disconnected {
            self.known_clocks.retain(|(p, _), _| *p != participant);
        }

        let event = match reason {
            LeaveReason::Kicked => None,
            _ => Some(SessionEvent::ParticipantLeft { session: self.id, participant }),
        };
        if let Some(event) = event {
            self.events.publish(event);
        }
        log::info!("Participant {participant} left session {} ({reason:?})", self.id);

        if self.participants.is_empty() {
            outcome.empty = true;
            outcome.snapshots = self.snapshots();
            if !self.settings.persistent {
                outcome.closed = true;
                self.ended = true;
                self.events.publish(SessionEvent::SessionEnded { session: self.id });
                log::info!("Session {} closed (empty, not persistent)", self.id);
            }
        }
        Ok(outcome)
    }

    /// Tear the session down. Only the owner may do this. Returns the final
    /// document states.
    pub fn end(&mut self, by: Uuid) -> Result<Vec<DocumentSnapshot>, CollabError> {
        self.ensure_open()?;
        if by != self.owner {
            return Err(CollabError::Permission {
                participant: by,
                required: Permissions::ADMIN,
            });
        }
        self.ended = true;
        for doc in self.documents.values_mut() {
            doc.restore_locks(Vec::new());
        }
        self.events.publish(SessionEvent::SessionEnded { session: self.id });
        log::info!("Session {} ended by owner", self.id);
        Ok(self.snapshots())
    }

    pub fn kick(&mut self, by: Uuid, target: Uuid) -> Result<LeaveOutcome, CollabError> {
        self.ensure_open()?;
        self.require_moderator(by)?;
        if target == self.owner {
            return Err(CollabError::Permission {
                participant: by,
                required: Permissions::all(),
            });
        }
        let outcome = self.leave(target, LeaveReason::Kicked)?;
        self.events.publish(SessionEvent::ParticipantKicked {
            session: self.id,
            participant: target,
            by,
        });
        log::info!("Participant {target} kicked from session {} by {by}", self.id);
        Ok(outcome)
    }

    pub fn change_role(&mut self, by: Uuid, target: Uuid, role: Role) -> Result<Participant, CollabError> {
        self.ensure_open()?;
        self.require_moderator(by)?;
        if target == self.owner || role == Role::Owner {
            return Err(CollabError::Permission {
                participant: by,
                required: Permissions::all(),
            });
        }
        let participant = self
            .participants
            .get_mut(&target)
            .ok_or(CollabError::not_found("participant", target))?;
        participant.set_role(role);
        let updated = participant.clone();
        self.known_roles.insert(target, role);
        self.events.publish(SessionEvent::RoleChanged {
            session: self.id,
            participant: target,
            role,
        });
        Ok(updated)
    }

    fn require_moderator(&self, by: Uuid) -> Result<(), CollabError> {
        let participant = self
            .participants
            .get(&by)
            .ok_or(CollabError::not_found("participant", by))?;
        if !participant.role.can_moderate() {
            return Err(CollabError::Permission {
                participant: by,
                required: Permissions::ADMIN,
            });
        }
        Ok(())
    }

    // ─── documents ───

    /// Share a new document, optionally seeded with content.
    pub fn share_document(
        &mut self,
        by: Uuid,
        name: impl Into<String>,
        kind: DocumentKind,
        content: Option<&str>,
    ) -> Result<DocumentSnapshot, CollabError> {
        self.ensure_open()?;
        self.require(by, Permissions::SHARE)?;
        let id = Uuid::new_v4();
        let name = name.into();
        let doc = SharedDocument::with_content(id, name.clone(), kind, self.site, content.unwrap_or(""));
        let snapshot = doc.snapshot();
        for participant in self.participants.keys() {
            self.known_clocks.insert((*participant, id), doc.clock().clone());
        }
        self.documents.insert(id, doc);
        self.events.publish(SessionEvent::DocumentShared {
            session: self.id,
            document: id,
            name: name.clone(),
            kind,
        });
        log::info!("Document {name} ({kind}) shared in session {} by {by}", self.id);
        Ok(snapshot)
    }

    /// Apply an edit made on this replica.
    pub fn apply_operation(&mut self, by: Uuid, document: Uuid, edit: Edit) -> Result<Vec<Operation>, CollabError> {
        self.ensure_open()?;
        self.require(by, Permissions::WRITE)?;
        let doc = self
            .documents
            .get_mut(&document)
            .ok_or(CollabError::not_found("document", document))?;
        let applied = doc.apply_local(by, edit)?;
        let version = doc.version();
        self.known_clocks
            .entry((by, document))
            .or_default()
            .merge(doc.clock());
        let mut ops = Vec::with_capacity(applied.len());
        for a in applied {
            if let Some(edit) = TextEdit::from_applied(&a) {
                self.presence.shift(document, &edit);
            }
            self.events.publish(SessionEvent::OperationApplied {
                session: self.id,
                document,
                op: a.op.clone(),
                version,
            });
            ops.push(a.op);
        }
        Ok(ops)
    }

    /// Accept an operation generated on `from`'s replica.
    pub fn receive_operation(&mut self, from: Uuid, document: Uuid, op: Operation) -> Result<AppliedResult, CollabError> {
        self.ensure_open()?;
        self.require(from, Permissions::WRITE)?;
        if self.site_owners.get(&op.site()) != Some(&from) {
            log::warn!("Operation {} from {from} claims foreign site {}", op.id, op.site());
            return Err(CollabError::Protocol(format!(
                "operation {} does not belong to {from}",
                op.id
            )));
        }
        let doc = self
            .documents
            .get_mut(&document)
            .ok_or(CollabError::not_found("document", document))?;
        let clock = op.clock.clone();
        let result = match doc.apply_remote(Some(from), op) {
            Ok(result) => result,
            Err(e) => {
                log::warn!("Dropping operation from {from} on {document}: {e}");
                return Err(e);
            }
        };
        self.known_clocks
            .entry((from, document))
            .or_default()
            .merge(&clock);

        if let AppliedResult::Applied(applied) = &result {
            let version = doc.version();
            for a in applied {
                if let Some(edit) = TextEdit::from_applied(a) {
                    self.presence.shift(document, &edit);
                }
                self.events.publish(SessionEvent::OperationReceived {
                    session: self.id,
                    document,
                    op: a.op.clone(),
                    version,
                });
            }
        }
        Ok(result)
    }

    // ─── presence ───

    /// Merge a partial presence update. `None` when it was stale.
    pub fn update_presence(&mut self, by: Uuid, update: PresenceUpdate) -> Result<Option<Presence>, CollabError> {
        self.require(by, Permissions::READ)?;
        let Some(merged) = self.presence.apply(by, &update) else {
            return Ok(None);
        };
        let mut merged = merged.clone();
        if update.clock.is_some() {
            if let Some(doc) = merged.document.and_then(|d| self.documents.get(&d)) {
                doc.rebase(&mut merged.caret);
            }
            self.presence.upsert(merged.clone());
        }
        self.events.publish(SessionEvent::PresenceChanged {
            session: self.id,
            presence: merged.clone(),
        });
        Ok(Some(merged))
    }

    /// Demote quiet participants to idle or away. Returns the records
    /// that changed.
    pub fn sweep_presence(&mut self, now: u64) -> Vec<Presence> {
        let changed = self.presence.sweep(now, IDLE_AFTER, AWAY_AFTER);
        let mut swept = Vec::with_capacity(changed.len());
        for id in changed {
            if let Some(presence) = self.presence.get(&id) {
                self.events.publish(SessionEvent::PresenceChanged {
                    session: self.id,
                    presence: presence.clone(),
                });
                swept.push(presence.clone());
            }
        }
        swept
    }

    // ─── comments ───

    /// Comment anchored in the current text of `document`.
    pub fn add_comment(
        &mut self,
        by: Uuid,
        document: Uuid,
        content: impl Into<String>,
        anchor: CommentAnchor,
    ) -> Result<Comment, CollabError> {
        self.ensure_open()?;
        self.require(by, Permissions::CHAT)?;
        let doc = self
            .documents
            .get_mut(&document)
            .ok_or(CollabError::not_found("document", document))?;
        let comment = doc.add_comment(by, content, anchor).clone();
        self.events.publish(SessionEvent::CommentAdded {
            session: self.id,
            document,
            comment: comment.clone(),
        });
        Ok(comment)
    }

    /// Store a comment created on `by`'s replica. Returns the stored
    /// (rebased) comment, or `None` for a duplicate.
    pub fn receive_comment(&mut self, by: Uuid, document: Uuid, mut comment: Comment) -> Result<Option<Comment>, CollabError> {
        self.ensure_open()?;
        self.require(by, Permissions::CHAT)?;
        comment.author = by;
        let doc = self
            .documents
            .get_mut(&document)
            .ok_or(CollabError::not_found("document", document))?;
        let id = comment.id;
        if !doc.insert_comment(comment) {
            return Ok(None);
        }
        let stored = doc.comment(&id).cloned();
        if let Some(comment) = &stored {
            self.events.publish(SessionEvent::CommentAdded {
                session: self.id,
                document,
                comment: comment.clone(),
            });
        }
        Ok(stored)
    }

    pub fn reply_comment(
        &mut self,
        by: Uuid,
        document: Uuid,
        comment: Uuid,
        content: impl Into<String>,
    ) -> Result<CommentReply, CollabError> {
        self.ensure_open()?;
        self.require(by, Permissions::CHAT)?;
        let doc = self
            .documents
            .get_mut(&document)
            .ok_or(CollabError::not_found("document", document))?;
        doc.reply(comment, by, content)
            .cloned()
            .ok_or(CollabError::not_found("comment", comment))
    }

    pub fn resolve_comment(&mut self, by: Uuid, document: Uuid, comment: Uuid) -> Result<Comment, CollabError> {
        self.ensure_open()?;
        self.require(by, Permissions::CHAT)?;
        let doc = self
            .documents
            .get_mut(&document)
            .ok_or(CollabError::not_found("document", document))?;
        let resolved = doc
            .resolve(comment, by)
            .cloned()
            .ok_or(CollabError::not_found("comment", comment))?;
        self.events.publish(SessionEvent::CommentResolved {
            session: self.id,
            document,
            comment,
            by,
        });
        Ok(resolved)
    }

    // ─── chat ───

    pub fn send_message(&mut self, by: Uuid, content: impl Into<String>, kind: MessageKind) -> Result<ChatMessage, CollabError> {
        self.ensure_open()?;
        self.require(by, Permissions::CHAT)?;
        if !self.settings.enable_chat {
            return Err(CollabError::Permission {
                participant: by,
                required: Permissions::CHAT,
            });
        }
        if kind == MessageKind::System {
            return Err(CollabError::Protocol("participants cannot send system messages".into()));
        }
        let message = self.chat.send(by, content, kind).clone();
        self.events.publish(SessionEvent::ChatMessage {
            session: self.id,
            message: message.clone(),
        });
        Ok(message)
    }

    pub fn add_reaction(&mut self, by: Uuid, message: Uuid, emoji: &str) -> Result<ChatMessage, CollabError> {
        self.require(by, Permissions::CHAT)?;
        self.chat
            .react(message, by, emoji)
            .cloned()
            .ok_or(CollabError::not_found("message", message))
    }

    pub fn remove_reaction(&mut self, by: Uuid, message: Uuid, emoji: &str) -> Result<ChatMessage, CollabError> {
        self.require(by, Permissions::CHAT)?;
        self.chat
            .unreact(message, by, emoji)
            .cloned()
            .ok_or(CollabError::not_found("message", message))
    }

    pub fn edit_message(&mut self, by: Uuid, message: Uuid, content: impl Into<String>) -> Result<ChatMessage, CollabError> {
        self.require(by, Permissions::CHAT)?;
        self.chat
            .edit(message, by, content)
            .cloned()
            .ok_or(CollabError::not_found("message", message))
    }

    pub fn chat_page(&self, by: Uuid, before: Option<Uuid>, limit: usize) -> Result<ChatPage, CollabError> {
        self.require(by, Permissions::READ)?;
        Ok(self.chat.page(before, limit))
    }

    // ─── locks ───

    pub fn acquire_lock(
        &mut self,
        by: Uuid,
        document: Uuid,
        range: Option<Range<usize>>,
        kind: LockKind,
    ) -> Result<LockDecision, CollabError> {
        let request = LockRequest::new(by, range, kind).with_ttl(self.settings.lock_ttl_ms);
        self.request_lock(by, document, request)
    }

    /// Arbitrate a lock request. The owner is always the caller.
    pub fn request_lock(&mut self, by: Uuid, document: Uuid, mut request: LockRequest) -> Result<LockDecision, CollabError> {
        self.ensure_open()?;
        self.require(by, Permissions::WRITE)?;
        request.owner = by;
        request.ttl_ms = request.ttl_ms.min(self.settings.lock_ttl_ms);
        let doc = self
            .documents
            .get_mut(&document)
            .ok_or(CollabError::not_found("document", document))?;
        let decision = doc.request_lock(request, tandem_core::now_millis());
        let event = match &decision {
            LockDecision::Granted(lock) => {
                log::info!("Lock {} granted to {by} on {document}", lock.id);
                SessionEvent::LockGranted {
                    session: self.id,
                    document,
                    lock: lock.clone(),
                }
            }
            LockDecision::Denied { request, holder, .. } => {
                log::debug!("Lock denied to {by} on {document}: held by {holder}");
                SessionEvent::LockDenied {
                    session: self.id,
                    document,
                    request: request.clone(),
                    holder: *holder,
                }
            }
        };
        self.events.publish(event);
        Ok(decision)
    }

    pub fn release_lock(&mut self, by: Uuid, document: Uuid, lock: Uuid) -> Result<Lock, CollabError> {
        let doc = self
            .documents
            .get_mut(&document)
            .ok_or(CollabError::not_found("document", document))?;
        let released = doc.release_lock(lock, by)?;
        self.events.publish(SessionEvent::LockReleased {
            session: self.id,
            document,
            lock: released.clone(),
            reason: ReleaseReason::Explicit,
        });
        Ok(released)
    }

    /// Drop every lock past its expiry.
    pub fn expire_locks(&mut self, now: u64) -> Vec<(Uuid, Lock)> {
        let mut expired = Vec::new();
        for (doc_id, doc) in self.documents.iter_mut() {
            for lock in doc.expire_locks(now) {
                log::info!("Lock {} on {doc_id} expired", lock.id);
                self.events.publish(SessionEvent::LockReleased {
                    session: self.id,
                    document: *doc_id,
                    lock: lock.clone(),
                    reason: ReleaseReason::Expired,
                });
                expired.push((*doc_id, lock));
            }
        }
        expired
    }

    // ─── sync & maintenance ───

    pub fn sync_payload(&self, for_participant: Uuid) -> Result<SyncPayload, CollabError> {
        let me = self
            .participants
            .get(&for_participant)
            .cloned()
            .ok_or(CollabError::not_found("participant", for_participant))?;
        Ok(SyncPayload {
            session: self.info(),
            me,
            participants: self.participants.values().cloned().collect(),
            documents: self.snapshots(),
            presence: self.presence.iter().cloned().collect(),
            chat: self.chat.page(None, DEFAULT_PAGE_SIZE),
        })
    }

    pub fn snapshots(&self) -> Vec<DocumentSnapshot> {
        self.documents.values().map(SharedDocument::snapshot).collect()
    }

    /// Record how far a participant's replica has got. Clocks are capped
    /// at what this replica holds.
    pub fn report_frontier(&mut self, by: Uuid, frontier: Vec<(Uuid, VectorClock)>) -> Result<(), CollabError> {
        if !self.participants.contains_key(&by) {
            return Err(CollabError::not_found("participant", by));
        }
        for (doc_id, clock) in frontier {
            let Some(doc) = self.documents.get(&doc_id) else {
                log::debug!("Frontier for unknown document {doc_id} from {by}");
                continue;
            };
            self.known_clocks
                .entry((by, doc_id))
                .or_default()
                .merge(&clock.meet(doc.clock()));
        }
        Ok(())
    }

    /// Per document, the point every known replica has seen.
    pub fn safe_points(&self) -> Vec<(Uuid, VectorClock)> {
        self.documents
            .iter()
            .map(|(doc_id, doc)| {
                let clocks = self
                    .known_clocks
                    .iter()
                    .filter(|((_, d), _)| d == doc_id)
                    .map(|(_, clock)| clock)
                    .chain(std::iter::once(doc.clock()));
                (*doc_id, safe_point(clocks))
            })
            .collect()
    }

    /// Compact every document below what all participants are known to
    /// have seen. Returns the safe points used and the number of
    /// tombstones dropped.
    pub fn compact(&mut self) -> (Vec<(Uuid, VectorClock)>, usize) {
        let points = self.safe_points();
        let mut dropped = 0;
        for (doc_id, safe) in &points {
            if let Some(doc) = self.documents.get_mut(doc_id) {
                dropped += doc.compact(safe);
            }
        }
        (points, dropped)
    }
}

// ───────────────────────────────────────────────────────────────────
// SessionManager
// ───────────────────────────────────────────────────────────────────

/// All sessions hosted by one replica.
pub struct SessionManager {
    site: SiteId,
    sessions: RwLock<HashMap<Uuid, Arc<Mutex<Session>>>>,
    events: EventBus,
}

impl SessionManager {
    pub fn new(site: SiteId) -> Self {
        Self::with_events(site, EventBus::default())
    }

    pub fn with_events(site: SiteId, events: EventBus) -> Self {
        Self {
            site,
            sessions: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn site(&self) -> SiteId {
        self.site
    }

    pub fn subscribe(&self) -> Subscription {
        self.events.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub async fn session(&self, id: Uuid) -> Result<Arc<Mutex<Session>>, CollabError> {
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(CollabError::not_found("session", id))
    }

    pub async fn session_ids(&self) -> Vec<Uuid> {
        self.sessions.read().await.keys().copied().collect()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Run `f` with the session locked.
    pub async fn with_session<R>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut Session) -> Result<R, CollabError>,
    ) -> Result<R, CollabError> {
        let session = self.session(id).await?;
        let mut guard = session.lock().await;
        f(&mut guard)
    }

    pub async fn create_session(
        &self,
        name: impl Into<String>,
        owner: JoinRequest,
        settings: SessionSettings,
    ) -> Result<SyncPayload, CollabError> {
        let owner_id = owner.participant.unwrap_or_else(Uuid::new_v4);
        let owner = JoinRequest {
            participant: Some(owner_id),
            ..owner
        };
        let session = Session::create(name, owner, settings, self.site, self.events.clone());
        let payload = session.sync_payload(owner_id)?;
        self.sessions
            .write()
            .await
            .insert(session.id(), Arc::new(Mutex::new(session)));
        Ok(payload)
    }

    pub async fn join_session(&self, id: Uuid, request: JoinRequest) -> Result<SyncPayload, CollabError> {
        self.with_session(id, |s| s.join(request)).await
    }

    pub async fn leave_session(&self, id: Uuid, participant: Uuid, reason: LeaveReason) -> Result<LeaveOutcome, CollabError> {
        let outcome = self.with_session(id, |s| s.leave(participant, reason)).await?;
        if outcome.closed {
            self.sessions.write().await.remove(&id);
        }
        Ok(outcome)
    }

    pub async fn end_session(&self, id: Uuid, by: Uuid) -> Result<Vec<DocumentSnapshot>, CollabError> {
        let snapshots = self.with_session(id, |s| s.end(by)).await?;
        self.sessions.write().await.remove(&id);
        Ok(snapshots)
    }

    pub async fn kick(&self, id: Uuid, by: Uuid, target: Uuid) -> Result<LeaveOutcome, CollabError> {
        self.with_session(id, |s| s.kick(by, target)).await
    }

    pub async fn change_role(&self, id: Uuid, by: Uuid, target: Uuid, role: Role) -> Result<Participant, CollabError> {
        self.with_session(id, |s| s.change_role(by, target, role)).await
    }

    pub async fn share_document(
        &self,
        id: Uuid,
        by: Uuid,
        name: impl Into<String>,
        kind: DocumentKind,
        content: Option<&str>,
    ) -> Result<DocumentSnapshot, CollabError> {
        let name = name.into();
        self.with_session(id, |s| s.share_document(by, name, kind, content)).await
    }

    pub async fn apply_operation(&self, id: Uuid, by: Uuid, document: Uuid, edit: Edit) -> Result<Vec<Operation>, CollabError> {
        self.with_session(id, |s| s.apply_operation(by, document, edit)).await
    }

    pub async fn receive_operation(&self, id: Uuid, from: Uuid, document: Uuid, op: Operation) -> Result<AppliedResult, CollabError> {
        self.with_session(id, |s| s.receive_operation(from, document, op)).await
    }

    pub async fn update_presence(&self, id: Uuid, by: Uuid, update: PresenceUpdate) -> Result<Option<Presence>, CollabError> {
        self.with_session(id, |s| s.update_presence(by, update)).await
    }

    pub async fn send_message(&self, id: Uuid, by: Uuid, content: impl Into<String>, kind: MessageKind) -> Result<ChatMessage, CollabError> {
        let content = content.into();
        self.with_session(id, |s| s.send_message(by, content, kind)).await
    }

    pub async fn add_comment(
        &self,
        id: Uuid,
        by: Uuid,
        document: Uuid,
        content: impl Into<String>,
        anchor: CommentAnchor,
    ) -> Result<Comment, CollabError> {
        let content = content.into();
        self.with_session(id, |s| s.add_comment(by, document, content, anchor)).await
    }

    pub async fn acquire_lock(
        &self,
        id: Uuid,
        by: Uuid,
        document: Uuid,
        range: Option<Range<usize>>,
        kind: LockKind,
    ) -> Result<LockDecision, CollabError> {
        self.with_session(id, |s| s.acquire_lock(by, document, range, kind)).await
    }

    pub async fn release_lock(&self, id: Uuid, by: Uuid, document: Uuid, lock: Uuid) -> Result<Lock, CollabError> {
        self.with_session(id, |s| s.release_lock(by, document, lock)).await
    }

    /// Sweep expired locks in every session.
    pub async fn expire_locks(&self, now: u64) -> Vec<(Uuid, Uuid, Lock)> {
        let sessions: Vec<_> = self.sessions.read().await.values().cloned().collect();
        let mut expired = Vec::new();
        for session in sessions {
            let mut guard = session.lock().await;
            let id = guard.id();
            expired.extend(guard.expire_locks(now).into_iter().map(|(doc, lock)| (id, doc, lock)));
        }
        expired
    }

    /// Presence sweep across every session, by session.
    pub async fn sweep_presence(&self, now: u64) -> Vec<(Uuid, Presence)> {
        let sessions: Vec<_> = self.sessions.read().await.values().cloned().collect();
        let mut swept = Vec::new();
        for session in sessions {
            let mut guard = session.lock().await;
            let id = guard.id();
            swept.extend(guard.sweep_presence(now).into_iter().map(|p| (id, p)));
        }
        swept
    }

    /// Compact every session. Returns each session's safe points and the
    /// total number of tombstones dropped.
    pub async fn compact(&self) -> (Vec<(Uuid, Vec<(Uuid, VectorClock)>)>, usize) {
        let sessions: Vec<_> = self.sessions.read().await.values().cloned().collect();
        let mut points = Vec::with_capacity(sessions.len());
        let mut dropped = 0;
        for session in sessions {
            let mut guard = session.lock().await;
            let (safe, n) = guard.compact();
            points.push((guard.id(), safe));
            dropped += n;
        }
        (points, dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::TextStore;

    fn site(n: u128) -> SiteId {
        SiteId::from_u128(n)
    }

    fn new_session(settings: SessionSettings) -> (Session, Uuid, Subscription) {
        let bus = EventBus::new(256);
        let sub = bus.subscribe();
        let owner = Uuid::from_u128(1);
        let session = Session::create("review", JoinRequest::new(owner, "Olive", site(1)), settings, site(100), bus);
        (session, owner, sub)
    }

    fn shared(session: &mut Session, owner: Uuid, content: &str) -> Uuid {
        session
            .share_document(owner, "draft.md", DocumentKind::Text, Some(content))
            .unwrap()
            .id
    }

    #[test]
    fn test_create_emits_events() {
        let (session, owner, mut sub) = new_session(SessionSettings::default());
        assert_eq!(session.owner(), owner);
        assert!(matches!(sub.try_recv(), Some(SessionEvent::SessionCreated { .. })));
        assert!(matches!(sub.try_recv(), Some(SessionEvent::ParticipantJoined { .. })));
    }

    #[test]
    fn test_join_returns_full_state() {
        let (mut session, owner, _sub) = new_session(SessionSettings::default());
        let doc = shared(&mut session, owner, "hello");
        session.send_message(owner, "welcome", MessageKind::Text).unwrap();

        let payload = session.join(JoinRequest::new(Uuid::from_u128(2), "Bob", site(2))).unwrap();
        assert_eq!(payload.me.role, Role::Editor);
        assert_eq!(payload.participants.len(), 2);
        assert_eq!(payload.documents.len(), 1);
        assert_eq!(payload.documents[0].id, doc);
        assert_eq!(payload.documents[0].render(), "hello");
        assert_eq!(payload.chat.messages.len(), 1);
        assert_eq!(payload.presence.len(), 2);
    }

    #[test]
    fn test_capacity_refused() {
        let settings = SessionSettings { max_participants: 2, ..Default::default() };
        let (mut session, _, _sub) = new_session(settings);
        session.join(JoinRequest::new(Uuid::from_u128(2), "Bob", site(2))).unwrap();
        let err = session
            .join(JoinRequest::new(Uuid::from_u128(3), "Carol", site(3)))
            .unwrap_err();
        assert!(matches!(err, CollabError::Capacity { max: 2, .. }));

        // A participant already present may reconnect.
        assert!(session.join(JoinRequest::new(Uuid::from_u128(2), "Bob", site(4))).is_ok());
    }

    #[test]
    fn test_password_required() {
        let settings = SessionSettings {
            password: Some("hunter2".into()),
            ..Default::default()
        };
        let (mut session, _, _sub) = new_session(settings);
        let bob = JoinRequest::new(Uuid::from_u128(2), "Bob", site(2));
        assert!(matches!(
            session.join(bob.clone()),
            Err(CollabError::Authentication(_))
        ));
        assert!(matches!(
            session.join(bob.clone().with_credential("nope")),
            Err(CollabError::Authentication(_))
        ));
        assert!(session.join(bob.with_credential("hunter2")).is_ok());
    }

    #[test]
    fn test_anonymous_joins_as_guest() {
        let (mut session, _, _sub) = new_session(SessionSettings::default());
        let payload = session.join(JoinRequest::anonymous("lurker", site(5))).unwrap();
        assert_eq!(payload.me.role, Role::Guest);

        let closed = SessionSettings { allow_anonymous: false, ..Default::default() };
        let (mut session, _, _sub) = new_session(closed);
        assert!(session.join(JoinRequest::anonymous("lurker", site(5))).is_err());
    }

    #[test]
    fn test_viewer_cannot_write() {
        let settings = SessionSettings { default_role: Role::Viewer, ..Default::default() };
        let (mut session, owner, _sub) = new_session(settings);
        let doc = shared(&mut session, owner, "read only");
        let viewer = Uuid::from_u128(2);
        session.join(JoinRequest::new(viewer, "Vic", site(2))).unwrap();

        let err = session.apply_operation(viewer, doc, Edit::insert(0, "x")).unwrap_err();
        assert!(matches!(err, CollabError::Permission { required, .. } if required == Permissions::WRITE));
        assert!(session.send_message(viewer, "can I edit?", MessageKind::Text).is_ok());
        assert_eq!(session.document(&doc).unwrap().render(), "read only");
    }

    #[test]
    fn test_only_sharers_share() {
        let (mut session, _, _sub) = new_session(SessionSettings::default());
        let editor = Uuid::from_u128(2);
        session.join(JoinRequest::new(editor, "Ed", site(2))).unwrap();
        assert!(matches!(
            session.share_document(editor, "x", DocumentKind::Text, None),
            Err(CollabError::Permission { .. })
        ));
    }

    #[test]
    fn test_receive_operation_checks_site() {
        let (mut session, owner, _sub) = new_session(SessionSettings::default());
        let doc = shared(&mut session, owner, "abc");
        let bob = Uuid::from_u128(2);
        session.join(JoinRequest::new(bob, "Bob", site(2))).unwrap();

        let mut forged = TextStore::with_content(site(3), "abc");
        let op = forged.insert_at(0, "!").unwrap().remove(0).op;
        assert!(matches!(
            session.receive_operation(bob, doc, op),
            Err(CollabError::Protocol(_))
        ));

        let mut replica = TextStore::with_content(site(2), "abc");
        let op = replica.insert_at(3, "d").unwrap().remove(0).op;
        let result = session.receive_operation(bob, doc, op.clone()).unwrap();
        assert!(matches!(result, AppliedResult::Applied(_)));
        assert_eq!(
            session.receive_operation(bob, doc, op).unwrap(),
            AppliedResult::AlreadyApplied
        );
        assert_eq!(session.document(&doc).unwrap().render(), "abcd");
        assert_eq!(session.document(&doc).unwrap().version(), 1);
    }

    #[test]
    fn test_operations_from_earlier_site_accepted_after_rejoin() {
        let (mut session, owner, _sub) = new_session(SessionSettings::default());
        let doc = shared(&mut session, owner, "abc");
        let bob = Uuid::from_u128(2);
        session.join(JoinRequest::new(bob, "Bob", site(2))).unwrap();
        let mut replica = SharedDocument::from_snapshot(site(2), session.document(&doc).unwrap().snapshot());
        let queued = replica.apply_local(bob, Edit::insert(3, "d")).unwrap().remove(0).op;
        session.leave(bob, LeaveReason::Disconnected).unwrap();

        // Bob comes back as a new site with an operation still queued.
        session.join(JoinRequest::new(bob, "Bob", site(6))).unwrap();
        session.receive_operation(bob, doc, queued).unwrap();
        assert_eq!(session.document(&doc).unwrap().render(), "abcd");

        // Nobody else may take over one of Bob's sites.
        let err = session.join(JoinRequest::new(Uuid::from_u128(3), "Eve", site(2))).unwrap_err();
        assert!(matches!(err, CollabError::Protocol(_)));
    }

    #[test]
    fn test_concurrent_hard_locks_one_wins() {
        let (mut session, owner, mut sub) = new_session(SessionSettings::default());
        let doc = shared(&mut session, owner, "0123456789");
        let bob = Uuid::from_u128(2);
        session.join(JoinRequest::new(bob, "Bob", site(2))).unwrap();
        sub.drain();

        let a = session.acquire_lock(owner, doc, Some(0..5), LockKind::Hard).unwrap();
        let b = session.acquire_lock(bob, doc, Some(3..8), LockKind::Hard).unwrap();
        assert!(a.is_granted());
        assert!(!b.is_granted());

        let events = sub.drain();
        assert!(matches!(events[0], SessionEvent::LockGranted { .. }));
        assert!(matches!(events[1], SessionEvent::LockDenied { holder, .. } if holder == owner));
    }

    #[test]
    fn test_leave_releases_locks() {
        let (mut session, owner, _sub) = new_session(SessionSettings::default());
        let doc = shared(&mut session, owner, "0123456789");
        let bob = Uuid::from_u128(2);
        session.join(JoinRequest::new(bob, "Bob", site(2))).unwrap();
        assert!(session.acquire_lock(bob, doc, Some(0..5), LockKind::Hard).unwrap().is_granted());

        let outcome = session.leave(bob, LeaveReason::Disconnected).unwrap();
        assert_eq!(outcome.released.len(), 1);
        assert!(!outcome.empty);
        assert!(session.acquire_lock(owner, doc, Some(0..5), LockKind::Hard).unwrap().is_granted());
    }

    #[test]
    fn test_non_persistent_session_closes_when_empty() {
        let settings = SessionSettings { persistent: false, ..Default::default() };
        let (mut session, owner, _sub) = new_session(settings);
        shared(&mut session, owner, "bye");
        let outcome = session.leave(owner, LeaveReason::Left).unwrap();
        assert!(outcome.empty);
        assert!(outcome.closed);
        assert_eq!(outcome.snapshots.len(), 1);
        assert!(session.is_ended());
    }

    #[test]
    fn test_only_owner_ends() {
        let (mut session, owner, mut sub) = new_session(SessionSettings::default());
        let admin = Uuid::from_u128(2);
        session.join(JoinRequest::new(admin, "Ada", site(2))).unwrap();
        session.change_role(owner, admin, Role::Admin).unwrap();
        assert!(matches!(session.end(admin), Err(CollabError::Permission { .. })));

        sub.drain();
        session.end(owner).unwrap();
        assert!(session.is_ended());
        assert!(matches!(sub.try_recv(), Some(SessionEvent::SessionEnded { .. })));
        assert!(session.join(JoinRequest::new(Uuid::from_u128(3), "Late", site(3))).is_err());
    }

    #[test]
    fn test_kick_and_role_change() {
        let (mut session, owner, mut sub) = new_session(SessionSettings::default());
        let bob = Uuid::from_u128(2);
        let eve = Uuid::from_u128(3);
        session.join(JoinRequest::new(bob, "Bob", site(2))).unwrap();
        session.join(JoinRequest::new(eve, "Eve", site(3))).unwrap();

        assert!(matches!(session.kick(bob, eve), Err(CollabError::Permission { .. })));
        let promoted = session.change_role(owner, bob, Role::Admin).unwrap();
        assert!(promoted.can(Permissions::SHARE));

        assert!(session.kick(bob, owner).is_err());
        assert!(session.change_role(bob, eve, Role::Owner).is_err());

        sub.drain();
        session.kick(bob, eve).unwrap();
        assert!(session.participant(&eve).is_none());
        assert!(sub
            .drain()
            .iter()
            .any(|e| matches!(e, SessionEvent::ParticipantKicked { participant, .. } if *participant == eve)));

        // Returning participants keep their role.
        session.leave(bob, LeaveReason::Left).unwrap();
        let back = session.join(JoinRequest::new(bob, "Bob", site(2))).unwrap();
        assert_eq!(back.me.role, Role::Admin);
    }

    #[test]
    fn test_presence_rebased_over_concurrent_edit() {
        let (mut session, owner, _sub) = new_session(SessionSettings::default());
        let doc = shared(&mut session, owner, "abcdef");
        let bob = Uuid::from_u128(2);
        session.join(JoinRequest::new(bob, "Bob", site(2))).unwrap();

        // Owner types at the start on the server replica.
        session.apply_operation(owner, doc, Edit::insert(0, "XY")).unwrap();

        // Bob reports a cursor taken before he saw that insert.
        let mut update = PresenceUpdate::cursor(doc, 3, VectorClock::new());
        update.seq = 1;
        let merged = session.update_presence(bob, update).unwrap().unwrap();
        assert_eq!(merged.cursor(), Some(5));
    }

    #[test]
    fn test_local_edit_shifts_known_cursors() {
        let (mut session, owner, _sub) = new_session(SessionSettings::default());
        let doc = shared(&mut session, owner, "abcdef");
        let bob = Uuid::from_u128(2);
        session.join(JoinRequest::new(bob, "Bob", site(2))).unwrap();
        let clock = session.document(&doc).unwrap().clock().clone();
        let mut update = PresenceUpdate::cursor(doc, 4, clock);
        update.seq = 1;
        session.update_presence(bob, update).unwrap();

        session.apply_operation(owner, doc, Edit::delete(0..2)).unwrap();
        assert_eq!(session.presence().get(&bob).unwrap().cursor(), Some(2));
    }

    #[test]
    fn test_quiet_participants_go_idle() {
        let (mut session, owner, _sub) = new_session(SessionSettings::default());
        let later = tandem_core::now_millis() + IDLE_AFTER.as_millis() as u64 + 1;
        let swept = session.sweep_presence(later);
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].participant, owner);
        assert_eq!(swept[0].status, crate::presence::PresenceStatus::Idle);
        assert!(session.sweep_presence(later).is_empty());
    }

    #[test]
    fn test_chat_disabled() {
        let settings = SessionSettings { enable_chat: false, ..Default::default() };
        let (mut session, owner, _sub) = new_session(settings);
        assert!(session.send_message(owner, "hi", MessageKind::Text).is_err());
    }

    #[test]
    fn test_reactions_and_history() {
        let (mut session, owner, _sub) = new_session(SessionSettings::default());
        let first = session.send_message(owner, "one", MessageKind::Text).unwrap();
        session.send_message(owner, "two", MessageKind::Code).unwrap();
        let reacted = session.add_reaction(owner, first.id, "🎉").unwrap();
        assert_eq!(reacted.reaction_count("🎉"), 1);
        let page = session.chat_page(owner, None, 1).unwrap();
        assert!(page.has_more);
        assert_eq!(page.messages[0].content, "two");
    }

    #[test]
    fn test_comment_lifecycle() {
        let (mut session, owner, mut sub) = new_session(SessionSettings::default());
        let doc = shared(&mut session, owner, "some text");
        sub.drain();

        let comment = session.add_comment(owner, doc, "reword", CommentAnchor::spanning(0..4)).unwrap();
        session.reply_comment(owner, doc, comment.id, "ok").unwrap();
        let resolved = session.resolve_comment(owner, doc, comment.id).unwrap();
        assert!(resolved.resolved);
        assert_eq!(resolved.replies.len(), 1);

        let events = sub.drain();
        assert!(matches!(events[0], SessionEvent::CommentAdded { .. }));
        assert!(matches!(events[1], SessionEvent::CommentResolved { .. }));
    }

    #[test]
    fn test_expired_locks_swept() {
        let settings = SessionSettings { lock_ttl_ms: 10, ..Default::default() };
        let (mut session, owner, _sub) = new_session(settings);
        let doc = shared(&mut session, owner, "abc");
        session.acquire_lock(owner, doc, Some(0..1), LockKind::Hard).unwrap();
        let expired = session.expire_locks(tandem_core::now_millis() + 1_000);
        assert_eq!(expired.len(), 1);
        assert!(session.document(&doc).unwrap().locks().is_empty());
    }

    #[test]
    fn test_compaction_waits_for_every_participant() {
        let (mut session, owner, _sub) = new_session(SessionSettings::default());
        let doc = shared(&mut session, owner, "abcdef");
        let bob = Uuid::from_u128(2);
        session.join(JoinRequest::new(bob, "Bob", site(2))).unwrap();

        session.apply_operation(owner, doc, Edit::delete(3..6)).unwrap();
        // Bob has not been heard from since the delete.
        assert_eq!(session.compact().1, 0);

        // Bob sends an edit that has seen the delete.
        let mut replica = SharedDocument::from_snapshot(site(2), session.document(&doc).unwrap().snapshot());
        let op = replica.apply_local(bob, Edit::insert(0, ">")).unwrap().remove(0).op;
        session.receive_operation(bob, doc, op).unwrap();
        assert_eq!(session.compact().1, 3);
        assert_eq!(session.document(&doc).unwrap().render(), ">abc");
    }

    #[test]
    fn test_rejoin_keeps_compaction_behind_offline_edits() {
        let (mut session, owner, _sub) = new_session(SessionSettings::default());
        let doc = shared(&mut session, owner, "ab");
        let bob = Uuid::from_u128(2);
        session.join(JoinRequest::new(bob, "Bob", site(2))).unwrap();
        let mut replica = SharedDocument::from_snapshot(site(2), session.document(&doc).unwrap().snapshot());
        session.leave(bob, LeaveReason::Disconnected).unwrap();

        // Offline, Bob types after the 'b' the owner is about to delete.
        let op = replica.apply_local(bob, Edit::insert(2, "!")).unwrap().remove(0).op;
        session.apply_operation(owner, doc, Edit::delete(1..2)).unwrap();

        session.join(JoinRequest::new(bob, "Bob", site(2))).unwrap();
        assert_eq!(session.compact().1, 0);
        session.receive_operation(bob, doc, op).unwrap();
        assert_eq!(session.document(&doc).unwrap().render(), "a!");

        // Once Bob reports having seen everything, tombstones can go.
        session.apply_operation(owner, doc, Edit::delete(1..2)).unwrap();
        assert_eq!(session.compact().1, 0);
        replica.merge_snapshot(&session.document(&doc).unwrap().snapshot());
        session.report_frontier(bob, vec![(doc, replica.clock().clone())]).unwrap();
        assert!(session.compact().1 > 0);
        assert_eq!(session.document(&doc).unwrap().render(), "a");
    }

    #[test]
    fn test_frontier_capped_at_local_clock() {
        let (mut session, owner, _sub) = new_session(SessionSettings::default());
        let doc = shared(&mut session, owner, "abc");
        let mut ahead = session.document(&doc).unwrap().clock().clone();
        ahead.tick(site(9));
        session.report_frontier(owner, vec![(doc, ahead), (Uuid::new_v4(), VectorClock::new())]).unwrap();

        let points = session.safe_points();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].1.get(&site(9)), 0);
        assert!(session.report_frontier(Uuid::new_v4(), Vec::new()).is_err());
    }

    #[tokio::test]
    async fn test_manager_lifecycle() {
        let manager = SessionManager::new(site(100));
        let mut events = manager.subscribe();
        let owner = Uuid::from_u128(1);
        let settings = SessionSettings { persistent: false, ..Default::default() };
        let payload = manager
            .create_session("pairing", JoinRequest::new(owner, "Olive", site(1)), settings)
            .await
            .unwrap();
        let id = payload.session.id;
        assert_eq!(manager.session_count().await, 1);

        let doc = manager
            .share_document(id, owner, "main.rs", DocumentKind::Code, Some("fn main() {}"))
            .await
            .unwrap();
        manager
            .apply_operation(id, owner, doc.id, Edit::insert(12, "\n"))
            .await
            .unwrap();

        let outcome = manager.leave_session(id, owner, LeaveReason::Left).await.unwrap();
        assert!(outcome.closed);
        assert_eq!(outcome.snapshots[0].render(), "fn main() {}\n");
        assert_eq!(manager.session_count().await, 0);
        assert!(manager.join_session(id, JoinRequest::anonymous("x", site(9))).await.is_err());

        let seen: Vec<_> = events.drain();
        assert!(seen.iter().any(|e| matches!(e, SessionEvent::SessionEnded { .. })));
    }
}
