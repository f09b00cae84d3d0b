//! Shared documents: CRDT text, causal history, locks and comments.
//!
//! A [`SharedDocument`] is the per-document unit of state a session owns.
//! It is single-writer; readers that must not block mutation take a
//! [`SharedDocument::text_view`] receiver, which always holds the latest
//! rendered text.
//!
//! Positional metadata (lock ranges, comment anchors, carets) is kept in
//! rendered offsets and rebased over every visible change. Markers that
//! arrive from other replicas are first rebased over the recent edits
//! their clock has not seen.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use tandem_core::{
    transform, AppliedOp, AppliedResult, Lock, LockDecision, LockKind, LockManager, LockRequest,
    OperationLog, Operation, Positioned, Shift, SiteId, TextEdit, TextSnapshot, TextStore,
    VectorClock,
};
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::CollabError;

/// How many applied edits are kept for rebasing late markers.
const RECENT_EDITS: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DocumentKind {
    Text,
    Code,
    Json,
    Binary,
    Canvas,
    Timeline,
    #[serde(rename = "3d-scene")]
    Scene3d,
}

impl DocumentKind {
    /// Only text and code documents carry CRDT text.
    pub fn has_text(self) -> bool {
        matches!(self, DocumentKind::Text | DocumentKind::Code)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DocumentKind::Text => "text",
            DocumentKind::Code => "code",
            DocumentKind::Json => "json",
            DocumentKind::Binary => "binary",
            DocumentKind::Canvas => "canvas",
            DocumentKind::Timeline => "timeline",
            DocumentKind::Scene3d => "3d-scene",
        }
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A local edit in rendered-text offsets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Edit {
    Insert { index: usize, text: String },
    Delete { range: Range<usize> },
    Format { range: Range<usize>, attributes: BTreeMap<String, String> },
}

impl Edit {
    pub fn insert(index: usize, text: impl Into<String>) -> Self {
        Edit::Insert { index, text: text.into() }
    }

    pub fn delete(range: Range<usize>) -> Self {
        Edit::Delete { range }
    }

    pub fn format(range: Range<usize>, key: impl Into<String>, value: impl Into<String>) -> Self {
        Edit::Format {
            range,
            attributes: BTreeMap::from([(key.into(), value.into())]),
        }
    }

    /// Offsets the edit touches. Inserts touch the empty range at `index`.
    pub fn range(&self) -> Range<usize> {
        match self {
            Edit::Insert { index, .. } => *index..*index,
            Edit::Delete { range } | Edit::Format { range, .. } => range.clone(),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Comments
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentAnchor {
    pub position: usize,
    pub range: Option<Range<usize>>,
}

impl CommentAnchor {
    pub fn at(position: usize) -> Self {
        Self { position, range: None }
    }

    pub fn spanning(range: Range<usize>) -> Self {
        Self {
            position: range.start,
            range: Some(range),
        }
    }
}

impl Shift for CommentAnchor {
    fn shift(&mut self, edit: &TextEdit, edit_first: bool) {
        self.position.shift(edit, edit_first);
        self.range.shift(edit, edit_first);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentReply {
    pub id: Uuid,
    pub author: Uuid,
    pub content: String,
    pub created_at: u64,
}

/// A comment thread. Comments are not merged: concurrent additions
/// simply coexist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: Uuid,
    pub author: Uuid,
    pub content: String,
    pub created_at: u64,
    pub resolved: bool,
    pub resolved_by: Option<Uuid>,
    pub replies: Vec<CommentReply>,
    pub anchor: Positioned<CommentAnchor>,
}

impl Comment {
    pub fn new(
        author: Uuid,
        site: SiteId,
        clock: VectorClock,
        content: impl Into<String>,
        anchor: CommentAnchor,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            author,
            content: content.into(),
            created_at: tandem_core::now_millis(),
            resolved: false,
            resolved_by: None,
            replies: Vec::new(),
            anchor: Positioned::new(site, clock, anchor),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Snapshots
// ───────────────────────────────────────────────────────────────────

/// Full state of a document, as carried in sync responses and stored by
/// [`crate::storage::Persistence`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    pub id: Uuid,
    pub name: String,
    pub kind: DocumentKind,
    pub version: u64,
    pub text: TextSnapshot,
    pub locks: Vec<Lock>,
    pub comments: Vec<Comment>,
    pub editors: Vec<Uuid>,
    pub last_modified: u64,
}

impl DocumentSnapshot {
    /// bincode, then LZ4 with the uncompressed size prepended.
    pub fn encode(&self) -> Result<Vec<u8>, CollabError> {
        let raw = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| CollabError::Protocol(e.to_string()))?;
        Ok(lz4_flex::compress_prepend_size(&raw))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CollabError> {
        let raw = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| CollabError::Protocol(format!("snapshot decompression: {e}")))?;
        let (snapshot, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
            .map_err(|e| CollabError::Protocol(e.to_string()))?;
        Ok(snapshot)
    }

    pub fn render(&self) -> String {
        self.text.render()
    }
}

// ───────────────────────────────────────────────────────────────────
// SharedDocument
// ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct SharedDocument {
    id: Uuid,
    name: String,
    kind: DocumentKind,
    text: TextStore,
    /// Accepted operations, local and remote. Never decreases.
    version: u64,
    log: OperationLog,
    editors: BTreeSet<Uuid>,
    locks: LockManager,
    comments: Vec<Comment>,
    dirty: bool,
    last_modified: u64,
    recent: VecDeque<TextEdit>,
    view: watch::Sender<Arc<str>>,
}

impl SharedDocument {
    pub fn new(id: Uuid, name: impl Into<String>, kind: DocumentKind, site: SiteId) -> Self {
        Self::from_store(id, name.into(), kind, TextStore::new(site))
    }

    /// Document seeded with `content`. Seeded characters belong to
    /// [`SiteId::INITIAL`], so every replica seeded the same way agrees.
    pub fn with_content(
        id: Uuid,
        name: impl Into<String>,
        kind: DocumentKind,
        site: SiteId,
        content: &str,
    ) -> Self {
        let text = if kind.has_text() {
            TextStore::with_content(site, content)
        } else {
            if !content.is_empty() {
                log::debug!("Ignoring initial content for {kind} document {id}");
            }
            TextStore::new(site)
        };
        Self::from_store(id, name.into(), kind, text)
    }

    pub fn from_snapshot(site: SiteId, snapshot: DocumentSnapshot) -> Self {
        let mut doc = Self::from_store(
            snapshot.id,
            snapshot.name,
            snapshot.kind,
            TextStore::from_snapshot(site, snapshot.text),
        );
        doc.version = snapshot.version;
        doc.locks.restore(snapshot.locks);
        doc.comments = snapshot.comments;
        doc.editors = snapshot.editors.into_iter().collect();
        doc.last_modified = snapshot.last_modified;
        doc
    }

    fn from_store(id: Uuid, name: String, kind: DocumentKind, text: TextStore) -> Self {
        let (view, _) = watch::channel(Arc::from(text.render()));
        Self {
            id,
            name,
            kind,
            text,
            version: 0,
            log: OperationLog::new(),
            editors: BTreeSet::new(),
            locks: LockManager::new(),
            comments: Vec::new(),
            dirty: false,
            last_modified: tandem_core::now_millis(),
            recent: VecDeque::new(),
            view,
        }
    }

    // ─── accessors ───

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> DocumentKind {
        self.kind
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn clock(&self) -> &VectorClock {
        self.text.clock()
    }

    pub fn text(&self) -> &TextStore {
        &self.text
    }

    pub fn log(&self) -> &OperationLog {
        &self.log
    }

    pub fn editors(&self) -> impl Iterator<Item = &Uuid> {
        self.editors.iter()
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn comments(&self) -> &[Comment] {
        &self.comments
    }

    pub fn comment(&self, id: &Uuid) -> Option<&Comment> {
        self.comments.iter().find(|c| c.id == *id)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub fn last_modified(&self) -> u64 {
        self.last_modified
    }

    pub fn render(&self) -> String {
        self.text.render()
    }

    /// Latest rendered text, readable without touching the document.
    pub fn text_view(&self) -> watch::Receiver<Arc<str>> {
        self.view.subscribe()
    }

    // ─── edits ───

    /// Apply a local edit optimistically. Returns the accepted operations
    /// in the order they must be sent.
    pub fn apply_local(&mut self, author: Uuid, edit: Edit) -> Result<Vec<AppliedOp>, CollabError> {
        if !self.kind.has_text() {
            return Err(CollabError::NoText(self.id));
        }
        let range = edit.range();
        let now = tandem_core::now_millis();
        if let Some(lock) = self.locks.active().find(|lock| {
            lock.kind == LockKind::Hard
                && lock.owner != author
                && !lock.is_expired(now)
                && lock.overlaps(Some(&range))
        }) {
            return Err(CollabError::Locked {
                lock: lock.id,
                holder: lock.owner,
            });
        }

        let applied = match edit {
            Edit::Insert { index, text } => self.text.insert_at(index, &text)?,
            Edit::Delete { range } => self.text.delete_range(range)?,
            Edit::Format { range, attributes } => vec![self.text.format_range(range, attributes)?],
        };
        for op in &applied {
            self.accept(op);
        }
        self.touch(author);
        Ok(applied)
    }

    /// Apply an operation from another replica. Duplicates and operations
    /// still waiting on dependencies leave the version untouched.
    pub fn apply_remote(&mut self, author: Option<Uuid>, op: Operation) -> Result<AppliedResult, CollabError> {
        if !self.kind.has_text() {
            return Err(CollabError::NoText(self.id));
        }
        let result = self.text.apply_remote(op)?;
        if let AppliedResult::Applied(applied) = &result {
            for op in applied {
                self.accept(op);
            }
            match author {
                Some(author) => self.touch(author),
                None => self.refresh_view(),
            }
        }
        Ok(result)
    }

    /// Join a full state received from elsewhere. Returns parked operations
    /// that became applicable.
    pub fn merge_snapshot(&mut self, snapshot: &DocumentSnapshot) -> Vec<AppliedOp> {
        let released = self.text.merge_snapshot(&snapshot.text);
        for op in &released {
            self.accept(op);
        }
        self.version = self.version.max(snapshot.version);
        self.locks.restore(snapshot.locks.iter().cloned());
        for incoming in &snapshot.comments {
            match self.comments.iter_mut().find(|c| c.id == incoming.id) {
                Some(existing) => {
                    existing.resolved |= incoming.resolved;
                    if existing.resolved_by.is_none() {
                        existing.resolved_by = incoming.resolved_by;
                    }
                    for reply in &incoming.replies {
                        if !existing.replies.iter().any(|r| r.id == reply.id) {
                            existing.replies.push(reply.clone());
                        }
                    }
                    existing.anchor = incoming.anchor.clone();
                }
                None => self.comments.push(incoming.clone()),
            }
        }
        self.editors.extend(snapshot.editors.iter().copied());
        self.last_modified = self.last_modified.max(snapshot.last_modified);
        // Offsets recorded before the merge no longer line up.
        self.recent.clear();
        self.refresh_view();
        released
    }

    /// Replace this replica with `snapshot`, then replay `pending` local
    /// operations the snapshot does not contain yet, oldest first.
    ///
    /// Unlike [`merge_snapshot`](Self::merge_snapshot) this drops whatever
    /// the local replica holds beyond the snapshot and `pending`, so an
    /// operation the authority refused disappears here too. Text view
    /// subscribers stay attached. Returns the pending operations that no
    /// longer apply.
    pub fn reset(&mut self, site: SiteId, snapshot: DocumentSnapshot, pending: &[Operation]) -> Vec<Operation> {
        let previous = std::mem::replace(self, Self::from_snapshot(site, snapshot));
        self.view = previous.view;

        let mut lost = Vec::new();
        for op in pending {
            match self.text.apply_remote(op.clone()) {
                Ok(AppliedResult::Applied(applied)) => {
                    for a in &applied {
                        self.accept(a);
                    }
                }
                Ok(AppliedResult::AlreadyApplied) => {}
                Ok(AppliedResult::Deferred) => {
                    self.text.discard_deferred(&op.id);
                    lost.push(op.clone());
                }
                Err(e) => {
                    log::debug!("Dropping local operation {} on {}: {e}", op.id, self.id);
                    lost.push(op.clone());
                }
            }
        }
        self.dirty = previous.dirty;
        self.refresh_view();
        lost
    }

    pub fn snapshot(&self) -> DocumentSnapshot {
        DocumentSnapshot {
            id: self.id,
            name: self.name.clone(),
            kind: self.kind,
            version: self.version,
            text: self.text.snapshot(),
            locks: self.locks.active().cloned().collect(),
            comments: self.comments.clone(),
            editors: self.editors.iter().copied().collect(),
            last_modified: self.last_modified,
        }
    }

    fn accept(&mut self, applied: &AppliedOp) {
        self.log.append(applied.op.clone());
        self.version += 1;
        let Some(edit) = TextEdit::from_applied(applied) else {
            return;
        };
        self.locks.shift_ranges(&edit);
        for comment in &mut self.comments {
            transform(&mut comment.anchor, &edit);
        }
        if self.recent.len() == RECENT_EDITS {
            self.recent.pop_front();
        }
        self.recent.push_back(edit);
    }

    fn touch(&mut self, editor: Uuid) {
        self.editors.insert(editor);
        self.dirty = true;
        self.last_modified = tandem_core::now_millis();
        self.refresh_view();
    }

    fn refresh_view(&self) {
        self.view.send_replace(Arc::from(self.text.render()));
    }

    /// Rebase a marker taken at an older clock over the edits applied here
    /// since.
    pub fn rebase<T: Shift>(&self, marker: &mut Positioned<T>) {
        for edit in &self.recent {
            transform(marker, edit);
        }
    }

    // ─── comments ───

    /// Comment anchored at the current text.
    pub fn add_comment(&mut self, author: Uuid, content: impl Into<String>, anchor: CommentAnchor) -> &Comment {
        let comment = Comment::new(author, self.text.site(), self.clock().clone(), content, anchor);
        let index = self.comments.len();
        self.comments.push(comment);
        self.dirty = true;
        &self.comments[index]
    }

    /// Store a comment created on another replica. Duplicates are ignored.
    pub fn insert_comment(&mut self, mut comment: Comment) -> bool {
        if self.comment(&comment.id).is_some() {
            return false;
        }
        self.rebase(&mut comment.anchor);
        self.comments.push(comment);
        self.dirty = true;
        true
    }

    pub fn reply(&mut self, comment: Uuid, author: Uuid, content: impl Into<String>) -> Option<&CommentReply> {
        let thread = self.comments.iter_mut().find(|c| c.id == comment)?;
        thread.replies.push(CommentReply {
            id: Uuid::new_v4(),
            author,
            content: content.into(),
            created_at: tandem_core::now_millis(),
        });
        self.dirty = true;
        thread.replies.last()
    }

    /// Fold in the server's view of a comment. Replies and resolution are
    /// merged; a known comment keeps its local anchor.
    pub fn update_comment(&mut self, incoming: Comment) -> bool {
        let Some(existing) = self.comments.iter_mut().find(|c| c.id == incoming.id) else {
            return self.insert_comment(incoming);
        };
        let mut changed = false;
        if incoming.resolved && !existing.resolved {
            existing.resolved = true;
            existing.resolved_by = incoming.resolved_by;
            changed = true;
        }
        for reply in incoming.replies {
            if !existing.replies.iter().any(|r| r.id == reply.id) {
                existing.replies.push(reply);
                changed = true;
            }
        }
        self.dirty |= changed;
        changed
    }

    pub fn resolve(&mut self, comment: Uuid, by: Uuid) -> Option<&Comment> {
        let thread = self.comments.iter_mut().find(|c| c.id == comment)?;
        if !thread.resolved {
            thread.resolved = true;
            thread.resolved_by = Some(by);
            self.dirty = true;
        }
        Some(thread)
    }

    // ─── locks ───

    pub fn request_lock(&mut self, request: LockRequest, now: u64) -> LockDecision {
        self.locks.request(request, now)
    }

    pub fn release_lock(&mut self, lock: Uuid, by: Uuid) -> Result<Lock, CollabError> {
        Ok(self.locks.release(lock, by)?)
    }

    pub fn release_locks_of(&mut self, owner: Uuid) -> Vec<Lock> {
        self.locks.release_owner(owner)
    }

    pub fn expire_locks(&mut self, now: u64) -> Vec<Lock> {
        self.locks.expire(now)
    }

    /// Mirror a lock the server granted to someone.
    pub fn mirror_lock(&mut self, lock: Lock) {
        self.locks.insert(lock);
    }

    pub fn forget_lock(&mut self, lock: &Uuid) -> Option<Lock> {
        self.locks.remove(lock)
    }

    /// Replace all locks with the authoritative set.
    pub fn restore_locks(&mut self, locks: impl IntoIterator<Item = Lock>) {
        self.locks.restore(locks);
    }

    // ─── maintenance ───

    /// Drop tombstones and history every participant has seen.
    pub fn compact(&mut self, safe_point: &VectorClock) -> usize {
        let dropped = self.text.compact(safe_point);
        let truncated = self.log.truncate_covered(safe_point);
        if dropped > 0 || truncated > 0 {
            log::debug!(
                "Compacted document {}: {dropped} tombstones, {truncated} log entries",
                self.id
            );
        }
        dropped
    }
}
