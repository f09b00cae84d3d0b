//! Session chat channel: append-only messages with reactions.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Default page size for the backlog carried in a sync response.
pub const DEFAULT_PAGE_SIZE: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Text,
    Code,
    /// Generated by the session itself (joins, kicks, ...).
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    /// `Uuid::nil()` for system messages.
    pub author: Uuid,
    pub content: String,
    pub kind: MessageKind,
    /// Unix millis.
    pub sent_at: u64,
    pub edited: bool,
    /// Emoji → participants who reacted with it.
    pub reactions: BTreeMap<String, BTreeSet<Uuid>>,
}

impl ChatMessage {
    pub fn new(author: Uuid, content: impl Into<String>, kind: MessageKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            author,
            content: content.into(),
            kind,
            sent_at: tandem_core::now_millis(),
            edited: false,
            reactions: BTreeMap::new(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Uuid::nil(), content, MessageKind::System)
    }

    pub fn reaction_count(&self, emoji: &str) -> usize {
        self.reactions.get(emoji).map_or(0, BTreeSet::len)
    }
}

/// One page of backlog, newest last.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatPage {
    pub messages: Vec<ChatMessage>,
    /// Older messages exist before the first one returned.
    pub has_more: bool,
}

/// Chat history of one session, in send order.
#[derive(Debug, Clone, Default)]
pub struct ChatChannel {
    messages: Vec<ChatMessage>,
}

impl ChatChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send(&mut self, author: Uuid, content: impl Into<String>, kind: MessageKind) -> &ChatMessage {
        let index = self.messages.len();
        self.messages.push(ChatMessage::new(author, content, kind));
        &self.messages[index]
    }

    /// Append a message received from elsewhere. Duplicates are ignored.
    pub fn insert(&mut self, message: ChatMessage) -> bool {
        if self.position(&message.id).is_some() {
            return false;
        }
        self.messages.push(message);
        true
    }

    /// Insert or overwrite with the authoritative copy of a message.
    pub fn upsert(&mut self, message: ChatMessage) {
        match self.position(&message.id) {
            Some(index) => self.messages[index] = message,
            None => self.messages.push(message),
        }
    }

    /// Add `participant`'s reaction. Reacting twice is a no-op.
    pub fn react(&mut self, message: Uuid, participant: Uuid, emoji: &str) -> Option<&ChatMessage> {
        let index = self.position(&message)?;
        let msg = &mut self.messages[index];
        msg.reactions
            .entry(emoji.to_string())
            .or_default()
            .insert(participant);
        Some(msg)
    }

    pub fn unreact(&mut self, message: Uuid, participant: Uuid, emoji: &str) -> Option<&ChatMessage> {
        let index = self.position(&message)?;
        let msg = &mut self.messages[index];
        if let Some(who) = msg.reactions.get_mut(emoji) {
            who.remove(&participant);
            if who.is_empty() {
                msg.reactions.remove(emoji);
            }
        }
        Some(msg)
    }

    /// Replace the content of a message. Only its author may edit it.
    pub fn edit(&mut self, message: Uuid, author: Uuid, content: impl Into<String>) -> Option<&ChatMessage> {
        let index = self.position(&message)?;
        let msg = &mut self.messages[index];
        if msg.author != author || msg.kind == MessageKind::System {
            return None;
        }
        msg.content = content.into();
        msg.edited = true;
        Some(msg)
    }

    /// Up to `limit` messages sent before `before` (or the latest ones).
    pub fn page(&self, before: Option<Uuid>, limit: usize) -> ChatPage {
        let end = match before {
            Some(id) => self.position(&id).unwrap_or(self.messages.len()),
            None => self.messages.len(),
        };
        let start = end.saturating_sub(limit);
        ChatPage {
            messages: self.messages[start..end].to_vec(),
            has_more: start > 0,
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<&ChatMessage> {
        self.position(id).map(|i| &self.messages[i])
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn position(&self, id: &Uuid) -> Option<usize> {
        // Recent messages are the ones touched most.
        self.messages.iter().rposition(|m| m.id == *id)
    }
}
