use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;

use super::events::LogEvent;

/// Buffered append notifications per subscriber before it starts lagging.
const LOG_EVENT_CAPACITY: usize = 256;

/// Stable identifier for one logged message, assigned in append order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub u64);

impl MessageId {
    /// Creates a typed message identifier.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// Chat speaker role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Assistant,
}

/// One conversation entry. Never mutated after it is appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub text: String,
    pub attachment_names: Vec<String>,
}

impl Message {
    pub fn is_from_user(&self) -> bool {
        matches!(self.role, Role::User)
    }
}

#[derive(Debug, Default)]
struct LogEntries {
    messages: Vec<Message>,
    next_id: u64,
}

/// Append-only, ordered conversation history.
///
/// Insertion order is display order. Every accepted append is announced to
/// subscribers as a [`LogEvent::Appended`], emitted while the entry list is
/// still locked so notification order matches log order.
#[derive(Debug)]
pub struct ConversationLog {
    entries: Mutex<LogEntries>,
    events: broadcast::Sender<LogEvent>,
}

impl Default for ConversationLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationLog {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(LOG_EVENT_CAPACITY);
        Self {
            entries: Mutex::new(LogEntries::default()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        self.events.subscribe()
    }

    /// Appends a user turn. A turn with blank text and no attachments is
    /// ignored and returns `None`.
    pub fn append_user(
        &self,
        text: impl Into<String>,
        attachment_names: Vec<String>,
    ) -> Option<MessageId> {
        let text = text.into();
        if text.trim().is_empty() && attachment_names.is_empty() {
            return None;
        }

        Some(self.push(Role::User, text, attachment_names))
    }

    /// Appends an assistant reply. Blank replies produce no entry.
    pub fn append_assistant(&self, text: impl Into<String>) -> Option<MessageId> {
        let text = text.into();
        if text.trim().is_empty() {
            return None;
        }

        Some(self.push(Role::Assistant, text, Vec::new()))
    }

    pub fn messages(&self) -> Vec<Message> {
        self.lock().messages.clone()
    }

    pub fn last(&self) -> Option<Message> {
        self.lock().messages.last().cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().messages.is_empty()
    }

    fn push(&self, role: Role, text: String, attachment_names: Vec<String>) -> MessageId {
        let mut entries = self.lock();
        entries.next_id += 1;
        let message = Message {
            id: MessageId::new(entries.next_id),
            role,
            text,
            attachment_names,
        };
        let id = message.id;
        let index = entries.messages.len();

        entries.messages.push(message.clone());
        // No subscribers is fine; the log itself is the source of truth.
        let _ = self.events.send(LogEvent::Appended { index, message });

        id
    }

    fn lock(&self) -> MutexGuard<'_, LogEntries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
