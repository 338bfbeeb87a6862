/// Pending file attachments for the next turn.
pub mod attachments;
/// Notifications emitted to the presentation layer.
pub mod events;
/// Conversation entries and the append-only log.
pub mod message;
/// Turn sending against the chat backend.
pub mod session;

pub use attachments::{
    AttachBatch, AttachmentError, AttachmentResult, AttachmentStore, DEFAULT_MAX_ATTACHMENT_BYTES,
    PendingAttachment,
};
pub use events::{LogEvent, Notification};
pub use message::{ConversationLog, Message, MessageId, Role};
pub use session::{ChatSession, FILES_ONLY_LABEL, NO_RESPONSE_TEXT, TurnError, TurnOutcome};
