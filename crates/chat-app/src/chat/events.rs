use super::attachments::AttachmentError;
use super::message::Message;

/// Emitted by the conversation log for each accepted append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    Appended { index: usize, message: Message },
}

/// A user-facing notice for an action that was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: &'static str,
    pub message: String,
}

impl Notification {
    pub fn new(title: &'static str, message: impl Into<String>) -> Self {
        Self {
            title,
            message: message.into(),
        }
    }
}

impl From<&AttachmentError> for Notification {
    fn from(error: &AttachmentError) -> Self {
        let title = match error {
            AttachmentError::AlreadyAttached { .. } => "Already attached",
            AttachmentError::FileTooLarge { .. } => "File too large",
            AttachmentError::NotAFile { .. } | AttachmentError::ReadMetadata { .. } => {
                "Cannot attach file"
            }
        };
        Self::new(title, error.to_string())
    }
}
