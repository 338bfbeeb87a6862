//! Line-oriented front end helpers used by the `relay` binary.

use crate::chat::{Message, Notification, PendingAttachment};
use crate::heartbeat::ConnectivityStatus;

/// One line of user input, interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// Plain text: submit as a turn (possibly empty, for files-only turns).
    Submit(String),
    Attach(Vec<String>),
    Remove(String),
    ListAttachments,
    ClearAttachments,
    Cancel,
    Help,
    Quit,
    Unknown(String),
}

impl ConsoleCommand {
    pub fn parse(line: &str) -> Self {
        let trimmed = line.trim();
        let Some(command) = trimmed.strip_prefix('/') else {
            return Self::Submit(line.trim_end_matches(['\r', '\n']).to_string());
        };

        let (name, rest) = command
            .split_once(char::is_whitespace)
            .map(|(name, rest)| (name, rest.trim()))
            .unwrap_or((command, ""));

        match name {
            "attach" => Self::Attach(split_paths(rest)),
            "remove" => Self::Remove(rest.to_string()),
            "files" => Self::ListAttachments,
            "clear" => Self::ClearAttachments,
            "cancel" => Self::Cancel,
            "help" => Self::Help,
            "quit" | "exit" => Self::Quit,
            other => Self::Unknown(other.to_string()),
        }
    }
}

/// Splits on whitespace, keeping single- or double-quoted runs together.
fn split_paths(input: &str) -> Vec<String> {
    let mut paths = Vec::new();
    let mut current = String::new();
    let mut quote = None;
    let mut in_token = false;

    for ch in input.chars() {
        match quote {
            Some(open) if ch == open => quote = None,
            Some(_) => current.push(ch),
            None if ch == '"' || ch == '\'' => {
                quote = Some(ch);
                in_token = true;
            }
            None if ch.is_whitespace() => {
                if in_token {
                    paths.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            None => {
                current.push(ch);
                in_token = true;
            }
        }
    }
    if in_token {
        paths.push(current);
    }

    paths
}

pub const HELP_TEXT: &str = "\
Type a message and press Enter to send it with any attached files.
  /attach <path>...  attach files (quote paths containing spaces)
  /remove <name>     drop a pending attachment
  /files             list pending attachments
  /clear             drop every pending attachment
  /cancel            stop waiting for the current reply
  /quit              exit";

pub fn render_message(message: &Message) -> String {
    let speaker = if message.is_from_user() {
        "you"
    } else {
        "assistant"
    };

    if message.attachment_names.is_empty() {
        format!("{speaker}> {}", message.text)
    } else {
        format!(
            "{speaker}> {} [{}]",
            message.text,
            message.attachment_names.join(", ")
        )
    }
}

pub fn render_status(status: ConnectivityStatus) -> String {
    format!("-- backend {} --", status.label().to_lowercase())
}

pub fn render_notification(notification: &Notification) -> String {
    format!("!! {}: {}", notification.title, notification.message)
}

pub fn render_attachments(attachments: &[PendingAttachment]) -> String {
    if attachments.is_empty() {
        return "no pending attachments".to_string();
    }

    attachments
        .iter()
        .map(|attachment| format!("  {}", attachment.display_name))
        .collect::<Vec<_>>()
        .join("\n")
}
