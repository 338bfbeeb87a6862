use std::path::PathBuf;
use std::time::Duration;

use futures::future::BoxFuture;
use snafu::{ResultExt, Snafu};

pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";
pub const DEFAULT_CHAT_PATH: &str = "/chat";

/// Multipart field carrying the turn text.
pub const MESSAGE_FIELD: &str = "message";
/// Multipart field name repeated once per attached file.
pub const FILES_FIELD: &str = "files";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub base_url: String,
    pub chat_path: String,
    /// `None` waits for the reply indefinitely.
    pub request_timeout: Option<Duration>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL, DEFAULT_CHAT_PATH)
    }
}

impl BackendConfig {
    pub fn new(base_url: impl Into<String>, chat_path: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim().to_string(),
            chat_path: chat_path.into().trim().to_string(),
            request_timeout: None,
        }
    }

    pub fn with_request_timeout(mut self, request_timeout: Option<Duration>) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn chat_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        let path = self.chat_path.trim_start_matches('/');
        format!("{base}/{path}")
    }
}

/// One local file travelling with a chat turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFile {
    pub display_name: String,
    pub source_path: PathBuf,
}

impl OutboundFile {
    pub fn new(display_name: impl Into<String>, source_path: impl Into<PathBuf>) -> Self {
        Self {
            display_name: display_name.into(),
            source_path: source_path.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChatRequest {
    pub message: String,
    pub files: Vec<OutboundFile>,
}

impl ChatRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            files: Vec::new(),
        }
    }

    pub fn with_file(mut self, file: OutboundFile) -> Self {
        self.files.push(file);
        self
    }

    pub fn with_files(mut self, files: impl IntoIterator<Item = OutboundFile>) -> Self {
        self.files.extend(files);
        self
    }
}

/// Decoded chat reply. `response` is `None` whenever the payload does not
/// carry a string `response` field.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChatReply {
    pub response: Option<String>,
}

impl ChatReply {
    pub fn new(response: impl Into<String>) -> Self {
        Self {
            response: Some(response.into()),
        }
    }

    pub fn from_json(payload: &str) -> BackendResult<Self> {
        let value: serde_json::Value =
            serde_json::from_str(payload).context(DecodeReplySnafu {
                stage: "decode-chat-reply",
            })?;

        let response = value
            .as_object()
            .and_then(|object| object.get("response"))
            .and_then(|field| field.as_str())
            .map(str::to_string);

        Ok(Self { response })
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum BackendError {
    #[snafu(display("failed to build http client on `{stage}`: {source}"))]
    BuildClient {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("failed to read attachment {path:?}: {source}"))]
    ReadAttachment {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("request to {url} failed: {source}"))]
    SendRequest {
        stage: &'static str,
        url: String,
        source: reqwest::Error,
    },
    #[snafu(display("backend returned status {status}"))]
    UnexpectedStatus {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[snafu(display("failed to read reply body: {source}"))]
    ReadReply {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("reply is not valid JSON: {source}"))]
    DecodeReply {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("{operation} timed out after {seconds} seconds"))]
    TimedOut {
        stage: &'static str,
        operation: &'static str,
        seconds: u64,
    },
}

impl BackendError {
    pub fn stage(&self) -> &'static str {
        match self {
            Self::BuildClient { stage, .. }
            | Self::ReadAttachment { stage, .. }
            | Self::SendRequest { stage, .. }
            | Self::UnexpectedStatus { stage, .. }
            | Self::ReadReply { stage, .. }
            | Self::DecodeReply { stage, .. }
            | Self::TimedOut { stage, .. } => *stage,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }
}

/// Sends one chat turn and decodes its reply.
pub trait ChatBackend: Send + Sync {
    fn send_chat<'a>(&'a self, request: ChatRequest) -> BoxFuture<'a, BackendResult<ChatReply>>;
}

/// Checks whether the backend is reachable. Any `Ok` means online.
pub trait LivenessProbe: Send + Sync {
    fn probe<'a>(&'a self) -> BoxFuture<'a, BackendResult<()>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_url_joins_base_and_path_with_one_slash() {
        let config = BackendConfig::new("http://localhost:8000/", "/chat");
        assert_eq!(config.chat_url(), "http://localhost:8000/chat");

        let config = BackendConfig::new(" http://example.test ", "api/chat");
        assert_eq!(config.chat_url(), "http://example.test/api/chat");
    }

    #[test]
    fn reply_with_response_field_is_decoded() {
        let reply = ChatReply::from_json(r#"{"response":"Hi there","extra":1}"#).unwrap();
        assert_eq!(reply.response.as_deref(), Some("Hi there"));
    }

    #[test]
    fn other_shapes_count_as_absent_response() {
        for payload in [r#"{}"#, r#"{"response":null}"#, r#"{"response":42}"#, r#"["x"]"#, "\"text\""] {
            let reply = ChatReply::from_json(payload).unwrap();
            assert_eq!(reply.response, None, "payload {payload}");
        }
    }

    #[test]
    fn non_json_reply_is_a_decode_error() {
        let error = ChatReply::from_json("<html>oops</html>").unwrap_err();
        assert!(matches!(error, BackendError::DecodeReply { .. }));
        assert_eq!(error.stage(), "decode-chat-reply");
    }
}
