//! Wire layer for the relay chat backend: multipart chat turns and the
//! heartbeat probe.

mod backend;
mod http_adapter;
mod probe;

pub use backend::{
    BackendConfig, BackendError, BackendResult, ChatBackend, ChatReply, ChatRequest,
    DEFAULT_BASE_URL, DEFAULT_CHAT_PATH, FILES_FIELD, LivenessProbe, MESSAGE_FIELD, OutboundFile,
};
pub use http_adapter::HttpChatBackend;
pub use probe::{DEFAULT_HEARTBEAT_URL, HttpLivenessProbe};
