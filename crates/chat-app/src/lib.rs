#![deny(unsafe_code)]

/// Chat client core.
///
/// Owns the conversation log, pending attachments, turn sending and backend
/// liveness polling. Front ends observe state through channels and forward
/// user actions to [`app::ChatApp`].
pub mod app;
/// Chat domain: log, attachments and sessions.
pub mod chat;
pub mod console;
/// Periodic backend liveness probing.
pub mod heartbeat;
/// Settings persistence.
pub mod settings;
