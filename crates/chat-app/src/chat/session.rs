use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use relay_llm::{BackendError, ChatBackend, ChatRequest};
use snafu::{ResultExt, Snafu};
use tokio::sync::{oneshot, watch};

use super::attachments::{AttachmentStore, PendingAttachment};
use super::message::ConversationLog;

/// User-message text for a turn that carries only files.
pub const FILES_ONLY_LABEL: &str = "Sent files";
/// Assistant text when a reply arrives without a `response` field.
pub const NO_RESPONSE_TEXT: &str = "No response from AI.";

/// How one `send_turn` call ended. Failures are already in the log by the
/// time this is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    /// Blank text and no attachments; nothing happened.
    Skipped,
    /// The session is not running; nothing happened.
    Rejected,
    /// The backend answered.
    Answered,
    /// The turn failed and an error entry was logged.
    Failed,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TurnError {
    #[snafu(display("{source}"))]
    Backend {
        stage: &'static str,
        source: BackendError,
    },
    #[snafu(display("chat request was cancelled"))]
    Cancelled { stage: &'static str },
}

/// Turns user input into exactly one backend request and one resulting
/// log entry.
///
/// Turns are serialized: a second `send_turn` waits until the first one has
/// resolved before its user message is logged.
pub struct ChatSession {
    backend: Arc<dyn ChatBackend>,
    log: Arc<ConversationLog>,
    attachments: Arc<AttachmentStore>,
    running: AtomicBool,
    turn_lock: tokio::sync::Mutex<()>,
    composing: watch::Sender<bool>,
    active_cancel: Mutex<Option<oneshot::Sender<()>>>,
}

impl ChatSession {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        log: Arc<ConversationLog>,
        attachments: Arc<AttachmentStore>,
    ) -> Self {
        let (composing, _) = watch::channel(false);
        Self {
            backend,
            log,
            attachments,
            running: AtomicBool::new(false),
            turn_lock: tokio::sync::Mutex::new(()),
            composing,
            active_cancel: Mutex::new(None),
        }
    }

    pub fn start(&self) {
        if !self.running.swap(true, Ordering::SeqCst) {
            tracing::info!("chat session started");
        }
    }

    /// Stops accepting turns and cancels the one in flight, if any.
    pub fn shutdown(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            let cancelled = self.cancel_active_turn();
            tracing::info!(cancelled_in_flight = cancelled, "chat session shut down");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn log(&self) -> &Arc<ConversationLog> {
        &self.log
    }

    pub fn attachments(&self) -> &Arc<AttachmentStore> {
        &self.attachments
    }

    /// Composing indicator: `true` while a turn's request is in flight.
    pub fn subscribe_composing(&self) -> watch::Receiver<bool> {
        self.composing.subscribe()
    }

    pub fn is_composing(&self) -> bool {
        *self.composing.borrow()
    }

    /// Aborts the in-flight request. Returns `false` when no turn was waiting.
    pub fn cancel_active_turn(&self) -> bool {
        self.lock_cancel()
            .take()
            .map(|cancel_tx| cancel_tx.send(()).is_ok())
            .unwrap_or(false)
    }

    /// Sends `text` together with every pending attachment.
    ///
    /// The user message is logged before any network activity. Whatever the
    /// backend does, exactly one assistant entry follows (unless the reply is
    /// blank) and the attachments it carried are consumed once the turn
    /// resolves. Files attached meanwhile stay queued for the next turn.
    pub async fn send_turn(&self, text: &str) -> TurnOutcome {
        if !self.is_running() {
            tracing::warn!("turn submitted while chat session is not running");
            return TurnOutcome::Rejected;
        }

        let _turn = self.turn_lock.lock().await;

        let attachments = self.attachments.pending();
        let text_is_blank = text.trim().is_empty();
        if text_is_blank && attachments.is_empty() {
            return TurnOutcome::Skipped;
        }

        // Cancellable from here on; the indicator only goes up after this.
        let Some(cancel_rx) = self.register_turn() else {
            tracing::warn!("chat session stopped while turn was queued");
            return TurnOutcome::Rejected;
        };

        let attachment_names = attachments
            .iter()
            .map(|attachment| attachment.display_name.clone())
            .collect::<Vec<_>>();
        let label = if text_is_blank { FILES_ONLY_LABEL } else { text };
        self.log.append_user(label, attachment_names);

        let composing = ComposingGuard::raise(&self.composing);
        let result = self.exchange(text, &attachments, cancel_rx).await;
        self.lock_cancel().take();

        let outcome = match result {
            Ok(response) => {
                self.log.append_assistant(response);
                TurnOutcome::Answered
            }
            Err(error) => {
                tracing::warn!(error = %error, "chat turn failed");
                self.log.append_assistant(format!("Error: {error}"));
                TurnOutcome::Failed
            }
        };

        let consumed = self.attachments.consume(&attachments);
        drop(composing);
        tracing::debug!(
            ?outcome,
            consumed_attachments = consumed.len(),
            still_pending = self.attachments.len(),
            "chat turn resolved"
        );

        outcome
    }

    /// Installs the cancel handle for the next turn, or returns `None` once
    /// the session has stopped. Checked under the same lock `shutdown` takes,
    /// so a turn is either refused here or reachable by the cancel.
    fn register_turn(&self) -> Option<oneshot::Receiver<()>> {
        let mut active_cancel = self.lock_cancel();
        if !self.is_running() {
            return None;
        }

        let (cancel_tx, cancel_rx) = oneshot::channel();
        *active_cancel = Some(cancel_tx);
        Some(cancel_rx)
    }

    async fn exchange(
        &self,
        text: &str,
        attachments: &[PendingAttachment],
        cancel_rx: oneshot::Receiver<()>,
    ) -> Result<String, TurnError> {
        let request = ChatRequest::new(text)
            .with_files(attachments.iter().map(PendingAttachment::to_outbound));

        tracing::debug!(
            text_len = text.len(),
            attachment_count = attachments.len(),
            "sending chat turn"
        );

        let reply = tokio::select! {
            reply = self.backend.send_chat(request) => reply.context(BackendSnafu {
                stage: "send-turn",
            }),
            _ = cancel_rx => CancelledSnafu { stage: "await-turn" }.fail(),
        }?;

        Ok(reply
            .response
            .unwrap_or_else(|| NO_RESPONSE_TEXT.to_string()))
    }

    fn lock_cancel(&self) -> MutexGuard<'_, Option<oneshot::Sender<()>>> {
        self.active_cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Holds the composing indicator up for its lifetime, so a dropped turn
/// future never leaves it stuck.
struct ComposingGuard<'a> {
    composing: &'a watch::Sender<bool>,
}

impl<'a> ComposingGuard<'a> {
    fn raise(composing: &'a watch::Sender<bool>) -> Self {
        composing.send_replace(true);
        Self { composing }
    }
}

impl Drop for ComposingGuard<'_> {
    fn drop(&mut self) {
        self.composing.send_replace(false);
    }
}

#[cfg(test)]
mod tests {
    use std::fs::File;
    use std::io::Write;
    use std::path::PathBuf;
    use std::time::Duration;

    use relay_llm::{BackendConfig, HttpChatBackend};
    use tempfile::TempDir;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::chat::message::{Message, Role};

    fn session_for(base_url: &str, timeout: Option<Duration>) -> ChatSession {
        let config = BackendConfig::new(base_url, "/chat").with_request_timeout(timeout);
        let backend = Arc::new(HttpChatBackend::new(config).unwrap());
        let session = ChatSession::new(
            backend,
            Arc::new(ConversationLog::new()),
            Arc::new(AttachmentStore::default()),
        );
        session.start();
        session
    }

    fn write_file(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        File::create(&path)
            .unwrap()
            .write_all(contents.as_bytes())
            .unwrap();
        path
    }

    fn summary(messages: &[Message]) -> Vec<(String, bool, Vec<String>)> {
        messages
            .iter()
            .map(|message| {
                (
                    message.text.clone(),
                    message.is_from_user(),
                    message.attachment_names.clone(),
                )
            })
            .collect()
    }

    async fn reply_with(server: &MockServer, body: &str) {
        Mock::given(method("POST"))
            .and(path("/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn text_turn_logs_user_then_reply() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat"))
            .and(body_string_contains("Hello"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(r#"{"response":"Hi there"}"#),
            )
            .expect(1)
            .mount(&server)
            .await;
        let session = session_for(&server.uri(), None);

        let outcome = session.send_turn("Hello").await;

        assert_eq!(outcome, TurnOutcome::Answered);
        assert_eq!(
            summary(&session.log().messages()),
            vec![
                ("Hello".to_string(), true, vec![]),
                ("Hi there".to_string(), false, vec![]),
            ]
        );
        assert!(!session.is_composing());
    }

    #[tokio::test]
    async fn blank_turn_without_files_sends_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        let session = session_for(&server.uri(), None);

        assert_eq!(session.send_turn("").await, TurnOutcome::Skipped);
        assert_eq!(session.send_turn("   ").await, TurnOutcome::Skipped);
        assert!(session.log().is_empty());
    }

    #[tokio::test]
    async fn files_only_turn_to_unreachable_backend_logs_error() {
        let dir = TempDir::new().unwrap();
        let report = write_file(&dir, "report.pdf", "%PDF-1.4");
        // Nothing listens on port 1, so the connection is refused.
        let session = session_for("http://127.0.0.1:1", None);
        session.attachments().add(&report).unwrap();

        let outcome = session.send_turn("").await;

        assert_eq!(outcome, TurnOutcome::Failed);
        let messages = session.log().messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].text, FILES_ONLY_LABEL);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].attachment_names, vec!["report.pdf".to_string()]);
        assert_eq!(messages[1].role, Role::Assistant);
        assert!(messages[1].text.starts_with("Error: "), "{}", messages[1].text);
        assert!(session.attachments().is_empty());
    }

    #[tokio::test]
    async fn attachments_are_consumed_after_a_successful_turn() {
        let server = MockServer::start().await;
        reply_with(&server, r#"{"response":"Got it"}"#).await;
        let dir = TempDir::new().unwrap();
        let session = session_for(&server.uri(), None);
        session
            .attachments()
            .add(write_file(&dir, "a.txt", "alpha"))
            .unwrap();
        session
            .attachments()
            .add(write_file(&dir, "b.txt", "beta"))
            .unwrap();

        session.send_turn("two files").await;

        assert!(session.attachments().is_empty());
        assert_eq!(
            session.log().messages()[0].attachment_names,
            vec!["a.txt".to_string(), "b.txt".to_string()]
        );
    }

    #[tokio::test]
    async fn reply_without_response_field_gets_placeholder() {
        let server = MockServer::start().await;
        reply_with(&server, r#"{"answer":"wrong key"}"#).await;
        let session = session_for(&server.uri(), None);

        assert_eq!(session.send_turn("Hello").await, TurnOutcome::Answered);
        assert_eq!(session.log().last().unwrap().text, NO_RESPONSE_TEXT);
    }

    #[tokio::test]
    async fn blank_reply_adds_no_assistant_entry() {
        let server = MockServer::start().await;
        reply_with(&server, r#"{"response":"  "}"#).await;
        let session = session_for(&server.uri(), None);

        session.send_turn("Hello").await;

        assert_eq!(session.log().len(), 1);
    }

    #[tokio::test]
    async fn error_status_is_reported_in_conversation() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;
        let session = session_for(&server.uri(), None);

        assert_eq!(session.send_turn("Hello").await, TurnOutcome::Failed);
        assert_eq!(
            session.log().last().unwrap().text,
            "Error: backend returned status 502"
        );
    }

    #[tokio::test]
    async fn request_timeout_is_distinguishable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"{"response":"late"}"#)
                    .set_delay(Duration::from_secs(3)),
            )
            .mount(&server)
            .await;
        let session = session_for(&server.uri(), Some(Duration::from_secs(1)));

        assert_eq!(session.send_turn("Hello").await, TurnOutcome::Failed);
        assert_eq!(
            session.log().last().unwrap().text,
            "Error: chat request timed out after 1 seconds"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_resolves_turn_and_clears_indicator() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(30)))
            .mount(&server)
            .await;
        let dir = TempDir::new().unwrap();
        let session = Arc::new(session_for(&server.uri(), None));
        session
            .attachments()
            .add(write_file(&dir, "slow.txt", "zzz"))
            .unwrap();
        let mut composing = session.subscribe_composing();

        let turn = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.send_turn("are you there?").await }
        });
        composing.wait_for(|active| *active).await.unwrap();
        assert!(session.cancel_active_turn());

        assert_eq!(turn.await.unwrap(), TurnOutcome::Failed);
        assert!(!session.is_composing());
        assert!(session.attachments().is_empty());
        assert_eq!(
            session.log().last().unwrap().text,
            "Error: chat request was cancelled"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_reaches_every_turn_once_indicator_is_up() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(30)))
            .mount(&server)
            .await;
        let session = Arc::new(session_for(&server.uri(), None));

        for round in 0..50 {
            let mut composing = session.subscribe_composing();
            let turn = tokio::spawn({
                let session = Arc::clone(&session);
                async move { session.send_turn("hi").await }
            });
            composing.wait_for(|active| *active).await.unwrap();

            assert!(session.cancel_active_turn(), "round {round}");
            assert_eq!(turn.await.unwrap(), TurnOutcome::Failed);
        }
    }

    #[tokio::test]
    async fn files_attached_during_a_turn_wait_for_the_next_one() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("with early"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"{"response":"one"}"#)
                    .set_delay(Duration::from_millis(300)),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_string_contains("with late"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"response":"two"}"#))
            .mount(&server)
            .await;
        let dir = TempDir::new().unwrap();
        let session = Arc::new(session_for(&server.uri(), None));
        session
            .attachments()
            .add(write_file(&dir, "early.txt", "early bytes"))
            .unwrap();

        let first = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.send_turn("with early").await }
        });
        session
            .subscribe_composing()
            .wait_for(|active| *active)
            .await
            .unwrap();
        session
            .attachments()
            .add(write_file(&dir, "late.txt", "late bytes"))
            .unwrap();

        assert_eq!(first.await.unwrap(), TurnOutcome::Answered);
        let still_pending = session
            .attachments()
            .pending()
            .into_iter()
            .map(|attachment| attachment.display_name)
            .collect::<Vec<_>>();
        assert_eq!(still_pending, vec!["late.txt"]);

        assert_eq!(session.send_turn("with late").await, TurnOutcome::Answered);
        assert!(session.attachments().is_empty());
        let sent_names = session
            .log()
            .messages()
            .into_iter()
            .filter(Message::is_from_user)
            .map(|message| message.attachment_names)
            .collect::<Vec<_>>();
        assert_eq!(
            sent_names,
            vec![vec!["early.txt".to_string()], vec!["late.txt".to_string()]]
        );

        let bodies = server
            .received_requests()
            .await
            .unwrap()
            .into_iter()
            .map(|request| String::from_utf8_lossy(&request.body).into_owned())
            .collect::<Vec<_>>();
        assert!(!bodies[0].contains("late bytes"));
        assert!(bodies[1].contains("late bytes"));
    }

    #[tokio::test]
    async fn concurrent_turns_are_serialized() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("first"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"{"response":"one"}"#)
                    .set_delay(Duration::from_millis(300)),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_string_contains("second"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"response":"two"}"#))
            .mount(&server)
            .await;
        let session = Arc::new(session_for(&server.uri(), None));

        let first = tokio::spawn({
            let session = Arc::clone(&session);
            async move { session.send_turn("first").await }
        });
        session
            .subscribe_composing()
            .wait_for(|active| *active)
            .await
            .unwrap();
        let second = session.send_turn("second").await;

        assert_eq!(first.await.unwrap(), TurnOutcome::Answered);
        assert_eq!(second, TurnOutcome::Answered);
        let texts = session
            .log()
            .messages()
            .into_iter()
            .map(|message| message.text)
            .collect::<Vec<_>>();
        assert_eq!(texts, vec!["first", "one", "second", "two"]);
    }

    #[tokio::test]
    async fn stopped_session_rejects_turns() {
        let session = session_for("http://127.0.0.1:1", None);
        session.shutdown();

        assert_eq!(session.send_turn("Hello").await, TurnOutcome::Rejected);
        assert!(session.log().is_empty());
    }
}
