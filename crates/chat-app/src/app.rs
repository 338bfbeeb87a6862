use std::path::Path;
use std::sync::Arc;

use relay_llm::{BackendResult, ChatBackend, HttpChatBackend, HttpLivenessProbe, LivenessProbe};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::chat::{
    AttachmentStore, ChatSession, ConversationLog, LogEvent, Notification, PendingAttachment,
    TurnOutcome,
};
use crate::heartbeat::{ConnectivityStatus, HeartbeatMonitor};
use crate::settings::ClientSettings;

/// Application shell: owns the conversation, the pending attachments, the
/// chat session and the heartbeat, and exposes the actions a front end
/// forwards (submit, attach, remove, cancel).
pub struct ChatApp {
    settings: Arc<ClientSettings>,
    log: Arc<ConversationLog>,
    attachments: Arc<AttachmentStore>,
    session: ChatSession,
    heartbeat: HeartbeatMonitor,
}

impl ChatApp {
    /// Builds the app against the HTTP backend described by `settings`.
    pub fn new(settings: Arc<ClientSettings>) -> BackendResult<Self> {
        let backend = HttpChatBackend::new(settings.backend_config())?;
        let probe =
            HttpLivenessProbe::new(settings.heartbeat_url.as_str(), settings.heartbeat_timeout())?;

        Ok(Self::with_backends(
            settings,
            Arc::new(backend),
            Arc::new(probe),
        ))
    }

    pub fn with_backends(
        settings: Arc<ClientSettings>,
        backend: Arc<dyn ChatBackend>,
        probe: Arc<dyn LivenessProbe>,
    ) -> Self {
        let log = Arc::new(ConversationLog::new());
        let attachments = Arc::new(AttachmentStore::new(settings.max_attachment_bytes));
        let session = ChatSession::new(backend, Arc::clone(&log), Arc::clone(&attachments));
        let heartbeat = HeartbeatMonitor::new(probe, settings.heartbeat_interval());

        Self {
            settings,
            log,
            attachments,
            session,
            heartbeat,
        }
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn log(&self) -> &ConversationLog {
        &self.log
    }

    pub fn attachments(&self) -> &AttachmentStore {
        &self.attachments
    }

    pub fn session(&self) -> &ChatSession {
        &self.session
    }

    pub fn heartbeat(&self) -> &HeartbeatMonitor {
        &self.heartbeat
    }

    pub fn subscribe_log(&self) -> broadcast::Receiver<LogEvent> {
        self.log.subscribe()
    }

    pub fn subscribe_composing(&self) -> watch::Receiver<bool> {
        self.session.subscribe_composing()
    }

    pub fn subscribe_connectivity(&self) -> watch::Receiver<ConnectivityStatus> {
        self.heartbeat.subscribe()
    }

    /// Starts accepting turns and begins heartbeat polling.
    pub fn start(&self) {
        self.session.start();
        self.heartbeat.start();
        tracing::info!(
            chat_url = %self.settings.backend_config().chat_url(),
            heartbeat_url = %self.settings.heartbeat_url,
            "relay started"
        );
    }

    /// Cancels any in-flight turn, stops accepting new ones and tears the
    /// heartbeat down.
    pub async fn shutdown(&self) {
        self.session.shutdown();
        self.heartbeat.shutdown().await;
        tracing::info!("relay shut down");
    }

    pub async fn submit(&self, text: &str) -> TurnOutcome {
        self.session.send_turn(text).await
    }

    pub fn cancel_turn(&self) -> bool {
        self.session.cancel_active_turn()
    }

    /// Attaches each path, returning one notice per refused file.
    ///
    /// Refused outright while a reply is pending. A file that still slips in
    /// during a turn stays queued for the next one.
    pub fn attach_files<I, P>(&self, paths: I) -> Vec<Notification>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        if self.session.is_composing() {
            return vec![Notification::new(
                "Reply pending",
                "wait for the current reply before attaching files",
            )];
        }

        let batch = self.attachments.add_batch(paths);
        batch.rejected.iter().map(Notification::from).collect()
    }

    pub fn remove_attachment(&self, attachment: &PendingAttachment) -> bool {
        self.attachments.remove(attachment)
    }

    /// Drops every pending attachment, returning how many there were.
    pub fn clear_attachments(&self) -> usize {
        self.attachments.drain_all().len()
    }

    pub fn remove_attachment_named(&self, display_name: &str) -> bool {
        self.attachments
            .find_by_name(display_name)
            .is_some_and(|attachment| self.attachments.remove(&attachment))
    }
}

/// Feeds submitted lines to the app one at a time, so turns keep the order
/// they were typed.
pub struct SubmissionQueue {
    app: Arc<ChatApp>,
    submit_tx: mpsc::UnboundedSender<String>,
    worker: JoinHandle<()>,
}

impl SubmissionQueue {
    pub fn spawn(app: Arc<ChatApp>) -> Self {
        let (submit_tx, mut submit_rx) = mpsc::unbounded_channel::<String>();
        let worker = tokio::spawn({
            let app = Arc::clone(&app);
            async move {
                while let Some(text) = submit_rx.recv().await {
                    let outcome = app.submit(&text).await;
                    tracing::debug!(?outcome, "turn finished");
                }
            }
        });

        Self {
            app,
            submit_tx,
            worker,
        }
    }

    /// Queues `text`. Returns `false` once the worker is gone.
    pub fn submit(&self, text: impl Into<String>) -> bool {
        self.submit_tx.send(text.into()).is_ok()
    }

    /// End of input: sends every queued line, then shuts the app down.
    pub async fn finish(self) {
        let Self {
            app,
            submit_tx,
            worker,
        } = self;
        drop(submit_tx);
        join_worker(worker).await;
        app.shutdown().await;
    }

    /// Explicit quit: shuts down first, cancelling the turn in flight.
    /// Lines still queued are rejected.
    pub async fn abandon(self) {
        let Self {
            app,
            submit_tx,
            worker,
        } = self;
        drop(submit_tx);
        app.shutdown().await;
        join_worker(worker).await;
    }
}

async fn join_worker(worker: JoinHandle<()>) {
    if let Err(error) = worker.await {
        tracing::warn!(error = %error, "submission worker ended abnormally");
    }
}
