use futures::future::BoxFuture;
use reqwest::Client;
use reqwest::multipart::{Form, Part};
use snafu::ResultExt;

use super::backend::{
    BackendConfig, BackendResult, BuildClientSnafu, ChatBackend, ChatReply, ChatRequest,
    FILES_FIELD, MESSAGE_FIELD, ReadAttachmentSnafu, ReadReplySnafu, SendRequestSnafu,
    TimedOutSnafu, UnexpectedStatusSnafu,
};

/// Posts chat turns as multipart forms to `{base_url}{chat_path}`.
#[derive(Debug, Clone)]
pub struct HttpChatBackend {
    config: BackendConfig,
    client: Client,
}

impl HttpChatBackend {
    pub fn new(config: BackendConfig) -> BackendResult<Self> {
        // No client-level timeout; the optional turn deadline wraps the whole exchange.
        let client = Client::builder().build().context(BuildClientSnafu {
            stage: "build-chat-client",
        })?;

        Ok(Self { config, client })
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    async fn build_form(request: ChatRequest) -> BackendResult<Form> {
        let mut form = Form::new().text(MESSAGE_FIELD, request.message);

        for file in request.files {
            let bytes = tokio::fs::read(&file.source_path)
                .await
                .context(ReadAttachmentSnafu {
                    stage: "read-attachment-bytes",
                    path: file.source_path.clone(),
                })?;

            tracing::debug!(
                display_name = %file.display_name,
                byte_count = bytes.len(),
                "attaching file to chat request"
            );
            form = form.part(FILES_FIELD, Part::bytes(bytes).file_name(file.display_name));
        }

        Ok(form)
    }

    async fn post_turn(&self, request: ChatRequest) -> BackendResult<ChatReply> {
        let url = self.config.chat_url();
        let file_count = request.files.len();
        let form = Self::build_form(request).await?;

        tracing::debug!(url = %url, file_count, "sending chat request");

        let response = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .context(SendRequestSnafu {
                stage: "send-chat-request",
                url: url.clone(),
            })?;
        let status = response.status();
        let payload = response.text().await.context(ReadReplySnafu {
            stage: "read-chat-reply",
        })?;

        if !status.is_success() {
            return UnexpectedStatusSnafu {
                stage: "chat-http-status",
                status: status.as_u16(),
                body: payload,
            }
            .fail();
        }

        ChatReply::from_json(&payload)
    }
}

impl ChatBackend for HttpChatBackend {
    fn send_chat<'a>(&'a self, request: ChatRequest) -> BoxFuture<'a, BackendResult<ChatReply>> {
        Box::pin(async move {
            let Some(limit) = self.config.request_timeout else {
                return self.post_turn(request).await;
            };

            tokio::time::timeout(limit, self.post_turn(request))
                .await
                .unwrap_or_else(|_| {
                    TimedOutSnafu {
                        stage: "await-chat-reply",
                        operation: "chat request",
                        seconds: limit.as_secs(),
                    }
                    .fail()
                })
        })
    }
}
