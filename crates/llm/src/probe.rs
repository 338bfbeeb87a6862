use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::Client;
use snafu::ResultExt;

use super::backend::{
    BackendError, BackendResult, BuildClientSnafu, LivenessProbe, TimedOutSnafu,
    UnexpectedStatusSnafu,
};

pub const DEFAULT_HEARTBEAT_URL: &str = "http://localhost:8000/heartbeat";

/// GETs a fixed heartbeat URL. The response body is never read.
#[derive(Debug, Clone)]
pub struct HttpLivenessProbe {
    url: String,
    timeout: Duration,
    client: Client,
}

impl HttpLivenessProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> BackendResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context(BuildClientSnafu {
                stage: "build-probe-client",
            })?;

        Ok(Self {
            url: url.into().trim().to_string(),
            timeout,
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn check(&self) -> BackendResult<()> {
        let response = match self.client.get(&self.url).send().await {
            Ok(response) => response,
            Err(source) if source.is_timeout() => {
                return TimedOutSnafu {
                    stage: "send-heartbeat",
                    operation: "heartbeat",
                    seconds: self.timeout.as_secs(),
                }
                .fail();
            }
            Err(source) => {
                return Err(BackendError::SendRequest {
                    stage: "send-heartbeat",
                    url: self.url.clone(),
                    source,
                });
            }
        };

        let status = response.status();
        if !status.is_success() {
            return UnexpectedStatusSnafu {
                stage: "heartbeat-http-status",
                status: status.as_u16(),
                body: String::new(),
            }
            .fail();
        }

        Ok(())
    }
}

impl LivenessProbe for HttpLivenessProbe {
    fn probe<'a>(&'a self) -> BoxFuture<'a, BackendResult<()>> {
        Box::pin(self.check())
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    async fn probe_against(server: &MockServer, timeout: Duration) -> BackendResult<()> {
        let url = format!("{}/heartbeat", server.uri());
        HttpLivenessProbe::new(url, timeout).unwrap().probe().await
    }

    #[tokio::test]
    async fn success_status_is_alive() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/heartbeat"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        assert!(probe_against(&server, Duration::from_secs(2)).await.is_ok());
    }

    #[tokio::test]
    async fn error_status_is_not_alive() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let error = probe_against(&server, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            BackendError::UnexpectedStatus { status: 503, .. }
        ));
    }

    #[tokio::test]
    async fn slow_heartbeat_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
            .mount(&server)
            .await;

        let error = probe_against(&server, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(error.is_timeout());
    }

    #[tokio::test]
    async fn refused_connection_is_not_alive() {
        let probe =
            HttpLivenessProbe::new("http://127.0.0.1:1/heartbeat", Duration::from_secs(1)).unwrap();
        let error = probe.probe().await.unwrap_err();
        assert!(matches!(error, BackendError::SendRequest { .. }));
    }
}
