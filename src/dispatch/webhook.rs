use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

use super::{DispatchOutcome, OutboxDispatcher};
use crate::config::WebhookConfig;
use crate::model::OutboxMessage;

pub const HEADER_MESSAGE_ID: &str = "X-Outbox-Message-Id";
pub const HEADER_MESSAGE_TYPE: &str = "X-Outbox-Message-Type";
pub const HEADER_CORRELATION_ID: &str = "X-Correlation-Id";
pub const HEADER_CAUSATION_ID: &str = "X-Causation-Id";

/// Bytes of a rejecting response body kept in the log.
const LOGGED_BODY_LIMIT: usize = 512;

/// POSTs each message payload to a fixed endpoint.
#[derive(Clone)]
pub struct WebhookDispatcher {
    http: Client,
    endpoint: Url,
    content_type: String,
    bearer_token: Option<String>,
}

impl fmt::Debug for WebhookDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookDispatcher")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl WebhookDispatcher {
    pub fn new(endpoint: Url, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("outbox-relay/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .no_proxy()
            .build()
            .context("failed to build webhook http client")?;
        Ok(Self {
            http,
            endpoint,
            content_type: "application/json".to_string(),
            bearer_token: None,
        })
    }

    pub fn from_config(cfg: &WebhookConfig) -> Result<Self> {
        let endpoint = Url::parse(&cfg.url).context("invalid webhook url")?;
        let mut dispatcher = Self::new(endpoint, Duration::from_millis(cfg.timeout_ms))?;
        dispatcher.content_type = cfg.content_type.clone();
        dispatcher.bearer_token = cfg.bearer_token.clone();
        Ok(dispatcher)
    }

    pub fn build_request(&self, message: &OutboxMessage) -> Result<reqwest::Request> {
        let mut req = self
            .http
            .post(self.endpoint.clone())
            .header("Content-Type", &self.content_type)
            .header(HEADER_MESSAGE_ID, message.id.to_string())
            .header(HEADER_MESSAGE_TYPE, &message.message_type)
            .header(HEADER_CORRELATION_ID, &message.correlation_id)
            .header(HEADER_CAUSATION_ID, &message.causation_id)
            .body(message.payload.clone());
        if let Some(token) = &self.bearer_token {
            req = req.bearer_auth(token);
        }
        req.build().context("failed to build webhook request")
    }
}

/// Map a downstream status to an outcome: only 2xx counts as delivered.
pub fn classify_status(status: reqwest::StatusCode) -> DispatchOutcome {
    if status.is_success() {
        DispatchOutcome::Delivered
    } else {
        DispatchOutcome::Rejected(format!("downstream {}", status.as_u16()))
    }
}

/// At most `LOGGED_BODY_LIMIT` bytes of `body`, cut on a char boundary.
fn body_excerpt(body: &str) -> &str {
    if body.len() <= LOGGED_BODY_LIMIT {
        return body;
    }
    let mut end = LOGGED_BODY_LIMIT;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}

#[async_trait]
impl OutboxDispatcher for WebhookDispatcher {
    async fn dispatch(&self, message: &OutboxMessage) -> Result<DispatchOutcome> {
        let request = self.build_request(message)?;
        debug!(url = %request.url(), message_id = %message.id, "posting outbox message");
        // Transport errors propagate: the attempt failed, not the message.
        let resp = self
            .http
            .execute(request)
            .await
            .with_context(|| format!("webhook request to {} failed", self.endpoint))?;
        let status = resp.status();
        let outcome = classify_status(status);
        if let DispatchOutcome::Rejected(reason) = &outcome {
            match resp.text().await {
                Ok(body) => warn!(
                    message_id = %message.id,
                    %reason,
                    body = %body_excerpt(&body),
                    "webhook rejected message"
                ),
                Err(err) => warn!(
                    message_id = %message.id,
                    %reason,
                    ?err,
                    "webhook rejected message; failed to read response body"
                ),
            }
        }
        Ok(outcome)
    }
}
