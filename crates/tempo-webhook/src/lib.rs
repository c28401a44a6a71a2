//! Webhook executor: delivers each due action as a JSON `POST`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Serialize;
use tracing::debug;

use tempo_core::{
    domain::{ActionId, ScheduledAction, SubjectId},
    executor::ActionExecutor,
    Error, ExecutionError, Result,
};

#[derive(Serialize)]
struct Delivery<'a> {
    id: ActionId,
    subject_id: &'a SubjectId,
    kind: &'a str,
    payload: &'a serde_json::Value,
    attempt_count: u32,
    scheduled_for: DateTime<Utc>,
}

impl<'a> From<&'a ScheduledAction> for Delivery<'a> {
    fn from(a: &'a ScheduledAction) -> Self {
        Self {
            id: a.id,
            subject_id: &a.subject_id,
            kind: &a.kind,
            payload: &a.payload,
            attempt_count: a.attempt_count,
            scheduled_for: a.scheduled_for,
        }
    }
}

/// HTTP timeout to pair with a claim-loop `execution_timeout`: a tenth
/// shorter, with the margin held between 100ms and 5s.
pub fn delivery_timeout(execution_timeout: Duration) -> Duration {
    let margin = (execution_timeout / 10).clamp(Duration::from_millis(100), Duration::from_secs(5));
    match execution_timeout.checked_sub(margin) {
        Some(t) if !t.is_zero() => t,
        _ => execution_timeout / 2,
    }
}

#[derive(Clone, Debug)]
pub struct WebhookExecutor {
    url: String,
    http: reqwest::Client,
}

impl WebhookExecutor {
    /// `timeout` bounds one delivery; keep it below the claim loop's
    /// execution timeout so the HTTP error is what gets recorded.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::External(format!("webhook client build error: {e}")))?;
        Ok(Self {
            url: url.into(),
            http,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// 2xx succeeds. 408, 429 and 5xx are worth retrying; any other status means
/// the receiver rejected the action and retrying would not help.
fn classify(status: StatusCode, body: &str) -> std::result::Result<(), ExecutionError> {
    if status.is_success() {
        return Ok(());
    }
    let reason = format!(
        "webhook returned {status}: {}",
        body.chars().take(200).collect::<String>()
    );
    let retryable = status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS;
    if retryable {
        Err(ExecutionError::Transient(reason))
    } else {
        Err(ExecutionError::Permanent(reason))
    }
}

#[async_trait]
impl ActionExecutor for WebhookExecutor {
    async fn execute(&self, action: &ScheduledAction) -> std::result::Result<(), ExecutionError> {
        let resp = self
            .http
            .post(&self.url)
            .json(&Delivery::from(action))
            .send()
            .await
            .map_err(|e| ExecutionError::Transient(format!("webhook request error: {e}")))?;

        let status = resp.status();
        let body = if status.is_success() {
            String::new()
        } else {
            resp.text().await.unwrap_or_default()
        };
        debug!(id = %action.id, kind = %action.kind, %status, "webhook delivered");
        classify(status, &body)
    }
}
