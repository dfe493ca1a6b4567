//! Chat webhook delivery for alerts.
//!
//! The wire shape is a single JSON object `{"text": "..."}` POSTed with a
//! JSON content type. Any 2xx status counts as delivered. Failures are
//! reported to the caller, which logs them and moves on: alerts are never
//! retried or queued.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

/// Connect timeout for the webhook client.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors produced while delivering an alert.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The request never produced a response (DNS, connect, timeout, ...).
    #[error("webhook request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The webhook answered with a non-2xx status.
    #[error("webhook returned status {status}")]
    Status {
        /// HTTP status code.
        status: u16,
    },
}

/// An alert ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    /// Message prefix identifying the source.
    pub prefix: String,
    /// The log line that triggered the alert.
    pub line: String,
    /// Matches suppressed since the previous alert for this pattern.
    pub suppressed: u64,
}

impl Alert {
    /// Render the message text.
    pub fn text(&self) -> String {
        format_message(&self.prefix, &self.line, self.suppressed)
    }
}

/// Build the alert text: prefix, newline, line, and a suppression note when
/// any duplicates were swallowed.
pub fn format_message(prefix: &str, line: &str, suppressed: u64) -> String {
    let mut text = format!("{prefix}\n{line}");
    if suppressed > 0 {
        text.push_str(&format!("\nSuppressed {suppressed} duplicate(s)"));
    }
    text
}

/// Request body sent to the webhook.
#[derive(Debug, Serialize)]
struct WebhookMessage<'a> {
    text: &'a str,
}

/// Something that can deliver an alert.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver one alert.
    async fn notify(&self, alert: &Alert) -> Result<(), DispatchError>;
}

/// Delivers alerts to a chat webhook over HTTP.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    /// Create a notifier for `url`; each call is bounded by `timeout`.
    pub fn new(url: String, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT.min(timeout))
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to build HTTP client with timeouts, using default");
                reqwest::Client::default()
            });
        Self { client, url }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, alert: &Alert) -> Result<(), DispatchError> {
        let text = alert.text();
        let response = self
            .client
            .post(&self.url)
            .json(&WebhookMessage { text: &text })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(DispatchError::Status {
                status: status.as_u16(),
            });
        }
        debug!(status = status.as_u16(), "alert delivered");
        Ok(())
    }
}

/// Deliver `alert`, logging any failure instead of returning it.
///
/// Returns whether the alert was delivered.
pub async fn dispatch(notifier: &dyn Notifier, alert: &Alert) -> bool {
    match notifier.notify(alert).await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "failed to deliver alert");
            false
        }
    }
}
