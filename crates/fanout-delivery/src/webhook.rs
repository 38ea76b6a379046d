//! Webhook adapter: delivers envelopes as HTTP POST notifications.
//!
//! The request body is always `{"event": <name>, "payload": <payload>}`
//! so receivers can dispatch on the event name without inspecting the
//! payload. Response statuses are classified into the error taxonomy;
//! the adapter itself never retries.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use fanout_core::{Destination, Envelope, TaskKind};
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info_span, warn, Instrument};

use crate::{
    adapter::{DeliveryAdapter, DeliveryReceipt},
    error::{DeliveryError, Result},
};

/// Configuration for the webhook adapter's HTTP client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Timeout for a single delivery request.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
    /// Maximum number of redirects to follow.
    pub max_redirects: u32,
    /// Whether to verify TLS certificates.
    pub verify_tls: bool,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: "Fanout-Webhook/1.0".to_string(),
            max_redirects: 3,
            verify_tls: true,
        }
    }
}

/// HTTP adapter for webhook destinations.
///
/// Uses a pooled reqwest client shared across workers. Every outcome
/// is either a receipt (2xx) or a classified [`DeliveryError`].
#[derive(Debug, Clone)]
pub struct WebhookAdapter {
    client: reqwest::Client,
    config: WebhookConfig,
}

impl WebhookAdapter {
    /// Creates a webhook adapter with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the HTTP client cannot
    /// be built with the provided settings.
    pub fn new(config: WebhookConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects as usize))
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config })
    }

    /// Creates a webhook adapter with default configuration.
    pub fn with_defaults() -> Result<Self> {
        Self::new(WebhookConfig::default())
    }

    async fn post(
        &self,
        envelope: &Envelope,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<DeliveryReceipt> {
        let start_time = std::time::Instant::now();

        let body = json!({
            "event": envelope.event_name,
            "payload": envelope.payload,
        });

        let mut request = self.client.post(url).json(&body);

        for (key, value) in headers {
            if !is_managed_header(key) {
                request = request.header(key, value);
            }
        }

        request = request
            .header("X-Fanout-Envelope-Id", envelope.id.to_string())
            .header("X-Fanout-Attempt", envelope.attempt_count.to_string());

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(duration_ms = start_time.elapsed().as_millis(), "request failed: {e}");
                if e.is_timeout() {
                    return Err(DeliveryError::timeout(self.config.timeout.as_secs()));
                }
                if e.is_connect() {
                    return Err(DeliveryError::network(format!("connection failed: {e}")));
                }
                return Err(DeliveryError::network(e.to_string()));
            },
        };

        let duration = start_time.elapsed();
        let status_code = response.status().as_u16();
        let response_headers = extract_headers(response.headers());

        debug!(status = status_code, duration_ms = duration.as_millis(), "received response");

        match status_code {
            200..=299 => Ok(DeliveryReceipt::http(status_code, duration)),
            429 => Err(DeliveryError::rate_limited(extract_retry_after_seconds(
                &response_headers,
            ))),
            400..=499 => {
                let body = read_body(response).await;
                Err(DeliveryError::client(status_code, body))
            },
            _ => {
                let body = read_body(response).await;
                Err(DeliveryError::server(status_code, body))
            },
        }
    }
}

#[async_trait]
impl DeliveryAdapter for WebhookAdapter {
    fn kind(&self) -> TaskKind {
        TaskKind::WebhookNotify
    }

    async fn deliver(&self, envelope: &Envelope) -> Result<DeliveryReceipt> {
        let Destination::Webhook { url, headers } = &envelope.destination else {
            return Err(DeliveryError::configuration(format!(
                "webhook adapter cannot deliver to {:?}",
                envelope.destination.kind()
            )));
        };

        let span = info_span!(
            "webhook_delivery",
            envelope_id = %envelope.id,
            url = %url,
            attempt = envelope.attempt_count
        );

        self.post(envelope, url, headers).instrument(span).await
    }
}

/// Reads a response body for error context, truncated to keep error
/// values small.
async fn read_body(response: reqwest::Response) -> String {
    const MAX_BODY: usize = 1024;

    match response.bytes().await {
        Ok(bytes) if bytes.len() > MAX_BODY => {
            format!("{}... (truncated)", String::from_utf8_lossy(&bytes[..MAX_BODY]))
        },
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => format!("[failed to read response body: {e}]"),
    }
}

/// Extracts headers from a reqwest HeaderMap into a standard HashMap.
fn extract_headers(header_map: &HeaderMap) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    for (key, value) in header_map {
        if let Ok(value_str) = value.to_str() {
            headers.insert(key.to_string(), value_str.to_string());
        }
    }
    headers
}

/// Checks whether a header is managed by the transport and must not be
/// copied from caller-supplied headers.
fn is_managed_header(header_name: &str) -> bool {
    let lowercase = header_name.to_lowercase();
    matches!(
        lowercase.as_str(),
        "content-length"
            | "content-type"
            | "host"
            | "user-agent"
            | "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Extracts a retry-after delay from response headers.
///
/// Supports both seconds and HTTP-date formats. An unparseable header
/// falls back to a 60s default rather than being ignored.
fn extract_retry_after_seconds<S: std::hash::BuildHasher>(
    headers: &HashMap<String, String, S>,
) -> Option<u64> {
    const DEFAULT_RETRY_AFTER: u64 = 60;

    let retry_after = headers.get("retry-after").or_else(|| headers.get("Retry-After"))?;

    if let Ok(seconds) = retry_after.parse::<u64>() {
        return Some(seconds);
    }

    if let Ok(date_time) = chrono::DateTime::parse_from_rfc2822(retry_after) {
        let now = chrono::Utc::now();
        let retry_time = date_time.with_timezone(&chrono::Utc);

        if retry_time > now {
            if let Ok(duration) = retry_time.signed_duration_since(now).to_std() {
                return Some(duration.as_secs());
            }
        }
    }

    Some(DEFAULT_RETRY_AFTER)
}
