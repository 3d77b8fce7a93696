//! HTTP transport for webhook calls.
//!
//! One call per attempt: the rule's method and URL, the JSON-encoded event as
//! the body, `Content-Type: application/json`, and `X-Webhook-Secret` when the
//! rule carries a secret. Any status in `[200, 300)` is success.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderName, HeaderValue, CONTENT_TYPE, USER_AGENT};

use super::DeliveryJob;
use crate::error::DispatchError;
use crate::models::HttpMethod;

/// Response bodies quoted in error messages are cut to this many bytes.
const ERROR_BODY_LIMIT: usize = 1024;

const SECRET_HEADER: HeaderName = HeaderName::from_static("x-webhook-secret");

/// Executes one webhook attempt for a job.
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    async fn deliver(&self, job: &DeliveryJob) -> Result<(), DispatchError>;
}

/// `reqwest`-backed transport.
pub struct WebhookClient {
    http: reqwest::Client,
    timeout: Duration,
}

impl WebhookClient {
    /// Build a client whose requests give up after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .timeout(timeout)
            // A redirect is a non-2xx answer and fails the attempt.
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { http, timeout })
    }
}

#[async_trait]
impl WebhookTransport for WebhookClient {
    async fn deliver(&self, job: &DeliveryJob) -> Result<(), DispatchError> {
        let body = serde_json::to_vec(&job.event)
            .map_err(|e| DispatchError::Request(format!("encode payload: {e}")))?;

        let mut req = self
            .http
            .request(method(job.method), &job.webhook_url)
            .header(CONTENT_TYPE, "application/json")
            .header(USER_AGENT, user_agent())
            .body(body);
        if let Some(secret) = job.secret_header.as_deref().filter(|s| !s.is_empty()) {
            let value = HeaderValue::from_str(secret)
                .map_err(|e| DispatchError::Request(format!("invalid secret header: {e}")))?;
            req = req.header(SECRET_HEADER, value);
        }

        let resp = req.send().await.map_err(|e| self.request_error(&e))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(DispatchError::Status {
            status: status.as_u16(),
            body: truncate(body, ERROR_BODY_LIMIT),
        })
    }
}

impl WebhookClient {
    fn request_error(&self, e: &reqwest::Error) -> DispatchError {
        if e.is_timeout() {
            DispatchError::Timeout(self.timeout)
        } else {
            DispatchError::Request(e.to_string())
        }
    }
}

fn method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
    }
}

fn user_agent() -> String {
    format!("hookgate-webhook/{}", env!("CARGO_PKG_VERSION"))
}

/// Cut `s` to at most `limit` bytes on a char boundary.
fn truncate(mut s: String, limit: usize) -> String {
    if s.len() > limit {
        let mut end = limit;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s.truncate(end);
    }
    s
}
