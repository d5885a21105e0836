//! Mail gateway abstraction.
//!
//! The dispatcher hands fully rendered messages to a [`MailGateway`]; gateways
//! do no templating of their own.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::Result;

/// A rendered message ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboundEmail {
    pub to: String,
    pub subject: String,
    pub html: String,
}

/// Identifier the gateway assigned to an accepted message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryId(pub String);

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Trait for delivering rendered email.
///
/// # Example
/// ```ignore
/// let gateway = ResendMailGateway::new(MailConfig::default());
/// let id = gateway.send(&email).await?;
/// ```
#[async_trait]
pub trait MailGateway: Send + Sync {
    /// Deliver `email`, returning the gateway's id for it.
    ///
    /// # Errors
    /// Returns a `DependencyFailure` if the gateway is unreachable, times out
    /// or refuses the message.
    async fn send(&self, email: &OutboundEmail) -> Result<DeliveryId>;
}

/// Connection settings for the Resend HTTP API.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MailConfig {
    /// Bearer token; sending fails while unset
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    /// `From:` header, e.g. `Name <address>`
    pub from: String,
    pub endpoint: String,
    pub timeout_ms: u64,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            from: "BnM ILI 2026 <onboarding@resend.dev>".to_string(),
            endpoint: "https://api.resend.com/emails".to_string(),
            timeout_ms: 10_000,
        }
    }
}

impl fmt::Debug for MailConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MailConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("from", &self.from)
            .field("endpoint", &self.endpoint)
            .field("timeout_ms", &self.timeout_ms)
            .finish()
    }
}

// ============================================================================
// Production Implementation using reqwest
// ============================================================================

#[derive(Serialize)]
struct ResendPayload<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    html: &'a str,
}

#[derive(Deserialize)]
struct ResendResponse {
    id: String,
}

/// Mail gateway backed by the Resend HTTP API.
#[derive(Clone)]
pub struct ResendMailGateway {
    client: reqwest::Client,
    config: MailConfig,
}

impl ResendMailGateway {
    pub fn new(config: MailConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    pub fn config(&self) -> &MailConfig {
        &self.config
    }
}

#[async_trait]
impl MailGateway for ResendMailGateway {
    #[tracing::instrument(skip(self, email), fields(to = %email.to, subject = %email.subject))]
    async fn send(&self, email: &OutboundEmail) -> Result<DeliveryId> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .filter(|key| !key.is_empty())
            .ok_or_else(|| anyhow!("mail gateway has no API key configured"))?;

        let payload = ResendPayload {
            from: &self.config.from,
            to: [email.to.as_str()],
            subject: &email.subject,
            html: &email.html,
        };

        let response = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(api_key)
            .timeout(Duration::from_millis(self.config.timeout_ms))
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(endpoint = %self.config.endpoint, error = %e, "Mail request failed");
                e
            })
            .context("Failed to reach mail gateway")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("mail gateway returned {}: {}", status.as_u16(), body).into());
        }

        let accepted: ResendResponse = response
            .json()
            .await
            .context("Failed to decode mail gateway response")?;

        tracing::debug!(delivery_id = %accepted.id, "Mail accepted by gateway");
        Ok(DeliveryId(accepted.id))
    }
}

// ============================================================================
// Test/Mock Implementation
// ============================================================================

/// Mock mail gateway for testing.
///
/// Queued responses are returned in FIFO order; once the queue is empty every
/// send succeeds with a generated id. Every call is recorded.
///
/// # Example
/// ```ignore
/// let mock = MockMailGateway::new();
/// mock.add_response(Err(anyhow::anyhow!("gateway down").into()));
/// ```
#[derive(Clone, Default)]
pub struct MockMailGateway {
    responses: Arc<Mutex<VecDeque<MockResponse>>>,
    calls: Arc<Mutex<Vec<OutboundEmail>>>,
    in_flight: Arc<AtomicUsize>,
}

enum MockResponse {
    Immediate(Result<DeliveryId>),
    /// Waits for the trigger (sent or dropped) before answering
    Triggered {
        response: Result<DeliveryId>,
        trigger: oneshot::Receiver<()>,
    },
}

impl MockMailGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the response for the next unanswered send.
    pub fn add_response(&self, response: Result<DeliveryId>) {
        self.responses
            .lock()
            .push_back(MockResponse::Immediate(response));
    }

    /// Queue a response that is held back until the returned sender fires.
    pub fn add_response_with_trigger(&self, response: Result<DeliveryId>) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.responses.lock().push_back(MockResponse::Triggered {
            response,
            trigger: rx,
        });
        tx
    }

    pub fn get_calls(&self) -> Vec<OutboundEmail> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Sends currently waiting on a trigger.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MailGateway for MockMailGateway {
    async fn send(&self, email: &OutboundEmail) -> Result<DeliveryId> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let _guard = InFlightGuard {
            in_flight: self.in_flight.clone(),
        };

        let call_number = {
            let mut calls = self.calls.lock();
            calls.push(email.clone());
            calls.len()
        };

        let queued = self.responses.lock().pop_front();
        match queued {
            Some(MockResponse::Immediate(response)) => response,
            Some(MockResponse::Triggered { response, trigger }) => {
                let _ = trigger.await;
                response
            }
            None => Ok(DeliveryId(format!("mock-{}", call_number))),
        }
    }
}

/// Decrements the in-flight counter even if the send is cancelled.
struct InFlightGuard {
    in_flight: Arc<AtomicUsize>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
