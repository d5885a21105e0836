//! Requester notifications for lifecycle events.
//!
//! [`NotificationDispatcher`] consumes [`LifecycleEvent`]s after the fact. It
//! looks up the requester's profile, renders a subject and HTML body for the
//! new status, and delivers it through a [`MailGateway`] with bounded retries.
//! Nothing here can fail or delay a transition: the lifecycle engine only
//! pushes events onto a channel.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::domain::request::{LifecycleEvent, RequestStatus};
use crate::error::{BrieflowError, Result};
use crate::storage::ProfileStorage;

pub mod mail;

pub use mail::{
    DeliveryId, MailConfig, MailGateway, MockMailGateway, OutboundEmail, ResendMailGateway,
};

const REVISION_PLACEHOLDER: &str = "Please check the dashboard for details.";
const REJECTION_PLACEHOLDER: &str = "Please contact the admin for details.";

/// Retry and concurrency settings for delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Delivery attempts per notification, including the first
    pub max_attempts: u32,

    /// Base backoff duration in milliseconds (will be exponentially increased)
    pub backoff_ms: u64,

    /// Factor by which the backoff_ms is increased with each retry
    pub backoff_factor: u64,

    /// Maximum backoff time in milliseconds
    pub max_backoff_ms: u64,

    /// Deliveries allowed in flight at once
    pub max_concurrent_deliveries: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 500,
            backoff_factor: 2,
            max_backoff_ms: 10_000,
            max_concurrent_deliveries: 8,
        }
    }
}

impl DispatchConfig {
    /// Delay before retry number `retry` (0-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let ms = self
            .backoff_ms
            .saturating_mul(self.backoff_factor.saturating_pow(retry))
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// Subject and HTML body for one notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedNotification {
    pub subject: String,
    pub html: String,
}

/// What happened to one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered(DeliveryId),
    /// The requester has no profile or no e-mail address
    NoRecipient,
    /// Every attempt failed; the event is dropped
    Failed,
}

impl DispatchOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            DispatchOutcome::Delivered(_) => "delivered",
            DispatchOutcome::NoRecipient => "no_recipient",
            DispatchOutcome::Failed => "failed",
        }
    }
}

/// Render the notification for `event`, addressed to `recipient_name`.
pub fn render(event: &LifecycleEvent, recipient_name: &str) -> RenderedNotification {
    let title = escape_html(&event.project_title);
    let notes = event.notes.as_deref().map(str::trim).filter(|n| !n.is_empty());

    let (subject, content) = match event.to {
        RequestStatus::PendingApproval => (
            "Request Submitted Successfully".to_string(),
            format!(
                "Your request \"{}\" has been submitted and is awaiting approval.",
                title
            ),
        ),
        RequestStatus::InProgress => (
            "Request Approved - In Progress".to_string(),
            format!(
                "Great news! Your request \"{}\" has been approved and is now in progress.",
                title
            ),
        ),
        RequestStatus::RevisionNeeded => (
            "Revision Needed for Your Request".to_string(),
            format!(
                "Your request \"{}\" needs revision. Notes: {}",
                title,
                escape_html(notes.unwrap_or(REVISION_PLACEHOLDER))
            ),
        ),
        RequestStatus::Forwarded => {
            let division = event
                .forwarded_to
                .map(|d| format!("the {} ({}) division", d.display_name(), d.code()))
                .unwrap_or_else(|| "another division".to_string());
            (
                "Request Forwarded".to_string(),
                format!(
                    "Your request \"{}\" has been forwarded to {} for production.",
                    title, division
                ),
            )
        }
        RequestStatus::Completed => (
            "Request Completed".to_string(),
            format!(
                "Your request \"{}\" has been completed! You can download the final files from the dashboard.",
                title
            ),
        ),
        RequestStatus::Rejected => (
            "Request Rejected".to_string(),
            format!(
                "Unfortunately, your request \"{}\" has been rejected. Reason: {}",
                title,
                escape_html(notes.unwrap_or(REJECTION_PLACEHOLDER))
            ),
        ),
    };

    let html = format!(
        r#"<div style="font-family: Arial, sans-serif; max-width: 600px; margin: 0 auto;">
  <h1 style="color: #8B5CF6;">BnM Request System</h1>
  <h2>Hello {name},</h2>
  <p>{content}</p>
  <div style="margin: 30px 0; padding: 20px; background-color: #f3f4f6; border-radius: 8px;">
    <p style="margin: 0;"><strong>Project:</strong> {title}</p>
    <p style="margin: 10px 0 0 0;"><strong>Status:</strong> {status}</p>
  </div>
  <p>Please visit the dashboard to view more details.</p>
  <p style="color: #6b7280; font-size: 14px; margin-top: 40px;">
    Best regards,<br>
    Branding &amp; Marketing Division<br>
    Ini Lho ITS! 2026
  </p>
</div>"#,
        name = escape_html(recipient_name),
        content = content,
        title = title,
        status = event.to.label(),
    );

    RenderedNotification { subject, html }
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Turns lifecycle events into delivered e-mail.
pub struct NotificationDispatcher<P: ProfileStorage, M: MailGateway> {
    profiles: Arc<P>,
    mail: Arc<M>,
    config: DispatchConfig,
}

impl<P, M> NotificationDispatcher<P, M>
where
    P: ProfileStorage + 'static,
    M: MailGateway + 'static,
{
    pub fn new(profiles: Arc<P>, mail: Arc<M>) -> Self {
        Self {
            profiles,
            mail,
            config: DispatchConfig::default(),
        }
    }

    /// Set a custom dispatch configuration.
    pub fn with_config(mut self, config: DispatchConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Deliver the notification for one event.
    ///
    /// Never returns an error: failures are logged and reported in the outcome.
    #[tracing::instrument(skip(self, event), fields(request_id = %event.request_id, status = %event.to))]
    pub async fn dispatch(&self, event: &LifecycleEvent) -> DispatchOutcome {
        let outcome = match self.prepare(event).await {
            Ok(Some(email)) => match self.deliver(&email).await {
                Ok(id) => {
                    tracing::info!(delivery_id = %id, "Notification delivered");
                    DispatchOutcome::Delivered(id)
                }
                Err(e) => {
                    tracing::error!(error = %e, attempts = self.config.max_attempts, "Notification delivery failed, giving up");
                    DispatchOutcome::Failed
                }
            },
            Ok(None) => {
                tracing::warn!(requester = %event.requester, "Requester has no e-mail address, skipping notification");
                DispatchOutcome::NoRecipient
            }
            Err(BrieflowError::ProfileNotFound(id)) => {
                tracing::warn!(requester = %id, "Requester has no profile, skipping notification");
                DispatchOutcome::NoRecipient
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to prepare notification");
                DispatchOutcome::Failed
            }
        };

        counter!(
            "brieflow_notifications_total",
            "status" => event.to.as_str(),
            "outcome" => outcome.as_str()
        )
        .increment(1);
        outcome
    }

    async fn prepare(&self, event: &LifecycleEvent) -> Result<Option<OutboundEmail>> {
        let profile = self.profiles.get_profile(event.requester).await?;
        let Some(to) = profile
            .email
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
        else {
            return Ok(None);
        };

        let rendered = render(event, profile.display_name());
        Ok(Some(OutboundEmail {
            to: to.to_string(),
            subject: rendered.subject,
            html: rendered.html,
        }))
    }

    async fn deliver(&self, email: &OutboundEmail) -> Result<DeliveryId> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut retry = 0;
        loop {
            match self.mail.send(email).await {
                Ok(id) => return Ok(id),
                Err(e) if e.is_retryable() && retry + 1 < max_attempts => {
                    let delay = self.config.backoff(retry);
                    tracing::warn!(
                        error = %e,
                        attempt = retry + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Notification delivery failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Consume events from `events` until the channel closes or `shutdown`
    /// fires, delivering up to `max_concurrent_deliveries` at once.
    ///
    /// In-flight deliveries are allowed to finish before the task returns.
    /// Events still queued at shutdown are dropped.
    pub fn run(
        self: Arc<Self>,
        events: mpsc::UnboundedReceiver<LifecycleEvent>,
        shutdown: CancellationToken,
    ) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run_loop(events, shutdown))
    }

    async fn run_loop(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<LifecycleEvent>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_deliveries.max(1)));
        let mut join_set: JoinSet<DispatchOutcome> = JoinSet::new();

        tracing::info!(
            max_concurrent_deliveries = self.config.max_concurrent_deliveries,
            "Notification dispatcher started"
        );

        loop {
            while let Some(result) = join_set.try_join_next() {
                if let Err(join_error) = result {
                    tracing::error!(error = %join_error, "Notification task panicked");
                }
            }

            let event = tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Shutdown signal received, stopping notification dispatcher");
                    break;
                }
                event = events.recv() => match event {
                    Some(event) => event,
                    None => {
                        tracing::debug!("Event channel closed, stopping notification dispatcher");
                        break;
                    }
                },
            };

            let permit = tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::warn!(request_id = %event.request_id, "Shutdown while waiting for capacity, event dropped");
                    break;
                }
                permit = semaphore.clone().acquire_owned() => {
                    permit.context("Dispatch semaphore closed")?
                }
            };

            let dispatcher = self.clone();
            join_set.spawn(async move {
                let _permit = permit;
                dispatcher.dispatch(&event).await
            });
        }

        while let Some(result) = join_set.join_next().await {
            if let Err(join_error) = result {
                tracing::error!(error = %join_error, "Notification task panicked");
            }
        }
        Ok(())
    }
}
