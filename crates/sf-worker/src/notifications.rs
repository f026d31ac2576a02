//! Operator notifications.
//!
//! Attention events (an item failed, a part needs manual publishing, the
//! daily quota ran out) are POSTed as JSON to a configured webhook. All
//! notifications are fire-and-forget: errors are logged but never reach the
//! pipeline.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use sf_core::config::NotificationConfig;
use sf_core::events::{Event, EventCategory, EventPayload};

/// HTTP timeout for notification requests.
const NOTIFICATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Sends webhook notifications.
///
/// Holds a shared [`reqwest::Client`] so connections are reused across
/// calls.
pub struct NotificationManager {
    client: Client,
    webhook_url: String,
}

impl NotificationManager {
    /// Create a manager posting to `webhook_url`.
    pub fn new(webhook_url: impl Into<String>) -> Self {
        let client = Client::builder()
            .timeout(NOTIFICATION_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Failed to build notification HTTP client: {e}");
                Client::new()
            });

        Self {
            client,
            webhook_url: webhook_url.into(),
        }
    }

    /// Build a manager from config, or `None` when notifications are off.
    pub fn from_config(config: &NotificationConfig) -> Option<Self> {
        match (&config.enabled, &config.webhook_url) {
            (true, Some(url)) => Some(Self::new(url.clone())),
            _ => None,
        }
    }

    /// POST one event to the webhook.
    pub async fn notify(&self, event: &Event) {
        let body = serde_json::json!({
            "text": summary(&event.payload),
            "event": event,
        });

        match self.client.post(&self.webhook_url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => {
                tracing::debug!(event_id = %event.id, "Notification delivered");
            }
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                tracing::warn!(
                    status = %status,
                    body = %body,
                    "Notification webhook returned non-success status"
                );
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to deliver notification");
            }
        }
    }
}

/// One-line human summary of an event.
pub fn summary(payload: &EventPayload) -> String {
    match payload {
        EventPayload::ItemFailed { item_id, stage, error } => {
            format!("Item {item_id} failed in the {stage} stage: {error}")
        }
        EventPayload::ManualRequired {
            attempt_id,
            part_index,
            reason,
            ..
        } => format!("Part {part_index} needs manual publishing (attempt {attempt_id}): {reason}"),
        EventPayload::QuotaExhausted {
            platform,
            retry_after_secs,
        } => format!("Daily {platform} publish quota exhausted; resuming in {retry_after_secs}s"),
        other => format!("{other:?}"),
    }
}

/// Forward attention events to the webhook until cancelled.
///
/// Takes a receiver subscribed by the caller, so events published before
/// this task is first polled are still seen. Each delivery runs in its own
/// task; on cancel the events still queued are forwarded and every pending
/// delivery is awaited before returning.
pub async fn run_notifier(
    manager: Arc<NotificationManager>,
    mut rx: broadcast::Receiver<Event>,
    cancel: CancellationToken,
) {
    let mut deliveries = JoinSet::new();
    tracing::info!("Notifier started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(_) = deliveries.join_next(), if !deliveries.is_empty() => {}
            received = rx.recv() => match received {
                Ok(event) => forward(&manager, &mut deliveries, event),
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Notifier lagged behind the event bus");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    loop {
        match rx.try_recv() {
            Ok(event) => forward(&manager, &mut deliveries, event),
            Err(TryRecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "Notifier lagged behind the event bus");
            }
            Err(_) => break,
        }
    }

    let pending = deliveries.len();
    if pending > 0 {
        tracing::debug!(pending, "Waiting for notifications in flight");
    }
    while deliveries.join_next().await.is_some() {}

    tracing::info!("Notifier stopped");
}

fn forward(manager: &Arc<NotificationManager>, deliveries: &mut JoinSet<()>, event: Event) {
    if event.category != EventCategory::Attention {
        return;
    }
    let manager = manager.clone();
    deliveries.spawn(async move {
        manager.notify(&event).await;
    });
}
