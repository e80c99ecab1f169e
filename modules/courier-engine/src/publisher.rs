//! Message-bus sinks.

use std::time::Duration;

use async_trait::async_trait;
use courier_events::DomainEvent;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("sink rejected batch: {0}")]
    Rejected(String),

    #[error("publish timed out after {0:?}")]
    Timeout(Duration),
}

/// Delivers events to consumers. Delivery is at-least-once; consumers dedupe
/// on `event_id`.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &DomainEvent) -> Result<(), PublishError>;

    /// Publish in order, stopping at the first failure.
    async fn publish_batch(&self, events: &[DomainEvent]) -> Result<(), PublishError> {
        for event in events {
            self.publish(event).await?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// LogPublisher
// ---------------------------------------------------------------------------

/// Writes each event to the log. For local runs without a bus.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogPublisher;

#[async_trait]
impl EventPublisher for LogPublisher {
    async fn publish(&self, event: &DomainEvent) -> Result<(), PublishError> {
        info!(
            event_id = %event.event_id(),
            event_type = event.event_type(),
            tenant = event.tenant_id().unwrap_or_default(),
            aggregate = event.aggregate_id().unwrap_or_default(),
            "Published event"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// WebhookPublisher
// ---------------------------------------------------------------------------

/// POSTs batches as `{"events": [...]}` to a fixed URL. Any non-2xx response
/// fails the whole batch.
pub struct WebhookPublisher {
    client: reqwest::Client,
    url: String,
}

impl WebhookPublisher {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, PublishError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PublishError::Transport(e.to_string()))?;
        Ok(Self::with_client(client, url))
    }

    pub fn with_client(client: reqwest::Client, url: &str) -> Self {
        Self {
            client,
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl EventPublisher for WebhookPublisher {
    async fn publish(&self, event: &DomainEvent) -> Result<(), PublishError> {
        self.publish_batch(std::slice::from_ref(event)).await
    }

    async fn publish_batch(&self, events: &[DomainEvent]) -> Result<(), PublishError> {
        if events.is_empty() {
            return Ok(());
        }

        let body = serde_json::json!({ "events": events });
        let resp = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| PublishError::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(PublishError::Rejected(format!("{} {}", status.as_u16(), message)));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryPublisher
// ---------------------------------------------------------------------------

#[cfg(any(test, feature = "test-utils"))]
pub use memory::MemoryPublisher;

#[cfg(any(test, feature = "test-utils"))]
mod memory {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use courier_events::DomainEvent;

    use super::{EventPublisher, PublishError};

    /// Records what it publishes. Can be told to fail or stall.
    #[derive(Default)]
    pub struct MemoryPublisher {
        published: Mutex<Vec<DomainEvent>>,
        batch_calls: AtomicUsize,
        /// Remaining batches to fail. `usize::MAX` fails forever.
        failures: AtomicUsize,
        stall: Mutex<Option<Duration>>,
    }

    impl MemoryPublisher {
        pub fn new() -> Self {
            Self::default()
        }

        /// Fails every batch.
        pub fn failing() -> Self {
            let publisher = Self::new();
            publisher.fail_next(usize::MAX);
            publisher
        }

        /// Sleeps `delay` before every batch.
        pub fn stalling(delay: Duration) -> Self {
            let publisher = Self::new();
            *publisher.stall.lock().unwrap_or_else(|e| e.into_inner()) = Some(delay);
            publisher
        }

        pub fn fail_next(&self, batches: usize) {
            self.failures.store(batches, Ordering::SeqCst);
        }

        pub fn published(&self) -> Vec<DomainEvent> {
            self.published.lock().unwrap_or_else(|e| e.into_inner()).clone()
        }

        pub fn batch_calls(&self) -> usize {
            self.batch_calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EventPublisher for MemoryPublisher {
        async fn publish(&self, event: &DomainEvent) -> Result<(), PublishError> {
            self.publish_batch(std::slice::from_ref(event)).await
        }

        async fn publish_batch(&self, events: &[DomainEvent]) -> Result<(), PublishError> {
            self.batch_calls.fetch_add(1, Ordering::SeqCst);

            let stall = *self.stall.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(delay) = stall {
                tokio::time::sleep(delay).await;
            }

            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                    0 => None,
                    usize::MAX => Some(usize::MAX),
                    n => Some(n - 1),
                })
                .is_ok();
            if failing {
                return Err(PublishError::Transport("memory publisher set to fail".into()));
            }

            self.published
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .extend(events.iter().cloned());
            Ok(())
        }
    }
}
