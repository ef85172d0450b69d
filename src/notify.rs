//! Outbound notifications about ledger changes.
//!
//! Delivery is best effort: a failed notification is logged and never rolls
//! back or blocks the write that produced it.

use crate::domain::{Currency, Decimal, Generation, ParticipantId, ReconcileScope, RunStatus};
use async_trait::async_trait;
use backoff::future::retry;
use backoff::ExponentialBackoff;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerNotification {
    #[serde(rename_all = "camelCase")]
    EntryApplied {
        entry_id: String,
        event_id: String,
        beneficiary_id: ParticipantId,
        generation: Generation,
        amount: Decimal,
        currency: Currency,
    },
    #[serde(rename_all = "camelCase")]
    EntryQuarantined {
        entry_id: String,
        event_id: String,
        beneficiary_id: ParticipantId,
        run_id: String,
    },
    #[serde(rename_all = "camelCase")]
    ReconciliationCompleted {
        run_id: String,
        scope: ReconcileScope,
        status: RunStatus,
        issues: usize,
        actions: usize,
    },
}

#[derive(Debug, Clone, Error)]
pub enum NotifyError {
    #[error("network error: {0}")]
    Network(String),
    #[error("HTTP {0}")]
    Http(u16),
}

#[async_trait]
pub trait NotificationSink: Send + Sync + fmt::Debug {
    async fn notify(&self, notification: &LedgerNotification) -> Result<(), NotifyError>;
}

/// Send and log failure; callers never see the error.
pub async fn deliver(sink: &dyn NotificationSink, notification: &LedgerNotification) {
    if let Err(e) = sink.notify(notification).await {
        warn!(error = %e, ?notification, "Notification delivery failed");
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

#[async_trait]
impl NotificationSink for NoopSink {
    async fn notify(&self, _notification: &LedgerNotification) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// Keeps every notification in memory. Used by tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    sent: Mutex<Vec<LedgerNotification>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<LedgerNotification> {
        match self.sent.lock() {
            Ok(sent) => sent.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl NotificationSink for MemorySink {
    async fn notify(&self, notification: &LedgerNotification) -> Result<(), NotifyError> {
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(notification.clone());
        }
        Ok(())
    }
}

/// POSTs each notification as JSON to a fixed URL.
#[derive(Debug, Clone)]
pub struct WebhookSink {
    client: Client,
    url: String,
    max_elapsed: Duration,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
            max_elapsed: Duration::from_secs(30),
        }
    }

    pub fn with_max_elapsed(mut self, max_elapsed: Duration) -> Self {
        self.max_elapsed = max_elapsed;
        self
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    async fn notify(&self, notification: &LedgerNotification) -> Result<(), NotifyError> {
        let backoff = ExponentialBackoff {
            max_elapsed_time: Some(self.max_elapsed),
            ..Default::default()
        };

        retry(backoff, || async {
            let response = self
                .client
                .post(&self.url)
                .json(notification)
                .send()
                .await
                .map_err(|e| backoff::Error::transient(NotifyError::Network(e.to_string())))?;

            let status = response.status();
            if status == 429 || status.is_server_error() {
                return Err(backoff::Error::transient(NotifyError::Http(status.as_u16())));
            }
            if !status.is_success() {
                return Err(backoff::Error::permanent(NotifyError::Http(status.as_u16())));
            }

            debug!(url = %self.url, "Notification delivered");
            Ok(())
        })
        .await
    }
}
