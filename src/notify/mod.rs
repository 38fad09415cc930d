// src/notify/mod.rs
//! Customer notifications for approved releases.
//!
//! The dispatcher records a notification before sending it, so a customer is
//! told about a release at most once even when dispatches overlap or a send
//! fails halfway.

pub mod matcher;
pub mod webhook;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::{NotifyError, StoreError};
use crate::model::{NotificationRecord, Release};
use crate::store::Store;

pub use matcher::{eligible_customers, match_interest, MatchedCustomer};
pub use webhook::WebhookNotifier;

pub const ENV_NOTIFY_WEBHOOK_URL: &str = "NOTIFY_WEBHOOK_URL";

/// What a customer is told about a release.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReleaseNotice {
    pub release_id: String,
    pub title: String,
    pub description: String,
    pub image_url: String,
    pub park: Option<String>,
    pub category: Option<String>,
    pub price_estimate: Option<f64>,
    pub limited_edition: bool,
}

impl From<&Release> for ReleaseNotice {
    fn from(r: &Release) -> Self {
        Self {
            release_id: r.id.clone(),
            title: r.title.clone(),
            description: r.description.clone(),
            image_url: r.image_url.clone(),
            park: r.park.clone(),
            category: r.category.clone(),
            price_estimate: r.price_estimate,
            limited_edition: r.limited_edition,
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, customer_id: &str, score: u8, notice: &ReleaseNotice) -> Result<(), NotifyError>;
    fn name(&self) -> &'static str;
}

pub type DynNotifier = Arc<dyn Notifier>;

/// Logs instead of sending; used when no webhook is configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, customer_id: &str, score: u8, notice: &ReleaseNotice) -> Result<(), NotifyError> {
        tracing::info!(
            target: "notify",
            customer_id,
            score,
            release_id = %notice.release_id,
            title = %notice.title,
            "notification (log only)"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

/// Webhook when `NOTIFY_WEBHOOK_URL` is set, log-only otherwise.
pub fn notifier_from_env() -> DynNotifier {
    match std::env::var(ENV_NOTIFY_WEBHOOK_URL) {
        Ok(url) if !url.trim().is_empty() => Arc::new(WebhookNotifier::new(url.trim().to_string())),
        _ => Arc::new(LogNotifier),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub release_id: String,
    pub matched: usize,
    pub sent: usize,
    pub failed: usize,
    /// Lost the record insert to a concurrent dispatch.
    pub skipped: usize,
    pub cancelled: bool,
}

pub struct NotificationDispatcher {
    store: Arc<dyn Store>,
    notifier: DynNotifier,
}

impl NotificationDispatcher {
    pub fn new(store: Arc<dyn Store>, notifier: DynNotifier) -> Self {
        Self { store, notifier }
    }

    pub async fn dispatch(
        &self,
        release_id: &str,
        cancel: &CancellationToken,
    ) -> Result<DispatchReport, NotifyError> {
        let matches = eligible_customers(self.store.as_ref(), release_id).await?;
        let release = self
            .store
            .get_release(release_id)
            .await?
            .ok_or_else(|| StoreError::not_found("release", release_id))?;
        let notice = ReleaseNotice::from(&release);

        let mut report = DispatchReport {
            release_id: release_id.to_string(),
            matched: matches.len(),
            ..Default::default()
        };

        for m in matches {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let record = NotificationRecord {
                release_id: release_id.to_string(),
                customer_id: m.customer_id.clone(),
                sent_at: Utc::now(),
            };
            if !self.store.insert_notification(record).await? {
                report.skipped += 1;
                continue;
            }
            match self.notifier.send(&m.customer_id, m.score, &notice).await {
                Ok(()) => {
                    report.sent += 1;
                    counter!("notify_sent_total", "notifier" => self.notifier.name()).increment(1);
                }
                Err(e) => {
                    // The record stays; the customer is not retried.
                    report.failed += 1;
                    counter!("notify_failed_total", "notifier" => self.notifier.name()).increment(1);
                    tracing::warn!(target: "notify", customer_id = %m.customer_id, %release_id, error = %e, "send failed");
                }
            }
        }

        tracing::info!(
            target: "notify",
            %release_id,
            matched = report.matched,
            sent = report.sent,
            failed = report.failed,
            skipped = report.skipped,
            cancelled = report.cancelled,
            "dispatch finished"
        );
        Ok(report)
    }
}
