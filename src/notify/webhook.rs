use super::{Notifier, ReleaseNotice};
use crate::error::NotifyError;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;

/// JSON POST per customer to a single webhook (the storefront's mailer picks it up).
#[derive(Clone)]
pub struct WebhookNotifier {
    url: String,
    client: Client,
    timeout: Duration,
    max_retries: u8,
    backoff_base_ms: u64,
}

impl WebhookNotifier {
    pub fn new(url: String) -> Self {
        Self {
            url,
            client: Client::new(),
            timeout: Duration::from_secs(5),
            max_retries: 3,
            backoff_base_ms: 500,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }

    pub fn with_retries(mut self, retries: u8) -> Self {
        self.max_retries = retries.max(1);
        self
    }

    /// Shorter backoff for tests.
    pub fn with_backoff_ms(mut self, base_ms: u64) -> Self {
        self.backoff_base_ms = base_ms;
        self
    }

    fn backoff(&self, attempt: u8) -> Duration {
        Duration::from_millis(self.backoff_base_ms << (attempt - 1).min(6))
    }
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    event: &'static str,
    customer_id: &'a str,
    score: u8,
    release: &'a ReleaseNotice,
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, customer_id: &str, score: u8, notice: &ReleaseNotice) -> Result<(), NotifyError> {
        let payload = WebhookPayload {
            event: "release.approved",
            customer_id,
            score,
            release: notice,
        };

        let mut attempt: u8 = 0;
        loop {
            attempt += 1;
            let res = self
                .client
                .post(&self.url)
                .timeout(self.timeout)
                .json(&payload)
                .send()
                .await;

            // Hook URLs embed their token in the path; keep it out of the message.
            let failure = match res {
                Ok(rsp) => match rsp.error_for_status_ref() {
                    Ok(_) => return Ok(()),
                    Err(e) => format!("webhook HTTP error: {}", e.without_url()),
                },
                Err(e) => format!("webhook request failed: {}", e.without_url()),
            };
            if attempt < self.max_retries {
                tokio::time::sleep(self.backoff(attempt)).await;
                continue;
            }
            return Err(NotifyError::Send {
                customer_id: customer_id.to_string(),
                message: failure,
            });
        }
    }

    fn name(&self) -> &'static str {
        "webhook"
    }
}
