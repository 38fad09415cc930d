//! # Catalog model
//! Sources, processing receipts, candidates, releases, customer interests and
//! notification records. Plain data; persistence lives behind `store::Store`.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// How a source's listing is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// RSS or Atom feed.
    #[default]
    Feed,
    /// HTML index page; article links are discovered from markup.
    Page,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub kind: SourceKind,
    /// Park scope; candidates without an explicit park inherit it.
    #[serde(default)]
    pub park: Option<String>,
    pub poll_interval_secs: u64,
    pub active: bool,
    #[serde(default)]
    pub last_checked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Source {
    /// A source is due when it was never checked or its interval has elapsed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_checked_at {
            None => true,
            Some(ts) => {
                // Intervals past chrono's range saturate instead of panicking.
                let secs = i64::try_from(self.poll_interval_secs).unwrap_or(i64::MAX);
                let interval = Duration::try_seconds(secs).unwrap_or(Duration::MAX);
                now.signed_duration_since(ts) >= interval
            }
        }
    }
}

/// Idempotence marker: one per article URL ever examined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingReceipt {
    pub id: String,
    pub source_id: String,
    pub article_url: String,
    pub title: String,
    pub items_found: u32,
    pub processed_at: DateTime<Utc>,
}

/// Transient output of one extraction, consumed by the canonicalizer.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReleaseCandidate {
    pub title: String,
    pub description: String,
    pub park: Option<String>,
    pub category: Option<String>,
    pub price_estimate: Option<f64>,
    pub limited_edition: bool,
    pub image_url: String,
    pub source_url: String,
    pub raw_content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
    ComingSoon,
}

impl std::str::FromStr for ReleaseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "coming_soon" | "coming-soon" => Ok(Self::ComingSoon),
            other => Err(format!("unknown release status: {other}")),
        }
    }
}

/// Customer-facing catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
    pub id: String,
    pub title: String,
    pub canonical_name: String,
    pub description: String,
    pub image_url: String,
    #[serde(default)]
    pub original_image_url: Option<String>,
    pub park: Option<String>,
    pub category: Option<String>,
    pub price_estimate: Option<f64>,
    #[serde(default)]
    pub limited_edition: bool,
    pub status: ReleaseStatus,
    /// Back-reference to the surviving release when this row was merged.
    #[serde(default)]
    pub merged_into_id: Option<String>,
    #[serde(default)]
    pub source_url: String,
    pub created_at: DateTime<Utc>,
}

impl Release {
    pub fn is_merged(&self) -> bool {
        self.merged_into_id.is_some()
    }

    /// Take a newly resolved image. `image_url` may be replaced, but an
    /// existing `original_image_url` is kept as-is. Returns true on change.
    pub fn upgrade_image(&mut self, url: &str) -> bool {
        let url = url.trim();
        if url.is_empty() {
            return false;
        }
        let mut changed = false;
        if self.original_image_url.is_none() {
            self.original_image_url = Some(url.to_string());
            changed = true;
        }
        if self.image_url.is_empty() {
            self.image_url = url.to_string();
            changed = true;
        }
        changed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerInterest {
    pub id: String,
    pub customer_id: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub park: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default = "default_notify")]
    pub notify: bool,
}

fn default_notify() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub release_id: String,
    pub customer_id: String,
    pub sent_at: DateTime<Utc>,
}

/// Normalize a park/category label: trim, lowercase, collapse inner whitespace.
/// Blank input becomes `None`.
pub fn normalize_label(raw: Option<&str>) -> Option<String> {
    let s = raw?;
    let joined = s.split_whitespace().collect::<Vec<_>>().join(" ");
    if joined.is_empty() {
        None
    } else {
        Some(joined.to_lowercase())
    }
}
