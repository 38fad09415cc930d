// src/ingest/types.rs
use chrono::{DateTime, Utc};

/// One article discovered in a source listing.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct ArticleRef {
    pub url: String,
    pub title: String, // normalized listing title
    pub published_at: Option<DateTime<Utc>>,
    /// Inline content carried by the feed (description / content:encoded), raw HTML.
    pub inline_content: String,
}
