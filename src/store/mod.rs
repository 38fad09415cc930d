// src/store/mod.rs
//! Narrow interface to the relational store collaborator.
//!
//! The pipeline issues point reads/writes and range scans only. Uniqueness of
//! receipts (per article URL), unmerged releases (per canonical name) and
//! notification records (per release/customer pair) is enforced here, as the
//! final guard against concurrent writers.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::model::{
    CustomerInterest, NotificationRecord, ProcessingReceipt, Release, ReleaseStatus, Source,
};

pub use memory::MemoryStore;

/// Filter for customer-facing release listings (merged rows are always excluded).
#[derive(Debug, Clone, Default)]
pub struct ReleaseFilter {
    pub status: Option<ReleaseStatus>,
    pub park: Option<String>,
    pub limit: Option<usize>,
}

#[async_trait]
pub trait Store: Send + Sync {
    // --- sources ---
    async fn list_sources(&self) -> Result<Vec<Source>, StoreError>;
    async fn get_source(&self, id: &str) -> Result<Option<Source>, StoreError>;
    /// Insert or update configuration fields; keeps `last_checked_at`/`last_error`.
    async fn upsert_source(&self, source: Source) -> Result<(), StoreError>;
    /// Record the outcome of a polling attempt.
    async fn record_source_attempt(
        &self,
        id: &str,
        checked_at: DateTime<Utc>,
        last_error: Option<String>,
    ) -> Result<(), StoreError>;

    // --- receipts ---
    async fn has_receipt(&self, article_url: &str) -> Result<bool, StoreError>;
    /// Returns `false` when a receipt for the URL already exists.
    async fn insert_receipt(&self, receipt: ProcessingReceipt) -> Result<bool, StoreError>;

    // --- releases ---
    async fn get_release(&self, id: &str) -> Result<Option<Release>, StoreError>;
    async fn find_unmerged_by_canonical(
        &self,
        canonical_name: &str,
    ) -> Result<Option<Release>, StoreError>;
    /// All rows (merged or not) sharing a canonical name.
    async fn find_by_canonical(&self, canonical_name: &str) -> Result<Vec<Release>, StoreError>;
    async fn list_unmerged_in_park(&self, park: Option<&str>) -> Result<Vec<Release>, StoreError>;
    async fn list_releases(&self, filter: &ReleaseFilter) -> Result<Vec<Release>, StoreError>;
    /// Fails with `Conflict` if an unmerged release already owns the canonical name.
    async fn insert_release(&self, release: Release) -> Result<(), StoreError>;
    async fn update_release(&self, release: Release) -> Result<(), StoreError>;
    async fn set_release_status(&self, id: &str, status: ReleaseStatus) -> Result<(), StoreError>;

    // --- interests & notifications ---
    async fn list_interests(&self) -> Result<Vec<CustomerInterest>, StoreError>;
    async fn upsert_interest(&self, interest: CustomerInterest) -> Result<(), StoreError>;
    async fn has_notification(&self, release_id: &str, customer_id: &str)
        -> Result<bool, StoreError>;
    /// Returns `false` when the (release, customer) pair was already recorded.
    async fn insert_notification(&self, record: NotificationRecord) -> Result<bool, StoreError>;
}
