// src/store/memory.rs
//! In-process `Store` with optional JSON snapshot persistence.
//!
//! Single-instance deployments and tests use this directly; the snapshot file
//! is written atomically (tmp + rename) so a crash never leaves half a file.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ReleaseFilter, Store};
use crate::error::StoreError;
use crate::model::{
    CustomerInterest, NotificationRecord, ProcessingReceipt, Release, ReleaseStatus, Source,
};

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct Tables {
    sources: BTreeMap<String, Source>,
    /// Keyed by article URL.
    receipts: BTreeMap<String, ProcessingReceipt>,
    releases: BTreeMap<String, Release>,
    interests: BTreeMap<String, CustomerInterest>,
    notifications: Vec<NotificationRecord>,
    #[serde(skip)]
    notified_pairs: HashSet<(String, String)>,
}

impl Tables {
    fn reindex(&mut self) {
        self.notified_pairs = self
            .notifications
            .iter()
            .map(|n| (n.release_id.clone(), n.customer_id.clone()))
            .collect();
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Tables>,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the backing store going away (every call fails with `Unavailable`).
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store offline".into()));
        }
        self.inner
            .lock()
            .map_err(|_| StoreError::Unavailable("store mutex poisoned".into()))
    }

    /// Load a snapshot written by `save_snapshot`. Missing file → empty store.
    pub fn load_snapshot(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading store snapshot {}", path.display()))?;
        let mut tables: Tables = serde_json::from_str(&raw)
            .with_context(|| format!("parsing store snapshot {}", path.display()))?;
        tables.reindex();
        Ok(Self {
            inner: Mutex::new(tables),
            offline: AtomicBool::new(false),
        })
    }

    pub fn save_snapshot(&self, path: &Path) -> anyhow::Result<()> {
        let json = {
            let t = self.tables()?;
            serde_json::to_vec_pretty(&*t).context("serializing store snapshot")?
        };
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("creating {}", dir.display()))?;
            }
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, path).with_context(|| format!("renaming to {}", path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn list_sources(&self) -> Result<Vec<Source>, StoreError> {
        Ok(self.tables()?.sources.values().cloned().collect())
    }

    async fn get_source(&self, id: &str) -> Result<Option<Source>, StoreError> {
        Ok(self.tables()?.sources.get(id).cloned())
    }

    async fn upsert_source(&self, mut source: Source) -> Result<(), StoreError> {
        let mut t = self.tables()?;
        if let Some(existing) = t.sources.get(&source.id) {
            source.last_checked_at = existing.last_checked_at;
            source.last_error = existing.last_error.clone();
        }
        t.sources.insert(source.id.clone(), source);
        Ok(())
    }

    async fn record_source_attempt(
        &self,
        id: &str,
        checked_at: DateTime<Utc>,
        last_error: Option<String>,
    ) -> Result<(), StoreError> {
        let mut t = self.tables()?;
        let src = t
            .sources
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("source", id))?;
        src.last_checked_at = Some(checked_at);
        src.last_error = last_error;
        Ok(())
    }

    async fn has_receipt(&self, article_url: &str) -> Result<bool, StoreError> {
        Ok(self.tables()?.receipts.contains_key(article_url))
    }

    async fn insert_receipt(&self, receipt: ProcessingReceipt) -> Result<bool, StoreError> {
        let mut t = self.tables()?;
        if t.receipts.contains_key(&receipt.article_url) {
            return Ok(false);
        }
        t.receipts.insert(receipt.article_url.clone(), receipt);
        Ok(true)
    }

    async fn get_release(&self, id: &str) -> Result<Option<Release>, StoreError> {
        Ok(self.tables()?.releases.get(id).cloned())
    }

    async fn find_unmerged_by_canonical(
        &self,
        canonical_name: &str,
    ) -> Result<Option<Release>, StoreError> {
        Ok(self
            .tables()?
            .releases
            .values()
            .find(|r| !r.is_merged() && r.canonical_name == canonical_name)
            .cloned())
    }

    async fn find_by_canonical(&self, canonical_name: &str) -> Result<Vec<Release>, StoreError> {
        Ok(self
            .tables()?
            .releases
            .values()
            .filter(|r| r.canonical_name == canonical_name)
            .cloned()
            .collect())
    }

    async fn list_unmerged_in_park(&self, park: Option<&str>) -> Result<Vec<Release>, StoreError> {
        Ok(self
            .tables()?
            .releases
            .values()
            .filter(|r| !r.is_merged() && r.park.as_deref() == park)
            .cloned()
            .collect())
    }

    async fn list_releases(&self, filter: &ReleaseFilter) -> Result<Vec<Release>, StoreError> {
        let t = self.tables()?;
        let mut out: Vec<Release> = t
            .releases
            .values()
            .filter(|r| !r.is_merged())
            .filter(|r| filter.status.map_or(true, |s| r.status == s))
            .filter(|r| {
                filter
                    .park
                    .as_deref()
                    .map_or(true, |p| r.park.as_deref() == Some(p))
            })
            .cloned()
            .collect();
        // Newest first for the storefront.
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    async fn insert_release(&self, release: Release) -> Result<(), StoreError> {
        let mut t = self.tables()?;
        if t.releases.contains_key(&release.id) {
            return Err(StoreError::Conflict {
                entity: "release",
                key: release.id,
            });
        }
        if !release.is_merged()
            && t
                .releases
                .values()
                .any(|r| !r.is_merged() && r.canonical_name == release.canonical_name)
        {
            return Err(StoreError::Conflict {
                entity: "release",
                key: release.canonical_name,
            });
        }
        t.releases.insert(release.id.clone(), release);
        Ok(())
    }

    async fn update_release(&self, release: Release) -> Result<(), StoreError> {
        let mut t = self.tables()?;
        match t.releases.get_mut(&release.id) {
            Some(slot) => {
                *slot = release;
                Ok(())
            }
            None => Err(StoreError::not_found("release", release.id)),
        }
    }

    async fn set_release_status(&self, id: &str, status: ReleaseStatus) -> Result<(), StoreError> {
        let mut t = self.tables()?;
        let r = t
            .releases
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found("release", id))?;
        r.status = status;
        Ok(())
    }

    async fn list_interests(&self) -> Result<Vec<CustomerInterest>, StoreError> {
        Ok(self.tables()?.interests.values().cloned().collect())
    }

    async fn upsert_interest(&self, interest: CustomerInterest) -> Result<(), StoreError> {
        self.tables()?
            .interests
            .insert(interest.id.clone(), interest);
        Ok(())
    }

    async fn has_notification(
        &self,
        release_id: &str,
        customer_id: &str,
    ) -> Result<bool, StoreError> {
        Ok(self
            .tables()?
            .notified_pairs
            .contains(&(release_id.to_string(), customer_id.to_string())))
    }

    async fn insert_notification(&self, record: NotificationRecord) -> Result<bool, StoreError> {
        let mut t = self.tables()?;
        let key = (record.release_id.clone(), record.customer_id.clone());
        if !t.notified_pairs.insert(key) {
            return Ok(false);
        }
        t.notifications.push(record);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn rel(id: &str, canonical: &str, merged_into: Option<&str>) -> Release {
        Release {
            id: id.into(),
            title: canonical.into(),
            canonical_name: canonical.into(),
            description: String::new(),
            image_url: String::new(),
            original_image_url: None,
            park: Some("magic kingdom".into()),
            category: None,
            price_estimate: None,
            limited_edition: false,
            status: ReleaseStatus::Pending,
            merged_into_id: merged_into.map(str::to_string),
            source_url: String::new(),
            created_at: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn second_unmerged_release_with_same_name_conflicts() {
        let store = MemoryStore::new();
        store.insert_release(rel("a", "ears", None)).await.unwrap();
        let err = store.insert_release(rel("b", "ears", None)).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
        // Merged audit rows may share the name.
        store
            .insert_release(rel("c", "ears", Some("a")))
            .await
            .unwrap();
        assert_eq!(store.find_by_canonical("ears").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn receipts_and_notifications_are_unique() {
        let store = MemoryStore::new();
        let receipt = ProcessingReceipt {
            id: "1".into(),
            source_id: "s".into(),
            article_url: "https://blog.example/post".into(),
            title: "Post".into(),
            items_found: 0,
            processed_at: Utc::now(),
        };
        assert!(store.insert_receipt(receipt.clone()).await.unwrap());
        assert!(!store.insert_receipt(receipt).await.unwrap());

        let n = NotificationRecord {
            release_id: "a".into(),
            customer_id: "c1".into(),
            sent_at: Utc::now(),
        };
        assert!(store.insert_notification(n.clone()).await.unwrap());
        assert!(!store.insert_notification(n).await.unwrap());
        assert!(store.has_notification("a", "c1").await.unwrap());
    }

    #[tokio::test]
    async fn offline_store_reports_unavailable() {
        let store = MemoryStore::new();
        store.set_offline(true);
        let err = store.list_sources().await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }

    #[tokio::test]
    async fn snapshot_round_trip_keeps_notification_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/store.json");
        let store = MemoryStore::new();
        store.insert_release(rel("a", "ears", None)).await.unwrap();
        store
            .insert_notification(NotificationRecord {
                release_id: "a".into(),
                customer_id: "c1".into(),
                sent_at: Utc::now(),
            })
            .await
            .unwrap();
        store.save_snapshot(&path).unwrap();

        let loaded = MemoryStore::load_snapshot(&path).unwrap();
        assert!(loaded.get_release("a").await.unwrap().is_some());
        assert!(loaded.has_notification("a", "c1").await.unwrap());
    }
}
