// src/dedup/mod.rs
//! Canonicalizer: fold release candidates into the catalog without duplicates.
//!
//! Matching order: exact canonical name (global), then word-overlap against
//! unmerged releases of the same park, then insert. All of it runs under a
//! per-park async lock; the store's uniqueness on unmerged canonical names
//! catches the remaining cross-park race.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::config::pipeline::DedupSection;
use crate::error::{DedupError, StoreError};
use crate::model::{normalize_label, Release, ReleaseCandidate, ReleaseStatus};
use crate::store::Store;

/// Upper bound on `merged_into_id` hops before a chain is treated as a cycle.
const MAX_MERGE_HOPS: usize = 32;

/// Lowercase, alphanumerics only: "Mickey Mouse Spirit Jersey" -> "mickeymousespiritjersey".
pub fn canonical_name(title: &str) -> String {
    title
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Lowercased word set, ignoring tokens shorter than `min_len` characters.
pub fn tokens(title: &str, min_len: usize) -> HashSet<String> {
    title
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= min_len)
        .map(str::to_lowercase)
        .collect()
}

/// `|A ∩ B| / min(|A|, |B|)`; 0 when either side is empty.
pub fn overlap_ratio(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    let denom = a.len().min(b.len());
    if denom == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f32 / denom as f32
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DedupPolicy {
    pub threshold: f32,
    pub min_token_len: usize,
    pub audit_merged_rows: bool,
}

impl Default for DedupPolicy {
    fn default() -> Self {
        Self::from(&DedupSection::default())
    }
}

impl From<&DedupSection> for DedupPolicy {
    fn from(s: &DedupSection) -> Self {
        Self {
            threshold: s.threshold,
            min_token_len: s.min_token_len,
            audit_merged_rows: s.audit_merged_rows,
        }
    }
}

impl DedupPolicy {
    pub fn is_near_duplicate(&self, a: &str, b: &str) -> bool {
        let ta = tokens(a, self.min_token_len);
        let tb = tokens(b, self.min_token_len);
        overlap_ratio(&ta, &tb) >= self.threshold
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupOutcome {
    Inserted(String),
    /// Folded into the release with this (root) id.
    Merged(String),
}

impl DedupOutcome {
    pub fn release_id(&self) -> &str {
        match self {
            Self::Inserted(id) | Self::Merged(id) => id,
        }
    }
}

/// One async mutex per park; `None` is its own group.
#[derive(Default)]
pub struct ParkLocks {
    inner: Mutex<HashMap<Option<String>, Arc<AsyncMutex<()>>>>,
}

impl ParkLocks {
    pub async fn lock(&self, park: Option<&str>) -> OwnedMutexGuard<()> {
        let m = {
            let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            map.entry(park.map(str::to_string))
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        m.lock_owned().await
    }
}

pub struct Canonicalizer {
    store: Arc<dyn Store>,
    policy: DedupPolicy,
    locks: ParkLocks,
}

impl Canonicalizer {
    pub fn new(store: Arc<dyn Store>, policy: DedupPolicy) -> Self {
        Self {
            store,
            policy,
            locks: ParkLocks::default(),
        }
    }

    pub fn policy(&self) -> &DedupPolicy {
        &self.policy
    }

    pub async fn canonicalize(&self, candidate: ReleaseCandidate) -> Result<DedupOutcome, DedupError> {
        let canonical = canonical_name(&candidate.title);
        if canonical.is_empty() {
            return Err(DedupError::EmptyTitle(candidate.title));
        }
        let park = normalize_label(candidate.park.as_deref());
        let _guard = self.locks.lock(park.as_deref()).await;

        // 1) exact, any park
        if let Some(existing) = self.store.find_unmerged_by_canonical(&canonical).await? {
            tracing::debug!(target: "dedup", %canonical, into = %existing.id, "exact match");
            self.absorb(existing.clone(), &candidate).await?;
            return Ok(DedupOutcome::Merged(existing.id));
        }
        if let Some(audit) = self
            .store
            .find_by_canonical(&canonical)
            .await?
            .into_iter()
            .find(Release::is_merged)
        {
            let root = self.resolve_root(&audit.id).await?;
            tracing::debug!(target: "dedup", %canonical, into = %root.id, "exact match on merged row");
            self.absorb(root.clone(), &candidate).await?;
            return Ok(DedupOutcome::Merged(root.id));
        }

        // 2) fuzzy, same park
        let cand_tokens = tokens(&candidate.title, self.policy.min_token_len);
        let fuzzy_root = self
            .store
            .list_unmerged_in_park(park.as_deref())
            .await?
            .into_iter()
            .filter(|r| overlap_ratio(&cand_tokens, &tokens(&r.title, self.policy.min_token_len)) >= self.policy.threshold)
            .min_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        if let Some(root) = fuzzy_root {
            tracing::info!(target: "dedup", %canonical, into = %root.id, "fuzzy match");
            self.absorb(root.clone(), &candidate).await?;
            if self.policy.audit_merged_rows {
                let mut audit = new_release(&candidate, canonical, park);
                audit.merged_into_id = Some(root.id.clone());
                self.store.insert_release(audit).await?;
            }
            return Ok(DedupOutcome::Merged(root.id));
        }

        // 3) insert
        let release = new_release(&candidate, canonical.clone(), park);
        let id = release.id.clone();
        match self.store.insert_release(release).await {
            Ok(()) => {
                tracing::info!(target: "dedup", %canonical, %id, "release inserted");
                Ok(DedupOutcome::Inserted(id))
            }
            Err(StoreError::Conflict { .. }) => {
                // Lost a race with another park's lock holder.
                let winner = self
                    .store
                    .find_unmerged_by_canonical(&canonical)
                    .await?
                    .ok_or_else(|| StoreError::not_found("release", canonical.clone()))?;
                tracing::info!(target: "dedup", %canonical, into = %winner.id, "insert conflict, merged");
                self.absorb(winner.clone(), &candidate).await?;
                Ok(DedupOutcome::Merged(winner.id))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Follow `merged_into_id` to the surviving release.
    pub async fn resolve_root(&self, id: &str) -> Result<Release, DedupError> {
        let mut seen = HashSet::new();
        let mut current = id.to_string();
        for _ in 0..MAX_MERGE_HOPS {
            if !seen.insert(current.clone()) {
                break;
            }
            let r = self
                .store
                .get_release(&current)
                .await?
                .ok_or_else(|| StoreError::not_found("release", current.clone()))?;
            match &r.merged_into_id {
                None => return Ok(r),
                Some(next) => current = next.clone(),
            }
        }
        Err(DedupError::MergeCycle(id.to_string()))
    }

    /// Give the survivor an image and description it lacks.
    async fn absorb(&self, mut survivor: Release, candidate: &ReleaseCandidate) -> Result<(), DedupError> {
        let mut changed = survivor.upgrade_image(&candidate.image_url);
        if survivor.description.trim().is_empty() && !candidate.description.trim().is_empty() {
            survivor.description = candidate.description.clone();
            changed = true;
        }
        if changed {
            self.store.update_release(survivor).await?;
        }
        Ok(())
    }
}

fn new_release(c: &ReleaseCandidate, canonical_name: String, park: Option<String>) -> Release {
    let image = c.image_url.trim();
    Release {
        id: Uuid::new_v4().to_string(),
        title: c.title.clone(),
        canonical_name,
        description: c.description.clone(),
        image_url: image.to_string(),
        original_image_url: (!image.is_empty()).then(|| image.to_string()),
        park,
        category: normalize_label(c.category.as_deref()),
        price_estimate: c.price_estimate,
        limited_edition: c.limited_edition,
        status: ReleaseStatus::Pending,
        merged_into_id: None,
        source_url: c.source_url.clone(),
        created_at: Utc::now(),
    }
}
