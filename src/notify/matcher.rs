// src/notify/matcher.rs
//! Interest matching: which customers should hear about an approved release.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::NotifyError;
use crate::model::{normalize_label, CustomerInterest, Release, ReleaseStatus};
use crate::store::Store;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatchedCustomer {
    pub customer_id: String,
    /// Number of non-wildcard criteria (park, category, keywords) that matched.
    pub score: u8,
}

/// Score one interest against a release, `None` when it does not match.
///
/// Wildcards (no park, no category, no keywords) always pass but add nothing
/// to the score. Keywords match as case-insensitive substrings of the title
/// or description. Interests with notifications switched off never match.
pub fn match_interest(interest: &CustomerInterest, release: &Release) -> Option<u8> {
    if !interest.notify {
        return None;
    }
    let mut score = 0u8;

    if let Some(want) = normalize_label(interest.park.as_deref()) {
        if normalize_label(release.park.as_deref()).as_deref() != Some(want.as_str()) {
            return None;
        }
        score += 1;
    }

    if let Some(want) = normalize_label(interest.category.as_deref()) {
        if normalize_label(release.category.as_deref()).as_deref() != Some(want.as_str()) {
            return None;
        }
        score += 1;
    }

    let keywords: Vec<String> = interest
        .keywords
        .iter()
        .map(|k| k.trim().to_lowercase())
        .filter(|k| !k.is_empty())
        .collect();
    if !keywords.is_empty() {
        let title = release.title.to_lowercase();
        let description = release.description.to_lowercase();
        if !keywords
            .iter()
            .any(|k| title.contains(k.as_str()) || description.contains(k.as_str()))
        {
            return None;
        }
        score += 1;
    }

    Some(score)
}

/// Eligible customers for `release_id`, best score first, then by customer id.
///
/// Customers already notified about the release are left out. One entry per
/// customer, carrying their best-scoring interest.
pub async fn eligible_customers(
    store: &dyn Store,
    release_id: &str,
) -> Result<Vec<MatchedCustomer>, NotifyError> {
    let release = store
        .get_release(release_id)
        .await?
        .ok_or_else(|| crate::error::StoreError::not_found("release", release_id))?;
    if let Some(into) = &release.merged_into_id {
        return Err(NotifyError::Merged {
            id: release.id.clone(),
            into: into.clone(),
        });
    }
    if release.status != ReleaseStatus::Approved {
        return Err(NotifyError::NotApproved(release.id.clone()));
    }

    let mut best: BTreeMap<String, u8> = BTreeMap::new();
    for interest in store.list_interests().await? {
        if let Some(score) = match_interest(&interest, &release) {
            let slot = best.entry(interest.customer_id.clone()).or_insert(score);
            *slot = (*slot).max(score);
        }
    }

    let mut out = Vec::with_capacity(best.len());
    for (customer_id, score) in best {
        if store.has_notification(&release.id, &customer_id).await? {
            continue;
        }
        out.push(MatchedCustomer { customer_id, score });
    }
    out.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.customer_id.cmp(&b.customer_id)));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn release() -> Release {
        Release {
            id: "r1".into(),
            title: "Figment Popcorn Bucket".into(),
            canonical_name: "figmentpopcornbucket".into(),
            description: "Purple dragon returns for the festival".into(),
            image_url: String::new(),
            original_image_url: None,
            park: Some("epcot".into()),
            category: Some("popcorn buckets".into()),
            price_estimate: Some(25.0),
            limited_edition: true,
            status: ReleaseStatus::Approved,
            merged_into_id: None,
            source_url: String::new(),
            created_at: Utc::now(),
        }
    }

    fn interest(park: Option<&str>, category: Option<&str>, keywords: &[&str]) -> CustomerInterest {
        CustomerInterest {
            id: "i".into(),
            customer_id: "c".into(),
            category: category.map(str::to_string),
            park: park.map(str::to_string),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            notify: true,
        }
    }

    #[test]
    fn wildcards_match_with_zero_score() {
        assert_eq!(match_interest(&interest(None, None, &[]), &release()), Some(0));
    }

    #[test]
    fn every_specified_criterion_counts() {
        let i = interest(Some(" EPCOT "), Some("Popcorn Buckets"), &["DRAGON"]);
        assert_eq!(match_interest(&i, &release()), Some(3));
    }

    #[test]
    fn any_failed_criterion_rejects() {
        assert_eq!(match_interest(&interest(Some("magic kingdom"), None, &[]), &release()), None);
        assert_eq!(match_interest(&interest(None, Some("apparel"), &[]), &release()), None);
        assert_eq!(match_interest(&interest(None, None, &["loungefly"]), &release()), None);

        let mut muted = interest(None, None, &[]);
        muted.notify = false;
        assert_eq!(match_interest(&muted, &release()), None);
    }
}
