// src/extract/mod.rs
//! Candidate extraction: one article in, zero or more validated release
//! candidates out, with the processing receipt written before returning.

pub mod inference;

use std::sync::Arc;

use chrono::Utc;
use metrics::counter;
use serde_json::Value;
use uuid::Uuid;

use crate::error::ExtractError;
use crate::fetch::url_tag;
use crate::ingest::article_text;
use crate::model::{normalize_label, ProcessingReceipt, ReleaseCandidate};
use crate::store::Store;

pub use inference::{client_from_config, DynInference, InferenceClient};

/// One article handed to the extractor.
#[derive(Debug, Clone)]
pub struct Article {
    pub source_id: String,
    pub url: String,
    /// Listing title, already normalized.
    pub title: String,
    /// Raw article HTML (or feed content when the article could not be fetched).
    pub html: String,
    /// Park scope of the source; used when an item names no park.
    pub park_scope: Option<String>,
}

/// Validation result for one inference item.
#[derive(Debug, Clone, PartialEq)]
pub enum CandidateVerdict {
    Valid(ReleaseCandidate),
    SchemaViolation(String),
}

/// Read an inference reply. `Err` means the reply as a whole is unusable;
/// otherwise every item gets a verdict, in order.
pub fn parse_inference_response(
    raw: &str,
    article_url: &str,
    park_scope: Option<&str>,
) -> Result<Vec<CandidateVerdict>, String> {
    let body = strip_code_fence(raw);
    let value: Value = serde_json::from_str(body).map_err(|e| format!("invalid json: {e}"))?;
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut obj) => match obj.remove("items") {
            Some(Value::Array(items)) => items,
            Some(_) => return Err("\"items\" is not an array".into()),
            None => return Err("missing \"items\"".into()),
        },
        _ => return Err("reply is neither an object nor an array".into()),
    };
    Ok(items
        .iter()
        .map(|item| validate_item(item, article_url, park_scope))
        .collect())
}

fn strip_code_fence(raw: &str) -> &str {
    let t = raw.trim();
    let Some(rest) = t.strip_prefix("```") else {
        return t;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

fn validate_item(item: &Value, article_url: &str, park_scope: Option<&str>) -> CandidateVerdict {
    use CandidateVerdict::SchemaViolation;

    let Some(obj) = item.as_object() else {
        return SchemaViolation("item is not an object".into());
    };
    let title = match obj.get("title") {
        Some(Value::String(s)) if !s.trim().is_empty() => s.split_whitespace().collect::<Vec<_>>().join(" "),
        Some(Value::String(_)) | None | Some(Value::Null) => {
            return SchemaViolation("missing title".into())
        }
        Some(_) => return SchemaViolation("title is not a string".into()),
    };
    let description = match opt_string(obj.get("description"), "description") {
        Ok(d) => d.unwrap_or_default(),
        Err(e) => return SchemaViolation(e),
    };
    let category = match opt_string(obj.get("category"), "category") {
        Ok(c) => normalize_label(c.as_deref()),
        Err(e) => return SchemaViolation(e),
    };
    let park = match opt_string(obj.get("park"), "park") {
        Ok(p) => normalize_label(p.as_deref()).or_else(|| normalize_label(park_scope)),
        Err(e) => return SchemaViolation(e),
    };
    let price_estimate = match obj.get("price") {
        None | Some(Value::Null) => None,
        Some(Value::Number(n)) => n.as_f64().filter(|p| p.is_finite() && *p >= 0.0),
        Some(Value::String(s)) => parse_price(s),
        Some(_) => return SchemaViolation("price is not a number".into()),
    };
    let limited_edition = match obj.get("limited_edition") {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(_) => return SchemaViolation("limited_edition is not a boolean".into()),
    };

    CandidateVerdict::Valid(ReleaseCandidate {
        title,
        description: description.trim().to_string(),
        park,
        category,
        price_estimate,
        limited_edition,
        image_url: String::new(),
        source_url: article_url.to_string(),
        raw_content: String::new(),
    })
}

fn opt_string(v: Option<&Value>, field: &str) -> Result<Option<String>, String> {
    match v {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(format!("{field} is not a string")),
    }
}

/// "$34.99", "34.99 USD", "1,299" -> number. Anything else is treated as unknown.
fn parse_price(s: &str) -> Option<f64> {
    let cleaned: String = s
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
        .filter(|c| *c != ',')
        .collect();
    cleaned.parse::<f64>().ok().filter(|p| p.is_finite())
}

fn build_prompt(article: &Article, text: &str) -> String {
    format!(
        "Title: {}\nURL: {}\nPark: {}\n\n{}",
        article.title,
        article.url,
        article.park_scope.as_deref().unwrap_or("unknown"),
        text
    )
}

pub struct Extractor {
    store: Arc<dyn Store>,
    inference: DynInference,
    max_content_chars: usize,
}

impl Extractor {
    pub fn new(store: Arc<dyn Store>, inference: DynInference, max_content_chars: usize) -> Self {
        Self {
            store,
            inference,
            max_content_chars,
        }
    }

    /// Extract candidates from one article.
    ///
    /// Already-processed articles yield nothing without an inference call. An
    /// inference failure writes no receipt, so the article is retried later.
    pub async fn extract(&self, article: &Article) -> Result<Vec<ReleaseCandidate>, ExtractError> {
        let tag = url_tag(&article.url);
        if self.store.has_receipt(&article.url).await? {
            tracing::debug!(target: "extract", url = %tag, "already processed");
            return Ok(Vec::new());
        }

        let text = article_text(&article.html, self.max_content_chars);
        let prompt = build_prompt(article, &text);

        let reply = self
            .inference
            .complete(&prompt)
            .await
            .map_err(|source| ExtractError::Inference {
                url: article.url.clone(),
                source,
            })?;

        let verdicts = match parse_inference_response(&reply, &article.url, article.park_scope.as_deref()) {
            Ok(v) => v,
            Err(reason) => {
                self.write_receipt(article, 0).await?;
                tracing::warn!(target: "extract", url = %tag, %reason, "malformed inference reply");
                return Err(ExtractError::Malformed {
                    url: article.url.clone(),
                    reason,
                });
            }
        };

        let mut candidates = Vec::with_capacity(verdicts.len());
        for v in verdicts {
            match v {
                CandidateVerdict::Valid(mut c) => {
                    c.raw_content = text.clone();
                    candidates.push(c);
                }
                CandidateVerdict::SchemaViolation(reason) => {
                    counter!("extract_schema_violations_total").increment(1);
                    tracing::info!(target: "extract", url = %tag, %reason, "dropping inference item");
                }
            }
        }

        if !self.write_receipt(article, candidates.len() as u32).await? {
            // Another worker got here first; its candidates win.
            return Ok(Vec::new());
        }
        tracing::info!(
            target: "extract",
            url = %tag,
            provider = self.inference.provider_name(),
            items = candidates.len(),
            "article processed"
        );
        Ok(candidates)
    }

    async fn write_receipt(&self, article: &Article, items_found: u32) -> Result<bool, ExtractError> {
        let receipt = ProcessingReceipt {
            id: Uuid::new_v4().to_string(),
            source_id: article.source_id.clone(),
            article_url: article.url.clone(),
            title: article.title.clone(),
            items_found,
            processed_at: Utc::now(),
        };
        Ok(self.store.insert_receipt(receipt).await?)
    }
}
