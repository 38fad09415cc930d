// src/pipeline/mod.rs
//! Processing run coordinator: sources -> articles -> candidates -> catalog.
//!
//! Sources run with bounded parallelism. A fetch or extraction problem is
//! recorded and the run moves on; an unreachable store aborts the whole run.

pub mod scheduler;

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use metrics::{counter, gauge, histogram};
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use crate::config::pipeline::RunSection;
use crate::config::{AiConfig, PipelineConfig};
use crate::dedup::{Canonicalizer, DedupOutcome, DedupPolicy};
use crate::error::{DedupError, ExtractError, PipelineError, StoreError};
use crate::extract::{client_from_config, Article, DynInference, Extractor};
use crate::fetch::{url_tag, DynFetch, HttpFetcher, PolicyFetcher, ProxyFetcher};
use crate::images::ImageResolver;
use crate::ingest::{ensure_metrics_described, parse_listing, ArticleRef};
use crate::model::Source;
use crate::store::Store;

pub use scheduler::spawn_scheduler;

/// Upsert configured sources; polling state already in the store is kept.
pub async fn seed_sources(store: &dyn Store, cfg: &PipelineConfig) -> Result<usize, StoreError> {
    let rows = cfg.source_rows();
    let n = rows.len();
    for s in rows {
        store.upsert_source(s).await?;
    }
    tracing::info!(target: "pipeline", sources = n, "sources seeded");
    Ok(n)
}

/// Which sources a run covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunScope {
    /// Every active source that is due.
    All,
    /// One source, regardless of its cadence.
    Source(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub sources_processed: usize,
    pub sources_skipped: usize,
    pub articles_processed: usize,
    pub items_created: usize,
    pub items_merged: usize,
    pub errors: Vec<String>,
    pub aborted: bool,
    pub cancelled: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
}

#[derive(Debug, Default)]
struct SourceOutcome {
    processed: bool,
    skipped: bool,
    articles: usize,
    created: usize,
    merged: usize,
    errors: Vec<String>,
    aborted: bool,
}

impl SourceOutcome {
    fn error(&mut self, source: &Source, msg: impl std::fmt::Display) {
        self.errors.push(format!("{}: {msg}", source.id));
    }
}

pub struct RunCoordinator {
    store: Arc<dyn Store>,
    fetcher: DynFetch,
    extractor: Extractor,
    images: ImageResolver,
    canonicalizer: Canonicalizer,
    run_cfg: RunSection,
    run_lock: AsyncMutex<()>,
}

impl RunCoordinator {
    pub fn new(
        store: Arc<dyn Store>,
        fetcher: DynFetch,
        inference: DynInference,
        cfg: &PipelineConfig,
    ) -> Self {
        ensure_metrics_described();
        Self {
            extractor: Extractor::new(store.clone(), inference, cfg.run.max_content_chars),
            images: ImageResolver::new(fetcher.clone(), cfg.images.clone()),
            canonicalizer: Canonicalizer::new(store.clone(), DedupPolicy::from(&cfg.dedup)),
            store,
            fetcher,
            run_cfg: cfg.run.clone(),
            run_lock: AsyncMutex::new(()),
        }
    }

    /// Wire the production collaborators: direct HTTP, optional proxy, configured inference.
    pub fn from_config(
        store: Arc<dyn Store>,
        cfg: &PipelineConfig,
        ai: &AiConfig,
    ) -> anyhow::Result<Self> {
        let direct: DynFetch = Arc::new(HttpFetcher::new(&cfg.fetch)?);
        let proxy = ProxyFetcher::from_config(&cfg.proxy, &cfg.fetch).map(|p| Arc::new(p) as DynFetch);
        if proxy.is_none() && !cfg.fetch.blocked_domains.is_empty() {
            tracing::warn!(target: "pipeline", "blocked_domains configured but no fetch proxy available");
        }
        let fetcher: DynFetch = Arc::new(PolicyFetcher::new(
            direct,
            proxy,
            cfg.fetch.blocked_domains.clone(),
        ));
        Ok(Self::new(store, fetcher, client_from_config(ai), cfg))
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Run one processing pass. Runs are serialized; a second caller waits.
    pub async fn run(&self, scope: RunScope, cancel: &CancellationToken) -> Result<RunReport, PipelineError> {
        let _running = self.run_lock.lock().await;
        let t0 = Instant::now();
        counter!("pipeline_runs_total").increment(1);

        let mut report = RunReport {
            started_at: Some(Utc::now()),
            ..Default::default()
        };

        let sources = match self.select_sources(&scope, &mut report).await {
            Ok(s) => s,
            Err(PipelineError::Store(e)) => {
                report.aborted = true;
                report.errors.push(format!("store: {e}"));
                return Ok(self.finish(report, t0));
            }
            Err(e) => return Err(e),
        };

        // Child token: a store outage stops the remaining sources without
        // looking like an external cancel.
        let run_token = cancel.child_token();
        let ignore_cadence = matches!(scope, RunScope::Source(_));
        let outcomes: Vec<SourceOutcome> = stream::iter(sources)
            .map(|s| self.process_source(s, ignore_cadence, &run_token))
            .buffer_unordered(self.run_cfg.max_concurrent_sources.max(1))
            .collect()
            .await;

        for o in outcomes {
            report.sources_processed += usize::from(o.processed);
            report.sources_skipped += usize::from(o.skipped);
            report.articles_processed += o.articles;
            report.items_created += o.created;
            report.items_merged += o.merged;
            report.aborted |= o.aborted;
            report.errors.extend(o.errors);
        }
        report.cancelled = cancel.is_cancelled();
        Ok(self.finish(report, t0))
    }

    async fn select_sources(&self, scope: &RunScope, report: &mut RunReport) -> Result<Vec<Source>, PipelineError> {
        match scope {
            RunScope::Source(id) => {
                let source = self
                    .store
                    .get_source(id)
                    .await?
                    .ok_or_else(|| PipelineError::UnknownSource(id.clone()))?;
                if !source.active {
                    report.sources_skipped += 1;
                    return Ok(Vec::new());
                }
                Ok(vec![source])
            }
            RunScope::All => {
                let all = self.store.list_sources().await?;
                let (active, inactive): (Vec<_>, Vec<_>) = all.into_iter().partition(|s| s.active);
                report.sources_skipped += inactive.len();
                Ok(active)
            }
        }
    }

    fn finish(&self, mut report: RunReport, t0: Instant) -> RunReport {
        let ms = t0.elapsed().as_millis();
        report.duration_ms = u64::try_from(ms).unwrap_or(u64::MAX);
        histogram!("pipeline_run_ms").record(ms as f64);
        gauge!("pipeline_last_run_ts").set(Utc::now().timestamp() as f64);
        counter!("pipeline_errors_total").increment(report.errors.len() as u64);
        tracing::info!(
            target: "pipeline",
            processed = report.sources_processed,
            skipped = report.sources_skipped,
            articles = report.articles_processed,
            created = report.items_created,
            merged = report.items_merged,
            errors = report.errors.len(),
            aborted = report.aborted,
            cancelled = report.cancelled,
            ms = report.duration_ms,
            "processing run finished"
        );
        report
    }

    async fn process_source(&self, source: Source, ignore_cadence: bool, token: &CancellationToken) -> SourceOutcome {
        let mut out = SourceOutcome::default();
        if token.is_cancelled() {
            out.skipped = true;
            return out;
        }
        let now = Utc::now();
        if !ignore_cadence && !source.is_due(now) {
            tracing::debug!(target: "pipeline", source = %source.id, "not due");
            out.skipped = true;
            return out;
        }

        let listing = match self.fetcher.fetch(&source.url).await {
            Ok(resp) => parse_listing(&source, &resp).map_err(|e| format!("listing parse failed: {e:#}")),
            Err(e) => Err(e.to_string()),
        };
        let articles = match listing {
            Ok(a) => a,
            Err(msg) => {
                tracing::warn!(target: "pipeline", source = %source.id, error = %msg, "source failed");
                out.error(&source, &msg);
                out.skipped = true;
                self.record_attempt(&source, now, Some(msg), token, &mut out).await;
                return out;
            }
        };

        for article in articles.into_iter().take(self.run_cfg.max_articles_per_source) {
            if token.is_cancelled() {
                // Unreached articles have no receipt yet; leave the source due.
                tracing::info!(target: "pipeline", source = %source.id, "cancelled mid-source, not stamping as checked");
                out.skipped = true;
                return out;
            }
            if let Err(e) = self.process_article(&source, article, &mut out).await {
                tracing::error!(target: "pipeline", source = %source.id, error = %e, "store unavailable, aborting run");
                out.error(&source, format!("store: {e}"));
                out.aborted = true;
                token.cancel();
                return out;
            }
        }

        self.record_attempt(&source, now, None, token, &mut out).await;
        if !out.aborted {
            out.processed = true;
            counter!("pipeline_sources_processed_total").increment(1);
        }
        out
    }

    async fn record_attempt(
        &self,
        source: &Source,
        now: DateTime<Utc>,
        last_error: Option<String>,
        token: &CancellationToken,
        out: &mut SourceOutcome,
    ) {
        if let Err(e) = self.store.record_source_attempt(&source.id, now, last_error).await {
            out.error(source, format!("store: {e}"));
            out.aborted = true;
            token.cancel();
        }
    }

    /// Only store outages come back as `Err`; everything else lands in `out`.
    async fn process_article(
        &self,
        source: &Source,
        article: ArticleRef,
        out: &mut SourceOutcome,
    ) -> Result<(), StoreError> {
        if self.store.has_receipt(&article.url).await? {
            return Ok(());
        }

        let html = match self.fetcher.fetch(&article.url).await {
            Ok(resp) => resp.body,
            Err(e) if !article.inline_content.trim().is_empty() => {
                tracing::info!(target: "pipeline", url = %url_tag(&article.url), error = %e, "article fetch failed, using feed content");
                article.inline_content.clone()
            }
            Err(e) => {
                out.error(source, format!("article {}: {e}", article.url));
                return Ok(());
            }
        };

        let input = Article {
            source_id: source.id.clone(),
            url: article.url.clone(),
            title: article.title.clone(),
            html,
            park_scope: source.park.clone(),
        };
        let candidates = match self.extractor.extract(&input).await {
            Ok(c) => c,
            Err(ExtractError::Store(e)) => return Err(e),
            Err(e @ ExtractError::Malformed { .. }) => {
                out.articles += 1;
                counter!("pipeline_articles_processed_total").increment(1);
                out.error(source, e);
                return Ok(());
            }
            Err(e) => {
                out.error(source, e);
                return Ok(());
            }
        };
        out.articles += 1;
        counter!("pipeline_articles_processed_total").increment(1);
        if candidates.is_empty() {
            return Ok(());
        }

        let image = self
            .images
            .resolve(&input.html, &input.url)
            .await
            .into_iter()
            .next()
            .unwrap_or_default();

        for mut candidate in candidates {
            candidate.image_url = image.clone();
            match self.canonicalizer.canonicalize(candidate).await {
                Ok(DedupOutcome::Inserted(_)) => {
                    out.created += 1;
                    counter!("pipeline_releases_created_total").increment(1);
                }
                Ok(DedupOutcome::Merged(_)) => {
                    out.merged += 1;
                    counter!("pipeline_releases_merged_total").increment(1);
                }
                Err(DedupError::Store(e)) => return Err(e),
                Err(e) => out.error(source, e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;
    use crate::extract::inference::DisabledClient;
    use crate::fetch::{Fetch, FetchResponse};
    use crate::model::SourceKind;
    use crate::store::MemoryStore;
    use async_trait::async_trait;

    struct Offline;

    #[async_trait]
    impl Fetch for Offline {
        async fn fetch(&self, url: &str) -> Result<FetchResponse, FetchError> {
            Err(FetchError::Timeout { url: url.into() })
        }
    }

    fn source(id: &str, active: bool) -> Source {
        Source {
            id: id.into(),
            name: id.into(),
            url: format!("https://{id}.example/feed"),
            kind: SourceKind::Feed,
            park: None,
            poll_interval_secs: 3600,
            active,
            last_checked_at: None,
            last_error: None,
        }
    }

    #[tokio::test]
    async fn fetch_failure_is_recorded_and_run_continues() {
        let store = Arc::new(MemoryStore::new());
        store.upsert_source(source("a", true)).await.unwrap();
        store.upsert_source(source("b", true)).await.unwrap();
        store.upsert_source(source("off", false)).await.unwrap();
        let c = RunCoordinator::new(store.clone(), Arc::new(Offline), Arc::new(DisabledClient), &PipelineConfig::default());

        let report = c.run(RunScope::All, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.sources_processed, 0);
        assert_eq!(report.sources_skipped, 3);
        assert_eq!(report.errors.len(), 2);
        assert!(!report.aborted);

        let a = store.get_source("a").await.unwrap().unwrap();
        assert!(a.last_checked_at.is_some());
        assert!(a.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn unknown_scoped_source_is_an_error() {
        let store = Arc::new(MemoryStore::new());
        let c = RunCoordinator::new(store, Arc::new(Offline), Arc::new(DisabledClient), &PipelineConfig::default());
        assert!(matches!(
            c.run(RunScope::Source("nope".into()), &CancellationToken::new()).await,
            Err(PipelineError::UnknownSource(_))
        ));
    }

    #[tokio::test]
    async fn offline_store_aborts() {
        let store = Arc::new(MemoryStore::new());
        store.upsert_source(source("a", true)).await.unwrap();
        store.set_offline(true);
        let c = RunCoordinator::new(store, Arc::new(Offline), Arc::new(DisabledClient), &PipelineConfig::default());

        let report = c.run(RunScope::All, &CancellationToken::new()).await.unwrap();
        assert!(report.aborted);
        assert_eq!(report.sources_processed, 0);
    }

    #[tokio::test]
    async fn cancelled_token_skips_everything() {
        let store = Arc::new(MemoryStore::new());
        store.upsert_source(source("a", true)).await.unwrap();
        let c = RunCoordinator::new(store, Arc::new(Offline), Arc::new(DisabledClient), &PipelineConfig::default());
        let token = CancellationToken::new();
        token.cancel();

        let report = c.run(RunScope::All, &token).await.unwrap();
        assert!(report.cancelled);
        assert_eq!(report.sources_skipped, 1);
        assert!(report.errors.is_empty());
    }
}
