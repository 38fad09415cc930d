// src/ingest/mod.rs
//! Listing ingestion: turn a source's feed or index page into article references,
//! and article HTML into readable text for the extractor.

pub mod feed;
pub mod page;
pub mod types;

use crate::fetch::FetchResponse;
use crate::model::{Source, SourceKind};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use once_cell::sync::OnceCell;
use scraper::{ElementRef, Html, Selector};
use std::collections::HashSet;

pub use types::ArticleRef;

/// One-time metrics registration (so series show up on /metrics).
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("pipeline_runs_total", "Processing runs started.");
        describe_counter!(
            "pipeline_sources_processed_total",
            "Sources polled successfully."
        );
        describe_counter!(
            "pipeline_articles_processed_total",
            "Articles examined by the extractor."
        );
        describe_counter!(
            "pipeline_releases_created_total",
            "Releases inserted by the canonicalizer."
        );
        describe_counter!(
            "pipeline_releases_merged_total",
            "Candidates merged into an existing release."
        );
        describe_counter!("pipeline_errors_total", "Errors recorded in run reports.");
        describe_counter!("fetch_requests_total", "Outbound fetches by route.");
        describe_counter!(
            "fetch_proxy_fallbacks_total",
            "Blocked fetches routed through the fetch proxy."
        );
        describe_counter!(
            "extract_schema_violations_total",
            "Inference items dropped by schema validation."
        );
        describe_counter!("notify_sent_total", "Customer notifications delivered.");
        describe_counter!("notify_failed_total", "Customer notification send failures.");
        describe_histogram!("pipeline_run_ms", "Processing run duration in milliseconds.");
        describe_histogram!("ingest_parse_ms", "Feed parse duration in milliseconds.");
        describe_gauge!(
            "pipeline_last_run_ts",
            "Unix ts when the processing run last finished."
        );
    });
}

/// Normalize short text (titles, link text): decode entities, strip tags,
/// ASCII quotes, collapse whitespace, drop trailing sentence punctuation.
pub fn normalize_text(s: &str) -> String {
    // 1) HTML entity decode
    let mut out = html_escape::decode_html_entities(s).to_string();

    // 2) Strip HTML tags
    static RE_TAGS: once_cell::sync::OnceCell<regex::Regex> = once_cell::sync::OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| regex::Regex::new(r"(?is)</?[^>]+>").expect("tag regex"));
    out = re_tags.replace_all(&out, "").to_string();

    // 3) Normalize “ ” ‘ ’ « » to ASCII quotes
    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    // 4) Collapse whitespace
    static RE_WS: once_cell::sync::OnceCell<regex::Regex> = once_cell::sync::OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| regex::Regex::new(r"\s+").expect("ws regex"));
    out = re_ws.replace_all(&out, " ").to_string();
    out = out.trim().to_string();

    // 5) Strip trailing sentence punctuation (keep quotes)
    while let Some(last) = out.chars().last() {
        if matches!(last, '!' | '?' | '.' | ',') || last.is_whitespace() {
            out.pop();
        } else {
            break;
        }
    }

    // 6) Length cap: 1500 chars
    if out.chars().count() > 1500 {
        out = out.chars().take(1500).collect();
    }

    out
}

/// Parse a fetched listing according to the source kind.
pub fn parse_listing(source: &Source, resp: &FetchResponse) -> anyhow::Result<Vec<ArticleRef>> {
    let base = if resp.url.is_empty() {
        source.url.as_str()
    } else {
        resp.url.as_str()
    };
    let items = match source.kind {
        SourceKind::Feed => feed::parse_feed(&resp.body)?,
        SourceKind::Page => page::discover_articles(&resp.body, base)?,
    };
    Ok(dedup_by_url(items))
}

fn dedup_by_url(items: Vec<ArticleRef>) -> Vec<ArticleRef> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|a| !a.url.is_empty() && seen.insert(a.url.clone()))
        .collect()
}

/// Reduce article HTML to readable text for the inference call.
///
/// Prefers the main/article container, skips script/style/nav chrome, collapses
/// whitespace and caps the result at `max_chars`. Plain text passes through.
pub fn article_text(html: &str, max_chars: usize) -> String {
    let doc = Html::parse_document(html);

    let containers = [
        "article",
        "main",
        "[role='main']",
        ".entry-content",
        ".post-content",
        "#content",
        "body",
    ];
    let root = containers.iter().find_map(|sel| {
        Selector::parse(sel)
            .ok()
            .and_then(|s| doc.select(&s).next())
    });

    let mut buf = String::new();
    match root {
        Some(el) => collect_text(el, &mut buf),
        None => buf.push_str(html),
    }

    let collapsed = buf.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() > max_chars {
        collapsed.chars().take(max_chars).collect()
    } else {
        collapsed
    }
}

fn collect_text(el: ElementRef<'_>, out: &mut String) {
    const SKIP: [&str; 8] = [
        "script", "style", "noscript", "nav", "header", "footer", "aside", "form",
    ];
    for child in el.children() {
        if let Some(child_el) = ElementRef::wrap(child) {
            if SKIP.contains(&child_el.value().name()) {
                continue;
            }
            collect_text(child_el, out);
        } else if let Some(text) = child.value().as_text() {
            out.push_str(text);
            out.push(' ');
        }
    }
}
