// src/ingest/page.rs
//! Article discovery on HTML index pages (sources without a feed).

use anyhow::{Context, Result};
use scraper::{Html, Selector};
use std::collections::HashSet;
use url::Url;

use super::normalize_text;
use super::types::ArticleRef;

const LINK_SELECTORS: [&str; 6] = [
    "article h2 a[href]",
    "article h3 a[href]",
    ".entry-title a[href]",
    ".post-title a[href]",
    "h2 a[href]",
    "h3 a[href]",
];

/// Links whose path looks like navigation rather than an article.
const NAV_PATH_PREFIXES: [&str; 5] = ["/tag/", "/category/", "/author/", "/page/", "/search"];

/// Collect same-host article links from an index page, in document order.
pub fn discover_articles(html: &str, base: &str) -> Result<Vec<ArticleRef>> {
    let base = Url::parse(base).with_context(|| format!("invalid listing url {base}"))?;
    let doc = Html::parse_document(html);

    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Vec::new();
    for sel in LINK_SELECTORS {
        let Ok(selector) = Selector::parse(sel) else {
            continue;
        };
        for a in doc.select(&selector) {
            let Some(href) = a.value().attr("href") else {
                continue;
            };
            let Ok(mut url) = base.join(href.trim()) else {
                continue;
            };
            if url.host_str() != base.host_str() || !matches!(url.scheme(), "http" | "https") {
                continue;
            }
            url.set_fragment(None);
            let path = url.path();
            if path == "/" || path == base.path() || NAV_PATH_PREFIXES.iter().any(|p| path.starts_with(p)) {
                continue;
            }
            let title = normalize_text(&a.text().collect::<String>());
            if title.is_empty() {
                continue;
            }
            let key = url.to_string();
            if seen.insert(key.clone()) {
                out.push(ArticleRef {
                    url: key,
                    title,
                    published_at: None,
                    inline_content: String::new(),
                });
            }
        }
    }
    Ok(out)
}
