// src/images/mod.rs
//! Image resolution: candidate product photo URLs for an article.
//!
//! Content `<img>` tags come first, `og:image` / `twitter:image` after them.
//! When the given HTML yields nothing the article is fetched again through the
//! fetch policy (proxy included) and scanned once more.

use std::collections::HashSet;

use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::config::pipeline::ImageSection;
use crate::fetch::{url_tag, DynFetch};

/// Attributes lazy-loading plugins put the real source in.
const LAZY_ATTRS: [&str; 3] = ["data-src", "data-lazy-src", "data-original"];

/// Extract absolute, deduplicated image URLs from `html`, in priority order.
///
/// Returned URLs have their query string and fragment removed.
pub fn extract_image_urls(html: &str, article_url: &str, cfg: &ImageSection) -> Vec<String> {
    let Ok(base) = Url::parse(article_url) else {
        return Vec::new();
    };
    let doc = Html::parse_document(html);
    let mut out = Vec::new();
    let mut seen = HashSet::new();

    if let Ok(img_sel) = Selector::parse("img") {
        for img in doc.select(&img_sel) {
            if too_small(img, cfg.min_dimension) {
                continue;
            }
            if let Some(raw) = img_source(img) {
                push_candidate(&mut out, &mut seen, &base, &raw, cfg);
            }
        }
    }

    let meta = "meta[property='og:image'], meta[name='og:image'], meta[name='twitter:image'], meta[property='twitter:image']";
    if let Ok(meta_sel) = Selector::parse(meta) {
        for m in doc.select(&meta_sel) {
            if let Some(content) = m.value().attr("content") {
                push_candidate(&mut out, &mut seen, &base, content, cfg);
            }
        }
    }

    out
}

/// Preferred source of one `<img>`: largest srcset entry, then lazy attrs, then src.
fn img_source(img: ElementRef<'_>) -> Option<String> {
    let el = img.value();
    if let Some(best) = el.attr("srcset").and_then(largest_srcset_entry) {
        return Some(best);
    }
    LAZY_ATTRS
        .iter()
        .filter_map(|a| el.attr(a))
        .chain(el.attr("src"))
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

/// Pick the entry with the largest `w` / `x` descriptor. Entries without a
/// descriptor count as `1x`.
fn largest_srcset_entry(srcset: &str) -> Option<String> {
    srcset
        .split(',')
        .filter_map(|part| {
            let mut it = part.split_whitespace();
            let url = it.next()?;
            let weight = it
                .next()
                .and_then(|d| {
                    let unit_at = d.char_indices().last().map(|(i, _)| i)?;
                    let (num, unit) = d.split_at(unit_at);
                    let n: f64 = num.parse().ok()?;
                    match unit {
                        "w" => Some(n),
                        "x" => Some(n * 1000.0),
                        _ => None,
                    }
                })
                .unwrap_or(1000.0);
            Some((url.to_string(), weight))
        })
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(u, _)| u)
}

fn too_small(img: ElementRef<'_>, min_dimension: u32) -> bool {
    ["width", "height"].iter().any(|attr| {
        img.value()
            .attr(attr)
            .and_then(leading_number)
            .is_some_and(|n| n < min_dimension)
    })
}

/// Pixel hint from a width/height attribute; relative sizes (`50%`) say nothing.
fn leading_number(s: &str) -> Option<u32> {
    let s = s.trim();
    if s.ends_with('%') {
        return None;
    }
    let digits: String = s.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

fn push_candidate(
    out: &mut Vec<String>,
    seen: &mut HashSet<String>,
    base: &Url,
    raw: &str,
    cfg: &ImageSection,
) {
    let raw = raw.trim();
    if raw.is_empty() || raw.starts_with("data:") {
        return;
    }
    let Ok(mut url) = base.join(raw) else {
        return;
    };
    if !matches!(url.scheme(), "http" | "https") {
        return;
    }
    url.set_query(None);
    url.set_fragment(None);
    let s = url.to_string();
    let lower = s.to_ascii_lowercase();
    if cfg
        .denylist
        .iter()
        .any(|d| !d.is_empty() && lower.contains(&d.to_ascii_lowercase()))
    {
        return;
    }
    if seen.insert(s.clone()) {
        out.push(s);
    }
}

pub struct ImageResolver {
    fetcher: DynFetch,
    cfg: ImageSection,
}

impl ImageResolver {
    pub fn new(fetcher: DynFetch, cfg: ImageSection) -> Self {
        Self { fetcher, cfg }
    }

    /// Never fails: an unreachable article just yields no images.
    pub async fn resolve(&self, html: &str, article_url: &str) -> Vec<String> {
        let found = extract_image_urls(html, article_url, &self.cfg);
        if !found.is_empty() {
            return found;
        }

        match self.fetcher.fetch(article_url).await {
            Ok(resp) => {
                let found = extract_image_urls(&resp.body, article_url, &self.cfg);
                tracing::debug!(
                    target: "images",
                    url = %url_tag(article_url),
                    via_proxy = resp.via_proxy,
                    count = found.len(),
                    "images from re-fetch"
                );
                found
            }
            Err(e) => {
                tracing::info!(target: "images", url = %url_tag(article_url), error = %e, "image re-fetch failed");
                Vec::new()
            }
        }
    }
}
