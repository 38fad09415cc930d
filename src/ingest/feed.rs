// src/ingest/feed.rs
//! RSS 2.0 and Atom listing parser.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use metrics::histogram;
use quick_xml::de::from_str;
use serde::Deserialize;
use time::{format_description::well_known::Rfc2822, OffsetDateTime, UtcOffset};

use super::normalize_text;
use super::types::ArticleRef;

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}

#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(rename = "item", default)]
    item: Vec<Item>,
}

#[derive(Debug, Deserialize)]
struct Item {
    title: Option<String>,
    link: Option<String>,
    guid: Option<TextNode>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    description: Option<String>,
    #[serde(rename = "encoded", alias = "content:encoded")]
    content_encoded: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AtomFeed {
    #[serde(rename = "entry", default)]
    entry: Vec<AtomEntry>,
}

#[derive(Debug, Deserialize)]
struct AtomEntry {
    title: Option<TextNode>,
    #[serde(default)]
    link: Vec<AtomLink>,
    published: Option<String>,
    updated: Option<String>,
    summary: Option<TextNode>,
    content: Option<TextNode>,
}

#[derive(Debug, Deserialize)]
struct TextNode {
    #[serde(rename = "$text", default)]
    value: String,
}

#[derive(Debug, Deserialize)]
struct AtomLink {
    #[serde(rename = "@href")]
    href: String,
    #[serde(rename = "@rel", default)]
    rel: Option<String>,
}

fn parse_rfc2822(ts: &str) -> Option<DateTime<Utc>> {
    OffsetDateTime::parse(ts.trim(), &Rfc2822)
        .ok()
        .map(|dt| dt.to_offset(UtcOffset::UTC).unix_timestamp())
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
}

fn parse_rfc3339(ts: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(ts.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Parse RSS first, then Atom. Items without a link are dropped.
pub fn parse_feed(xml: &str) -> Result<Vec<ArticleRef>> {
    let t0 = std::time::Instant::now();
    let xml_clean = scrub_html_entities_for_xml(xml);

    let out = match from_str::<Rss>(&xml_clean) {
        Ok(rss) => rss_items(rss),
        Err(rss_err) if xml_clean.contains("<feed") => {
            let atom: AtomFeed = from_str(&xml_clean)
                .map_err(|atom_err| anyhow!("rss: {rss_err}; atom: {atom_err}"))
                .context("parsing feed xml")?;
            atom_items(atom)
        }
        Err(rss_err) => return Err(anyhow!("not an rss or atom document: {rss_err}")),
    };

    let ms = t0.elapsed().as_secs_f64() * 1_000.0;
    histogram!("ingest_parse_ms").record(ms);
    Ok(out)
}

fn rss_items(rss: Rss) -> Vec<ArticleRef> {
    let mut out = Vec::with_capacity(rss.channel.item.len());
    for it in rss.channel.item {
        let url = it
            .link
            .or(it.guid.map(|g| g.value).filter(|g| g.starts_with("http")))
            .map(|l| l.trim().to_string())
            .unwrap_or_default();
        if url.is_empty() {
            continue;
        }
        out.push(ArticleRef {
            url,
            title: normalize_text(it.title.as_deref().unwrap_or_default()),
            published_at: it.pub_date.as_deref().and_then(parse_rfc2822),
            inline_content: it
                .content_encoded
                .or(it.description)
                .unwrap_or_default(),
        });
    }
    out
}

fn atom_items(feed: AtomFeed) -> Vec<ArticleRef> {
    let mut out = Vec::with_capacity(feed.entry.len());
    for e in feed.entry {
        let link = e
            .link
            .iter()
            .find(|l| l.rel.as_deref().map_or(true, |r| r == "alternate"))
            .or_else(|| e.link.first());
        let Some(link) = link else { continue };
        let url = link.href.trim().to_string();
        if url.is_empty() {
            continue;
        }
        out.push(ArticleRef {
            url,
            title: normalize_text(e.title.as_ref().map(|t| t.value.as_str()).unwrap_or_default()),
            published_at: e
                .published
                .as_deref()
                .or(e.updated.as_deref())
                .and_then(parse_rfc3339),
            inline_content: e
                .content
                .or(e.summary)
                .map(|t| t.value)
                .unwrap_or_default(),
        });
    }
    out
}

/// Named HTML entities are not valid XML; blogs emit them anyway.
fn scrub_html_entities_for_xml(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&ndash;", "-")
        .replace("&mdash;", "-")
        .replace("&ldquo;", "\"")
        .replace("&rdquo;", "\"")
        .replace("&lsquo;", "'")
        .replace("&rsquo;", "'")
        .replace("&hellip;", "...")
        .replace("&trade;", "(TM)")
        .replace("&reg;", "(R)")
}

#[cfg(test)]
mod tests {
    use super::*;

    const RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0" xmlns:content="http://purl.org/rss/1.0/modules/content/">
<channel>
  <title>Park Merch Blog</title>
  <link>https://merch.example.com</link>
  <item>
    <title>New Mickey Mouse Spirit Jersey Arrives at Magic Kingdom&nbsp;!</title>
    <link>https://merch.example.com/2025/03/spirit-jersey/</link>
    <pubDate>Sat, 01 Mar 2025 14:30:00 +0000</pubDate>
    <description><![CDATA[<p>A new jersey</p>]]></description>
  </item>
  <item>
    <title>No link here</title>
  </item>
</channel>
</rss>"#;

    const ATOM: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Parks Atom</title>
  <entry>
    <title type="html">Figment Popcorn Bucket Returns</title>
    <link rel="alternate" href="https://atom.example.com/figment-bucket"/>
    <published>2025-03-02T09:00:00Z</published>
    <summary>Back at EPCOT</summary>
  </entry>
</feed>"#;

    #[test]
    fn parses_rss_items_with_links_only() {
        let items = parse_feed(RSS).unwrap();
        assert_eq!(items.len(), 1);
        let a = &items[0];
        assert_eq!(a.url, "https://merch.example.com/2025/03/spirit-jersey/");
        assert_eq!(a.title, "New Mickey Mouse Spirit Jersey Arrives at Magic Kingdom");
        assert_eq!(
            a.published_at.map(|d| d.to_rfc3339()),
            Some("2025-03-01T14:30:00+00:00".to_string())
        );
        assert!(a.inline_content.contains("A new jersey"));
    }

    #[test]
    fn falls_back_to_atom() {
        let items = parse_feed(ATOM).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].url, "https://atom.example.com/figment-bucket");
        assert_eq!(items[0].title, "Figment Popcorn Bucket Returns");
        assert_eq!(items[0].inline_content, "Back at EPCOT");
        assert!(items[0].published_at.is_some());
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(parse_feed("<html><body>not a feed</body></html>").is_err());
    }
}
