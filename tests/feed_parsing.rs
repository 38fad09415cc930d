// tests/feed_parsing.rs
//
// Listing parsers against captured-style fixtures.

use merch_radar::fetch::FetchResponse;
use merch_radar::ingest::{feed::parse_feed, parse_listing};
use merch_radar::model::{Source, SourceKind};

const RSS: &str = include_str!("fixtures/merch_blog_rss.xml");
const ATOM: &str = include_str!("fixtures/parks_atom.xml");
const INDEX: &str = include_str!("fixtures/merch_index.html");

#[test]
fn rss_fixture() {
    let items = parse_feed(RSS).unwrap();
    assert_eq!(items.len(), 2, "guid-only item without an http guid is dropped");

    let figment = &items[0];
    assert_eq!(figment.url, "https://parksmerch.example/2025/03/figment-bucket/");
    assert_eq!(figment.title, "Figment Popcorn Bucket Returns to EPCOT - Again");
    assert_eq!(
        figment.published_at.map(|d| d.to_rfc3339()),
        Some("2025-03-03T21:45:00+00:00".to_string())
    );
    // Full content wins over the short description.
    assert!(figment.inline_content.contains("Festival of the Arts"));

    let bag = &items[1];
    assert_eq!(bag.url, "https://parksmerch.example/2025/03/loungefly/");
    assert_eq!(bag.title, "\"Haunted Mansion\" Loungefly Backpack");
    assert_eq!(bag.inline_content, "Glow in the dark details.");
}

#[test]
fn atom_fixture() {
    let items = parse_feed(ATOM).unwrap();
    assert_eq!(items.len(), 1);
    let e = &items[0];
    assert_eq!(e.url, "https://atom.example/stitch-ears");
    assert_eq!(e.title, "Stitch Ears Headband Spotted");
    assert_eq!(
        e.published_at.map(|d| d.to_rfc3339()),
        Some("2025-03-04T10:30:00+00:00".to_string())
    );
    assert_eq!(e.inline_content, "Blue fuzzy ears at the Emporium.");
}

#[test]
fn page_source_discovers_article_links() {
    let source = Source {
        id: "ops".into(),
        name: "Orlando Park Stop".into(),
        url: "https://orlandoparkstop.example/merch/".into(),
        kind: SourceKind::Page,
        park: None,
        poll_interval_secs: 3600,
        active: true,
        last_checked_at: None,
        last_error: None,
    };
    let resp = FetchResponse {
        url: source.url.clone(),
        status: 200,
        body: INDEX.to_string(),
        via_proxy: false,
    };
    let items = parse_listing(&source, &resp).unwrap();
    let got: Vec<(&str, &str)> = items
        .iter()
        .map(|a| (a.url.as_str(), a.title.as_str()))
        .collect();
    assert_eq!(
        got,
        vec![
            (
                "https://orlandoparkstop.example/2025/03/spirit-jersey-drop/",
                "New Spirit Jersey Drops at Magic Kingdom"
            ),
            (
                "https://orlandoparkstop.example/2025/03/figment-bucket/",
                "Figment Bucket Is Back"
            ),
        ]
    );
    assert!(items.iter().all(|a| a.inline_content.is_empty()));
}

#[test]
fn feed_source_with_html_body_is_an_error() {
    let source = Source {
        id: "broken".into(),
        name: "broken".into(),
        url: "https://broken.example/feed".into(),
        kind: SourceKind::Feed,
        park: None,
        poll_interval_secs: 3600,
        active: true,
        last_checked_at: None,
        last_error: None,
    };
    let resp = FetchResponse {
        url: source.url.clone(),
        status: 200,
        body: INDEX.to_string(),
        via_proxy: false,
    };
    assert!(parse_listing(&source, &resp).is_err());
}
