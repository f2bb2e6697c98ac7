//! RSS and Atom feed client.
//!
//! Feeds are fetched with a rotating browser User-Agent and browser-like
//! headers, since several publishers put bot protection in front of their
//! feeds. A protection page comes back as HTML with a 200 status; that is
//! reported as [`SourceErrorKind::Blocked`], never parsed as an empty feed.
//!
//! RSS 2.0 (`<rss><channel><item>`), RSS 1.0 (`<rdf:RDF><item>`) and Atom
//! (`<feed><entry>`) are recognized by their root element.

use super::{SourceClient, absolute_link, parse_timestamp, random_user_agent};
use crate::errors::{SourceError, SourceErrorKind};
use crate::models::{CandidateArticle, SourceKind};
use crate::utils::{collapse_whitespace, strip_html, truncate_for_log};
use chrono::{DateTime, Utc};
use quick_xml::Reader;
use quick_xml::events::Event;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, CACHE_CONTROL, CONTENT_TYPE, USER_AGENT};
use scraper::{Html, Selector};
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

const FEED_ACCEPT: &str =
    "application/rss+xml, application/atom+xml, application/xml;q=0.9, text/xml;q=0.8, */*;q=0.5";

#[derive(Debug, Clone)]
pub struct RssClient {
    id: String,
    url: String,
    max_items: usize,
    http: reqwest::Client,
}

impl RssClient {
    pub fn new(id: &str, url: &str, max_items: usize, http: reqwest::Client) -> Self {
        Self {
            id: id.to_string(),
            url: url.to_string(),
            max_items,
            http,
        }
    }
}

impl SourceClient for RssClient {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Rss
    }

    #[instrument(level = "info", skip_all, fields(source_id = %self.id, url = %self.url))]
    async fn fetch(&self) -> Result<Vec<CandidateArticle>, SourceError> {
        let response = self
            .http
            .get(&self.url)
            .header(USER_AGENT, random_user_agent())
            .header(ACCEPT, FEED_ACCEPT)
            .header(ACCEPT_LANGUAGE, "en-US,en;q=0.9")
            .header(CACHE_CONTROL, "no-cache")
            .send()
            .await
            .map_err(|e| SourceError::from_reqwest(&self.id, &e))?;

        let status = response.status();
        if status == StatusCode::FORBIDDEN || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(SourceError::new(
                SourceErrorKind::Blocked,
                &self.id,
                format!("HTTP {status}"),
            ));
        }
        if !status.is_success() {
            return Err(SourceError::new(
                SourceErrorKind::HttpError,
                &self.id,
                format!("HTTP {status}"),
            ));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let body = response
            .text()
            .await
            .map_err(|e| SourceError::from_reqwest(&self.id, &e))?;

        if looks_like_html(&content_type, &body) {
            let title = html_title(&body).unwrap_or_else(|| "untitled HTML page".to_string());
            warn!(%title, "Feed answered with HTML instead of XML");
            return Err(SourceError::new(
                SourceErrorKind::Blocked,
                &self.id,
                format!("HTML page instead of feed: {title}"),
            ));
        }

        let items = parse_feed(&body).map_err(|detail| {
            debug!(body = %truncate_for_log(&body, 300), "Unparseable feed body");
            SourceError::new(SourceErrorKind::ParseError, &self.id, detail)
        })?;

        let fetched_at = Utc::now();
        let total = items.len();
        let candidates: Vec<CandidateArticle> = items
            .into_iter()
            .filter_map(|item| item.into_candidate(&self.id, fetched_at))
            .take(self.max_items)
            .collect();

        info!(
            count = candidates.len(),
            skipped = total.saturating_sub(candidates.len()),
            "Fetched feed items"
        );
        Ok(candidates)
    }
}

/// A feed entry before validation, common to RSS and Atom.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct FeedItem {
    pub title: Option<String>,
    pub link: Option<String>,
    pub summary: Option<String>,
    pub published: Option<String>,
}

impl FeedItem {
    fn into_candidate(self, source_id: &str, fetched_at: DateTime<Utc>) -> Option<CandidateArticle> {
        let title = strip_html(self.title.as_deref()?);
        if title.is_empty() {
            return None;
        }
        let link = absolute_link(self.link.as_deref()?)?;
        let summary_raw = self
            .summary
            .as_deref()
            .map(strip_html)
            .filter(|s| !s.is_empty());
        let published_at = self
            .published
            .as_deref()
            .and_then(parse_timestamp)
            .unwrap_or(fetched_at);

        Some(CandidateArticle {
            title,
            link,
            published_at,
            summary_raw,
            source_kind: SourceKind::Rss,
            source_id: source_id.to_string(),
        })
    }
}

fn looks_like_html(content_type: &str, body: &str) -> bool {
    if content_type.contains("text/html") {
        return true;
    }
    let head: String = body.trim_start().chars().take(15).collect::<String>().to_ascii_lowercase();
    head.starts_with("<!doctype html") || head.starts_with("<html")
}

fn html_title(body: &str) -> Option<String> {
    let document = Html::parse_document(body);
    let selector = Selector::parse("title").ok()?;
    document
        .select(&selector)
        .next()
        .map(|t| collapse_whitespace(&t.text().collect::<String>()))
        .filter(|t| !t.is_empty())
}

/// Element text, tolerant of attributes on the element.
#[derive(Debug, Deserialize)]
struct Text {
    #[serde(rename = "$text", default)]
    value: String,
}

/// First non-blank text among same-named elements.
///
/// Elements are matched by local name, so `<media:title>` lands next to
/// `<title>` and an empty `<atom:link href=".."/>` next to `<link>`.
fn first_text(texts: Vec<Text>) -> Option<String> {
    texts.into_iter().map(|t| t.value).find(|v| !v.trim().is_empty())
}

#[derive(Debug, Deserialize)]
struct RssDocument {
    channel: Option<RssChannel>,
    /// RSS 1.0 places items next to the channel rather than inside it.
    #[serde(rename = "item", default)]
    items: Vec<RssItem>,
}

#[derive(Debug, Deserialize)]
struct RssChannel {
    #[serde(rename = "item", default)]
    items: Vec<RssItem>,
}

#[derive(Debug, Deserialize)]
struct RssItem {
    #[serde(default)]
    title: Vec<Text>,
    #[serde(default)]
    link: Vec<Text>,
    #[serde(default)]
    guid: Vec<Text>,
    #[serde(default)]
    description: Vec<Text>,
    #[serde(rename = "pubDate", default)]
    pub_date: Vec<Text>,
    /// `dc:date`, the only timestamp RSS 1.0 items carry.
    #[serde(default)]
    date: Vec<Text>,
}

impl From<RssItem> for FeedItem {
    fn from(item: RssItem) -> Self {
        let guid = first_text(item.guid).filter(|g| absolute_link(g).is_some());
        FeedItem {
            title: first_text(item.title),
            link: first_text(item.link).or(guid),
            summary: first_text(item.description),
            published: first_text(item.pub_date).or_else(|| first_text(item.date)),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AtomFeed {
    #[serde(rename = "entry", default)]
    entries: Vec<AtomEntry>,
}

#[derive(Debug, Deserialize)]
struct AtomEntry {
    #[serde(default)]
    title: Vec<Text>,
    #[serde(rename = "link", default)]
    links: Vec<AtomLink>,
    #[serde(default)]
    summary: Vec<Text>,
    #[serde(default)]
    published: Vec<Text>,
    #[serde(default)]
    updated: Vec<Text>,
}

#[derive(Debug, Deserialize)]
struct AtomLink {
    #[serde(rename = "@href", default)]
    href: Option<String>,
    #[serde(rename = "@rel", default)]
    rel: Option<String>,
}

impl From<AtomEntry> for FeedItem {
    fn from(entry: AtomEntry) -> Self {
        let links: Vec<(Option<&str>, &str)> = entry
            .links
            .iter()
            .filter_map(|l| Some((l.rel.as_deref(), l.href.as_deref()?)))
            .collect();
        let link = links
            .iter()
            .find(|(rel, _)| matches!(*rel, None | Some("alternate")))
            .or(links.first())
            .map(|(_, href)| href.to_string());
        FeedItem {
            title: first_text(entry.title),
            link,
            summary: first_text(entry.summary),
            published: first_text(entry.published).or_else(|| first_text(entry.updated)),
        }
    }
}

/// Local name of the document's root element, lower-cased.
fn root_element(xml: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                return Some(String::from_utf8_lossy(e.local_name().as_ref()).to_ascii_lowercase());
            }
            Ok(Event::Eof) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

/// Parse an RSS or Atom document into feed items.
pub(crate) fn parse_feed(xml: &str) -> Result<Vec<FeedItem>, String> {
    match root_element(xml).as_deref() {
        Some("rss") | Some("rdf") => {
            let doc: RssDocument =
                quick_xml::de::from_str(xml).map_err(|e| format!("invalid RSS: {e}"))?;
            let mut items = doc.channel.map(|c| c.items).unwrap_or_default();
            items.extend(doc.items);
            Ok(items.into_iter().map(FeedItem::from).collect())
        }
        Some("feed") => {
            let feed: AtomFeed =
                quick_xml::de::from_str(xml).map_err(|e| format!("invalid Atom: {e}"))?;
            Ok(feed.entries.into_iter().map(FeedItem::from).collect())
        }
        Some(other) => Err(format!("unexpected root element <{other}>")),
        None => Err("document has no root element".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ATOM_FEED, MEDIA_RSS_FEED, RDF_FEED, RSS_FEED, serve};
    use axum::Router;
    use axum::http::{StatusCode, header};
    use axum::routing::get;

    fn feed_router() -> Router {
        Router::new()
            .route(
                "/rss.xml",
                get(|| async { ([(header::CONTENT_TYPE, "application/rss+xml")], RSS_FEED) }),
            )
            .route(
                "/atom.xml",
                get(|| async { ([(header::CONTENT_TYPE, "application/atom+xml")], ATOM_FEED) }),
            )
            .route(
                "/media.xml",
                get(|| async { ([(header::CONTENT_TYPE, "application/rss+xml")], MEDIA_RSS_FEED) }),
            )
            .route(
                "/rdf.xml",
                get(|| async { ([(header::CONTENT_TYPE, "application/rdf+xml")], RDF_FEED) }),
            )
            .route(
                "/challenge",
                get(|| async {
                    (
                        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
                        "<!DOCTYPE html><html><head><title>Just a moment...</title></head><body></body></html>",
                    )
                }),
            )
            .route(
                "/down",
                get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "upstream exploded") }),
            )
            .route("/forbidden", get(|| async { (StatusCode::FORBIDDEN, "no bots") }))
            .route(
                "/truncated",
                get(|| async {
                    (
                        [(header::CONTENT_TYPE, "application/xml")],
                        "<rss><channel><item><title>Half an item",
                    )
                }),
            )
    }

    async fn client_for(path: &str) -> RssClient {
        let base = serve(feed_router()).await;
        RssClient::new("test-feed", &format!("{base}{path}"), 50, reqwest::Client::new())
    }

    #[tokio::test]
    async fn test_fetch_rss_feed() {
        let items = client_for("/rss.xml").await.fetch().await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].title, "Fuel prices rise");
        assert_eq!(items[0].link, "https://a.test/1");
        assert_eq!(items[0].summary_raw.as_deref(), Some("Prices went up again."));
        assert_eq!(items[0].source_kind, SourceKind::Rss);
        assert_eq!(items[0].source_id, "test-feed");
        assert_eq!(items[0].published_at.to_rfc3339(), "2025-05-06T14:30:00+00:00");
        assert_eq!(items[1].link, "https://a.test/2");
    }

    #[tokio::test]
    async fn test_fetch_atom_feed() {
        let items = client_for("/atom.xml").await.fetch().await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "Monsoon arrives early");
        assert_eq!(items[0].link, "https://b.test/monsoon");
    }

    #[tokio::test]
    async fn test_fetch_feed_with_namespaced_item_children() {
        let items = client_for("/media.xml").await.fetch().await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].title, "Quake shakes the valley");
        assert_eq!(items[0].link, "https://m.test/quake");
        assert_eq!(items[0].summary_raw.as_deref(), Some("No injuries reported."));
        assert_eq!(items[0].published_at.to_rfc3339(), "2025-05-06T08:15:00+00:00");
        assert_eq!(items[1].title, "Schools reopen");
        assert_eq!(items[1].link, "https://m.test/schools");
        assert_eq!(items[1].published_at.to_rfc3339(), "2025-05-06T09:00:00+00:00");
    }

    #[tokio::test]
    async fn test_fetch_rss_1_0_feed() {
        let items = client_for("/rdf.xml").await.fetch().await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].title, "Parliament opens session");
        assert_eq!(items[0].link, "https://r.test/parliament");
        assert_eq!(items[0].summary_raw.as_deref(), Some("Budget first on the agenda."));
        assert_eq!(items[0].published_at.to_rfc3339(), "2025-05-06T14:30:00+00:00");
        assert_eq!(items[1].link, "https://r.test/flights");
    }

    #[test]
    fn test_dc_date_is_read_when_pub_date_is_missing() {
        let xml = r#"<rss version="2.0" xmlns:dc="http://purl.org/dc/elements/1.1/"><channel>
              <item><title>X</title><link>https://a.test/1</link><dc:date>2025-05-06T14:30:00Z</dc:date></item>
            </channel></rss>"#;
        let items = parse_feed(xml).unwrap();
        assert_eq!(items[0].published.as_deref(), Some("2025-05-06T14:30:00Z"));
    }

    #[test]
    fn test_media_title_does_not_collide_with_title() {
        let xml = r#"<rss version="2.0" xmlns:media="http://search.yahoo.com/mrss/"
                 xmlns:dc="http://purl.org/dc/elements/1.1/"><channel>
              <item>
                <title>Fuel prices rise</title>
                <media:title>Fuel prices rise</media:title>
                <dc:creator>Desk</dc:creator>
                <link>https://a.test/1</link>
              </item>
            </channel></rss>"#;
        let items = parse_feed(xml).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title.as_deref(), Some("Fuel prices rise"));
        assert_eq!(items[0].link.as_deref(), Some("https://a.test/1"));
    }

    #[tokio::test]
    async fn test_html_challenge_is_blocked() {
        let err = client_for("/challenge").await.fetch().await.unwrap_err();
        assert_eq!(err.kind, SourceErrorKind::Blocked);
        assert!(err.detail.contains("Just a moment..."));
    }

    #[tokio::test]
    async fn test_server_error_is_http_error() {
        let err = client_for("/down").await.fetch().await.unwrap_err();
        assert_eq!(err.kind, SourceErrorKind::HttpError);
        assert_eq!(err.source_id, "test-feed");
    }

    #[tokio::test]
    async fn test_forbidden_is_blocked() {
        let err = client_for("/forbidden").await.fetch().await.unwrap_err();
        assert_eq!(err.kind, SourceErrorKind::Blocked);
    }

    #[tokio::test]
    async fn test_truncated_feed_is_parse_error() {
        let err = client_for("/truncated").await.fetch().await.unwrap_err();
        assert_eq!(err.kind, SourceErrorKind::ParseError);
    }

    #[tokio::test]
    async fn test_max_items_caps_batch() {
        let base = serve(feed_router()).await;
        let client = RssClient::new("capped", &format!("{base}/rss.xml"), 1, reqwest::Client::new());
        assert_eq!(client.fetch().await.unwrap().len(), 1);
    }

    #[test]
    fn test_parse_feed_skips_items_without_link() {
        let xml = r#"<?xml version="1.0"?>
            <rss version="2.0"><channel><title>T</title>
              <item><title>No link here</title></item>
              <item><title>Relative</title><link>/x</link></item>
              <item><title>Guid only</title><guid isPermaLink="true">https://c.test/g</guid></item>
            </channel></rss>"#;
        let items = parse_feed(xml).unwrap();
        assert_eq!(items.len(), 3);
        let now = Utc::now();
        let kept: Vec<_> = items
            .into_iter()
            .filter_map(|i| i.into_candidate("c", now))
            .collect();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].link, "https://c.test/g");
        assert_eq!(kept[0].published_at, now);
    }

    #[test]
    fn test_parse_feed_rejects_unknown_root() {
        assert!(parse_feed("<html><body/></html>").is_err());
        assert!(parse_feed("").is_err());
    }

    #[test]
    fn test_looks_like_html() {
        assert!(looks_like_html("text/html; charset=utf-8", "<rss/>"));
        assert!(looks_like_html("application/xml", "  <!DOCTYPE html><html>"));
        assert!(!looks_like_html("application/rss+xml", "<?xml version=\"1.0\"?><rss/>"));
    }
}
