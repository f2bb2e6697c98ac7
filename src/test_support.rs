//! Stub collaborators and fixtures shared by the unit tests.

use crate::ai::{AiService, EnrichmentRequest};
use crate::errors::{EnrichmentError, PersistenceError, SourceError, SourceErrorKind, StateError};
use crate::models::{CandidateArticle, RunState, SourceKind, StoredArticle};
use crate::persist::{ArticleStore, InsertOutcome};
use crate::sources::SourceClient;
use crate::state::RunStateStore;
use axum::Router;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

pub const RSS_FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0" xmlns:atom="http://www.w3.org/2005/Atom">
  <channel>
    <title>A Test Daily</title>
    <link>https://a.test</link>
    <description>News</description>
    <atom:link href="https://a.test/rss.xml" rel="self" type="application/rss+xml"/>
    <item>
      <title>Fuel prices rise</title>
      <link>https://a.test/1</link>
      <description><![CDATA[<p>Prices went up again.</p>]]></description>
      <pubDate>Tue, 06 May 2025 14:30:00 GMT</pubDate>
      <guid isPermaLink="false">a-1</guid>
    </item>
    <item>
      <title>Monsoon &amp; the markets</title>
      <link>https://a.test/2</link>
      <description>Rain &lt;b&gt;everywhere&lt;/b&gt;.</description>
    </item>
  </channel>
</rss>"#;

/// Item children from other namespaces that share local names with RSS ones.
pub const MEDIA_RSS_FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0" xmlns:atom="http://www.w3.org/2005/Atom"
     xmlns:media="http://search.yahoo.com/mrss/" xmlns:dc="http://purl.org/dc/elements/1.1/">
  <channel>
    <title>M Test News</title>
    <link>https://m.test</link>
    <item>
      <atom:link href="https://m.test/amp/quake" rel="amphtml"/>
      <title>Quake shakes the valley</title>
      <media:title type="plain">Quake shakes the valley</media:title>
      <link>https://m.test/quake</link>
      <description>No injuries reported.</description>
      <media:description>Photo of the valley at dawn</media:description>
      <media:content url="https://m.test/img/quake.jpg" medium="image"/>
      <dc:creator>Staff</dc:creator>
      <pubDate>Tue, 06 May 2025 08:15:00 GMT</pubDate>
    </item>
    <item>
      <title>Schools reopen</title>
      <link>https://m.test/schools</link>
      <dc:date>2025-05-06T09:00:00Z</dc:date>
    </item>
  </channel>
</rss>"#;

pub const RDF_FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rdf:RDF xmlns:rdf="http://www.w3.org/1999/02/22-rdf-syntax-ns#"
         xmlns="http://purl.org/rss/1.0/" xmlns:dc="http://purl.org/dc/elements/1.1/">
  <channel rdf:about="https://r.test/">
    <title>R Test Bulletin</title>
    <link>https://r.test/</link>
    <items>
      <rdf:Seq>
        <rdf:li rdf:resource="https://r.test/parliament"/>
        <rdf:li rdf:resource="https://r.test/flights"/>
      </rdf:Seq>
    </items>
  </channel>
  <item rdf:about="https://r.test/parliament">
    <title>Parliament opens session</title>
    <link>https://r.test/parliament</link>
    <description>Budget first on the agenda.</description>
    <dc:date>2025-05-06T14:30:00Z</dc:date>
  </item>
  <item rdf:about="https://r.test/flights">
    <title>Flights resume</title>
    <link>https://r.test/flights</link>
    <dc:date>2025-05-06T15:00:00+00:00</dc:date>
  </item>
</rdf:RDF>"#;

pub const ATOM_FEED: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>B Test Wire</title>
  <id>urn:b-test</id>
  <updated>2025-05-06T10:00:00Z</updated>
  <entry>
    <title type="text">Monsoon arrives early</title>
    <link rel="self" href="https://b.test/api/monsoon"/>
    <link rel="alternate" href="https://b.test/monsoon"/>
    <id>urn:b-test:monsoon</id>
    <updated>2025-05-06T09:00:00Z</updated>
    <summary>Forecasters were surprised.</summary>
  </entry>
</feed>"#;

/// Serve `router` on an ephemeral local port and return its base URL.
pub async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

pub fn candidate(title: &str, link: &str, kind: SourceKind, source_id: &str) -> CandidateArticle {
    CandidateArticle {
        title: title.to_string(),
        link: link.to_string(),
        published_at: Utc::now(),
        summary_raw: None,
        source_kind: kind,
        source_id: source_id.to_string(),
    }
}

/// A source that returns a fixed batch or a fixed error.
#[derive(Debug, Clone)]
pub struct StubSource {
    id: String,
    kind: SourceKind,
    result: Result<Vec<CandidateArticle>, SourceErrorKind>,
    delay: Duration,
}

impl StubSource {
    pub fn ok(id: &str, kind: SourceKind, items: Vec<CandidateArticle>) -> Self {
        Self {
            id: id.to_string(),
            kind,
            result: Ok(items),
            delay: Duration::ZERO,
        }
    }

    pub fn failing(id: &str, kind: SourceKind, error: SourceErrorKind) -> Self {
        Self {
            id: id.to_string(),
            kind,
            result: Err(error),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl SourceClient for StubSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> SourceKind {
        self.kind
    }

    async fn fetch(&self) -> Result<Vec<CandidateArticle>, SourceError> {
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
        self.result
            .clone()
            .map_err(|kind| SourceError::new(kind, &self.id, "stubbed failure"))
    }
}

#[derive(Default)]
struct StubAiInner {
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    latency: Mutex<Duration>,
    slow: Mutex<HashMap<String, Duration>>,
    truncate_once: Mutex<HashSet<String>>,
    garbage: Mutex<HashSet<String>>,
}

/// An AI service that files everything under Business unless told otherwise.
#[derive(Clone, Default)]
pub struct StubAi {
    inner: Arc<StubAiInner>,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl StubAi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        *self.inner.latency.lock().unwrap() = latency;
        self
    }

    pub fn slow_on(self, title: &str, delay: Duration) -> Self {
        self.inner.slow.lock().unwrap().insert(title.to_string(), delay);
        self
    }

    pub fn truncated_first(self, title: &str) -> Self {
        self.inner.truncate_once.lock().unwrap().insert(title.to_string());
        self
    }

    pub fn garbage_on(self, title: &str) -> Self {
        self.inner.garbage.lock().unwrap().insert(title.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.inner.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.inner.max_in_flight.load(Ordering::SeqCst)
    }
}

impl AiService for StubAi {
    async fn complete(&self, request: &EnrichmentRequest) -> Result<String, EnrichmentError> {
        self.inner.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.inner.in_flight);

        let latency = *self.inner.latency.lock().unwrap();
        let slow = self.inner.slow.lock().unwrap().get(&request.title).copied();
        sleep(latency + slow.unwrap_or_default()).await;

        if self.inner.garbage.lock().unwrap().contains(&request.title) {
            return Ok("I am not JSON at all".to_string());
        }
        if self.inner.truncate_once.lock().unwrap().remove(&request.title) {
            return Ok(r#"{"category": "Business", "summary": "Cut"#.to_string());
        }
        Ok(serde_json::json!({
            "category": "Business",
            "summary": format!("AI summary of {}", request.title),
        })
        .to_string())
    }
}

#[derive(Default)]
struct MemoryArticleStoreInner {
    rows: Mutex<BTreeMap<String, Option<StoredArticle>>>,
    failing: Mutex<HashSet<String>>,
}

/// Article table in memory, unique on slug.
#[derive(Clone, Default)]
pub struct MemoryArticleStore {
    inner: Arc<MemoryArticleStoreInner>,
}

impl MemoryArticleStore {
    /// Pretend a row with `slug` was written by someone else.
    pub fn seed(&self, slug: &str) {
        self.inner.rows.lock().unwrap().insert(slug.to_string(), None);
    }

    pub fn failing_on(self, slug: &str) -> Self {
        self.inner.failing.lock().unwrap().insert(slug.to_string());
        self
    }

    pub fn slugs(&self) -> Vec<String> {
        self.inner.rows.lock().unwrap().keys().cloned().collect()
    }

    pub fn articles(&self) -> Vec<StoredArticle> {
        self.inner.rows.lock().unwrap().values().flatten().cloned().collect()
    }
}

impl ArticleStore for MemoryArticleStore {
    async fn insert(&self, article: &StoredArticle) -> Result<InsertOutcome, PersistenceError> {
        if self.inner.failing.lock().unwrap().contains(&article.slug) {
            return Err(PersistenceError::Http {
                status: 400,
                body: "malformed payload".to_string(),
            });
        }
        let mut rows = self.inner.rows.lock().unwrap();
        if rows.contains_key(&article.slug) {
            return Ok(InsertOutcome::AlreadyExists);
        }
        rows.insert(article.slug.clone(), Some(article.clone()));
        Ok(InsertOutcome::Inserted)
    }

    async fn existing_link(&self, slug: &str) -> Result<Option<String>, PersistenceError> {
        let rows = self.inner.rows.lock().unwrap();
        Ok(rows
            .get(slug)
            .map(|row| row.as_ref().map(|a| a.link.clone()).unwrap_or_default()))
    }
}

#[derive(Default)]
struct MemoryRunStateStoreInner {
    state: Mutex<Option<RunState>>,
    saves: AtomicUsize,
}

#[derive(Clone, Default)]
pub struct MemoryRunStateStore {
    inner: Arc<MemoryRunStateStoreInner>,
}

impl MemoryRunStateStore {
    pub fn current(&self) -> Option<RunState> {
        self.inner.state.lock().unwrap().clone()
    }

    pub fn saves(&self) -> usize {
        self.inner.saves.load(Ordering::SeqCst)
    }
}

impl RunStateStore for MemoryRunStateStore {
    async fn load(&self) -> Result<Option<RunState>, StateError> {
        Ok(self.current())
    }

    async fn save(&self, state: &RunState) -> Result<(), StateError> {
        *self.inner.state.lock().unwrap() = Some(state.clone());
        self.inner.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
