//! Writing enriched articles to the article store exactly once.
//!
//! Rows are keyed by slug. A slug already taken in the destination (or
//! earlier in the same batch) gets a six-hex-digit suffix derived from the
//! article identity, so rerunning the same article always lands on the same
//! slug and collides instead of duplicating. A slug whose row already holds
//! the article's own link, under either form, means the article is present
//! and is counted as a skip without inserting. A collision on insert is the
//! same outcome; any other failure costs the article for this run only.
//!
//! The destination table is expected to be unique on `slug` and, ideally,
//! on `link` as well; a 409 from either constraint reads as already present.

use crate::dedup::{ArticleIdentity, normalize_link};
use crate::errors::PersistenceError;
use crate::models::{EnrichedArticle, StoredArticle};
use crate::policy::CallPolicy;
use crate::utils::{slugify_title, truncate_for_log};
use reqwest::StatusCode;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt;
use tracing::{debug, info, instrument, warn};

const MAX_SLUG_LEN: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyExists,
}

/// The write side of the article database.
pub trait ArticleStore {
    async fn insert(&self, article: &StoredArticle) -> Result<InsertOutcome, PersistenceError>;

    /// Link of the row holding `slug`, if any. A row without a link reads
    /// as an empty string.
    async fn existing_link(&self, slug: &str) -> Result<Option<String>, PersistenceError>;
}

/// Article table behind a PostgREST-compatible API (e.g. Supabase).
#[derive(Clone)]
pub struct RestArticleStore {
    base_url: String,
    table: String,
    service_key: Option<String>,
    http: reqwest::Client,
}

impl fmt::Debug for RestArticleStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestArticleStore")
            .field("base_url", &self.base_url)
            .field("table", &self.table)
            .field("service_key", &self.service_key.as_deref().map(|_| "<redacted>"))
            .finish()
    }
}

impl RestArticleStore {
    pub fn new(base_url: &str, table: &str, service_key: Option<String>, http: reqwest::Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            table: table.to_string(),
            service_key: service_key.filter(|k| !k.trim().is_empty()),
            http,
        }
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.service_key {
            Some(key) => builder.header("apikey", key).bearer_auth(key),
            None => builder,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SlugRow {
    #[serde(default)]
    link: Option<String>,
}

fn transport(e: reqwest::Error) -> PersistenceError {
    PersistenceError::Transport(e.to_string())
}

impl ArticleStore for RestArticleStore {
    #[instrument(level = "debug", skip_all, fields(slug = %article.slug))]
    async fn insert(&self, article: &StoredArticle) -> Result<InsertOutcome, PersistenceError> {
        let request = self
            .http
            .post(format!("{}/{}", self.base_url, self.table))
            .header("Prefer", "return=minimal")
            .json(article);
        let response = self.authorize(request).send().await.map_err(transport)?;

        match response.status() {
            s if s.is_success() => Ok(InsertOutcome::Inserted),
            StatusCode::CONFLICT => Ok(InsertOutcome::AlreadyExists),
            s => {
                let body = response.text().await.unwrap_or_default();
                Err(PersistenceError::Http {
                    status: s.as_u16(),
                    body: truncate_for_log(&body, 200),
                })
            }
        }
    }

    #[instrument(level = "debug", skip_all, fields(%slug))]
    async fn existing_link(&self, slug: &str) -> Result<Option<String>, PersistenceError> {
        let url = format!(
            "{}/{}?slug=eq.{}&select=slug,link&limit=1",
            self.base_url,
            self.table,
            urlencoding::encode(slug)
        );
        let response = self.authorize(self.http.get(url)).send().await.map_err(transport)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PersistenceError::Http {
                status: status.as_u16(),
                body: truncate_for_log(&body, 200),
            });
        }
        let rows: Vec<SlugRow> = response
            .json()
            .await
            .map_err(|e| PersistenceError::Payload(e.to_string()))?;
        Ok(rows.into_iter().next().map(|row| row.link.unwrap_or_default()))
    }
}

/// Six hex digits that tell same-titled articles apart.
pub fn slug_suffix(identity: &ArticleIdentity) -> String {
    let digest = Sha256::digest(identity.as_str().as_bytes());
    digest.iter().take(3).map(|b| format!("{b:02x}")).collect()
}

pub fn base_slug(title: &str) -> String {
    let slug = slugify_title(title, MAX_SLUG_LEN);
    if slug.is_empty() { "article".to_string() } else { slug }
}

enum Holder {
    Nobody,
    Same,
    Other,
}

enum SlugChoice {
    Free(String),
    Present(String),
}

#[derive(Debug, Default)]
pub struct PersistReport {
    /// Identities written during this run.
    pub saved: Vec<ArticleIdentity>,
    /// Identities the store already held.
    pub skipped: Vec<ArticleIdentity>,
    pub errors: usize,
}

pub struct Persister<D> {
    store: D,
    policy: CallPolicy,
}

impl<D: ArticleStore> Persister<D> {
    pub fn new(store: D, policy: CallPolicy) -> Self {
        Self { store, policy }
    }

    #[cfg(test)]
    pub fn store(&self) -> &D {
        &self.store
    }

    /// Who holds `slug` in the store, relative to `article`.
    async fn holder(&self, slug: &str, article: &EnrichedArticle) -> Result<Holder, PersistenceError> {
        let link = self
            .policy
            .call("slug-lookup", || self.store.existing_link(slug))
            .await?;
        Ok(match link {
            None => Holder::Nobody,
            Some(link) if normalize_link(&link) == normalize_link(&article.candidate.link) => Holder::Same,
            Some(_) => Holder::Other,
        })
    }

    async fn resolve_slug(
        &self,
        article: &EnrichedArticle,
        claimed: &HashSet<String>,
    ) -> Result<SlugChoice, PersistenceError> {
        let base = base_slug(&article.candidate.title);
        if !claimed.contains(&base) {
            match self.holder(&base, article).await? {
                Holder::Nobody => return Ok(SlugChoice::Free(base)),
                Holder::Same => return Ok(SlugChoice::Present(base)),
                Holder::Other => {}
            }
        }

        let suffixed = format!("{}-{}", base, slug_suffix(&article.identity));
        if claimed.contains(&suffixed) {
            return Ok(SlugChoice::Present(suffixed));
        }
        // The suffix derives from the identity, so any holder is this article.
        match self.holder(&suffixed, article).await? {
            Holder::Nobody => Ok(SlugChoice::Free(suffixed)),
            Holder::Same | Holder::Other => Ok(SlugChoice::Present(suffixed)),
        }
    }

    #[instrument(level = "info", skip_all, fields(batch = articles.len()))]
    pub async fn persist_all(&self, articles: Vec<EnrichedArticle>) -> PersistReport {
        let mut report = PersistReport::default();
        let mut claimed: HashSet<String> = HashSet::new();

        for article in articles {
            let slug = match self.resolve_slug(&article, &claimed).await {
                Ok(SlugChoice::Free(slug)) => slug,
                Ok(SlugChoice::Present(slug)) => {
                    debug!(%slug, identity = %article.identity, "Article already stored under this slug");
                    report.skipped.push(article.identity);
                    continue;
                }
                Err(e) => {
                    warn!(identity = %article.identity, error = %e, "Could not check slug; dropping article for this run");
                    report.errors += 1;
                    continue;
                }
            };
            claimed.insert(slug.clone());

            let row = StoredArticle::from_enriched(&article, slug);
            match self.policy.call("insert", || self.store.insert(&row)).await {
                Ok(InsertOutcome::Inserted) => {
                    debug!(slug = %row.slug, "Saved article");
                    report.saved.push(article.identity);
                }
                Ok(InsertOutcome::AlreadyExists) => {
                    debug!(slug = %row.slug, "Article already present");
                    report.skipped.push(article.identity);
                }
                Err(e) => {
                    warn!(slug = %row.slug, error = %e, "Insert failed; dropping article for this run");
                    report.errors += 1;
                }
            }
        }

        info!(
            saved = report.saved.len(),
            skipped = report.skipped.len(),
            errors = report.errors,
            "Persisted batch"
        );
        report
    }
}
