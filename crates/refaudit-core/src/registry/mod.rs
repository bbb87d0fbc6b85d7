//! Registry traits and implementations for bibliographic metadata and
//! retraction status lookups.

pub mod crossref;
pub mod mock;
pub mod pubmed;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::citation::clean_author_name;
use crate::rate_limit::{RateLimiters, check_rate_limit_response};
use crate::retry::Retryable;
use crate::{MatchedMetadata, RetractionState};

/// Failure talking to a registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// Server returned 429 Too Many Requests.
    #[error("rate limited (429)")]
    RateLimited { retry_after: Option<Duration> },
    #[error("request timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
    #[error("HTTP {status}")]
    Http { status: u16 },
    #[error("malformed response: {0}")]
    Decode(String),
}

impl RegistryError {
    /// Timeouts, connection failures, 429, 408 and 5xx are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            RegistryError::RateLimited { .. }
            | RegistryError::Timeout
            | RegistryError::Network(_) => true,
            RegistryError::Http { status } => *status == 408 || *status >= 500,
            RegistryError::Decode(_) => false,
        }
    }
}

impl Retryable for RegistryError {
    fn is_transient(&self) -> bool {
        RegistryError::is_transient(self)
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            RegistryError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for RegistryError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            RegistryError::Timeout
        } else if e.is_decode() {
            RegistryError::Decode(e.to_string())
        } else if let Some(status) = e.status() {
            RegistryError::Http {
                status: status.as_u16(),
            }
        } else {
            RegistryError::Network(e.to_string())
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub family: String,
    pub given: String,
}

/// A bibliographic record as a registry describes it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryRecord {
    /// The record's DOI.
    pub identifier: String,
    pub title: String,
    pub authors: Vec<Author>,
    pub container_title: Option<String>,
    pub short_container_title: Option<String>,
    pub year: Option<i32>,
    pub volume: Option<String>,
    pub issue: Option<String>,
    pub page: Option<String>,
}

impl RegistryRecord {
    /// Full journal/proceedings name, falling back to the abbreviation.
    pub fn venue(&self) -> Option<&str> {
        self.container_title
            .as_deref()
            .or(self.short_container_title.as_deref())
    }

    pub fn to_metadata(&self) -> MatchedMetadata {
        MatchedMetadata {
            title: self.title.clone(),
            venue: self.venue().map(str::to_string),
            year: self.year,
            authors: self
                .authors
                .iter()
                .map(|a| clean_author_name(&a.family, &a.given))
                .filter(|name| !name.is_empty())
                .collect(),
            volume: self.volume.clone(),
            issue: self.issue.clone(),
            page: self.page.clone(),
            pmid: None,
            pmcid: None,
        }
    }
}

/// Fielded search against a metadata registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub title: String,
    /// First author's surname.
    pub author: Option<String>,
    pub year: Option<i32>,
}

/// One registry's answer about a work's retraction/correction status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub state: RetractionState,
    /// Identifier of the retraction/correction notice, when known.
    pub notice_identifier: Option<String>,
    /// Human label from the registry, e.g. "Retraction" or "Erratum".
    pub label: Option<String>,
}

impl StatusReport {
    pub fn clean() -> Self {
        Self {
            state: RetractionState::Clean,
            notice_identifier: None,
            label: None,
        }
    }
}

/// PubMed identifiers of a work.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleIds {
    pub pmid: Option<String>,
    /// PubMed Central id, `PMC` prefix included.
    pub pmcid: Option<String>,
}

/// Boxed future returned by registry trait methods.
pub type RegistryFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, RegistryError>> + Send + 'a>>;

/// An authoritative source of bibliographic metadata.
pub trait MetadataRegistry: Send + Sync {
    /// The canonical name of this registry (e.g., "CrossRef").
    fn name(&self) -> &str;

    /// Look a DOI up directly. `Ok(None)` means the registry does not know it.
    fn lookup_by_identifier<'a>(
        &'a self,
        doi: &'a str,
    ) -> RegistryFuture<'a, Option<RegistryRecord>>;

    /// Fielded search; candidates are returned best first.
    fn search_by_fields<'a>(
        &'a self,
        query: &'a SearchQuery,
    ) -> RegistryFuture<'a, Vec<RegistryRecord>>;
}

/// A source of retraction and correction notices.
pub trait RetractionRegistry: Send + Sync {
    fn name(&self) -> &str;

    /// `Ok(None)` means this source has no record of the DOI.
    fn lookup_status<'a>(&'a self, doi: &'a str) -> RegistryFuture<'a, Option<StatusReport>>;
}

/// Maps DOIs to PubMed identifiers.
pub trait ArticleIdRegistry: Send + Sync {
    fn name(&self) -> &str;

    /// `Ok(None)` means the DOI is not indexed by this source.
    fn lookup_article_ids<'a>(&'a self, doi: &'a str) -> RegistryFuture<'a, Option<ArticleIds>>;
}

/// Build the shared HTTP client for registry requests.
pub fn build_client(timeout: Duration) -> Result<reqwest::Client, RegistryError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("refaudit/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| RegistryError::Network(e.to_string()))
}

/// Send a GET and decode its JSON body. `Ok(None)` on 404.
pub(crate) async fn get_json(
    request: reqwest::RequestBuilder,
) -> Result<Option<serde_json::Value>, RegistryError> {
    let resp = request.send().await?;
    check_rate_limit_response(&resp)?;

    let status = resp.status();
    if status.as_u16() == 404 {
        return Ok(None);
    }
    if !status.is_success() {
        return Err(RegistryError::Http {
            status: status.as_u16(),
        });
    }

    let value = resp
        .json::<serde_json::Value>()
        .await
        .map_err(|e| RegistryError::Decode(e.to_string()))?;
    Ok(Some(value))
}

/// Run `request` under the named service's governor, if it has one.
pub(crate) async fn throttled<T>(
    limiters: &RateLimiters,
    service: &str,
    request: impl Future<Output = Result<T, RegistryError>>,
) -> Result<T, RegistryError> {
    match limiters.get(service) {
        Some(limiter) => limiter.run(request).await,
        None => request.await,
    }
}
