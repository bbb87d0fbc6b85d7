use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub mod cache;
pub mod citation;
pub mod config_file;
pub mod dedup;
pub mod diagnosis;
pub mod identifiers;
pub mod matching;
pub mod model;
pub mod normalize;
pub mod pipeline;
pub mod pool;
pub mod rate_limit;
pub mod registry;
pub mod resolver;
pub mod retraction;
pub mod retry;
pub mod stats;

// Re-export for convenience
pub use cache::{AuditCache, CacheKey, CachedValue, DEFAULT_TTL, MAX_TTL};
pub use pipeline::{AuditReport, Auditor, AuditorBuilder};
pub use rate_limit::RateLimiters;
pub use retry::RetryPolicy;
pub use stats::AuditStats;

/// One input line plus its position in the submitted list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawReference {
    pub text: String,
    pub raw_index: usize,
}

impl RawReference {
    pub fn new(raw_index: usize, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            raw_index,
        }
    }
}

/// A registry-issued identifier (or a plain web address) found in a reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Identifier {
    Doi(String),
    Url(String),
}

impl Identifier {
    pub fn as_str(&self) -> &str {
        match self {
            Identifier::Doi(s) | Identifier::Url(s) => s,
        }
    }

    pub fn is_doi(&self) -> bool {
        matches!(self, Identifier::Doi(_))
    }

    pub fn is_url(&self) -> bool {
        matches!(self, Identifier::Url(_))
    }
}

impl std::fmt::Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Identifier::Doi(doi) => write!(f, "doi:{}", doi),
            Identifier::Url(url) => write!(f, "{}", url),
        }
    }
}

/// Structured fields segmented from a raw reference line.
///
/// Fields that could not be segmented confidently are left empty rather
/// than guessed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedReference {
    pub raw_index: usize,
    pub raw_text: String,
    pub title: Option<String>,
    /// Author names in `Family I` form, in citation order.
    pub authors: Vec<String>,
    pub year: Option<i32>,
    pub venue: Option<String>,
    pub candidate_identifier: Option<Identifier>,
}

impl NormalizedReference {
    /// Best short label for progress output.
    pub fn display_title(&self) -> String {
        if let Some(ref title) = self.title {
            return title.clone();
        }
        if let Some(ref id) = self.candidate_identifier {
            return id.to_string();
        }
        self.raw_text.clone()
    }

    pub fn first_author_surname(&self) -> Option<&str> {
        self.authors
            .first()
            .and_then(|a| a.split_whitespace().next())
    }
}

/// How a reference was (or was not) matched against the metadata registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchSource {
    IdentifierExact,
    FuzzyTitleMatch,
    NoMatch,
}

/// Bibliographic fields of the record a reference was matched to.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MatchedMetadata {
    pub title: String,
    pub venue: Option<String>,
    pub year: Option<i32>,
    pub authors: Vec<String>,
    pub volume: Option<String>,
    pub issue: Option<String>,
    pub page: Option<String>,
    /// PubMed id, filled in when an NCBI key enables the lookup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pmid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pmcid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub reference: NormalizedReference,
    pub matched_identifier: Option<String>,
    /// Similarity in `[0, 1]`; 1.0 for identifier hits.
    pub confidence: f64,
    pub matched_metadata: Option<MatchedMetadata>,
    pub source: MatchSource,
    /// The cited DOI resolved, but to a record that reads very differently
    /// from the cited text.
    #[serde(default)]
    pub doi_mismatch: bool,
}

impl MatchResult {
    pub fn no_match(reference: NormalizedReference, confidence: f64) -> Self {
        Self {
            reference,
            matched_identifier: None,
            confidence,
            matched_metadata: None,
            source: MatchSource::NoMatch,
            doi_mismatch: false,
        }
    }

    pub fn raw_index(&self) -> usize {
        self.reference.raw_index
    }

    pub fn is_matched(&self) -> bool {
        self.source != MatchSource::NoMatch
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RetractionState {
    Clean,
    Retracted,
    Corrected,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetractionStatus {
    pub identifier: String,
    pub status: RetractionState,
    pub notice: Option<String>,
}

impl RetractionStatus {
    pub fn unknown(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            status: RetractionState::Unknown,
            notice: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GroupKind {
    ExactIdentifier,
    FuzzyText,
}

/// References considered duplicates of one another.
///
/// `members` is sorted ascending; `key` is the smallest member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub kind: GroupKind,
    pub key: usize,
    pub members: Vec<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DiagnosisKind {
    Book,
    Conference,
    Preprint,
    WebPage,
    Patent,
    /// Reads like a journal article but nothing in the registry backs it.
    HighRisk,
    Unknown,
}

impl DiagnosisKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiagnosisKind::Book => "Book",
            DiagnosisKind::Conference => "Conference",
            DiagnosisKind::Preprint => "Preprint",
            DiagnosisKind::WebPage => "WebPage",
            DiagnosisKind::Patent => "Patent",
            DiagnosisKind::HighRisk => "HighRisk",
            DiagnosisKind::Unknown => "Unknown",
        }
    }
}

impl std::fmt::Display for DiagnosisKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiagnosisBasis {
    Heuristic,
    ModelInference,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosisLabel {
    pub raw_index: usize,
    pub label: DiagnosisKind,
    pub basis: DiagnosisBasis,
}

/// The final verdict for one input line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub raw_index: usize,
    pub raw_text: String,
    /// Absent when the line could not be parsed or its stages failed.
    pub match_result: Option<MatchResult>,
    pub retraction: Option<RetractionStatus>,
    /// Key of the ExactIdentifier group this reference belongs to.
    pub exact_duplicate_group: Option<usize>,
    /// Key of the FuzzyText group this reference belongs to.
    pub fuzzy_duplicate_group: Option<usize>,
    pub diagnosis: Option<DiagnosisLabel>,
    /// Suggested scholar search for references that did not resolve.
    pub search_query: Option<String>,
    pub errors: Vec<AuditError>,
}

impl AuditRecord {
    pub fn reference(&self) -> Option<&NormalizedReference> {
        self.match_result.as_ref().map(|m| &m.reference)
    }

    pub fn source(&self) -> Option<MatchSource> {
        self.match_result.as_ref().map(|m| m.source)
    }

    pub fn confidence(&self) -> f64 {
        self.match_result.as_ref().map_or(0.0, |m| m.confidence)
    }
}

/// Errors recorded against a reference, or returned when a job cannot start.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum AuditError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("{operation} failed after {attempts} attempt(s): {message}")]
    TransientNetwork {
        operation: String,
        attempts: u32,
        message: String,
    },
    #[error("{operation} rejected: {message}")]
    Registry { operation: String, message: String },
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("model inference failed: {0}")]
    ModelInference(String),
    /// A reference's stages stopped without reporting a result.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Progress events emitted while a batch is audited.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    Started {
        total: usize,
    },
    Resolving {
        index: usize,
        total: usize,
        title: String,
    },
    Resolved {
        index: usize,
        total: usize,
        source: MatchSource,
        confidence: f64,
    },
    ParseFailed {
        index: usize,
        total: usize,
        message: String,
    },
    RetractionChecked {
        index: usize,
        total: usize,
        status: RetractionState,
    },
    DuplicatesDetected {
        exact_groups: usize,
        fuzzy_groups: usize,
    },
    Diagnosed {
        index: usize,
        label: DiagnosisKind,
        basis: DiagnosisBasis,
    },
    Warning {
        index: usize,
        total: usize,
        message: String,
    },
    Finished {
        total: usize,
        cancelled: bool,
    },
}

/// Connection settings for the external classification model.
#[derive(Clone)]
pub struct ModelConfig {
    /// Base URL of an OpenAI-compatible chat completions API.
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            endpoint: model::chat::DEFAULT_ENDPOINT.to_string(),
            model: model::chat::DEFAULT_MODEL.to_string(),
            api_key: None,
        }
    }
}

impl std::fmt::Debug for ModelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelConfig")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Configuration for an audit run.
#[derive(Clone)]
pub struct Config {
    pub similarity_threshold_fuzzy_match: f64,
    pub similarity_threshold_duplicate: f64,
    /// Below this token-sort similarity between the cited text and the record
    /// its DOI resolves to, the match is flagged as a DOI mismatch.
    pub doi_mismatch_threshold: f64,
    pub cache_ttl_secs: u64,
    pub max_concurrency: usize,
    /// Retries after the first attempt of every registry call.
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub request_timeout_secs: u64,
    pub model_timeout_secs: u64,
    pub crossref_mailto: Option<String>,
    pub ncbi_api_key: Option<String>,
    pub model: Option<ModelConfig>,
    /// Path to the persistent SQLite cache. In-memory only when unset.
    pub cache_path: Option<PathBuf>,
    pub disabled_registries: Vec<String>,
    pub rate_limiters: Arc<RateLimiters>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field(
                "similarity_threshold_fuzzy_match",
                &self.similarity_threshold_fuzzy_match,
            )
            .field(
                "similarity_threshold_duplicate",
                &self.similarity_threshold_duplicate,
            )
            .field("doi_mismatch_threshold", &self.doi_mismatch_threshold)
            .field("cache_ttl_secs", &self.cache_ttl_secs)
            .field("max_concurrency", &self.max_concurrency)
            .field("max_retries", &self.max_retries)
            .field("retry_base_delay_ms", &self.retry_base_delay_ms)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("model_timeout_secs", &self.model_timeout_secs)
            .field(
                "crossref_mailto",
                &self.crossref_mailto.as_ref().map(|_| "***"),
            )
            .field("ncbi_api_key", &self.ncbi_api_key.as_ref().map(|_| "***"))
            .field("model", &self.model)
            .field("cache_path", &self.cache_path)
            .field("disabled_registries", &self.disabled_registries)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            similarity_threshold_fuzzy_match: 0.85,
            similarity_threshold_duplicate: 0.90,
            doi_mismatch_threshold: 0.60,
            cache_ttl_secs: DEFAULT_TTL.as_secs(),
            max_concurrency: 4,
            max_retries: 2,
            retry_base_delay_ms: 500,
            request_timeout_secs: 10,
            model_timeout_secs: 30,
            crossref_mailto: None,
            ncbi_api_key: None,
            model: None,
            cache_path: None,
            disabled_registries: vec![],
            rate_limiters: Arc::new(RateLimiters::default()),
        }
    }
}

impl Config {
    /// Reject settings that would make the run meaningless.
    pub fn validate(&self) -> Result<(), AuditError> {
        for (name, value) in [
            (
                "similarity_threshold_fuzzy_match",
                self.similarity_threshold_fuzzy_match,
            ),
            (
                "similarity_threshold_duplicate",
                self.similarity_threshold_duplicate,
            ),
            ("doi_mismatch_threshold", self.doi_mismatch_threshold),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(AuditError::Configuration(format!(
                    "{} must be in (0, 1], got {}",
                    name, value
                )));
            }
        }
        if self.cache_ttl_secs > MAX_TTL.as_secs() {
            return Err(AuditError::Configuration(format!(
                "cache_ttl_secs must be at most {} (ten years), got {}",
                MAX_TTL.as_secs(),
                self.cache_ttl_secs
            )));
        }
        if self.max_concurrency == 0 {
            return Err(AuditError::Configuration(
                "max_concurrency must be at least 1".into(),
            ));
        }
        if let Some(ref mailto) = self.crossref_mailto
            && !mailto.contains('@')
        {
            return Err(AuditError::Configuration(format!(
                "crossref_mailto is not an email address: {}",
                mailto
            )));
        }
        if let Some(ref model) = self.model
            && model.api_key.as_deref().is_none_or(str::is_empty)
        {
            return Err(AuditError::Configuration(format!(
                "classification model {} is configured without an API key",
                model.model
            )));
        }
        Ok(())
    }

    /// Rebuild the shared rate limiters for the configured credentials.
    ///
    /// A CrossRef `mailto` joins the polite pool and an NCBI key raises the
    /// E-utilities allowance; both pace faster than anonymous access.
    pub fn pace_for_credentials(&mut self) {
        self.rate_limiters = Arc::new(RateLimiters::new(
            self.crossref_mailto.is_some(),
            self.ncbi_api_key.as_deref().is_some_and(|k| !k.is_empty()),
        ));
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn model_timeout(&self) -> Duration {
        Duration::from_secs(self.model_timeout_secs)
    }

    /// The retry policy shared by the resolver and the retraction checker.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.max_retries.saturating_add(1),
            Duration::from_millis(self.retry_base_delay_ms),
            Duration::from_secs(8),
        )
    }

    pub fn is_registry_disabled(&self, name: &str) -> bool {
        self.disabled_registries
            .iter()
            .any(|d| d.eq_ignore_ascii_case(name))
    }
}

/// Build an [`AuditCache`] from configuration.
///
/// If `cache_path` is set, opens a persistent SQLite-backed cache.
/// Otherwise, returns an in-memory-only cache.
pub fn build_audit_cache(cache_path: Option<&std::path::Path>, ttl_secs: u64) -> Arc<AuditCache> {
    let ttl = Duration::from_secs(ttl_secs);
    if let Some(path) = cache_path {
        if let Some(parent) = path.parent()
            && let Err(e) = std::fs::create_dir_all(parent)
        {
            tracing::warn!(path = %parent.display(), error = %e, "failed to create cache directory");
        }
        match AuditCache::open(path, ttl) {
            Ok(cache) => {
                tracing::info!(path = %path.display(), "opened persistent cache");
                return Arc::new(cache);
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to open cache, falling back to in-memory");
            }
        }
    }
    Arc::new(AuditCache::new(ttl))
}



/// Audit a list of reference lines against the live registries.
///
/// Blank lines are audited like any other line (and fail to parse); callers
/// that want them skipped should filter before calling. Returns
/// [`AuditError::Configuration`] before any line is processed when the
/// configuration or credentials are unusable.
pub async fn audit_references(
    lines: Vec<String>,
    config: Config,
    progress: impl Fn(ProgressEvent) + Send + Sync + 'static,
    cancel: CancellationToken,
) -> Result<AuditReport, AuditError> {
    let cache = build_audit_cache(config.cache_path.as_deref(), config.cache_ttl_secs);
    let auditor = Auditor::builder(config)
        .cache(cache)
        .with_live_registries()?
        .build()?;
    Ok(auditor.audit(lines, progress, cancel).await)
}
