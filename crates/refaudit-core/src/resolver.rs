//! Resolve normalized references against the metadata registry.
//!
//! An explicit DOI is looked up first. When it is missing or unknown to the
//! registry, a fielded search on title, first author and year is scored by
//! token-set similarity against the top candidate. A reference that was only
//! known by its DOI is segmented from the text around the DOI for that search.
//! Matched DOIs are mapped to PubMed identifiers when a source for them is set.

use std::sync::Arc;
use std::time::Duration;

use crate::cache::{AuditCache, CacheKey, CachedValue};
use crate::citation::format_apa;
use crate::matching::{token_set_similarity, token_sort_similarity};
use crate::normalize::segment_without_identifiers;
use crate::registry::{ArticleIdRegistry, ArticleIds, MetadataRegistry, RegistryRecord, SearchQuery};
use crate::retry::RetryPolicy;
use crate::{AuditError, Config, Identifier, MatchResult, MatchSource, NormalizedReference};

/// Outcome of resolving one reference: the match plus any degradations.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub result: MatchResult,
    pub errors: Vec<AuditError>,
}

pub struct MetadataResolver {
    registry: Arc<dyn MetadataRegistry>,
    article_ids: Option<Arc<dyn ArticleIdRegistry>>,
    cache: Arc<AuditCache>,
    retry: RetryPolicy,
    ttl: Duration,
    fuzzy_threshold: f64,
    mismatch_threshold: f64,
}

impl MetadataResolver {
    pub fn new(
        registry: Arc<dyn MetadataRegistry>,
        cache: Arc<AuditCache>,
        retry: RetryPolicy,
        config: &Config,
    ) -> Self {
        Self {
            registry,
            article_ids: None,
            cache,
            retry,
            ttl: config.cache_ttl(),
            fuzzy_threshold: config.similarity_threshold_fuzzy_match,
            mismatch_threshold: config.doi_mismatch_threshold,
        }
    }

    /// Look matched DOIs up in `registry` for their PMID and PMCID.
    pub fn with_article_id_registry(mut self, registry: Arc<dyn ArticleIdRegistry>) -> Self {
        self.article_ids = Some(registry);
        self
    }

    /// Resolve one reference. Never fails: registry errors are recorded in
    /// [`Resolution::errors`] and degrade the result to `NoMatch`. A failed
    /// PubMed id lookup keeps the match and only adds an error.
    pub async fn resolve(&self, reference: &NormalizedReference) -> Resolution {
        let mut resolution = self.match_reference(reference).await;

        if let Some(ref source) = self.article_ids
            && let Some(doi) = resolution.result.matched_identifier.clone()
        {
            match self.lookup_article_ids(source.as_ref(), &doi).await {
                Ok(Some(ids)) => {
                    if let Some(ref mut metadata) = resolution.result.matched_metadata {
                        metadata.pmid = ids.pmid;
                        metadata.pmcid = ids.pmcid;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::debug!(index = reference.raw_index, doi = %doi, error = %e, "article id lookup failed");
                    resolution.errors.push(e);
                }
            }
        }
        resolution
    }

    async fn match_reference(&self, reference: &NormalizedReference) -> Resolution {
        let mut errors = Vec::new();

        if let Some(Identifier::Doi(ref doi)) = reference.candidate_identifier {
            match self.lookup_identifier(doi).await {
                Ok(Some(record)) => {
                    let result = self.identifier_match(reference, record);
                    return Resolution { result, errors };
                }
                Ok(None) => {
                    tracing::debug!(index = reference.raw_index, doi = %doi, "identifier not in registry");
                }
                Err(e) => {
                    tracing::debug!(index = reference.raw_index, doi = %doi, error = %e, "identifier lookup failed");
                    errors.push(e);
                }
            }
        }

        // A DOI line is not segmented up front; search with the text around it.
        let segmented = match reference.candidate_identifier {
            Some(Identifier::Doi(_)) if reference.title.is_none() => {
                Some(segment_without_identifiers(reference))
            }
            _ => None,
        };
        let reference = segmented.as_ref().unwrap_or(reference);

        let Some(ref title) = reference.title else {
            return Resolution {
                result: MatchResult::no_match(reference.clone(), 0.0),
                errors,
            };
        };

        let query = SearchQuery {
            title: title.clone(),
            author: reference.first_author_surname().map(str::to_string),
            year: reference.year,
        };

        let result = match self.search(&query).await {
            Ok(candidates) => self.score_top_candidate(reference, title, candidates),
            Err(e) => {
                tracing::debug!(index = reference.raw_index, error = %e, "search failed");
                errors.push(e);
                MatchResult::no_match(reference.clone(), 0.0)
            }
        };
        Resolution { result, errors }
    }

    fn identifier_match(&self, reference: &NormalizedReference, record: RegistryRecord) -> MatchResult {
        let doi_mismatch = !record.title.trim().is_empty()
            && token_sort_similarity(&reference.raw_text, &format_apa(&record))
                < self.mismatch_threshold;
        if doi_mismatch {
            tracing::debug!(
                index = reference.raw_index,
                doi = %record.identifier,
                "cited text differs from the record its DOI resolves to"
            );
        }
        MatchResult {
            reference: reference.clone(),
            matched_identifier: Some(record.identifier.clone()),
            confidence: 1.0,
            matched_metadata: Some(record.to_metadata()),
            source: MatchSource::IdentifierExact,
            doi_mismatch,
        }
    }

    fn score_top_candidate(
        &self,
        reference: &NormalizedReference,
        title: &str,
        candidates: Vec<RegistryRecord>,
    ) -> MatchResult {
        let Some(top) = candidates.into_iter().next() else {
            return MatchResult::no_match(reference.clone(), 0.0);
        };
        let score = token_set_similarity(title, &top.title);
        if score < self.fuzzy_threshold {
            tracing::debug!(
                index = reference.raw_index,
                score,
                candidate = %top.title,
                "top candidate below threshold"
            );
            return MatchResult::no_match(reference.clone(), score);
        }
        MatchResult {
            reference: reference.clone(),
            matched_identifier: Some(top.identifier.clone()).filter(|id| !id.is_empty()),
            confidence: score,
            matched_metadata: Some(top.to_metadata()),
            source: MatchSource::FuzzyTitleMatch,
            doi_mismatch: false,
        }
    }

    async fn lookup_identifier(&self, doi: &str) -> Result<Option<RegistryRecord>, AuditError> {
        let key = CacheKey::identifier(doi);
        let operation = format!("{} identifier lookup", self.registry.name());
        let value = self
            .cache
            .get_or_fetch(&key, self.ttl, || async {
                self.retry
                    .run(&operation, |_| self.registry.lookup_by_identifier(doi))
                    .await
                    .map(CachedValue::Record)
            })
            .await
            .map_err(|e| e.into_audit_error(&operation))?;
        match value {
            CachedValue::Record(record) => Ok(record),
            other => Err(unexpected_cache_value(&key, &other)),
        }
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<RegistryRecord>, AuditError> {
        let key = CacheKey::search(&query.title, query.author.as_deref(), query.year);
        let operation = format!("{} search", self.registry.name());
        let value = self
            .cache
            .get_or_fetch(&key, self.ttl, || async {
                self.retry
                    .run(&operation, |_| self.registry.search_by_fields(query))
                    .await
                    .map(CachedValue::Candidates)
            })
            .await
            .map_err(|e| e.into_audit_error(&operation))?;
        match value {
            CachedValue::Candidates(candidates) => Ok(candidates),
            other => Err(unexpected_cache_value(&key, &other)),
        }
    }

    async fn lookup_article_ids(
        &self,
        source: &dyn ArticleIdRegistry,
        doi: &str,
    ) -> Result<Option<ArticleIds>, AuditError> {
        let key = CacheKey::article_ids(doi);
        let operation = format!("{} article id lookup", source.name());
        let value = self
            .cache
            .get_or_fetch(&key, self.ttl, || async {
                self.retry
                    .run(&operation, |_| source.lookup_article_ids(doi))
                    .await
                    .map(CachedValue::ArticleIds)
            })
            .await
            .map_err(|e| e.into_audit_error(&operation))?;
        match value {
            CachedValue::ArticleIds(ids) => Ok(ids),
            other => Err(unexpected_cache_value(&key, &other)),
        }
    }
}

fn unexpected_cache_value(key: &CacheKey, value: &CachedValue) -> AuditError {
    tracing::warn!(namespace = key.namespace.as_str(), key = %key.key, ?value, "cache entry has the wrong shape");
    AuditError::Registry {
        operation: "cache read".into(),
        message: format!("unexpected entry for {}", key.key),
    }
}
