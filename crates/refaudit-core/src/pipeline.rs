//! Batch orchestration: pool → barrier → duplicate detection → diagnosis.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::cache::AuditCache;
use crate::dedup::DuplicateDetector;
use crate::diagnosis::{Diagnosis, DiagnosisClassifier};
use crate::model::ClassificationModel;
use crate::model::chat::ChatModel;
use crate::pool::{ReferenceJob, ResolutionPool, StageOutcome};
use crate::registry::crossref::CrossRef;
use crate::registry::pubmed::PubMed;
use crate::registry::{ArticleIdRegistry, MetadataRegistry, RetractionRegistry, build_client};
use crate::resolver::MetadataResolver;
use crate::retraction::RetractionChecker;
use crate::retry::RetryPolicy;
use crate::stats::AuditStats;
use crate::{AuditError, AuditRecord, Config, DuplicateGroup, GroupKind, ProgressEvent, RawReference};

/// Everything an audit run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditReport {
    /// One record per finalized input line, ordered by `raw_index`.
    pub records: Vec<AuditRecord>,
    pub duplicate_groups: Vec<DuplicateGroup>,
    pub stats: AuditStats,
    /// The run was cancelled; `records` holds only finalized lines.
    pub cancelled: bool,
}

/// Runs the full audit pipeline over a batch of reference lines.
///
/// Built with [`Auditor::builder`]. Registries, model and cache are injected
/// so tests can substitute in-memory doubles.
pub struct Auditor {
    resolver: Arc<MetadataResolver>,
    checker: Arc<RetractionChecker>,
    detector: DuplicateDetector,
    classifier: Arc<DiagnosisClassifier>,
    cache: Arc<AuditCache>,
    concurrency: usize,
}

pub struct AuditorBuilder {
    config: Config,
    metadata: Option<Arc<dyn MetadataRegistry>>,
    retraction_sources: Vec<Arc<dyn RetractionRegistry>>,
    article_ids: Option<Arc<dyn ArticleIdRegistry>>,
    model: Option<Arc<dyn ClassificationModel>>,
    cache: Option<Arc<AuditCache>>,
    retry: Option<RetryPolicy>,
}

impl AuditorBuilder {
    pub fn metadata_registry(mut self, registry: Arc<dyn MetadataRegistry>) -> Self {
        self.metadata = Some(registry);
        self
    }

    /// Add a retraction source. Sources are consulted in the order added.
    pub fn retraction_registry(mut self, registry: Arc<dyn RetractionRegistry>) -> Self {
        self.retraction_sources.push(registry);
        self
    }

    /// Source of PMIDs and PMCIDs for matched DOIs.
    pub fn article_id_registry(mut self, registry: Arc<dyn ArticleIdRegistry>) -> Self {
        self.article_ids = Some(registry);
        self
    }

    pub fn classification_model(mut self, model: Arc<dyn ClassificationModel>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn cache(mut self, cache: Arc<AuditCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Override the retry policy derived from the configuration.
    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Register CrossRef, PubMed (unless disabled) and the configured
    /// classification model. PubMed ids are looked up only with an NCBI key.
    ///
    /// Fails when `crossref_mailto` is missing or CrossRef is disabled.
    pub fn with_live_registries(mut self) -> Result<Self, AuditError> {
        let Some(mailto) = self.config.crossref_mailto.clone() else {
            return Err(AuditError::Configuration(
                "crossref_mailto is required for live registry access".into(),
            ));
        };
        if self.config.is_registry_disabled("CrossRef") {
            return Err(AuditError::Configuration(
                "CrossRef is the metadata registry and cannot be disabled".into(),
            ));
        }

        let client = build_client(self.config.request_timeout())
            .map_err(|e| AuditError::Configuration(format!("HTTP client: {}", e)))?;
        let limiters = self.config.rate_limiters.clone();

        let crossref = Arc::new(CrossRef::new(client.clone(), Some(mailto), limiters.clone()));
        self.metadata = Some(crossref.clone());
        self.retraction_sources.push(crossref);

        if !self.config.is_registry_disabled("PubMed") {
            let pubmed = Arc::new(PubMed::new(
                client,
                self.config.ncbi_api_key.clone(),
                limiters.clone(),
            ));
            if self.config.ncbi_api_key.as_deref().is_some_and(|k| !k.is_empty()) {
                self.article_ids = Some(pubmed.clone());
            }
            self.retraction_sources.push(pubmed);
        }

        if let Some(ref model_config) = self.config.model {
            let model = ChatModel::new(model_config.clone(), self.config.model_timeout(), limiters)
                .map_err(|e| AuditError::Configuration(format!("classification model: {}", e)))?;
            self.model = Some(Arc::new(model));
        }

        Ok(self)
    }

    pub fn build(self) -> Result<Auditor, AuditError> {
        self.config.validate()?;
        let Some(metadata) = self.metadata else {
            return Err(AuditError::Configuration(
                "no metadata registry configured".into(),
            ));
        };

        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(AuditCache::new(self.config.cache_ttl())));
        let retry = self.retry.unwrap_or_else(|| self.config.retry_policy());

        let mut resolver = MetadataResolver::new(metadata, cache.clone(), retry.clone(), &self.config);
        if let Some(source) = self.article_ids {
            resolver = resolver.with_article_id_registry(source);
        }
        let checker = RetractionChecker::new(
            self.retraction_sources,
            cache.clone(),
            retry,
            self.config.cache_ttl(),
        );

        Ok(Auditor {
            resolver: Arc::new(resolver),
            checker: Arc::new(checker),
            detector: DuplicateDetector::new(self.config.similarity_threshold_duplicate),
            classifier: Arc::new(DiagnosisClassifier::new(
                self.model,
                self.config.model_timeout(),
            )),
            cache,
            concurrency: self.config.max_concurrency.max(1),
        })
    }
}

impl Auditor {
    pub fn builder(config: Config) -> AuditorBuilder {
        AuditorBuilder {
            config,
            metadata: None,
            retraction_sources: Vec::new(),
            article_ids: None,
            model: None,
            cache: None,
            retry: None,
        }
    }

    pub fn cache(&self) -> &Arc<AuditCache> {
        &self.cache
    }

    /// Audit `lines`, one reference per entry.
    ///
    /// Every line yields exactly one record unless the run is cancelled, in
    /// which case only records that were already final are returned.
    pub async fn audit(
        &self,
        lines: Vec<String>,
        progress: impl Fn(ProgressEvent) + Send + Sync + 'static,
        cancel: CancellationToken,
    ) -> AuditReport {
        let total = lines.len();
        let progress: Arc<dyn Fn(ProgressEvent) + Send + Sync> = Arc::new(progress);
        progress(ProgressEvent::Started { total });
        tracing::info!(total, concurrency = self.concurrency, "audit started");

        let outcomes = self.resolve_all(lines, total, &progress, &cancel).await;

        if cancel.is_cancelled() {
            return self.finish_cancelled(outcomes, total, progress.as_ref());
        }

        // Barrier reached: every reference is resolved.
        let match_results: Vec<_> = outcomes
            .iter()
            .filter_map(|o| match o {
                StageOutcome::Resolved { match_result, .. } => Some(match_result.clone()),
                StageOutcome::Unparseable { .. } | StageOutcome::Failed { .. } => None,
            })
            .collect();
        let groups = self.detector.detect(&match_results);
        let exact_groups = groups
            .iter()
            .filter(|g| g.kind == GroupKind::ExactIdentifier)
            .count();
        progress(ProgressEvent::DuplicatesDetected {
            exact_groups,
            fuzzy_groups: groups.len() - exact_groups,
        });

        let diagnoses = self
            .diagnose_all(&match_results, progress.as_ref(), &cancel)
            .await;
        let cancelled = cancel.is_cancelled();

        let mut records: Vec<AuditRecord> = outcomes
            .into_iter()
            .filter_map(|outcome| assemble(outcome, &groups, &diagnoses))
            .collect();
        records.sort_by_key(|r| r.raw_index);

        let stats = AuditStats::from_records(&records);
        progress(ProgressEvent::Finished {
            total: records.len(),
            cancelled,
        });
        tracing::info!(
            total,
            emitted = records.len(),
            cancelled,
            cache_hits = self.cache.hits(),
            cache_misses = self.cache.misses(),
            "audit finished"
        );

        AuditReport {
            records,
            duplicate_groups: groups,
            stats,
            cancelled,
        }
    }

    async fn resolve_all(
        &self,
        lines: Vec<String>,
        total: usize,
        progress: &Arc<dyn Fn(ProgressEvent) + Send + Sync>,
        cancel: &CancellationToken,
    ) -> Vec<StageOutcome> {
        let pool = ResolutionPool::new(
            self.resolver.clone(),
            self.checker.clone(),
            cancel.clone(),
            self.concurrency,
        );

        let mut receivers = Vec::with_capacity(total);
        for (i, text) in lines.into_iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }
            let (result_tx, result_rx) = tokio::sync::oneshot::channel();
            pool.submit(ReferenceJob {
                raw: RawReference::new(i, text.clone()),
                result_tx,
                total,
                progress: progress.clone(),
            })
            .await;
            receivers.push((i, text, result_rx));
        }

        let mut outcomes = Vec::with_capacity(receivers.len());
        for (raw_index, raw_text, rx) in receivers {
            match rx.await {
                Ok(outcome) => outcomes.push(outcome),
                // Cancelled jobs produce no record.
                Err(_) if cancel.is_cancelled() => {}
                Err(_) => {
                    tracing::error!(index = raw_index, "reference dropped without a result");
                    outcomes.push(StageOutcome::Failed {
                        raw_index,
                        raw_text,
                        error: AuditError::Internal(
                            "reference was dropped before it was resolved".into(),
                        ),
                    });
                }
            }
        }

        pool.shutdown().await;
        outcomes
    }

    async fn diagnose_all(
        &self,
        results: &[crate::MatchResult],
        progress: &(dyn Fn(ProgressEvent) + Send + Sync),
        cancel: &CancellationToken,
    ) -> HashMap<usize, Diagnosis> {
        let mut diagnoses = HashMap::new();
        let mut pending = futures_util::stream::iter(results.iter().filter(|r| !r.is_matched()))
            .map(|result| {
                let classifier = self.classifier.clone();
                async move { classifier.diagnose(result).await }
            })
            .buffer_unordered(self.concurrency);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = pending.next() => match next {
                    Some(Some(diagnosis)) => {
                        progress(ProgressEvent::Diagnosed {
                            index: diagnosis.label.raw_index,
                            label: diagnosis.label.label,
                            basis: diagnosis.label.basis,
                        });
                        diagnoses.insert(diagnosis.label.raw_index, diagnosis);
                    }
                    Some(None) => {}
                    None => break,
                },
            }
        }
        diagnoses
    }

    fn finish_cancelled(
        &self,
        outcomes: Vec<StageOutcome>,
        total: usize,
        progress: &(dyn Fn(ProgressEvent) + Send + Sync),
    ) -> AuditReport {
        let no_groups: Vec<DuplicateGroup> = Vec::new();
        let no_diagnoses = HashMap::new();
        let mut records: Vec<AuditRecord> = outcomes
            .into_iter()
            .filter(|o| matches!(o, StageOutcome::Unparseable { .. } | StageOutcome::Failed { .. }))
            .filter_map(|o| assemble(o, &no_groups, &no_diagnoses))
            .collect();
        records.sort_by_key(|r| r.raw_index);

        tracing::info!(total, emitted = records.len(), "audit cancelled before duplicate detection");
        progress(ProgressEvent::Finished {
            total: records.len(),
            cancelled: true,
        });
        AuditReport {
            stats: AuditStats::from_records(&records),
            records,
            duplicate_groups: no_groups,
            cancelled: true,
        }
    }
}

fn group_key(groups: &[DuplicateGroup], kind: GroupKind, raw_index: usize) -> Option<usize> {
    groups
        .iter()
        .find(|g| g.kind == kind && g.members.contains(&raw_index))
        .map(|g| g.key)
}

/// Build the final record for one outcome. `None` when the reference still
/// needed a diagnosis that never arrived.
fn assemble(
    outcome: StageOutcome,
    groups: &[DuplicateGroup],
    diagnoses: &HashMap<usize, Diagnosis>,
) -> Option<AuditRecord> {
    match outcome {
        StageOutcome::Unparseable {
            raw_index,
            raw_text,
            error,
        }
        | StageOutcome::Failed {
            raw_index,
            raw_text,
            error,
        } => Some(AuditRecord {
            raw_index,
            raw_text,
            match_result: None,
            retraction: None,
            exact_duplicate_group: None,
            fuzzy_duplicate_group: None,
            diagnosis: None,
            search_query: None,
            errors: vec![error],
        }),
        StageOutcome::Resolved {
            match_result,
            retraction,
            mut errors,
        } => {
            let raw_index = match_result.raw_index();
            let (diagnosis, search_query) = if match_result.is_matched() {
                (None, None)
            } else {
                let diagnosis = diagnoses.get(&raw_index)?;
                if let Some(ref e) = diagnosis.error {
                    errors.push(e.clone());
                }
                (
                    Some(diagnosis.label.clone()),
                    Some(diagnosis.search_query.clone()),
                )
            };
            Some(AuditRecord {
                raw_index,
                raw_text: match_result.reference.raw_text.clone(),
                exact_duplicate_group: group_key(groups, GroupKind::ExactIdentifier, raw_index),
                fuzzy_duplicate_group: group_key(groups, GroupKind::FuzzyText, raw_index),
                match_result: Some(match_result),
                retraction,
                diagnosis,
                search_query,
                errors,
            })
        }
    }
}
