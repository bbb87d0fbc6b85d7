//! Retraction and correction status for resolved DOIs.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;

use crate::cache::{AuditCache, CacheKey, CachedValue};
use crate::registry::{RetractionRegistry, StatusReport};
use crate::retry::RetryPolicy;
use crate::{AuditError, RetractionState, RetractionStatus};

/// Status for one identifier plus any source failures met on the way.
#[derive(Debug, Clone, PartialEq)]
pub struct RetractionCheck {
    pub status: RetractionStatus,
    pub errors: Vec<AuditError>,
}

/// Queries every configured retraction source and combines their answers.
///
/// A work is only reported `Clean` when at least one source vouched for it
/// and no source failed. Only answers from runs where every source replied
/// are cached.
pub struct RetractionChecker {
    sources: Vec<Arc<dyn RetractionRegistry>>,
    cache: Arc<AuditCache>,
    retry: RetryPolicy,
    ttl: Duration,
}

impl RetractionChecker {
    pub fn new(
        sources: Vec<Arc<dyn RetractionRegistry>>,
        cache: Arc<AuditCache>,
        retry: RetryPolicy,
        ttl: Duration,
    ) -> Self {
        Self {
            sources,
            cache,
            retry,
            ttl,
        }
    }

    pub fn source_names(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.name()).collect()
    }

    pub async fn check(&self, doi: &str) -> RetractionCheck {
        let key = CacheKey::retraction(doi);
        let mut errors = Vec::new();
        let errors_slot = &mut errors;

        let fetched = self
            .cache
            .get_or_fetch(&key, self.ttl, move || async move {
                let (status, source_errors) = self.query_sources(doi).await;
                // Partial answers are not cached.
                let complete = source_errors.is_empty();
                *errors_slot = source_errors;
                if status.status == RetractionState::Unknown || !complete {
                    Err(status)
                } else {
                    Ok(CachedValue::Status(status))
                }
            })
            .await;

        let status = match fetched {
            Ok(CachedValue::Status(status)) => status,
            Ok(other) => {
                tracing::warn!(key = %key.key, ?other, "cache entry has the wrong shape");
                RetractionStatus::unknown(doi)
            }
            Err(unknown) => unknown,
        };
        RetractionCheck { status, errors }
    }

    async fn query_sources(&self, doi: &str) -> (RetractionStatus, Vec<AuditError>) {
        let answers = join_all(self.sources.iter().map(|source| async move {
            let operation = format!("{} retraction lookup", source.name());
            let answer = self
                .retry
                .run(&operation, |_| source.lookup_status(doi))
                .await
                .map_err(|e| e.into_audit_error(&operation));
            (source.name().to_string(), answer)
        }))
        .await;
        combine_reports(doi, answers)
    }
}

fn notice_text(report: &StatusReport, source: &str) -> String {
    let label = report.label.clone().unwrap_or_else(|| match report.state {
        RetractionState::Retracted => "Retraction".to_string(),
        _ => "Correction".to_string(),
    });
    match report.notice_identifier {
        Some(ref id) => format!("{} notice {} ({})", label, id, source),
        None => format!("{} ({})", label, source),
    }
}

/// Merge per-source answers: any retraction wins, then any correction.
/// `Clean` needs at least one clean answer and no failures.
pub fn combine_reports(
    doi: &str,
    answers: Vec<(String, Result<Option<StatusReport>, AuditError>)>,
) -> (RetractionStatus, Vec<AuditError>) {
    let mut errors = Vec::new();
    let mut retracted = None;
    let mut corrected = None;
    let mut clean_sources = 0;

    for (source, answer) in answers {
        match answer {
            Ok(Some(report)) => match report.state {
                RetractionState::Retracted if retracted.is_none() => {
                    retracted = Some(notice_text(&report, &source));
                }
                RetractionState::Corrected if corrected.is_none() => {
                    corrected = Some(notice_text(&report, &source));
                }
                RetractionState::Clean => clean_sources += 1,
                _ => {}
            },
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(doi, source = %source, error = %e, "retraction source failed");
                errors.push(e);
            }
        }
    }

    let (status, notice) = if let Some(notice) = retracted {
        (RetractionState::Retracted, Some(notice))
    } else if let Some(notice) = corrected {
        (RetractionState::Corrected, Some(notice))
    } else if clean_sources > 0 && errors.is_empty() {
        (RetractionState::Clean, None)
    } else {
        (RetractionState::Unknown, None)
    };

    let status = RetractionStatus {
        identifier: doi.to_string(),
        status,
        notice,
    };
    (status, errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::mock::MockRegistry;

    fn retracted_report() -> StatusReport {
        StatusReport {
            state: RetractionState::Retracted,
            notice_identifier: Some("10.1/notice".into()),
            label: Some("Retraction".into()),
        }
    }

    fn corrected_report() -> StatusReport {
        StatusReport {
            state: RetractionState::Corrected,
            notice_identifier: None,
            label: Some("Erratum".into()),
        }
    }

    fn transient() -> AuditError {
        AuditError::TransientNetwork {
            operation: "PubMed retraction lookup".into(),
            attempts: 3,
            message: "request timed out".into(),
        }
    }

    #[test]
    fn retraction_beats_everything() {
        let (status, errors) = combine_reports(
            "10.1/a",
            vec![
                ("CrossRef".into(), Ok(Some(corrected_report()))),
                ("PubMed".into(), Ok(Some(retracted_report()))),
            ],
        );
        assert_eq!(status.status, RetractionState::Retracted);
        assert_eq!(
            status.notice.as_deref(),
            Some("Retraction notice 10.1/notice (PubMed)")
        );
        assert!(errors.is_empty());
    }

    #[test]
    fn positive_finding_survives_other_failures() {
        let (status, errors) = combine_reports(
            "10.1/a",
            vec![
                ("CrossRef".into(), Ok(Some(corrected_report()))),
                ("PubMed".into(), Err(transient())),
            ],
        );
        assert_eq!(status.status, RetractionState::Corrected);
        assert_eq!(status.notice.as_deref(), Some("Erratum (CrossRef)"));
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn clean_requires_no_failures() {
        let (status, _) = combine_reports(
            "10.1/a",
            vec![
                ("CrossRef".into(), Ok(Some(StatusReport::clean()))),
                ("PubMed".into(), Err(transient())),
            ],
        );
        assert_eq!(status.status, RetractionState::Unknown);

        let (status, _) = combine_reports(
            "10.1/a",
            vec![
                ("CrossRef".into(), Ok(Some(StatusReport::clean()))),
                ("PubMed".into(), Ok(None)),
            ],
        );
        assert_eq!(status.status, RetractionState::Clean);
    }

    #[test]
    fn nobody_knows_the_work() {
        let (status, errors) = combine_reports("10.1/a", vec![("CrossRef".into(), Ok(None))]);
        assert_eq!(status.status, RetractionState::Unknown);
        assert!(errors.is_empty());
        let (status, _) = combine_reports("10.1/a", vec![]);
        assert_eq!(status.status, RetractionState::Unknown);
    }

    fn checker(sources: Vec<Arc<dyn RetractionRegistry>>) -> RetractionChecker {
        RetractionChecker::new(
            sources,
            Arc::new(AuditCache::default()),
            RetryPolicy::immediate(3),
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn clean_result_is_cached() {
        let source = Arc::new(MockRegistry::new("CrossRef").with_status("10.1/a", StatusReport::clean()));
        let checker = checker(vec![source.clone()]);
        assert_eq!(checker.check("10.1/a").await.status.status, RetractionState::Clean);
        assert_eq!(checker.check("10.1/A").await.status.status, RetractionState::Clean);
        assert_eq!(source.status_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_source_is_unknown_and_not_cached() {
        let source = Arc::new(MockRegistry::new("CrossRef").unreachable());
        let checker = checker(vec![source.clone()]);

        let first = checker.check("10.1/a").await;
        assert_eq!(first.status.status, RetractionState::Unknown);
        assert_eq!(first.status.identifier, "10.1/a");
        assert!(matches!(
            first.errors.as_slice(),
            [AuditError::TransientNetwork { attempts: 3, .. }]
        ));

        let _ = checker.check("10.1/a").await;
        assert_eq!(source.status_calls(), 6);
    }

    #[tokio::test]
    async fn all_sources_are_consulted() {
        let crossref = Arc::new(MockRegistry::new("CrossRef").with_status("10.1/a", StatusReport::clean()));
        let pubmed = Arc::new(MockRegistry::new("PubMed").with_status("10.1/a", retracted_report()));
        let checker = checker(vec![crossref.clone(), pubmed.clone()]);
        assert_eq!(checker.source_names(), vec!["CrossRef", "PubMed"]);

        let check = checker.check("10.1/a").await;
        assert_eq!(check.status.status, RetractionState::Retracted);
        assert_eq!(crossref.status_calls(), 1);
        assert_eq!(pubmed.status_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn correction_with_failed_source_is_asked_again() {
        let crossref = Arc::new(MockRegistry::new("CrossRef").with_status("10.1/a", corrected_report()));
        let pubmed = Arc::new(
            MockRegistry::new("PubMed")
                .with_status("10.1/a", retracted_report())
                .failing_times(3),
        );
        let checker = checker(vec![crossref.clone(), pubmed.clone()]);

        let first = checker.check("10.1/a").await;
        assert_eq!(first.status.status, RetractionState::Corrected);
        assert_eq!(first.errors.len(), 1);

        let second = checker.check("10.1/a").await;
        assert_eq!(second.status.status, RetractionState::Retracted);
        assert!(second.errors.is_empty());
        assert_eq!(crossref.status_calls(), 2);

        let _ = checker.check("10.1/a").await;
        assert_eq!(crossref.status_calls(), 2);
    }
}
