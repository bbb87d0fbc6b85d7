//! In-memory registry for tests and offline runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use super::{
    ArticleIdRegistry, ArticleIds, MetadataRegistry, RegistryError, RegistryFuture,
    RegistryRecord, RetractionRegistry, SearchQuery, StatusReport,
};
use crate::matching::{normalize_text, token_set_similarity};

const MAX_CANDIDATES: usize = 5;

/// A hand-rolled registry implementing [`MetadataRegistry`],
/// [`RetractionRegistry`] and [`ArticleIdRegistry`].
///
/// Supports:
/// - Known records, looked up by DOI (case-insensitive) or ranked by title
///   similarity for searches. Search candidates share at least one word
///   with the query.
/// - Explicit retraction statuses. A known record without one is `Clean`.
/// - PubMed identifiers per DOI.
/// - A number of scripted transient failures, shared across all methods.
/// - A permanent error or a fully unreachable mode.
/// - A panicking mode, for exercising worker failure handling.
/// - Optional per-call latency and per-method call counters.
pub struct MockRegistry {
    name: &'static str,
    records: HashMap<String, RegistryRecord>,
    statuses: HashMap<String, StatusReport>,
    article_ids: HashMap<String, ArticleIds>,
    failures_remaining: AtomicU32,
    error: Option<RegistryError>,
    delay: Option<Duration>,
    panics: bool,
    identifier_calls: AtomicUsize,
    search_calls: AtomicUsize,
    status_calls: AtomicUsize,
    article_id_calls: AtomicUsize,
}

impl MockRegistry {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            records: HashMap::new(),
            statuses: HashMap::new(),
            article_ids: HashMap::new(),
            failures_remaining: AtomicU32::new(0),
            error: None,
            delay: None,
            panics: false,
            identifier_calls: AtomicUsize::new(0),
            search_calls: AtomicUsize::new(0),
            status_calls: AtomicUsize::new(0),
            article_id_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_record(mut self, record: RegistryRecord) -> Self {
        self.records
            .insert(record.identifier.to_lowercase(), record);
        self
    }

    pub fn with_status(mut self, doi: &str, status: StatusReport) -> Self {
        self.statuses.insert(doi.to_lowercase(), status);
        self
    }

    pub fn with_article_ids(mut self, doi: &str, ids: ArticleIds) -> Self {
        self.article_ids.insert(doi.to_lowercase(), ids);
        self
    }

    /// Fail the next `n` calls with a transient network error.
    pub fn failing_times(self, n: u32) -> Self {
        self.failures_remaining.store(n, Ordering::SeqCst);
        self
    }

    /// Every call times out.
    pub fn unreachable(self) -> Self {
        self.with_error(RegistryError::Timeout)
    }

    /// Every call fails with `error`.
    pub fn with_error(mut self, error: RegistryError) -> Self {
        self.error = Some(error);
        self
    }

    /// Every call panics.
    pub fn panicking(mut self) -> Self {
        self.panics = true;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn identifier_calls(&self) -> usize {
        self.identifier_calls.load(Ordering::SeqCst)
    }

    pub fn search_calls(&self) -> usize {
        self.search_calls.load(Ordering::SeqCst)
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub fn article_id_calls(&self) -> usize {
        self.article_id_calls.load(Ordering::SeqCst)
    }

    fn scripted_failure(&self) -> Option<RegistryError> {
        if let Some(ref error) = self.error {
            return Some(error.clone());
        }
        self.failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .ok()
            .map(|_| RegistryError::Network("connection reset by mock".into()))
    }

    async fn respond<T>(&self, answer: impl FnOnce() -> T) -> Result<T, RegistryError> {
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        if self.panics {
            panic!("{} registry panicked", self.name);
        }
        match self.scripted_failure() {
            Some(error) => Err(error),
            None => Ok(answer()),
        }
    }

    fn rank(&self, query: &SearchQuery) -> Vec<RegistryRecord> {
        let mut scored: Vec<(f64, &RegistryRecord)> = self
            .records
            .values()
            .filter(|r| match (query.year, r.year) {
                (Some(want), Some(have)) => (want - have).abs() <= 1,
                _ => true,
            })
            .filter(|r| shares_word(&query.title, &r.title))
            .map(|r| (token_set_similarity(&query.title, &r.title), r))
            .collect();
        scored.sort_by(|a, b| {
            b.0.total_cmp(&a.0)
                .then_with(|| a.1.identifier.cmp(&b.1.identifier))
        });
        scored
            .into_iter()
            .take(MAX_CANDIDATES)
            .map(|(_, r)| r.clone())
            .collect()
    }
}

fn shares_word(a: &str, b: &str) -> bool {
    let b = normalize_text(b);
    normalize_text(a)
        .split(' ')
        .filter(|w| !w.is_empty())
        .any(|w| b.split(' ').any(|other| other == w))
}

impl MetadataRegistry for MockRegistry {
    fn name(&self) -> &str {
        self.name
    }

    fn lookup_by_identifier<'a>(
        &'a self,
        doi: &'a str,
    ) -> RegistryFuture<'a, Option<RegistryRecord>> {
        self.identifier_calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(self.respond(move || self.records.get(&doi.to_lowercase()).cloned()))
    }

    fn search_by_fields<'a>(
        &'a self,
        query: &'a SearchQuery,
    ) -> RegistryFuture<'a, Vec<RegistryRecord>> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(self.respond(move || self.rank(query)))
    }
}

impl RetractionRegistry for MockRegistry {
    fn name(&self) -> &str {
        self.name
    }

    fn lookup_status<'a>(&'a self, doi: &'a str) -> RegistryFuture<'a, Option<StatusReport>> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(self.respond(move || {
            let key = doi.to_lowercase();
            self.statuses.get(&key).cloned().or_else(|| {
                self.records
                    .contains_key(&key)
                    .then(StatusReport::clean)
            })
        }))
    }
}

impl ArticleIdRegistry for MockRegistry {
    fn name(&self) -> &str {
        self.name
    }

    fn lookup_article_ids<'a>(&'a self, doi: &'a str) -> RegistryFuture<'a, Option<ArticleIds>> {
        self.article_id_calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(self.respond(move || self.article_ids.get(&doi.to_lowercase()).cloned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RetractionState;

    fn record(doi: &str, title: &str, year: i32) -> RegistryRecord {
        RegistryRecord {
            identifier: doi.into(),
            title: title.into(),
            year: Some(year),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn lookup_is_case_insensitive() {
        let mock = MockRegistry::new("Mock").with_record(record("10.1/ABC", "A Study of X", 2020));
        let found = mock.lookup_by_identifier("10.1/abc").await.unwrap();
        assert_eq!(found.unwrap().title, "A Study of X");
        assert!(mock.lookup_by_identifier("10.1/zzz").await.unwrap().is_none());
        assert_eq!(mock.identifier_calls(), 2);
    }

    #[tokio::test]
    async fn search_ranks_by_title() {
        let mock = MockRegistry::new("Mock")
            .with_record(record("10.1/a", "Graph neural networks for molecules", 2020))
            .with_record(record("10.1/b", "Graph neural networks", 2020))
            .with_record(record("10.1/c", "Baking bread at home", 2020));
        let query = SearchQuery {
            title: "Graph neural networks".into(),
            author: None,
            year: Some(2020),
        };
        let results = mock.search_by_fields(&query).await.unwrap();
        assert_eq!(results[0].identifier, "10.1/b");
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn search_filters_distant_years() {
        let mock = MockRegistry::new("Mock").with_record(record("10.1/a", "Graph networks", 2001));
        let query = SearchQuery {
            title: "Graph networks".into(),
            author: None,
            year: Some(2020),
        };
        assert!(mock.search_by_fields(&query).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn scripted_failures_then_success() {
        let mock = MockRegistry::new("Mock")
            .with_record(record("10.1/a", "T", 2020))
            .failing_times(2);
        assert!(mock.lookup_by_identifier("10.1/a").await.is_err());
        assert!(mock.lookup_status("10.1/a").await.is_err());
        let status = mock.lookup_status("10.1/a").await.unwrap().unwrap();
        assert_eq!(status.state, RetractionState::Clean);
    }

    #[tokio::test]
    async fn explicit_status_and_unknown_doi() {
        let retracted = StatusReport {
            state: RetractionState::Retracted,
            notice_identifier: Some("10.1/notice".into()),
            label: Some("Retraction".into()),
        };
        let mock = MockRegistry::new("Mock").with_status("10.1/R", retracted.clone());
        assert_eq!(mock.lookup_status("10.1/r").await.unwrap(), Some(retracted));
        assert_eq!(mock.lookup_status("10.1/other").await.unwrap(), None);
    }

    #[tokio::test]
    async fn unreachable_always_times_out() {
        let mock = MockRegistry::new("Mock").unreachable();
        for _ in 0..3 {
            assert_eq!(
                mock.lookup_status("10.1/a").await,
                Err(RegistryError::Timeout)
            );
        }
        assert_eq!(mock.status_calls(), 3);
    }
}
