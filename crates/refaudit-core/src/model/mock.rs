//! Canned classification model for tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::{ClassificationModel, ClassificationRequest, ModelError, ModelFuture};
use crate::DiagnosisKind;

pub struct MockModel {
    answer: Result<DiagnosisKind, ModelError>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl MockModel {
    /// Always answers `label`.
    pub fn answering(label: DiagnosisKind) -> Self {
        Self {
            answer: Ok(label),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Always fails with `error`.
    pub fn failing(error: ModelError) -> Self {
        Self {
            answer: Err(error),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ClassificationModel for MockModel {
    fn name(&self) -> &str {
        "mock"
    }

    fn classify<'a>(&'a self, _request: &'a ClassificationRequest) -> ModelFuture<'a> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let answer = self.answer.clone();
        let delay = self.delay;
        Box::pin(async move {
            if let Some(d) = delay {
                tokio::time::sleep(d).await;
            }
            answer
        })
    }
}
