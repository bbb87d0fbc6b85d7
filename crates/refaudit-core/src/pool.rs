//! Bounded worker pool for the per-reference stages.
//!
//! Each worker takes a raw line off a shared queue and carries it through
//! normalization, resolution and (when an identifier matched) the retraction
//! check. Results come back over a oneshot channel per job. Batch-level work
//! (duplicate detection, diagnosis) happens in the pipeline once every job
//! has reported.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::normalize::normalize;
use crate::resolver::{MetadataResolver, Resolution};
use crate::retraction::RetractionChecker;
use crate::{AuditError, MatchResult, ProgressEvent, RawReference, RetractionStatus};

/// A reference submitted to the pool.
pub struct ReferenceJob {
    pub raw: RawReference,
    pub result_tx: oneshot::Sender<StageOutcome>,
    pub total: usize,
    /// Progress callback for this job.
    pub progress: Arc<dyn Fn(ProgressEvent) + Send + Sync>,
}

/// What the per-reference stages produced for one line.
#[derive(Debug, Clone)]
pub enum StageOutcome {
    /// The line could not be normalized; no further stage ran.
    Unparseable {
        raw_index: usize,
        raw_text: String,
        error: AuditError,
    },
    Resolved {
        match_result: MatchResult,
        /// Present only when the match carries an identifier.
        retraction: Option<RetractionStatus>,
        errors: Vec<AuditError>,
    },
    /// The stages stopped abnormally; the line is reported with the error.
    Failed {
        raw_index: usize,
        raw_text: String,
        error: AuditError,
    },
}

impl StageOutcome {
    pub fn raw_index(&self) -> usize {
        match self {
            StageOutcome::Unparseable { raw_index, .. } | StageOutcome::Failed { raw_index, .. } => {
                *raw_index
            }
            StageOutcome::Resolved { match_result, .. } => match_result.raw_index(),
        }
    }
}

/// Worker tasks sharing one job queue.
///
/// Submit jobs via [`submit()`](ResolutionPool::submit) and await the oneshot
/// receiver paired with each job. After cancellation, queued and in-flight
/// jobs are dropped, which closes their receivers.
pub struct ResolutionPool {
    job_tx: async_channel::Sender<ReferenceJob>,
    pool_handle: JoinHandle<()>,
}

impl ResolutionPool {
    pub fn new(
        resolver: Arc<MetadataResolver>,
        checker: Arc<RetractionChecker>,
        cancel: CancellationToken,
        num_workers: usize,
    ) -> Self {
        let (job_tx, job_rx) = async_channel::unbounded::<ReferenceJob>();

        let pool_handle = tokio::spawn(async move {
            let mut handles = Vec::with_capacity(num_workers.max(1));
            for _ in 0..num_workers.max(1) {
                handles.push(tokio::spawn(worker_loop(
                    job_rx.clone(),
                    resolver.clone(),
                    checker.clone(),
                    cancel.clone(),
                )));
            }
            drop(job_rx);

            // Workers exit once the sender side is closed and the queue is empty.
            for h in handles {
                let _ = h.await;
            }
        });

        Self {
            job_tx,
            pool_handle,
        }
    }

    pub async fn submit(&self, job: ReferenceJob) {
        let _ = self.job_tx.send(job).await;
    }

    /// Close the queue and wait for every worker to finish.
    pub async fn shutdown(self) {
        self.job_tx.close();
        let _ = self.pool_handle.await;
    }
}

async fn worker_loop(
    job_rx: async_channel::Receiver<ReferenceJob>,
    resolver: Arc<MetadataResolver>,
    checker: Arc<RetractionChecker>,
    cancel: CancellationToken,
) {
    while let Ok(job) = job_rx.recv().await {
        // Keep draining after cancellation so every pending receiver closes.
        if cancel.is_cancelled() {
            continue;
        }

        let ReferenceJob {
            raw,
            result_tx,
            total,
            progress,
        } = job;
        let index = raw.raw_index;
        let raw_text = raw.text.clone();
        let stages = AssertUnwindSafe(run_stages(raw, total, progress.as_ref(), &resolver, &checker))
            .catch_unwind();

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(index, "reference abandoned on cancellation");
                None
            }
            outcome = stages => Some(outcome.unwrap_or_else(|panic| {
                let message = panic_message(panic.as_ref());
                tracing::error!(index, error = %message, "reference stages panicked");
                StageOutcome::Failed {
                    raw_index: index,
                    raw_text,
                    error: AuditError::Internal(message),
                }
            })),
        };

        if let Some(outcome) = outcome {
            let _ = result_tx.send(outcome);
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "worker panicked".into())
}

/// Normalize, resolve and retraction-check one reference.
async fn run_stages(
    raw: RawReference,
    total: usize,
    progress: &(dyn Fn(ProgressEvent) + Send + Sync),
    resolver: &MetadataResolver,
    checker: &RetractionChecker,
) -> StageOutcome {
    let index = raw.raw_index;

    let reference = match normalize(&raw) {
        Ok(reference) => reference,
        Err(error) => {
            progress(ProgressEvent::ParseFailed {
                index,
                total,
                message: error.to_string(),
            });
            return StageOutcome::Unparseable {
                raw_index: index,
                raw_text: raw.text,
                error,
            };
        }
    };

    progress(ProgressEvent::Resolving {
        index,
        total,
        title: reference.display_title(),
    });

    let Resolution {
        result: match_result,
        mut errors,
    } = resolver.resolve(&reference).await;

    for error in &errors {
        progress(ProgressEvent::Warning {
            index,
            total,
            message: error.to_string(),
        });
    }
    progress(ProgressEvent::Resolved {
        index,
        total,
        source: match_result.source,
        confidence: match_result.confidence,
    });

    let retraction = match match_result.matched_identifier {
        Some(ref identifier) => {
            let check = checker.check(identifier).await;
            for error in &check.errors {
                progress(ProgressEvent::Warning {
                    index,
                    total,
                    message: error.to_string(),
                });
            }
            progress(ProgressEvent::RetractionChecked {
                index,
                total,
                status: check.status.status,
            });
            errors.extend(check.errors);
            Some(check.status)
        }
        None => None,
    };

    StageOutcome::Resolved {
        match_result,
        retraction,
        errors,
    }
}
