//! Diagnosis of references that did not resolve.
//!
//! Cheap pattern rules run first. Only when none fires is the external
//! classification model consulted, and its failure degrades to `Unknown`.

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::identifiers::{extract_arxiv_id, extract_isbn, strip_urls};
use crate::model::{ClassificationModel, ClassificationRequest};
use crate::{AuditError, DiagnosisBasis, DiagnosisKind, DiagnosisLabel, Identifier, MatchResult, NormalizedReference};

static CONFERENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bproceedings\s+of\b|\bproc\.|\bconference\b|\bconf\.|\bsymposium\b|\bworkshop\b").unwrap()
});

static PREPRINT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:arxiv|biorxiv|medrxiv|ssrn)\b").unwrap());

static EDITORS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\(?\bEds?\.\)?").unwrap());

/// Titles shorter than this get author and year appended to the search query.
const SHORT_TITLE_WORDS: usize = 5;

/// Pattern rules, in priority order: Conference, Preprint, Book, WebPage.
pub fn heuristic_label(reference: &NormalizedReference) -> Option<DiagnosisKind> {
    let fields = [reference.venue.as_deref(), reference.title.as_deref()];
    if fields.iter().flatten().any(|f| CONFERENCE.is_match(f)) {
        return Some(DiagnosisKind::Conference);
    }

    let raw = &reference.raw_text;
    if PREPRINT.is_match(raw) || extract_arxiv_id(raw).is_some() {
        return Some(DiagnosisKind::Preprint);
    }
    if extract_isbn(raw).is_some() || EDITORS.is_match(raw) {
        return Some(DiagnosisKind::Book);
    }
    if matches!(reference.candidate_identifier, Some(Identifier::Url(_))) {
        return Some(DiagnosisKind::WebPage);
    }
    None
}

/// A scholar search query for locating the cited work by hand.
///
/// The title is quoted. Short titles and books also get the first author's
/// surname and the year, which disambiguate generic titles.
pub fn build_search_query(reference: &NormalizedReference, label: DiagnosisKind) -> String {
    let Some(ref title) = reference.title else {
        return strip_urls(&reference.raw_text)
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
    };

    let mut query = format!("\"{}\"", title.trim());
    if title.split_whitespace().count() < SHORT_TITLE_WORDS || label == DiagnosisKind::Book {
        if let Some(author) = reference.first_author_surname() {
            query.push(' ');
            query.push_str(author);
        }
        if let Some(year) = reference.year {
            query.push_str(&format!(" {}", year));
        }
    }
    query
}

/// Diagnosis for one unresolved reference.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnosis {
    pub label: DiagnosisLabel,
    pub search_query: String,
    /// Set when the model was consulted and failed.
    pub error: Option<AuditError>,
}

pub struct DiagnosisClassifier {
    model: Option<Arc<dyn ClassificationModel>>,
    timeout: Duration,
}

impl DiagnosisClassifier {
    pub fn new(model: Option<Arc<dyn ClassificationModel>>, timeout: Duration) -> Self {
        Self { model, timeout }
    }

    /// Label an unresolved reference. Returns `None` for matched references.
    pub async fn diagnose(&self, result: &MatchResult) -> Option<Diagnosis> {
        if result.is_matched() {
            return None;
        }
        let reference = &result.reference;

        let (label, basis, error) = match heuristic_label(reference) {
            Some(label) => (label, DiagnosisBasis::Heuristic, None),
            None => match self.ask_model(reference).await {
                Ok(label) => (label, DiagnosisBasis::ModelInference, None),
                Err(e) => (DiagnosisKind::Unknown, DiagnosisBasis::Heuristic, e),
            },
        };

        Some(Diagnosis {
            label: DiagnosisLabel {
                raw_index: reference.raw_index,
                label,
                basis,
            },
            search_query: build_search_query(reference, label),
            error,
        })
    }

    /// `Err(None)` when no model is configured.
    async fn ask_model(&self, reference: &NormalizedReference) -> Result<DiagnosisKind, Option<AuditError>> {
        let Some(ref model) = self.model else {
            return Err(None);
        };
        let request = ClassificationRequest {
            title: reference.title.clone(),
            venue: reference.venue.clone(),
            candidate_identifier: reference.candidate_identifier.as_ref().map(|id| id.as_str().to_string()),
            raw_text: reference.raw_text.clone(),
        };

        let outcome = tokio::time::timeout(self.timeout, model.classify(&request)).await;
        let message = match outcome {
            Ok(Ok(label)) => return Ok(label),
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("{} timed out after {}s", model.name(), self.timeout.as_secs()),
        };
        tracing::warn!(index = reference.raw_index, error = %message, "classification failed, labelling Unknown");
        Err(Some(AuditError::ModelInference(message)))
    }
}
