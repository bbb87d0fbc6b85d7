//! Classification model contract for references that fail to resolve.

pub mod chat;
pub mod mock;

use std::future::Future;
use std::pin::Pin;

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::DiagnosisKind;

/// What the model sees about an unresolved reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassificationRequest {
    pub title: Option<String>,
    pub venue: Option<String>,
    pub candidate_identifier: Option<String>,
    pub raw_text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("model request failed: {0}")]
    Http(String),
    #[error("model request timed out")]
    Timeout,
    #[error("model endpoint rate limited")]
    RateLimited,
    #[error("unrecognised model answer: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for ModelError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ModelError::Timeout
        } else {
            ModelError::Http(e.to_string())
        }
    }
}

pub type ModelFuture<'a> = Pin<Box<dyn Future<Output = Result<DiagnosisKind, ModelError>> + Send + 'a>>;

/// A model that labels the publication type of a reference.
pub trait ClassificationModel: Send + Sync {
    fn name(&self) -> &str;

    fn classify<'a>(&'a self, request: &'a ClassificationRequest) -> ModelFuture<'a>;
}

static LABEL: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)TYPE\s*[:：]\s*([A-Z_]+)").unwrap());

fn label_from_word(word: &str) -> Option<DiagnosisKind> {
    match word.to_ascii_uppercase().as_str() {
        "BOOK" => Some(DiagnosisKind::Book),
        "CONF" | "CONFERENCE" => Some(DiagnosisKind::Conference),
        "PREPRINT" => Some(DiagnosisKind::Preprint),
        "WEBSITE" | "WEBPAGE" | "WEB" => Some(DiagnosisKind::WebPage),
        "PATENT" => Some(DiagnosisKind::Patent),
        "HIGH_RISK" | "HIGHRISK" => Some(DiagnosisKind::HighRisk),
        "UNKNOWN" => Some(DiagnosisKind::Unknown),
        _ => None,
    }
}

/// Extract the `TYPE: <LABEL>` answer from a model reply.
pub fn parse_label(answer: &str) -> Result<DiagnosisKind, ModelError> {
    LABEL
        .captures(answer)
        .and_then(|caps| label_from_word(&caps[1]))
        .ok_or_else(|| {
            let snippet: String = answer.chars().take(80).collect();
            ModelError::Malformed(snippet)
        })
}

pub(crate) const SYSTEM_PROMPT: &str = "You are a bibliographic librarian. A citation could not be \
found in the CrossRef registry. Decide what kind of work it cites. Answer with exactly one line \
of the form TYPE: <LABEL>, where LABEL is one of BOOK, CONF, PREPRINT, WEBSITE, PATENT, \
HIGH_RISK, UNKNOWN. Use HIGH_RISK for a citation formatted like a journal article whose details \
look fabricated or inconsistent.";

/// User message describing the reference.
pub fn build_prompt(request: &ClassificationRequest) -> String {
    let mut prompt = format!("Citation: {}\n", request.raw_text.trim());
    if let Some(ref title) = request.title {
        prompt.push_str(&format!("Parsed title: {}\n", title));
    }
    if let Some(ref venue) = request.venue {
        prompt.push_str(&format!("Parsed venue: {}\n", venue));
    }
    if let Some(ref id) = request.candidate_identifier {
        prompt.push_str(&format!("Identifier: {}\n", id));
    }
    prompt
}
