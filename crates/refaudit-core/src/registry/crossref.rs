use super::{
    Author, MetadataRegistry, RegistryError, RegistryFuture, RegistryRecord, RetractionRegistry,
    SearchQuery, StatusReport, get_json, throttled,
};
use crate::RetractionState;
use crate::rate_limit::RateLimiters;
use serde_json::Value;
use std::sync::Arc;

const API_BASE: &str = "https://api.crossref.org";
const SEARCH_ROWS: &str = "5";

/// CrossRef REST API: DOI lookups, bibliographic search and update notices.
pub struct CrossRef {
    client: reqwest::Client,
    mailto: Option<String>,
    limiters: Arc<RateLimiters>,
    base_url: String,
}

impl CrossRef {
    pub fn new(client: reqwest::Client, mailto: Option<String>, limiters: Arc<RateLimiters>) -> Self {
        Self {
            client,
            mailto,
            limiters,
            base_url: API_BASE.to_string(),
        }
    }

    /// Point at a different API root (a mirror or a local stub server).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn user_agent(&self) -> String {
        match self.mailto {
            Some(ref email) => format!("refaudit/{} (mailto:{})", env!("CARGO_PKG_VERSION"), email),
            None => format!("refaudit/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    fn work_request(&self, doi: &str) -> reqwest::RequestBuilder {
        let mut request = self
            .client
            .get(format!("{}/works/{}", self.base_url, urlencoding::encode(doi)))
            .header("User-Agent", self.user_agent());
        if let Some(ref email) = self.mailto {
            request = request.query(&[("mailto", email.as_str())]);
        }
        request
    }

    async fn fetch_work(&self, doi: &str) -> Result<Option<Value>, RegistryError> {
        let body = throttled(&self.limiters, "CrossRef", get_json(self.work_request(doi))).await?;
        Ok(body.map(|mut b| b["message"].take()))
    }
}

impl MetadataRegistry for CrossRef {
    fn name(&self) -> &str {
        "CrossRef"
    }

    fn lookup_by_identifier<'a>(
        &'a self,
        doi: &'a str,
    ) -> RegistryFuture<'a, Option<RegistryRecord>> {
        Box::pin(async move {
            let work = self.fetch_work(doi).await?;
            Ok(work.as_ref().and_then(parse_work))
        })
    }

    fn search_by_fields<'a>(
        &'a self,
        query: &'a SearchQuery,
    ) -> RegistryFuture<'a, Vec<RegistryRecord>> {
        Box::pin(async move {
            let mut params: Vec<(&str, String)> = vec![
                ("query.bibliographic", query.title.clone()),
                ("rows", SEARCH_ROWS.to_string()),
            ];
            if let Some(ref author) = query.author {
                params.push(("query.author", author.clone()));
            }
            if let Some(year) = query.year {
                params.push((
                    "filter",
                    format!("from-pub-date:{},until-pub-date:{}", year - 1, year + 1),
                ));
            }
            if let Some(ref email) = self.mailto {
                params.push(("mailto", email.clone()));
            }

            let request = self
                .client
                .get(format!("{}/works", self.base_url))
                .query(&params)
                .header("User-Agent", self.user_agent());

            let body = throttled(&self.limiters, "CrossRef", get_json(request)).await?;
            Ok(body.map(|b| parse_search_items(&b)).unwrap_or_default())
        })
    }
}

impl RetractionRegistry for CrossRef {
    fn name(&self) -> &str {
        "CrossRef"
    }

    fn lookup_status<'a>(&'a self, doi: &'a str) -> RegistryFuture<'a, Option<StatusReport>> {
        Box::pin(async move {
            let work = self.fetch_work(doi).await?;
            Ok(work.as_ref().map(parse_update_status))
        })
    }
}

fn first_str(value: &Value) -> Option<&str> {
    let raw = match value {
        Value::String(s) => Some(s.as_str()),
        Value::Array(items) => items.first().and_then(Value::as_str),
        _ => None,
    };
    raw.map(str::trim).filter(|s| !s.is_empty())
}

fn work_year(work: &Value) -> Option<i32> {
    ["issued", "published-print", "published-online", "created"]
        .iter()
        .find_map(|key| work[key]["date-parts"][0][0].as_i64())
        .and_then(|y| i32::try_from(y).ok())
}

fn string_field(work: &Value, key: &str) -> Option<String> {
    match &work[key] {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Convert a CrossRef `work` object into a registry record.
///
/// Returns `None` when the work carries no DOI.
pub fn parse_work(work: &Value) -> Option<RegistryRecord> {
    let identifier = work["DOI"].as_str()?.trim().to_lowercase();
    if identifier.is_empty() {
        return None;
    }

    let authors = work["author"]
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|a| {
                    let family = a["family"].as_str().or(a["name"].as_str())?;
                    Some(Author {
                        family: family.trim().to_string(),
                        given: a["given"].as_str().unwrap_or("").trim().to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Some(RegistryRecord {
        identifier,
        title: first_str(&work["title"]).unwrap_or("").to_string(),
        authors,
        container_title: first_str(&work["container-title"]).map(String::from),
        short_container_title: first_str(&work["short-container-title"]).map(String::from),
        year: work_year(work),
        volume: string_field(work, "volume"),
        issue: string_field(work, "issue"),
        page: string_field(work, "page"),
    })
}

/// Parse the `items` of a `/works` search response, in response order.
pub fn parse_search_items(body: &Value) -> Vec<RegistryRecord> {
    body["message"]["items"]
        .as_array()
        .map(|items| items.iter().filter_map(parse_work).collect())
        .unwrap_or_default()
}

fn classify_update(kind: &str) -> Option<RetractionState> {
    let kind = kind.to_lowercase();
    if kind.contains("retract") || kind.contains("removal") || kind.contains("withdraw") {
        Some(RetractionState::Retracted)
    } else if kind.contains("correct")
        || kind.contains("erratum")
        || kind.contains("corrigendum")
        || kind.contains("concern")
    {
        Some(RetractionState::Corrected)
    } else {
        None
    }
}

const RETRACTION_RELATIONS: &[&str] = &["is-retracted-by", "retracted-by", "has-retraction"];
const CORRECTION_RELATIONS: &[&str] = &[
    "is-corrected-by",
    "corrected-by",
    "has-correction",
    "has-expression-of-concern",
];

fn relation_report(work: &Value, names: &[&str], state: RetractionState) -> Option<StatusReport> {
    names.iter().find_map(|name| {
        let first = work["relation"][name].as_array()?.first()?;
        Some(StatusReport {
            state,
            notice_identifier: first["id"].as_str().map(String::from),
            label: Some(name.to_string()),
        })
    })
}

/// Derive retraction/correction status from a CrossRef work's update
/// metadata and relations. A retraction anywhere outranks a correction.
pub fn parse_update_status(work: &Value) -> StatusReport {
    let mut corrected: Option<StatusReport> = None;

    for field in ["updated-by", "update-to"] {
        let Some(updates) = work[field].as_array() else {
            continue;
        };
        for update in updates {
            let kind = update["type"]
                .as_str()
                .or(update["label"].as_str())
                .unwrap_or("");
            let report = |state| StatusReport {
                state,
                notice_identifier: update["DOI"].as_str().map(String::from),
                label: update["label"]
                    .as_str()
                    .or(update["type"].as_str())
                    .map(String::from),
            };
            match classify_update(kind) {
                Some(RetractionState::Retracted) => return report(RetractionState::Retracted),
                Some(state) if corrected.is_none() => corrected = Some(report(state)),
                _ => {}
            }
        }
    }

    if let Some(report) = relation_report(work, RETRACTION_RELATIONS, RetractionState::Retracted) {
        return report;
    }

    if let Some(policy) = work["update-policy"].as_str()
        && classify_update(policy) == Some(RetractionState::Retracted)
    {
        return StatusReport {
            state: RetractionState::Retracted,
            notice_identifier: None,
            label: Some(policy.to_string()),
        };
    }

    corrected
        .or_else(|| relation_report(work, CORRECTION_RELATIONS, RetractionState::Corrected))
        .unwrap_or_else(StatusReport::clean)
}
