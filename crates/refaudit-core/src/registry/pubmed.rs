use super::{
    ArticleIdRegistry, ArticleIds, RegistryError, RegistryFuture, RetractionRegistry, StatusReport,
    get_json, throttled,
};
use crate::RetractionState;
use crate::rate_limit::RateLimiters;
use serde_json::Value;
use std::sync::Arc;

const EUTILS_BASE: &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils";

/// NCBI E-utilities: retraction and erratum links recorded in PubMed, and
/// the PMID/PMCID of a DOI.
pub struct PubMed {
    client: reqwest::Client,
    api_key: Option<String>,
    limiters: Arc<RateLimiters>,
    base_url: String,
}

impl PubMed {
    pub fn new(client: reqwest::Client, api_key: Option<String>, limiters: Arc<RateLimiters>) -> Self {
        Self {
            client,
            api_key,
            limiters,
            base_url: EUTILS_BASE.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    async fn eutils(&self, tool: &str, params: &[(&str, &str)]) -> Result<Value, RegistryError> {
        let mut request = self
            .client
            .get(format!("{}/{}.fcgi", self.base_url, tool))
            .query(&[("db", "pubmed"), ("retmode", "json")])
            .query(params);
        if let Some(ref key) = self.api_key {
            request = request.query(&[("api_key", key.as_str())]);
        }
        let body = throttled(&self.limiters, "PubMed", get_json(request)).await?;
        body.ok_or(RegistryError::Http { status: 404 })
    }

    async fn summaries(&self, pmids: &[String]) -> Result<Value, RegistryError> {
        let ids = pmids.join(",");
        self.eutils("esummary", &[("id", ids.as_str())]).await
    }

    /// The PMID indexed under `doi`, if any.
    async fn pmid_for(&self, doi: &str) -> Result<Option<String>, RegistryError> {
        let term = format!("{}[AID]", doi);
        let search = self
            .eutils("esearch", &[("term", term.as_str()), ("retmax", "1")])
            .await?;
        Ok(parse_search_ids(&search).into_iter().next())
    }
}

impl ArticleIdRegistry for PubMed {
    fn name(&self) -> &str {
        "PubMed"
    }

    fn lookup_article_ids<'a>(&'a self, doi: &'a str) -> RegistryFuture<'a, Option<ArticleIds>> {
        Box::pin(async move {
            let Some(pmid) = self.pmid_for(doi).await? else {
                return Ok(None);
            };
            let summary = self.summaries(std::slice::from_ref(&pmid)).await?;
            Ok(Some(parse_article_ids(&summary, &pmid)))
        })
    }
}

impl RetractionRegistry for PubMed {
    fn name(&self) -> &str {
        "PubMed"
    }

    fn lookup_status<'a>(&'a self, doi: &'a str) -> RegistryFuture<'a, Option<StatusReport>> {
        Box::pin(async move {
            let Some(pmid) = self.pmid_for(doi).await? else {
                return Ok(None);
            };

            let summary = self.summaries(std::slice::from_ref(&pmid)).await?;
            let Some(link) = parse_comment_links(&summary, &pmid) else {
                return Ok(Some(StatusReport::clean()));
            };

            // Resolve the notice's own DOI; a failure here still leaves a usable PMID.
            let notice_identifier = match self.summaries(std::slice::from_ref(&link.pmid)).await {
                Ok(notice) => notice_identifier(&notice, &link.pmid),
                Err(e) => {
                    tracing::debug!(pmid = %link.pmid, error = %e, "notice summary failed");
                    format!("PMID:{}", link.pmid)
                }
            };

            Ok(Some(StatusReport {
                state: link.state,
                notice_identifier: Some(notice_identifier),
                label: Some(link.label),
            }))
        })
    }
}

/// PMIDs listed by an `esearch` response.
pub fn parse_search_ids(body: &Value) -> Vec<String> {
    body["esearchresult"]["idlist"]
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default()
}

/// A retraction or correction notice linked from a PubMed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentLink {
    pub state: RetractionState,
    pub pmid: String,
    pub label: String,
}

/// Pick the most severe notice from an `esummary` record's
/// `commentscorrections`. Retractions win over errata.
pub fn parse_comment_links(body: &Value, pmid: &str) -> Option<CommentLink> {
    let comments = body["result"][pmid]["commentscorrections"].as_array()?;
    let mut correction = None;
    for comment in comments {
        let reftype = comment["reftype"].as_str().unwrap_or("");
        let state = match reftype {
            "RetractionIn" => RetractionState::Retracted,
            "ErratumIn" | "ExpressionOfConcernIn" => RetractionState::Corrected,
            _ => continue,
        };
        let link = CommentLink {
            state,
            pmid: comment["pmid"].as_str().unwrap_or("").to_string(),
            label: reftype.to_string(),
        };
        if state == RetractionState::Retracted {
            return Some(link);
        }
        correction.get_or_insert(link);
    }
    correction
}

/// The notice's DOI from its `articleids`, or `PMID:<id>`.
pub fn notice_identifier(body: &Value, pmid: &str) -> String {
    body["result"][pmid]["articleids"]
        .as_array()
        .and_then(|ids| {
            ids.iter()
                .find(|id| id["idtype"].as_str() == Some("doi"))
                .and_then(|id| id["value"].as_str())
        })
        .map(|doi| doi.to_lowercase())
        .unwrap_or_else(|| format!("PMID:{}", pmid))
}

/// PMID and PMCID from an `esummary` record. The PMID falls back to the id
/// the record was fetched by.
pub fn parse_article_ids(body: &Value, pmid: &str) -> ArticleIds {
    let find = |idtype: &str| {
        body["result"][pmid]["articleids"].as_array().and_then(|ids| {
            ids.iter()
                .find(|id| id["idtype"].as_str() == Some(idtype))
                .and_then(|id| id["value"].as_str())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(String::from)
        })
    };
    ArticleIds {
        pmid: find("pubmed").or_else(|| Some(pmid.to_string())),
        pmcid: find("pmc").map(|id| {
            if id.to_ascii_uppercase().starts_with("PMC") {
                id
            } else {
                format!("PMC{}", id)
            }
        }),
    }
}
