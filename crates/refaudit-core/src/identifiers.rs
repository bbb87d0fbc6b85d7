//! Identifier tokens embedded in free-text references.

use once_cell::sync::Lazy;
use regex::Regex;

/// Strip trailing punctuation and unbalanced closing brackets from a DOI.
fn clean_doi(doi: &str) -> String {
    const TRAILING: [char; 7] = ['.', ',', ';', ':', '!', '?', '"'];
    let mut doi = doi.trim_end_matches(TRAILING);

    for (open, close) in [('(', ')'), ('[', ']'), ('{', '}')] {
        while doi.ends_with(close) && doi.matches(close).count() > doi.matches(open).count() {
            doi = &doi[..doi.len() - 1];
            doi = doi.trim_end_matches(TRAILING);
        }
    }

    doi.to_string()
}

/// Extract a DOI from reference text.
///
/// Handles formats like:
/// - `10.1234/example`
/// - `doi:10.1234/example` and `DOI: 10.1234/example`
/// - `https://doi.org/10.1234/example` (percent-encoded suffixes are decoded)
/// - `http://dx.doi.org/10.1234/example`
///
/// DOIs containing balanced parentheses (e.g. `10.1016/0021-9681(87)90171-8`)
/// are kept whole.
pub fn extract_doi(text: &str) -> Option<String> {
    static URL_RE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r#"(?i)https?://(?:dx\.)?doi\.org/(10\.\d+(?:\.\d+)*/[^\s\]>},"]+)"#).unwrap()
    });
    if let Some(caps) = URL_RE.captures(text) {
        let raw = &caps[1];
        let decoded = urlencoding::decode(raw)
            .map(|d| d.into_owned())
            .unwrap_or_else(|_| raw.to_string());
        return Some(clean_doi(&decoded));
    }

    static DOI_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r#"\b10\.\d+(?:\.\d+)*/[^\s\]>},"]+"#).unwrap());
    DOI_RE.find(text).map(|m| clean_doi(m.as_str()))
}

/// Extract the first web address that is not a DOI resolver link.
pub fn extract_url(text: &str) -> Option<String> {
    static URL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"https?://[^\s<>"']+"#).unwrap());
    URL_RE
        .find_iter(text)
        .map(|m| {
            m.as_str()
                .trim_end_matches(['.', ',', ';', ':', ')'])
                .to_string()
        })
        .find(|url| !is_doi_resolver(url))
}

fn is_doi_resolver(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    lower.contains("://doi.org/") || lower.contains("://dx.doi.org/")
}

/// Remove every web address from `text`.
pub fn strip_urls(text: &str) -> String {
    static URL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"https?://\S+").unwrap());
    URL_RE.replace_all(text, " ").to_string()
}

/// Remove every DOI from `text`, with its `doi:` label or resolver prefix.
pub fn strip_dois(text: &str) -> String {
    static DOI_RE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r#"(?i)(?:\bdoi:?\s*|https?://(?:dx\.)?doi\.org/)?\b10\.\d+(?:\.\d+)*/[^\s\]>},"]+"#)
            .unwrap()
    });
    DOI_RE.replace_all(text, " ").to_string()
}

/// Extract an ISBN-10 or ISBN-13 (digits only, with a possible trailing X).
pub fn extract_isbn(text: &str) -> Option<String> {
    static ISBN_RE: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"(?i)\bISBN(?:-1[03])?:?\s*([0-9][0-9\- ]{8,16}[0-9X])\b").unwrap()
    });
    let caps = ISBN_RE.captures(text)?;
    let digits: String = caps[1]
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == 'X' || *c == 'x')
        .collect::<String>()
        .to_uppercase();
    matches!(digits.len(), 10 | 13).then_some(digits)
}

/// Extract an arXiv identifier.
///
/// Handles `arXiv:2301.12345`, `arXiv:2301.12345v2`, `arxiv.org/abs/2301.12345`
/// and the old `arXiv:hep-th/9901001` form.
pub fn extract_arxiv_id(text: &str) -> Option<String> {
    static NEW_FMT: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"(?i)arxiv(?:[:\s]+|\.org/abs/)(\d{4}\.\d{4,5}(?:v\d+)?)").unwrap()
    });
    if let Some(caps) = NEW_FMT.captures(text) {
        return Some(caps[1].to_string());
    }

    static OLD_FMT: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"(?i)arxiv(?:[:\s]+|\.org/abs/)([a-z-]+/\d{7}(?:v\d+)?)").unwrap()
    });
    OLD_FMT.captures(text).map(|caps| caps[1].to_string())
}
