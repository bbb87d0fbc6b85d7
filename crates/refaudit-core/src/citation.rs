//! Citation rendering for matched registry records.

use crate::registry::{Author, RegistryRecord};

/// At most this many authors are listed before the rest are dropped.
const MAX_LISTED_AUTHORS: usize = 6;

fn initials(given: &str) -> impl Iterator<Item = char> + '_ {
    given
        .split(|c: char| c.is_whitespace() || c == '.' || c == '-')
        .filter_map(|part| part.chars().next())
        .filter(|c| c.is_alphabetic())
        .flat_map(char::to_uppercase)
}

/// Standardize an author name to `Family I` form (e.g. `Smith JA`).
///
/// Returns an empty string when the family name is missing.
pub fn clean_author_name(family: &str, given: &str) -> String {
    let family = family.trim();
    if family.is_empty() {
        return String::new();
    }
    let initials: String = initials(given).collect();
    if initials.is_empty() {
        family.to_string()
    } else {
        format!("{family} {initials}")
    }
}

fn apa_author(author: &Author) -> Option<String> {
    let given: Vec<String> = initials(&author.given).map(|c| format!("{c}.")).collect();
    let given = given.join(" ");
    match (author.family.trim(), given.as_str()) {
        ("", "") => None,
        (family, "") => Some(family.to_string()),
        ("", given) => Some(given.to_string()),
        (family, given) => Some(format!("{family}, {given}")),
    }
}

fn apa_author_list(authors: &[Author]) -> Option<String> {
    let names: Vec<String> = authors
        .iter()
        .take(MAX_LISTED_AUTHORS)
        .filter_map(apa_author)
        .collect();
    match names.as_slice() {
        [] => None,
        [only] => Some(only.clone()),
        [first, second] => Some(format!("{first} & {second}")),
        [init @ .., last] => Some(format!("{}, & {last}", init.join(", "))),
    }
}

fn with_period(s: &str) -> String {
    let s = s.trim();
    if s.ends_with(['.', '?', '!']) {
        s.to_string()
    } else {
        format!("{s}.")
    }
}

/// Render a registry record as an APA-style reference string.
///
/// ```text
/// Smith, J. & Doe, A. (2020). A Study of X. Journal of Widgets, 10(2), 1-5. https://doi.org/10.1/abc
/// ```
pub fn format_apa(record: &RegistryRecord) -> String {
    let mut parts = Vec::new();

    if let Some(authors) = apa_author_list(&record.authors) {
        parts.push(with_period(&authors));
    }
    if let Some(year) = record.year {
        parts.push(format!("({year})."));
    }
    let title = record.title.trim().trim_end_matches(['.', ' ']);
    if !title.is_empty() {
        parts.push(format!("{title}."));
    }

    let mut source = record.container_title.clone().unwrap_or_default();
    if let Some(ref volume) = record.volume {
        if !source.is_empty() {
            source.push_str(", ");
        }
        source.push_str(volume);
        if let Some(ref issue) = record.issue {
            source.push_str(&format!("({issue})"));
        }
    }
    if let Some(ref page) = record.page {
        if !source.is_empty() {
            source.push_str(", ");
        }
        source.push_str(page);
    }
    if !source.is_empty() {
        parts.push(with_period(&source));
    }

    if !record.identifier.is_empty() {
        parts.push(format!("https://doi.org/{}", record.identifier));
    }

    parts.join(" ")
}
