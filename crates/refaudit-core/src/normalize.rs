//! Segmentation of raw reference lines into structured fields.
//!
//! Extraction is positional and punctuation-driven. When an explicit DOI is
//! present the remainder of the line is not segmented at all; the DOI is the
//! only field the resolver needs. Anything that cannot be segmented with
//! reasonable confidence is left as `None` rather than guessed.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::identifiers::{extract_doi, extract_url, strip_dois, strip_urls};
use crate::{AuditError, Identifier, NormalizedReference, RawReference};

static LIST_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(?:\[\d+\]|\d{1,3}[.)])\s+").unwrap());

static PAREN_YEAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\(((?:1[89]|20)\d{2})[a-z]?\)").unwrap());

static BARE_YEAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b((?:1[89]|20)\d{2})[a-z]?\b").unwrap());

/// `Family I.`, `Family, I. J.`, `Family IJ`
static FAMILY_FIRST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"([A-Z][A-Za-z'\-]+),?\s+((?:[A-Z]\.?\s?-?){1,3})(?:$|[\s,;&.])").unwrap()
});

/// `I. Family`, `I. J. Family`
static GIVEN_FIRST: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"((?:[A-Z]\.\s?-?){1,3})\s*([A-Z][A-Za-z'\-]+)").unwrap());

/// A leading Vancouver-style author list (`Smith J, Doe A.`) that ends a sentence.
static AUTHOR_LEAD: Lazy<Regex> = Lazy::new(|| {
    let name = r"[A-Z][A-Za-z'\-]+,?\s+(?:[A-Z]\.?-?){1,3}";
    let sep = r"(?:,\s*&\s*|,\s*and\s+|\s*[,;]\s*|\s*&\s*|\s+and\s+)";
    Regex::new(&format!(
        r"^({name}(?:{sep}{name})*(?:,?\s*et\s+al\.?)?)([.:])?\s+"
    ))
    .unwrap()
});

static ET_AL: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i),?\s*et\.?\s+al\.?").unwrap());

static QUOTED_TITLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"["“]([^"“”]{4,}?)[,.]?["”]"#).unwrap());

static VENUE_LEAD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?:in:?\s+)?(?:proceedings\b|proc\.|conference\b|symposium\b|workshop\b|journal\b)")
        .unwrap()
});

static ACCESS_NOTE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(?:accessed|retrieved|available|viewed|cited|last accessed)\b").unwrap()
});

/// Words that end in a period without ending a sentence.
const ABBREVIATIONS: &[&str] = &[
    "al", "intl", "int", "conf", "proc", "j", "res", "vol", "pp", "p", "ed", "eds", "no", "natl",
    "univ", "trans", "rev", "sci", "symp", "assoc", "soc", "inst", "mr", "dr", "st", "jr", "vs",
    "etc", "comput", "eng", "med", "phys", "chem", "biol", "lett", "am", "annu", "acad", "tech",
    "rep", "inc", "co", "ltd", "corp", "dept", "adv", "appl", "syst", "inf", "math", "stat",
];

/// Segment one raw reference line.
///
/// Fails with [`AuditError::Parse`] only when the line is empty or
/// whitespace-only; every other line yields a record, possibly with every
/// field absent.
pub fn normalize(raw: &RawReference) -> Result<NormalizedReference, AuditError> {
    let trimmed = raw.text.trim();
    if trimmed.is_empty() {
        return Err(AuditError::Parse(format!(
            "reference {} is empty",
            raw.raw_index
        )));
    }

    let mut record = NormalizedReference {
        raw_index: raw.raw_index,
        raw_text: trimmed.to_string(),
        title: None,
        authors: Vec::new(),
        year: None,
        venue: None,
        candidate_identifier: None,
    };

    if let Some(doi) = extract_doi(trimmed) {
        record.candidate_identifier = Some(Identifier::Doi(doi));
        return Ok(record);
    }

    let text = LIST_MARKER.replace(trimmed, "");
    let text = match extract_url(&text) {
        Some(url) => {
            record.candidate_identifier = Some(Identifier::Url(url));
            strip_urls(&text)
        }
        None => text.into_owned(),
    };
    segment_into(&mut record, &text);

    Ok(record)
}

/// Segment the text surrounding a reference's identifiers.
///
/// Used when a cited DOI is unknown to the registry and the reference has to
/// be searched by its fields instead. The candidate identifier is kept.
pub fn segment_without_identifiers(reference: &NormalizedReference) -> NormalizedReference {
    let text = LIST_MARKER.replace(&reference.raw_text, "");
    let text = strip_urls(&strip_dois(&text));

    let mut record = NormalizedReference {
        title: None,
        authors: Vec::new(),
        year: None,
        venue: None,
        ..reference.clone()
    };
    segment_into(&mut record, &text);
    record
}

fn segment_into(record: &mut NormalizedReference, text: &str) {
    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");

    let (authors, rest) = split_authors(&text);
    record.authors = authors;
    record.year = extract_year(&text);

    let (title, venue) = split_title_venue(rest);
    record.title = title;
    record.venue = venue;
}

fn extract_year(text: &str) -> Option<i32> {
    PAREN_YEAR
        .captures(text)
        .or_else(|| BARE_YEAR.captures(text))
        .and_then(|caps| caps[1].parse().ok())
}

/// Separate a leading author block from the rest of the line.
///
/// Two shapes are recognised: anything before a parenthesized year
/// (`Smith, J., & Doe, A. (2020).`), and a sentence made up entirely of
/// `Family I` names (`Smith J, Doe A.`).
fn split_authors(text: &str) -> (Vec<String>, &str) {
    if let Some(m) = PAREN_YEAR.find(text)
        && m.start() > 0
    {
        let rest = text[m.end()..].trim_start_matches(['.', ',', ':', ';', ' ']);
        return (parse_author_names(&text[..m.start()]), rest);
    }

    if let Some(caps) = AUTHOR_LEAD.captures(text) {
        let block = caps.get(1).map_or("", |m| m.as_str());
        if block.ends_with('.') || caps.get(2).is_some() {
            let end = caps.get(0).map_or(0, |m| m.end());
            return (parse_author_names(block), &text[end..]);
        }
    }

    (Vec::new(), text)
}

/// Parse an author block into `Family I` names.
pub(crate) fn parse_author_names(block: &str) -> Vec<String> {
    let block = ET_AL.replace_all(block.trim(), "");
    let block = block.trim().trim_end_matches([',', ';']);

    let initials_of = |s: &str| -> String { s.chars().filter(|c| c.is_ascii_uppercase()).collect() };

    let given_first = block
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_uppercase())
        && block.chars().nth(1) == Some('.');

    if given_first {
        return GIVEN_FIRST
            .captures_iter(block)
            .map(|caps| format!("{} {}", &caps[2], initials_of(&caps[1])))
            .collect();
    }

    FAMILY_FIRST
        .captures_iter(block)
        .map(|caps| format!("{} {}", &caps[1], initials_of(&caps[2])))
        .collect()
}

fn split_title_venue(rest: &str) -> (Option<String>, Option<String>) {
    if let Some(caps) = QUOTED_TITLE.captures(rest) {
        let title = clean_title(&caps[1]);
        let end = caps.get(0).map_or(rest.len(), |m| m.end());
        let after = rest[end..].trim_start_matches(['.', ',', ':', ';', ' ']);
        let venue = split_sentences(after)
            .into_iter()
            .next()
            .and_then(|s| clean_venue(&s));
        return (title, venue);
    }

    let segments = split_sentences(rest);
    let mut segments = segments.iter();
    let Some(first) = segments.next() else {
        return (None, None);
    };

    if VENUE_LEAD.is_match(first) {
        return (None, clean_venue(first));
    }

    let venue = segments.next().and_then(|s| clean_venue(s));
    (clean_title(first), venue)
}

/// Split on sentence-ending punctuation, skipping abbreviations and initials.
///
/// A trailing `.` is dropped from each segment; `?` and `!` are kept since
/// they are usually part of a title. Segments with no alphanumeric content
/// and access notes (`Accessed 2021`) are discarded.
pub(crate) fn split_sentences(text: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for word in text.split_whitespace() {
        current.push(word);
        let ends_with_dot = word.ends_with('.');
        if !(ends_with_dot || word.ends_with('?') || word.ends_with('!')) {
            continue;
        }
        if ends_with_dot && !ends_sentence(word, &current[..current.len() - 1]) {
            continue;
        }
        push_segment(&mut segments, &current);
        current.clear();
    }
    push_segment(&mut segments, &current);

    segments
}

fn push_segment(segments: &mut Vec<String>, words: &[&str]) {
    let joined = words.join(" ");
    let segment = joined.trim().trim_end_matches('.').trim();
    if segment.chars().any(|c| c.is_alphanumeric()) && !ACCESS_NOTE.is_match(segment) {
        segments.push(segment.to_string());
    }
}

fn ends_sentence(word: &str, previous: &[&str]) -> bool {
    let core = word
        .trim_end_matches('.')
        .trim_start_matches(['(', '"', '“', '\'']);

    // "U.S.", "e.g."
    if core.contains('.') {
        return false;
    }
    if ABBREVIATIONS.contains(&core.to_lowercase().as_str()) {
        return false;
    }

    let is_initial = core.len() == 1 && core.chars().all(|c| c.is_ascii_uppercase());
    if is_initial {
        let Some(prev) = previous.last() else {
            return false;
        };
        let prev_capitalized = prev.chars().next().is_some_and(char::is_uppercase);
        if prev.ends_with('.') || prev_capitalized {
            return false;
        }
    }

    true
}

fn clean_title(raw: &str) -> Option<String> {
    let title = raw
        .trim()
        .trim_matches(['"', '“', '”', '\''])
        .trim()
        .trim_end_matches(['.', ',', ';', ':'])
        .trim();
    if title.chars().filter(|c| c.is_alphabetic()).count() < 2 {
        return None;
    }
    Some(title.to_string())
}

/// Strip volume, issue, page and year noise from a venue segment.
pub(crate) fn clean_venue(raw: &str) -> Option<String> {
    static IN_PREFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(?i:in):?\s+").unwrap());
    static YEAR_SEMICOLON_TAIL: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"\b(?:1[89]|20)\d{2}[a-z]?\s*(?:[A-Z][a-z]{2}\s*\d{0,2}\s*)?;.*$").unwrap()
    });
    static PAGES: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"\bpp?\.\s*[A-Za-z]?\d+(?:\s*[-–]\s*[A-Za-z]?\d+)?").unwrap());
    static VOL_PAGES: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"\b\d+\s*(?:\([^)]*\))?\s*[:,]\s*[A-Za-z]?\d+(?:\s*[-–]\s*[A-Za-z]?\d+)?")
            .unwrap()
    });
    static VOL_NO: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?i)\b(?:vol|no)\.?\s*\d+(?:\s*\(\d+\))?").unwrap());
    static TRAILING_YEAR: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"[\s,;.]*\(?(?:1[89]|20)\d{2}[a-z]?\)?\s*$").unwrap());
    static REPEATED_COMMAS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*,(?:\s*,)+").unwrap());

    let venue = IN_PREFIX.replace(raw.trim(), "");
    let venue = YEAR_SEMICOLON_TAIL.replace(&venue, "");
    let venue = PAGES.replace_all(&venue, "");
    let venue = VOL_PAGES.replace_all(&venue, "");
    let venue = VOL_NO.replace_all(&venue, "");
    let venue = TRAILING_YEAR.replace(&venue, "");
    let venue = REPEATED_COMMAS.replace_all(&venue, ",");

    let venue = venue
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    let venue = venue
        .trim_matches([',', ';', ':', ' '])
        .trim_end_matches('.')
        .trim_end_matches([',', ';', ':', ' ']);

    if venue.chars().filter(|c| c.is_alphabetic()).count() < 2 {
        return None;
    }
    Some(venue.to_string())
}
