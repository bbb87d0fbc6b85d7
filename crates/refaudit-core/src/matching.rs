use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;
use unicode_normalization::UnicodeNormalization;

/// Minimum normalized length for a raw line to carry a usable fingerprint.
pub const MIN_FINGERPRINT_LEN: usize = 20;

fn unescape_entities(text: &str) -> String {
    text.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
}

/// Transliterate the Greek letters that commonly appear in titles.
///
/// NFKD leaves these untouched, so without this step they vanish entirely
/// when the text is stripped to ASCII.
fn transliterate_greek(text: &str) -> String {
    text.replace(['α', 'Α'], "alpha")
        .replace(['β', 'Β'], "beta")
        .replace(['γ', 'Γ'], "gamma")
        .replace(['δ', 'Δ'], "delta")
        .replace(['ε', 'Ε'], "epsilon")
        .replace(['θ', 'Θ'], "theta")
        .replace(['κ', 'Κ'], "kappa")
        .replace(['λ', 'Λ'], "lambda")
        .replace(['μ', 'Μ'], "mu")
        .replace(['π', 'Π'], "pi")
        .replace(['σ', 'ς', 'Σ'], "sigma")
        .replace(['τ', 'Τ'], "tau")
        .replace(['φ', 'Φ'], "phi")
        .replace(['χ', 'Χ'], "chi")
        .replace(['ω', 'Ω'], "omega")
}

/// Normalize text for token comparison.
///
/// Steps (order matters):
/// 1. Unescape common HTML entities
/// 2. Transliterate Greek letters
/// 3. Unicode NFKD normalization, then strip to ASCII
/// 4. Replace anything that is not `[a-zA-Z0-9]` with a space
/// 5. Lowercase and collapse whitespace
pub fn normalize_text(text: &str) -> String {
    let text = unescape_entities(text);
    let text = transliterate_greek(&text);
    let ascii: String = text.nfkd().filter(|c| c.is_ascii()).collect();

    static NON_ALNUM: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-zA-Z0-9]+").unwrap());
    NON_ALNUM
        .replace_all(&ascii, " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Normalize a title to lowercase alphanumerics with no separators.
///
/// Used where a compact, order-sensitive key is needed (cache keys).
pub fn normalize_title(title: &str) -> String {
    normalize_text(title).replace(' ', "")
}

fn token_set(text: &str) -> BTreeSet<String> {
    normalize_text(text)
        .split(' ')
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn join_sorted<'a>(parts: impl Iterator<Item = &'a String>) -> String {
    parts.map(String::as_str).collect::<Vec<_>>().join(" ")
}

fn ratio(a: &str, b: &str) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    rapidfuzz::fuzz::ratio(a.chars(), b.chars())
}

/// Token-set similarity in `0.0..=1.0`.
///
/// Both sides are normalized with [`normalize_text`] and split into unique
/// tokens. The shared tokens (sorted) are prefixed to each side's remaining
/// tokens (sorted) and the two strings are compared by normalized
/// Levenshtein ratio. Case, punctuation, token order and repeated tokens do
/// not affect the score. A title that is a strict subset of another scores
/// below 1.0 in proportion to the extra text.
pub fn token_set_similarity(a: &str, b: &str) -> f64 {
    let set_a = token_set(a);
    let set_b = token_set(b);
    if set_a.is_empty() || set_b.is_empty() {
        return 0.0;
    }

    let intersection = join_sorted(set_a.intersection(&set_b));
    let only_a = join_sorted(set_a.difference(&set_b));
    let only_b = join_sorted(set_b.difference(&set_a));

    let combine = |rest: &str| match (intersection.is_empty(), rest.is_empty()) {
        (true, _) => rest.to_string(),
        (false, true) => intersection.clone(),
        (false, false) => format!("{intersection} {rest}"),
    };

    ratio(&combine(&only_a), &combine(&only_b))
}

/// Token-sort similarity in `0.0..=1.0`: tokens are sorted (duplicates kept)
/// before comparison.
pub fn token_sort_similarity(a: &str, b: &str) -> f64 {
    let sorted = |s: &str| {
        let normalized = normalize_text(s);
        let mut tokens: Vec<&str> = normalized.split(' ').filter(|t| !t.is_empty()).collect();
        tokens.sort_unstable();
        tokens.join(" ")
    };
    ratio(&sorted(a), &sorted(b))
}

/// Comparable text for a raw reference line.
///
/// List markers and web addresses are stripped before normalization. Returns
/// `None` when too little text remains to compare meaningfully.
pub fn reference_fingerprint(raw: &str) -> Option<String> {
    static LIST_MARKER: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"^\s*(?:\[\d+\]|\d{1,3}[.)])?\s*").unwrap());
    let stripped = LIST_MARKER.replace(raw, "");
    let stripped = crate::identifiers::strip_urls(&stripped);
    let normalized = normalize_text(&stripped);
    (normalized.len() >= MIN_FINGERPRINT_LEN).then_some(normalized)
}
