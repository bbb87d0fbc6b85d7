//! Batch statistics over finished audit records.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::Datelike;
use serde::{Deserialize, Serialize};

use crate::{AuditError, AuditRecord, DiagnosisKind, Identifier, MatchSource, RetractionState};

/// Authors cited more often than this are listed in `frequent_authors`.
pub const FREQUENT_AUTHOR_THRESHOLD: usize = 3;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditStats {
    pub total: usize,
    pub parse_failures: usize,
    /// References whose processing stopped without a result.
    pub failed: usize,
    pub matched: usize,
    pub exact_matches: usize,
    pub fuzzy_matches: usize,
    pub unmatched: usize,
    pub doi_mismatches: usize,
    pub with_identifier: usize,
    pub without_identifier: usize,
    /// References whose DOI already appeared on an earlier line.
    pub repeated_identifiers: usize,
    pub exact_duplicate_groups: usize,
    pub fuzzy_duplicate_groups: usize,
    pub retracted: usize,
    pub corrected: usize,
    pub retraction_unknown: usize,
    pub recent_5y: usize,
    pub recent_3y: usize,
    pub diagnoses: BTreeMap<DiagnosisKind, usize>,
    /// Authors appearing in more than [`FREQUENT_AUTHOR_THRESHOLD`] references.
    pub frequent_authors: BTreeMap<String, usize>,
}

fn current_year() -> i32 {
    chrono::Local::now().year()
}

impl AuditStats {
    pub fn from_records(records: &[AuditRecord]) -> Self {
        Self::from_records_at(records, current_year())
    }

    /// Statistics with "recent" measured from `current_year`.
    pub fn from_records_at(records: &[AuditRecord], current_year: i32) -> Self {
        let mut stats = AuditStats {
            total: records.len(),
            ..Default::default()
        };
        let mut seen_dois = HashSet::new();
        let mut exact_keys = BTreeSet::new();
        let mut fuzzy_keys = BTreeSet::new();
        let mut author_counts: BTreeMap<String, usize> = BTreeMap::new();

        for record in records {
            exact_keys.extend(record.exact_duplicate_group);
            fuzzy_keys.extend(record.fuzzy_duplicate_group);
            if let Some(ref diagnosis) = record.diagnosis {
                *stats.diagnoses.entry(diagnosis.label).or_default() += 1;
            }

            let Some(ref result) = record.match_result else {
                if record.errors.iter().any(|e| matches!(e, AuditError::Parse(_))) {
                    stats.parse_failures += 1;
                } else {
                    stats.failed += 1;
                }
                continue;
            };

            let authors = match result.matched_metadata {
                Some(ref metadata) if !metadata.authors.is_empty() => &metadata.authors,
                _ => &result.reference.authors,
            };
            let distinct: BTreeSet<&str> = authors
                .iter()
                .map(|a| a.trim())
                .filter(|a| !a.is_empty())
                .collect();
            for author in distinct {
                *author_counts.entry(author.to_string()).or_default() += 1;
            }

            match result.source {
                MatchSource::IdentifierExact => stats.exact_matches += 1,
                MatchSource::FuzzyTitleMatch => stats.fuzzy_matches += 1,
                MatchSource::NoMatch => stats.unmatched += 1,
            }
            if result.doi_mismatch {
                stats.doi_mismatches += 1;
            }

            let doi = result.matched_identifier.clone().or_else(|| {
                match result.reference.candidate_identifier {
                    Some(Identifier::Doi(ref doi)) => Some(doi.clone()),
                    _ => None,
                }
            });
            match doi {
                Some(doi) => {
                    stats.with_identifier += 1;
                    if !seen_dois.insert(doi.to_lowercase()) {
                        stats.repeated_identifiers += 1;
                    }
                }
                None => stats.without_identifier += 1,
            }

            if let Some(ref retraction) = record.retraction {
                match retraction.status {
                    RetractionState::Retracted => stats.retracted += 1,
                    RetractionState::Corrected => stats.corrected += 1,
                    RetractionState::Unknown => stats.retraction_unknown += 1,
                    RetractionState::Clean => {}
                }
            }

            let year = result
                .matched_metadata
                .as_ref()
                .and_then(|m| m.year)
                .or(result.reference.year);
            if let Some(year) = year {
                let age = current_year - year;
                if (0..=5).contains(&age) {
                    stats.recent_5y += 1;
                }
                if (0..=3).contains(&age) {
                    stats.recent_3y += 1;
                }
            }
        }

        stats.matched = stats.exact_matches + stats.fuzzy_matches;
        stats.exact_duplicate_groups = exact_keys.len();
        stats.fuzzy_duplicate_groups = fuzzy_keys.len();
        author_counts.retain(|_, count| *count > FREQUENT_AUTHOR_THRESHOLD);
        stats.frequent_authors = author_counts;
        stats
    }

    /// `count` as a percentage of the total, 0 for an empty batch.
    pub fn percent(&self, count: usize) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            count as f64 * 100.0 / self.total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        DiagnosisBasis, DiagnosisLabel, MatchResult, MatchedMetadata,
        NormalizedReference, RetractionStatus,
    };

    fn reference(raw_index: usize, year: Option<i32>, doi: Option<&str>) -> NormalizedReference {
        NormalizedReference {
            raw_index,
            raw_text: format!("line {raw_index}"),
            title: None,
            authors: vec![],
            year,
            venue: None,
            candidate_identifier: doi.map(|d| Identifier::Doi(d.into())),
        }
    }

    fn record(raw_index: usize, match_result: Option<MatchResult>) -> AuditRecord {
        AuditRecord {
            raw_index,
            raw_text: format!("line {raw_index}"),
            match_result,
            retraction: None,
            exact_duplicate_group: None,
            fuzzy_duplicate_group: None,
            diagnosis: None,
            search_query: None,
            errors: vec![],
        }
    }

    fn exact(raw_index: usize, doi: &str, year: i32) -> MatchResult {
        MatchResult {
            reference: reference(raw_index, None, Some(doi)),
            matched_identifier: Some(doi.into()),
            confidence: 1.0,
            matched_metadata: Some(MatchedMetadata {
                title: "T".into(),
                year: Some(year),
                ..Default::default()
            }),
            source: MatchSource::IdentifierExact,
            doi_mismatch: false,
        }
    }

    #[test]
    fn counts_match_sources_and_failures() {
        let mut parse_failure = record(0, None);
        parse_failure.errors.push(AuditError::Parse("reference 0 is empty".into()));

        let mut retracted = record(1, Some(exact(1, "10.1/a", 2024)));
        retracted.retraction = Some(RetractionStatus {
            identifier: "10.1/a".into(),
            status: RetractionState::Retracted,
            notice: None,
        });
        retracted.exact_duplicate_group = Some(1);

        let mut repeat = record(2, Some(exact(2, "10.1/A", 2021)));
        repeat.retraction = Some(RetractionStatus::unknown("10.1/a"));
        repeat.exact_duplicate_group = Some(1);

        let mut fuzzy = exact(3, "10.1/b", 2010);
        fuzzy.source = MatchSource::FuzzyTitleMatch;
        fuzzy.reference.candidate_identifier = None;
        let fuzzy = record(3, Some(fuzzy));

        let mut unmatched = record(4, Some(MatchResult::no_match(reference(4, Some(2023), None), 0.2)));
        unmatched.diagnosis = Some(DiagnosisLabel {
            raw_index: 4,
            label: DiagnosisKind::Book,
            basis: DiagnosisBasis::Heuristic,
        });

        let records = vec![parse_failure, retracted, repeat, fuzzy, unmatched];
        let stats = AuditStats::from_records_at(&records, 2025);

        assert_eq!(stats.total, 5);
        assert_eq!(stats.parse_failures, 1);
        assert_eq!(stats.exact_matches, 2);
        assert_eq!(stats.fuzzy_matches, 1);
        assert_eq!(stats.matched, 3);
        assert_eq!(stats.unmatched, 1);
        assert_eq!(stats.with_identifier, 3);
        assert_eq!(stats.without_identifier, 1);
        assert_eq!(stats.repeated_identifiers, 1);
        assert_eq!(stats.exact_duplicate_groups, 1);
        assert_eq!(stats.fuzzy_duplicate_groups, 0);
        assert_eq!(stats.retracted, 1);
        assert_eq!(stats.retraction_unknown, 1);
        // 2024, 2021 and 2023 are at most five years before 2025; 2024 and 2023 at most three.
        assert_eq!(stats.recent_5y, 3);
        assert_eq!(stats.recent_3y, 2);
        assert_eq!(stats.diagnoses.get(&DiagnosisKind::Book), Some(&1));
        assert!((stats.percent(stats.matched) - 60.0).abs() < 1e-9);
    }

    #[test]
    fn recent_windows_include_boundary_years() {
        let records = vec![
            record(0, Some(exact(0, "10.1/old", 2020))),
            record(1, Some(exact(1, "10.1/mid", 2022))),
            record(2, Some(exact(2, "10.1/older", 2019))),
            record(3, Some(exact(3, "10.1/future", 2026))),
        ];
        let stats = AuditStats::from_records_at(&records, 2025);
        assert_eq!(stats.recent_5y, 2);
        assert_eq!(stats.recent_3y, 1);
    }

    #[test]
    fn stopped_records_are_not_parse_failures() {
        let mut parse_failure = record(0, None);
        parse_failure.errors.push(AuditError::Parse("reference 0 is empty".into()));
        let mut stopped = record(1, None);
        stopped.errors.push(AuditError::Internal("worker panicked".into()));

        let stats = AuditStats::from_records_at(&[parse_failure, stopped], 2025);
        assert_eq!(stats.parse_failures, 1);
        assert_eq!(stats.failed, 1);
    }

    #[test]
    fn frequent_authors_need_more_than_three_references() {
        let with_authors = |i: usize, authors: &[&str]| {
            let mut result = exact(i, &format!("10.1/{i}"), 2015);
            if let Some(ref mut metadata) = result.matched_metadata {
                metadata.authors = authors.iter().map(|a| a.to_string()).collect();
            }
            record(i, Some(result))
        };
        let mut records: Vec<AuditRecord> = (0..4)
            .map(|i| with_authors(i, &["Smith J", "Doe A"]))
            .collect();
        // Doe appears in only three references; a repeated name on one line counts once.
        records[3] = with_authors(3, &["Smith J", "Smith J"]);

        // Unmatched lines fall back to the parsed authors.
        let mut parsed = reference(4, None, None);
        parsed.authors = vec!["Smith J".into()];
        records.push(record(4, Some(MatchResult::no_match(parsed, 0.1))));

        let stats = AuditStats::from_records_at(&records, 2025);
        assert_eq!(stats.frequent_authors.len(), 1);
        assert_eq!(stats.frequent_authors.get("Smith J"), Some(&5));
    }

    #[test]
    fn empty_batch() {
        let stats = AuditStats::from_records(&[]);
        assert_eq!(stats, AuditStats::default());
        assert_eq!(stats.percent(0), 0.0);
    }

    #[test]
    fn current_year_is_plausible() {
        let year = current_year();
        assert!((2024..2200).contains(&year));
    }
}
