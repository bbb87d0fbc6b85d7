//! Duplicate detection across a resolved batch.
//!
//! References sharing an identifier form exact groups. The rest are compared
//! pairwise by token-set similarity of their best available text and
//! clustered with union-find.

use std::collections::BTreeMap;

use crate::matching::{MIN_FINGERPRINT_LEN, normalize_text, reference_fingerprint, token_set_similarity};
use crate::{DuplicateGroup, GroupKind, Identifier, MatchResult};

/// Disjoint-set forest over positions `0..n`.
struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }
}

/// The identifier two references must share to be exact duplicates: the
/// matched DOI, else the DOI the reference itself cites.
fn identity(result: &MatchResult) -> Option<String> {
    let id = match (&result.matched_identifier, &result.reference.candidate_identifier) {
        (Some(id), _) => id.as_str(),
        (None, Some(Identifier::Doi(doi))) => doi.as_str(),
        _ => return None,
    };
    let id = id.trim().to_lowercase();
    (!id.is_empty()).then_some(id)
}

/// Text compared in the fuzzy pass. `None` when too short to compare safely.
fn comparison_text(result: &MatchResult) -> Option<String> {
    let title = result
        .matched_metadata
        .as_ref()
        .map(|m| m.title.as_str())
        .filter(|t| !t.trim().is_empty())
        .or(result.reference.title.as_deref());
    let text = match title {
        Some(title) => normalize_text(title),
        None => reference_fingerprint(&result.reference.raw_text)?,
    };
    (text.len() >= MIN_FINGERPRINT_LEN).then_some(text)
}

fn into_group(kind: GroupKind, mut members: Vec<usize>) -> DuplicateGroup {
    members.sort_unstable();
    members.dedup();
    DuplicateGroup {
        kind,
        key: members[0],
        members,
    }
}

pub struct DuplicateDetector {
    threshold: f64,
}

impl DuplicateDetector {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    /// Group duplicates in `results`. Exact groups come first, then fuzzy
    /// groups, each ordered by key. Every group has at least two members and
    /// no reference is in more than one group.
    pub fn detect(&self, results: &[MatchResult]) -> Vec<DuplicateGroup> {
        let mut by_identity: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        let mut loose = Vec::new();
        for result in results {
            match identity(result) {
                Some(id) => by_identity.entry(id).or_default().push(result.raw_index()),
                None => loose.push(result),
            }
        }

        let mut exact: Vec<DuplicateGroup> = Vec::new();
        for (id, members) in by_identity {
            if members.len() >= 2 {
                exact.push(into_group(GroupKind::ExactIdentifier, members));
            } else if let Some(result) = results.iter().find(|r| identity(r).as_deref() == Some(id.as_str())) {
                // A lone identifier is still a fuzzy candidate.
                loose.push(result);
            }
        }
        exact.sort_by_key(|g| g.key);

        let mut fuzzy = self.fuzzy_groups(&loose);
        fuzzy.sort_by_key(|g| g.key);

        tracing::debug!(
            exact = exact.len(),
            fuzzy = fuzzy.len(),
            "duplicate detection finished"
        );
        exact.extend(fuzzy);
        exact
    }

    fn fuzzy_groups(&self, candidates: &[&MatchResult]) -> Vec<DuplicateGroup> {
        let texts: Vec<(usize, String)> = candidates
            .iter()
            .filter_map(|r| comparison_text(r).map(|t| (r.raw_index(), t)))
            .collect();

        let mut sets = UnionFind::new(texts.len());
        for i in 0..texts.len() {
            for j in (i + 1)..texts.len() {
                if token_set_similarity(&texts[i].1, &texts[j].1) >= self.threshold {
                    sets.union(i, j);
                }
            }
        }

        let mut clusters: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (pos, (raw_index, _)) in texts.iter().enumerate() {
            clusters.entry(sets.find(pos)).or_default().push(*raw_index);
        }
        clusters
            .into_values()
            .filter(|members| members.len() >= 2)
            .map(|members| into_group(GroupKind::FuzzyText, members))
            .collect()
    }
}
