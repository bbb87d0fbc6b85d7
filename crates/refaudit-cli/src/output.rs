use std::io::Write;
use std::sync::Mutex;

use indicatif::{ProgressBar, ProgressStyle};
use owo_colors::OwoColorize;
use refaudit_core::{
    AuditError, AuditRecord, AuditReport, AuditStats, DiagnosisBasis, GroupKind, MatchSource,
    MatchedMetadata, NormalizedReference, ProgressEvent, RetractionState,
};

/// Whether to use colored output.
#[derive(Debug, Clone, Copy)]
pub struct ColorMode(pub bool);

impl ColorMode {
    pub fn enabled(&self) -> bool {
        self.0
    }
}

/// Where live progress goes while the audit runs.
pub enum ProgressSink {
    /// One line per event.
    Lines(Mutex<Box<dyn Write + Send>>),
    /// A single bar, for interactive terminals.
    Bar(ProgressBar),
}

impl ProgressSink {
    pub fn bar() -> Self {
        let bar = ProgressBar::new(0);
        if let Ok(style) = ProgressStyle::with_template(
            "{spinner:.cyan} [{bar:40.cyan/dim}] {pos}/{len} {wide_msg}",
        ) {
            bar.set_style(style.progress_chars("=> "));
        }
        ProgressSink::Bar(bar)
    }

    pub fn handle(&self, event: &ProgressEvent, color: ColorMode) {
        match self {
            ProgressSink::Lines(writer) => {
                if let Ok(mut w) = writer.lock() {
                    let _ = print_progress(&mut **w, event, color);
                    let _ = w.flush();
                }
            }
            ProgressSink::Bar(bar) => update_bar(bar, event),
        }
    }
}

fn update_bar(bar: &ProgressBar, event: &ProgressEvent) {
    match event {
        ProgressEvent::Started { total } => {
            bar.set_length(*total as u64);
            bar.set_message("resolving references");
        }
        ProgressEvent::Resolving { title, .. } => bar.set_message(truncate(title, 50)),
        ProgressEvent::Resolved { .. } | ProgressEvent::ParseFailed { .. } => bar.inc(1),
        ProgressEvent::Warning { index, message, .. } => {
            bar.println(format!("WARNING [{}]: {}", index + 1, message));
        }
        ProgressEvent::DuplicatesDetected { .. } => bar.set_message("diagnosing unresolved references"),
        ProgressEvent::Finished { .. } => bar.finish_and_clear(),
        ProgressEvent::RetractionChecked { .. } | ProgressEvent::Diagnosed { .. } => {}
    }
}

/// Print a real-time progress event.
pub fn print_progress(
    w: &mut dyn Write,
    event: &ProgressEvent,
    color: ColorMode,
) -> std::io::Result<()> {
    match event {
        ProgressEvent::Started { total } => {
            writeln!(w, "Auditing {} references...", total)?;
        }
        ProgressEvent::Resolving {
            index,
            total,
            title,
        } => {
            writeln!(
                w,
                "[{}/{}] Resolving: \"{}\"",
                index + 1,
                total,
                truncate(title, 50)
            )?;
        }
        ProgressEvent::Resolved {
            index,
            total,
            source,
            confidence,
        } => {
            let idx = index + 1;
            match source {
                MatchSource::IdentifierExact => {
                    if color.enabled() {
                        writeln!(w, "[{}/{}] -> {} (DOI)", idx, total, "MATCHED".green())?;
                    } else {
                        writeln!(w, "[{}/{}] -> MATCHED (DOI)", idx, total)?;
                    }
                }
                MatchSource::FuzzyTitleMatch => {
                    if color.enabled() {
                        writeln!(
                            w,
                            "[{}/{}] -> {} (title, {:.2})",
                            idx,
                            total,
                            "MATCHED".green(),
                            confidence
                        )?;
                    } else {
                        writeln!(w, "[{}/{}] -> MATCHED (title, {:.2})", idx, total, confidence)?;
                    }
                }
                MatchSource::NoMatch => {
                    if color.enabled() {
                        writeln!(w, "[{}/{}] -> {}", idx, total, "NOT FOUND".red())?;
                    } else {
                        writeln!(w, "[{}/{}] -> NOT FOUND", idx, total)?;
                    }
                }
            }
        }
        ProgressEvent::ParseFailed {
            index,
            total,
            message,
        } => {
            if color.enabled() {
                writeln!(w, "[{}/{}] -> {} {}", index + 1, total, "UNPARSEABLE".red(), message)?;
            } else {
                writeln!(w, "[{}/{}] -> UNPARSEABLE {}", index + 1, total, message)?;
            }
        }
        ProgressEvent::RetractionChecked {
            index,
            total,
            status,
        } => match status {
            RetractionState::Retracted => {
                if color.enabled() {
                    writeln!(w, "[{}/{}] -> {}", index + 1, total, "RETRACTED".bold().red())?;
                } else {
                    writeln!(w, "[{}/{}] -> RETRACTED", index + 1, total)?;
                }
            }
            RetractionState::Corrected => {
                if color.enabled() {
                    writeln!(w, "[{}/{}] -> {}", index + 1, total, "CORRECTED".yellow())?;
                } else {
                    writeln!(w, "[{}/{}] -> CORRECTED", index + 1, total)?;
                }
            }
            // Clean and Unknown are reported in the summary only.
            RetractionState::Clean | RetractionState::Unknown => {}
        },
        ProgressEvent::DuplicatesDetected {
            exact_groups,
            fuzzy_groups,
        } => {
            writeln!(w)?;
            writeln!(
                w,
                "Duplicate detection: {} exact, {} near-identical group(s)",
                exact_groups, fuzzy_groups
            )?;
        }
        ProgressEvent::Diagnosed { index, label, basis } => {
            let via = match basis {
                DiagnosisBasis::Heuristic => "heuristic",
                DiagnosisBasis::ModelInference => "model",
            };
            writeln!(w, "[{}] diagnosed as {} ({})", index + 1, label, via)?;
        }
        ProgressEvent::Warning { message, .. } => {
            if color.enabled() {
                writeln!(w, "{} {}", "WARNING:".yellow(), message)?;
            } else {
                writeln!(w, "WARNING: {}", message)?;
            }
        }
        ProgressEvent::Finished { cancelled, .. } => {
            if *cancelled {
                writeln!(w, "Audit cancelled.")?;
            }
        }
    }
    Ok(())
}

/// Print the segmentation of every line without touching the network.
pub fn print_dry_run(
    w: &mut dyn Write,
    source_name: &str,
    parsed: &[Result<NormalizedReference, AuditError>],
    color: ColorMode,
) -> std::io::Result<()> {
    if color.enabled() {
        writeln!(
            w,
            "{} {} ({} references)\n",
            "DRY RUN:".bold().cyan(),
            source_name.bold(),
            parsed.len()
        )?;
    } else {
        writeln!(w, "DRY RUN: {} ({} references)\n", source_name, parsed.len())?;
    }

    for (i, outcome) in parsed.iter().enumerate() {
        if color.enabled() {
            writeln!(w, "{}", format!("[{}]", i + 1).bold().yellow())?;
        } else {
            writeln!(w, "[{}]", i + 1)?;
        }

        let reference = match outcome {
            Ok(reference) => reference,
            Err(e) => {
                writeln!(w, "  Error:   {}", e)?;
                writeln!(w)?;
                continue;
            }
        };

        writeln!(w, "  Title:   {}", reference.title.as_deref().unwrap_or("(none)"))?;
        writeln!(
            w,
            "  Authors: {}",
            if reference.authors.is_empty() {
                "(none)".to_string()
            } else {
                reference.authors.join("; ")
            }
        )?;
        if let Some(year) = reference.year {
            writeln!(w, "  Year:    {}", year)?;
        }
        if let Some(ref venue) = reference.venue {
            writeln!(w, "  Venue:   {}", venue)?;
        }
        if let Some(ref id) = reference.candidate_identifier {
            let kind = if id.is_doi() { "DOI:    " } else { "URL:    " };
            writeln!(w, "  {} {}", kind, id)?;
        }

        let raw_display = truncate(&reference.raw_text, 200);
        if color.enabled() {
            writeln!(w, "  Raw:     {}", raw_display.dimmed())?;
        } else {
            writeln!(w, "  Raw:     {}", raw_display)?;
        }
        writeln!(w)?;
    }
    Ok(())
}

fn heading(w: &mut dyn Write, title: &str, color: ColorMode) -> std::io::Result<()> {
    writeln!(w)?;
    let sep = "=".repeat(60);
    if color.enabled() {
        writeln!(w, "{}", sep.bold().red())?;
        writeln!(w, "{}", title.bold().red())?;
        writeln!(w, "{}", sep.bold().red())?;
    } else {
        writeln!(w, "{}", sep)?;
        writeln!(w, "{}", title)?;
        writeln!(w, "{}", sep)?;
    }
    Ok(())
}

/// Print one block per reference that did not resolve.
pub fn print_unresolved_report(
    w: &mut dyn Write,
    records: &[AuditRecord],
    color: ColorMode,
) -> std::io::Result<()> {
    for record in records {
        match record.source() {
            None => print_unparseable_block(w, record, color)?,
            Some(MatchSource::NoMatch) => print_unresolved_block(w, record, color)?,
            Some(_) => {}
        }
    }
    Ok(())
}

fn print_unparseable_block(
    w: &mut dyn Write,
    record: &AuditRecord,
    color: ColorMode,
) -> std::io::Result<()> {
    let unparseable = record.errors.iter().any(|e| matches!(e, AuditError::Parse(_)));
    let kind = if unparseable { "UNPARSEABLE" } else { "UNFINISHED" };
    heading(w, &format!("{} REFERENCE [{}]", kind, record.raw_index + 1), color)?;
    for error in &record.errors {
        writeln!(w, "  {}", error)?;
    }
    Ok(())
}

fn print_unresolved_block(
    w: &mut dyn Write,
    record: &AuditRecord,
    color: ColorMode,
) -> std::io::Result<()> {
    heading(w, &format!("UNRESOLVED REFERENCE [{}]", record.raw_index + 1), color)?;
    writeln!(w)?;

    if color.enabled() {
        writeln!(w, "{}:", "Reference".bold())?;
        writeln!(w, "  {}", truncate(&record.raw_text, 200).cyan())?;
    } else {
        writeln!(w, "Reference:")?;
        writeln!(w, "  {}", truncate(&record.raw_text, 200))?;
    }
    writeln!(w)?;

    if let Some(ref diagnosis) = record.diagnosis {
        let via = match diagnosis.basis {
            DiagnosisBasis::Heuristic => "pattern heuristic",
            DiagnosisBasis::ModelInference => "classification model",
        };
        if color.enabled() {
            writeln!(w, "{} {} ({})", "Diagnosis:".yellow(), diagnosis.label, via)?;
        } else {
            writeln!(w, "Diagnosis: {} ({})", diagnosis.label, via)?;
        }
    }

    let confidence = record.confidence();
    if confidence > 0.0 {
        writeln!(w, "Best candidate similarity: {:.2}", confidence)?;
    }

    if let Some(ref query) = record.search_query {
        if color.enabled() {
            writeln!(w, "{} {}", "Search:".bold(), query)?;
        } else {
            writeln!(w, "Search: {}", query)?;
        }
    }

    if !record.errors.is_empty() {
        writeln!(w)?;
        for error in &record.errors {
            if color.enabled() {
                writeln!(w, "  {}", format!("• {}", error).dimmed())?;
            } else {
                writeln!(w, "  • {}", error)?;
            }
        }
    }

    writeln!(w)?;
    let dash_sep = "-".repeat(60);
    if color.enabled() {
        writeln!(w, "{}", dash_sep.bold().red())?;
    } else {
        writeln!(w, "{}", dash_sep)?;
    }
    Ok(())
}

/// Print references whose DOI resolved to a record that reads differently.
pub fn print_doi_mismatches(
    w: &mut dyn Write,
    records: &[AuditRecord],
    color: ColorMode,
) -> std::io::Result<()> {
    let mismatches: Vec<_> = records
        .iter()
        .filter_map(|r| r.match_result.as_ref().map(|m| (r, m)))
        .filter(|(_, m)| m.doi_mismatch)
        .collect();
    if mismatches.is_empty() {
        return Ok(());
    }

    heading(w, "DOI MISMATCHES - CITED TEXT DIFFERS FROM DOI RECORD", color)?;
    for (record, result) in mismatches {
        writeln!(w)?;
        let doi = result.matched_identifier.as_deref().unwrap_or("");
        let resolved = result
            .matched_metadata
            .as_ref()
            .map(|m| m.title.as_str())
            .unwrap_or("");
        if color.enabled() {
            writeln!(w, "{} {}", "Reference:".bold(), truncate(&record.raw_text, 70))?;
            writeln!(w, "{} {}", "DOI:".bold(), doi)?;
            writeln!(w, "{} {}", "Resolves to:".red(), truncate(resolved, 70))?;
        } else {
            writeln!(w, "Reference: {}", truncate(&record.raw_text, 70))?;
            writeln!(w, "DOI: {}", doi)?;
            writeln!(w, "Resolves to: {}", truncate(resolved, 70))?;
        }
    }
    writeln!(w)?;
    Ok(())
}

/// Print retracted and corrected works.
pub fn print_retraction_warnings(
    w: &mut dyn Write,
    records: &[AuditRecord],
    color: ColorMode,
) -> std::io::Result<()> {
    let flagged: Vec<_> = records
        .iter()
        .filter_map(|r| r.retraction.as_ref().map(|s| (r, s)))
        .filter(|(_, s)| matches!(s.status, RetractionState::Retracted | RetractionState::Corrected))
        .collect();
    if flagged.is_empty() {
        return Ok(());
    }

    heading(w, "RETRACTED OR CORRECTED WORKS", color)?;
    for (record, status) in flagged {
        writeln!(w)?;
        let label = match status.status {
            RetractionState::Retracted => "Retracted",
            _ => "Corrected",
        };
        if color.enabled() {
            writeln!(w, "{} {}", "Reference:".bold(), truncate(&record.raw_text, 70))?;
            writeln!(w, "{} {} ({})", "Status:".red().bold(), label, status.identifier)?;
        } else {
            writeln!(w, "Reference: {}", truncate(&record.raw_text, 70))?;
            writeln!(w, "Status: {} ({})", label, status.identifier)?;
        }
        if let Some(ref notice) = status.notice {
            writeln!(w, "Notice: {}", notice)?;
        }
        if let Some(ids) = record
            .match_result
            .as_ref()
            .and_then(|m| m.matched_metadata.as_ref())
            .and_then(pubmed_ids)
        {
            writeln!(w, "PubMed: {}", ids)?;
        }
    }
    writeln!(w)?;
    Ok(())
}

/// Print duplicate groups with 1-based line numbers.
pub fn print_duplicates(
    w: &mut dyn Write,
    report: &AuditReport,
    color: ColorMode,
) -> std::io::Result<()> {
    if report.duplicate_groups.is_empty() {
        return Ok(());
    }

    heading(w, "DUPLICATE REFERENCES", color)?;
    for group in &report.duplicate_groups {
        let kind = match group.kind {
            GroupKind::ExactIdentifier => "same DOI",
            GroupKind::FuzzyText => "near-identical text",
        };
        let lines: Vec<String> = group.members.iter().map(|m| (m + 1).to_string()).collect();
        let sample = report
            .records
            .iter()
            .find(|r| r.raw_index == group.key)
            .map(|r| truncate(&r.raw_text, 70))
            .unwrap_or_default();
        writeln!(w)?;
        if color.enabled() {
            writeln!(w, "{} [{}] ({})", "Lines:".bold(), lines.join(", "), kind)?;
            writeln!(w, "  {}", sample.dimmed())?;
        } else {
            writeln!(w, "Lines: [{}] ({})", lines.join(", "), kind)?;
            writeln!(w, "  {}", sample)?;
        }
    }
    writeln!(w)?;
    Ok(())
}

/// Print the final summary.
pub fn print_summary(
    w: &mut dyn Write,
    stats: &AuditStats,
    cancelled: bool,
    color: ColorMode,
) -> std::io::Result<()> {
    writeln!(w)?;
    let sep = "=".repeat(60);
    if color.enabled() {
        writeln!(w, "{}", sep.bold())?;
        writeln!(w, "{}", "SUMMARY".bold())?;
        writeln!(w, "{}", sep.bold())?;
    } else {
        writeln!(w, "{}", sep)?;
        writeln!(w, "SUMMARY")?;
        writeln!(w, "{}", sep)?;
    }

    if cancelled {
        let msg = "Audit was cancelled; only finished references are listed.";
        if color.enabled() {
            writeln!(w, "  {}", msg.yellow())?;
        } else {
            writeln!(w, "  {}", msg)?;
        }
    }

    let pct = |n: usize| format!("{} ({:.1}%)", n, stats.percent(n));

    writeln!(w, "  References audited: {}", stats.total)?;
    if stats.parse_failures > 0 {
        writeln!(w, "  Unparseable: {}", pct(stats.parse_failures))?;
    }
    if stats.failed > 0 {
        if color.enabled() {
            writeln!(w, "  {} {}", "Failed:".red(), pct(stats.failed))?;
        } else {
            writeln!(w, "  Failed: {}", pct(stats.failed))?;
        }
    }
    writeln!(w)?;

    if color.enabled() {
        writeln!(w, "  {} {}", "Matched:".green(), pct(stats.matched))?;
    } else {
        writeln!(w, "  Matched: {}", pct(stats.matched))?;
    }
    writeln!(w, "    by DOI: {}", pct(stats.exact_matches))?;
    writeln!(w, "    by title: {}", pct(stats.fuzzy_matches))?;
    if stats.unmatched > 0 {
        if color.enabled() {
            writeln!(w, "  {} {}", "Not found:".red(), pct(stats.unmatched))?;
        } else {
            writeln!(w, "  Not found: {}", pct(stats.unmatched))?;
        }
        for (label, count) in &stats.diagnoses {
            writeln!(w, "    {}: {}", label, count)?;
        }
    }
    if stats.doi_mismatches > 0 {
        if color.enabled() {
            writeln!(w, "  {} {}", "DOI mismatches:".yellow(), pct(stats.doi_mismatches))?;
        } else {
            writeln!(w, "  DOI mismatches: {}", pct(stats.doi_mismatches))?;
        }
    }
    if stats.retracted > 0 {
        if color.enabled() {
            writeln!(w, "  {} {}", "Retracted:".red(), pct(stats.retracted))?;
        } else {
            writeln!(w, "  Retracted: {}", pct(stats.retracted))?;
        }
    }
    if stats.corrected > 0 {
        writeln!(w, "  Corrected: {}", pct(stats.corrected))?;
    }
    if stats.retraction_unknown > 0 {
        let msg = format!("Retraction status unknown: {}", pct(stats.retraction_unknown));
        if color.enabled() {
            writeln!(w, "  {}", msg.dimmed())?;
        } else {
            writeln!(w, "  {}", msg)?;
        }
    }

    writeln!(w)?;
    writeln!(w, "  With DOI: {}", pct(stats.with_identifier))?;
    writeln!(w, "  Without DOI: {}", pct(stats.without_identifier))?;
    if stats.repeated_identifiers > 0 {
        writeln!(w, "  Repeated DOIs: {}", pct(stats.repeated_identifiers))?;
    }
    if stats.exact_duplicate_groups + stats.fuzzy_duplicate_groups > 0 {
        writeln!(
            w,
            "  Duplicate groups: {} exact, {} near-identical",
            stats.exact_duplicate_groups, stats.fuzzy_duplicate_groups
        )?;
    }
    writeln!(w, "  Last 5 years: {}", pct(stats.recent_5y))?;
    writeln!(w, "  Last 3 years: {}", pct(stats.recent_3y))?;

    if !stats.frequent_authors.is_empty() {
        writeln!(w)?;
        writeln!(w, "  Frequently cited authors:")?;
        let mut authors: Vec<_> = stats.frequent_authors.iter().collect();
        authors.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        for (author, count) in authors {
            writeln!(w, "    {}: {}", author, count)?;
        }
    }

    writeln!(w)?;
    Ok(())
}

/// "PMID 123, PMC456" from whichever PubMed ids a match carries.
fn pubmed_ids(metadata: &MatchedMetadata) -> Option<String> {
    let ids: Vec<String> = [
        metadata.pmid.as_ref().map(|id| format!("PMID {}", id)),
        metadata.pmcid.clone(),
    ]
    .into_iter()
    .flatten()
    .collect();
    (!ids.is_empty()).then(|| ids.join(", "))
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((cut, _)) => format!("{}...", &s[..cut]),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use refaudit_core::{DiagnosisKind, DiagnosisLabel, MatchResult};

    fn render(f: impl FnOnce(&mut dyn Write) -> std::io::Result<()>) -> String {
        let mut buf = Vec::new();
        f(&mut buf).unwrap();
        String::from_utf8(buf).unwrap()
    }

    fn unresolved_record() -> AuditRecord {
        let reference = NormalizedReference {
            raw_index: 2,
            raw_text: "Proceedings of the 3rd Intl. Conf. on Y, 2019".into(),
            title: None,
            authors: vec![],
            year: Some(2019),
            venue: Some("Proceedings of the 3rd Intl. Conf. on Y".into()),
            candidate_identifier: None,
        };
        AuditRecord {
            raw_index: 2,
            raw_text: reference.raw_text.clone(),
            match_result: Some(MatchResult::no_match(reference, 0.0)),
            retraction: None,
            exact_duplicate_group: None,
            fuzzy_duplicate_group: None,
            diagnosis: Some(DiagnosisLabel {
                raw_index: 2,
                label: DiagnosisKind::Conference,
                basis: DiagnosisBasis::Heuristic,
            }),
            search_query: Some("Proceedings of the 3rd Intl. Conf. on Y, 2019".into()),
            errors: vec![],
        }
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo wörld", 4), "héll...");
        assert_eq!(truncate("short", 10), "short");
    }

    #[test]
    fn unresolved_block_plain_text() {
        let out = render(|w| print_unresolved_report(w, &[unresolved_record()], ColorMode(false)));
        assert!(out.contains("UNRESOLVED REFERENCE [3]"));
        assert!(out.contains("Diagnosis: Conference (pattern heuristic)"));
        assert!(out.contains("Search: Proceedings of the 3rd"));
        assert!(!out.contains("\u{1b}["), "no ANSI codes without color");
    }

    #[test]
    fn progress_lines() {
        let out = render(|w| {
            print_progress(
                w,
                &ProgressEvent::Resolved {
                    index: 0,
                    total: 4,
                    source: MatchSource::FuzzyTitleMatch,
                    confidence: 0.912,
                },
                ColorMode(false),
            )
        });
        assert_eq!(out, "[1/4] -> MATCHED (title, 0.91)\n");
    }

    #[test]
    fn summary_shows_percentages() {
        let stats = AuditStats {
            total: 4,
            matched: 3,
            exact_matches: 2,
            fuzzy_matches: 1,
            unmatched: 1,
            ..Default::default()
        };
        let out = render(|w| print_summary(w, &stats, false, ColorMode(false)));
        assert!(out.contains("Matched: 3 (75.0%)"));
        assert!(out.contains("Not found: 1 (25.0%)"));
        assert!(!out.contains("Failed:"));
        assert!(!out.contains("Frequently cited authors"));
    }

    #[test]
    fn summary_lists_failures_and_frequent_authors() {
        let stats = AuditStats {
            total: 10,
            failed: 1,
            frequent_authors: [("Doe A".to_string(), 4), ("Smith J".to_string(), 6)]
                .into_iter()
                .collect(),
            ..Default::default()
        };
        let out = render(|w| print_summary(w, &stats, false, ColorMode(false)));
        assert!(out.contains("Failed: 1 (10.0%)"));
        let smith = out.find("Smith J: 6").unwrap();
        let doe = out.find("Doe A: 4").unwrap();
        assert!(smith < doe, "most cited first");
    }

    #[test]
    fn pubmed_ids_joined() {
        let both = MatchedMetadata {
            pmid: Some("31234567".into()),
            pmcid: Some("PMC6543210".into()),
            ..Default::default()
        };
        assert_eq!(pubmed_ids(&both).as_deref(), Some("PMID 31234567, PMC6543210"));
        assert!(pubmed_ids(&MatchedMetadata::default()).is_none());
    }

    #[test]
    fn stopped_reference_is_not_called_unparseable() {
        let record = AuditRecord {
            raw_index: 0,
            raw_text: "Smith J. A title. 2020.".into(),
            match_result: None,
            retraction: None,
            exact_duplicate_group: None,
            fuzzy_duplicate_group: None,
            diagnosis: None,
            search_query: None,
            errors: vec![AuditError::Internal("CrossRef registry panicked".into())],
        };
        let out = render(|w| print_unparseable_block(w, &record, ColorMode(false)));
        assert!(out.contains("UNFINISHED REFERENCE [1]"));
        assert!(out.contains("internal error: CrossRef registry panicked"));
    }
}
