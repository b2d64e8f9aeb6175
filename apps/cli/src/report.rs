//! Ledger rendering for the terminal and for report files.

use std::path::Path;

use anyhow::Result;
use radiodata_core::{ConversionEvent, ConversionLedger, Outcome, OutcomeSummary};
use serde::Serialize;

#[derive(Serialize)]
struct LedgerReport<'a> {
    source: &'a str,
    target: &'a str,
    summary: OutcomeSummary,
    events: &'a [ConversionEvent],
}

pub fn print_summary(ledger: &ConversionLedger) {
    let summary = ledger.summaries();
    println!("Conversion summary ({} fields):", summary.total());
    for outcome in Outcome::ALL {
        println!("  {:<16} {:>5}", outcome.to_string(), summary.count(outcome));
    }
}

pub fn format_event(event: &ConversionEvent) -> String {
    let old = event.old_value.as_deref().unwrap_or("-");
    let new = event.new_value.as_deref().unwrap_or("-");
    let mut line = format!("[{}] {}: {} -> {}", event.outcome, event.path(), old, new);
    if !event.note.is_empty() {
        line.push_str(&format!(" ({})", event.note));
    }
    line
}

/// Print events, only those that need a look when `review_only` is set.
pub fn print_events(ledger: &ConversionLedger, review_only: bool) {
    for event in ledger
        .events()
        .iter()
        .filter(|e| !review_only || e.outcome.needs_review())
    {
        println!("  {}", format_event(event));
    }
}

pub fn write_report(path: &Path, source: &str, target: &str, ledger: &ConversionLedger) -> Result<()> {
    let report = LedgerReport {
        source,
        target,
        summary: ledger.summaries(),
        events: ledger.events(),
    };
    std::fs::write(path, toml::to_string_pretty(&report)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(outcome: Outcome, old: Option<&str>, new: Option<&str>, note: &str) -> ConversionEvent {
        ConversionEvent {
            sequence: 0,
            field: "speaker_pitch".into(),
            component: "general".into(),
            old_value: old.map(String::from),
            new_value: new.map(String::from),
            outcome,
            note: note.into(),
        }
    }

    #[test]
    fn test_format_event() {
        let line = format_event(&event(Outcome::Invalidated, Some("5"), None, "removed in version 217"));
        assert_eq!(line, "[invalidated] general.speaker_pitch: 5 -> - (removed in version 217)");

        let line = format_event(&event(Outcome::Unchanged, Some("1"), Some("1"), ""));
        assert_eq!(line, "[unchanged] general.speaker_pitch: 1 -> 1");
    }

    #[test]
    fn test_write_report() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.toml");
        let ledger: ConversionLedger = toml::from_str(
            r#"
[[events]]
sequence = 0
field = "speaker_pitch"
component = "general"
old_value = "5"
outcome = "invalidated"
note = "removed in version 217"
"#,
        )
        .unwrap();

        write_report(&path, "stock v216", "stock v217", &ledger).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("source = \"stock v216\""));
        assert!(text.contains("invalidated = 1"));
        assert!(text.contains("[[events]]"));
    }
}
