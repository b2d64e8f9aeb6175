//! Conversion ledger: the ordered record of every field-level decision made
//! during one decode or conversion run.

use std::fmt;

use serde::{Deserialize, Serialize};

/// What happened to one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Carried over with an identical canonical value.
    Unchanged,
    /// Translated by a rule or structural change without loss.
    Converted,
    /// Dropped or reset to its default.
    Invalidated,
    /// Kept, but the user should check it (clamped, truncated, unknown).
    VerifyRequired,
}

impl Outcome {
    pub const ALL: [Outcome; 4] = [
        Outcome::Unchanged,
        Outcome::Converted,
        Outcome::Invalidated,
        Outcome::VerifyRequired,
    ];

    pub fn needs_review(self) -> bool {
        matches!(self, Outcome::Invalidated | Outcome::VerifyRequired)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Unchanged => write!(f, "unchanged"),
            Outcome::Converted => write!(f, "converted"),
            Outcome::Invalidated => write!(f, "invalidated"),
            Outcome::VerifyRequired => write!(f, "verify required"),
        }
    }
}

/// One ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionEvent {
    /// Position in the ledger, starting at 0.
    pub sequence: u32,
    pub field: String,
    /// Owning record path, e.g. `general` or `models[3].timers[1]`.
    pub component: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub outcome: Outcome,
    pub note: String,
}

impl ConversionEvent {
    /// Full path of the field.
    pub fn path(&self) -> String {
        if self.component.is_empty() {
            self.field.clone()
        } else {
            format!("{}.{}", self.component, self.field)
        }
    }
}

/// Event counts per outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeSummary {
    pub unchanged: usize,
    pub converted: usize,
    pub invalidated: usize,
    pub verify_required: usize,
}

impl OutcomeSummary {
    pub fn count(&self, outcome: Outcome) -> usize {
        match outcome {
            Outcome::Unchanged => self.unchanged,
            Outcome::Converted => self.converted,
            Outcome::Invalidated => self.invalidated,
            Outcome::VerifyRequired => self.verify_required,
        }
    }

    pub fn total(&self) -> usize {
        self.unchanged + self.converted + self.invalidated + self.verify_required
    }
}

/// Appends events during a run. Consumed by [`LedgerRecorder::finish`].
#[derive(Debug, Default)]
pub struct LedgerRecorder {
    events: Vec<ConversionEvent>,
}

impl LedgerRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(
        &mut self,
        component: &str,
        field: &str,
        old_value: Option<String>,
        new_value: Option<String>,
        outcome: Outcome,
        note: impl Into<String>,
    ) {
        let sequence = self.events.len() as u32;
        self.events.push(ConversionEvent {
            sequence,
            field: field.to_string(),
            component: component.to_string(),
            old_value,
            new_value,
            outcome,
            note: note.into(),
        });
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn finish(self) -> ConversionLedger {
        ConversionLedger {
            events: self.events,
        }
    }
}

/// Finished, read-only ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversionLedger {
    events: Vec<ConversionEvent>,
}

impl ConversionLedger {
    pub fn events(&self) -> &[ConversionEvent] {
        &self.events
    }

    pub fn summaries(&self) -> OutcomeSummary {
        let mut summary = OutcomeSummary::default();
        for event in &self.events {
            match event.outcome {
                Outcome::Unchanged => summary.unchanged += 1,
                Outcome::Converted => summary.converted += 1,
                Outcome::Invalidated => summary.invalidated += 1,
                Outcome::VerifyRequired => summary.verify_required += 1,
            }
        }
        summary
    }

    /// Events whose path is `path` or lies below it.
    pub fn events_for<'a>(&'a self, path: &'a str) -> impl Iterator<Item = &'a ConversionEvent> + 'a {
        self.events.iter().filter(move |e| {
            let p = e.path();
            p == path
                || p.strip_prefix(path)
                    .is_some_and(|rest| rest.starts_with('.') || rest.starts_with('['))
        })
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Whether any event asks for the user's attention.
    pub fn needs_review(&self) -> bool {
        self.events.iter().any(|e| e.outcome.needs_review())
    }
}
