//! Explicit conversion rules.
//!
//! A rule is a pure function registered for one field layout path (such as
//! `general.beep_mode` or `model.timers.persistent`) and one transition
//! between consecutive versions of a board family. It may read a
//! differently named field of the same record, which is how renames are
//! expressed.

use crate::board::{BoardFamily, FirmwareVersion};
use crate::codec::FieldValue;
use crate::ledger::Outcome;
use crate::schema::{FieldLayout, SchemaVersion};

/// What a rule sees besides the old value.
#[derive(Debug, Clone, Copy)]
pub struct RuleContext<'a> {
    pub from: &'a SchemaVersion,
    pub to: &'a SchemaVersion,
    pub old_field: &'a FieldLayout,
    pub new_field: &'a FieldLayout,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuleResult {
    pub value: FieldValue,
    pub outcome: Outcome,
    pub note: String,
}

impl RuleResult {
    pub fn converted(value: FieldValue, note: impl Into<String>) -> Self {
        Self {
            value,
            outcome: Outcome::Converted,
            note: note.into(),
        }
    }

    /// Reset to the new field's default.
    pub fn invalidated(ctx: &RuleContext<'_>, note: impl Into<String>) -> Self {
        Self {
            value: ctx.new_field.default.clone(),
            outcome: Outcome::Invalidated,
            note: note.into(),
        }
    }
}

pub type RuleFn = fn(&FieldValue, &RuleContext<'_>) -> RuleResult;

#[derive(Debug, Clone)]
pub struct ConversionRule {
    pub family: BoardFamily,
    /// Layout path of the produced field.
    pub field: &'static str,
    pub from: FirmwareVersion,
    pub to: FirmwareVersion,
    /// Field of the old record to read, when it differs from the target's
    /// own name.
    pub source: Option<&'static str>,
    pub apply: RuleFn,
}

impl ConversionRule {
    /// Name of the old field the rule reads.
    pub fn source_name(&self) -> &'static str {
        self.source
            .unwrap_or_else(|| self.field.rsplit('.').next().unwrap_or(self.field))
    }
}

/// Immutable set of rules.
#[derive(Debug, Clone, Default)]
pub struct RuleRegistry {
    rules: Vec<ConversionRule>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every rule shipped with the crate.
    pub fn builtin() -> Self {
        Self::new()
            .with(ConversionRule {
                family: BoardFamily::Avr9x,
                field: "general.beep_mode",
                from: FirmwareVersion(216),
                to: FirmwareVersion(217),
                source: Some("beeper_mode"),
                apply: beeper_to_level,
            })
            .with(ConversionRule {
                family: BoardFamily::Taranis,
                field: "general.backlight_bright",
                from: FirmwareVersion(218),
                to: FirmwareVersion(219),
                source: None,
                apply: uninvert_backlight,
            })
            .with(ConversionRule {
                family: BoardFamily::Taranis,
                field: "model.timers.persistent",
                from: FirmwareVersion(218),
                to: FirmwareVersion(219),
                source: None,
                apply: persistent_flag_to_mode,
            })
    }

    pub fn with(mut self, rule: ConversionRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn find(
        &self,
        family: BoardFamily,
        field: &str,
        from: FirmwareVersion,
        to: FirmwareVersion,
    ) -> Option<&ConversionRule> {
        self.rules
            .iter()
            .find(|r| r.family == family && r.field == field && r.from == from && r.to == to)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConversionRule> {
        self.rules.iter()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Beeper mode enum to a signed beep level.
fn beeper_to_level(value: &FieldValue, ctx: &RuleContext<'_>) -> RuleResult {
    let level = match value.as_str() {
        Some("quiet") => -2,
        Some("alarms") => -1,
        Some("nokey") => 0,
        Some("all") => 1,
        _ => return RuleResult::invalidated(ctx, format!("no beep level for {value}")),
    };
    RuleResult::converted(FieldValue::Int(level), format!("beeper mode {value} is level {level}"))
}

/// Stored darkness (0 = full brightness) to a direct percentage.
fn uninvert_backlight(value: &FieldValue, ctx: &RuleContext<'_>) -> RuleResult {
    match value.as_int() {
        Some(v) => RuleResult::converted(FieldValue::Int(100 - v.clamp(0, 100)), "inverted to direct percentage"),
        None => RuleResult::invalidated(ctx, format!("expected a number, got {}", value.kind_name())),
    }
}

fn persistent_flag_to_mode(value: &FieldValue, ctx: &RuleContext<'_>) -> RuleResult {
    match value.as_bool() {
        Some(false) => RuleResult::converted(FieldValue::Enum("off".into()), "flag off is mode off"),
        Some(true) => RuleResult::converted(FieldValue::Enum("flight".into()), "flag on is mode flight"),
        None => RuleResult::invalidated(ctx, format!("expected a flag, got {}", value.kind_name())),
    }
}
