//! Conversion engine.
//!
//! Decodes images, walks the chain of registered schema versions between a
//! source and a target, and records every field-level decision in a
//! [`ConversionLedger`].

pub mod coerce;
pub mod machine;
pub mod rules;

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::board::{Board, FirmwareVersion};
use crate::codec::{CodecError, FieldFault, FieldValue, Record, decode_settings, encode_settings};
use crate::container::{ContainerKind, ImageMetadata, RawImage};
use crate::events::{LogLevel, ProgressUnit, StorageEvent, StorageObserver, TracingObserver};
use crate::ledger::{ConversionLedger, LedgerRecorder, Outcome};
use crate::schema::{Encoding, FieldLayout, RecordLayout, SchemaError, SchemaTable, SchemaVersion};
use crate::settings::CanonicalSettings;

pub use coerce::{Fitted, fit};
pub use machine::{ConversionState, StateMachine};
pub use rules::{ConversionRule, RuleContext, RuleFn, RuleRegistry, RuleResult};

#[derive(Error, Debug)]
pub enum ConversionError {
    #[error("conversion rejected in state {state}: {reason}")]
    Rejected {
        state: ConversionState,
        reason: RejectReason,
    },
}

impl ConversionError {
    pub fn reason(&self) -> &RejectReason {
        match self {
            ConversionError::Rejected { reason, .. } => reason,
        }
    }

    pub fn state(&self) -> ConversionState {
        match self {
            ConversionError::Rejected { state, .. } => *state,
        }
    }
}

#[derive(Error, Debug)]
pub enum RejectReason {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("image for {board} v{version} is {actual} bytes, expected {expected}")]
    SizeMismatch {
        board: Board,
        version: FirmwareVersion,
        expected: usize,
        actual: usize,
    },
    #[error("{from} and {to} belong to different board families")]
    BoardFamilyMismatch { from: Board, to: Board },
    #[error("cannot convert from version {from} down to {to}")]
    Downgrade {
        from: FirmwareVersion,
        to: FirmwareVersion,
    },
    #[error("image is for {image}, expected {expected}")]
    BoardMismatch { image: Board, expected: Board },
    #[error("cancelled")]
    Cancelled,
    #[error("invariant violated: {0}")]
    Invariant(String),
}

/// What to do when an image declares a different board than expected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BoardPolicy {
    /// Refuse the image.
    #[default]
    Reject,
    /// Read the image as if it were written for the expected board.
    PreferProfile,
    /// Trust the board the image declares.
    PreferImage,
}

impl fmt::Display for BoardPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoardPolicy::Reject => write!(f, "reject"),
            BoardPolicy::PreferProfile => write!(f, "prefer-profile"),
            BoardPolicy::PreferImage => write!(f, "prefer-image"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConversionOptions {
    /// Board the caller expects the image to be for.
    pub expected_board: Option<Board>,
    pub board_policy: BoardPolicy,
}

/// Board and schema version to convert to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversionTarget {
    pub board: Board,
    pub version: FirmwareVersion,
}

impl ConversionTarget {
    pub fn new(board: Board, version: u8) -> Self {
        Self {
            board,
            version: FirmwareVersion(version),
        }
    }
}

impl fmt::Display for ConversionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} v{}", self.board, self.version)
    }
}

/// Result of a decode without migration.
#[derive(Debug, Clone)]
pub struct DecodeOutput {
    pub settings: CanonicalSettings,
    pub ledger: ConversionLedger,
}

/// Result of a conversion.
#[derive(Debug, Clone)]
pub struct ConversionOutput {
    pub settings: CanonicalSettings,
    pub ledger: ConversionLedger,
    /// Encoded target image, carrying the source's container kind and labels.
    pub image: RawImage,
}

/// One run: state, ledger and observer.
struct Run<'r> {
    machine: StateMachine,
    recorder: LedgerRecorder,
    observer: &'r dyn StorageObserver,
}

impl<'r> Run<'r> {
    fn new(observer: &'r dyn StorageObserver) -> Self {
        Self {
            machine: StateMachine::new(),
            recorder: LedgerRecorder::new(),
            observer,
        }
    }

    fn advance(&mut self, next: ConversionState) -> Result<(), ConversionError> {
        self.machine.goto_state(next, self.observer).map_err(|(from, to)| {
            let state = self.machine.state();
            let _ = self.machine.goto_state(ConversionState::Rejected, self.observer);
            ConversionError::Rejected {
                state,
                reason: RejectReason::Invariant(format!("illegal transition {from} -> {to}")),
            }
        })
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.observer.on_event(&StorageEvent::Log {
            level,
            message: message.into(),
        });
    }

    /// Move to `Rejected` and build the error for the current state.
    fn reject(&mut self, reason: impl Into<RejectReason>) -> ConversionError {
        let state = self.machine.state();
        let reason = reason.into();
        warn!(state = %state, reason = %reason, "Conversion rejected");
        let _ = self.machine.goto_state(ConversionState::Rejected, self.observer);
        ConversionError::Rejected { state, reason }
    }
}

/// Converts images and settings between schema versions.
pub struct Converter<'a, O: StorageObserver> {
    schemas: &'a SchemaTable,
    rules: &'a RuleRegistry,
    observer: Arc<O>,
}

impl<'a> Converter<'a, TracingObserver> {
    /// Create a converter reporting through `tracing`.
    pub fn new(schemas: &'a SchemaTable, rules: &'a RuleRegistry) -> Self {
        Self::with_observer(schemas, rules, Arc::new(TracingObserver))
    }
}

impl<'a, O: StorageObserver> Converter<'a, O> {
    pub fn with_observer(schemas: &'a SchemaTable, rules: &'a RuleRegistry, observer: Arc<O>) -> Self {
        Self {
            schemas,
            rules,
            observer,
        }
    }

    pub fn schemas(&self) -> &'a SchemaTable {
        self.schemas
    }

    pub fn observer(&self) -> &Arc<O> {
        &self.observer
    }

    /// Decode an image at its own version. The ledger only holds decode
    /// diagnostics: field faults and unknown enum values.
    #[instrument(skip(self, image), fields(board = %image.board(), version = %image.version()))]
    pub fn decode(&self, image: &RawImage, options: &ConversionOptions) -> Result<DecodeOutput, ConversionError> {
        let mut run = Run::new(&*self.observer);
        let source = self.source_schema(image, options, &mut run)?;
        run.advance(ConversionState::VersionResolved)?;
        check_size(image, source).map_err(|r| run.reject(r))?;

        run.advance(ConversionState::Decoding)?;
        let settings = self.decode_payload(image, source, &mut run, true)?;
        run.advance(ConversionState::Decoded)?;
        info!(events = run.recorder.len(), "Image decoded");
        Ok(DecodeOutput {
            settings,
            ledger: run.recorder.finish(),
        })
    }

    /// Decode `image`, migrate it to `target` and encode the result.
    #[instrument(skip(self, image), fields(board = %image.board(), version = %image.version(), target = %target))]
    pub fn convert_image(
        &self,
        image: &RawImage,
        target: ConversionTarget,
        options: &ConversionOptions,
    ) -> Result<ConversionOutput, ConversionError> {
        let mut run = Run::new(&*self.observer);
        let source = self.source_schema(image, options, &mut run)?;
        let target_schema = self.target_schema(source, target, &mut run)?;
        run.advance(ConversionState::VersionResolved)?;
        check_size(image, source).map_err(|r| run.reject(r))?;

        run.advance(ConversionState::Decoding)?;
        let settings = self.decode_payload(image, source, &mut run, false)?;

        let metadata = retain_labels(image.metadata(), target_schema.max_models);
        self.migrate_and_encode(settings, source, target_schema, image.kind(), metadata, run)
    }

    /// Migrate settings already in memory to `target` and encode them.
    #[instrument(skip(self, settings), fields(board = %settings.board, version = %settings.version, target = %target))]
    pub fn convert_settings(
        &self,
        settings: &CanonicalSettings,
        target: ConversionTarget,
    ) -> Result<ConversionOutput, ConversionError> {
        let mut run = Run::new(&*self.observer);
        let source = self
            .schemas
            .resolve(settings.board, settings.version)
            .map_err(|e| run.reject(e))?;
        let target_schema = self.target_schema(source, target, &mut run)?;
        run.advance(ConversionState::VersionResolved)?;
        self.migrate_and_encode(
            settings.clone(),
            source,
            target_schema,
            ContainerKind::Raw,
            ImageMetadata::default(),
            run,
        )
    }

    /// Schema the image's bytes are laid out with, after applying the board
    /// policy.
    fn source_schema(
        &self,
        image: &RawImage,
        options: &ConversionOptions,
        run: &mut Run<'_>,
    ) -> Result<&'a SchemaVersion, ConversionError> {
        let mut board = image.board();
        if let Some(expected) = options.expected_board
            && expected != board
        {
            match options.board_policy {
                BoardPolicy::Reject => {
                    return Err(run.reject(RejectReason::BoardMismatch {
                        image: board,
                        expected,
                    }));
                }
                BoardPolicy::PreferProfile => {
                    if !expected.is_compatible_with(board) {
                        return Err(run.reject(RejectReason::BoardFamilyMismatch {
                            from: board,
                            to: expected,
                        }));
                    }
                    run.log(LogLevel::Warn, format!("Reading {board} image as {expected}"));
                    run.recorder.record(
                        "header",
                        "board",
                        Some(board.to_string()),
                        Some(expected.to_string()),
                        Outcome::VerifyRequired,
                        "image board replaced by the expected board",
                    );
                    board = expected;
                }
                BoardPolicy::PreferImage => {
                    run.log(LogLevel::Warn, format!("Keeping board {board} declared by the image, expected {expected}"));
                    run.recorder.record(
                        "header",
                        "board",
                        Some(expected.to_string()),
                        Some(board.to_string()),
                        Outcome::VerifyRequired,
                        "image declares a different board than expected",
                    );
                }
            }
        }
        self.schemas
            .resolve(board, image.version())
            .map_err(|e| run.reject(e))
    }

    fn target_schema(
        &self,
        source: &SchemaVersion,
        target: ConversionTarget,
        run: &mut Run<'_>,
    ) -> Result<&'a SchemaVersion, ConversionError> {
        if !source.board.is_compatible_with(target.board) {
            return Err(run.reject(RejectReason::BoardFamilyMismatch {
                from: source.board,
                to: target.board,
            }));
        }
        if target.version < source.version {
            return Err(run.reject(RejectReason::Downgrade {
                from: source.version,
                to: target.version,
            }));
        }
        let schema = self
            .schemas
            .resolve(target.board, target.version)
            .map_err(|e| run.reject(e))?;
        if schema.version < source.version {
            return Err(run.reject(RejectReason::Downgrade {
                from: source.version,
                to: schema.version,
            }));
        }
        Ok(schema)
    }

    /// Decode with field faults recorded as `Invalidated`. Unknown enum
    /// values are reported here only when no migration follows.
    fn decode_payload(
        &self,
        image: &RawImage,
        schema: &SchemaVersion,
        run: &mut Run<'_>,
        report_unknown: bool,
    ) -> Result<CanonicalSettings, ConversionError> {
        let mut faults = Vec::new();
        let settings = decode_settings(image.payload(), schema, &mut faults).map_err(|e| run.reject(e))?;

        for fault in &faults {
            record_fault(&mut run.recorder, fault);
        }
        if report_unknown {
            record_unknown(&mut run.recorder, &settings.general, "general");
            for (slot, model) in settings.used_models() {
                record_unknown(&mut run.recorder, model, &format!("models[{slot}]"));
            }
        }
        debug!(faults = faults.len(), "Payload decoded");
        Ok(settings)
    }

    fn migrate_and_encode(
        &self,
        settings: CanonicalSettings,
        source: &SchemaVersion,
        target: &SchemaVersion,
        kind: ContainerKind,
        metadata: ImageMetadata,
        mut run: Run<'_>,
    ) -> Result<ConversionOutput, ConversionError> {
        run.advance(ConversionState::Migrating)?;
        let settings = self.migrate(settings, source, target, &mut run)?;

        let payload = encode_settings(&settings, target).map_err(|e| run.reject(e))?;
        let image = RawImage::from_payload(kind, payload, metadata)
            .map_err(|e| run.reject(RejectReason::Invariant(e.to_string())))?;
        run.advance(ConversionState::Encoded)?;

        let ledger = run.recorder.finish();
        let summary = ledger.summaries();
        info!(
            target = %target.version,
            unchanged = summary.unchanged,
            converted = summary.converted,
            invalidated = summary.invalidated,
            verify_required = summary.verify_required,
            "Conversion complete"
        );
        Ok(ConversionOutput {
            settings,
            ledger,
            image,
        })
    }

    /// Ordered (old, new) schema pairs between `source` and `target`.
    fn steps(&self, source: &'a SchemaVersion, target: &'a SchemaVersion) -> Vec<(&'a SchemaVersion, &'a SchemaVersion)> {
        let chain: Vec<&SchemaVersion> = self
            .schemas
            .chain(source.board, source.version, target.version)
            .into_iter()
            .filter_map(|v| self.schemas.get(source.board, v))
            .collect();

        let mut steps: Vec<_> = chain.windows(2).map(|w| (w[0], w[1])).collect();
        let last = chain.last().copied().unwrap_or(source);
        if target.board != source.board {
            steps.push((last, target));
        } else if steps.is_empty() {
            steps.push((source, source));
        }
        steps
    }

    fn migrate(
        &self,
        mut settings: CanonicalSettings,
        source: &'a SchemaVersion,
        target: &'a SchemaVersion,
        run: &mut Run<'_>,
    ) -> Result<CanonicalSettings, ConversionError> {
        for (from, to) in self.steps(source, target) {
            debug!(from = %from.version, to = %to.version, board = %to.board, "Migration step");
            let mut step = Step {
                from,
                to,
                rules: self.rules,
                recorder: &mut run.recorder,
                observer: run.observer,
                current: 0,
                total: step_total(&settings, from, to),
            };
            settings = step.run(settings).map_err(|r| run.reject(r))?;
        }
        Ok(settings)
    }
}

fn check_size(image: &RawImage, schema: &SchemaVersion) -> Result<(), RejectReason> {
    if image.len() != schema.image_size() {
        return Err(RejectReason::SizeMismatch {
            board: schema.board,
            version: schema.version,
            expected: schema.image_size(),
            actual: image.len(),
        });
    }
    Ok(())
}

fn retain_labels(metadata: &ImageMetadata, max_models: usize) -> ImageMetadata {
    let mut out = ImageMetadata::default();
    for (name, slots) in &metadata.labels {
        let kept: Vec<usize> = slots.iter().copied().filter(|s| *s < max_models).collect();
        if !kept.is_empty() {
            out.labels.insert(name.clone(), kept);
        }
    }
    out
}

fn split_path(path: &str) -> (&str, &str) {
    path.rsplit_once('.').unwrap_or(("", path))
}

fn record_fault(recorder: &mut LedgerRecorder, fault: &FieldFault) {
    let (component, field) = split_path(&fault.path);
    recorder.record(
        component,
        field,
        None,
        Some(fault.replacement.to_string()),
        Outcome::Invalidated,
        fault.error.to_string(),
    );
}

fn record_unknown(recorder: &mut LedgerRecorder, record: &Record, component: &str) {
    for (name, value) in record.iter() {
        match value {
            FieldValue::Unknown(_) => recorder.record(
                component,
                name,
                Some(value.to_string()),
                Some(value.to_string()),
                Outcome::VerifyRequired,
                "value outside the declared set kept as is",
            ),
            FieldValue::List(items) => {
                for (i, item) in items.iter().enumerate() {
                    record_unknown(recorder, item, &format!("{component}.{name}[{i}]"));
                }
            }
            _ => {}
        }
    }
}

/// Fields visited for a record: the new layout in order, then fields only
/// the old layout has.
fn visit_count(old: &RecordLayout, new: &RecordLayout) -> usize {
    new.fields.len() + old.fields.iter().filter(|f| new.field(&f.name).is_none()).count()
}

fn step_total(settings: &CanonicalSettings, from: &SchemaVersion, to: &SchemaVersion) -> u64 {
    let models = settings.used_models().filter(|(slot, _)| *slot < to.max_models).count();
    (visit_count(&from.general, &to.general) + models * visit_count(&from.model, &to.model)) as u64
}

/// One migration step between two adjacent schemas.
struct Step<'s, 'r> {
    from: &'s SchemaVersion,
    to: &'s SchemaVersion,
    rules: &'s RuleRegistry,
    recorder: &'r mut LedgerRecorder,
    observer: &'r dyn StorageObserver,
    current: u64,
    total: u64,
}

impl Step<'_, '_> {
    fn run(&mut self, settings: CanonicalSettings) -> Result<CanonicalSettings, RejectReason> {
        let (from, to) = (self.from, self.to);
        let general = self.migrate_record(
            &from.general,
            &to.general,
            &settings.general,
            "general",
            "general",
            true,
        )?;

        let mut models = vec![None; to.max_models];
        for (slot, model) in settings.used_models() {
            if slot >= to.max_models {
                self.recorder.record(
                    "",
                    &format!("models[{slot}]"),
                    model.get("name").map(FieldValue::to_string),
                    None,
                    Outcome::Invalidated,
                    format!("only {} model slots", to.max_models),
                );
                continue;
            }
            let component = format!("models[{slot}]");
            models[slot] = Some(self.migrate_record(&from.model, &to.model, model, &component, "model", true)?);
        }

        Ok(CanonicalSettings {
            board: to.board,
            version: to.version,
            general,
            models,
        })
    }

    fn field_boundary(&mut self, top_level: bool) -> Result<(), RejectReason> {
        if !top_level {
            return Ok(());
        }
        if self.observer.is_cancelled() {
            return Err(RejectReason::Cancelled);
        }
        self.current += 1;
        self.observer.on_event(&StorageEvent::Progress {
            stage: "migrate",
            current: self.current,
            total: self.total,
            unit: ProgressUnit::Entries,
        });
        Ok(())
    }

    fn migrate_record(
        &mut self,
        old: &RecordLayout,
        new: &RecordLayout,
        record: &Record,
        component: &str,
        layout_path: &str,
        top_level: bool,
    ) -> Result<Record, RejectReason> {
        let rules = self.rules;
        let mut out = Record::new();
        let mut consumed: HashSet<&str> = HashSet::new();

        for field in &new.fields {
            self.field_boundary(top_level)?;
            let rule_path = format!("{layout_path}.{}", field.name);
            let rule = rules.find(self.to.family, &rule_path, self.from.version, self.to.version);

            let value = match rule {
                Some(rule) => {
                    let source = rule.source_name();
                    if source != field.name {
                        consumed.insert(source);
                    }
                    match (old.field(source), record.get(source)) {
                        (Some(old_field), Some(value)) => self.apply_rule(rule, old_field, field, value, component),
                        _ => self.introduce(field, component),
                    }
                }
                None => match (old.field(&field.name), record.get(&field.name)) {
                    (Some(old_field), Some(value)) => {
                        self.carry(old_field, field, value, component, &rule_path)?
                    }
                    _ => self.introduce(field, component),
                },
            };
            out.push(field.name.clone(), value);
        }

        for field in old.fields.iter().filter(|f| new.field(&f.name).is_none()) {
            self.field_boundary(top_level)?;
            let Some(value) = record.get(&field.name) else {
                continue;
            };
            if consumed.contains(field.name.as_str()) {
                self.recorder.record(
                    component,
                    &field.name,
                    Some(value.to_string()),
                    None,
                    Outcome::Converted,
                    "consumed by a conversion rule",
                );
            } else {
                self.recorder.record(
                    component,
                    &field.name,
                    Some(value.to_string()),
                    None,
                    Outcome::Invalidated,
                    format!("removed in version {}", self.to.version),
                );
            }
        }
        Ok(out)
    }

    fn introduce(&mut self, field: &FieldLayout, component: &str) -> FieldValue {
        self.recorder.record(
            component,
            &field.name,
            None,
            Some(field.default.to_string()),
            Outcome::Converted,
            "introduced",
        );
        field.default.clone()
    }

    fn apply_rule(
        &mut self,
        rule: &ConversionRule,
        old_field: &FieldLayout,
        new_field: &FieldLayout,
        value: &FieldValue,
        component: &str,
    ) -> FieldValue {
        let ctx = RuleContext {
            from: self.from,
            to: self.to,
            old_field,
            new_field,
        };
        let result = (rule.apply)(value, &ctx);
        let fitted = fit(&result.value, new_field);
        let outcome = coerce::worst(result.outcome, fitted.outcome);
        let note = if fitted.note.is_empty() {
            result.note
        } else {
            format!("{}; {}", result.note, fitted.note)
        };
        self.recorder.record(
            component,
            &new_field.name,
            Some(value.to_string()),
            Some(fitted.value.to_string()),
            outcome,
            note,
        );
        fitted.value
    }

    /// Implicit rule for a field present in both layouts.
    fn carry(
        &mut self,
        old_field: &FieldLayout,
        new_field: &FieldLayout,
        value: &FieldValue,
        component: &str,
        layout_path: &str,
    ) -> Result<FieldValue, RejectReason> {
        if let (Encoding::List(old_list), Encoding::List(new_list), FieldValue::List(items)) =
            (&old_field.encoding, &new_field.encoding, value)
        {
            let mut migrated = Vec::with_capacity(new_list.capacity);
            for (i, item) in items.iter().enumerate() {
                let item_component = format!("{component}.{}[{i}]", new_field.name);
                if i >= new_list.capacity {
                    self.recorder.record(
                        component,
                        &format!("{}[{i}]", new_field.name),
                        Some(format!("{} fields", item.len())),
                        None,
                        Outcome::Invalidated,
                        format!("only {} entries fit", new_list.capacity),
                    );
                    continue;
                }
                migrated.push(self.migrate_record(
                    &old_list.element,
                    &new_list.element,
                    item,
                    &item_component,
                    layout_path,
                    false,
                )?);
            }
            if new_list.count.is_none() {
                for i in migrated.len()..new_list.capacity {
                    let default = new_list.element.default_record();
                    self.recorder.record(
                        component,
                        &format!("{}[{i}]", new_field.name),
                        None,
                        Some(format!("{} fields", default.len())),
                        Outcome::Converted,
                        "introduced",
                    );
                    migrated.push(default);
                }
            }
            return Ok(FieldValue::List(migrated));
        }

        let identity = self.from.version == self.to.version && self.from.board == self.to.board;
        if identity && let FieldValue::Unknown(raw) = value {
            self.recorder.record(
                component,
                &new_field.name,
                Some(value.to_string()),
                Some(value.to_string()),
                Outcome::Unchanged,
                format!("unknown value 0x{raw:X} kept"),
            );
            return Ok(value.clone());
        }

        let fitted = fit(value, new_field);
        self.recorder.record(
            component,
            &new_field.name,
            Some(value.to_string()),
            Some(fitted.value.to_string()),
            fitted.outcome,
            fitted.note,
        );
        Ok(fitted.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::decode_settings_strict;
    use crate::container::testing::{sample_image, sample_settings};
    use crate::events::{CollectingObserver, NullObserver};
    use crate::schema::SchemaTableBuilder;

    fn setup() -> (SchemaTable, RuleRegistry) {
        (SchemaTable::builtin().unwrap(), RuleRegistry::builtin())
    }

    fn converter<'a>(table: &'a SchemaTable, rules: &'a RuleRegistry) -> Converter<'a, NullObserver> {
        Converter::with_observer(table, rules, Arc::new(NullObserver))
    }

    fn image_of(settings: &CanonicalSettings, schema: &SchemaVersion) -> RawImage {
        let payload = encode_settings(settings, schema).unwrap();
        RawImage::from_payload(ContainerKind::Raw, payload, ImageMetadata::default()).unwrap()
    }

    #[test]
    fn test_default_image_decodes_to_defaults() {
        let (table, rules) = setup();
        let schema = table.get(Board::Stock, FirmwareVersion(216)).unwrap();
        let image = image_of(&schema.default_settings(), schema);

        let out = converter(&table, &rules).decode(&image, &ConversionOptions::default()).unwrap();
        assert_eq!(out.settings, schema.default_settings());
        assert!(out.ledger.is_empty());
    }

    #[test]
    fn test_removed_field_is_invalidated() {
        let (table, rules) = setup();
        let schema = table.get(Board::Stock, FirmwareVersion(216)).unwrap();
        let mut settings = sample_settings(schema);
        settings.general.set("speaker_pitch", FieldValue::Int(5));

        let out = converter(&table, &rules)
            .convert_settings(&settings, ConversionTarget::new(Board::Stock, 217))
            .unwrap();

        assert!(out.settings.general.get("speaker_pitch").is_none());
        let invalidated: Vec<_> = out
            .ledger
            .events()
            .iter()
            .filter(|e| e.outcome == Outcome::Invalidated)
            .collect();
        assert_eq!(invalidated.len(), 1);
        assert_eq!(invalidated[0].path(), "general.speaker_pitch");
        assert_eq!(invalidated[0].old_value.as_deref(), Some("5"));
        assert_eq!(out.image.version(), FirmwareVersion(217));
    }

    #[test]
    fn test_rename_rule_and_introduced_field() {
        let (table, rules) = setup();
        let schema = table.get(Board::M128, FirmwareVersion(216)).unwrap();
        let mut settings = schema.default_settings();
        settings.general.set("beeper_mode", FieldValue::Enum("alarms".into()));

        let out = converter(&table, &rules)
            .convert_settings(&settings, ConversionTarget::new(Board::M128, 217))
            .unwrap();
        assert_eq!(out.settings.general.get("beep_mode"), Some(&FieldValue::Int(-1)));
        assert!(out.settings.general.get("beeper_mode").is_none());

        let source: Vec<_> = out.ledger.events_for("general.beeper_mode").collect();
        assert_eq!(source.len(), 1);
        assert_eq!(source[0].outcome, Outcome::Converted);
        let gps: Vec<_> = out.ledger.events_for("general.gps_format").collect();
        assert_eq!(gps[0].note, "introduced");
    }

    #[test]
    fn test_same_version_is_all_unchanged() {
        let (table, rules) = setup();
        let image = sample_image(&table, Board::X9D, 218);

        let out = converter(&table, &rules)
            .convert_image(&image, ConversionTarget::new(Board::X9D, 218), &ConversionOptions::default())
            .unwrap();
        assert!(!out.ledger.is_empty());
        assert!(out.ledger.events().iter().all(|e| e.outcome == Outcome::Unchanged));
        assert_eq!(out.image.payload(), image.payload());
        assert_eq!(out.image.metadata(), image.metadata());
    }

    #[test]
    fn test_same_version_keeps_unknown_enum() {
        let (table, rules) = setup();
        let schema = table.get(Board::X9D, FirmwareVersion(218)).unwrap();
        let mut settings = schema.default_settings();
        settings.general.set("backlight_mode", FieldValue::Unknown(6));

        let out = converter(&table, &rules)
            .convert_settings(&settings, ConversionTarget::new(Board::X9D, 218))
            .unwrap();
        assert_eq!(out.settings, settings);
        assert_eq!(out.settings.general.get("backlight_mode"), Some(&FieldValue::Unknown(6)));
        assert!(out.ledger.events().iter().all(|e| e.outcome == Outcome::Unchanged));
        let event = out.ledger.events_for("general.backlight_mode").next().unwrap();
        assert_eq!(event.old_value.as_deref(), Some("unknown(0x6)"));
        assert_eq!(event.new_value.as_deref(), Some("unknown(0x6)"));
        assert_eq!(out.image.payload(), encode_settings(&settings, schema).unwrap().as_slice());
    }

    #[test]
    fn test_chain_is_composable() {
        let (table, rules) = setup();
        let conv = converter(&table, &rules);
        let opts = ConversionOptions::default();
        let image = sample_image(&table, Board::X7, 217);

        let direct = conv.convert_image(&image, ConversionTarget::new(Board::X7, 219), &opts).unwrap();
        let half = conv.convert_image(&image, ConversionTarget::new(Board::X7, 218), &opts).unwrap();
        let stepped = conv
            .convert_image(&half.image, ConversionTarget::new(Board::X7, 219), &opts)
            .unwrap();

        assert_eq!(direct.settings, stepped.settings);
        assert_eq!(direct.image.payload(), stepped.image.payload());
        assert_eq!(direct.ledger.len(), half.ledger.len() + stepped.ledger.len());
    }

    #[test]
    fn test_no_silent_loss() {
        let (table, rules) = setup();
        let image = sample_image(&table, Board::X9DPlus, 217);
        let out = converter(&table, &rules)
            .convert_image(&image, ConversionTarget::new(Board::X9DPlus, 218), &ConversionOptions::default())
            .unwrap();

        let from = table.get(Board::X9DPlus, FirmwareVersion(217)).unwrap();
        let to = table.get(Board::X9DPlus, FirmwareVersion(218)).unwrap();
        for dropped in from.model.fields.iter().filter(|f| to.model.field(&f.name).is_none()) {
            for slot in [0, 2] {
                let path = format!("models[{slot}].{}", dropped.name);
                let events: Vec<_> = out.ledger.events_for(&path).collect();
                assert_eq!(events.len(), 1, "{path}");
                assert_eq!(events[0].outcome, Outcome::Invalidated);
            }
        }
    }

    #[test]
    fn test_taranis_rules() {
        let (table, rules) = setup();
        let schema = table.get(Board::X9D, FirmwareVersion(218)).unwrap();
        let mut settings = sample_settings(schema);
        settings.general.set("backlight_bright", FieldValue::Int(30));
        let model = settings.model_mut(0).unwrap();
        let mut timers = model.get("timers").and_then(FieldValue::as_list).unwrap().to_vec();
        timers[1].set("persistent", FieldValue::Bool(true));
        model.set("timers", FieldValue::List(timers));

        let out = converter(&table, &rules)
            .convert_settings(&settings, ConversionTarget::new(Board::X9D, 219))
            .unwrap();
        assert_eq!(out.settings.general.get("backlight_bright"), Some(&FieldValue::Int(70)));
        let timers = out.settings.model(0).and_then(|m| m.get("timers")).and_then(FieldValue::as_list).unwrap();
        assert_eq!(timers[0].get("persistent"), Some(&FieldValue::Enum("off".into())));
        assert_eq!(timers[1].get("persistent"), Some(&FieldValue::Enum("flight".into())));
        let event = out.ledger.events_for("models[0].timers[1].persistent").next().unwrap();
        assert_eq!(event.outcome, Outcome::Converted);
    }

    #[test]
    fn test_board_switch_within_family() {
        let (table, rules) = setup();
        let schema = table.get(Board::X9D, FirmwareVersion(218)).unwrap();
        let mut settings = schema.default_settings();
        settings.general.set("owner_name", FieldValue::Text("Ana#Pilot".into()));

        let out = converter(&table, &rules)
            .convert_settings(&settings, ConversionTarget::new(Board::X7, 218))
            .unwrap();
        assert_eq!(out.settings.board, Board::X7);
        assert_eq!(
            out.settings.general.get("owner_name"),
            Some(&FieldValue::Text("Ana#Pilot".into()))
        );

        let schema = table.get(Board::X9D, FirmwareVersion(217)).unwrap();
        let mut settings = schema.default_settings();
        settings.general.set("owner_name", FieldValue::Text("ANA PILOT".into()));
        let out = converter(&table, &rules)
            .convert_settings(&settings, ConversionTarget::new(Board::X9D, 218))
            .unwrap();
        let event = out.ledger.events_for("general.owner_name").next().unwrap();
        assert_eq!(event.outcome, Outcome::Unchanged);
    }

    #[test]
    fn test_short_image_rejected() {
        let (table, rules) = setup();
        let image = sample_image(&table, Board::Stock, 216);
        let short = RawImage::from_payload(
            ContainerKind::Raw,
            image.payload()[..image.len() - 4].to_vec(),
            ImageMetadata::default(),
        )
        .unwrap();

        let err = converter(&table, &rules)
            .convert_image(&short, ConversionTarget::new(Board::Stock, 217), &ConversionOptions::default())
            .unwrap_err();
        assert!(matches!(err.reason(), RejectReason::SizeMismatch { .. }));
        assert_eq!(err.state(), ConversionState::VersionResolved);
    }

    #[test]
    fn test_downgrade_and_family_rejected() {
        let (table, rules) = setup();
        let conv = converter(&table, &rules);
        let opts = ConversionOptions::default();

        let image = sample_image(&table, Board::X7, 219);
        let err = conv.convert_image(&image, ConversionTarget::new(Board::X7, 218), &opts).unwrap_err();
        assert!(matches!(err.reason(), RejectReason::Downgrade { .. }));

        let image = sample_image(&table, Board::Stock, 216);
        let err = conv.convert_image(&image, ConversionTarget::new(Board::X9D, 219), &opts).unwrap_err();
        assert!(matches!(err.reason(), RejectReason::BoardFamilyMismatch { .. }));
        assert_eq!(err.state(), ConversionState::Start);
    }

    #[test]
    fn test_board_policy() {
        let (table, rules) = setup();
        let conv = converter(&table, &rules);
        let image = sample_image(&table, Board::X9D, 218);

        let mut opts = ConversionOptions {
            expected_board: Some(Board::X9DPlus),
            board_policy: BoardPolicy::Reject,
        };
        let err = conv.decode(&image, &opts).unwrap_err();
        assert!(matches!(err.reason(), RejectReason::BoardMismatch { .. }));

        opts.board_policy = BoardPolicy::PreferImage;
        let out = conv.decode(&image, &opts).unwrap();
        assert_eq!(out.settings.board, Board::X9D);
        let event = out.ledger.events_for("header.board").next().unwrap();
        assert_eq!(event.outcome, Outcome::VerifyRequired);

        let observer = Arc::new(CollectingObserver::new());
        Converter::with_observer(&table, &rules, observer.clone())
            .decode(&image, &opts)
            .unwrap();
        let warnings: Vec<String> = observer
            .events()
            .into_iter()
            .filter_map(|e| match e {
                StorageEvent::Log {
                    level: LogLevel::Warn,
                    message,
                } => Some(message),
                _ => None,
            })
            .collect();
        assert_eq!(warnings, ["Keeping board x9d declared by the image, expected x9d+"]);

        opts.board_policy = BoardPolicy::PreferProfile;
        let out = conv.decode(&image, &opts).unwrap();
        assert_eq!(out.settings.board, Board::X9DPlus);
        assert_eq!(out.ledger.len(), 1);

        opts.expected_board = Some(Board::Stock);
        let err = conv.decode(&image, &opts).unwrap_err();
        assert!(matches!(err.reason(), RejectReason::BoardFamilyMismatch { .. }));
    }

    #[test]
    fn test_decode_ends_in_terminal_state() {
        let (table, rules) = setup();
        let image = sample_image(&table, Board::X7, 219);
        let observer = Arc::new(CollectingObserver::new());
        Converter::with_observer(&table, &rules, observer.clone())
            .decode(&image, &ConversionOptions::default())
            .unwrap();

        let states: Vec<ConversionState> = observer
            .events()
            .into_iter()
            .filter_map(|e| match e {
                StorageEvent::StateChanged { to, .. } => Some(to),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            [
                ConversionState::VersionResolved,
                ConversionState::Decoding,
                ConversionState::Decoded,
            ]
        );
        assert!(ConversionState::Decoded.is_terminal());
    }

    #[test]
    fn test_unknown_enum_reported_on_decode() {
        let (table, rules) = setup();
        let schema = table.get(Board::Stock, FirmwareVersion(216)).unwrap();
        let mut settings = schema.default_settings();
        // backlight has five variants in three bits
        settings.general.set("backlight_mode", FieldValue::Unknown(6));
        let image = image_of(&settings, schema);

        let conv = converter(&table, &rules);
        let decoded = conv.decode(&image, &ConversionOptions::default()).unwrap();
        assert_eq!(decoded.settings.general.get("backlight_mode"), Some(&FieldValue::Unknown(6)));
        let event = decoded.ledger.events_for("general.backlight_mode").next().unwrap();
        assert_eq!(event.outcome, Outcome::VerifyRequired);

        let converted = conv
            .convert_image(&image, ConversionTarget::new(Board::Stock, 217), &ConversionOptions::default())
            .unwrap();
        assert_eq!(
            converted.settings.general.get("backlight_mode"),
            Some(&FieldValue::Enum("off".into()))
        );
        let events: Vec<_> = converted.ledger.events_for("general.backlight_mode").collect();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].outcome, Outcome::Invalidated);
    }

    #[test]
    fn test_field_fault_recorded() {
        let (table, rules) = setup();
        let schema = table.get(Board::Stock, FirmwareVersion(216)).unwrap();
        let mut payload = encode_settings(&schema.default_settings(), schema).unwrap();
        // contrast occupies the low six bits of the first general byte
        payload[3] = (payload[3] & 0xC0) | 0x3F;
        let image = RawImage::from_payload(ContainerKind::Raw, payload, ImageMetadata::default()).unwrap();

        let out = converter(&table, &rules).decode(&image, &ConversionOptions::default()).unwrap();
        assert_eq!(out.settings.general.get("contrast"), Some(&FieldValue::Int(25)));
        let event = out.ledger.events_for("general.contrast").next().unwrap();
        assert_eq!(event.outcome, Outcome::Invalidated);
        assert_eq!(event.new_value.as_deref(), Some("25"));
    }

    #[test]
    fn test_cancellation_between_fields() {
        let (table, rules) = setup();
        let observer = Arc::new(CollectingObserver::cancelling_after(3));
        let conv = Converter::with_observer(&table, &rules, observer.clone());
        let image = sample_image(&table, Board::X9D, 217);

        let err = conv
            .convert_image(&image, ConversionTarget::new(Board::X9D, 219), &ConversionOptions::default())
            .unwrap_err();
        assert!(matches!(err.reason(), RejectReason::Cancelled));
        assert_eq!(err.state(), ConversionState::Migrating);
        assert_eq!(observer.progress_count(), 3);
    }

    const SMALL_216: &str = r#"
family = "avr9x"
version = 216
boards = ["stock"]
max_models = 3

[general]
size = 1
fields = [{ name = "contrast", offset = 0, width = 6, type = "unsigned", default = 25 }]

[records.point]
size = 1
fields = [{ name = "v", offset = 0, width = 8, type = "signed" }]

[model]
size = 6
fields = [
  { name = "name", offset = 0, type = "text", capacity = 2, charset = "ascii", terminator = "padded" },
  { name = "points", offset = 24, type = "list", element = "point", capacity = 3, count_offset = 16, count_width = 2 },
]
"#;

    const SMALL_217: &str = r#"
family = "avr9x"
version = 217
boards = ["stock"]
max_models = 1

[general]
size = 1
fields = [{ name = "contrast", offset = 0, width = 6, type = "unsigned", default = 25 }]

[records.point]
size = 1
fields = [{ name = "v", offset = 0, width = 8, type = "signed" }]

[model]
size = 5
fields = [
  { name = "name", offset = 0, type = "text", capacity = 2, charset = "ascii", terminator = "padded" },
  { name = "points", offset = 24, type = "list", element = "point", capacity = 2, count_offset = 16, count_width = 2 },
]
"#;

    #[test]
    fn test_capacity_shrink() {
        let table = SchemaTableBuilder::new()
            .add_toml("small_216", SMALL_216)
            .unwrap()
            .add_toml("small_217", SMALL_217)
            .unwrap()
            .build()
            .unwrap();
        let rules = RuleRegistry::new();
        let schema = table.get(Board::Stock, FirmwareVersion(216)).unwrap();

        let mut settings = schema.default_settings();
        let points: Vec<Record> = [1, 2, 3]
            .into_iter()
            .map(|v| {
                let mut point = Record::new();
                point.push("v".into(), FieldValue::Int(v));
                point
            })
            .collect();
        let mut model = schema.model.default_record();
        model.set("name", FieldValue::Text("AB".into()));
        model.set("points", FieldValue::List(points));
        settings.models[0] = Some(model.clone());
        settings.models[2] = Some(model);

        let out = converter(&table, &rules)
            .convert_settings(&settings, ConversionTarget::new(Board::Stock, 217))
            .unwrap();

        let invalidated: Vec<String> = out
            .ledger
            .events()
            .iter()
            .filter(|e| e.outcome == Outcome::Invalidated)
            .map(|e| e.path())
            .collect();
        assert_eq!(invalidated, vec!["models[0].points[2]", "models[2]"]);
        assert_eq!(out.settings.models.len(), 1);

        let target = table.get(Board::Stock, FirmwareVersion(217)).unwrap();
        let back = decode_settings_strict(out.image.payload(), target).unwrap();
        assert_eq!(back, out.settings);
    }
}
