//! Schema version table.
//!
//! Every supported (board, firmware version) pair maps to a [`SchemaVersion`]:
//! the bit layouts of the general settings block and of one model slot. The
//! table is built once from TOML descriptions by [`SchemaTableBuilder`],
//! validated, and is read-only afterwards.

pub mod builtin;
pub mod description;
pub mod layout;

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use thiserror::Error;

use crate::board::{Board, BoardFamily, FirmwareVersion};
use crate::codec::image::IMAGE_HEADER_LEN;
use crate::codec::text::{fit_text, text_width};
use crate::codec::{FieldValue, fixed_to_stored};
use crate::settings::CanonicalSettings;
use description::{FieldDescription, FieldKind, RecordDescription, SchemaDescription};

pub use layout::{
    BitSpan, Charset, Encoding, EnumVariant, FieldLayout, ListLayout, RecordLayout, Terminator,
    ValueRange,
};

const MAX_NUMERIC_WIDTH: u32 = 32;
const MAX_RECORD_DEPTH: usize = 4;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchemaError {
    #[error("no schema registered for board {board}")]
    UnknownBoard { board: Board },
    #[error("no schema for board {board} at or below version {version}")]
    NoCompatibleVersion {
        board: Board,
        version: FirmwareVersion,
    },
    #[error("{origin}: {message}")]
    Description { origin: String, message: String },
    #[error("{record}.{field}: ends at bit {end}, record has {size_bits} bits")]
    LayoutOverflow {
        record: String,
        field: String,
        end: u32,
        size_bits: u32,
    },
    #[error("{record}: fields '{first}' and '{second}' overlap")]
    Overlap {
        record: String,
        first: String,
        second: String,
    },
    #[error("{record}.{field}: invalid width {width}: {reason}")]
    InvalidWidth {
        record: String,
        field: String,
        width: u32,
        reason: String,
    },
    #[error("board {board} version {version}: new field '{field}' needs an explicit default")]
    MissingDefault {
        board: Board,
        version: FirmwareVersion,
        field: String,
    },
    #[error("{record}.{field}: unknown enum set '{set}'")]
    UnknownEnumSet {
        record: String,
        field: String,
        set: String,
    },
    #[error("{record}.{field}: unknown element record '{element}'")]
    UnknownRecord {
        record: String,
        field: String,
        element: String,
    },
    #[error("{record}.{field}: invalid default: {reason}")]
    InvalidDefault {
        record: String,
        field: String,
        reason: String,
    },
    #[error("duplicate {what}")]
    Duplicate { what: String },
}

/// Layout of one image for one board at one firmware version.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaVersion {
    pub family: BoardFamily,
    pub board: Board,
    pub version: FirmwareVersion,
    pub general: RecordLayout,
    pub model: RecordLayout,
    pub max_models: usize,
}

impl SchemaVersion {
    /// Image size in bytes, header included.
    pub fn image_size(&self) -> usize {
        IMAGE_HEADER_LEN + self.general.size + self.max_models * self.model.size
    }

    /// Settings with every field at its default and all slots empty.
    pub fn default_settings(&self) -> CanonicalSettings {
        CanonicalSettings {
            board: self.board,
            version: self.version,
            general: self.general.default_record(),
            models: vec![None; self.max_models],
        }
    }
}

/// Immutable table of every registered schema.
#[derive(Debug, Clone)]
pub struct SchemaTable {
    entries: BTreeMap<(Board, FirmwareVersion), SchemaVersion>,
}

impl SchemaTable {
    /// Table holding only the descriptions compiled into the crate.
    pub fn builtin() -> Result<Self, SchemaError> {
        SchemaTableBuilder::new().add_builtin()?.build()
    }

    pub fn get(&self, board: Board, version: FirmwareVersion) -> Option<&SchemaVersion> {
        self.entries.get(&(board, version))
    }

    /// Exact match, otherwise the greatest registered version below
    /// `version`. Never resolves to a newer schema.
    pub fn resolve(&self, board: Board, version: FirmwareVersion) -> Result<&SchemaVersion, SchemaError> {
        if let Some(exact) = self.get(board, version) {
            return Ok(exact);
        }
        if !self.entries.keys().any(|(b, _)| *b == board) {
            return Err(SchemaError::UnknownBoard { board });
        }
        self.entries
            .range((board, FirmwareVersion(0))..(board, version))
            .next_back()
            .map(|(_, schema)| schema)
            .ok_or(SchemaError::NoCompatibleVersion { board, version })
    }

    /// Image size for the schema `resolve` picks.
    pub fn size_of(&self, board: Board, version: FirmwareVersion) -> Result<usize, SchemaError> {
        self.resolve(board, version).map(SchemaVersion::image_size)
    }

    /// Order two versions of `family`. `None` if either is not registered
    /// for any board of the family.
    pub fn compare(&self, family: BoardFamily, a: FirmwareVersion, b: FirmwareVersion) -> Option<Ordering> {
        let known = |v: FirmwareVersion| {
            self.entries
                .values()
                .any(|s| s.family == family && s.version == v)
        };
        (known(a) && known(b)).then(|| a.cmp(&b))
    }

    /// Registered versions of `board` in `from..=to`, ascending.
    pub fn chain(&self, board: Board, from: FirmwareVersion, to: FirmwareVersion) -> Vec<FirmwareVersion> {
        if from > to {
            return Vec::new();
        }
        self.entries
            .range((board, from)..=(board, to))
            .map(|((_, v), _)| *v)
            .collect()
    }

    pub fn versions(&self, board: Board) -> Vec<FirmwareVersion> {
        self.entries
            .keys()
            .filter(|(b, _)| *b == board)
            .map(|(_, v)| *v)
            .collect()
    }

    pub fn latest(&self, board: Board) -> Option<&SchemaVersion> {
        self.entries
            .range((board, FirmwareVersion(0))..=(board, FirmwareVersion(u8::MAX)))
            .next_back()
            .map(|(_, s)| s)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SchemaVersion> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Collects descriptions and validates them into a [`SchemaTable`].
#[derive(Debug, Default)]
pub struct SchemaTableBuilder {
    descriptions: Vec<(String, SchemaDescription)>,
}

impl SchemaTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and queue one description. `origin` names it in errors.
    pub fn add_toml(mut self, origin: &str, text: &str) -> Result<Self, SchemaError> {
        let desc = SchemaDescription::parse(text).map_err(|e| SchemaError::Description {
            origin: origin.to_string(),
            message: e.to_string(),
        })?;
        self.descriptions.push((origin.to_string(), desc));
        Ok(self)
    }

    pub fn add_builtin(self) -> Result<Self, SchemaError> {
        builtin::DESCRIPTIONS
            .iter()
            .try_fold(self, |builder, (origin, text)| builder.add_toml(origin, text))
    }

    /// Queue every `*.toml` file of `dir`, in file name order.
    pub fn add_dir(self, dir: &Path) -> Result<Self, SchemaError> {
        let io_error = |e: std::io::Error| SchemaError::Description {
            origin: dir.display().to_string(),
            message: e.to_string(),
        };
        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(io_error)? {
            let path = entry.map_err(io_error)?.path();
            if path.extension().is_some_and(|ext| ext == "toml") {
                files.push(path);
            }
        }
        files.sort();

        let mut builder = self;
        for path in files {
            let text = std::fs::read_to_string(&path).map_err(|e| SchemaError::Description {
                origin: path.display().to_string(),
                message: e.to_string(),
            })?;
            builder = builder.add_toml(&path.display().to_string(), &text)?;
        }
        Ok(builder)
    }

    /// Validate everything queued and freeze the table.
    pub fn build(self) -> Result<SchemaTable, SchemaError> {
        let mut entries = BTreeMap::new();
        let mut explicit: BTreeMap<(Board, FirmwareVersion), BTreeSet<String>> = BTreeMap::new();

        for (origin, desc) in &self.descriptions {
            for draft in build_description(origin, desc)? {
                let key = (draft.schema.board, draft.schema.version);
                if entries.contains_key(&key) {
                    return Err(SchemaError::Duplicate {
                        what: format!("schema for board {} version {}", key.0, key.1),
                    });
                }
                tracing::debug!(
                    origin = %origin,
                    board = %key.0,
                    version = %key.1,
                    size = draft.schema.image_size(),
                    "Registered schema"
                );
                explicit.insert(key, draft.explicit_defaults);
                entries.insert(key, draft.schema);
            }
        }

        check_new_field_defaults(&entries, &explicit)?;
        tracing::debug!(entries = entries.len(), "Schema table built");
        Ok(SchemaTable { entries })
    }
}

struct Draft {
    schema: SchemaVersion,
    /// Layout paths (`general.contrast`, `model.timers.mode`) with a declared default.
    explicit_defaults: BTreeSet<String>,
}

fn description_error(origin: &str, message: impl Into<String>) -> SchemaError {
    SchemaError::Description {
        origin: origin.to_string(),
        message: message.into(),
    }
}

fn build_description(origin: &str, desc: &SchemaDescription) -> Result<Vec<Draft>, SchemaError> {
    let family: BoardFamily = desc
        .family
        .parse()
        .map_err(|e: String| description_error(origin, e))?;

    let mut boards = Vec::with_capacity(desc.boards.len());
    for name in &desc.boards {
        let board: Board = name.parse().map_err(|e: String| description_error(origin, e))?;
        if board.family() != family {
            return Err(description_error(
                origin,
                format!("board {board} is not in family {family}"),
            ));
        }
        boards.push(board);
    }
    for (name, overrides) in &desc.board_enums {
        if !desc.boards.contains(name) {
            return Err(description_error(
                origin,
                format!("enum overrides for unlisted board '{name}'"),
            ));
        }
        if let Some(set) = overrides.keys().find(|set| !desc.enums.contains_key(*set)) {
            return Err(SchemaError::UnknownEnumSet {
                record: "board_enums".into(),
                field: name.clone(),
                set: set.clone(),
            });
        }
    }

    let mut drafts = Vec::with_capacity(boards.len());
    for board in boards {
        let mut enums = desc.enums.clone();
        if let Some(overrides) = desc.board_enums.get(board.name()) {
            enums.extend(overrides.clone());
        }
        let mut ctx = BuildContext {
            origin,
            desc,
            enums,
            explicit: BTreeSet::new(),
        };
        let general = ctx.record("general", "general", &desc.general, 0)?;
        let model = ctx.record("model", "model", &desc.model, 0)?;
        drafts.push(Draft {
            schema: SchemaVersion {
                family,
                board,
                version: FirmwareVersion(desc.version),
                general,
                model,
                max_models: desc.max_models,
            },
            explicit_defaults: ctx.explicit,
        });
    }
    Ok(drafts)
}

struct BuildContext<'a> {
    origin: &'a str,
    desc: &'a SchemaDescription,
    enums: BTreeMap<String, Vec<String>>,
    explicit: BTreeSet<String>,
}

impl BuildContext<'_> {
    fn record(
        &mut self,
        name: &str,
        path: &str,
        rd: &RecordDescription,
        depth: usize,
    ) -> Result<RecordLayout, SchemaError> {
        if depth > MAX_RECORD_DEPTH {
            return Err(description_error(
                self.origin,
                format!("record '{name}' nested too deeply"),
            ));
        }
        let mut fields = Vec::with_capacity(rd.fields.len());
        for fd in &rd.fields {
            if fields.iter().any(|f: &FieldLayout| f.name == fd.name) {
                return Err(SchemaError::Duplicate {
                    what: format!("field {path}.{}", fd.name),
                });
            }
            fields.push(self.field(name, path, fd, depth)?);
        }
        let layout = RecordLayout {
            name: name.to_string(),
            size: rd.size,
            fields,
        };
        check_spans(&layout)?;
        Ok(layout)
    }

    fn field(
        &mut self,
        record: &str,
        path: &str,
        fd: &FieldDescription,
        depth: usize,
    ) -> Result<FieldLayout, SchemaError> {
        let invalid_width = |width: u32, reason: &str| SchemaError::InvalidWidth {
            record: record.to_string(),
            field: fd.name.clone(),
            width,
            reason: reason.to_string(),
        };
        let numeric_width = |fallback: Option<u32>| -> Result<u32, SchemaError> {
            let width = fd.width.or(fallback).ok_or_else(|| invalid_width(0, "width is required"))?;
            if width == 0 || width > MAX_NUMERIC_WIDTH {
                return Err(invalid_width(width, "must be 1..=32 bits"));
            }
            Ok(width)
        };

        let (encoding, width) = match fd.kind {
            FieldKind::Unsigned => (Encoding::Unsigned, numeric_width(None)?),
            FieldKind::Signed => (Encoding::Signed, numeric_width(None)?),
            FieldKind::Fixed => {
                let scale = fd
                    .scale
                    .filter(|s| *s > 0.0 && s.is_finite())
                    .ok_or_else(|| {
                        description_error(self.origin, format!("{path}.{}: fixed field needs a positive scale", fd.name))
                    })?;
                (
                    Encoding::Fixed {
                        scale,
                        signed: fd.signed,
                    },
                    numeric_width(None)?,
                )
            }
            FieldKind::Flag => (Encoding::Flag, numeric_width(Some(1))?),
            FieldKind::Enum => {
                let set = fd.set.as_deref().unwrap_or(&fd.name);
                let tags = self.enums.get(set).ok_or_else(|| SchemaError::UnknownEnumSet {
                    record: record.to_string(),
                    field: fd.name.clone(),
                    set: set.to_string(),
                })?;
                let width = numeric_width(None)?;
                if tags.len() as u64 > 1u64 << width {
                    return Err(invalid_width(width, "too narrow for the enum set"));
                }
                let variants = tags
                    .iter()
                    .enumerate()
                    .map(|(i, tag)| EnumVariant {
                        raw: i as u32,
                        tag: tag.clone(),
                    })
                    .collect();
                (Encoding::Enum(variants), width)
            }
            FieldKind::Text => {
                let capacity = fd.capacity.ok_or_else(|| {
                    description_error(self.origin, format!("{path}.{}: text needs a capacity", fd.name))
                })?;
                let charset = fd.charset.unwrap_or(Charset::Ascii);
                let terminator = fd.terminator.unwrap_or(Terminator::Null);
                if charset == Charset::Zchar && terminator == Terminator::Null {
                    return Err(description_error(
                        self.origin,
                        format!("{path}.{}: radio alphabet text cannot be null terminated", fd.name),
                    ));
                }
                if terminator == Terminator::Length && capacity > u8::MAX as usize {
                    return Err(invalid_width(text_width(capacity, terminator), "length prefix holds at most 255"));
                }
                let width = text_width(capacity, terminator);
                if fd.width.is_some_and(|w| w != width) {
                    return Err(invalid_width(fd.width.unwrap_or(0), "does not match the text capacity"));
                }
                (
                    Encoding::Text {
                        capacity,
                        charset,
                        terminator,
                    },
                    width,
                )
            }
            FieldKind::List => {
                let desc = self.desc;
                let element_name = fd.element.as_deref().unwrap_or(&fd.name);
                let rd = desc
                    .records
                    .get(element_name)
                    .ok_or_else(|| SchemaError::UnknownRecord {
                        record: record.to_string(),
                        field: fd.name.clone(),
                        element: element_name.to_string(),
                    })?;
                let capacity = fd.capacity.ok_or_else(|| {
                    description_error(self.origin, format!("{path}.{}: list needs a capacity", fd.name))
                })?;
                let element_path = format!("{path}.{}", fd.name);
                let element = self.record(element_name, &element_path, rd, depth + 1)?;
                let stride = fd.stride.unwrap_or(element.bits());
                if stride < element.bits() || stride == 0 {
                    return Err(invalid_width(stride, "stride smaller than the element record"));
                }
                let count = match (fd.count_offset, fd.count_width) {
                    (Some(offset), Some(width)) => {
                        if width == 0 || width > MAX_NUMERIC_WIDTH {
                            return Err(invalid_width(width, "count must be 1..=32 bits"));
                        }
                        if capacity as u64 >= 1u64 << width {
                            return Err(invalid_width(width, "count field cannot hold the capacity"));
                        }
                        Some(BitSpan { offset, width })
                    }
                    (None, None) => None,
                    _ => {
                        return Err(description_error(
                            self.origin,
                            format!("{path}.{}: count_offset and count_width go together", fd.name),
                        ));
                    }
                };
                let width = stride * capacity as u32;
                (
                    Encoding::List(Box::new(ListLayout {
                        count,
                        capacity,
                        stride,
                        element,
                    })),
                    width,
                )
            }
        };

        let range = match (fd.min, fd.max) {
            (None, None) => None,
            _ if !matches!(fd.kind, FieldKind::Unsigned | FieldKind::Signed | FieldKind::Fixed) => {
                return Err(description_error(
                    self.origin,
                    format!("{path}.{}: min/max only apply to numeric fields", fd.name),
                ));
            }
            (min, max) => {
                let min = min.unwrap_or(i64::MIN);
                let max = max.unwrap_or(i64::MAX);
                if min > max {
                    return Err(description_error(
                        self.origin,
                        format!("{path}.{}: min {min} above max {max}", fd.name),
                    ));
                }
                Some(ValueRange::new(min, max))
            }
        };

        let mut layout = FieldLayout {
            name: fd.name.clone(),
            offset: fd.offset,
            width,
            encoding,
            range,
            default: FieldValue::Int(0),
        };
        layout.default = self.default_value(record, &layout, fd.default.as_ref())?;
        if fd.default.is_some() {
            self.explicit.insert(format!("{path}.{}", fd.name));
        }
        Ok(layout)
    }

    fn default_value(
        &self,
        record: &str,
        layout: &FieldLayout,
        declared: Option<&toml::Value>,
    ) -> Result<FieldValue, SchemaError> {
        let invalid = |reason: String| SchemaError::InvalidDefault {
            record: record.to_string(),
            field: layout.name.clone(),
            reason,
        };
        let bounds = layout.stored_bounds();
        let check_stored = |stored: i64| match bounds {
            Some(b) if !b.contains(stored) => Err(invalid(format!(
                "stored value {stored} outside {}..={}",
                b.min, b.max
            ))),
            _ => Ok(()),
        };

        match (&layout.encoding, declared) {
            (Encoding::Unsigned | Encoding::Signed, None) => {
                Ok(FieldValue::Int(bounds.map_or(0, |b| b.clamp(0))))
            }
            (Encoding::Unsigned | Encoding::Signed, Some(toml::Value::Integer(v))) => {
                check_stored(*v)?;
                Ok(FieldValue::Int(*v))
            }
            (Encoding::Fixed { scale, .. }, None) => {
                let stored = bounds.map_or(0, |b| b.clamp(0));
                Ok(FieldValue::Fixed(stored as f64 * scale))
            }
            (Encoding::Fixed { scale, .. }, Some(value)) => {
                let v = match value {
                    toml::Value::Float(f) => *f,
                    toml::Value::Integer(i) => *i as f64,
                    other => return Err(invalid(format!("expected a number, got {}", other.type_str()))),
                };
                check_stored(fixed_to_stored(v, *scale))?;
                Ok(FieldValue::Fixed(fixed_to_stored(v, *scale) as f64 * scale))
            }
            (Encoding::Flag, None) => Ok(FieldValue::Bool(false)),
            (Encoding::Flag, Some(toml::Value::Boolean(b))) => Ok(FieldValue::Bool(*b)),
            (Encoding::Enum(variants), None) => variants
                .first()
                .map(|v| FieldValue::Enum(v.tag.clone()))
                .ok_or_else(|| invalid("empty enum set".into())),
            (Encoding::Enum(_), Some(toml::Value::String(tag))) => {
                if layout.variant_by_tag(tag).is_none() {
                    return Err(invalid(format!("'{tag}' is not a variant")));
                }
                Ok(FieldValue::Enum(tag.clone()))
            }
            (Encoding::Text { .. }, None) => Ok(FieldValue::Text(String::new())),
            (
                Encoding::Text {
                    capacity,
                    charset,
                    terminator,
                },
                Some(toml::Value::String(s)),
            ) => {
                let (fitted, lossy) = fit_text(s, *capacity, *charset, *terminator);
                if lossy {
                    return Err(invalid(format!("\"{s}\" does not fit the field")));
                }
                Ok(FieldValue::Text(fitted))
            }
            (Encoding::List(list), None) => Ok(FieldValue::List(match list.count {
                Some(_) => Vec::new(),
                None => vec![list.element.default_record(); list.capacity],
            })),
            (Encoding::List(_), Some(_)) => Err(invalid("lists cannot declare a default".into())),
            (encoding, Some(other)) => Err(invalid(format!(
                "{} default given for a {} field",
                other.type_str(),
                encoding.kind_name()
            ))),
        }
    }
}

/// Every span (fields and list counts) must fit the record and not overlap.
fn check_spans(layout: &RecordLayout) -> Result<(), SchemaError> {
    let size_bits = layout.bits();
    let mut spans: Vec<(String, BitSpan)> = Vec::new();
    for field in &layout.fields {
        spans.push((field.name.clone(), field.span()));
        if let Some(count) = field.as_list().and_then(|l| l.count) {
            spans.push((format!("{}.count", field.name), count));
        }
    }

    for (name, span) in &spans {
        if span.end() > size_bits {
            return Err(SchemaError::LayoutOverflow {
                record: layout.name.clone(),
                field: name.clone(),
                end: span.end(),
                size_bits,
            });
        }
    }

    spans.sort_by_key(|(_, s)| s.offset);
    let mut furthest: Option<(&str, u32)> = None;
    for (name, span) in &spans {
        if let Some((prev, end)) = furthest
            && span.offset < end
        {
            return Err(SchemaError::Overlap {
                record: layout.name.clone(),
                first: prev.to_string(),
                second: name.clone(),
            });
        }
        if furthest.is_none_or(|(_, end)| span.end() > end) {
            furthest = Some((name, span.end()));
        }
    }
    Ok(())
}

/// A field absent from the previous registered version of the same board
/// must declare its default.
fn check_new_field_defaults(
    entries: &BTreeMap<(Board, FirmwareVersion), SchemaVersion>,
    explicit: &BTreeMap<(Board, FirmwareVersion), BTreeSet<String>>,
) -> Result<(), SchemaError> {
    let mut previous: Option<&SchemaVersion> = None;
    for (key, schema) in entries {
        if let Some(prev) = previous.filter(|p| p.board == schema.board) {
            let declared = explicit.get(key).cloned().unwrap_or_default();
            for (old, new, path) in [
                (&prev.general, &schema.general, "general"),
                (&prev.model, &schema.model, "model"),
            ] {
                if let Some(field) = first_undeclared(old, new, path, &declared) {
                    return Err(SchemaError::MissingDefault {
                        board: schema.board,
                        version: schema.version,
                        field,
                    });
                }
            }
        }
        previous = Some(schema);
    }
    Ok(())
}

fn first_undeclared(
    old: &RecordLayout,
    new: &RecordLayout,
    path: &str,
    declared: &BTreeSet<String>,
) -> Option<String> {
    for field in &new.fields {
        let field_path = format!("{path}.{}", field.name);
        match (old.field(&field.name), field.as_list()) {
            // a new list starts empty
            (None, Some(_)) => {}
            (None, None) if !declared.contains(&field_path) => return Some(field_path),
            (None, None) => {}
            (Some(old_field), Some(new_list)) => {
                if let Some(old_list) = old_field.as_list()
                    && let Some(missing) =
                        first_undeclared(&old_list.element, &new_list.element, &field_path, declared)
                {
                    return Some(missing);
                }
            }
            (Some(_), None) => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = r#"
        family = "taranis"
        version = 100
        boards = ["x9d", "x7"]
        max_models = 2

        [enums]
        mode = ["off", "on", "auto"]

        [board_enums.x7]
        mode = ["off", "on"]

        [general]
        size = 2
        fields = [
          { name = "level", offset = 0, width = 4, type = "unsigned", max = 10, default = 5 },
          { name = "mode", offset = 4, width = 2, type = "enum", set = "mode" },
        ]

        [records.slot]
        size = 1
        fields = [ { name = "v", offset = 0, width = 8, type = "signed" } ]

        [model]
        size = 4
        fields = [
          { name = "slots", offset = 8, type = "list", element = "slot", capacity = 3, count_offset = 0, count_width = 2 },
        ]
    "#;

    fn with_general_fields(version: u8, fields: &str) -> String {
        BASE.replace("version = 100", &format!("version = {version}"))
            .replace(
                r#"{ name = "mode", offset = 4, width = 2, type = "enum", set = "mode" },"#,
                &format!(r#"{{ name = "mode", offset = 4, width = 2, type = "enum", set = "mode" }}, {fields}"#),
            )
    }

    fn build(docs: &[&str]) -> Result<SchemaTable, SchemaError> {
        docs.iter()
            .enumerate()
            .try_fold(SchemaTableBuilder::new(), |b, (i, doc)| b.add_toml(&format!("doc{i}"), doc))?
            .build()
    }

    #[test]
    fn test_board_enum_override() {
        let table = build(&[BASE]).unwrap();
        let x9d = table.get(Board::X9D, FirmwareVersion(100)).unwrap();
        let x7 = table.get(Board::X7, FirmwareVersion(100)).unwrap();
        assert_eq!(x9d.general.field("mode").unwrap().variants().unwrap().len(), 3);
        assert_eq!(x7.general.field("mode").unwrap().variants().unwrap().len(), 2);
        assert_eq!(x9d.image_size(), 3 + 2 + 2 * 4);
    }

    #[test]
    fn test_resolve_never_newer() {
        let v105 = with_general_fields(105, "");
        let table = build(&[BASE, &v105]).unwrap();

        let exact = table.resolve(Board::X7, FirmwareVersion(105)).unwrap();
        assert_eq!(exact.version, FirmwareVersion(105));
        let older = table.resolve(Board::X7, FirmwareVersion(103)).unwrap();
        assert_eq!(older.version, FirmwareVersion(100));
        assert_eq!(
            table.resolve(Board::X7, FirmwareVersion(99)),
            Err(SchemaError::NoCompatibleVersion {
                board: Board::X7,
                version: FirmwareVersion(99)
            })
        );
        assert_eq!(
            table.resolve(Board::Stock, FirmwareVersion(100)),
            Err(SchemaError::UnknownBoard { board: Board::Stock })
        );
        assert_eq!(table.size_of(Board::X9D, FirmwareVersion(200)).unwrap(), 13);
    }

    #[test]
    fn test_chain_and_compare() {
        let v105 = with_general_fields(105, "");
        let v110 = with_general_fields(110, "");
        let table = build(&[BASE, &v105, &v110]).unwrap();
        assert_eq!(
            table.chain(Board::X9D, FirmwareVersion(100), FirmwareVersion(110)),
            vec![FirmwareVersion(100), FirmwareVersion(105), FirmwareVersion(110)]
        );
        assert!(table.chain(Board::X9D, FirmwareVersion(110), FirmwareVersion(100)).is_empty());
        assert_eq!(
            table.compare(BoardFamily::Taranis, FirmwareVersion(110), FirmwareVersion(105)),
            Some(Ordering::Greater)
        );
        assert_eq!(
            table.compare(BoardFamily::Avr9x, FirmwareVersion(110), FirmwareVersion(105)),
            None
        );
        assert_eq!(table.latest(Board::X7).unwrap().version, FirmwareVersion(110));
    }

    #[test]
    fn test_missing_default_for_new_field() {
        let v105 = with_general_fields(105, r#"{ name = "volume", offset = 8, width = 4, type = "unsigned" },"#);
        assert!(matches!(
            build(&[BASE, &v105]),
            Err(SchemaError::MissingDefault { field, .. }) if field == "general.volume"
        ));

        let v105 = with_general_fields(
            105,
            r#"{ name = "volume", offset = 8, width = 4, type = "unsigned", default = 3 },"#,
        );
        assert!(build(&[BASE, &v105]).is_ok());
    }

    #[test]
    fn test_layout_overflow() {
        let doc = with_general_fields(100, r#"{ name = "big", offset = 8, width = 9, type = "unsigned" },"#);
        assert!(matches!(
            build(&[&doc]),
            Err(SchemaError::LayoutOverflow { end: 17, size_bits: 16, .. })
        ));
    }

    #[test]
    fn test_overlap() {
        let doc = with_general_fields(100, r#"{ name = "clash", offset = 5, width = 2, type = "unsigned" },"#);
        assert!(matches!(
            build(&[&doc]),
            Err(SchemaError::Overlap { first, second, .. }) if first == "mode" && second == "clash"
        ));
    }

    #[test]
    fn test_invalid_width_and_default() {
        let wide = with_general_fields(100, r#"{ name = "w", offset = 8, width = 0, type = "signed" },"#);
        assert!(matches!(build(&[&wide]), Err(SchemaError::InvalidWidth { .. })));

        let bad_default =
            with_general_fields(100, r#"{ name = "d", offset = 8, width = 2, type = "unsigned", default = 9 },"#);
        assert!(matches!(build(&[&bad_default]), Err(SchemaError::InvalidDefault { .. })));

        let bad_tag = with_general_fields(
            100,
            r#"{ name = "m2", offset = 8, width = 2, type = "enum", set = "mode", default = "auto" },"#,
        );
        // "auto" is not in the x7 override
        assert!(matches!(build(&[&bad_tag]), Err(SchemaError::InvalidDefault { .. })));
    }

    #[test]
    fn test_unknown_references() {
        let doc = with_general_fields(100, r#"{ name = "e", offset = 8, width = 2, type = "enum", set = "nope" },"#);
        assert!(matches!(build(&[&doc]), Err(SchemaError::UnknownEnumSet { .. })));

        let doc = with_general_fields(
            100,
            r#"{ name = "l", offset = 8, type = "list", element = "nope", capacity = 1 },"#,
        );
        assert!(matches!(build(&[&doc]), Err(SchemaError::UnknownRecord { .. })));
    }

    #[test]
    fn test_duplicate_registration() {
        assert!(matches!(build(&[BASE, BASE]), Err(SchemaError::Duplicate { .. })));
    }

    #[test]
    fn test_add_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("extra.toml"), BASE).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        let table = SchemaTableBuilder::new().add_dir(dir.path()).unwrap().build().unwrap();
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_builtin_table() {
        let table = SchemaTable::builtin().unwrap();
        assert_eq!(
            table.versions(Board::Stock),
            vec![FirmwareVersion(216), FirmwareVersion(217)]
        );
        assert_eq!(
            table.versions(Board::X7),
            vec![FirmwareVersion(217), FirmwareVersion(218), FirmwareVersion(219)]
        );
        for schema in table.iter() {
            assert_eq!(schema.family, schema.board.family());
        }
    }
}
