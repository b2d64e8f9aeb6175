//! Text serialization: one TOML document per image.
//!
//! ```toml
//! [header]
//! board = "x9d"
//! version = 218
//!
//! [radio]
//! contrast = 25
//!
//! [models.3]
//! name = "Glider"
//!
//! [labels]
//! Gliders = [3]
//! ```
//!
//! Fields are mapped by name, so the document does not depend on the bit
//! layout. Missing fields take their defaults. The helpers here are shared
//! with the directory adapter.

use std::path::Path;

use toml::{Table, Value};

use super::{AdapterContext, ContainerError, ContainerKind, ImageMetadata, RawImage};
use crate::board::{Board, FirmwareVersion};
use crate::codec::{FieldValue, Record, decode_settings_strict, encode_field, encode_settings};
use crate::schema::{Encoding, FieldLayout, RecordLayout, SchemaVersion};
use crate::settings::CanonicalSettings;

pub fn read(path: &Path, ctx: &AdapterContext<'_>) -> Result<RawImage, ContainerError> {
    let document = path.display().to_string();
    let doc = parse_document(path)?;

    let schema = schema_from_header(&doc, &document, ctx)?;
    let mut settings = schema.default_settings();
    if let Some(radio) = doc.get("radio") {
        let radio = expect_table(radio, &document, "radio")?;
        settings.general = table_to_record(radio, &schema.general, &document, "radio")?;
    }
    if let Some(models) = doc.get("models") {
        let models = expect_table(models, &document, "models")?;
        for (key, value) in models {
            let field = format!("models.{key}");
            let slot = parse_slot(key, schema, &document, &field)?;
            let table = expect_table(value, &document, &field)?;
            settings.set_model(slot, Some(table_to_record(table, &schema.model, &document, &field)?));
        }
    }
    let metadata = match doc.get("labels") {
        Some(labels) => labels_from_table(expect_table(labels, &document, "labels")?, &document)?,
        None => ImageMetadata::default(),
    };

    image_from_settings(ContainerKind::Text, &settings, schema, metadata)
}

pub fn write(image: &RawImage, path: &Path, ctx: &AdapterContext<'_>) -> Result<(), ContainerError> {
    let (settings, schema) = settings_for_image(image, ctx)?;

    let mut doc = header_table(image.board(), image.version());
    doc.insert("radio".into(), Value::Table(record_to_table(&settings.general, &schema.general)));
    let mut models = Table::new();
    for (slot, model) in settings.used_models() {
        models.insert(slot.to_string(), Value::Table(record_to_table(model, &schema.model)));
    }
    if !models.is_empty() {
        doc.insert("models".into(), Value::Table(models));
    }
    if !image.metadata().is_empty() {
        doc.insert("labels".into(), Value::Table(labels_to_table(image.metadata())));
    }

    write_document(path, &doc)
}

pub(crate) fn parse_document(path: &Path) -> Result<Table, ContainerError> {
    let data = super::read_limited(path)?;
    let text = String::from_utf8(data).map_err(|e| ContainerError::InvalidEncoding {
        offset: e.utf8_error().valid_up_to(),
        reason: "not valid UTF-8".into(),
    })?;
    text.parse::<Table>().map_err(|e| ContainerError::Parse {
        document: path.display().to_string(),
        field: String::new(),
        message: e.message().to_string(),
    })
}

pub(crate) fn write_document(path: &Path, doc: &Table) -> Result<(), ContainerError> {
    let text = toml::to_string_pretty(doc).map_err(|e| ContainerError::InvalidContainer {
        reason: format!("cannot serialize {}: {e}", path.display()),
    })?;
    std::fs::write(path, text).map_err(|e| ContainerError::io(path, e))
}

fn parse_error(document: &str, field: &str, message: impl Into<String>) -> ContainerError {
    ContainerError::Parse {
        document: document.to_string(),
        field: field.to_string(),
        message: message.into(),
    }
}

pub(crate) fn expect_table<'v>(value: &'v Value, document: &str, field: &str) -> Result<&'v Table, ContainerError> {
    value
        .as_table()
        .ok_or_else(|| parse_error(document, field, format!("expected a table, got {}", value.type_str())))
}

pub(crate) fn header_table(board: Board, version: FirmwareVersion) -> Table {
    let mut header = Table::new();
    header.insert("board".into(), Value::String(board.name().to_string()));
    header.insert("version".into(), Value::Integer(version.get() as i64));
    let mut doc = Table::new();
    doc.insert("header".into(), Value::Table(header));
    doc
}

/// Schema named by a document's `[header]`. The version must be registered
/// exactly: a text document is laid out by name, not by an older layout.
pub(crate) fn schema_from_header<'a>(
    doc: &Table,
    document: &str,
    ctx: &AdapterContext<'a>,
) -> Result<&'a SchemaVersion, ContainerError> {
    let header = doc
        .get("header")
        .ok_or_else(|| parse_error(document, "header", "missing [header] table"))?;
    let header = expect_table(header, document, "header")?;

    let board = header
        .get("board")
        .and_then(Value::as_str)
        .ok_or_else(|| parse_error(document, "header.board", "expected a board name"))?
        .parse::<Board>()
        .map_err(|e| parse_error(document, "header.board", e))?;
    let version = header
        .get("version")
        .and_then(Value::as_integer)
        .and_then(|v| u8::try_from(v).ok())
        .map(FirmwareVersion)
        .ok_or_else(|| parse_error(document, "header.version", "expected a version number 0..=255"))?;

    let schema = ctx.schemas.resolve(board, version)?;
    if schema.version != version {
        return Err(parse_error(
            document,
            "header.version",
            format!("no schema registered for {board} version {version}"),
        ));
    }
    Ok(schema)
}

pub(crate) fn parse_slot(key: &str, schema: &SchemaVersion, document: &str, field: &str) -> Result<usize, ContainerError> {
    let slot: usize = key
        .parse()
        .map_err(|_| parse_error(document, field, "model key must be a slot number"))?;
    if slot >= schema.max_models {
        return Err(parse_error(
            document,
            field,
            format!("slot {slot} beyond the {} model slots", schema.max_models),
        ));
    }
    Ok(slot)
}

/// Decode an image for serialization. A field that does not decode fails
/// the export instead of being written as its default.
pub(crate) fn settings_for_image<'a>(
    image: &RawImage,
    ctx: &AdapterContext<'a>,
) -> Result<(CanonicalSettings, &'a SchemaVersion), ContainerError> {
    let schema = super::schema_for(ctx, image)?;
    super::check_image_size(schema, image.len())?;
    let settings = decode_settings_strict(image.payload(), schema)?;
    Ok((settings, schema))
}

pub(crate) fn image_from_settings(
    kind: ContainerKind,
    settings: &CanonicalSettings,
    schema: &SchemaVersion,
    metadata: ImageMetadata,
) -> Result<RawImage, ContainerError> {
    let payload = encode_settings(settings, schema)?;
    RawImage::from_payload(kind, payload, metadata)
}

pub(crate) fn labels_to_table(metadata: &ImageMetadata) -> Table {
    metadata
        .labels
        .iter()
        .map(|(name, slots)| {
            let slots = slots.iter().map(|s| Value::Integer(*s as i64)).collect();
            (name.clone(), Value::Array(slots))
        })
        .collect()
}

pub(crate) fn labels_from_table(table: &Table, document: &str) -> Result<ImageMetadata, ContainerError> {
    let mut metadata = ImageMetadata::default();
    for (name, value) in table {
        let field = format!("labels.{name}");
        let slots = value
            .as_array()
            .ok_or_else(|| parse_error(document, &field, "expected a list of slots"))?
            .iter()
            .map(|v| {
                v.as_integer()
                    .and_then(|i| usize::try_from(i).ok())
                    .ok_or_else(|| parse_error(document, &field, "slot must be a non-negative integer"))
            })
            .collect::<Result<Vec<_>, _>>()?;
        metadata.labels.insert(name.clone(), slots);
    }
    Ok(metadata)
}

/// Field-name keyed table for a record.
pub(crate) fn record_to_table(record: &Record, layout: &RecordLayout) -> Table {
    let mut table = Table::new();
    for (name, value) in record.iter() {
        let element = layout
            .field(name)
            .and_then(FieldLayout::as_list)
            .map(|list| &list.element);
        table.insert(name.to_string(), value_to_toml(value, element));
    }
    table
}

fn value_to_toml(value: &FieldValue, element: Option<&RecordLayout>) -> Value {
    match value {
        FieldValue::Int(v) => Value::Integer(*v),
        FieldValue::Fixed(v) => Value::Float(*v),
        FieldValue::Bool(b) => Value::Boolean(*b),
        FieldValue::Enum(tag) => Value::String(tag.clone()),
        FieldValue::Unknown(raw) => Value::Integer(*raw as i64),
        FieldValue::Text(s) => Value::String(s.clone()),
        FieldValue::List(items) => Value::Array(
            items
                .iter()
                .map(|item| match element {
                    Some(layout) => Value::Table(record_to_table(item, layout)),
                    None => Value::Table(Table::new()),
                })
                .collect(),
        ),
    }
}

/// Record from a field-name keyed table. Missing fields take defaults,
/// unknown names are ignored.
pub(crate) fn table_to_record(
    table: &Table,
    layout: &RecordLayout,
    document: &str,
    path: &str,
) -> Result<Record, ContainerError> {
    for key in table.keys() {
        if layout.field(key).is_none() {
            tracing::warn!(document = %document, field = %format!("{path}.{key}"), "Ignoring unknown field");
        }
    }

    let mut record = Record::new();
    for field in &layout.fields {
        let field_path = format!("{path}.{}", field.name);
        let value = match table.get(&field.name) {
            Some(value) => toml_to_value(value, field, document, &field_path)?,
            None => field.default.clone(),
        };
        record.push(field.name.clone(), value);
    }
    Ok(record)
}

fn toml_to_value(value: &Value, field: &FieldLayout, document: &str, path: &str) -> Result<FieldValue, ContainerError> {
    let mismatch = || {
        parse_error(
            document,
            path,
            format!("expected {}, got {}", field.encoding.kind_name(), value.type_str()),
        )
    };

    let scalar = match (&field.encoding, value) {
        (Encoding::Unsigned | Encoding::Signed, Value::Integer(v)) => FieldValue::Int(*v),
        (Encoding::Fixed { .. }, Value::Float(v)) if !v.is_finite() => {
            return Err(parse_error(document, path, format!("{v} is not a finite number")));
        }
        (Encoding::Fixed { .. }, Value::Float(v)) => FieldValue::Fixed(*v),
        (Encoding::Fixed { .. }, Value::Integer(v)) => FieldValue::Fixed(*v as f64),
        (Encoding::Flag, Value::Boolean(b)) => FieldValue::Bool(*b),
        (Encoding::Enum(_), Value::String(tag)) => match field.variant_by_tag(tag) {
            Some(_) => FieldValue::Enum(tag.clone()),
            None => return Err(parse_error(document, path, format!("'{tag}' is not a valid {}", field.name))),
        },
        (Encoding::Enum(_), Value::Integer(raw)) => {
            let raw = u32::try_from(*raw).map_err(|_| parse_error(document, path, "raw enum value must be positive"))?;
            match field.variant_by_raw(raw) {
                Some(variant) => FieldValue::Enum(variant.tag.clone()),
                None => FieldValue::Unknown(raw),
            }
        }
        (Encoding::Text { .. }, Value::String(s)) => FieldValue::Text(s.clone()),
        (Encoding::List(list), Value::Array(items)) => {
            if items.len() > list.capacity {
                return Err(parse_error(
                    document,
                    path,
                    format!("{} entries, capacity is {}", items.len(), list.capacity),
                ));
            }
            let mut records = Vec::with_capacity(list.capacity);
            for (i, item) in items.iter().enumerate() {
                let item_path = format!("{path}[{i}]");
                let table = expect_table(item, document, &item_path)?;
                records.push(table_to_record(table, &list.element, document, &item_path)?);
            }
            if list.count.is_none() {
                records.resize(list.capacity, list.element.default_record());
            }
            return Ok(FieldValue::List(records));
        }
        _ => return Err(mismatch()),
    };

    // the value must fit the field's bits, not only its type
    let mut scratch = vec![0u8; (field.end() as usize).div_ceil(8)];
    encode_field(&scalar, field, &mut scratch, 0).map_err(|e| parse_error(document, path, e.to_string()))?;
    Ok(scalar)
}
