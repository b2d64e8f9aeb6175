//! Binary field codec.
//!
//! Translates between packed EEPROM bytes and typed [`FieldValue`]s using a
//! [`FieldLayout`]. Everything here is a pure function over the supplied
//! buffer.

pub mod bits;
pub mod image;
pub mod text;

use std::fmt;

use thiserror::Error;

use crate::schema::{Encoding, FieldLayout, RecordLayout};
use bits::{read_bits, sign_extend, to_twos_complement, write_bits};

pub use image::{
    FieldFault, IMAGE_HEADER_LEN, ImageHeader, decode_settings, decode_settings_strict,
    encode_settings,
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    #[error("buffer too small: need {needed_bits} bits, have {available_bits}")]
    TruncatedBuffer {
        needed_bits: usize,
        available_bits: usize,
    },
    #[error("field '{field}': stored value {value} outside {min}..={max}")]
    OutOfRange {
        field: String,
        value: i64,
        min: i64,
        max: i64,
    },
    #[error("list '{field}': count {count} exceeds capacity {capacity}")]
    CountOutOfRange {
        field: String,
        count: usize,
        capacity: usize,
    },
    #[error("field '{field}': invalid encoding: {reason}")]
    InvalidEncoding { field: String, reason: String },
    #[error("field '{field}': value {value} cannot be stored: {reason}")]
    ValueOutOfRange {
        field: String,
        value: String,
        reason: String,
    },
    #[error("field '{field}': expected {expected} value, got {found}")]
    TypeMismatch {
        field: String,
        expected: &'static str,
        found: &'static str,
    },
}

impl CodecError {
    /// Attach the field name to errors raised by the bit primitives.
    fn for_field(self, name: &str) -> Self {
        match self {
            CodecError::ValueOutOfRange { field, value, reason } if field.is_empty() => {
                CodecError::ValueOutOfRange {
                    field: name.to_string(),
                    value,
                    reason,
                }
            }
            other => other,
        }
    }

    /// Whether the error concerns one field's content rather than the
    /// structure of the buffer.
    pub fn is_field_level(&self) -> bool {
        matches!(
            self,
            CodecError::OutOfRange { .. } | CodecError::InvalidEncoding { .. }
        )
    }
}

/// A decoded field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Unsigned or signed integer.
    Int(i64),
    /// Fixed-point value, scale already applied.
    Fixed(f64),
    Bool(bool),
    /// Enum tag from the declared set.
    Enum(String),
    /// Enum bit pattern outside the declared set.
    Unknown(u32),
    Text(String),
    List(Vec<Record>),
}

impl FieldValue {
    pub fn kind_name(&self) -> &'static str {
        match self {
            FieldValue::Int(_) => "integer",
            FieldValue::Fixed(_) => "fixed",
            FieldValue::Bool(_) => "flag",
            FieldValue::Enum(_) => "enum",
            FieldValue::Unknown(_) => "unknown enum",
            FieldValue::Text(_) => "text",
            FieldValue::List(_) => "list",
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            FieldValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Enum(s) | FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Record]> {
        match self {
            FieldValue::List(items) => Some(items),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Int(v) => write!(f, "{v}"),
            FieldValue::Fixed(v) => write!(f, "{v}"),
            FieldValue::Bool(v) => write!(f, "{v}"),
            FieldValue::Enum(tag) => f.write_str(tag),
            FieldValue::Unknown(raw) => write!(f, "unknown(0x{raw:X})"),
            FieldValue::Text(s) => write!(f, "\"{s}\""),
            FieldValue::List(items) => write!(f, "[{} entries]", items.len()),
        }
    }
}

/// Ordered named values of one record.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record {
    fields: Vec<(String, FieldValue)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut FieldValue> {
        self.fields
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// Replace an existing value or append a new one.
    pub fn set(&mut self, name: &str, value: FieldValue) {
        match self.get_mut(name) {
            Some(slot) => *slot = value,
            None => self.fields.push((name.to_string(), value)),
        }
    }

    pub fn push(&mut self, name: String, value: FieldValue) {
        self.fields.push((name, value));
    }

    pub fn remove(&mut self, name: &str) -> Option<FieldValue> {
        let pos = self.fields.iter().position(|(n, _)| n == name)?;
        Some(self.fields.remove(pos).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Decode one non-list field at `base + layout.offset`.
pub fn decode_field(buf: &[u8], base: usize, layout: &FieldLayout) -> Result<FieldValue, CodecError> {
    let offset = base + layout.offset as usize;
    match &layout.encoding {
        Encoding::Unsigned => {
            let v = read_bits(buf, offset, layout.width)? as i64;
            check_stored(layout, v)?;
            Ok(FieldValue::Int(v))
        }
        Encoding::Signed => {
            let v = sign_extend(read_bits(buf, offset, layout.width)?, layout.width);
            check_stored(layout, v)?;
            Ok(FieldValue::Int(v))
        }
        Encoding::Fixed { scale, signed } => {
            let raw = read_bits(buf, offset, layout.width)?;
            let v = if *signed {
                sign_extend(raw, layout.width)
            } else {
                raw as i64
            };
            check_stored(layout, v)?;
            Ok(FieldValue::Fixed(v as f64 * scale))
        }
        Encoding::Flag => Ok(FieldValue::Bool(read_bits(buf, offset, layout.width)? != 0)),
        Encoding::Enum(_) => {
            let raw = read_bits(buf, offset, layout.width)? as u32;
            Ok(match layout.variant_by_raw(raw) {
                Some(variant) => FieldValue::Enum(variant.tag.clone()),
                None => FieldValue::Unknown(raw),
            })
        }
        Encoding::Text {
            capacity,
            charset,
            terminator,
        } => text::decode_text(buf, offset, *capacity, *charset, *terminator)
            .map(FieldValue::Text)
            .map_err(|reason| CodecError::InvalidEncoding {
                field: layout.name.clone(),
                reason,
            }),
        Encoding::List(_) => Err(CodecError::TypeMismatch {
            field: layout.name.clone(),
            expected: "scalar",
            found: "list",
        }),
    }
}

/// Encode one non-list field at `base + layout.offset`, leaving every other
/// bit of `buf` untouched.
pub fn encode_field(
    value: &FieldValue,
    layout: &FieldLayout,
    buf: &mut [u8],
    base: usize,
) -> Result<(), CodecError> {
    let offset = base + layout.offset as usize;
    let mismatch = |expected: &'static str| CodecError::TypeMismatch {
        field: layout.name.clone(),
        expected,
        found: value.kind_name(),
    };

    match (&layout.encoding, value) {
        (Encoding::Unsigned, FieldValue::Int(v)) | (Encoding::Signed, FieldValue::Int(v)) => {
            check_value(layout, *v)?;
            write_bits(buf, offset, layout.width, to_twos_complement(*v, layout.width))
        }
        (Encoding::Fixed { .. }, FieldValue::Fixed(v)) if !v.is_finite() => Err(CodecError::ValueOutOfRange {
            field: layout.name.clone(),
            value: v.to_string(),
            reason: "not a finite number".into(),
        }),
        (Encoding::Fixed { scale, .. }, FieldValue::Fixed(v)) => {
            let stored = fixed_to_stored(*v, *scale);
            check_value(layout, stored)?;
            write_bits(buf, offset, layout.width, to_twos_complement(stored, layout.width))
        }
        (Encoding::Flag, FieldValue::Bool(b)) => {
            write_bits(buf, offset, layout.width, u64::from(*b))
        }
        (Encoding::Enum(_), FieldValue::Enum(tag)) => {
            let variant = layout
                .variant_by_tag(tag)
                .ok_or_else(|| CodecError::ValueOutOfRange {
                    field: layout.name.clone(),
                    value: tag.clone(),
                    reason: "not a declared variant".into(),
                })?;
            write_bits(buf, offset, layout.width, variant.raw as u64)
        }
        (Encoding::Enum(_), FieldValue::Unknown(raw)) => {
            write_bits(buf, offset, layout.width, *raw as u64)
        }
        (
            Encoding::Text {
                capacity,
                charset,
                terminator,
            },
            FieldValue::Text(s),
        ) => text::encode_text(s, buf, offset, *capacity, *charset, *terminator)
            .map_err(|reason| CodecError::ValueOutOfRange {
                field: layout.name.clone(),
                value: format!("\"{s}\""),
                reason,
            }),
        (Encoding::Unsigned | Encoding::Signed, _) => Err(mismatch("integer")),
        (Encoding::Fixed { .. }, _) => Err(mismatch("fixed")),
        (Encoding::Flag, _) => Err(mismatch("flag")),
        (Encoding::Enum(_), _) => Err(mismatch("enum")),
        (Encoding::Text { .. }, _) => Err(mismatch("text")),
        (Encoding::List(_), _) => Err(mismatch("scalar")),
    }
    .map_err(|e| e.for_field(&layout.name))
}

/// Stored integer for a fixed-point value.
pub fn fixed_to_stored(value: f64, scale: f64) -> i64 {
    (value / scale).round() as i64
}

fn check_stored(layout: &FieldLayout, v: i64) -> Result<(), CodecError> {
    if let Some(range) = layout.range
        && !range.contains(v)
    {
        return Err(CodecError::OutOfRange {
            field: layout.name.clone(),
            value: v,
            min: range.min,
            max: range.max,
        });
    }
    Ok(())
}

fn check_value(layout: &FieldLayout, v: i64) -> Result<(), CodecError> {
    if let Some(bounds) = layout.stored_bounds()
        && !bounds.contains(v)
    {
        return Err(CodecError::ValueOutOfRange {
            field: layout.name.clone(),
            value: v.to_string(),
            reason: format!("outside {}..={}", bounds.min, bounds.max),
        });
    }
    Ok(())
}

/// Decode a record starting at bit `base`.
///
/// Field-level problems (out of range values, undecodable text) are pushed
/// to `faults` and the field takes its default. Structural problems (short
/// buffer, list count above capacity) abort the decode.
pub fn decode_record(
    buf: &[u8],
    base: usize,
    layout: &RecordLayout,
    path: &str,
    faults: &mut Vec<FieldFault>,
) -> Result<Record, CodecError> {
    let mut record = Record::new();
    for field in &layout.fields {
        let field_path = join_path(path, &field.name);
        let value = match &field.encoding {
            Encoding::List(list) => {
                let count = match list.count {
                    Some(span) => read_bits(buf, base + span.offset as usize, span.width)? as usize,
                    None => list.capacity,
                };
                if count > list.capacity {
                    return Err(CodecError::CountOutOfRange {
                        field: field_path,
                        count,
                        capacity: list.capacity,
                    });
                }
                let mut items = Vec::with_capacity(count);
                for i in 0..count {
                    let start = base + field.offset as usize + i * list.stride as usize;
                    let item_path = format!("{field_path}[{i}]");
                    items.push(decode_record(buf, start, &list.element, &item_path, faults)?);
                }
                FieldValue::List(items)
            }
            _ => match decode_field(buf, base, field) {
                Ok(v) => v,
                Err(e) if e.is_field_level() => {
                    faults.push(FieldFault {
                        path: field_path,
                        error: e,
                        replacement: field.default.clone(),
                    });
                    field.default.clone()
                }
                Err(e) => return Err(e),
            },
        };
        record.push(field.name.clone(), value);
    }
    Ok(record)
}

/// Encode a record at bit `base`. Fields missing from `record` are written
/// with their defaults; names not in the layout are ignored.
pub fn encode_record(
    record: &Record,
    layout: &RecordLayout,
    buf: &mut [u8],
    base: usize,
) -> Result<(), CodecError> {
    for field in &layout.fields {
        let value = record.get(&field.name).unwrap_or(&field.default);
        match (&field.encoding, value) {
            (Encoding::List(list), FieldValue::List(items)) => {
                if items.len() > list.capacity {
                    return Err(CodecError::CountOutOfRange {
                        field: field.name.clone(),
                        count: items.len(),
                        capacity: list.capacity,
                    });
                }
                match list.count {
                    Some(span) => {
                        write_bits(buf, base + span.offset as usize, span.width, items.len() as u64)
                            .map_err(|e| e.for_field(&field.name))?;
                    }
                    None if items.len() != list.capacity => {
                        return Err(CodecError::ValueOutOfRange {
                            field: field.name.clone(),
                            value: format!("{} entries", items.len()),
                            reason: format!("fixed list holds exactly {}", list.capacity),
                        });
                    }
                    None => {}
                }
                for (i, item) in items.iter().enumerate() {
                    let start = base + field.offset as usize + i * list.stride as usize;
                    encode_record(item, &list.element, buf, start)?;
                }
            }
            (Encoding::List(_), other) => {
                return Err(CodecError::TypeMismatch {
                    field: field.name.clone(),
                    expected: "list",
                    found: other.kind_name(),
                });
            }
            _ => encode_field(value, field, buf, base)?,
        }
    }
    Ok(())
}

pub(crate) fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}.{name}")
    }
}
