//! Field and record layouts.

use serde::{Deserialize, Serialize};

use crate::codec::{FieldValue, Record};

/// Inclusive bounds on a stored integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueRange {
    pub min: i64,
    pub max: i64,
}

impl ValueRange {
    pub const fn new(min: i64, max: i64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, v: i64) -> bool {
        v >= self.min && v <= self.max
    }

    pub fn clamp(&self, v: i64) -> i64 {
        v.clamp(self.min, self.max)
    }

    fn intersect(&self, other: &ValueRange) -> ValueRange {
        ValueRange {
            min: self.min.max(other.min),
            max: self.max.min(other.max),
        }
    }
}

/// Character set of a text field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Charset {
    /// Printable ASCII, one byte per character.
    Ascii,
    /// Radio alphabet index, one byte per character.
    Zchar,
}

/// How a text field marks the end of its content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Terminator {
    /// Content ends at the first zero byte, remainder zero filled.
    Null,
    /// Content padded to capacity with the pad character (space).
    Padded,
    /// One length byte followed by `capacity` content bytes.
    Length,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumVariant {
    pub raw: u32,
    pub tag: String,
}

/// A contiguous run of bits inside a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitSpan {
    pub offset: u32,
    pub width: u32,
}

impl BitSpan {
    pub fn end(&self) -> u32 {
        self.offset + self.width
    }
}

/// Repeated fixed-stride sub-records.
#[derive(Debug, Clone, PartialEq)]
pub struct ListLayout {
    /// Where the element count lives; `None` means always `capacity` elements.
    pub count: Option<BitSpan>,
    pub capacity: usize,
    /// Element stride in bits.
    pub stride: u32,
    pub element: RecordLayout,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Encoding {
    Unsigned,
    Signed,
    /// Stored integer times `scale` gives the decoded value.
    Fixed {
        scale: f64,
        signed: bool,
    },
    Flag,
    Enum(Vec<EnumVariant>),
    Text {
        capacity: usize,
        charset: Charset,
        terminator: Terminator,
    },
    List(Box<ListLayout>),
}

impl Encoding {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Encoding::Unsigned => "unsigned",
            Encoding::Signed => "signed",
            Encoding::Fixed { .. } => "fixed",
            Encoding::Flag => "flag",
            Encoding::Enum(_) => "enum",
            Encoding::Text { .. } => "text",
            Encoding::List(_) => "list",
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, Encoding::Unsigned | Encoding::Signed)
    }
}

/// Location, encoding and validity of one field.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldLayout {
    pub name: String,
    /// Bit offset from the start of the enclosing record.
    pub offset: u32,
    /// Bit width. For lists this is `stride * capacity`.
    pub width: u32,
    pub encoding: Encoding,
    /// Allowed stored integer values, if narrower than the width allows.
    pub range: Option<ValueRange>,
    pub default: FieldValue,
}

impl FieldLayout {
    pub fn span(&self) -> BitSpan {
        BitSpan {
            offset: self.offset,
            width: self.width,
        }
    }

    pub fn end(&self) -> u32 {
        self.offset + self.width
    }

    pub fn as_list(&self) -> Option<&ListLayout> {
        match &self.encoding {
            Encoding::List(list) => Some(list),
            _ => None,
        }
    }

    pub fn variants(&self) -> Option<&[EnumVariant]> {
        match &self.encoding {
            Encoding::Enum(v) => Some(v),
            _ => None,
        }
    }

    pub fn variant_by_raw(&self, raw: u32) -> Option<&EnumVariant> {
        self.variants()?.iter().find(|v| v.raw == raw)
    }

    pub fn variant_by_tag(&self, tag: &str) -> Option<&EnumVariant> {
        self.variants()?.iter().find(|v| v.tag == tag)
    }

    /// Stored integer bounds for numeric encodings: the declared range
    /// intersected with what the bit width can hold.
    pub fn stored_bounds(&self) -> Option<ValueRange> {
        let w = self.width.min(63);
        let by_width = match &self.encoding {
            Encoding::Unsigned | Encoding::Fixed { signed: false, .. } => {
                ValueRange::new(0, (1i64 << w) - 1)
            }
            Encoding::Signed | Encoding::Fixed { signed: true, .. } => {
                ValueRange::new(-(1i64 << (w - 1)), (1i64 << (w - 1)) - 1)
            }
            _ => return None,
        };
        Some(match &self.range {
            Some(r) => by_width.intersect(r),
            None => by_width,
        })
    }
}

/// Ordered fields of one record (general settings, a model, a list element).
#[derive(Debug, Clone, PartialEq)]
pub struct RecordLayout {
    pub name: String,
    /// Size in bytes.
    pub size: usize,
    pub fields: Vec<FieldLayout>,
}

impl RecordLayout {
    pub fn field(&self, name: &str) -> Option<&FieldLayout> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn bits(&self) -> u32 {
        (self.size * 8) as u32
    }

    /// Record with every field at its declared default.
    pub fn default_record(&self) -> Record {
        let mut record = Record::new();
        for field in &self.fields {
            record.push(field.name.clone(), field.default.clone());
        }
        record
    }

    /// Number of leaf fields, counting list elements at full capacity.
    pub fn leaf_count(&self) -> usize {
        self.fields
            .iter()
            .map(|f| match &f.encoding {
                Encoding::List(list) => list.capacity * list.element.leaf_count(),
                _ => 1,
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numeric(encoding: Encoding, width: u32, range: Option<ValueRange>) -> FieldLayout {
        FieldLayout {
            name: "n".into(),
            offset: 0,
            width,
            encoding,
            range,
            default: FieldValue::Int(0),
        }
    }

    #[test]
    fn test_stored_bounds() {
        let u = numeric(Encoding::Unsigned, 6, Some(ValueRange::new(20, 45)));
        assert_eq!(u.stored_bounds(), Some(ValueRange::new(20, 45)));

        let s = numeric(Encoding::Signed, 5, None);
        assert_eq!(s.stored_bounds(), Some(ValueRange::new(-16, 15)));

        let wide = numeric(Encoding::Signed, 8, Some(ValueRange::new(-500, 500)));
        assert_eq!(wide.stored_bounds(), Some(ValueRange::new(-128, 127)));

        let flag = numeric(Encoding::Flag, 1, None);
        assert_eq!(flag.stored_bounds(), None);
    }
}
