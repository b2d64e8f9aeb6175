//! Serde model of a schema description document.
//!
//! One document describes one family/version pair:
//!
//! ```toml
//! family = "avr9x"
//! version = 216
//! boards = ["stock", "m128"]
//! max_models = 16
//!
//! [enums]
//! beeper = ["quiet", "alarms", "nokey", "all"]
//!
//! [general]
//! size = 8
//! fields = [
//!   { name = "contrast", offset = 0, width = 6, type = "unsigned", min = 20, max = 45, default = 25 },
//! ]
//! ```
//!
//! Enum variants take their position in the list as raw value. Element
//! records referenced by list fields live under `[records.<name>]`.

use std::collections::BTreeMap;

use serde::Deserialize;

use super::layout::{Charset, Terminator};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchemaDescription {
    pub family: String,
    pub version: u8,
    pub boards: Vec<String>,
    pub max_models: usize,
    #[serde(default)]
    pub enums: BTreeMap<String, Vec<String>>,
    /// Per board replacements of entries in `enums`.
    #[serde(default)]
    pub board_enums: BTreeMap<String, BTreeMap<String, Vec<String>>>,
    pub general: RecordDescription,
    pub model: RecordDescription,
    #[serde(default)]
    pub records: BTreeMap<String, RecordDescription>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecordDescription {
    /// Size in bytes.
    pub size: usize,
    pub fields: Vec<FieldDescription>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Unsigned,
    Signed,
    Fixed,
    Flag,
    Enum,
    Text,
    List,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldDescription {
    pub name: String,
    pub offset: u32,
    #[serde(rename = "type")]
    pub kind: FieldKind,
    /// Required for numeric and enum fields; flags default to 1.
    pub width: Option<u32>,
    pub min: Option<i64>,
    pub max: Option<i64>,
    pub default: Option<toml::Value>,

    // fixed
    pub scale: Option<f64>,
    #[serde(default)]
    pub signed: bool,

    // enum
    pub set: Option<String>,

    // text and list
    pub capacity: Option<usize>,
    pub charset: Option<Charset>,
    pub terminator: Option<Terminator>,

    // list
    pub element: Option<String>,
    /// Element stride in bits; defaults to the element record size.
    pub stride: Option<u32>,
    pub count_offset: Option<u32>,
    pub count_width: Option<u32>,
}

impl SchemaDescription {
    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }
}
