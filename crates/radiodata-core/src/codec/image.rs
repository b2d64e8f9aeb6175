//! Whole image encode/decode.
//!
//! Image layout: a 3 byte header (schema version, board id little-endian),
//! the general settings block, then `max_models` fixed size model slots. An
//! erased slot (all `0xFF`) is an empty model.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use super::{CodecError, FieldValue, decode_record, encode_record};
use crate::board::{Board, FirmwareVersion};
use crate::schema::SchemaVersion;
use crate::settings::CanonicalSettings;

pub const IMAGE_HEADER_LEN: usize = 3;

const ERASED: u8 = 0xFF;

/// Header at the start of every image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageHeader {
    pub version: FirmwareVersion,
    /// Raw board id; may name a board this build does not know.
    pub board_id: u16,
}

impl ImageHeader {
    pub fn new(board: Board, version: FirmwareVersion) -> Self {
        Self {
            version,
            board_id: board.id(),
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self, CodecError> {
        if data.len() < IMAGE_HEADER_LEN {
            return Err(CodecError::TruncatedBuffer {
                needed_bits: IMAGE_HEADER_LEN * 8,
                available_bits: data.len() * 8,
            });
        }
        let mut cursor = Cursor::new(data);
        let version = cursor.read_u8().map_err(truncated)?;
        let board_id = cursor.read_u16::<LittleEndian>().map_err(truncated)?;
        Ok(Self {
            version: FirmwareVersion(version),
            board_id,
        })
    }

    pub fn board(&self) -> Option<Board> {
        Board::from_id(self.board_id)
    }

    pub fn to_bytes(&self) -> [u8; IMAGE_HEADER_LEN] {
        let mut out = Vec::with_capacity(IMAGE_HEADER_LEN);
        // Writes into a Vec cannot fail.
        let _ = out.write_u8(self.version.get());
        let _ = out.write_u16::<LittleEndian>(self.board_id);
        [out[0], out[1], out[2]]
    }
}

fn truncated(_: std::io::Error) -> CodecError {
    CodecError::TruncatedBuffer {
        needed_bits: IMAGE_HEADER_LEN * 8,
        available_bits: 0,
    }
}

/// A field whose stored bits could not be decoded. The field took
/// `replacement` (its default) instead.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldFault {
    pub path: String,
    pub error: CodecError,
    pub replacement: FieldValue,
}

fn model_offset(schema: &SchemaVersion, slot: usize) -> usize {
    IMAGE_HEADER_LEN + schema.general.size + slot * schema.model.size
}

/// Decode a full image laid out by `schema`. Field faults are appended to
/// `faults`; the header is not checked against the schema here.
pub fn decode_settings(
    bytes: &[u8],
    schema: &SchemaVersion,
    faults: &mut Vec<FieldFault>,
) -> Result<CanonicalSettings, CodecError> {
    let needed = schema.image_size();
    if bytes.len() < needed {
        return Err(CodecError::TruncatedBuffer {
            needed_bits: needed * 8,
            available_bits: bytes.len() * 8,
        });
    }

    let general = decode_record(
        &bytes[IMAGE_HEADER_LEN..IMAGE_HEADER_LEN + schema.general.size],
        0,
        &schema.general,
        "general",
        faults,
    )?;

    let mut models = Vec::with_capacity(schema.max_models);
    for slot in 0..schema.max_models {
        let start = model_offset(schema, slot);
        let data = &bytes[start..start + schema.model.size];
        if data.iter().all(|&b| b == ERASED) {
            models.push(None);
            continue;
        }
        let path = format!("models[{slot}]");
        models.push(Some(decode_record(data, 0, &schema.model, &path, faults)?));
    }

    Ok(CanonicalSettings {
        board: schema.board,
        version: schema.version,
        general,
        models,
    })
}

/// Decode and fail on the first field fault.
pub fn decode_settings_strict(
    bytes: &[u8],
    schema: &SchemaVersion,
) -> Result<CanonicalSettings, CodecError> {
    let mut faults = Vec::new();
    let settings = decode_settings(bytes, schema, &mut faults)?;
    match faults.into_iter().next() {
        Some(fault) => Err(fault.error),
        None => Ok(settings),
    }
}

/// Encode `settings` with `schema`'s layout, header included.
pub fn encode_settings(
    settings: &CanonicalSettings,
    schema: &SchemaVersion,
) -> Result<Vec<u8>, CodecError> {
    if let Some(extra) = settings
        .models
        .iter()
        .skip(schema.max_models)
        .position(Option::is_some)
    {
        return Err(CodecError::CountOutOfRange {
            field: "models".into(),
            count: schema.max_models + extra + 1,
            capacity: schema.max_models,
        });
    }

    let mut out = vec![0u8; schema.image_size()];
    out[..IMAGE_HEADER_LEN]
        .copy_from_slice(&ImageHeader::new(schema.board, schema.version).to_bytes());

    encode_record(
        &settings.general,
        &schema.general,
        &mut out[IMAGE_HEADER_LEN..IMAGE_HEADER_LEN + schema.general.size],
        0,
    )?;

    for slot in 0..schema.max_models {
        let start = model_offset(schema, slot);
        let data = &mut out[start..start + schema.model.size];
        match settings.models.get(slot).and_then(Option::as_ref) {
            Some(model) => encode_record(model, &schema.model, data, 0)?,
            None => data.fill(ERASED),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Record;
    use crate::schema::SchemaTable;

    fn table() -> SchemaTable {
        SchemaTable::builtin().unwrap()
    }

    #[test]
    fn test_header_bytes() {
        let header = ImageHeader::new(Board::X9DPlus, FirmwareVersion(218));
        assert_eq!(header.to_bytes(), [218, 0x02, 0x01]);
        assert_eq!(ImageHeader::parse(&header.to_bytes()).unwrap(), header);
        assert_eq!(header.board(), Some(Board::X9DPlus));
        assert!(ImageHeader::parse(&[218, 0x02]).is_err());
    }

    #[test]
    fn test_default_image_roundtrip() {
        let table = table();
        let schema = table.resolve(Board::Stock, FirmwareVersion(216)).unwrap();
        let defaults = schema.default_settings();

        let bytes = encode_settings(&defaults, schema).unwrap();
        assert_eq!(bytes.len(), schema.image_size());
        // every slot empty
        assert!(bytes[model_offset(schema, 0)..].iter().all(|&b| b == 0xFF));

        let decoded = decode_settings_strict(&bytes, schema).unwrap();
        assert_eq!(decoded, defaults);
    }

    #[test]
    fn test_used_slot_roundtrip() {
        let table = table();
        let schema = table.resolve(Board::X9D, FirmwareVersion(219)).unwrap();
        let mut settings = schema.default_settings();
        let mut model = schema.model.default_record();
        model.set("name", FieldValue::Text("Sailplane".into()));
        settings.models[4] = Some(model);

        let bytes = encode_settings(&settings, schema).unwrap();
        let decoded = decode_settings_strict(&bytes, schema).unwrap();
        assert_eq!(decoded.models[4], settings.models[4]);
        assert_eq!(decoded.used_models().count(), 1);

        let again = encode_settings(&decoded, schema).unwrap();
        assert_eq!(again, bytes);
    }

    #[test]
    fn test_too_many_models() {
        let table = table();
        let schema = table.resolve(Board::Stock, FirmwareVersion(216)).unwrap();
        let mut settings = schema.default_settings();
        settings.models.push(Some(Record::new()));
        settings.models.push(None);
        assert!(matches!(
            encode_settings(&settings, schema),
            Err(CodecError::CountOutOfRange { count: 17, .. })
        ));
    }

    #[test]
    fn test_short_image() {
        let table = table();
        let schema = table.resolve(Board::Stock, FirmwareVersion(216)).unwrap();
        let bytes = vec![0u8; schema.image_size() - 1];
        let mut faults = Vec::new();
        assert!(matches!(
            decode_settings(&bytes, schema, &mut faults),
            Err(CodecError::TruncatedBuffer { .. })
        ));
    }
}
