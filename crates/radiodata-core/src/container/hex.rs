//! Hex encoded images.
//!
//! Two framings are accepted on read and can be produced on write:
//!
//! - plain: hex digit pairs, whitespace and line breaks ignored
//! - Intel HEX: `:LLAAAATT<data>CC` records, data records contiguous from
//!   address 0, terminated by an end-of-file record

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{AdapterContext, ContainerError, ContainerKind, ImageMetadata, RawImage};

const PLAIN_BYTES_PER_LINE: usize = 32;
const RECORD_BYTES: usize = 16;

const RECORD_DATA: u8 = 0x00;
const RECORD_EOF: u8 = 0x01;

/// Line framing used when writing hex files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HexFraming {
    #[default]
    Plain,
    IntelHex,
}

impl fmt::Display for HexFraming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HexFraming::Plain => write!(f, "plain"),
            HexFraming::IntelHex => write!(f, "intel-hex"),
        }
    }
}

pub fn read(path: &Path, ctx: &AdapterContext<'_>) -> Result<RawImage, ContainerError> {
    let data = super::read_limited(path)?;
    let text = String::from_utf8(data).map_err(|e| ContainerError::InvalidEncoding {
        offset: e.utf8_error().valid_up_to(),
        reason: "not valid text".into(),
    })?;

    let payload = decode(&text)?;
    let image = RawImage::from_payload(ContainerKind::Hex, payload, ImageMetadata::default())?;
    let schema = super::schema_for(ctx, &image)?;
    super::check_image_size(schema, image.len())?;
    Ok(image)
}

pub fn write(image: &RawImage, path: &Path, ctx: &AdapterContext<'_>) -> Result<(), ContainerError> {
    let text = match ctx.hex_framing {
        HexFraming::Plain => encode_plain(image.payload()),
        HexFraming::IntelHex => encode_intel(image.payload())?,
    };
    std::fs::write(path, text).map_err(|e| ContainerError::io(path, e))
}

/// Decode either framing. Nothing is produced unless the whole text is valid.
pub fn decode(text: &str) -> Result<Vec<u8>, ContainerError> {
    if text.trim_start().starts_with(':') {
        decode_intel(text)
    } else {
        decode_plain(text)
    }
}

fn decode_plain(text: &str) -> Result<Vec<u8>, ContainerError> {
    if let Some((offset, c)) = text
        .char_indices()
        .find(|(_, c)| !c.is_ascii_whitespace() && !c.is_ascii_hexdigit())
    {
        return Err(ContainerError::InvalidEncoding {
            offset,
            reason: format!("{c:?} is not a hex digit"),
        });
    }
    let digits: String = text.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    if digits.len() % 2 != 0 {
        return Err(ContainerError::InvalidEncoding {
            offset: text.len(),
            reason: format!("odd number of hex digits ({})", digits.len()),
        });
    }
    hex::decode(&digits).map_err(|e| ContainerError::InvalidEncoding {
        offset: 0,
        reason: e.to_string(),
    })
}

fn decode_intel(text: &str) -> Result<Vec<u8>, ContainerError> {
    let mut out = Vec::new();
    let mut offset = 0;
    let mut finished = false;

    for line in text.split_inclusive('\n') {
        let line_offset = offset;
        offset += line.len();
        let record = line.trim();
        if record.is_empty() {
            continue;
        }
        let bad = |reason: String| ContainerError::InvalidEncoding {
            offset: line_offset,
            reason,
        };
        if finished {
            return Err(bad("data after end-of-file record".into()));
        }
        let body = record
            .strip_prefix(':')
            .ok_or_else(|| bad("record does not start with ':'".into()))?;
        let bytes = hex::decode(body).map_err(|e| bad(e.to_string()))?;
        if bytes.len() < 5 {
            return Err(bad("record too short".into()));
        }
        let len = bytes[0] as usize;
        if bytes.len() != len + 5 {
            return Err(bad(format!("length byte says {len}, record holds {}", bytes.len() - 5)));
        }
        let sum = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        if sum != 0 {
            return Err(bad("record checksum mismatch".into()));
        }
        let address = u16::from_be_bytes([bytes[1], bytes[2]]) as usize;
        let data = &bytes[4..4 + len];
        match bytes[3] {
            RECORD_DATA => {
                if address != out.len() {
                    return Err(bad(format!(
                        "record at 0x{address:04X} does not follow 0x{:04X}",
                        out.len()
                    )));
                }
                out.extend_from_slice(data);
            }
            RECORD_EOF => finished = true,
            other => return Err(bad(format!("unsupported record type 0x{other:02X}"))),
        }
    }

    if !finished {
        return Err(ContainerError::InvalidEncoding {
            offset: text.len(),
            reason: "missing end-of-file record".into(),
        });
    }
    Ok(out)
}

fn encode_plain(payload: &[u8]) -> String {
    let mut out = String::with_capacity(payload.len() * 2 + payload.len() / PLAIN_BYTES_PER_LINE + 1);
    for chunk in payload.chunks(PLAIN_BYTES_PER_LINE) {
        out.push_str(&hex::encode_upper(chunk));
        out.push('\n');
    }
    out
}

fn encode_intel(payload: &[u8]) -> Result<String, ContainerError> {
    if payload.len() > u16::MAX as usize + 1 {
        return Err(ContainerError::InvalidContainer {
            reason: format!("{} bytes do not fit 16-bit Intel HEX addressing", payload.len()),
        });
    }
    let mut out = String::new();
    for (i, chunk) in payload.chunks(RECORD_BYTES).enumerate() {
        let address = (i * RECORD_BYTES) as u16;
        out.push_str(&intel_record(address, RECORD_DATA, chunk));
    }
    out.push_str(&intel_record(0, RECORD_EOF, &[]));
    Ok(out)
}

fn intel_record(address: u16, kind: u8, data: &[u8]) -> String {
    let mut bytes = Vec::with_capacity(data.len() + 5);
    bytes.push(data.len() as u8);
    bytes.extend_from_slice(&address.to_be_bytes());
    bytes.push(kind);
    bytes.extend_from_slice(data);
    let sum = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    bytes.push(sum.wrapping_neg());
    format!(":{}\n", hex::encode_upper(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::Board;
    use crate::container::testing::sample_image;
    use crate::events::NullObserver;
    use crate::schema::SchemaTable;

    #[test]
    fn test_plain_with_whitespace() {
        assert_eq!(decode("D8 01\n00 ff\r\n").unwrap(), vec![0xD8, 0x01, 0x00, 0xFF]);
    }

    #[test]
    fn test_non_hex_character_rejected() {
        match decode("D801\n00GZ") {
            Err(ContainerError::InvalidEncoding { offset, .. }) => assert_eq!(offset, 7),
            other => panic!("expected InvalidEncoding, got {other:?}"),
        }
    }

    #[test]
    fn test_odd_digit_count_rejected() {
        assert!(matches!(decode("D80"), Err(ContainerError::InvalidEncoding { .. })));
    }

    #[test]
    fn test_intel_known_record() {
        let text = ":0300000002337A4E\n:00000001FF\n";
        assert_eq!(decode(text).unwrap(), vec![0x02, 0x33, 0x7A]);
        assert_eq!(intel_record(0, RECORD_DATA, &[0x02, 0x33, 0x7A]), ":0300000002337A4E\n");
    }

    #[test]
    fn test_intel_checksum_and_gaps() {
        let bad_sum = ":0300000002337A4F\n:00000001FF\n";
        assert!(matches!(decode(bad_sum), Err(ContainerError::InvalidEncoding { .. })));

        let gap = format!("{}{}", intel_record(0x10, RECORD_DATA, &[1, 2]), intel_record(0, RECORD_EOF, &[]));
        assert!(matches!(decode(&gap), Err(ContainerError::InvalidEncoding { .. })));

        let no_eof = intel_record(0, RECORD_DATA, &[1, 2]);
        assert!(matches!(decode(&no_eof), Err(ContainerError::InvalidEncoding { .. })));
    }

    #[test]
    fn test_roundtrip_both_framings() {
        let table = SchemaTable::builtin().unwrap();
        let image = sample_image(&table, Board::X7, 219);
        let dir = tempfile::tempdir().unwrap();

        for framing in [HexFraming::Plain, HexFraming::IntelHex] {
            let mut ctx = AdapterContext::new(&table, &NullObserver);
            ctx.hex_framing = framing;
            let path = dir.path().join(format!("radio-{framing}.hex"));
            ContainerKind::Hex.write(&image, &path, &ctx).unwrap();
            let back = ContainerKind::Hex.read(&path, &ctx).unwrap();
            assert_eq!(back.payload(), image.payload(), "{framing}");
        }
    }
}
