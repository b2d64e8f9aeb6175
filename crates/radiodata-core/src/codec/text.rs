//! Fixed capacity text fields.

use super::bits::{read_bits, write_bits};
use crate::schema::{Charset, Terminator};

/// Radio alphabet. A stored byte is an index into this table.
pub const ZCHAR_ALPHABET: &[u8; 67] =
    b" ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789_-,.";

/// Bit width occupied by a text field of the given capacity.
pub fn text_width(capacity: usize, terminator: Terminator) -> u32 {
    match terminator {
        Terminator::Length => ((capacity + 1) * 8) as u32,
        Terminator::Null | Terminator::Padded => (capacity * 8) as u32,
    }
}

fn byte_at(buf: &[u8], offset: usize, index: usize) -> Result<u8, String> {
    read_bits(buf, offset + index * 8, 8)
        .map(|b| b as u8)
        .map_err(|e| e.to_string())
}

fn decode_char(byte: u8, charset: Charset) -> Result<char, String> {
    match charset {
        Charset::Ascii if (0x20..=0x7E).contains(&byte) => Ok(byte as char),
        Charset::Ascii => Err(format!("byte 0x{byte:02X} is not printable ascii")),
        Charset::Zchar => ZCHAR_ALPHABET
            .get(byte as usize)
            .map(|&c| c as char)
            .ok_or_else(|| format!("index {byte} outside the radio alphabet")),
    }
}

fn encode_char(c: char, charset: Charset) -> Option<u8> {
    match charset {
        Charset::Ascii => (c.is_ascii() && (' '..='~').contains(&c)).then_some(c as u8),
        Charset::Zchar => ZCHAR_ALPHABET
            .iter()
            .position(|&z| z as char == c)
            .map(|i| i as u8),
    }
}

fn pad_byte(charset: Charset) -> u8 {
    match charset {
        Charset::Ascii => b' ',
        Charset::Zchar => 0,
    }
}

/// Decode a text field at bit `offset`. Never reads past `capacity`.
pub fn decode_text(
    buf: &[u8],
    offset: usize,
    capacity: usize,
    charset: Charset,
    terminator: Terminator,
) -> Result<String, String> {
    let (start, len) = match terminator {
        Terminator::Length => {
            let len = byte_at(buf, offset, 0)? as usize;
            if len > capacity {
                return Err(format!("length prefix {len} exceeds capacity {capacity}"));
            }
            (1, len)
        }
        Terminator::Null | Terminator::Padded => (0, capacity),
    };

    let mut out = String::with_capacity(len);
    let mut end = len;
    for i in 0..len {
        let byte = byte_at(buf, offset, start + i)?;
        if terminator == Terminator::Null && byte == 0 {
            end = i;
            break;
        }
        out.push(decode_char(byte, charset)?);
    }

    // bytes past the end are not part of the value and must stay zero
    for i in end..capacity {
        let byte = byte_at(buf, offset, start + i)?;
        if byte != 0 {
            return Err(format!("byte 0x{byte:02X} after the end of the text at position {i}"));
        }
    }
    if terminator == Terminator::Padded {
        let trimmed = out.trim_end_matches(' ').len();
        out.truncate(trimmed);
    }
    Ok(out)
}

/// Encode `text` at bit `offset`, filling the unused capacity.
pub fn encode_text(
    text: &str,
    buf: &mut [u8],
    offset: usize,
    capacity: usize,
    charset: Charset,
    terminator: Terminator,
) -> Result<(), String> {
    let mut bytes = Vec::with_capacity(capacity);
    for c in text.chars() {
        let b = encode_char(c, charset)
            .ok_or_else(|| format!("character {c:?} not representable in {charset:?}"))?;
        bytes.push(b);
    }
    if bytes.len() > capacity {
        return Err(format!("{} characters exceed capacity {capacity}", bytes.len()));
    }
    if terminator == Terminator::Null && charset == Charset::Zchar && bytes.contains(&0) {
        return Err("space cannot be stored in a null terminated radio string".into());
    }

    let (start, fill) = match terminator {
        Terminator::Length => {
            write_bits(buf, offset, 8, bytes.len() as u64).map_err(|e| e.to_string())?;
            (1, 0)
        }
        Terminator::Null => (0, 0),
        Terminator::Padded => (0, pad_byte(charset)),
    };
    for i in 0..capacity {
        let b = bytes.get(i).copied().unwrap_or(fill);
        write_bits(buf, offset + (start + i) * 8, 8, b as u64).map_err(|e| e.to_string())?;
    }
    Ok(())
}

/// Adapt `text` to a field: unsupported characters become spaces and the
/// result is cut to `capacity`. The flag is set when anything changed.
pub fn fit_text(
    text: &str,
    capacity: usize,
    charset: Charset,
    terminator: Terminator,
) -> (String, bool) {
    let mut out: String = text
        .chars()
        .map(|c| if encode_char(c, charset).is_some() { c } else { ' ' })
        .take(capacity)
        .collect();
    if terminator == Terminator::Padded || charset == Charset::Zchar {
        let trimmed = out.trim_end_matches(' ').len();
        out.truncate(trimmed);
    }
    let lossy = out != text;
    (out, lossy)
}
