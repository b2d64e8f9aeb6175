//! Bit addressed reads and writes over a byte buffer.
//!
//! Bit `n` of a buffer is bit `n % 8` (LSB first) of byte `n / 8`. Fields
//! wider than the remainder of a byte continue in the next byte, so a field
//! is assembled little-endian. This matches the packed bitfield layout the
//! radios write to EEPROM.

use super::CodecError;

/// Read `width` bits (1..=64) starting at bit `offset`.
pub fn read_bits(buf: &[u8], offset: usize, width: u32) -> Result<u64, CodecError> {
    check_span(buf, offset, width)?;

    let mut value: u64 = 0;
    let mut done: u32 = 0;
    let mut bit = offset;
    while done < width {
        let shift = (bit % 8) as u32;
        let take = (8 - shift).min(width - done);
        let mask = ((1u16 << take) - 1) as u8;
        let chunk = (buf[bit / 8] >> shift) & mask;
        value |= (chunk as u64) << done;
        done += take;
        bit += take as usize;
    }
    Ok(value)
}

/// Write the low `width` bits of `value` at bit `offset`.
///
/// Bits outside `offset..offset + width` are preserved: each touched byte is
/// read, masked and written back.
pub fn write_bits(buf: &mut [u8], offset: usize, width: u32, value: u64) -> Result<(), CodecError> {
    check_span(buf, offset, width)?;
    if width < 64 && value >> width != 0 {
        return Err(CodecError::ValueOutOfRange {
            field: String::new(),
            value: value.to_string(),
            reason: format!("does not fit in {width} bits"),
        });
    }

    let mut done: u32 = 0;
    let mut bit = offset;
    while done < width {
        let shift = (bit % 8) as u32;
        let take = (8 - shift).min(width - done);
        let mask = ((1u16 << take) - 1) as u8;
        let chunk = ((value >> done) as u8) & mask;
        let byte = &mut buf[bit / 8];
        *byte = (*byte & !(mask << shift)) | (chunk << shift);
        done += take;
        bit += take as usize;
    }
    Ok(())
}

/// Sign-extend a `width`-bit two's complement value.
pub fn sign_extend(raw: u64, width: u32) -> i64 {
    if width >= 64 {
        return raw as i64;
    }
    let shift = 64 - width;
    ((raw << shift) as i64) >> shift
}

/// Two's complement representation of `value` in `width` bits.
pub fn to_twos_complement(value: i64, width: u32) -> u64 {
    if width >= 64 {
        value as u64
    } else {
        (value as u64) & ((1u64 << width) - 1)
    }
}

fn check_span(buf: &[u8], offset: usize, width: u32) -> Result<(), CodecError> {
    let available = buf.len() * 8;
    let needed = offset + width as usize;
    if width == 0 || width > 64 || needed > available {
        return Err(CodecError::TruncatedBuffer {
            needed_bits: needed,
            available_bits: available,
        });
    }
    Ok(())
}
