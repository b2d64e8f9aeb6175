//! Legacy compressed containers.
//!
//! Layout (all little-endian):
//!
//! | offset | size | field                      |
//! |--------|------|----------------------------|
//! | 0      | 4    | magic `EEPZ`               |
//! | 4      | 2    | board id                   |
//! | 6      | 2    | schema version             |
//! | 8      | 4    | uncompressed size          |
//! | 12     | 4    | CRC-32 of the uncompressed |
//! | 16     | ..   | LZ4 block                  |
//!
//! Reading fails closed: the header is checked before anything is
//! decompressed, and the result is checked before it is returned.

use std::io::Cursor;
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use super::{AdapterContext, ContainerError, ContainerKind, ImageMetadata, MAX_FILE_SIZE, RawImage};
use crate::board::{Board, FirmwareVersion};

pub const MAGIC: &[u8; 4] = b"EEPZ";
pub const HEADER_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegacyHeader {
    pub board_id: u16,
    pub version: u16,
    pub size: u32,
    pub crc: u32,
}

impl LegacyHeader {
    pub fn parse(data: &[u8]) -> Result<Self, ContainerError> {
        if data.len() < HEADER_LEN {
            return Err(ContainerError::InvalidContainer {
                reason: format!("{} bytes is shorter than the legacy header", data.len()),
            });
        }
        if &data[..4] != MAGIC {
            return Err(ContainerError::InvalidContainer {
                reason: "bad legacy magic".into(),
            });
        }
        Self::read_fields(&mut Cursor::new(&data[4..HEADER_LEN])).map_err(|e| {
            ContainerError::InvalidContainer {
                reason: e.to_string(),
            }
        })
    }

    fn read_fields(cursor: &mut Cursor<&[u8]>) -> std::io::Result<Self> {
        Ok(Self {
            board_id: cursor.read_u16::<LittleEndian>()?,
            version: cursor.read_u16::<LittleEndian>()?,
            size: cursor.read_u32::<LittleEndian>()?,
            crc: cursor.read_u32::<LittleEndian>()?,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN);
        buf.extend_from_slice(MAGIC);
        // Vec writes are infallible
        let _ = buf.write_u16::<LittleEndian>(self.board_id);
        let _ = buf.write_u16::<LittleEndian>(self.version);
        let _ = buf.write_u32::<LittleEndian>(self.size);
        let _ = buf.write_u32::<LittleEndian>(self.crc);
        buf
    }
}

pub fn read(path: &Path, ctx: &AdapterContext<'_>) -> Result<RawImage, ContainerError> {
    let data = super::read_limited(path)?;
    decode(&data, ctx)
}

/// Validate and unpack a legacy container held in memory.
pub fn decode(data: &[u8], ctx: &AdapterContext<'_>) -> Result<RawImage, ContainerError> {
    let header = LegacyHeader::parse(data)?;

    let board = Board::from_id(header.board_id).ok_or_else(|| ContainerError::InvalidContainer {
        reason: format!("unknown board id 0x{:04X}", header.board_id),
    })?;
    let version = u8::try_from(header.version)
        .map(FirmwareVersion)
        .map_err(|_| ContainerError::InvalidContainer {
            reason: format!("version {} out of range", header.version),
        })?;

    let declared = header.size as usize;
    if header.size as u64 > MAX_FILE_SIZE {
        return Err(ContainerError::SizeMismatch {
            what: "declared uncompressed size".into(),
            expected: MAX_FILE_SIZE as usize,
            actual: declared,
        });
    }
    let schema = ctx.schemas.resolve(board, version)?;
    if declared != schema.image_size() {
        return Err(ContainerError::SizeMismatch {
            what: "declared uncompressed size".into(),
            expected: schema.image_size(),
            actual: declared,
        });
    }

    let payload = lz4_flex::block::decompress(&data[HEADER_LEN..], declared).map_err(|e| {
        ContainerError::InvalidContainer {
            reason: format!("decompression failed: {e}"),
        }
    })?;
    if payload.len() != declared {
        return Err(ContainerError::SizeMismatch {
            what: "decompressed image".into(),
            expected: declared,
            actual: payload.len(),
        });
    }
    let actual = super::crc32(&payload);
    if actual != header.crc {
        return Err(ContainerError::ChecksumMismatch {
            what: "legacy image".into(),
            expected: header.crc,
            actual,
        });
    }

    let image = RawImage::from_payload(ContainerKind::Legacy, payload, ImageMetadata::default())?;
    if image.board() != board || image.version() != version {
        return Err(ContainerError::InvalidContainer {
            reason: format!(
                "container says {board} v{version}, image says {} v{}",
                image.board(),
                image.version()
            ),
        });
    }
    Ok(image.with_checksum(header.crc))
}

pub fn encode(image: &RawImage) -> Vec<u8> {
    let header = LegacyHeader {
        board_id: image.board().id(),
        version: image.version().get() as u16,
        size: image.len() as u32,
        crc: image.crc32(),
    };
    let mut out = header.to_bytes();
    out.extend_from_slice(&lz4_flex::block::compress(image.payload()));
    out
}

pub fn write(image: &RawImage, path: &Path, _ctx: &AdapterContext<'_>) -> Result<(), ContainerError> {
    std::fs::write(path, encode(image)).map_err(|e| ContainerError::io(path, e))
}
