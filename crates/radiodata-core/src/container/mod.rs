//! Container adapters.
//!
//! Every on-disk format reads into, and writes from, a [`RawImage`]: the
//! binary image payload plus the board/version it declares. The set of
//! formats is closed; [`ContainerKind`] dispatches by `match`.

pub mod archive;
pub mod directory;
pub mod hex;
pub mod legacy;
pub mod raw;
pub mod text;

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crc::{CRC_32_ISO_HDLC, Crc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::board::{Board, FirmwareVersion};
use crate::codec::{CodecError, ImageHeader};
use crate::events::{LogLevel, ProgressUnit, StorageEvent, StorageObserver};
use crate::schema::{SchemaError, SchemaTable, SchemaVersion};

pub use self::hex::HexFraming;

/// Largest file any adapter reads into memory.
pub const MAX_FILE_SIZE: u64 = 1024 * 1024;

/// CRC-32 (ISO HDLC, as used by zip).
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("invalid container: {reason}")]
    InvalidContainer { reason: String },
    #[error("{what}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        what: String,
        expected: usize,
        actual: usize,
    },
    #[error("invalid encoding at offset {offset}: {reason}")]
    InvalidEncoding { offset: usize, reason: String },
    #[error("{what}: checksum mismatch (expected 0x{expected:08X}, got 0x{actual:08X})")]
    ChecksumMismatch {
        what: String,
        expected: u32,
        actual: u32,
    },
    #[error("required path missing: {path}")]
    MissingPath { path: String },
    #[error("{document}: field '{field}': {message}")]
    Parse {
        document: String,
        field: String,
        message: String,
    },
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        offset: Option<u64>,
        #[source]
        source: std::io::Error,
    },
    #[error("operation cancelled")]
    Cancelled,
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl ContainerError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        ContainerError::Io {
            path: path.display().to_string(),
            offset: None,
            source,
        }
    }
}

/// Supported container formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerKind {
    /// Binary image, byte for byte.
    Raw,
    /// Hex digits, plain or Intel HEX records.
    Hex,
    /// LZ4 compressed image with a checksummed header.
    Legacy,
    /// Zip with one entry for the radio block and one per model.
    Archive,
    /// One TOML document.
    Text,
    /// Tree of TOML documents.
    Directory,
}

impl ContainerKind {
    pub const ALL: [ContainerKind; 6] = [
        ContainerKind::Raw,
        ContainerKind::Hex,
        ContainerKind::Legacy,
        ContainerKind::Archive,
        ContainerKind::Text,
        ContainerKind::Directory,
    ];

    /// Kind implied by a file extension, for outputs that do not exist yet.
    /// A path without extension is a directory.
    pub fn from_extension(path: &Path) -> Option<Self> {
        let Some(ext) = path.extension() else {
            return Some(ContainerKind::Directory);
        };
        match ext.to_string_lossy().to_ascii_lowercase().as_str() {
            "bin" | "eeprom" => Some(ContainerKind::Raw),
            "hex" | "ihex" => Some(ContainerKind::Hex),
            "eepz" => Some(ContainerKind::Legacy),
            "zip" | "otx" | "etx" => Some(ContainerKind::Archive),
            "toml" => Some(ContainerKind::Text),
            _ => None,
        }
    }

    /// Sniff an existing path: directories first, then magic bytes, then
    /// the extension.
    pub fn detect(path: &Path) -> Result<Self, ContainerError> {
        let meta = std::fs::metadata(path).map_err(|e| ContainerError::io(path, e))?;
        if meta.is_dir() {
            return Ok(ContainerKind::Directory);
        }

        let mut magic = [0u8; 4];
        let n = {
            use std::io::Read;
            let mut file = std::fs::File::open(path).map_err(|e| ContainerError::io(path, e))?;
            file.read(&mut magic).map_err(|e| ContainerError::io(path, e))?
        };
        let magic = &magic[..n];
        if magic == legacy::MAGIC {
            return Ok(ContainerKind::Legacy);
        }
        if magic == b"PK\x03\x04" {
            return Ok(ContainerKind::Archive);
        }

        match Self::from_extension(path) {
            Some(ContainerKind::Directory) | None => {
                if magic.first() == Some(&b':') {
                    Ok(ContainerKind::Hex)
                } else {
                    Err(ContainerError::InvalidContainer {
                        reason: format!("cannot tell the format of {}", path.display()),
                    })
                }
            }
            Some(kind) => Ok(kind),
        }
    }

    pub fn read(self, path: &Path, ctx: &AdapterContext<'_>) -> Result<RawImage, ContainerError> {
        let image = match self {
            ContainerKind::Raw => raw::read(path, ctx),
            ContainerKind::Hex => hex::read(path, ctx),
            ContainerKind::Legacy => legacy::read(path, ctx),
            ContainerKind::Archive => archive::read(path, ctx),
            ContainerKind::Text => text::read(path, ctx),
            ContainerKind::Directory => directory::read(path, ctx),
        }?;
        ctx.observer.on_event(&StorageEvent::ContainerRead {
            kind: self,
            path: path.display().to_string(),
            bytes: image.len(),
        });
        Ok(image)
    }

    pub fn write(self, image: &RawImage, path: &Path, ctx: &AdapterContext<'_>) -> Result<(), ContainerError> {
        match self {
            ContainerKind::Raw => raw::write(image, path, ctx),
            ContainerKind::Hex => hex::write(image, path, ctx),
            ContainerKind::Legacy => legacy::write(image, path, ctx),
            ContainerKind::Archive => archive::write(image, path, ctx),
            ContainerKind::Text => text::write(image, path, ctx),
            ContainerKind::Directory => directory::write(image, path, ctx),
        }?;
        ctx.observer.on_event(&StorageEvent::ContainerWritten {
            kind: self,
            path: path.display().to_string(),
            bytes: image.len(),
        });
        Ok(())
    }
}

impl fmt::Display for ContainerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerKind::Raw => write!(f, "raw"),
            ContainerKind::Hex => write!(f, "hex"),
            ContainerKind::Legacy => write!(f, "legacy"),
            ContainerKind::Archive => write!(f, "archive"),
            ContainerKind::Text => write!(f, "text"),
            ContainerKind::Directory => write!(f, "directory"),
        }
    }
}

impl FromStr for ContainerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.to_string() == s.to_ascii_lowercase())
            .ok_or_else(|| format!("unknown container format '{s}'"))
    }
}

/// Everything an adapter needs besides the path.
pub struct AdapterContext<'a> {
    pub schemas: &'a SchemaTable,
    pub observer: &'a dyn StorageObserver,
    pub progress_unit: ProgressUnit,
    pub hex_framing: HexFraming,
}

impl<'a> AdapterContext<'a> {
    pub fn new(schemas: &'a SchemaTable, observer: &'a dyn StorageObserver) -> Self {
        Self {
            schemas,
            observer,
            progress_unit: ProgressUnit::default(),
            hex_framing: HexFraming::default(),
        }
    }

    pub(crate) fn check_cancelled(&self) -> Result<(), ContainerError> {
        if self.observer.is_cancelled() {
            Err(ContainerError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub(crate) fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.observer.on_event(&StorageEvent::Log {
            level,
            message: message.into(),
        });
    }

    pub(crate) fn progress(&self, stage: &'static str, current: u64, total: u64) {
        self.observer.on_event(&StorageEvent::Progress {
            stage,
            current,
            total,
            unit: self.progress_unit,
        });
    }
}

/// Model labels (categories) shown by the radio's model browser.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageMetadata {
    /// Label name to the model slots carrying it.
    pub labels: BTreeMap<String, Vec<usize>>,
}

impl ImageMetadata {
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Labels attached to `slot`.
    pub fn labels_for(&self, slot: usize) -> impl Iterator<Item = &str> {
        self.labels
            .iter()
            .filter(move |(_, slots)| slots.contains(&slot))
            .map(|(name, _)| name.as_str())
    }
}

/// A binary image as read from a container. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct RawImage {
    kind: ContainerKind,
    board: Board,
    version: FirmwareVersion,
    checksum: Option<u32>,
    payload: Vec<u8>,
    metadata: ImageMetadata,
}

impl RawImage {
    /// Wrap a payload, taking board and version from its header.
    pub fn from_payload(
        kind: ContainerKind,
        payload: Vec<u8>,
        metadata: ImageMetadata,
    ) -> Result<Self, ContainerError> {
        let header = ImageHeader::parse(&payload).map_err(|_| ContainerError::InvalidContainer {
            reason: format!("image of {} bytes has no header", payload.len()),
        })?;
        let board = header.board().ok_or_else(|| ContainerError::InvalidContainer {
            reason: format!("unknown board id 0x{:04X}", header.board_id),
        })?;
        Ok(Self {
            kind,
            board,
            version: header.version,
            checksum: None,
            payload,
            metadata,
        })
    }

    pub(crate) fn with_checksum(mut self, checksum: u32) -> Self {
        self.checksum = Some(checksum);
        self
    }

    pub fn kind(&self) -> ContainerKind {
        self.kind
    }

    pub fn board(&self) -> Board {
        self.board
    }

    pub fn version(&self) -> FirmwareVersion {
        self.version
    }

    /// Checksum recorded by the container, if it carries one.
    pub fn checksum(&self) -> Option<u32> {
        self.checksum
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn metadata(&self) -> &ImageMetadata {
        &self.metadata
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// CRC-32 of the payload.
    pub fn crc32(&self) -> u32 {
        crc32(&self.payload)
    }
}

/// Schema for an image's declared board and version.
pub(crate) fn schema_for<'a>(ctx: &AdapterContext<'a>, image: &RawImage) -> Result<&'a SchemaVersion, ContainerError> {
    Ok(ctx.schemas.resolve(image.board(), image.version())?)
}

/// Fail unless `actual` matches the image size of the resolved schema.
pub(crate) fn check_image_size(schema: &SchemaVersion, actual: usize) -> Result<(), ContainerError> {
    let expected = schema.image_size();
    if actual != expected {
        return Err(ContainerError::SizeMismatch {
            what: format!("image for {} v{}", schema.board, schema.version),
            expected,
            actual,
        });
    }
    Ok(())
}

/// Read a whole file, refusing anything above [`MAX_FILE_SIZE`] before
/// reading it.
pub(crate) fn read_limited(path: &Path) -> Result<Vec<u8>, ContainerError> {
    let meta = std::fs::metadata(path).map_err(|e| ContainerError::io(path, e))?;
    if meta.len() > MAX_FILE_SIZE {
        return Err(ContainerError::InvalidContainer {
            reason: format!(
                "{} is {} bytes, limit is {MAX_FILE_SIZE}",
                path.display(),
                meta.len()
            ),
        });
    }
    std::fs::read(path).map_err(|e| ContainerError::io(path, e))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::codec::{FieldValue, encode_settings};
    use crate::settings::CanonicalSettings;

    /// Image with two used slots and a label, for adapter round trips.
    pub fn sample_image(table: &SchemaTable, board: Board, version: u8) -> RawImage {
        let schema = table.resolve(board, FirmwareVersion(version)).unwrap();
        let settings = sample_settings(schema);
        let payload = encode_settings(&settings, schema).unwrap();
        let mut metadata = ImageMetadata::default();
        metadata.labels.insert("Gliders".into(), vec![0, 2]);
        RawImage::from_payload(ContainerKind::Raw, payload, metadata).unwrap()
    }

    pub fn sample_settings(schema: &SchemaVersion) -> CanonicalSettings {
        let mut settings = schema.default_settings();
        settings.general.set("stick_mode", FieldValue::Int(2));
        for (slot, name) in [(0, "Glider"), (2, "Trainer")] {
            let mut model = schema.model.default_record();
            model.set("name", FieldValue::Text(name.into()));
            let list = schema.model.field("mixes").and_then(|f| f.as_list()).unwrap();
            let mut mix = list.element.default_record();
            mix.set("dest_channel", FieldValue::Int(3));
            mix.set("weight", FieldValue::Int(-40));
            model.set("mixes", FieldValue::List(vec![mix]));
            settings.models[slot] = Some(model);
        }
        settings
    }
}
