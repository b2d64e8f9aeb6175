//! Zip archives: the radio block and each used model slot as separate
//! entries.
//!
//! - `RADIO/radio.bin`: image header followed by the general settings block
//! - `MODELS/modelNN.bin`: one model slot, `NN` being the slot index
//! - `RADIO/labels.toml`: optional model labels
//!
//! Every entry is checked against the size and CRC-32 recorded in the
//! central directory before it is used.

use std::io::{Cursor, Read, Write};
use std::path::Path;

use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use super::{AdapterContext, ContainerError, ContainerKind, ImageMetadata, MAX_FILE_SIZE, RawImage};
use crate::codec::IMAGE_HEADER_LEN;
use crate::events::{LogLevel, ProgressUnit, StorageEvent};

pub const RADIO_ENTRY: &str = "RADIO/radio.bin";
pub const LABELS_ENTRY: &str = "RADIO/labels.toml";
const MODEL_PREFIX: &str = "MODELS/model";
const MODEL_SUFFIX: &str = ".bin";

pub fn model_entry_name(slot: usize) -> String {
    format!("{MODEL_PREFIX}{slot:02}{MODEL_SUFFIX}")
}

fn model_slot(name: &str) -> Option<usize> {
    name.strip_prefix(MODEL_PREFIX)?.strip_suffix(MODEL_SUFFIX)?.parse().ok()
}

/// One extracted entry with what the central directory says about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub name: String,
    pub declared_size: u64,
    pub declared_crc: u32,
    pub data: Vec<u8>,
}

impl ArchiveEntry {
    pub fn validate(&self) -> Result<(), ContainerError> {
        if self.data.len() as u64 != self.declared_size {
            return Err(ContainerError::SizeMismatch {
                what: format!("archive entry {}", self.name),
                expected: self.declared_size as usize,
                actual: self.data.len(),
            });
        }
        let actual = super::crc32(&self.data);
        if actual != self.declared_crc {
            return Err(ContainerError::ChecksumMismatch {
                what: format!("archive entry {}", self.name),
                expected: self.declared_crc,
                actual,
            });
        }
        Ok(())
    }
}

fn zip_error(path: &Path, e: ZipError) -> ContainerError {
    match e {
        ZipError::Io(source) => ContainerError::io(path, source),
        other => ContainerError::InvalidContainer {
            reason: format!("{}: {other}", path.display()),
        },
    }
}

/// Extract and validate every file entry.
fn extract(path: &Path, ctx: &AdapterContext<'_>) -> Result<Vec<ArchiveEntry>, ContainerError> {
    let data = super::read_limited(path)?;
    let mut zip = ZipArchive::new(Cursor::new(data)).map_err(|e| zip_error(path, e))?;
    let total = zip.len() as u64;
    let mut entries = Vec::with_capacity(zip.len());

    for i in 0..zip.len() {
        ctx.check_cancelled()?;
        let mut file = zip.by_index(i).map_err(|e| zip_error(path, e))?;
        if file.is_dir() {
            continue;
        }
        let name = file.name().to_string();
        let declared_size = file.size();
        if declared_size > MAX_FILE_SIZE {
            return Err(ContainerError::SizeMismatch {
                what: format!("archive entry {name}"),
                expected: MAX_FILE_SIZE as usize,
                actual: declared_size as usize,
            });
        }
        let declared_crc = file.crc32();

        let mut data = Vec::with_capacity(declared_size as usize);
        // one byte past the declared size is enough to detect a longer entry
        (&mut file)
            .take(declared_size + 1)
            .read_to_end(&mut data)
            .map_err(|source| ContainerError::Io {
                path: format!("{}:{name}", path.display()),
                offset: Some(data.len() as u64),
                source,
            })?;

        let entry = ArchiveEntry {
            name,
            declared_size,
            declared_crc,
            data,
        };
        entry.validate()?;
        ctx.progress("archive read", i as u64 + 1, total);
        entries.push(entry);
    }
    Ok(entries)
}

pub fn read(path: &Path, ctx: &AdapterContext<'_>) -> Result<RawImage, ContainerError> {
    let entries = extract(path, ctx)?;

    let radio = entries
        .iter()
        .find(|e| e.name == RADIO_ENTRY)
        .ok_or_else(|| ContainerError::MissingPath {
            path: format!("{}:{RADIO_ENTRY}", path.display()),
        })?;
    let header = RawImage::from_payload(ContainerKind::Archive, radio.data.clone(), ImageMetadata::default())?;
    let schema = super::schema_for(ctx, &header)?;

    let radio_len = IMAGE_HEADER_LEN + schema.general.size;
    if radio.data.len() != radio_len {
        return Err(ContainerError::SizeMismatch {
            what: RADIO_ENTRY.into(),
            expected: radio_len,
            actual: radio.data.len(),
        });
    }

    let mut payload = vec![0xFF; schema.image_size()];
    payload[..radio_len].copy_from_slice(&radio.data);
    let mut metadata = ImageMetadata::default();

    for entry in &entries {
        if entry.name == RADIO_ENTRY {
            continue;
        }
        if let Some(slot) = model_slot(&entry.name) {
            if slot >= schema.max_models {
                return Err(ContainerError::InvalidContainer {
                    reason: format!("{} is beyond the {} model slots", entry.name, schema.max_models),
                });
            }
            if entry.data.len() != schema.model.size {
                return Err(ContainerError::SizeMismatch {
                    what: entry.name.clone(),
                    expected: schema.model.size,
                    actual: entry.data.len(),
                });
            }
            let start = radio_len + slot * schema.model.size;
            payload[start..start + schema.model.size].copy_from_slice(&entry.data);
        } else if entry.name == LABELS_ENTRY {
            metadata = parse_labels(&entry.data, &entry.name)?;
        } else {
            ctx.log(LogLevel::Warn, format!("Ignoring unknown archive entry {}", entry.name));
        }
    }

    RawImage::from_payload(ContainerKind::Archive, payload, metadata)
}

fn parse_labels(data: &[u8], document: &str) -> Result<ImageMetadata, ContainerError> {
    let text = std::str::from_utf8(data).map_err(|e| ContainerError::InvalidEncoding {
        offset: e.valid_up_to(),
        reason: format!("{document} is not valid UTF-8"),
    })?;
    let table = text.parse::<toml::Table>().map_err(|e| ContainerError::Parse {
        document: document.to_string(),
        field: String::new(),
        message: e.message().to_string(),
    })?;
    super::text::labels_from_table(&table, document)
}

pub fn write(image: &RawImage, path: &Path, ctx: &AdapterContext<'_>) -> Result<(), ContainerError> {
    let schema = super::schema_for(ctx, image)?;
    super::check_image_size(schema, image.len())?;
    let payload = image.payload();

    let radio_len = IMAGE_HEADER_LEN + schema.general.size;
    let mut entries: Vec<(String, Vec<u8>)> = vec![(RADIO_ENTRY.to_string(), payload[..radio_len].to_vec())];
    for (slot, bytes) in payload[radio_len..].chunks(schema.model.size).enumerate() {
        if bytes.iter().all(|b| *b == 0xFF) {
            continue;
        }
        entries.push((model_entry_name(slot), bytes.to_vec()));
    }
    if !image.metadata().is_empty() {
        let labels = super::text::labels_to_table(image.metadata());
        let text = toml::to_string_pretty(&labels).map_err(|e| ContainerError::InvalidContainer {
            reason: format!("cannot serialize labels: {e}"),
        })?;
        entries.push((LABELS_ENTRY.to_string(), text.into_bytes()));
    }

    let total = match ctx.progress_unit {
        ProgressUnit::Entries => entries.len() as u64,
        ProgressUnit::Bytes => entries.iter().map(|(_, data)| data.len() as u64).sum(),
    };

    let file = std::fs::File::create(path).map_err(|e| ContainerError::io(path, e))?;
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut done = 0u64;
    for (name, data) in entries {
        ctx.check_cancelled()?;
        zip.start_file(name.as_str(), options).map_err(|e| zip_error(path, e))?;
        zip.write_all(&data).map_err(|e| ContainerError::io(path, e))?;

        done += match ctx.progress_unit {
            ProgressUnit::Entries => 1,
            ProgressUnit::Bytes => data.len() as u64,
        };
        ctx.progress("archive write", done, total);
        ctx.observer.on_event(&StorageEvent::EntryWritten {
            name,
            bytes: data.len(),
        });
    }

    zip.finish().map_err(|e| zip_error(path, e))?;
    tracing::debug!(path = %path.display(), entries = done, "Archive written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::Board;
    use crate::container::testing::sample_image;
    use crate::events::{CollectingObserver, NullObserver};
    use crate::schema::SchemaTable;

    #[test]
    fn test_entry_shorter_than_declared() {
        let entry = ArchiveEntry {
            name: MODEL_PREFIX.to_string() + "01.bin",
            declared_size: 100,
            declared_crc: 0,
            data: vec![0; 80],
        };
        match entry.validate() {
            Err(ContainerError::SizeMismatch { expected, actual, .. }) => {
                assert_eq!(expected, 100);
                assert_eq!(actual, 80);
            }
            other => panic!("expected SizeMismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_entry_checksum() {
        let data = b"radio".to_vec();
        let mut entry = ArchiveEntry {
            name: RADIO_ENTRY.into(),
            declared_size: data.len() as u64,
            declared_crc: super::super::crc32(&data),
            data,
        };
        assert!(entry.validate().is_ok());
        entry.declared_crc ^= 1;
        assert!(matches!(entry.validate(), Err(ContainerError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_model_entry_names() {
        assert_eq!(model_entry_name(3), "MODELS/model03.bin");
        assert_eq!(model_slot("MODELS/model42.bin"), Some(42));
        assert_eq!(model_slot("MODELS/model.bin"), None);
        assert_eq!(model_slot("RADIO/radio.bin"), None);
    }

    #[test]
    fn test_roundtrip_with_labels() {
        let table = SchemaTable::builtin().unwrap();
        let ctx = AdapterContext::new(&table, &NullObserver);
        let image = sample_image(&table, Board::X9D, 218);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backup.otx");

        ContainerKind::Archive.write(&image, &path, &ctx).unwrap();
        let back = ContainerKind::Archive.read(&path, &ctx).unwrap();
        assert_eq!(back.payload(), image.payload());
        assert_eq!(back.metadata(), image.metadata());
        assert_eq!(back.kind(), ContainerKind::Archive);
    }

    #[test]
    fn test_write_progress_units() {
        let table = SchemaTable::builtin().unwrap();
        let image = sample_image(&table, Board::Stock, 216);
        let dir = tempfile::tempdir().unwrap();

        let observer = CollectingObserver::new();
        let ctx = AdapterContext::new(&table, &observer);
        write(&image, &dir.path().join("a.zip"), &ctx).unwrap();
        // radio, two models, labels
        let last = observer.events().into_iter().rev().find_map(|e| match e {
            StorageEvent::Progress { current, total, .. } => Some((current, total)),
            _ => None,
        });
        assert_eq!(last, Some((4, 4)));

        let observer = CollectingObserver::new();
        let mut ctx = AdapterContext::new(&table, &observer);
        ctx.progress_unit = ProgressUnit::Bytes;
        write(&image, &dir.path().join("b.zip"), &ctx).unwrap();
        let schema = table.resolve(Board::Stock, crate::board::FirmwareVersion(216)).unwrap();
        let last = observer.events().into_iter().rev().find_map(|e| match e {
            StorageEvent::Progress { current, total, .. } => Some((current, total)),
            _ => None,
        });
        let (current, total) = last.unwrap();
        assert_eq!(current, total);
        assert!(total > (IMAGE_HEADER_LEN + schema.general.size + 2 * schema.model.size) as u64);
    }

    #[test]
    fn test_missing_radio_entry() {
        let table = SchemaTable::builtin().unwrap();
        let ctx = AdapterContext::new(&table, &NullObserver);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models-only.zip");

        let mut zip = ZipWriter::new(std::fs::File::create(&path).unwrap());
        zip.start_file("MODELS/model00.bin", SimpleFileOptions::default()).unwrap();
        zip.write_all(&[0u8; 36]).unwrap();
        zip.finish().unwrap();

        assert!(matches!(read(&path, &ctx), Err(ContainerError::MissingPath { .. })));
    }

    #[test]
    fn test_unknown_entry_is_reported() {
        let table = SchemaTable::builtin().unwrap();
        let image = sample_image(&table, Board::Stock, 216);
        let schema = table.resolve(Board::Stock, crate::board::FirmwareVersion(216)).unwrap();
        let radio_len = IMAGE_HEADER_LEN + schema.general.size;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("extra.zip");

        let mut zip = ZipWriter::new(std::fs::File::create(&path).unwrap());
        zip.start_file(RADIO_ENTRY, SimpleFileOptions::default()).unwrap();
        zip.write_all(&image.payload()[..radio_len]).unwrap();
        zip.start_file("README.txt", SimpleFileOptions::default()).unwrap();
        zip.write_all(b"notes").unwrap();
        zip.finish().unwrap();

        let observer = CollectingObserver::new();
        let back = read(&path, &AdapterContext::new(&table, &observer)).unwrap();
        assert_eq!(back.payload()[..radio_len], image.payload()[..radio_len]);
        let logged: Vec<_> = observer
            .events()
            .into_iter()
            .filter_map(|e| match e {
                StorageEvent::Log { level, message } => Some((level, message)),
                _ => None,
            })
            .collect();
        assert_eq!(logged, [(LogLevel::Warn, "Ignoring unknown archive entry README.txt".to_string())]);
    }

    #[test]
    fn test_cancel_between_entries() {
        let table = SchemaTable::builtin().unwrap();
        let image = sample_image(&table, Board::X7, 219);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.zip");
        write(&image, &path, &AdapterContext::new(&table, &NullObserver)).unwrap();

        let observer = CollectingObserver::new();
        observer.cancel();
        let ctx = AdapterContext::new(&table, &observer);
        assert!(matches!(read(&path, &ctx), Err(ContainerError::Cancelled)));
    }
}
