//! Directory layout: one TOML document per part.
//!
//! ```text
//! RADIO/radio.toml      [header] + [radio]
//! MODELS/models.toml    [[slot]] index = 0, file = "model00.toml"
//! MODELS/model00.toml   fields of slot 0
//! MODELS/labels.toml    optional, label = [slots]
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;
use toml::{Table, Value};

use super::text::{
    expect_table, header_table, image_from_settings, labels_from_table, labels_to_table, parse_document,
    record_to_table, schema_from_header, settings_for_image, table_to_record, write_document,
};
use super::{AdapterContext, ContainerError, ContainerKind, ImageMetadata, RawImage};
use crate::events::StorageEvent;

pub const RADIO_DOCUMENT: &str = "RADIO/radio.toml";
pub const MODEL_INDEX: &str = "MODELS/models.toml";
pub const LABELS_DOCUMENT: &str = "MODELS/labels.toml";

#[derive(Debug, Default, Deserialize)]
struct ModelIndex {
    #[serde(default)]
    slot: Vec<SlotEntry>,
}

#[derive(Debug, Deserialize)]
struct SlotEntry {
    index: usize,
    file: String,
}

impl ModelIndex {
    fn to_table(&self) -> Table {
        let slots = self
            .slot
            .iter()
            .map(|s| {
                let mut entry = Table::new();
                entry.insert("index".into(), Value::Integer(s.index as i64));
                entry.insert("file".into(), Value::String(s.file.clone()));
                Value::Table(entry)
            })
            .collect();
        let mut table = Table::new();
        table.insert("slot".into(), Value::Array(slots));
        table
    }
}

pub fn model_file_name(slot: usize) -> String {
    format!("model{slot:02}.toml")
}

fn required(root: &Path, relative: &str) -> Result<PathBuf, ContainerError> {
    let path = root.join(relative);
    if !path.is_file() {
        return Err(ContainerError::MissingPath {
            path: path.display().to_string(),
        });
    }
    Ok(path)
}

pub fn read(path: &Path, ctx: &AdapterContext<'_>) -> Result<RawImage, ContainerError> {
    let radio_path = required(path, RADIO_DOCUMENT)?;
    let index_path = required(path, MODEL_INDEX)?;

    let radio_name = radio_path.display().to_string();
    let radio = parse_document(&radio_path)?;
    let schema = schema_from_header(&radio, &radio_name, ctx)?;
    let mut settings = schema.default_settings();
    if let Some(general) = radio.get("radio") {
        let general = expect_table(general, &radio_name, "radio")?;
        settings.general = table_to_record(general, &schema.general, &radio_name, "radio")?;
    }

    let index_name = index_path.display().to_string();
    let index: ModelIndex = toml::from_str(&read_text(&index_path)?).map_err(|e| ContainerError::Parse {
        document: index_name.clone(),
        field: String::new(),
        message: e.message().to_string(),
    })?;

    let models_dir = index_path.parent().unwrap_or(path);
    let total = index.slot.len() as u64;
    for (i, entry) in index.slot.iter().enumerate() {
        ctx.check_cancelled()?;
        let field = format!("slot[{i}]");
        if entry.index >= schema.max_models {
            return Err(ContainerError::Parse {
                document: index_name.clone(),
                field,
                message: format!("slot {} beyond the {} model slots", entry.index, schema.max_models),
            });
        }
        if settings.model(entry.index).is_some() {
            return Err(ContainerError::Parse {
                document: index_name.clone(),
                field,
                message: format!("slot {} listed twice", entry.index),
            });
        }
        if Path::new(&entry.file).components().count() != 1 {
            return Err(ContainerError::Parse {
                document: index_name.clone(),
                field,
                message: format!("'{}' is not a plain file name", entry.file),
            });
        }

        let model_path = models_dir.join(&entry.file);
        if !model_path.is_file() {
            return Err(ContainerError::MissingPath {
                path: model_path.display().to_string(),
            });
        }
        let model_name = model_path.display().to_string();
        let doc = parse_document(&model_path)?;
        let model = table_to_record(&doc, &schema.model, &model_name, &format!("models[{}]", entry.index))?;
        settings.set_model(entry.index, Some(model));
        ctx.progress("directory read", i as u64 + 1, total);
    }

    let labels_path = path.join(LABELS_DOCUMENT);
    let metadata = if labels_path.is_file() {
        let doc = parse_document(&labels_path)?;
        labels_from_table(&doc, &labels_path.display().to_string())?
    } else {
        ImageMetadata::default()
    };

    image_from_settings(ContainerKind::Directory, &settings, schema, metadata)
}

fn read_text(path: &Path) -> Result<String, ContainerError> {
    let data = super::read_limited(path)?;
    String::from_utf8(data).map_err(|e| ContainerError::InvalidEncoding {
        offset: e.utf8_error().valid_up_to(),
        reason: format!("{} is not valid UTF-8", path.display()),
    })
}

pub fn write(image: &RawImage, path: &Path, ctx: &AdapterContext<'_>) -> Result<(), ContainerError> {
    let (settings, schema) = settings_for_image(image, ctx)?;

    let radio_dir = path.join("RADIO");
    let models_dir = path.join("MODELS");
    for dir in [&radio_dir, &models_dir] {
        std::fs::create_dir_all(dir).map_err(|e| ContainerError::io(dir, e))?;
    }

    let mut documents: Vec<(String, Table)> = Vec::new();
    let mut radio = header_table(image.board(), image.version());
    radio.insert("radio".into(), Value::Table(record_to_table(&settings.general, &schema.general)));
    documents.push((RADIO_DOCUMENT.to_string(), radio));

    let mut index = ModelIndex::default();
    for (slot, model) in settings.used_models() {
        let file = model_file_name(slot);
        documents.push((format!("MODELS/{file}"), record_to_table(model, &schema.model)));
        index.slot.push(SlotEntry { index: slot, file });
    }
    documents.push((MODEL_INDEX.to_string(), index.to_table()));

    if !image.metadata().is_empty() {
        documents.push((LABELS_DOCUMENT.to_string(), labels_to_table(image.metadata())));
    }

    let total = documents.len() as u64;
    for (i, (relative, doc)) in documents.into_iter().enumerate() {
        ctx.check_cancelled()?;
        let target = path.join(&relative);
        write_document(&target, &doc)?;
        let bytes = std::fs::metadata(&target).map(|m| m.len() as usize).unwrap_or(0);
        ctx.progress("directory write", i as u64 + 1, total);
        ctx.observer.on_event(&StorageEvent::EntryWritten { name: relative, bytes });
    }
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
    fn test_roundtrip() {
        let table = SchemaTable::builtin().unwrap();
        let observer = CollectingObserver::new();
        let ctx = AdapterContext::new(&table, &observer);
        let image = sample_image(&table, Board::X7, 218);
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("backup");

        ContainerKind::Directory.write(&image, &root, &ctx).unwrap();
        assert!(root.join("MODELS/model02.toml").is_file());
        let written = observer
            .events()
            .iter()
            .filter(|e| matches!(e, StorageEvent::EntryWritten { .. }))
            .count();
        // radio, two models, index, labels
        assert_eq!(written, 5);

        let back = ContainerKind::Directory.read(&root, &ctx).unwrap();
        assert_eq!(back.payload(), image.payload());
        assert_eq!(back.metadata(), image.metadata());
    }

    #[test]
    fn test_missing_index() {
        let table = SchemaTable::builtin().unwrap();
        let ctx = AdapterContext::new(&table, &NullObserver);
        let image = sample_image(&table, Board::M128, 217);
        let dir = tempfile::tempdir().unwrap();
        write(&image, dir.path(), &ctx).unwrap();
        std::fs::remove_file(dir.path().join(MODEL_INDEX)).unwrap();

        match read(dir.path(), &ctx) {
            Err(ContainerError::MissingPath { path }) => assert!(path.ends_with("models.toml")),
            other => panic!("expected MissingPath, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_model_file() {
        let table = SchemaTable::builtin().unwrap();
        let ctx = AdapterContext::new(&table, &NullObserver);
        let image = sample_image(&table, Board::M128, 217);
        let dir = tempfile::tempdir().unwrap();
        write(&image, dir.path(), &ctx).unwrap();
        std::fs::remove_file(dir.path().join("MODELS").join(model_file_name(2))).unwrap();

        assert!(matches!(read(dir.path(), &ctx), Err(ContainerError::MissingPath { .. })));
    }

    #[test]
    fn test_missing_labels_is_empty() {
        let table = SchemaTable::builtin().unwrap();
        let ctx = AdapterContext::new(&table, &NullObserver);
        let image = sample_image(&table, Board::X9D, 219);
        let dir = tempfile::tempdir().unwrap();
        write(&image, dir.path(), &ctx).unwrap();
        std::fs::remove_file(dir.path().join(LABELS_DOCUMENT)).unwrap();

        let back = read(dir.path(), &ctx).unwrap();
        assert!(back.metadata().is_empty());
        assert_eq!(back.payload(), image.payload());
    }

    #[test]
    fn test_index_rejects_paths() {
        let table = SchemaTable::builtin().unwrap();
        let ctx = AdapterContext::new(&table, &NullObserver);
        let image = sample_image(&table, Board::X9D, 219);
        let dir = tempfile::tempdir().unwrap();
        write(&image, dir.path(), &ctx).unwrap();
        std::fs::write(
            dir.path().join(MODEL_INDEX),
            "[[slot]]\nindex = 0\nfile = \"../RADIO/radio.toml\"\n",
        )
        .unwrap();

        assert!(matches!(read(dir.path(), &ctx), Err(ContainerError::Parse { .. })));
    }
}
