//! Conversion profile, stored as TOML.

use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::board::{Board, FirmwareVersion};
use crate::container::{AdapterContext, HexFraming};
use crate::convert::{BoardPolicy, ConversionOptions};
use crate::events::{ProgressUnit, StorageObserver};
use crate::schema::{SchemaError, SchemaTable, SchemaTableBuilder};

/// Settings shared by every command. Command line flags override them.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileConfig {
    /// Board the images are expected to be for.
    pub board: Option<Board>,
    /// Version to convert to; the latest registered one when unset.
    pub target_version: Option<FirmwareVersion>,
    pub board_policy: BoardPolicy,
    pub hex_framing: HexFraming,
    pub progress_unit: ProgressUnit,
    /// Extra schema descriptions loaded on top of the built-in ones.
    pub schema_dir: Option<PathBuf>,
}

impl ProfileConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ProfileConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn conversion_options(&self) -> ConversionOptions {
        ConversionOptions {
            expected_board: self.board,
            board_policy: self.board_policy,
        }
    }

    /// Built-in schemas plus those in `schema_dir`.
    pub fn schema_table(&self) -> Result<SchemaTable, SchemaError> {
        let mut builder = SchemaTableBuilder::new().add_builtin()?;
        if let Some(dir) = &self.schema_dir {
            builder = builder.add_dir(dir)?;
        }
        builder.build()
    }

    pub fn adapter_context<'a>(&self, schemas: &'a SchemaTable, observer: &'a dyn StorageObserver) -> AdapterContext<'a> {
        AdapterContext {
            progress_unit: self.progress_unit,
            hex_framing: self.hex_framing,
            ..AdapterContext::new(schemas, observer)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullObserver;

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.toml");
        let config = ProfileConfig {
            board: Some(Board::X9DPlus),
            target_version: Some(FirmwareVersion(219)),
            board_policy: BoardPolicy::PreferImage,
            hex_framing: HexFraming::IntelHex,
            progress_unit: ProgressUnit::Bytes,
            schema_dir: None,
        };
        config.save_to_file(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("board = \"x9d+\""));
        assert!(text.contains("board_policy = \"prefer-image\""));
        assert_eq!(ProfileConfig::load_from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_file_takes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.toml");
        std::fs::write(&path, "target_version = 217\n").unwrap();

        let config = ProfileConfig::load_from_file(&path).unwrap();
        assert_eq!(config.target_version, Some(FirmwareVersion(217)));
        assert_eq!(config.board_policy, BoardPolicy::Reject);
        assert_eq!(config.conversion_options(), ConversionOptions::default());

        std::fs::write(&path, "board_policy = \"sometimes\"\n").unwrap();
        assert!(ProfileConfig::load_from_file(&path).is_err());
    }

    #[test]
    fn test_schema_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("taranis_230.toml"),
            r#"
family = "taranis"
version = 230
boards = ["x7"]
max_models = 1

[general]
size = 1
fields = [{ name = "contrast", offset = 0, width = 5, type = "unsigned", default = 25 }]

[model]
size = 2
fields = [{ name = "name", offset = 0, type = "text", capacity = 2, charset = "ascii", terminator = "padded" }]
"#,
        )
        .unwrap();

        let config = ProfileConfig {
            schema_dir: Some(dir.path().to_path_buf()),
            progress_unit: ProgressUnit::Bytes,
            ..Default::default()
        };
        let table = config.schema_table().unwrap();
        assert_eq!(table.latest(Board::X7).map(|s| s.version), Some(FirmwareVersion(230)));
        assert_eq!(table.len(), SchemaTable::builtin().unwrap().len() + 1);

        let ctx = config.adapter_context(&table, &NullObserver);
        assert_eq!(ctx.progress_unit, ProgressUnit::Bytes);
    }
}
