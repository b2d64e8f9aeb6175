//! Radiodata-Core: storage and cross-version conversion of RC transmitter
//! EEPROM images.
//!
//! # Architecture
//!
//! - **Board**: supported boards, families and schema version numbers
//! - **Codec**: bit level field access, text encodings, whole image layout
//! - **Schema**: declarative layouts per (board, version), built once into
//!   an immutable table
//! - **Container**: raw, hex, legacy, archive, text and directory formats
//! - **Convert**: state machine, conversion rules and the migration walk
//! - **Ledger**: per field record of every conversion decision
//! - **Events**: observer pattern for progress and cancellation
//! - **Config**: TOML conversion profile
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//!
//! use radiodata_core::{
//!     Board, ContainerKind, ConversionOptions, ConversionTarget, Converter, NullObserver,
//!     RuleRegistry, SchemaTable,
//! };
//!
//! let schemas = SchemaTable::builtin()?;
//! let rules = RuleRegistry::builtin();
//! let ctx = radiodata_core::container::AdapterContext::new(&schemas, &NullObserver);
//!
//! let path = Path::new("backup.bin");
//! let image = ContainerKind::detect(path)?.read(path, &ctx)?;
//! let output = Converter::new(&schemas, &rules).convert_image(
//!     &image,
//!     ConversionTarget::new(Board::X9D, 219),
//!     &ConversionOptions::default(),
//! )?;
//! println!("{} fields need review", output.ledger.summaries().invalidated);
//! # Ok::<(), radiodata_core::Error>(())
//! ```

pub mod board;
pub mod codec;
pub mod config;
pub mod container;
pub mod convert;
pub mod error;
pub mod events;
pub mod ledger;
pub mod schema;
pub mod settings;

// Re-exports for convenience
pub use board::{Board, BoardFamily, FirmwareVersion};
pub use codec::{CodecError, FieldValue, Record};
pub use config::ProfileConfig;
pub use container::{ContainerError, ContainerKind, HexFraming, ImageMetadata, RawImage};
pub use convert::{
    BoardPolicy, ConversionError, ConversionOptions, ConversionOutput, ConversionState, ConversionTarget,
    Converter, DecodeOutput, RejectReason, RuleRegistry,
};
pub use error::{Error, Result};
pub use events::{CollectingObserver, LogLevel, NullObserver, ProgressUnit, StorageEvent, StorageObserver, TracingObserver};
pub use ledger::{ConversionEvent, ConversionLedger, Outcome, OutcomeSummary};
pub use schema::{SchemaError, SchemaTable, SchemaTableBuilder, SchemaVersion};
pub use settings::CanonicalSettings;
