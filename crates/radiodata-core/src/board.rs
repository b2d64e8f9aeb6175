//! Supported transmitter boards and firmware schema versions.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Hardware family. Boards of different families never share data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoardFamily {
    /// ATmega based 9X radios.
    Avr9x,
    /// FrSky Taranis class radios.
    Taranis,
}

impl fmt::Display for BoardFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoardFamily::Avr9x => write!(f, "avr9x"),
            BoardFamily::Taranis => write!(f, "taranis"),
        }
    }
}

impl FromStr for BoardFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "avr9x" => Ok(BoardFamily::Avr9x),
            "taranis" => Ok(BoardFamily::Taranis),
            other => Err(format!("unknown board family '{other}'")),
        }
    }
}

/// Transmitter board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Board {
    /// Stock 9X, ATmega64.
    #[serde(rename = "stock")]
    Stock,
    /// 9X with ATmega128 upgrade.
    #[serde(rename = "m128")]
    M128,
    #[serde(rename = "x9d")]
    X9D,
    #[serde(rename = "x9d+")]
    X9DPlus,
    #[serde(rename = "x7")]
    X7,
}

impl Board {
    pub const ALL: [Board; 5] = [
        Board::Stock,
        Board::M128,
        Board::X9D,
        Board::X9DPlus,
        Board::X7,
    ];

    /// Id stored in the image header.
    pub const fn id(self) -> u16 {
        match self {
            Board::Stock => 0x0001,
            Board::M128 => 0x0002,
            Board::X9D => 0x0101,
            Board::X9DPlus => 0x0102,
            Board::X7 => 0x0103,
        }
    }

    pub fn from_id(id: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|b| b.id() == id)
    }

    pub const fn family(self) -> BoardFamily {
        match self {
            Board::Stock | Board::M128 => BoardFamily::Avr9x,
            Board::X9D | Board::X9DPlus | Board::X7 => BoardFamily::Taranis,
        }
    }

    /// Short name used in schema descriptions and text documents.
    pub const fn name(self) -> &'static str {
        match self {
            Board::Stock => "stock",
            Board::M128 => "m128",
            Board::X9D => "x9d",
            Board::X9DPlus => "x9d+",
            Board::X7 => "x7",
        }
    }

    pub fn is_compatible_with(self, other: Board) -> bool {
        self.family() == other.family()
    }
}

impl fmt::Display for Board {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Board {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|b| b.name() == lower)
            .ok_or_else(|| format!("unknown board '{s}'"))
    }
}

/// EEPROM schema version number, as written in byte 0 of every image.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct FirmwareVersion(pub u8);

impl FirmwareVersion {
    pub const fn new(v: u8) -> Self {
        Self(v)
    }

    pub const fn get(self) -> u8 {
        self.0
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for FirmwareVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .trim_start_matches('v')
            .parse::<u8>()
            .map(FirmwareVersion)
            .map_err(|e| format!("invalid version '{s}': {e}"))
    }
}

impl From<u8> for FirmwareVersion {
    fn from(v: u8) -> Self {
        Self(v)
    }
}
