//! Descriptions compiled into the crate.

/// `(origin, document)` pairs, oldest version first within each family.
pub const DESCRIPTIONS: &[(&str, &str)] = &[
    ("avr9x_216.toml", include_str!("../../schemas/avr9x_216.toml")),
    ("avr9x_217.toml", include_str!("../../schemas/avr9x_217.toml")),
    ("taranis_217.toml", include_str!("../../schemas/taranis_217.toml")),
    ("taranis_218.toml", include_str!("../../schemas/taranis_218.toml")),
    ("taranis_219.toml", include_str!("../../schemas/taranis_219.toml")),
];
