//! Implicit structural rules: fit a canonical value into a field layout.
//!
//! Lists are not handled here; the engine walks their elements.

use crate::codec::FieldValue;
use crate::codec::fixed_to_stored;
use crate::codec::text::fit_text;
use crate::ledger::Outcome;
use crate::schema::{Encoding, FieldLayout};

#[derive(Debug, Clone, PartialEq)]
pub struct Fitted {
    pub value: FieldValue,
    pub outcome: Outcome,
    pub note: String,
}

impl Fitted {
    fn unchanged(value: FieldValue) -> Self {
        Self {
            value,
            outcome: Outcome::Unchanged,
            note: String::new(),
        }
    }

    fn review(value: FieldValue, note: String) -> Self {
        Self {
            value,
            outcome: Outcome::VerifyRequired,
            note,
        }
    }

    fn reset(field: &FieldLayout, note: String) -> Self {
        Self {
            value: field.default.clone(),
            outcome: Outcome::Invalidated,
            note,
        }
    }
}

/// Severity order used when two steps judge the same field.
pub fn worst(a: Outcome, b: Outcome) -> Outcome {
    fn rank(o: Outcome) -> u8 {
        match o {
            Outcome::Unchanged => 0,
            Outcome::Converted => 1,
            Outcome::VerifyRequired => 2,
            Outcome::Invalidated => 3,
        }
    }
    if rank(b) > rank(a) { b } else { a }
}

pub fn fit(value: &FieldValue, field: &FieldLayout) -> Fitted {
    match (&field.encoding, value) {
        (Encoding::Unsigned | Encoding::Signed, FieldValue::Int(v)) => match field.stored_bounds() {
            Some(bounds) if !bounds.contains(*v) => {
                let clamped = bounds.clamp(*v);
                Fitted::review(
                    FieldValue::Int(clamped),
                    format!("{v} clamped to {}..={}", bounds.min, bounds.max),
                )
            }
            _ => Fitted::unchanged(value.clone()),
        },
        (Encoding::Fixed { .. }, FieldValue::Fixed(v)) if !v.is_finite() => {
            Fitted::reset(field, format!("{v} is not a finite number"))
        }
        (Encoding::Fixed { scale, .. }, FieldValue::Fixed(v)) => {
            let stored = fixed_to_stored(*v, *scale);
            let bounds = field.stored_bounds();
            let kept = bounds.map_or(stored, |b| b.clamp(stored));
            let fitted = kept as f64 * scale;
            if kept != stored {
                Fitted::review(FieldValue::Fixed(fitted), format!("{v} clamped to {fitted}"))
            } else if (fitted - v).abs() > scale.abs() / 1000.0 {
                Fitted::review(FieldValue::Fixed(fitted), format!("{v} rounded to {fitted}"))
            } else {
                Fitted::unchanged(value.clone())
            }
        }
        (Encoding::Flag, FieldValue::Bool(_)) => Fitted::unchanged(value.clone()),
        (Encoding::Enum(_), FieldValue::Enum(tag)) => match field.variant_by_tag(tag) {
            Some(_) => Fitted::unchanged(value.clone()),
            None => Fitted::reset(field, format!("'{tag}' is not available")),
        },
        (Encoding::Enum(_), FieldValue::Unknown(raw)) => {
            Fitted::reset(field, format!("unknown value 0x{raw:X}"))
        }
        (
            Encoding::Text {
                capacity,
                charset,
                terminator,
            },
            FieldValue::Text(s),
        ) => {
            let (text, lossy) = fit_text(s, *capacity, *charset, *terminator);
            if lossy {
                let note = format!("text adapted to {capacity} {charset:?} characters").to_lowercase();
                Fitted::review(FieldValue::Text(text), note)
            } else {
                Fitted::unchanged(value.clone())
            }
        }
        (encoding, _) => Fitted::reset(
            field,
            format!("{} value cannot become {}", value.kind_name(), encoding.kind_name()),
        ),
    }
}
