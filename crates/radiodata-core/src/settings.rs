//! Canonical in-memory settings tree.

use crate::board::{Board, FirmwareVersion};
use crate::codec::Record;

/// General radio settings plus every model slot, independent of bit layout.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalSettings {
    pub board: Board,
    pub version: FirmwareVersion,
    pub general: Record,
    /// Model slots by index; `None` is an empty slot.
    pub models: Vec<Option<Record>>,
}

impl CanonicalSettings {
    pub fn model(&self, slot: usize) -> Option<&Record> {
        self.models.get(slot).and_then(Option::as_ref)
    }

    pub fn model_mut(&mut self, slot: usize) -> Option<&mut Record> {
        self.models.get_mut(slot).and_then(Option::as_mut)
    }

    /// Store `model` in `slot`, growing the slot list if needed.
    pub fn set_model(&mut self, slot: usize, model: Option<Record>) {
        if slot >= self.models.len() {
            self.models.resize(slot + 1, None);
        }
        self.models[slot] = model;
    }

    /// `(slot, model)` for every used slot.
    pub fn used_models(&self) -> impl Iterator<Item = (usize, &Record)> {
        self.models
            .iter()
            .enumerate()
            .filter_map(|(i, m)| m.as_ref().map(|m| (i, m)))
    }
}
