//! Conversion state machine.

use std::fmt;

use crate::events::{StorageEvent, StorageObserver};

/// Stage of one decode or conversion run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConversionState {
    #[default]
    Start,
    /// Source and target schemas are known.
    VersionResolved,
    Decoding,
    Migrating,
    /// Output image produced.
    Encoded,
    /// End of a decode-only run.
    Decoded,
    Rejected,
}

impl fmt::Display for ConversionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConversionState::Start => write!(f, "START"),
            ConversionState::VersionResolved => write!(f, "VERSION_RESOLVED"),
            ConversionState::Decoding => write!(f, "DECODING"),
            ConversionState::Migrating => write!(f, "MIGRATING"),
            ConversionState::Encoded => write!(f, "ENCODED"),
            ConversionState::Decoded => write!(f, "DECODED"),
            ConversionState::Rejected => write!(f, "REJECTED"),
        }
    }
}

impl ConversionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConversionState::Encoded | ConversionState::Decoded | ConversionState::Rejected
        )
    }

    /// Whether `next` may follow `self`. Settings handed in directly skip
    /// `Decoding`.
    pub fn can_advance_to(self, next: ConversionState) -> bool {
        use ConversionState::*;
        match (self, next) {
            (from, Rejected) => !from.is_terminal(),
            (Start, VersionResolved)
            | (VersionResolved, Decoding)
            | (VersionResolved, Migrating)
            | (Decoding, Migrating)
            | (Decoding, Decoded)
            | (Migrating, Encoded) => true,
            _ => false,
        }
    }
}

/// Tracks the current state and reports transitions.
#[derive(Debug, Default)]
pub struct StateMachine {
    state: ConversionState,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConversionState {
        self.state
    }

    /// Move to `next`. An illegal transition leaves the state unchanged and
    /// returns the rejected pair.
    pub fn goto_state(
        &mut self,
        next: ConversionState,
        observer: &dyn StorageObserver,
    ) -> Result<(), (ConversionState, ConversionState)> {
        if !self.state.can_advance_to(next) {
            return Err((self.state, next));
        }
        tracing::info!(from = %self.state, to = %next, "State transition");
        observer.on_event(&StorageEvent::StateChanged {
            from: self.state,
            to: next,
        });
        self.state = next;
        Ok(())
    }
}
