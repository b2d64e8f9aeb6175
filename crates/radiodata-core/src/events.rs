//! Event system for caller decoupling.
//!
//! Progress, state transitions and log messages flow to a
//! [`StorageObserver`] so the CLI (or any other front end) can follow a run
//! without the engine knowing how it is displayed.

use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use crate::container::ContainerKind;
use crate::convert::ConversionState;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// How progress totals are counted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressUnit {
    /// Fields or archive entries.
    #[default]
    Entries,
    Bytes,
}

impl fmt::Display for ProgressUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgressUnit::Entries => write!(f, "entries"),
            ProgressUnit::Bytes => write!(f, "bytes"),
        }
    }
}

/// Events emitted while reading, converting or writing.
#[derive(Debug, Clone)]
pub enum StorageEvent {
    /// Conversion state machine moved.
    StateChanged {
        from: ConversionState,
        to: ConversionState,
    },
    /// Progress of the current stage.
    Progress {
        stage: &'static str,
        current: u64,
        total: u64,
        unit: ProgressUnit,
    },
    Log { level: LogLevel, message: String },
    ContainerRead {
        kind: ContainerKind,
        path: String,
        bytes: usize,
    },
    ContainerWritten {
        kind: ContainerKind,
        path: String,
        bytes: usize,
    },
    /// One archive or directory entry was written.
    EntryWritten { name: String, bytes: usize },
}

/// Observer trait for receiving storage events.
pub trait StorageObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &StorageEvent);

    /// Polled at field boundaries and between container entries. Returning
    /// `true` stops the run with a cancellation error.
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl StorageObserver for NullObserver {
    fn on_event(&self, _event: &StorageEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl StorageObserver for TracingObserver {
    fn on_event(&self, event: &StorageEvent) {
        match event {
            StorageEvent::StateChanged { from, to } => {
                tracing::debug!(from = %from, to = %to, "Conversion state changed");
            }
            StorageEvent::Progress {
                stage,
                current,
                total,
                unit,
            } => {
                let pct = if *total > 0 {
                    (*current * 100) / *total
                } else {
                    0
                };
                tracing::trace!(stage = *stage, unit = %unit, progress = %format!("{}%", pct), "Progress");
            }
            StorageEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            StorageEvent::ContainerRead { kind, path, bytes } => {
                tracing::info!(kind = %kind, path = %path, bytes = bytes, "Container read");
            }
            StorageEvent::ContainerWritten { kind, path, bytes } => {
                tracing::info!(kind = %kind, path = %path, bytes = bytes, "Container written");
            }
            StorageEvent::EntryWritten { name, bytes } => {
                tracing::debug!(entry = %name, bytes = bytes, "Entry written");
            }
        }
    }
}

/// Observer that keeps every event and can be cancelled from outside.
/// Useful for front ends that poll, and for tests.
#[derive(Default)]
pub struct CollectingObserver {
    events: Mutex<Vec<StorageEvent>>,
    cancelled: AtomicBool,
    /// Cancel automatically once this many progress events were seen.
    cancel_after_progress: Option<usize>,
}

impl CollectingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancelling_after(progress_events: usize) -> Self {
        Self {
            cancel_after_progress: Some(progress_events),
            ..Self::default()
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<StorageEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn progress_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, StorageEvent::Progress { .. }))
            .count()
    }
}

impl StorageObserver for CollectingObserver {
    fn on_event(&self, event: &StorageEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
            if let Some(limit) = self.cancel_after_progress {
                let seen = events
                    .iter()
                    .filter(|e| matches!(e, StorageEvent::Progress { .. }))
                    .count();
                if seen >= limit {
                    self.cancelled.store(true, Ordering::SeqCst);
                }
            }
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress(current: u64) -> StorageEvent {
        StorageEvent::Progress {
            stage: "migrate",
            current,
            total: 10,
            unit: ProgressUnit::Entries,
        }
    }

    #[test]
    fn test_collecting_observer_cancels() {
        let observer = CollectingObserver::cancelling_after(2);
        observer.on_event(&progress(1));
        assert!(!observer.is_cancelled());
        observer.on_event(&StorageEvent::Log {
            level: LogLevel::Info,
            message: "hello".into(),
        });
        observer.on_event(&progress(2));
        assert!(observer.is_cancelled());
        assert_eq!(observer.events().len(), 3);
        assert_eq!(observer.progress_count(), 2);
    }

    #[test]
    fn test_manual_cancel() {
        let observer = CollectingObserver::new();
        assert!(!observer.is_cancelled());
        observer.cancel();
        assert!(observer.is_cancelled());
        assert!(!NullObserver.is_cancelled());
    }

    #[test]
    fn test_tracing_observer_accepts_all_events() {
        let observer = TracingObserver;
        observer.on_event(&progress(0));
        observer.on_event(&StorageEvent::StateChanged {
            from: ConversionState::Start,
            to: ConversionState::VersionResolved,
        });
        observer.on_event(&StorageEvent::EntryWritten {
            name: "RADIO/radio.bin".into(),
            bytes: 23,
        });
    }
}
