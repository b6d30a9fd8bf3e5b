//! Lifecycle events raised by the save manager.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::note::NoteId;
use crate::queue::SavePriority;

/// Slow subscribers lag rather than block the processor.
pub const EVENT_CAP: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SaveEvent {
    SaveStarted {
        note_id: NoteId,
        path: PathBuf,
        priority: SavePriority,
        at: DateTime<Utc>,
    },
    SaveCompleted {
        note_id: NoteId,
        path: PathBuf,
        priority: SavePriority,
        success: bool,
        at: DateTime<Utc>,
    },
    NoteSaved {
        note_id: NoteId,
        path: PathBuf,
        saved_at: DateTime<Utc>,
        was_auto_save: bool,
    },
    ExternalChangeDetected {
        note_id: NoteId,
        path: PathBuf,
        external_content: String,
        detected_at: DateTime<Utc>,
    },
}

impl SaveEvent {
    pub fn note_id(&self) -> &NoteId {
        match self {
            Self::SaveStarted { note_id, .. }
            | Self::SaveCompleted { note_id, .. }
            | Self::NoteSaved { note_id, .. }
            | Self::ExternalChangeDetected { note_id, .. } => note_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SaveEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_CAP)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SaveEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: SaveEvent) {
        if self.tx.send(event).is_err() {
            trace!("no event subscribers");
        }
    }
}
