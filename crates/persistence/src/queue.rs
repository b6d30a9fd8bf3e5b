//! Save requests and the processor's per-priority queues.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::SaveError;
use crate::note::NoteId;

/// Drain order, lowest first.  Only arrival order *within* a level is FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SavePriority {
    AutoSave,
    UserSave,
    TabClose,
    ShutdownSave,
}

impl SavePriority {
    const LEVELS: usize = 4;

    fn level(self) -> usize {
        match self {
            Self::AutoSave => 0,
            Self::UserSave => 1,
            Self::TabClose => 2,
            Self::ShutdownSave => 3,
        }
    }

    /// Anything above an auto-save was asked for by the user, directly or
    /// by closing something.
    pub fn is_user_triggered(self) -> bool {
        self > Self::AutoSave
    }
}

impl fmt::Display for SavePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::AutoSave => "auto",
            Self::UserSave => "user",
            Self::TabClose => "tab-close",
            Self::ShutdownSave => "shutdown",
        };
        f.write_str(label)
    }
}

/// What a save request's completion signal resolves to.
#[derive(Debug)]
pub enum SaveOutcome {
    Saved,
    /// Not performed: absorbed by a newer request, or nothing to write.
    Skipped,
    Failed(SaveError),
}

impl SaveOutcome {
    pub fn is_saved(&self) -> bool {
        matches!(self, Self::Saved)
    }
}

#[derive(Debug)]
pub struct SaveRequest {
    pub note_id: NoteId,
    pub priority: SavePriority,
    pub queued_at: Instant,
    /// Set once this request has absorbed an older one.
    pub coalesced: bool,
    completion: oneshot::Sender<SaveOutcome>,
}

impl SaveRequest {
    pub fn new(note_id: NoteId, priority: SavePriority) -> (Self, oneshot::Receiver<SaveOutcome>) {
        let (tx, rx) = oneshot::channel();
        let request = Self {
            note_id,
            priority,
            queued_at: Instant::now(),
            coalesced: false,
            completion: tx,
        };
        (request, rx)
    }

    /// Resolve the waiter.  A caller that stopped waiting is not an error.
    pub fn complete(self, outcome: SaveOutcome) {
        let _ = self.completion.send(outcome);
    }
}

/// One FIFO per priority plus the single live request per note.
#[derive(Debug, Default)]
pub struct PriorityQueues {
    levels: [VecDeque<NoteId>; SavePriority::LEVELS],
    pending: HashMap<NoteId, SaveRequest>,
}

impl PriorityQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Enqueue, absorbing any request already pending for the same note.
    /// The older one resolves to `Skipped` and its priority is folded in.
    pub fn push(&mut self, mut request: SaveRequest) {
        if let Some(older) = self.pending.remove(&request.note_id) {
            self.levels[older.priority.level()].retain(|id| id != &older.note_id);
            if older.priority > request.priority {
                request.priority = older.priority;
            }
            request.coalesced = true;
            debug!(
                note_id = %request.note_id,
                priority = %request.priority,
                "coalesced save request"
            );
            older.complete(SaveOutcome::Skipped);
        }
        self.levels[request.priority.level()].push_back(request.note_id.clone());
        self.pending.insert(request.note_id.clone(), request);
    }

    /// Highest priority first, oldest first within a level.
    pub fn pop(&mut self) -> Option<SaveRequest> {
        for level in self.levels.iter_mut().rev() {
            while let Some(id) = level.pop_front() {
                if let Some(request) = self.pending.remove(&id) {
                    return Some(request);
                }
            }
        }
        None
    }

    /// Remove everything still queued, highest priority first.
    pub fn drain(&mut self) -> Vec<SaveRequest> {
        let mut out = Vec::with_capacity(self.pending.len());
        while let Some(request) = self.pop() {
            out.push(request);
        }
        out
    }
}

/// Result of `save_all_dirty`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchResult {
    pub success_count: usize,
    pub failed_ids: Vec<NoteId>,
}

impl BatchResult {
    pub fn all_succeeded(&self) -> bool {
        self.failed_ids.is_empty()
    }
}
