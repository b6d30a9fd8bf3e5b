pub mod circuit;
pub mod durable;
pub mod error;
pub mod events;
pub mod manager;
pub mod note;
pub mod queue;
pub mod wal;
pub mod watcher;
pub mod writer;

pub use durable::{DurableStore, NoteMetadata, SaveTrigger, StoreStatus};
pub use error::SaveError;
pub use events::SaveEvent;
pub use manager::{ConflictResolution, SaveManager};
pub use note::{NoteId, normalize_path};
pub use queue::{BatchResult, SaveOutcome, SavePriority};
pub use wal::{RecoveredChange, WriteAheadLog};
