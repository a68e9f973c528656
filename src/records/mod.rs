//! Record storage.
//!
//! Todos live in an in-memory table; committed batches are optionally
//! appended to an on-disk journal that is replayed on open.

mod journal;
mod table;

pub use journal::{Journal, JournalEntry};
pub use table::{Change, StagedBatch, TodoTable};
