//! # Live Todo
//!
//! A reactive todo store: atomic batched transactions over a single `todos`
//! table, with live queries that re-deliver the full matching set after
//! every committed batch that touches it.
//!
//! ## Core Concepts
//!
//! - **Records**: Todos in an in-memory table, optionally journaled to disk
//! - **Transactions**: Ordered create/update/delete batches, all or nothing
//! - **Live queries**: Callback or channel subscriptions fed full snapshots
//! - **Client**: Explicit connect/shutdown around one store per app id
//!
//! The user-level actions in [`TodoActions`] create, toggle and delete
//! todos. Of a stored todo they only ever change `done`. Lower-level
//! [`Transaction`]s and wire steps may also patch `text`; `id` and
//! `createdAt` are immutable everywhere.
//!
//! ## Example
//!
//! ```ignore
//! use livetodo::{ClientConfig, Query, TodoClient};
//!
//! let client = TodoClient::connect(ClientConfig::from_env()?)?;
//!
//! let live = client.subscribe(Query::all(), |result| {
//!     println!("{} todos", result.len());
//! })?;
//!
//! let actions = client.actions()?;
//! if let Some(todo) = actions.add("buy milk")? {
//!     actions.toggle(&todo.id)?;
//! }
//! actions.delete_completed()?;
//!
//! live.unsubscribe();
//! client.shutdown()?;
//! ```

pub mod actions;
pub mod client;
pub mod error;
pub mod records;
pub mod schema;
pub mod store;
pub mod subscriptions;
pub mod transaction;
pub mod types;

// Re-exports
pub use actions::TodoActions;
pub use client::{
    ClientConfig, QueryData, QueryError, QueryResponse, TodoClient, APP_ID_ENV, DATA_DIR_ENV,
};
pub use error::{ErrorKind, Result, StoreError};
pub use records::{Change, Journal, JournalEntry, StagedBatch, TodoTable};
pub use schema::{EntitySchema, FieldDef, FieldType, Schema, TODOS};
pub use store::{Store, StoreConfig};
pub use subscriptions::{
    DropReason, LiveQuery, LiveQueryEvent, Query, QueryResult, SubscriptionHandle,
    SubscriptionId, SubscriptionManager, SubscriptionState,
};
pub use transaction::{Operation, StepAction, Transaction, TransactionReceipt, TxStep};
pub use types::{Sequence, StoreStats, Timestamp, Todo, TodoFields, TodoId, TodoPatch};
