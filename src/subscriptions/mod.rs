//! Live queries over the todo table.
//!
//! A live query is a [`Query`] plus a sink. On subscribe the current matching
//! set is returned; afterwards every committed batch that adds, changes, or
//! removes a matching todo produces exactly one new full result (never a
//! diff). Two sinks are supported:
//! - callbacks, invoked synchronously on the committing thread
//! - bounded channels, with slow-subscriber dropping
//!
//! # Example
//!
//! ```ignore
//! let live = store.subscribe(Query::done(false), |result| {
//!     println!("{} open todos", result.len());
//! })?;
//! println!("initially {}", live.initial().len());
//!
//! let handle = store.subscribe_channel(Query::all())?;
//! while let Ok(event) = handle.recv() {
//!     match event {
//!         LiveQueryEvent::Snapshot { result } => println!("{:?}", result.ids()),
//!         LiveQueryEvent::Dropped { .. } => break,
//!     }
//! }
//! ```

mod manager;
mod types;

pub use manager::SubscriptionManager;
pub use types::{
    DropReason, LiveQuery, LiveQueryEvent, Query, QueryResult, SubscriptionHandle,
    SubscriptionId, SubscriptionState,
};
