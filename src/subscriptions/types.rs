//! Live query types.

use crate::types::{Sequence, Todo, TodoId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use super::manager::SubscriptionManager;

type Predicate = Arc<dyn Fn(&Todo) -> bool + Send + Sync>;

/// Which todos a query selects.
///
/// All conditions are combined with AND. `Query::all()` selects everything.
#[derive(Clone, Default)]
pub struct Query {
    done: Option<bool>,
    text: Option<String>,
    text_contains: Option<String>,
    custom: Option<Predicate>,
}

impl Query {
    /// Select every todo.
    pub fn all() -> Self {
        Self::default()
    }

    /// Select todos by completion flag.
    pub fn done(done: bool) -> Self {
        Self::all().where_done(done)
    }

    /// Select todos with an arbitrary predicate.
    pub fn filter<F>(predicate: F) -> Self
    where
        F: Fn(&Todo) -> bool + Send + Sync + 'static,
    {
        Self::all().and_filter(predicate)
    }

    pub fn where_done(mut self, done: bool) -> Self {
        self.done = Some(done);
        self
    }

    /// Require the text to equal `text` exactly.
    pub fn where_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn text_contains(mut self, needle: impl Into<String>) -> Self {
        self.text_contains = Some(needle.into());
        self
    }

    pub fn and_filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Todo) -> bool + Send + Sync + 'static,
    {
        let combined: Predicate = match self.custom.take() {
            Some(previous) => Arc::new(move |todo: &Todo| previous(todo) && predicate(todo)),
            None => Arc::new(predicate),
        };
        self.custom = Some(combined);
        self
    }

    /// Check if a todo satisfies this query.
    pub fn matches(&self, todo: &Todo) -> bool {
        if let Some(done) = self.done {
            if todo.done != done {
                return false;
            }
        }

        if let Some(ref text) = self.text {
            if &todo.text != text {
                return false;
            }
        }

        if let Some(ref needle) = self.text_contains {
            if !todo.text.contains(needle.as_str()) {
                return false;
            }
        }

        match self.custom {
            Some(ref predicate) => predicate(todo),
            None => true,
        }
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("done", &self.done)
            .field("text", &self.text)
            .field("text_contains", &self.text_contains)
            .field("custom", &self.custom.is_some())
            .finish()
    }
}

/// Full matching set of a query at one committed sequence.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Matching todos ordered by `created_at`, then id.
    pub todos: Vec<Todo>,
    /// Commit this result reflects.
    pub sequence: Sequence,
}

impl QueryResult {
    pub fn len(&self) -> usize {
        self.todos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.todos.is_empty()
    }

    pub fn ids(&self) -> Vec<&TodoId> {
        self.todos.iter().map(|t| &t.id).collect()
    }

    pub fn get(&self, id: &TodoId) -> Option<&Todo> {
        self.todos.iter().find(|t| &t.id == id)
    }
}

/// Events emitted on channel subscriptions.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LiveQueryEvent {
    /// The full matching set. The first event is the initial snapshot.
    Snapshot { result: QueryResult },

    /// Subscription was dropped. No further events follow.
    Dropped { reason: DropReason },
}

/// Why a subscription was dropped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Send buffer overflowed (slow consumer).
    BufferOverflow,
    /// Explicitly unsubscribed.
    Unsubscribed,
    /// The owning client shut down.
    Closed,
}

/// Unique identifier for a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Lifecycle of a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionState {
    Active,
    /// Terminal.
    Unsubscribed,
}

/// Handle to a callback subscription.
///
/// Dropping the handle unsubscribes and releases the callback.
#[must_use = "dropping a LiveQuery unsubscribes it"]
pub struct LiveQuery {
    pub(crate) id: SubscriptionId,
    pub(crate) initial: QueryResult,
    pub(crate) active: Arc<AtomicBool>,
    pub(crate) manager: Weak<SubscriptionManager>,
}

impl LiveQuery {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// The matching set at the moment of subscribing.
    pub fn initial(&self) -> &QueryResult {
        &self.initial
    }

    pub fn state(&self) -> SubscriptionState {
        if self.active.load(Ordering::SeqCst) {
            SubscriptionState::Active
        } else {
            SubscriptionState::Unsubscribed
        }
    }

    /// Stop delivery and release the callback.
    ///
    /// Returns false if the subscription was already gone.
    pub fn unsubscribe(&self) -> bool {
        match self.manager.upgrade() {
            Some(manager) => manager.unsubscribe(self.id),
            None => {
                self.active.store(false, Ordering::SeqCst);
                false
            }
        }
    }
}

impl Drop for LiveQuery {
    fn drop(&mut self) {
        if self.active.load(Ordering::SeqCst) {
            self.unsubscribe();
        }
    }
}

impl fmt::Debug for LiveQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveQuery")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Handle to a channel subscription.
pub struct SubscriptionHandle {
    pub id: SubscriptionId,
    /// Channel to receive events.
    pub receiver: crossbeam_channel::Receiver<LiveQueryEvent>,
}

impl SubscriptionHandle {
    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<LiveQueryEvent, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Result<LiveQueryEvent, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<LiveQueryEvent, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Timestamp, TodoFields};

    fn todo(id: &str, text: &str, done: bool) -> Todo {
        let mut fields = TodoFields::new(text, Timestamp(1));
        fields.done = done;
        Todo::from_fields(TodoId::new(id), fields)
    }

    #[test]
    fn test_all_matches_everything() {
        let query = Query::all();
        assert!(query.matches(&todo("a", "x", true)));
        assert!(query.matches(&todo("b", "y", false)));
    }

    #[test]
    fn test_conditions_combine() {
        let query = Query::done(false).text_contains("milk");
        assert!(query.matches(&todo("a", "buy milk", false)));
        assert!(!query.matches(&todo("b", "buy milk", true)));
        assert!(!query.matches(&todo("c", "walk dog", false)));
    }

    #[test]
    fn test_custom_filters_chain() {
        let query = Query::filter(|t| t.text.len() > 3).and_filter(|t| t.id.as_str() != "skip");
        assert!(query.matches(&todo("a", "long text", false)));
        assert!(!query.matches(&todo("a", "no", false)));
        assert!(!query.matches(&todo("skip", "long text", false)));
    }

    #[test]
    fn test_event_json_tag() {
        let event = LiveQueryEvent::Dropped {
            reason: DropReason::BufferOverflow,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "dropped");
        assert_eq!(json["reason"], "buffer_overflow");
    }
}
