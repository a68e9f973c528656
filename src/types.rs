//! Core types for the todo store.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Opaque identifier for a todo.
///
/// Ids are chosen by the client before the create operation is submitted.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TodoId(String);

impl TodoId {
    /// Wrap an existing identifier.
    pub fn new(id: impl Into<String>) -> Self {
        TodoId(id.into())
    }

    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        TodoId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for TodoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TodoId({})", self.0)
    }
}

impl fmt::Display for TodoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TodoId {
    fn from(id: &str) -> Self {
        TodoId::new(id)
    }
}

impl From<String> for TodoId {
    fn from(id: String) -> Self {
        TodoId(id)
    }
}

/// Milliseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_millis() as i64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Position of a committed batch in the store's history.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Sequence(pub u64);

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seq({})", self.0)
    }
}

impl Sequence {
    pub fn next(self) -> Self {
        Sequence(self.0 + 1)
    }
}

/// A single todo item.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Todo {
    pub id: TodoId,
    pub text: String,
    pub done: bool,
    pub created_at: Timestamp,
}

impl Todo {
    /// Build a todo from its id and creation fields.
    pub fn from_fields(id: TodoId, fields: TodoFields) -> Self {
        Self {
            id,
            text: fields.text,
            done: fields.done,
            created_at: fields.created_at,
        }
    }

    /// Apply a partial update in place.
    pub fn apply_patch(&mut self, patch: &TodoPatch) {
        if let Some(ref text) = patch.text {
            self.text = text.clone();
        }
        if let Some(done) = patch.done {
            self.done = done;
        }
    }
}

/// Full field set for creating a todo.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoFields {
    pub text: String,
    pub done: bool,
    pub created_at: Timestamp,
}

impl TodoFields {
    /// A not-yet-done todo created at `created_at`.
    pub fn new(text: impl Into<String>, created_at: Timestamp) -> Self {
        Self {
            text: text.into(),
            done: false,
            created_at,
        }
    }
}

/// Partial field set for updating a todo.
///
/// `id` and `created_at` are immutable and cannot be patched. `text` can be
/// patched through the store and the wire `update` step, but
/// [`TodoActions`](crate::actions::TodoActions) only ever patches `done`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoPatch {
    pub text: Option<String>,
    pub done: Option<bool>,
}

impl TodoPatch {
    /// Patch that only sets the completion flag.
    pub fn done(done: bool) -> Self {
        Self {
            text: None,
            done: Some(done),
        }
    }

    /// Patch that only replaces the text.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            done: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_none() && self.done.is_none()
    }
}

/// Store statistics.
#[derive(Clone, Debug, Default)]
pub struct StoreStats {
    pub todo_count: u64,
    pub done_count: u64,
    pub sequence: Sequence,
    pub subscription_count: u64,
    pub journal_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique() {
        let a = TodoId::generate();
        let b = TodoId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
    }

    #[test]
    fn test_todo_json_shape() {
        let todo = Todo::from_fields(
            TodoId::new("a"),
            TodoFields::new("buy milk", Timestamp(1000)),
        );
        let json = serde_json::to_value(&todo).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"id": "a", "text": "buy milk", "done": false, "createdAt": 1000})
        );
    }

    #[test]
    fn test_apply_patch_leaves_unset_fields() {
        let mut todo = Todo::from_fields(
            TodoId::new("a"),
            TodoFields::new("buy milk", Timestamp(1000)),
        );
        todo.apply_patch(&TodoPatch::done(true));
        assert!(todo.done);
        assert_eq!(todo.text, "buy milk");

        todo.apply_patch(&TodoPatch::text("buy oat milk"));
        assert!(todo.done);
        assert_eq!(todo.text, "buy oat milk");
        assert_eq!(todo.created_at, Timestamp(1000));
    }

    #[test]
    fn test_sequence_next() {
        assert_eq!(Sequence(5).next(), Sequence(6));
        assert_eq!(Sequence::default(), Sequence(0));
    }
}
