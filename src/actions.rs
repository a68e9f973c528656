//! User-level todo actions.
//!
//! Each action becomes exactly one transaction on the store. Actions that
//! depend on current state (toggle, clear completed) read it under the same
//! write lock the transaction is applied with.

use crate::error::{Result, StoreError};
use crate::store::Store;
use crate::transaction::{Operation, Transaction, TransactionReceipt};
use crate::types::{Timestamp, Todo, TodoFields, TodoId, TodoPatch};
use std::sync::Arc;
use tracing::debug;

/// Translates add / toggle / delete / clear-completed into transactions.
#[derive(Clone)]
pub struct TodoActions {
    store: Arc<Store>,
}

impl TodoActions {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Add a todo with a fresh id, stamped with the current time.
    ///
    /// Text that is empty after trimming is ignored and `None` is returned.
    /// The text is stored as given, untrimmed.
    pub fn add(&self, text: &str) -> Result<Option<Todo>> {
        if text.trim().is_empty() {
            return Ok(None);
        }
        self.add_with(TodoId::generate(), text, Timestamp::now())
            .map(Some)
    }

    /// Add a todo with a caller-chosen id and timestamp.
    pub fn add_with(
        &self,
        id: TodoId,
        text: impl Into<String>,
        created_at: Timestamp,
    ) -> Result<Todo> {
        let fields = TodoFields::new(text, created_at);
        let todo = Todo::from_fields(id.clone(), fields.clone());
        self.store.apply(Transaction::new().create(id, fields))?;
        Ok(todo)
    }

    /// Flip the completion flag. Returns the new value.
    pub fn toggle(&self, id: &TodoId) -> Result<bool> {
        let mut done = false;
        self.store.apply_with(|table| {
            let current = table
                .get(id)
                .ok_or_else(|| StoreError::NotFound(id.clone()))?;
            done = !current.done;
            Ok(Transaction::new().update(id.clone(), TodoPatch::done(done)))
        })?;
        Ok(done)
    }

    /// Delete one todo.
    pub fn delete(&self, id: &TodoId) -> Result<TransactionReceipt> {
        self.store.apply(Transaction::new().delete(id.clone()))
    }

    /// Delete every todo that is done at call time, in one batch.
    ///
    /// Returns the deleted ids. With nothing to delete no batch is committed.
    pub fn delete_completed(&self) -> Result<Vec<TodoId>> {
        let mut deleted = Vec::new();
        self.store.apply_with(|table| {
            deleted = table
                .snapshot_matching(|t| t.done)
                .into_iter()
                .map(|t| t.id)
                .collect();
            Ok(deleted
                .iter()
                .map(|id| Operation::Delete { id: id.clone() })
                .collect())
        })?;
        debug!(count = deleted.len(), "cleared completed todos");
        Ok(deleted)
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriptions::Query;

    fn actions() -> TodoActions {
        TodoActions::new(Arc::new(Store::in_memory()))
    }

    #[test]
    fn test_add_ignores_blank_text() {
        let actions = actions();
        assert!(actions.add("   ").unwrap().is_none());
        assert!(actions.add("").unwrap().is_none());
        assert_eq!(actions.store().stats().todo_count, 0);
    }

    #[test]
    fn test_add_keeps_text_untrimmed() {
        let actions = actions();
        let todo = actions.add("  buy milk ").unwrap().unwrap();
        assert_eq!(todo.text, "  buy milk ");
        assert!(!todo.done);
        assert_eq!(actions.store().get(&todo.id), Some(todo));
    }

    #[test]
    fn test_toggle_twice_restores() {
        let actions = actions();
        let id = TodoId::new("a");
        actions.add_with(id.clone(), "buy milk", Timestamp(1000)).unwrap();

        assert!(actions.toggle(&id).unwrap());
        assert!(actions.store().get(&id).unwrap().done);
        assert!(!actions.toggle(&id).unwrap());
        assert!(!actions.store().get(&id).unwrap().done);
    }

    #[test]
    fn test_toggle_missing() {
        let actions = actions();
        let result = actions.toggle(&TodoId::new("ghost"));
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_delete_completed_only_touches_done() {
        let actions = actions();
        for (id, ts) in [("a", 1), ("b", 2), ("c", 3)] {
            actions.add_with(TodoId::new(id), id, Timestamp(ts)).unwrap();
        }
        actions.toggle(&TodoId::new("a")).unwrap();
        actions.toggle(&TodoId::new("c")).unwrap();

        let mut deleted = actions.delete_completed().unwrap();
        deleted.sort();
        assert_eq!(deleted, vec![TodoId::new("a"), TodoId::new("c")]);

        let left = actions.store().snapshot_matching(&Query::all());
        assert_eq!(left.ids(), vec![&TodoId::new("b")]);
    }

    #[test]
    fn test_actions_only_change_done() {
        let actions = actions();
        let id = TodoId::new("a");
        let original = actions.add_with(id.clone(), " buy milk ", Timestamp(1000)).unwrap();
        actions.add_with(TodoId::new("b"), "walk dog", Timestamp(2000)).unwrap();

        let changed = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&changed);
        let _live = actions
            .store()
            .subscribe(Query::all(), move |result| sink.lock().push(result.clone()))
            .unwrap();

        actions.toggle(&id).unwrap();
        actions.toggle(&id).unwrap();
        actions.delete(&TodoId::new("b")).unwrap();
        actions.delete_completed().unwrap();

        for result in changed.lock().iter() {
            if let Some(todo) = result.get(&id) {
                assert_eq!(todo.text, original.text);
                assert_eq!(todo.created_at, original.created_at);
            }
        }
        assert_eq!(actions.store().get(&id), Some(original));
    }

    #[test]
    fn test_delete_completed_with_nothing_done() {
        let actions = actions();
        actions.add_with(TodoId::new("a"), "x", Timestamp(1)).unwrap();
        let before = actions.store().sequence();

        assert!(actions.delete_completed().unwrap().is_empty());
        assert_eq!(actions.store().sequence(), before);
    }
}
