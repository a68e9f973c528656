//! In-memory todo table with staged, all-or-nothing batch application.

use crate::error::{Result, StoreError};
use crate::transaction::{Operation, Transaction};
use crate::types::{Sequence, Todo, TodoId};
use std::collections::HashMap;

/// Net effect of a batch on one todo.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Change {
    pub id: TodoId,
    /// Value before the batch (None = did not exist).
    pub before: Option<Todo>,
    /// Value after the batch (None = deleted).
    pub after: Option<Todo>,
}

/// A validated batch that has not been made visible yet.
#[derive(Clone, Debug)]
pub struct StagedBatch {
    pub sequence: Sequence,
    /// One entry per todo whose value actually changed, in first-touched order.
    pub changes: Vec<Change>,
}

/// Mapping from todo id to todo.
///
/// Mutation is two-phase: [`TodoTable::stage`] validates a whole transaction
/// against the current contents without touching them, and
/// [`TodoTable::commit`] makes a staged batch visible.
#[derive(Debug, Default)]
pub struct TodoTable {
    todos: HashMap<TodoId, Todo>,
    /// Sequence of the last committed batch.
    sequence: Sequence,
}

impl TodoTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &TodoId) -> Option<&Todo> {
        self.todos.get(id)
    }

    pub fn contains(&self, id: &TodoId) -> bool {
        self.todos.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.todos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.todos.is_empty()
    }

    pub fn sequence(&self) -> Sequence {
        self.sequence
    }

    pub fn iter(&self) -> impl Iterator<Item = &Todo> {
        self.todos.values()
    }

    /// All todos satisfying `predicate`, ordered by `created_at`, then id.
    pub fn snapshot_matching<F>(&self, predicate: F) -> Vec<Todo>
    where
        F: Fn(&Todo) -> bool,
    {
        let mut matching: Vec<Todo> = self
            .todos
            .values()
            .filter(|t| predicate(t))
            .cloned()
            .collect();
        matching.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        matching
    }

    /// Validate a transaction and compute its net changes.
    ///
    /// Operations are checked in order against the table as modified by the
    /// earlier operations of the same batch. The first failing operation
    /// rejects the whole batch and the table is left as it was.
    pub fn stage(&self, tx: &Transaction) -> Result<StagedBatch> {
        // id -> value after the operations seen so far (None = deleted)
        let mut overlay: HashMap<&TodoId, Option<Todo>> = HashMap::new();
        let mut touched: Vec<&TodoId> = Vec::new();

        for operation in tx.operations() {
            let id = operation.id();
            let current = match overlay.get(id) {
                Some(value) => value.as_ref(),
                None => self.todos.get(id),
            };

            let next = match operation {
                Operation::Create { fields, .. } => {
                    if current.is_some() {
                        return Err(StoreError::DuplicateId(id.clone()));
                    }
                    Some(Todo::from_fields(id.clone(), fields.clone()))
                }
                Operation::Update { patch, .. } => {
                    let mut todo = current
                        .cloned()
                        .ok_or_else(|| StoreError::NotFound(id.clone()))?;
                    todo.apply_patch(patch);
                    Some(todo)
                }
                Operation::Delete { .. } => {
                    if current.is_none() {
                        return Err(StoreError::NotFound(id.clone()));
                    }
                    None
                }
            };

            if overlay.insert(id, next).is_none() {
                touched.push(id);
            }
        }

        let changes = touched
            .into_iter()
            .filter_map(|id| {
                let before = self.todos.get(id).cloned();
                let after = overlay.remove(id).flatten();
                (before != after).then(|| Change {
                    id: id.clone(),
                    before,
                    after,
                })
            })
            .collect();

        Ok(StagedBatch {
            sequence: self.sequence.next(),
            changes,
        })
    }

    /// Make a staged batch visible.
    ///
    /// The batch must have been staged against the current state of this
    /// table; staging and committing happen under the store's write lock.
    pub fn commit(&mut self, staged: &StagedBatch) {
        for change in &staged.changes {
            match change.after {
                Some(ref todo) => {
                    self.todos.insert(change.id.clone(), todo.clone());
                }
                None => {
                    self.todos.remove(&change.id);
                }
            }
        }
        self.sequence = staged.sequence;
    }
}
