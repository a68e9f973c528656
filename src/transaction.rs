//! Transactions: ordered batches of todo operations.
//!
//! A [`Transaction`] is the unit of atomicity. Every operation in it is
//! validated against the store (including the effects of earlier operations
//! in the same batch) before any of them become visible.

use crate::types::{Sequence, Timestamp, TodoFields, TodoId, TodoPatch};
use serde::{Deserialize, Serialize};

/// A single operation on the todo table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Insert a new todo. Fails if the id already exists.
    Create { id: TodoId, fields: TodoFields },

    /// Patch an existing todo. Fails if the id does not exist.
    Update { id: TodoId, patch: TodoPatch },

    /// Remove an existing todo. Fails if the id does not exist.
    Delete { id: TodoId },
}

impl Operation {
    /// The id this operation targets.
    pub fn id(&self) -> &TodoId {
        match self {
            Operation::Create { id, .. }
            | Operation::Update { id, .. }
            | Operation::Delete { id } => id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Operation::Create { .. } => "create",
            Operation::Update { .. } => "update",
            Operation::Delete { .. } => "delete",
        }
    }
}

/// An ordered batch of operations applied atomically.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Transaction {
    operations: Vec<Operation>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a create operation.
    pub fn create(mut self, id: impl Into<TodoId>, fields: TodoFields) -> Self {
        self.operations.push(Operation::Create {
            id: id.into(),
            fields,
        });
        self
    }

    /// Add an update operation.
    pub fn update(mut self, id: impl Into<TodoId>, patch: TodoPatch) -> Self {
        self.operations.push(Operation::Update {
            id: id.into(),
            patch,
        });
        self
    }

    /// Add a delete operation.
    pub fn delete(mut self, id: impl Into<TodoId>) -> Self {
        self.operations.push(Operation::Delete { id: id.into() });
        self
    }

    pub fn push(&mut self, operation: Operation) {
        self.operations.push(operation);
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn into_operations(self) -> Vec<Operation> {
        self.operations
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

impl From<Vec<Operation>> for Transaction {
    fn from(operations: Vec<Operation>) -> Self {
        Self { operations }
    }
}

impl FromIterator<Operation> for Transaction {
    fn from_iter<I: IntoIterator<Item = Operation>>(iter: I) -> Self {
        Self {
            operations: iter.into_iter().collect(),
        }
    }
}

/// Acknowledgment for a committed transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransactionReceipt {
    /// Sequence of the committed batch. For an empty transaction this is the
    /// current head, and nothing was committed.
    pub sequence: Sequence,

    /// Number of todos whose stored value changed.
    pub changed: usize,

    pub committed_at: Timestamp,
}

/// One step of a wire-level transaction request.
///
/// Serialized as `{"entity": "todos", "id": "...", "update": {...}}` or
/// `{"entity": "todos", "id": "...", "delete": {}}`. An `update` step creates
/// the todo when its id is unknown, otherwise it patches the given fields.
/// Steps are resolved into [`Operation`]s by
/// [`Schema::resolve_steps`](crate::schema::Schema::resolve_steps).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TxStep {
    pub entity: String,
    pub id: TodoId,
    #[serde(flatten)]
    pub action: StepAction,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StepAction {
    Update(serde_json::Map<String, serde_json::Value>),
    Delete {},
}

impl TxStep {
    /// An `update` step on the `todos` entity.
    ///
    /// Non-object `fields` produce an empty field set.
    pub fn update(id: impl Into<TodoId>, fields: serde_json::Value) -> Self {
        let fields = match fields {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        Self {
            entity: crate::schema::TODOS.to_string(),
            id: id.into(),
            action: StepAction::Update(fields),
        }
    }

    /// A `delete` step on the `todos` entity.
    pub fn delete(id: impl Into<TodoId>) -> Self {
        Self {
            entity: crate::schema::TODOS.to_string(),
            id: id.into(),
            action: StepAction::Delete {},
        }
    }
}
