//! Static schema declaration and validation of wire requests.
//!
//! The schema is built once when a client connects and never changes. It is
//! used to turn loosely typed JSON requests (query shapes and transaction
//! steps) into typed [`Query`] and [`Transaction`] values.

use crate::error::{Result, StoreError};
use crate::subscriptions::Query;
use crate::transaction::{Operation, StepAction, Transaction, TxStep};
use crate::types::{Timestamp, TodoFields, TodoId, TodoPatch};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Name of the todo entity.
pub const TODOS: &str = "todos";

const FIELD_TEXT: &str = "text";
const FIELD_DONE: &str = "done";
const FIELD_CREATED_AT: &str = "createdAt";

/// JSON type of an attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldType {
    String,
    Boolean,
    Number,
}

impl FieldType {
    fn matches(self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Number => value.is_number(),
        }
    }

    fn name(self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Boolean => "boolean",
            FieldType::Number => "number",
        }
    }
}

/// One declared attribute of an entity.
#[derive(Clone, Debug)]
pub struct FieldDef {
    pub name: &'static str,
    pub ty: FieldType,
    /// Must be present when the entity is created.
    pub required: bool,
    /// Can be changed after creation.
    pub mutable: bool,
}

/// Declared attributes of one entity.
#[derive(Clone, Debug)]
pub struct EntitySchema {
    pub name: &'static str,
    pub fields: Vec<FieldDef>,
}

impl EntitySchema {
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Check names and types of a field map.
    fn validate(&self, fields: &Map<String, Value>) -> Result<()> {
        for (name, value) in fields {
            let def = self.field(name).ok_or_else(|| {
                StoreError::Schema(format!("unknown attribute `{}` on `{}`", name, self.name))
            })?;
            if !def.ty.matches(value) {
                return Err(StoreError::Schema(format!(
                    "attribute `{}` on `{}` must be a {}, got {}",
                    name,
                    self.name,
                    def.ty.name(),
                    value
                )));
            }
        }
        Ok(())
    }
}

/// The full schema.
#[derive(Clone, Debug)]
pub struct Schema {
    entities: Vec<EntitySchema>,
}

impl Schema {
    /// The todo schema: `todos { text: string, done: boolean, createdAt: number }`.
    pub fn todos() -> Self {
        Self {
            entities: vec![EntitySchema {
                name: TODOS,
                fields: vec![
                    FieldDef {
                        name: FIELD_TEXT,
                        ty: FieldType::String,
                        required: true,
                        mutable: true,
                    },
                    FieldDef {
                        name: FIELD_DONE,
                        ty: FieldType::Boolean,
                        required: false,
                        mutable: true,
                    },
                    FieldDef {
                        name: FIELD_CREATED_AT,
                        ty: FieldType::Number,
                        required: true,
                        mutable: false,
                    },
                ],
            }],
        }
    }

    pub fn entity(&self, name: &str) -> Option<&EntitySchema> {
        self.entities.iter().find(|e| e.name == name)
    }

    pub fn entities(&self) -> &[EntitySchema] {
        &self.entities
    }

    fn require_entity(&self, name: &str) -> Result<&EntitySchema> {
        self.entity(name)
            .ok_or_else(|| StoreError::Schema(format!("unknown entity `{}`", name)))
    }

    /// Resolve wire steps into a typed transaction.
    ///
    /// `exists` reports whether an id is currently stored. Steps earlier in
    /// the batch are taken into account, so an `update` after a `delete` of
    /// the same id creates it again. Deletes of unknown ids are passed
    /// through and rejected when the batch is applied.
    pub fn resolve_steps<F>(&self, steps: Vec<TxStep>, exists: F) -> Result<Transaction>
    where
        F: Fn(&TodoId) -> bool,
    {
        let mut present: HashMap<TodoId, bool> = HashMap::new();
        let mut tx = Transaction::new();

        for step in steps {
            let entity = self.require_entity(&step.entity)?;
            let known = present
                .get(&step.id)
                .copied()
                .unwrap_or_else(|| exists(&step.id));

            match step.action {
                StepAction::Update(fields) => {
                    entity.validate(&fields)?;
                    let operation = if known {
                        Operation::Update {
                            id: step.id.clone(),
                            patch: Self::patch_from(entity, &fields)?,
                        }
                    } else {
                        Operation::Create {
                            id: step.id.clone(),
                            fields: Self::fields_from(entity, &fields)?,
                        }
                    };
                    present.insert(step.id, true);
                    tx.push(operation);
                }
                StepAction::Delete {} => {
                    present.insert(step.id.clone(), false);
                    tx.push(Operation::Delete { id: step.id });
                }
            }
        }

        Ok(tx)
    }

    fn fields_from(entity: &EntitySchema, fields: &Map<String, Value>) -> Result<TodoFields> {
        for def in entity.fields.iter().filter(|f| f.required) {
            if !fields.contains_key(def.name) {
                return Err(StoreError::Schema(format!(
                    "missing required attribute `{}` on new `{}`",
                    def.name, entity.name
                )));
            }
        }

        Ok(TodoFields {
            text: string_field(fields, FIELD_TEXT).unwrap_or_default(),
            done: bool_field(fields, FIELD_DONE).unwrap_or(false),
            created_at: number_field(fields, FIELD_CREATED_AT).unwrap_or_default(),
        })
    }

    fn patch_from(entity: &EntitySchema, fields: &Map<String, Value>) -> Result<TodoPatch> {
        for name in fields.keys() {
            if let Some(def) = entity.field(name) {
                if !def.mutable {
                    return Err(StoreError::Schema(format!(
                        "attribute `{}` on `{}` is immutable",
                        name, entity.name
                    )));
                }
            }
        }

        Ok(TodoPatch {
            text: string_field(fields, FIELD_TEXT),
            done: bool_field(fields, FIELD_DONE),
        })
    }

    /// Parse a query request such as `{"todos": {}}`.
    ///
    /// An optional `$.where` clause filters on `done` and `text` equality:
    /// `{"todos": {"$": {"where": {"done": true}}}}`.
    pub fn parse_query(&self, request: &Value) -> Result<Query> {
        let object = request
            .as_object()
            .ok_or_else(|| StoreError::Schema("query must be an object".into()))?;

        let mut entries = object.iter();
        let (name, shape) = match (entries.next(), entries.next()) {
            (Some(entry), None) => entry,
            _ => {
                return Err(StoreError::Schema(
                    "query must name exactly one entity".into(),
                ))
            }
        };
        let entity = self.require_entity(name)?;

        let shape = shape
            .as_object()
            .ok_or_else(|| StoreError::Schema(format!("query on `{}` must be an object", name)))?;

        let mut query = Query::all();
        for (key, value) in shape {
            if key != "$" {
                return Err(StoreError::Schema(format!(
                    "unsupported query key `{}` on `{}`",
                    key, name
                )));
            }
            let clause = value
                .get("where")
                .and_then(Value::as_object)
                .ok_or_else(|| StoreError::Schema("`$` must contain a `where` object".into()))?;
            entity.validate(clause)?;

            for (field, expected) in clause {
                query = match field.as_str() {
                    FIELD_DONE => query.where_done(expected.as_bool().unwrap_or(false)),
                    FIELD_TEXT => query.where_text(expected.as_str().unwrap_or_default()),
                    _ => {
                        return Err(StoreError::Schema(format!(
                            "cannot filter `{}` on `{}`",
                            field, name
                        )))
                    }
                };
            }
        }

        Ok(query)
    }
}

fn string_field(fields: &Map<String, Value>, name: &str) -> Option<String> {
    fields.get(name).and_then(Value::as_str).map(str::to_string)
}

fn bool_field(fields: &Map<String, Value>, name: &str) -> Option<bool> {
    fields.get(name).and_then(Value::as_bool)
}

fn number_field(fields: &Map<String, Value>, name: &str) -> Option<Timestamp> {
    let value = fields.get(name)?;
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f as i64))
        .map(Timestamp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Todo, TodoFields};
    use serde_json::json;

    fn todo(id: &str, done: bool) -> Todo {
        let mut fields = TodoFields::new(format!("todo {}", id), Timestamp(1));
        fields.done = done;
        Todo::from_fields(TodoId::new(id), fields)
    }

    #[test]
    fn test_update_on_unknown_id_creates() {
        let schema = Schema::todos();
        let tx = schema
            .resolve_steps(
                vec![TxStep::update(
                    "a",
                    json!({"text": "buy milk", "createdAt": 1000}),
                )],
                |_| false,
            )
            .unwrap();

        assert_eq!(
            tx.operations(),
            &[Operation::Create {
                id: TodoId::new("a"),
                fields: TodoFields::new("buy milk", Timestamp(1000)),
            }]
        );
    }

    #[test]
    fn test_update_on_known_id_patches() {
        let schema = Schema::todos();
        let tx = schema
            .resolve_steps(vec![TxStep::update("a", json!({"done": true}))], |_| true)
            .unwrap();

        assert_eq!(
            tx.operations(),
            &[Operation::Update {
                id: TodoId::new("a"),
                patch: TodoPatch::done(true),
            }]
        );
    }

    #[test]
    fn test_steps_see_earlier_steps() {
        let schema = Schema::todos();
        let tx = schema
            .resolve_steps(
                vec![
                    TxStep::update("a", json!({"text": "x", "createdAt": 1})),
                    TxStep::update("a", json!({"done": true})),
                    TxStep::delete("a"),
                    TxStep::update("a", json!({"text": "y", "createdAt": 2})),
                ],
                |_| false,
            )
            .unwrap();

        let kinds: Vec<_> = tx.operations().iter().map(Operation::kind).collect();
        assert_eq!(kinds, vec!["create", "update", "delete", "create"]);
    }

    #[test]
    fn test_rejects_bad_types_and_fields() {
        let schema = Schema::todos();

        let err = schema
            .resolve_steps(vec![TxStep::update("a", json!({"done": "yes"}))], |_| true)
            .unwrap_err();
        assert!(matches!(err, StoreError::Schema(_)));

        let err = schema
            .resolve_steps(vec![TxStep::update("a", json!({"priority": 1}))], |_| true)
            .unwrap_err();
        assert!(matches!(err, StoreError::Schema(_)));

        let err = schema
            .resolve_steps(vec![TxStep::update("a", json!({"text": "no timestamp"}))], |_| false)
            .unwrap_err();
        assert!(matches!(err, StoreError::Schema(_)));

        let err = schema
            .resolve_steps(vec![TxStep::update("a", json!({"createdAt": 5}))], |_| true)
            .unwrap_err();
        assert!(err.to_string().contains("immutable"));

        let mut step = TxStep::delete("a");
        step.entity = "goals".into();
        assert!(schema.resolve_steps(vec![step], |_| true).is_err());
    }

    #[test]
    fn test_parse_query_all() {
        let schema = Schema::todos();
        let query = schema.parse_query(&json!({"todos": {}})).unwrap();
        assert!(query.matches(&todo("a", true)));
        assert!(query.matches(&todo("b", false)));
    }

    #[test]
    fn test_parse_query_where() {
        let schema = Schema::todos();
        let query = schema
            .parse_query(&json!({"todos": {"$": {"where": {"done": true}}}}))
            .unwrap();
        assert!(query.matches(&todo("a", true)));
        assert!(!query.matches(&todo("b", false)));
    }

    #[test]
    fn test_parse_query_rejects_unknown_shapes() {
        let schema = Schema::todos();
        assert!(schema.parse_query(&json!([])).is_err());
        assert!(schema.parse_query(&json!({"goals": {}})).is_err());
        assert!(schema.parse_query(&json!({"todos": {}, "goals": {}})).is_err());
        assert!(schema
            .parse_query(&json!({"todos": {"$": {"where": {"createdAt": 1}}}}))
            .is_err());
    }
}
