//! Generated serialization contract for one entity type.

use crate::error::ApiError;
use crate::metadata::{Cardinality, EntityId};
use crate::schema::codec::Codec;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::{Arc, OnceLock};

#[derive(Clone, Debug, PartialEq)]
pub struct FieldDescriptor {
    pub name: String,
    pub codec: Codec,
    pub nullable: bool,
    pub primary_key: bool,
}

/// Relationship field embedded as a nested object (one) or list (many).
/// The nested descriptor is late-bound through a shared slot so cyclic entity
/// graphs resolve to the eventually-completed descriptor instead of recursing.
#[derive(Clone)]
pub struct RelationshipDescriptor {
    pub name: String,
    pub cardinality: Cardinality,
    pub target: EntityId,
    pub our_key: String,
    pub their_key: String,
    pub(crate) nested: Arc<OnceLock<Arc<SchemaDescriptor>>>,
}

impl RelationshipDescriptor {
    /// The target entity's descriptor. Always set once generation of the
    /// involved entity types has completed.
    pub fn nested(&self) -> Option<Arc<SchemaDescriptor>> {
        self.nested.get().cloned()
    }
}

// Manual impl: descriptors can be cyclic through the nested slot, so Debug
// prints the target identity instead of recursing.
impl std::fmt::Debug for RelationshipDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelationshipDescriptor")
            .field("name", &self.name)
            .field("cardinality", &self.cardinality)
            .field("target", &self.target)
            .field("our_key", &self.our_key)
            .field("their_key", &self.their_key)
            .field("nested", &self.nested.get().map(|d| d.entity.clone()))
            .finish()
    }
}

/// Which write path a payload is being deserialized for. Create additionally
/// rejects primary keys and the registration-time ignore list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteMode {
    Create,
    Update,
}

#[derive(Clone, Debug)]
pub struct SchemaDescriptor {
    pub entity: EntityId,
    pub table: String,
    pub endpoint: String,
    /// Ordered as in the entity metadata.
    pub fields: Vec<FieldDescriptor>,
    pub relationships: Vec<RelationshipDescriptor>,
    /// Present in serialized output, rejected on any write: computed columns
    /// and relationship fields.
    pub load_only: BTreeSet<String>,
    /// Rejected on create only.
    pub create_ignore: BTreeSet<String>,
}

impl SchemaDescriptor {
    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn relationship(&self, name: &str) -> Option<&RelationshipDescriptor> {
        self.relationships.iter().find(|r| r.name == name)
    }

    /// First primary-key field; registration guarantees one exists.
    pub fn pk(&self) -> &FieldDescriptor {
        self.fields
            .iter()
            .find(|f| f.primary_key)
            .expect("registered entity always has a primary key")
    }

    /// Serialize one storage row for the wire. Relationship columns, when the
    /// row carries them (include subqueries), are encoded with the nested
    /// descriptor.
    pub fn serialize_row(&self, row: &Map<String, Value>) -> Result<Value, ApiError> {
        let mut out = Map::with_capacity(self.fields.len() + self.relationships.len());
        for f in &self.fields {
            let stored = row.get(&f.name).unwrap_or(&Value::Null);
            out.insert(f.name.clone(), f.codec.encode(&f.name, stored)?);
        }
        for rel in &self.relationships {
            let Some(value) = row.get(&rel.name) else { continue };
            let nested = rel.nested().ok_or_else(|| {
                ApiError::Validation(format!(
                    "relationship '{}' has no generated descriptor",
                    rel.name
                ))
            })?;
            let encoded = match (rel.cardinality, value) {
                (_, Value::Null) => Value::Null,
                (Cardinality::One, Value::Object(obj)) => nested.serialize_row(obj)?,
                (Cardinality::Many, Value::Array(items)) => {
                    let mut list = Vec::with_capacity(items.len());
                    for item in items {
                        match item {
                            Value::Object(obj) => list.push(nested.serialize_row(obj)?),
                            _ => {
                                return Err(ApiError::Validation(format!(
                                    "relationship '{}' row is not an object",
                                    rel.name
                                )))
                            }
                        }
                    }
                    Value::Array(list)
                }
                _ => {
                    return Err(ApiError::Validation(format!(
                        "relationship '{}' value does not match its cardinality",
                        rel.name
                    )))
                }
            };
            out.insert(rel.name.clone(), encoded);
        }
        Ok(Value::Object(out))
    }

    pub fn serialize_rows(&self, rows: &[Map<String, Value>]) -> Result<Vec<Value>, ApiError> {
        rows.iter().map(|r| self.serialize_row(r)).collect()
    }

    /// Deserialize one inbound payload object into a column->value map.
    /// Unknown, load-only, and (on create) identity fields are hard failures.
    pub fn deserialize(
        &self,
        payload: &Value,
        mode: WriteMode,
    ) -> Result<Map<String, Value>, ApiError> {
        let obj = payload.as_object().ok_or_else(|| {
            ApiError::Validation("payload entries must be JSON objects".into())
        })?;
        let mut out = Map::with_capacity(obj.len());
        for (key, value) in obj {
            if self.load_only.contains(key) {
                return Err(ApiError::Validation(format!(
                    "field '{}' is load-only and cannot be written",
                    key
                )));
            }
            let field = self.field(key).ok_or_else(|| {
                ApiError::Validation(format!(
                    "entity '{}' has no field '{}'",
                    self.entity, key
                ))
            })?;
            if mode == WriteMode::Create
                && (field.primary_key || self.create_ignore.contains(key))
            {
                return Err(ApiError::Validation(format!(
                    "field '{}' is ignored on create and cannot be supplied",
                    key
                )));
            }
            if value.is_null() {
                if !field.nullable {
                    return Err(ApiError::Validation(format!(
                        "field '{}' is not nullable",
                        key
                    )));
                }
                out.insert(key.clone(), Value::Null);
                continue;
            }
            out.insert(key.clone(), field.codec.decode(key, value)?);
        }
        if mode == WriteMode::Update {
            let pk = self.pk();
            if !out.contains_key(&pk.name) {
                return Err(ApiError::Validation(format!(
                    "update payload must carry the primary key '{}'",
                    pk.name
                )));
            }
        }
        Ok(out)
    }
}
