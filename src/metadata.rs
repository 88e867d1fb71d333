//! Entity metadata: the introspected shape of the data model the rest of the
//! crate is driven by. Supplied by the embedding application at registration
//! time and never mutated afterwards.

use crate::error::ApiError;
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Identity of one entity type, by type name (e.g. "Task").
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(pub String);

impl EntityId {
    pub fn new(name: impl Into<String>) -> Self {
        EntityId(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Deterministic endpoint segment: lower-cased type name with a trailing
    /// "schema" suffix stripped. "Task" -> "task", "TaskSchema" -> "task".
    pub fn endpoint(&self) -> String {
        let lower = self.0.to_lowercase();
        lower.strip_suffix("schema").unwrap_or(&lower).to_string()
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Storage type tag of a field; drives codec selection and SQL casts.
#[derive(Clone, Debug, PartialEq)]
pub enum TypeTag {
    Integer,
    Float,
    Boolean,
    Text,
    Date,
    DateTime,
    Uuid,
    /// Raw bytes; serialized through the lossless latin-1 textual codec.
    Binary,
    Json,
    /// Named enumerated type; serialized by symbolic name, never ordinal.
    Enum { name: String, variants: Vec<String> },
}

#[derive(Clone, Debug)]
pub struct FieldMeta {
    pub name: String,
    pub type_tag: TypeTag,
    pub nullable: bool,
    pub primary_key: bool,
    /// Target entity type when this column is a foreign key.
    pub foreign_key: Option<EntityId>,
}

impl FieldMeta {
    pub fn new(name: impl Into<String>, type_tag: TypeTag) -> Self {
        FieldMeta {
            name: name.into(),
            type_tag,
            nullable: false,
            primary_key: false,
            foreign_key: None,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn foreign_key(mut self, target: EntityId) -> Self {
        self.foreign_key = Some(target);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cardinality {
    One,
    Many,
}

#[derive(Clone, Debug)]
pub struct RelationshipMeta {
    pub name: String,
    pub target: EntityId,
    pub cardinality: Cardinality,
    /// Our column used in the join (FK for to-one; PK for to-many).
    pub our_key: String,
    /// Their column used in the join (their PK for to-one; their FK for to-many).
    pub their_key: String,
}

/// Read-only view of one entity type: ordered fields, relationships, computed
/// columns, and the write-path ignore list.
#[derive(Clone, Debug)]
pub struct EntityMeta {
    pub id: EntityId,
    pub table: String,
    pub fields: Vec<FieldMeta>,
    pub relationships: Vec<RelationshipMeta>,
    /// Derived/computed columns: serialized on read, rejected on write.
    pub computed: BTreeSet<String>,
    /// Fields rejected when creating (the PKs are always rejected on create,
    /// whether listed here or not).
    pub create_ignore: BTreeSet<String>,
}

impl EntityMeta {
    pub fn new(id: impl Into<String>, table: impl Into<String>) -> Self {
        EntityMeta {
            id: EntityId::new(id),
            table: table.into(),
            fields: Vec::new(),
            relationships: Vec::new(),
            computed: BTreeSet::new(),
            create_ignore: BTreeSet::new(),
        }
    }

    pub fn field(mut self, field: FieldMeta) -> Self {
        self.fields.push(field);
        self
    }

    pub fn relationship(mut self, rel: RelationshipMeta) -> Self {
        self.relationships.push(rel);
        self
    }

    pub fn computed(mut self, name: impl Into<String>) -> Self {
        self.computed.insert(name.into());
        self
    }

    pub fn create_ignore(mut self, name: impl Into<String>) -> Self {
        self.create_ignore.insert(name.into());
        self
    }

    pub fn is_computed(&self, field: &str) -> bool {
        self.computed.contains(field)
    }

    pub fn field_meta(&self, name: &str) -> Option<&FieldMeta> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// First primary-key column. Registration rejects entities without one.
    pub fn pk_field(&self) -> Option<&FieldMeta> {
        self.fields.iter().find(|f| f.primary_key)
    }
}

/// All registered entity types of one deployment, indexed by identity and by
/// endpoint segment.
#[derive(Debug, Default)]
pub struct ModelRegistry {
    entities: HashMap<EntityId, EntityMeta>,
    by_endpoint: HashMap<String, EntityId>,
}

impl ModelRegistry {
    /// Endpoint collision or a missing primary key is a configuration error,
    /// surfaced at registration rather than at request time.
    pub fn new(entities: Vec<EntityMeta>) -> Result<Self, ApiError> {
        let mut by_id = HashMap::new();
        let mut by_endpoint = HashMap::new();
        for meta in entities {
            if meta.pk_field().is_none() {
                return Err(ApiError::Validation(format!(
                    "entity '{}' has no primary key field",
                    meta.id
                )));
            }
            let endpoint = meta.id.endpoint();
            if endpoint.is_empty() {
                return Err(ApiError::Validation(format!(
                    "entity '{}' has no resolvable endpoint name",
                    meta.id
                )));
            }
            if let Some(other) = by_endpoint.insert(endpoint.clone(), meta.id.clone()) {
                return Err(ApiError::Validation(format!(
                    "endpoint '{}' derived for both '{}' and '{}'",
                    endpoint, other, meta.id
                )));
            }
            by_id.insert(meta.id.clone(), meta);
        }
        Ok(ModelRegistry {
            entities: by_id,
            by_endpoint,
        })
    }

    pub fn entity(&self, id: &EntityId) -> Result<&EntityMeta, ApiError> {
        self.entities
            .get(id)
            .ok_or_else(|| ApiError::Validation(format!("unknown entity type '{}'", id)))
    }

    pub fn by_endpoint(&self, segment: &str) -> Option<&EntityMeta> {
        self.by_endpoint
            .get(segment)
            .and_then(|id| self.entities.get(id))
    }

    pub fn fields(&self, id: &EntityId) -> Result<&[FieldMeta], ApiError> {
        Ok(&self.entity(id)?.fields)
    }

    pub fn relationships(&self, id: &EntityId) -> Result<&[RelationshipMeta], ApiError> {
        Ok(&self.entity(id)?.relationships)
    }

    pub fn is_computed(&self, id: &EntityId, field: &str) -> bool {
        self.entities
            .get(id)
            .map(|m| m.is_computed(field))
            .unwrap_or(false)
    }

    pub fn entity_ids(&self) -> impl Iterator<Item = &EntityId> {
        self.entities.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_meta() -> EntityMeta {
        EntityMeta::new("Task", "tasks")
            .field(FieldMeta::new("id", TypeTag::Integer).primary_key())
            .field(FieldMeta::new("name", TypeTag::Text))
    }

    #[test]
    fn endpoint_derivation_strips_suffix() {
        assert_eq!(EntityId::new("Task").endpoint(), "task");
        assert_eq!(EntityId::new("TaskSchema").endpoint(), "task");
        assert_eq!(EntityId::new("HTTPLog").endpoint(), "httplog");
    }

    #[test]
    fn registry_rejects_endpoint_collision() {
        let err = ModelRegistry::new(vec![
            task_meta(),
            EntityMeta::new("TaskSchema", "tasks2")
                .field(FieldMeta::new("id", TypeTag::Integer).primary_key()),
        ])
        .unwrap_err();
        assert_eq!(err.kind(), "ValidationError");
    }

    #[test]
    fn registry_rejects_missing_pk() {
        let err = ModelRegistry::new(vec![EntityMeta::new("Task", "tasks")
            .field(FieldMeta::new("name", TypeTag::Text))])
        .unwrap_err();
        assert_eq!(err.kind(), "ValidationError");
    }

    #[test]
    fn lookup_by_endpoint() {
        let reg = ModelRegistry::new(vec![task_meta()]).unwrap();
        assert_eq!(reg.by_endpoint("task").unwrap().table, "tasks");
        assert!(reg.by_endpoint("nope").is_none());
    }

    #[test]
    fn registry_exposes_the_metadata_contract() {
        let meta = task_meta()
            .computed("elapsed")
            .relationship(RelationshipMeta {
                name: "parts".into(),
                target: EntityId::new("Part"),
                cardinality: Cardinality::Many,
                our_key: "id".into(),
                their_key: "task_id".into(),
            });
        let part = EntityMeta::new("Part", "parts")
            .field(FieldMeta::new("id", TypeTag::Integer).primary_key())
            .field(FieldMeta::new("task_id", TypeTag::Integer).foreign_key(EntityId::new("Task")));
        let reg = ModelRegistry::new(vec![meta, part]).unwrap();
        let id = EntityId::new("Task");

        let fields = reg.fields(&id).unwrap();
        assert_eq!(fields[0].name, "id");
        assert_eq!(reg.relationships(&id).unwrap()[0].name, "parts");
        assert!(reg.is_computed(&id, "elapsed"));
        assert!(!reg.is_computed(&id, "name"));
        assert_eq!(reg.entity_ids().count(), 2);
    }
}
