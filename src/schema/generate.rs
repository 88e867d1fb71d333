//! Descriptor generation: metadata in, memoized `SchemaDescriptor` out.
//!
//! Generation is guarded by one mutex over the whole cache, which gives the
//! single-writer-per-key guarantee directly: concurrent first access for the
//! same entity type serializes and converges on one shared descriptor.

use crate::error::ApiError;
use crate::metadata::{EntityId, ModelRegistry};
use crate::schema::codec::CodecRegistry;
use crate::schema::descriptor::{FieldDescriptor, RelationshipDescriptor, SchemaDescriptor};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

#[derive(Default)]
struct GenState {
    ready: HashMap<EntityId, Arc<SchemaDescriptor>>,
    /// Shared late-bound slots handed to relationship descriptors before the
    /// target descriptor exists; filled exactly once on completion.
    slots: HashMap<EntityId, Arc<OnceLock<Arc<SchemaDescriptor>>>>,
    /// Cycle guard: entity types whose generation is on the current stack.
    in_progress: HashSet<EntityId>,
}

pub struct SchemaGenerator {
    registry: Arc<ModelRegistry>,
    codecs: CodecRegistry,
    state: Mutex<GenState>,
}

impl SchemaGenerator {
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        Self::with_codecs(registry, CodecRegistry::with_defaults())
    }

    pub fn with_codecs(registry: Arc<ModelRegistry>, codecs: CodecRegistry) -> Self {
        SchemaGenerator {
            registry,
            codecs,
            state: Mutex::new(GenState::default()),
        }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Generate (or fetch the memoized) descriptor for an entity type.
    /// Idempotent: repeat calls return the same `Arc` instance.
    pub fn generate(&self, id: &EntityId) -> Result<Arc<SchemaDescriptor>, ApiError> {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let result = self.build(&mut state, id);
        if result.is_err() {
            // A failed generation must not leave stale cycle-guard markers.
            state.in_progress.clear();
        }
        result
    }

    /// Descriptor for the entity mapped to an endpoint segment, if any.
    pub fn for_endpoint(&self, segment: &str) -> Result<Arc<SchemaDescriptor>, ApiError> {
        let meta = self.registry.by_endpoint(segment).ok_or_else(|| {
            ApiError::Validation(format!("no entity registered for endpoint '{}'", segment))
        })?;
        let id = meta.id.clone();
        self.generate(&id)
    }

    fn build(
        &self,
        state: &mut GenState,
        id: &EntityId,
    ) -> Result<Arc<SchemaDescriptor>, ApiError> {
        if let Some(done) = state.ready.get(id) {
            return Ok(done.clone());
        }
        let meta = self.registry.entity(id)?.clone();
        state.in_progress.insert(id.clone());
        let own_slot = state.slots.entry(id.clone()).or_default().clone();

        let fields: Vec<FieldDescriptor> = meta
            .fields
            .iter()
            .map(|f| FieldDescriptor {
                name: f.name.clone(),
                codec: self.codecs.resolve(f),
                nullable: f.nullable,
                primary_key: f.primary_key,
            })
            .collect();

        let mut relationships = Vec::with_capacity(meta.relationships.len());
        for rel in &meta.relationships {
            let target_slot = state.slots.entry(rel.target.clone()).or_default().clone();
            // Recurse unless the target is already built or currently being
            // built somewhere below us on the stack; in the latter case the
            // shared slot is filled when that generation completes.
            if !state.ready.contains_key(&rel.target) && !state.in_progress.contains(&rel.target)
            {
                self.build(state, &rel.target)?;
            }
            relationships.push(RelationshipDescriptor {
                name: rel.name.clone(),
                cardinality: rel.cardinality,
                target: rel.target.clone(),
                our_key: rel.our_key.clone(),
                their_key: rel.their_key.clone(),
                nested: target_slot,
            });
        }

        let mut load_only: BTreeSet<String> = meta.computed.clone();
        for rel in &relationships {
            load_only.insert(rel.name.clone());
        }

        let descriptor = Arc::new(SchemaDescriptor {
            entity: meta.id.clone(),
            table: meta.table.clone(),
            endpoint: meta.id.endpoint(),
            fields,
            relationships,
            load_only,
            create_ignore: meta.create_ignore.clone(),
        });
        let _ = own_slot.set(descriptor.clone());
        state.in_progress.remove(id);
        state.ready.insert(id.clone(), descriptor.clone());
        Ok(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{Cardinality, EntityMeta, FieldMeta, RelationshipMeta, TypeTag};
    use crate::schema::descriptor::WriteMode;
    use serde_json::{json, Value};

    fn generator(entities: Vec<EntityMeta>) -> SchemaGenerator {
        SchemaGenerator::new(Arc::new(ModelRegistry::new(entities).unwrap()))
    }

    fn task_entities() -> Vec<EntityMeta> {
        vec![
            EntityMeta::new("Task", "tasks")
                .field(FieldMeta::new("id", TypeTag::Integer).primary_key())
                .field(FieldMeta::new("name", TypeTag::Text))
                .field(FieldMeta::new(
                    "type",
                    TypeTag::Enum {
                        name: "task_type".into(),
                        variants: vec!["Task".into(), "Chore".into()],
                    },
                ))
                .field(FieldMeta::new("payload", TypeTag::Binary).nullable())
                .computed("duration")
                .field(FieldMeta::new("duration", TypeTag::Integer).nullable())
                .relationship(RelationshipMeta {
                    name: "attachments".into(),
                    target: EntityId::new("Attachment"),
                    cardinality: Cardinality::Many,
                    our_key: "id".into(),
                    their_key: "task_id".into(),
                }),
            EntityMeta::new("Attachment", "attachments")
                .field(FieldMeta::new("id", TypeTag::Integer).primary_key())
                .field(
                    FieldMeta::new("task_id", TypeTag::Integer)
                        .foreign_key(EntityId::new("Task")),
                )
                .field(FieldMeta::new("location", TypeTag::Text))
                .relationship(RelationshipMeta {
                    name: "task".into(),
                    target: EntityId::new("Task"),
                    cardinality: Cardinality::One,
                    our_key: "task_id".into(),
                    their_key: "id".into(),
                }),
        ]
    }

    #[test]
    fn generation_is_memoized_and_stable() {
        let generator = generator(task_entities());
        let id = EntityId::new("Task");
        let first = generator.generate(&id).unwrap();
        let second = generator.generate(&id).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.fields, second.fields);
        assert_eq!(first.load_only, second.load_only);
    }

    #[test]
    fn mutual_cycle_terminates_with_nested_descriptors_on_both_sides() {
        let generator = generator(task_entities());
        let task = generator.generate(&EntityId::new("Task")).unwrap();
        let attachment = generator.generate(&EntityId::new("Attachment")).unwrap();

        let down = task.relationship("attachments").unwrap().nested().unwrap();
        let up = attachment.relationship("task").unwrap().nested().unwrap();
        assert_eq!(down.entity, EntityId::new("Attachment"));
        assert_eq!(up.entity, EntityId::new("Task"));
        assert!(Arc::ptr_eq(&up, &task));
    }

    #[test]
    fn self_referential_entity_terminates() {
        let generator = generator(vec![EntityMeta::new("Node", "nodes")
            .field(FieldMeta::new("id", TypeTag::Integer).primary_key())
            .field(
                FieldMeta::new("parent_id", TypeTag::Integer)
                    .nullable()
                    .foreign_key(EntityId::new("Node")),
            )
            .relationship(RelationshipMeta {
                name: "parent".into(),
                target: EntityId::new("Node"),
                cardinality: Cardinality::One,
                our_key: "parent_id".into(),
                their_key: "id".into(),
            })]);
        let node = generator.generate(&EntityId::new("Node")).unwrap();
        let nested = node.relationship("parent").unwrap().nested().unwrap();
        assert!(Arc::ptr_eq(&nested, &node));
    }

    #[test]
    fn computed_and_relationship_fields_are_load_only() {
        let generator = generator(task_entities());
        let task = generator.generate(&EntityId::new("Task")).unwrap();
        assert!(task.load_only.contains("duration"));
        assert!(task.load_only.contains("attachments"));
        assert!(!task.load_only.contains("name"));
    }

    #[test]
    fn endpoint_lookup_reaches_the_same_descriptor() {
        let generator = generator(task_entities());
        let by_id = generator.generate(&EntityId::new("Task")).unwrap();
        let by_endpoint = generator.for_endpoint("task").unwrap();
        assert!(Arc::ptr_eq(&by_id, &by_endpoint));
        assert_eq!(
            generator.for_endpoint("nope").unwrap_err().kind(),
            "ValidationError"
        );
    }

    #[test]
    fn unknown_entity_is_a_validation_error() {
        let generator = generator(task_entities());
        let err = generator.generate(&EntityId::new("Ghost")).unwrap_err();
        assert_eq!(err.kind(), "ValidationError");
    }

    #[test]
    fn round_trip_preserves_update_payloads() {
        let generator = generator(task_entities());
        let task = generator.generate(&EntityId::new("Task")).unwrap();
        let row = json!({"id": 3, "name": "write docs", "type": "Chore", "payload": null})
            .as_object()
            .cloned()
            .unwrap();
        let wire = task.serialize_row(&row).unwrap();
        // A writer strips load-only fields before sending, as the client
        // mirror does.
        let mut writable = wire.as_object().cloned().unwrap();
        writable.retain(|k, _| !task.load_only.contains(k));
        let back = task
            .deserialize(&Value::Object(writable), WriteMode::Update)
            .unwrap();
        for (k, v) in &row {
            assert_eq!(back.get(k), Some(v), "field {} drifted", k);
        }
    }

    #[test]
    fn create_rejects_identity_and_load_only_fields() {
        let generator = generator(task_entities());
        let task = generator.generate(&EntityId::new("Task")).unwrap();
        let with_pk = json!({"id": 9, "name": "x"});
        assert_eq!(
            task.deserialize(&with_pk, WriteMode::Create).unwrap_err().kind(),
            "ValidationError"
        );
        let with_computed = json!({"name": "x", "duration": 5});
        assert_eq!(
            task.deserialize(&with_computed, WriteMode::Create).unwrap_err().kind(),
            "ValidationError"
        );
        let ok = json!({"name": "x", "type": "Task"});
        assert!(task.deserialize(&ok, WriteMode::Create).is_ok());
    }

    #[test]
    fn update_requires_primary_key() {
        let generator = generator(task_entities());
        let task = generator.generate(&EntityId::new("Task")).unwrap();
        let missing = json!({"name": "x"});
        assert_eq!(
            task.deserialize(&missing, WriteMode::Update).unwrap_err().kind(),
            "ValidationError"
        );
    }

    #[test]
    fn serializes_nested_relationship_rows() {
        let generator = generator(task_entities());
        let task = generator.generate(&EntityId::new("Task")).unwrap();
        let row = json!({
            "id": 1,
            "name": "pack",
            "type": "Task",
            "attachments": [{"id": 7, "task_id": 1, "location": "here"}]
        })
        .as_object()
        .cloned()
        .unwrap();
        let wire = task.serialize_row(&row).unwrap();
        assert_eq!(wire["attachments"][0]["location"], json!("here"));
    }
}
