//! entity-rest: expose relational entities as a generic REST CRUD API.
//!
//! Entity metadata in, three things out: a generated serialization schema per
//! entity type, a textual filter/ops language for selecting rows, and a
//! transactional CRUD engine with chunked all-or-nothing bulk writes. No
//! per-entity endpoint or serializer code required.

pub mod client;
pub mod dsl;
pub mod error;
pub mod handlers;
pub mod metadata;
pub mod resource;
pub mod routes;
pub mod schema;
pub mod sql;
pub mod state;

pub use client::{ClientMirror, Method, PreparedRequest, CLIENT_CHUNK_SIZE};
pub use dsl::{parse_filter, parse_ops, OpsPipeline, Predicate};
pub use error::ApiError;
pub use metadata::{
    Cardinality, EntityId, EntityMeta, FieldMeta, ModelRegistry, RelationshipMeta, TypeTag,
};
pub use resource::{EntityResource, CHUNK_SIZE};
pub use routes::{common_routes, entity_routes};
pub use schema::{Codec, CodecRegistry, SchemaDescriptor, SchemaGenerator, WriteMode};
pub use state::AppState;
