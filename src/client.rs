//! Client mirror: builds requests with the same generated schemas and chunk
//! semantics the server uses, so a caller's bulk create is split and stripped
//! identically on both sides. Transport is a collaborator concern; this
//! module stops at the prepared-request boundary.

use crate::dsl::{parse_filter, parse_ops};
use crate::error::ApiError;
use crate::metadata::EntityId;
use crate::resource::chunked;
use crate::schema::SchemaGenerator;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Rows per request when the client splits a bulk payload.
pub const CLIENT_CHUNK_SIZE: usize = 9999;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    Get,
    Put,
    Patch,
    Delete,
}

/// One request ready for whatever transport the caller wires up.
#[derive(Clone, Debug, PartialEq)]
pub struct PreparedRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

pub struct ClientMirror {
    schemas: Arc<SchemaGenerator>,
    chunk_size: usize,
}

impl ClientMirror {
    pub fn new(schemas: Arc<SchemaGenerator>) -> Self {
        ClientMirror {
            schemas,
            chunk_size: CLIENT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// PUT requests for a bulk create: load-only and identity fields are
    /// stripped before the payload leaves the client, one request per chunk.
    pub fn create(
        &self,
        entity: &EntityId,
        objects: &[Value],
        batched: bool,
    ) -> Result<Vec<PreparedRequest>, ApiError> {
        let desc = self.schemas.generate(entity)?;
        let stripped: Vec<Value> = objects
            .iter()
            .map(|obj| {
                let obj = as_object(obj)?;
                let kept: Map<String, Value> = obj
                    .iter()
                    .filter(|(k, _)| {
                        !desc.load_only.contains(*k)
                            && !desc.create_ignore.contains(*k)
                            && desc.field(k).map_or(true, |f| !f.primary_key)
                    })
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                Ok(Value::Object(kept))
            })
            .collect::<Result<_, ApiError>>()?;
        Ok(chunked(&stripped, self.chunk_size)
            .map(|chunk| PreparedRequest {
                method: Method::Put,
                path: format!("/{}", desc.endpoint),
                query: vec![("batched".into(), batched.to_string())],
                body: Some(Value::Array(chunk.to_vec())),
            })
            .collect())
    }

    /// PATCH requests for a bulk update; payload objects travel whole (the
    /// primary key identifies each row), load-only fields stripped.
    pub fn update(
        &self,
        entity: &EntityId,
        objects: &[Value],
        batched: bool,
    ) -> Result<Vec<PreparedRequest>, ApiError> {
        let desc = self.schemas.generate(entity)?;
        let stripped: Vec<Value> = objects
            .iter()
            .map(|obj| {
                let obj = as_object(obj)?;
                let kept: Map<String, Value> = obj
                    .iter()
                    .filter(|(k, _)| !desc.load_only.contains(*k))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                Ok(Value::Object(kept))
            })
            .collect::<Result<_, ApiError>>()?;
        Ok(chunked(&stripped, self.chunk_size)
            .map(|chunk| PreparedRequest {
                method: Method::Patch,
                path: format!("/{}", desc.endpoint),
                query: vec![("batched".into(), batched.to_string())],
                body: Some(Value::Array(chunk.to_vec())),
            })
            .collect())
    }

    /// GET request; filter/ops strings are compiled locally first so a bad
    /// expression fails before anything goes on the wire.
    pub fn get(
        &self,
        entity: &EntityId,
        filter: Option<&str>,
        ops: Option<&str>,
    ) -> Result<PreparedRequest, ApiError> {
        let desc = self.schemas.generate(entity)?;
        let meta = self.schemas.registry().entity(entity)?;
        let mut query = Vec::new();
        if let Some(f) = filter {
            parse_filter(f, meta)?;
            query.push(("filter".to_string(), f.to_string()));
        }
        if let Some(o) = ops {
            parse_ops(o, meta)?;
            query.push(("ops".to_string(), o.to_string()));
        }
        Ok(PreparedRequest {
            method: Method::Get,
            path: format!("/{}", desc.endpoint),
            query,
            body: None,
        })
    }

    pub fn delete(&self, entity: &EntityId, id: &Value) -> Result<PreparedRequest, ApiError> {
        let desc = self.schemas.generate(entity)?;
        let id_text = match id {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => {
                return Err(ApiError::Validation(
                    "delete id must be a string or number".into(),
                ))
            }
        };
        Ok(PreparedRequest {
            method: Method::Delete,
            path: format!("/{}", desc.endpoint),
            query: vec![("id".to_string(), id_text)],
            body: None,
        })
    }

    /// Interpret a server response body as serialized rows.
    pub fn parse_rows(&self, response: &Value) -> Result<Vec<Map<String, Value>>, ApiError> {
        let items = response
            .as_array()
            .ok_or_else(|| ApiError::Validation("response must be a JSON array".into()))?;
        items.iter().map(|v| as_object(v).cloned()).collect()
    }
}

fn as_object(v: &Value) -> Result<&Map<String, Value>, ApiError> {
    v.as_object()
        .ok_or_else(|| ApiError::Validation("expected a JSON object".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{EntityMeta, FieldMeta, ModelRegistry, TypeTag};
    use serde_json::json;

    fn mirror() -> ClientMirror {
        let meta = EntityMeta::new("Task", "tasks")
            .field(FieldMeta::new("id", TypeTag::Integer).primary_key())
            .field(FieldMeta::new("name", TypeTag::Text))
            .computed("duration")
            .field(FieldMeta::new("duration", TypeTag::Integer).nullable());
        let registry = Arc::new(ModelRegistry::new(vec![meta]).unwrap());
        ClientMirror::new(Arc::new(SchemaGenerator::new(registry)))
    }

    #[test]
    fn create_strips_identity_and_load_only_and_chunks() {
        let objects: Vec<Value> = (0..5)
            .map(|i| json!({"id": i, "name": format!("t{}", i), "duration": 9}))
            .collect();
        let reqs = mirror()
            .with_chunk_size(2)
            .create(&EntityId::new("Task"), &objects, false)
            .unwrap();
        assert_eq!(reqs.len(), 3);
        assert_eq!(reqs[0].method, Method::Put);
        assert_eq!(reqs[0].path, "/task");
        let first = reqs[0].body.as_ref().unwrap().as_array().unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0], json!({"name": "t0"}));
    }

    #[test]
    fn get_compiles_filter_before_sending() {
        let m = mirror();
        let req = m
            .get(&EntityId::new("Task"), Some("name = 'a'"), Some("first"))
            .unwrap();
        assert_eq!(req.method, Method::Get);
        assert_eq!(req.query.len(), 2);

        let err = m
            .get(&EntityId::new("Task"), Some("bogus > 1"), None)
            .unwrap_err();
        assert_eq!(err.kind(), "ParseError");
    }

    #[test]
    fn update_keeps_primary_keys() {
        let reqs = mirror()
            .update(&EntityId::new("Task"), &[json!({"id": 1, "name": "n"})], true)
            .unwrap();
        let body = reqs[0].body.as_ref().unwrap();
        assert_eq!(body[0]["id"], json!(1));
        assert_eq!(reqs[0].query[0], ("batched".to_string(), "true".to_string()));
    }

    #[test]
    fn delete_carries_the_id_param() {
        let req = mirror().delete(&EntityId::new("Task"), &json!(7)).unwrap();
        assert_eq!(req.method, Method::Delete);
        assert_eq!(req.query, vec![("id".to_string(), "7".to_string())]);
    }
}
