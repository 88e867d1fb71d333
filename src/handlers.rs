//! Entity CRUD handlers: one generic set for every registered endpoint.

use crate::error::ApiError;
use crate::metadata::EntityMeta;
use crate::resource::EntityResource;
use crate::schema::descriptor::SchemaDescriptor;
use crate::schema::Codec;
use crate::state::AppState;
use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde_json::Value;
use std::collections::HashMap;

fn resolve_entity<'a>(state: &'a AppState, endpoint: &str) -> Result<&'a EntityMeta, ApiError> {
    state.registry.by_endpoint(endpoint).ok_or_else(|| {
        ApiError::Validation(format!("no entity registered for endpoint '{}'", endpoint))
    })
}

/// Parse a query-string primary key into the JSON value its codec expects.
fn parse_id(desc: &SchemaDescriptor, raw: &str) -> Result<Value, ApiError> {
    let pk = desc.pk();
    match &pk.codec {
        Codec::Integer => {
            let n: i64 = raw.parse().map_err(|_| {
                ApiError::Validation(format!("'{}' is not a valid {} id", raw, desc.entity))
            })?;
            Ok(Value::Number(n.into()))
        }
        Codec::Uuid => {
            let u = uuid::Uuid::parse_str(raw).map_err(|_| {
                ApiError::Validation(format!("'{}' is not a valid {} id", raw, desc.entity))
            })?;
            Ok(Value::String(u.to_string()))
        }
        _ => Ok(Value::String(raw.to_string())),
    }
}

fn batched_flag(params: &HashMap<String, String>) -> bool {
    params
        .get("batched")
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// `GET /<endpoint>?filter=<DSL>&ops=<comma-list>`
pub async fn read(
    State(state): State<AppState>,
    Path(endpoint): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Vec<Value>>, ApiError> {
    let meta = resolve_entity(&state, &endpoint)?;
    let rows = EntityResource::read(
        &state.pool,
        &state.schemas,
        meta,
        params.get("filter").map(String::as_str),
        params.get("ops").map(String::as_str),
    )
    .await?;
    Ok(Json(rows))
}

/// `PUT /<endpoint>?batched=<bool>` with a JSON array body.
pub async fn create(
    State(state): State<AppState>,
    Path(endpoint): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    Json(body): Json<Value>,
) -> Result<Json<Vec<Value>>, ApiError> {
    let meta = resolve_entity(&state, &endpoint)?;
    let created = EntityResource::create(
        &state.pool,
        &state.schemas,
        meta,
        &body,
        batched_flag(&params),
    )
    .await?;
    Ok(Json(created))
}

/// `PATCH /<endpoint>?batched=<bool>` with a JSON array body.
pub async fn update(
    State(state): State<AppState>,
    Path(endpoint): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    Json(body): Json<Value>,
) -> Result<Json<Vec<Value>>, ApiError> {
    let meta = resolve_entity(&state, &endpoint)?;
    let updated = EntityResource::update(
        &state.pool,
        &state.schemas,
        meta,
        &body,
        batched_flag(&params),
    )
    .await?;
    Ok(Json(updated))
}

/// `DELETE /<endpoint>?id=<pk>` -> `{"deleted": <count>}`
pub async fn delete(
    State(state): State<AppState>,
    Path(endpoint): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    let meta = resolve_entity(&state, &endpoint)?;
    let raw_id = params
        .get("id")
        .ok_or_else(|| ApiError::Validation("delete requires an 'id' parameter".into()))?;
    let desc = state.schemas.generate(&meta.id)?;
    let id = parse_id(&desc, raw_id)?;
    let deleted = EntityResource::delete(&state.pool, &state.schemas, meta, &id).await?;
    Ok(Json(serde_json::json!({ "deleted": deleted })))
}
