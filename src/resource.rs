//! Transactional CRUD execution against PostgreSQL.
//!
//! Every operation owns exactly one transaction, commits only on full
//! success, and rolls back explicitly on any failure; the connection returns
//! to the pool on every exit path. Bulk writes are flushed in bounded chunks
//! so memory and lock footprint stay capped, but the transaction spans the
//! whole batch: creation and update are all-or-nothing.

use crate::dsl::{parse_filter, parse_ops};
use crate::error::ApiError;
use crate::metadata::EntityMeta;
use crate::schema::codec::encode_bytes;
use crate::schema::descriptor::{SchemaDescriptor, WriteMode};
use crate::schema::{Codec, SchemaGenerator};
use crate::sql::{self, QueryBuf};
use serde_json::{Map, Value};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

/// Rows staged per flush inside a bulk write.
pub const CHUNK_SIZE: usize = 999;

/// Bounded-size slices of a bulk payload; the last chunk may be short.
pub fn chunked<T>(items: &[T], size: usize) -> impl Iterator<Item = &[T]> {
    items.chunks(size.max(1))
}

/// Number of flushes a bulk payload of `n` rows needs.
pub fn chunk_count(n: usize, size: usize) -> usize {
    n.div_ceil(size.max(1))
}

pub struct EntityResource;

impl EntityResource {
    /// Read matching rows under row-level locks, serialized with the entity's
    /// descriptor. An empty match is an empty array, not an error.
    pub async fn read(
        pool: &PgPool,
        generator: &SchemaGenerator,
        meta: &EntityMeta,
        filter: Option<&str>,
        ops: Option<&str>,
    ) -> Result<Vec<Value>, ApiError> {
        let desc = generator.generate(&meta.id)?;
        // Compile before touching storage; DSL errors must have no side effects.
        let predicate = filter.map(|f| parse_filter(f, meta)).transpose()?;
        let pipeline = ops
            .map(|o| parse_ops(o, meta))
            .transpose()?
            .unwrap_or_default();
        let q = sql::select(&desc, predicate.as_ref(), &pipeline, true)?;
        tracing::debug!(sql = %q.sql, "query");

        let mut tx = pool.begin().await?;
        let result = async {
            let rows: Vec<PgRow> = if pipeline.first {
                bind_query(&q).fetch_optional(&mut *tx).await?.into_iter().collect()
            } else {
                bind_query(&q).fetch_all(&mut *tx).await?
            };
            let mut out = Vec::with_capacity(rows.len());
            for row in &rows {
                out.push(desc.serialize_row(&row_to_map(&desc, row))?);
            }
            Ok::<_, ApiError>(out)
        }
        .await;
        match result {
            Ok(out) => {
                tx.commit().await?;
                Ok(out)
            }
            Err(e) => {
                rollback(tx).await;
                Err(e)
            }
        }
    }

    /// Create entities from a JSON array payload. `batched` skips
    /// re-serializing the created rows and returns an empty array.
    pub async fn create(
        pool: &PgPool,
        generator: &SchemaGenerator,
        meta: &EntityMeta,
        payload: &Value,
        batched: bool,
    ) -> Result<Vec<Value>, ApiError> {
        let desc = generator.generate(&meta.id)?;
        let rows = decode_payload(&desc, payload, WriteMode::Create)?;
        tracing::info!(entity = %meta.id, count = rows.len(), "creating entities");
        let created = Self::flush_all(pool, &desc, &rows, sql::insert_chunk).await?;
        tracing::info!(entity = %meta.id, count = created.len(), "created entities");
        if batched {
            return Ok(Vec::new());
        }
        desc.serialize_rows(&created)
    }

    /// Update entities by primary key with upsert-by-identity merge
    /// semantics. Same all-or-nothing guarantee and `batched` convention as
    /// create.
    pub async fn update(
        pool: &PgPool,
        generator: &SchemaGenerator,
        meta: &EntityMeta,
        payload: &Value,
        batched: bool,
    ) -> Result<Vec<Value>, ApiError> {
        let desc = generator.generate(&meta.id)?;
        let rows = decode_payload(&desc, payload, WriteMode::Update)?;
        tracing::info!(entity = %meta.id, count = rows.len(), "updating entities");
        let updated = Self::flush_all(pool, &desc, &rows, sql::upsert_chunk).await?;
        tracing::info!(entity = %meta.id, count = updated.len(), "updated entities");
        if batched {
            return Ok(Vec::new());
        }
        desc.serialize_rows(&updated)
    }

    /// Delete rows matching a primary-key equality filter; returns the
    /// affected row count.
    pub async fn delete(
        pool: &PgPool,
        generator: &SchemaGenerator,
        meta: &EntityMeta,
        id: &Value,
    ) -> Result<u64, ApiError> {
        let desc = generator.generate(&meta.id)?;
        let q = sql::delete_by_pk(&desc, id)?;
        tracing::debug!(sql = %q.sql, "query");
        let mut tx = pool.begin().await?;
        match bind_query(&q).execute(&mut *tx).await {
            Ok(done) => {
                tx.commit().await?;
                tracing::info!(entity = %meta.id, deleted = done.rows_affected(), "deleted entities");
                Ok(done.rows_affected())
            }
            Err(e) => {
                rollback(tx).await;
                Err(e.into())
            }
        }
    }

    /// Stage and flush every chunk inside one transaction; commit only after
    /// all of them succeed.
    async fn flush_all(
        pool: &PgPool,
        desc: &SchemaDescriptor,
        rows: &[Map<String, Value>],
        build: fn(&SchemaDescriptor, &[Map<String, Value>]) -> Result<QueryBuf, ApiError>,
    ) -> Result<Vec<Map<String, Value>>, ApiError> {
        let mut tx = pool.begin().await?;
        let result = async {
            let mut out = Vec::with_capacity(rows.len());
            for chunk in chunked(rows, CHUNK_SIZE) {
                let q = build(desc, chunk)?;
                tracing::debug!(sql = %q.sql, rows = chunk.len(), "flush chunk");
                let fetched = bind_query(&q).fetch_all(&mut *tx).await?;
                out.extend(fetched.iter().map(|r| row_to_map(desc, r)));
            }
            Ok::<_, ApiError>(out)
        }
        .await;
        match result {
            Ok(out) => {
                tx.commit().await?;
                Ok(out)
            }
            Err(e) => {
                rollback(tx).await;
                Err(e)
            }
        }
    }
}

async fn rollback(tx: sqlx::Transaction<'_, sqlx::Postgres>) {
    if let Err(e) = tx.rollback().await {
        tracing::warn!(error = %e, "rollback failed");
    }
}

fn decode_payload(
    desc: &SchemaDescriptor,
    payload: &Value,
    mode: WriteMode,
) -> Result<Vec<Map<String, Value>>, ApiError> {
    let items = payload
        .as_array()
        .ok_or_else(|| ApiError::Validation("payload must be a JSON array".into()))?;
    items.iter().map(|item| desc.deserialize(item, mode)).collect()
}

fn bind_query<'a>(
    q: &'a QueryBuf,
) -> sqlx::query::Query<'a, sqlx::Postgres, sqlx::postgres::PgArguments> {
    let mut query = sqlx::query(&q.sql);
    for p in &q.params {
        query = query.bind(p.clone());
    }
    query
}

/// Extract one fetched row into a column->JSON map using the descriptor's
/// codecs; relationship columns (subquery JSON) come along verbatim.
fn row_to_map(desc: &SchemaDescriptor, row: &PgRow) -> Map<String, Value> {
    let mut map = Map::with_capacity(desc.fields.len() + desc.relationships.len());
    for f in &desc.fields {
        map.insert(f.name.clone(), cell_value(&f.codec, row, &f.name));
    }
    for rel in &desc.relationships {
        if let Ok(v) = row.try_get::<Option<Value>, _>(rel.name.as_str()) {
            map.insert(rel.name.clone(), v.unwrap_or(Value::Null));
        }
    }
    map
}

fn cell_value(codec: &Codec, row: &PgRow, name: &str) -> Value {
    match codec {
        Codec::Integer => {
            if let Ok(Some(n)) = row.try_get::<Option<i64>, _>(name) {
                return Value::Number(n.into());
            }
            if let Ok(Some(n)) = row.try_get::<Option<i32>, _>(name) {
                return Value::Number(n.into());
            }
            if let Ok(Some(n)) = row.try_get::<Option<i16>, _>(name) {
                return Value::Number(n.into());
            }
            Value::Null
        }
        Codec::Float => {
            if let Ok(Some(f)) = row.try_get::<Option<f64>, _>(name) {
                return serde_json::Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null);
            }
            if let Ok(Some(f)) = row.try_get::<Option<f32>, _>(name) {
                return serde_json::Number::from_f64(f as f64)
                    .map(Value::Number)
                    .unwrap_or(Value::Null);
            }
            Value::Null
        }
        Codec::Boolean => match row.try_get::<Option<bool>, _>(name) {
            Ok(Some(b)) => Value::Bool(b),
            _ => Value::Null,
        },
        Codec::Text | Codec::Enum { .. } => match row.try_get::<Option<String>, _>(name) {
            Ok(Some(s)) => Value::String(s),
            _ => Value::Null,
        },
        Codec::Date => match row.try_get::<Option<chrono::NaiveDate>, _>(name) {
            Ok(Some(d)) => Value::String(d.format("%Y-%m-%d").to_string()),
            _ => Value::Null,
        },
        Codec::DateTime => {
            if let Ok(Some(d)) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(name) {
                return Value::String(d.to_rfc3339());
            }
            if let Ok(Some(d)) = row.try_get::<Option<chrono::NaiveDateTime>, _>(name) {
                return Value::String(d.format("%Y-%m-%dT%H:%M:%S%.f").to_string());
            }
            Value::Null
        }
        Codec::Uuid => match row.try_get::<Option<uuid::Uuid>, _>(name) {
            Ok(Some(u)) => Value::String(u.to_string()),
            _ => Value::Null,
        },
        Codec::Binary { .. } => match row.try_get::<Option<Vec<u8>>, _>(name) {
            Ok(Some(b)) => Value::String(encode_bytes(&b)),
            _ => Value::Null,
        },
        Codec::Json => match row.try_get::<Option<Value>, _>(name) {
            Ok(Some(v)) => v,
            _ => Value::Null,
        },
    }
}
