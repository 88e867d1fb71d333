//! Lowers descriptors, predicate trees, and ops pipelines into parameterized
//! PostgreSQL statements.

use crate::dsl::{CompareOp, OpsPipeline, Predicate};
use crate::error::ApiError;
use crate::schema::codec::Codec;
use crate::schema::descriptor::SchemaDescriptor;
use crate::sql::params::PgBindValue;
use serde_json::{Map, Value};
use std::fmt::Write;

const MAIN_ALIAS: &str = "main";

/// Quote identifier for PostgreSQL (identifiers only ever come from
/// registered metadata, quoting guards against keywords).
fn quoted(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

pub struct QueryBuf {
    pub sql: String,
    pub params: Vec<PgBindValue>,
}

impl QueryBuf {
    fn new() -> Self {
        QueryBuf {
            sql: String::new(),
            params: Vec::new(),
        }
    }

    /// Push a bind value, returning its 1-based placeholder number.
    fn push_param(&mut self, v: PgBindValue) -> usize {
        self.params.push(v);
        self.params.len()
    }
}

/// SELECT list for one descriptor: each column as-is, except enum columns as
/// `col::text` so the driver hands back the label string.
fn select_column_list(desc: &SchemaDescriptor, prefix: Option<&str>) -> String {
    desc.fields
        .iter()
        .map(|f| {
            let q = quoted(&f.name);
            let expr = match prefix {
                Some(p) => format!("{}.{}", p, q),
                None => q.clone(),
            };
            if f.codec.selects_as_text() {
                format!("{}::text AS {}", expr, q)
            } else if prefix.is_some() {
                format!("{} AS {}", expr, q)
            } else {
                expr
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn placeholder(n: usize, cast: Option<String>) -> String {
    match cast {
        Some(c) => format!("${}::{}", n, c),
        None => format!("${}", n),
    }
}

/// Lower one predicate tree node to a SQL boolean expression, binding
/// literals as parameters.
fn lower_predicate(
    desc: &SchemaDescriptor,
    prefix: Option<&str>,
    node: &Predicate,
    q: &mut QueryBuf,
) -> Result<String, ApiError> {
    match node {
        Predicate::And(parts) => join_connective(desc, prefix, parts, " AND ", q),
        Predicate::Or(parts) => join_connective(desc, prefix, parts, " OR ", q),
        Predicate::Not(inner) => {
            let inner_sql = lower_predicate(desc, prefix, inner, q)?;
            Ok(format!("NOT ({})", inner_sql))
        }
        Predicate::Compare { field, op, value } => {
            let fd = desc.field(field).ok_or_else(|| {
                ApiError::Parse(format!(
                    "entity '{}' has no field '{}'",
                    desc.entity, field
                ))
            })?;
            let col = match prefix {
                Some(p) => format!("{}.{}", p, quoted(field)),
                None => quoted(field),
            };
            let cast = fd.codec.pg_cast();
            Ok(match op {
                CompareOp::Eq if value.is_null() => format!("{} IS NULL", col),
                CompareOp::Ne if value.is_null() => format!("{} IS NOT NULL", col),
                CompareOp::Eq => binary(&col, "=", value, &fd.codec, cast, q)?,
                CompareOp::Ne => binary(&col, "<>", value, &fd.codec, cast, q)?,
                CompareOp::Lt => binary(&col, "<", value, &fd.codec, cast, q)?,
                CompareOp::Le => binary(&col, "<=", value, &fd.codec, cast, q)?,
                CompareOp::Gt => binary(&col, ">", value, &fd.codec, cast, q)?,
                CompareOp::Ge => binary(&col, ">=", value, &fd.codec, cast, q)?,
                CompareOp::In => {
                    let items = value.as_array().cloned().unwrap_or_default();
                    if items.is_empty() {
                        "FALSE".to_string()
                    } else {
                        let mut phs = Vec::with_capacity(items.len());
                        for v in &items {
                            let n = q.push_param(PgBindValue::from_value(&fd.codec, v)?);
                            phs.push(placeholder(n, cast.clone()));
                        }
                        format!("{} IN ({})", col, phs.join(", "))
                    }
                }
                CompareOp::Contains => {
                    let n = q.push_param(PgBindValue::from_literal(value));
                    format!("position(${}::text in {}::text) > 0", n, col)
                }
            })
        }
    }
}

// Comparison literals go through the field's codec so typed columns get a
// typed bind (binary filter text binds as raw bytes, not as text for the
// bytea parser to misread).
fn binary(
    col: &str,
    sql_op: &str,
    value: &Value,
    codec: &Codec,
    cast: Option<String>,
    q: &mut QueryBuf,
) -> Result<String, ApiError> {
    let n = q.push_param(PgBindValue::from_value(codec, value)?);
    Ok(format!("{} {} {}", col, sql_op, placeholder(n, cast)))
}

fn join_connective(
    desc: &SchemaDescriptor,
    prefix: Option<&str>,
    parts: &[Predicate],
    sep: &str,
    q: &mut QueryBuf,
) -> Result<String, ApiError> {
    let lowered: Result<Vec<String>, ApiError> = parts
        .iter()
        .map(|p| lower_predicate(desc, prefix, p, q))
        .collect();
    Ok(format!("({})", lowered?.join(sep)))
}

/// SELECT matching rows: optional predicate, ops-driven ORDER BY/LIMIT,
/// relationship columns embedded via scalar subqueries, optional row locks.
/// Without an explicit order the primary key orders the result.
pub fn select(
    desc: &SchemaDescriptor,
    predicate: Option<&Predicate>,
    ops: &OpsPipeline,
    locked: bool,
) -> Result<QueryBuf, ApiError> {
    let mut q = QueryBuf::new();
    let has_includes = !desc.relationships.is_empty();
    let prefix = has_includes.then_some(MAIN_ALIAS);

    let mut select_parts = vec![select_column_list(desc, prefix)];
    for rel in &desc.relationships {
        let nested = rel.nested().ok_or_else(|| {
            ApiError::Validation(format!(
                "relationship '{}' has no generated descriptor",
                rel.name
            ))
        })?;
        let rel_cols = select_column_list(&nested, None);
        let sub_from = format!(
            "{} WHERE {} = {}.{}",
            quoted(&nested.table),
            quoted(&rel.their_key),
            MAIN_ALIAS,
            quoted(&rel.our_key)
        );
        let subquery = match rel.cardinality {
            crate::metadata::Cardinality::One => format!(
                "(SELECT row_to_json(sub) FROM (SELECT {} FROM {}) sub)",
                rel_cols, sub_from
            ),
            crate::metadata::Cardinality::Many => format!(
                "(SELECT COALESCE(json_agg(row_to_json(sub)), '[]'::json) FROM (SELECT {} FROM {}) sub)",
                rel_cols, sub_from
            ),
        };
        select_parts.push(format!("{} AS {}", subquery, quoted(&rel.name)));
    }

    let mut sql = format!(
        "SELECT {} FROM {}",
        select_parts.join(", "),
        quoted(&desc.table)
    );
    if has_includes {
        let _ = write!(sql, " {}", MAIN_ALIAS);
    }
    if let Some(pred) = predicate {
        let clause = lower_predicate(desc, prefix, pred, &mut q)?;
        let _ = write!(sql, " WHERE {}", clause);
    }

    let order = if ops.order.is_empty() {
        let pk = match prefix {
            Some(p) => format!("{}.{}", p, quoted(&desc.pk().name)),
            None => quoted(&desc.pk().name),
        };
        pk
    } else {
        ops.order
            .iter()
            .map(|k| {
                let col = match prefix {
                    Some(p) => format!("{}.{}", p, quoted(&k.field)),
                    None => quoted(&k.field),
                };
                if k.descending {
                    format!("{} DESC", col)
                } else {
                    col
                }
            })
            .collect::<Vec<_>>()
            .join(", ")
    };
    let _ = write!(sql, " ORDER BY {}", order);

    let limit = if ops.first { Some(1) } else { ops.limit };
    if let Some(n) = limit {
        let _ = write!(sql, " LIMIT {}", n);
    }
    if locked {
        sql.push_str(" FOR UPDATE");
    }
    q.sql = sql;
    Ok(q)
}

/// Columns accepted by INSERT: everything except primary keys, load-only
/// fields, and the create-ignore set (those take their DB defaults).
fn insert_columns(desc: &SchemaDescriptor) -> Vec<&crate::schema::FieldDescriptor> {
    desc.fields
        .iter()
        .filter(|f| {
            !f.primary_key
                && !desc.load_only.contains(&f.name)
                && !desc.create_ignore.contains(&f.name)
        })
        .collect()
}

/// Multi-row INSERT for one chunk; absent values fall back to the column
/// DEFAULT. Returns the created rows.
pub fn insert_chunk(
    desc: &SchemaDescriptor,
    rows: &[Map<String, Value>],
) -> Result<QueryBuf, ApiError> {
    let mut q = QueryBuf::new();
    let cols = insert_columns(desc);
    let mut tuples = Vec::with_capacity(rows.len());
    for row in rows {
        let mut cells = Vec::with_capacity(cols.len());
        for f in &cols {
            match row.get(&f.name) {
                Some(v) => {
                    let n = q.push_param(PgBindValue::from_value(&f.codec, v)?);
                    cells.push(placeholder(n, f.codec.pg_cast()));
                }
                None => cells.push("DEFAULT".to_string()),
            }
        }
        tuples.push(format!("({})", cells.join(", ")));
    }
    q.sql = format!(
        "INSERT INTO {} ({}) VALUES {} RETURNING {}",
        quoted(&desc.table),
        cols.iter()
            .map(|f| quoted(&f.name))
            .collect::<Vec<_>>()
            .join(", "),
        tuples.join(", "),
        select_column_list(desc, None)
    );
    Ok(q)
}

/// Upsert-by-identity for one chunk: INSERT .. ON CONFLICT (pk) DO UPDATE.
/// Payload rows are complete objects, so each conflicting row is merged from
/// the proposed row.
pub fn upsert_chunk(
    desc: &SchemaDescriptor,
    rows: &[Map<String, Value>],
) -> Result<QueryBuf, ApiError> {
    let mut q = QueryBuf::new();
    let pk = desc.pk().clone();
    let insertable = insert_columns(desc);
    let mut cols = vec![&pk];
    cols.extend(insertable.iter().copied());

    let mut tuples = Vec::with_capacity(rows.len());
    for row in rows {
        let mut cells = Vec::with_capacity(cols.len());
        for f in &cols {
            match row.get(&f.name) {
                Some(v) => {
                    let n = q.push_param(PgBindValue::from_value(&f.codec, v)?);
                    cells.push(placeholder(n, f.codec.pg_cast()));
                }
                None => cells.push("DEFAULT".to_string()),
            }
        }
        tuples.push(format!("({})", cells.join(", ")));
    }
    let updates: Vec<String> = insertable
        .iter()
        .map(|f| format!("{} = EXCLUDED.{}", quoted(&f.name), quoted(&f.name)))
        .collect();
    q.sql = format!(
        "INSERT INTO {} ({}) VALUES {} ON CONFLICT ({}) DO UPDATE SET {} RETURNING {}",
        quoted(&desc.table),
        cols.iter()
            .map(|f| quoted(&f.name))
            .collect::<Vec<_>>()
            .join(", "),
        tuples.join(", "),
        quoted(&pk.name),
        updates.join(", "),
        select_column_list(desc, None)
    );
    Ok(q)
}

/// DELETE by primary-key equality.
pub fn delete_by_pk(desc: &SchemaDescriptor, id: &Value) -> Result<QueryBuf, ApiError> {
    let mut q = QueryBuf::new();
    let pk = desc.pk();
    let checked = pk.codec.decode(&pk.name, id)?;
    let n = q.push_param(PgBindValue::from_value(&pk.codec, &checked)?);
    q.sql = format!(
        "DELETE FROM {} WHERE {} = {}",
        quoted(&desc.table),
        quoted(&pk.name),
        placeholder(n, pk.codec.pg_cast())
    );
    Ok(q)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl::{parse_filter, parse_ops};
    use crate::metadata::{EntityId, EntityMeta, FieldMeta, ModelRegistry, TypeTag};
    use crate::schema::SchemaGenerator;
    use serde_json::json;
    use std::sync::Arc;

    fn person_desc() -> Arc<SchemaDescriptor> {
        let meta = EntityMeta::new("Person", "people")
            .field(FieldMeta::new("id", TypeTag::Integer).primary_key())
            .field(FieldMeta::new("name", TypeTag::Text))
            .field(FieldMeta::new("age", TypeTag::Integer));
        let generator = SchemaGenerator::new(Arc::new(ModelRegistry::new(vec![meta]).unwrap()));
        generator.generate(&EntityId::new("Person")).unwrap()
    }

    fn meta() -> EntityMeta {
        EntityMeta::new("Person", "people")
            .field(FieldMeta::new("id", TypeTag::Integer).primary_key())
            .field(FieldMeta::new("name", TypeTag::Text))
            .field(FieldMeta::new("age", TypeTag::Integer))
    }

    #[test]
    fn select_lowers_filter_and_ops() {
        let desc = person_desc();
        let pred = parse_filter("age >= 18 and name = 'b'", &meta()).unwrap();
        let ops = parse_ops("order by id desc, limit 1", &meta()).unwrap();
        let q = select(&desc, Some(&pred), &ops, false).unwrap();
        assert_eq!(
            q.sql,
            "SELECT \"id\", \"name\", \"age\" FROM \"people\" \
             WHERE (\"age\" >= $1 AND \"name\" = $2) ORDER BY \"id\" DESC LIMIT 1"
        );
        assert_eq!(q.params.len(), 2);
    }

    #[test]
    fn select_defaults_to_pk_order_and_locks_on_request() {
        let desc = person_desc();
        let q = select(&desc, None, &OpsPipeline::default(), true).unwrap();
        assert_eq!(
            q.sql,
            "SELECT \"id\", \"name\", \"age\" FROM \"people\" ORDER BY \"id\" FOR UPDATE"
        );
    }

    #[test]
    fn first_wins_over_limit() {
        let desc = person_desc();
        let ops = parse_ops("limit 50, first", &meta()).unwrap();
        let q = select(&desc, None, &ops, false).unwrap();
        assert!(q.sql.ends_with("LIMIT 1"));
    }

    #[test]
    fn null_equality_becomes_is_null() {
        let desc = person_desc();
        let pred = parse_filter("name = null or age != null", &meta()).unwrap();
        let q = select(&desc, Some(&pred), &OpsPipeline::default(), false).unwrap();
        assert!(q.sql.contains("\"name\" IS NULL"));
        assert!(q.sql.contains("\"age\" IS NOT NULL"));
        assert!(q.params.is_empty());
    }

    #[test]
    fn binary_filter_literals_bind_as_bytes() {
        let meta = EntityMeta::new("Blob", "blobs")
            .field(FieldMeta::new("id", TypeTag::Integer).primary_key())
            .field(FieldMeta::new("data", TypeTag::Binary));
        let generator =
            SchemaGenerator::new(Arc::new(ModelRegistry::new(vec![meta.clone()]).unwrap()));
        let desc = generator.generate(&EntityId::new("Blob")).unwrap();

        let text = crate::schema::codec::encode_bytes(&[0x00, 0x9C, 0xFF]);
        let pred = parse_filter(&format!("data = '{}'", text), &meta).unwrap();
        let q = select(&desc, Some(&pred), &OpsPipeline::default(), false).unwrap();
        assert!(q.sql.contains("\"data\" = $1::bytea"));
        assert!(
            matches!(q.params[0], PgBindValue::Bytes(ref b) if b == &[0x00, 0x9C, 0xFF])
        );
    }

    #[test]
    fn membership_binds_each_item() {
        let desc = person_desc();
        let pred = parse_filter("name in ['a', 'b', 'c']", &meta()).unwrap();
        let q = select(&desc, Some(&pred), &OpsPipeline::default(), false).unwrap();
        assert!(q.sql.contains("\"name\" IN ($1, $2, $3)"));
        assert_eq!(q.params.len(), 3);
    }

    #[test]
    fn insert_chunk_uses_defaults_for_absent_values() {
        let desc = person_desc();
        let rows = vec![
            json!({"name": "a", "age": 1}).as_object().cloned().unwrap(),
            json!({"name": "b"}).as_object().cloned().unwrap(),
        ];
        let q = insert_chunk(&desc, &rows).unwrap();
        assert_eq!(
            q.sql,
            "INSERT INTO \"people\" (\"name\", \"age\") VALUES ($1, $2), ($3, DEFAULT) \
             RETURNING \"id\", \"name\", \"age\""
        );
        assert_eq!(q.params.len(), 3);
    }

    #[test]
    fn upsert_merges_on_pk_conflict() {
        let desc = person_desc();
        let rows = vec![json!({"id": 4, "name": "a", "age": 9})
            .as_object()
            .cloned()
            .unwrap()];
        let q = upsert_chunk(&desc, &rows).unwrap();
        assert!(q.sql.contains("ON CONFLICT (\"id\") DO UPDATE SET"));
        assert!(q.sql.contains("\"name\" = EXCLUDED.\"name\""));
        assert_eq!(q.params.len(), 3);
    }

    #[test]
    fn delete_binds_pk_with_type_check() {
        let desc = person_desc();
        let q = delete_by_pk(&desc, &json!(7)).unwrap();
        assert_eq!(q.sql, "DELETE FROM \"people\" WHERE \"id\" = $1");
        assert!(delete_by_pk(&desc, &json!("not-a-number")).is_err());
    }
}
