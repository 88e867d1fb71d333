//! Post-filter operations pipeline: a comma-separated directive list applied
//! after the filter, left to right.

use crate::error::ApiError;
use crate::metadata::EntityMeta;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SortKey {
    pub field: String,
    pub descending: bool,
}

/// Compiled directive sequence. `first` short-circuits to a single-row fetch
/// and terminates pipeline evaluation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OpsPipeline {
    pub order: Vec<SortKey>,
    pub limit: Option<u64>,
    pub first: bool,
}

/// Compile an ops string (`order by id desc, limit 1, first`) against an
/// entity's metadata.
pub fn parse_ops(input: &str, meta: &EntityMeta) -> Result<OpsPipeline, ApiError> {
    let mut pipeline = OpsPipeline::default();
    for directive in input.split(',') {
        let words: Vec<&str> = directive.split_whitespace().collect();
        match words.as_slice() {
            [] => {
                return Err(ApiError::Parse("empty ops directive".into()));
            }
            [order, by, rest @ ..]
                if order.eq_ignore_ascii_case("order") && by.eq_ignore_ascii_case("by") =>
            {
                let (field, descending) = match rest {
                    [field] => (*field, false),
                    [field, modifier]
                        if modifier.eq_ignore_ascii_case("desc")
                            || modifier.eq_ignore_ascii_case("descending") =>
                    {
                        (*field, true)
                    }
                    _ => {
                        return Err(ApiError::Parse(format!(
                            "malformed order directive '{}'",
                            directive.trim()
                        )))
                    }
                };
                if meta.field_meta(field).is_none() {
                    return Err(ApiError::Parse(format!(
                        "entity '{}' has no field '{}'",
                        meta.id, field
                    )));
                }
                pipeline.order.push(SortKey {
                    field: field.to_string(),
                    descending,
                });
            }
            [limit, n] if limit.eq_ignore_ascii_case("limit") => {
                let n: u64 = n.parse().map_err(|_| {
                    ApiError::Parse(format!("limit takes a non-negative integer, got '{}'", n))
                })?;
                pipeline.limit = Some(n);
            }
            [first] if first.eq_ignore_ascii_case("first") => {
                pipeline.first = true;
                // `first` terminates pipeline evaluation.
                break;
            }
            _ => {
                return Err(ApiError::NotImplemented(format!(
                    "ops directive '{}' is not implemented",
                    directive.trim()
                )))
            }
        }
    }
    Ok(pipeline)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{EntityMeta, FieldMeta, TypeTag};

    fn task() -> EntityMeta {
        EntityMeta::new("Task", "tasks")
            .field(FieldMeta::new("id", TypeTag::Integer).primary_key())
            .field(FieldMeta::new("name", TypeTag::Text))
    }

    #[test]
    fn order_limit_first() {
        let ops = parse_ops("order by id desc, limit 1", &task()).unwrap();
        assert_eq!(
            ops.order,
            vec![SortKey { field: "id".into(), descending: true }]
        );
        assert_eq!(ops.limit, Some(1));
        assert!(!ops.first);

        let ops = parse_ops("order by name, first", &task()).unwrap();
        assert!(!ops.order[0].descending);
        assert!(ops.first);
    }

    #[test]
    fn first_terminates_evaluation() {
        // The directive after `first` would otherwise be rejected.
        let ops = parse_ops("first, frobnicate everything", &task()).unwrap();
        assert!(ops.first);
    }

    #[test]
    fn unknown_directive_is_not_implemented() {
        let err = parse_ops("group by id", &task()).unwrap_err();
        assert_eq!(err.kind(), "NotImplementedError");
    }

    #[test]
    fn bad_limit_and_unknown_field_are_parse_errors() {
        assert_eq!(parse_ops("limit -1", &task()).unwrap_err().kind(), "ParseError");
        assert_eq!(parse_ops("limit many", &task()).unwrap_err().kind(), "ParseError");
        assert_eq!(
            parse_ops("order by bogus", &task()).unwrap_err().kind(),
            "ParseError"
        );
    }
}
