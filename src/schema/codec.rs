//! Per-field serialize/deserialize rules, derived from type tags.
//!
//! Most tags pass JSON values through with a type check; the custom handlers
//! (enum, binary) reshape the value. Binary columns travel as latin-1 text so
//! every byte value 0x00-0xFF survives the JSON transport exactly.

use crate::error::ApiError;
use crate::metadata::{FieldMeta, TypeTag};
use serde_json::Value;

#[derive(Clone, Debug, PartialEq)]
pub enum Codec {
    Integer,
    Float,
    Boolean,
    Text,
    Date,
    DateTime,
    Uuid,
    Json,
    /// `required` mirrors the column's nullability for the benefit of custom
    /// handlers and schema introspection; null enforcement itself happens in
    /// the descriptor's write path.
    Enum { name: String, variants: Vec<String>, required: bool },
    Binary { required: bool },
}

impl Codec {
    /// Default codec for a type tag, before custom handlers are consulted.
    pub fn default_for(tag: &TypeTag) -> Codec {
        match tag {
            TypeTag::Integer => Codec::Integer,
            TypeTag::Float => Codec::Float,
            TypeTag::Boolean => Codec::Boolean,
            TypeTag::Text => Codec::Text,
            TypeTag::Date => Codec::Date,
            TypeTag::DateTime => Codec::DateTime,
            TypeTag::Uuid => Codec::Uuid,
            TypeTag::Json => Codec::Json,
            // Reached only when the handler registry was emptied; behave sanely.
            TypeTag::Enum { name, variants } => Codec::Enum {
                name: name.clone(),
                variants: variants.clone(),
                required: true,
            },
            TypeTag::Binary => Codec::Binary { required: true },
        }
    }

    /// PostgreSQL cast appended to bind placeholders (e.g. `$1::timestamptz`)
    /// so text-encoded values bind against typed columns.
    pub fn pg_cast(&self) -> Option<String> {
        match self {
            Codec::Date => Some("date".into()),
            Codec::DateTime => Some("timestamptz".into()),
            Codec::Uuid => Some("uuid".into()),
            Codec::Json => Some("jsonb".into()),
            Codec::Binary { .. } => Some("bytea".into()),
            Codec::Enum { name, .. } => Some(name.clone()),
            _ => None,
        }
    }

    /// Whether SELECT must cast the column to text so the driver hands back a
    /// string (enum labels).
    pub fn selects_as_text(&self) -> bool {
        matches!(self, Codec::Enum { .. })
    }

    /// Validate/normalize a wire value on the write path. Null is handled by
    /// the descriptor (nullability), not here.
    pub fn decode(&self, field: &str, value: &Value) -> Result<Value, ApiError> {
        match self {
            Codec::Integer => match value {
                Value::Number(n) if n.as_i64().is_some() => Ok(value.clone()),
                _ => Err(type_error(field, "an integer")),
            },
            Codec::Float => match value {
                Value::Number(_) => Ok(value.clone()),
                _ => Err(type_error(field, "a number")),
            },
            Codec::Boolean => match value {
                Value::Bool(_) => Ok(value.clone()),
                _ => Err(type_error(field, "a boolean")),
            },
            Codec::Text | Codec::Date | Codec::DateTime => match value {
                Value::String(_) => Ok(value.clone()),
                _ => Err(type_error(field, "a string")),
            },
            Codec::Uuid => match value {
                Value::String(s) => {
                    let u = uuid::Uuid::parse_str(s)
                        .map_err(|_| type_error(field, "a UUID string"))?;
                    Ok(Value::String(u.to_string()))
                }
                _ => Err(type_error(field, "a UUID string")),
            },
            Codec::Json => Ok(value.clone()),
            Codec::Enum { variants, .. } => match value {
                Value::String(s) if variants.iter().any(|v| v == s) => Ok(value.clone()),
                Value::String(s) => Err(ApiError::Validation(format!(
                    "field '{}': '{}' is not a member of the enumeration",
                    field, s
                ))),
                _ => Err(type_error(field, "an enum member name")),
            },
            Codec::Binary { .. } => match value {
                Value::String(s) => {
                    decode_bytes(s).map_err(|_| {
                        ApiError::Validation(format!(
                            "field '{}': binary text contains characters above U+00FF",
                            field
                        ))
                    })?;
                    Ok(value.clone())
                }
                _ => Err(type_error(field, "latin-1 encoded text")),
            },
        }
    }

    /// Normalize a stored value for wire output. Storage rows already carry
    /// JSON-compatible values; this is a passthrough with enum/binary checks.
    pub fn encode(&self, field: &str, value: &Value) -> Result<Value, ApiError> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        match self {
            Codec::Enum { variants, .. } => match value {
                Value::String(s) if variants.iter().any(|v| v == s) => Ok(value.clone()),
                _ => Err(ApiError::Validation(format!(
                    "field '{}': stored value is not an enum member name",
                    field
                ))),
            },
            _ => Ok(value.clone()),
        }
    }
}

fn type_error(field: &str, expected: &str) -> ApiError {
    ApiError::Validation(format!("field '{}' must be {}", field, expected))
}

/// Lossless byte-to-text encoding: each byte maps to the Unicode code point of
/// the same value (latin-1), so round-trips are exact for 0x00-0xFF.
pub fn encode_bytes(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

/// Inverse of [`encode_bytes`]. Fails on any character above U+00FF.
pub fn decode_bytes(text: &str) -> Result<Vec<u8>, ApiError> {
    let mut out = Vec::with_capacity(text.len());
    for c in text.chars() {
        let cp = c as u32;
        if cp > 0xFF {
            return Err(ApiError::Validation(format!(
                "character U+{:04X} is outside the binary codec range",
                cp
            )));
        }
        out.push(cp as u8);
    }
    Ok(out)
}

/// One custom codec rule: claims a type tag and supplies the codec for fields
/// carrying it.
pub trait CodecHandler: Send + Sync {
    fn applies(&self, tag: &TypeTag) -> bool;
    fn codec(&self, field: &FieldMeta) -> Codec;
}

/// Enumerated columns serialize by symbolic name; required-ness mirrors the
/// column's nullability.
struct EnumHandler;

impl CodecHandler for EnumHandler {
    fn applies(&self, tag: &TypeTag) -> bool {
        matches!(tag, TypeTag::Enum { .. })
    }

    fn codec(&self, field: &FieldMeta) -> Codec {
        match &field.type_tag {
            TypeTag::Enum { name, variants } => Codec::Enum {
                name: name.clone(),
                variants: variants.clone(),
                required: !field.nullable,
            },
            _ => unreachable!("EnumHandler only claims enum tags"),
        }
    }
}

/// Blob columns serialize through the latin-1 textual codec.
struct BinaryHandler;

impl CodecHandler for BinaryHandler {
    fn applies(&self, tag: &TypeTag) -> bool {
        matches!(tag, TypeTag::Binary)
    }

    fn codec(&self, field: &FieldMeta) -> Codec {
        Codec::Binary {
            required: !field.nullable,
        }
    }
}

/// Handler registry consulted before the default tag-to-codec mapping.
pub struct CodecRegistry {
    handlers: Vec<Box<dyn CodecHandler>>,
}

impl CodecRegistry {
    pub fn with_defaults() -> Self {
        CodecRegistry {
            handlers: vec![Box::new(EnumHandler), Box::new(BinaryHandler)],
        }
    }

    pub fn register(&mut self, handler: Box<dyn CodecHandler>) {
        self.handlers.push(handler);
    }

    pub fn resolve(&self, field: &FieldMeta) -> Codec {
        for h in &self.handlers {
            if h.applies(&field.type_tag) {
                return h.codec(field);
            }
        }
        Codec::default_for(&field.type_tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn binary_round_trips_every_byte_value() {
        let all: Vec<u8> = (0u8..=255).collect();
        let text = encode_bytes(&all);
        assert_eq!(decode_bytes(&text).unwrap(), all);
    }

    #[test]
    fn binary_round_trips_high_bytes() {
        let blob = vec![0xFFu8; 16];
        let text = encode_bytes(&blob);
        assert_eq!(decode_bytes(&text).unwrap(), blob);
    }

    #[test]
    fn binary_rejects_non_latin1_text() {
        assert!(decode_bytes("caf\u{0141}").is_err());
    }

    #[test]
    fn enum_decodes_by_symbolic_name() {
        let codec = Codec::Enum {
            name: "task_type".into(),
            variants: vec!["Task".into(), "Chore".into()],
            required: true,
        };
        assert_eq!(codec.decode("type", &json!("Chore")).unwrap(), json!("Chore"));
        assert!(codec.decode("type", &json!("Nope")).is_err());
        assert!(codec.decode("type", &json!(1)).is_err());
    }

    #[test]
    fn handler_required_mirrors_nullability() {
        let reg = CodecRegistry::with_defaults();
        let tag = TypeTag::Enum {
            name: "task_type".into(),
            variants: vec!["Task".into()],
        };
        let required = reg.resolve(&FieldMeta::new("type", tag.clone()));
        let optional = reg.resolve(&FieldMeta::new("type", tag).nullable());
        assert!(matches!(required, Codec::Enum { required: true, .. }));
        assert!(matches!(optional, Codec::Enum { required: false, .. }));
    }

    #[test]
    fn integer_codec_rejects_strings() {
        assert!(Codec::Integer.decode("id", &json!("5")).is_err());
        assert_eq!(Codec::Integer.decode("id", &json!(5)).unwrap(), json!(5));
    }
}
