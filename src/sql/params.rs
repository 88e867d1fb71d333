//! Convert decoded payload values to types that sqlx can bind.

use crate::error::ApiError;
use crate::schema::codec::{decode_bytes, Codec};
use serde_json::Value;
use sqlx::encode::{Encode, IsNull};
use sqlx::postgres::{PgTypeInfo, Postgres};
use sqlx::Database;

/// A value bound to one PostgreSQL placeholder. Text-encoded values rely on
/// an explicit SQL cast (`$n::timestamptz` etc.) added by the builder.
#[derive(Clone, Debug)]
pub enum PgBindValue {
    Null,
    Bool(bool),
    I64(i64),
    F64(f64),
    String(String),
    Bytes(Vec<u8>),
    Json(Value),
}

impl PgBindValue {
    /// Convert a JSON value through the field's codec. Binary fields arrive
    /// as latin-1 text and bind as raw bytes.
    pub fn from_value(codec: &Codec, v: &Value) -> Result<Self, ApiError> {
        Ok(match (codec, v) {
            (_, Value::Null) => PgBindValue::Null,
            (Codec::Binary { .. }, Value::String(s)) => PgBindValue::Bytes(decode_bytes(s)?),
            (Codec::Json, v) => PgBindValue::Json(v.clone()),
            (_, Value::Bool(b)) => PgBindValue::Bool(*b),
            (_, Value::Number(n)) => {
                if let Some(i) = n.as_i64() {
                    PgBindValue::I64(i)
                } else {
                    PgBindValue::F64(n.as_f64().unwrap_or_default())
                }
            }
            (_, Value::String(s)) => PgBindValue::String(s.clone()),
            (_, Value::Array(_) | Value::Object(_)) => PgBindValue::Json(v.clone()),
        })
    }

    /// Conversion for filter literals, where no codec is in scope.
    pub fn from_literal(v: &Value) -> Self {
        match v {
            Value::Null => PgBindValue::Null,
            Value::Bool(b) => PgBindValue::Bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    PgBindValue::I64(i)
                } else {
                    PgBindValue::F64(n.as_f64().unwrap_or_default())
                }
            }
            Value::String(s) => PgBindValue::String(s.clone()),
            Value::Array(_) | Value::Object(_) => PgBindValue::Json(v.clone()),
        }
    }
}

impl<'q> Encode<'q, Postgres> for PgBindValue {
    fn encode_by_ref(
        &self,
        buf: &mut <Postgres as Database>::ArgumentBuffer<'q>,
    ) -> Result<IsNull, Box<dyn std::error::Error + Send + Sync>> {
        Ok(match self {
            PgBindValue::Null => <Option<i32> as Encode<Postgres>>::encode_by_ref(&None, buf)?,
            PgBindValue::Bool(b) => <bool as Encode<Postgres>>::encode_by_ref(b, buf)?,
            PgBindValue::I64(n) => <i64 as Encode<Postgres>>::encode_by_ref(n, buf)?,
            PgBindValue::F64(n) => <f64 as Encode<Postgres>>::encode_by_ref(n, buf)?,
            PgBindValue::String(s) => {
                let s_ref: &str = s.as_str();
                <&str as Encode<Postgres>>::encode_by_ref(&s_ref, buf)?
            }
            PgBindValue::Bytes(b) => {
                let b_ref: &[u8] = b.as_slice();
                <&[u8] as Encode<Postgres>>::encode_by_ref(&b_ref, buf)?
            }
            PgBindValue::Json(v) => <Value as Encode<Postgres>>::encode_by_ref(v, buf)?,
        })
    }
}

impl sqlx::Type<Postgres> for PgBindValue {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_name("TEXT")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn binary_text_binds_as_bytes() {
        let codec = Codec::Binary { required: true };
        let text = crate::schema::codec::encode_bytes(&[0x00, 0x7F, 0xFF]);
        match PgBindValue::from_value(&codec, &json!(text)).unwrap() {
            PgBindValue::Bytes(b) => assert_eq!(b, vec![0x00, 0x7F, 0xFF]),
            other => panic!("expected bytes, got {:?}", other),
        }
    }

    #[test]
    fn literals_keep_their_json_type() {
        assert!(matches!(PgBindValue::from_literal(&json!(3)), PgBindValue::I64(3)));
        assert!(matches!(PgBindValue::from_literal(&json!(true)), PgBindValue::Bool(true)));
        assert!(matches!(PgBindValue::from_literal(&json!(null)), PgBindValue::Null));
    }
}
