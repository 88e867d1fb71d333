//! Typed errors and HTTP mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    /// Malformed filter/ops text, or a reference to a field the entity does not have.
    #[error("{0}")]
    Parse(String),
    /// Recognized but unsupported ops directive.
    #[error("{0}")]
    NotImplemented(String),
    /// Write payload supplies a load-only/ignored field, bad endpoint config, malformed body.
    #[error("{0}")]
    Validation(String),
    /// Constraint violation, connectivity failure, lock timeout.
    #[error("{0}")]
    Store(#[from] sqlx::Error),
}

impl ApiError {
    /// Error-kind label used as the key of the wire payload.
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::Parse(_) => "ParseError",
            ApiError::NotImplemented(_) => "NotImplementedError",
            ApiError::Validation(_) => "ValidationError",
            ApiError::Store(_) => "StoreError",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // Kinds differ only in the body; the status is uniformly a server error.
        let mut body = serde_json::Map::new();
        body.insert(
            self.kind().to_string(),
            serde_json::Value::String(self.to_string()),
        );
        (StatusCode::INTERNAL_SERVER_ERROR, Json(serde_json::Value::Object(body))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_labels() {
        assert_eq!(ApiError::Parse("x".into()).kind(), "ParseError");
        assert_eq!(ApiError::NotImplemented("x".into()).kind(), "NotImplementedError");
        assert_eq!(ApiError::Validation("x".into()).kind(), "ValidationError");
        assert_eq!(ApiError::Store(sqlx::Error::RowNotFound).kind(), "StoreError");
    }
}
