//! Unified error type for the control endpoint and startup path.
//!
//! `AppError` is the single error type returned by every Axum handler.
//! It serializes as `{ "kind": "...", "message": "..." }` so a caller can
//! programmatically distinguish error categories, and implements
//! `IntoResponse` so handlers can just return `Result<T, AppError>`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::ser::SerializeStruct;

/// Application-level error surfaced from configuration loading, persistence,
/// and the control HTTP endpoint.
///
/// Each variant maps to a distinct failure domain. Callers receive a JSON
/// object with `kind` (variant name) and `message` (human-readable description).
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Errors loading or validating `config.yml` (fatal at startup).
    #[error("{0}")]
    Config(String),

    /// I/O errors reading or writing durable state.
    #[error("{0}")]
    Io(String),

    /// Errors from the identity persistence store.
    #[error("{0}")]
    Persistence(String),

    /// Malformed or invalid control-endpoint input (HTTP 400).
    #[error("{0}")]
    InvalidInput(String),

    /// Unknown route (HTTP 404).
    #[error("{0}")]
    NotFound(String),
}

impl AppError {
    /// Returns the error kind as a string matching the variant name.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Config(_) => "Config",
            AppError::Io(_) => "Io",
            AppError::Persistence(_) => "Persistence",
            AppError::InvalidInput(_) => "InvalidInput",
            AppError::NotFound(_) => "NotFound",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Custom Serialize: produces `{ "kind": "Variant", "message": "..." }`.
impl serde::Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut s = serializer.serialize_struct("AppError", 2)?;
        s.serialize_field("kind", self.kind())?;
        s.serialize_field("message", &self.to_string())?;
        s.end()
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = serde_json::to_vec(&self).unwrap_or_else(|_| b"{}".to_vec());
        (status, [("content-type", "application/json")], body).into_response()
    }
}

// ---- From implementations for ergonomic error conversion ----

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Io(err.to_string())
    }
}

impl From<serde_yaml::Error> for AppError {
    fn from(err: serde_yaml::Error) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Persistence(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_returns_correct_variant_name() {
        assert_eq!(AppError::Config("bad yaml".into()).kind(), "Config");
        assert_eq!(AppError::Io("disk full".into()).kind(), "Io");
        assert_eq!(
            AppError::Persistence("corrupt".into()).kind(),
            "Persistence"
        );
        assert_eq!(
            AppError::InvalidInput("bad input".into()).kind(),
            "InvalidInput"
        );
        assert_eq!(AppError::NotFound("no route".into()).kind(), "NotFound");
    }

    #[test]
    fn test_error_display_shows_message() {
        let err = AppError::Config("missing listeners".into());
        assert_eq!(err.to_string(), "missing listeners");
    }

    #[test]
    fn test_error_serializes_as_kind_and_message() {
        let err = AppError::InvalidInput("username must be a string".into());
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "InvalidInput");
        assert_eq!(json["message"], "username must be a string");
    }

    #[test]
    fn test_from_io_error_produces_io_variant() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let app_err: AppError = io_err.into();
        assert_eq!(app_err.kind(), "Io");
        assert!(app_err.to_string().contains("file missing"));
    }

    #[test]
    fn test_all_variants_serialize_with_two_fields() {
        let variants: Vec<AppError> = vec![
            AppError::Config("a".into()),
            AppError::Io("b".into()),
            AppError::Persistence("c".into()),
            AppError::InvalidInput("d".into()),
            AppError::NotFound("e".into()),
        ];
        for err in variants {
            let json = serde_json::to_value(&err).unwrap();
            let obj = json.as_object().unwrap();
            assert_eq!(obj.len(), 2, "Expected exactly 2 fields for {err:?}");
            assert!(obj.contains_key("kind"));
            assert!(obj.contains_key("message"));
        }
    }
}
