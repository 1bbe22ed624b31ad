//! Error types for the session engine

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::ocpp::ErrorCode;

/// Errors surfaced by the codec, the correlation tracker and sessions
#[derive(Debug, Error)]
pub enum OcppError {
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("No response to {action} within {timeout:?}")]
    CallTimeout { action: String, timeout: Duration },

    #[error("Connection unavailable")]
    ConnectionUnavailable,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Charge point replied with {code:?}: {description}")]
    Remote {
        code: ErrorCode,
        description: String,
        details: Value,
    },
}

impl OcppError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        OcppError::MalformedEnvelope(reason.into())
    }

    /// Short machine-readable name, used by the control API error bodies
    pub fn kind(&self) -> &'static str {
        match self {
            OcppError::MalformedEnvelope(_) => "MalformedEnvelope",
            OcppError::Json(_) => "Json",
            OcppError::CallTimeout { .. } => "CallTimeout",
            OcppError::ConnectionUnavailable => "ConnectionUnavailable",
            OcppError::ConnectionClosed => "ConnectionClosed",
            OcppError::Remote { .. } => "Remote",
        }
    }
}

/// Failure returned by an inbound action handler.
///
/// Converted into a CALLERROR for the charge point; never reaches the receive loop.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{code:?}: {description}")]
pub struct HandlerError {
    pub code: ErrorCode,
    pub description: String,
}

impl HandlerError {
    pub fn new(code: ErrorCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
        }
    }

    pub fn internal(description: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, description)
    }

    pub fn not_implemented(action: &str) -> Self {
        Self::new(
            ErrorCode::NotImplemented,
            format!("Action {} is not implemented", action),
        )
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        use serde_json::error::Category;

        let code = match err.classify() {
            Category::Data if err.to_string().starts_with("missing field") => {
                ErrorCode::OccurrenceConstraintViolation
            }
            Category::Data => ErrorCode::TypeConstraintViolation,
            _ => ErrorCode::FormationViolation,
        };
        Self::new(code, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        assert_eq!(OcppError::ConnectionClosed.kind(), "ConnectionClosed");
        let timeout = OcppError::CallTimeout {
            action: "Reset".into(),
            timeout: Duration::from_secs(5),
        };
        assert_eq!(timeout.kind(), "CallTimeout");
        assert!(timeout.to_string().contains("Reset"));
    }

    #[test]
    fn test_handler_error_from_json() {
        let err = serde_json::from_str::<u32>("\"nope\"").unwrap_err();
        let handler_err = HandlerError::from(err);
        assert_eq!(handler_err.code, ErrorCode::TypeConstraintViolation);

        #[derive(Debug, serde::Deserialize)]
        #[allow(dead_code)]
        struct Needs {
            id_tag: String,
        }
        let err = serde_json::from_value::<Needs>(serde_json::json!({})).unwrap_err();
        assert_eq!(
            HandlerError::from(err).code,
            ErrorCode::OccurrenceConstraintViolation
        );
    }
}
