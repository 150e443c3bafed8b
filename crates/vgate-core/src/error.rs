//! Gateway error taxonomy and wire-envelope translation.
//!
//! Every component in this crate raises [`Error`] variants; translation to
//! the user-visible [`ErrorEnvelope`] happens exactly once, at the server
//! boundary (JSON body or terminal SSE event). Nothing downstream of the
//! translator re-interprets an envelope.

use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;

pub type Result<T> = std::result::Result<T, Error>;

/// Closed set of gateway failure kinds.
///
/// Each variant is bound to a stable machine-readable code and an HTTP
/// status; see [`Error::domain_code`] and [`Error::http_status`].
#[derive(Debug, ThisError)]
pub enum Error {
    #[error("Authentication failed: {0}")]
    Authentication(String),
    #[error("Incorrect API key: {0}")]
    IncorrectApiKey(String),
    #[error("Bad parameters: {0}")]
    BadParams(String),
    #[error("Bad upstream response: {0}")]
    BadResponse(String),
    #[error("Billing limit reached: {0}")]
    BillLimit(String),
    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),
    #[error("Model not found: {0}")]
    ModelNotFound(String),
    #[error("Model not started: {0}")]
    ModelNotStarted(String),
    #[error("Model load failed: {0}")]
    ModelLoad(String),
    #[error("Generation failed: {0}")]
    ModelGenerate(String),
    #[error("Model manager not loaded: {0}")]
    ManagerNotLoaded(String),
    #[error("Group already exists: {0}")]
    GroupExists(String),
    #[error("Group not found: {0}")]
    GroupNotFound(String),
    #[error("Upstream connection failed: {0}")]
    ApiConnection(String),
    #[error("Upstream request timed out: {0}")]
    ApiTimeout(String),
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable machine-readable code for this failure kind.
    pub fn domain_code(&self) -> &'static str {
        match self {
            Error::Authentication(_) => "AUTHENTICATION_ERROR",
            Error::IncorrectApiKey(_) => "INCORRECT_API_KEY",
            Error::BadParams(_) => "BAD_PARAMS",
            Error::BadResponse(_) => "BAD_RESPONSE",
            Error::BillLimit(_) => "BILL_LIMIT",
            Error::RateLimit(_) => "RATE_LIMIT",
            Error::ModelNotFound(_) => "MODEL_NOT_FOUND",
            Error::ModelNotStarted(_) => "MODEL_NOT_STARTED",
            Error::ModelLoad(_) => "MODEL_LOAD_ERROR",
            Error::ModelGenerate(_) => "MODEL_GENERATE_ERROR",
            Error::ManagerNotLoaded(_) => "MANAGER_NOT_LOADED",
            Error::GroupExists(_) => "GROUP_EXISTS",
            Error::GroupNotFound(_) => "GROUP_NOT_FOUND",
            Error::ApiConnection(_) => "API_CONNECTION_ERROR",
            Error::ApiTimeout(_) => "API_TIMEOUT",
            Error::Internal(_) => "INTERNAL_SERVER_ERROR",
        }
    }

    /// HTTP status paired with this failure kind.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::Authentication(_) | Error::IncorrectApiKey(_) => 401,
            Error::BadParams(_) => 400,
            Error::BillLimit(_) => 402,
            Error::ModelNotFound(_) | Error::GroupNotFound(_) => 404,
            Error::ModelNotStarted(_) | Error::GroupExists(_) => 409,
            Error::RateLimit(_) => 429,
            Error::ModelLoad(_) | Error::ModelGenerate(_) | Error::Internal(_) => 500,
            Error::BadResponse(_) | Error::ApiConnection(_) => 502,
            Error::ManagerNotLoaded(_) => 503,
            Error::ApiTimeout(_) => 504,
        }
    }

    /// Translate this failure into the uniform wire envelope.
    pub fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            status_code: self.http_status(),
            code: self.domain_code().to_string(),
            msg: self.to_string(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => Error::ApiTimeout(err.to_string()),
            std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::ConnectionReset => {
                Error::ApiConnection(err.to_string())
            }
            _ => Error::Internal(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::BadResponse(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::BadParams(err.to_string())
    }
}

/// Uniform `{status_code, code, msg}` failure representation.
///
/// This is the only error shape that crosses the wire, for both JSON error
/// bodies and terminal SSE events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub status_code: u16,
    pub code: String,
    pub msg: String,
}

impl ErrorEnvelope {
    /// Envelope for failures that never passed through the taxonomy.
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into()).envelope()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_stable_codes_and_statuses() {
        let cases = [
            (Error::Authentication("x".into()), 401, "AUTHENTICATION_ERROR"),
            (Error::IncorrectApiKey("x".into()), 401, "INCORRECT_API_KEY"),
            (Error::BadParams("x".into()), 400, "BAD_PARAMS"),
            (Error::BadResponse("x".into()), 502, "BAD_RESPONSE"),
            (Error::BillLimit("x".into()), 402, "BILL_LIMIT"),
            (Error::RateLimit("x".into()), 429, "RATE_LIMIT"),
            (Error::ModelNotFound("x".into()), 404, "MODEL_NOT_FOUND"),
            (Error::ModelNotStarted("x".into()), 409, "MODEL_NOT_STARTED"),
            (Error::ModelLoad("x".into()), 500, "MODEL_LOAD_ERROR"),
            (Error::ModelGenerate("x".into()), 500, "MODEL_GENERATE_ERROR"),
            (Error::ManagerNotLoaded("x".into()), 503, "MANAGER_NOT_LOADED"),
            (Error::GroupExists("x".into()), 409, "GROUP_EXISTS"),
            (Error::GroupNotFound("x".into()), 404, "GROUP_NOT_FOUND"),
            (Error::ApiConnection("x".into()), 502, "API_CONNECTION_ERROR"),
            (Error::ApiTimeout("x".into()), 504, "API_TIMEOUT"),
            (Error::Internal("x".into()), 500, "INTERNAL_SERVER_ERROR"),
        ];
        for (err, status, code) in cases {
            assert_eq!(err.http_status(), status, "{code}");
            assert_eq!(err.domain_code(), code);
        }
    }

    #[test]
    fn envelope_carries_status_code_and_message() {
        let envelope = Error::ModelGenerate("backend exploded".into()).envelope();
        assert_eq!(envelope.status_code, 500);
        assert_eq!(envelope.code, "MODEL_GENERATE_ERROR");
        assert!(envelope.msg.contains("backend exploded"));
    }

    #[test]
    fn envelope_serializes_wire_shape() {
        let json = serde_json::to_value(Error::ModelNotFound("m1".into()).envelope()).unwrap();
        assert_eq!(json["status_code"], 404);
        assert_eq!(json["code"], "MODEL_NOT_FOUND");
        assert!(json["msg"].as_str().unwrap().contains("m1"));
    }

    #[test]
    fn io_timeouts_fold_into_api_timeout() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow").into();
        assert_eq!(err.domain_code(), "API_TIMEOUT");
        let err: Error =
            std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "down").into();
        assert_eq!(err.domain_code(), "API_CONNECTION_ERROR");
    }
}
