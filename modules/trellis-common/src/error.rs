use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coded errors exposed on the operation state and the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "E_ENDPOINT_NOT_FOUND")]
    EndpointNotFound,
    #[serde(rename = "E_ENDPOINT_UNREACHABLE")]
    EndpointUnreachable,
    #[serde(rename = "E_AUTH_INVALID")]
    AuthInvalid,
    #[serde(rename = "E_TIMEOUT")]
    Timeout,
    #[serde(rename = "E_STAGING_UNAVAILABLE")]
    StagingUnavailable,
    #[serde(rename = "E_UNKNOWN")]
    Unknown,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::EndpointNotFound => "E_ENDPOINT_NOT_FOUND",
            ErrorCode::EndpointUnreachable => "E_ENDPOINT_UNREACHABLE",
            ErrorCode::AuthInvalid => "E_AUTH_INVALID",
            ErrorCode::Timeout => "E_TIMEOUT",
            ErrorCode::StagingUnavailable => "E_STAGING_UNAVAILABLE",
            ErrorCode::Unknown => "E_UNKNOWN",
        }
    }

    /// Default retryability when nothing more specific is known.
    pub fn default_retryable(&self) -> bool {
        match self {
            ErrorCode::EndpointNotFound => false,
            ErrorCode::EndpointUnreachable => true,
            ErrorCode::AuthInvalid => false,
            ErrorCode::Timeout => true,
            ErrorCode::StagingUnavailable => true,
            ErrorCode::Unknown => true,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coded error detail surfaced on operation state. No stack traces cross
/// this boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetail {
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
}

impl ErrorDetail {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retryable: code.default_retryable(),
        }
    }

    pub fn non_retryable(mut self) -> Self {
        self.retryable = false;
        self
    }
}

#[derive(Error, Debug)]
pub enum TrellisError {
    #[error("endpoint template not registered: {0}")]
    EndpointNotFound(String),

    #[error("endpoint unreachable: {0}")]
    EndpointUnreachable(String),

    #[error("authentication failed: {0}")]
    AuthInvalid(String),

    #[error("deadline exceeded: {0}")]
    Timeout(String),

    #[error("staging provider unavailable: {message}")]
    StagingUnavailable { message: String, retryable: bool },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("data error: {0}")]
    Data(String),

    #[error("embedding error: {0}")]
    Embedding(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl TrellisError {
    pub fn code(&self) -> ErrorCode {
        match self {
            TrellisError::EndpointNotFound(_) => ErrorCode::EndpointNotFound,
            TrellisError::EndpointUnreachable(_) => ErrorCode::EndpointUnreachable,
            TrellisError::AuthInvalid(_) => ErrorCode::AuthInvalid,
            TrellisError::Timeout(_) => ErrorCode::Timeout,
            TrellisError::StagingUnavailable { .. } => ErrorCode::StagingUnavailable,
            TrellisError::Config(_) => ErrorCode::Unknown,
            TrellisError::Data(_) => ErrorCode::Unknown,
            TrellisError::Embedding(_) => ErrorCode::Unknown,
            TrellisError::Anyhow(_) => ErrorCode::Unknown,
        }
    }

    pub fn retryable(&self) -> bool {
        match self {
            TrellisError::StagingUnavailable { retryable, .. } => *retryable,
            TrellisError::Config(_) => false,
            TrellisError::Data(_) => false,
            TrellisError::Embedding(_) => false,
            other => other.code().default_retryable(),
        }
    }

    pub fn detail(&self) -> ErrorDetail {
        ErrorDetail {
            code: self.code(),
            message: self.to_string(),
            retryable: self.retryable(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_serialize_to_wire_names() {
        let json = serde_json::to_string(&ErrorCode::EndpointUnreachable).unwrap();
        assert_eq!(json, "\"E_ENDPOINT_UNREACHABLE\"");
        let code: ErrorCode = serde_json::from_str("\"E_TIMEOUT\"").unwrap();
        assert_eq!(code, ErrorCode::Timeout);
    }

    #[test]
    fn retryability_defaults() {
        assert!(ErrorCode::Timeout.default_retryable());
        assert!(ErrorCode::EndpointUnreachable.default_retryable());
        assert!(!ErrorCode::AuthInvalid.default_retryable());
        assert!(!ErrorCode::EndpointNotFound.default_retryable());
    }

    #[test]
    fn staging_unavailable_carries_explicit_retryability() {
        let e = TrellisError::StagingUnavailable {
            message: "provider 'objectstore' not registered".to_string(),
            retryable: false,
        };
        assert_eq!(e.code(), ErrorCode::StagingUnavailable);
        assert!(!e.retryable());
    }

    #[test]
    fn data_errors_are_not_retryable() {
        let e = TrellisError::Data("iterator corruption".to_string());
        assert_eq!(e.code(), ErrorCode::Unknown);
        assert!(!e.retryable());
    }
}
