use thiserror::Error;
use warp::http::StatusCode;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Authentication failed: {0}")]
    Authentication(String),
    #[error("You are not a member of {0}")]
    NotAMember(String),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Connection interrupted: {0}")]
    Connectivity(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("TLS setup failed: {0}")]
    Tls(String),
}

impl ChatError {
    /// Stable machine-readable code sent to clients alongside the message.
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::Authentication(_) => "authentication_failed",
            ChatError::NotAMember(_) => "not_a_member",
            ChatError::PermissionDenied(_) => "permission_denied",
            ChatError::NotFound(_) => "not_found",
            ChatError::InvalidRequest(_) | ChatError::Serialization(_) => "invalid_request",
            ChatError::Connectivity(_) => "connectivity",
            ChatError::ConnectionClosed => "connection_closed",
            ChatError::Config(_) | ChatError::Tls(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ChatError::Authentication(_) => StatusCode::UNAUTHORIZED,
            ChatError::NotAMember(_) | ChatError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            ChatError::NotFound(_) => StatusCode::NOT_FOUND,
            ChatError::InvalidRequest(_) | ChatError::Serialization(_) => StatusCode::BAD_REQUEST,
            ChatError::Connectivity(_) | ChatError::ConnectionClosed => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ChatError::Config(_) | ChatError::Tls(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
