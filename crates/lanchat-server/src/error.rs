use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use lanchat_shared::AuthError;
use lanchat_store::StoreError;
use thiserror::Error;

/// Errors surfaced by the HTTP control plane.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Attachment too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("Attachment storage error: {0}")]
    Storage(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Not logged in")]
    Unauthorized,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ServerError::TooLarge { .. } => (StatusCode::PAYLOAD_TOO_LARGE, self.to_string()),
            ServerError::Storage(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Attachment storage error".to_string(),
            ),
            ServerError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ServerError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string()),
            ServerError::Forbidden(_) => (StatusCode::FORBIDDEN, self.to_string()),
            ServerError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}

impl From<StoreError> for ServerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => ServerError::NotFound("record".into()),
            other => {
                tracing::error!(error = %other, "store failure");
                ServerError::Internal(other.to_string())
            }
        }
    }
}

impl From<HubError> for ServerError {
    fn from(err: HubError) -> Self {
        match err {
            HubError::ProtectedRoom(_) => ServerError::Forbidden(err.to_string()),
            HubError::AclDenied(_) => ServerError::Forbidden(err.to_string()),
        }
    }
}

/// Refusals from the room registry.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HubError {
    /// The room's membership set does not include the user.
    #[error("not a member of room {0}")]
    AclDenied(String),

    /// The default room cannot be renamed, deleted or restricted.
    #[error("room {0} is protected")]
    ProtectedRoom(String),
}

impl HubError {
    /// Code sent to line-protocol clients in `[SYS] ERROR <code> <room>`.
    pub fn code(&self) -> &'static str {
        match self {
            HubError::AclDenied(_) => "ACL_DENIED",
            HubError::ProtectedRoom(_) => "PROTECTED_ROOM",
        }
    }

    pub fn room(&self) -> &str {
        match self {
            HubError::AclDenied(room) | HubError::ProtectedRoom(room) => room,
        }
    }
}

/// Why a line-protocol session ended or refused a step.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("authentication rejected: {0}")]
    AuthRejected(#[from] AuthError),

    #[error(transparent)]
    Hub(#[from] HubError),
}
