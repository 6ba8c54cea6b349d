use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Attachment too large: {size} bytes (max {max})")]
    AttachmentTooLarge { size: usize, max: usize },

    #[error("Attachment storage error: {0}")]
    AttachmentStorage(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::FileNotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ServerError::AttachmentTooLarge { .. } => {
                (StatusCode::PAYLOAD_TOO_LARGE, self.to_string())
            }
            ServerError::AttachmentStorage(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Attachment storage error".to_string(),
            ),
            ServerError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}
