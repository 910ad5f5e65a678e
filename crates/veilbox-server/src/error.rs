use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use veilbox_store::StoreError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Persistence error: {0}")]
    Persistence(#[from] StoreError),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::Forbidden(_) => (StatusCode::FORBIDDEN, self.to_string()),
            ServerError::Persistence(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Persistence error".to_string(),
            ),
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}
