use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use warden_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing credential")]
    Missing,

    #[error("invalid credential: {0}")]
    Invalid(String),
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": "unauthorized", "message": self.to_string() });
        (StatusCode::UNAUTHORIZED, Json(body)).into_response()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    #[error("buffer store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind listener: {0}")]
    Bind(#[from] std::io::Error),

    #[error("no token verifier configured and auth is not disabled")]
    AuthNotConfigured,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_error_is_401() {
        let resp = AuthError::Missing.into_response();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }
}
