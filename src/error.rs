// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// HTTP 层错误类型
use axum::extract::multipart::MultipartError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("missing `file` field in upload")]
    MissingFile,

    #[error("invalid file name: {0:?}")]
    InvalidFileName(String),

    #[error("malformed multipart body: {0}")]
    Multipart(#[from] MultipartError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pipeline error: {0:#}")]
    Pipeline(#[from] anyhow::Error),
}

pub type ServerResult<T> = Result<T, ServerError>;

impl ServerError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServerError::MissingFile | ServerError::InvalidFileName(_) => StatusCode::BAD_REQUEST,
            ServerError::Multipart(e) => e.status(),
            ServerError::Io(_) | ServerError::Pipeline(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("❌ {}", self);
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ServerError::MissingFile.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ServerError::InvalidFileName("..".into()).status(),
            StatusCode::BAD_REQUEST
        );
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        assert_eq!(ServerError::from(io).status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            ServerError::from(anyhow::anyhow!("boom")).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_into_response_keeps_status() {
        let response = ServerError::MissingFile.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
