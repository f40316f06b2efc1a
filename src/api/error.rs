use axum::{
    extract::multipart::MultipartError,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Failures of `/predict`, rendered as `{"error": "..."}`
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Modelo não está carregado")]
    ModelNotLoaded,

    #[error("Nenhum arquivo enviado")]
    NoFile,

    #[error("Nome de arquivo inválido")]
    InvalidFilename,

    #[error("{}", .0.body_text())]
    Multipart(#[from] MultipartError),

    #[error("Erro ao processar a imagem: {0}")]
    Processing(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::ModelNotLoaded | ApiError::Processing(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::NoFile | ApiError::InvalidFilename => StatusCode::BAD_REQUEST,
            ApiError::Multipart(err) => err.status(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("{}", self);
        } else {
            tracing::warn!("Rejected request: {}", self);
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(ApiError::ModelNotLoaded.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(ApiError::NoFile.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::InvalidFilename.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ApiError::Processing("boom".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_processing_message() {
        assert_eq!(
            ApiError::Processing("bad header".into()).to_string(),
            "Erro ao processar a imagem: bad header"
        );
    }
}
