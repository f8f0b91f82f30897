use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("workspace error: {0}")]
    WorkspaceIo(#[from] std::io::Error),
    #[error("a process is already running for this client")]
    SessionActive,
    #[error("Process not found")]
    ProcessNotFound,
    #[error("Process not found or not writable")]
    NotWritable,
    #[error("no active session for this client")]
    SessionNotFound,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl RunnerError {
    pub fn status(&self) -> StatusCode {
        match self {
            RunnerError::UnsupportedLanguage(_)
            | RunnerError::InvalidRequest(_)
            | RunnerError::ProcessNotFound
            | RunnerError::NotWritable => StatusCode::BAD_REQUEST,
            RunnerError::SessionNotFound => StatusCode::NOT_FOUND,
            RunnerError::SessionActive => StatusCode::CONFLICT,
            RunnerError::WorkspaceIo(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RunnerError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(ErrorBody {
            error: self.to_string(),
        });
        (status, body).into_response()
    }
}

impl From<JsonRejection> for RunnerError {
    fn from(rejection: JsonRejection) -> Self {
        Self::InvalidRequest(rejection.body_text())
    }
}
