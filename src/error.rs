use axum::{
    extract::multipart::MultipartError,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key} has an invalid value `{value}`: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("failed to read {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("tensorflow error: {0}")]
    Tensorflow(String),
    #[error("operation `{0}` not found in graph")]
    MissingOperation(String),
    #[error("input has {actual} values, model expects {expected}")]
    InputSize { expected: usize, actual: usize },
    #[error("model returned an empty output")]
    EmptyOutput,
    #[error("class list {0} contains no labels")]
    NoLabels(String),
    #[error("class list {path} repeats label `{label}`")]
    DuplicateLabel { path: String, label: String },
    #[error("model returned NaN for class {0}")]
    NanScore(usize),
}

impl From<tensorflow::Status> for ModelError {
    fn from(status: tensorflow::Status) -> Self {
        ModelError::Tensorflow(status.to_string())
    }
}

/// Everything that can go wrong while answering a single request.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("No file uploaded")]
    MissingFile,
    #[error(transparent)]
    Multipart(#[from] MultipartError),
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("prediction worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

impl ServiceError {
    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::MissingFile => StatusCode::UNPROCESSABLE_ENTITY,
            ServiceError::Multipart(err) => err.status(),
            ServiceError::Decode(_) | ServiceError::Model(_) | ServiceError::Worker(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "prediction failed");
        } else {
            tracing::warn!(error = %self, "rejected request");
        }

        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
