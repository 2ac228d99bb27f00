use std::error::Error as StdError;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::{
    assets::MergeError,
    cache::StoreError,
    config::LoadError,
    infra::error::InfraError,
    preload::PreloadError,
};

/// Diagnostic chain attached to error responses for the response logging middleware.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub status: StatusCode,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn from_error(source: &'static str, status: StatusCode, error: &dyn StdError) -> Self {
        let mut messages = vec![error.to_string()];
        let mut current = error.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        Self {
            source,
            status,
            messages,
        }
    }

    pub fn from_message(
        source: &'static str,
        status: StatusCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            source,
            status,
            messages: vec![message.into()],
        }
    }

    pub fn attach(self, response: &mut Response) {
        response.extensions_mut().insert(self);
    }
}

pub mod codes {
    pub const BAD_REQUEST: &str = "bad_request";
    pub const NOT_FOUND: &str = "not_found";
    pub const UPSTREAM: &str = "upstream_error";
    pub const STORAGE: &str = "storage_error";
    pub const CONFIG: &str = "config_error";
    pub const INTERNAL: &str = "internal_error";
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: ErrorMessage,
}

#[derive(Debug, Serialize)]
pub struct ErrorMessage {
    pub code: &'static str,
    pub message: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Config(#[from] LoadError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Merge(#[from] MergeError),
    #[error(transparent)]
    Preload(#[from] PreloadError),
    #[error("{0} not found")]
    NotFound(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) | AppError::Preload(PreloadError::UnknownRecommendation(_)) => {
                StatusCode::NOT_FOUND
            }
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Preload(PreloadError::Fetch { .. } | PreloadError::Status { .. }) => {
                StatusCode::BAD_GATEWAY
            }
            AppError::Infra(_)
            | AppError::Config(_)
            | AppError::Store(_)
            | AppError::Merge(_)
            | AppError::Preload(_)
            | AppError::Unexpected(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            AppError::NotFound(_) | AppError::Preload(PreloadError::UnknownRecommendation(_)) => {
                codes::NOT_FOUND
            }
            AppError::Validation(_) => codes::BAD_REQUEST,
            AppError::Preload(PreloadError::Fetch { .. } | PreloadError::Status { .. }) => {
                codes::UPSTREAM
            }
            AppError::Store(_) | AppError::Merge(_) | AppError::Preload(_) => codes::STORAGE,
            AppError::Config(_) | AppError::Infra(InfraError::Configuration { .. }) => {
                codes::CONFIG
            }
            AppError::Infra(_) | AppError::Unexpected(_) => codes::INTERNAL,
        }
    }

    fn presentation_message(&self) -> &'static str {
        match self.status_code() {
            StatusCode::NOT_FOUND => "Resource not found",
            StatusCode::BAD_REQUEST => "Request could not be processed",
            StatusCode::BAD_GATEWAY => "Upstream request failed",
            _ => "Unexpected error occurred",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let hint = match &self {
            AppError::NotFound(_) | AppError::Validation(_) | AppError::Preload(_) => {
                Some(self.to_string())
            }
            _ => None,
        };
        let body = ErrorBody {
            error: ErrorMessage {
                code: self.code(),
                message: self.presentation_message(),
                hint,
            },
        };
        let report = ErrorReport::from_error("application::error::AppError", status, &self);
        let mut response = (status, Json(body)).into_response();
        report.attach(&mut response);
        response
    }
}
