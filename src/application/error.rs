use std::error::Error as StdError;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::{
    application::{fetch::FetchError, repos::RepoError},
    domain::error::DomainError,
    infra::error::InfraError,
};

/// Diagnostic attached to error responses so the logging middleware can
/// report the failing layer and its error chain.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub status: StatusCode,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn from_error(source: &'static str, status: StatusCode, error: &dyn StdError) -> Self {
        let mut messages = Vec::new();
        messages.push(error.to_string());
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

    pub fn attach(self, response: &mut Response) {
        response.extensions_mut().insert(self);
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Domain(DomainError::Validation { .. }) | AppError::Validation(_) => {
                StatusCode::BAD_REQUEST
            }
            AppError::Fetch(FetchError::Timeout { .. }) => StatusCode::GATEWAY_TIMEOUT,
            AppError::Fetch(FetchError::NotReady) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Fetch(FetchError::Queue(_)) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Repo(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Infra(InfraError::Database { .. }) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Infra(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Unexpected(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn presentation_message(&self) -> &'static str {
        match self {
            AppError::Domain(DomainError::Validation { .. }) | AppError::Validation(_) => {
                "Request could not be processed"
            }
            AppError::Fetch(FetchError::Timeout { .. }) => "Upstream request timed out",
            AppError::Fetch(FetchError::NotReady) => "Upstream queue is not ready",
            AppError::Fetch(FetchError::Queue(_)) => "Upstream queue unavailable",
            AppError::Repo(_) | AppError::Infra(InfraError::Database { .. }) => {
                "Service temporarily unavailable"
            }
            AppError::Infra(InfraError::Configuration { .. }) => "Service misconfigured",
            AppError::Infra(_) => "Infrastructure failure during request",
            AppError::Unexpected(_) => "Unexpected error occurred",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = self.presentation_message();
        let report = ErrorReport::from_error("application::error::AppError", status, &self);
        let body = Json(json!({ "message": message, "error": self.to_string() }));
        let mut response = (status, body).into_response();
        report.attach(&mut response);
        response
    }
}
