use std::error::Error as StdError;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::{
    application::{processor::ProcessError, scheduler::TaskError},
    config::LoadError,
    infra::error::InfraError,
};

/// Error chain attached to a response so logging middleware can report it
/// without the public body leaking details.
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
    Process(#[from] ProcessError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error(transparent)]
    Config(#[from] LoadError),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Process(ProcessError::NotFound { .. }) => StatusCode::NOT_FOUND,
            AppError::Process(ProcessError::InvalidPath { .. }) => StatusCode::BAD_REQUEST,
            AppError::Process(
                ProcessError::Unavailable { .. }
                | ProcessError::DeadlineElapsed { .. }
                | ProcessError::Pool(_)
                | ProcessError::Render(TaskError::BackendUnavailable(_)),
            ) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Process(ProcessError::Render(_)) => StatusCode::BAD_GATEWAY,
            AppError::Process(
                ProcessError::Storage(_)
                | ProcessError::PostProcess(_)
                | ProcessError::Pattern(_)
                | ProcessError::Internal(_),
            ) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Infra(_) | AppError::Config(_) | AppError::Unexpected(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn presentation_message(&self) -> &'static str {
        match self.status_code() {
            StatusCode::NOT_FOUND => "Resource not found",
            StatusCode::BAD_REQUEST => "Request could not be processed",
            StatusCode::SERVICE_UNAVAILABLE => "Snapshot not available yet",
            StatusCode::BAD_GATEWAY => "Page could not be rendered",
            _ => "Unexpected error occurred",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = self.presentation_message();
        let report = ErrorReport::from_error("application::error::AppError", status, &self);
        let mut response = (status, message).into_response();
        report.attach(&mut response);
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_failures_map_to_gateway_errors() {
        let failed = AppError::from(ProcessError::Render(TaskError::Render("boom".into())));
        assert_eq!(failed.status_code(), StatusCode::BAD_GATEWAY);

        let down = AppError::from(ProcessError::Render(TaskError::BackendUnavailable(
            "pool fatal".into(),
        )));
        assert_eq!(down.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn responses_carry_the_error_chain() {
        let error = AppError::from(ProcessError::DeadlineElapsed {
            key: "k1".into(),
            waited_ms: 250,
        });
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let report = response
            .extensions()
            .get::<ErrorReport>()
            .expect("error report attached");
        assert_eq!(
            report.messages,
            vec!["render of `k1` did not finish within 250ms".to_string()]
        );
    }
}
