//! HTTP error mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use mpipe_broker::BrokerError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors returned by route handlers
#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),
}

/// JSON error body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Broker(e) => match e {
                BrokerError::InvalidName { .. } | BrokerError::Serialization(_) => {
                    StatusCode::BAD_REQUEST
                }
                BrokerError::CapacityExceeded { .. }
                | BrokerError::NoHealthyClient(_)
                | BrokerError::EmptyCandidates
                | BrokerError::Store(_)
                | BrokerError::StoreShutdown => StatusCode::SERVICE_UNAVAILABLE,
                BrokerError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
                BrokerError::Transport(_) => StatusCode::BAD_GATEWAY,
                BrokerError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "bad_request",
            ApiError::NotFound(_) => "not_found",
            ApiError::Broker(e) => match e {
                BrokerError::InvalidName { .. } => "invalid_name",
                BrokerError::Serialization(_) => "serialization",
                BrokerError::CapacityExceeded { .. } => "capacity_exceeded",
                BrokerError::NoHealthyClient(_) | BrokerError::EmptyCandidates => {
                    "no_healthy_client"
                }
                BrokerError::Store(_) | BrokerError::StoreShutdown => "store_unavailable",
                BrokerError::Timeout(_) => "timeout",
                BrokerError::Transport(_) => "transport",
                BrokerError::Configuration(_) => "configuration",
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error_code = self.error_code(), error = %self, "Request failed");
        } else {
            tracing::debug!(error_code = self.error_code(), error = %self, "Request rejected");
        }

        let body = ErrorResponse {
            error: self.error_code().to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
