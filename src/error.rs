use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AppError {
    #[error("Invalid pin {0}")]
    InvalidPin(u32),
    #[error("Invalid mode {0}")]
    InvalidMode(String),
    #[error("Invalid pull {0}")]
    InvalidPull(String),
    #[error("Invalid action {0}")]
    InvalidAction(String),
    #[error("Invalid value: {0}")]
    InvalidValue(String),
    #[error("Pin {0} is not configured")]
    NotConfigured(u32),
    #[error("Pin {0} is not configured as output")]
    NotOutput(u32),
    #[error("Pin {0} is not configured as input")]
    NotInput(u32),
    #[error("PWM not active on pin {0}")]
    NotActive(u32),
    #[error("{0}")]
    OutOfRange(String),
    #[error("Pulse on pin {0} aborted, pin was reconfigured")]
    PulseAborted(u32),
    #[error("GPIO driver error: {0}")]
    Driver(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::InvalidPin(_)
            | AppError::InvalidMode(_)
            | AppError::InvalidPull(_)
            | AppError::InvalidAction(_)
            | AppError::InvalidValue(_)
            | AppError::NotConfigured(_)
            | AppError::NotOutput(_)
            | AppError::NotInput(_)
            | AppError::NotActive(_)
            | AppError::OutOfRange(_) => StatusCode::BAD_REQUEST,
            AppError::PulseAborted(_) => StatusCode::CONFLICT,
            AppError::Driver(_) | AppError::Config(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({ "error": self.to_string() }))
    }
}
