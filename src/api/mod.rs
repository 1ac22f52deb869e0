//! REST control surface for the scan engine

pub mod health;
pub mod scan;
pub mod subscriptions;

use axum::{Json, http::StatusCode};
use serde::Serialize;

use crate::error::Error;

#[derive(Debug, Serialize)]
pub struct ActionResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionResponse {
    pub fn ok(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            success: true,
            message: Some(message.into()),
            error: None,
        })
    }
}

pub type ApiError = (StatusCode, Json<ActionResponse>);

pub fn api_error(status: StatusCode, error: impl ToString) -> ApiError {
    (
        status,
        Json(ActionResponse {
            success: false,
            message: None,
            error: Some(error.to_string()),
        }),
    )
}

impl From<Error> for ActionResponse {
    fn from(e: Error) -> Self {
        Self {
            success: false,
            message: None,
            error: Some(e.to_string()),
        }
    }
}

/// Map an engine error to a response
pub fn engine_error(e: Error) -> ApiError {
    let status = match &e {
        Error::RunInProgress => StatusCode::CONFLICT,
        Error::Config(_) => StatusCode::BAD_REQUEST,
        Error::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ActionResponse::from(e)))
}
