use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use chrono::{DateTime, Utc};
use serde_json::json;
use std::fmt::{Debug, Display};
use tokio::sync::OnceCell;

/// Controls whether to include raw upstream request/response details in error output
///
/// When true, provider errors are rendered with their `Debug` representation,
/// which may expose request payloads in logs and error responses.
static DEBUG: OnceCell<bool> = OnceCell::const_new();

pub fn set_debug(debug: bool) -> Result<(), Error> {
    DEBUG.set(debug).map_err(|_| {
        Error::new(ErrorDetails::Config {
            message: "Failed to set debug mode".to_string(),
        })
    })
}

/// Chooses between a `Debug` or `Display` representation based on the gateway-level `DEBUG` flag.
pub struct DisplayOrDebugGateway<T: Debug + Display> {
    val: T,
}

impl<T: Debug + Display> DisplayOrDebugGateway<T> {
    pub fn new(val: T) -> Self {
        Self { val }
    }
}

impl<T: Debug + Display> Display for DisplayOrDebugGateway<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if *DEBUG.get().unwrap_or(&false) {
            write!(f, "{:?}", self.val)
        } else {
            write!(f, "{}", self.val)
        }
    }
}

#[derive(Debug, PartialEq)]
// As long as the struct member is private, we force people to use the `new` method and log the error.
// We box `ErrorDetails` per the `clippy::result_large_err` lint
pub struct Error(Box<ErrorDetails>);

impl Error {
    pub fn new(details: ErrorDetails) -> Self {
        details.log();
        Error(Box::new(details))
    }

    pub fn new_without_logging(details: ErrorDetails) -> Self {
        Error(Box::new(details))
    }

    pub fn status_code(&self) -> StatusCode {
        self.0.status_code()
    }

    pub fn get_details(&self) -> &ErrorDetails {
        &self.0
    }

    pub fn get_owned_details(self) -> ErrorDetails {
        *self.0
    }

    pub fn log(&self) {
        self.0.log();
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl From<ErrorDetails> for Error {
    fn from(details: ErrorDetails) -> Self {
        Error::new(details)
    }
}

#[derive(Debug, PartialEq, strum_macros::AsRefStr)]
pub enum ErrorDetails {
    AppState {
        message: String,
    },
    Config {
        message: String,
    },
    InvalidRequest {
        message: String,
    },
    Unauthenticated {
        message: String,
    },
    QuotaExceeded {
        reason: String,
        reset_time: DateTime<Utc>,
        remaining_requests: u32,
    },
    UsageStore {
        message: String,
    },
    InsightProvider {
        message: String,
    },
    Serialization {
        message: String,
    },
    TelemetryUnavailable,
    InternalError {
        message: String,
    },
}

impl ErrorDetails {
    /// Get the HTTP status code that should be returned for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorDetails::AppState { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::Config { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            ErrorDetails::Unauthenticated { .. } => StatusCode::UNAUTHORIZED,
            ErrorDetails::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            ErrorDetails::UsageStore { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::InsightProvider { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::Serialization { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorDetails::TelemetryUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorDetails::InternalError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Log the error using the `tracing` library
    pub fn log(&self) {
        match self.status_code() {
            StatusCode::TOO_MANY_REQUESTS | StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED => {
                tracing::warn!("{self}");
            }
            _ => tracing::error!("{self}"),
        }
    }
}

impl std::fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorDetails::AppState { message } => {
                write!(f, "Error initializing AppState: {message}")
            }
            ErrorDetails::Config { message } => write!(f, "{message}"),
            ErrorDetails::InvalidRequest { message } => write!(f, "{message}"),
            ErrorDetails::Unauthenticated { message } => write!(f, "{message}"),
            ErrorDetails::QuotaExceeded { reason, .. } => {
                write!(f, "Usage quota exceeded: {reason}")
            }
            ErrorDetails::UsageStore { message } => write!(f, "Usage store error: {message}"),
            ErrorDetails::InsightProvider { message } => {
                write!(f, "Insight provider error: {message}")
            }
            ErrorDetails::Serialization { message } => write!(f, "{message}"),
            ErrorDetails::TelemetryUnavailable => {
                write!(f, "Telemetry recorder is not initialized")
            }
            ErrorDetails::InternalError { message } => write!(f, "{message}"),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = match self.get_details() {
            // Rate-limited responses carry the reset time and remaining budget so
            // clients know when to retry.
            ErrorDetails::QuotaExceeded {
                reason,
                reset_time,
                remaining_requests,
            } => json!({
                "error": {
                    "message": format!("Usage quota exceeded: {reason}"),
                    "type": self.get_details().as_ref(),
                    "code": status.as_u16(),
                },
                "reset_time": reset_time.to_rfc3339(),
                "remaining_requests": remaining_requests,
            }),
            details => json!({
                "error": {
                    "message": format!("{details}"),
                    "type": details.as_ref(),
                    "code": status.as_u16(),
                }
            }),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let cases = [
            (
                ErrorDetails::InvalidRequest {
                    message: "missing habit_name".to_string(),
                },
                StatusCode::BAD_REQUEST,
            ),
            (
                ErrorDetails::Unauthenticated {
                    message: "no key".to_string(),
                },
                StatusCode::UNAUTHORIZED,
            ),
            (
                ErrorDetails::QuotaExceeded {
                    reason: "Daily limit reached".to_string(),
                    reset_time: Utc::now(),
                    remaining_requests: 0,
                },
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (
                ErrorDetails::UsageStore {
                    message: "connection refused".to_string(),
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (ErrorDetails::TelemetryUnavailable, StatusCode::SERVICE_UNAVAILABLE),
        ];
        for (details, expected) in cases {
            assert_eq!(details.status_code(), expected);
        }
    }

    #[test]
    fn test_quota_exceeded_response_includes_reset_fields() {
        let reset = Utc::now();
        let error = Error::new_without_logging(ErrorDetails::QuotaExceeded {
            reason: "Daily limit reached".to_string(),
            reset_time: reset,
            remaining_requests: 0,
        });
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
