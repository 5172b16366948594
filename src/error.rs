//! Error taxonomy shared by every console component.
//!
//! The variants map one-to-one onto the HTTP status codes returned by the
//! API, and back again on the client side, so an error raised in the
//! orchestrator reaches the operator with its kind and message intact.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConsoleError {
    /// Unknown device, device not ready, malformed input.
    #[error("{0}")]
    Validation(String),

    /// Duplicate session or a transition the current state does not allow.
    #[error("{0}")]
    StateConflict(String),

    #[error("{0}")]
    NotFound(String),

    /// Image download failure. Partial data has already been discarded.
    #[error("{0}")]
    Transfer(String),

    /// Failure reported by the device-control backend.
    #[error("{message}")]
    DeviceOperation {
        message: String,
        trace: Option<String>,
    },

    #[error("{0}")]
    Config(String),

    /// Transport failure or unexpected response while talking to the API.
    #[error("{0}")]
    Api(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = ConsoleError> = std::result::Result<T, E>;

impl ConsoleError {
    pub fn device_operation(message: impl Into<String>, trace: Option<String>) -> Self {
        ConsoleError::DeviceOperation {
            message: message.into(),
            trace,
        }
    }

    /// HTTP status code used when this error crosses the API boundary.
    pub fn status_code(&self) -> u16 {
        match self {
            ConsoleError::Validation(_) => 400,
            ConsoleError::NotFound(_) => 404,
            ConsoleError::StateConflict(_) => 409,
            ConsoleError::Transfer(_) | ConsoleError::Api(_) => 502,
            ConsoleError::DeviceOperation { .. } | ConsoleError::Config(_) | ConsoleError::Io(_) => {
                500
            }
        }
    }

    /// Rebuild an error from a non-2xx response and its `detail` field.
    pub fn from_status(status: u16, detail: String) -> Self {
        match status {
            400 | 422 => ConsoleError::Validation(detail),
            404 => ConsoleError::NotFound(detail),
            409 => ConsoleError::StateConflict(detail),
            502 => ConsoleError::Transfer(detail),
            _ => ConsoleError::Api(detail),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_round_trip_through_the_wire() {
        let errors = [
            ConsoleError::Validation("USB debugging must be enabled first".into()),
            ConsoleError::NotFound("File not found".into()),
            ConsoleError::StateConflict("Flash session already active".into()),
            ConsoleError::Transfer("Failed to download: HTTP 404".into()),
        ];

        for error in errors {
            let message = error.to_string();
            let rebuilt = ConsoleError::from_status(error.status_code(), message.clone());
            assert_eq!(rebuilt.status_code(), error.status_code());
            assert_eq!(rebuilt.to_string(), message);
        }
    }

    #[test]
    fn device_operation_displays_message_only() {
        let error = ConsoleError::device_operation("Failed to push image", Some("adb: error".into()));
        assert_eq!(error.to_string(), "Failed to push image");
        assert_eq!(error.status_code(), 500);
    }
}
