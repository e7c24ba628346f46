use std::time::Duration;

use thiserror::Error;

/// Errors produced by the registry, media server and adapters.
///
/// `send_media` never surfaces these directly; it folds them into a
/// `SendResult` whose `reason` starts with the stable code from
/// [`CastError::reason_code`].
#[derive(Error, Debug)]
pub enum CastError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Adapter failure: {0}")]
    AdapterFailure(String),

    #[error("Payload registration failed: {0}")]
    PayloadRegistrationFailure(String),

    #[error("Media server failed to bind: {0}")]
    MediaServerBindFailure(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Session has ended")]
    SessionEnded,

    #[error("Operation {0} is not supported by the {1} transport")]
    UnsupportedOperation(String, String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Registry has not been started")]
    NotStarted,

    #[error("Registry is already started")]
    AlreadyStarted,

    #[error("Registry is already stopped")]
    AlreadyStopped,
}

impl CastError {
    pub fn device_not_found(id: impl Into<String>) -> Self {
        CastError::DeviceNotFound(id.into())
    }

    pub fn adapter_failure(detail: impl Into<String>) -> Self {
        CastError::AdapterFailure(detail.into())
    }

    pub fn unsupported(operation: impl Into<String>, transport: impl Into<String>) -> Self {
        CastError::UnsupportedOperation(operation.into(), transport.into())
    }

    /// Stable machine-readable code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            CastError::DeviceNotFound(_) => "DeviceNotFound",
            CastError::AdapterFailure(_) => "AdapterFailure",
            CastError::PayloadRegistrationFailure(_) => "PayloadRegistrationFailure",
            CastError::MediaServerBindFailure(_) => "MediaServerBindFailure",
            CastError::Timeout(_) => "Timeout",
            CastError::SessionEnded => "SessionEnded",
            CastError::UnsupportedOperation(_, _) => "UnsupportedOperation",
            CastError::InvalidPayload(_) => "InvalidPayload",
            CastError::NotStarted => "NotStarted",
            CastError::AlreadyStarted => "AlreadyStarted",
            CastError::AlreadyStopped => "AlreadyStopped",
        }
    }

    /// Reason string for a failed `SendResult`.
    ///
    /// Variants whose meaning is fully carried by the code map to the bare
    /// code (callers match on `"DeviceNotFound"`, `"Timeout"` verbatim);
    /// detail-carrying variants append the detail after `": "`.
    pub fn send_reason(&self) -> String {
        match self {
            CastError::DeviceNotFound(_)
            | CastError::Timeout(_)
            | CastError::SessionEnded
            | CastError::NotStarted
            | CastError::AlreadyStarted
            | CastError::AlreadyStopped => self.reason_code().to_string(),
            CastError::AdapterFailure(detail)
            | CastError::PayloadRegistrationFailure(detail)
            | CastError::MediaServerBindFailure(detail)
            | CastError::InvalidPayload(detail) => {
                format!("{}: {}", self.reason_code(), detail)
            }
            CastError::UnsupportedOperation(op, transport) => {
                format!("{}: {} on {}", self.reason_code(), op, transport)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_codes_for_lookup_failures() {
        assert_eq!(
            CastError::device_not_found("uuid:missing").send_reason(),
            "DeviceNotFound"
        );
        assert_eq!(
            CastError::Timeout(Duration::from_secs(5)).send_reason(),
            "Timeout"
        );
        assert_eq!(CastError::SessionEnded.send_reason(), "SessionEnded");
    }

    #[test]
    fn detail_variants_keep_their_detail() {
        let reason = CastError::adapter_failure("connection refused").send_reason();
        assert_eq!(reason, "AdapterFailure: connection refused");
        assert!(reason.starts_with("AdapterFailure"));
    }
}
