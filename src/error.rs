use thiserror::Error;

use crate::protocol::link::DeviceCategory;

/// Failure taxonomy shared by the links, the runners and the controller.
///
/// Cancellation is not a failure: it comes back as `IterationOutcome::Cancelled`
/// or `RunOutcome::Cancelled`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PowerTestError {
    /// No device selected, or the port could not be claimed. The user has to
    /// pick the device again.
    #[error("{category} link unavailable: {reason}")]
    LinkUnavailable {
        category: DeviceCategory,
        reason: String,
    },

    /// Transport fault during read or write. Aborts the current iteration.
    #[error("{category} link I/O error: {reason}")]
    LinkIo {
        category: DeviceCategory,
        reason: String,
    },

    /// Telemetry frame without the expected fields. Recovered by the decoder.
    #[error("Malformed telemetry frame: {0}")]
    ProtocolMalformed(String),

    /// Rejected before any hardware I/O happens.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Session file error: {0}")]
    SessionFormat(String),
}

impl PowerTestError {
    pub fn unavailable(category: DeviceCategory, reason: impl Into<String>) -> Self {
        Self::LinkUnavailable {
            category,
            reason: reason.into(),
        }
    }

    pub fn io(category: DeviceCategory, reason: impl Into<String>) -> Self {
        Self::LinkIo {
            category,
            reason: reason.into(),
        }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        Self::Configuration(reason.into())
    }
}

impl From<serde_json::Error> for PowerTestError {
    fn from(err: serde_json::Error) -> Self {
        Self::SessionFormat(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PowerTestError>;
