//! Engine error types.

use event_store::{ErrorSource, EventStoreError, InstanceKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::registry::RegistryError;

/// A business-level refusal of a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub message: String,
    pub hint: Option<String>,
    pub code: i32,
}

impl Rejection {
    pub fn new(message: impl Into<String>, code: i32) -> Self {
        Self {
            message: message.into(),
            hint: None,
            code,
        }
    }

    /// Attaches a hint for the caller.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// The command id was applied to this instance recently.
    pub fn duplicate_command(command_id: &str) -> Self {
        Self::new("Command was already processed", 400).with_hint(format!(
            "Command id {command_id} was already applied to this instance"
        ))
    }

    /// The command payload could not be decoded.
    pub fn malformed(reason: impl std::fmt::Display) -> Self {
        Self::new("Malformed command payload", 400).with_hint(reason.to_string())
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

/// Lets behaviours use `?` on event serialization.
impl From<serde_json::Error> for Rejection {
    fn from(err: serde_json::Error) -> Self {
        Self::new("Event could not be serialized", 500).with_hint(err.to_string())
    }
}

/// Errors surfaced by the aggregate engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// No behaviour is registered for the command type.
    #[error("Unknown command type: {0}")]
    UnknownCommand(String),

    /// No aggregator is registered for the event type, or the event could not be upcast.
    #[error("Unknown event type: {0}")]
    UnknownEvent(String),

    #[error("Command rejected: {0}")]
    CommandRejected(Rejection),

    /// Optimistic concurrency kept failing after the configured retries.
    #[error("Concurrency conflict on {instance} after {attempts} attempts")]
    Conflict {
        instance: InstanceKey,
        attempts: u32,
    },

    #[error("Event store error: {0}")]
    EventStore(#[from] EventStoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl EngineError {
    /// Returns true for business rejections, as opposed to faults.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::CommandRejected(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Classifies the error for callers and the failure sink.
    pub fn error_source(&self) -> ErrorSource {
        match self {
            Self::CommandRejected(_) | Self::UnknownCommand(_) => ErrorSource::Logic,
            Self::Conflict { .. } | Self::EventStore(_) => ErrorSource::EventStore,
            Self::Registry(_) | Self::Configuration(_) => ErrorSource::Infrastructure,
            Self::UnknownEvent(_) | Self::Serialization(_) => ErrorSource::Unknown,
        }
    }
}

/// Structured error returned at the command submission boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub message: String,
    pub hint: Option<String>,
    pub code: i32,
    pub source: ErrorSource,
}

impl From<&EngineError> for ErrorResponse {
    fn from(err: &EngineError) -> Self {
        let source = err.error_source();
        match err {
            EngineError::CommandRejected(rejection) => Self {
                message: rejection.message.clone(),
                hint: rejection.hint.clone(),
                code: rejection.code,
                source,
            },
            EngineError::UnknownCommand(command_type) => Self {
                message: "Unknown command type".to_string(),
                hint: Some(format!("No behaviour is registered for {command_type}")),
                code: 404,
                source,
            },
            EngineError::Conflict { .. } => Self {
                message: err.to_string(),
                hint: Some("Retry the command".to_string()),
                code: 409,
                source,
            },
            EngineError::EventStore(_) => Self {
                message: err.to_string(),
                hint: None,
                code: 500,
                source,
            },
            _ => Self {
                message: err.to_string(),
                hint: None,
                code: 999,
                source,
            },
        }
    }
}

impl From<EngineError> for ErrorResponse {
    fn from(err: EngineError) -> Self {
        Self::from(&err)
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_maps_to_logic_response() {
        let err = EngineError::CommandRejected(Rejection::duplicate_command("c1"));
        let response = ErrorResponse::from(&err);

        assert_eq!(response.message, "Command was already processed");
        assert_eq!(response.code, 400);
        assert_eq!(response.source, ErrorSource::Logic);
        assert!(response.hint.unwrap().contains("c1"));
    }

    #[test]
    fn unclassified_errors_use_code_999() {
        let err = EngineError::UnknownEvent("Vanished".to_string());
        let response = ErrorResponse::from(err);

        assert_eq!(response.code, 999);
        assert_eq!(response.source, ErrorSource::Unknown);
    }

    #[test]
    fn serde_errors_become_server_rejections() {
        let err = serde_json::from_str::<u32>("nope").unwrap_err();
        let rejection = Rejection::from(err);
        assert_eq!(rejection.code, 500);
        assert!(rejection.hint.is_some());
    }
}
