//! Error types and result definitions for the smartcontrol crate.
//! Includes conversion from standard IO, JSON and MQTT client errors.

use std::time::Duration;
use thiserror::Error;

/// Represents all possible errors that can occur when talking to a plug.
#[derive(Error, Debug, Clone)]
pub enum ControlError {
    /// An outgoing envelope could not be serialized
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// An incoming payload was not a JSON object of the expected shape
    #[error("Decoding error: {0}")]
    Decoding(String),

    /// Socket or broker operation failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// Plug index outside of 0..=5, rejected before any network activity
    #[error("Plug index {0} is out of range, it should be between 0 and 5")]
    InvalidPlugIndex(i64),

    /// No reply arrived within the operation deadline
    #[error("No reply within {0:?}")]
    Timeout(Duration),

    /// MQTT delivery failed and the UDP broadcast fallback failed as well
    #[error("MQTT delivery failed ({primary}); UDP fallback failed ({fallback})")]
    Fallback {
        primary: Box<ControlError>,
        fallback: Box<ControlError>,
    },
}

/// A specialized Result type for plug operations.
pub type Result<T> = std::result::Result<T, ControlError>;

impl From<std::io::Error> for ControlError {
    fn from(err: std::io::Error) -> Self {
        ControlError::Transport(err.to_string())
    }
}

impl From<rumqttc::ClientError> for ControlError {
    fn from(err: rumqttc::ClientError) -> Self {
        ControlError::Transport(format!("MQTT client: {}", err))
    }
}

impl From<rumqttc::ConnectionError> for ControlError {
    fn from(err: rumqttc::ConnectionError) -> Self {
        ControlError::Transport(format!("MQTT connection: {}", err))
    }
}

impl ControlError {
    /// Whether retrying the whole operation may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ControlError::Transport(_) | ControlError::Timeout(_) | ControlError::Fallback { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_reports_both_failures() {
        let err = ControlError::Fallback {
            primary: Box::new(ControlError::Transport("connection refused".into())),
            fallback: Box::new(ControlError::Transport("network unreachable".into())),
        };
        let msg = err.to_string();
        assert!(msg.contains("connection refused"));
        assert!(msg.contains("network unreachable"));
        assert!(err.is_recoverable());
    }

    #[test]
    fn validation_is_not_recoverable() {
        let err = ControlError::InvalidPlugIndex(6);
        assert!(!err.is_recoverable());
        assert!(err.to_string().contains('6'));
    }

    #[test]
    fn io_errors_become_transport_errors() {
        let io = std::io::Error::new(std::io::ErrorKind::AddrInUse, "port taken");
        assert!(matches!(ControlError::from(io), ControlError::Transport(m) if m.contains("port taken")));
    }
}
