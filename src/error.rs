//! Error types for the autocontour node

use std::time::Duration;
use thiserror::Error;

/// Result type alias for node operations
pub type Result<T> = std::result::Result<T, NodeError>;

/// Failure reported by a segmentation backend.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("segmentation timed out after {0:?}")]
    Timeout(Duration),

    #[error("segmentation failed ({code}): {message}")]
    Failed { code: String, message: String },

    #[error("segmentation backend unavailable: {0}")]
    Unavailable(String),

    #[error("segmentation produced invalid output: {0}")]
    InvalidOutput(String),

    #[error("segmentation produced no contours")]
    EmptyResult,
}

impl ModelError {
    pub fn failed(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Error types that can occur while running the node
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Aggregation integrity error: {0}")]
    AggregationIntegrity(String),

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Identifier collision: {0}")]
    IdentifierCollision(String),

    #[error("Forwarding error: {0}")]
    Forwarding(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Report synthesis error: {0}")]
    Synthesis(String),

    #[error("DICOM object error: {0}")]
    DicomObject(String),

    #[error("Invalid batch transition: {0}")]
    InvalidTransition(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl NodeError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    pub fn integrity(msg: impl Into<String>) -> Self {
        Self::AggregationIntegrity(msg.into())
    }

    pub fn forwarding(msg: impl Into<String>) -> Self {
        Self::Forwarding(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn registry(msg: impl Into<String>) -> Self {
        Self::Registry(msg.into())
    }

    pub fn synthesis(msg: impl Into<String>) -> Self {
        Self::Synthesis(msg.into())
    }

    pub fn dicom(msg: impl std::fmt::Display) -> Self {
        Self::DicomObject(msg.to_string())
    }

    /// Whether retrying the same operation later can succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, NodeError::Network(_) | NodeError::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_errors_are_transient() {
        assert!(NodeError::network("connection reset").is_transient());
        assert!(NodeError::Io(std::io::Error::from(std::io::ErrorKind::TimedOut)).is_transient());
        assert!(!NodeError::integrity("patient id differs").is_transient());
        assert!(!NodeError::from(ModelError::EmptyResult).is_transient());
    }

    #[test]
    fn model_error_message_carries_code() {
        let err = NodeError::from(ModelError::failed("E_GPU", "out of memory"));
        assert_eq!(
            err.to_string(),
            "Model error: segmentation failed (E_GPU): out of memory"
        );
    }
}
