//! Error types for corral
//!
//! This module defines the main error type used throughout the crate. Errors
//! from the coordination log and the broker are carried as messages so that
//! marshaler implementations can wrap whatever transport they sit on.

use thiserror::Error;

/// Result type alias for corral operations
pub type Result<T> = std::result::Result<T, CorralError>;

/// Main error type for corral
#[derive(Error, Debug)]
pub enum CorralError {
    #[error("coordination log error: {0}")]
    Coordination(String),

    #[error("broker error: {0}")]
    Broker(String),

    #[error("topic not found: {0}")]
    TopicNotFound(String),

    #[error("partition not found: topic={0}, partition={1}")]
    PartitionNotFound(String, i32),

    #[error("offset out of range: topic={0}, partition={1}, offset={2}")]
    OffsetOutOfRange(String, i32, i64),

    #[error("partition claim lost: topic={0}, partition={1}")]
    ClaimLost(String, i32),
}

impl CorralError {
    /// Create a coordination log error from a message
    pub fn coordination_msg(msg: impl Into<String>) -> Self {
        CorralError::Coordination(msg.into())
    }

    /// Create a broker error from a message
    pub fn broker_msg(msg: impl Into<String>) -> Self {
        CorralError::Broker(msg.into())
    }
}
