//! Error types for the scan relay.
//!
//! Each layer owns a thiserror enum; [`RelayError`] unifies them for callers
//! that drive the whole pipeline.

use thiserror::Error;

use crate::config::ConfigurationError;
use crate::messaging::{MalformedMessage, MessagingError, PublishError};
use crate::producer::SourceError;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Messaging error: {0}")]
    Messaging(#[from] MessagingError),

    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Malformed(#[from] MalformedMessage),

    #[error("Acquisition source error: {0}")]
    Source(#[from] SourceError),
}

/// Result type for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;
