//! # Messaging Error Types
//!
//! Structured errors for the queue client layer using thiserror.
//! `PublishError` is the narrow error the producer reacts to; every other
//! broker-level failure is a `MessagingError`.

use thiserror::Error;

/// Broker and queue client errors
#[derive(Error, Debug)]
pub enum MessagingError {
    #[error("Connection error: {message}")]
    Connection { message: String },

    #[error("Queue creation failed: {queue_name}: {message}")]
    QueueCreation { queue_name: String, message: String },

    #[error("Publish failed: {queue_name}: {message}")]
    Publish { queue_name: String, message: String },

    #[error("Receive failed: {queue_name}: {message}")]
    Receive { queue_name: String, message: String },

    #[error("Settlement failed: {operation}: {message}")]
    Settlement { operation: String, message: String },

    #[error("Invalid receipt handle: {handle}")]
    InvalidReceiptHandle { handle: String },

    #[error("Unknown receipt handle: {handle}")]
    UnknownReceipt { handle: String },

    #[error("Configuration error: {component}: {message}")]
    Configuration { component: String, message: String },

    #[error("Network timeout: operation {operation} timed out after {timeout_seconds}s")]
    Timeout {
        operation: String,
        timeout_seconds: u64,
    },

    #[error("Queue stats failed: {queue_name}: {message}")]
    QueueStats { queue_name: String, message: String },

    #[error("Queue client is closed: {queue_name}")]
    Closed { queue_name: String },
}

impl MessagingError {
    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a queue creation error
    pub fn queue_creation(queue_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::QueueCreation {
            queue_name: queue_name.into(),
            message: message.into(),
        }
    }

    /// Create a publish error
    pub fn publish(queue_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Publish {
            queue_name: queue_name.into(),
            message: message.into(),
        }
    }

    /// Create a receive error
    pub fn receive(queue_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Receive {
            queue_name: queue_name.into(),
            message: message.into(),
        }
    }

    /// Create a settlement error for ack, requeue or dead-letter
    pub fn settlement(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Settlement {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create an invalid receipt handle error
    pub fn invalid_receipt_handle(handle: impl Into<String>) -> Self {
        Self::InvalidReceiptHandle {
            handle: handle.into(),
        }
    }

    /// Create an unknown receipt error
    pub fn unknown_receipt(handle: impl Into<String>) -> Self {
        Self::UnknownReceipt {
            handle: handle.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, timeout_seconds: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_seconds,
        }
    }

    /// Create a queue stats error
    pub fn queue_stats(queue_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::QueueStats {
            queue_name: queue_name.into(),
            message: message.into(),
        }
    }

    /// Create a closed client error
    pub fn closed(queue_name: impl Into<String>) -> Self {
        Self::Closed {
            queue_name: queue_name.into(),
        }
    }
}

/// Publish failure surfaced to the producer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    /// Broker unreachable after one reconnect-and-retry
    #[error("Broker unavailable for queue {queue_name}: {message}")]
    Unavailable { queue_name: String, message: String },

    /// Client was closed before the publish
    #[error("Queue client closed: {queue_name}")]
    Closed { queue_name: String },
}

impl PublishError {
    /// Create an unavailable error
    pub fn unavailable(queue_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unavailable {
            queue_name: queue_name.into(),
            message: message.into(),
        }
    }

    /// Create a closed error
    pub fn closed(queue_name: impl Into<String>) -> Self {
        Self::Closed {
            queue_name: queue_name.into(),
        }
    }
}

/// Result type for messaging operations
pub type MessagingResult<T> = Result<T, MessagingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_constructors() {
        let err = MessagingError::settlement("ack", "channel closed");
        assert!(matches!(
            err,
            MessagingError::Settlement { ref operation, .. } if operation == "ack"
        ));
        assert_eq!(err.to_string(), "Settlement failed: ack: channel closed");

        let err = MessagingError::timeout("connect", 30);
        assert_eq!(
            err.to_string(),
            "Network timeout: operation connect timed out after 30s"
        );
    }

    #[test]
    fn test_publish_error_display() {
        assert_eq!(
            PublishError::unavailable("qrscan", "connection refused").to_string(),
            "Broker unavailable for queue qrscan: connection refused"
        );
        assert_eq!(
            PublishError::closed("qrscan").to_string(),
            "Queue client closed: qrscan"
        );
    }
}
