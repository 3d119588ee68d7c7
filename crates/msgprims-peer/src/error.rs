use std::time::Duration;

/// Errors that can occur in messaging operations.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] msgprims_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] msgprims_frame::FrameError),

    /// Handshake failed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// Peer disconnected.
    #[error("peer disconnected: {0}")]
    Disconnected(String),

    /// The message could not be dispatched, or the peer answered with an
    /// error reply.
    #[error("dispatch failed: {message}")]
    DispatchFailed {
        message: String,
        /// True when the failure was local to one endpoint and another
        /// endpoint may succeed.
        redispatch_possible: bool,
    },

    /// The message was sent but no reply arrived in time.
    #[error("no response within {0:?}")]
    ResponseTimeout(Duration),

    /// No ready endpoint matched the target before the deadline.
    ///
    /// This is a dispatch failure: [`MessagingError::is_dispatch_failed`]
    /// is true for it.
    #[error("no endpoint available for {0}")]
    NoEndpointAvailable(String),

    /// Reading a message body failed.
    #[error("error reading message body: {0}")]
    BodyRead(#[source] std::io::Error),

    /// The message body was already consumed by another accessor.
    #[error("message body already consumed")]
    BodyConsumed,

    /// JSON serialization/deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The messaging manager is shutting down.
    #[error("messaging manager is shut down")]
    Shutdown,
}

impl MessagingError {
    pub(crate) fn dispatch_failed(message: impl Into<String>, redispatch_possible: bool) -> Self {
        MessagingError::DispatchFailed {
            message: message.into(),
            redispatch_possible,
        }
    }

    /// True when a dispatch may be retried on a different endpoint.
    pub fn is_redispatch_possible(&self) -> bool {
        matches!(
            self,
            MessagingError::DispatchFailed {
                redispatch_possible: true,
                ..
            }
        )
    }

    /// True for the "never delivered" class of failures, as opposed to
    /// [`MessagingError::ResponseTimeout`].
    pub fn is_dispatch_failed(&self) -> bool {
        matches!(
            self,
            MessagingError::DispatchFailed { .. } | MessagingError::NoEndpointAvailable(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, MessagingError>;

/// Error type returned by consumer callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
