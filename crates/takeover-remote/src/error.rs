//! Error types for the takeover-remote crate.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    /// The debugging endpoint could not be reached
    #[error("failed to connect to debugging endpoint at {url}: {reason}")]
    ConnectionFailed { url: String, reason: String },

    /// The endpoint is up but offers no page document to attach to
    #[error("no document available at {url}")]
    NoDocument { url: String },

    #[error("CDP error {code}: {message}")]
    Cdp {
        code: i64,
        message: String,
        data: Option<String>,
    },

    #[error("CDP command '{method}' timed out after {duration:?}")]
    Timeout { method: String, duration: Duration },

    /// Serialization failures, unexpected message shapes, closed channels
    #[error("CDP protocol error: {detail}")]
    Protocol { detail: String },

    #[error("JavaScript exception: {message}")]
    JsException { message: String },
}

impl RemoteError {
    pub(crate) fn protocol(detail: impl Into<String>) -> Self {
        RemoteError::Protocol { detail: detail.into() }
    }

    /// The command referenced a node the document no longer has
    pub fn is_stale_node(&self) -> bool {
        match self {
            RemoteError::Cdp { message, .. } => {
                message.contains("No node with given id") || message.contains("Could not find node")
            }
            _ => false,
        }
    }

    /// The method is not offered by this endpoint
    pub fn is_unsupported(&self) -> bool {
        matches!(self, RemoteError::Cdp { code: -32601, .. })
    }
}
