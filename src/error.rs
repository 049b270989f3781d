//! Error types for the fleet dispatcher.

use std::time::Duration;

/// Unified failure type for every dispatcher operation.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum DispatcherError {
    /// Transport could not be established or re-established.
    #[error("connect to {target} failed: {cause}")]
    Connect {
        /// `host:port` of the endpoint.
        target: String,
        /// Underlying cause, rendered as text.
        cause: String,
    },

    /// A call deadline elapsed before the remote responded.
    #[error("call to {target} timed out after {elapsed:?}")]
    CallTimeout {
        /// `host:port` of the endpoint.
        target: String,
        /// How long the caller waited.
        elapsed: Duration,
    },

    /// The channel was used while not in the `Connected` state.
    #[error("{target} is not connected")]
    NotConnected {
        /// `host:port` of the endpoint.
        target: String,
    },

    /// The remote returned a status other than the ones treated as success.
    #[error("remote error from {target}: {status}")]
    Remote {
        /// `host:port` (or node id) of the endpoint.
        target: String,
        /// The gRPC status, rendered as text.
        status: String,
    },

    /// A façade method was invoked before `start()` or after `stop()`.
    #[error("fleet dispatcher is not started")]
    NotStarted,

    /// A node's TLS certificate could not be fetched.
    #[error("cert fetch for node {node_id} failed: {cause}")]
    CertFetch {
        /// Node identifier.
        node_id: i64,
        /// Underlying cause, rendered as text.
        cause: String,
    },

    /// A node referenced by id is not currently connected.
    #[error("node {node_id} is not connected")]
    NodeNotConnected {
        /// Node identifier.
        node_id: i64,
    },
}

impl DispatcherError {
    /// True if this error represents a remote "already exists" condition.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, DispatcherError::Remote { status, .. } if status.to_lowercase().contains("already exists"))
    }

    /// True if this error represents a remote "not found" condition.
    pub fn is_not_found(&self) -> bool {
        matches!(self, DispatcherError::Remote { status, .. } if status.to_lowercase().contains("not found"))
    }
}
