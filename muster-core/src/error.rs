use thiserror::Error;

use crate::configuration::ConfigurationId;
use crate::endpoint::{Endpoint, NodeId};

/// Errors surfaced by the membership protocol and its transports.
#[derive(Debug, Error)]
pub enum MembershipError {
    /// Underlying network I/O failure.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization or deserialization failure for wire payloads.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Payload exceeded the configured MTU budget.
    #[error("message too large: {0} bytes")]
    MessageTooLarge(usize),
    /// Invalid configuration prevented startup.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// The endpoint is already a member of the current configuration.
    #[error("host {0} already in ring")]
    HostAlreadyInRing(Endpoint),
    /// The identifier was already admitted in some configuration.
    #[error("identifier {0} already in ring")]
    IdAlreadyInRing(NodeId),
    /// The endpoint is not a member of the current configuration.
    #[error("host {0} not in ring")]
    NodeNotInRing(Endpoint),
    /// Inbound message carried a stale or future configuration identifier.
    #[error("configuration mismatch: expected {expected}, got {actual}")]
    ConfigurationMismatch {
        /// Configuration this node is currently in.
        expected: ConfigurationId,
        /// Configuration the message was tagged with.
        actual: ConfigurationId,
    },
    /// Internal state violated a protocol invariant. Indicates a logic bug,
    /// not a recoverable protocol error.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    /// An RPC did not complete within its deadline.
    #[error("deadline exceeded for {0}")]
    Timeout(&'static str),
    /// The operation raced with service teardown.
    #[error("service is shutting down")]
    ShuttingDown,
}

/// Errors terminating the joiner side of the bootstrap protocol.
#[derive(Debug, Error)]
pub enum JoinError {
    /// A reachable member refused the join outright.
    #[error("membership rejected by {0}")]
    Rejected(Endpoint),
    /// Every bounded join attempt failed.
    #[error("join unsuccessful after {0} attempts")]
    AttemptsExhausted(usize),
    /// Transport-level failure that exhausted its retries.
    #[error(transparent)]
    Transport(#[from] MembershipError),
}
