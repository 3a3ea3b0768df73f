//! Error types for kernel operations
//!
//! Expected outcomes of mailbox operations (ack miss, nack to dead letter,
//! dedup hit) are value-typed results, not errors; these variants cover the
//! genuinely exceptional cases a caller must handle.

use crate::domain_types::{AgentId, RunId, SessionId};
use thiserror::Error;

/// Main error type for kernel operations
#[derive(Debug, Error)]
pub enum KernelError {
    /// The referenced agent has never been registered
    #[error("agent not found: {0}")]
    AgentNotFound(AgentId),

    /// The referenced run does not exist
    #[error("run not found: {0}")]
    RunNotFound(RunId),

    /// A budget or messaging policy rejected the operation
    #[error("policy denied: {reason}")]
    PolicyDenied {
        /// The policy's explanation, suitable for surfacing to callers
        reason: String,
    },

    /// No sticky entry, binding, semantic match, or default agent applied
    #[error("no route matched: {reason}")]
    NoRouteMatched {
        /// Why each routing stage declined the request
        reason: String,
    },

    /// A tool invocation carried a session id the kernel has never seen
    #[error("unknown session: {0}")]
    SessionNotFound(SessionId),

    /// The kernel has been closed and no longer accepts work
    #[error("kernel is closed")]
    Closed,

    /// A field of a request failed validation
    #[error("invalid {field}: {reason}")]
    Validation {
        /// Name of the offending field
        field: String,
        /// What was wrong with it
        reason: String,
    },

    /// Serialization of a payload or event failed
    #[error("serialization error: {source}")]
    Serialization {
        /// The underlying serde error
        #[from]
        source: serde_json::Error,
    },
}

impl KernelError {
    /// Shorthand for a validation error.
    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
