//! Error taxonomy of the connection core.

use thiserror::Error;

/// Errors produced by the connection core and the fabric layer.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Caller-visible validation failure, raised before any side effect.
    #[error("bad argument: {reason}")]
    BadArgument {
        /// What was wrong with the argument.
        reason: String,
    },

    /// The operation is not legal in the connection's current state.
    #[error("operation '{operation}' not allowed in state '{state}'")]
    WrongState {
        /// The operation that was attempted.
        operation: &'static str,
        /// The state the connection was in.
        state: String,
    },

    /// Establish was called on an already-active connection. Non-fatal.
    #[error("connection already established")]
    AlreadyInitialized,

    /// Device or endpoint bring-up failed; the connection transitions to closed.
    #[error("endpoint initialization failed: {reason}")]
    InitializationFailed {
        /// Provider-reported failure detail.
        reason: String,
    },

    /// Buffer allocation or fabric memory registration failed; the connection
    /// transitions to closed.
    #[error("memory registration failed: {reason}")]
    MemoryRegistrationFailed {
        /// Allocation or registration failure detail.
        reason: String,
    },

    /// A non-blocking acquire found the pool empty.
    #[error("no buffer available")]
    NoBuffer,

    /// The context was cancelled during a blocking operation.
    #[error("operation cancelled")]
    Cancelled,

    /// Local or peer-initiated shutdown was observed mid-operation.
    #[error("connection closed")]
    ConnClosed,

    /// Unrecoverable fabric-level failure; triggers internal shutdown.
    #[error("fabric error: {reason}")]
    FabricError {
        /// Fabric-reported failure detail.
        reason: String,
    },
}

impl TransportError {
    pub(crate) fn bad_argument(reason: impl Into<String>) -> Self {
        TransportError::BadArgument {
            reason: reason.into(),
        }
    }

    pub(crate) fn wrong_state(operation: &'static str, state: impl ToString) -> Self {
        TransportError::WrongState {
            operation,
            state: state.to_string(),
        }
    }

    pub(crate) fn fabric(reason: impl Into<String>) -> Self {
        TransportError::FabricError {
            reason: reason.into(),
        }
    }
}

/// Result alias used throughout the transport crate.
pub type Result<T> = std::result::Result<T, TransportError>;
