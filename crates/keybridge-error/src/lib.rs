#![warn(missing_docs)]

//! Typed error types for the keybridge RPC bridge.
//!
//! Provides [`BridgeError`], the canonical error for every bridge operation on
//! either side of the channel, plus [`EngineError`] and [`StorageError`] for the
//! two external capabilities the bridge wraps. [`ErrorPayload`] is the wire form
//! carried inside `error` envelopes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Wire shape of the `error` field of an error envelope.
///
/// Carries enough for the caller to log and correlate a failure without
/// exposing the transport's internal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    /// Human readable failure description.
    pub message: String,
    /// The action of the request that failed, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub originating_action: Option<String>,
    /// The (redacted) payload of the request that failed, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub originating_payload: Option<Value>,
    /// Stable error code, see [`BridgeError::code`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorPayload {
    /// Build a payload carrying only a message.
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            originating_action: None,
            originating_payload: None,
            code: None,
        }
    }
}

/// Canonical error type for bridge operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BridgeError {
    /// An action other than `init` was called before an instance was bound.
    #[error("not initialized: call init() before '{action}'")]
    NotInitialized {
        /// The action that was attempted.
        action: String,
    },

    /// No engine instance is registered under this identifier.
    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    /// No storage backend is bound to this instance identifier.
    #[error("storage instance not found: {0}")]
    StorageNotFound(String),

    /// The envelope named an action this side does not handle.
    #[error("unknown action '{action}'")]
    UnknownAction {
        /// The unrecognised action name.
        action: String,
    },

    /// The envelope violated the protocol schema.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// A caller supplied argument was rejected before anything was sent.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A locally cached state field is not available yet.
    #[error("{0}")]
    StateUnavailable(String),

    /// A correlation key was registered while a previous call with the same
    /// key was still pending.
    #[error("duplicate correlation key: '{correlation_id}' / '{action}' is still pending")]
    DuplicateCorrelation {
        /// The reused correlation identifier.
        correlation_id: String,
        /// The action of the reused key.
        action: String,
    },

    /// No response arrived within the configured deadline.
    #[error("call '{action}' timed out after {timeout_ms}ms")]
    Timeout {
        /// The action that timed out.
        action: String,
        /// The deadline in milliseconds.
        timeout_ms: u64,
    },

    /// The wrapped engine failed while executing a dispatched call.
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// A storage backend failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// The other side of the channel answered with an error envelope.
    #[error("{message}")]
    Remote {
        /// The action of the failed call.
        action: String,
        /// Message reported by the remote side.
        message: String,
        /// Error code reported by the remote side, if any.
        code: Option<String>,
    },

    /// The channel to the other side is gone.
    #[error("transport closed")]
    TransportClosed,

    /// A payload could not be (de)serialized.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An internal error (catch-all for unexpected failures).
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl BridgeError {
    /// Returns a stable error code string for programmatic matching.
    ///
    /// Errors received from the other side keep the code they were sent with.
    pub fn code(&self) -> &str {
        match self {
            Self::NotInitialized { .. } => "NOT_INITIALIZED",
            Self::InstanceNotFound(_) => "INSTANCE_NOT_FOUND",
            Self::StorageNotFound(_) => "STORAGE_NOT_FOUND",
            Self::UnknownAction { .. } => "UNKNOWN_ACTION",
            Self::MalformedEnvelope(_) => "MALFORMED_ENVELOPE",
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::StateUnavailable(_) => "STATE_UNAVAILABLE",
            Self::DuplicateCorrelation { .. } => "DUPLICATE_CORRELATION",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Engine(e) => e.code(),
            Self::Storage(e) => e.code(),
            Self::Remote { code, .. } => code.as_deref().unwrap_or("REMOTE"),
            Self::TransportClosed => "TRANSPORT_CLOSED",
            Self::Serialization(_) => "SERIALIZATION",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// Returns whether the call that produced this error may succeed if retried.
    pub fn retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Storage(e) => e.retryable(),
            Self::Remote { code, .. } => {
                matches!(code.as_deref(), Some("TIMEOUT") | Some("STORAGE_TIMEOUT"))
            }
            Self::NotInitialized { .. }
            | Self::InstanceNotFound(_)
            | Self::StorageNotFound(_)
            | Self::UnknownAction { .. }
            | Self::MalformedEnvelope(_)
            | Self::InvalidArgument(_)
            | Self::StateUnavailable(_)
            | Self::DuplicateCorrelation { .. }
            | Self::Engine(_)
            | Self::TransportClosed
            | Self::Serialization(_)
            | Self::Internal(_) => false,
        }
    }

    /// Convert into the wire payload of an error envelope.
    pub fn to_payload(&self, action: Option<&str>, payload: Option<Value>) -> ErrorPayload {
        ErrorPayload {
            message: self.to_string(),
            originating_action: action.map(str::to_string),
            originating_payload: payload,
            code: Some(self.code().to_string()),
        }
    }

    /// Rebuild an error received in an error envelope for `action`.
    pub fn from_payload(action: impl Into<String>, payload: ErrorPayload) -> Self {
        Self::Remote {
            action: action.into(),
            message: payload.message,
            code: payload.code,
        }
    }
}

/// Errors raised by a wrapped protocol engine.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// The engine does not implement this operation.
    #[error("operation '{0}' is not supported by this engine")]
    Unsupported(String),

    /// The operation is not valid in the engine's current status.
    #[error("invalid state for '{operation}': engine is {status}")]
    InvalidState {
        /// The attempted operation.
        operation: String,
        /// The engine status at the time of the call.
        status: String,
    },

    /// The caller supplied an unusable argument.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The engine's storage failed.
    #[error("engine storage failure: {0}")]
    Storage(#[from] StorageError),

    /// An internal engine failure.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    /// Returns a stable error code string for programmatic matching.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unsupported(_) => "UNSUPPORTED",
            Self::InvalidState { .. } => "INVALID_STATE",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::Storage(e) => e.code(),
            Self::Internal(_) => "ENGINE_INTERNAL",
        }
    }
}

/// Errors raised by storage backends and the storage relay.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// The backend failed to read or write.
    #[error("storage backend failure: {0}")]
    Backend(String),

    /// Filesystem error in a file backed store.
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored data could not be decoded.
    #[error("stored data is corrupt: {0}")]
    Corrupt(String),

    /// The relayed request did not complete within its deadline.
    #[error("storage request timed out after {timeout_ms}ms")]
    Timeout {
        /// The deadline in milliseconds.
        timeout_ms: u64,
    },

    /// The host rejected the relayed request.
    #[error("storage request failed: {message}")]
    Remote {
        /// Error code reported by the host.
        code: String,
        /// Message reported by the host.
        message: String,
    },
}

impl StorageError {
    /// Returns a stable error code string for programmatic matching.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Backend(_) => "STORAGE_BACKEND",
            Self::Io(_) => "STORAGE_IO",
            Self::Corrupt(_) => "STORAGE_CORRUPT",
            Self::Timeout { .. } => "STORAGE_TIMEOUT",
            Self::Remote { .. } => "STORAGE_REMOTE",
        }
    }

    /// Returns whether the request may succeed if retried.
    pub fn retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Io(_))
    }
}

// Compile-time assertion: errors cross task boundaries
const _: fn() = || {
    fn assert_bounds<T: Send + Sync + 'static>() {}
    assert_bounds::<BridgeError>();
    assert_bounds::<EngineError>();
    assert_bounds::<StorageError>();
};
