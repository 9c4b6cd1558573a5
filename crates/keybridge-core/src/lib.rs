#![warn(missing_docs)]

//! # keybridge-core
//!
//! Cross-boundary RPC bridge between a host application and a key-management
//! engine that only runs inside an isolated sandbox.
//!
//! The two sides share nothing but an asynchronous channel of JSON
//! [`Envelope`]s. Every call is a correlated request/response pair:
//!
//! - **host → sandbox**: engine operations, dispatched by [`SandboxBridge`] to
//!   the engine instance named in the envelope
//! - **sandbox → host**: `getItem`/`setItem` storage operations raised by the
//!   engine, served by [`HostBridge`] from the backend bound to the instance
//!
//! Both directions use the same [`CorrelationTable`] to turn a one-way send into
//! an awaitable call with a deadline.
//!
//! ## Guarantees
//!
//! - **At most one resolution** per pending call, matched by content
//!   (`correlationId` + `action`), never by arrival position
//! - **No unhandled failures across the boundary**: protocol, engine and storage
//!   errors become error envelopes; unmatched responses are logged and dropped
//! - **Bounded calls**: every call carries a deadline; a timed out or dropped
//!   call leaves no entry behind and asks the other side to abort its work
//! - **Lossless binaries**: byte buffers travel as tagged [`Binary`] values

pub mod codec;
pub mod config;
pub mod correlation;
pub mod engine;
pub mod envelope;
pub mod frame;
pub mod host;
mod inflight;
pub mod process;
pub mod redact;
pub mod sandbox;
pub mod storage;
pub mod transport;
pub mod types;

pub use codec::Binary;
pub use config::BridgeConfig;
pub use correlation::{CorrelationTable, PendingCall};
pub use engine::{CoreKit, CoreKitFactory};
pub use envelope::{
    CallKey, CoreKitAction, CoreKitReply, CoreKitRequest, CorrelationId, Envelope, EnvelopeKind,
    InstanceId, Signal, StorageAction, StorageRequest,
};
pub use host::HostBridge;
pub use keybridge_error::{BridgeError, EngineError, ErrorPayload, StorageError};
pub use sandbox::{InstanceRegistry, SandboxBridge};
pub use storage::{FileStorage, MemoryStorage, StorageDelegate};
pub use transport::Link;

/// Key/value capability consumed by an engine instance.
///
/// The host application supplies one backend per engine instance when the
/// instance is created. Inside the sandbox the engine sees a proxy whose calls
/// are relayed to that backend over the bridge.
#[async_trait::async_trait]
pub trait Storage: Send + Sync {
    /// Read the value stored under `key`.
    ///
    /// Returns `None` if nothing is stored; a missing key is not an error.
    async fn get_item(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Store `value` under `key`, replacing any previous value.
    async fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError>;
}
