#![warn(missing_docs)]

//! # keybridge-engine-ref
//!
//! A deterministic reference implementation of the [`CoreKit`] engine
//! capability, used by the `keybridge-worker` sandbox process and by tests.
//!
//! It models the observable lifecycle of a threshold key manager without any
//! network service: an Ed25519 key derived from per-account metadata, factor
//! keys that gate access to it, MFA with device and recovery factors, and a
//! manual sync mode that defers metadata writes until `commit_changes`. Every
//! piece of account data goes through the [`Storage`] handle the engine was
//! built with, so inside the sandbox it lands in the host's backend.

use std::sync::Arc;

use keybridge_core::types::{CoreKitOptions, KeyType};
use keybridge_core::{CoreKit, CoreKitFactory, EngineError, Storage};

mod engine;
mod keys;

pub use engine::RefCoreKit;

/// Builds [`RefCoreKit`] instances.
#[derive(Debug, Default, Clone, Copy)]
pub struct RefCoreKitFactory;

impl CoreKitFactory for RefCoreKitFactory {
    fn create(
        &self,
        options: CoreKitOptions,
        storage: Arc<dyn Storage>,
    ) -> Result<Arc<dyn CoreKit>, EngineError> {
        if options.client_id.trim().is_empty() {
            return Err(EngineError::InvalidInput("clientId is required".into()));
        }
        if options.key_type != KeyType::Ed25519 {
            return Err(EngineError::Unsupported(format!(
                "key type {:?}",
                options.key_type
            )));
        }
        tracing::debug!(network = ?options.network, "creating reference engine");
        Ok(Arc::new(RefCoreKit::new(options, storage)))
    }
}
