//! The engine capability the sandbox dispatches to.
//!
//! The bridge treats the key-management engine as an opaque object with a
//! fixed method surface. Methods take `&self`: calls are not serialized per
//! instance, so an engine that is not reentrant guards its own state.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use keybridge_error::EngineError;

use crate::codec::Binary;
use crate::types::{
    CoreKitOptions, CoreKitState, CoreKitStatus, CreateFactorParams, EnableMfaParams, InitParams,
    JwtLoginParams, KeyDetails, PubKeyPoint,
};
use crate::Storage;

fn unsupported<T>(operation: &str) -> Result<T, EngineError> {
    Err(EngineError::Unsupported(operation.to_string()))
}

/// A stateful threshold-signature key manager.
///
/// Results are plain JSON so they can cross the channel as is; byte buffers
/// inside them use the tagged [`Binary`] encoding.
#[async_trait]
pub trait CoreKit: Send + Sync {
    /// Current lifecycle status.
    fn status(&self) -> CoreKitStatus;

    /// Current state record.
    fn state(&self) -> CoreKitState;

    /// Initialise, optionally restoring a persisted session.
    async fn init(&self, params: InitParams) -> Result<Value, EngineError>;

    /// Log in with an identity token.
    async fn login_with_jwt(&self, params: JwtLoginParams) -> Result<Value, EngineError>;

    /// Supply a factor key to unlock a `REQUIRED_SHARE` session.
    async fn input_factor_key(&self, factor_key: &str) -> Result<Value, EngineError>;

    /// Register a new factor; returns its hex factor key.
    async fn create_factor(&self, params: CreateFactorParams) -> Result<Value, EngineError>;

    /// Remove a factor by its public key.
    async fn delete_factor(
        &self,
        factor_pub: &str,
        factor_key: Option<&str>,
    ) -> Result<Value, EngineError>;

    /// Move from a single-factor to a device + recovery setup.
    async fn enable_mfa(
        &self,
        params: EnableMfaParams,
        recovery_factor: bool,
    ) -> Result<Value, EngineError>;

    /// Flush pending metadata changes (manual sync mode).
    async fn commit_changes(&self) -> Result<Value, EngineError>;

    /// Sign `data`; it is hashed first unless `hashed` is set.
    async fn sign(&self, data: &Binary, hashed: bool) -> Result<Value, EngineError>;

    /// End the session.
    async fn logout(&self) -> Result<Value, EngineError>;

    /// Describe how the key is split across factors.
    async fn get_key_details(&self) -> Result<KeyDetails, EngineError> {
        unsupported("get_key_details")
    }

    /// The device factor key stored on this device, if any.
    async fn get_device_factor(&self) -> Result<Option<String>, EngineError> {
        unsupported("get_device_factor")
    }

    /// Store `factor_key` as the device factor.
    async fn set_device_factor(&self, _factor_key: &str, _replace: bool) -> Result<(), EngineError> {
        unsupported("set_device_factor")
    }

    /// Switch manual sync mode.
    async fn set_manual_sync(&self, _manual_sync: bool) -> Result<(), EngineError> {
        unsupported("set_manual_sync")
    }

    /// Select the active wallet index.
    async fn set_tss_wallet_index(&self, _account_index: u32) -> Result<(), EngineError> {
        unsupported("set_tss_wallet_index")
    }

    /// Public keys of the factors that can unlock the key.
    async fn get_tss_factor_pub(&self) -> Result<Vec<String>, EngineError> {
        unsupported("get_tss_factor_pub")
    }

    /// Public key of the threshold key.
    async fn get_pub_key(&self) -> Result<Binary, EngineError> {
        unsupported("get_pub_key")
    }

    /// Public key in Ed25519 encoding. Fails for other key types.
    async fn get_pub_key_ed25519(&self) -> Result<Binary, EngineError> {
        unsupported("get_pub_key_ed25519")
    }

    /// Public key as a curve point. secp256k1 keys only.
    async fn get_pub_key_point(&self) -> Result<PubKeyPoint, EngineError> {
        unsupported("get_pub_key_point")
    }

    /// Reconstruct and return the full private key.
    async fn unsafe_export_tss_key(&self) -> Result<String, EngineError> {
        unsupported("_UNSAFE_exportTssKey")
    }

    /// Reconstruct and return the Ed25519 seed of the key.
    async fn unsafe_export_tss_ed25519_seed(&self) -> Result<Binary, EngineError> {
        unsupported("_UNSAFE_exportTssEd25519Seed")
    }

    /// Wipe all metadata of the logged in account.
    async fn unsafe_reset_account(&self) -> Result<(), EngineError> {
        unsupported("_UNSAFE_resetAccount")
    }
}

/// Builds engine instances for the sandbox.
pub trait CoreKitFactory: Send + Sync {
    /// Build an engine from the host's options; `storage` relays to the
    /// backend the host bound to the new instance.
    fn create(
        &self,
        options: CoreKitOptions,
        storage: Arc<dyn Storage>,
    ) -> Result<Arc<dyn CoreKit>, EngineError>;
}
