#![warn(missing_docs)]

//! # keybridge-client
//!
//! [`CoreKitClient`] gives the host application a method per engine action on
//! top of a [`HostBridge`]. It owns the binding to one engine instance in the
//! sandbox and keeps a local copy of the instance's status and state, replaced
//! wholesale by every successful call.
//!
//! ```ignore
//! let client = CoreKitClient::new(bridge, options, storage)?;
//! client.init(InitParams::default()).await?;
//! client.login_with_jwt(jwt).await?;
//! let signature = client.sign(message, false).await?;
//! client.logout().await?;
//! ```

use std::sync::{Arc, PoisonError, RwLock};

use serde::de::DeserializeOwned;
use tokio::sync::Mutex;

use keybridge_core::types::{
    CoreKitOptions, CoreKitState, CoreKitStatus, CreateFactorParams, EnableMfaParams, InitParams,
    JwtLoginParams, KeyDetails, KeyType, PubKeyPoint, StateSnapshot, UserInfo,
};
use keybridge_core::{Binary, BridgeError, CoreKitRequest, HostBridge, InstanceId, Storage};

/// The factor key the engine is currently using.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentFactor {
    /// Hex encoded factor key.
    pub factor_key: String,
    /// Share index the factor unlocks.
    pub share_index: u32,
}

/// Host-side handle on one engine instance.
pub struct CoreKitClient {
    bridge: Arc<HostBridge>,
    options: CoreKitOptions,
    storage: Arc<dyn Storage>,
    instance: RwLock<Option<InstanceId>>,
    snapshot: RwLock<StateSnapshot>,
    /// Serializes instance creation and teardown.
    lifecycle: Mutex<()>,
}

impl CoreKitClient {
    /// A client for `bridge` whose engine will persist into `storage`.
    ///
    /// Nothing is sent until [`init`](Self::init).
    pub fn new(
        bridge: Arc<HostBridge>,
        options: CoreKitOptions,
        storage: Arc<dyn Storage>,
    ) -> Result<Self, BridgeError> {
        if options.client_id.trim().is_empty() {
            return Err(BridgeError::InvalidArgument("clientId is required".into()));
        }
        Ok(Self {
            bridge,
            options,
            storage,
            instance: RwLock::new(None),
            snapshot: RwLock::new(StateSnapshot::default()),
            lifecycle: Mutex::new(()),
        })
    }

    /// The bound engine instance, if any.
    pub fn instance_id(&self) -> Option<InstanceId> {
        self.instance
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Status as of the last successful call.
    pub fn status(&self) -> CoreKitStatus {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .status
    }

    /// State as of the last successful call.
    pub fn state(&self) -> CoreKitState {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .state
            .clone()
    }

    /// The factor key in use.
    pub fn current_factor_key(&self) -> Result<CurrentFactor, BridgeError> {
        let state = self.state();
        match (state.factor_key, state.tss_share_index) {
            (Some(factor_key), Some(share_index)) => Ok(CurrentFactor {
                factor_key,
                share_index,
            }),
            _ => Err(BridgeError::StateUnavailable(
                "Factor key not available".into(),
            )),
        }
    }

    /// The logged in user.
    pub fn user_info(&self) -> Result<UserInfo, BridgeError> {
        self.state().user_info.ok_or_else(|| {
            BridgeError::StateUnavailable("userInfo not set, please login first".into())
        })
    }

    /// Public key of the threshold key.
    pub fn pub_key(&self) -> Result<Binary, BridgeError> {
        self.state().tss_pub_key.ok_or_else(|| {
            BridgeError::StateUnavailable("tssPubKey not set, please login first".into())
        })
    }

    /// Session signatures of the logged in user; empty before login.
    pub fn signatures(&self) -> Vec<String> {
        self.state().signatures
    }

    /// Whether the key type supports multiple wallet indexes. Ed25519 keys
    /// do not.
    pub fn supports_account_index(&self) -> bool {
        self.options.key_type != KeyType::Ed25519
    }

    /// Initialise the engine, creating an instance first if none is bound.
    pub async fn init(&self, params: InitParams) -> Result<(), BridgeError> {
        {
            let _lifecycle = self.lifecycle.lock().await;
            if self.instance_id().is_none() {
                self.create_instance().await?;
            }
        }
        self.request(CoreKitRequest::Init { params }).await
    }

    /// Log in with an identity token.
    pub async fn login_with_jwt(&self, jwt: JwtLoginParams) -> Result<(), BridgeError> {
        self.request(CoreKitRequest::LoginWithJwt { jwt }).await
    }

    /// Unlock a `REQUIRED_SHARE` session with a hex factor key.
    pub async fn input_factor_key(&self, factor_key: &str) -> Result<(), BridgeError> {
        self.request(CoreKitRequest::InputFactorKey {
            factor_key: factor_key.to_string(),
        })
        .await
    }

    /// Register a new factor; returns its hex factor key.
    pub async fn create_factor(&self, params: CreateFactorParams) -> Result<String, BridgeError> {
        self.request(CoreKitRequest::CreateFactor {
            create_factor_params: params,
        })
        .await
    }

    /// Remove the factor whose public key is `factor_pub`.
    pub async fn delete_factor(
        &self,
        factor_pub: &str,
        factor_key: Option<&str>,
    ) -> Result<(), BridgeError> {
        self.request(CoreKitRequest::DeleteFactor {
            factor_pub: factor_pub.to_string(),
            factor_key: factor_key.map(str::to_string),
        })
        .await
    }

    /// Enable MFA; returns the recovery factor key when one was requested.
    pub async fn enable_mfa(
        &self,
        params: EnableMfaParams,
        recovery_factor: bool,
    ) -> Result<Option<String>, BridgeError> {
        self.request(CoreKitRequest::EnableMfa {
            enable_mfa_params: params,
            recovery_factor,
        })
        .await
    }

    /// Flush metadata changes made in manual sync mode.
    pub async fn commit_changes(&self) -> Result<(), BridgeError> {
        self.request(CoreKitRequest::CommitChanges {}).await
    }

    /// Sign `data`, hashing it first unless `hashed` is set.
    pub async fn sign(&self, data: impl Into<Binary>, hashed: bool) -> Result<Binary, BridgeError> {
        self.request(CoreKitRequest::Sign {
            data: data.into(),
            hashed,
        })
        .await
    }

    /// End the session and bind a fresh, uninitialised instance.
    pub async fn logout(&self) -> Result<(), BridgeError> {
        let _lifecycle = self.lifecycle.lock().await;
        self.request::<()>(CoreKitRequest::Logout {}).await?;
        *self.instance.write().unwrap_or_else(PoisonError::into_inner) = None;
        self.replace_snapshot(StateSnapshot::default());
        self.create_instance().await
    }

    /// Describe how the key is split across factors.
    pub async fn get_key_details(&self) -> Result<KeyDetails, BridgeError> {
        self.request(CoreKitRequest::GetKeyDetails {}).await
    }

    /// The device factor key stored on this device.
    pub async fn get_device_factor(&self) -> Result<Option<String>, BridgeError> {
        self.request(CoreKitRequest::GetDeviceFactor {}).await
    }

    /// Store `factor_key` as the device factor.
    pub async fn set_device_factor(&self, factor_key: &str, replace: bool) -> Result<(), BridgeError> {
        self.request(CoreKitRequest::SetDeviceFactor {
            factor_key: factor_key.to_string(),
            replace,
        })
        .await
    }

    /// Switch manual sync mode.
    pub async fn set_manual_sync(&self, manual_sync: bool) -> Result<(), BridgeError> {
        self.request(CoreKitRequest::SetManualSync { manual_sync }).await
    }

    /// Select the active wallet index.
    pub async fn set_tss_wallet_index(&self, account_index: u32) -> Result<(), BridgeError> {
        self.request(CoreKitRequest::SetTssWalletIndex { account_index })
            .await
    }

    /// Public keys of the factors that can unlock the key.
    pub async fn get_tss_factor_pub(&self) -> Result<Vec<String>, BridgeError> {
        self.request(CoreKitRequest::GetTssFactorPub {}).await
    }

    /// Public key of the threshold key, read from the engine.
    pub async fn get_pub_key(&self) -> Result<Binary, BridgeError> {
        self.request(CoreKitRequest::GetPubKey {}).await
    }

    /// Public key in Ed25519 encoding.
    pub async fn get_pub_key_ed25519(&self) -> Result<Binary, BridgeError> {
        self.request(CoreKitRequest::GetPubKeyEd25519 {}).await
    }

    /// Public key as a curve point (secp256k1 keys).
    pub async fn get_pub_key_point(&self) -> Result<PubKeyPoint, BridgeError> {
        self.request(CoreKitRequest::GetPubKeyPoint {}).await
    }

    /// Reconstruct the full private key. Hex encoded.
    pub async fn unsafe_export_tss_key(&self) -> Result<String, BridgeError> {
        self.request(CoreKitRequest::UnsafeExportTssKey {}).await
    }

    /// Reconstruct the Ed25519 seed of the key.
    pub async fn unsafe_export_tss_ed25519_seed(&self) -> Result<Binary, BridgeError> {
        self.request(CoreKitRequest::UnsafeExportTssEd25519Seed {})
            .await
    }

    /// Wipe the account's metadata, then log out.
    pub async fn unsafe_reset_account(&self) -> Result<(), BridgeError> {
        self.request::<()>(CoreKitRequest::UnsafeResetAccount {})
            .await?;
        self.logout().await
    }

    async fn create_instance(&self) -> Result<(), BridgeError> {
        let (instance, reply) = self
            .bridge
            .create_instance(&self.options, self.storage.clone())
            .await?;
        tracing::debug!(instance_id = %instance, "bound engine instance");
        *self.instance.write().unwrap_or_else(PoisonError::into_inner) = Some(instance);
        self.replace_snapshot(reply.snapshot());
        Ok(())
    }

    async fn request<T: DeserializeOwned>(&self, request: CoreKitRequest) -> Result<T, BridgeError> {
        let action = request.action();
        let instance = self
            .instance_id()
            .ok_or_else(|| BridgeError::NotInitialized {
                action: action.to_string(),
            })?;
        let reply = self.bridge.call(&instance, request).await?;
        // A logout may have bound a new instance while this call was out.
        // The instance is re-read under the snapshot lock so a concurrent
        // logout either sees this snapshot or overwrites it.
        let current = {
            let mut snapshot = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
            let current = self.instance_id().as_ref() == Some(&instance);
            if current {
                *snapshot = reply.snapshot();
            }
            current
        };
        if !current {
            tracing::debug!(%action, instance_id = %instance, "reply from a replaced instance, keeping snapshot");
        }
        tracing::trace!(%action, status = %reply.status, "call complete");
        Ok(serde_json::from_value(reply.result)?)
    }

    fn replace_snapshot(&self, snapshot: StateSnapshot) {
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = snapshot;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keybridge_core::transport::duplex;
    use keybridge_core::{BridgeConfig, MemoryStorage};

    fn bridge() -> Arc<HostBridge> {
        let (host_link, _sandbox_link) = duplex();
        HostBridge::start(host_link, BridgeConfig::default()).0
    }

    #[tokio::test]
    async fn client_id_is_required() {
        let err = CoreKitClient::new(
            bridge(),
            CoreKitOptions::default(),
            Arc::new(MemoryStorage::new()),
        )
        .err()
        .unwrap();
        assert_eq!(err.code(), "INVALID_ARGUMENT");
    }

    #[tokio::test]
    async fn calls_before_init_are_refused_locally() {
        let host = bridge();
        let options = CoreKitOptions {
            client_id: "app".into(),
            ..CoreKitOptions::default()
        };
        let client = CoreKitClient::new(host.clone(), options, Arc::new(MemoryStorage::new())).unwrap();

        let err = client.sign(vec![1u8, 2, 3], false).await.unwrap_err();
        assert_eq!(err.code(), "NOT_INITIALIZED");
        assert!(err.to_string().contains("'sign'"));
        let err = client.logout().await.unwrap_err();
        assert_eq!(err.code(), "NOT_INITIALIZED");
        assert_eq!(host.pending_calls(), 0);
        assert_eq!(client.status(), CoreKitStatus::NotInitialized);
    }

    #[tokio::test]
    async fn local_accessors_need_a_login() {
        let options = CoreKitOptions {
            client_id: "app".into(),
            ..CoreKitOptions::default()
        };
        let client = CoreKitClient::new(bridge(), options, Arc::new(MemoryStorage::new())).unwrap();
        assert_eq!(
            client.current_factor_key().unwrap_err().to_string(),
            "Factor key not available"
        );
        assert_eq!(
            client.user_info().unwrap_err().to_string(),
            "userInfo not set, please login first"
        );
        assert_eq!(client.pub_key().unwrap_err().code(), "STATE_UNAVAILABLE");
        assert!(client.signatures().is_empty());
    }

    #[tokio::test]
    async fn account_index_support_follows_key_type() {
        let ed25519 = CoreKitOptions {
            client_id: "app".into(),
            ..CoreKitOptions::default()
        };
        let secp256k1 = CoreKitOptions {
            key_type: KeyType::Secp256k1,
            ..ed25519.clone()
        };
        let storage = Arc::new(MemoryStorage::new());
        let client = CoreKitClient::new(bridge(), ed25519, storage.clone()).unwrap();
        assert!(!client.supports_account_index());
        let client = CoreKitClient::new(bridge(), secp256k1, storage).unwrap();
        assert!(client.supports_account_index());
    }
}
