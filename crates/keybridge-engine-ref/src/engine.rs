//! The reference engine.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use ed25519_dalek::Signer;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;

use keybridge_core::types::{
    CoreKitOptions, CoreKitState, CoreKitStatus, CreateFactorParams, EnableMfaParams, InitParams,
    JwtLoginParams, KeyDetails, KeyType, PubKeyPoint, ShareType, StateSnapshot, UserInfo,
};
use keybridge_core::{Binary, CoreKit, EngineError, Storage};

use crate::keys::{self, FactorKey, TssSeed};

const SESSION_KEY: &str = "keybridge:session";

/// Share index of the factor derived from the login alone.
const HASHED_SHARE_INDEX: u32 = 1;

/// Social login share plus one factor.
const THRESHOLD: u32 = 2;

fn metadata_key(user: &UserInfo) -> String {
    format!("keybridge:metadata:{}:{}", user.verifier, user.verifier_id)
}

fn device_factor_key(user: &UserInfo) -> String {
    format!("keybridge:device_factor:{}:{}", user.verifier, user.verifier_id)
}

/// Account metadata persisted per user.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Metadata {
    nonce: String,
    mfa_enabled: bool,
    /// Factor public key → entry.
    factors: BTreeMap<String, FactorEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FactorEntry {
    share_index: u32,
    description: String,
}

/// What `init` restores when rehydrating.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedSession {
    user_info: UserInfo,
    factor_key: String,
    account_index: u32,
    signatures: Vec<String>,
}

/// Mutable engine state, guarded by one async lock.
#[derive(Debug, Default)]
struct Session {
    status: CoreKitStatus,
    manual_sync: bool,
    user: Option<UserInfo>,
    metadata: Option<Metadata>,
    dirty: bool,
    factor: Option<FactorKey>,
    share_index: Option<u32>,
    account_index: u32,
    signatures: Vec<String>,
}

/// Deterministic Ed25519 key manager.
///
/// Factors gate access to a key derived from the account nonce. All account
/// data lives in the storage the engine was built with; nothing is kept
/// outside it across instances.
pub struct RefCoreKit {
    options: CoreKitOptions,
    storage: Arc<dyn Storage>,
    session: Mutex<Session>,
    snapshot: RwLock<StateSnapshot>,
}

impl RefCoreKit {
    /// An engine in `NOT_INITIALIZED` state.
    pub fn new(options: CoreKitOptions, storage: Arc<dyn Storage>) -> Self {
        let session = Session {
            manual_sync: options.manual_sync,
            ..Session::default()
        };
        Self {
            options,
            storage,
            session: Mutex::new(session),
            snapshot: RwLock::new(StateSnapshot::default()),
        }
    }

    fn seed<'a>(&'a self, user: &'a UserInfo, metadata: &'a Metadata, account_index: u32) -> TssSeed<'a> {
        TssSeed {
            client_id: &self.options.client_id,
            network: self.options.network,
            verifier: &user.verifier,
            verifier_id: &user.verifier_id,
            nonce: &metadata.nonce,
            account_index,
        }
    }

    /// Copy the session into the snapshot read by `status`/`state`.
    fn publish(&self, session: &Session) {
        let tss_pub_key = match (&session.user, &session.metadata) {
            (Some(user), Some(metadata)) => Some(Binary::new(
                self.seed(user, metadata, session.account_index)
                    .verifying_key()
                    .to_bytes()
                    .to_vec(),
            )),
            _ => None,
        };
        let snapshot = StateSnapshot {
            status: session.status,
            state: CoreKitState {
                account_index: session.account_index,
                factor_key: session.factor.as_ref().map(FactorKey::to_hex),
                tss_share_index: session.share_index,
                tss_pub_key,
                user_info: session.user.clone(),
                signatures: session.signatures.clone(),
            },
        };
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = snapshot;
    }

    fn require(
        &self,
        session: &Session,
        operation: &str,
        allowed: &[CoreKitStatus],
    ) -> Result<(), EngineError> {
        if allowed.contains(&session.status) {
            Ok(())
        } else {
            Err(EngineError::InvalidState {
                operation: operation.to_string(),
                status: session.status.to_string(),
            })
        }
    }

    async fn read(&self, key: &str) -> Result<Option<String>, EngineError> {
        Ok(self
            .storage
            .get_item(key)
            .await?
            .filter(|value| !value.is_empty()))
    }

    async fn load_metadata(&self, user: &UserInfo) -> Result<Option<Metadata>, EngineError> {
        match self.read(&metadata_key(user)).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| EngineError::Internal(anyhow::anyhow!("corrupt account metadata: {e}"))),
            None => Ok(None),
        }
    }

    async fn write_metadata(&self, session: &mut Session) -> Result<(), EngineError> {
        let (Some(user), Some(metadata)) = (&session.user, &session.metadata) else {
            return Ok(());
        };
        let raw = serde_json::to_string(metadata)
            .map_err(|e| EngineError::Internal(anyhow::anyhow!(e)))?;
        self.storage.set_item(&metadata_key(user), &raw).await?;
        session.dirty = false;
        Ok(())
    }

    /// Persist metadata now, or mark it for `commit_changes` in manual sync mode.
    async fn sync(&self, session: &mut Session) -> Result<(), EngineError> {
        if session.manual_sync {
            session.dirty = true;
            Ok(())
        } else {
            self.write_metadata(session).await
        }
    }

    async fn write_session(&self, session: &Session) -> Result<(), EngineError> {
        let (Some(user), Some(factor)) = (&session.user, &session.factor) else {
            return Ok(());
        };
        let persisted = PersistedSession {
            user_info: user.clone(),
            factor_key: factor.to_hex(),
            account_index: session.account_index,
            signatures: session.signatures.clone(),
        };
        let raw = serde_json::to_string(&persisted)
            .map_err(|e| EngineError::Internal(anyhow::anyhow!(e)))?;
        self.storage.set_item(SESSION_KEY, &raw).await?;
        Ok(())
    }

    async fn rehydrate(&self, session: &mut Session) -> Result<(), EngineError> {
        let Some(raw) = self.read(SESSION_KEY).await? else {
            return Ok(());
        };
        let persisted: PersistedSession = match serde_json::from_str(&raw) {
            Ok(persisted) => persisted,
            Err(e) => {
                tracing::warn!(error = %e, "discarding unreadable session");
                self.storage.set_item(SESSION_KEY, "").await?;
                return Ok(());
            }
        };
        let factor = FactorKey::parse(&persisted.factor_key)?;
        let Some(metadata) = self.load_metadata(&persisted.user_info).await? else {
            tracing::warn!("discarding session of an account without metadata");
            self.storage.set_item(SESSION_KEY, "").await?;
            return Ok(());
        };
        let Some(entry) = metadata.factors.get(&factor.public()) else {
            tracing::warn!("discarding session with a deleted factor");
            self.storage.set_item(SESSION_KEY, "").await?;
            return Ok(());
        };
        session.share_index = Some(entry.share_index);
        session.factor = Some(factor);
        session.user = Some(persisted.user_info);
        session.metadata = Some(metadata);
        session.account_index = persisted.account_index;
        session.signatures = persisted.signatures;
        session.status = CoreKitStatus::LoggedIn;
        Ok(())
    }

    /// Switch to `factor` if it is registered.
    fn use_factor(session: &mut Session, factor: FactorKey) -> Result<(), EngineError> {
        let metadata = session
            .metadata
            .as_ref()
            .ok_or_else(|| EngineError::InvalidInput("no account metadata".into()))?;
        let entry = metadata
            .factors
            .get(&factor.public())
            .ok_or_else(|| EngineError::InvalidInput("factor key is not registered".into()))?;
        session.share_index = Some(entry.share_index);
        session.factor = Some(factor);
        session.status = CoreKitStatus::LoggedIn;
        Ok(())
    }

    fn metadata_mut(session: &mut Session) -> Result<&mut Metadata, EngineError> {
        session
            .metadata
            .as_mut()
            .ok_or_else(|| EngineError::InvalidInput("no account metadata".into()))
    }

    fn user(session: &Session) -> Result<&UserInfo, EngineError> {
        session
            .user
            .as_ref()
            .ok_or_else(|| EngineError::InvalidInput("no user logged in".into()))
    }
}

const SIGNED_IN: &[CoreKitStatus] = &[CoreKitStatus::LoggedIn];
const HAS_USER: &[CoreKitStatus] = &[CoreKitStatus::LoggedIn, CoreKitStatus::RequiredShare];

#[async_trait]
impl CoreKit for RefCoreKit {
    fn status(&self) -> CoreKitStatus {
        self.snapshot.read().unwrap_or_else(PoisonError::into_inner).status
    }

    fn state(&self) -> CoreKitState {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .state
            .clone()
    }

    async fn init(&self, params: InitParams) -> Result<Value, EngineError> {
        let mut session = self.session.lock().await;
        self.require(&session, "init", &[CoreKitStatus::NotInitialized])?;
        session.status = CoreKitStatus::Initialized;
        if params.rehydrate {
            if let Err(e) = self.rehydrate(&mut session).await {
                session.status = CoreKitStatus::NotInitialized;
                return Err(e);
            }
        }
        self.publish(&session);
        tracing::debug!(status = %session.status, "engine initialized");
        Ok(Value::Null)
    }

    async fn login_with_jwt(&self, params: JwtLoginParams) -> Result<Value, EngineError> {
        let mut session = self.session.lock().await;
        self.require(&session, "login_with_jwt", &[CoreKitStatus::Initialized])?;
        if params.verifier.is_empty() || params.verifier_id.is_empty() {
            return Err(EngineError::InvalidInput(
                "verifier and verifierId are required".into(),
            ));
        }
        if params.id_token.is_empty() {
            return Err(EngineError::InvalidInput("idToken is required".into()));
        }

        let user = UserInfo {
            verifier: params.verifier,
            verifier_id: params.verifier_id,
        };
        let hashed = FactorKey::hashed(&self.options.client_id, &user.verifier, &user.verifier_id);
        let (metadata, created) = match self.load_metadata(&user).await? {
            Some(metadata) => (metadata, false),
            None => {
                let mut factors = BTreeMap::new();
                factors.insert(
                    hashed.public(),
                    FactorEntry {
                        share_index: HASHED_SHARE_INDEX,
                        description: "hashed".into(),
                    },
                );
                let metadata = Metadata {
                    nonce: keys::generate_nonce(),
                    mfa_enabled: false,
                    factors,
                };
                (metadata, true)
            }
        };

        let device = if metadata.mfa_enabled {
            match self.read(&device_factor_key(&user)).await? {
                Some(hex_key) => Some(FactorKey::parse(&hex_key)?),
                None => None,
            }
        } else {
            None
        };
        let mfa_enabled = metadata.mfa_enabled;

        session.user = Some(user);
        session.metadata = Some(metadata);
        session.signatures = vec![keys::sha256_hex(params.id_token.as_bytes())];
        if created {
            self.sync(&mut session).await?;
        }

        let factor = if mfa_enabled { device } else { Some(hashed) };
        let unlocked = match factor {
            Some(factor) => Self::use_factor(&mut session, factor).is_ok(),
            None => false,
        };
        if unlocked {
            self.write_session(&session).await?;
        } else {
            session.status = CoreKitStatus::RequiredShare;
        }
        self.publish(&session);
        tracing::debug!(status = %session.status, created, "login complete");
        Ok(Value::Null)
    }

    async fn input_factor_key(&self, factor_key: &str) -> Result<Value, EngineError> {
        let mut session = self.session.lock().await;
        self.require(&session, "input_factor_key", HAS_USER)?;
        let factor = FactorKey::parse(factor_key)?;
        Self::use_factor(&mut session, factor)?;
        self.write_session(&session).await?;
        self.publish(&session);
        Ok(Value::Null)
    }

    async fn create_factor(&self, params: CreateFactorParams) -> Result<Value, EngineError> {
        let mut session = self.session.lock().await;
        self.require(&session, "create_factor", SIGNED_IN)?;
        let factor = match params.factor_key.as_deref() {
            Some(hex_key) => FactorKey::parse(hex_key)?,
            None => FactorKey::generate(),
        };
        let description = params.share_description.unwrap_or_else(|| match params.share_type {
            ShareType::Device => "device".to_string(),
            ShareType::Recovery => "recovery".to_string(),
        });
        let metadata = Self::metadata_mut(&mut session)?;
        let factor_pub = factor.public();
        if metadata.factors.contains_key(&factor_pub) {
            return Err(EngineError::InvalidInput("factor key is already registered".into()));
        }
        metadata.factors.insert(
            factor_pub,
            FactorEntry {
                share_index: params.share_type.share_index(),
                description,
            },
        );
        self.sync(&mut session).await?;
        self.publish(&session);
        Ok(json!(factor.to_hex()))
    }

    async fn delete_factor(
        &self,
        factor_pub: &str,
        factor_key: Option<&str>,
    ) -> Result<Value, EngineError> {
        let mut session = self.session.lock().await;
        self.require(&session, "delete_factor", SIGNED_IN)?;
        if let Some(hex_key) = factor_key {
            if FactorKey::parse(hex_key)?.public() != factor_pub {
                return Err(EngineError::InvalidInput(
                    "factor key does not match factorPub".into(),
                ));
            }
        }
        if session.factor.as_ref().map(FactorKey::public).as_deref() == Some(factor_pub) {
            return Err(EngineError::InvalidInput("cannot delete the factor in use".into()));
        }
        let metadata = Self::metadata_mut(&mut session)?;
        if metadata.factors.remove(factor_pub).is_none() {
            return Err(EngineError::InvalidInput(format!(
                "factor {factor_pub} is not registered"
            )));
        }
        self.sync(&mut session).await?;
        self.publish(&session);
        Ok(Value::Null)
    }

    async fn enable_mfa(
        &self,
        params: EnableMfaParams,
        recovery_factor: bool,
    ) -> Result<Value, EngineError> {
        let mut session = self.session.lock().await;
        self.require(&session, "enable_mfa", SIGNED_IN)?;
        let device = match params.factor_key.as_deref() {
            Some(hex_key) => FactorKey::parse(hex_key)?,
            None => FactorKey::generate(),
        };
        let recovery = recovery_factor.then(FactorKey::generate);
        let user = Self::user(&session)?.clone();
        let hashed = FactorKey::hashed(&self.options.client_id, &user.verifier, &user.verifier_id);

        let metadata = Self::metadata_mut(&mut session)?;
        if metadata.mfa_enabled {
            return Err(EngineError::InvalidInput("MFA is already enabled".into()));
        }
        metadata.factors.insert(
            device.public(),
            FactorEntry {
                share_index: ShareType::Device.share_index(),
                description: "device".into(),
            },
        );
        if let Some(recovery) = &recovery {
            metadata.factors.insert(
                recovery.public(),
                FactorEntry {
                    share_index: ShareType::Recovery.share_index(),
                    description: params
                        .share_description
                        .clone()
                        .unwrap_or_else(|| "recovery".into()),
                },
            );
        }
        metadata.factors.remove(&hashed.public());
        metadata.mfa_enabled = true;

        self.storage
            .set_item(&device_factor_key(&user), &device.to_hex())
            .await?;
        Self::use_factor(&mut session, device)?;
        self.sync(&mut session).await?;
        self.write_session(&session).await?;
        self.publish(&session);
        tracing::debug!(recovery = recovery.is_some(), "mfa enabled");
        Ok(recovery.map_or(Value::Null, |key| json!(key.to_hex())))
    }

    async fn commit_changes(&self) -> Result<Value, EngineError> {
        let mut session = self.session.lock().await;
        self.require(&session, "commit_changes", HAS_USER)?;
        if session.dirty {
            self.write_metadata(&mut session).await?;
        }
        Ok(Value::Null)
    }

    async fn sign(&self, data: &Binary, hashed: bool) -> Result<Value, EngineError> {
        let session = self.session.lock().await;
        self.require(&session, "sign", SIGNED_IN)?;
        let user = Self::user(&session)?;
        let metadata = session
            .metadata
            .as_ref()
            .ok_or_else(|| EngineError::InvalidInput("no account metadata".into()))?;
        let digest = keys::digest(data.as_bytes(), hashed)?;
        let signature = self
            .seed(user, metadata, session.account_index)
            .signing_key()
            .sign(&digest);
        serde_json::to_value(Binary::new(signature.to_bytes().to_vec()))
            .map_err(|e| EngineError::Internal(anyhow::anyhow!(e)))
    }

    async fn logout(&self) -> Result<Value, EngineError> {
        let mut session = self.session.lock().await;
        self.require(&session, "logout", HAS_USER)?;
        if session.dirty {
            tracing::warn!("logging out with uncommitted metadata changes");
        }
        self.storage.set_item(SESSION_KEY, "").await?;
        *session = Session {
            manual_sync: session.manual_sync,
            ..Session::default()
        };
        self.publish(&session);
        Ok(Value::Null)
    }

    async fn get_key_details(&self) -> Result<KeyDetails, EngineError> {
        let session = self.session.lock().await;
        self.require(&session, "get_key_details", HAS_USER)?;
        let user = Self::user(&session)?;
        let metadata = session
            .metadata
            .as_ref()
            .ok_or_else(|| EngineError::InvalidInput("no account metadata".into()))?;
        Ok(KeyDetails {
            key_type: self.options.key_type,
            threshold: THRESHOLD,
            required_factors: u32::from(session.status != CoreKitStatus::LoggedIn),
            total_factors: metadata.factors.len() as u32,
            share_descriptions: metadata
                .factors
                .iter()
                .map(|(factor_pub, entry)| (factor_pub.clone(), entry.description.clone()))
                .collect(),
            tss_pub_key: Binary::new(
                self.seed(user, metadata, session.account_index)
                    .verifying_key()
                    .to_bytes()
                    .to_vec(),
            ),
        })
    }

    async fn get_device_factor(&self) -> Result<Option<String>, EngineError> {
        let session = self.session.lock().await;
        self.require(&session, "get_device_factor", HAS_USER)?;
        self.read(&device_factor_key(Self::user(&session)?)).await
    }

    async fn set_device_factor(&self, factor_key: &str, replace: bool) -> Result<(), EngineError> {
        let session = self.session.lock().await;
        self.require(&session, "set_device_factor", HAS_USER)?;
        let user = Self::user(&session)?;
        let factor = FactorKey::parse(factor_key)?;
        let registered = session
            .metadata
            .as_ref()
            .is_some_and(|m| m.factors.contains_key(&factor.public()));
        if !registered {
            return Err(EngineError::InvalidInput("factor key is not registered".into()));
        }
        let key = device_factor_key(user);
        if !replace && self.read(&key).await?.is_some() {
            return Err(EngineError::InvalidInput(
                "a device factor is already stored; pass replace to overwrite it".into(),
            ));
        }
        self.storage.set_item(&key, &factor.to_hex()).await?;
        Ok(())
    }

    async fn set_manual_sync(&self, manual_sync: bool) -> Result<(), EngineError> {
        let mut session = self.session.lock().await;
        session.manual_sync = manual_sync;
        if !manual_sync && session.dirty {
            self.write_metadata(&mut session).await?;
        }
        Ok(())
    }

    async fn set_tss_wallet_index(&self, account_index: u32) -> Result<(), EngineError> {
        let mut session = self.session.lock().await;
        self.require(&session, "set_tss_wallet_index", SIGNED_IN)?;
        session.account_index = account_index;
        self.write_session(&session).await?;
        self.publish(&session);
        Ok(())
    }

    async fn get_tss_factor_pub(&self) -> Result<Vec<String>, EngineError> {
        let session = self.session.lock().await;
        self.require(&session, "get_tss_factor_pub", SIGNED_IN)?;
        let metadata = session
            .metadata
            .as_ref()
            .ok_or_else(|| EngineError::InvalidInput("no account metadata".into()))?;
        Ok(metadata.factors.keys().cloned().collect())
    }

    async fn get_pub_key(&self) -> Result<Binary, EngineError> {
        let session = self.session.lock().await;
        self.require(&session, "get_pub_key", HAS_USER)?;
        let user = Self::user(&session)?;
        let metadata = session
            .metadata
            .as_ref()
            .ok_or_else(|| EngineError::InvalidInput("no account metadata".into()))?;
        Ok(Binary::new(
            self.seed(user, metadata, session.account_index)
                .verifying_key()
                .to_bytes()
                .to_vec(),
        ))
    }

    async fn get_pub_key_ed25519(&self) -> Result<Binary, EngineError> {
        if self.options.key_type != KeyType::Ed25519 {
            return Err(EngineError::Unsupported(format!(
                "get_pub_key_ed25519 for {:?} keys",
                self.options.key_type
            )));
        }
        self.get_pub_key().await
    }

    async fn get_pub_key_point(&self) -> Result<PubKeyPoint, EngineError> {
        Err(EngineError::Unsupported(format!(
            "get_pub_key_point for {:?} keys",
            self.options.key_type
        )))
    }

    async fn unsafe_export_tss_key(&self) -> Result<String, EngineError> {
        let session = self.session.lock().await;
        self.require(&session, "_UNSAFE_exportTssKey", SIGNED_IN)?;
        let user = Self::user(&session)?;
        let metadata = session
            .metadata
            .as_ref()
            .ok_or_else(|| EngineError::InvalidInput("no account metadata".into()))?;
        tracing::warn!("exporting the full signing key");
        Ok(hex::encode(
            self.seed(user, metadata, session.account_index)
                .signing_key()
                .to_bytes(),
        ))
    }

    async fn unsafe_export_tss_ed25519_seed(&self) -> Result<Binary, EngineError> {
        let session = self.session.lock().await;
        self.require(&session, "_UNSAFE_exportTssEd25519Seed", SIGNED_IN)?;
        let user = Self::user(&session)?;
        let metadata = session
            .metadata
            .as_ref()
            .ok_or_else(|| EngineError::InvalidInput("no account metadata".into()))?;
        tracing::warn!("exporting the ed25519 seed");
        Ok(Binary::new(
            self.seed(user, metadata, session.account_index)
                .signing_key()
                .to_bytes()
                .to_vec(),
        ))
    }

    async fn unsafe_reset_account(&self) -> Result<(), EngineError> {
        let mut session = self.session.lock().await;
        self.require(&session, "_UNSAFE_resetAccount", SIGNED_IN)?;
        let user = Self::user(&session)?.clone();
        self.storage.set_item(&metadata_key(&user), "").await?;
        self.storage.set_item(&device_factor_key(&user), "").await?;
        self.storage.set_item(SESSION_KEY, "").await?;
        session.dirty = false;
        tracing::warn!(verifier = %user.verifier, "account reset");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signature, Verifier, VerifyingKey};
    use keybridge_core::MemoryStorage;

    fn options() -> CoreKitOptions {
        CoreKitOptions {
            client_id: "test-app".into(),
            ..CoreKitOptions::default()
        }
    }

    fn jwt(user: &str) -> JwtLoginParams {
        JwtLoginParams {
            verifier: "google".into(),
            verifier_id: user.into(),
            id_token: format!("token-for-{user}"),
        }
    }

    async fn logged_in(storage: Arc<MemoryStorage>) -> RefCoreKit {
        let engine = RefCoreKit::new(options(), storage);
        engine.init(InitParams::default()).await.unwrap();
        engine.login_with_jwt(jwt("alice")).await.unwrap();
        engine
    }

    fn pub_key(engine: &RefCoreKit) -> VerifyingKey {
        let bytes: [u8; 32] = engine
            .state()
            .tss_pub_key
            .unwrap()
            .as_bytes()
            .try_into()
            .unwrap();
        VerifyingKey::from_bytes(&bytes).unwrap()
    }

    #[tokio::test]
    async fn lifecycle_statuses() {
        let engine = RefCoreKit::new(options(), Arc::new(MemoryStorage::new()));
        assert_eq!(engine.status(), CoreKitStatus::NotInitialized);
        engine.init(InitParams::default()).await.unwrap();
        assert_eq!(engine.status(), CoreKitStatus::Initialized);
        engine.login_with_jwt(jwt("alice")).await.unwrap();
        assert_eq!(engine.status(), CoreKitStatus::LoggedIn);

        let state = engine.state();
        assert_eq!(state.tss_share_index, Some(HASHED_SHARE_INDEX));
        assert_eq!(state.factor_key.as_ref().map(String::len), Some(64));
        assert_eq!(state.signatures.len(), 1);

        engine.logout().await.unwrap();
        assert_eq!(engine.status(), CoreKitStatus::NotInitialized);
        assert!(engine.state().is_empty());
    }

    #[tokio::test]
    async fn login_requires_init() {
        let engine = RefCoreKit::new(options(), Arc::new(MemoryStorage::new()));
        let err = engine.login_with_jwt(jwt("alice")).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_STATE");
    }

    #[tokio::test]
    async fn signature_verifies_against_pub_key() {
        let engine = logged_in(Arc::new(MemoryStorage::new())).await;
        let result = engine
            .sign(&Binary::new(b"hello".to_vec()), false)
            .await
            .unwrap();
        let signature: Binary = serde_json::from_value(result).unwrap();
        let signature = Signature::from_slice(signature.as_bytes()).unwrap();
        let digest = keys::digest(b"hello", false).unwrap();
        assert!(pub_key(&engine).verify(&digest, &signature).is_ok());
    }

    #[tokio::test]
    async fn same_account_same_key_across_instances() {
        let storage = Arc::new(MemoryStorage::new());
        let first = logged_in(storage.clone()).await;
        let key = pub_key(&first);
        first.logout().await.unwrap();

        let second = logged_in(storage).await;
        assert_eq!(pub_key(&second), key);
    }

    #[tokio::test]
    async fn init_rehydrates_session() {
        let storage = Arc::new(MemoryStorage::new());
        let first = logged_in(storage.clone()).await;
        let state = first.state();

        let second = RefCoreKit::new(options(), storage);
        second.init(InitParams { rehydrate: true }).await.unwrap();
        assert_eq!(second.status(), CoreKitStatus::LoggedIn);
        assert_eq!(second.state(), state);
    }

    #[tokio::test]
    async fn init_without_rehydrate_ignores_session() {
        let storage = Arc::new(MemoryStorage::new());
        logged_in(storage.clone()).await;
        let second = RefCoreKit::new(options(), storage);
        second.init(InitParams { rehydrate: false }).await.unwrap();
        assert_eq!(second.status(), CoreKitStatus::Initialized);
    }

    #[tokio::test]
    async fn mfa_requires_a_factor_on_a_new_device() {
        let storage = Arc::new(MemoryStorage::new());
        let engine = logged_in(storage.clone()).await;
        let key = pub_key(&engine);
        let recovery = engine
            .enable_mfa(EnableMfaParams::default(), true)
            .await
            .unwrap();
        let recovery = recovery.as_str().unwrap().to_string();
        assert_eq!(engine.state().tss_share_index, Some(2));
        engine.logout().await.unwrap();

        // Same storage: the device factor is found.
        let again = logged_in(storage).await;
        assert_eq!(again.status(), CoreKitStatus::LoggedIn);
        let metadata = again.session.lock().await.metadata.clone().unwrap();

        // Fresh device: only the account metadata is carried over.
        let fresh = Arc::new(MemoryStorage::new());
        fresh
            .set_item(
                "keybridge:metadata:google:alice",
                &serde_json::to_string(&metadata).unwrap(),
            )
            .await
            .unwrap();
        let engine = logged_in(fresh).await;
        assert_eq!(engine.status(), CoreKitStatus::RequiredShare);
        let err = engine.sign(&Binary::new(vec![1]), false).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_STATE");

        engine.input_factor_key(&recovery).await.unwrap();
        assert_eq!(engine.status(), CoreKitStatus::LoggedIn);
        assert_eq!(engine.state().tss_share_index, Some(3));
        assert_eq!(pub_key(&engine), key);
    }

    #[tokio::test]
    async fn unknown_factor_is_rejected() {
        let engine = logged_in(Arc::new(MemoryStorage::new())).await;
        let err = engine
            .input_factor_key(&FactorKey::generate().to_hex())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");
        assert_eq!(engine.status(), CoreKitStatus::LoggedIn);
    }

    #[tokio::test]
    async fn create_and_delete_factor() {
        let engine = logged_in(Arc::new(MemoryStorage::new())).await;
        let created = engine
            .create_factor(CreateFactorParams {
                share_type: ShareType::Recovery,
                factor_key: None,
                share_description: Some("paper".into()),
            })
            .await
            .unwrap();
        let factor = FactorKey::parse(created.as_str().unwrap()).unwrap();
        let details = engine.get_key_details().await.unwrap();
        assert_eq!(details.total_factors, 2);
        assert_eq!(details.required_factors, 0);
        assert_eq!(details.share_descriptions[&factor.public()], "paper");

        let factor_pubs = engine.get_tss_factor_pub().await.unwrap();
        assert_eq!(factor_pubs.len(), 2);
        assert!(factor_pubs.contains(&factor.public()));

        let in_use = FactorKey::parse(&engine.state().factor_key.unwrap())
            .unwrap()
            .public();
        assert!(factor_pubs.contains(&in_use));
        let err = engine.delete_factor(&in_use, None).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");

        engine
            .delete_factor(&factor.public(), Some(&factor.to_hex()))
            .await
            .unwrap();
        assert_eq!(engine.get_key_details().await.unwrap().total_factors, 1);
        assert_eq!(engine.get_tss_factor_pub().await.unwrap(), vec![in_use]);
    }

    #[tokio::test]
    async fn manual_sync_defers_metadata_writes() {
        let storage = Arc::new(MemoryStorage::new());
        let engine = logged_in(storage.clone()).await;
        engine.set_manual_sync(true).await.unwrap();
        let before = storage
            .get_item("keybridge:metadata:google:alice")
            .await
            .unwrap();

        engine
            .create_factor(CreateFactorParams {
                share_type: ShareType::Device,
                factor_key: None,
                share_description: None,
            })
            .await
            .unwrap();
        let pending = storage
            .get_item("keybridge:metadata:google:alice")
            .await
            .unwrap();
        assert_eq!(pending, before);

        engine.commit_changes().await.unwrap();
        let committed = storage
            .get_item("keybridge:metadata:google:alice")
            .await
            .unwrap();
        assert_ne!(committed, before);
    }

    #[tokio::test]
    async fn prehashed_sign_needs_32_bytes() {
        let engine = logged_in(Arc::new(MemoryStorage::new())).await;
        let err = engine
            .sign(&Binary::new(vec![1, 2, 3]), true)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");
        assert!(engine.sign(&Binary::new(vec![9; 32]), true).await.is_ok());
    }

    #[tokio::test]
    async fn wallet_index_switches_key() {
        let engine = logged_in(Arc::new(MemoryStorage::new())).await;
        let first = pub_key(&engine);
        engine.set_tss_wallet_index(1).await.unwrap();
        assert_eq!(engine.state().account_index, 1);
        assert_ne!(pub_key(&engine), first);
        assert_eq!(
            engine.get_pub_key().await.unwrap().as_bytes(),
            pub_key(&engine).as_bytes()
        );
    }

    #[tokio::test]
    async fn device_factor_replace_flag() {
        let engine = logged_in(Arc::new(MemoryStorage::new())).await;
        assert_eq!(engine.get_device_factor().await.unwrap(), None);
        let current = engine.state().factor_key.unwrap();
        engine.set_device_factor(&current, false).await.unwrap();
        let err = engine.set_device_factor(&current, false).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");
        engine.set_device_factor(&current, true).await.unwrap();
        assert_eq!(engine.get_device_factor().await.unwrap(), Some(current));
    }

    #[tokio::test]
    async fn export_matches_pub_key() {
        let engine = logged_in(Arc::new(MemoryStorage::new())).await;
        let exported = engine.unsafe_export_tss_key().await.unwrap();
        let seed: [u8; 32] = hex::decode(exported).unwrap().try_into().unwrap();
        let signing = ed25519_dalek::SigningKey::from_bytes(&seed);
        assert_eq!(signing.verifying_key(), pub_key(&engine));
    }

    #[tokio::test]
    async fn ed25519_seed_export_and_key_encodings() {
        let engine = logged_in(Arc::new(MemoryStorage::new())).await;
        let seed: [u8; 32] = engine
            .unsafe_export_tss_ed25519_seed()
            .await
            .unwrap()
            .as_bytes()
            .try_into()
            .unwrap();
        let signing = ed25519_dalek::SigningKey::from_bytes(&seed);
        assert_eq!(signing.verifying_key(), pub_key(&engine));
        assert_eq!(
            engine.get_pub_key_ed25519().await.unwrap(),
            engine.get_pub_key().await.unwrap()
        );
        let err = engine.get_pub_key_point().await.unwrap_err();
        assert_eq!(err.code(), "UNSUPPORTED");
    }

    #[tokio::test]
    async fn seed_export_needs_a_login() {
        let engine = RefCoreKit::new(options(), Arc::new(MemoryStorage::new()));
        engine.init(InitParams::default()).await.unwrap();
        let err = engine.unsafe_export_tss_ed25519_seed().await.unwrap_err();
        assert_eq!(err.code(), "INVALID_STATE");
    }

    #[tokio::test]
    async fn reset_account_starts_over() {
        let storage = Arc::new(MemoryStorage::new());
        let engine = logged_in(storage.clone()).await;
        let key = pub_key(&engine);
        engine.unsafe_reset_account().await.unwrap();
        engine.logout().await.unwrap();

        let engine = logged_in(storage).await;
        assert_ne!(pub_key(&engine), key);
    }
}
