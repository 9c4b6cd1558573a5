//! Sandbox side of the bridge.
//!
//! [`SandboxBridge`] owns the instance registry and runs the sandbox dispatch
//! loop. Engine requests are served on their own task each, storage responses
//! resolve the calls raised by the engines' storage proxies, and `cancel`
//! signals abort the engine call they name.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use keybridge_error::{BridgeError, EngineError, StorageError};

use crate::config::BridgeConfig;
use crate::correlation::CorrelationTable;
use crate::engine::{CoreKit, CoreKitFactory};
use crate::envelope::{
    CallKey, CoreKitAction, CoreKitReply, CoreKitRequest, CorrelationId, Envelope, EnvelopeKind,
    InstanceId, Signal, StorageRequest,
};
use crate::inflight::InFlight;
use crate::redact;
use crate::transport::Link;
use crate::Storage;

struct Slot {
    engine: Arc<dyn CoreKit>,
    /// The `create_instance` call that built the engine.
    origin: CorrelationId,
}

/// Live engine instances keyed by instance id.
#[derive(Clone, Default)]
pub struct InstanceRegistry {
    instances: Arc<Mutex<HashMap<InstanceId, Slot>>>,
}

impl std::fmt::Debug for InstanceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceRegistry")
            .field("instances", &self.len())
            .finish()
    }
}

impl InstanceRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn instances(&self) -> MutexGuard<'_, HashMap<InstanceId, Slot>> {
        self.instances.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The instance registered under `id`, building and registering it with
    /// `build` if there is none. The flag is `true` if it was built.
    ///
    /// `origin` is the correlation id of the create call; an instance built by
    /// a call can be withdrawn with [`remove_created_by`](Self::remove_created_by).
    /// Lookup and insertion happen under one lock, so concurrent creates of the
    /// same id build at most one engine.
    pub fn get_or_create(
        &self,
        id: &InstanceId,
        origin: &CorrelationId,
        build: impl FnOnce() -> Result<Arc<dyn CoreKit>, EngineError>,
    ) -> Result<(Arc<dyn CoreKit>, bool), EngineError> {
        let mut instances = self.instances();
        if let Some(existing) = instances.get(id) {
            return Ok((existing.engine.clone(), false));
        }
        let engine = build()?;
        instances.insert(
            id.clone(),
            Slot {
                engine: engine.clone(),
                origin: origin.clone(),
            },
        );
        Ok((engine, true))
    }

    /// The instance registered under `id`.
    pub fn get(&self, id: &InstanceId) -> Option<Arc<dyn CoreKit>> {
        self.instances().get(id).map(|slot| slot.engine.clone())
    }

    /// Remove the instance registered under `id`.
    pub fn remove(&self, id: &InstanceId) -> Option<Arc<dyn CoreKit>> {
        self.instances().remove(id).map(|slot| slot.engine)
    }

    /// Remove the instance built by the create call `origin`, if it is still
    /// registered. Returns its id.
    pub fn remove_created_by(&self, origin: &CorrelationId) -> Option<InstanceId> {
        let mut instances = self.instances();
        let id = instances
            .iter()
            .find(|(_, slot)| &slot.origin == origin)
            .map(|(id, _)| id.clone())?;
        instances.remove(&id);
        Some(id)
    }

    /// Whether `id` is registered.
    pub fn contains(&self, id: &InstanceId) -> bool {
        self.instances().contains_key(id)
    }

    /// Number of live instances.
    pub fn len(&self) -> usize {
        self.instances().len()
    }

    /// Whether no instance is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Storage handed to engines inside the sandbox: every call is relayed to
/// the backend the host bound to the instance.
struct RemoteStorage {
    instance: InstanceId,
    outbound: mpsc::UnboundedSender<Envelope>,
    calls: CorrelationTable,
    timeout: Duration,
}

impl RemoteStorage {
    async fn relay(&self, request: StorageRequest) -> Result<Value, StorageError> {
        let envelope = request
            .into_envelope(CorrelationId::new(), self.instance.clone())
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let pending = self
            .calls
            .register(envelope.key())
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        self.outbound
            .send(envelope)
            .map_err(|_| StorageError::Backend("transport closed".into()))?;

        pending
            .wait_timeout(self.timeout)
            .await
            .map_err(|err| match err {
                BridgeError::Timeout { timeout_ms, .. } => StorageError::Timeout { timeout_ms },
                BridgeError::Remote { message, code, .. } => StorageError::Remote {
                    code: code.unwrap_or_else(|| "REMOTE".into()),
                    message,
                },
                other => StorageError::Backend(other.to_string()),
            })
    }
}

#[async_trait]
impl Storage for RemoteStorage {
    async fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        let value = self
            .relay(StorageRequest::GetItem {
                key: key.to_string(),
            })
            .await?;
        match value {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(s)),
            other => Err(StorageError::Corrupt(format!(
                "getItem('{key}') returned a non-string value: {other}"
            ))),
        }
    }

    async fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.relay(StorageRequest::SetItem {
            key: key.to_string(),
            value: value.to_string(),
        })
        .await
        .map(|_| ())
    }
}

/// The sandbox endpoint of a bridge.
pub struct SandboxBridge {
    outbound: mpsc::UnboundedSender<Envelope>,
    registry: InstanceRegistry,
    calls: CorrelationTable,
    inflight: InFlight,
    factory: Arc<dyn CoreKitFactory>,
    config: BridgeConfig,
}

impl std::fmt::Debug for SandboxBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxBridge")
            .field("registry", &self.registry)
            .field("pending_storage_calls", &self.calls.len())
            .field("in_flight", &self.inflight.len())
            .finish()
    }
}

impl SandboxBridge {
    /// Start the sandbox dispatch loop over `link` and announce readiness.
    ///
    /// Engines are built by `factory`. The returned handle completes when the
    /// link's inbound side closes.
    pub fn start(
        link: Link,
        factory: Arc<dyn CoreKitFactory>,
        config: BridgeConfig,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let Link { outbound, inbound } = link;
        let cancel_tx = outbound.clone();
        let calls = CorrelationTable::with_cancel_hook(move |key| {
            let _ = cancel_tx.send(Signal::cancel(key));
        });

        let bridge = Arc::new(Self {
            outbound,
            registry: InstanceRegistry::new(),
            calls,
            inflight: InFlight::default(),
            factory,
            config,
        });
        let _ = bridge
            .outbound
            .send(Signal::Ready {}.into_envelope(CorrelationId::new()));
        let handle = tokio::spawn(bridge.clone().run(inbound));
        (bridge, handle)
    }

    /// The live engine instances.
    pub fn registry(&self) -> &InstanceRegistry {
        &self.registry
    }

    /// Number of storage calls awaiting the host.
    pub fn pending_storage_calls(&self) -> usize {
        self.calls.len()
    }

    /// Forward a log line to the host.
    pub fn log(&self, level: &str, message: impl Into<String>) {
        let signal = Signal::Log {
            level: level.to_string(),
            message: message.into(),
        };
        let _ = self.outbound.send(signal.into_envelope(CorrelationId::new()));
    }

    async fn run(self: Arc<Self>, mut inbound: mpsc::UnboundedReceiver<Envelope>) {
        while let Some(envelope) = inbound.recv().await {
            self.dispatch(envelope);
        }
        self.calls.fail_all(|_| BridgeError::TransportClosed);
        self.inflight.abort_all();
        tracing::debug!("host link closed");
    }

    fn dispatch(self: &Arc<Self>, envelope: Envelope) {
        if let Err(err) = envelope.validate() {
            tracing::warn!(
                correlation_id = %envelope.correlation_id,
                action = %envelope.action,
                error = %err,
                "malformed envelope from host"
            );
            if envelope.kind == EnvelopeKind::Request {
                let _ = self.outbound.send(self.error_reply(&envelope, &err));
            }
            return;
        }

        match envelope.kind {
            EnvelopeKind::Request => {
                let key = envelope.key();
                let bridge = self.clone();
                let spawned = self.inflight.spawn(key.clone(), async move {
                    let served = AssertUnwindSafe(bridge.handle_request(&envelope))
                        .catch_unwind()
                        .await;
                    let reply = match served {
                        Ok(reply) => reply,
                        Err(panic) => bridge.panic_reply(&envelope, panic.as_ref()),
                    };
                    let _ = bridge.outbound.send(reply);
                });
                if !spawned {
                    let err = BridgeError::DuplicateCorrelation {
                        correlation_id: key.correlation_id.to_string(),
                        action: key.action.clone(),
                    };
                    let _ = self.outbound.send(Envelope::error(
                        &key,
                        None,
                        err.to_payload(Some(&key.action), None),
                    ));
                }
            }
            EnvelopeKind::Response => {
                self.calls
                    .resolve(&envelope.key(), envelope.result.unwrap_or_default());
            }
            EnvelopeKind::Error => {
                let key = envelope.key();
                let error = match envelope.error {
                    Some(payload) => BridgeError::from_payload(key.action.clone(), payload),
                    None => BridgeError::MalformedEnvelope("error envelope without error".into()),
                };
                self.calls.reject(&key, error);
            }
            EnvelopeKind::Signal => match Signal::from_envelope(&envelope) {
                Ok(Signal::Cancel { action }) => {
                    let key = CallKey::new(envelope.correlation_id.clone(), action);
                    if self.inflight.cancel(&key) {
                        tracing::debug!(%key, "engine call cancelled by host");
                    }
                    // The host gave up on this create; whatever it built is unreachable.
                    if key.action == CoreKitAction::CreateInstance.as_str() {
                        if let Some(id) = self.registry.remove_created_by(&key.correlation_id) {
                            tracing::debug!(%key, instance_id = %id, "abandoned engine instance dropped");
                        }
                    }
                }
                Ok(other) => {
                    tracing::debug!(signal = other.action(), "ignoring signal");
                }
                Err(err) => {
                    tracing::warn!(action = %envelope.action, error = %err, "dropping unknown signal");
                }
            },
        }
    }

    #[tracing::instrument(
        skip(self, envelope),
        fields(correlation_id = %envelope.correlation_id, action = %envelope.action)
    )]
    async fn handle_request(&self, envelope: &Envelope) -> Envelope {
        match self.serve(envelope).await {
            Ok(reply) => match serde_json::to_value(&reply) {
                Ok(result) => {
                    Envelope::response(&envelope.key(), envelope.instance_id.clone(), result)
                }
                Err(e) => self.error_reply(envelope, &BridgeError::Serialization(e)),
            },
            Err(err) => {
                tracing::debug!(code = err.code(), error = %err, "engine call failed");
                self.error_reply(envelope, &err)
            }
        }
    }

    async fn serve(&self, envelope: &Envelope) -> Result<CoreKitReply, BridgeError> {
        let request = CoreKitRequest::from_envelope(envelope)?;

        if let CoreKitRequest::CreateInstance {
            options,
            instance_id,
        } = request
        {
            let id = instance_id.unwrap_or_else(|| InstanceId::from(&envelope.correlation_id));
            let storage: Arc<dyn Storage> = Arc::new(RemoteStorage {
                instance: id.clone(),
                outbound: self.outbound.clone(),
                calls: self.calls.clone(),
                timeout: self.config.storage_timeout,
            });
            let (engine, created) = self.registry.get_or_create(
                &id,
                &envelope.correlation_id,
                || self.factory.create(options, storage),
            )?;
            if created {
                self.log("debug", format!("engine instance {id} created"));
            }
            return Ok(CoreKitReply {
                result: Value::String(id.to_string()),
                status: engine.status(),
                state: engine.state(),
            });
        }

        let id = envelope.instance_id.as_ref().ok_or_else(|| {
            BridgeError::MalformedEnvelope(format!("'{}' request without instanceId", envelope.action))
        })?;
        let engine = self
            .registry
            .get(id)
            .ok_or_else(|| BridgeError::InstanceNotFound(id.to_string()))?;

        let is_logout = matches!(request, CoreKitRequest::Logout {});
        let result = invoke(engine.as_ref(), request).await?;
        let reply = CoreKitReply {
            result,
            status: engine.status(),
            state: engine.state(),
        };
        if is_logout {
            self.registry.remove(id);
            self.log("debug", format!("engine instance {id} torn down"));
        }
        Ok(reply)
    }

    fn panic_reply(&self, envelope: &Envelope, panic: &(dyn Any + Send)) -> Envelope {
        let detail = panic
            .downcast_ref::<String>()
            .map(String::as_str)
            .or_else(|| panic.downcast_ref::<&str>().copied())
            .unwrap_or("non-string panic payload");
        tracing::error!(
            correlation_id = %envelope.correlation_id,
            action = %envelope.action,
            panic = %redact::redact_message(detail),
            "engine panicked"
        );
        let err = BridgeError::Engine(EngineError::Internal(anyhow::anyhow!(
            "engine panicked while serving '{}'",
            envelope.action
        )));
        self.error_reply(envelope, &err)
    }

    fn error_reply(&self, envelope: &Envelope, err: &BridgeError) -> Envelope {
        let key = envelope.key();
        Envelope::error(
            &key,
            envelope.instance_id.clone(),
            redact::error_payload(err, Some(&key.action), envelope.payload.as_ref()),
        )
    }
}

fn to_json<T: serde::Serialize>(value: T) -> Result<Value, EngineError> {
    serde_json::to_value(value).map_err(|e| EngineError::Internal(e.into()))
}

async fn invoke(engine: &dyn CoreKit, request: CoreKitRequest) -> Result<Value, EngineError> {
    match request {
        CoreKitRequest::CreateInstance { .. } => Err(EngineError::InvalidInput(
            "create_instance is not an engine operation".into(),
        )),
        CoreKitRequest::Init { params } => engine.init(params).await,
        CoreKitRequest::LoginWithJwt { jwt } => engine.login_with_jwt(jwt).await,
        CoreKitRequest::InputFactorKey { factor_key } => engine.input_factor_key(&factor_key).await,
        CoreKitRequest::CreateFactor {
            create_factor_params,
        } => engine.create_factor(create_factor_params).await,
        CoreKitRequest::DeleteFactor {
            factor_pub,
            factor_key,
        } => engine.delete_factor(&factor_pub, factor_key.as_deref()).await,
        CoreKitRequest::EnableMfa {
            enable_mfa_params,
            recovery_factor,
        } => engine.enable_mfa(enable_mfa_params, recovery_factor).await,
        CoreKitRequest::CommitChanges {} => engine.commit_changes().await,
        CoreKitRequest::Sign { data, hashed } => engine.sign(&data, hashed).await,
        CoreKitRequest::Logout {} => engine.logout().await,
        CoreKitRequest::GetKeyDetails {} => to_json(engine.get_key_details().await?),
        CoreKitRequest::GetDeviceFactor {} => to_json(engine.get_device_factor().await?),
        CoreKitRequest::SetDeviceFactor {
            factor_key,
            replace,
        } => to_json(engine.set_device_factor(&factor_key, replace).await?),
        CoreKitRequest::SetManualSync { manual_sync } => {
            to_json(engine.set_manual_sync(manual_sync).await?)
        }
        CoreKitRequest::SetTssWalletIndex { account_index } => {
            to_json(engine.set_tss_wallet_index(account_index).await?)
        }
        CoreKitRequest::GetTssFactorPub {} => to_json(engine.get_tss_factor_pub().await?),
        CoreKitRequest::GetPubKey {} => to_json(engine.get_pub_key().await?),
        CoreKitRequest::GetPubKeyEd25519 {} => to_json(engine.get_pub_key_ed25519().await?),
        CoreKitRequest::GetPubKeyPoint {} => to_json(engine.get_pub_key_point().await?),
        CoreKitRequest::UnsafeExportTssKey {} => to_json(engine.unsafe_export_tss_key().await?),
        CoreKitRequest::UnsafeExportTssEd25519Seed {} => {
            to_json(engine.unsafe_export_tss_ed25519_seed().await?)
        }
        CoreKitRequest::UnsafeResetAccount {} => to_json(engine.unsafe_reset_account().await?),
    }
}
