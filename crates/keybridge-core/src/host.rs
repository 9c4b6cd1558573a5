//! Host side of the bridge.
//!
//! [`HostBridge`] owns the host's correlation table and storage delegate and
//! runs the host dispatch loop:
//!
//! - engine responses and errors resolve pending calls
//! - storage requests are served from the backend bound to the instance, each
//!   on its own task
//! - signals: `ready` opens [`HostBridge::wait_ready`], `log` is re-logged
//!   under the `keybridge::sandbox` target, `cancel` aborts a storage request

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;

use keybridge_error::BridgeError;

use crate::config::BridgeConfig;
use crate::correlation::CorrelationTable;
use crate::envelope::{
    CallKey, CoreKitAction, CoreKitReply, CoreKitRequest, CorrelationId, Envelope, EnvelopeKind,
    InstanceId, Signal,
};
use crate::inflight::InFlight;
use crate::redact;
use crate::storage::StorageDelegate;
use crate::transport::Link;
use crate::types::CoreKitOptions;
use crate::Storage;

/// The host endpoint of a bridge.
pub struct HostBridge {
    outbound: mpsc::UnboundedSender<Envelope>,
    calls: CorrelationTable,
    storage: StorageDelegate,
    inflight: InFlight,
    ready: watch::Sender<bool>,
    config: BridgeConfig,
}

impl std::fmt::Debug for HostBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostBridge")
            .field("pending_calls", &self.calls.len())
            .field("storage_requests_in_flight", &self.inflight.len())
            .field("storage", &self.storage)
            .field("config", &self.config)
            .finish()
    }
}

impl HostBridge {
    /// Start the host dispatch loop over `link`.
    ///
    /// The returned handle completes when the link's inbound side closes; by
    /// then every pending call has failed with
    /// [`BridgeError::TransportClosed`].
    pub fn start(link: Link, config: BridgeConfig) -> (Arc<Self>, JoinHandle<()>) {
        let Link { outbound, inbound } = link;
        let cancel_tx = outbound.clone();
        let calls = CorrelationTable::with_cancel_hook(move |key| {
            let _ = cancel_tx.send(Signal::cancel(key));
        });
        let (ready, _) = watch::channel(false);

        let bridge = Arc::new(Self {
            outbound,
            calls,
            storage: StorageDelegate::new(),
            inflight: InFlight::default(),
            ready,
            config,
        });
        let handle = tokio::spawn(bridge.clone().run(inbound));
        (bridge, handle)
    }

    /// The storage bindings this bridge serves.
    pub fn storage(&self) -> &StorageDelegate {
        &self.storage
    }

    /// Number of engine calls awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.calls.len()
    }

    /// Whether the link to the sandbox has closed.
    pub fn is_closed(&self) -> bool {
        self.calls.is_closed()
    }

    /// This bridge's settings.
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Wait until the sandbox announces that its dispatch loop is running.
    pub async fn wait_ready(&self) -> Result<(), BridgeError> {
        let mut ready = self.ready.subscribe();
        let timeout = self.config.ready_timeout;
        let outcome = tokio::time::timeout(timeout, ready.wait_for(|r| *r))
            .await
            .map(|r| r.map(|_| ()));
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(BridgeError::TransportClosed),
            Err(_) => Err(BridgeError::Timeout {
                action: "ready".into(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Create an engine instance whose storage is `storage`.
    ///
    /// The instance is named after the create call's correlation id.
    pub async fn create_instance(
        &self,
        options: &CoreKitOptions,
        storage: Arc<dyn Storage>,
    ) -> Result<(InstanceId, CoreKitReply), BridgeError> {
        let correlation_id = CorrelationId::new();
        let instance = InstanceId::from(&correlation_id);
        let reply = self
            .create(correlation_id, instance.clone(), None, options, storage)
            .await?;
        Ok((instance, reply))
    }

    /// Create (or re-attach to) the engine instance named `instance`.
    ///
    /// Creating an id that already exists in the sandbox returns the existing
    /// instance; `storage` replaces the host-side binding either way.
    pub async fn create_instance_as(
        &self,
        instance: InstanceId,
        options: &CoreKitOptions,
        storage: Arc<dyn Storage>,
    ) -> Result<CoreKitReply, BridgeError> {
        let target = Some(instance.clone());
        self.create(CorrelationId::new(), instance, target, options, storage)
            .await
    }

    async fn create(
        &self,
        correlation_id: CorrelationId,
        instance: InstanceId,
        target: Option<InstanceId>,
        options: &CoreKitOptions,
        storage: Arc<dyn Storage>,
    ) -> Result<CoreKitReply, BridgeError> {
        // Bound before sending: the engine may read storage while being built.
        let binding = Binding::bind(&self.storage, instance.clone(), storage);
        let request = CoreKitRequest::CreateInstance {
            options: options.clone(),
            instance_id: target,
        };
        let reply = self.send_call(correlation_id, None, &request).await?;

        let created = reply.result.as_str().unwrap_or_default();
        if created != instance.as_str() {
            return Err(BridgeError::MalformedEnvelope(format!(
                "create_instance answered with id '{created}', expected '{instance}'"
            )));
        }
        binding.keep();
        tracing::debug!(instance_id = %instance, "engine instance created");
        Ok(reply)
    }

    /// Invoke one engine operation on `instance`.
    ///
    /// A successful `logout` also removes the instance's storage binding.
    pub async fn call(
        &self,
        instance: &InstanceId,
        request: CoreKitRequest,
    ) -> Result<CoreKitReply, BridgeError> {
        if let CoreKitRequest::CreateInstance { .. } = request {
            return Err(BridgeError::InvalidArgument(
                "use create_instance to create engine instances".into(),
            ));
        }
        let reply = self
            .send_call(CorrelationId::new(), Some(instance.clone()), &request)
            .await?;
        if request.action() == CoreKitAction::Logout {
            self.storage.unbind(instance);
            tracing::debug!(instance_id = %instance, "engine instance torn down");
        }
        Ok(reply)
    }

    async fn send_call(
        &self,
        correlation_id: CorrelationId,
        instance: Option<InstanceId>,
        request: &CoreKitRequest,
    ) -> Result<CoreKitReply, BridgeError> {
        let envelope = request.into_envelope(correlation_id, instance)?;
        let pending = self.calls.register(envelope.key())?;
        self.outbound
            .send(envelope)
            .map_err(|_| BridgeError::TransportClosed)?;
        let result = pending.wait_timeout(self.config.call_timeout).await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn run(self: Arc<Self>, mut inbound: mpsc::UnboundedReceiver<Envelope>) {
        while let Some(envelope) = inbound.recv().await {
            self.dispatch(envelope);
        }
        let failed = self.calls.fail_all(|_| BridgeError::TransportClosed);
        self.inflight.abort_all();
        tracing::info!(failed, "sandbox link closed");
    }

    fn dispatch(&self, envelope: Envelope) {
        if let Err(err) = envelope.validate() {
            self.refuse(&envelope, err);
            return;
        }
        match envelope.kind {
            EnvelopeKind::Response => {
                let key = envelope.key();
                let resolved = self
                    .calls
                    .resolve(&key, envelope.result.unwrap_or_default());
                if !resolved && key.action == CoreKitAction::CreateInstance.as_str() {
                    // Nobody will use the instance; ask the sandbox to drop it.
                    tracing::debug!(%key, "late create_instance response, releasing instance");
                    let _ = self.outbound.send(Signal::cancel(&key));
                }
            }
            EnvelopeKind::Error => {
                let key = envelope.key();
                let error = match envelope.error {
                    Some(payload) => BridgeError::from_payload(key.action.clone(), payload),
                    None => BridgeError::MalformedEnvelope("error envelope without error".into()),
                };
                self.calls.reject(&key, error);
            }
            EnvelopeKind::Request => self.serve_storage(envelope),
            EnvelopeKind::Signal => self.on_signal(&envelope),
        }
    }

    fn serve_storage(&self, envelope: Envelope) {
        let key = envelope.key();
        let storage = self.storage.clone();
        let outbound = self.outbound.clone();
        let span = tracing::debug_span!(
            "storage_request",
            correlation_id = %key.correlation_id,
            action = %key.action,
            instance_id = ?envelope.instance_id,
        );
        let spawned = self.inflight.spawn(
            key.clone(),
            async move {
                let reply = storage.handle(&envelope).await;
                let _ = outbound.send(reply);
            }
            .instrument(span),
        );
        if !spawned {
            let err = BridgeError::DuplicateCorrelation {
                correlation_id: key.correlation_id.to_string(),
                action: key.action.clone(),
            };
            tracing::warn!(%key, "storage request already in flight");
            let _ = self.outbound.send(Envelope::error(
                &key,
                None,
                err.to_payload(Some(&key.action), None),
            ));
        }
    }

    fn on_signal(&self, envelope: &Envelope) {
        match Signal::from_envelope(envelope) {
            Ok(Signal::Ready {}) => {
                tracing::debug!("sandbox ready");
                self.ready.send_replace(true);
            }
            Ok(Signal::Log { level, message }) => relog(&level, &message),
            Ok(Signal::Cancel { action }) => {
                let key = CallKey::new(envelope.correlation_id.clone(), action);
                if self.inflight.cancel(&key) {
                    tracing::debug!(%key, "storage request cancelled by sandbox");
                }
            }
            Ok(Signal::Configure { .. }) => {
                tracing::warn!("ignoring configure signal sent by the sandbox");
            }
            Err(err) => {
                tracing::warn!(action = %envelope.action, error = %err, "dropping unknown signal");
            }
        }
    }

    fn refuse(&self, envelope: &Envelope, err: BridgeError) {
        tracing::warn!(
            correlation_id = %envelope.correlation_id,
            action = %envelope.action,
            error = %err,
            "malformed envelope from sandbox"
        );
        if envelope.kind == EnvelopeKind::Request {
            let key = envelope.key();
            let _ = self.outbound.send(Envelope::error(
                &key,
                envelope.instance_id.clone(),
                redact::error_payload(&err, Some(&key.action), envelope.payload.as_ref()),
            ));
        }
    }
}

/// A storage binding made for a create call, undone on drop unless the
/// create succeeded.
struct Binding<'a> {
    storage: &'a StorageDelegate,
    instance: InstanceId,
    previous: Option<Arc<dyn Storage>>,
    kept: bool,
}

impl<'a> Binding<'a> {
    fn bind(storage: &'a StorageDelegate, instance: InstanceId, backend: Arc<dyn Storage>) -> Self {
        let previous = storage.bind(instance.clone(), backend);
        Self {
            storage,
            instance,
            previous,
            kept: false,
        }
    }

    fn keep(mut self) {
        self.kept = true;
    }
}

impl Drop for Binding<'_> {
    fn drop(&mut self) {
        if self.kept {
            return;
        }
        match self.previous.take() {
            Some(old) => {
                self.storage.bind(self.instance.clone(), old);
            }
            None => {
                self.storage.unbind(&self.instance);
            }
        }
    }
}

fn relog(level: &str, message: &str) {
    match level {
        "error" => tracing::error!(target: "keybridge::sandbox", "{message}"),
        "warn" => tracing::warn!(target: "keybridge::sandbox", "{message}"),
        "debug" => tracing::debug!(target: "keybridge::sandbox", "{message}"),
        "trace" => tracing::trace!(target: "keybridge::sandbox", "{message}"),
        _ => tracing::info!(target: "keybridge::sandbox", "{message}"),
    }
}
