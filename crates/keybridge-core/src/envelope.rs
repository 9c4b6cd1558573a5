//! The envelope protocol shared by both sides of the bridge.
//!
//! Every message on the channel is an [`Envelope`]. Requests carry a
//! `payload`, successful responses a `result`, failures an `error`, and
//! out-of-band signals a `payload` again. A response always echoes the
//! `correlationId` and `action` of the request it answers; the pair is the
//! [`CallKey`] that both correlation tables match on.
//!
//! Request payloads are typed: [`CoreKitRequest`] for host → sandbox engine
//! calls and [`StorageRequest`] for sandbox → host storage calls. Both are
//! closed enums whose variant is selected by the envelope's `action`.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use keybridge_error::{BridgeError, ErrorPayload};

use crate::codec::Binary;
use crate::types::{
    CoreKitOptions, CoreKitState, CoreKitStatus, CreateFactorParams, EnableMfaParams, InitParams,
    JwtLoginParams, StateSnapshot,
};

/// Opaque token identifying one logical call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// A fresh random identifier (UUID v4).
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// The identifier as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for CorrelationId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for CorrelationId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of one engine instance and its storage binding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    /// The identifier as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// An instance created by a `create_instance` call is named after that call.
impl From<&CorrelationId> for InstanceId {
    fn from(id: &CorrelationId) -> Self {
        Self(id.0.clone())
    }
}

impl From<&str> for InstanceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for InstanceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key of a pending call: `(correlationId, action)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallKey {
    /// Correlation identifier of the call.
    pub correlation_id: CorrelationId,
    /// Action of the call.
    pub action: String,
}

impl CallKey {
    /// Build a key.
    pub fn new(correlation_id: CorrelationId, action: impl Into<String>) -> Self {
        Self {
            correlation_id,
            action: action.into(),
        }
    }
}

impl fmt::Display for CallKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.correlation_id, self.action)
    }
}

/// Role of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    /// A call awaiting exactly one answer.
    Request,
    /// A successful answer.
    Response,
    /// A failed answer.
    Error,
    /// A one-way notification, never answered.
    Signal,
}

/// Deserialize a present field as `Some`, even when its value is `null`.
fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

/// One message on the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Correlation identifier of the call.
    pub correlation_id: CorrelationId,
    /// Role of the message.
    pub kind: EnvelopeKind,
    /// Operation name.
    pub action: String,
    /// Target engine instance / storage binding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<InstanceId>,
    /// Request or signal arguments.
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    /// Successful result; may legitimately be `null`.
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

impl Envelope {
    /// A request envelope.
    pub fn request(
        correlation_id: CorrelationId,
        action: impl Into<String>,
        instance_id: Option<InstanceId>,
        payload: Value,
    ) -> Self {
        Self {
            correlation_id,
            kind: EnvelopeKind::Request,
            action: action.into(),
            instance_id,
            payload: Some(payload),
            result: None,
            error: None,
        }
    }

    /// A successful response to the call identified by `key`.
    pub fn response(key: &CallKey, instance_id: Option<InstanceId>, result: Value) -> Self {
        Self {
            correlation_id: key.correlation_id.clone(),
            kind: EnvelopeKind::Response,
            action: key.action.clone(),
            instance_id,
            payload: None,
            result: Some(result),
            error: None,
        }
    }

    /// A failed response to the call identified by `key`.
    pub fn error(key: &CallKey, instance_id: Option<InstanceId>, error: ErrorPayload) -> Self {
        Self {
            correlation_id: key.correlation_id.clone(),
            kind: EnvelopeKind::Error,
            action: key.action.clone(),
            instance_id,
            payload: None,
            result: None,
            error: Some(error),
        }
    }

    /// A signal envelope.
    pub fn signal(correlation_id: CorrelationId, action: impl Into<String>, payload: Value) -> Self {
        Self {
            correlation_id,
            kind: EnvelopeKind::Signal,
            action: action.into(),
            instance_id: None,
            payload: Some(payload),
            result: None,
            error: None,
        }
    }

    /// The `(correlationId, action)` key of this envelope.
    pub fn key(&self) -> CallKey {
        CallKey::new(self.correlation_id.clone(), self.action.clone())
    }

    /// Check that exactly the field matching `kind` is present.
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.correlation_id.as_str().is_empty() {
            return Err(BridgeError::MalformedEnvelope("empty correlationId".into()));
        }
        if self.action.is_empty() {
            return Err(BridgeError::MalformedEnvelope("empty action".into()));
        }
        let present = (
            self.payload.is_some(),
            self.result.is_some(),
            self.error.is_some(),
        );
        let ok = match self.kind {
            EnvelopeKind::Request | EnvelopeKind::Signal => present == (true, false, false),
            EnvelopeKind::Response => present == (false, true, false),
            EnvelopeKind::Error => present == (false, false, true),
        };
        if ok {
            Ok(())
        } else {
            Err(BridgeError::MalformedEnvelope(format!(
                "{:?} envelope for '{}' must carry exactly one of payload/result/error matching its kind",
                self.kind, self.action
            )))
        }
    }
}

/// Decode an `{action, payload}` pair into an adjacently tagged enum.
fn from_tagged<T: DeserializeOwned>(action: &str, payload: Option<&Value>) -> Result<T, BridgeError> {
    let tagged = serde_json::json!({
        "action": action,
        "payload": payload.cloned().unwrap_or_else(|| Value::Object(Default::default())),
    });
    serde_json::from_value(tagged)
        .map_err(|e| BridgeError::MalformedEnvelope(format!("invalid payload for '{action}': {e}")))
}

/// Split an adjacently tagged enum back into its payload.
fn into_tagged<T: Serialize>(value: &T) -> Result<Value, BridgeError> {
    let mut tagged = serde_json::to_value(value)?;
    Ok(tagged
        .get_mut("payload")
        .map(Value::take)
        .unwrap_or_else(|| Value::Object(Default::default())))
}

/// Names of the engine actions the sandbox dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum CoreKitAction {
    CreateInstance,
    Init,
    LoginWithJwt,
    InputFactorKey,
    CreateFactor,
    DeleteFactor,
    EnableMfa,
    CommitChanges,
    Sign,
    Logout,
    GetKeyDetails,
    GetDeviceFactor,
    SetDeviceFactor,
    SetManualSync,
    SetTssWalletIndex,
    GetTssFactorPub,
    GetPubKey,
    GetPubKeyEd25519,
    GetPubKeyPoint,
    UnsafeExportTssKey,
    UnsafeExportTssEd25519Seed,
    UnsafeResetAccount,
}

impl CoreKitAction {
    /// Every action, in declaration order.
    pub const ALL: &'static [CoreKitAction] = &[
        Self::CreateInstance,
        Self::Init,
        Self::LoginWithJwt,
        Self::InputFactorKey,
        Self::CreateFactor,
        Self::DeleteFactor,
        Self::EnableMfa,
        Self::CommitChanges,
        Self::Sign,
        Self::Logout,
        Self::GetKeyDetails,
        Self::GetDeviceFactor,
        Self::SetDeviceFactor,
        Self::SetManualSync,
        Self::SetTssWalletIndex,
        Self::GetTssFactorPub,
        Self::GetPubKey,
        Self::GetPubKeyEd25519,
        Self::GetPubKeyPoint,
        Self::UnsafeExportTssKey,
        Self::UnsafeExportTssEd25519Seed,
        Self::UnsafeResetAccount,
    ];

    /// The wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CreateInstance => "create_instance",
            Self::Init => "init",
            Self::LoginWithJwt => "login_with_jwt",
            Self::InputFactorKey => "input_factor_key",
            Self::CreateFactor => "create_factor",
            Self::DeleteFactor => "delete_factor",
            Self::EnableMfa => "enable_mfa",
            Self::CommitChanges => "commit_changes",
            Self::Sign => "sign",
            Self::Logout => "logout",
            Self::GetKeyDetails => "get_key_details",
            Self::GetDeviceFactor => "get_device_factor",
            Self::SetDeviceFactor => "set_device_factor",
            Self::SetManualSync => "set_manual_sync",
            Self::SetTssWalletIndex => "set_tss_wallet_index",
            Self::GetTssFactorPub => "get_tss_factor_pub",
            Self::GetPubKey => "get_pub_key",
            Self::GetPubKeyEd25519 => "get_pub_key_ed25519",
            Self::GetPubKeyPoint => "get_pub_key_point",
            Self::UnsafeExportTssKey => "_UNSAFE_exportTssKey",
            Self::UnsafeExportTssEd25519Seed => "_UNSAFE_exportTssEd25519Seed",
            Self::UnsafeResetAccount => "_UNSAFE_resetAccount",
        }
    }

    /// Look up an action by wire name.
    pub fn parse(name: &str) -> Result<Self, BridgeError> {
        Self::ALL
            .iter()
            .copied()
            .find(|a| a.as_str() == name)
            .ok_or_else(|| BridgeError::UnknownAction {
                action: name.to_string(),
            })
    }
}

impl fmt::Display for CoreKitAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A host → sandbox engine call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "payload", rename_all = "snake_case", rename_all_fields = "camelCase")]
#[allow(missing_docs)]
pub enum CoreKitRequest {
    /// Build an engine instance, or return the existing one.
    CreateInstance {
        options: CoreKitOptions,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        instance_id: Option<InstanceId>,
    },
    Init {
        #[serde(default)]
        params: InitParams,
    },
    LoginWithJwt {
        jwt: JwtLoginParams,
    },
    InputFactorKey {
        factor_key: String,
    },
    CreateFactor {
        create_factor_params: CreateFactorParams,
    },
    DeleteFactor {
        factor_pub: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        factor_key: Option<String>,
    },
    EnableMfa {
        #[serde(default, rename = "enableMFAParams")]
        enable_mfa_params: EnableMfaParams,
        #[serde(default = "default_true")]
        recovery_factor: bool,
    },
    CommitChanges {},
    Sign {
        data: Binary,
        #[serde(default)]
        hashed: bool,
    },
    Logout {},
    GetKeyDetails {},
    GetDeviceFactor {},
    SetDeviceFactor {
        factor_key: String,
        #[serde(default)]
        replace: bool,
    },
    SetManualSync {
        manual_sync: bool,
    },
    SetTssWalletIndex {
        account_index: u32,
    },
    GetTssFactorPub {},
    GetPubKey {},
    #[serde(rename = "get_pub_key_ed25519")]
    GetPubKeyEd25519 {},
    GetPubKeyPoint {},
    #[serde(rename = "_UNSAFE_exportTssKey")]
    UnsafeExportTssKey {},
    #[serde(rename = "_UNSAFE_exportTssEd25519Seed")]
    UnsafeExportTssEd25519Seed {},
    #[serde(rename = "_UNSAFE_resetAccount")]
    UnsafeResetAccount {},
}

fn default_true() -> bool {
    true
}

impl CoreKitRequest {
    /// The action this request is dispatched as.
    pub fn action(&self) -> CoreKitAction {
        match self {
            Self::CreateInstance { .. } => CoreKitAction::CreateInstance,
            Self::Init { .. } => CoreKitAction::Init,
            Self::LoginWithJwt { .. } => CoreKitAction::LoginWithJwt,
            Self::InputFactorKey { .. } => CoreKitAction::InputFactorKey,
            Self::CreateFactor { .. } => CoreKitAction::CreateFactor,
            Self::DeleteFactor { .. } => CoreKitAction::DeleteFactor,
            Self::EnableMfa { .. } => CoreKitAction::EnableMfa,
            Self::CommitChanges {} => CoreKitAction::CommitChanges,
            Self::Sign { .. } => CoreKitAction::Sign,
            Self::Logout {} => CoreKitAction::Logout,
            Self::GetKeyDetails {} => CoreKitAction::GetKeyDetails,
            Self::GetDeviceFactor {} => CoreKitAction::GetDeviceFactor,
            Self::SetDeviceFactor { .. } => CoreKitAction::SetDeviceFactor,
            Self::SetManualSync { .. } => CoreKitAction::SetManualSync,
            Self::SetTssWalletIndex { .. } => CoreKitAction::SetTssWalletIndex,
            Self::GetTssFactorPub {} => CoreKitAction::GetTssFactorPub,
            Self::GetPubKey {} => CoreKitAction::GetPubKey,
            Self::GetPubKeyEd25519 {} => CoreKitAction::GetPubKeyEd25519,
            Self::GetPubKeyPoint {} => CoreKitAction::GetPubKeyPoint,
            Self::UnsafeExportTssKey {} => CoreKitAction::UnsafeExportTssKey,
            Self::UnsafeExportTssEd25519Seed {} => CoreKitAction::UnsafeExportTssEd25519Seed,
            Self::UnsafeResetAccount {} => CoreKitAction::UnsafeResetAccount,
        }
    }

    /// Decode the request carried by `envelope`.
    ///
    /// An unrecognised action is [`BridgeError::UnknownAction`]; a known action
    /// with an unusable payload is [`BridgeError::MalformedEnvelope`].
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, BridgeError> {
        CoreKitAction::parse(&envelope.action)?;
        from_tagged(&envelope.action, envelope.payload.as_ref())
    }

    /// The request's payload as sent on the wire.
    pub fn payload(&self) -> Result<Value, BridgeError> {
        into_tagged(self)
    }

    /// Wrap into a request envelope.
    pub fn into_envelope(
        &self,
        correlation_id: CorrelationId,
        instance_id: Option<InstanceId>,
    ) -> Result<Envelope, BridgeError> {
        Ok(Envelope::request(
            correlation_id,
            self.action().as_str(),
            instance_id,
            self.payload()?,
        ))
    }
}

/// The `result` of a successful engine call.
///
/// Every engine response carries the engine's status and state after the call
/// so the host can refresh its snapshot in one step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoreKitReply {
    /// The action's own return value.
    #[serde(default)]
    pub result: Value,
    /// Engine status after the call.
    pub status: CoreKitStatus,
    /// Engine state after the call.
    pub state: CoreKitState,
}

impl CoreKitReply {
    /// The status/state part of the reply.
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            status: self.status,
            state: self.state.clone(),
        }
    }
}

/// Names of the storage actions the host serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageAction {
    /// `getItem`
    GetItem,
    /// `setItem`
    SetItem,
}

impl StorageAction {
    /// The wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GetItem => "getItem",
            Self::SetItem => "setItem",
        }
    }

    /// Look up an action by wire name.
    pub fn parse(name: &str) -> Result<Self, BridgeError> {
        match name {
            "getItem" => Ok(Self::GetItem),
            "setItem" => Ok(Self::SetItem),
            other => Err(BridgeError::UnknownAction {
                action: other.to_string(),
            }),
        }
    }
}

/// A sandbox → host storage call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "payload")]
pub enum StorageRequest {
    /// Read one key.
    #[serde(rename = "getItem")]
    GetItem {
        /// Storage key.
        key: String,
    },
    /// Write one key.
    #[serde(rename = "setItem")]
    SetItem {
        /// Storage key.
        key: String,
        /// Value to store.
        value: String,
    },
}

impl StorageRequest {
    /// The action this request is dispatched as.
    pub fn action(&self) -> StorageAction {
        match self {
            Self::GetItem { .. } => StorageAction::GetItem,
            Self::SetItem { .. } => StorageAction::SetItem,
        }
    }

    /// Decode the request carried by `envelope`.
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, BridgeError> {
        StorageAction::parse(&envelope.action)?;
        from_tagged(&envelope.action, envelope.payload.as_ref())
    }

    /// Wrap into a request envelope.
    pub fn into_envelope(
        &self,
        correlation_id: CorrelationId,
        instance_id: InstanceId,
    ) -> Result<Envelope, BridgeError> {
        Ok(Envelope::request(
            correlation_id,
            self.action().as_str(),
            Some(instance_id),
            into_tagged(self)?,
        ))
    }
}

/// One-way notifications exchanged outside the request/response flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "payload", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Signal {
    /// The sandbox dispatch loop is running.
    Ready {},
    /// A log line raised inside the sandbox.
    Log {
        /// `error`, `warn`, `info`, `debug` or `trace`.
        level: String,
        /// Log text.
        message: String,
    },
    /// Abort the in-flight call sharing this envelope's correlation id.
    Cancel {
        /// Action of the cancelled call.
        action: String,
    },
    /// First frame a worker process receives: its runtime limits.
    Configure {
        /// Deadline for storage calls, in milliseconds.
        storage_timeout_ms: u64,
        /// Maximum frame size in bytes.
        max_message_size: usize,
    },
}

impl Signal {
    /// The signal's wire name.
    pub fn action(&self) -> &'static str {
        match self {
            Self::Ready {} => "ready",
            Self::Log { .. } => "log",
            Self::Cancel { .. } => "cancel",
            Self::Configure { .. } => "configure",
        }
    }

    /// Decode the signal carried by `envelope`.
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, BridgeError> {
        match envelope.action.as_str() {
            "ready" | "log" | "cancel" | "configure" => {
                from_tagged(&envelope.action, envelope.payload.as_ref())
            }
            other => Err(BridgeError::UnknownAction {
                action: other.to_string(),
            }),
        }
    }

    /// The cancel signal for the call identified by `key`.
    pub fn cancel(key: &CallKey) -> Envelope {
        Self::Cancel {
            action: key.action.clone(),
        }
        .into_envelope(key.correlation_id.clone())
    }

    /// Wrap into a signal envelope.
    pub fn into_envelope(self, correlation_id: CorrelationId) -> Envelope {
        let payload = into_tagged(&self).unwrap_or_else(|_| Value::Object(Default::default()));
        Envelope::signal(correlation_id, self.action(), payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn correlation_ids_are_unique() {
        let ids: std::collections::HashSet<_> = (0..1000).map(|_| CorrelationId::new()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn request_wire_shape() {
        let env = Envelope::request("c1".into(), "init", Some("i1".into()), json!({}));
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(
            json,
            json!({
                "correlationId": "c1",
                "kind": "request",
                "action": "init",
                "instanceId": "i1",
                "payload": {}
            })
        );
    }

    #[test]
    fn null_result_is_preserved() {
        let key = CallKey::new("c1".into(), "getItem");
        let env = Envelope::response(&key, Some("i1".into()), Value::Null);
        let wire = serde_json::to_string(&env).unwrap();
        assert!(wire.contains("\"result\":null"));

        let back: Envelope = serde_json::from_str(&wire).unwrap();
        assert_eq!(back.result, Some(Value::Null));
        back.validate().unwrap();
    }

    #[test]
    fn validate_rejects_mixed_fields() {
        let mut env = Envelope::response(&CallKey::new("c".into(), "sign"), None, json!(1));
        env.error = Some(ErrorPayload::message("boom"));
        assert_eq!(env.validate().unwrap_err().code(), "MALFORMED_ENVELOPE");
    }

    #[test]
    fn validate_rejects_request_without_payload() {
        let raw = json!({"correlationId": "c", "kind": "request", "action": "init"});
        let env: Envelope = serde_json::from_value(raw).unwrap();
        assert!(env.validate().is_err());
    }

    #[test]
    fn every_action_name_parses_back() {
        for action in CoreKitAction::ALL {
            assert_eq!(CoreKitAction::parse(action.as_str()).unwrap(), *action);
        }
    }

    #[test]
    fn request_wire_names_match_action_names() {
        for request in [
            CoreKitRequest::GetPubKeyEd25519 {},
            CoreKitRequest::GetPubKeyPoint {},
            CoreKitRequest::UnsafeExportTssEd25519Seed {},
            CoreKitRequest::GetTssFactorPub {},
        ] {
            let env = request.into_envelope("c".into(), Some("i".into())).unwrap();
            assert_eq!(env.action, request.action().as_str());
            assert_eq!(CoreKitRequest::from_envelope(&env).unwrap(), request);
        }
    }

    #[test]
    fn unknown_action_is_reported_as_such() {
        let env = Envelope::request("c".into(), "frobnicate", None, json!({}));
        let err = CoreKitRequest::from_envelope(&env).unwrap_err();
        assert_eq!(err.code(), "UNKNOWN_ACTION");
    }

    #[test]
    fn bad_payload_is_malformed() {
        let env = Envelope::request("c".into(), "sign", None, json!({"data": [1, 2]}));
        let err = CoreKitRequest::from_envelope(&env).unwrap_err();
        assert_eq!(err.code(), "MALFORMED_ENVELOPE");
    }

    #[test]
    fn request_roundtrips_through_envelope() {
        let request = CoreKitRequest::Sign {
            data: Binary::new(b"hello".to_vec()),
            hashed: false,
        };
        let env = request.into_envelope("c".into(), Some("i".into())).unwrap();
        assert_eq!(env.action, "sign");
        assert_eq!(env.payload.as_ref().unwrap()["data"]["type"], "Buffer");
        assert_eq!(CoreKitRequest::from_envelope(&env).unwrap(), request);
    }

    #[test]
    fn empty_variants_accept_empty_payload() {
        for name in [
            "logout",
            "commit_changes",
            "get_pub_key_ed25519",
            "get_pub_key_point",
            "_UNSAFE_exportTssEd25519Seed",
            "_UNSAFE_resetAccount",
        ] {
            let env = Envelope::request("c".into(), name, None, json!({}));
            let request = CoreKitRequest::from_envelope(&env).unwrap();
            assert_eq!(request.action().as_str(), name);
        }
    }

    #[test]
    fn payload_fields_are_camel_case() {
        let request = CoreKitRequest::DeleteFactor {
            factor_pub: "02ab".into(),
            factor_key: Some("k".into()),
        };
        assert_eq!(
            request.payload().unwrap(),
            json!({"factorPub": "02ab", "factorKey": "k"})
        );

        let env = Envelope::request(
            "c".into(),
            "enable_mfa",
            None,
            json!({"enableMFAParams": {}, "recoveryFactor": false}),
        );
        match CoreKitRequest::from_envelope(&env).unwrap() {
            CoreKitRequest::EnableMfa { recovery_factor, .. } => assert!(!recovery_factor),
            other => panic!("expected EnableMfa, got {other:?}"),
        }
    }

    #[test]
    fn storage_request_roundtrip() {
        let request = StorageRequest::SetItem {
            key: "k".into(),
            value: "v".into(),
        };
        let env = request.into_envelope("c".into(), "i".into()).unwrap();
        assert_eq!(env.action, "setItem");
        assert_eq!(env.payload, Some(json!({"key": "k", "value": "v"})));
        assert_eq!(StorageRequest::from_envelope(&env).unwrap(), request);
    }

    #[test]
    fn unknown_storage_action() {
        let env = Envelope::request("c".into(), "removeItem", Some("i".into()), json!({"key": "k"}));
        assert_eq!(
            StorageRequest::from_envelope(&env).unwrap_err().code(),
            "UNKNOWN_ACTION"
        );
    }

    #[test]
    fn cancel_signal_shares_correlation_id() {
        let key = CallKey::new("c9".into(), "sign");
        let env = Signal::cancel(&key);
        assert_eq!(env.kind, EnvelopeKind::Signal);
        assert_eq!(env.correlation_id, key.correlation_id);
        assert_eq!(env.action, "cancel");
        assert_eq!(
            Signal::from_envelope(&env).unwrap(),
            Signal::Cancel {
                action: "sign".into()
            }
        );
    }

    #[test]
    fn configure_signal_wire_shape() {
        let env = Signal::Configure {
            storage_timeout_ms: 10_000,
            max_message_size: 1024,
        }
        .into_envelope("c".into());
        assert_eq!(
            env.payload,
            Some(json!({"storageTimeoutMs": 10_000, "maxMessageSize": 1024}))
        );
    }

    #[test]
    fn reply_defaults_result_to_null() {
        let reply: CoreKitReply =
            serde_json::from_value(json!({"status": "INITIALIZED", "state": {}})).unwrap();
        assert!(reply.result.is_null());
        assert_eq!(reply.snapshot().status, CoreKitStatus::Initialized);
    }
}
