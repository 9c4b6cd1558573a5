//! Engine-facing data types carried inside envelope payloads.
//!
//! Field names are camelCase on the wire.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::codec::Binary;

/// Externally observable lifecycle status of an engine instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CoreKitStatus {
    /// Created but `init` has not completed.
    #[default]
    NotInitialized,
    /// Initialized, no user logged in.
    Initialized,
    /// Logged in but another factor is needed to reconstruct the key.
    RequiredShare,
    /// Logged in with a usable key.
    LoggedIn,
}

impl fmt::Display for CoreKitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotInitialized => "NOT_INITIALIZED",
            Self::Initialized => "INITIALIZED",
            Self::RequiredShare => "REQUIRED_SHARE",
            Self::LoggedIn => "LOGGED_IN",
        };
        f.write_str(name)
    }
}

/// Identity of the logged in user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    /// Verifier (login provider) name.
    pub verifier: String,
    /// User identifier at the verifier.
    pub verifier_id: String,
}

/// Externally observable state record of an engine instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoreKitState {
    /// Active wallet index.
    #[serde(default)]
    pub account_index: u32,
    /// Hex encoded factor key currently in use.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factor_key: Option<String>,
    /// Share index of the factor in use.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tss_share_index: Option<u32>,
    /// Public key of the threshold key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tss_pub_key: Option<Binary>,
    /// Logged in user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_info: Option<UserInfo>,
    /// Session signatures issued at login.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub signatures: Vec<String>,
}

impl CoreKitState {
    /// Whether no field carries information.
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Status and state together, as returned with every engine response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Engine status.
    pub status: CoreKitStatus,
    /// Engine state record.
    pub state: CoreKitState,
}

/// Affine coordinates of a curve point, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubKeyPoint {
    /// X coordinate.
    pub x: String,
    /// Y coordinate.
    pub y: String,
}

/// Network the engine talks to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    /// Development network.
    #[default]
    Devnet,
    /// Production network.
    Mainnet,
}

/// Signature scheme of the threshold key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    /// Ed25519.
    #[default]
    Ed25519,
    /// ECDSA over secp256k1.
    Secp256k1,
}

/// Options an engine instance is created with.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoreKitOptions {
    /// Application client identifier.
    pub client_id: String,
    /// Target network.
    #[serde(default)]
    pub network: Network,
    /// Key type.
    #[serde(default)]
    pub key_type: KeyType,
    /// Defer metadata writes until `commit_changes`.
    #[serde(default)]
    pub manual_sync: bool,
    /// Engine specific options passed through untouched.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

/// Parameters of `init`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitParams {
    /// Restore a previously persisted session if one exists.
    #[serde(default = "default_true")]
    pub rehydrate: bool,
}

impl Default for InitParams {
    fn default() -> Self {
        Self { rehydrate: true }
    }
}

fn default_true() -> bool {
    true
}

/// Parameters of `login_with_jwt`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JwtLoginParams {
    /// Verifier (login provider) name.
    pub verifier: String,
    /// User identifier at the verifier.
    pub verifier_id: String,
    /// The identity token issued by the verifier.
    pub id_token: String,
}

/// Kind of share a factor key unlocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShareType {
    /// Device share.
    Device,
    /// Recovery share.
    Recovery,
}

impl ShareType {
    /// The threshold share index backing this share type.
    pub fn share_index(self) -> u32 {
        match self {
            Self::Device => 2,
            Self::Recovery => 3,
        }
    }
}

/// Parameters of `create_factor`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateFactorParams {
    /// Share type of the new factor.
    pub share_type: ShareType,
    /// Hex factor key to register; generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factor_key: Option<String>,
    /// Free-form description stored with the factor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share_description: Option<String>,
}

/// Parameters of `enable_mfa`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnableMfaParams {
    /// Hex device factor key to use; generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factor_key: Option<String>,
    /// Description stored with the recovery factor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share_description: Option<String>,
}

/// Summary of how the user's key is split across factors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyDetails {
    /// Key type.
    pub key_type: KeyType,
    /// Number of shares needed to sign.
    pub threshold: u32,
    /// Factors still needed before the key is usable.
    pub required_factors: u32,
    /// Number of registered factors.
    pub total_factors: u32,
    /// Factor public key → description.
    pub share_descriptions: BTreeMap<String, String>,
    /// Public key of the threshold key.
    pub tss_pub_key: Binary,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_uses_screaming_case_on_the_wire() {
        let json = serde_json::to_value(CoreKitStatus::LoggedIn).unwrap();
        assert_eq!(json, "LOGGED_IN");
        assert_eq!(CoreKitStatus::RequiredShare.to_string(), "REQUIRED_SHARE");
    }

    #[test]
    fn empty_state_serializes_compactly() {
        let json = serde_json::to_value(CoreKitState::default()).unwrap();
        assert_eq!(json, serde_json::json!({"accountIndex": 0}));
        assert!(CoreKitState::default().is_empty());
    }

    #[test]
    fn state_carries_pub_key_as_tagged_buffer() {
        let state = CoreKitState {
            tss_pub_key: Some(Binary::new(vec![1, 2])),
            ..Default::default()
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["tssPubKey"]["type"], "Buffer");
        let back: CoreKitState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
        assert!(!back.is_empty());
    }

    #[test]
    fn options_default_network_and_key_type() {
        let options: CoreKitOptions =
            serde_json::from_value(serde_json::json!({"clientId": "app"})).unwrap();
        assert_eq!(options.network, Network::Devnet);
        assert_eq!(options.key_type, KeyType::Ed25519);
        assert!(!options.manual_sync);
    }

    #[test]
    fn init_params_rehydrate_by_default() {
        let params: InitParams = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(params.rehydrate);
    }
}
