//! Key material: factor keys and the threshold signing key.
//!
//! Factor keys are 32 random bytes, hex encoded on the wire. A factor is
//! identified by its public key: the hex encoded Ed25519 verifying key of the
//! factor bytes. The threshold key is derived deterministically from the
//! account nonce, so every factor of an account unlocks the same key.

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::RngCore;
use sha2::{Digest, Sha256};

use keybridge_core::types::Network;
use keybridge_core::EngineError;

/// A 32-byte factor key.
#[derive(Clone, PartialEq, Eq)]
pub struct FactorKey([u8; 32]);

impl FactorKey {
    /// A fresh random factor key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Parse a 64 character hex factor key.
    pub fn parse(hex_key: &str) -> Result<Self, EngineError> {
        let bytes = hex::decode(hex_key.trim())
            .map_err(|_| EngineError::InvalidInput("factor key must be hex encoded".into()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| EngineError::InvalidInput("factor key must be 32 bytes".into()))?;
        Ok(Self(bytes))
    }

    /// The key derived from the login alone, used until MFA is enabled.
    pub fn hashed(client_id: &str, verifier: &str, verifier_id: &str) -> Self {
        let mut hasher = Sha256::new();
        for part in ["keybridge-hashed-factor", client_id, verifier, verifier_id] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        Self(hasher.finalize().into())
    }

    /// Hex encoding of the key.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Public identifier of the factor.
    pub fn public(&self) -> String {
        hex::encode(SigningKey::from_bytes(&self.0).verifying_key().as_bytes())
    }
}

impl std::fmt::Debug for FactorKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FactorKey([REDACTED])")
    }
}

/// Inputs the threshold key is derived from.
pub struct TssSeed<'a> {
    pub client_id: &'a str,
    pub network: Network,
    pub verifier: &'a str,
    pub verifier_id: &'a str,
    pub nonce: &'a str,
    pub account_index: u32,
}

impl TssSeed<'_> {
    /// The signing key for this account and wallet index.
    pub fn signing_key(&self) -> SigningKey {
        let network = match self.network {
            Network::Devnet => "devnet",
            Network::Mainnet => "mainnet",
        };
        let mut hasher = Sha256::new();
        for part in [self.client_id, network, self.verifier, self.verifier_id, self.nonce] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        hasher.update(self.account_index.to_be_bytes());
        SigningKey::from_bytes(&hasher.finalize().into())
    }

    /// The public key for this account and wallet index.
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key().verifying_key()
    }
}

/// A fresh random account nonce.
pub fn generate_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Hex SHA-256 digest.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// The 32-byte message digest to sign.
pub fn digest(data: &[u8], hashed: bool) -> Result<[u8; 32], EngineError> {
    if hashed {
        data.try_into().map_err(|_| {
            EngineError::InvalidInput(format!(
                "pre-hashed data must be 32 bytes, got {}",
                data.len()
            ))
        })
    } else {
        Ok(Sha256::digest(data).into())
    }
}
