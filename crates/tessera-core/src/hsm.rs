//! The HSM boundary.
//!
//! Key material lives behind [`HsmProvider`]; everything persisted outside
//! it references keys only by opaque handle. The development provider keeps
//! a zeroizing in-process vault and derives keys with HKDF-SHA-512; a
//! production deployment substitutes a FIPS 140-3 module behind the same
//! capability set.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zeroize::Zeroize;

use crate::crypto::derive_key_32;
use crate::error::{Result, TesseraError};
use crate::shamir::{self, ShamirShare};

/// Domain-separation info string for per-key derivation.
const KEY_DERIVATION_INFO: &[u8] = b"tessera-aes-256-gcm";

/// Opaque reference to a key inside the HSM boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyHandle(String);

impl KeyHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[cfg(test)]
    pub(crate) fn from_raw(raw: impl Into<String>) -> Self {
        KeyHandle(raw.into())
    }
}

impl std::fmt::Display for KeyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A scoped copy of 32-byte key material. Zeroized on drop; callers hold it
/// only for the span of one encrypt or decrypt.
pub struct KeyMaterial(Secret<[u8; 32]>);

impl KeyMaterial {
    pub fn new(bytes: [u8; 32]) -> Self {
        KeyMaterial(Secret::new(bytes))
    }

    pub fn expose(&self) -> &[u8; 32] {
        self.0.expose_secret()
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyMaterial(..)")
    }
}

/// A share issued by `split_key_to_shares`, paired with the holder it is
/// destined for. Share bytes are caller-owned after the split; the core
/// persists only the metadata.
#[derive(Debug, Clone)]
pub struct IssuedShare {
    pub share: ShamirShare,
    pub holder_id: String,
}

/// Capability set of the key custodian.
#[async_trait]
pub trait HsmProvider: Send + Sync {
    /// Create a key and return its opaque handle plus the key id recorded in
    /// the database.
    async fn generate_key(&self) -> Result<(KeyHandle, Uuid)>;

    /// Return a fresh copy of the 32-byte key material. The caller is
    /// contractually required to drop it (zeroizing) as soon as the single
    /// crypto operation it serves is done.
    async fn key_material(&self, handle: &KeyHandle) -> Result<KeyMaterial>;

    /// Overwrite and delete the key. Idempotent: destroying an unknown or
    /// already-destroyed handle succeeds.
    async fn destroy_key(&self, handle: &KeyHandle) -> Result<()>;

    /// Split the key into `total` Shamir shares with reconstruction
    /// threshold `threshold`, one per holder id.
    async fn split_key_to_shares(
        &self,
        handle: &KeyHandle,
        threshold: u8,
        total: u8,
        holder_ids: &[String],
    ) -> Result<Vec<IssuedShare>>;

    /// Recover key material from at least `threshold` shares.
    async fn reconstruct_key_from_shares(
        &self,
        shares: &[ShamirShare],
        threshold: u8,
    ) -> Result<KeyMaterial>;
}

/// Development provider: in-memory vault, HKDF-SHA-512 derivation from
/// 32-byte random IKM with a per-key salt carrying the key id.
pub struct SoftHsm {
    vault: RwLock<HashMap<KeyHandle, Secret<[u8; 32]>>>,
}

impl SoftHsm {
    pub fn new() -> Self {
        SoftHsm {
            vault: RwLock::new(HashMap::new()),
        }
    }

    /// Drop every retained key. Called at process teardown; individual keys
    /// zeroize as their secrets drop.
    pub fn teardown(&self) {
        self.vault.write().clear();
    }

    fn derive(key_id: Uuid) -> Result<[u8; 32]> {
        let mut ikm = [0u8; 32];
        OsRng
            .try_fill_bytes(&mut ikm)
            .map_err(|e| TesseraError::RngFailure(e.to_string()))?;
        let salt = format!("tessera:key:{key_id}");
        let derived = derive_key_32(&ikm, salt.as_bytes(), KEY_DERIVATION_INFO);
        ikm.zeroize();
        Ok(*derived)
    }
}

impl Default for SoftHsm {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HsmProvider for SoftHsm {
    async fn generate_key(&self) -> Result<(KeyHandle, Uuid)> {
        let key_id = Uuid::new_v4();
        let handle = KeyHandle(format!("soft-hsm:v1:{key_id}"));
        let material = Self::derive(key_id)?;
        self.vault.write().insert(handle.clone(), Secret::new(material));
        Ok((handle, key_id))
    }

    async fn key_material(&self, handle: &KeyHandle) -> Result<KeyMaterial> {
        let vault = self.vault.read();
        let secret = vault.get(handle).ok_or(TesseraError::UnknownKeyHandle)?;
        Ok(KeyMaterial::new(*secret.expose_secret()))
    }

    async fn destroy_key(&self, handle: &KeyHandle) -> Result<()> {
        let mut vault = self.vault.write();
        if let Some(secret) = vault.remove(handle) {
            drop(secret); // zeroized by secrecy on drop
        }
        Ok(())
    }

    async fn split_key_to_shares(
        &self,
        handle: &KeyHandle,
        threshold: u8,
        total: u8,
        holder_ids: &[String],
    ) -> Result<Vec<IssuedShare>> {
        if holder_ids.len() != total as usize {
            return Err(TesseraError::Precondition(format!(
                "expected {total} holder ids, got {}",
                holder_ids.len()
            )));
        }
        let material = self.key_material(handle).await?;
        let shares = shamir::split(material.expose(), threshold, total)?;
        Ok(shares
            .into_iter()
            .zip(holder_ids.iter())
            .map(|(share, holder_id)| IssuedShare {
                share,
                holder_id: holder_id.clone(),
            })
            .collect())
    }

    async fn reconstruct_key_from_shares(
        &self,
        shares: &[ShamirShare],
        threshold: u8,
    ) -> Result<KeyMaterial> {
        let mut secret = shamir::reconstruct(shares, threshold)?;
        if secret.len() != 32 {
            secret.zeroize();
            return Err(TesseraError::InvalidKeyLength(secret.len()));
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&secret);
        secret.zeroize();
        Ok(KeyMaterial::new(bytes))
    }
}
