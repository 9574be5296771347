//! The system's cryptography engine.
//!
//! Solely responsible for all cryptographic operations: it owns the key
//! encryption key, generates and wraps data encryption keys, keeps the
//! process-local cache of unwrapped key material, and performs the AEAD
//! sealing and opening of record values. It also wraps the encryption-key
//! APIs of the persistence layer; the rest of the system never talks to
//! those directly.
//!
//! Cache policy: a key's plaintext is cached iff its persisted state is
//! ACTIVE, as of the last observed read. The cache reconciles at the
//! mutation points (activate, deactivate, delete) and during listing.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;

use crate::crypto::{EncryptedData, KeyEncryptionKey, SecureKey, XChaChaCipher};
use crate::error::{Result, StoreError};
use crate::models::{EncryptionKey, EncryptionKeyState};
use crate::persistence::{Connection, EncryptionKeyFilter, Session};

/// Cache entry pairing a key's DB entry with its unwrapped material
struct CachedKey {
    entry: EncryptionKey,
    plaintext: SecureKey,
}

/// Cryptography engine: KEK holder, DEK lifecycle, and AEAD operations
pub struct CryptoEngine {
    persistence: Connection,
    kek: KeyEncryptionKey,
    key_cache: RwLock<HashMap<String, CachedKey>>,
}

impl CryptoEngine {
    /// Define a new cryptography engine, loading the KEK from an X.509
    /// certificate PEM and the matching RSA private key PEM.
    ///
    /// Both files must be readable and parseable.
    pub fn new(persistence: Connection, kek_cert_file: &Path, kek_key_file: &Path) -> Result<Self> {
        let kek = KeyEncryptionKey::load(kek_cert_file, kek_key_file)?;
        Ok(Self::with_kek(persistence, kek))
    }

    /// Define a new cryptography engine around an already-loaded KEK
    pub fn with_kek(persistence: Connection, kek: KeyEncryptionKey) -> Self {
        Self {
            persistence,
            kek,
            key_cache: RwLock::new(HashMap::new()),
        }
    }

    // ------------------------------------------------------------------------
    // Cache plumbing

    /// Unwrap an ACTIVE key's material and store it; non-ACTIVE keys are
    /// never cached. RSA work happens outside the lock.
    fn cache_key(&self, entry: &EncryptionKey) -> Result<()> {
        if entry.state != EncryptionKeyState::Active {
            return Ok(());
        }

        let plaintext = self.kek.unwrap_key(&entry.enc_key_material).map_err(|e| {
            StoreError::Crypto(format!("unable to unwrap encryption key {}: {e}", entry.id))
        })?;

        self.key_cache.write().insert(
            entry.id.clone(),
            CachedKey {
                entry: entry.clone(),
                plaintext,
            },
        );
        Ok(())
    }

    fn cache_key_if_absent(&self, entry: &EncryptionKey) -> Result<()> {
        if self.key_cache.read().contains_key(&entry.id) {
            return Ok(());
        }
        self.cache_key(entry)
    }

    fn evict_key(&self, key_id: &str) {
        self.key_cache.write().remove(key_id);
    }

    fn cached_plaintext(&self, key_id: &str) -> Option<SecureKey> {
        self.key_cache.read().get(key_id).map(|c| c.plaintext.clone())
    }

    /// Number of keys currently held unwrapped in the cache
    pub fn cached_key_count(&self) -> usize {
        self.key_cache.read().len()
    }

    // ------------------------------------------------------------------------
    // Encryption key management

    /// Define a new symmetric data encryption key.
    ///
    /// The raw key is sampled from the OS RNG, wrapped under the KEK for
    /// persistence, and cached unwrapped. The plaintext never leaves memory.
    pub async fn new_encryption_key(
        &self,
        session: Option<&mut Session<'_>>,
    ) -> Result<EncryptionKey> {
        let raw_key = SecureKey::generate();
        let wrapped = self.kek.wrap(raw_key.as_bytes())?;

        let entry = match session {
            Some(s) => s.record_encryption_key(&wrapped).await?,
            None => {
                let mut s = self.persistence.begin().await?;
                let entry = s.record_encryption_key(&wrapped).await?;
                s.commit().await?;
                entry
            }
        };

        self.key_cache.write().insert(
            entry.id.clone(),
            CachedKey {
                entry: entry.clone(),
                plaintext: raw_key,
            },
        );

        tracing::debug!(key_id = %entry.id, "new data encryption key recorded");
        Ok(entry)
    }

    /// Fetch one encryption key.
    ///
    /// An ACTIVE key is unwrapped and cached on first sight; a non-ACTIVE
    /// key is returned as-is with no cache mutation.
    pub async fn get_encryption_key(
        &self,
        key_id: &str,
        session: Option<&mut Session<'_>>,
    ) -> Result<EncryptionKey> {
        let entry = match session {
            Some(s) => s.get_encryption_key(key_id).await?,
            None => {
                let mut s = self.persistence.begin().await?;
                let entry = s.get_encryption_key(key_id).await?;
                s.commit().await?;
                entry
            }
        };

        if entry.state == EncryptionKeyState::Active {
            self.cache_key_if_absent(&entry)?;
        }

        Ok(entry)
    }

    /// List encryption keys.
    ///
    /// Doubles as the cache's reconciliation pass: ACTIVE keys not yet
    /// cached are unwrapped and cached, non-ACTIVE keys still cached are
    /// evicted.
    pub async fn list_encryption_keys(
        &self,
        filter: EncryptionKeyFilter,
        session: Option<&mut Session<'_>>,
    ) -> Result<Vec<EncryptionKey>> {
        let entries = match session {
            Some(s) => s.list_encryption_keys(filter).await?,
            None => {
                let mut s = self.persistence.begin().await?;
                let entries = s.list_encryption_keys(filter).await?;
                s.commit().await?;
                entries
            }
        };

        for entry in &entries {
            if entry.state == EncryptionKeyState::Active {
                self.cache_key_if_absent(entry)?;
            } else {
                self.evict_key(&entry.id);
            }
        }

        Ok(entries)
    }

    /// Mark an encryption key active and return the post-transition entry.
    ///
    /// The key material is unwrapped back into the cache.
    pub async fn mark_encryption_key_active(
        &self,
        key_id: &str,
        session: Option<&mut Session<'_>>,
    ) -> Result<EncryptionKey> {
        let entry = match session {
            Some(s) => self.activate_in(key_id, s).await?,
            None => {
                let mut s = self.persistence.begin().await?;
                let entry = self.activate_in(key_id, &mut s).await?;
                s.commit().await?;
                entry
            }
        };
        tracing::debug!(key_id, "encryption key activated");
        Ok(entry)
    }

    async fn activate_in(&self, key_id: &str, s: &mut Session<'_>) -> Result<EncryptionKey> {
        s.mark_encryption_key_active(key_id).await?;
        let entry = s.get_encryption_key(key_id).await?;
        self.cache_key(&entry)?;
        Ok(entry)
    }

    /// Mark an encryption key inactive and return the post-transition entry.
    ///
    /// The cached plaintext for the key is evicted.
    pub async fn mark_encryption_key_inactive(
        &self,
        key_id: &str,
        session: Option<&mut Session<'_>>,
    ) -> Result<EncryptionKey> {
        let entry = match session {
            Some(s) => Self::deactivate_in(key_id, s).await?,
            None => {
                let mut s = self.persistence.begin().await?;
                let entry = Self::deactivate_in(key_id, &mut s).await?;
                s.commit().await?;
                entry
            }
        };

        self.evict_key(key_id);
        tracing::debug!(key_id, "encryption key deactivated");
        Ok(entry)
    }

    async fn deactivate_in(key_id: &str, s: &mut Session<'_>) -> Result<EncryptionKey> {
        s.mark_encryption_key_inactive(key_id).await?;
        s.get_encryption_key(key_id).await
    }

    /// Delete an encryption key.
    ///
    /// Cascades into every record version the key encrypted; the cached
    /// plaintext is evicted.
    pub async fn delete_encryption_key(
        &self,
        key_id: &str,
        session: Option<&mut Session<'_>>,
    ) -> Result<()> {
        match session {
            Some(s) => s.delete_encryption_key(key_id).await?,
            None => {
                let mut s = self.persistence.begin().await?;
                s.delete_encryption_key(key_id).await?;
                s.commit().await?;
            }
        }

        self.evict_key(key_id);
        tracing::debug!(key_id, "encryption key deleted");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Data encryption

    /// Encrypt a plaintext under the named key.
    ///
    /// The key must be ACTIVE with usable material; a fresh nonce is drawn
    /// per call.
    pub async fn encrypt_data(
        &self,
        key_id: &str,
        plaintext: &[u8],
        session: Option<&mut Session<'_>>,
    ) -> Result<(EncryptionKey, EncryptedData)> {
        let (entry, key) = self.usable_key(key_id, session).await?;
        let encrypted = XChaChaCipher::encrypt(&key, plaintext)?;
        Ok((entry, encrypted))
    }

    /// Decrypt a ciphertext under the named key.
    ///
    /// The key must be ACTIVE with usable material; authentication failure
    /// is a hard error.
    pub async fn decrypt_data(
        &self,
        key_id: &str,
        encrypted: &EncryptedData,
        session: Option<&mut Session<'_>>,
    ) -> Result<(EncryptionKey, Vec<u8>)> {
        let (entry, key) = self.usable_key(key_id, session).await?;
        let plaintext = XChaChaCipher::decrypt(&key, encrypted)?;
        Ok((entry, plaintext))
    }

    /// Fetch a key and its cached plaintext, rejecting keys unusable for
    /// data encryption.
    async fn usable_key(
        &self,
        key_id: &str,
        session: Option<&mut Session<'_>>,
    ) -> Result<(EncryptionKey, SecureKey)> {
        let entry = self.get_encryption_key(key_id, session).await?;

        if entry.state != EncryptionKeyState::Active {
            return Err(StoreError::StateViolation(format!(
                "encryption key {key_id} is not active"
            )));
        }

        match self.cached_plaintext(&entry.id) {
            Some(key) => Ok((entry, key)),
            None => Err(StoreError::StateViolation(format!(
                "encryption key {key_id} has no usable key material"
            ))),
        }
    }
}
