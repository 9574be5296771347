//! The protected KV store: the user-facing orchestration binding record
//! naming, working-key selection, encryption, and versioning together.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::crypto::EncryptedData;
use crate::engine::CryptoEngine;
use crate::error::{Result, StoreError};
use crate::models::{EncryptionKey, EncryptionKeyState, Record, RecordVersion};
use crate::persistence::{Connection, EncryptionKeyFilter, RecordVersionFilter, Session};

/// Protected key-value store: records named values after encrypting them,
/// one immutable version per write.
///
/// Each instance is backed by a SQL database; two instances over the same
/// database are essentially copies of each other.
///
/// The working data encryption key is selected once at construction (the
/// newest ACTIVE key, or a freshly generated one) and is fixed for the
/// lifetime of the handle. If it becomes non-ACTIVE out of band, writes
/// fail.
pub struct ProtectedKvStore {
    persistence: Connection,
    engine: Arc<CryptoEngine>,
    working_key: EncryptionKey,
}

impl ProtectedKvStore {
    /// Define a new protected KV store, preparing the working encryption key
    pub async fn new(persistence: Connection, engine: Arc<CryptoEngine>) -> Result<Self> {
        let mut session = persistence.begin().await?;

        let active_keys = engine
            .list_encryption_keys(
                EncryptionKeyFilter {
                    target_states: vec![EncryptionKeyState::Active],
                    ..Default::default()
                },
                Some(&mut session),
            )
            .await?;

        let working_key = match active_keys.into_iter().next() {
            // Use the newest active key
            Some(key) => key,
            None => engine.new_encryption_key(Some(&mut session)).await?,
        };

        session.commit().await?;

        tracing::info!(key_id = %working_key.id, "protected KV store ready");
        Ok(Self {
            persistence,
            engine,
            working_key,
        })
    }

    /// The data encryption key this handle uses for new writes
    pub fn working_key(&self) -> &EncryptionKey {
        &self.working_key
    }

    /// Record a key-value pair.
    ///
    /// Resolves the record by name (creating it when absent), seals the
    /// value under the working key, and appends a new version stamped with
    /// the caller's timestamp. Everything happens in one transaction.
    pub async fn record_key_value(
        &self,
        key: &str,
        value: &[u8],
        timestamp: DateTime<Utc>,
        session: Option<&mut Session<'_>>,
    ) -> Result<(Record, RecordVersion)> {
        match session {
            Some(s) => self.record_key_value_in(key, value, timestamp, s).await,
            None => {
                let mut s = self.persistence.begin().await?;
                let result = self.record_key_value_in(key, value, timestamp, &mut s).await?;
                s.commit().await?;
                Ok(result)
            }
        }
    }

    async fn record_key_value_in(
        &self,
        key: &str,
        value: &[u8],
        timestamp: DateTime<Utc>,
        s: &mut Session<'_>,
    ) -> Result<(Record, RecordVersion)> {
        let record = match s.get_record_by_name(key).await {
            Ok(record) => record,
            Err(StoreError::NotFound(_)) => s.define_new_record(key).await?,
            Err(e) => return Err(e),
        };

        let (enc_key, encrypted) = self
            .engine
            .encrypt_data(&self.working_key.id, value, Some(&mut *s))
            .await?;

        let version = s
            .define_new_version_for_record(
                &record,
                &enc_key,
                &encrypted.ciphertext,
                &encrypted.nonce,
                timestamp,
            )
            .await?;

        tracing::debug!(key, version_id = %version.id, "key value recorded");
        Ok((record, version))
    }

    /// List the versions of a key, newest first.
    ///
    /// Fails if the key is unknown.
    pub async fn list_key_versions(
        &self,
        key: &str,
        session: Option<&mut Session<'_>>,
    ) -> Result<(Record, Vec<RecordVersion>)> {
        match session {
            Some(s) => Self::list_key_versions_in(key, s).await,
            None => {
                let mut s = self.persistence.begin().await?;
                let result = Self::list_key_versions_in(key, &mut s).await?;
                s.commit().await?;
                Ok(result)
            }
        }
    }

    async fn list_key_versions_in(
        key: &str,
        s: &mut Session<'_>,
    ) -> Result<(Record, Vec<RecordVersion>)> {
        let record = s.get_record_by_name(key).await?;
        let versions = s
            .list_versions_of_one_record(&record, RecordVersionFilter::default())
            .await?;
        Ok((record, versions))
    }

    /// Get the decrypted value of a key at a particular version by ID
    pub async fn get_value_of_key_at_version_id(
        &self,
        version_id: &str,
        mut session: Option<&mut Session<'_>>,
    ) -> Result<Vec<u8>> {
        let version = match session.as_deref_mut() {
            Some(s) => s.get_record_version(version_id).await?,
            None => {
                let mut s = self.persistence.begin().await?;
                let version = s.get_record_version(version_id).await?;
                s.commit().await?;
                version
            }
        };

        self.get_value_of_key_at_version(&version, session).await
    }

    /// Get the decrypted value of a key at a particular version
    pub async fn get_value_of_key_at_version(
        &self,
        version: &RecordVersion,
        session: Option<&mut Session<'_>>,
    ) -> Result<Vec<u8>> {
        let encrypted = EncryptedData::new(version.enc_nonce.clone(), version.enc_value.clone());
        let (_, plaintext) = self
            .engine
            .decrypt_data(&version.enc_key_id, &encrypted, session)
            .await?;
        Ok(plaintext)
    }

    /// Delete a key from storage.
    ///
    /// Every version of the key cascades away with the record.
    pub async fn delete_key(&self, key: &str, session: Option<&mut Session<'_>>) -> Result<()> {
        match session {
            Some(s) => Self::delete_key_in(key, s).await,
            None => {
                let mut s = self.persistence.begin().await?;
                Self::delete_key_in(key, &mut s).await?;
                s.commit().await?;
                Ok(())
            }
        }
    }

    async fn delete_key_in(key: &str, s: &mut Session<'_>) -> Result<()> {
        let record = s.get_record_by_name(key).await?;
        s.delete_record(&record.id).await?;
        tracing::debug!(key, "key deleted");
        Ok(())
    }
}
