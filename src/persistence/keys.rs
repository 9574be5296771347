//! Encryption key storage: CRUD, lifecycle transitions, and their audit trail

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite};
use std::str::FromStr;
use uuid::Uuid;

use super::{push_paging, EncryptionKeyFilter, Session};
use crate::error::{Result, StoreError};
use crate::models::{
    validate_uuid, EncryptionKey, EncryptionKeyEventMetadata, EncryptionKeyState, SystemEventType,
};

fn key_from_row(row: &SqliteRow) -> Result<EncryptionKey> {
    Ok(EncryptionKey {
        id: row.try_get("id")?,
        enc_key_material: row.try_get("enc_key_material")?,
        state: EncryptionKeyState::from_str(&row.try_get::<String, _>("state")?)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn key_event_metadata(key_id: &str) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(EncryptionKeyEventMetadata {
        key_id: key_id.to_string(),
    })?)
}

impl Session<'_> {
    /// Record a KEK-wrapped symmetric encryption key.
    ///
    /// The new entry starts out ACTIVE.
    pub async fn record_encryption_key(&mut self, enc_key_material: &[u8]) -> Result<EncryptionKey> {
        let now = Utc::now();
        let entry = EncryptionKey {
            id: Uuid::new_v4().to_string(),
            enc_key_material: enc_key_material.to_vec(),
            state: EncryptionKeyState::Active,
            created_at: now,
            updated_at: now,
        };
        entry.validate()?;

        sqlx::query(
            "INSERT INTO encryption_keys (id, enc_key_material, state, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&entry.id)
        .bind(&entry.enc_key_material)
        .bind(entry.state.as_str())
        .bind(entry.created_at)
        .bind(entry.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| StoreError::from_insert(e, "encryption key"))?;

        let metadata = key_event_metadata(&entry.id)?;
        self.append_system_event(SystemEventType::AddNewEncryptionKey, Some(metadata))
            .await?;

        Ok(entry)
    }

    /// Fetch one encryption key
    pub async fn get_encryption_key(&mut self, key_id: &str) -> Result<EncryptionKey> {
        validate_uuid(key_id, "encryption key id")?;

        let row = sqlx::query(
            "SELECT id, enc_key_material, state, created_at, updated_at \
             FROM encryption_keys WHERE id = ?",
        )
        .bind(key_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        match row {
            Some(row) => key_from_row(&row),
            None => Err(StoreError::NotFound(format!("encryption key {key_id}"))),
        }
    }

    /// List encryption keys, newest first
    pub async fn list_encryption_keys(
        &mut self,
        filter: EncryptionKeyFilter,
    ) -> Result<Vec<EncryptionKey>> {
        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT id, enc_key_material, state, created_at, updated_at \
             FROM encryption_keys WHERE 1 = 1",
        );

        if !filter.target_states.is_empty() {
            builder.push(" AND state IN (");
            let mut parts = builder.separated(", ");
            for state in &filter.target_states {
                parts.push_bind(state.as_str());
            }
            builder.push(")");
        }

        builder.push(" ORDER BY created_at DESC");
        push_paging(&mut builder, filter.limit, filter.offset);

        let rows = builder.build().fetch_all(&mut *self.tx).await?;
        rows.iter().map(key_from_row).collect()
    }

    /// Mark an encryption key active
    pub async fn mark_encryption_key_active(&mut self, key_id: &str) -> Result<()> {
        self.update_encryption_key_state(key_id, EncryptionKeyState::Active)
            .await
    }

    /// Mark an encryption key inactive
    pub async fn mark_encryption_key_inactive(&mut self, key_id: &str) -> Result<()> {
        self.update_encryption_key_state(key_id, EncryptionKeyState::Inactive)
            .await
    }

    async fn update_encryption_key_state(
        &mut self,
        key_id: &str,
        new_state: EncryptionKeyState,
    ) -> Result<()> {
        let entry = self.get_encryption_key(key_id).await?;

        if entry.state == new_state {
            // NOOP: no write, no audit event
            return Ok(());
        }

        entry.validate_next_state(new_state)?;

        sqlx::query("UPDATE encryption_keys SET state = ?, updated_at = ? WHERE id = ?")
            .bind(new_state.as_str())
            .bind(Utc::now())
            .bind(&entry.id)
            .execute(&mut *self.tx)
            .await?;

        let event_type = match new_state {
            EncryptionKeyState::Active => SystemEventType::ActivateEncryptionKey,
            EncryptionKeyState::Inactive => SystemEventType::DeactivateEncryptionKey,
        };
        let metadata = key_event_metadata(&entry.id)?;
        self.append_system_event(event_type, Some(metadata)).await?;

        tracing::debug!(key_id, state = %new_state, "encryption key state updated");
        Ok(())
    }

    /// Delete an encryption key.
    ///
    /// Every record version encrypted by this key cascades away with it.
    pub async fn delete_encryption_key(&mut self, key_id: &str) -> Result<()> {
        let entry = self.get_encryption_key(key_id).await?;

        sqlx::query("DELETE FROM encryption_keys WHERE id = ?")
            .bind(&entry.id)
            .execute(&mut *self.tx)
            .await?;

        let metadata = key_event_metadata(&entry.id)?;
        self.append_system_event(SystemEventType::DeleteEncryptionKey, Some(metadata))
            .await?;

        tracing::debug!(key_id, "encryption key deleted");
        Ok(())
    }
}
