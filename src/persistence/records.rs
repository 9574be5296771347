//! Data records and their immutable encrypted versions

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite};
use uuid::Uuid;

use super::{push_paging, RecordFilter, RecordVersionFilter, Session};
use crate::error::{Result, StoreError};
use crate::models::{
    validate_uuid, EncryptionKey, Record, RecordEventMetadata, RecordVersion, SystemEventType,
};

fn record_from_row(row: &SqliteRow) -> Result<Record> {
    Ok(Record {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn version_from_row(row: &SqliteRow) -> Result<RecordVersion> {
    Ok(RecordVersion {
        id: row.try_get("id")?,
        record_id: row.try_get("record_id")?,
        enc_key_id: row.try_get("enc_key_id")?,
        enc_value: row.try_get("enc_value")?,
        enc_nonce: row.try_get("enc_nonce")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn record_event_metadata(record_id: &str, record_name: &str) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(RecordEventMetadata {
        record_id: record_id.to_string(),
        record_name: record_name.to_string(),
    })?)
}

impl Session<'_> {
    /// Define a new data record.
    ///
    /// The name must be unique among live records; a name freed by a
    /// deletion may be reused and receives a fresh id.
    pub async fn define_new_record(&mut self, name: &str) -> Result<Record> {
        let now = Utc::now();
        let entry = Record {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            created_at: now,
            updated_at: now,
        };
        entry.validate()?;

        sqlx::query("INSERT INTO records (id, name, created_at, updated_at) VALUES (?, ?, ?, ?)")
            .bind(&entry.id)
            .bind(&entry.name)
            .bind(entry.created_at)
            .bind(entry.updated_at)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| StoreError::from_insert(e, &format!("record '{name}'")))?;

        let metadata = record_event_metadata(&entry.id, &entry.name)?;
        self.append_system_event(SystemEventType::AddNewRecord, Some(metadata))
            .await?;

        Ok(entry)
    }

    /// Fetch a data record by ID
    pub async fn get_record(&mut self, record_id: &str) -> Result<Record> {
        validate_uuid(record_id, "record id")?;

        let row = sqlx::query("SELECT id, name, created_at, updated_at FROM records WHERE id = ?")
            .bind(record_id)
            .fetch_optional(&mut *self.tx)
            .await?;

        match row {
            Some(row) => record_from_row(&row),
            None => Err(StoreError::NotFound(format!("record {record_id}"))),
        }
    }

    /// Fetch a data record by name
    pub async fn get_record_by_name(&mut self, record_name: &str) -> Result<Record> {
        let row = sqlx::query("SELECT id, name, created_at, updated_at FROM records WHERE name = ?")
            .bind(record_name)
            .fetch_optional(&mut *self.tx)
            .await?;

        match row {
            Some(row) => record_from_row(&row),
            None => Err(StoreError::NotFound(format!("record '{record_name}'"))),
        }
    }

    /// List data records, newest first
    pub async fn list_records(&mut self, filter: RecordFilter) -> Result<Vec<Record>> {
        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT id, name, created_at, updated_at FROM records WHERE 1 = 1",
        );

        builder.push(" ORDER BY created_at DESC");
        push_paging(&mut builder, filter.limit, filter.offset);

        let rows = builder.build().fetch_all(&mut *self.tx).await?;
        rows.iter().map(record_from_row).collect()
    }

    /// Delete a data record.
    ///
    /// Every version of the record cascades away with it. The audit event
    /// captures the id and name of the now-deleted record.
    pub async fn delete_record(&mut self, record_id: &str) -> Result<()> {
        let entry = self.get_record(record_id).await?;

        sqlx::query("DELETE FROM records WHERE id = ?")
            .bind(&entry.id)
            .execute(&mut *self.tx)
            .await?;

        let metadata = record_event_metadata(&entry.id, &entry.name)?;
        self.append_system_event(SystemEventType::DeleteRecord, Some(metadata))
            .await?;

        tracing::debug!(record_id, name = %entry.name, "record deleted");
        Ok(())
    }

    /// Define a new version of a data record.
    ///
    /// Both timestamps come from the caller; the version is immutable after
    /// insert and emits no audit event.
    pub async fn define_new_version_for_record(
        &mut self,
        record: &Record,
        enc_key: &EncryptionKey,
        enc_value: &[u8],
        enc_nonce: &[u8],
        timestamp: DateTime<Utc>,
    ) -> Result<RecordVersion> {
        let entry = RecordVersion {
            id: Uuid::now_v7().to_string(),
            record_id: record.id.clone(),
            enc_key_id: enc_key.id.clone(),
            enc_value: enc_value.to_vec(),
            enc_nonce: enc_nonce.to_vec(),
            created_at: timestamp,
            updated_at: timestamp,
        };
        entry.validate()?;

        sqlx::query(
            "INSERT INTO record_versions \
             (id, record_id, enc_key_id, enc_value, enc_nonce, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.id)
        .bind(&entry.record_id)
        .bind(&entry.enc_key_id)
        .bind(&entry.enc_value)
        .bind(&entry.enc_nonce)
        .bind(entry.created_at)
        .bind(entry.updated_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| StoreError::from_insert(e, &format!("version for record {}", record.id)))?;

        Ok(entry)
    }

    /// Fetch a record version by ID
    pub async fn get_record_version(&mut self, version_id: &str) -> Result<RecordVersion> {
        validate_uuid(version_id, "record version id")?;

        let row = sqlx::query(
            "SELECT id, record_id, enc_key_id, enc_value, enc_nonce, created_at, updated_at \
             FROM record_versions WHERE id = ?",
        )
        .bind(version_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        match row {
            Some(row) => version_from_row(&row),
            None => Err(StoreError::NotFound(format!("record version {version_id}"))),
        }
    }

    /// List record versions, newest first
    pub async fn list_all_record_versions(
        &mut self,
        filter: RecordVersionFilter,
    ) -> Result<Vec<RecordVersion>> {
        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT id, record_id, enc_key_id, enc_value, enc_nonce, created_at, updated_at \
             FROM record_versions WHERE 1 = 1",
        );

        if let Some(record_id) = &filter.target_record_id {
            builder.push(" AND record_id = ");
            builder.push_bind(record_id.clone());
        }
        if let Some(enc_key_id) = &filter.target_enc_key_id {
            builder.push(" AND enc_key_id = ");
            builder.push_bind(enc_key_id.clone());
        }

        builder.push(" ORDER BY created_at DESC");
        push_paging(&mut builder, filter.limit, filter.offset);

        let rows = builder.build().fetch_all(&mut *self.tx).await?;
        rows.iter().map(version_from_row).collect()
    }

    /// List the versions of a specific record
    pub async fn list_versions_of_one_record(
        &mut self,
        record: &Record,
        mut filter: RecordVersionFilter,
    ) -> Result<Vec<RecordVersion>> {
        filter.target_record_id = Some(record.id.clone());
        self.list_all_record_versions(filter).await
    }

    /// List the versions encrypted with a specific encryption key
    pub async fn list_versions_encrypted_by_key(
        &mut self,
        enc_key: &EncryptionKey,
        mut filter: RecordVersionFilter,
    ) -> Result<Vec<RecordVersion>> {
        filter.target_enc_key_id = Some(enc_key.id.clone());
        self.list_all_record_versions(filter).await
    }
}
