//! System parameters singleton and the append-only audit log

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite};
use std::str::FromStr;
use uuid::Uuid;

use super::{push_paging, Session, SystemEventFilter};
use crate::error::Result;
use crate::models::{
    SystemEventAudit, SystemEventType, SystemParams, SystemState, SYSTEM_PARAMS_ENTRY_ID,
};

fn event_from_row(row: &SqliteRow) -> Result<SystemEventAudit> {
    let event_type = SystemEventType::from_str(&row.try_get::<String, _>("type")?)?;
    let metadata = match row.try_get::<Option<String>, _>("metadata")? {
        Some(raw) => Some(serde_json::from_str(&raw)?),
        None => None,
    };
    Ok(SystemEventAudit {
        id: row.try_get("id")?,
        event_type,
        metadata,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn params_from_row(row: &SqliteRow) -> Result<SystemParams> {
    Ok(SystemParams {
        id: row.try_get("id")?,
        state: SystemState::from_str(&row.try_get::<String, _>("state")?)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

impl Session<'_> {
    /// Record a new system event.
    ///
    /// Always invoked after the entity mutation it describes, inside the
    /// same transaction.
    pub(crate) async fn append_system_event(
        &mut self,
        event_type: SystemEventType,
        metadata: Option<serde_json::Value>,
    ) -> Result<SystemEventAudit> {
        let now = Utc::now();
        let event = SystemEventAudit {
            id: Uuid::now_v7().to_string(),
            event_type,
            metadata,
            created_at: now,
            updated_at: now,
        };
        // Reject malformed metadata before it reaches the table
        event.parse_metadata()?;

        let metadata_text = event.metadata.as_ref().map(|m| m.to_string());
        sqlx::query(
            "INSERT INTO system_audit_events (id, type, metadata, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&event.id)
        .bind(event.event_type.as_str())
        .bind(metadata_text)
        .bind(event.created_at)
        .bind(event.updated_at)
        .execute(&mut *self.tx)
        .await?;

        Ok(event)
    }

    /// List captured system events, oldest first
    pub async fn list_system_events(
        &mut self,
        filter: SystemEventFilter,
    ) -> Result<Vec<SystemEventAudit>> {
        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT id, type, metadata, created_at, updated_at FROM system_audit_events WHERE 1 = 1",
        );

        if !filter.event_types.is_empty() {
            builder.push(" AND type IN (");
            let mut parts = builder.separated(", ");
            for event_type in &filter.event_types {
                parts.push_bind(event_type.as_str());
            }
            builder.push(")");
        }
        if let Some(after) = filter.events_after {
            builder.push(" AND created_at >= ");
            builder.push_bind(after);
        }
        if let Some(before) = filter.events_before {
            builder.push(" AND created_at <= ");
            builder.push_bind(before);
        }

        builder.push(" ORDER BY created_at ASC, id ASC");
        push_paging(&mut builder, filter.limit, filter.offset);

        let rows = builder.build().fetch_all(&mut *self.tx).await?;
        rows.iter().map(event_from_row).collect()
    }

    /// Fetch the global singleton system parameter entry.
    ///
    /// Lazily created in state PRE_INITIALIZATION on first read.
    pub async fn get_system_params(&mut self) -> Result<SystemParams> {
        let row = sqlx::query(
            "SELECT id, state, created_at, updated_at FROM system_params WHERE id = ?",
        )
        .bind(SYSTEM_PARAMS_ENTRY_ID)
        .fetch_optional(&mut *self.tx)
        .await?;

        if let Some(row) = row {
            return params_from_row(&row);
        }

        let now = Utc::now();
        let entry = SystemParams {
            id: SYSTEM_PARAMS_ENTRY_ID.to_string(),
            state: SystemState::PreInitialization,
            created_at: now,
            updated_at: now,
        };
        sqlx::query(
            "INSERT INTO system_params (id, state, created_at, updated_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&entry.id)
        .bind(entry.state.as_str())
        .bind(entry.created_at)
        .bind(entry.updated_at)
        .execute(&mut *self.tx)
        .await?;

        Ok(entry)
    }

    /// Mark the system as initializing
    pub async fn mark_system_initializing(&mut self) -> Result<()> {
        self.update_system_state(SystemState::Initializing).await
    }

    /// Mark the system as fully initialized
    pub async fn mark_system_initialized(&mut self) -> Result<()> {
        self.update_system_state(SystemState::Running).await
    }

    async fn update_system_state(&mut self, new_state: SystemState) -> Result<()> {
        let entry = self.get_system_params().await?;

        if entry.state == new_state {
            // NOOP: no write, no audit event
            return Ok(());
        }

        entry.validate_next_state(new_state)?;

        sqlx::query("UPDATE system_params SET state = ?, updated_at = ? WHERE id = ?")
            .bind(new_state.as_str())
            .bind(Utc::now())
            .bind(&entry.id)
            .execute(&mut *self.tx)
            .await?;

        match new_state {
            SystemState::Initializing => {
                self.append_system_event(SystemEventType::SystemInitializing, None)
                    .await?;
            }
            SystemState::Running => {
                self.append_system_event(SystemEventType::SystemInitialized, None)
                    .await?;
            }
            SystemState::PreInitialization => {}
        }

        tracing::debug!(state = %new_state, "system state updated");
        Ok(())
    }
}
