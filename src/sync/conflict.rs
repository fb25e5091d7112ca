//! Conflict detection and resolution
//!
//! A mapped record that changed on both sides since `last_synced_at` becomes a
//! pending row in `sync_conflicts` (at most one per entity). Resolution either
//! pushes the local copy, pulls the remote copy, or records a manual decision.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::Arc;

use super::adapters::{adapter_for, AdapterError, LocalTarget};
use super::error::SyncError;
use super::gateway::ApiGateway;
use super::models::{
    ConflictStatus, EntityKind, IntegrationConnection, LocalRecord, RemoteRecord,
    ResolutionPolicy, SyncConflict, SyncTrigger,
};
use crate::db::{optional_timestamp_column, timestamp_column, to_db_timestamp, Database, DbError};

/// Which side changed since the last sync
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeClass {
    Unchanged,
    LocalOnly,
    RemoteOnly,
    Both,
}

pub fn classify_change(local: &LocalRecord, remote: &RemoteRecord) -> ChangeClass {
    let local_changed = local.changed_since_sync();
    let remote_changed = remote.changed_since(local.last_synced_at);

    match (local_changed, remote_changed) {
        (false, false) => ChangeClass::Unchanged,
        (true, false) => ChangeClass::LocalOnly,
        (false, true) => ChangeClass::RemoteOnly,
        (true, true) => ChangeClass::Both,
    }
}

/// `last_synced_at` for a write that leaves both copies equal.
/// Never earlier than either side's `updated_at`.
pub(crate) fn sync_watermark(local_updated_at: DateTime<Utc>, remote_updated_at: DateTime<Utc>) -> DateTime<Utc> {
    Utc::now().max(local_updated_at).max(remote_updated_at)
}

#[derive(Debug, thiserror::Error)]
pub enum ConflictError {
    #[error("Conflict not found: {0}")]
    NotFound(i64),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("Database error: {0}")]
    Database(String),
}

impl From<DbError> for ConflictError {
    fn from(err: DbError) -> Self {
        ConflictError::Database(err.to_string())
    }
}

impl From<rusqlite::Error> for ConflictError {
    fn from(err: rusqlite::Error) -> Self {
        ConflictError::Database(err.to_string())
    }
}

impl From<AdapterError> for ConflictError {
    fn from(err: AdapterError) -> Self {
        ConflictError::Sync(SyncError::from(err))
    }
}

impl From<ConflictError> for SyncError {
    fn from(err: ConflictError) -> Self {
        match err {
            ConflictError::Sync(e) => e,
            e @ ConflictError::NotFound(_) => SyncError::ValidationError(e.to_string()),
            ConflictError::Database(msg) => SyncError::Database(msg),
        }
    }
}

const CONFLICT_COLUMNS: &str = "id, entity_type, entity_id, external_id, local_snapshot, \
     remote_snapshot, local_updated_at, remote_updated_at, detected_at, status, \
     resolution_policy, resolved_at, resolved_by";

fn conflict_from_row(row: &Row<'_>) -> rusqlite::Result<SyncConflict> {
    fn text_err(idx: usize, message: String) -> rusqlite::Error {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, message.into())
    }

    let entity_type: String = row.get(1)?;
    let local_snapshot: String = row.get(4)?;
    let remote_snapshot: String = row.get(5)?;
    let status: String = row.get(9)?;
    let policy: Option<String> = row.get(10)?;

    Ok(SyncConflict {
        id: row.get(0)?,
        entity_type: EntityKind::from_str(&entity_type).map_err(|e| text_err(1, e))?,
        entity_id: row.get(2)?,
        external_id: row.get(3)?,
        local_snapshot: serde_json::from_str(&local_snapshot).map_err(|e| text_err(4, e.to_string()))?,
        remote_snapshot: serde_json::from_str(&remote_snapshot).map_err(|e| text_err(5, e.to_string()))?,
        local_updated_at: timestamp_column(row, 6)?,
        remote_updated_at: timestamp_column(row, 7)?,
        detected_at: timestamp_column(row, 8)?,
        status: ConflictStatus::from_str(&status).map_err(|e| text_err(9, e))?,
        resolution_policy: policy
            .map(|p| ResolutionPolicy::from_str(&p))
            .transpose()
            .map_err(|e| text_err(10, e))?,
        resolved_at: optional_timestamp_column(row, 11)?,
        resolved_by: row.get(12)?,
    })
}

pub struct ConflictResolver {
    db: Arc<Database>,
    gateway: Arc<ApiGateway>,
}

impl ConflictResolver {
    pub fn new(db: Arc<Database>, gateway: Arc<ApiGateway>) -> Self {
        Self { db, gateway }
    }

    /// Persist a conflict. Returns `None` when one is already pending for the entity.
    pub fn record(
        &self,
        kind: EntityKind,
        local: &LocalRecord,
        remote: &RemoteRecord,
    ) -> Result<Option<SyncConflict>, ConflictError> {
        let local_snapshot = serde_json::Value::Object(local.data.clone());
        let remote_snapshot =
            serde_json::to_value(remote).map_err(|e| ConflictError::Database(e.to_string()))?;

        let conn = self.db.get_conn()?;
        let inserted = conn.execute(
            r#"
            INSERT OR IGNORE INTO sync_conflicts (
                entity_type, entity_id, external_id, local_snapshot, remote_snapshot,
                local_updated_at, remote_updated_at, detected_at, status
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'pending')
            "#,
            params![
                kind.as_str(),
                local.id,
                remote.external_id,
                local_snapshot.to_string(),
                remote_snapshot.to_string(),
                to_db_timestamp(&local.updated_at),
                to_db_timestamp(&remote.updated_at),
                to_db_timestamp(&Utc::now())
            ],
        )?;

        if inserted == 0 {
            log::debug!("Conflict already pending for {} {}", kind, local.id);
            return Ok(None);
        }

        let id = conn.last_insert_rowid();
        log::warn!(
            "Conflict detected for {} '{}' ({} <-> {})",
            kind,
            local.display_name,
            local.id,
            remote.external_id
        );
        load_conflict(&conn, id).map(Some)
    }

    pub fn get(&self, id: i64) -> Result<SyncConflict, ConflictError> {
        let conn = self.db.get_conn()?;
        load_conflict(&conn, id)
    }

    pub fn list_unresolved(&self) -> Result<Vec<SyncConflict>, ConflictError> {
        let sql = format!(
            "SELECT {} FROM sync_conflicts WHERE status = 'pending' ORDER BY detected_at ASC, id ASC",
            CONFLICT_COLUMNS
        );
        Ok(self.db.query(&sql, [], conflict_from_row)?)
    }

    /// Apply `policy` to a conflict. Resolving an already resolved conflict is a no-op.
    pub async fn resolve(
        &self,
        connection: &IntegrationConnection,
        id: i64,
        policy: ResolutionPolicy,
        resolved_by: &str,
        trigger: SyncTrigger,
    ) -> Result<SyncConflict, ConflictError> {
        let conflict = self.get(id)?;
        if conflict.status == ConflictStatus::Resolved {
            log::debug!("Conflict {} already resolved", id);
            return Ok(conflict);
        }

        match policy {
            ResolutionPolicy::Manual => {
                self.db.execute(
                    "UPDATE sync_conflicts SET resolution_policy = ?1 WHERE id = ?2 AND status = 'pending'",
                    params![policy.as_str(), id],
                )?;
            }
            ResolutionPolicy::UseLocal => {
                self.resolve_with_local(connection, &conflict, resolved_by, trigger)
                    .await?;
            }
            ResolutionPolicy::UseRemote => {
                self.resolve_with_remote(connection, &conflict, resolved_by, trigger)
                    .await?;
            }
        }

        log::info!("Conflict {} handled with policy {}", id, policy.as_str());
        self.get(id)
    }

    async fn resolve_with_local(
        &self,
        connection: &IntegrationConnection,
        conflict: &SyncConflict,
        resolved_by: &str,
        trigger: SyncTrigger,
    ) -> Result<(), ConflictError> {
        let adapter = adapter_for(conflict.entity_type);
        let (local, payload) = {
            let conn = self.db.get_conn()?;
            let local = self.load_local(&conn, conflict)?;
            let payload = adapter.to_remote_payload(&conn, &local)?;
            (local, payload)
        };

        let remote = self
            .gateway
            .update(connection, conflict.entity_type, &conflict.external_id, &payload, trigger)
            .await?;
        let synced_at = sync_watermark(local.updated_at, remote.updated_at);

        self.db.transaction(|tx| {
            adapter.mark_synced(tx, local.id, local.updated_at, synced_at)?;
            close_conflict(tx, conflict.id, ResolutionPolicy::UseLocal, resolved_by)
        })
    }

    async fn resolve_with_remote(
        &self,
        connection: &IntegrationConnection,
        conflict: &SyncConflict,
        resolved_by: &str,
        trigger: SyncTrigger,
    ) -> Result<(), ConflictError> {
        let adapter = adapter_for(conflict.entity_type);
        let local = {
            let conn = self.db.get_conn()?;
            self.load_local(&conn, conflict)?
        };

        let remote = self
            .gateway
            .get(connection, conflict.entity_type, &conflict.external_id, trigger)
            .await?;
        let synced_at = sync_watermark(local.updated_at, remote.updated_at);

        self.db.transaction(|tx| {
            adapter.apply_remote_update(
                tx,
                LocalTarget::Existing {
                    id: local.id,
                    expected_updated_at: local.updated_at,
                },
                &remote,
                synced_at,
            )?;
            close_conflict(tx, conflict.id, ResolutionPolicy::UseRemote, resolved_by)
        })
    }

    fn load_local(&self, conn: &Connection, conflict: &SyncConflict) -> Result<LocalRecord, ConflictError> {
        adapter_for(conflict.entity_type)
            .load_local(conn, conflict.entity_id)?
            .ok_or_else(|| {
                ConflictError::Sync(SyncError::ValidationError(format!(
                    "{} {} no longer exists locally",
                    conflict.entity_type, conflict.entity_id
                )))
            })
    }
}

fn load_conflict(conn: &Connection, id: i64) -> Result<SyncConflict, ConflictError> {
    let sql = format!("SELECT {} FROM sync_conflicts WHERE id = ?1", CONFLICT_COLUMNS);
    conn.query_row(&sql, [id], conflict_from_row)
        .optional()?
        .ok_or(ConflictError::NotFound(id))
}

fn close_conflict(
    conn: &Connection,
    id: i64,
    policy: ResolutionPolicy,
    resolved_by: &str,
) -> Result<(), ConflictError> {
    conn.execute(
        r#"
        UPDATE sync_conflicts
        SET status = 'resolved', resolution_policy = ?1, resolved_at = ?2, resolved_by = ?3
        WHERE id = ?4 AND status = 'pending'
        "#,
        params![policy.as_str(), to_db_timestamp(&Utc::now()), resolved_by, id],
    )?;
    Ok(())
}
