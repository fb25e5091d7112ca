//! Sync Error Log - Durable ledger of sync attempt outcomes
//!
//! Every per-record sync attempt that writes, fails or is skipped lands here.
//!
//! Features:
//! - SQLite-backed, rows are never deleted
//! - Idempotent append: a retry of the same (sync_type, entity_id, external_id)
//!   inside the retry window bumps `attempt_count` on the open row
//! - Filtered queries and grouped summaries for the error dashboard
//! - Idempotent manual resolution

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::error::SyncError;
use crate::db::{optional_timestamp_column, timestamp_column, to_db_timestamp, Database, DbError};

// ============================================================================
// Constants
// ============================================================================

const DEFAULT_RETRY_WINDOW_MINUTES: i64 = 60;
const DEFAULT_QUERY_LIMIT: usize = 200;
/// `resolved_by` stamped when a later success closes an open failure
const AUTO_RESOLVER: &str = "sync";

// ============================================================================
// Data Types
// ============================================================================

/// Attempt outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AttemptStatus {
    Success,
    Failed,
    Skipped,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s.to_ascii_uppercase().as_str() {
            "SUCCESS" => Ok(Self::Success),
            "FAILED" => Ok(Self::Failed),
            "SKIPPED" => Ok(Self::Skipped),
            _ => Err(format!("Unknown attempt status: {}", s)),
        }
    }

    /// Validation, duplicate and stale-record errors skip the record; the rest fail it
    pub fn for_error(err: &SyncError) -> Self {
        match err {
            SyncError::ValidationError(_)
            | SyncError::DuplicateEntityDetected(_)
            | SyncError::ConflictDetected(_) => Self::Skipped,
            _ => Self::Failed,
        }
    }
}

/// Attempt to record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSyncAttempt {
    pub sync_type: String,
    pub status: AttemptStatus,
    pub entity_id: Option<i64>,
    pub entity_name: Option<String>,
    pub external_id: Option<String>,
    pub error_message: Option<String>,
    pub error_details: Option<serde_json::Value>,
}

impl NewSyncAttempt {
    pub fn success(
        sync_type: &str,
        entity_id: Option<i64>,
        entity_name: Option<String>,
        external_id: Option<String>,
    ) -> Self {
        Self {
            sync_type: sync_type.to_string(),
            status: AttemptStatus::Success,
            entity_id,
            entity_name,
            external_id,
            error_message: None,
            error_details: None,
        }
    }

    pub fn from_error(
        sync_type: &str,
        entity_id: Option<i64>,
        entity_name: Option<String>,
        external_id: Option<String>,
        err: &SyncError,
    ) -> Self {
        Self {
            sync_type: sync_type.to_string(),
            status: AttemptStatus::for_error(err),
            entity_id,
            entity_name,
            external_id,
            error_message: Some(err.to_string()),
            error_details: Some(serde_json::json!({
                "code": err.code(),
                "retryable": err.is_retryable(),
            })),
        }
    }
}

/// Stored attempt row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncAttemptLog {
    pub id: i64,
    pub sync_type: String,
    pub status: AttemptStatus,
    pub entity_id: Option<i64>,
    pub entity_name: Option<String>,
    pub external_id: Option<String>,
    pub error_message: Option<String>,
    pub error_details: Option<serde_json::Value>,
    pub attempt_count: i64,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub notes: Option<String>,
}

impl SyncAttemptLog {
    const COLUMNS: &'static str = "id, sync_type, status, entity_id, entity_name, external_id, \
         error_message, error_details, attempt_count, created_at, last_attempt_at, \
         resolved_at, resolved_by, notes";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let status: String = row.get(2)?;
        let details: Option<String> = row.get(7)?;

        Ok(Self {
            id: row.get(0)?,
            sync_type: row.get(1)?,
            status: AttemptStatus::from_str(&status).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, e.into())
            })?,
            entity_id: row.get(3)?,
            entity_name: row.get(4)?,
            external_id: row.get(5)?,
            error_message: row.get(6)?,
            error_details: details.and_then(|d| serde_json::from_str(&d).ok()),
            attempt_count: row.get(8)?,
            created_at: timestamp_column(row, 9)?,
            last_attempt_at: timestamp_column(row, 10)?,
            resolved_at: optional_timestamp_column(row, 11)?,
            resolved_by: row.get(12)?,
            notes: row.get(13)?,
        })
    }
}

/// Query filter
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncLogFilter {
    pub unresolved_only: bool,
    pub since: Option<DateTime<Utc>>,
    pub sync_type: Option<String>,
    pub status: Option<AttemptStatus>,
    pub limit: Option<usize>,
}

impl SyncLogFilter {
    /// Unresolved attempts from the last `hours` hours
    pub fn recent(hours: i64) -> Self {
        Self {
            unresolved_only: true,
            since: Some(Utc::now() - Duration::hours(hours)),
            ..Default::default()
        }
    }

    fn where_clause(&self) -> (String, Vec<rusqlite::types::Value>) {
        use rusqlite::types::Value;

        let mut conditions = Vec::new();
        let mut args: Vec<Value> = Vec::new();

        if self.unresolved_only {
            conditions.push("resolved_at IS NULL".to_string());
        }
        if let Some(since) = self.since {
            args.push(Value::Text(to_db_timestamp(&since)));
            conditions.push(format!("last_attempt_at >= ?{}", args.len()));
        }
        if let Some(sync_type) = &self.sync_type {
            args.push(Value::Text(sync_type.clone()));
            conditions.push(format!("sync_type = ?{}", args.len()));
        }
        if let Some(status) = self.status {
            args.push(Value::Text(status.as_str().to_string()));
            conditions.push(format!("status = ?{}", args.len()));
        }

        let clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };
        (clause, args)
    }
}

/// Counts grouped by sync_type + status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncLogGroup {
    pub sync_type: String,
    pub status: AttemptStatus,
    pub count: i64,
    pub total_attempts: i64,
    pub last_attempt_at: DateTime<Utc>,
}

// ============================================================================
// Error Log
// ============================================================================

pub struct SyncErrorLog {
    db: Arc<Database>,
    retry_window: Duration,
}

impl SyncErrorLog {
    pub fn new(db: Arc<Database>) -> Self {
        Self::with_retry_window(db, Duration::minutes(DEFAULT_RETRY_WINDOW_MINUTES))
    }

    pub fn with_retry_window(db: Arc<Database>, retry_window: Duration) -> Self {
        Self { db, retry_window }
    }

    /// Record an attempt, folding retries into the open row for the same key
    pub fn append(&self, attempt: &NewSyncAttempt) -> Result<SyncAttemptLog, LogError> {
        let now = Utc::now();
        let now_str = to_db_timestamp(&now);
        let cutoff = to_db_timestamp(&(now - self.retry_window));
        let details = attempt.error_details.as_ref().map(|d| d.to_string());
        let auto_resolved = (attempt.status == AttemptStatus::Success).then(|| now_str.clone());

        self.db.transaction(|tx| {
            let existing: Option<i64> = tx
                .query_row(
                    r#"
                    SELECT id FROM sync_logs
                    WHERE sync_type = ?1 AND entity_id IS ?2 AND external_id IS ?3
                      AND resolved_at IS NULL AND last_attempt_at >= ?4
                    ORDER BY id DESC LIMIT 1
                    "#,
                    params![attempt.sync_type, attempt.entity_id, attempt.external_id, cutoff],
                    |row| row.get(0),
                )
                .optional()?;

            let id = match existing {
                Some(id) => {
                    tx.execute(
                        r#"
                        UPDATE sync_logs
                        SET status = ?1, entity_name = COALESCE(?2, entity_name),
                            error_message = ?3, error_details = ?4,
                            attempt_count = attempt_count + 1, last_attempt_at = ?5,
                            resolved_at = ?6, resolved_by = CASE WHEN ?6 IS NULL THEN NULL ELSE ?7 END
                        WHERE id = ?8
                        "#,
                        params![
                            attempt.status.as_str(),
                            attempt.entity_name,
                            attempt.error_message,
                            details,
                            now_str,
                            auto_resolved,
                            AUTO_RESOLVER,
                            id
                        ],
                    )?;
                    id
                }
                None => {
                    tx.execute(
                        r#"
                        INSERT INTO sync_logs (
                            sync_type, status, entity_id, entity_name, external_id,
                            error_message, error_details, attempt_count,
                            created_at, last_attempt_at, resolved_at, resolved_by
                        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8, ?8, ?9, CASE WHEN ?9 IS NULL THEN NULL ELSE ?10 END)
                        "#,
                        params![
                            attempt.sync_type,
                            attempt.status.as_str(),
                            attempt.entity_id,
                            attempt.entity_name,
                            attempt.external_id,
                            attempt.error_message,
                            details,
                            now_str,
                            auto_resolved,
                            AUTO_RESOLVER
                        ],
                    )?;
                    tx.last_insert_rowid()
                }
            };

            load_by_id(tx, id)
        })
    }

    pub fn get(&self, id: i64) -> Result<SyncAttemptLog, LogError> {
        let conn = self.db.get_conn()?;
        load_by_id(&conn, id)
    }

    /// Attempts matching `filter`, newest first
    pub fn query(&self, filter: &SyncLogFilter) -> Result<Vec<SyncAttemptLog>, LogError> {
        let (clause, args) = filter.where_clause();
        let limit = filter.limit.unwrap_or(DEFAULT_QUERY_LIMIT);
        let sql = format!(
            "SELECT {} FROM sync_logs {} ORDER BY last_attempt_at DESC, id DESC LIMIT {}",
            SyncAttemptLog::COLUMNS,
            clause,
            limit
        );

        Ok(self
            .db
            .query(&sql, rusqlite::params_from_iter(args.iter()), SyncAttemptLog::from_row)?)
    }

    /// Counts grouped by sync_type + status
    pub fn summarize(&self, filter: &SyncLogFilter) -> Result<Vec<SyncLogGroup>, LogError> {
        let (clause, args) = filter.where_clause();
        let sql = format!(
            r#"
            SELECT sync_type, status, COUNT(*), SUM(attempt_count), MAX(last_attempt_at)
            FROM sync_logs {}
            GROUP BY sync_type, status
            ORDER BY sync_type ASC, status ASC
            "#,
            clause
        );

        Ok(self.db.query(&sql, rusqlite::params_from_iter(args.iter()), |row| {
            let status: String = row.get(1)?;
            Ok(SyncLogGroup {
                sync_type: row.get(0)?,
                status: AttemptStatus::from_str(&status).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, e.into())
                })?,
                count: row.get(2)?,
                total_attempts: row.get(3)?,
                last_attempt_at: timestamp_column(row, 4)?,
            })
        })?)
    }

    /// Mark an attempt resolved. Returns false when it already was.
    pub fn resolve(&self, id: i64, resolved_by: &str, notes: Option<&str>) -> Result<bool, LogError> {
        let affected = self.db.execute(
            r#"
            UPDATE sync_logs
            SET resolved_at = ?1, resolved_by = ?2, notes = COALESCE(?3, notes)
            WHERE id = ?4 AND resolved_at IS NULL
            "#,
            params![to_db_timestamp(&Utc::now()), resolved_by, notes, id],
        )?;

        if affected == 1 {
            log::info!("Sync log {} resolved by {}", id, resolved_by);
            return Ok(true);
        }

        // Distinguish "already resolved" from "no such row"
        self.get(id)?;
        Ok(false)
    }
}

fn load_by_id(conn: &Connection, id: i64) -> Result<SyncAttemptLog, LogError> {
    let sql = format!("SELECT {} FROM sync_logs WHERE id = ?1", SyncAttemptLog::COLUMNS);
    conn.query_row(&sql, [id], SyncAttemptLog::from_row)
        .optional()?
        .ok_or(LogError::NotFound(id))
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Sync log entry not found: {0}")]
    NotFound(i64),
}

impl From<DbError> for LogError {
    fn from(err: DbError) -> Self {
        LogError::Database(err.to_string())
    }
}

impl From<rusqlite::Error> for LogError {
    fn from(err: rusqlite::Error) -> Self {
        LogError::Database(err.to_string())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_log() -> SyncErrorLog {
        let db = Arc::new(Database::in_memory().expect("Failed to create test DB"));
        SyncErrorLog::new(db)
    }

    fn failure(entity_id: i64, message: &str) -> NewSyncAttempt {
        NewSyncAttempt::from_error(
            "contact_sync",
            Some(entity_id),
            Some("Acme Pte Ltd".to_string()),
            None,
            &SyncError::NetworkTransient(message.to_string()),
        )
    }

    #[test]
    fn test_append_inserts_row() {
        let log = create_test_log();

        let row = log.append(&failure(7, "connection reset")).unwrap();
        assert_eq!(row.status, AttemptStatus::Failed);
        assert_eq!(row.attempt_count, 1);
        assert!(row.resolved_at.is_none());
        assert_eq!(row.error_details.unwrap()["code"], "network_transient");
    }

    #[test]
    fn test_retry_increments_attempt_count() {
        let log = create_test_log();

        let first = log.append(&failure(7, "connection reset")).unwrap();
        let second = log.append(&failure(7, "timeout")).unwrap();

        assert_eq!(second.id, first.id);
        assert_eq!(second.attempt_count, 2);
        assert_eq!(second.error_message.as_deref(), Some("Network error: timeout"));
        assert!(second.last_attempt_at >= first.last_attempt_at);
        assert_eq!(log.query(&SyncLogFilter::default()).unwrap().len(), 1);
    }

    #[test]
    fn test_retry_outside_window_opens_new_row() {
        let db = Arc::new(Database::in_memory().unwrap());
        let log = SyncErrorLog::with_retry_window(db.clone(), Duration::minutes(60));

        let first = log.append(&failure(7, "reset")).unwrap();
        db.execute(
            "UPDATE sync_logs SET last_attempt_at = ?1 WHERE id = ?2",
            params![to_db_timestamp(&(Utc::now() - Duration::hours(2))), first.id],
        )
        .unwrap();

        let second = log.append(&failure(7, "reset")).unwrap();
        assert_ne!(second.id, first.id);
        assert_eq!(second.attempt_count, 1);
    }

    #[test]
    fn test_success_closes_open_failure() {
        let log = create_test_log();

        let failed = log.append(&failure(3, "reset")).unwrap();
        let ok = log
            .append(&NewSyncAttempt::success("contact_sync", Some(3), None, None))
            .unwrap();

        assert_eq!(ok.id, failed.id);
        assert_eq!(ok.status, AttemptStatus::Success);
        assert_eq!(ok.attempt_count, 2);
        assert_eq!(ok.resolved_by.as_deref(), Some("sync"));
        assert!(log.query(&SyncLogFilter::recent(24)).unwrap().is_empty());
    }

    #[test]
    fn test_different_keys_are_separate_rows() {
        let log = create_test_log();
        log.append(&failure(1, "x")).unwrap();
        log.append(&failure(2, "x")).unwrap();

        let mut other_type = failure(1, "x");
        other_type.sync_type = "invoice_sync".to_string();
        log.append(&other_type).unwrap();

        assert_eq!(log.query(&SyncLogFilter::default()).unwrap().len(), 3);
    }

    #[test]
    fn test_query_filters() {
        let log = create_test_log();
        log.append(&failure(1, "x")).unwrap();
        log.append(&NewSyncAttempt::from_error(
            "invoice_sync",
            Some(9),
            Some("INV-9".into()),
            None,
            &SyncError::ValidationError("contact not synced".into()),
        ))
        .unwrap();

        let skipped = log
            .query(&SyncLogFilter {
                status: Some(AttemptStatus::Skipped),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].sync_type, "invoice_sync");

        let contacts = log
            .query(&SyncLogFilter {
                sync_type: Some("contact_sync".into()),
                limit: Some(10),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(contacts.len(), 1);

        let future = log
            .query(&SyncLogFilter {
                since: Some(Utc::now() + Duration::hours(1)),
                ..Default::default()
            })
            .unwrap();
        assert!(future.is_empty());
    }

    #[test]
    fn test_summarize_groups() {
        let log = create_test_log();
        log.append(&failure(1, "x")).unwrap();
        log.append(&failure(1, "x")).unwrap();
        log.append(&failure(2, "x")).unwrap();
        log.append(&NewSyncAttempt::success("invoice_sync", Some(4), None, None))
            .unwrap();

        let groups = log.summarize(&SyncLogFilter::default()).unwrap();
        assert_eq!(groups.len(), 2);

        let contact_failed = groups
            .iter()
            .find(|g| g.sync_type == "contact_sync" && g.status == AttemptStatus::Failed)
            .unwrap();
        assert_eq!(contact_failed.count, 2);
        assert_eq!(contact_failed.total_attempts, 3);
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let log = create_test_log();
        let row = log.append(&failure(1, "x")).unwrap();

        assert!(log.resolve(row.id, "ops@example.com", Some("fixed contact email")).unwrap());
        assert!(!log.resolve(row.id, "someone-else", None).unwrap());

        let stored = log.get(row.id).unwrap();
        assert_eq!(stored.resolved_by.as_deref(), Some("ops@example.com"));
        assert_eq!(stored.notes.as_deref(), Some("fixed contact email"));

        assert!(matches!(log.resolve(9999, "x", None), Err(LogError::NotFound(9999))));
    }
}
