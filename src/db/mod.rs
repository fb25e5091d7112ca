//! Database module for Ledger Bridge
//!
//! Provides SQLite storage for the accounting connection, the syncable
//! business entities (contacts, invoices, payments) and sync bookkeeping.
//! Every entity row carries its own external mapping (`external_id` +
//! `last_synced_at`); the UNIQUE constraint on `external_id` keeps the
//! mapping one-to-one.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

// Connection pooling
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;

/// Upper bound for any keyset page read by the sync engine
pub const MAX_PAGE_SIZE: usize = 500;

/// Database error types
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DbError {
    /// True when SQLite rejected the statement because of a UNIQUE/CHECK/FK constraint
    pub fn is_constraint_violation(&self) -> bool {
        match self {
            DbError::Constraint(_) => true,
            DbError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => {
                err.code == rusqlite::ErrorCode::ConstraintViolation
            }
            _ => false,
        }
    }
}

pub type DbResult<T> = Result<T, DbError>;

// ============================================================================
// Timestamps
// ============================================================================

/// Format a timestamp for storage.
///
/// Fixed-width nanosecond RFC 3339 so string comparison in SQL matches
/// chronological order and values round-trip exactly.
pub fn to_db_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn parse_db_timestamp(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(value).map(|dt| dt.with_timezone(&Utc))
}

pub(crate) fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_db_timestamp(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

pub(crate) fn optional_timestamp_column(
    row: &Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|value| {
        parse_db_timestamp(&value).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
    })
    .transpose()
}

// ============================================================================
// Database
// ============================================================================

/// Database manager for thread-safe SQLite access
#[derive(Clone)]
pub struct Database {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl Database {
    /// Create a new database connection pool backed by a file
    pub fn new(db_path: PathBuf) -> DbResult<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| DbError::Constraint(format!("Cannot create {}: {}", parent.display(), e)))?;
            }
        }

        let manager = SqliteConnectionManager::file(&db_path).with_init(|conn| {
            conn.execute_batch(
                r#"
                PRAGMA foreign_keys = ON;
                PRAGMA busy_timeout = 5000;
                "#,
            )
        });

        let pool = Pool::builder()
            .max_size(16)
            .min_idle(Some(2))
            .connection_timeout(std::time::Duration::from_secs(10))
            .test_on_check_out(false)
            .build(manager)?;

        let conn = pool.get()?;

        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -32000;
            PRAGMA temp_store = MEMORY;
        "#,
        )?;

        conn.execute_batch(include_str!("schema.sql"))?;
        Self::run_migrations(&conn)?;
        drop(conn);

        log::info!("Database opened at {}", db_path.display());

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Create an in-memory database (for testing).
    ///
    /// Every pooled connection to `:memory:` would be a separate database, so
    /// the pool holds exactly one connection. Callers must not hold a checked
    /// out connection while asking for another.
    pub fn in_memory() -> DbResult<Self> {
        let manager = SqliteConnectionManager::memory()
            .with_init(|conn| conn.execute_batch("PRAGMA foreign_keys = ON;"));

        let pool = Pool::builder()
            .max_size(1)
            .connection_timeout(std::time::Duration::from_secs(10))
            .build(manager)?;

        let conn = pool.get()?;
        conn.execute_batch(include_str!("schema.sql"))?;
        Self::run_migrations(&conn)?;
        drop(conn);

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Get a connection from the pool
    #[inline]
    pub fn get_conn(&self) -> DbResult<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    // =========================================================================
    // MIGRATIONS
    // =========================================================================

    /// Run additive migrations for databases created by older builds
    fn run_migrations(conn: &Connection) -> DbResult<()> {
        // Migration 1: registration number on contacts (natural key for matching)
        let has_registration_number: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM pragma_table_info('contacts') WHERE name = 'registration_number'",
                [],
                |row| row.get(0),
            )
            .unwrap_or(false);

        if !has_registration_number {
            log::info!("Running migration: Adding registration_number column to contacts");
            conn.execute("ALTER TABLE contacts ADD COLUMN registration_number TEXT", [])?;
        }

        // Migration 2: deactivation reason on connections (status reporting)
        let has_deactivation_reason: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM pragma_table_info('integration_connections') WHERE name = 'deactivation_reason'",
                [],
                |row| row.get(0),
            )
            .unwrap_or(false);

        if !has_deactivation_reason {
            log::info!("Running migration: Adding deactivation columns to integration_connections");
            conn.execute_batch(
                r#"
                ALTER TABLE integration_connections ADD COLUMN deactivated_at TEXT;
                ALTER TABLE integration_connections ADD COLUMN deactivation_reason TEXT;
                "#,
            )?;
        }

        Ok(())
    }

    // =========================================================================
    // HELPER METHODS
    // =========================================================================

    /// Run `f` inside an IMMEDIATE transaction; commits on `Ok`, rolls back on `Err`
    pub fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        E: From<DbError>,
        F: FnOnce(&Transaction<'_>) -> Result<T, E>,
    {
        let mut conn = self.get_conn().map_err(E::from)?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| E::from(DbError::from(e)))?;

        let value = f(&tx)?;
        tx.commit().map_err(|e| E::from(DbError::from(e)))?;
        Ok(value)
    }

    /// Execute a SQL statement and return affected rows
    pub fn execute<P>(&self, sql: &str, params: P) -> DbResult<usize>
    where
        P: rusqlite::Params,
    {
        let conn = self.get_conn()?;

        let affected = conn.execute(sql, params)?;
        Ok(affected)
    }

    /// Execute an INSERT statement and return the last inserted row ID
    pub fn execute_insert<P>(&self, sql: &str, params: P) -> DbResult<i64>
    where
        P: rusqlite::Params,
    {
        let conn = self.get_conn()?;

        conn.execute(sql, params)?;
        Ok(conn.last_insert_rowid())
    }

    /// Query database and map results
    pub fn query<T, P, F>(&self, sql: &str, params: P, f: F) -> DbResult<Vec<T>>
    where
        P: rusqlite::Params,
        F: FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    {
        let conn = self.get_conn()?;

        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, f)?;

        rows.collect::<rusqlite::Result<Vec<T>>>()
            .map_err(DbError::from)
    }

    /// Query single row
    pub fn query_row<T, P, F>(&self, sql: &str, params: P, f: F) -> DbResult<T>
    where
        P: rusqlite::Params,
        F: FnOnce(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    {
        let conn = self.get_conn()?;

        conn.query_row(sql, params, f).map_err(DbError::from)
    }

    /// Execute batch SQL
    pub fn execute_batch(&self, sql: &str) -> DbResult<()> {
        let conn = self.get_conn()?;

        conn.execute_batch(sql).map_err(DbError::from)
    }

    // =========================================================================
    // SETTINGS
    // =========================================================================

    /// Get a setting value
    pub fn get_setting<T: serde::de::DeserializeOwned>(&self, key: &str) -> DbResult<Option<T>> {
        let conn = self.get_conn()?;
        let result: Option<String> = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .optional()?;

        match result {
            Some(json) => {
                let value: T = serde_json::from_str(&json)
                    .map_err(|e| DbError::Serialization(e.to_string()))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Set a setting value
    pub fn set_setting<T: Serialize>(&self, key: &str, value: &T) -> DbResult<()> {
        let conn = self.get_conn()?;
        let json = serde_json::to_string(value)
            .map_err(|e| DbError::Serialization(e.to_string()))?;

        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, json],
        )?;

        Ok(())
    }

    // =========================================================================
    // INTEGRATION CONNECTIONS
    // =========================================================================

    /// The single active connection, if any
    pub fn get_active_connection(&self) -> DbResult<Option<StoredConnection>> {
        let conn = self.get_conn()?;
        let sql = format!(
            "SELECT {} FROM integration_connections WHERE is_active = 1",
            StoredConnection::COLUMNS
        );
        Ok(conn.query_row(&sql, [], StoredConnection::from_row).optional()?)
    }

    pub fn get_connection(&self, id: i64) -> DbResult<Option<StoredConnection>> {
        let conn = self.get_conn()?;
        let sql = format!(
            "SELECT {} FROM integration_connections WHERE id = ?1",
            StoredConnection::COLUMNS
        );
        Ok(conn.query_row(&sql, [id], StoredConnection::from_row).optional()?)
    }

    /// Most recently created connection regardless of state (for status reasons)
    pub fn get_latest_connection(&self) -> DbResult<Option<StoredConnection>> {
        let conn = self.get_conn()?;
        let sql = format!(
            "SELECT {} FROM integration_connections ORDER BY id DESC LIMIT 1",
            StoredConnection::COLUMNS
        );
        Ok(conn.query_row(&sql, [], StoredConnection::from_row).optional()?)
    }

    /// Insert a new active connection, deactivating the previous one in the same transaction
    pub fn activate_connection(&self, new: &NewConnection) -> DbResult<i64> {
        self.transaction(|tx| {
            let now = to_db_timestamp(&Utc::now());

            let replaced = tx.execute(
                r#"
                UPDATE integration_connections
                SET is_active = 0, deactivated_at = ?1,
                    deactivation_reason = 'replaced by a new connection', updated_at = ?1
                WHERE is_active = 1
                "#,
                params![now],
            )?;
            if replaced > 0 {
                log::info!("Deactivated previous accounting connection");
            }

            tx.execute(
                r#"
                INSERT INTO integration_connections (
                    tenant_id, access_token_encrypted, refresh_token_encrypted,
                    expires_at, connected_at, is_active, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, 1, ?5)
                "#,
                params![
                    new.tenant_id,
                    new.access_token_encrypted,
                    new.refresh_token_encrypted,
                    to_db_timestamp(&new.expires_at),
                    now,
                ],
            )?;

            Ok(tx.last_insert_rowid())
        })
    }

    /// Persist a rotated token pair. Returns false if the row is no longer active.
    pub fn rotate_connection_tokens(
        &self,
        id: i64,
        access_token_encrypted: &str,
        refresh_token_encrypted: &str,
        expires_at: &DateTime<Utc>,
    ) -> DbResult<bool> {
        let affected = self.execute(
            r#"
            UPDATE integration_connections
            SET access_token_encrypted = ?1, refresh_token_encrypted = ?2,
                expires_at = ?3, updated_at = ?4
            WHERE id = ?5 AND is_active = 1
            "#,
            params![
                access_token_encrypted,
                refresh_token_encrypted,
                to_db_timestamp(expires_at),
                to_db_timestamp(&Utc::now()),
                id
            ],
        )?;

        Ok(affected == 1)
    }

    /// Mark a connection inactive. The row is kept for audit history.
    pub fn deactivate_connection(&self, id: i64, reason: &str) -> DbResult<bool> {
        let now = to_db_timestamp(&Utc::now());
        let affected = self.execute(
            r#"
            UPDATE integration_connections
            SET is_active = 0, deactivated_at = ?1, deactivation_reason = ?2, updated_at = ?1
            WHERE id = ?3 AND is_active = 1
            "#,
            params![now, reason, id],
        )?;

        Ok(affected == 1)
    }

    pub fn touch_connection_sync(&self, id: i64, at: &DateTime<Utc>) -> DbResult<()> {
        self.execute(
            "UPDATE integration_connections SET last_sync_at = ?1 WHERE id = ?2",
            params![to_db_timestamp(at), id],
        )?;
        Ok(())
    }

    // =========================================================================
    // CONTACTS
    // =========================================================================

    pub fn insert_contact(&self, contact: &NewContact) -> DbResult<i64> {
        let now = to_db_timestamp(&Utc::now());
        self.execute_insert(
            r#"
            INSERT INTO contacts (name, email, phone, registration_number, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?5)
            "#,
            params![
                contact.name,
                contact.email,
                contact.phone,
                contact.registration_number,
                now
            ],
        )
    }

    /// Overwrite a contact's business fields and bump `updated_at`
    pub fn update_contact(&self, id: i64, contact: &NewContact) -> DbResult<()> {
        let affected = self.execute(
            r#"
            UPDATE contacts
            SET name = ?1, email = ?2, phone = ?3, registration_number = ?4, updated_at = ?5
            WHERE id = ?6
            "#,
            params![
                contact.name,
                contact.email,
                contact.phone,
                contact.registration_number,
                to_db_timestamp(&Utc::now()),
                id
            ],
        )?;

        if affected == 0 {
            return Err(DbError::NotFound(format!("contact {}", id)));
        }
        Ok(())
    }

    pub fn get_contact(&self, id: i64) -> DbResult<Contact> {
        let sql = format!("SELECT {} FROM contacts WHERE id = ?1", Contact::COLUMNS);
        self.query_row(&sql, [id], Contact::from_row)
            .map_err(|e| match e {
                DbError::Sqlite(rusqlite::Error::QueryReturnedNoRows) => {
                    DbError::NotFound(format!("contact {}", id))
                }
                other => other,
            })
    }

    pub fn get_all_contacts(&self) -> DbResult<Vec<Contact>> {
        let sql = format!("SELECT {} FROM contacts ORDER BY id ASC", Contact::COLUMNS);
        self.query(&sql, [], Contact::from_row)
    }

    // =========================================================================
    // INVOICES
    // =========================================================================

    pub fn insert_invoice(&self, invoice: &NewInvoice) -> DbResult<i64> {
        let now = to_db_timestamp(&Utc::now());
        self.execute_insert(
            r#"
            INSERT INTO invoices (
                invoice_number, contact_id, issue_date, due_date, currency,
                total_cents, status, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
            "#,
            params![
                invoice.invoice_number,
                invoice.contact_id,
                invoice.issue_date,
                invoice.due_date,
                invoice.currency,
                invoice.total_cents,
                invoice.status,
                now
            ],
        )
    }

    pub fn update_invoice(&self, id: i64, invoice: &NewInvoice) -> DbResult<()> {
        let affected = self.execute(
            r#"
            UPDATE invoices
            SET invoice_number = ?1, contact_id = ?2, issue_date = ?3, due_date = ?4,
                currency = ?5, total_cents = ?6, status = ?7, updated_at = ?8
            WHERE id = ?9
            "#,
            params![
                invoice.invoice_number,
                invoice.contact_id,
                invoice.issue_date,
                invoice.due_date,
                invoice.currency,
                invoice.total_cents,
                invoice.status,
                to_db_timestamp(&Utc::now()),
                id
            ],
        )?;

        if affected == 0 {
            return Err(DbError::NotFound(format!("invoice {}", id)));
        }
        Ok(())
    }

    pub fn get_invoice(&self, id: i64) -> DbResult<Invoice> {
        let sql = format!("SELECT {} FROM invoices WHERE id = ?1", Invoice::COLUMNS);
        self.query_row(&sql, [id], Invoice::from_row)
            .map_err(|e| match e {
                DbError::Sqlite(rusqlite::Error::QueryReturnedNoRows) => {
                    DbError::NotFound(format!("invoice {}", id))
                }
                other => other,
            })
    }

    // =========================================================================
    // PAYMENTS
    // =========================================================================

    pub fn insert_payment(&self, payment: &NewPayment) -> DbResult<i64> {
        let now = to_db_timestamp(&Utc::now());
        self.execute_insert(
            r#"
            INSERT INTO payments (invoice_id, amount_cents, paid_on, reference, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?5)
            "#,
            params![
                payment.invoice_id,
                payment.amount_cents,
                payment.paid_on,
                payment.reference,
                now
            ],
        )
    }

    pub fn get_payment(&self, id: i64) -> DbResult<Payment> {
        let sql = format!("SELECT {} FROM payments WHERE id = ?1", Payment::COLUMNS);
        self.query_row(&sql, [id], Payment::from_row)
            .map_err(|e| match e {
                DbError::Sqlite(rusqlite::Error::QueryReturnedNoRows) => {
                    DbError::NotFound(format!("payment {}", id))
                }
                other => other,
            })
    }
}

// ============================================================================
// Row types
// ============================================================================

/// Connection row as stored (tokens still encrypted)
#[derive(Clone, Serialize, Deserialize)]
pub struct StoredConnection {
    pub id: i64,
    pub tenant_id: String,
    pub access_token_encrypted: String,
    pub refresh_token_encrypted: String,
    pub expires_at: DateTime<Utc>,
    pub connected_at: DateTime<Utc>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub deactivated_at: Option<DateTime<Utc>>,
    pub deactivation_reason: Option<String>,
}

impl StoredConnection {
    const COLUMNS: &'static str = "id, tenant_id, access_token_encrypted, refresh_token_encrypted, \
         expires_at, connected_at, last_sync_at, is_active, deactivated_at, deactivation_reason";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            tenant_id: row.get(1)?,
            access_token_encrypted: row.get(2)?,
            refresh_token_encrypted: row.get(3)?,
            expires_at: timestamp_column(row, 4)?,
            connected_at: timestamp_column(row, 5)?,
            last_sync_at: optional_timestamp_column(row, 6)?,
            is_active: row.get(7)?,
            deactivated_at: optional_timestamp_column(row, 8)?,
            deactivation_reason: row.get(9)?,
        })
    }
}

impl std::fmt::Debug for StoredConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredConnection")
            .field("id", &self.id)
            .field("tenant_id", &self.tenant_id)
            .field("access_token_encrypted", &"[REDACTED]")
            .field("refresh_token_encrypted", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .field("is_active", &self.is_active)
            .finish()
    }
}

#[derive(Clone)]
pub struct NewConnection {
    pub tenant_id: String,
    pub access_token_encrypted: String,
    pub refresh_token_encrypted: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Contact {
    pub id: i64,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub registration_number: Option<String>,
    pub external_id: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Contact {
    pub const COLUMNS: &'static str = "id, name, email, phone, registration_number, external_id, \
         last_synced_at, created_at, updated_at";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            email: row.get(2)?,
            phone: row.get(3)?,
            registration_number: row.get(4)?,
            external_id: row.get(5)?,
            last_synced_at: optional_timestamp_column(row, 6)?,
            created_at: timestamp_column(row, 7)?,
            updated_at: timestamp_column(row, 8)?,
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewContact {
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub registration_number: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Invoice {
    pub id: i64,
    pub invoice_number: String,
    pub contact_id: i64,
    pub issue_date: Option<String>,
    pub due_date: Option<String>,
    pub currency: String,
    pub total_cents: i64,
    pub status: String,
    pub external_id: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Invoice {
    pub const COLUMNS: &'static str = "id, invoice_number, contact_id, issue_date, due_date, currency, \
         total_cents, status, external_id, last_synced_at, created_at, updated_at";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            invoice_number: row.get(1)?,
            contact_id: row.get(2)?,
            issue_date: row.get(3)?,
            due_date: row.get(4)?,
            currency: row.get(5)?,
            total_cents: row.get(6)?,
            status: row.get(7)?,
            external_id: row.get(8)?,
            last_synced_at: optional_timestamp_column(row, 9)?,
            created_at: timestamp_column(row, 10)?,
            updated_at: timestamp_column(row, 11)?,
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewInvoice {
    pub invoice_number: String,
    pub contact_id: i64,
    pub issue_date: Option<String>,
    pub due_date: Option<String>,
    pub currency: String,
    pub total_cents: i64,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Payment {
    pub id: i64,
    pub invoice_id: i64,
    pub amount_cents: i64,
    pub paid_on: String,
    pub reference: Option<String>,
    pub external_id: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    pub const COLUMNS: &'static str = "id, invoice_id, amount_cents, paid_on, reference, external_id, \
         last_synced_at, created_at, updated_at";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            invoice_id: row.get(1)?,
            amount_cents: row.get(2)?,
            paid_on: row.get(3)?,
            reference: row.get(4)?,
            external_id: row.get(5)?,
            last_synced_at: optional_timestamp_column(row, 6)?,
            created_at: timestamp_column(row, 7)?,
            updated_at: timestamp_column(row, 8)?,
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewPayment {
    pub invoice_id: i64,
    pub amount_cents: i64,
    pub paid_on: String,
    pub reference: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn new_connection(tenant: &str) -> NewConnection {
        NewConnection {
            tenant_id: tenant.to_string(),
            access_token_encrypted: "enc-access".to_string(),
            refresh_token_encrypted: "enc-refresh".to_string(),
            expires_at: Utc::now() + Duration::minutes(30),
        }
    }

    #[test]
    fn test_database_creation() {
        let db = Database::in_memory().expect("Failed to create in-memory database");

        let id = db
            .insert_contact(&NewContact {
                name: "Acme Pte Ltd".to_string(),
                email: Some("billing@acme.sg".to_string()),
                ..Default::default()
            })
            .expect("Failed to add contact");
        assert!(id > 0);

        let contacts = db.get_all_contacts().expect("Failed to get contacts");
        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0].name, "Acme Pte Ltd");
        assert!(contacts[0].external_id.is_none());
    }

    #[test]
    fn test_settings() {
        let db = Database::in_memory().expect("Failed to create database");

        let missing: Option<String> = db.get_setting("nope").expect("Failed to get setting");
        assert!(missing.is_none());

        db.set_setting("custom_key", &"custom_value")
            .expect("Failed to set setting");

        let value: Option<String> = db.get_setting("custom_key").expect("Failed to get setting");
        assert_eq!(value, Some("custom_value".to_string()));
    }

    #[test]
    fn test_timestamp_round_trip_and_ordering() {
        let earlier = Utc::now();
        let later = earlier + Duration::nanoseconds(1);

        let a = to_db_timestamp(&earlier);
        let b = to_db_timestamp(&later);

        assert!(a < b);
        assert_eq!(parse_db_timestamp(&a).unwrap(), earlier);
    }

    #[test]
    fn test_single_active_connection() {
        let db = Database::in_memory().unwrap();

        let first = db.activate_connection(&new_connection("tenant-a")).unwrap();
        let second = db.activate_connection(&new_connection("tenant-b")).unwrap();

        let active = db.get_active_connection().unwrap().unwrap();
        assert_eq!(active.id, second);
        assert_eq!(active.tenant_id, "tenant-b");

        let old = db.get_connection(first).unwrap().unwrap();
        assert!(!old.is_active);
        assert!(old.deactivation_reason.is_some());

        // The partial unique index rejects a second active row
        let result = db.execute(
            "UPDATE integration_connections SET is_active = 1 WHERE id = ?1",
            [first],
        );
        assert!(result.unwrap_err().is_constraint_violation());
    }

    #[test]
    fn test_rotate_tokens_only_on_active_row() {
        let db = Database::in_memory().unwrap();
        let id = db.activate_connection(&new_connection("tenant")).unwrap();
        let expires = Utc::now() + Duration::minutes(30);

        assert!(db.rotate_connection_tokens(id, "a2", "r2", &expires).unwrap());

        assert!(db.deactivate_connection(id, "revoked").unwrap());
        assert!(!db.rotate_connection_tokens(id, "a3", "r3", &expires).unwrap());
        // Deactivating twice is a no-op
        assert!(!db.deactivate_connection(id, "revoked").unwrap());

        let row = db.get_connection(id).unwrap().unwrap();
        assert_eq!(row.access_token_encrypted, "a2");
    }

    #[test]
    fn test_external_id_is_unique() {
        let db = Database::in_memory().unwrap();
        let a = db.insert_contact(&NewContact { name: "A".into(), ..Default::default() }).unwrap();
        let b = db.insert_contact(&NewContact { name: "B".into(), ..Default::default() }).unwrap();

        db.execute("UPDATE contacts SET external_id = 'ext-1' WHERE id = ?1", [a]).unwrap();
        let err = db
            .execute("UPDATE contacts SET external_id = 'ext-1' WHERE id = ?1", [b])
            .unwrap_err();
        assert!(err.is_constraint_violation());
    }

    #[test]
    fn test_update_contact_bumps_updated_at() {
        let db = Database::in_memory().unwrap();
        let id = db.insert_contact(&NewContact { name: "Old".into(), ..Default::default() }).unwrap();
        let before = db.get_contact(id).unwrap();

        db.update_contact(id, &NewContact { name: "New".into(), ..Default::default() }).unwrap();
        let after = db.get_contact(id).unwrap();

        assert_eq!(after.name, "New");
        assert!(after.updated_at > before.updated_at);
        assert!(matches!(db.get_contact(9999), Err(DbError::NotFound(_))));
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let db = Database::in_memory().unwrap();

        let result: Result<(), DbError> = db.transaction(|tx| {
            tx.execute(
                "INSERT INTO settings (key, value) VALUES ('k', '\"v\"')",
                [],
            )?;
            Err(DbError::Constraint("boom".to_string()))
        });
        assert!(result.is_err());

        let value: Option<String> = db.get_setting("k").unwrap();
        assert!(value.is_none());
    }

    #[test]
    fn test_file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");

        {
            let db = Database::new(path.clone()).unwrap();
            db.insert_contact(&NewContact { name: "Persisted".into(), ..Default::default() })
                .unwrap();
        }

        let db = Database::new(path).unwrap();
        let contacts = db.get_all_contacts().unwrap();
        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0].name, "Persisted");
    }
}
