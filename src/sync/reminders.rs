//! Reminders - maintenance nudges raised by background scans
//!
//! Currently one scan: local invoices that still have no external mapping
//! after a minimum age. Creating a reminder is idempotent per
//! (type, subject) within a 7-day recency window, so overlapping scans never
//! produce duplicates.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::db::{optional_timestamp_column, timestamp_column, to_db_timestamp, Database, DbError};

pub const UNSYNCED_INVOICE: &str = "unsynced_invoice";

const RECENCY_WINDOW_DAYS: i64 = 7;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reminder {
    pub id: i64,
    pub reminder_type: String,
    pub subject_type: String,
    pub subject_id: i64,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Reminder {
    const COLUMNS: &'static str =
        "id, reminder_type, subject_type, subject_id, message, created_at, resolved_at";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            reminder_type: row.get(1)?,
            subject_type: row.get(2)?,
            subject_id: row.get(3)?,
            message: row.get(4)?,
            created_at: timestamp_column(row, 5)?,
            resolved_at: optional_timestamp_column(row, 6)?,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReminderError {
    #[error("Database error: {0}")]
    Database(String),
}

impl From<DbError> for ReminderError {
    fn from(err: DbError) -> Self {
        ReminderError::Database(err.to_string())
    }
}

impl From<rusqlite::Error> for ReminderError {
    fn from(err: rusqlite::Error) -> Self {
        ReminderError::Database(err.to_string())
    }
}

pub struct ReminderScanner {
    db: Arc<Database>,
    min_age: Duration,
}

impl ReminderScanner {
    pub fn new(db: Arc<Database>, min_age: Duration) -> Self {
        Self { db, min_age }
    }

    /// Insert a reminder unless an unresolved one for the same subject is recent
    pub fn create_if_absent(
        &self,
        reminder_type: &str,
        subject_type: &str,
        subject_id: i64,
        message: &str,
    ) -> Result<Option<Reminder>, ReminderError> {
        let now = Utc::now();
        let window_start = to_db_timestamp(&(now - Duration::days(RECENCY_WINDOW_DAYS)));

        self.db.transaction(|tx| {
            let existing: Option<i64> = tx
                .query_row(
                    r#"
                    SELECT id FROM reminders
                    WHERE reminder_type = ?1 AND subject_type = ?2 AND subject_id = ?3
                      AND resolved_at IS NULL AND created_at >= ?4
                    LIMIT 1
                    "#,
                    params![reminder_type, subject_type, subject_id, window_start],
                    |row| row.get(0),
                )
                .optional()?;

            if existing.is_some() {
                return Ok(None);
            }

            tx.execute(
                r#"
                INSERT INTO reminders (reminder_type, subject_type, subject_id, message, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                "#,
                params![reminder_type, subject_type, subject_id, message, to_db_timestamp(&now)],
            )?;
            let id = tx.last_insert_rowid();

            let sql = format!("SELECT {} FROM reminders WHERE id = ?1", Reminder::COLUMNS);
            Ok(Some(tx.query_row(&sql, [id], Reminder::from_row)?))
        })
    }

    /// Raise reminders for invoices unmapped for longer than `min_age`. Returns the new ones.
    pub fn scan_unsynced_invoices(&self) -> Result<Vec<Reminder>, ReminderError> {
        let cutoff = to_db_timestamp(&(Utc::now() - self.min_age));
        let stale: Vec<(i64, String)> = self.db.query(
            r#"
            SELECT id, invoice_number FROM invoices
            WHERE external_id IS NULL AND created_at <= ?1
            ORDER BY id ASC
            "#,
            params![cutoff],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let mut created = Vec::new();
        for (id, number) in stale {
            let message = format!(
                "Invoice {} has not been synced to the accounting system",
                number
            );
            if let Some(reminder) = self.create_if_absent(UNSYNCED_INVOICE, "invoice", id, &message)? {
                created.push(reminder);
            }
        }

        if !created.is_empty() {
            log::info!("Created {} unsynced invoice reminder(s)", created.len());
        }
        Ok(created)
    }

    pub fn list_unresolved(&self) -> Result<Vec<Reminder>, ReminderError> {
        let sql = format!(
            "SELECT {} FROM reminders WHERE resolved_at IS NULL ORDER BY created_at ASC, id ASC",
            Reminder::COLUMNS
        );
        Ok(self.db.query(&sql, [], Reminder::from_row)?)
    }

    /// Returns false when the reminder was already resolved or does not exist
    pub fn resolve(&self, id: i64) -> Result<bool, ReminderError> {
        let affected = self.db.execute(
            "UPDATE reminders SET resolved_at = ?1 WHERE id = ?2 AND resolved_at IS NULL",
            params![to_db_timestamp(&Utc::now()), id],
        )?;
        Ok(affected == 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{NewContact, NewInvoice};

    fn setup() -> (Arc<Database>, ReminderScanner) {
        let db = Arc::new(Database::in_memory().unwrap());
        let scanner = ReminderScanner::new(db.clone(), Duration::hours(24));
        (db, scanner)
    }

    fn old_invoice(db: &Database, number: &str, age: Duration) -> i64 {
        let contact_id = db
            .insert_contact(&NewContact {
                name: format!("Customer {}", number),
                ..Default::default()
            })
            .unwrap();
        let id = db
            .insert_invoice(&NewInvoice {
                invoice_number: number.to_string(),
                contact_id,
                currency: "SGD".to_string(),
                total_cents: 10_000,
                status: "draft".to_string(),
                ..Default::default()
            })
            .unwrap();
        db.execute(
            "UPDATE invoices SET created_at = ?1 WHERE id = ?2",
            params![to_db_timestamp(&(Utc::now() - age)), id],
        )
        .unwrap();
        id
    }

    #[test]
    fn test_scan_creates_reminder_for_old_unsynced_invoice() {
        let (db, scanner) = setup();
        let old = old_invoice(&db, "INV-001", Duration::hours(48));
        old_invoice(&db, "INV-002", Duration::hours(1));

        let created = scanner.scan_unsynced_invoices().unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].subject_id, old);
        assert!(created[0].message.contains("INV-001"));
    }

    #[test]
    fn test_scan_is_idempotent() {
        let (db, scanner) = setup();
        old_invoice(&db, "INV-001", Duration::hours(48));

        assert_eq!(scanner.scan_unsynced_invoices().unwrap().len(), 1);
        assert!(scanner.scan_unsynced_invoices().unwrap().is_empty());
        assert_eq!(scanner.list_unresolved().unwrap().len(), 1);
    }

    #[test]
    fn test_mapped_invoice_is_ignored() {
        let (db, scanner) = setup();
        let id = old_invoice(&db, "INV-001", Duration::hours(48));
        db.execute("UPDATE invoices SET external_id = 'inv-1' WHERE id = ?1", params![id])
            .unwrap();

        assert!(scanner.scan_unsynced_invoices().unwrap().is_empty());
    }

    #[test]
    fn test_stale_unresolved_reminder_is_renewed() {
        let (db, scanner) = setup();
        let id = old_invoice(&db, "INV-001", Duration::hours(48));
        let first = scanner.scan_unsynced_invoices().unwrap().remove(0);
        db.execute(
            "UPDATE reminders SET created_at = ?1 WHERE id = ?2",
            params![to_db_timestamp(&(Utc::now() - Duration::days(8))), first.id],
        )
        .unwrap();

        let renewed = scanner.scan_unsynced_invoices().unwrap();
        assert_eq!(renewed.len(), 1);
        assert_eq!(renewed[0].subject_id, id);
    }

    #[test]
    fn test_resolve_reminder() {
        let (db, scanner) = setup();
        old_invoice(&db, "INV-001", Duration::hours(48));
        let reminder = scanner.scan_unsynced_invoices().unwrap().remove(0);

        assert!(scanner.resolve(reminder.id).unwrap());
        assert!(!scanner.resolve(reminder.id).unwrap());
        assert!(scanner.list_unresolved().unwrap().is_empty());
    }
}
