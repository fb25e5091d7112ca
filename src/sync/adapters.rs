//! Entity adapters
//!
//! One adapter per [`EntityKind`] translating between local rows and the
//! provider's wire payload. All methods take a `rusqlite::Connection` so the
//! caller decides the transaction boundary. Writes to existing rows are
//! guarded on the `updated_at` value read at planning time.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use super::error::SyncError;
use super::models::{EntityKind, LocalRecord, NaturalKey, Payload, RemoteRecord};
use crate::db::{to_db_timestamp, Contact, DbError, Invoice, Payment};

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Invalid record: {0}")]
    Validation(String),

    #[error("External id {external_id} is already mapped to another {kind}")]
    DuplicateMapping { kind: EntityKind, external_id: String },

    #[error("{kind} {id} changed locally during sync")]
    StaleRecord { kind: EntityKind, id: i64 },

    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: i64 },
}

impl From<rusqlite::Error> for AdapterError {
    fn from(err: rusqlite::Error) -> Self {
        AdapterError::Database(DbError::from(err))
    }
}

impl From<AdapterError> for SyncError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::Database(e) => SyncError::Database(e.to_string()),
            AdapterError::Validation(msg) => SyncError::ValidationError(msg),
            e @ AdapterError::DuplicateMapping { .. } => {
                SyncError::DuplicateEntityDetected(e.to_string())
            }
            e @ AdapterError::StaleRecord { .. } => SyncError::ConflictDetected(e.to_string()),
            e @ AdapterError::NotFound { .. } => SyncError::ValidationError(e.to_string()),
        }
    }
}

/// Which local row a remote record is written to
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LocalTarget {
    New,
    Existing {
        id: i64,
        expected_updated_at: DateTime<Utc>,
    },
}

pub trait EntityAdapter: Send + Sync {
    fn kind(&self) -> EntityKind;

    /// Keyset page of local rows with `id > after_id`, ascending
    fn fetch_local(
        &self,
        conn: &Connection,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<LocalRecord>, AdapterError>;

    fn load_local(&self, conn: &Connection, id: i64) -> Result<Option<LocalRecord>, AdapterError>;

    /// Wire payload for `record`; local references become external ids
    fn to_remote_payload(
        &self,
        conn: &Connection,
        record: &LocalRecord,
    ) -> Result<Payload, AdapterError>;

    /// Matching keys, strongest first
    fn natural_keys(&self, data: &Payload) -> Vec<NaturalKey>;

    /// Write `remote` into a new or existing local row, mapping it and
    /// stamping `last_synced_at`. Returns the local id.
    fn apply_remote_update(
        &self,
        conn: &Connection,
        target: LocalTarget,
        remote: &RemoteRecord,
        synced_at: DateTime<Utc>,
    ) -> Result<i64, AdapterError>;

    /// Attach an external id to an unmapped local row
    fn map_to_external_id(
        &self,
        conn: &Connection,
        local_id: i64,
        expected_updated_at: DateTime<Utc>,
        external_id: &str,
        synced_at: DateTime<Utc>,
    ) -> Result<(), AdapterError> {
        let table = self.kind().table();
        let result = conn.execute(
            &format!(
                "UPDATE {} SET external_id = ?1, last_synced_at = ?2 WHERE id = ?3 AND updated_at = ?4",
                table
            ),
            params![
                external_id,
                to_db_timestamp(&synced_at),
                local_id,
                to_db_timestamp(&expected_updated_at)
            ],
        );

        match result {
            Ok(affected) => check_guarded(conn, self.kind(), local_id, affected),
            Err(e) => Err(unique_violation_to_duplicate(e, self.kind(), external_id)),
        }
    }

    /// Record that local and remote agree as of `synced_at`
    fn mark_synced(
        &self,
        conn: &Connection,
        local_id: i64,
        expected_updated_at: DateTime<Utc>,
        synced_at: DateTime<Utc>,
    ) -> Result<(), AdapterError> {
        let affected = conn.execute(
            &format!(
                "UPDATE {} SET last_synced_at = ?1 WHERE id = ?2 AND updated_at = ?3",
                self.kind().table()
            ),
            params![
                to_db_timestamp(&synced_at),
                local_id,
                to_db_timestamp(&expected_updated_at)
            ],
        )?;
        check_guarded(conn, self.kind(), local_id, affected)
    }
}

static CONTACTS: ContactAdapter = ContactAdapter;
static INVOICES: InvoiceAdapter = InvoiceAdapter;
static PAYMENTS: PaymentAdapter = PaymentAdapter;

/// Adapter implementation for an entity kind
pub fn adapter_for(kind: EntityKind) -> &'static dyn EntityAdapter {
    match kind {
        EntityKind::Contact => &CONTACTS,
        EntityKind::Invoice => &INVOICES,
        EntityKind::Payment => &PAYMENTS,
    }
}

// ============================================================================
// Contacts
// ============================================================================

pub struct ContactAdapter;

impl ContactAdapter {
    fn to_record(contact: Contact) -> LocalRecord {
        let data = payload([
            ("name", Value::from(contact.name.clone())),
            ("email", opt_str(contact.email)),
            ("phone", opt_str(contact.phone)),
            ("registration_number", opt_str(contact.registration_number)),
        ]);

        LocalRecord {
            id: contact.id,
            external_id: contact.external_id,
            updated_at: contact.updated_at,
            last_synced_at: contact.last_synced_at,
            created_at: contact.created_at,
            display_name: contact.name,
            data,
        }
    }
}

impl EntityAdapter for ContactAdapter {
    fn kind(&self) -> EntityKind {
        EntityKind::Contact
    }

    fn fetch_local(
        &self,
        conn: &Connection,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<LocalRecord>, AdapterError> {
        let sql = format!(
            "SELECT {} FROM contacts WHERE id > ?1 ORDER BY id ASC LIMIT ?2",
            Contact::COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![after_id, limit as i64], Contact::from_row)?;
        rows.map(|r| r.map(Self::to_record).map_err(AdapterError::from))
            .collect()
    }

    fn load_local(&self, conn: &Connection, id: i64) -> Result<Option<LocalRecord>, AdapterError> {
        let sql = format!("SELECT {} FROM contacts WHERE id = ?1", Contact::COLUMNS);
        Ok(conn
            .query_row(&sql, [id], Contact::from_row)
            .optional()?
            .map(Self::to_record))
    }

    fn to_remote_payload(
        &self,
        _conn: &Connection,
        record: &LocalRecord,
    ) -> Result<Payload, AdapterError> {
        required_str(&record.data, "name")?;
        Ok(record.data.clone())
    }

    fn natural_keys(&self, data: &Payload) -> Vec<NaturalKey> {
        ["registration_number", "email", "name"]
            .into_iter()
            .filter_map(|field| data.get(field).and_then(Value::as_str).and_then(|v| NaturalKey::new(field, v)))
            .collect()
    }

    fn apply_remote_update(
        &self,
        conn: &Connection,
        target: LocalTarget,
        remote: &RemoteRecord,
        synced_at: DateTime<Utc>,
    ) -> Result<i64, AdapterError> {
        let name = required_str(&remote.data, "name")?;
        let email = optional_str(&remote.data, "email");
        let phone = optional_str(&remote.data, "phone");
        let registration_number = optional_str(&remote.data, "registration_number");
        let synced = to_db_timestamp(&synced_at);

        match target {
            LocalTarget::New => {
                conn.execute(
                    r#"
                    INSERT INTO contacts (
                        name, email, phone, registration_number, external_id,
                        last_synced_at, created_at, updated_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?6)
                    "#,
                    params![
                        name,
                        email,
                        phone,
                        registration_number,
                        remote.external_id,
                        synced,
                        to_db_timestamp(&Utc::now())
                    ],
                )
                .map_err(|e| unique_violation_to_duplicate(e, self.kind(), &remote.external_id))?;
                Ok(conn.last_insert_rowid())
            }
            LocalTarget::Existing {
                id,
                expected_updated_at,
            } => {
                let affected = conn
                    .execute(
                        r#"
                        UPDATE contacts
                        SET name = ?1, email = ?2, phone = ?3, registration_number = ?4,
                            external_id = ?5, last_synced_at = ?6, updated_at = ?6
                        WHERE id = ?7 AND updated_at = ?8
                        "#,
                        params![
                            name,
                            email,
                            phone,
                            registration_number,
                            remote.external_id,
                            synced,
                            id,
                            to_db_timestamp(&expected_updated_at)
                        ],
                    )
                    .map_err(|e| unique_violation_to_duplicate(e, self.kind(), &remote.external_id))?;
                check_guarded(conn, self.kind(), id, affected)?;
                Ok(id)
            }
        }
    }
}

// ============================================================================
// Invoices
// ============================================================================

pub struct InvoiceAdapter;

impl InvoiceAdapter {
    fn to_record(invoice: Invoice) -> LocalRecord {
        let data = payload([
            ("invoice_number", Value::from(invoice.invoice_number.clone())),
            ("contact_id", Value::from(invoice.contact_id)),
            ("issue_date", opt_str(invoice.issue_date)),
            ("due_date", opt_str(invoice.due_date)),
            ("currency", Value::from(invoice.currency)),
            ("total_cents", Value::from(invoice.total_cents)),
            ("status", Value::from(invoice.status)),
        ]);

        LocalRecord {
            id: invoice.id,
            external_id: invoice.external_id,
            updated_at: invoice.updated_at,
            last_synced_at: invoice.last_synced_at,
            created_at: invoice.created_at,
            display_name: invoice.invoice_number,
            data,
        }
    }
}

impl EntityAdapter for InvoiceAdapter {
    fn kind(&self) -> EntityKind {
        EntityKind::Invoice
    }

    fn fetch_local(
        &self,
        conn: &Connection,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<LocalRecord>, AdapterError> {
        let sql = format!(
            "SELECT {} FROM invoices WHERE id > ?1 ORDER BY id ASC LIMIT ?2",
            Invoice::COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![after_id, limit as i64], Invoice::from_row)?;
        rows.map(|r| r.map(Self::to_record).map_err(AdapterError::from))
            .collect()
    }

    fn load_local(&self, conn: &Connection, id: i64) -> Result<Option<LocalRecord>, AdapterError> {
        let sql = format!("SELECT {} FROM invoices WHERE id = ?1", Invoice::COLUMNS);
        Ok(conn
            .query_row(&sql, [id], Invoice::from_row)
            .optional()?
            .map(Self::to_record))
    }

    fn to_remote_payload(
        &self,
        conn: &Connection,
        record: &LocalRecord,
    ) -> Result<Payload, AdapterError> {
        let contact_id = required_i64(&record.data, "contact_id")?;
        let contact_external = external_id_of(conn, EntityKind::Contact, contact_id)?
            .ok_or_else(|| {
                AdapterError::Validation(format!(
                    "invoice {} references contact {} which is not synced yet",
                    record.display_name, contact_id
                ))
            })?;

        let mut data = record.data.clone();
        data.insert("contact_id".to_string(), Value::from(contact_external));
        Ok(data)
    }

    fn natural_keys(&self, data: &Payload) -> Vec<NaturalKey> {
        data.get("invoice_number")
            .and_then(Value::as_str)
            .and_then(|v| NaturalKey::new("invoice_number", v))
            .into_iter()
            .collect()
    }

    fn apply_remote_update(
        &self,
        conn: &Connection,
        target: LocalTarget,
        remote: &RemoteRecord,
        synced_at: DateTime<Utc>,
    ) -> Result<i64, AdapterError> {
        let invoice_number = required_str(&remote.data, "invoice_number")?;
        let contact_external = required_str(&remote.data, "contact_id")?;
        let contact_id = local_id_of(conn, EntityKind::Contact, &contact_external)?
            .ok_or_else(|| {
                AdapterError::Validation(format!(
                    "invoice {} references unknown contact {}",
                    invoice_number, contact_external
                ))
            })?;
        let issue_date = optional_str(&remote.data, "issue_date");
        let due_date = optional_str(&remote.data, "due_date");
        let currency = optional_str(&remote.data, "currency").unwrap_or_else(|| "SGD".to_string());
        let total_cents = optional_i64(&remote.data, "total_cents").unwrap_or(0);
        let status = optional_str(&remote.data, "status").unwrap_or_else(|| "draft".to_string());
        let synced = to_db_timestamp(&synced_at);

        match target {
            LocalTarget::New => {
                conn.execute(
                    r#"
                    INSERT INTO invoices (
                        invoice_number, contact_id, issue_date, due_date, currency, total_cents,
                        status, external_id, last_synced_at, created_at, updated_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?9)
                    "#,
                    params![
                        invoice_number,
                        contact_id,
                        issue_date,
                        due_date,
                        currency,
                        total_cents,
                        status,
                        remote.external_id,
                        synced,
                        to_db_timestamp(&Utc::now())
                    ],
                )
                .map_err(|e| unique_violation_to_duplicate(e, self.kind(), &remote.external_id))?;
                Ok(conn.last_insert_rowid())
            }
            LocalTarget::Existing {
                id,
                expected_updated_at,
            } => {
                let affected = conn
                    .execute(
                        r#"
                        UPDATE invoices
                        SET invoice_number = ?1, contact_id = ?2, issue_date = ?3, due_date = ?4,
                            currency = ?5, total_cents = ?6, status = ?7, external_id = ?8,
                            last_synced_at = ?9, updated_at = ?9
                        WHERE id = ?10 AND updated_at = ?11
                        "#,
                        params![
                            invoice_number,
                            contact_id,
                            issue_date,
                            due_date,
                            currency,
                            total_cents,
                            status,
                            remote.external_id,
                            synced,
                            id,
                            to_db_timestamp(&expected_updated_at)
                        ],
                    )
                    .map_err(|e| unique_violation_to_duplicate(e, self.kind(), &remote.external_id))?;
                check_guarded(conn, self.kind(), id, affected)?;
                Ok(id)
            }
        }
    }
}

// ============================================================================
// Payments
// ============================================================================

pub struct PaymentAdapter;

impl PaymentAdapter {
    fn to_record(payment: Payment) -> LocalRecord {
        let display_name = payment
            .reference
            .clone()
            .unwrap_or_else(|| format!("payment #{}", payment.id));
        let data = payload([
            ("invoice_id", Value::from(payment.invoice_id)),
            ("amount_cents", Value::from(payment.amount_cents)),
            ("paid_on", Value::from(payment.paid_on)),
            ("reference", opt_str(payment.reference)),
        ]);

        LocalRecord {
            id: payment.id,
            external_id: payment.external_id,
            updated_at: payment.updated_at,
            last_synced_at: payment.last_synced_at,
            created_at: payment.created_at,
            display_name,
            data,
        }
    }
}

impl EntityAdapter for PaymentAdapter {
    fn kind(&self) -> EntityKind {
        EntityKind::Payment
    }

    fn fetch_local(
        &self,
        conn: &Connection,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<LocalRecord>, AdapterError> {
        let sql = format!(
            "SELECT {} FROM payments WHERE id > ?1 ORDER BY id ASC LIMIT ?2",
            Payment::COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![after_id, limit as i64], Payment::from_row)?;
        rows.map(|r| r.map(Self::to_record).map_err(AdapterError::from))
            .collect()
    }

    fn load_local(&self, conn: &Connection, id: i64) -> Result<Option<LocalRecord>, AdapterError> {
        let sql = format!("SELECT {} FROM payments WHERE id = ?1", Payment::COLUMNS);
        Ok(conn
            .query_row(&sql, [id], Payment::from_row)
            .optional()?
            .map(Self::to_record))
    }

    fn to_remote_payload(
        &self,
        conn: &Connection,
        record: &LocalRecord,
    ) -> Result<Payload, AdapterError> {
        let invoice_id = required_i64(&record.data, "invoice_id")?;
        let invoice_external = external_id_of(conn, EntityKind::Invoice, invoice_id)?
            .ok_or_else(|| {
                AdapterError::Validation(format!(
                    "{} references invoice {} which is not synced yet",
                    record.display_name, invoice_id
                ))
            })?;

        let mut data = record.data.clone();
        data.insert("invoice_id".to_string(), Value::from(invoice_external));
        Ok(data)
    }

    fn natural_keys(&self, data: &Payload) -> Vec<NaturalKey> {
        data.get("reference")
            .and_then(Value::as_str)
            .and_then(|v| NaturalKey::new("reference", v))
            .into_iter()
            .collect()
    }

    fn apply_remote_update(
        &self,
        conn: &Connection,
        target: LocalTarget,
        remote: &RemoteRecord,
        synced_at: DateTime<Utc>,
    ) -> Result<i64, AdapterError> {
        let invoice_external = required_str(&remote.data, "invoice_id")?;
        let invoice_id = local_id_of(conn, EntityKind::Invoice, &invoice_external)?
            .ok_or_else(|| {
                AdapterError::Validation(format!(
                    "payment {} references unknown invoice {}",
                    remote.external_id, invoice_external
                ))
            })?;
        let amount_cents = optional_i64(&remote.data, "amount_cents").ok_or_else(|| {
            AdapterError::Validation(format!("payment {} has no amount_cents", remote.external_id))
        })?;
        let paid_on = required_str(&remote.data, "paid_on")?;
        let reference = optional_str(&remote.data, "reference");
        let synced = to_db_timestamp(&synced_at);

        match target {
            LocalTarget::New => {
                conn.execute(
                    r#"
                    INSERT INTO payments (
                        invoice_id, amount_cents, paid_on, reference, external_id,
                        last_synced_at, created_at, updated_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?6)
                    "#,
                    params![
                        invoice_id,
                        amount_cents,
                        paid_on,
                        reference,
                        remote.external_id,
                        synced,
                        to_db_timestamp(&Utc::now())
                    ],
                )
                .map_err(|e| unique_violation_to_duplicate(e, self.kind(), &remote.external_id))?;
                Ok(conn.last_insert_rowid())
            }
            LocalTarget::Existing {
                id,
                expected_updated_at,
            } => {
                let affected = conn
                    .execute(
                        r#"
                        UPDATE payments
                        SET invoice_id = ?1, amount_cents = ?2, paid_on = ?3, reference = ?4,
                            external_id = ?5, last_synced_at = ?6, updated_at = ?6
                        WHERE id = ?7 AND updated_at = ?8
                        "#,
                        params![
                            invoice_id,
                            amount_cents,
                            paid_on,
                            reference,
                            remote.external_id,
                            synced,
                            id,
                            to_db_timestamp(&expected_updated_at)
                        ],
                    )
                    .map_err(|e| unique_violation_to_duplicate(e, self.kind(), &remote.external_id))?;
                check_guarded(conn, self.kind(), id, affected)?;
                Ok(id)
            }
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn payload<const N: usize>(pairs: [(&str, Value); N]) -> Payload {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

fn opt_str(value: Option<String>) -> Value {
    value.map(Value::from).unwrap_or(Value::Null)
}

fn required_str(data: &Payload, field: &str) -> Result<String, AdapterError> {
    optional_str(data, field)
        .ok_or_else(|| AdapterError::Validation(format!("missing required field '{}'", field)))
}

fn optional_str(data: &Payload, field: &str) -> Option<String> {
    data.get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn required_i64(data: &Payload, field: &str) -> Result<i64, AdapterError> {
    optional_i64(data, field)
        .ok_or_else(|| AdapterError::Validation(format!("missing required field '{}'", field)))
}

fn optional_i64(data: &Payload, field: &str) -> Option<i64> {
    match data.get(field)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn external_id_of(
    conn: &Connection,
    kind: EntityKind,
    local_id: i64,
) -> Result<Option<String>, AdapterError> {
    let sql = format!("SELECT external_id FROM {} WHERE id = ?1", kind.table());
    let found: Option<Option<String>> = conn.query_row(&sql, [local_id], |row| row.get(0)).optional()?;
    Ok(found.flatten())
}

fn local_id_of(
    conn: &Connection,
    kind: EntityKind,
    external_id: &str,
) -> Result<Option<i64>, AdapterError> {
    let sql = format!("SELECT id FROM {} WHERE external_id = ?1", kind.table());
    Ok(conn.query_row(&sql, [external_id], |row| row.get(0)).optional()?)
}

/// Turn a zero-row guarded write into `StaleRecord` or `NotFound`
fn check_guarded(
    conn: &Connection,
    kind: EntityKind,
    id: i64,
    affected: usize,
) -> Result<(), AdapterError> {
    if affected == 1 {
        return Ok(());
    }

    let exists: bool = conn.query_row(
        &format!("SELECT COUNT(*) > 0 FROM {} WHERE id = ?1", kind.table()),
        [id],
        |row| row.get(0),
    )?;

    if exists {
        Err(AdapterError::StaleRecord { kind, id })
    } else {
        Err(AdapterError::NotFound { kind, id })
    }
}

fn unique_violation_to_duplicate(
    err: rusqlite::Error,
    kind: EntityKind,
    external_id: &str,
) -> AdapterError {
    let db_err = DbError::from(err);
    if db_err.is_constraint_violation() {
        AdapterError::DuplicateMapping {
            kind,
            external_id: external_id.to_string(),
        }
    } else {
        AdapterError::Database(db_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Database, NewContact, NewInvoice};
    use chrono::Duration;

    fn remote(id: &str, fields: serde_json::Value) -> RemoteRecord {
        RemoteRecord {
            external_id: id.to_string(),
            updated_at: Utc::now(),
            data: fields.as_object().cloned().unwrap_or_default(),
        }
    }

    fn contact(db: &Database, name: &str, email: Option<&str>) -> i64 {
        db.insert_contact(&NewContact {
            name: name.to_string(),
            email: email.map(str::to_string),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_fetch_local_keyset_pages() {
        let db = Database::in_memory().unwrap();
        for i in 0..5 {
            contact(&db, &format!("Contact {}", i), None);
        }
        let conn = db.get_conn().unwrap();
        let adapter = adapter_for(EntityKind::Contact);

        let first = adapter.fetch_local(&conn, 0, 2).unwrap();
        assert_eq!(first.len(), 2);
        let second = adapter.fetch_local(&conn, first[1].id, 2).unwrap();
        assert_eq!(second.len(), 2);
        assert!(second[0].id > first[1].id);
        let last = adapter.fetch_local(&conn, second[1].id, 2).unwrap();
        assert_eq!(last.len(), 1);
    }

    #[test]
    fn test_contact_natural_keys_strongest_first() {
        let db = Database::in_memory().unwrap();
        let id = db
            .insert_contact(&NewContact {
                name: "Acme Pte Ltd".into(),
                email: Some("Billing@Acme.sg".into()),
                registration_number: Some("201912345K".into()),
                ..Default::default()
            })
            .unwrap();
        let conn = db.get_conn().unwrap();
        let record = adapter_for(EntityKind::Contact).load_local(&conn, id).unwrap().unwrap();

        let keys = adapter_for(EntityKind::Contact).natural_keys(&record.data);
        let fields: Vec<_> = keys.iter().map(|k| k.field).collect();
        assert_eq!(fields, vec!["registration_number", "email", "name"]);
        assert_eq!(keys[1].value, "billing@acme.sg");
    }

    #[test]
    fn test_invoice_payload_requires_synced_contact() {
        let db = Database::in_memory().unwrap();
        let contact_id = contact(&db, "Acme", None);
        let invoice_id = db
            .insert_invoice(&NewInvoice {
                invoice_number: "INV-001".into(),
                contact_id,
                issue_date: Some("2026-01-05".into()),
                due_date: None,
                currency: "SGD".into(),
                total_cents: 125_00,
                status: "draft".into(),
            })
            .unwrap();

        let conn = db.get_conn().unwrap();
        let adapter = adapter_for(EntityKind::Invoice);
        let record = adapter.load_local(&conn, invoice_id).unwrap().unwrap();

        let err = adapter.to_remote_payload(&conn, &record).unwrap_err();
        assert!(matches!(err, AdapterError::Validation(_)));

        conn.execute("UPDATE contacts SET external_id = 'ext-c' WHERE id = ?1", [contact_id])
            .unwrap();
        let payload = adapter.to_remote_payload(&conn, &record).unwrap();
        assert_eq!(payload["contact_id"], "ext-c");
        assert_eq!(payload["total_cents"], 12500);
    }

    #[test]
    fn test_apply_remote_insert_and_guarded_update() {
        let db = Database::in_memory().unwrap();
        let conn = db.get_conn().unwrap();
        let adapter = adapter_for(EntityKind::Contact);
        let synced_at = Utc::now();

        let id = adapter
            .apply_remote_update(
                &conn,
                LocalTarget::New,
                &remote("c-1", serde_json::json!({"name": "Acme", "email": "a@acme.sg"})),
                synced_at,
            )
            .unwrap();

        let record = adapter.load_local(&conn, id).unwrap().unwrap();
        assert_eq!(record.external_id.as_deref(), Some("c-1"));
        assert_eq!(record.last_synced_at, Some(synced_at));
        assert!(!record.changed_since_sync());

        // Guard uses a stale updated_at
        let err = adapter
            .apply_remote_update(
                &conn,
                LocalTarget::Existing {
                    id,
                    expected_updated_at: record.updated_at - Duration::seconds(1),
                },
                &remote("c-1", serde_json::json!({"name": "Acme Renamed"})),
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, AdapterError::StaleRecord { .. }));

        adapter
            .apply_remote_update(
                &conn,
                LocalTarget::Existing {
                    id,
                    expected_updated_at: record.updated_at,
                },
                &remote("c-1", serde_json::json!({"name": "Acme Renamed"})),
                Utc::now(),
            )
            .unwrap();
        let updated = adapter.load_local(&conn, id).unwrap().unwrap();
        assert_eq!(updated.display_name, "Acme Renamed");
    }

    #[test]
    fn test_remote_without_name_is_invalid() {
        let db = Database::in_memory().unwrap();
        let conn = db.get_conn().unwrap();

        let err = adapter_for(EntityKind::Contact)
            .apply_remote_update(&conn, LocalTarget::New, &remote("c-9", serde_json::json!({})), Utc::now())
            .unwrap_err();
        assert!(matches!(err, AdapterError::Validation(_)));
    }

    #[test]
    fn test_map_to_taken_external_id_is_duplicate() {
        let db = Database::in_memory().unwrap();
        let a = contact(&db, "A", None);
        let b = contact(&db, "B", None);
        let conn = db.get_conn().unwrap();
        let adapter = adapter_for(EntityKind::Contact);

        let rec_a = adapter.load_local(&conn, a).unwrap().unwrap();
        let rec_b = adapter.load_local(&conn, b).unwrap().unwrap();

        adapter
            .map_to_external_id(&conn, a, rec_a.updated_at, "ext-1", Utc::now())
            .unwrap();
        let err = adapter
            .map_to_external_id(&conn, b, rec_b.updated_at, "ext-1", Utc::now())
            .unwrap_err();

        assert!(matches!(err, AdapterError::DuplicateMapping { .. }));
        assert!(matches!(
            SyncError::from(err),
            SyncError::DuplicateEntityDetected(_)
        ));
    }

    #[test]
    fn test_mark_synced_missing_row() {
        let db = Database::in_memory().unwrap();
        let conn = db.get_conn().unwrap();
        let err = adapter_for(EntityKind::Payment)
            .mark_synced(&conn, 42, Utc::now(), Utc::now())
            .unwrap_err();
        assert!(matches!(err, AdapterError::NotFound { .. }));
    }
}
