//! Sync Data Models
//!
//! Shared structures for the accounting sync engine.
//!
//! Data Categories:
//! - EntityKind / SyncDirection / SyncTrigger: what and how to sync
//! - LocalRecord / RemoteRecord: the two copies of one business record
//! - SyncReport: per-pass counters
//! - SyncConflict: divergent mapped record awaiting resolution
//! - IntegrationConnection / ConnectionStatus: connection view without secrets

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::db::StoredConnection;

/// Entity fields as JSON (the provider's wire shape minus `id`/`updated_at`)
pub type Payload = serde_json::Map<String, serde_json::Value>;

// ============================================================================
// Entity kinds
// ============================================================================

/// Syncable entity types, in dependency order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Contact,
    Invoice,
    Payment,
}

impl EntityKind {
    /// Contacts before invoices before payments
    pub const ALL: [EntityKind; 3] = [EntityKind::Contact, EntityKind::Invoice, EntityKind::Payment];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Contact => "contact",
            Self::Invoice => "invoice",
            Self::Payment => "payment",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "contact" | "contacts" => Ok(Self::Contact),
            "invoice" | "invoices" => Ok(Self::Invoice),
            "payment" | "payments" => Ok(Self::Payment),
            _ => Err(format!("Unknown entity kind: {}", s)),
        }
    }

    /// Collection path on the accounting API
    pub fn remote_path(&self) -> &'static str {
        match self {
            Self::Contact => "contacts",
            Self::Invoice => "invoices",
            Self::Payment => "payments",
        }
    }

    /// Local table holding this entity
    pub fn table(&self) -> &'static str {
        self.remote_path()
    }

    /// `sync_type` value used in the sync error log
    pub fn sync_type(&self) -> &'static str {
        match self {
            Self::Contact => "contact_sync",
            Self::Invoice => "invoice_sync",
            Self::Payment => "payment_sync",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Direction & trigger
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncDirection {
    /// Local → remote only
    Push,
    /// Remote → local only
    Pull,
    Bidirectional,
}

impl SyncDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Push => "push",
            Self::Pull => "pull",
            Self::Bidirectional => "bidirectional",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "push" => Ok(Self::Push),
            "pull" => Ok(Self::Pull),
            "bidirectional" | "both" => Ok(Self::Bidirectional),
            _ => Err(format!("Unknown sync direction: {}", s)),
        }
    }

    pub fn allows_push(&self) -> bool {
        matches!(self, Self::Push | Self::Bidirectional)
    }

    pub fn allows_pull(&self) -> bool {
        matches!(self, Self::Pull | Self::Bidirectional)
    }
}

/// Who started the sync; selects the token safety margin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncTrigger {
    Interactive,
    Background,
}

// ============================================================================
// Records
// ============================================================================

/// A local entity row in sync-neutral form
#[derive(Debug, Clone, PartialEq)]
pub struct LocalRecord {
    pub id: i64,
    pub external_id: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Human-readable label for logs (contact name, invoice number, ...)
    pub display_name: String,
    /// Entity fields; references hold local ids
    pub data: Payload,
}

impl LocalRecord {
    /// Changed locally since the last successful sync
    pub fn changed_since_sync(&self) -> bool {
        match self.last_synced_at {
            Some(synced) => self.updated_at > synced,
            None => true,
        }
    }
}

/// A record as served by the accounting API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    #[serde(rename = "id")]
    pub external_id: String,
    pub updated_at: DateTime<Utc>,
    /// Entity fields; references hold external ids
    #[serde(flatten)]
    pub data: Payload,
}

impl RemoteRecord {
    /// Changed remotely since `last_synced_at`
    pub fn changed_since(&self, last_synced_at: Option<DateTime<Utc>>) -> bool {
        match last_synced_at {
            Some(synced) => self.updated_at > synced,
            None => true,
        }
    }

    pub fn text(&self, field: &str) -> Option<&str> {
        self.data.get(field).and_then(|v| v.as_str())
    }
}

/// One page of a remote collection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemotePage {
    pub items: Vec<RemoteRecord>,
    #[serde(default)]
    pub has_more: bool,
}

/// Normalized natural key used to match unmapped records across systems
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NaturalKey {
    pub field: &'static str,
    pub value: String,
}

impl NaturalKey {
    pub fn new(field: &'static str, raw: &str) -> Option<Self> {
        let value = raw.trim().to_lowercase();
        if value.is_empty() {
            None
        } else {
            Some(Self { field, value })
        }
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.field, self.value)
    }
}

// ============================================================================
// Reports
// ============================================================================

/// Outcome counters for one entity sync pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncReport {
    pub entity_kind: EntityKind,
    pub direction: SyncDirection,
    pub remote_fetched: usize,
    pub local_scanned: usize,
    pub created_remote: usize,
    pub created_local: usize,
    pub updated_remote: usize,
    pub updated_local: usize,
    pub mappings_created: usize,
    pub unchanged: usize,
    pub conflicts_detected: usize,
    pub conflicts_resolved: usize,
    pub skipped: usize,
    pub failed: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl SyncReport {
    pub fn new(entity_kind: EntityKind, direction: SyncDirection) -> Self {
        Self {
            entity_kind,
            direction,
            remote_fetched: 0,
            local_scanned: 0,
            created_remote: 0,
            created_local: 0,
            updated_remote: 0,
            updated_local: 0,
            mappings_created: 0,
            unchanged: 0,
            conflicts_detected: 0,
            conflicts_resolved: 0,
            skipped: 0,
            failed: 0,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Number of local or remote writes performed by the pass
    pub fn writes(&self) -> usize {
        self.created_remote
            + self.created_local
            + self.updated_remote
            + self.updated_local
            + self.mappings_created
            + self.conflicts_detected
            + self.conflicts_resolved
    }
}

// ============================================================================
// Conflicts
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStatus {
    Pending,
    Resolved,
}

impl ConflictStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Resolved => "resolved",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "pending" => Ok(Self::Pending),
            "resolved" => Ok(Self::Resolved),
            _ => Err(format!("Unknown conflict status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionPolicy {
    UseLocal,
    UseRemote,
    Manual,
}

impl ResolutionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UseLocal => "use_local",
            Self::UseRemote => "use_remote",
            Self::Manual => "manual",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "use_local" | "local" => Ok(Self::UseLocal),
            "use_remote" | "remote" => Ok(Self::UseRemote),
            "manual" => Ok(Self::Manual),
            _ => Err(format!("Unknown resolution policy: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConflict {
    pub id: i64,
    pub entity_type: EntityKind,
    pub entity_id: i64,
    pub external_id: String,
    pub local_snapshot: serde_json::Value,
    pub remote_snapshot: serde_json::Value,
    pub local_updated_at: DateTime<Utc>,
    pub remote_updated_at: DateTime<Utc>,
    pub detected_at: DateTime<Utc>,
    pub status: ConflictStatus,
    pub resolution_policy: Option<ResolutionPolicy>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
}

// ============================================================================
// Connection
// ============================================================================

/// Active accounting connection as seen by sync code (no token material)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationConnection {
    pub id: i64,
    pub tenant_id: String,
    pub expires_at: DateTime<Utc>,
    pub connected_at: DateTime<Utc>,
    pub last_sync_at: Option<DateTime<Utc>>,
}

impl From<&StoredConnection> for IntegrationConnection {
    fn from(row: &StoredConnection) -> Self {
        Self {
            id: row.id,
            tenant_id: row.tenant_id.clone(),
            expires_at: row.expires_at,
            connected_at: row.connected_at,
            last_sync_at: row.last_sync_at,
        }
    }
}

/// Token lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Refreshing,
}

/// Connection health as reported to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub token_expired: bool,
    pub state: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_kind_round_trip() {
        for kind in EntityKind::ALL {
            assert_eq!(EntityKind::from_str(kind.as_str()).unwrap(), kind);
        }
        assert!(EntityKind::from_str("quotation").is_err());
    }

    #[test]
    fn test_direction_flags() {
        assert!(SyncDirection::Push.allows_push());
        assert!(!SyncDirection::Push.allows_pull());
        assert!(SyncDirection::Bidirectional.allows_push());
        assert!(SyncDirection::Bidirectional.allows_pull());
    }

    #[test]
    fn test_remote_record_wire_shape() {
        let json = r#"{"id":"c-1","updated_at":"2026-01-05T10:00:00Z","name":"Acme","email":"a@acme.sg"}"#;
        let record: RemoteRecord = serde_json::from_str(json).unwrap();

        assert_eq!(record.external_id, "c-1");
        assert_eq!(record.text("name"), Some("Acme"));
        assert!(!record.data.contains_key("id"));

        let page: RemotePage = serde_json::from_str(r#"{"items":[]}"#).unwrap();
        assert!(!page.has_more);
    }

    #[test]
    fn test_natural_key_normalization() {
        let key = NaturalKey::new("email", "  Billing@Acme.SG ").unwrap();
        assert_eq!(key.value, "billing@acme.sg");
        assert!(NaturalKey::new("email", "   ").is_none());
    }

    #[test]
    fn test_resolution_policy_serde() {
        let json = serde_json::to_string(&ResolutionPolicy::UseLocal).unwrap();
        assert_eq!(json, "\"use_local\"");
        assert_eq!(ResolutionPolicy::from_str("use_remote").unwrap(), ResolutionPolicy::UseRemote);
    }
}
