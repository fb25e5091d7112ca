//! Sync Module - Accounting System Synchronization
//!
//! Keeps local contacts, invoices and payments consistent with the external
//! accounting provider:
//! - Entity adapters (one per kind, uniform capability interface)
//! - API gateway (token per request, whole-batch 429 pause, retries)
//! - Orchestrator (plan + bounded worker pool, per-record failure isolation)
//! - Conflict detection/resolution (use_local, use_remote, manual)
//! - Duplicate contact detection (advisory)
//! - Error log (durable attempt ledger with retry bookkeeping)
//! - Reminders and background scheduler

pub mod adapters;
pub mod api;
pub mod conflict;
pub mod duplicates;
pub mod error;
pub mod error_log;
pub mod gateway;
pub mod models;
pub mod orchestrator;
pub mod reminders;
pub mod scheduler;


// Re-export commonly used types
pub use adapters::{adapter_for, AdapterError, EntityAdapter, LocalTarget};
pub use api::{AccountingApi, ApiError, HttpAccountingApi};
pub use conflict::{classify_change, ChangeClass, ConflictError, ConflictResolver};
pub use duplicates::{
    DuplicateContactDetector, DuplicateError, DuplicateGroup, MatchReason, DEFAULT_DUPLICATE_THRESHOLD,
};
pub use error::SyncError;
pub use error_log::{
    AttemptStatus, LogError, NewSyncAttempt, SyncAttemptLog, SyncErrorLog, SyncLogFilter, SyncLogGroup,
};
pub use gateway::ApiGateway;
pub use models::{
    ConflictStatus, ConnectionState, ConnectionStatus, EntityKind, IntegrationConnection,
    LocalRecord, RemoteRecord, ResolutionPolicy, SyncConflict, SyncDirection, SyncReport,
    SyncTrigger,
};
pub use orchestrator::{plan_actions, PlannedAction, SyncOrchestrator};
pub use reminders::{Reminder, ReminderError, ReminderScanner};
pub use scheduler::{BackgroundScheduler, SchedulerConfig, SchedulerError, TickSummary};
