//! # Ledger Bridge
//!
//! Accounting-system synchronization engine: keeps the local contacts,
//! invoices and payments consistent with an external accounting provider
//! behind OAuth2.

pub mod config;
pub mod crypto;
pub mod db;
pub mod monitor;
pub mod oauth;
pub mod sync;
pub mod token_manager;

#[cfg(test)]
pub(crate) mod test_support;

use std::sync::Arc;

use config::{ConfigError, EngineConfig};
use crypto::{CryptoError, TokenCipher};
use db::{Database, DbError};
use monitor::{HttpStatusSource, LocalStatusSource, StatusSource};
use oauth::{OAuthClient, OAuthError, TokenProvider};
use sync::{
    AccountingApi, ApiError, ApiGateway, BackgroundScheduler, ConflictError, ConflictResolver,
    ConnectionStatus, DuplicateContactDetector, DuplicateError, DuplicateGroup, EntityKind,
    HttpAccountingApi, LogError, Reminder, ReminderError, ReminderScanner, ResolutionPolicy,
    SchedulerError, SyncAttemptLog, SyncConflict, SyncDirection, SyncError, SyncErrorLog,
    SyncLogFilter, SyncLogGroup, SyncOrchestrator, SyncReport, SyncTrigger,
};
use token_manager::{AuthorizationUrl, TokenError, TokenManager};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Database(#[from] DbError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    OAuth(#[from] OAuthError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Conflict(#[from] ConflictError),
    #[error(transparent)]
    Log(#[from] LogError),
    #[error(transparent)]
    Duplicate(#[from] DuplicateError),
    #[error(transparent)]
    Reminder(#[from] ReminderError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error("Failed to build status source: {0}")]
    StatusSource(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// Facade
// ============================================================================

/// Operations exposed to the surrounding application
pub struct LedgerBridge {
    db: Arc<Database>,
    tokens: Arc<TokenManager>,
    orchestrator: Arc<SyncOrchestrator>,
    conflicts: Arc<ConflictResolver>,
    error_log: Arc<SyncErrorLog>,
    duplicates: DuplicateContactDetector,
    reminders: Arc<ReminderScanner>,
    scheduler: BackgroundScheduler,
    status_url: Option<String>,
    request_timeout: std::time::Duration,
}

impl LedgerBridge {
    /// Open the database and wire the HTTP-backed provider and API client
    pub fn open(config: &EngineConfig) -> Result<Self, BridgeError> {
        let db = Arc::new(Database::new(config.database_path.clone())?);
        let cipher = Arc::new(TokenCipher::for_database(&db, &config.token_secret)?);
        let provider: Arc<dyn TokenProvider> = Arc::new(OAuthClient::new(config.oauth.clone())?);
        let api: Arc<dyn AccountingApi> = Arc::new(HttpAccountingApi::new(
            config.api_base_url.clone(),
            config.tenant_header.clone(),
            config.sync.request_timeout,
        )?);

        Ok(Self::from_parts(db, cipher, provider, api, config))
    }

    /// Wire the engine over explicit backends
    pub fn from_parts(
        db: Arc<Database>,
        cipher: Arc<TokenCipher>,
        provider: Arc<dyn TokenProvider>,
        api: Arc<dyn AccountingApi>,
        config: &EngineConfig,
    ) -> Self {
        let tokens = Arc::new(TokenManager::new(db.clone(), cipher, provider, config.refresh_retry));
        let gateway = Arc::new(ApiGateway::new(api, tokens.clone(), config.sync.clone()));
        let error_log = Arc::new(SyncErrorLog::with_retry_window(db.clone(), config.error_retry_window));
        let conflicts = Arc::new(ConflictResolver::new(db.clone(), gateway.clone()));
        let orchestrator = Arc::new(SyncOrchestrator::new(
            db.clone(),
            gateway,
            error_log.clone(),
            conflicts.clone(),
        ));
        let reminders = Arc::new(ReminderScanner::new(db.clone(), config.reminder_min_age));
        let scheduler = BackgroundScheduler::new(
            db.clone(),
            orchestrator.clone(),
            tokens.clone(),
            reminders.clone(),
            u64::from(config.scheduler_interval_minutes),
        );

        Self {
            duplicates: DuplicateContactDetector::new(db.clone()),
            db,
            tokens,
            orchestrator,
            conflicts,
            error_log,
            reminders,
            scheduler,
            status_url: config.status_url.clone(),
            request_timeout: config.sync.request_timeout,
        }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn scheduler(&self) -> &BackgroundScheduler {
        &self.scheduler
    }

    /// Status endpoint when configured, otherwise the local token state
    pub fn status_source(&self) -> Result<Arc<dyn StatusSource>, BridgeError> {
        match &self.status_url {
            Some(url) => {
                let source = HttpStatusSource::new(url.clone(), self.request_timeout)
                    .map_err(|e| BridgeError::StatusSource(e.to_string()))?;
                Ok(Arc::new(source))
            }
            None => Ok(Arc::new(LocalStatusSource::new(self.tokens.clone()))),
        }
    }

    // =========================================================================
    // Connection
    // =========================================================================

    pub async fn get_connection_status(&self) -> Result<ConnectionStatus, BridgeError> {
        Ok(self.tokens.connection_status().await?)
    }

    pub async fn begin_authorization(&self) -> Result<AuthorizationUrl, BridgeError> {
        Ok(self.tokens.begin_authorization().await?)
    }

    pub async fn complete_authorization(&self, code: &str, state: &str) -> Result<ConnectionStatus, BridgeError> {
        self.tokens.complete_authorization(code, state).await?;
        self.get_connection_status().await
    }

    /// Returns false when nothing was connected
    pub fn disconnect(&self) -> Result<bool, BridgeError> {
        Ok(self.tokens.disconnect()?)
    }

    // =========================================================================
    // Sync
    // =========================================================================

    pub async fn sync_entities(
        &self,
        kind: EntityKind,
        direction: SyncDirection,
    ) -> Result<SyncReport, BridgeError> {
        let connection = self.tokens.active_connection()?;
        Ok(self
            .orchestrator
            .sync_entities(&connection, kind, direction, SyncTrigger::Interactive)
            .await?)
    }

    pub async fn sync_all(&self, direction: SyncDirection) -> Result<Vec<SyncReport>, BridgeError> {
        let connection = self.tokens.active_connection()?;
        Ok(self
            .orchestrator
            .sync_all(&connection, direction, SyncTrigger::Interactive)
            .await?)
    }

    // =========================================================================
    // Conflicts
    // =========================================================================

    pub fn list_unresolved_conflicts(&self) -> Result<Vec<SyncConflict>, BridgeError> {
        Ok(self.conflicts.list_unresolved()?)
    }

    pub async fn resolve_conflict(
        &self,
        id: i64,
        policy: ResolutionPolicy,
        resolved_by: &str,
    ) -> Result<SyncConflict, BridgeError> {
        let connection = self.tokens.active_connection()?;
        Ok(self
            .conflicts
            .resolve(&connection, id, policy, resolved_by, SyncTrigger::Interactive)
            .await?)
    }

    // =========================================================================
    // Duplicates / error log / reminders
    // =========================================================================

    pub fn scan_duplicates(&self, threshold: f64) -> Result<Vec<DuplicateGroup>, BridgeError> {
        Ok(self.duplicates.scan(threshold)?)
    }

    pub fn list_sync_errors(&self, filter: &SyncLogFilter) -> Result<Vec<SyncAttemptLog>, BridgeError> {
        Ok(self.error_log.query(filter)?)
    }

    pub fn summarize_sync_errors(&self, filter: &SyncLogFilter) -> Result<Vec<SyncLogGroup>, BridgeError> {
        Ok(self.error_log.summarize(filter)?)
    }

    /// Returns false when the entry was already resolved
    pub fn resolve_sync_error(
        &self,
        id: i64,
        resolved_by: &str,
        notes: Option<&str>,
    ) -> Result<bool, BridgeError> {
        Ok(self.error_log.resolve(id, resolved_by, notes)?)
    }

    /// Raise reminders for stale unsynced invoices, then list every open reminder
    pub fn scan_reminders(&self) -> Result<Vec<Reminder>, BridgeError> {
        self.reminders.scan_unsynced_invoices()?;
        Ok(self.reminders.list_unresolved()?)
    }
}
