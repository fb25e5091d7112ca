//! Background Sync Scheduler
//!
//! Runs `sync_all` for the active connection with the background token margin,
//! followed by the unsynced-invoice reminder scan, at a configurable interval.
//! A tick that starts while the previous run is still in progress is skipped.

use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::error::SyncError;
use super::models::{SyncDirection, SyncTrigger};
use super::orchestrator::SyncOrchestrator;
use super::reminders::ReminderScanner;
use crate::db::Database;
use crate::token_manager::TokenManager;

const CONFIG_KEY: &str = "scheduler_config";
const MIN_INTERVAL_MINUTES: u64 = 1;
const MAX_INTERVAL_MINUTES: u64 = 1440;

/// Scheduler configuration stored in settings table
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub interval_minutes: u64,
    pub last_run: Option<String>, // RFC 3339
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_minutes: 30,
            last_run: None,
        }
    }
}

/// What one scheduled run did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickSummary {
    pub entities_synced: usize,
    pub writes: usize,
    pub sync_error: Option<String>,
    pub reminders_created: usize,
}

/// Scheduler errors
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Scheduler is already running")]
    AlreadyRunning,

    #[error("Scheduler is not running")]
    NotRunning,

    #[error("Invalid interval: {0}")]
    InvalidInterval(String),
}

fn validate_interval(interval_minutes: u64) -> Result<(), SchedulerError> {
    if !(MIN_INTERVAL_MINUTES..=MAX_INTERVAL_MINUTES).contains(&interval_minutes) {
        return Err(SchedulerError::InvalidInterval(format!(
            "Interval must be {}-{} minutes, got {}",
            MIN_INTERVAL_MINUTES, MAX_INTERVAL_MINUTES, interval_minutes
        )));
    }
    Ok(())
}

/// Work performed on every tick
struct ScheduledJobs {
    db: Arc<Database>,
    orchestrator: Arc<SyncOrchestrator>,
    tokens: Arc<TokenManager>,
    reminders: Arc<ReminderScanner>,
    config: Arc<RwLock<SchedulerConfig>>,
    in_progress: AtomicBool,
}

impl ScheduledJobs {
    /// None when the previous run has not finished yet
    async fn run_once(&self) -> Option<TickSummary> {
        if self.in_progress.swap(true, Ordering::SeqCst) {
            log::warn!("Previous scheduled sync still running, skipping this tick");
            return None;
        }

        let summary = self.run_jobs().await;
        self.in_progress.store(false, Ordering::SeqCst);
        Some(summary)
    }

    async fn run_jobs(&self) -> TickSummary {
        let mut summary = TickSummary::default();

        match self.tokens.active_connection() {
            Ok(connection) => {
                match self
                    .orchestrator
                    .sync_all(&connection, SyncDirection::Bidirectional, SyncTrigger::Background)
                    .await
                {
                    Ok(reports) => {
                        summary.entities_synced = reports.len();
                        summary.writes = reports.iter().map(|r| r.writes()).sum();
                        log::info!(
                            "Background sync completed: entities={}, writes={}",
                            summary.entities_synced,
                            summary.writes
                        );
                    }
                    Err(e) => {
                        log::error!("Background sync failed: {}", e);
                        summary.sync_error = Some(e.to_string());
                    }
                }
            }
            Err(e) => {
                let e = SyncError::from(e);
                log::info!("Skipping scheduled sync: {}", e);
                summary.sync_error = Some(e.to_string());
            }
        }

        match self.reminders.scan_unsynced_invoices() {
            Ok(created) => summary.reminders_created = created.len(),
            Err(e) => log::error!("Reminder scan failed: {}", e),
        }

        let mut cfg = self.config.write().await;
        cfg.last_run = Some(Utc::now().to_rfc3339());
        if let Err(e) = self.db.set_setting(CONFIG_KEY, &*cfg) {
            log::error!("Failed to save last_run timestamp: {}", e);
        }

        summary
    }
}

/// Background scheduler for automatic sync operations
#[derive(Clone)]
pub struct BackgroundScheduler {
    db: Arc<Database>,
    config: Arc<RwLock<SchedulerConfig>>,
    jobs: Arc<ScheduledJobs>,
    running: Arc<AtomicBool>,
    task_handle: Arc<StdMutex<Option<JoinHandle<()>>>>,
}

impl BackgroundScheduler {
    pub fn new(
        db: Arc<Database>,
        orchestrator: Arc<SyncOrchestrator>,
        tokens: Arc<TokenManager>,
        reminders: Arc<ReminderScanner>,
        default_interval_minutes: u64,
    ) -> Self {
        let config = Arc::new(RwLock::new(SchedulerConfig {
            interval_minutes: default_interval_minutes,
            ..SchedulerConfig::default()
        }));

        Self {
            jobs: Arc::new(ScheduledJobs {
                db: db.clone(),
                orchestrator,
                tokens,
                reminders,
                config: config.clone(),
                in_progress: AtomicBool::new(false),
            }),
            db,
            config,
            running: Arc::new(AtomicBool::new(false)),
            task_handle: Arc::new(StdMutex::new(None)),
        }
    }

    /// Load configuration from database settings table
    pub async fn load_config(&self) -> Result<(), SchedulerError> {
        let stored: Option<SchedulerConfig> = self
            .db
            .get_setting(CONFIG_KEY)
            .map_err(|e| SchedulerError::Database(e.to_string()))?;

        if let Some(config) = stored {
            *self.config.write().await = config;
        }
        Ok(())
    }

    /// Save configuration to database settings table
    pub async fn save_config(&self) -> Result<(), SchedulerError> {
        let config = self.config.read().await.clone();
        self.db
            .set_setting(CONFIG_KEY, &config)
            .map_err(|e| SchedulerError::Database(e.to_string()))?;
        Ok(())
    }

    /// Start background scheduler task
    pub async fn start(&self) -> Result<(), SchedulerError> {
        let interval_minutes = self.config.read().await.interval_minutes;
        validate_interval(interval_minutes)?;

        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyRunning);
        }

        let running = self.running.clone();
        let jobs = self.jobs.clone();
        let handle = tokio::spawn(async move {
            Self::scheduler_loop(running, jobs, interval_minutes).await;
        });

        *self.task_handle.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);

        log::info!("Background scheduler started (interval: {} minutes)", interval_minutes);
        Ok(())
    }

    /// Stop background scheduler task
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(SchedulerError::NotRunning);
        }

        if let Some(handle) = self.task_handle.lock().unwrap_or_else(|p| p.into_inner()).take() {
            handle.abort();
        }

        log::info!("Background scheduler stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn get_config(&self) -> SchedulerConfig {
        self.config.read().await.clone()
    }

    /// Update configuration and restart scheduler if needed
    pub async fn update_config(&self, enabled: bool, interval_minutes: u64) -> Result<(), SchedulerError> {
        validate_interval(interval_minutes)?;

        {
            let mut config = self.config.write().await;
            config.enabled = enabled;
            config.interval_minutes = interval_minutes;
        }
        self.save_config().await?;

        match self.stop().await {
            Ok(()) | Err(SchedulerError::NotRunning) => {}
            Err(e) => return Err(e),
        }

        if enabled {
            self.start().await?;
        }

        log::info!(
            "Scheduler config updated: enabled={}, interval={} minutes",
            enabled,
            interval_minutes
        );
        Ok(())
    }

    /// Run the scheduled jobs right now, outside the timer
    pub async fn run_now(&self) -> Option<TickSummary> {
        self.jobs.run_once().await
    }

    async fn scheduler_loop(running: Arc<AtomicBool>, jobs: Arc<ScheduledJobs>, interval_minutes: u64) {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60 * interval_minutes));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        log::info!("Scheduler loop started (interval: {} minutes)", interval_minutes);

        loop {
            interval.tick().await;

            if !running.load(Ordering::SeqCst) {
                log::info!("Scheduler loop: stopping (running flag is false)");
                break;
            }

            log::info!("Background sync triggered by scheduler");
            let jobs = jobs.clone();
            // Detached so a slow run does not delay the next tick; the next tick
            // sees `in_progress` and skips.
            tokio::spawn(async move {
                jobs.run_once().await;
            });
        }

        log::info!("Scheduler loop exited");
    }
}

// ============================================================================
// Tests
// ============================================================================
