//! Engine configuration
//!
//! Loaded from the environment (a `.env` file is honoured via `dotenvy`).
//! Every `LEDGER_*` variable has a default except the OAuth client id and the
//! token encryption secret.

use chrono::Duration as ChronoDuration;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::oauth::OAuthConfig;
use crate::sync::models::{ResolutionPolicy, SyncTrigger};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required setting {0}")]
    Missing(&'static str),
    #[error("Invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
    #[error("Cannot determine data directory")]
    NoDataDir,
}

/// Exponential backoff with a cap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Sync pass tuning
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Worker pool size for per-record actions (1-16)
    pub concurrency: usize,
    pub page_size: usize,
    /// Upper bound for one external call
    pub request_timeout: Duration,
    /// Upper bound for a whole `sync_entities` run
    pub job_timeout: Duration,
    pub interactive_margin: ChronoDuration,
    pub background_margin: ChronoDuration,
    /// Times one request may wait out a 429 before the record fails
    pub rate_limit_retries: u32,
    pub transient_retry: RetryPolicy,
    pub default_conflict_policy: ResolutionPolicy,
}

impl SyncSettings {
    pub fn margin_for(&self, trigger: SyncTrigger) -> ChronoDuration {
        match trigger {
            SyncTrigger::Interactive => self.interactive_margin,
            SyncTrigger::Background => self.background_margin,
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            page_size: 100,
            request_timeout: Duration::from_secs(30),
            job_timeout: Duration::from_secs(15 * 60),
            interactive_margin: ChronoDuration::minutes(20),
            background_margin: ChronoDuration::minutes(5),
            rate_limit_retries: 5,
            transient_retry: RetryPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(10),
            },
            default_conflict_policy: ResolutionPolicy::Manual,
        }
    }
}

#[derive(Clone)]
pub struct EngineConfig {
    pub database_path: PathBuf,
    pub oauth: OAuthConfig,
    pub api_base_url: String,
    pub tenant_header: String,
    /// Health endpoint polled by the status monitor
    pub status_url: Option<String>,
    pub token_secret: String,
    pub sync: SyncSettings,
    pub refresh_retry: RetryPolicy,
    /// Window in which a repeated failure updates the existing error log row
    pub error_retry_window: ChronoDuration,
    /// Age after which an unmapped invoice gets an "unsynced" reminder
    pub reminder_min_age: ChronoDuration,
    pub scheduler_interval_minutes: u32,
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfig")
            .field("database_path", &self.database_path)
            .field("oauth", &self.oauth)
            .field("api_base_url", &self.api_base_url)
            .field("tenant_header", &self.tenant_header)
            .field("status_url", &self.status_url)
            .field("token_secret", &"[REDACTED]")
            .field("sync", &self.sync)
            .field("refresh_retry", &self.refresh_retry)
            .field("error_retry_window", &self.error_retry_window)
            .field("reminder_min_age", &self.reminder_min_age)
            .field("scheduler_interval_minutes", &self.scheduler_interval_minutes)
            .finish()
    }
}

impl EngineConfig {
    /// Load `.env` (if present) and build the config from `LEDGER_*` variables
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                log::warn!("Failed to load .env file: {}", e);
            }
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let database_path = match get("LEDGER_DATABASE_PATH") {
            Some(path) => PathBuf::from(path),
            None => default_database_path()?,
        };

        let oauth = OAuthConfig {
            client_id: get("LEDGER_OAUTH_CLIENT_ID").ok_or(ConfigError::Missing("LEDGER_OAUTH_CLIENT_ID"))?,
            client_secret: get("LEDGER_OAUTH_CLIENT_SECRET"),
            auth_url: get("LEDGER_OAUTH_AUTH_URL")
                .unwrap_or_else(|| "https://login.xero.com/identity/connect/authorize".to_string()),
            token_url: get("LEDGER_OAUTH_TOKEN_URL")
                .unwrap_or_else(|| "https://identity.xero.com/connect/token".to_string()),
            redirect_uri: get("LEDGER_OAUTH_REDIRECT_URI")
                .unwrap_or_else(|| "http://localhost:8765/callback".to_string()),
            scopes: get("LEDGER_OAUTH_SCOPES")
                .map(|s| s.split_whitespace().map(str::to_string).collect())
                .unwrap_or_else(|| {
                    vec![
                        "offline_access".to_string(),
                        "accounting.contacts".to_string(),
                        "accounting.transactions".to_string(),
                    ]
                }),
            connections_url: get("LEDGER_OAUTH_CONNECTIONS_URL")
                .unwrap_or_else(|| "https://api.xero.com/connections".to_string()),
        };

        let token_secret = get("LEDGER_TOKEN_SECRET").ok_or(ConfigError::Missing("LEDGER_TOKEN_SECRET"))?;

        let defaults = SyncSettings::default();

        let concurrency = parse_or(&get, "LEDGER_SYNC_CONCURRENCY", defaults.concurrency)?;
        if !(1..=16).contains(&concurrency) {
            return Err(ConfigError::Invalid {
                key: "LEDGER_SYNC_CONCURRENCY",
                message: format!("must be between 1 and 16, got {}", concurrency),
            });
        }

        let page_size = parse_or(&get, "LEDGER_SYNC_PAGE_SIZE", defaults.page_size)?;
        if page_size == 0 || page_size > crate::db::MAX_PAGE_SIZE {
            return Err(ConfigError::Invalid {
                key: "LEDGER_SYNC_PAGE_SIZE",
                message: format!("must be between 1 and {}", crate::db::MAX_PAGE_SIZE),
            });
        }

        let request_timeout = Duration::from_secs(parse_or(&get, "LEDGER_REQUEST_TIMEOUT_SECS", 30u64)?);
        let job_timeout = Duration::from_secs(parse_or(&get, "LEDGER_JOB_TIMEOUT_SECS", 15 * 60u64)?);
        if request_timeout.is_zero() || job_timeout <= request_timeout {
            return Err(ConfigError::Invalid {
                key: "LEDGER_JOB_TIMEOUT_SECS",
                message: "job timeout must exceed the request timeout".to_string(),
            });
        }

        let default_conflict_policy = match get("LEDGER_DEFAULT_CONFLICT_POLICY") {
            Some(value) => ResolutionPolicy::from_str(&value).map_err(|message| ConfigError::Invalid {
                key: "LEDGER_DEFAULT_CONFLICT_POLICY",
                message,
            })?,
            None => defaults.default_conflict_policy,
        };

        let sync = SyncSettings {
            concurrency,
            page_size,
            request_timeout,
            job_timeout,
            interactive_margin: ChronoDuration::minutes(parse_or(&get, "LEDGER_INTERACTIVE_MARGIN_MINUTES", 20i64)?),
            background_margin: ChronoDuration::minutes(parse_or(&get, "LEDGER_BACKGROUND_MARGIN_MINUTES", 5i64)?),
            rate_limit_retries: parse_or(&get, "LEDGER_RATE_LIMIT_RETRIES", defaults.rate_limit_retries)?,
            transient_retry: RetryPolicy {
                max_retries: parse_or(&get, "LEDGER_TRANSIENT_RETRIES", defaults.transient_retry.max_retries)?,
                ..defaults.transient_retry
            },
            default_conflict_policy,
        };

        let scheduler_interval_minutes = parse_or(&get, "LEDGER_SCHEDULER_INTERVAL_MINUTES", 30u32)?;
        if !(1..=1440).contains(&scheduler_interval_minutes) {
            return Err(ConfigError::Invalid {
                key: "LEDGER_SCHEDULER_INTERVAL_MINUTES",
                message: "must be between 1 and 1440".to_string(),
            });
        }

        Ok(Self {
            database_path,
            oauth,
            api_base_url: get("LEDGER_API_BASE_URL")
                .unwrap_or_else(|| "https://api.xero.com/api.xro/2.0".to_string()),
            tenant_header: get("LEDGER_TENANT_HEADER").unwrap_or_else(|| "xero-tenant-id".to_string()),
            status_url: get("LEDGER_STATUS_URL"),
            token_secret,
            sync,
            refresh_retry: RetryPolicy {
                max_retries: parse_or(&get, "LEDGER_REFRESH_RETRIES", 3u32)?,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(30),
            },
            error_retry_window: ChronoDuration::minutes(parse_or(&get, "LEDGER_ERROR_RETRY_WINDOW_MINUTES", 60i64)?),
            reminder_min_age: ChronoDuration::hours(parse_or(&get, "LEDGER_REMINDER_MIN_AGE_HOURS", 24i64)?),
            scheduler_interval_minutes,
        })
    }
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.parse::<T>().map_err(|e| ConfigError::Invalid {
            key,
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

fn default_database_path() -> Result<PathBuf, ConfigError> {
    let dirs = directories::ProjectDirs::from("com", "ledger-bridge", "ledger-bridge")
        .ok_or(ConfigError::NoDataDir)?;
    Ok(dirs.data_dir().join("ledger_bridge.db"))
}
