//! Shared fakes for unit tests: token provider, accounting API, seeded connection

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::{RetryPolicy, SyncSettings};
use crate::crypto::TokenCipher;
use crate::db::{to_db_timestamp, Database, NewConnection, NewContact};
use crate::oauth::{AuthorizationRequest, OAuthError, TokenGrant, TokenProvider};
use crate::sync::api::{AccountingApi, ApiError};
use crate::sync::conflict::ConflictResolver;
use crate::sync::error_log::SyncErrorLog;
use crate::sync::gateway::ApiGateway;
use crate::sync::models::{EntityKind, IntegrationConnection, Payload, RemotePage, RemoteRecord};
use crate::sync::orchestrator::SyncOrchestrator;
use crate::token_manager::{AccessToken, TokenManager};

pub fn test_cipher() -> Arc<TokenCipher> {
    Arc::new(TokenCipher::from_secret("test-secret", b"test-salt").expect("Failed to build cipher"))
}

/// Active connection with tokens "seed-access" / "seed-refresh"
pub fn seed_connection(
    db: &Database,
    cipher: &TokenCipher,
    expires_in: chrono::Duration,
) -> IntegrationConnection {
    let id = db
        .activate_connection(&NewConnection {
            tenant_id: "tenant-test".to_string(),
            access_token_encrypted: cipher.seal("seed-access").expect("Failed to seal"),
            refresh_token_encrypted: cipher.seal("seed-refresh").expect("Failed to seal"),
            expires_at: Utc::now() + expires_in,
        })
        .expect("Failed to seed connection");

    let row = db
        .get_connection(id)
        .expect("Failed to load connection")
        .expect("Seeded connection missing");
    IntegrationConnection::from(&row)
}

/// In-memory database, active connection and a gateway over the fake API
pub struct TestHarness {
    pub db: Arc<Database>,
    pub api: Arc<MockAccountingApi>,
    pub provider: Arc<MockTokenProvider>,
    pub tokens: Arc<TokenManager>,
    pub gateway: Arc<ApiGateway>,
    pub connection: IntegrationConnection,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_settings(SyncSettings::default())
    }

    pub fn with_settings(settings: SyncSettings) -> Self {
        let db = Arc::new(Database::in_memory().expect("Failed to create test DB"));
        let cipher = test_cipher();
        let connection = seed_connection(&db, &cipher, chrono::Duration::hours(1));
        let provider = Arc::new(MockTokenProvider::new());
        let tokens = Arc::new(TokenManager::new(
            db.clone(),
            cipher,
            provider.clone(),
            RetryPolicy {
                max_retries: 0,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
            },
        ));
        let api = Arc::new(MockAccountingApi::new());
        let gateway = Arc::new(ApiGateway::new(api.clone(), tokens.clone(), settings));

        Self {
            db,
            api,
            provider,
            tokens,
            gateway,
            connection,
        }
    }

    /// Orchestrator over the harness gateway with a fresh error log and resolver
    pub fn orchestrator(&self) -> SyncOrchestrator {
        SyncOrchestrator::new(
            self.db.clone(),
            self.gateway.clone(),
            Arc::new(SyncErrorLog::new(self.db.clone())),
            Arc::new(ConflictResolver::new(self.db.clone(), self.gateway.clone())),
        )
    }

    /// Contact present on both sides, mapped and in sync. Returns (local id, external id).
    pub fn mapped_contact(&self, name: &str, email: Option<&str>) -> (i64, String) {
        let remote = self.api.seed(
            EntityKind::Contact,
            serde_json::json!({ "name": name, "email": email }),
        );
        let id = self
            .db
            .insert_contact(&NewContact {
                name: name.to_string(),
                email: email.map(str::to_string),
                ..Default::default()
            })
            .expect("Failed to insert contact");
        let local = self.db.get_contact(id).expect("Failed to load contact");
        let synced_at = Utc::now().max(local.updated_at).max(remote.updated_at);

        self.db
            .execute(
                "UPDATE contacts SET external_id = ?1, last_synced_at = ?2 WHERE id = ?3",
                rusqlite::params![remote.external_id, to_db_timestamp(&synced_at), id],
            )
            .expect("Failed to map contact");
        (id, remote.external_id)
    }
}

// ============================================================================
// Token provider
// ============================================================================

pub struct MockTokenProvider {
    outcomes: Mutex<VecDeque<Result<TokenGrant, OAuthError>>>,
    delay: Duration,
    refresh_calls: AtomicU64,
    counter: AtomicU64,
}

impl MockTokenProvider {
    pub fn new() -> Self {
        Self {
            outcomes: Mutex::new(VecDeque::new()),
            delay: Duration::ZERO,
            refresh_calls: AtomicU64::new(0),
            counter: AtomicU64::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Queue the result of the next refresh call
    pub fn push_outcome(&self, outcome: Result<TokenGrant, OAuthError>) {
        self.outcomes.lock().unwrap().push_back(outcome);
    }

    pub fn refresh_calls(&self) -> u64 {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    fn fresh_grant(&self) -> TokenGrant {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        TokenGrant {
            access_token: format!("access-{}", n),
            refresh_token: Some(format!("refresh-{}", n)),
            expires_at: Utc::now() + chrono::Duration::minutes(30),
        }
    }
}

#[async_trait]
impl TokenProvider for MockTokenProvider {
    fn authorize_url(&self) -> Result<AuthorizationRequest, OAuthError> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let state = format!("state-{}", n);
        Ok(AuthorizationRequest {
            url: format!("https://login.example.test/authorize?state={}", state),
            state,
            pkce_verifier: format!("verifier-{}", n),
        })
    }

    async fn exchange_code(&self, code: &str, _pkce_verifier: &str) -> Result<TokenGrant, OAuthError> {
        if code == "bad" {
            return Err(OAuthError::TokenExchange("invalid code".to_string()));
        }
        Ok(self.fresh_grant())
    }

    async fn refresh(&self, _refresh_token: &str) -> Result<TokenGrant, OAuthError> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let queued = self.outcomes.lock().unwrap().pop_front();
        match queued {
            Some(outcome) => outcome,
            None => Ok(self.fresh_grant()),
        }
    }

    async fn resolve_tenant(&self, _access_token: &str) -> Result<String, OAuthError> {
        Ok("tenant-test".to_string())
    }
}

// ============================================================================
// Accounting API
// ============================================================================

#[derive(Default)]
struct MockApiState {
    records: HashMap<EntityKind, Vec<RemoteRecord>>,
    next_id: u64,
    /// (operation filter, Retry-After) per injected 429
    rate_limits: VecDeque<(Option<&'static str>, Option<Duration>)>,
    transient_failures: u32,
    create_failures: Vec<(String, String, ApiError)>,
    rejected_tokens: HashSet<String>,
    reject_all: bool,
    stall: Option<Duration>,
    /// Creates commit, then answer after this long
    commit_stall: Option<Duration>,
    /// Creates that commit and then answer 502
    commit_failures: u32,
    calls: Vec<(&'static str, EntityKind)>,
    request_times: Vec<tokio::time::Instant>,
}

/// In-memory accounting provider
#[derive(Default)]
pub struct MockAccountingApi {
    state: Mutex<MockApiState>,
}

impl MockAccountingApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a remote record. `id` and `updated_at` are generated when absent.
    pub fn seed(&self, kind: EntityKind, value: Value) -> RemoteRecord {
        let mut state = self.state.lock().unwrap();
        let mut object = value.as_object().cloned().unwrap_or_default();
        if !object.contains_key("id") {
            state.next_id += 1;
            object.insert("id".into(), Value::String(format!("{}-{}", kind, state.next_id)));
        }
        if !object.contains_key("updated_at") {
            object.insert("updated_at".into(), serde_json::json!(Utc::now()));
        }
        let record: RemoteRecord =
            serde_json::from_value(Value::Object(object)).expect("Failed to build remote record");
        state.records.entry(kind).or_default().push(record.clone());
        record
    }

    /// Edit a remote record as another user of the provider would
    pub fn touch(&self, kind: EntityKind, external_id: &str, changes: Value) -> RemoteRecord {
        let mut state = self.state.lock().unwrap();
        let record = state
            .records
            .entry(kind)
            .or_default()
            .iter_mut()
            .find(|r| r.external_id == external_id)
            .expect("No such remote record");
        if let Some(fields) = changes.as_object() {
            for (key, value) in fields {
                record.data.insert(key.clone(), value.clone());
            }
        }
        record.updated_at = Utc::now();
        record.clone()
    }

    pub fn set_updated_at(&self, kind: EntityKind, external_id: &str, at: DateTime<Utc>) {
        let mut state = self.state.lock().unwrap();
        if let Some(record) = state
            .records
            .entry(kind)
            .or_default()
            .iter_mut()
            .find(|r| r.external_id == external_id)
        {
            record.updated_at = at;
        }
    }

    pub fn record(&self, kind: EntityKind, external_id: &str) -> Option<RemoteRecord> {
        let state = self.state.lock().unwrap();
        state
            .records
            .get(&kind)
            .and_then(|records| records.iter().find(|r| r.external_id == external_id).cloned())
    }

    pub fn all(&self, kind: EntityKind) -> Vec<RemoteRecord> {
        let state = self.state.lock().unwrap();
        state.records.get(&kind).cloned().unwrap_or_default()
    }

    pub fn rate_limit_next(&self, count: usize, retry_after: Option<Duration>) {
        let mut state = self.state.lock().unwrap();
        for _ in 0..count {
            state.rate_limits.push_back((None, retry_after));
        }
    }

    /// Like `rate_limit_next`, but only calls of operation `op` are limited
    pub fn rate_limit_next_on(&self, op: &'static str, count: usize, retry_after: Option<Duration>) {
        let mut state = self.state.lock().unwrap();
        for _ in 0..count {
            state.rate_limits.push_back((Some(op), retry_after));
        }
    }

    pub fn fail_transient_next(&self, count: u32) {
        self.state.lock().unwrap().transient_failures += count;
    }

    /// Fail every create whose payload has `field == value`
    pub fn fail_create_when(&self, field: &str, value: &str, error: ApiError) {
        self.state
            .lock()
            .unwrap()
            .create_failures
            .push((field.to_string(), value.to_string(), error));
    }

    pub fn reject_token(&self, secret: &str) {
        self.state.lock().unwrap().rejected_tokens.insert(secret.to_string());
    }

    pub fn reject_all_tokens(&self) {
        self.state.lock().unwrap().reject_all = true;
    }

    /// Every call sleeps this long before answering
    pub fn stall_for(&self, delay: Duration) {
        self.state.lock().unwrap().stall = Some(delay);
    }

    /// Creates store the record, then stall before answering
    pub fn commit_then_stall(&self, delay: Duration) {
        self.state.lock().unwrap().commit_stall = Some(delay);
    }

    /// The next `count` creates store the record, then answer 502
    pub fn commit_then_fail_next(&self, count: u32) {
        self.state.lock().unwrap().commit_failures += count;
    }

    pub fn calls(&self, op: &str, kind: EntityKind) -> usize {
        let state = self.state.lock().unwrap();
        state.calls.iter().filter(|(o, k)| *o == op && *k == kind).count()
    }

    fn count(&self, op: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.calls.iter().filter(|(o, _)| *o == op).count()
    }

    pub fn list_calls(&self) -> usize {
        self.count("list")
    }

    pub fn get_calls(&self) -> usize {
        self.count("get")
    }

    pub fn create_calls(&self) -> usize {
        self.count("create")
    }

    pub fn update_calls(&self) -> usize {
        self.count("update")
    }

    pub fn request_times(&self) -> Vec<tokio::time::Instant> {
        self.state.lock().unwrap().request_times.clone()
    }

    /// Records the call and returns the injected failure, if any
    async fn begin(&self, op: &'static str, kind: EntityKind, token: &AccessToken) -> Result<(), ApiError> {
        let stall = {
            let mut state = self.state.lock().unwrap();
            state.calls.push((op, kind));
            state.request_times.push(tokio::time::Instant::now());
            state.stall
        };
        if let Some(delay) = stall {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        if state.reject_all || state.rejected_tokens.contains(token.secret()) {
            return Err(ApiError::Unauthorized);
        }
        let limited = matches!(state.rate_limits.front(), Some((filter, _)) if filter.map_or(true, |f| f == op));
        if limited {
            let retry_after = state.rate_limits.pop_front().and_then(|(_, retry_after)| retry_after);
            return Err(ApiError::RateLimited { retry_after });
        }
        if state.transient_failures > 0 {
            state.transient_failures -= 1;
            return Err(ApiError::Server("503 Service Unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl AccountingApi for MockAccountingApi {
    async fn list(
        &self,
        token: &AccessToken,
        kind: EntityKind,
        page: u32,
        page_size: usize,
    ) -> Result<RemotePage, ApiError> {
        self.begin("list", kind, token).await?;
        let state = self.state.lock().unwrap();
        let records = state.records.get(&kind).cloned().unwrap_or_default();
        let start = (page.saturating_sub(1) as usize) * page_size;
        let items: Vec<RemoteRecord> = records.iter().skip(start).take(page_size).cloned().collect();
        Ok(RemotePage {
            has_more: start + items.len() < records.len(),
            items,
        })
    }

    async fn get(
        &self,
        token: &AccessToken,
        kind: EntityKind,
        external_id: &str,
    ) -> Result<RemoteRecord, ApiError> {
        self.begin("get", kind, token).await?;
        self.record(kind, external_id)
            .ok_or_else(|| ApiError::NotFound(external_id.to_string()))
    }

    async fn create(
        &self,
        token: &AccessToken,
        kind: EntityKind,
        payload: &Payload,
    ) -> Result<RemoteRecord, ApiError> {
        self.begin("create", kind, token).await?;
        {
            let state = self.state.lock().unwrap();
            for (field, value, error) in &state.create_failures {
                if payload.get(field).and_then(|v| v.as_str()) == Some(value.as_str()) {
                    return Err(error.clone());
                }
            }
        }
        let created = self.seed(kind, Value::Object(payload.clone()));

        let (stall, fail) = {
            let mut state = self.state.lock().unwrap();
            let fail = state.commit_failures > 0;
            if fail {
                state.commit_failures -= 1;
            }
            (state.commit_stall, fail)
        };
        if let Some(delay) = stall {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(ApiError::Server("502 Bad Gateway".to_string()));
        }
        Ok(created)
    }

    async fn update(
        &self,
        token: &AccessToken,
        kind: EntityKind,
        external_id: &str,
        payload: &Payload,
    ) -> Result<RemoteRecord, ApiError> {
        self.begin("update", kind, token).await?;
        if self.record(kind, external_id).is_none() {
            return Err(ApiError::NotFound(external_id.to_string()));
        }
        Ok(self.touch(kind, external_id, Value::Object(payload.clone())))
    }
}
