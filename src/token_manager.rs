//! Token Manager - OAuth2 token lifecycle for the active accounting connection
//!
//! - Callers never receive a token that expires within their safety margin
//! - Refresh is single-flight per connection id (moka value-initializer coalescing)
//! - Terminal refresh failures deactivate the connection row
//! - Tokens are encrypted at rest and never logged

use chrono::{DateTime, Duration, Utc};
use moka::future::Cache;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::config::RetryPolicy;
use crate::crypto::{CryptoError, TokenCipher};
use crate::db::{Database, DbError, NewConnection, StoredConnection};
use crate::oauth::{OAuthError, TokenProvider};
use crate::sync::error::SyncError;
use crate::sync::models::{ConnectionState, ConnectionStatus, IntegrationConnection};

/// How long a started authorization may wait for its callback
const PENDING_AUTHORIZATION_TTL_SECS: u64 = 10 * 60;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TokenError {
    #[error("No active accounting connection")]
    NoActiveConnection,
    #[error("Refresh token revoked: {0}")]
    Revoked(String),
    #[error("Token refresh failed: {0}")]
    Refresh(String),
    #[error("Authorization failed: {0}")]
    Authorization(String),
    #[error("Token storage error: {0}")]
    Storage(String),
}

impl From<DbError> for TokenError {
    fn from(err: DbError) -> Self {
        TokenError::Storage(err.to_string())
    }
}

impl From<CryptoError> for TokenError {
    fn from(err: CryptoError) -> Self {
        TokenError::Storage(err.to_string())
    }
}

impl From<TokenError> for SyncError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::NoActiveConnection => SyncError::NoActiveConnection,
            TokenError::Revoked(reason) => SyncError::TokenRevoked(reason),
            TokenError::Refresh(reason) => SyncError::TokenExpired(reason),
            TokenError::Authorization(reason) => SyncError::TokenExpired(reason),
            TokenError::Storage(reason) => SyncError::Database(reason),
        }
    }
}

/// A usable bearer token for one logical operation
#[derive(Clone, PartialEq)]
pub struct AccessToken {
    secret: String,
    pub expires_at: DateTime<Utc>,
    pub connection_id: i64,
    pub tenant_id: String,
}

impl AccessToken {
    pub fn new(
        secret: impl Into<String>,
        expires_at: DateTime<Utc>,
        connection_id: i64,
        tenant_id: impl Into<String>,
    ) -> Self {
        Self {
            secret: secret.into(),
            expires_at,
            connection_id,
            tenant_id: tenant_id.into(),
        }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    /// Remaining lifetime is at most `margin`
    pub fn expires_within(&self, margin: Duration) -> bool {
        self.expires_at - Utc::now() <= margin
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("secret", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .field("connection_id", &self.connection_id)
            .field("tenant_id", &self.tenant_id)
            .finish()
    }
}

/// Authorization URL handed to the user
#[derive(Debug, Clone, PartialEq)]
pub struct AuthorizationUrl {
    pub url: String,
    pub state: String,
}

/// Clears the refreshing marker even when the refresh future is dropped
struct RefreshingGuard<'a> {
    set: &'a Mutex<HashSet<i64>>,
    id: i64,
}

impl<'a> RefreshingGuard<'a> {
    fn new(set: &'a Mutex<HashSet<i64>>, id: i64) -> Self {
        set.lock().unwrap_or_else(|p| p.into_inner()).insert(id);
        Self { set, id }
    }
}

impl Drop for RefreshingGuard<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.id);
    }
}

/// Owns the token of the active connection
pub struct TokenManager {
    db: Arc<Database>,
    cipher: Arc<TokenCipher>,
    provider: Arc<dyn TokenProvider>,
    /// Single-flight refresh slot per connection id
    in_flight: Cache<i64, Arc<AccessToken>>,
    /// state -> PKCE verifier for started authorizations
    pending_auth: Cache<String, String>,
    refreshing: Mutex<HashSet<i64>>,
    retry: RetryPolicy,
}

impl TokenManager {
    pub fn new(
        db: Arc<Database>,
        cipher: Arc<TokenCipher>,
        provider: Arc<dyn TokenProvider>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            db,
            cipher,
            provider,
            in_flight: Cache::builder().max_capacity(16).build(),
            pending_auth: Cache::builder()
                .max_capacity(64)
                .time_to_live(std::time::Duration::from_secs(PENDING_AUTHORIZATION_TTL_SECS))
                .build(),
            refreshing: Mutex::new(HashSet::new()),
            retry,
        }
    }

    // =========================================================================
    // Connection lookup
    // =========================================================================

    /// The active connection, queried explicitly for each operation
    pub fn active_connection(&self) -> Result<IntegrationConnection, TokenError> {
        self.db
            .get_active_connection()?
            .map(|row| IntegrationConnection::from(&row))
            .ok_or(TokenError::NoActiveConnection)
    }

    fn load_active_row(&self, id: i64) -> Result<StoredConnection, TokenError> {
        match self.db.get_connection(id)? {
            Some(row) if row.is_active => Ok(row),
            _ => Err(TokenError::NoActiveConnection),
        }
    }

    fn decrypt_access(&self, row: &StoredConnection) -> Result<AccessToken, TokenError> {
        let secret = self.cipher.open(&row.access_token_encrypted)?;
        Ok(AccessToken::new(secret, row.expires_at, row.id, row.tenant_id.clone()))
    }

    // =========================================================================
    // Access tokens
    // =========================================================================

    /// Token valid for at least `safety_margin`, refreshing first when needed
    pub async fn get_valid_access_token(
        &self,
        connection: &IntegrationConnection,
        safety_margin: Duration,
    ) -> Result<AccessToken, TokenError> {
        let row = self.load_active_row(connection.id)?;
        if row.expires_at - Utc::now() > safety_margin {
            return self.decrypt_access(&row);
        }

        log::debug!(
            "Access token for connection {} expires at {}, refreshing",
            connection.id,
            row.expires_at
        );
        let token = self.refresh_single_flight(connection.id, safety_margin, None).await?;

        if token.expires_within(safety_margin) {
            return Err(TokenError::Refresh(format!(
                "provider issued a token expiring at {}, inside the {} minute safety margin",
                token.expires_at,
                safety_margin.num_minutes()
            )));
        }
        Ok(token)
    }

    /// Force a refresh of the connection's token pair. Joins a refresh already
    /// in flight, and skips the provider when the pair rotated after the call began.
    pub async fn refresh(&self, connection: &IntegrationConnection) -> Result<AccessToken, TokenError> {
        let row = self.load_active_row(connection.id)?;
        let current = self.decrypt_access(&row)?;
        self.refresh_single_flight(connection.id, Duration::zero(), Some(current.secret().to_string()))
            .await
    }

    /// The provider rejected `rejected` with 401. Refresh unless someone already has.
    pub async fn refresh_after_rejection(
        &self,
        connection: &IntegrationConnection,
        rejected: &AccessToken,
    ) -> Result<AccessToken, TokenError> {
        log::warn!(
            "Access token for connection {} rejected by provider",
            connection.id
        );
        self.refresh_single_flight(connection.id, Duration::zero(), Some(rejected.secret().to_string()))
            .await
    }

    async fn refresh_single_flight(
        &self,
        id: i64,
        margin: Duration,
        rejected: Option<String>,
    ) -> Result<AccessToken, TokenError> {
        let init = async {
            // Another flight may have rotated the pair while we queued
            let row = self.load_active_row(id)?;
            let current = self.decrypt_access(&row)?;
            let is_rejected = rejected.as_deref() == Some(current.secret());
            if !is_rejected && !current.expires_within(margin) {
                return Ok(Arc::new(current));
            }
            self.refresh_row(&row).await.map(Arc::new)
        };

        let result = self.in_flight.try_get_with(id, init).await;
        self.in_flight.invalidate(&id).await;

        result
            .map(|token| (*token).clone())
            .map_err(|e| (*e).clone())
    }

    async fn refresh_row(&self, row: &StoredConnection) -> Result<AccessToken, TokenError> {
        let _guard = RefreshingGuard::new(&self.refreshing, row.id);
        let refresh_token = self.cipher.open(&row.refresh_token_encrypted)?;

        let mut attempt = 0;
        let outcome = loop {
            match self.provider.refresh(&refresh_token).await {
                Ok(grant) => break Ok(grant),
                Err(e) if e.is_terminal() => break Err(e),
                Err(e) if attempt < self.retry.max_retries => {
                    let delay = self.retry.delay_for(attempt);
                    log::warn!(
                        "Token refresh for connection {} failed (attempt {}): {}. Retrying in {:?}",
                        row.id,
                        attempt + 1,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => break Err(e),
            }
        };

        match outcome {
            Ok(grant) => {
                let new_refresh = grant.refresh_token.clone().unwrap_or(refresh_token);
                let access_enc = self.cipher.seal(&grant.access_token)?;
                let refresh_enc = self.cipher.seal(&new_refresh)?;

                if !self
                    .db
                    .rotate_connection_tokens(row.id, &access_enc, &refresh_enc, &grant.expires_at)?
                {
                    log::warn!("Connection {} was deactivated during refresh", row.id);
                    return Err(TokenError::NoActiveConnection);
                }

                log::info!(
                    "Refreshed access token for connection {} (expires {})",
                    row.id,
                    grant.expires_at
                );
                Ok(AccessToken::new(
                    grant.access_token,
                    grant.expires_at,
                    row.id,
                    row.tenant_id.clone(),
                ))
            }
            Err(OAuthError::Revoked(reason)) => {
                self.db
                    .deactivate_connection(row.id, &format!("refresh token revoked: {}", reason))?;
                log::error!(
                    "Refresh token for connection {} revoked, connection deactivated",
                    row.id
                );
                Err(TokenError::Revoked(reason))
            }
            Err(e) => Err(TokenError::Refresh(e.to_string())),
        }
    }

    // =========================================================================
    // Authorization
    // =========================================================================

    /// Build the authorize URL and remember its state/PKCE verifier
    pub async fn begin_authorization(&self) -> Result<AuthorizationUrl, TokenError> {
        let request = self
            .provider
            .authorize_url()
            .map_err(|e| TokenError::Authorization(e.to_string()))?;

        self.pending_auth
            .insert(request.state.clone(), request.pkce_verifier)
            .await;

        log::info!("Started accounting authorization");
        Ok(AuthorizationUrl {
            url: request.url,
            state: request.state,
        })
    }

    /// Exchange the callback code and make the new connection the active one
    pub async fn complete_authorization(
        &self,
        code: &str,
        state: &str,
    ) -> Result<IntegrationConnection, TokenError> {
        let verifier = self.pending_auth.remove(state).await.ok_or_else(|| {
            TokenError::Authorization("unknown or expired authorization state".to_string())
        })?;

        let grant = self
            .provider
            .exchange_code(code, &verifier)
            .await
            .map_err(|e| TokenError::Authorization(e.to_string()))?;

        let tenant_id = self
            .provider
            .resolve_tenant(&grant.access_token)
            .await
            .map_err(|e| TokenError::Authorization(e.to_string()))?;

        let refresh_token = grant.refresh_token.as_deref().ok_or_else(|| {
            TokenError::Authorization("provider did not issue a refresh token".to_string())
        })?;

        let id = self.db.activate_connection(&NewConnection {
            tenant_id,
            access_token_encrypted: self.cipher.seal(&grant.access_token)?,
            refresh_token_encrypted: self.cipher.seal(refresh_token)?,
            expires_at: grant.expires_at,
        })?;

        let row = self
            .db
            .get_connection(id)?
            .ok_or_else(|| TokenError::Storage(format!("connection {} vanished after insert", id)))?;

        log::info!("Accounting connection {} established for tenant {}", id, row.tenant_id);
        Ok(IntegrationConnection::from(&row))
    }

    /// Deactivate the active connection. Returns false when nothing was connected.
    pub fn disconnect(&self) -> Result<bool, TokenError> {
        match self.db.get_active_connection()? {
            Some(row) => {
                let done = self.db.deactivate_connection(row.id, "disconnected by user")?;
                log::info!("Accounting connection {} disconnected", row.id);
                Ok(done)
            }
            None => Ok(false),
        }
    }

    // =========================================================================
    // Status
    // =========================================================================

    pub async fn state(&self) -> Result<ConnectionState, TokenError> {
        if let Some(row) = self.db.get_active_connection()? {
            let refreshing = self
                .refreshing
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .contains(&row.id);
            return Ok(if refreshing {
                ConnectionState::Refreshing
            } else {
                ConnectionState::Connected
            });
        }

        self.pending_auth.run_pending_tasks().await;
        if self.pending_auth.entry_count() > 0 {
            Ok(ConnectionState::Connecting)
        } else {
            Ok(ConnectionState::Disconnected)
        }
    }

    pub async fn connection_status(&self) -> Result<ConnectionStatus, TokenError> {
        let state = self.state().await?;
        let now = Utc::now();

        if let Some(row) = self.db.get_active_connection()? {
            let token_expired = row.expires_at <= now;
            return Ok(ConnectionStatus {
                connected: true,
                reason: token_expired
                    .then(|| "Access token expired, it will be refreshed on next use".to_string()),
                token_expired,
                state,
                tenant_id: Some(row.tenant_id),
                expires_at: Some(row.expires_at),
                last_sync_at: row.last_sync_at,
            });
        }

        Ok(match self.db.get_latest_connection()? {
            Some(row) => ConnectionStatus {
                connected: false,
                reason: Some(
                    row.deactivation_reason
                        .unwrap_or_else(|| "Connection inactive".to_string()),
                ),
                token_expired: row.expires_at <= now,
                state,
                tenant_id: Some(row.tenant_id),
                expires_at: Some(row.expires_at),
                last_sync_at: row.last_sync_at,
            },
            None => ConnectionStatus {
                connected: false,
                reason: Some("No accounting connection configured".to_string()),
                token_expired: false,
                state,
                tenant_id: None,
                expires_at: None,
                last_sync_at: None,
            },
        })
    }
}
