//! API Gateway - every accounting API call the sync engine makes goes through here
//!
//! Per call:
//! - obtains a token valid for the trigger's safety margin
//! - bounds the request with the configured timeout
//! - on 401, refreshes once (single-flight) and retries
//! - on 429, pauses the whole gateway until `Retry-After` has passed
//! - retries transient failures with capped exponential backoff, except for
//!   creates: a create that timed out may have been committed, so it fails and
//!   the next pass maps the remote record by natural key

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use super::api::{AccountingApi, ApiError};
use super::error::SyncError;
use super::models::{EntityKind, IntegrationConnection, Payload, RemoteRecord, SyncTrigger};
use crate::config::SyncSettings;
use crate::token_manager::{AccessToken, TokenManager};

/// Upper bound on pages fetched for one collection
const MAX_PAGES: u32 = 10_000;

/// Whether a call can be repeated after an unknown outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Replay {
    Safe,
    Unsafe,
}

/// Shared pause honoured by every in-flight call after a 429
struct RateGate {
    paused_until: Mutex<Option<Instant>>,
}

impl RateGate {
    fn new() -> Self {
        Self {
            paused_until: Mutex::new(None),
        }
    }

    async fn wait(&self) {
        loop {
            let until = *self.paused_until.lock().unwrap_or_else(|p| p.into_inner());
            match until {
                Some(deadline) if deadline > Instant::now() => tokio::time::sleep_until(deadline).await,
                _ => return,
            }
        }
    }

    /// Extend the pause; never shortens one already in place
    fn pause_for(&self, delay: Duration) {
        let until = Instant::now() + delay;
        let mut current = self.paused_until.lock().unwrap_or_else(|p| p.into_inner());
        if current.map_or(true, |existing| until > existing) {
            *current = Some(until);
        }
    }
}

pub struct ApiGateway {
    api: Arc<dyn AccountingApi>,
    tokens: Arc<TokenManager>,
    settings: SyncSettings,
    gate: RateGate,
}

impl ApiGateway {
    pub fn new(api: Arc<dyn AccountingApi>, tokens: Arc<TokenManager>, settings: SyncSettings) -> Self {
        Self {
            api,
            tokens,
            settings,
            gate: RateGate::new(),
        }
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    /// Every page of a remote collection
    pub async fn list_all(
        &self,
        connection: &IntegrationConnection,
        kind: EntityKind,
        trigger: SyncTrigger,
    ) -> Result<Vec<RemoteRecord>, SyncError> {
        let page_size = self.settings.page_size;
        let mut records = Vec::new();
        let mut page = 1u32;

        loop {
            let api = self.api.clone();
            let result = self
                .call(connection, trigger, Replay::Safe, move |token| {
                    let api = api.clone();
                    async move { api.list(&token, kind, page, page_size).await }
                })
                .await?;

            let fetched = result.items.len();
            records.extend(result.items);

            if !result.has_more || fetched == 0 || page >= MAX_PAGES {
                break;
            }
            page += 1;
        }

        log::debug!("Fetched {} remote {} records in {} page(s)", records.len(), kind, page);
        Ok(records)
    }

    pub async fn get(
        &self,
        connection: &IntegrationConnection,
        kind: EntityKind,
        external_id: &str,
        trigger: SyncTrigger,
    ) -> Result<RemoteRecord, SyncError> {
        let api = self.api.clone();
        let external_id = external_id.to_string();
        self.call(connection, trigger, Replay::Safe, move |token| {
            let api = api.clone();
            let external_id = external_id.clone();
            async move { api.get(&token, kind, &external_id).await }
        })
        .await
    }

    pub async fn create(
        &self,
        connection: &IntegrationConnection,
        kind: EntityKind,
        payload: &Payload,
        trigger: SyncTrigger,
    ) -> Result<RemoteRecord, SyncError> {
        let api = self.api.clone();
        let payload = payload.clone();
        self.call(connection, trigger, Replay::Unsafe, move |token| {
            let api = api.clone();
            let payload = payload.clone();
            async move { api.create(&token, kind, &payload).await }
        })
        .await
    }

    pub async fn update(
        &self,
        connection: &IntegrationConnection,
        kind: EntityKind,
        external_id: &str,
        payload: &Payload,
        trigger: SyncTrigger,
    ) -> Result<RemoteRecord, SyncError> {
        let api = self.api.clone();
        let external_id = external_id.to_string();
        let payload = payload.clone();
        self.call(connection, trigger, Replay::Safe, move |token| {
            let api = api.clone();
            let external_id = external_id.clone();
            let payload = payload.clone();
            async move { api.update(&token, kind, &external_id, &payload).await }
        })
        .await
    }

    async fn call<T, F, Fut>(
        &self,
        connection: &IntegrationConnection,
        trigger: SyncTrigger,
        replay: Replay,
        op: F,
    ) -> Result<T, SyncError>
    where
        F: Fn(AccessToken) -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let margin = self.settings.margin_for(trigger);
        let mut refreshed_after_rejection = false;
        let mut rate_limited = 0u32;
        let mut transient = 0u32;

        loop {
            self.gate.wait().await;

            let token = self.tokens.get_valid_access_token(connection, margin).await?;
            let outcome = match tokio::time::timeout(self.settings.request_timeout, op(token.clone())).await {
                Ok(result) => result,
                Err(_) => Err(ApiError::Timeout),
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(ApiError::Unauthorized) if !refreshed_after_rejection => {
                    refreshed_after_rejection = true;
                    self.tokens.refresh_after_rejection(connection, &token).await?;
                }
                Err(ApiError::RateLimited { retry_after })
                    if rate_limited < self.settings.rate_limit_retries =>
                {
                    let pause = retry_after
                        .unwrap_or_else(|| self.settings.transient_retry.delay_for(rate_limited));
                    log::warn!("Accounting API rate limit hit, pausing all calls for {:?}", pause);
                    self.gate.pause_for(pause);
                    rate_limited += 1;
                }
                Err(e @ (ApiError::Server(_) | ApiError::Network(_) | ApiError::Timeout))
                    if replay == Replay::Unsafe =>
                {
                    log::warn!("Accounting API create failed ({}), not retrying: the record may exist remotely", e);
                    return Err(SyncError::NetworkTransient(format!("create outcome unknown: {}", e)));
                }
                Err(e @ (ApiError::Server(_) | ApiError::Network(_) | ApiError::Timeout))
                    if transient < self.settings.transient_retry.max_retries =>
                {
                    let delay = self.settings.transient_retry.delay_for(transient);
                    log::warn!("Accounting API call failed ({}), retrying in {:?}", e, delay);
                    tokio::time::sleep(delay).await;
                    transient += 1;
                }
                Err(e) => return Err(SyncError::from(e)),
            }
        }
    }
}
