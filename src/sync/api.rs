//! Accounting API Client - HTTP communication with the accounting provider
//!
//! Handles the REST calls the sync engine needs per entity collection:
//! - Paged listing (`{ "items": [...], "has_more": bool }`)
//! - Single-record fetch
//! - Create / update
//!
//! Every call carries the bearer token and the tenant header. A 429 is
//! surfaced with its `Retry-After` (delta-seconds or HTTP date).

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use std::time::{Duration, SystemTime};

use super::error::SyncError;
use super::models::{EntityKind, Payload, RemotePage, RemoteRecord};
use crate::token_manager::AccessToken;

/// Accounting provider operations used by the sync engine
#[async_trait]
pub trait AccountingApi: Send + Sync {
    /// Fetch one page (1-based) of a collection
    async fn list(
        &self,
        token: &AccessToken,
        kind: EntityKind,
        page: u32,
        page_size: usize,
    ) -> Result<RemotePage, ApiError>;

    async fn get(
        &self,
        token: &AccessToken,
        kind: EntityKind,
        external_id: &str,
    ) -> Result<RemoteRecord, ApiError>;

    async fn create(
        &self,
        token: &AccessToken,
        kind: EntityKind,
        payload: &Payload,
    ) -> Result<RemoteRecord, ApiError>;

    async fn update(
        &self,
        token: &AccessToken,
        kind: EntityKind,
        external_id: &str,
        payload: &Payload,
    ) -> Result<RemoteRecord, ApiError>;
}

/// reqwest-backed client
pub struct HttpAccountingApi {
    client: Client,
    base_url: String,
    tenant_header: String,
}

impl HttpAccountingApi {
    pub fn new(
        base_url: impl Into<String>,
        tenant_header: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ApiError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tenant_header: tenant_header.into(),
        })
    }

    fn collection_url(&self, kind: EntityKind) -> String {
        format!("{}/{}", self.base_url, kind.remote_path())
    }

    fn record_url(&self, kind: EntityKind, external_id: &str) -> String {
        format!("{}/{}/{}", self.base_url, kind.remote_path(), external_id)
    }

    fn authorize(&self, request: reqwest::RequestBuilder, token: &AccessToken) -> reqwest::RequestBuilder {
        request
            .bearer_auth(token.secret())
            .header(self.tenant_header.as_str(), token.tenant_id.as_str())
            .header(reqwest::header::ACCEPT, "application/json")
    }
}

#[async_trait]
impl AccountingApi for HttpAccountingApi {
    async fn list(
        &self,
        token: &AccessToken,
        kind: EntityKind,
        page: u32,
        page_size: usize,
    ) -> Result<RemotePage, ApiError> {
        let request = self
            .client
            .get(self.collection_url(kind))
            .query(&[("page", page.to_string()), ("page_size", page_size.to_string())]);

        let response = self.authorize(request, token).send().await?;
        handle_response(response).await
    }

    async fn get(
        &self,
        token: &AccessToken,
        kind: EntityKind,
        external_id: &str,
    ) -> Result<RemoteRecord, ApiError> {
        let request = self.client.get(self.record_url(kind, external_id));
        let response = self.authorize(request, token).send().await?;
        handle_response(response).await
    }

    async fn create(
        &self,
        token: &AccessToken,
        kind: EntityKind,
        payload: &Payload,
    ) -> Result<RemoteRecord, ApiError> {
        let request = self.client.post(self.collection_url(kind)).json(payload);
        let response = self.authorize(request, token).send().await?;
        handle_response(response).await
    }

    async fn update(
        &self,
        token: &AccessToken,
        kind: EntityKind,
        external_id: &str,
        payload: &Payload,
    ) -> Result<RemoteRecord, ApiError> {
        let request = self.client.put(self.record_url(kind, external_id)).json(payload);
        let response = self.authorize(request, token).send().await?;
        handle_response(response).await
    }
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ApiError {
    #[error("Unauthorized - access token rejected")]
    Unauthorized,

    #[error("Rate limit exceeded")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Server error: {0}")]
    Server(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Rejected by provider: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid response from server: {0}")]
    InvalidResponse(String),

    #[error("Request timed out")]
    Timeout,
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ApiError::Timeout
        } else {
            ApiError::Network(err.to_string())
        }
    }
}

impl From<ApiError> for SyncError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Unauthorized => {
                SyncError::TokenExpired("access token rejected by provider".to_string())
            }
            ApiError::RateLimited { retry_after } => SyncError::RateLimited {
                retry_after_secs: retry_after.map(|d| d.as_secs()).unwrap_or(0),
            },
            ApiError::Server(msg) | ApiError::Network(msg) | ApiError::InvalidResponse(msg) => {
                SyncError::NetworkTransient(msg)
            }
            ApiError::Validation(msg) => SyncError::ValidationError(msg),
            ApiError::NotFound(what) => {
                SyncError::ValidationError(format!("remote record not found: {}", what))
            }
            ApiError::Timeout => SyncError::Timeout("accounting API request".to_string()),
        }
    }
}

/// Parse `Retry-After` as delta-seconds or an HTTP date
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();

    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let at = httpdate::parse_http_date(value).ok()?;
    Some(at.duration_since(SystemTime::now()).unwrap_or(Duration::ZERO))
}

/// Handle successful JSON response
async fn handle_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, ApiError> {
    let status = response.status();

    if status.is_success() {
        response
            .json::<T>()
            .await
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))
    } else {
        Err(handle_error(response).await)
    }
}

/// Convert error response to ApiError
async fn handle_error(response: reqwest::Response) -> ApiError {
    let status = response.status();

    match status {
        StatusCode::UNAUTHORIZED => ApiError::Unauthorized,
        StatusCode::TOO_MANY_REQUESTS => ApiError::RateLimited {
            retry_after: parse_retry_after(response.headers()),
        },
        StatusCode::NOT_FOUND => ApiError::NotFound(response.url().path().to_string()),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY | StatusCode::CONFLICT => {
            let msg = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            ApiError::Validation(format!("{}: {}", status, msg))
        }
        s if s.is_server_error() => {
            let msg = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            ApiError::Server(format!("{}: {}", status, msg))
        }
        _ => {
            let msg = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            ApiError::Network(format!("{}: {}", status, msg))
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use reqwest::header::HeaderValue;

    fn token() -> AccessToken {
        AccessToken::new("access-123", Utc::now() + chrono::Duration::minutes(30), 1, "tenant-1")
    }

    fn api_for(server: &mockito::ServerGuard) -> HttpAccountingApi {
        HttpAccountingApi::new(server.url(), "xero-tenant-id", Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_parse_retry_after_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(7)));
    }

    #[test]
    fn test_parse_retry_after_http_date() {
        let at = SystemTime::now() + Duration::from_secs(120);
        let mut headers = HeaderMap::new();
        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_str(&httpdate::fmt_http_date(at)).unwrap(),
        );

        let parsed = parse_retry_after(&headers).unwrap();
        assert!(parsed <= Duration::from_secs(120));
        assert!(parsed >= Duration::from_secs(115));

        let mut past = HeaderMap::new();
        past.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(parse_retry_after(&past), Some(Duration::ZERO));
    }

    #[tokio::test]
    async fn test_list_sends_auth_and_tenant() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/contacts")
            .match_query(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("page".into(), "1".into()),
                mockito::Matcher::UrlEncoded("page_size".into(), "50".into()),
            ]))
            .match_header("authorization", "Bearer access-123")
            .match_header("xero-tenant-id", "tenant-1")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"items":[{"id":"c-1","updated_at":"2026-01-05T10:00:00Z","name":"Acme"}],"has_more":false}"#)
            .create_async()
            .await;

        let page = api_for(&server)
            .list(&token(), EntityKind::Contact, 1, 50)
            .await
            .unwrap();

        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].external_id, "c-1");
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn test_rate_limited_carries_retry_after() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/invoices/inv-9")
            .with_status(429)
            .with_header("retry-after", "3")
            .create_async()
            .await;

        let err = api_for(&server)
            .get(&token(), EntityKind::Invoice, "inv-9")
            .await
            .unwrap_err();

        assert_eq!(err, ApiError::RateLimited { retry_after: Some(Duration::from_secs(3)) });
        assert_eq!(
            SyncError::from(err),
            SyncError::RateLimited { retry_after_secs: 3 }
        );
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let mut server = mockito::Server::new_async().await;
        let _unauthorized = server
            .mock("GET", "/contacts/expired")
            .with_status(401)
            .create_async()
            .await;
        let _invalid = server
            .mock("POST", "/contacts")
            .with_status(422)
            .with_body("name is required")
            .create_async()
            .await;
        let _down = server
            .mock("PUT", "/contacts/c-1")
            .with_status(503)
            .create_async()
            .await;

        let api = api_for(&server);
        assert_eq!(
            api.get(&token(), EntityKind::Contact, "expired").await.unwrap_err(),
            ApiError::Unauthorized
        );

        let err = api.create(&token(), EntityKind::Contact, &Payload::new()).await.unwrap_err();
        assert!(matches!(err, ApiError::Validation(ref m) if m.contains("name is required")));

        let err = api
            .update(&token(), EntityKind::Contact, "c-1", &Payload::new())
            .await
            .unwrap_err();
        assert!(matches!(SyncError::from(err), SyncError::NetworkTransient(_)));
    }
}
