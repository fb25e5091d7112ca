//! OAuth2 Authentication Module
//!
//! Handles the authorization-code (PKCE) and refresh-token flows against the
//! accounting provider, plus tenant discovery after a successful exchange.
//! Refresh failures are classified here:
//! - `invalid_grant`, or a provider code naming revocation: terminal
//! - everything else (network, 5xx, unparseable bodies): transient

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use oauth2::{
    basic::{BasicClient, BasicErrorResponse, BasicErrorResponseType},
    reqwest::async_http_client,
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, PkceCodeChallenge,
    PkceCodeVerifier, RedirectUrl, RefreshToken, RequestTokenError, Scope, TokenResponse,
    TokenUrl,
};
use serde::Deserialize;
use std::fmt;

/// Lifetime assumed when the provider omits `expires_in`
const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 30 * 60;

#[derive(Debug, thiserror::Error)]
pub enum OAuthError {
    #[error("OAuth2 configuration error: {0}")]
    Configuration(String),
    #[error("Authorization revoked: {0}")]
    Revoked(String),
    #[error("Transient token endpoint failure: {0}")]
    Transient(String),
    #[error("Token exchange failed: {0}")]
    TokenExchange(String),
    #[error("Tenant discovery failed: {0}")]
    TenantDiscovery(String),
}

impl OAuthError {
    /// Terminal errors mean the refresh token will never work again
    pub fn is_terminal(&self) -> bool {
        matches!(self, OAuthError::Revoked(_))
    }
}

#[derive(Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: Option<String>,
    pub auth_url: String,
    pub token_url: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    /// Endpoint listing the tenants the token may access
    pub connections_url: String,
}

impl fmt::Debug for OAuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "[REDACTED]"))
            .field("auth_url", &self.auth_url)
            .field("token_url", &self.token_url)
            .field("redirect_uri", &self.redirect_uri)
            .field("scopes", &self.scopes)
            .field("connections_url", &self.connections_url)
            .finish()
    }
}

/// Tokens issued by the provider
#[derive(Clone, PartialEq)]
pub struct TokenGrant {
    pub access_token: String,
    /// Providers may omit a new refresh token on refresh; the old one stays valid then
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenGrant")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Authorization URL plus the values that must survive until the callback
#[derive(Clone)]
pub struct AuthorizationRequest {
    pub url: String,
    pub state: String,
    pub pkce_verifier: String,
}

impl fmt::Debug for AuthorizationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorizationRequest")
            .field("url", &self.url)
            .field("state", &self.state)
            .field("pkce_verifier", &"[REDACTED]")
            .finish()
    }
}

/// Provider side of the token lifecycle
#[async_trait]
pub trait TokenProvider: Send + Sync {
    fn authorize_url(&self) -> Result<AuthorizationRequest, OAuthError>;

    async fn exchange_code(&self, code: &str, pkce_verifier: &str)
        -> Result<TokenGrant, OAuthError>;

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, OAuthError>;

    async fn resolve_tenant(&self, access_token: &str) -> Result<String, OAuthError>;
}

/// `oauth2`-crate backed provider
pub struct OAuthClient {
    config: OAuthConfig,
    client: BasicClient,
    http: reqwest::Client,
}

impl OAuthClient {
    pub fn new(config: OAuthConfig) -> Result<Self, OAuthError> {
        let client = BasicClient::new(
            ClientId::new(config.client_id.clone()),
            config.client_secret.clone().map(ClientSecret::new),
            AuthUrl::new(config.auth_url.clone())
                .map_err(|e| OAuthError::Configuration(e.to_string()))?,
            Some(
                TokenUrl::new(config.token_url.clone())
                    .map_err(|e| OAuthError::Configuration(e.to_string()))?,
            ),
        )
        .set_redirect_uri(
            RedirectUrl::new(config.redirect_uri.clone())
                .map_err(|e| OAuthError::Configuration(e.to_string()))?,
        );

        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| OAuthError::Configuration(e.to_string()))?;

        Ok(Self {
            config,
            client,
            http,
        })
    }
}

#[async_trait]
impl TokenProvider for OAuthClient {
    fn authorize_url(&self) -> Result<AuthorizationRequest, OAuthError> {
        let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();

        let mut auth_request = self.client.authorize_url(CsrfToken::new_random);
        for scope in &self.config.scopes {
            auth_request = auth_request.add_scope(Scope::new(scope.clone()));
        }

        let (auth_url, csrf_token) = auth_request.set_pkce_challenge(pkce_challenge).url();

        Ok(AuthorizationRequest {
            url: auth_url.to_string(),
            state: csrf_token.secret().clone(),
            pkce_verifier: pkce_verifier.secret().clone(),
        })
    }

    async fn exchange_code(
        &self,
        code: &str,
        pkce_verifier: &str,
    ) -> Result<TokenGrant, OAuthError> {
        let token = self
            .client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .set_pkce_verifier(PkceCodeVerifier::new(pkce_verifier.to_string()))
            .request_async(async_http_client)
            .await
            .map_err(|e| OAuthError::TokenExchange(classify_token_error(e).to_string()))?;

        let grant = grant_from_response(&token);
        if grant.refresh_token.is_none() {
            return Err(OAuthError::TokenExchange(
                "Provider did not issue a refresh token (offline access scope missing?)".to_string(),
            ));
        }

        Ok(grant)
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, OAuthError> {
        let token = self
            .client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
            .request_async(async_http_client)
            .await
            .map_err(classify_token_error)?;

        Ok(grant_from_response(&token))
    }

    async fn resolve_tenant(&self, access_token: &str) -> Result<String, OAuthError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct TenantEntry {
            tenant_id: String,
        }

        let response = self
            .http
            .get(&self.config.connections_url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| OAuthError::TenantDiscovery(format!("Request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(OAuthError::TenantDiscovery(format!(
                "Connections endpoint returned {}",
                response.status()
            )));
        }

        let tenants: Vec<TenantEntry> = response
            .json()
            .await
            .map_err(|e| OAuthError::TenantDiscovery(format!("Failed to parse tenants: {}", e)))?;

        tenants
            .into_iter()
            .next()
            .map(|t| t.tenant_id)
            .ok_or_else(|| OAuthError::TenantDiscovery("No tenant authorized".to_string()))
    }
}

fn grant_from_response<T: TokenResponse<oauth2::basic::BasicTokenType>>(token: &T) -> TokenGrant {
    let lifetime = token
        .expires_in()
        .and_then(|d| Duration::from_std(d).ok())
        .unwrap_or_else(|| Duration::seconds(DEFAULT_TOKEN_LIFETIME_SECS));

    TokenGrant {
        access_token: token.access_token().secret().clone(),
        refresh_token: token.refresh_token().map(|t| t.secret().clone()),
        expires_at: Utc::now() + lifetime,
    }
}

/// Map a token endpoint failure onto terminal/transient
fn classify_token_error<RE>(err: RequestTokenError<RE, BasicErrorResponse>) -> OAuthError
where
    RE: std::error::Error + 'static,
{
    match err {
        RequestTokenError::ServerResponse(response) => {
            let description = response
                .error_description()
                .cloned()
                .unwrap_or_default();
            match response.error() {
                BasicErrorResponseType::InvalidGrant => {
                    OAuthError::Revoked(format!("invalid_grant {}", description).trim().to_string())
                }
                BasicErrorResponseType::Extension(code)
                    if code.to_ascii_lowercase().contains("revoked") =>
                {
                    OAuthError::Revoked(format!("{} {}", code, description).trim().to_string())
                }
                other => OAuthError::Transient(
                    format!("{} {}", AsRef::<str>::as_ref(other), description)
                        .trim()
                        .to_string(),
                ),
            }
        }
        RequestTokenError::Request(e) => OAuthError::Transient(format!("Request failed: {}", e)),
        RequestTokenError::Parse(e, _) => {
            OAuthError::Transient(format!("Unparseable token response: {}", e))
        }
        RequestTokenError::Other(message) => OAuthError::Transient(message),
    }
}
