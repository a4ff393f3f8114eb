//! OAuth 2.0 client implementation with PKCE support
//!
//! Handles the HTTP side of the authorization-code flow:
//! - authorization URL building (with a fresh PKCE challenge)
//! - authorization code exchange
//! - refresh-token grant
//! - RFC 7009 token revocation

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use thiserror::Error;
use tracing::{debug, warn};

use super::pkce::PKCEChallenge;
use super::traits::OAuthClientTrait;
use super::types::{OAuthConfig, OAuthError, TokenResponse};
use crate::error::{ErrorClassification, ErrorSeverity};

/// Provider error codes that mean the grant itself is no longer usable
pub const AUTH_FAILURE_CODES: &[&str] =
    &["invalid_grant", "invalid_token", "unauthorized_client", "invalid_client", "access_denied"];

/// Provider error codes that signal a temporary condition
const TRANSIENT_CODES: &[&str] = &["temporarily_unavailable", "server_error", "slow_down"];

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Error type for OAuth client operations
#[derive(Debug, Error)]
pub enum OAuthClientError {
    /// HTTP request failed before a response arrived
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    /// OAuth server returned a standard error body
    #[error("OAuth error ({status}): {error}")]
    Provider { status: u16, error: OAuthError },

    /// OAuth server returned a non-success status without a parsable body
    #[error("Unexpected HTTP status {status}")]
    Http { status: u16 },

    /// Failed to parse response
    #[error("Parse error: {0}")]
    ParseError(String),

    /// No refresh token available
    #[error("No refresh token available")]
    NoRefreshToken,

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl OAuthClientError {
    /// Whether the provider rejected the grant or client outright
    ///
    /// Only these failures justify discarding the stored session; everything
    /// else keeps the current tokens for a later retry.
    #[must_use]
    pub fn is_auth_failure(&self) -> bool {
        match self {
            Self::Provider { status, error } => {
                *status == StatusCode::UNAUTHORIZED.as_u16()
                    || AUTH_FAILURE_CODES.contains(&error.error.as_str())
            }
            Self::Http { status } => *status == StatusCode::UNAUTHORIZED.as_u16(),
            _ => false,
        }
    }

    /// Provider error code, when the server sent one
    #[must_use]
    pub fn provider_code(&self) -> Option<&str> {
        match self {
            Self::Provider { error, .. } => Some(error.error.as_str()),
            _ => None,
        }
    }
}

fn is_transient_status(status: u16) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS.as_u16() || (500..600).contains(&status)
}

impl ErrorClassification for OAuthClientError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::RequestFailed(_) => true,
            Self::Provider { status, error } => {
                !self.is_auth_failure()
                    && (is_transient_status(*status)
                        || TRANSIENT_CODES.contains(&error.error.as_str()))
            }
            Self::Http { status } => is_transient_status(*status),
            _ => false,
        }
    }

    fn severity(&self) -> ErrorSeverity {
        if self.is_retryable() {
            ErrorSeverity::Warning
        } else {
            ErrorSeverity::Error
        }
    }

    fn is_critical(&self) -> bool {
        false
    }

    fn retry_after(&self) -> Option<Duration> {
        self.is_retryable().then_some(Duration::from_secs(30))
    }
}

/// Authorization request ready to hand to the browser
///
/// The caller keeps `challenge` until the redirect arrives: its `state`
/// validates the callback and its `code_verifier` completes the exchange.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub url: String,
    pub challenge: PKCEChallenge,
}

/// OAuth 2.0 client with PKCE support
///
/// Implements RFC 6749 (OAuth 2.0), RFC 7636 (PKCE) and RFC 7009
/// (revocation) against a single provider configuration.
#[derive(Debug, Clone)]
pub struct OAuthClient {
    config: OAuthConfig,
    client: Option<Client>,
}

impl OAuthClient {
    /// Create a new OAuth client with the given configuration
    ///
    /// Setting `TETHER_OAUTH_DISABLE_HTTP` builds a client that refuses all
    /// network calls; `TETHER_DISABLE_PROXY` bypasses system proxies.
    ///
    /// ```
    /// use tether_common::auth::{OAuthClient, OAuthConfig};
    ///
    /// let config = OAuthConfig::new(
    ///     "https://login.example.com",
    ///     "client_id",
    ///     "tether://callback",
    ///     vec!["openid".to_string()],
    ///     None,
    /// );
    /// let client = OAuthClient::new(config);
    /// assert_eq!(client.redirect_uri(), "tether://callback");
    /// ```
    #[must_use]
    pub fn new(config: OAuthConfig) -> Self {
        let client = if std::env::var_os("TETHER_OAUTH_DISABLE_HTTP").is_some() {
            None
        } else {
            let builder = Client::builder().timeout(REQUEST_TIMEOUT);
            let builder = if std::env::var_os("TETHER_DISABLE_PROXY").is_some() {
                builder.no_proxy()
            } else {
                builder
            };
            Some(builder.build().unwrap_or_else(|_| Client::new()))
        };

        Self { config, client }
    }

    /// Create a client around an existing `reqwest::Client`
    #[must_use]
    pub fn with_http_client(config: OAuthConfig, client: Client) -> Self {
        Self { config, client: Some(client) }
    }

    /// Build the browser authorization URL with a fresh PKCE challenge
    #[must_use]
    pub fn authorization_request(&self) -> AuthorizationRequest {
        let challenge = PKCEChallenge::generate();

        let mut params = vec![
            ("response_type", "code".to_string()),
            ("client_id", self.config.client_id.clone()),
            ("redirect_uri", self.config.redirect_uri.clone()),
            ("scope", self.config.scope_string()),
            ("state", challenge.state.clone()),
            ("code_challenge", challenge.code_challenge.clone()),
            ("code_challenge_method", challenge.challenge_method().to_string()),
        ];

        if let Some(audience) = &self.config.audience {
            params.push(("audience", audience.clone()));
        }

        let query_string = params
            .iter()
            .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&");

        let url = format!("{}?{}", self.config.authorization_url(), query_string);

        AuthorizationRequest { url, challenge }
    }

    /// Exchange an authorization code for tokens
    ///
    /// # Errors
    /// Returns the provider's error body, an HTTP failure, or a parse error.
    pub async fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
    ) -> Result<TokenResponse, OAuthClientError> {
        let params = [
            ("grant_type", "authorization_code"),
            ("client_id", self.config.client_id.as_str()),
            ("code", code),
            ("redirect_uri", self.config.redirect_uri.as_str()),
            ("code_verifier", code_verifier),
        ];

        debug!(endpoint = %self.config.token_url(), "Exchanging authorization code");
        let response = self.http()?.post(self.config.token_url()).form(&params).send().await?;
        Self::token_response(response).await
    }

    /// Refresh the access token using a refresh token
    ///
    /// # Errors
    /// Returns `NoRefreshToken` for an empty token, otherwise the provider or
    /// transport failure.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, OAuthClientError> {
        if refresh_token.is_empty() {
            return Err(OAuthClientError::NoRefreshToken);
        }

        let params = [
            ("grant_type", "refresh_token"),
            ("client_id", self.config.client_id.as_str()),
            ("refresh_token", refresh_token),
        ];

        debug!(endpoint = %self.config.token_url(), "Refreshing access token");
        let response = self.http()?.post(self.config.token_url()).form(&params).send().await?;
        Self::token_response(response).await
    }

    /// Revoke a token at the RFC 7009 endpoint
    ///
    /// A provider without a revocation endpoint is treated as success.
    ///
    /// # Errors
    /// Returns the transport failure or a non-success status.
    pub async fn revoke(
        &self,
        token: &str,
        token_type_hint: &str,
    ) -> Result<(), OAuthClientError> {
        let Some(url) = self.config.revocation_url() else {
            debug!("No revocation endpoint configured; skipping revocation");
            return Ok(());
        };

        let params = [
            ("client_id", self.config.client_id.as_str()),
            ("token", token),
            ("token_type_hint", token_type_hint),
        ];

        let response = self.http()?.post(url).form(&params).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        warn!(status = status.as_u16(), "Token revocation rejected");
        Err(Self::error_from(status, response).await)
    }

    /// Get the configured redirect URI
    #[must_use]
    pub fn redirect_uri(&self) -> &str {
        &self.config.redirect_uri
    }

    /// Get a reference to the OAuth configuration
    #[must_use]
    pub fn config(&self) -> &OAuthConfig {
        &self.config
    }

    fn http(&self) -> Result<&Client, OAuthClientError> {
        self.client
            .as_ref()
            .ok_or_else(|| OAuthClientError::ConfigError("HTTP client disabled".to_string()))
    }

    async fn token_response(response: Response) -> Result<TokenResponse, OAuthClientError> {
        let status = response.status();
        if !status.is_success() {
            return Err(Self::error_from(status, response).await);
        }

        response.json().await.map_err(|e| OAuthClientError::ParseError(e.to_string()))
    }

    async fn error_from(status: StatusCode, response: Response) -> OAuthClientError {
        let body = response.text().await.unwrap_or_default();
        match serde_json::from_str::<OAuthError>(&body) {
            Ok(error) => OAuthClientError::Provider { status: status.as_u16(), error },
            Err(_) => OAuthClientError::Http { status: status.as_u16() },
        }
    }
}

#[async_trait]
impl OAuthClientTrait for OAuthClient {
    fn authorization_request(&self) -> AuthorizationRequest {
        self.authorization_request()
    }

    async fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
    ) -> Result<TokenResponse, OAuthClientError> {
        self.exchange_code(code, code_verifier).await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, OAuthClientError> {
        self.refresh(refresh_token).await
    }

    async fn revoke(&self, token: &str, token_type_hint: &str) -> Result<(), OAuthClientError> {
        self.revoke(token, token_type_hint).await
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for auth::client.
    use super::*;

    fn create_test_config() -> OAuthConfig {
        OAuthConfig::new(
            "https://login.example.com",
            "test_client_id",
            "tether://callback",
            vec!["openid".to_string(), "profile".to_string()],
            Some("https://api.example.com".to_string()),
        )
    }

    fn provider_error(status: u16, code: &str) -> OAuthClientError {
        OAuthClientError::Provider {
            status,
            error: OAuthError { error: code.to_string(), error_description: None },
        }
    }

    /// Validates `OAuthClient::authorization_request` for the authorization
    /// url scenario.
    ///
    /// Assertions:
    /// - The URL targets the authorize endpoint with response_type=code.
    /// - The PKCE challenge, S256 method and state are embedded.
    /// - The audience is URL-encoded.
    #[test]
    fn test_authorization_request() {
        let client = OAuthClient::with_http_client(create_test_config(), Client::new());
        let request = client.authorization_request();
        let url = &request.url;

        assert!(url.starts_with("https://login.example.com/authorize?"));
        assert!(url.contains("response_type=code"));
        assert!(url.contains("client_id=test_client_id"));
        assert!(url.contains("redirect_uri=tether%3A%2F%2Fcallback"));
        assert!(url.contains(&format!("code_challenge={}", request.challenge.code_challenge)));
        assert!(url.contains("code_challenge_method=S256"));
        assert!(url.contains(&format!("state={}", request.challenge.state)));
        assert!(url.contains("audience=https%3A%2F%2Fapi.example.com"));
        assert!(!url.contains(&request.challenge.code_verifier));
    }

    /// Validates `OAuthClient::refresh` rejects an empty refresh token without
    /// any network call.
    #[tokio::test]
    async fn test_refresh_with_empty_token() {
        let client = OAuthClient::with_http_client(create_test_config(), Client::new());
        let result = client.refresh("").await;
        assert!(matches!(result, Err(OAuthClientError::NoRefreshToken)));
    }

    /// Validates auth-failure classification of provider responses.
    ///
    /// Assertions:
    /// - Grant and client rejections are auth failures and not retryable.
    /// - A bare HTTP 401 is an auth failure.
    /// - 5xx and `temporarily_unavailable` are retryable, not auth failures.
    #[test]
    fn test_error_classification() {
        for code in AUTH_FAILURE_CODES {
            let err = provider_error(400, code);
            assert!(err.is_auth_failure(), "{code} should be an auth failure");
            assert!(!err.is_retryable());
        }

        assert!(OAuthClientError::Http { status: 401 }.is_auth_failure());
        assert!(provider_error(401, "whatever").is_auth_failure());

        assert!(provider_error(503, "server_error").is_retryable());
        assert!(provider_error(400, "temporarily_unavailable").is_retryable());
        assert!(OAuthClientError::Http { status: 502 }.is_retryable());
        assert!(!OAuthClientError::Http { status: 502 }.is_auth_failure());
        assert!(!provider_error(400, "invalid_request").is_retryable());
        assert_eq!(provider_error(400, "invalid_grant").provider_code(), Some("invalid_grant"));
    }
}
