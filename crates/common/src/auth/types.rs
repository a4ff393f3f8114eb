//! OAuth 2.0 types and structures
//!
//! Token sets, token endpoint responses, provider configuration and the
//! standard error body (RFC 6749 §5.2).

use std::fmt;

use serde::{Deserialize, Serialize};

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// Current credential set held by a session
///
/// `issued_at + expires_in` is the hard expiry instant. Without a refresh
/// token the set cannot be renewed and becomes terminal once expired.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSet {
    /// Access token for API authentication
    pub access_token: String,

    /// OIDC identity token (JWT) carrying the user's claims
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,

    /// Refresh token used for silent renewal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    /// Token type (normally "Bearer")
    #[serde(default = "default_token_type")]
    pub token_type: String,

    /// Granted scopes (space-separated)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,

    /// Epoch seconds at which the set was obtained
    pub issued_at: i64,

    /// Lifetime in seconds, counted from `issued_at`
    pub expires_in: i64,
}

// Token values stay out of logs even when a TokenSet is debug-printed.
impl fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSet")
            .field("access_token", &"<redacted>")
            .field("id_token", &self.id_token.as_ref().map(|_| "<redacted>"))
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("token_type", &self.token_type)
            .field("scope", &self.scope)
            .field("issued_at", &self.issued_at)
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

impl TokenSet {
    /// Build a set from an authorization-code exchange response
    #[must_use]
    pub fn from_response(response: TokenResponse, issued_at: i64) -> Self {
        Self {
            access_token: response.access_token,
            id_token: response.id_token,
            refresh_token: response.refresh_token,
            token_type: response.token_type,
            scope: response.scope,
            issued_at,
            expires_in: response.expires_in,
        }
    }

    /// Build the successor of `self` from a refresh-grant response
    ///
    /// Providers may omit `refresh_token` or `id_token` on refresh; the
    /// previous values are carried over so the session never loses them.
    #[must_use]
    pub fn renewed(&self, response: TokenResponse, issued_at: i64) -> Self {
        Self {
            access_token: response.access_token,
            id_token: response.id_token.or_else(|| self.id_token.clone()),
            refresh_token: response.refresh_token.or_else(|| self.refresh_token.clone()),
            token_type: response.token_type,
            scope: response.scope.or_else(|| self.scope.clone()),
            issued_at,
            expires_in: response.expires_in,
        }
    }

    /// Hard expiry instant in epoch seconds
    #[must_use]
    pub fn expires_at(&self) -> i64 {
        self.issued_at.saturating_add(self.expires_in)
    }

    /// `true` once `now` has reached the hard expiry
    #[must_use]
    pub fn is_expired(&self, now_secs: i64) -> bool {
        now_secs >= self.expires_at()
    }

    /// Epoch seconds at which renewal falls due
    ///
    /// The buffer is capped at half the lifetime, so a token that lives no
    /// longer than the buffer is still used for a while before renewal.
    #[must_use]
    pub fn renewal_due_at(&self, buffer_secs: i64) -> i64 {
        let buffer = buffer_secs.clamp(0, self.expires_in.max(0) / 2);
        self.expires_at().saturating_sub(buffer)
    }

    /// `true` when `now` falls inside the renewal buffer (or past expiry)
    #[must_use]
    pub fn needs_renewal(&self, now_secs: i64, buffer_secs: i64) -> bool {
        now_secs >= self.renewal_due_at(buffer_secs)
    }

    /// Seconds until the hard expiry (negative once expired)
    #[must_use]
    pub fn seconds_until_expiry(&self, now_secs: i64) -> i64 {
        self.expires_at().saturating_sub(now_secs)
    }

    /// Whether a non-empty refresh token is available
    #[must_use]
    pub fn can_renew(&self) -> bool {
        self.refresh_token.as_deref().is_some_and(|t| !t.is_empty())
    }
}

/// OAuth token response from the authorization server (RFC 6749 §5.1)
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    pub expires_in: i64,
    #[serde(default)]
    pub scope: Option<String>,
}

/// Default authorization endpoint path
pub const DEFAULT_AUTHORIZE_PATH: &str = "/authorize";
/// Default token endpoint path
pub const DEFAULT_TOKEN_PATH: &str = "/oauth/token";
/// Default revocation endpoint path
pub const DEFAULT_REVOKE_PATH: &str = "/oauth/revoke";

/// OAuth configuration for an authorization server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthConfig {
    /// Issuer base URL including scheme (e.g. `https://login.example.com`)
    pub issuer: String,

    /// Path of the authorization endpoint
    pub authorize_path: String,

    /// Path of the token endpoint
    pub token_path: String,

    /// Path of the RFC 7009 revocation endpoint, if the provider has one
    pub revoke_path: Option<String>,

    /// OAuth client ID
    pub client_id: String,

    /// Redirect URI registered for the app's custom scheme
    pub redirect_uri: String,

    /// OAuth scopes to request
    pub scopes: Vec<String>,

    /// OAuth audience (API identifier), used by some providers
    pub audience: Option<String>,
}

impl OAuthConfig {
    /// Create a configuration using the default endpoint paths
    #[must_use]
    pub fn new(
        issuer: impl Into<String>,
        client_id: impl Into<String>,
        redirect_uri: impl Into<String>,
        scopes: Vec<String>,
        audience: Option<String>,
    ) -> Self {
        Self {
            issuer: issuer.into(),
            authorize_path: DEFAULT_AUTHORIZE_PATH.to_string(),
            token_path: DEFAULT_TOKEN_PATH.to_string(),
            revoke_path: Some(DEFAULT_REVOKE_PATH.to_string()),
            client_id: client_id.into(),
            redirect_uri: redirect_uri.into(),
            scopes,
            audience,
        }
    }

    /// Override the endpoint paths
    #[must_use]
    pub fn with_endpoints(
        mut self,
        authorize_path: impl Into<String>,
        token_path: impl Into<String>,
        revoke_path: Option<String>,
    ) -> Self {
        self.authorize_path = authorize_path.into();
        self.token_path = token_path.into();
        self.revoke_path = revoke_path;
        self
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.issuer.trim_end_matches('/'), path.trim_start_matches('/'))
    }

    /// Get the authorization URL
    #[must_use]
    pub fn authorization_url(&self) -> String {
        self.endpoint(&self.authorize_path)
    }

    /// Get the token URL
    #[must_use]
    pub fn token_url(&self) -> String {
        self.endpoint(&self.token_path)
    }

    /// Get the revocation URL, if configured
    #[must_use]
    pub fn revocation_url(&self) -> Option<String> {
        self.revoke_path.as_deref().map(|path| self.endpoint(path))
    }

    /// Get scopes as space-separated string
    #[must_use]
    pub fn scope_string(&self) -> String {
        self.scopes.join(" ")
    }
}

/// OAuth error response from authorization server (RFC 6749 §5.2)
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OAuthError {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
}

impl fmt::Display for OAuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error_description {
            Some(desc) => write!(f, "{}: {}", self.error, desc),
            None => write!(f, "{}", self.error),
        }
    }
}

impl std::error::Error for OAuthError {}
