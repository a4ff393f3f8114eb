//! Session configuration
//!
//! [`SessionConfig`] is plain serde data; [`loader`] fills it from the
//! environment or a TOML/JSON file.

pub mod loader;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_common::auth::types::{DEFAULT_AUTHORIZE_PATH, DEFAULT_REVOKE_PATH, DEFAULT_TOKEN_PATH};
use tether_common::auth::OAuthConfig;
use tether_common::error::{CommonError, CommonResult};
use url::Url;

use crate::background::MIN_BACKGROUND_INTERVAL;

pub use loader::{load, load_from_env, load_from_file, probe_config_paths};

/// Default renewal buffer in seconds
pub const DEFAULT_RENEWAL_BUFFER_SECS: i64 = 300;
/// Default age after which an outstanding authorization flow is abandoned
pub const DEFAULT_AUTH_FLOW_STALENESS_SECS: i64 = 600;
/// Default background renewal interval in seconds
pub const DEFAULT_BACKGROUND_INTERVAL_SECS: u64 = 900;
/// Default keychain service name
pub const DEFAULT_KEYCHAIN_SERVICE: &str = "tether.session";

fn default_renewal_buffer_secs() -> i64 {
    DEFAULT_RENEWAL_BUFFER_SECS
}

fn default_auth_flow_staleness_secs() -> i64 {
    DEFAULT_AUTH_FLOW_STALENESS_SECS
}

fn default_background_interval_secs() -> u64 {
    DEFAULT_BACKGROUND_INTERVAL_SECS
}

fn default_keychain_service() -> String {
    DEFAULT_KEYCHAIN_SERVICE.to_string()
}

fn default_authorize_path() -> String {
    DEFAULT_AUTHORIZE_PATH.to_string()
}

fn default_token_path() -> String {
    DEFAULT_TOKEN_PATH.to_string()
}

fn default_revoke_path() -> Option<String> {
    Some(DEFAULT_REVOKE_PATH.to_string())
}

/// Default scopes; `offline_access` is what gets a refresh token issued
pub fn default_scopes() -> Vec<String> {
    ["openid", "profile", "email", "offline_access"].iter().map(ToString::to_string).collect()
}

/// Session manager configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub oauth: OAuthSettings,

    /// Renew this many seconds before the hard expiry
    #[serde(default = "default_renewal_buffer_secs")]
    pub renewal_buffer_secs: i64,

    /// Outstanding authorization flows older than this are discarded on restore
    #[serde(default = "default_auth_flow_staleness_secs")]
    pub auth_flow_staleness_secs: i64,

    /// Background renewal interval; raised to the 15 minute platform floor
    #[serde(default = "default_background_interval_secs")]
    pub background_interval_secs: u64,

    /// Keychain service the session records are stored under
    #[serde(default = "default_keychain_service")]
    pub keychain_service: String,
}

/// Identity provider settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthSettings {
    /// Issuer base URL, e.g. `https://login.example.com`
    pub issuer: String,

    #[serde(default = "default_authorize_path")]
    pub authorize_path: String,

    #[serde(default = "default_token_path")]
    pub token_path: String,

    /// `None` disables revocation on logout
    #[serde(default = "default_revoke_path")]
    pub revoke_path: Option<String>,

    pub client_id: String,

    /// Custom-scheme redirect URI, e.g. `tether://callback`
    pub redirect_uri: String,

    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,
}

impl OAuthSettings {
    /// Settings with default endpoint paths and scopes
    pub fn new(
        issuer: impl Into<String>,
        client_id: impl Into<String>,
        redirect_uri: impl Into<String>,
    ) -> Self {
        Self {
            issuer: issuer.into(),
            authorize_path: default_authorize_path(),
            token_path: default_token_path(),
            revoke_path: default_revoke_path(),
            client_id: client_id.into(),
            redirect_uri: redirect_uri.into(),
            scopes: default_scopes(),
            audience: None,
        }
    }

    /// Provider configuration for the OAuth client
    #[must_use]
    pub fn to_oauth_config(&self) -> OAuthConfig {
        OAuthConfig::new(
            self.issuer.clone(),
            self.client_id.clone(),
            self.redirect_uri.clone(),
            self.scopes.clone(),
            self.audience.clone(),
        )
        .with_endpoints(self.authorize_path.clone(), self.token_path.clone(), self.revoke_path.clone())
    }
}

impl SessionConfig {
    /// Configuration with default timings for `oauth`
    #[must_use]
    pub fn new(oauth: OAuthSettings) -> Self {
        Self {
            oauth,
            renewal_buffer_secs: DEFAULT_RENEWAL_BUFFER_SECS,
            auth_flow_staleness_secs: DEFAULT_AUTH_FLOW_STALENESS_SECS,
            background_interval_secs: DEFAULT_BACKGROUND_INTERVAL_SECS,
            keychain_service: default_keychain_service(),
        }
    }

    /// Effective background interval after applying the platform floor
    #[must_use]
    pub fn background_interval(&self) -> Duration {
        Duration::from_secs(self.background_interval_secs).max(MIN_BACKGROUND_INTERVAL)
    }

    /// Check the configuration before it is used
    ///
    /// # Errors
    /// Returns `CommonError::Config` naming the offending field.
    pub fn validate(&self) -> CommonResult<()> {
        if self.oauth.client_id.trim().is_empty() {
            return Err(CommonError::config_field("oauth.client_id", "must not be empty"));
        }

        let issuer = Url::parse(&self.oauth.issuer).map_err(|e| {
            CommonError::config_field("oauth.issuer", format!("not a valid URL: {e}"))
        })?;
        if !matches!(issuer.scheme(), "https" | "http") {
            return Err(CommonError::config_field("oauth.issuer", "must be an http(s) URL"));
        }

        Url::parse(&self.oauth.redirect_uri).map_err(|e| {
            CommonError::config_field("oauth.redirect_uri", format!("not a valid URI: {e}"))
        })?;

        if self.renewal_buffer_secs <= 0 {
            return Err(CommonError::config_field("renewal_buffer_secs", "must be positive"));
        }
        if self.auth_flow_staleness_secs <= 0 {
            return Err(CommonError::config_field("auth_flow_staleness_secs", "must be positive"));
        }
        if self.keychain_service.trim().is_empty() {
            return Err(CommonError::config_field("keychain_service", "must not be empty"));
        }

        Ok(())
    }
}
