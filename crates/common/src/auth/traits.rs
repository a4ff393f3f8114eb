//! Traits for OAuth operations
//!
//! Abstracts the identity provider so the session layer can be driven by a
//! mock in tests and by [`super::OAuthClient`] in production.

use async_trait::async_trait;

use super::client::{AuthorizationRequest, OAuthClientError};
use super::types::TokenResponse;

/// Trait for OAuth client operations
#[async_trait]
pub trait OAuthClientTrait: Send + Sync {
    /// Build a browser authorization request with a fresh PKCE challenge
    fn authorization_request(&self) -> AuthorizationRequest;

    /// Exchange an authorization code for tokens
    ///
    /// # Errors
    /// Returns error if the token exchange fails or the response is malformed
    async fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
    ) -> Result<TokenResponse, OAuthClientError>;

    /// Obtain a new token set with the refresh-token grant
    ///
    /// # Errors
    /// Returns error if refresh fails or the token is invalid/revoked
    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, OAuthClientError>;

    /// Revoke a token (RFC 7009)
    ///
    /// # Errors
    /// Returns error if the revocation endpoint rejects the request
    async fn revoke(&self, token: &str, token_type_hint: &str) -> Result<(), OAuthClientError>;
}
