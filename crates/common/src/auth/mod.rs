//! OAuth 2.0 + PKCE primitives
//!
//! Provider-facing building blocks for public clients (desktop and mobile
//! apps) that authenticate with the authorization-code flow.
//!
//! # Features
//!
//! - **PKCE Flow**: RFC 7636 compliant Proof Key for Code Exchange
//! - **Token Sets**: expiry arithmetic and refresh-response merging
//! - **HTTP Client**: code exchange, refresh grant and RFC 7009 revocation
//! - **Error Classification**: separates rejected grants from transient
//!   failures so callers know when a session is really over
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐
//! │  OAuthClientTrait    │  seam consumed by the session layer
//! └──────────┬───────────┘
//!            │
//!            ├──► OAuthClient     (reqwest, form-encoded grants)
//!            │         │
//!            │         └──► PKCE utilities  (challenge + state)
//!            │
//!            └──► MockOAuthClient (tests, `test-utils` feature)
//! ```
//!
//! # Usage Example
//!
//! ```no_run
//! use tether_common::auth::{OAuthClient, OAuthConfig, TokenSet};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = OAuthConfig::new(
//!     "https://login.example.com",
//!     "your_client_id",
//!     "tether://callback",
//!     vec!["openid".to_string(), "profile".to_string(), "offline_access".to_string()],
//!     None,
//! );
//! let client = OAuthClient::new(config);
//!
//! let request = client.authorization_request();
//! // ... open request.url, wait for the redirect carrying `code` ...
//! let response = client.exchange_code("authorization_code", &request.challenge.code_verifier).await?;
//! let tokens = TokenSet::from_response(response, chrono::Utc::now().timestamp());
//! println!("Logged in, token expires at {}", tokens.expires_at());
//! # Ok(())
//! # }
//! ```
//!
//! # Module Organization
//!
//! - **[`types`]**: `TokenSet`, `TokenResponse`, `OAuthConfig`, `OAuthError`
//! - **[`pkce`]**: PKCE challenge generation and state validation
//! - **[`client`]**: OAuth HTTP client
//! - **[`traits`]**: `OAuthClientTrait` seam

pub mod client;
pub mod pkce;
pub mod traits;
pub mod types;

pub use client::{AuthorizationRequest, OAuthClient, OAuthClientError, AUTH_FAILURE_CODES};
pub use pkce::{
    generate_code_challenge, generate_code_verifier, generate_state, validate_state, PKCEChallenge,
};
pub use traits::OAuthClientTrait;
pub use types::{OAuthConfig, OAuthError, TokenResponse, TokenSet};
