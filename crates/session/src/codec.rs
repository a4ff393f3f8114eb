//! Identity token decoding
//!
//! Turns an OIDC identity token into [`IdentityClaims`]. Only the payload
//! segment is read; the signature is not verified because the token comes
//! straight from the token endpoint over TLS.
//!
//! Providers disagree on claim names, so each field is looked up through a
//! list of aliases:
//!
//! | Field | Claims tried, in order |
//! |-------|------------------------|
//! | `subject_id` | `sub` |
//! | `api_key` | `custom:apiKey`, `apiKey`, `api_key` |
//! | `user_name` | `userName`, `cognito:username`, `preferred_username`, `username` |
//! | `display_name` | `name`, `displayName`, `nickname`, `given_name`, then `user_name` |
//! | `email` | `email` (optional) |
//! | `expires_at` | `exp` |

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tether_common::auth::TokenSet;
use thiserror::Error;
use tracing::warn;

const API_KEY_CLAIMS: &[&str] = &["custom:apiKey", "apiKey", "api_key"];
const USER_NAME_CLAIMS: &[&str] = &["userName", "cognito:username", "preferred_username", "username"];
const DISPLAY_NAME_CLAIMS: &[&str] = &["name", "displayName", "nickname", "given_name"];

/// Claims extracted from the identity token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityClaims {
    pub subject_id: String,
    pub api_key: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub user_name: String,
    /// Identity token expiry, epoch seconds
    pub expires_at: i64,
}

/// Reasons an identity token could not be decoded
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("Token is not a three-part JWT")]
    Malformed,

    #[error("Token payload is not valid base64url: {0}")]
    Base64(String),

    #[error("Token payload is not a JSON object: {0}")]
    Json(String),

    #[error("Required claim missing: {0}")]
    MissingClaim(&'static str),

    #[error("Claim has an unexpected type: {0}")]
    InvalidClaim(&'static str),
}

/// Decode an identity token into its claims
///
/// # Errors
/// Returns a [`DecodeError`] for anything that is not a JWT carrying the
/// required claims. Never panics.
pub fn decode(identity_token: &str) -> Result<IdentityClaims, DecodeError> {
    let mut segments = identity_token.split('.');
    let (Some(_header), Some(payload), Some(_signature), None) =
        (segments.next(), segments.next(), segments.next(), segments.next())
    else {
        return Err(DecodeError::Malformed);
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| DecodeError::Base64(e.to_string()))?;

    let claims = match serde_json::from_slice::<Value>(&bytes) {
        Ok(Value::Object(map)) => map,
        Ok(_) => return Err(DecodeError::Json("payload is not an object".to_string())),
        Err(e) => return Err(DecodeError::Json(e.to_string())),
    };

    let subject_id = string_claim(&claims, &["sub"], "sub")?
        .ok_or(DecodeError::MissingClaim("sub"))?;
    let api_key = string_claim(&claims, API_KEY_CLAIMS, "api_key")?
        .ok_or(DecodeError::MissingClaim("api_key"))?;
    let user_name = string_claim(&claims, USER_NAME_CLAIMS, "user_name")?
        .ok_or(DecodeError::MissingClaim("user_name"))?;
    let display_name =
        string_claim(&claims, DISPLAY_NAME_CLAIMS, "display_name")?.unwrap_or_else(|| user_name.clone());
    let email = string_claim(&claims, &["email"], "email")?;
    let expires_at = epoch_claim(&claims, "exp")?;

    Ok(IdentityClaims { subject_id, api_key, display_name, email, user_name, expires_at })
}

/// Claims for the identity token carried by `tokens`, if it decodes
///
/// A missing or undecodable identity token yields `None`; the token set
/// itself stays usable for API calls.
pub fn claims_for(tokens: &TokenSet) -> Option<IdentityClaims> {
    let id_token = tokens.id_token.as_deref()?;
    match decode(id_token) {
        Ok(claims) => Some(claims),
        Err(e) => {
            warn!(error = %e, "Identity token could not be decoded; continuing without claims");
            None
        }
    }
}

fn string_claim(
    claims: &Map<String, Value>,
    names: &[&str],
    field: &'static str,
) -> Result<Option<String>, DecodeError> {
    for name in names {
        match claims.get(*name) {
            Some(Value::String(s)) if !s.is_empty() => return Ok(Some(s.clone())),
            Some(Value::String(_) | Value::Null) | None => {}
            Some(_) => return Err(DecodeError::InvalidClaim(field)),
        }
    }
    Ok(None)
}

fn epoch_claim(claims: &Map<String, Value>, name: &'static str) -> Result<i64, DecodeError> {
    match claims.get(name) {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64))
            .ok_or(DecodeError::InvalidClaim(name)),
        Some(Value::String(s)) => s.trim().parse().map_err(|_| DecodeError::InvalidClaim(name)),
        Some(_) => Err(DecodeError::InvalidClaim(name)),
        None => Err(DecodeError::MissingClaim(name)),
    }
}
