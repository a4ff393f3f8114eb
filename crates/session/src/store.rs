//! Typed credential persistence
//!
//! Wraps a [`SecureStore`] with the four session records:
//!
//! | Key | Value |
//! |-----|-------|
//! | `auth_tokens` | `TokenSet` JSON |
//! | `user_info` | `IdentityClaims` JSON |
//! | `token_refresh_time` | next renewal, epoch milliseconds as a decimal string |
//! | `auth_state` | `AuthFlowMarker` JSON |
//!
//! Writes are ordered (tokens, claims, schedule, then the marker is cleared)
//! so a reader never sees a schedule without the token set it belongs to.
//! Records that fail to parse are deleted and read as absent.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tether_common::auth::TokenSet;
use tether_common::security::{KeychainError, SecureStore};
use tracing::{debug, warn};

use crate::codec::IdentityClaims;
use crate::schedule::RenewalSchedule;

/// Storage keys
pub mod keys {
    pub const AUTH_TOKENS: &str = "auth_tokens";
    pub const USER_INFO: &str = "user_info";
    pub const TOKEN_REFRESH_TIME: &str = "token_refresh_time";
    pub const AUTH_STATE: &str = "auth_state";

    /// Every key owned by a session
    pub const ALL: [&str; 4] = [AUTH_TOKENS, USER_INFO, TOKEN_REFRESH_TIME, AUTH_STATE];
}

/// Persisted marker for an outstanding authorization flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthFlowMarker {
    pub in_progress: bool,
    /// Epoch milliseconds at which the flow started
    pub started_at: i64,
}

impl AuthFlowMarker {
    /// Marker for a flow starting at `now_millis`
    #[must_use]
    pub fn started(now_millis: i64) -> Self {
        Self { in_progress: true, started_at: now_millis }
    }

    /// Whether the flow is older than the staleness window
    #[must_use]
    pub fn is_stale(&self, now_millis: i64, staleness_secs: i64) -> bool {
        !self.in_progress
            || now_millis.saturating_sub(self.started_at) > staleness_secs.saturating_mul(1000)
    }
}

/// Session records on top of a [`SecureStore`]
#[derive(Clone)]
pub struct CredentialStore {
    backend: Arc<dyn SecureStore>,
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore").finish_non_exhaustive()
    }
}

impl CredentialStore {
    pub fn new(backend: Arc<dyn SecureStore>) -> Self {
        Self { backend }
    }

    /// Persisted token set
    pub async fn load_tokens(&self) -> Result<Option<TokenSet>, KeychainError> {
        self.load_json(keys::AUTH_TOKENS).await
    }

    /// Persisted identity claims
    pub async fn load_claims(&self) -> Result<Option<IdentityClaims>, KeychainError> {
        self.load_json(keys::USER_INFO).await
    }

    /// Persisted authorization-flow marker
    pub async fn load_marker(&self) -> Result<Option<AuthFlowMarker>, KeychainError> {
        self.load_json(keys::AUTH_STATE).await
    }

    /// Persisted renewal schedule
    pub async fn load_schedule(&self) -> Result<Option<RenewalSchedule>, KeychainError> {
        let Some(raw) = self.backend.get(keys::TOKEN_REFRESH_TIME).await? else {
            return Ok(None);
        };

        match raw.trim().parse::<i64>() {
            Ok(next_renewal_at) => Ok(Some(RenewalSchedule { next_renewal_at })),
            Err(e) => {
                warn!(key = keys::TOKEN_REFRESH_TIME, error = %e, "Discarding corrupt record");
                self.backend.delete(keys::TOKEN_REFRESH_TIME).await?;
                Ok(None)
            }
        }
    }

    /// Persist a new or renewed session
    ///
    /// Missing claims delete any previous `user_info` so stale claims never
    /// outlive their token set.
    pub async fn save_session(
        &self,
        tokens: &TokenSet,
        claims: Option<&IdentityClaims>,
        schedule: &RenewalSchedule,
    ) -> Result<(), KeychainError> {
        self.backend.set(keys::AUTH_TOKENS, &serde_json::to_string(tokens)?).await?;
        match claims {
            Some(claims) => {
                self.backend.set(keys::USER_INFO, &serde_json::to_string(claims)?).await?;
            }
            None => self.backend.delete(keys::USER_INFO).await?,
        }
        self.backend
            .set(keys::TOKEN_REFRESH_TIME, &schedule.next_renewal_at.to_string())
            .await?;
        self.backend.delete(keys::AUTH_STATE).await?;

        debug!(next_renewal_at = schedule.next_renewal_at, "Session persisted");
        Ok(())
    }

    /// Persist the authorization-flow marker
    pub async fn save_marker(&self, marker: &AuthFlowMarker) -> Result<(), KeychainError> {
        self.backend.set(keys::AUTH_STATE, &serde_json::to_string(marker)?).await
    }

    /// Remove the authorization-flow marker
    pub async fn clear_marker(&self) -> Result<(), KeychainError> {
        self.backend.delete(keys::AUTH_STATE).await
    }

    /// Delete the token set and its derived records, keeping the flow marker
    pub async fn clear_session_records(&self) -> Result<(), KeychainError> {
        for key in [keys::AUTH_TOKENS, keys::USER_INFO, keys::TOKEN_REFRESH_TIME] {
            self.backend.delete(key).await?;
        }
        Ok(())
    }

    /// Delete every session key
    ///
    /// Keeps going after a failed delete and reports the first failure.
    pub async fn clear_all(&self) -> Result<(), KeychainError> {
        let mut first_error = None;
        for key in keys::ALL {
            if let Err(e) = self.backend.delete(key).await {
                warn!(key, error = %e, "Failed to delete session record");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                debug!("All session records deleted");
                Ok(())
            }
        }
    }

    async fn load_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, KeychainError> {
        let Some(raw) = self.backend.get(key).await? else {
            return Ok(None);
        };

        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(key, error = %e, "Discarding corrupt record");
                self.backend.delete(key).await?;
                Ok(None)
            }
        }
    }
}
