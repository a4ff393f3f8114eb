//! Session error type

use std::time::Duration;

use tether_common::auth::OAuthClientError;
use tether_common::error::{CommonError, ErrorClassification, ErrorSeverity};
use tether_common::security::KeychainError;
use thiserror::Error;

/// Result alias for session operations
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors surfaced by the session controller and its collaborators
///
/// `Clone` so a single renewal outcome can be shared by every caller waiting
/// on it.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    /// `login()` called while another authorization flow is outstanding
    #[error("An authorization flow is already in progress")]
    AlreadyInProgress,

    /// Redirect callback arrived with no flow waiting for it
    #[error("No authorization flow is pending")]
    NoPendingFlow,

    /// Redirect callback carried a state that does not match the pending flow
    #[error("Authorization callback state does not match the pending flow")]
    StateMismatch,

    /// Redirect URI could not be interpreted
    #[error("Invalid redirect callback: {0}")]
    InvalidRedirect(String),

    /// The user cancelled the authorization flow
    #[error("Login was cancelled")]
    Cancelled,

    /// The host could not open the authorization URL
    #[error("Could not launch authorization: {0}")]
    LaunchFailed(String),

    /// The authorization server reported an error on the redirect
    #[error("Authorization failed: {error}")]
    Authorization { error: String, description: Option<String> },

    /// The provider rejected the grant or client; the session is over
    #[error("Identity provider rejected the credentials: {0}")]
    AuthRejected(String),

    /// Network failure or provider outage; worth retrying later
    #[error("Token request failed temporarily: {0}")]
    Transient(String),

    /// Token endpoint failure that is neither transient nor a rejection
    #[error("Token request failed: {0}")]
    TokenRequest(String),

    /// Operation requires an authenticated session
    #[error("Not authenticated")]
    NotAuthenticated,

    /// The session has no refresh token, so it cannot be renewed
    #[error("No refresh token available")]
    NoRefreshToken,

    /// The session was ended while the operation was in flight
    #[error("Session ended while the operation was in flight")]
    SessionEnded,

    /// Secure storage failure
    #[error("Credential storage failed: {0}")]
    Storage(String),

    /// Host background scheduler failure
    #[error("Background scheduling failed: {0}")]
    Scheduling(String),

    #[error(transparent)]
    Common(#[from] CommonError),
}

impl SessionError {
    /// Whether this failure means the user has to sign in again
    #[must_use]
    pub fn requires_reauthentication(&self) -> bool {
        matches!(self, Self::AuthRejected(_))
    }
}

impl From<OAuthClientError> for SessionError {
    fn from(err: OAuthClientError) -> Self {
        if err.is_auth_failure() {
            Self::AuthRejected(err.to_string())
        } else if matches!(err, OAuthClientError::NoRefreshToken) {
            Self::NoRefreshToken
        } else if err.is_retryable() {
            Self::Transient(err.to_string())
        } else {
            Self::TokenRequest(err.to_string())
        }
    }
}

impl From<KeychainError> for SessionError {
    fn from(err: KeychainError) -> Self {
        Self::Storage(err.to_string())
    }
}

impl ErrorClassification for SessionError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Transient(_) | Self::Storage(_) => true,
            Self::Common(err) => err.is_retryable(),
            _ => false,
        }
    }

    fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Cancelled | Self::NotAuthenticated | Self::SessionEnded => ErrorSeverity::Info,
            Self::AlreadyInProgress | Self::NoPendingFlow | Self::Transient(_) => {
                ErrorSeverity::Warning
            }
            Self::StateMismatch | Self::AuthRejected(_) => ErrorSeverity::Warning,
            Self::Common(err) => err.severity(),
            _ => ErrorSeverity::Error,
        }
    }

    fn is_critical(&self) -> bool {
        matches!(self, Self::Common(err) if err.is_critical())
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Transient(_) => Some(Duration::from_secs(30)),
            Self::Common(err) => err.retry_after(),
            _ => None,
        }
    }
}
