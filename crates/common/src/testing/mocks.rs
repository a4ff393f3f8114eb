//! Mock implementations of the provider and storage seams
//!
//! Both mocks are cheap to clone; clones share state so a test can keep a
//! handle for assertions after handing one to the code under test.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::auth::{
    AuthorizationRequest, OAuthClientError, OAuthClientTrait, OAuthError, PKCEChallenge,
    TokenResponse,
};
use crate::security::{KeychainError, SecureStore};

/// In-memory keychain for tests
#[derive(Debug, Clone, Default)]
pub struct MockKeychainProvider {
    storage: Arc<Mutex<HashMap<String, String>>>,
    fail_writes: Arc<Mutex<bool>>,
    write_delay: Arc<Mutex<Duration>>,
    service_name: String,
}

impl MockKeychainProvider {
    /// Create a new mock keychain provider with a service name for namespacing.
    pub fn new(service_name: impl Into<String>) -> Self {
        Self { service_name: service_name.into(), ..Self::default() }
    }

    /// Service name this mock stands in for
    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Make every subsequent `set` and `delete` fail with `AccessFailed`
    pub fn set_fail_writes(&self, fail: bool) {
        *self.fail_writes.lock() = fail;
    }

    /// Hold every `set` for `delay` after its value is stored, to widen race windows
    pub fn set_write_delay(&self, delay: Duration) {
        *self.write_delay.lock() = delay;
    }

    /// Raw value stored under `key`
    #[must_use]
    pub fn raw(&self, key: &str) -> Option<String> {
        self.storage.lock().get(key).cloned()
    }

    /// Write a raw value, bypassing failure injection
    pub fn insert_raw(&self, key: &str, value: &str) {
        self.storage.lock().insert(key.to_string(), value.to_string());
    }

    /// Whether `key` is present
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.storage.lock().contains_key(key)
    }

    /// Number of stored entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.storage.lock().len()
    }

    /// Whether the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.storage.lock().is_empty()
    }

    fn check_writable(&self) -> Result<(), KeychainError> {
        if *self.fail_writes.lock() {
            return Err(KeychainError::AccessFailed("mock keychain is read-only".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SecureStore for MockKeychainProvider {
    async fn get(&self, key: &str) -> Result<Option<String>, KeychainError> {
        Ok(self.storage.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), KeychainError> {
        self.check_writable()?;
        self.storage.lock().insert(key.to_string(), value.to_string());

        let delay = *self.write_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KeychainError> {
        self.check_writable()?;
        self.storage.lock().remove(key);
        Ok(())
    }
}

/// Scripted provider failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockFailure {
    /// Standard OAuth error body with the given status
    Provider { status: u16, code: String },
    /// Non-success status without an error body
    Http(u16),
}

impl MockFailure {
    /// `400 invalid_grant`, the usual "refresh token revoked" answer
    #[must_use]
    pub fn invalid_grant() -> Self {
        Self::Provider { status: 400, code: "invalid_grant".to_string() }
    }

    /// `503` without a body, a transient outage
    #[must_use]
    pub fn unavailable() -> Self {
        Self::Http(503)
    }

    fn into_error(self) -> OAuthClientError {
        match self {
            Self::Provider { status, code } => OAuthClientError::Provider {
                status,
                error: OAuthError { error: code, error_description: None },
            },
            Self::Http(status) => OAuthClientError::Http { status },
        }
    }
}

type Scripted = Result<TokenResponse, MockFailure>;

#[derive(Debug, Default)]
struct MockOAuthState {
    exchange_results: VecDeque<Scripted>,
    refresh_results: VecDeque<Scripted>,
    refresh_tokens_seen: Vec<String>,
    revoked: Vec<String>,
    revoke_failure: Option<MockFailure>,
    refresh_delay: Duration,
    last_request: Option<AuthorizationRequest>,
}

/// Scriptable OAuth provider
///
/// Results are consumed in FIFO order. When a queue is empty the mock
/// answers with a successful response carrying a numbered access token and
/// no refresh or identity token.
#[derive(Debug, Clone, Default)]
pub struct MockOAuthClient {
    state: Arc<Mutex<MockOAuthState>>,
    refresh_calls: Arc<AtomicUsize>,
    exchange_calls: Arc<AtomicUsize>,
}

impl MockOAuthClient {
    /// Create a new mock OAuth client with default state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the outcome of the next code exchange
    pub fn push_exchange(&self, result: Result<TokenResponse, MockFailure>) {
        self.state.lock().exchange_results.push_back(result);
    }

    /// Queue the outcome of the next refresh
    pub fn push_refresh(&self, result: Result<TokenResponse, MockFailure>) {
        self.state.lock().refresh_results.push_back(result);
    }

    /// Delay every refresh response, to widen race windows
    pub fn set_refresh_delay(&self, delay: Duration) {
        self.state.lock().refresh_delay = delay;
    }

    /// Make revocation fail
    pub fn set_revoke_failure(&self, failure: Option<MockFailure>) {
        self.state.lock().revoke_failure = failure;
    }

    /// Number of refresh requests issued
    #[must_use]
    pub fn refresh_count(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    /// Number of code exchanges issued
    #[must_use]
    pub fn exchange_count(&self) -> usize {
        self.exchange_calls.load(Ordering::SeqCst)
    }

    /// Refresh tokens presented so far, in call order
    #[must_use]
    pub fn refresh_tokens_seen(&self) -> Vec<String> {
        self.state.lock().refresh_tokens_seen.clone()
    }

    /// Tokens passed to `revoke`, in call order
    #[must_use]
    pub fn revoked_tokens(&self) -> Vec<String> {
        self.state.lock().revoked.clone()
    }

    /// State of the most recent authorization request
    #[must_use]
    pub fn last_state(&self) -> Option<String> {
        self.state.lock().last_request.as_ref().map(|r| r.challenge.state.clone())
    }

    fn default_response(n: usize) -> TokenResponse {
        TokenResponse {
            access_token: format!("mock-access-{n}"),
            refresh_token: None,
            id_token: None,
            token_type: "Bearer".to_string(),
            expires_in: 3600,
            scope: None,
        }
    }
}

#[async_trait]
impl OAuthClientTrait for MockOAuthClient {
    fn authorization_request(&self) -> AuthorizationRequest {
        let challenge = PKCEChallenge::generate();
        let request = AuthorizationRequest {
            url: format!("https://mock.idp/authorize?state={}", challenge.state),
            challenge,
        };
        self.state.lock().last_request = Some(request.clone());
        request
    }

    async fn exchange_code(
        &self,
        _code: &str,
        _code_verifier: &str,
    ) -> Result<TokenResponse, OAuthClientError> {
        let n = self.exchange_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let scripted = self.state.lock().exchange_results.pop_front();
        match scripted {
            Some(result) => result.map_err(MockFailure::into_error),
            None => Ok(Self::default_response(n)),
        }
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, OAuthClientError> {
        let n = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let (delay, scripted) = {
            let mut state = self.state.lock();
            state.refresh_tokens_seen.push(refresh_token.to_string());
            (state.refresh_delay, state.refresh_results.pop_front())
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match scripted {
            Some(result) => result.map_err(MockFailure::into_error),
            None => Ok(Self::default_response(n)),
        }
    }

    async fn revoke(&self, token: &str, _token_type_hint: &str) -> Result<(), OAuthClientError> {
        let mut state = self.state.lock();
        state.revoked.push(token.to_string());
        match state.revoke_failure.clone() {
            Some(failure) => Err(failure.into_error()),
            None => Ok(()),
        }
    }
}
