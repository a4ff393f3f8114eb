//! Shared fixtures for session integration tests
//!
//! Provides a [`Harness`] wiring a `SessionController` to the mock provider,
//! the in-memory keychain, a mock clock, a recording launcher and a
//! recording background scheduler.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use parking_lot::Mutex;
use serde_json::json;
use tether_common::auth::{TokenResponse, TokenSet};
use tether_common::testing::{MockKeychainProvider, MockOAuthClient};
use tether_common::time::{Clock, MockClock};
use tether_session::{
    keys, AuthorizationLauncher, BackgroundRenewalTask, BackgroundScheduler, SessionController,
    SessionDependencies, SessionError, SessionResult, SessionSettings,
};
use url::Url;

/// Mock clock start, epoch seconds
pub const START_SECS: i64 = 1000;

/// Build an unsigned JWT around `claims`
pub fn jwt(claims: &serde_json::Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{header}.{payload}.test-signature")
}

/// Identity token for `user_name` expiring at `exp`
pub fn id_token(user_name: &str, exp: i64) -> String {
    jwt(&json!({
        "sub": format!("sub-{user_name}"),
        "custom:apiKey": format!("key-{user_name}"),
        "userName": user_name,
        "name": format!("User {user_name}"),
        "email": format!("{user_name}@example.com"),
        "exp": exp,
    }))
}

/// Token endpoint response
pub fn token_response(
    access_token: &str,
    refresh_token: Option<&str>,
    id_token: Option<String>,
    expires_in: i64,
) -> TokenResponse {
    TokenResponse {
        access_token: access_token.to_string(),
        refresh_token: refresh_token.map(ToString::to_string),
        id_token,
        token_type: "Bearer".to_string(),
        expires_in,
        scope: Some("openid offline_access".to_string()),
    }
}

/// Token set as a previous process would have persisted it
pub fn token_set(
    access_token: &str,
    refresh_token: Option<&str>,
    issued_at: i64,
    expires_in: i64,
) -> TokenSet {
    TokenSet {
        access_token: access_token.to_string(),
        id_token: Some(id_token("u1", issued_at + expires_in)),
        refresh_token: refresh_token.map(ToString::to_string),
        token_type: "Bearer".to_string(),
        scope: None,
        issued_at,
        expires_in,
    }
}

/// Let spawned tasks run without moving paused time
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

/// Launcher that records URLs instead of opening a browser
#[derive(Default)]
pub struct RecordingLauncher {
    urls: Mutex<Vec<String>>,
    fail: Mutex<bool>,
}

impl RecordingLauncher {
    pub fn set_fail(&self, fail: bool) {
        *self.fail.lock() = fail;
    }

    pub fn launched(&self) -> Vec<String> {
        self.urls.lock().clone()
    }
}

#[async_trait]
impl AuthorizationLauncher for RecordingLauncher {
    async fn launch(&self, url: &str) -> SessionResult<()> {
        if *self.fail.lock() {
            return Err(SessionError::LaunchFailed("no browser available".to_string()));
        }
        self.urls.lock().push(url.to_string());
        Ok(())
    }
}

/// Background scheduler that records registrations without running them
#[derive(Default)]
pub struct RecordingScheduler {
    tasks: Mutex<HashMap<String, (Duration, Arc<BackgroundRenewalTask>)>>,
}

impl RecordingScheduler {
    pub fn interval(&self, name: &str) -> Option<Duration> {
        self.tasks.lock().get(name).map(|(interval, _)| *interval)
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.tasks.lock().contains_key(name)
    }

    pub fn task(&self, name: &str) -> Option<Arc<BackgroundRenewalTask>> {
        self.tasks.lock().get(name).map(|(_, task)| Arc::clone(task))
    }
}

impl BackgroundScheduler for RecordingScheduler {
    fn register(
        &self,
        name: &str,
        interval: Duration,
        task: Arc<BackgroundRenewalTask>,
    ) -> SessionResult<()> {
        self.tasks.lock().insert(name.to_string(), (interval, task));
        Ok(())
    }

    fn unregister(&self, name: &str) -> SessionResult<()> {
        self.tasks.lock().remove(name);
        Ok(())
    }
}

/// Controller wired to mocks, with handles kept for assertions
pub struct Harness {
    pub provider: MockOAuthClient,
    pub keychain: MockKeychainProvider,
    pub clock: MockClock,
    pub launcher: Arc<RecordingLauncher>,
    pub background: Arc<RecordingScheduler>,
    pub controller: SessionController,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(SessionSettings::default())
    }

    pub fn with_settings(settings: SessionSettings) -> Self {
        let provider = MockOAuthClient::new();
        let keychain = MockKeychainProvider::new("tether.test");
        let clock = MockClock::at_secs(START_SECS);
        let launcher = Arc::new(RecordingLauncher::default());
        let background = Arc::new(RecordingScheduler::default());

        let controller = SessionController::new(
            settings,
            SessionDependencies {
                provider: Arc::new(provider.clone()),
                secure_store: Arc::new(keychain.clone()),
                launcher: launcher.clone(),
                background: background.clone(),
                clock: Arc::new(clock.clone()),
            },
        );

        Self { provider, keychain, clock, launcher, background, controller }
    }

    /// Persist `tokens` directly, as a previous process would have
    pub fn seed_tokens(&self, tokens: &TokenSet) {
        self.keychain.insert_raw(keys::AUTH_TOKENS, &serde_json::to_string(tokens).unwrap());
    }

    /// Token set currently in the keychain
    pub fn persisted_tokens(&self) -> Option<TokenSet> {
        self.keychain.raw(keys::AUTH_TOKENS).map(|raw| serde_json::from_str(&raw).unwrap())
    }

    /// Wait for the `n`th authorization launch and return its state
    pub async fn wait_for_launch(&self, n: usize) -> String {
        for _ in 0..1000 {
            if let Some(url) = self.launcher.launched().get(n - 1) {
                let url = Url::parse(url).unwrap();
                let (_, state) = url.query_pairs().find(|(k, _)| k == "state").unwrap();
                return state.into_owned();
            }
            tokio::task::yield_now().await;
        }
        panic!("authorization flow {n} was never launched");
    }

    /// Start a login in the background and wait until the browser opened
    pub async fn start_login(&self) -> (tokio::task::JoinHandle<SessionResult<()>>, String) {
        let launches = self.launcher.launched().len();
        let controller = self.controller.clone();
        let login = tokio::spawn(async move { controller.login().await });
        let state = self.wait_for_launch(launches + 1).await;
        (login, state)
    }

    /// Complete a full login whose code exchange answers with `response`
    pub async fn login_with(&self, response: TokenResponse) -> SessionResult<()> {
        self.provider.push_exchange(Ok(response));
        let (login, state) = self.start_login().await;
        self.controller
            .handle_redirect(&format!("tether://callback?code=auth-code&state={state}"))
            .unwrap();
        login.await.unwrap()
    }

    /// Log in as `u1` at the current clock with `expires_in = 3600`
    pub async fn login_default(&self) {
        let exp = self.clock.now_secs() + 3600;
        self.login_with(token_response("a1", Some("r1"), Some(id_token("u1", exp)), 3600))
            .await
            .unwrap();
    }

    /// Move both the mock clock and paused tokio time forward
    pub async fn advance(&self, secs: u64) {
        self.clock.advance(Duration::from_secs(secs));
        tokio::time::advance(Duration::from_secs(secs)).await;
        settle().await;
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
