//! Session controller
//!
//! Owns the in-memory session and drives it through its lifecycle:
//!
//! ```text
//!                restore()
//! Uninitialized ──────────► Restoring ──┬──► Authenticated ◄──┐
//!                                       └──► LoggedOut        │ renewed
//!                                              │              │
//!                                   login()    ▼              │
//!                               AuthInProgress ──► Authenticated ──► Refreshing
//!                                     │ cancel / error              │ auth failure
//!                                     ▼                             ▼
//!                                  LoggedOut ◄──────────────────────┘
//! ```
//!
//! Renewal is single-flight: concurrent callers share one in-flight refresh.
//! A generation counter, bumped whenever a session ends, lets late renewal
//! results be discarded instead of resurrecting a signed-out session.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tether_common::auth::{pkce, OAuthClient, OAuthClientTrait, TokenSet};
use tether_common::security::{KeychainProvider, SecureStore};
use tether_common::time::{Clock, SystemClock};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use crate::background::{BackgroundRenewalTask, BackgroundScheduler, BACKGROUND_TASK_NAME};
use crate::codec::{self, IdentityClaims};
use crate::config::{
    SessionConfig, DEFAULT_AUTH_FLOW_STALENESS_SECS, DEFAULT_BACKGROUND_INTERVAL_SECS,
    DEFAULT_RENEWAL_BUFFER_SECS,
};
use crate::error::{SessionError, SessionResult};
use crate::schedule::{RefreshScheduler, RenewalSchedule, TokenRenewer};
use crate::store::{AuthFlowMarker, CredentialStore};

const EVENT_CHANNEL_CAPACITY: usize = 32;
const REFRESH_TOKEN_HINT: &str = "refresh_token";

/// Lifecycle state of the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Uninitialized,
    Restoring,
    LoggedOut,
    AuthInProgress,
    Authenticated,
    Refreshing,
}

impl SessionState {
    /// Whether a usable token set is held in this state
    #[must_use]
    pub fn is_authenticated(self) -> bool {
        matches!(self, Self::Authenticated | Self::Refreshing)
    }
}

/// Which token `get_valid_token` returns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Access,
    Identity,
}

/// Host application lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    Active,
    Inactive,
    Background,
}

/// Session-changed notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// A login completed; dependent services can bootstrap
    SignedIn,
    /// A persisted session was restored at startup
    Restored,
    /// The token set was renewed
    Renewed,
    /// The user signed out
    SignedOut,
    /// The provider rejected the session; the user must sign in again
    ReauthenticationRequired,
}

/// Opens the authorization URL in the system browser or an auth session
#[async_trait]
pub trait AuthorizationLauncher: Send + Sync {
    /// # Errors
    /// Returns `SessionError::LaunchFailed` when the URL cannot be opened.
    async fn launch(&self, url: &str) -> SessionResult<()>;
}

/// Timing knobs for a controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    pub renewal_buffer_secs: i64,
    pub auth_flow_staleness_secs: i64,
    pub background_interval: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            renewal_buffer_secs: DEFAULT_RENEWAL_BUFFER_SECS,
            auth_flow_staleness_secs: DEFAULT_AUTH_FLOW_STALENESS_SECS,
            background_interval: Duration::from_secs(DEFAULT_BACKGROUND_INTERVAL_SECS),
        }
    }
}

impl From<&SessionConfig> for SessionSettings {
    fn from(config: &SessionConfig) -> Self {
        Self {
            renewal_buffer_secs: config.renewal_buffer_secs,
            auth_flow_staleness_secs: config.auth_flow_staleness_secs,
            background_interval: config.background_interval(),
        }
    }
}

/// Collaborators injected into a controller
pub struct SessionDependencies {
    pub provider: Arc<dyn OAuthClientTrait>,
    pub secure_store: Arc<dyn SecureStore>,
    pub launcher: Arc<dyn AuthorizationLauncher>,
    pub background: Arc<dyn BackgroundScheduler>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug)]
enum RedirectOutcome {
    Code(String),
    Denied { error: String, description: Option<String> },
    Cancelled,
}

struct PendingFlow {
    state: String,
    sender: oneshot::Sender<RedirectOutcome>,
}

struct SessionData {
    state: SessionState,
    tokens: Option<TokenSet>,
    claims: Option<IdentityClaims>,
    marker: Option<AuthFlowMarker>,
    app_state: AppState,
}

type RenewalFuture = Shared<BoxFuture<'static, SessionResult<TokenSet>>>;

struct Inner {
    settings: SessionSettings,
    provider: Arc<dyn OAuthClientTrait>,
    store: CredentialStore,
    clock: Arc<dyn Clock>,
    scheduler: Arc<RefreshScheduler>,
    launcher: Arc<dyn AuthorizationLauncher>,
    background: Arc<dyn BackgroundScheduler>,
    background_task: Arc<BackgroundRenewalTask>,
    session: Mutex<SessionData>,
    events: broadcast::Sender<SessionEvent>,
    generation: AtomicU64,
    in_flight: Mutex<Option<(u64, RenewalFuture)>>,
    pending: Mutex<Option<PendingFlow>>,
}

/// Session lifecycle manager
///
/// Cheap to clone; clones share one session. Lock order is session data,
/// then scheduler, then pending flow; no lock is held across an await.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("state", &self.state())
            .field("next_renewal_at", &self.next_renewal_at())
            .finish_non_exhaustive()
    }
}

impl SessionController {
    /// Create a controller in the `Uninitialized` state
    pub fn new(settings: SessionSettings, deps: SessionDependencies) -> Self {
        let store = CredentialStore::new(deps.secure_store);
        let background_task = Arc::new(BackgroundRenewalTask::new(
            store.clone(),
            Arc::clone(&deps.provider),
            Arc::clone(&deps.clock),
            settings.renewal_buffer_secs,
        ));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                settings,
                scheduler: Arc::new(RefreshScheduler::new(
                    Arc::clone(&deps.clock),
                    settings.renewal_buffer_secs,
                )),
                provider: deps.provider,
                store,
                clock: deps.clock,
                launcher: deps.launcher,
                background: deps.background,
                background_task,
                session: Mutex::new(SessionData {
                    state: SessionState::Uninitialized,
                    tokens: None,
                    claims: None,
                    marker: None,
                    app_state: AppState::Active,
                }),
                events,
                generation: AtomicU64::new(0),
                in_flight: Mutex::new(None),
                pending: Mutex::new(None),
            }),
        }
    }

    /// Production wiring: platform keychain, HTTP OAuth client, system clock
    ///
    /// # Errors
    /// Returns `SessionError::Common` when the configuration is invalid.
    pub fn from_config(
        config: &SessionConfig,
        launcher: Arc<dyn AuthorizationLauncher>,
        background: Arc<dyn BackgroundScheduler>,
    ) -> SessionResult<Self> {
        config.validate()?;

        let deps = SessionDependencies {
            provider: Arc::new(OAuthClient::new(config.oauth.to_oauth_config())),
            secure_store: Arc::new(KeychainProvider::new(config.keychain_service.clone())),
            launcher,
            background,
            clock: Arc::new(SystemClock),
        };
        Ok(Self::new(SessionSettings::from(config), deps))
    }

    /// Load the persisted session at process start
    ///
    /// Only acts from `Uninitialized`; later calls return the current state.
    ///
    /// # Errors
    /// Returns `SessionError::Storage` when the keychain cannot be read. The
    /// controller is left `LoggedOut` without touching the stored records.
    #[instrument(skip(self))]
    pub async fn restore(&self) -> SessionResult<SessionState> {
        self.inner.restore().await
    }

    /// Run the authorization-code + PKCE flow to completion
    ///
    /// Resolves once [`Self::handle_redirect`] delivers the callback and the
    /// code has been exchanged. Calling it while already signed in is a
    /// no-op.
    ///
    /// # Errors
    /// - `AlreadyInProgress` if another flow is outstanding
    /// - `Cancelled` if the user or a logout cancelled the flow
    /// - `Authorization` if the provider redirected with an error
    /// - `AuthRejected`, `Transient` or `TokenRequest` if the exchange failed
    #[instrument(skip(self))]
    pub async fn login(&self) -> SessionResult<()> {
        self.inner.login().await
    }

    /// Deliver the redirect callback to the outstanding flow
    ///
    /// # Errors
    /// - `NoPendingFlow` if no login is waiting
    /// - `StateMismatch` if `state` is absent or wrong; the flow keeps waiting
    /// - `InvalidRedirect` if the URI carries neither `code` nor `error`
    pub fn handle_redirect(&self, uri: &str) -> SessionResult<()> {
        self.inner.handle_redirect(uri)
    }

    /// Cancel the outstanding flow; returns whether one was waiting
    pub fn cancel_login(&self) -> bool {
        let flow = self.inner.pending.lock().take();
        match flow {
            Some(flow) => {
                info!("Login cancelled by user");
                let _ = flow.sender.send(RedirectOutcome::Cancelled);
                true
            }
            None => false,
        }
    }

    /// End the session
    ///
    /// The timer and background task are stopped before any I/O. Revocation
    /// and storage failures are logged, never returned.
    #[instrument(skip(self))]
    pub async fn logout(&self) {
        self.inner.logout().await;
    }

    /// Token of `kind`, renewed first when inside the renewal buffer
    ///
    /// Returns `None` when no session exists or the provider rejected it.
    /// A transient renewal failure falls back to the current token while it
    /// has not expired.
    pub async fn get_valid_token(&self, kind: TokenKind) -> Option<String> {
        self.inner.get_valid_token(kind).await
    }

    /// React to the host application changing lifecycle state
    ///
    /// On becoming active, adopts a newer token set persisted by the
    /// background task, then renews if inside the buffer.
    ///
    /// # Errors
    /// Returns the renewal error, if a renewal was attempted and failed.
    #[instrument(skip(self))]
    pub async fn handle_app_state(&self, next: AppState) -> SessionResult<()> {
        self.inner.handle_app_state(next).await
    }

    /// Renew immediately, regardless of the buffer
    ///
    /// # Errors
    /// `NotAuthenticated` without a session; otherwise the renewal error.
    #[instrument(skip(self))]
    pub async fn refresh_now(&self) -> SessionResult<()> {
        if !self.state().is_authenticated() {
            return Err(SessionError::NotAuthenticated);
        }
        let renewed = self.inner.renew().await?;
        self.inner.arm_timer(&renewed);
        Ok(())
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.inner.session.lock().state
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.state().is_authenticated()
    }

    /// Identity claims of the current session
    #[must_use]
    pub fn claims(&self) -> Option<IdentityClaims> {
        self.inner.session.lock().claims.clone()
    }

    /// Marker of an outstanding (or interrupted, not yet stale) login
    #[must_use]
    pub fn pending_auth_flow(&self) -> Option<AuthFlowMarker> {
        self.inner.session.lock().marker
    }

    /// Subscribe to session-changed notifications
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Epoch milliseconds at which the renewal timer fires
    #[must_use]
    pub fn next_renewal_at(&self) -> Option<i64> {
        self.inner.scheduler.fire_at()
    }

    /// Whether the renewal timer is armed
    #[must_use]
    pub fn is_renewal_armed(&self) -> bool {
        self.inner.scheduler.is_armed()
    }

    /// Task hosts hand to an OS background facility
    #[must_use]
    pub fn background_task(&self) -> Arc<BackgroundRenewalTask> {
        Arc::clone(&self.inner.background_task)
    }
}

impl Inner {
    fn now_secs(&self) -> i64 {
        self.clock.now_secs()
    }

    fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            debug!(?event, "No session event subscribers");
        }
    }

    fn register_background(&self) {
        if let Err(e) = self.background.register(
            BACKGROUND_TASK_NAME,
            self.settings.background_interval,
            Arc::clone(&self.background_task),
        ) {
            warn!(error = %e, "Background renewal could not be registered");
        }
    }

    fn unregister_background(&self) {
        if let Err(e) = self.background.unregister(BACKGROUND_TASK_NAME) {
            warn!(error = %e, "Background renewal could not be unregistered");
        }
    }

    /// Arm the renewal timer for `tokens` if the session is still live
    fn arm_timer(self: &Arc<Self>, tokens: &TokenSet) -> Option<RenewalSchedule> {
        if !tokens.can_renew() {
            debug!("Token set has no refresh token; renewal timer not armed");
            return None;
        }

        let session = self.session.lock();
        if !session.state.is_authenticated() {
            return None;
        }
        let renewer: Weak<Self> = Arc::downgrade(self);
        Some(self.scheduler.arm(tokens, renewer))
    }

    async fn restore(self: &Arc<Self>) -> SessionResult<SessionState> {
        {
            let mut session = self.session.lock();
            if session.state != SessionState::Uninitialized {
                return Ok(session.state);
            }
            session.state = SessionState::Restoring;
        }
        let generation = self.current_generation();
        info!("Restoring session");

        match self.store.load_marker().await {
            Ok(Some(marker))
                if marker.is_stale(self.clock.now_millis(), self.settings.auth_flow_staleness_secs) =>
            {
                info!(started_at = marker.started_at, "Discarding stale authorization flow");
                if let Err(e) = self.store.clear_marker().await {
                    warn!(error = %e, "Failed to delete stale authorization flow marker");
                }
            }
            Ok(marker) => self.session.lock().marker = marker,
            Err(e) => warn!(error = %e, "Failed to read authorization flow marker"),
        }

        let tokens = match self.store.load_tokens().await {
            Ok(tokens) => tokens,
            Err(e) => {
                error!(error = %e, "Failed to read persisted session");
                self.session.lock().state = SessionState::LoggedOut;
                return Err(e.into());
            }
        };

        let Some(tokens) = tokens else {
            if let Err(e) = self.store.clear_session_records().await {
                warn!(error = %e, "Failed to delete orphaned session records");
            }
            self.session.lock().state = SessionState::LoggedOut;
            info!("No persisted session");
            return Ok(SessionState::LoggedOut);
        };

        let claims = match codec::claims_for(&tokens) {
            Some(claims) => Some(claims),
            None => self.store.load_claims().await.ok().flatten(),
        };
        let now = self.now_secs();
        let expired = tokens.is_expired(now);
        let due = tokens.needs_renewal(now, self.settings.renewal_buffer_secs);
        {
            let mut session = self.session.lock();
            session.tokens = Some(tokens.clone());
            session.claims = claims;
            if !expired {
                session.state = SessionState::Authenticated;
            }
        }

        if expired {
            info!("Persisted session has expired; attempting renewal");
            if !tokens.can_renew() {
                info!("Expired session has no refresh token");
                self.end_session(generation, None).await;
                return Ok(SessionState::LoggedOut);
            }
            match self.renew().await {
                Ok(_) => {}
                Err(e)
                    if e.requires_reauthentication() || matches!(e, SessionError::SessionEnded) =>
                {
                    warn!(error = %e, "Expired session could not be renewed");
                    self.end_session(generation, None).await;
                    return Ok(SessionState::LoggedOut);
                }
                Err(e) => {
                    warn!(error = %e, "Expired session not renewed; kept for a later restore");
                    self.suspend_session(generation);
                    return Ok(SessionState::LoggedOut);
                }
            }
            let mut session = self.session.lock();
            if self.current_generation() == generation && session.state == SessionState::Restoring {
                session.state = SessionState::Authenticated;
            }
        } else if due && tokens.can_renew() {
            debug!("Persisted session is inside the renewal buffer");
            if let Err(e) = self.renew().await {
                warn!(error = %e, "Renewal on restore failed");
            }
        }

        let current = {
            let session = self.session.lock();
            session.state.is_authenticated().then(|| session.tokens.clone()).flatten()
        };
        let Some(current) = current else {
            return Ok(self.session.lock().state);
        };

        self.arm_timer(&current);
        self.register_background();
        info!(expires_at = current.expires_at(), "Session restored");
        self.emit(SessionEvent::Restored);
        Ok(SessionState::Authenticated)
    }

    async fn login(self: &Arc<Self>) -> SessionResult<()> {
        let (sender, receiver) = oneshot::channel();
        let (request, marker, generation) = {
            let mut session = self.session.lock();
            match session.state {
                SessionState::AuthInProgress | SessionState::Restoring => {
                    return Err(SessionError::AlreadyInProgress);
                }
                SessionState::Authenticated | SessionState::Refreshing => {
                    debug!("Already signed in");
                    return Ok(());
                }
                SessionState::Uninitialized | SessionState::LoggedOut => {}
            }

            let request = self.provider.authorization_request();
            let marker = AuthFlowMarker::started(self.clock.now_millis());
            session.state = SessionState::AuthInProgress;
            session.marker = Some(marker);
            *self.pending.lock() =
                Some(PendingFlow { state: request.challenge.state.clone(), sender });
            (request, marker, self.current_generation())
        };

        let mut guard =
            FlowGuard { inner: Arc::clone(self), generation, active: true, persisting: None };

        if let Err(e) = self.store.save_marker(&marker).await {
            warn!(error = %e, "Failed to persist authorization flow marker");
        }

        info!("Authorization flow started");
        if let Err(e) = self.launcher.launch(&request.url).await {
            warn!(error = %e, "Authorization launcher failed");
            guard.abort().await;
            return Err(e);
        }

        let outcome = receiver.await.unwrap_or(RedirectOutcome::Cancelled);
        let code = match outcome {
            RedirectOutcome::Code(code) => code,
            RedirectOutcome::Denied { error, description } => {
                warn!(%error, "Authorization server returned an error");
                guard.abort().await;
                return Err(SessionError::Authorization { error, description });
            }
            RedirectOutcome::Cancelled => {
                guard.abort().await;
                return Err(SessionError::Cancelled);
            }
        };

        let response =
            match self.provider.exchange_code(&code, &request.challenge.code_verifier).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(error = %e, "Authorization code exchange failed");
                    guard.abort().await;
                    return Err(e.into());
                }
            };

        let tokens = TokenSet::from_response(response, self.now_secs());
        let claims = codec::claims_for(&tokens);
        let schedule = RenewalSchedule::compute(&tokens, self.settings.renewal_buffer_secs);

        guard.persisting = Some(tokens.clone());
        if let Err(e) = self.store.save_session(&tokens, claims.as_ref(), &schedule).await {
            error!(error = %e, "Failed to persist new session");
            guard.abort().await;
            if let Err(e) = self.store.clear_all().await {
                warn!(error = %e, "Failed to clean up partially persisted session");
            }
            return Err(e.into());
        }

        let completed = {
            let mut session = self.session.lock();
            let live = session.state == SessionState::AuthInProgress
                && self.current_generation() == generation;
            if live {
                session.state = SessionState::Authenticated;
                session.tokens = Some(tokens.clone());
                session.claims = claims;
                session.marker = None;
            }
            live
        };
        guard.active = false;

        if !completed {
            info!("Login finished after the flow was abandoned; discarding tokens");
            if let Err(e) = self.store.clear_all().await {
                warn!(error = %e, "Failed to delete abandoned session");
            }
            return Err(SessionError::Cancelled);
        }

        self.arm_timer(&tokens);
        self.register_background();
        info!(renews_at = ?schedule.due_at(), "Signed in");
        self.emit(SessionEvent::SignedIn);
        Ok(())
    }

    fn handle_redirect(&self, uri: &str) -> SessionResult<()> {
        let url = Url::parse(uri).map_err(|e| SessionError::InvalidRedirect(e.to_string()))?;

        let (mut code, mut state, mut error, mut description) = (None, None, None, None);
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "code" => code = Some(value.into_owned()),
                "state" => state = Some(value.into_owned()),
                "error" => error = Some(value.into_owned()),
                "error_description" => description = Some(value.into_owned()),
                _ => {}
            }
        }

        let mut pending = self.pending.lock();
        let Some(flow) = pending.as_ref() else {
            warn!("Redirect received with no pending authorization flow");
            return Err(SessionError::NoPendingFlow);
        };
        if !state.as_deref().is_some_and(|s| pkce::validate_state(&flow.state, s)) {
            warn!("Redirect state does not match the pending flow");
            return Err(SessionError::StateMismatch);
        }

        let outcome = match (code, error) {
            (Some(code), _) => RedirectOutcome::Code(code),
            (None, Some(error)) => RedirectOutcome::Denied { error, description },
            (None, None) => {
                return Err(SessionError::InvalidRedirect(
                    "callback carries neither code nor error".to_string(),
                ));
            }
        };

        let Some(flow) = pending.take() else {
            return Err(SessionError::NoPendingFlow);
        };
        debug!("Redirect delivered to pending flow");
        flow.sender.send(outcome).map_err(|_| SessionError::NoPendingFlow)
    }

    async fn logout(&self) {
        let (tokens, had_session) = {
            let mut session = self.session.lock();
            self.generation.fetch_add(1, Ordering::SeqCst);
            let had_session = session.state.is_authenticated() || session.tokens.is_some();
            session.state = SessionState::LoggedOut;
            session.claims = None;
            session.marker = None;
            (session.tokens.take(), had_session)
        };

        self.scheduler.cancel();
        self.unregister_background();
        *self.in_flight.lock() = None;
        if let Some(flow) = self.pending.lock().take() {
            let _ = flow.sender.send(RedirectOutcome::Cancelled);
        }

        if had_session {
            self.emit(SessionEvent::SignedOut);
        }

        let refresh_token = match tokens {
            Some(tokens) => tokens.refresh_token,
            None => self.store.load_tokens().await.ok().flatten().and_then(|t| t.refresh_token),
        };
        if let Some(refresh_token) = refresh_token.filter(|t| !t.is_empty()) {
            if let Err(e) = self.provider.revoke(&refresh_token, REFRESH_TOKEN_HINT).await {
                warn!(error = %e, "Token revocation failed; continuing logout");
            }
        }

        if let Err(e) = self.store.clear_all().await {
            error!(error = %e, "Failed to delete persisted session");
        }
        info!("Signed out");
    }

    async fn get_valid_token(self: &Arc<Self>, kind: TokenKind) -> Option<String> {
        let tokens = {
            let session = self.session.lock();
            if !session.state.is_authenticated() {
                return None;
            }
            session.tokens.clone()?
        };

        let now = self.now_secs();
        if !tokens.needs_renewal(now, self.settings.renewal_buffer_secs) {
            return select_token(&tokens, kind);
        }
        if !tokens.can_renew() {
            return if tokens.is_expired(now) { None } else { select_token(&tokens, kind) };
        }

        match self.renew().await {
            Ok(renewed) => {
                self.arm_timer(&renewed);
                select_token(&renewed, kind)
            }
            Err(e) if e.requires_reauthentication() || matches!(e, SessionError::SessionEnded) => {
                None
            }
            Err(e) => {
                debug!(error = %e, "Renewal failed; using current token while it lasts");
                if tokens.is_expired(self.now_secs()) {
                    None
                } else {
                    select_token(&tokens, kind)
                }
            }
        }
    }

    async fn handle_app_state(self: &Arc<Self>, next: AppState) -> SessionResult<()> {
        let (previous, state, current) = {
            let mut session = self.session.lock();
            let previous = std::mem::replace(&mut session.app_state, next);
            (previous, session.state, session.tokens.clone())
        };
        debug!(?previous, ?next, "App state changed");

        if next != AppState::Active || previous == AppState::Active || !state.is_authenticated() {
            return Ok(());
        }
        let Some(current) = current else {
            return Ok(());
        };
        let generation = self.current_generation();

        let tokens = match self.store.load_tokens().await? {
            None => {
                warn!("Persisted session disappeared while inactive");
                self.end_session(generation, Some(SessionEvent::ReauthenticationRequired)).await;
                return Ok(());
            }
            Some(persisted) if persisted.issued_at > current.issued_at => {
                if !self.adopt(generation, &persisted) {
                    return Ok(());
                }
                info!(issued_at = persisted.issued_at, "Adopted token set renewed in background");
                self.arm_timer(&persisted);
                persisted
            }
            Some(_) => current,
        };

        if tokens.needs_renewal(self.now_secs(), self.settings.renewal_buffer_secs)
            && tokens.can_renew()
        {
            debug!("Token set inside renewal buffer on foreground; renewing");
            let renewed = self.renew().await?;
            self.arm_timer(&renewed);
        }
        Ok(())
    }

    /// Join the in-flight renewal for this generation, or start one
    fn renewal_future(self: &Arc<Self>) -> RenewalFuture {
        let generation = self.current_generation();
        let mut slot = self.in_flight.lock();
        if let Some((slot_generation, future)) = slot.as_ref() {
            if *slot_generation == generation {
                return future.clone();
            }
        }

        let this = Arc::clone(self);
        let future = async move { this.perform_renewal(generation).await }.boxed().shared();
        *slot = Some((generation, future.clone()));
        future
    }

    async fn renew(self: &Arc<Self>) -> SessionResult<TokenSet> {
        let future = self.renewal_future();
        let result = future.clone().await;

        let mut slot = self.in_flight.lock();
        if slot.as_ref().is_some_and(|(_, f)| f.ptr_eq(&future)) {
            *slot = None;
        }
        result
    }

    /// Replace the in-memory token set if `generation` is still live
    fn adopt(&self, generation: u64, tokens: &TokenSet) -> bool {
        let mut session = self.session.lock();
        if self.current_generation() != generation || !session.state.is_authenticated() {
            return false;
        }
        session.tokens = Some(tokens.clone());
        session.claims = codec::claims_for(tokens);
        true
    }

    /// Persisted token set, when it is newer than `current`
    async fn newer_persisted(&self, current: &TokenSet) -> Option<TokenSet> {
        match self.store.load_tokens().await {
            Ok(Some(persisted)) if persisted.issued_at > current.issued_at => Some(persisted),
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "Failed to read persisted token set");
                None
            }
        }
    }

    #[instrument(skip(self))]
    async fn perform_renewal(self: Arc<Self>, generation: u64) -> SessionResult<TokenSet> {
        let current = self.session.lock().tokens.clone();
        let Some(mut current) = current else {
            return Err(SessionError::NotAuthenticated);
        };

        if let Some(persisted) = self.newer_persisted(&current).await {
            if self.adopt(generation, &persisted) {
                info!(issued_at = persisted.issued_at, "Adopted token set renewed elsewhere");
                if !persisted.needs_renewal(self.now_secs(), self.settings.renewal_buffer_secs) {
                    return Ok(persisted);
                }
                current = persisted;
            }
        }

        let Some(refresh_token) = current.refresh_token.clone().filter(|t| !t.is_empty()) else {
            return Err(SessionError::NoRefreshToken);
        };

        {
            let mut session = self.session.lock();
            if self.current_generation() == generation
                && session.state == SessionState::Authenticated
            {
                session.state = SessionState::Refreshing;
            }
        }
        debug!("Refreshing token set");

        let result = self.provider.refresh(&refresh_token).await;
        if self.current_generation() != generation {
            debug!("Session ended during renewal; discarding result");
            return Err(SessionError::SessionEnded);
        }

        match result {
            Ok(response) => {
                let renewed = current.renewed(response, self.now_secs());
                let claims = codec::claims_for(&renewed);
                let schedule = RenewalSchedule::compute(&renewed, self.settings.renewal_buffer_secs);

                if let Err(e) = self.store.save_session(&renewed, claims.as_ref(), &schedule).await {
                    warn!(error = %e, "Failed to persist renewed session; keeping it in memory");
                }

                let live = {
                    let mut session = self.session.lock();
                    let live = self.current_generation() == generation;
                    if live {
                        session.tokens = Some(renewed.clone());
                        session.claims = claims;
                        if session.state == SessionState::Refreshing {
                            session.state = SessionState::Authenticated;
                        }
                    }
                    live
                };

                if !live {
                    self.discard_late_write(&renewed).await;
                    return Err(SessionError::SessionEnded);
                }

                info!(renews_at = ?schedule.due_at(), "Session renewed");
                self.emit(SessionEvent::Renewed);
                Ok(renewed)
            }
            Err(e) if e.is_auth_failure() => {
                if let Some(persisted) = self.newer_persisted(&current).await {
                    if persisted.refresh_token != current.refresh_token
                        && self.adopt(generation, &persisted)
                    {
                        self.restore_authenticated(generation);
                        info!("Refresh token was rotated elsewhere; adopted persisted token set");
                        return Ok(persisted);
                    }
                }

                warn!(error = %e, "Refresh token rejected; ending session");
                self.end_session(generation, Some(SessionEvent::ReauthenticationRequired)).await;
                Err(e.into())
            }
            Err(e) => {
                let error = SessionError::from(e);
                warn!(error = %error, "Renewal failed; keeping current token set");
                self.restore_authenticated(generation);
                Err(error)
            }
        }
    }

    fn restore_authenticated(&self, generation: u64) {
        let mut session = self.session.lock();
        if self.current_generation() == generation && session.state == SessionState::Refreshing {
            session.state = SessionState::Authenticated;
        }
    }

    // A logout that raced the write may have cleared the store before we
    // wrote to it. Remove the write unless something newer replaced it.
    async fn discard_late_write(&self, written: &TokenSet) {
        match self.store.load_tokens().await {
            Ok(Some(persisted)) if persisted == *written => {
                if let Err(e) = self.store.clear_all().await {
                    warn!(error = %e, "Failed to remove renewal persisted after logout");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to check for renewal persisted after logout"),
        }
    }

    /// Force the session for `generation` to `LoggedOut` and wipe the store
    async fn end_session(&self, generation: u64, event: Option<SessionEvent>) {
        {
            let mut session = self.session.lock();
            if self.current_generation() != generation {
                return;
            }
            self.generation.fetch_add(1, Ordering::SeqCst);
            session.state = SessionState::LoggedOut;
            session.tokens = None;
            session.claims = None;
        }

        self.scheduler.cancel();
        self.unregister_background();
        if let Err(e) = self.store.clear_all().await {
            error!(error = %e, "Failed to delete persisted session");
        }

        info!(?event, "Session ended");
        if let Some(event) = event {
            self.emit(event);
        }
    }

    /// Force the session for `generation` to `LoggedOut`, leaving the store as is
    fn suspend_session(&self, generation: u64) {
        let mut session = self.session.lock();
        if self.current_generation() != generation {
            return;
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
        session.state = SessionState::LoggedOut;
        session.tokens = None;
        session.claims = None;
        info!("Session suspended until the next restore or login");
    }

    fn reset_flow(&self, generation: u64) -> bool {
        {
            let mut session = self.session.lock();
            if self.current_generation() != generation
                || session.state != SessionState::AuthInProgress
            {
                return false;
            }
            session.state = SessionState::LoggedOut;
            session.marker = None;
        }
        self.pending.lock().take();
        true
    }
}

#[async_trait]
impl TokenRenewer for Inner {
    async fn renew_on_timer(self: Arc<Self>) -> SessionResult<TokenSet> {
        self.renew().await
    }
}

/// Resets the controller if a login future is dropped mid-flow
///
/// Once the new session is being written, a drop also removes whatever part
/// of it reached the store.
struct FlowGuard {
    inner: Arc<Inner>,
    generation: u64,
    active: bool,
    persisting: Option<TokenSet>,
}

impl FlowGuard {
    async fn abort(&mut self) {
        self.active = false;
        if self.inner.reset_flow(self.generation) {
            if let Err(e) = self.inner.store.clear_marker().await {
                warn!(error = %e, "Failed to delete authorization flow marker");
            }
        }
    }
}

impl Drop for FlowGuard {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        let reset = self.inner.reset_flow(self.generation);
        let persisting = self.persisting.take();
        if !reset && persisting.is_none() {
            return;
        }
        debug!(persisting = persisting.is_some(), "Login abandoned mid-flow");

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let inner = Arc::clone(&self.inner);
        runtime.spawn(async move {
            match persisting {
                // The flow was still ours, so every key belongs to it.
                Some(_) if reset => {
                    if let Err(e) = inner.store.clear_all().await {
                        warn!(error = %e, "Failed to delete partially persisted session");
                    }
                }
                // A logout got there first; only remove our own write.
                Some(tokens) => inner.discard_late_write(&tokens).await,
                None => {
                    if let Err(e) = inner.store.clear_marker().await {
                        warn!(error = %e, "Failed to delete authorization flow marker");
                    }
                }
            }
        });
    }
}

fn select_token(tokens: &TokenSet, kind: TokenKind) -> Option<String> {
    match kind {
        TokenKind::Access => Some(tokens.access_token.clone()),
        TokenKind::Identity => tokens.id_token.clone(),
    }
}
