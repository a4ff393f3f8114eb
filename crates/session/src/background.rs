//! Background renewal
//!
//! [`BackgroundRenewalTask`] keeps the persisted credential fresh while the
//! app is suspended. It talks to the foreground controller only through the
//! credential store, so it can run in a separate process or wake-up.
//!
//! Hosts run it through a [`BackgroundScheduler`]: an OS facility on mobile,
//! or [`TokioBackgroundScheduler`] on desktop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tether_common::auth::{OAuthClientTrait, TokenSet};
use tether_common::time::Clock;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::codec;
use crate::error::{SessionError, SessionResult};
use crate::schedule::RenewalSchedule;
use crate::store::CredentialStore;

/// Name the renewal task is registered under
pub const BACKGROUND_TASK_NAME: &str = "tether.session.background-renewal";

/// Platform floor for recurring background work
pub const MIN_BACKGROUND_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Result of one background invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackgroundOutcome {
    /// Nothing persisted; nothing to do
    NoSession,
    /// Persisted token set is outside the renewal buffer
    NotDue,
    /// Persisted token set is due but has no refresh token
    Unrenewable,
    /// A renewed token set was persisted
    Renewed,
    /// Another writer persisted a newer token set first
    Superseded,
    /// Renewal failed transiently; the persisted session is untouched
    Failed(String),
    /// The provider rejected the persisted refresh token; session cleared
    SessionCleared,
}

/// One-shot renewal against the persisted credential
pub struct BackgroundRenewalTask {
    store: CredentialStore,
    provider: Arc<dyn OAuthClientTrait>,
    clock: Arc<dyn Clock>,
    buffer_secs: i64,
}

impl std::fmt::Debug for BackgroundRenewalTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundRenewalTask").field("buffer_secs", &self.buffer_secs).finish()
    }
}

impl BackgroundRenewalTask {
    pub fn new(
        store: CredentialStore,
        provider: Arc<dyn OAuthClientTrait>,
        clock: Arc<dyn Clock>,
        buffer_secs: i64,
    ) -> Self {
        Self { store, provider, clock, buffer_secs }
    }

    /// Renew the persisted token set if it is inside the renewal buffer
    ///
    /// # Errors
    /// Only storage failures are errors; provider failures are reported as
    /// outcomes.
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> SessionResult<BackgroundOutcome> {
        let Some(tokens) = self.store.load_tokens().await? else {
            debug!("No persisted session");
            return Ok(BackgroundOutcome::NoSession);
        };

        if !tokens.needs_renewal(self.clock.now_secs(), self.buffer_secs) {
            return Ok(BackgroundOutcome::NotDue);
        }

        let Some(refresh_token) = tokens.refresh_token.clone().filter(|t| !t.is_empty()) else {
            return Ok(BackgroundOutcome::Unrenewable);
        };

        match self.provider.refresh(&refresh_token).await {
            Ok(response) => {
                let renewed = tokens.renewed(response, self.clock.now_secs());
                self.persist_unless_superseded(&tokens, &renewed).await
            }
            Err(e) if e.is_auth_failure() => {
                // A concurrent renewal may have rotated the token we presented.
                let current = self.store.load_tokens().await?;
                let still_same = current
                    .as_ref()
                    .is_some_and(|t| t.refresh_token.as_deref() == Some(refresh_token.as_str()));
                if still_same {
                    warn!(error = %e, "Refresh token rejected; clearing persisted session");
                    self.store.clear_all().await?;
                    Ok(BackgroundOutcome::SessionCleared)
                } else {
                    debug!("Rejected refresh token was already replaced");
                    Ok(BackgroundOutcome::Superseded)
                }
            }
            Err(e) => {
                let error = SessionError::from(e);
                warn!(error = %error, "Background renewal failed; will retry next run");
                Ok(BackgroundOutcome::Failed(error.to_string()))
            }
        }
    }

    async fn persist_unless_superseded(
        &self,
        original: &TokenSet,
        renewed: &TokenSet,
    ) -> SessionResult<BackgroundOutcome> {
        match self.store.load_tokens().await? {
            None => {
                debug!("Session removed during renewal; discarding result");
                Ok(BackgroundOutcome::NoSession)
            }
            Some(current) if current != *original && current.issued_at >= renewed.issued_at => {
                debug!("Newer token set already persisted; discarding result");
                Ok(BackgroundOutcome::Superseded)
            }
            Some(_) => {
                let claims = codec::claims_for(renewed);
                let schedule = RenewalSchedule::compute(renewed, self.buffer_secs);
                self.store.save_session(renewed, claims.as_ref(), &schedule).await?;
                info!(next_renewal_at = schedule.next_renewal_at, "Background renewal persisted");
                Ok(BackgroundOutcome::Renewed)
            }
        }
    }
}

/// Host facility that runs a named task periodically
///
/// Registration is synchronous so logout can unregister before any I/O.
pub trait BackgroundScheduler: Send + Sync {
    /// Register (or replace) the recurring task `name`
    ///
    /// # Errors
    /// Returns `SessionError::Scheduling` when the host refuses.
    fn register(
        &self,
        name: &str,
        interval: Duration,
        task: Arc<BackgroundRenewalTask>,
    ) -> SessionResult<()>;

    /// Unregister `name`; unknown names are ignored
    ///
    /// # Errors
    /// Returns `SessionError::Scheduling` when the host refuses.
    fn unregister(&self, name: &str) -> SessionResult<()>;
}

struct RegisteredTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Interval-driven [`BackgroundScheduler`] on the tokio runtime
///
/// Intervals below [`MIN_BACKGROUND_INTERVAL`] are raised to it. The first
/// run happens one interval after registration.
#[derive(Default)]
pub struct TokioBackgroundScheduler {
    tasks: Mutex<HashMap<String, RegisteredTask>>,
}

impl TokioBackgroundScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `name` is currently registered
    #[must_use]
    pub fn is_registered(&self, name: &str) -> bool {
        self.tasks.lock().get(name).is_some_and(|t| !t.handle.is_finished())
    }

    async fn run_loop(
        name: String,
        start: Instant,
        interval: Duration,
        task: Arc<BackgroundRenewalTask>,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval_at(start, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!(task = %name, "Background task stopped");
                    break;
                }
                _ = ticker.tick() => {
                    match task.run_once().await {
                        Ok(outcome) => debug!(task = %name, ?outcome, "Background run finished"),
                        Err(e) => warn!(task = %name, error = %e, "Background run failed"),
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for TokioBackgroundScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.tasks.lock().keys().cloned().collect();
        f.debug_struct("TokioBackgroundScheduler").field("tasks", &names).finish()
    }
}

impl BackgroundScheduler for TokioBackgroundScheduler {
    fn register(
        &self,
        name: &str,
        interval: Duration,
        task: Arc<BackgroundRenewalTask>,
    ) -> SessionResult<()> {
        let interval = interval.max(MIN_BACKGROUND_INTERVAL);
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SessionError::Scheduling(e.to_string()))?;

        let cancel = CancellationToken::new();
        let start = Instant::now() + interval;
        let handle = runtime.spawn(Self::run_loop(
            name.to_string(),
            start,
            interval,
            task,
            cancel.clone(),
        ));

        let previous = self.tasks.lock().insert(name.to_string(), RegisteredTask { cancel, handle });
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }

        info!(task = %name, interval_secs = interval.as_secs(), "Background task registered");
        Ok(())
    }

    fn unregister(&self, name: &str) -> SessionResult<()> {
        if let Some(task) = self.tasks.lock().remove(name) {
            task.cancel.cancel();
            info!(task = %name, "Background task unregistered");
        }
        Ok(())
    }
}

impl Drop for TokioBackgroundScheduler {
    fn drop(&mut self) {
        for (_, task) in self.tasks.get_mut().drain() {
            task.cancel.cancel();
        }
    }
}
