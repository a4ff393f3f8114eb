//! Proactive renewal timing
//!
//! [`RenewalSchedule`] derives when a token set must be renewed;
//! [`RefreshScheduler`] keeps exactly one timer armed for that instant and
//! re-arms itself after each successful renewal.
//!
//! ```text
//! issued_at                      next_renewal_at        expires_at
//!    │◄────────── expires_in - buffer ──────►│◄── buffer ──►│
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tether_common::auth::TokenSet;
use tether_common::time::Clock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::SessionError;

/// Shortest delay before a fired timer runs again, whatever the token lifetime
pub const MIN_REARM_DELAY: Duration = Duration::from_secs(10);

/// Persisted renewal instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenewalSchedule {
    /// Epoch milliseconds at which renewal is due
    pub next_renewal_at: i64,
}

impl RenewalSchedule {
    /// `next_renewal_at = (issued_at + expires_in - buffer) * 1000`, with the
    /// buffer capped at half the token lifetime
    #[must_use]
    pub fn compute(tokens: &TokenSet, buffer_secs: i64) -> Self {
        Self { next_renewal_at: tokens.renewal_due_at(buffer_secs).saturating_mul(1000) }
    }

    /// Milliseconds from `now_millis` until renewal is due, never negative
    #[must_use]
    pub fn delay_ms(&self, now_millis: i64) -> u64 {
        u64::try_from(self.next_renewal_at.saturating_sub(now_millis)).unwrap_or(0)
    }

    /// Whether renewal is due at `now_millis`
    #[must_use]
    pub fn is_due(&self, now_millis: i64) -> bool {
        now_millis >= self.next_renewal_at
    }

    /// Renewal instant as a UTC timestamp, for display
    #[must_use]
    pub fn due_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.next_renewal_at)
    }
}

/// Performs the renewal when a timer fires
#[async_trait]
pub trait TokenRenewer: Send + Sync {
    /// Renew the current token set and return its successor
    async fn renew_on_timer(self: Arc<Self>) -> Result<TokenSet, SessionError>;
}

struct ArmedTimer {
    id: u64,
    fire_at: i64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Single-timer renewal scheduler
///
/// Arming always cancels the pending timer first, so at most one timer is
/// live. A fired timer re-arms from the token set its renewal produced; a
/// failed renewal leaves the scheduler disarmed.
pub struct RefreshScheduler {
    clock: Arc<dyn Clock>,
    buffer_secs: i64,
    armed: Mutex<Option<ArmedTimer>>,
    next_id: AtomicU64,
    fired: AtomicU64,
}

impl std::fmt::Debug for RefreshScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshScheduler")
            .field("buffer_secs", &self.buffer_secs)
            .field("fire_at", &self.fire_at())
            .finish_non_exhaustive()
    }
}

impl RefreshScheduler {
    /// Create a disarmed scheduler
    pub fn new(clock: Arc<dyn Clock>, buffer_secs: i64) -> Self {
        Self {
            clock,
            buffer_secs,
            armed: Mutex::new(None),
            next_id: AtomicU64::new(1),
            fired: AtomicU64::new(0),
        }
    }

    /// Renewal buffer in seconds
    #[must_use]
    pub fn buffer_secs(&self) -> i64 {
        self.buffer_secs
    }

    /// Arm the timer for `tokens`, replacing any pending timer
    #[instrument(skip_all, fields(issued_at = tokens.issued_at, expires_in = tokens.expires_in))]
    pub fn arm(self: &Arc<Self>, tokens: &TokenSet, renewer: Weak<dyn TokenRenewer>) -> RenewalSchedule {
        let mut slot = self.armed.lock();
        self.install(&mut slot, tokens, renewer, Duration::ZERO)
    }

    /// Disarm the pending timer, if any
    pub fn cancel(&self) {
        if let Some(timer) = self.armed.lock().take() {
            timer.cancel.cancel();
            debug!(timer_id = timer.id, "Renewal timer cancelled");
        }
    }

    /// Whether a timer is waiting to fire
    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.armed
            .lock()
            .as_ref()
            .is_some_and(|t| !t.cancel.is_cancelled() && !t.handle.is_finished())
    }

    /// Epoch milliseconds at which the armed timer fires
    #[must_use]
    pub fn fire_at(&self) -> Option<i64> {
        self.armed.lock().as_ref().filter(|t| !t.cancel.is_cancelled()).map(|t| t.fire_at)
    }

    /// Number of timers that have fired since creation
    #[must_use]
    pub fn fired_count(&self) -> u64 {
        self.fired.load(Ordering::SeqCst)
    }

    fn install(
        self: &Arc<Self>,
        slot: &mut Option<ArmedTimer>,
        tokens: &TokenSet,
        renewer: Weak<dyn TokenRenewer>,
        floor: Duration,
    ) -> RenewalSchedule {
        if let Some(previous) = slot.take() {
            previous.cancel.cancel();
        }

        let schedule = RenewalSchedule::compute(tokens, self.buffer_secs);
        let now_millis = self.clock.now_millis();
        let delay = Duration::from_millis(schedule.delay_ms(now_millis)).max(floor);
        let delay_millis = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
        let fire_at = now_millis.saturating_add(delay_millis);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(Self::run_timer(
            Arc::downgrade(self),
            id,
            Instant::now() + delay,
            cancel.clone(),
            renewer,
        ));

        debug!(timer_id = id, delay_ms = delay.as_millis() as u64, "Renewal timer armed");
        *slot = Some(ArmedTimer { id, fire_at, cancel, handle });
        schedule
    }

    async fn run_timer(
        scheduler: Weak<Self>,
        id: u64,
        deadline: Instant,
        cancel: CancellationToken,
        renewer: Weak<dyn TokenRenewer>,
    ) {
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep_until(deadline) => {}
        }

        let (Some(this), Some(target)) = (scheduler.upgrade(), renewer.upgrade()) else {
            return;
        };
        this.fired.fetch_add(1, Ordering::SeqCst);
        info!(timer_id = id, "Renewal timer fired");

        match target.renew_on_timer().await {
            Ok(tokens) => this.rearm_after_fire(id, &tokens, renewer),
            Err(e) => warn!(timer_id = id, error = %e, "Timed renewal failed; timer left disarmed"),
        }
    }

    // Only the timer that fired may re-arm. If it was cancelled or replaced
    // while renewing, whoever replaced it owns the schedule now.
    fn rearm_after_fire(self: &Arc<Self>, id: u64, tokens: &TokenSet, renewer: Weak<dyn TokenRenewer>) {
        let mut slot = self.armed.lock();
        let still_current = slot.as_ref().is_some_and(|t| t.id == id && !t.cancel.is_cancelled());
        if still_current {
            self.install(&mut slot, tokens, renewer, MIN_REARM_DELAY);
        } else {
            debug!(timer_id = id, "Timer superseded during renewal; not re-arming");
        }
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        if let Some(timer) = self.armed.get_mut().take() {
            timer.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for schedule.
    use std::sync::atomic::AtomicUsize;

    use tether_common::time::MockClock;

    use super::*;

    fn tokens(issued_at: i64, expires_in: i64) -> TokenSet {
        TokenSet {
            access_token: "a".to_string(),
            id_token: None,
            refresh_token: Some("r".to_string()),
            token_type: "Bearer".to_string(),
            scope: None,
            issued_at,
            expires_in,
        }
    }

    struct CountingRenewer {
        clock: MockClock,
        calls: AtomicUsize,
        fail: bool,
        lifetime: i64,
    }

    #[async_trait]
    impl TokenRenewer for CountingRenewer {
        async fn renew_on_timer(self: Arc<Self>) -> Result<TokenSet, SessionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(SessionError::Transient("offline".into()));
            }
            Ok(tokens(self.clock.now_secs(), self.lifetime))
        }
    }

    fn setup(fail: bool) -> (MockClock, Arc<RefreshScheduler>, Arc<CountingRenewer>) {
        setup_with_lifetime(fail, 3600)
    }

    fn setup_with_lifetime(
        fail: bool,
        lifetime: i64,
    ) -> (MockClock, Arc<RefreshScheduler>, Arc<CountingRenewer>) {
        let clock = MockClock::at_secs(1000);
        let scheduler = Arc::new(RefreshScheduler::new(Arc::new(clock.clone()), 300));
        let renewer = Arc::new(CountingRenewer {
            clock: clock.clone(),
            calls: AtomicUsize::new(0),
            fail,
            lifetime,
        });
        (clock, scheduler, renewer)
    }

    fn weak(renewer: &Arc<CountingRenewer>) -> Weak<dyn TokenRenewer> {
        let weak: Weak<CountingRenewer> = Arc::downgrade(renewer);
        weak
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    /// Validates the buffer arithmetic for the fresh login numbers.
    ///
    /// Assertions:
    /// - `next_renewal_at == (1000 + 3600 - 300) * 1000`.
    /// - The schedule never lands after the hard expiry.
    /// - Delay clamps to zero once due.
    #[test]
    fn test_compute_schedule() {
        let schedule = RenewalSchedule::compute(&tokens(1000, 3600), 300);
        assert_eq!(schedule.next_renewal_at, 4_300_000);
        assert!(schedule.next_renewal_at / 1000 <= 4600);
        assert_eq!(schedule.delay_ms(1_000_000), 3_300_000);
        assert_eq!(schedule.delay_ms(5_000_000), 0);
        assert!(schedule.is_due(4_300_000));

        let short = RenewalSchedule::compute(&tokens(1000, 60), 300);
        assert_eq!(short.next_renewal_at, 1_030_000);
        assert!(!short.is_due(1_000_000));

        let due_at = schedule.due_at().unwrap();
        assert_eq!(due_at.timestamp(), 4300);
    }

    /// Validates that re-arming replaces the pending timer.
    ///
    /// Assertions:
    /// - Three arms leave one timer whose fire time is the last one.
    /// - Crossing the earlier fire times triggers no renewal.
    /// - Crossing the last fire time triggers exactly one renewal.
    #[tokio::test(start_paused = true)]
    async fn test_single_timer_invariant() {
        let (_clock, scheduler, renewer) = setup(false);

        scheduler.arm(&tokens(1000, 400), weak(&renewer));
        scheduler.arm(&tokens(1000, 800), weak(&renewer));
        scheduler.arm(&tokens(1000, 1300), weak(&renewer));
        assert_eq!(scheduler.fire_at(), Some(2_000_000));

        tokio::time::advance(Duration::from_secs(999)).await;
        settle().await;
        assert_eq!(renewer.calls.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(renewer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.fired_count(), 1);
    }

    /// Validates recursive self-scheduling after a successful renewal.
    ///
    /// Assertions:
    /// - After firing, the timer is re-armed from the renewed token set.
    #[tokio::test(start_paused = true)]
    async fn test_rearms_after_success() {
        let (clock, scheduler, renewer) = setup(false);
        scheduler.arm(&tokens(1000, 3600), weak(&renewer));

        clock.set_secs(4300);
        tokio::time::advance(Duration::from_secs(3300)).await;
        settle().await;

        assert_eq!(renewer.calls.load(Ordering::SeqCst), 1);
        assert!(scheduler.is_armed());
        assert_eq!(scheduler.fire_at(), Some((4300 + 3600 - 300) * 1000));
    }

    /// Validates that a failed renewal leaves the scheduler disarmed.
    #[tokio::test(start_paused = true)]
    async fn test_no_rearm_after_failure() {
        let (_clock, scheduler, renewer) = setup(true);
        scheduler.arm(&tokens(1000, 600), weak(&renewer));

        tokio::time::advance(Duration::from_secs(301)).await;
        settle().await;

        assert_eq!(renewer.calls.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_armed());
    }

    /// Validates the re-arm floor for tokens that are due the moment they arrive.
    ///
    /// Assertions:
    /// - A zero-lifetime set fires once, then waits `MIN_REARM_DELAY`.
    /// - No renewal runs inside the floor.
    #[tokio::test(start_paused = true)]
    async fn test_rearm_floor_for_zero_lifetime() {
        let (_clock, scheduler, renewer) = setup_with_lifetime(false, 0);
        scheduler.arm(&tokens(1000, 0), weak(&renewer));

        settle().await;
        assert_eq!(renewer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.fire_at(), Some(1_010_000));

        tokio::time::advance(MIN_REARM_DELAY - Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(renewer.calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(renewer.calls.load(Ordering::SeqCst), 2);
    }

    /// Validates that `cancel` disarms and the timer never fires.
    #[tokio::test(start_paused = true)]
    async fn test_cancel_disarms() {
        let (_clock, scheduler, renewer) = setup(false);
        scheduler.arm(&tokens(1000, 400), weak(&renewer));
        scheduler.cancel();

        assert!(!scheduler.is_armed());
        assert_eq!(scheduler.fire_at(), None);

        tokio::time::advance(Duration::from_secs(600)).await;
        settle().await;
        assert_eq!(renewer.calls.load(Ordering::SeqCst), 0);
    }
}
