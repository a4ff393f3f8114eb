//! Integration tests for the authorization-code + PKCE login flow
//!
//! **Coverage:**
//! - Fresh login persists tokens, claims and schedule, then arms renewal
//! - The flow marker is persisted while the browser is open
//! - Redirect validation: state mismatch, provider error, missing flow
//! - Cancellation, launcher failure and exchange failure

#[path = "support.rs"]
mod support;

use std::sync::Arc;
use std::time::Duration;

use support::{id_token, settle, token_response, Harness};
use tether_common::testing::MockFailure;
use tether_session::{
    keys, AuthFlowMarker, OAuthSettings, SessionConfig, SessionController, SessionError,
    SessionEvent, SessionState, TokenKind, TokioBackgroundScheduler, BACKGROUND_TASK_NAME,
};

/// Validates the fresh-login scenario end to end.
///
/// Assertions:
/// - The controller is authenticated as `u1`.
/// - `token_refresh_time` is `(1000 + 3600 - 300) * 1000`.
/// - The flow marker is gone and `SignedIn` was emitted.
/// - The background task is registered at the 15 minute interval.
#[tokio::test]
async fn test_fresh_login_scenario() {
    let h = Harness::new();
    assert_eq!(h.controller.restore().await.unwrap(), SessionState::LoggedOut);
    let mut events = h.controller.subscribe();

    let identity = id_token("u1", 4600);
    h.login_with(token_response("a1", Some("r1"), Some(identity.clone()), 3600)).await.unwrap();

    assert!(h.controller.is_authenticated());
    assert_eq!(h.controller.state(), SessionState::Authenticated);
    let claims = h.controller.claims().unwrap();
    assert_eq!(claims.user_name, "u1");
    assert_eq!(claims.api_key, "key-u1");
    assert_eq!(claims.expires_at, 4600);

    assert_eq!(h.keychain.raw(keys::TOKEN_REFRESH_TIME).as_deref(), Some("4300000"));
    assert!(h.keychain.contains(keys::USER_INFO));
    assert!(!h.keychain.contains(keys::AUTH_STATE));
    assert_eq!(h.persisted_tokens().unwrap().issued_at, 1000);
    assert_eq!(h.controller.next_renewal_at(), Some(4_300_000));
    assert!(h.controller.pending_auth_flow().is_none());

    assert_eq!(events.recv().await.unwrap(), SessionEvent::SignedIn);
    assert_eq!(h.background.interval(BACKGROUND_TASK_NAME), Some(Duration::from_secs(900)));

    assert_eq!(h.controller.get_valid_token(TokenKind::Access).await.as_deref(), Some("a1"));
    assert_eq!(h.controller.get_valid_token(TokenKind::Identity).await, Some(identity));
    assert_eq!(h.provider.exchange_count(), 1);
}

/// Validates the state while the browser is open, and user cancellation.
///
/// Assertions:
/// - The marker is persisted with the start time.
/// - A second `login()` fails with `AlreadyInProgress`.
/// - `cancel_login()` resolves the flow with `Cancelled` and clears the marker.
#[tokio::test]
async fn test_login_in_progress_and_cancel() {
    let h = Harness::new();
    let (login, _state) = h.start_login().await;

    assert_eq!(h.controller.state(), SessionState::AuthInProgress);
    assert!(h.keychain.contains(keys::AUTH_STATE));
    assert_eq!(
        h.controller.pending_auth_flow(),
        Some(AuthFlowMarker { in_progress: true, started_at: 1_000_000 })
    );
    assert!(matches!(h.controller.login().await, Err(SessionError::AlreadyInProgress)));

    assert!(h.controller.cancel_login());
    assert!(matches!(login.await.unwrap(), Err(SessionError::Cancelled)));

    assert_eq!(h.controller.state(), SessionState::LoggedOut);
    assert!(h.controller.pending_auth_flow().is_none());
    assert!(h.keychain.is_empty());
    assert!(!h.controller.cancel_login());
}

/// Validates that a forged or incomplete callback does not consume the flow.
///
/// Assertions:
/// - A wrong state and a missing state are both `StateMismatch`.
/// - The genuine callback afterwards still completes the login.
#[tokio::test]
async fn test_state_mismatch_keeps_flow_waiting() {
    let h = Harness::new();
    h.provider.push_exchange(Ok(token_response("a1", Some("r1"), None, 3600)));
    let (login, state) = h.start_login().await;

    let forged = h.controller.handle_redirect("tether://callback?code=evil&state=forged");
    assert!(matches!(forged, Err(SessionError::StateMismatch)));
    let stateless = h.controller.handle_redirect("tether://callback?code=evil");
    assert!(matches!(stateless, Err(SessionError::StateMismatch)));
    assert_eq!(h.controller.state(), SessionState::AuthInProgress);

    h.controller.handle_redirect(&format!("tether://callback?code=good&state={state}")).unwrap();
    login.await.unwrap().unwrap();
    assert!(h.controller.is_authenticated());
}

/// Validates the provider-error redirect.
///
/// Assertions:
/// - `login()` fails with `Authorization` carrying the code and description.
/// - No exchange is attempted and the controller is `LoggedOut`.
#[tokio::test]
async fn test_provider_error_redirect() {
    let h = Harness::new();
    let (login, state) = h.start_login().await;

    h.controller
        .handle_redirect(&format!(
            "tether://callback?error=access_denied&error_description=User%20denied&state={state}"
        ))
        .unwrap();

    match login.await.unwrap() {
        Err(SessionError::Authorization { error, description }) => {
            assert_eq!(error, "access_denied");
            assert_eq!(description.as_deref(), Some("User denied"));
        }
        other => panic!("expected Authorization error, got {other:?}"),
    }
    assert_eq!(h.provider.exchange_count(), 0);
    assert_eq!(h.controller.state(), SessionState::LoggedOut);
}

/// Validates that a rejected code exchange leaves nothing behind.
#[tokio::test]
async fn test_exchange_failure_returns_to_logged_out() {
    let h = Harness::new();
    h.provider.push_exchange(Err(MockFailure::invalid_grant()));
    let (login, state) = h.start_login().await;

    h.controller.handle_redirect(&format!("tether://callback?code=c&state={state}")).unwrap();
    let result = login.await.unwrap();

    assert!(matches!(result, Err(SessionError::AuthRejected(_))));
    assert_eq!(h.controller.state(), SessionState::LoggedOut);
    assert!(h.keychain.is_empty());
    assert!(!h.background.is_registered(BACKGROUND_TASK_NAME));
}

/// Validates callbacks that cannot be matched to a flow.
///
/// Assertions:
/// - A callback with no pending flow is `NoPendingFlow`.
/// - An unparsable URI is `InvalidRedirect`.
/// - A callback with neither code nor error is `InvalidRedirect`.
#[tokio::test]
async fn test_redirect_rejections() {
    let h = Harness::new();
    assert!(matches!(
        h.controller.handle_redirect("tether://callback?code=c&state=s"),
        Err(SessionError::NoPendingFlow)
    ));
    assert!(matches!(
        h.controller.handle_redirect("not a uri"),
        Err(SessionError::InvalidRedirect(_))
    ));

    let (login, state) = h.start_login().await;
    assert!(matches!(
        h.controller.handle_redirect(&format!("tether://callback?state={state}")),
        Err(SessionError::InvalidRedirect(_))
    ));
    h.controller.cancel_login();
    assert!(login.await.unwrap().is_err());
}

/// Validates that a launcher failure aborts the flow.
#[tokio::test]
async fn test_launch_failure() {
    let h = Harness::new();
    h.launcher.set_fail(true);

    let result = h.controller.login().await;
    assert!(matches!(result, Err(SessionError::LaunchFailed(_))));
    assert_eq!(h.controller.state(), SessionState::LoggedOut);
    assert!(!h.keychain.contains(keys::AUTH_STATE));
}

/// Validates a provider that issues no identity token.
///
/// Assertions:
/// - The session is usable for API calls.
/// - No claims are held or persisted.
#[tokio::test]
async fn test_login_without_identity_token() {
    let h = Harness::new();
    h.login_with(token_response("a1", Some("r1"), None, 3600)).await.unwrap();

    assert!(h.controller.is_authenticated());
    assert!(h.controller.claims().is_none());
    assert!(!h.keychain.contains(keys::USER_INFO));
    assert_eq!(h.controller.get_valid_token(TokenKind::Identity).await, None);
    assert_eq!(h.controller.get_valid_token(TokenKind::Access).await.as_deref(), Some("a1"));
}

/// Validates that dropping the login future resets the controller.
#[tokio::test]
async fn test_abandoned_login_future() {
    let h = Harness::new();
    let (login, state) = h.start_login().await;

    login.abort();
    assert!(login.await.unwrap_err().is_cancelled());
    settle().await;

    assert_eq!(h.controller.state(), SessionState::LoggedOut);
    assert!(!h.keychain.contains(keys::AUTH_STATE));
    assert!(matches!(
        h.controller.handle_redirect(&format!("tether://callback?code=c&state={state}")),
        Err(SessionError::NoPendingFlow)
    ));
}

/// Validates that dropping the login future while the session is being
/// written leaves nothing for a later restore.
///
/// Assertions:
/// - The token set was partly written when the future was dropped.
/// - Every key is removed afterwards and the controller is `LoggedOut`.
#[tokio::test(start_paused = true)]
async fn test_login_dropped_while_persisting() {
    let h = Harness::new();
    h.provider
        .push_exchange(Ok(token_response("a1", Some("r1"), Some(id_token("u1", 4600)), 3600)));
    let (login, state) = h.start_login().await;
    h.keychain.set_write_delay(Duration::from_secs(1));

    h.controller.handle_redirect(&format!("tether://callback?code=c&state={state}")).unwrap();
    settle().await;
    assert!(h.keychain.contains(keys::AUTH_TOKENS));
    assert!(!h.keychain.contains(keys::USER_INFO));

    login.abort();
    assert!(login.await.unwrap_err().is_cancelled());
    settle().await;

    assert_eq!(h.controller.state(), SessionState::LoggedOut);
    assert!(h.keychain.is_empty());
}

/// Validates that logging in again while signed in is a no-op.
#[tokio::test]
async fn test_login_when_already_authenticated() {
    let h = Harness::new();
    h.login_default().await;

    h.controller.login().await.unwrap();
    assert_eq!(h.launcher.launched().len(), 1);
    assert_eq!(h.provider.exchange_count(), 1);
}

/// Validates production wiring from configuration.
///
/// Assertions:
/// - A valid configuration yields an `Uninitialized` controller.
/// - An invalid one is rejected before anything is built.
#[tokio::test]
async fn test_from_config() {
    let launcher = Arc::new(support::RecordingLauncher::default());
    let background = Arc::new(TokioBackgroundScheduler::new());
    let config = SessionConfig::new(OAuthSettings::new(
        "https://login.example.com",
        "client-1",
        "tether://callback",
    ));

    let controller =
        SessionController::from_config(&config, launcher.clone(), background.clone()).unwrap();
    assert_eq!(controller.state(), SessionState::Uninitialized);

    let mut invalid = config;
    invalid.oauth.client_id = String::new();
    let result = SessionController::from_config(&invalid, launcher, background);
    assert!(matches!(result, Err(SessionError::Common(_))));
}
