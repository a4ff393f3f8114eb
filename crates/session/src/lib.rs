//! # Tether Session
//!
//! Session and token lifecycle for OAuth2/OIDC public clients using the
//! authorization-code + PKCE flow.
//!
//! This crate contains:
//! - The [`SessionController`] state machine (login, restore, logout)
//! - Proactive renewal via a single-timer [`RefreshScheduler`]
//! - A [`BackgroundRenewalTask`] that renews through the credential store
//! - Identity token decoding into [`IdentityClaims`]
//! - Typed persistence on top of the platform keychain
//!
//! ## Architecture
//! - Provider, keychain and clock seams come from `tether-common`
//! - The controller and the background task share state only through the
//!   [`CredentialStore`]
//! - Hosts supply an [`AuthorizationLauncher`] and a [`BackgroundScheduler`]

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]

pub mod background;
pub mod codec;
pub mod config;
pub mod controller;
pub mod error;
pub mod observability;
pub mod schedule;
pub mod store;

// Re-export commonly used items
pub use background::{
    BackgroundOutcome, BackgroundRenewalTask, BackgroundScheduler, TokioBackgroundScheduler,
    BACKGROUND_TASK_NAME, MIN_BACKGROUND_INTERVAL,
};
pub use codec::{DecodeError, IdentityClaims};
pub use config::{OAuthSettings, SessionConfig};
pub use controller::{
    AppState, AuthorizationLauncher, SessionController, SessionDependencies, SessionEvent,
    SessionSettings, SessionState, TokenKind,
};
pub use error::{SessionError, SessionResult};
pub use observability::{init_tracing, LogFormat};
pub use schedule::{RefreshScheduler, RenewalSchedule, TokenRenewer, MIN_REARM_DELAY};
pub use store::{keys, AuthFlowMarker, CredentialStore};
