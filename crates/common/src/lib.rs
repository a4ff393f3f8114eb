//! Shared foundations for tether crates.
//!
//! # Safety and Quality
//!
//! This crate enforces strict safety and quality standards to ensure
//! reliability across all tether components.
//!
//! # Feature Tiers
//!
//! Enable cargo features to opt into the tiers you need:
//! - `foundation`: errors and the wall-clock abstraction
//! - `platform`: OAuth client, PKCE and keychain storage
//! - `test-utils`: mock provider and mock keychain

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

// Foundation tier
// -----------------------------------------------------------------
#[cfg(feature = "foundation")]
pub mod error;
#[cfg(feature = "foundation")]
pub mod time;

// Platform tier
// -------------------------------------------------------------------
#[cfg(feature = "platform")]
pub mod auth;
#[cfg(feature = "platform")]
pub mod security;

// Testing utilities
// ---------------------------------------------------------------
#[cfg(any(feature = "test-utils", all(test, feature = "platform")))]
pub mod testing;

// Re-export commonly used types and traits for convenience
// ------------------------
#[cfg(feature = "foundation")]
pub use error::{CommonError, CommonResult, ErrorClassification, ErrorSeverity};
#[cfg(feature = "platform")]
pub use security::{KeychainError, KeychainProvider, SecureStore};
#[cfg(feature = "foundation")]
pub use time::{Clock, MockClock, SystemClock};
