//! Testing utilities
//!
//! - **[`mocks`]**: in-memory keychain and scriptable OAuth provider
//!
//! The wall-clock mock lives in [`crate::time::MockClock`] and is re-exported
//! here for convenience.
//!
//! ## Usage
//!
//! ```rust
//! use tether_common::testing::{MockClock, MockKeychainProvider, MockOAuthClient};
//!
//! let clock = MockClock::at_secs(1_000);
//! let keychain = MockKeychainProvider::new("tether.test");
//! let provider = MockOAuthClient::new();
//! assert!(keychain.is_empty());
//! assert_eq!(provider.refresh_count(), 0);
//! # let _ = clock;
//! ```

pub mod mocks;

pub use mocks::{MockFailure, MockKeychainProvider, MockOAuthClient};

pub use crate::time::MockClock;
