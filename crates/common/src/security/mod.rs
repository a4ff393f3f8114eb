//! Security primitives
//!
//! Encrypted-at-rest credential storage behind the [`SecureStore`] trait.

pub mod keychain;

pub use keychain::{KeychainError, KeychainProvider, SecureStore};
