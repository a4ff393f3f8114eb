//! PKCE (Proof Key for Code Exchange) for OAuth 2.0
//!
//! Implements RFC 7636. Public clients such as desktop and mobile apps cannot
//! keep a client secret, so each authorization request carries a one-time
//! verifier/challenge pair instead.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::Rng;
use sha2::{Digest, Sha256};

/// Number of random bytes behind verifiers and state tokens (43 base64url chars)
const RANDOM_BYTES: usize = 32;

fn random_url_safe() -> String {
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..RANDOM_BYTES).map(|_| rng.gen()).collect();
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Generate a cryptographically secure code verifier
///
/// Per RFC 7636, verifiers must be 43-128 characters long; this produces 43.
#[must_use]
pub fn generate_code_verifier() -> String {
    random_url_safe()
}

/// Derive the S256 code challenge: `BASE64URL(SHA256(ASCII(code_verifier)))`
#[must_use]
pub fn generate_code_challenge(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Generate a random state token for CSRF protection
#[must_use]
pub fn generate_state() -> String {
    random_url_safe()
}

/// Compare the state sent in the authorization request with the callback's
#[must_use]
pub fn validate_state(expected: &str, actual: &str) -> bool {
    expected.len() == actual.len()
        && expected.bytes().zip(actual.bytes()).fold(0u8, |acc, (a, b)| acc | (a ^ b)) == 0
}

/// PKCE material for one authorization attempt
///
/// The verifier stays in memory until the code exchange; the challenge and
/// state travel in the authorization URL.
#[derive(Debug, Clone)]
pub struct PKCEChallenge {
    /// Random string kept secret until token exchange
    pub code_verifier: String,

    /// SHA256 hash of `code_verifier`, sent in the authorization request
    pub code_challenge: String,

    /// CSRF token that must round-trip through the redirect callback
    pub state: String,
}

impl PKCEChallenge {
    /// Generate a fresh challenge
    ///
    /// ```
    /// use tether_common::auth::pkce::PKCEChallenge;
    ///
    /// let challenge = PKCEChallenge::generate();
    /// assert!(challenge.code_verifier.len() >= 43);
    /// assert_eq!(challenge.challenge_method(), "S256");
    /// ```
    #[must_use]
    pub fn generate() -> Self {
        let code_verifier = generate_code_verifier();
        let code_challenge = generate_code_challenge(&code_verifier);
        Self { code_verifier, code_challenge, state: generate_state() }
    }

    /// Get the challenge method (always "S256")
    #[must_use]
    pub fn challenge_method(&self) -> &'static str {
        "S256"
    }
}
