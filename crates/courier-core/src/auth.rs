//! Credential verification.
//!
//! Clients and server share one private key. A client's token is the
//! SHA-256 of `name ++ group ++ key`, hex encoded, so the key itself never
//! crosses the wire. The token is not a secret channel: anyone who observes it
//! can replay it. Transport confidentiality is out of scope.

use courier_proto::Credentials;
use sha2::{Digest, Sha256};

/// Decides whether a credential frame is acceptable.
///
/// Implemented by [`TokenVerifier`], [`AllowAll`] and any
/// `Fn(&Credentials) -> bool`, so hosts can plug in their own
/// username/password check.
pub trait Authenticator: Send + Sync + 'static {
    /// Return `true` to accept the session.
    fn verify(&self, credentials: &Credentials) -> bool;
}

impl<F> Authenticator for F
where
    F: Fn(&Credentials) -> bool + Send + Sync + 'static,
{
    fn verify(&self, credentials: &Credentials) -> bool {
        self(credentials)
    }
}

/// Accepts every credential frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authenticator for AllowAll {
    fn verify(&self, _credentials: &Credentials) -> bool {
        true
    }
}

/// Shared-key token derivation and verification. Stateless.
#[derive(Clone)]
pub struct TokenVerifier {
    private_key: String,
}

impl TokenVerifier {
    /// Verifier for `private_key`.
    pub fn new(private_key: impl Into<String>) -> Self {
        Self { private_key: private_key.into() }
    }

    /// Token a client named `name` in `group` must present.
    pub fn token_for(&self, name: &str, group: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(name.as_bytes());
        hasher.update(group.as_bytes());
        hasher.update(self.private_key.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Ready-to-send credentials for `name` in `group`.
    pub fn credentials(&self, name: &str, group: &str) -> Credentials {
        Credentials::new(name, self.token_for(name, group)).with_group(group)
    }
}

impl std::fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenVerifier").finish_non_exhaustive()
    }
}

impl Authenticator for TokenVerifier {
    fn verify(&self, credentials: &Credentials) -> bool {
        let expected = self.token_for(&credentials.name, &credentials.group);
        constant_time_eq(expected.as_bytes(), credentials.token.as_bytes())
    }
}

// Length leaks, content does not.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
