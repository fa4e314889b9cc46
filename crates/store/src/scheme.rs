//! Pluggable verifier schemes.
//!
//! A stored verifier has the form `scheme:payload`, where the scheme is the prefix up to the
//! first `:`. Verifiers without a recognized scheme prefix are treated as bare legacy bcrypt
//! hashes.

use std::{collections::BTreeMap, sync::Arc};

use crate::errors::StoreError;

/// Verifies a secret against a scheme-specific verifier payload.
pub trait VerifierScheme: Send + Sync {
    fn verify(&self, payload: &str, secret: &str) -> Result<bool, StoreError>;
}

/// Dispatches verification to the scheme named by the verifier's prefix.
///
/// Adding a scheme is a registry insertion; the authenticator store itself never changes.
pub struct SchemeRegistry {
    schemes: BTreeMap<String, Arc<dyn VerifierScheme>>,
}

impl SchemeRegistry {
    /// Creates a registry with the built-in schemes registered.
    pub fn with_default_schemes() -> Self {
        let mut registry = Self { schemes: BTreeMap::new() };
        registry.register("bcrypt", Arc::new(BcryptScheme));
        #[cfg(any(test, feature = "testing"))]
        registry.register("plaintext", Arc::new(PlaintextScheme));
        registry
    }

    /// Registers `scheme` under `name`, replacing any previous registration.
    pub fn register(&mut self, name: impl Into<String>, scheme: Arc<dyn VerifierScheme>) {
        self.schemes.insert(name.into(), scheme);
    }

    /// Verifies `secret` against a stored verifier string.
    pub fn verify(&self, verifier: &str, secret: &str) -> Result<bool, StoreError> {
        if let Some((scheme, payload)) = verifier.split_once(':') {
            if let Some(handler) = self.schemes.get(scheme) {
                return handler.verify(payload, secret);
            }
        }

        // No recognized type prefix, assume an unprefixed bcrypt hash.
        BcryptScheme.verify(verifier, secret)
    }
}

/// Salted bcrypt hash comparison: the secret is re-hashed with the salt embedded in the stored
/// payload and compared against it.
pub struct BcryptScheme;

impl VerifierScheme for BcryptScheme {
    fn verify(&self, payload: &str, secret: &str) -> Result<bool, StoreError> {
        bcrypt::verify(secret, payload).map_err(StoreError::InvalidVerifier)
    }
}

/// Literal equality, for test suites only.
#[cfg(any(test, feature = "testing"))]
pub struct PlaintextScheme;

#[cfg(any(test, feature = "testing"))]
impl VerifierScheme for PlaintextScheme {
    fn verify(&self, payload: &str, secret: &str) -> Result<bool, StoreError> {
        Ok(payload == secret)
    }
}
