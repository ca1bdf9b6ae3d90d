//! Password authentication hook

use super::identity::Identity;

/// Decides whether a password authenticates an identity
pub trait PasswordVerifier: Send + Sync {
    fn verify(&self, identity: &Identity, password: &str) -> bool;
}

/// Default verifier: no password is ever accepted
#[derive(Debug, Default, Clone, Copy)]
pub struct RejectAllPasswords;

impl PasswordVerifier for RejectAllPasswords {
    fn verify(&self, _identity: &Identity, _password: &str) -> bool {
        false
    }
}
