//! Authentication for the gateway
//!
//! Users authenticate as a service account named in their login. The
//! account's `authorized_key` annotation is the trust anchor for public key
//! authentication; password authentication is a pluggable hook that rejects
//! everything by default.

mod identity;
pub(crate) mod keys;
mod password;

pub use identity::{Identity, IdentityResolver};
pub use keys::AuthorizedKey;
pub use password::{PasswordVerifier, RejectAllPasswords};
