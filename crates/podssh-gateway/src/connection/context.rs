//! Connection context
//!
//! Created when a connection is accepted and shared between the SSH
//! handler and the listener. Holds the identity resolved for the
//! connection so key checks and sessions reuse one directory lookup.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use russh_keys::key::PublicKey;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use podssh_core::AuthError;

use crate::auth::{Identity, IdentityResolver};

/// State of one accepted connection
#[derive(Debug)]
pub struct ConnectionContext {
    /// Correlation id used in every log line of this connection
    pub conn_id: Uuid,
    pub peer: SocketAddr,
    /// Cancelled when the connection ends; sessions hold child tokens
    pub cancel: CancellationToken,
    identity: OnceCell<Arc<Identity>>,
    authenticated: AtomicBool,
}

impl ConnectionContext {
    /// Create a context whose token is a child of `parent`
    pub fn new(peer: SocketAddr, parent: &CancellationToken) -> Self {
        Self {
            conn_id: Uuid::new_v4(),
            peer,
            cancel: parent.child_token(),
            identity: OnceCell::new(),
            authenticated: AtomicBool::new(false),
        }
    }

    /// Identity for `raw_login`, resolving it on first use.
    ///
    /// Once resolved, the connection is bound to that login and any other
    /// login is refused.
    pub async fn identity(
        &self,
        raw_login: &str,
        resolver: &IdentityResolver,
    ) -> Result<Arc<Identity>, AuthError> {
        let identity = self
            .identity
            .get_or_try_init(|| async { resolver.resolve(raw_login).await.map(Arc::new) })
            .await?;

        if identity.raw_login != raw_login {
            return Err(AuthError::LoginChanged {
                bound: identity.raw_login.clone(),
                requested: raw_login.to_string(),
            });
        }

        Ok(Arc::clone(identity))
    }

    /// Check a presented public key for `raw_login`.
    ///
    /// Marks the connection authenticated when the key matches the
    /// account's authorized key. Lookup failures and a change of login are
    /// errors; a key that simply does not match is `Ok(false)`.
    pub async fn verify_key(
        &self,
        raw_login: &str,
        key: &PublicKey,
        resolver: &IdentityResolver,
    ) -> Result<bool, AuthError> {
        let identity = self.identity(raw_login, resolver).await?;
        if !identity.accepts_key(key) {
            return Ok(false);
        }

        self.mark_authenticated();
        Ok(true)
    }

    /// Identity resolved so far, if any
    pub fn resolved_identity(&self) -> Option<Arc<Identity>> {
        self.identity.get().cloned()
    }

    pub fn mark_authenticated(&self) {
        self.authenticated.store(true, Ordering::SeqCst);
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    /// Whether the connection should count against its source address.
    ///
    /// Only connections that never authenticated do; failed sessions of an
    /// authenticated user are not setup failures.
    pub fn should_penalize(&self) -> bool {
        !self.is_authenticated()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{MemoryDirectory, ObjectKind};

    fn resolver() -> (Arc<MemoryDirectory>, IdentityResolver) {
        let directory = Arc::new(MemoryDirectory::new());
        directory.insert(
            ObjectKind::ServiceAccount,
            "prod",
            "alice",
            Vec::<(String, String)>::new(),
        );
        directory.insert(
            ObjectKind::ServiceAccount,
            "prod",
            "bob",
            Vec::<(String, String)>::new(),
        );
        let resolver = IdentityResolver::new(
            Arc::clone(&directory) as Arc<dyn crate::directory::ClusterDirectory>,
            "default",
            "ssh.barpilot.io/publickey",
        );
        (directory, resolver)
    }

    fn context() -> ConnectionContext {
        ConnectionContext::new("198.51.100.4:40000".parse().unwrap(), &CancellationToken::new())
    }

    #[tokio::test]
    async fn test_identity_is_resolved_once() {
        let (directory, resolver) = resolver();
        let context = context();

        let first = context.identity("alice@web-1.prod", &resolver).await.unwrap();
        let second = context.identity("alice@web-1.prod", &resolver).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(directory.lookups(), 1);
        assert_eq!(context.resolved_identity().unwrap().principal(), "alice");
    }

    #[tokio::test]
    async fn test_other_login_is_refused() {
        let (_directory, resolver) = resolver();
        let context = context();

        context.identity("alice@web-1.prod", &resolver).await.unwrap();
        let err = context
            .identity("bob@web-1.prod", &resolver)
            .await
            .unwrap_err();

        assert!(matches!(err, AuthError::LoginChanged { .. }));
    }

    #[tokio::test]
    async fn test_failed_resolution_is_not_cached() {
        let (directory, resolver) = resolver();
        let context = context();

        assert!(context.identity("carol@web-1.prod", &resolver).await.is_err());
        assert!(context.resolved_identity().is_none());
        assert!(context.identity("alice@web-1.prod", &resolver).await.is_ok());
        assert_eq!(directory.lookups(), 2);
    }

    #[tokio::test]
    async fn test_key_checks_stay_bound_to_first_login() {
        use russh_keys::key::KeyPair;
        use russh_keys::PublicKeyBase64;

        let key = KeyPair::generate_ed25519()
            .unwrap()
            .clone_public_key()
            .unwrap();
        let other = KeyPair::generate_ed25519()
            .unwrap()
            .clone_public_key()
            .unwrap();
        let annotation = [(
            "ssh.barpilot.io/publickey".to_string(),
            format!("{} {}", key.name(), key.public_key_base64()),
        )];

        let directory = Arc::new(MemoryDirectory::new());
        directory.insert(ObjectKind::ServiceAccount, "prod", "alice", annotation.clone());
        directory.insert(ObjectKind::ServiceAccount, "prod", "bob", annotation);
        let resolver = IdentityResolver::new(
            Arc::clone(&directory) as Arc<dyn crate::directory::ClusterDirectory>,
            "default",
            "ssh.barpilot.io/publickey",
        );
        let context = context();

        assert!(!context.verify_key("alice@web-1.prod", &other, &resolver).await.unwrap());
        assert!(!context.is_authenticated());

        let err = context
            .verify_key("bob@web-1.prod", &key, &resolver)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::LoginChanged { .. }));
        assert!(!context.is_authenticated());

        assert!(context.verify_key("alice@web-1.prod", &key, &resolver).await.unwrap());
        assert!(context.is_authenticated());
        assert_eq!(directory.lookups(), 1);
    }

    #[test]
    fn test_only_unauthenticated_connections_are_penalized() {
        let context = context();
        assert!(context.should_penalize());

        context.mark_authenticated();
        assert!(!context.should_penalize());
    }

    #[test]
    fn test_cancel_follows_parent() {
        let parent = CancellationToken::new();
        let context = ConnectionContext::new("203.0.113.9:22".parse().unwrap(), &parent);

        parent.cancel();
        assert!(context.cancel.is_cancelled());
    }
}
