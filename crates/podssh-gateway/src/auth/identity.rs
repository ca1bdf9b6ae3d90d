//! Identity resolution
//!
//! Maps an SSH login onto the service account it names and extracts the
//! public key that account trusts.

use std::sync::Arc;

use russh_keys::key::PublicKey;

use podssh_core::{AuthError, Login};

use super::keys::AuthorizedKey;
use crate::directory::{ClusterDirectory, ObjectKind};

/// A validated login
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Raw SSH username this identity was resolved from
    pub raw_login: String,
    /// Parsed principal, workload and namespace
    pub login: Login,
    /// Key accepted for this principal, if the account carries one
    pub authorized_key: Option<AuthorizedKey>,
}

impl Identity {
    pub fn principal(&self) -> &str {
        &self.login.principal
    }

    pub fn workload(&self) -> &str {
        &self.login.workload
    }

    pub fn namespace(&self) -> &str {
        &self.login.namespace
    }

    /// Username the exec call is impersonated as
    pub fn impersonation_name(&self) -> String {
        self.login.impersonation_name()
    }

    /// Key authentication predicate.
    ///
    /// Without an authorized key every presented key is rejected.
    pub fn accepts_key(&self, presented: &PublicKey) -> bool {
        self.authorized_key
            .as_ref()
            .is_some_and(|key| key.matches(presented))
    }
}

/// Resolves logins against the cluster directory
pub struct IdentityResolver {
    directory: Arc<dyn ClusterDirectory>,
    default_namespace: String,
    key_annotation: String,
}

impl IdentityResolver {
    /// Create a resolver
    pub fn new(
        directory: Arc<dyn ClusterDirectory>,
        default_namespace: impl Into<String>,
        key_annotation: impl Into<String>,
    ) -> Self {
        Self {
            directory,
            default_namespace: default_namespace.into(),
            key_annotation: key_annotation.into(),
        }
    }

    /// Resolve a raw SSH username.
    ///
    /// Malformed logins fail before any directory lookup.
    pub async fn resolve(&self, raw_login: &str) -> Result<Identity, AuthError> {
        let login = Login::parse(raw_login, &self.default_namespace)?;

        let account = self
            .directory
            .get_object(ObjectKind::ServiceAccount, &login.namespace, &login.principal)
            .await?
            .ok_or_else(|| AuthError::IdentityNotFound {
                namespace: login.namespace.clone(),
                name: login.principal.clone(),
            })?;

        let authorized_key = account
            .annotation(&self.key_annotation)
            .map(AuthorizedKey::parse)
            .transpose()
            .map_err(|reason| AuthError::InvalidAuthorizedKey {
                namespace: login.namespace.clone(),
                name: login.principal.clone(),
                reason,
            })?;

        if authorized_key.is_none() {
            tracing::debug!(
                user = %raw_login,
                "Service account has no authorized key, key authentication will fail"
            );
        }

        Ok(Identity {
            raw_login: raw_login.to_string(),
            login,
            authorized_key,
        })
    }
}
