//! Core domain types

use std::fmt;

use crate::error::LoginError;

/// Namespace used when the login omits one
pub const DEFAULT_NAMESPACE: &str = "default";

/// A parsed SSH login: `principal@workload[.namespace]`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Login {
    /// Service account the user authenticates as
    pub principal: String,
    /// Pod the session is bridged into
    pub workload: String,
    /// Namespace of both the pod and the service account
    pub namespace: String,
}

impl Login {
    /// Parse a raw SSH username.
    ///
    /// Splits on the first `@`, then the remainder on the first `.`. A
    /// missing namespace falls back to `default_namespace`.
    pub fn parse(raw: &str, default_namespace: &str) -> Result<Self, LoginError> {
        let (principal, remainder) = raw
            .split_once('@')
            .ok_or_else(|| LoginError::MalformedLogin(raw.to_string()))?;

        let (workload, namespace) = remainder
            .split_once('.')
            .unwrap_or((remainder, default_namespace));

        Ok(Self {
            principal: principal.to_string(),
            workload: workload.to_string(),
            namespace: namespace.to_string(),
        })
    }

    /// Username the cluster sees when impersonating this principal
    pub fn impersonation_name(&self) -> String {
        service_account_username(&self.namespace, &self.principal)
    }
}

impl fmt::Display for Login {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}.{}", self.principal, self.workload, self.namespace)
    }
}

/// Cluster username of a service account
pub fn service_account_username(namespace: &str, name: &str) -> String {
    format!("system:serviceaccount:{}:{}", namespace, name)
}
