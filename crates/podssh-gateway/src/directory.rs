//! Cluster directory: read access to pods and service accounts
//!
//! The gateway only ever needs object metadata, so the directory hands out
//! names and annotations. It uses the gateway's own credentials; exec calls
//! go through impersonated clients built by the execution bridge instead.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use k8s_openapi::api::core::v1::{Pod, ServiceAccount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::Api;
use kube::Client;

use podssh_core::DirectoryError;

/// Object annotations
pub type Annotations = BTreeMap<String, String>;

/// Kinds of object the gateway looks up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Pod,
    ServiceAccount,
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjectKind::Pod => write!(f, "pod"),
            ObjectKind::ServiceAccount => write!(f, "serviceaccount"),
        }
    }
}

/// Metadata of a cluster object
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterObject {
    pub name: String,
    pub namespace: String,
    pub annotations: Annotations,
}

impl ClusterObject {
    /// Look up an annotation
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    fn from_meta(meta: ObjectMeta) -> Self {
        Self {
            name: meta.name.unwrap_or_default(),
            namespace: meta.namespace.unwrap_or_default(),
            annotations: meta.annotations.unwrap_or_default(),
        }
    }
}

/// Read-only view of the cluster
#[async_trait]
pub trait ClusterDirectory: Send + Sync {
    /// Fetch an object; `Ok(None)` when it does not exist
    async fn get_object(
        &self,
        kind: ObjectKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ClusterObject>, DirectoryError>;
}

/// Directory backed by the cluster API
#[derive(Clone)]
pub struct KubeDirectory {
    client: Client,
}

impl KubeDirectory {
    /// Create a directory using the gateway's own client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterDirectory for KubeDirectory {
    async fn get_object(
        &self,
        kind: ObjectKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ClusterObject>, DirectoryError> {
        let meta = match kind {
            ObjectKind::Pod => Api::<Pod>::namespaced(self.client.clone(), namespace)
                .get_opt(name)
                .await
                .map(|pod| pod.map(|p| p.metadata)),
            ObjectKind::ServiceAccount => {
                Api::<ServiceAccount>::namespaced(self.client.clone(), namespace)
                    .get_opt(name)
                    .await
                    .map(|sa| sa.map(|s| s.metadata))
            }
        }
        .map_err(directory_error)?;

        Ok(meta.map(ClusterObject::from_meta))
    }
}

fn directory_error(err: kube::Error) -> DirectoryError {
    match err {
        kube::Error::Api(response) => DirectoryError::Api {
            code: response.code,
            message: response.message,
        },
        other => DirectoryError::Client(other.to_string()),
    }
}

/// In-memory directory, used by tests and local experiments
#[derive(Default)]
pub struct MemoryDirectory {
    objects: DashMap<(ObjectKind, String, String), ClusterObject>,
    lookups: AtomicUsize,
}

impl MemoryDirectory {
    /// Create an empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an object
    pub fn insert(
        &self,
        kind: ObjectKind,
        namespace: &str,
        name: &str,
        annotations: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
    ) {
        let object = ClusterObject {
            name: name.to_string(),
            namespace: namespace.to_string(),
            annotations: annotations
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        };
        self.objects
            .insert((kind, namespace.to_string(), name.to_string()), object);
    }

    /// Number of lookups served so far
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClusterDirectory for MemoryDirectory {
    async fn get_object(
        &self,
        kind: ObjectKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ClusterObject>, DirectoryError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .objects
            .get(&(kind, namespace.to_string(), name.to_string()))
            .map(|entry| entry.value().clone()))
    }
}
