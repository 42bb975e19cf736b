//! The cluster-facing collaborators of the controller.
//!
//! The controller never talks to an API server directly. Reading requests,
//! writing their status and managing workers go through [`ClusterClient`];
//! turning secret and certificate bundle references into material a worker
//! can use goes through [`CredentialResolver`].

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::k8sapitypes::{ObjectMeta, OwnerReference};

/// Identifies a volume request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestKey {
    /// Namespace of the request.
    pub namespace: String,
    /// Name of the request.
    pub name: String,
}

impl RequestKey {
    /// Create a key.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A storage volume request, reduced to what the controller uses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeRequest {
    /// Object metadata; import intent lives in the annotations.
    pub metadata: ObjectMeta,
    /// The requested storage quantity, e.g. `20M`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_capacity: Option<String>,
    /// Import status.
    #[serde(default)]
    pub status: RequestStatus,
}

/// The import status of a request; the only externally visible outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestStatus {
    /// Whether the volume holds the imported image.
    pub ready: bool,
    /// Phase of the worker this status refers to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<WorkerPhase>,
    /// Reason code of the last failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Human readable detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Fingerprint of the import intent this status refers to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_intent: Option<String>,
}

/// Lifecycle of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkerPhase {
    /// Created, not yet running.
    Pending,
    /// Running the import.
    Running,
    /// Exited successfully.
    Succeeded,
    /// Exited with a failure.
    Failed,
}

impl WorkerPhase {
    /// Whether the worker has exited.
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerPhase::Succeeded | WorkerPhase::Failed)
    }
}

/// Everything needed to create a worker.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSpec {
    /// Worker name, derived from the request name.
    pub name: String,
    /// Namespace, the same as the request's.
    pub namespace: String,
    /// The owning request.
    pub owner: OwnerReference,
    /// Image to run.
    pub image: String,
    /// Environment carrying the import options.
    pub env: BTreeMap<String, String>,
    /// Where the image is written.
    pub destination: Utf8PathBuf,
    /// Fingerprint of the import intent the worker was created for.
    pub intent: String,
    /// Labels for the worker object.
    pub labels: BTreeMap<String, String>,
}

// The environment holds credentials.
impl fmt::Debug for WorkerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerSpec")
            .field("name", &self.name)
            .field("namespace", &self.namespace)
            .field("image", &self.image)
            .field("env", &self.env.keys().collect::<Vec<_>>())
            .field("destination", &self.destination)
            .field("intent", &self.intent)
            .finish_non_exhaustive()
    }
}

impl WorkerSpec {
    /// The request owning this worker.
    pub fn request_key(&self) -> RequestKey {
        RequestKey::new(&self.namespace, &self.owner.name)
    }
}

/// A worker as observed in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Worker {
    /// What the worker was created with.
    pub spec: WorkerSpec,
    /// Current phase.
    pub phase: WorkerPhase,
    /// The termination message, once terminated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_message: Option<String>,
}

/// Errors from cluster operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The object does not exist.
    #[error("not found")]
    NotFound,
    /// An object with the same identity already exists.
    #[error("already exists")]
    AlreadyExists,
    /// The object changed since it was read.
    #[error("conflicting update")]
    Conflict,
    /// Anything else.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Access to requests and workers in the cluster.
#[async_trait]
pub trait ClusterClient: Send + Sync + fmt::Debug {
    /// Fetch a request; `None` if it doesn't exist.
    async fn get_request(&self, key: &RequestKey) -> Result<Option<VolumeRequest>, ClientError>;

    /// Replace the status of a request. Fails with [`ClientError::Conflict`]
    /// if `resource_version` is set and no longer current.
    async fn update_request_status(
        &self,
        key: &RequestKey,
        resource_version: Option<&str>,
        status: &RequestStatus,
    ) -> Result<(), ClientError>;

    /// Fetch a worker; `None` if it doesn't exist.
    async fn get_worker(&self, namespace: &str, name: &str) -> Result<Option<Worker>, ClientError>;

    /// Create a worker. Fails with [`ClientError::AlreadyExists`] if a worker
    /// with the same name exists.
    async fn create_worker(&self, spec: &WorkerSpec) -> Result<(), ClientError>;

    /// Delete a worker. Fails with [`ClientError::NotFound`] if it doesn't exist.
    async fn delete_worker(&self, namespace: &str, name: &str) -> Result<(), ClientError>;
}

/// Key material resolved from a secret.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    /// Access key or user name.
    pub access_key: String,
    /// Secret key or password.
    pub secret_key: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .finish_non_exhaustive()
    }
}

/// Resolves references in import annotations before a worker starts.
#[async_trait]
pub trait CredentialResolver: Send + Sync + fmt::Debug {
    /// Resolve a secret reference into credentials.
    async fn resolve_secret(&self, namespace: &str, name: &str) -> anyhow::Result<Credentials>;

    /// Resolve a certificate bundle reference into the directory where the
    /// worker finds its PEM trust anchors.
    async fn resolve_cert_bundle(&self, namespace: &str, name: &str)
        -> anyhow::Result<Utf8PathBuf>;
}
