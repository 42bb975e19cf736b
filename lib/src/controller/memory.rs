//! In-memory implementations of the controller collaborators, for tests.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use camino::Utf8PathBuf;

use super::{
    ClientError, ClusterClient, CredentialResolver, Credentials, RequestKey, RequestStatus,
    VolumeRequest, Worker, WorkerPhase, WorkerSpec,
};

#[derive(Debug, Default)]
struct State {
    requests: BTreeMap<RequestKey, VolumeRequest>,
    workers: BTreeMap<(String, String), Worker>,
    version: u64,
}

impl State {
    fn bump(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }
}

/// A cluster holding requests and workers in memory. Status updates use
/// resource versions like a real API server; conflicts can be injected.
#[derive(Debug, Default)]
pub struct MemoryCluster {
    state: Mutex<State>,
    workers_created: AtomicUsize,
    status_updates: AtomicUsize,
    pending_conflicts: AtomicUsize,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Add or replace a request; returns its key.
    pub fn put_request(&self, mut req: VolumeRequest) -> RequestKey {
        let key = RequestKey::new(
            req.metadata.namespace.clone().unwrap_or_else(|| "default".into()),
            req.metadata.name.clone().unwrap_or_default(),
        );
        let mut s = self.lock();
        req.metadata.namespace = Some(key.namespace.clone());
        req.metadata.resource_version = Some(s.bump());
        if req.metadata.uid.is_none() {
            req.metadata.uid = Some(format!("uid-{}", key.name));
        }
        s.requests.insert(key.clone(), req);
        key
    }

    pub fn request(&self, key: &RequestKey) -> Option<VolumeRequest> {
        self.lock().requests.get(key).cloned()
    }

    /// Replace the annotations of a request.
    pub fn set_annotations(&self, key: &RequestKey, annotations: BTreeMap<String, String>) {
        let mut s = self.lock();
        let version = s.bump();
        if let Some(r) = s.requests.get_mut(key) {
            r.metadata.annotations = Some(annotations);
            r.metadata.resource_version = Some(version);
        }
    }

    pub fn delete_request(&self, key: &RequestKey) {
        self.lock().requests.remove(key);
    }

    pub fn worker(&self, namespace: &str, name: &str) -> Option<Worker> {
        self.lock()
            .workers
            .get(&(namespace.to_owned(), name.to_owned()))
            .cloned()
    }

    pub fn worker_count(&self) -> usize {
        self.lock().workers.len()
    }

    /// Move a worker to `phase`, as the platform would.
    pub fn set_worker_phase(
        &self,
        namespace: &str,
        name: &str,
        phase: WorkerPhase,
        termination_message: Option<String>,
    ) {
        let mut s = self.lock();
        if let Some(w) = s.workers.get_mut(&(namespace.to_owned(), name.to_owned())) {
            w.phase = phase;
            w.termination_message = termination_message;
        }
    }

    /// Total number of successful worker creations.
    pub fn workers_created(&self) -> usize {
        self.workers_created.load(Ordering::SeqCst)
    }

    /// Total number of successful status writes.
    pub fn status_updates(&self) -> usize {
        self.status_updates.load(Ordering::SeqCst)
    }

    /// Make the next `n` versioned status updates fail with a conflict,
    /// bumping the stored version each time as a concurrent writer would.
    pub fn inject_conflicts(&self, n: usize) {
        self.pending_conflicts.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl ClusterClient for MemoryCluster {
    async fn get_request(&self, key: &RequestKey) -> Result<Option<VolumeRequest>, ClientError> {
        Ok(self.request(key))
    }

    async fn update_request_status(
        &self,
        key: &RequestKey,
        resource_version: Option<&str>,
        status: &RequestStatus,
    ) -> Result<(), ClientError> {
        let mut s = self.lock();
        let injected = self
            .pending_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let version = s.bump();
        let r = s.requests.get_mut(key).ok_or(ClientError::NotFound)?;
        if injected {
            r.metadata.resource_version = Some(version);
            return Err(ClientError::Conflict);
        }
        if let Some(expected) = resource_version {
            if r.metadata.resource_version.as_deref() != Some(expected) {
                return Err(ClientError::Conflict);
            }
        }
        r.status = status.clone();
        r.metadata.resource_version = Some(version);
        self.status_updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_worker(&self, namespace: &str, name: &str) -> Result<Option<Worker>, ClientError> {
        Ok(self.worker(namespace, name))
    }

    async fn create_worker(&self, spec: &WorkerSpec) -> Result<(), ClientError> {
        let mut s = self.lock();
        let id = (spec.namespace.clone(), spec.name.clone());
        if s.workers.contains_key(&id) {
            return Err(ClientError::AlreadyExists);
        }
        s.workers.insert(
            id,
            Worker {
                spec: spec.clone(),
                phase: WorkerPhase::Pending,
                termination_message: None,
            },
        );
        self.workers_created.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete_worker(&self, namespace: &str, name: &str) -> Result<(), ClientError> {
        self.lock()
            .workers
            .remove(&(namespace.to_owned(), name.to_owned()))
            .map(|_| ())
            .ok_or(ClientError::NotFound)
    }
}

/// Resolves references from fixed tables.
#[derive(Debug, Default)]
pub struct StaticCredentials {
    secrets: BTreeMap<String, Credentials>,
    cert_bundles: BTreeMap<String, Utf8PathBuf>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(mut self, name: &str, access_key: &str, secret_key: &str) -> Self {
        self.secrets.insert(
            name.to_owned(),
            Credentials {
                access_key: access_key.to_owned(),
                secret_key: secret_key.to_owned(),
            },
        );
        self
    }

    pub fn with_cert_bundle(mut self, name: &str, dir: impl Into<Utf8PathBuf>) -> Self {
        self.cert_bundles.insert(name.to_owned(), dir.into());
        self
    }
}

#[async_trait]
impl CredentialResolver for StaticCredentials {
    async fn resolve_secret(&self, namespace: &str, name: &str) -> anyhow::Result<Credentials> {
        self.secrets
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Secret {namespace}/{name} not found"))
    }

    async fn resolve_cert_bundle(
        &self,
        namespace: &str,
        name: &str,
    ) -> anyhow::Result<Utf8PathBuf> {
        self.cert_bundles
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Certificate bundle {namespace}/{name} not found"))
    }
}
