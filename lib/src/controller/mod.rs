//! # The reconciliation controller
//!
//! Maps each volume request carrying import annotations onto exactly one
//! worker, and reflects the worker's outcome back onto the request status.
//!
//! Reconciliation is level-triggered: [`Controller::reconcile`] looks at the
//! current request and worker and takes one step towards the desired state.
//! It is safe to call any number of times, concurrently too; worker
//! creation is conditional on absence, so at most one creation succeeds.
//!
//! When the import intent changes while a worker runs, the worker is left
//! to finish. Its outcome then no longer matches the intent, so it is
//! discarded and a worker for the new intent takes its place.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::annotations::ImportAnnotations;
use crate::config::ControllerConfig;
use crate::k8sapitypes::OwnerReference;
use crate::options::{parse_capacity, ImportOptions, SourceKind};
use crate::tokio_util::run_with_cancellation;
use crate::worker::{TerminationMessage, ENV_FETCH_TIMEOUT, ENV_S3_REGION, ENV_UPLOAD_LISTEN};

mod client;
pub use client::*;
mod queue;
pub use queue::WorkQueue;
#[cfg(any(test, feature = "internal-testing-api"))]
pub mod memory;

/// Prefix of worker names; the rest is the request name.
const WORKER_PREFIX: &str = "importer-";
/// Label linking a worker to its request.
pub const LABEL_REQUEST: &str = "import.vmimport.dev/request";

const REASON_INVALID_ANNOTATIONS: &str = "InvalidAnnotations";
const REASON_CREDENTIALS: &str = "CredentialResolutionError";
const REASON_WORKER_FAILED: &str = "WorkerFailed";

/// The name of the worker serving the request `name`.
pub fn worker_name(name: &str) -> String {
    format!("{WORKER_PREFIX}{name}")
}

/// What a reconcile pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    /// The request doesn't ask for an import.
    Ignored,
    /// The request is gone; its worker was removed.
    Deleted,
    /// The annotations or references are invalid; recorded on the status.
    Rejected,
    /// A worker was created.
    Created,
    /// A worker is pending or running.
    Waiting,
    /// The import succeeded.
    Succeeded,
    /// The import failed.
    Failed,
    /// The outcome is already recorded; nothing to do.
    UpToDate,
    /// A stale worker was removed; reconcile again.
    Requeue,
}

/// The controller. Collaborators are injected at construction.
#[derive(Debug)]
pub struct Controller {
    client: Arc<dyn ClusterClient>,
    credentials: Arc<dyn CredentialResolver>,
    config: ControllerConfig,
}

impl Controller {
    /// Create a controller.
    pub fn new(
        client: Arc<dyn ClusterClient>,
        credentials: Arc<dyn CredentialResolver>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            client,
            credentials,
            config,
        }
    }

    /// The configuration in use.
    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Take one step towards the desired state of the request `key`.
    #[tracing::instrument(skip_all, fields(request = %key))]
    pub async fn reconcile(&self, key: &RequestKey) -> Result<ReconcileAction> {
        let worker_name = worker_name(&key.name);
        let Some(req) = self.client.get_request(key).await? else {
            self.delete_worker(&key.namespace, &worker_name).await?;
            return Ok(ReconcileAction::Deleted);
        };
        if req.metadata.deletion_timestamp.is_some() {
            self.delete_worker(&key.namespace, &worker_name).await?;
            return Ok(ReconcileAction::Deleted);
        }

        let intent = match ImportAnnotations::from_meta(&req.metadata) {
            Ok(Some(i)) => i,
            Ok(None) => return Ok(ReconcileAction::Ignored),
            Err(e) => {
                let status = RequestStatus {
                    ready: false,
                    phase: None,
                    reason: Some(REASON_INVALID_ANNOTATIONS.into()),
                    message: Some(format!("{e:#}")),
                    observed_intent: None,
                };
                self.set_status(key, &req, status).await?;
                return Ok(ReconcileAction::Rejected);
            }
        };
        let fingerprint = intent.fingerprint()?;

        let Some(worker) = self.client.get_worker(&key.namespace, &worker_name).await? else {
            return self.start_worker(key, &req, &intent, fingerprint).await;
        };

        if worker.spec.intent != fingerprint {
            if !worker.phase.is_terminal() {
                tracing::debug!("Intent changed; waiting for the current worker to finish");
                return Ok(ReconcileAction::Waiting);
            }
            tracing::info!("Intent changed; discarding outcome of {worker_name}");
            self.delete_worker(&key.namespace, &worker_name).await?;
            return Ok(ReconcileAction::Requeue);
        }

        match worker.phase {
            WorkerPhase::Pending | WorkerPhase::Running => {
                let status = RequestStatus {
                    ready: false,
                    phase: Some(worker.phase),
                    reason: None,
                    message: None,
                    observed_intent: Some(fingerprint),
                };
                self.set_status(key, &req, status).await?;
                Ok(ReconcileAction::Waiting)
            }
            WorkerPhase::Succeeded => {
                let message = worker
                    .termination_message
                    .as_deref()
                    .and_then(|m| TerminationMessage::parse(m).ok())
                    .map(|m| m.message)
                    .unwrap_or_else(|| "Import complete".into());
                let status = RequestStatus {
                    ready: true,
                    phase: Some(WorkerPhase::Succeeded),
                    reason: None,
                    message: Some(message),
                    observed_intent: Some(fingerprint),
                };
                self.set_status(key, &req, status).await?;
                self.delete_worker(&key.namespace, &worker_name).await?;
                tracing::info!("Import succeeded");
                Ok(ReconcileAction::Succeeded)
            }
            WorkerPhase::Failed => {
                let (reason, message) = failure_of(&worker);
                tracing::warn!("Import failed: {reason}: {message}");
                let status = RequestStatus {
                    ready: false,
                    phase: Some(WorkerPhase::Failed),
                    reason: Some(reason),
                    message: Some(message),
                    observed_intent: Some(fingerprint),
                };
                self.set_status(key, &req, status).await?;
                if !self.config.retain_failed_workers {
                    self.delete_worker(&key.namespace, &worker_name).await?;
                }
                Ok(ReconcileAction::Failed)
            }
        }
    }

    async fn start_worker(
        &self,
        key: &RequestKey,
        req: &VolumeRequest,
        intent: &ImportAnnotations,
        fingerprint: String,
    ) -> Result<ReconcileAction> {
        // A recorded outcome for this very intent means the worker already
        // ran and was cleaned up. Failures are not retried.
        let status = &req.status;
        if status.observed_intent.as_deref() == Some(fingerprint.as_str())
            && status.phase.is_some_and(|p| p.is_terminal())
        {
            return Ok(ReconcileAction::UpToDate);
        }

        let spec = match self.worker_spec(key, req, intent, &fingerprint).await {
            Ok(spec) => spec,
            Err((reason, e)) => {
                let status = RequestStatus {
                    ready: false,
                    phase: None,
                    reason: Some(reason.into()),
                    message: Some(format!("{e:#}")),
                    observed_intent: Some(fingerprint),
                };
                self.set_status(key, req, status).await?;
                return Ok(ReconcileAction::Rejected);
            }
        };
        match self.client.create_worker(&spec).await {
            Ok(()) => tracing::info!("Created worker {}", spec.name),
            // Lost a race with a concurrent reconcile; that one created it.
            Err(ClientError::AlreadyExists) => {
                tracing::debug!("Worker {} already exists", spec.name);
                return Ok(ReconcileAction::Waiting);
            }
            Err(e) => return Err(e).context("Creating worker"),
        }
        let status = RequestStatus {
            ready: false,
            phase: Some(WorkerPhase::Pending),
            reason: None,
            message: None,
            observed_intent: Some(fingerprint),
        };
        self.set_status(key, req, status).await?;
        Ok(ReconcileAction::Created)
    }

    /// Resolve everything a worker needs. Errors carry the status reason.
    async fn worker_spec(
        &self,
        key: &RequestKey,
        req: &VolumeRequest,
        intent: &ImportAnnotations,
        fingerprint: &str,
    ) -> std::result::Result<WorkerSpec, (&'static str, anyhow::Error)> {
        let capacity = req
            .requested_capacity
            .as_deref()
            .map(parse_capacity)
            .transpose()
            .map_err(|e| (REASON_INVALID_ANNOTATIONS, e))?
            .flatten();
        let mut opts = ImportOptions {
            dest: self.config.destination_path.clone(),
            endpoint: intent.endpoint.clone(),
            source: intent.source,
            content_type: intent.content_type,
            capacity,
            insecure_tls: intent.insecure_registry,
            ..Default::default()
        };
        if let Some(secret) = intent.secret_ref.as_deref() {
            let creds = self
                .credentials
                .resolve_secret(&key.namespace, secret)
                .await
                .map_err(|e| (REASON_CREDENTIALS, e))?;
            opts.access_key = creds.access_key;
            opts.secret_key = creds.secret_key;
        }
        if let Some(bundle) = intent.cert_bundle_ref.as_deref() {
            let dir = self
                .credentials
                .resolve_cert_bundle(&key.namespace, bundle)
                .await
                .map_err(|e| (REASON_CREDENTIALS, e))?;
            opts.cert_dir = Some(dir);
        }
        let owner = OwnerReference {
            api_version: "v1".into(),
            kind: "PersistentVolumeClaim".into(),
            name: key.name.clone(),
            uid: req.metadata.uid.clone().unwrap_or_default(),
            controller: true,
        };
        let labels = BTreeMap::from([(LABEL_REQUEST.to_owned(), key.name.clone())]);
        let mut env = opts.to_vars();
        env.insert(
            ENV_FETCH_TIMEOUT.to_owned(),
            self.config.fetch_timeout().as_secs().to_string(),
        );
        match opts.source {
            SourceKind::Upload => {
                env.insert(ENV_UPLOAD_LISTEN.to_owned(), self.config.upload_listen.clone());
            }
            SourceKind::ObjectStorage => {
                env.insert(
                    ENV_S3_REGION.to_owned(),
                    self.config.object_storage_region.clone(),
                );
            }
            _ => {}
        }
        Ok(WorkerSpec {
            name: worker_name(&key.name),
            namespace: key.namespace.clone(),
            owner,
            image: self.config.worker_image.clone(),
            env,
            destination: opts.dest,
            intent: fingerprint.to_owned(),
            labels,
        })
    }

    /// Write `status` unless it is already current, retrying on conflicts
    /// with a freshly read request.
    async fn set_status(
        &self,
        key: &RequestKey,
        req: &VolumeRequest,
        status: RequestStatus,
    ) -> Result<()> {
        let mut current = req.clone();
        let mut attempt = 0;
        loop {
            if current.status == status {
                return Ok(());
            }
            let r = self
                .client
                .update_request_status(key, current.metadata.resource_version.as_deref(), &status)
                .await;
            match r {
                Ok(()) => return Ok(()),
                Err(ClientError::Conflict) if attempt < self.config.status_update_retries => {
                    attempt += 1;
                    tracing::debug!("Conflict updating status (attempt {attempt})");
                    match self.client.get_request(key).await? {
                        Some(r) => current = r,
                        None => return Ok(()),
                    }
                }
                Err(e) => return Err(e).context("Updating request status"),
            }
        }
    }

    async fn delete_worker(&self, namespace: &str, name: &str) -> Result<()> {
        match self.client.delete_worker(namespace, name).await {
            Ok(()) => {
                tracing::debug!("Deleted worker {namespace}/{name}");
                Ok(())
            }
            Err(ClientError::NotFound) => Ok(()),
            Err(e) => Err(e).context("Deleting worker"),
        }
    }

    async fn process(&self, queue: &WorkQueue, key: RequestKey, cancel: &CancellationToken) {
        // Reconciles are level-triggered, so abandoning one midway is harmless.
        let r = run_with_cancellation(self.reconcile(&key), cancel).await;
        queue.done(&key);
        match r {
            Ok(ReconcileAction::Requeue) => queue.add(key),
            Ok(_) => {}
            // One failing request never affects the others; it is retried on
            // the next event for it.
            Err(e) => tracing::warn!("Reconciling {key}: {e:#}"),
        }
    }

    /// Reconcile the keys received on `events` until the channel closes or
    /// `cancel` fires. Events for workers are expected to be mapped to
    /// their request key (see [`WorkerSpec::request_key`]).
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<RequestKey>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let queue = Arc::new(WorkQueue::new());
        let mut tasks = JoinSet::new();
        for _ in 0..self.config.max_concurrent_reconciles.max(1) {
            let this = Arc::clone(&self);
            let queue = Arc::clone(&queue);
            let cancel = cancel.clone();
            tasks.spawn(async move {
                while let Some(key) = queue.next().await {
                    this.process(&queue, key, &cancel).await;
                }
            });
        }
        tracing::info!(
            "Controller running with {} reconcilers",
            self.config.max_concurrent_reconciles
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    queue.shutdown();
                    break;
                }
                ev = events.recv() => match ev {
                    Some(key) => queue.add(key),
                    None => {
                        queue.close();
                        break;
                    }
                }
            }
        }
        while let Some(r) = tasks.join_next().await {
            r.context("Reconciler task failed")?;
        }
        Ok(())
    }
}

/// Reason and message of a failed worker.
fn failure_of(worker: &Worker) -> (String, String) {
    let Some(raw) = worker.termination_message.as_deref() else {
        return (
            REASON_WORKER_FAILED.into(),
            "Worker failed without a termination message".into(),
        );
    };
    match TerminationMessage::parse(raw) {
        Ok(m) => (m.reason, m.message),
        Err(_) => (REASON_WORKER_FAILED.into(), raw.trim().to_owned()),
    }
}
