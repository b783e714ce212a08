//! At controller implementation
//!
//! This module implements the reconciliation logic for At resources. It
//! follows the Kubernetes controller pattern: observe current state, compute
//! the next action, possibly schedule a follow-up, repeat. Every pass
//! re-reads current state from the store - nothing mutable is cached across
//! reconciles, so a pass can always be re-run from scratch.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, PostParams};
use kube::{Client, ResourceExt};
use tracing::{debug, info, instrument};

#[cfg(test)]
use mockall::automock;

use crate::crd::{is_pod_terminal, new_pod_for_at, time_until_schedule, At, AtPhase, AtStatus};
use crate::engine::{Action, ObjectKey, Reconcile};
use crate::Error;

/// Trait abstracting resource-store operations for the At controller
///
/// This is the boundary to the external resource store: reads of the At and
/// its worker pod, creation of the pod, and the status-only write path. The
/// trait allows mocking the store in tests while using the real Kubernetes
/// client in production.
///
/// Reads return `None` for a vanished resource - not-found is an expected,
/// benign outcome, never an error.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AtClient: Send + Sync {
    /// Fetch the At identified by `key`, or `None` if it no longer exists
    async fn get_at(&self, key: &ObjectKey) -> Result<Option<At>, Error>;

    /// Persist only the status sub-object of an At
    ///
    /// Uses optimistic concurrency keyed on the resource version captured at
    /// read time; a lost race surfaces as [`Error::Conflict`].
    async fn update_status(&self, at: &At) -> Result<(), Error>;

    /// Fetch the worker pod identified by `key`, or `None` if absent
    async fn get_pod(&self, key: &ObjectKey) -> Result<Option<Pod>, Error>;

    /// Create the worker pod
    ///
    /// Losing a create race to an identical pod is treated as success.
    async fn create_pod(&self, pod: &Pod) -> Result<(), Error>;
}

/// Real resource-store client backed by the Kubernetes API
pub struct KubeAtClient {
    client: Client,
}

impl KubeAtClient {
    /// Create a new KubeAtClient wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AtClient for KubeAtClient {
    async fn get_at(&self, key: &ObjectKey) -> Result<Option<At>, Error> {
        let api: Api<At> = Api::namespaced(self.client.clone(), &key.namespace);
        Ok(api.get_opt(&key.name).await?)
    }

    async fn update_status(&self, at: &At) -> Result<(), Error> {
        let namespace = at.namespace().unwrap_or_default();
        let api: Api<At> = Api::namespaced(self.client.clone(), &namespace);
        let data = serde_json::to_vec(at).map_err(|e| Error::serialization(e.to_string()))?;

        match api
            .replace_status(&at.name_any(), &PostParams::default(), data)
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Err(Error::conflict(ae.message)),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_pod(&self, key: &ObjectKey) -> Result<Option<Pod>, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &key.namespace);
        Ok(api.get_opt(&key.name).await?)
    }

    async fn create_pod(&self, pod: &Pod) -> Result<(), Error> {
        let namespace = pod.namespace().unwrap_or_default();
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
        match api.create(&PostParams::default(), pod).await {
            Ok(_) => Ok(()),
            // Somebody (or a duplicate event) beat us to it; the pod is
            // deterministic so the existing one is the one we wanted
            Err(kube::Error::Api(ae)) if ae.reason == "AlreadyExists" => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Controller context shared across all reconciliation calls
pub struct Context {
    /// Resource-store client (trait object for testability)
    pub client: Arc<dyn AtClient>,
}

impl Context {
    /// Create a context backed by the real Kubernetes client
    pub fn new(client: Client) -> Self {
        Self {
            client: Arc::new(KubeAtClient::new(client)),
        }
    }

    /// Create a context over an arbitrary client implementation
    pub fn with_client(client: Arc<dyn AtClient>) -> Self {
        Self { client }
    }
}

/// The At reconciler wired into the generic engine
pub struct AtReconciler {
    ctx: Arc<Context>,
}

impl AtReconciler {
    /// Create a reconciler over the given context
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Reconcile for AtReconciler {
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, Error> {
        reconcile(key, &self.ctx).await
    }
}

/// Reconcile one At resource
///
/// Implements the phase diagram PENDING -> RUNNING -> DONE:
///
/// - PENDING: if the schedule is not yet due, return a scheduled follow-up
///   at exactly the remaining delay (no status write, no blocking wait).
///   Once due, move to RUNNING and fall through - an overdue At launches its
///   pod in the same pass.
/// - RUNNING: create the worker pod if absent, otherwise watch it: a
///   terminal pod moves the At to DONE; a live one means wait for its next
///   change event.
/// - DONE: terminal, nothing to do ever again.
///
/// Any phase changed in memory is persisted through the status writer before
/// returning; a failed write discards the in-memory change (the store is the
/// source of truth and the pass will be retried).
#[instrument(skip(ctx), fields(at = %key))]
pub async fn reconcile(key: &ObjectKey, ctx: &Context) -> Result<Action, Error> {
    let Some(mut at) = ctx.client.get_at(key).await? else {
        // Deleted between event and reconcile - expected and benign
        debug!("resource not found, nothing to reconcile");
        return Ok(Action::await_change());
    };

    let stored_phase = at.phase();
    let mut phase = stored_phase.clone();
    if phase == AtPhase::Unset {
        phase = AtPhase::Pending;
    }

    if phase == AtPhase::Pending {
        info!(schedule = %at.spec.schedule, "phase: PENDING, checking schedule");
        let remaining = time_until_schedule(&at.spec.schedule, Utc::now())?;
        if remaining > chrono::Duration::zero() {
            let delay = remaining.to_std().unwrap_or(Duration::ZERO);
            debug!(delay_secs = delay.as_secs(), "not yet time, scheduling follow-up");
            return Ok(Action::requeue(delay));
        }
        info!(command = %at.spec.command, "schedule is due, ready to execute");
        phase = AtPhase::Running;
    }

    if phase == AtPhase::Running {
        let pod_key = ObjectKey::new(key.namespace.clone(), at.pod_name());
        match ctx.client.get_pod(&pod_key).await? {
            None => {
                let pod = new_pod_for_at(&at);
                ctx.client.create_pod(&pod).await?;
                info!(pod = %pod_key, "worker pod launched");
                // No requeue: the pod's own change events drive the next pass
            }
            Some(found) if is_pod_terminal(&found) => {
                info!(pod = %pod_key, "worker pod terminated");
                phase = AtPhase::Done;
            }
            Some(_) => {
                debug!(pod = %pod_key, "worker pod still executing");
            }
        }
    }
    // DONE is sticky: no further action until the user edits the spec,
    // and even that resets nothing automatically

    if phase != stored_phase {
        at.status = Some(AtStatus::with_phase(phase.clone()));
        ctx.client.update_status(&at).await?;
        info!(phase = %phase, "status updated");
    }

    Ok(Action::await_change())
}
