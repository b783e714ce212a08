//! Change notifier: watch streams feeding resource keys into the work queue
//!
//! Two streams drive the controller: one over At resources in all
//! namespaces, and one over pods that carry an At owner reference (mapped
//! back to the owning At's key). Delivery is at-least-once; duplicates and
//! spurious events are harmless because the reconciler is idempotent.
//!
//! A stream that terminates is restarted after a short delay so a flaky API
//! server connection never permanently silences the controller.

use std::time::Duration;

use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher::{self, watcher, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, ResourceExt};
use tracing::{debug, error, info};

use crate::crd::At;
use crate::engine::{ObjectKey, QueueHandle};

/// Delay before restarting a terminated watch stream
const RESTART_DELAY: Duration = Duration::from_secs(5);

/// Watch At resources forever, enqueueing a key for every change
///
/// Runs until the process shuts down; intended to be spawned as a task.
pub async fn run_at_watch(client: Client, queue: QueueHandle) {
    info!("starting At watch");
    loop {
        if let Err(e) = watch_ats(client.clone(), queue.clone()).await {
            error!(error = %e, "At watch stream failed, restarting");
        }
        tokio::time::sleep(RESTART_DELAY).await;
    }
}

/// Watch worker pods forever, enqueueing the owning At's key on every change
pub async fn run_pod_watch(client: Client, queue: QueueHandle) {
    info!("starting worker pod watch");
    loop {
        if let Err(e) = watch_pods(client.clone(), queue.clone()).await {
            error!(error = %e, "pod watch stream failed, restarting");
        }
        tokio::time::sleep(RESTART_DELAY).await;
    }
}

async fn watch_ats(client: Client, queue: QueueHandle) -> Result<(), watcher::Error> {
    let api: Api<At> = Api::all(client);
    let mut stream = watcher(api, watcher::Config::default())
        .default_backoff()
        .boxed();
    while let Some(event) = stream.try_next().await? {
        handle_at_event(&queue, event);
    }
    Ok(())
}

async fn watch_pods(client: Client, queue: QueueHandle) -> Result<(), watcher::Error> {
    let api: Api<Pod> = Api::all(client);
    let mut stream = watcher(api, watcher::Config::default())
        .default_backoff()
        .boxed();
    while let Some(event) = stream.try_next().await? {
        handle_pod_event(&queue, event);
    }
    Ok(())
}

fn handle_at_event(queue: &QueueHandle, event: Event<At>) {
    match event {
        Event::Apply(at) | Event::Delete(at) | Event::InitApply(at) => {
            let key = ObjectKey::new(at.namespace().unwrap_or_default(), at.name_any());
            debug!(key = %key, "At changed");
            queue.add(key);
        }
        Event::Init | Event::InitDone => {}
    }
}

fn handle_pod_event(queue: &QueueHandle, event: Event<Pod>) {
    let pod = match event {
        Event::Apply(pod) | Event::Delete(pod) | Event::InitApply(pod) => pod,
        Event::Init | Event::InitDone => return,
    };
    if let Some(key) = owner_key(&pod) {
        debug!(key = %key, pod = %pod.name_any(), "worker pod changed");
        queue.add(key);
    }
}

/// Map a pod to the key of the At that owns it, if any
///
/// Only pods with a controller owner reference in our API group count; all
/// other pods are not ours and are ignored.
fn owner_key(pod: &Pod) -> Option<ObjectKey> {
    let owner = pod
        .metadata
        .owner_references
        .as_ref()?
        .iter()
        .find(|o| o.kind == "At" && o.api_version.starts_with(crate::API_GROUP))?;
    Some(ObjectKey::new(
        pod.namespace().unwrap_or_default(),
        owner.name.clone(),
    ))
}
