//! Generic reconcile engine
//!
//! The engine is the part of the controller pattern that is independent of
//! any particular resource: a [`WorkQueue`] of resource keys and a
//! [`Dispatcher`] running a fixed pool of workers that pull keys, invoke a
//! [`Reconcile`] implementation, and re-queue based on the returned outcome.
//!
//! The central design rule: waiting is expressed as data (a requeue
//! instruction), never by blocking a worker. A reconciler that needs to act
//! in five minutes returns [`Action::RequeueAfter`] and its worker is
//! immediately free for other keys.

mod dispatcher;
mod queue;

pub use dispatcher::{Dispatcher, EngineConfig};
pub use queue::WorkQueue;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::Error;

/// Namespace-qualified identity of a managed resource
///
/// The unit of work queued and deduplicated by the engine. Two events for
/// the same key collapse into one pending delivery.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Namespace of the resource
    pub namespace: String,
    /// Name of the resource
    pub name: String,
}

impl ObjectKey {
    /// Create a new key from a namespace and name
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Outcome of a successful reconcile pass
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Action {
    /// Nothing to do until the next change event arrives for this key
    AwaitChange,
    /// Deliver this key again after the given delay
    ///
    /// Scheduled through the queue; the worker never sleeps in-thread.
    RequeueAfter(Duration),
}

impl Action {
    /// Requeue after the given delay
    pub fn requeue(delay: Duration) -> Self {
        Self::RequeueAfter(delay)
    }

    /// Wait for the next change event
    pub fn await_change() -> Self {
        Self::AwaitChange
    }
}

/// A reconciler invoked by the [`Dispatcher`] for each delivered key
///
/// Implementations must be idempotent: the engine guarantees at-least-once
/// delivery, so reconciling the same state twice must not change observable
/// status or duplicate side effects. Per-key invocations are serialized by
/// the queue; different keys run concurrently.
#[async_trait]
pub trait Reconcile: Send + Sync + 'static {
    /// Drive the resource identified by `key` one step toward its desired
    /// state, returning what the engine should do next
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, Error>;
}

/// Shared handle to a [`WorkQueue`]
pub type QueueHandle = Arc<WorkQueue>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_key_displays_as_namespace_slash_name() {
        let key = ObjectKey::new("default", "example-at");
        assert_eq!(key.to_string(), "default/example-at");
    }

    #[test]
    fn object_keys_compare_by_value() {
        assert_eq!(
            ObjectKey::new("default", "a"),
            ObjectKey::new("default", "a")
        );
        assert_ne!(
            ObjectKey::new("default", "a"),
            ObjectKey::new("other", "a")
        );
    }

    #[test]
    fn action_constructors_match_variants() {
        assert_eq!(
            Action::requeue(Duration::from_secs(5)),
            Action::RequeueAfter(Duration::from_secs(5))
        );
        assert_eq!(Action::await_change(), Action::AwaitChange);
    }
}
