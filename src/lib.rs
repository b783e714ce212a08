//! cnat - "cloud native at": run a command at a scheduled time, the Kubernetes way.
//!
//! An `At` resource declares a UTC timestamp and a command. The controller
//! drives each `At` through the phase diagram `PENDING -> RUNNING -> DONE`:
//! it waits until the schedule comes due, launches a one-shot worker pod that
//! executes the command, and marks the resource `DONE` once the pod reaches a
//! terminal state.
//!
//! Unlike typical kube-rs operators this crate carries its own reconcile
//! engine instead of `kube::runtime::Controller`: a deduplicating, delayable,
//! rate-limited [`engine::WorkQueue`] plus a worker-pool
//! [`engine::Dispatcher`]. Waiting is always expressed as a requeue
//! instruction, never as a blocked worker, so one not-yet-due `At` never
//! consumes a worker slot.
//!
//! # Modules
//!
//! - [`crd`] - the `At` Custom Resource Definition and worker-pod template
//! - [`engine`] - generic work queue and dispatcher
//! - [`controller`] - the `At` reconciler state machine
//! - [`notifier`] - watch streams feeding change events into the queue
//! - [`inspect`] - the `cnat list` inspection tool
//! - [`error`] - error types and retry classification

#![deny(missing_docs)]

pub mod controller;
pub mod crd;
pub mod engine;
pub mod error;
pub mod inspect;
pub mod notifier;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group of the At custom resource
pub const API_GROUP: &str = "cnat.programming-kubernetes.info";

/// API version of the At custom resource
pub const API_VERSION: &str = "v1alpha1";

/// Field manager name used for server-side apply operations
pub const FIELD_MANAGER: &str = "cnat-controller";

/// Default number of dispatcher workers
pub const DEFAULT_WORKERS: usize = 2;

/// Default wall-clock budget for a single reconcile pass
pub const DEFAULT_RECONCILE_TIMEOUT_SECS: u64 = 30;
