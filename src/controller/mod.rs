//! Controller module containing the At reconciliation logic

mod at;

pub use at::{reconcile, AtClient, AtReconciler, Context, KubeAtClient};
