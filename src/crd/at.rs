//! The At Custom Resource Definition
//!
//! An `At` declares a point in time (`spec.schedule`) and a command
//! (`spec.command`). The controller executes the command at the scheduled
//! time by launching a one-shot worker pod owned by the At.

use chrono::{DateTime, NaiveDateTime, Utc};
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{CustomResource, Resource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::Error;

/// The fixed wire layout of `spec.schedule`: `YYYY-MM-DDThh:mm:ssZ`, always UTC.
///
/// Kept bit-exact for compatibility with existing stored resources.
pub const SCHEDULE_LAYOUT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Specification for an At resource
///
/// The spec is immutable intent set by the user; the controller only ever
/// writes to the status sub-object.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cnat.programming-kubernetes.info",
    version = "v1alpha1",
    kind = "At",
    plural = "ats",
    shortname = "at",
    status = "AtStatus",
    namespaced,
    printcolumn = r#"{"name":"Schedule","type":"string","jsonPath":".spec.schedule"}"#,
    printcolumn = r#"{"name":"Command","type":"string","jsonPath":".spec.command"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AtSpec {
    /// Absolute UTC timestamp at which to run the command,
    /// in the fixed layout `YYYY-MM-DDThh:mm:ssZ`
    pub schedule: String,

    /// Command to execute: a space-separated token string interpreted as an
    /// executable followed by its arguments
    pub command: String,
}

/// Status for an At resource
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AtStatus {
    /// Current phase of the At lifecycle
    #[serde(default)]
    pub phase: AtPhase,
}

impl AtStatus {
    /// Create a new status with the given phase
    pub fn with_phase(phase: AtPhase) -> Self {
        Self { phase }
    }
}

/// Lifecycle phase of an At resource
///
/// Phase transitions are monotonic and unidirectional:
/// unset -> PENDING -> RUNNING -> DONE. DONE is terminal.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum AtPhase {
    /// No phase recorded yet (freshly created resource)
    #[default]
    #[serde(rename = "")]
    Unset,
    /// Waiting for the schedule to come due
    #[serde(rename = "PENDING")]
    Pending,
    /// Schedule is due; the worker pod is being created or is executing
    #[serde(rename = "RUNNING")]
    Running,
    /// The worker pod reached a terminal state; nothing left to do
    #[serde(rename = "DONE")]
    Done,
}

impl std::fmt::Display for AtPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unset => write!(f, ""),
            Self::Pending => write!(f, "PENDING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Done => write!(f, "DONE"),
        }
    }
}

impl At {
    /// Current phase, defaulting to `Unset` when no status has been written
    pub fn phase(&self) -> AtPhase {
        self.status
            .as_ref()
            .map(|s| s.phase.clone())
            .unwrap_or_default()
    }

    /// Name of the worker pod derived from this At
    ///
    /// Deterministic: the same At always yields the same pod name, which is
    /// what makes create-if-absent idempotent.
    pub fn pod_name(&self) -> String {
        format!("{}-pod", self.name_any())
    }
}

/// Time remaining until the schedule, relative to `now`
///
/// Negative when the schedule is overdue. Fails when the schedule string
/// does not match [`SCHEDULE_LAYOUT`].
pub fn time_until_schedule(
    schedule: &str,
    now: DateTime<Utc>,
) -> Result<chrono::Duration, Error> {
    let parsed = NaiveDateTime::parse_from_str(schedule, SCHEDULE_LAYOUT)
        .map_err(|e| Error::schedule(schedule, e.to_string()))?;
    Ok(parsed.and_utc() - now)
}

/// Build the one-shot worker pod for an At resource
///
/// The pod runs the At's command in a busybox container, restarts on failure
/// but not on success, and carries an owner reference back to the At so the
/// store's garbage collector cascades deletion.
pub fn new_pod_for_at(at: &At) -> Pod {
    let name = at.name_any();
    let labels: BTreeMap<String, String> = [("app".to_string(), name.clone())].into();

    let owner = OwnerReference {
        api_version: At::api_version(&()).to_string(),
        kind: At::kind(&()).to_string(),
        name: name.clone(),
        uid: at.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    };

    Pod {
        metadata: ObjectMeta {
            name: Some(at.pod_name()),
            namespace: at.namespace(),
            labels: Some(labels),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "busybox".to_string(),
                image: Some("busybox".to_string()),
                command: Some(
                    at.spec
                        .command
                        .split_whitespace()
                        .map(str::to_string)
                        .collect(),
                ),
                ..Default::default()
            }],
            restart_policy: Some("OnFailure".to_string()),
            ..Default::default()
        }),
        status: None,
    }
}

/// Whether a worker pod has reached a terminal state (Succeeded or Failed)
pub fn is_pod_terminal(pod: &Pod) -> bool {
    matches!(
        pod.status
            .as_ref()
            .and_then(|s| s.phase.as_deref()),
        Some("Succeeded") | Some("Failed")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use k8s_openapi::api::core::v1::PodStatus;

    fn sample_at(name: &str, schedule: &str, command: &str) -> At {
        let mut at = At::new(
            name,
            AtSpec {
                schedule: schedule.to_string(),
                command: command.to_string(),
            },
        );
        at.metadata.namespace = Some("default".to_string());
        at.metadata.uid = Some("1234-5678".to_string());
        at
    }

    mod schedule_parsing {
        use super::*;

        #[test]
        fn future_schedule_yields_positive_delay() {
            let now = Utc.with_ymd_and_hms(2026, 8, 30, 12, 0, 0).unwrap();
            let d = time_until_schedule("2026-08-30T12:05:00Z", now).unwrap();
            assert_eq!(d, chrono::Duration::minutes(5));
        }

        #[test]
        fn overdue_schedule_yields_negative_delay() {
            let now = Utc.with_ymd_and_hms(2026, 8, 30, 12, 0, 0).unwrap();
            let d = time_until_schedule("2026-08-30T11:00:00Z", now).unwrap();
            assert!(d < chrono::Duration::zero());
        }

        #[test]
        fn malformed_schedule_is_an_error() {
            let err = time_until_schedule("not-a-date", Utc::now()).unwrap_err();
            assert!(err.to_string().contains("not-a-date"));
        }

        #[test]
        fn layout_requires_trailing_z() {
            // RFC 3339 offsets are not part of the fixed layout
            assert!(time_until_schedule("2026-08-30T12:00:00+00:00", Utc::now()).is_err());
        }
    }

    mod pod_template {
        use super::*;

        #[test]
        fn pod_name_and_namespace_derive_from_at() {
            let at = sample_at("example-at", "2026-08-30T12:00:00Z", "echo hello");
            let pod = new_pod_for_at(&at);
            assert_eq!(pod.metadata.name.as_deref(), Some("example-at-pod"));
            assert_eq!(pod.metadata.namespace.as_deref(), Some("default"));
        }

        #[test]
        fn command_is_split_on_whitespace() {
            let at = sample_at("x", "2026-08-30T12:00:00Z", "echo hello world");
            let pod = new_pod_for_at(&at);
            let container = &pod.spec.unwrap().containers[0];
            assert_eq!(
                container.command.as_ref().unwrap(),
                &vec!["echo".to_string(), "hello".to_string(), "world".to_string()]
            );
        }

        #[test]
        fn pod_retries_on_failure_but_not_on_success() {
            let at = sample_at("x", "2026-08-30T12:00:00Z", "true");
            let pod = new_pod_for_at(&at);
            assert_eq!(pod.spec.unwrap().restart_policy.as_deref(), Some("OnFailure"));
        }

        #[test]
        fn owner_reference_links_pod_to_at() {
            let at = sample_at("example-at", "2026-08-30T12:00:00Z", "true");
            let pod = new_pod_for_at(&at);
            let owners = pod.metadata.owner_references.unwrap();
            assert_eq!(owners.len(), 1);
            assert_eq!(owners[0].kind, "At");
            assert_eq!(owners[0].name, "example-at");
            assert_eq!(owners[0].uid, "1234-5678");
            assert_eq!(owners[0].controller, Some(true));
        }

        #[test]
        fn same_at_always_yields_same_pod() {
            let at = sample_at("x", "2026-08-30T12:00:00Z", "echo hi");
            assert_eq!(
                serde_json::to_value(new_pod_for_at(&at)).unwrap(),
                serde_json::to_value(new_pod_for_at(&at)).unwrap()
            );
        }
    }

    mod pod_terminal_state {
        use super::*;

        fn pod_with_phase(phase: Option<&str>) -> Pod {
            Pod {
                status: phase.map(|p| PodStatus {
                    phase: Some(p.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            }
        }

        #[test]
        fn succeeded_and_failed_are_terminal() {
            assert!(is_pod_terminal(&pod_with_phase(Some("Succeeded"))));
            assert!(is_pod_terminal(&pod_with_phase(Some("Failed"))));
        }

        #[test]
        fn running_pending_and_unknown_are_not_terminal() {
            assert!(!is_pod_terminal(&pod_with_phase(Some("Running"))));
            assert!(!is_pod_terminal(&pod_with_phase(Some("Pending"))));
            assert!(!is_pod_terminal(&pod_with_phase(None)));
        }
    }

    mod wire_format {
        use super::*;

        #[test]
        fn phase_serializes_to_upper_case_strings() {
            assert_eq!(serde_json::to_value(AtPhase::Unset).unwrap(), "");
            assert_eq!(serde_json::to_value(AtPhase::Pending).unwrap(), "PENDING");
            assert_eq!(serde_json::to_value(AtPhase::Running).unwrap(), "RUNNING");
            assert_eq!(serde_json::to_value(AtPhase::Done).unwrap(), "DONE");
        }

        #[test]
        fn missing_phase_defaults_to_unset() {
            let status: AtStatus = serde_json::from_str("{}").unwrap();
            assert_eq!(status.phase, AtPhase::Unset);
        }

        #[test]
        fn spec_uses_the_original_field_names() {
            let at = sample_at("x", "2026-08-30T12:00:00Z", "echo hi");
            let value = serde_json::to_value(&at.spec).unwrap();
            assert_eq!(value["schedule"], "2026-08-30T12:00:00Z");
            assert_eq!(value["command"], "echo hi");
        }
    }
}
