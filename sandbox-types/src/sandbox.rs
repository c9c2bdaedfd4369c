use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::common::{Labels, PersistentContentMode, PodTemplate};

/// One execution environment, backed one-to-one by a pod of the same name.
#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "agents.kruise.io",
    version = "v1alpha1",
    kind = "Sandbox",
    plural = "sandboxes",
    derive = "PartialEq",
    status = "SandboxStatus",
    namespaced
)]
#[kube(derive = "Default")]
#[kube(printcolumn = r#"{"jsonPath": ".status.phase", "name": "PHASE", "type": "string"}"#)]
#[kube(printcolumn = r#"{"jsonPath": ".spec.paused", "name": "PAUSED", "type": "boolean"}"#)]
#[kube(printcolumn = r#"{"jsonPath": ".metadata.creationTimestamp", "name": "AGE", "type": "date"}"#)]
pub struct SandboxSpec {
    #[serde(flatten)]
    pub pod: PodTemplate,

    /// Absolute deadline after which the sandbox is torn down, regardless
    /// of claim or pause state. A deadline strictly in the future never
    /// fires; one in the past fires on the next reconcile.
    pub shutdown_time: Option<Time>,

    /// Absolute wall-clock time at which the sandbox should transition to
    /// paused. Distinct from `paused`, which is the imperative switch the
    /// reconciler actually watches; set by admins that want a scheduled
    /// pause rather than an immediate one.
    pub pause_time: Option<Time>,

    /// Imperative pause switch. Admins (or the claim's owner) flip this to
    /// request a pause/resume; the reconciler drives the phase machine
    /// from it.
    #[serde(default)]
    pub paused: bool,

    /// What must survive a pause/resume round-trip. Determines whether
    /// pausing annotates the live pod or deletes it.
    #[serde(default)]
    pub persistent_contents: Vec<PersistentContentMode>,

    #[serde(default)]
    pub extra_labels: Labels,

    #[serde(default)]
    pub extra_annotations: Labels,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Default)]
pub enum SandboxPhase {
    #[default]
    Pending,
    Running,
    Paused,
    Resuming,
    Succeeded,
    Failed,
    Terminating,
}

impl fmt::Display for SandboxPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SandboxPhase::Pending => "Pending",
            SandboxPhase::Running => "Running",
            SandboxPhase::Paused => "Paused",
            SandboxPhase::Resuming => "Resuming",
            SandboxPhase::Succeeded => "Succeeded",
            SandboxPhase::Failed => "Failed",
            SandboxPhase::Terminating => "Terminating",
        };
        write!(f, "{s}")
    }
}

/// The subset of pod state a sandbox's status mirrors, so consumers never
/// need to read the pod object directly.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct PodInfo {
    pub pod_ip: Option<String>,
    pub pod_node: Option<String>,
    pub pod_uid: Option<String>,
    #[serde(default)]
    pub pod_annotations: BTreeMap<String, String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct SandboxStatus {
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default)]
    pub phase: SandboxPhase,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub pod_info: PodInfo,
    /// Hash of the template this sandbox's backing pod was last created or
    /// patched from. Compared against a freshly computed hash each
    /// reconcile to detect drift.
    #[serde(default)]
    pub template_hash: String,
    pub message: Option<String>,
    pub last_updated: Option<Time>,
}

/// Well-known condition types carried on [`SandboxStatus::conditions`].
pub mod condition_types {
    pub const READY: &str = "Ready";
    pub const PAUSED: &str = "Paused";
    pub const RESUMED: &str = "Resumed";
    pub const INPLACE_UPDATE: &str = "InplaceUpdate";
}

/// Reasons recorded on the `Paused` condition, distinguishing the two
/// pause implementations for operators reading `kubectl describe`.
pub mod paused_reasons {
    pub const SET_PAUSE: &str = "SetPause";
    pub const DELETE_POD: &str = "DeletePod";
}

/// Reasons recorded on the `InplaceUpdate` condition as a patch moves
/// from applied to converged (or abandoned).
pub mod inplace_update_reasons {
    pub const UPDATING: &str = "InplaceUpdating";
    pub const SUCCEEDED: &str = "InplaceUpdateSucceeded";
    pub const FAILED: &str = "InplaceUpdateFailed";
}
