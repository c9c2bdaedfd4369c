use k8s_openapi::api::core::v1::EnvVar;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::common::Labels;

fn default_claim_timeout() -> String {
    "60s".to_string()
}

fn default_ttl_after_completed() -> String {
    "300s".to_string()
}

/// A request to atomically acquire `replicas` sandboxes from one pool.
/// `replicas` is immutable once set (enforced by the validating webhook,
/// not by this type); the claim's UID, not its name, is the token
/// recorded on every sandbox it claims.
#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "agents.kruise.io",
    version = "v1alpha1",
    kind = "SandboxClaim",
    plural = "sandboxclaims",
    derive = "PartialEq",
    status = "SandboxClaimStatus",
    namespaced
)]
#[kube(derive = "Default")]
#[kube(printcolumn = r#"{"jsonPath": ".status.phase", "name": "PHASE", "type": "string"}"#)]
#[kube(printcolumn = r#"{"jsonPath": ".spec.replicas", "name": "REPLICAS", "type": "integer"}"#)]
#[kube(printcolumn = r#"{"jsonPath": ".status.claimedReplicas", "name": "CLAIMED", "type": "integer"}"#)]
#[kube(printcolumn = r#"{"jsonPath": ".metadata.creationTimestamp", "name": "AGE", "type": "date"}"#)]
pub struct SandboxClaimSpec {
    /// Name of the `SandboxSet` to claim from.
    pub template_name: String,

    /// Number of sandboxes to claim. Immutable once set; must be >= 1.
    pub replicas: i32,

    /// How long `Claiming` may run before giving up and completing with
    /// whatever was claimed. Parsed with `parse_duration`; default `60s`.
    #[serde(default = "default_claim_timeout")]
    pub claim_timeout: String,

    /// How long a `Completed` claim survives before being deleted.
    /// Parsed with `parse_duration`; default `300s`.
    #[serde(default = "default_ttl_after_completed")]
    pub ttl_after_completed: String,

    #[serde(default)]
    pub labels: Labels,

    #[serde(default)]
    pub annotations: Labels,

    #[serde(default)]
    pub env: Vec<EnvVar>,

    /// Copied onto each claimed sandbox once, at claim time. Editing this
    /// after claiming does not propagate to already-claimed sandboxes.
    pub shutdown_time: Option<Time>,

    /// Requests an in-place image update on sandboxes as they are
    /// claimed, waiting up to `waitReadyTimeout` for the new image's
    /// Ready condition before considering the pick successful.
    #[serde(default)]
    pub image: Option<String>,

    /// Upper bound, in seconds, on how long the Pick Engine's warm-up step
    /// waits for a claimed sandbox's Ready condition after an in-place
    /// update. Default 30s.
    pub wait_ready_timeout_seconds: Option<u64>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema, Default)]
pub enum SandboxClaimPhase {
    #[default]
    Claiming,
    Completed,
}

impl fmt::Display for SandboxClaimPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SandboxClaimPhase::Claiming => write!(f, "Claiming"),
            SandboxClaimPhase::Completed => write!(f, "Completed"),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct SandboxClaimStatus {
    #[serde(default)]
    pub phase: SandboxClaimPhase,
    #[serde(default)]
    pub claimed_replicas: i32,
    pub claim_start_time: Option<Time>,
    pub completion_time: Option<Time>,
    pub message: Option<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

pub mod condition_types {
    pub const COMPLETED: &str = "Completed";
    pub const TIMED_OUT: &str = "TimedOut";
}

/// Reasons recorded on `SandboxClaimStatus` transitions into `Completed`.
pub mod completion_reasons {
    pub const ALL_REPLICAS_CLAIMED: &str = "AllReplicasClaimed";
    pub const TIMEOUT_REACHED: &str = "TimeoutReached";
    pub const SANDBOX_SET_NOT_FOUND: &str = "SandboxSetNotFound";
}
