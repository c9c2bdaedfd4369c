use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::common::{Labels, PodTemplate, ScaleStrategy};

/// A declarative warm pool: `replicas` interchangeable sandboxes of one
/// template, kept available ahead of demand.
#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "agents.kruise.io",
    version = "v1alpha1",
    kind = "SandboxSet",
    plural = "sandboxsets",
    derive = "PartialEq",
    status = "SandboxSetStatus",
    namespaced
)]
#[kube(derive = "Default")]
#[kube(printcolumn = r#"{"jsonPath": ".spec.replicas", "name": "DESIRED", "type": "integer"}"#)]
#[kube(printcolumn = r#"{"jsonPath": ".status.availableReplicas", "name": "AVAILABLE", "type": "integer"}"#)]
#[kube(printcolumn = r#"{"jsonPath": ".metadata.creationTimestamp", "name": "AGE", "type": "date"}"#)]
pub struct SandboxSetSpec {
    #[serde(flatten)]
    pub pod: PodTemplate,

    #[serde(default)]
    pub replicas: i32,

    #[serde(default)]
    pub scale_strategy: ScaleStrategy,

    #[serde(default)]
    pub extra_labels: Labels,

    #[serde(default)]
    pub extra_annotations: Labels,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct SandboxSetStatus {
    #[serde(default)]
    pub replicas: i32,
    #[serde(default)]
    pub available_replicas: i32,
    #[serde(default)]
    pub update_revision: String,
    pub selector: Option<String>,
    pub message: Option<String>,
}
