pub mod common;
pub mod sandbox;
pub mod sandbox_claim;
pub mod sandbox_set;
pub mod validate;

pub use common::{Labels, MaxUnavailable, PersistentContentMode, PodTemplate, ScaleStrategy};
pub use validate::{default_pod_template, validate_pod_template, validate_sandbox_claim_spec, validate_sandbox_set_spec};
pub use sandbox::{
    PodInfo, Sandbox, SandboxPhase, SandboxSpec, SandboxStatus,
    condition_types as sandbox_condition_types, inplace_update_reasons, paused_reasons,
};
pub use sandbox_claim::{
    SandboxClaim, SandboxClaimPhase, SandboxClaimSpec, SandboxClaimStatus,
    completion_reasons, condition_types as sandbox_claim_condition_types,
};
pub use sandbox_set::{SandboxSet, SandboxSetSpec, SandboxSetStatus};
