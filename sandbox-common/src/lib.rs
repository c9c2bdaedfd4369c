pub mod shutdown;

/// Writes the readiness file consumed by the container's readiness probe.
pub fn signal_ready() {
    if let Err(err) = std::fs::write("/etc/ready", "ready") {
        tracing::warn!(%err, "failed to write readiness file");
    }
}

/// Label and annotation keys under the vendor prefix, shared by every
/// reconciler and by the Pick Engine's compare-and-set patches.
pub mod annotations {
    pub const PREFIX: &str = "agents.kruise.io";

    /// Label on a `Sandbox`: name of the `SandboxSet` that created it.
    pub const SANDBOX_TEMPLATE: &str = "agents.kruise.io/sandbox-template";
    /// Label on a `Sandbox`: hash of the template it was created from.
    pub const TEMPLATE_HASH: &str = "agents.kruise.io/template-hash";
    /// Label on a `Sandbox`: `"true"`/`"false"`, whether a claim owns it.
    pub const SANDBOX_CLAIMED: &str = "agents.kruise.io/sandbox-claimed";
    /// Label on a `Sandbox`: display name of the claiming `SandboxClaim`.
    pub const CLAIM_NAME: &str = "agents.kruise.io/claim-name";
    /// Annotation on a `Sandbox`: UID of the claiming `SandboxClaim`.
    pub const OWNER: &str = "agents.kruise.io/owner";
    /// Annotation on a `Sandbox`: RFC3339 timestamp of when it was claimed.
    pub const CLAIM_TIMESTAMP: &str = "agents.kruise.io/claim-timestamp";
    /// Annotation on a `Sandbox`: short-lived pick hold, set by the Pick Engine.
    pub const LOCK: &str = "agents.kruise.io/lock";
    /// Finalizer placed on `Sandbox` objects by this controller.
    pub const FINALIZER: &str = "agents.kruise.io/finalizer";
    /// Annotation on a `Sandbox`: delegates pod teardown to an external
    /// controller instead of deleting the pod ourselves.
    pub const ENABLE_VK_DELETE_INSTANCE: &str = "agents.kruise.io/enable-vk-delete-instance";

    /// Label on a `Pod`: back-pointer to the `Sandbox` that owns it
    /// (invariant: pod name equals sandbox name, but the label makes the
    /// relationship queryable without a name join).
    pub const SANDBOX_NAME: &str = "agents.kruise.io/sandbox-name";
    /// Annotation on a `Pod`: hash of the template it was created/patched
    /// from, compared against `Sandbox.status.templateHash`.
    pub const SPEC_HASH: &str = "agents.kruise.io/template-hash";
    /// Annotation on a `Pod`: requests an in-place node-agent pause,
    /// preserving the process tree and IP.
    pub const POD_PAUSE: &str = "agents.kruise.io/pause";
    /// Annotation on a paused `Pod`: reserves the instance against
    /// reclamation by the node agent while paused.
    pub const POD_RESERVE_INSTANCE: &str = "agents.kruise.io/reserve-instance";
}
