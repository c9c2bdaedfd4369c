use kube::CustomResourceExt;
use sandbox_types::{Sandbox, SandboxClaim, SandboxSet};
use std::fs;

fn main() {
    let _ = fs::create_dir("../crds");
    fs::write(
        "../crds/agents.kruise.io_sandbox_crd.yaml",
        serde_yaml::to_string(&Sandbox::crd()).unwrap(),
    )
    .unwrap();
    fs::write(
        "../crds/agents.kruise.io_sandboxset_crd.yaml",
        serde_yaml::to_string(&SandboxSet::crd()).unwrap(),
    )
    .unwrap();
    fs::write(
        "../crds/agents.kruise.io_sandboxclaim_crd.yaml",
        serde_yaml::to_string(&SandboxClaim::crd()).unwrap(),
    )
    .unwrap();
}
