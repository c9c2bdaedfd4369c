//! Small in-process mirror of the admission-webhook contract
//! (spec.md §6). The webhook server itself is out of scope for this
//! crate, but reconcilers should not blindly trust that every object
//! they read actually passed through it -- a direct `kubectl apply`
//! against a misconfigured cluster, a webhook outage with `failurePolicy:
//! Ignore`, or a stale object from before the webhook existed can all
//! slip a non-conforming spec into the store. These functions let a
//! reconciler defensively re-check the contract and log+skip rather than
//! build a pod from (or otherwise act on) a spec that violates it.

use crate::common::PodTemplate;
use crate::sandbox_claim::SandboxClaimSpec;
use crate::sandbox_set::SandboxSetSpec;
use k8s_openapi::api::core::v1::PodTemplateSpec;

const INTERNAL_LABEL_PREFIX: &str = "agents.kruise.io/";

/// Checks the pod-template validation contract: exactly one container;
/// no privileged / privilege-escalation / host namespaces / automounted
/// service-account token / liveness+readiness probes / hostPath /
/// configMap / secret / projected / downwardAPI / memory-backed
/// emptyDir volumes.
pub fn validate_pod_template(template: &PodTemplate) -> Result<(), String> {
    let Some(spec) = template
        .template
        .as_ref()
        .and_then(|t| t.spec.as_ref())
    else {
        // A `templateRef`-only spec is resolved (and so validated)
        // elsewhere; nothing to check here.
        return Ok(());
    };

    if spec.containers.len() != 1 {
        return Err(format!(
            "pod template must have exactly one container, found {}",
            spec.containers.len()
        ));
    }
    let container = &spec.containers[0];

    if let Some(sc) = &container.security_context {
        if sc.privileged == Some(true) {
            return Err("container must not run privileged".to_string());
        }
        if sc.allow_privilege_escalation == Some(true) {
            return Err("container must not allow privilege escalation".to_string());
        }
    }
    if container.liveness_probe.is_some() {
        return Err("container must not set a liveness probe".to_string());
    }
    if container.readiness_probe.is_some() {
        return Err("container must not set a readiness probe".to_string());
    }

    if spec.host_network == Some(true) || spec.host_pid == Some(true) || spec.host_ipc == Some(true) {
        return Err("pod must not use a host namespace".to_string());
    }
    if spec.automount_service_account_token == Some(true) {
        return Err("pod must not automount the service-account token".to_string());
    }

    for volume in spec.volumes.iter().flatten() {
        if volume.host_path.is_some() {
            return Err(format!("volume '{}' must not be hostPath", volume.name));
        }
        if volume.config_map.is_some() {
            return Err(format!("volume '{}' must not be configMap", volume.name));
        }
        if volume.secret.is_some() {
            return Err(format!("volume '{}' must not be secret", volume.name));
        }
        if volume.projected.is_some() {
            return Err(format!("volume '{}' must not be projected", volume.name));
        }
        if volume.downward_api.is_some() {
            return Err(format!("volume '{}' must not be downwardAPI", volume.name));
        }
        if volume
            .empty_dir
            .as_ref()
            .and_then(|e| e.medium.as_deref())
            == Some("Memory")
        {
            return Err(format!("volume '{}' must not be a memory-backed emptyDir", volume.name));
        }
    }

    Ok(())
}

/// Applies the admission-webhook's defaulting contract in place:
/// `automountServiceAccountToken` defaults to `false` when unset. PVC
/// templates and other pod-spec defaults belong to the host platform's
/// own defaulting and are not duplicated here.
pub fn default_pod_template(template: &mut PodTemplate) {
    if let Some(spec) = template.template.as_mut().and_then(|t: &mut PodTemplateSpec| t.spec.as_mut())
        && spec.automount_service_account_token.is_none()
    {
        spec.automount_service_account_token = Some(false);
    }
}

/// `replicas >= 1`; labels/annotations whose key starts with the
/// internal vendor prefix are rejected (the webhook owns rejecting user
/// writes to these keys -- this just re-asserts it for objects this
/// process itself is about to act on).
pub fn validate_sandbox_claim_spec(spec: &SandboxClaimSpec) -> Result<(), String> {
    if spec.replicas < 1 {
        return Err(format!("replicas must be >= 1, got {}", spec.replicas));
    }
    reject_internal_keys(spec.labels.keys().chain(spec.annotations.keys()))
}

/// `replicas >= 0`; labels/annotations whose key starts with the
/// internal vendor prefix are rejected.
pub fn validate_sandbox_set_spec(spec: &SandboxSetSpec) -> Result<(), String> {
    if spec.replicas < 0 {
        return Err(format!("replicas must be >= 0, got {}", spec.replicas));
    }
    reject_internal_keys(spec.extra_labels.keys().chain(spec.extra_annotations.keys()))
}

fn reject_internal_keys<'a>(keys: impl Iterator<Item = &'a String>) -> Result<(), String> {
    for key in keys {
        if key.starts_with(INTERNAL_LABEL_PREFIX) {
            return Err(format!("key '{key}' uses the reserved '{INTERNAL_LABEL_PREFIX}' prefix"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::PodTemplate;
    use k8s_openapi::api::core::v1::{Container, PodSpec, Probe, Volume};

    fn template_with(spec: PodSpec) -> PodTemplate {
        PodTemplate {
            template: Some(PodTemplateSpec { metadata: None, spec: Some(spec) }),
            template_ref: None,
        }
    }

    #[test]
    fn template_ref_only_skips_validation() {
        let template = PodTemplate { template: None, template_ref: Some("base".to_string()) };
        assert!(validate_pod_template(&template).is_ok());
    }

    #[test]
    fn rejects_multiple_containers() {
        let spec = PodSpec {
            containers: vec![
                Container { name: "a".to_string(), ..Default::default() },
                Container { name: "b".to_string(), ..Default::default() },
            ],
            ..Default::default()
        };
        assert!(validate_pod_template(&template_with(spec)).is_err());
    }

    #[test]
    fn rejects_readiness_probe() {
        let spec = PodSpec {
            containers: vec![Container {
                name: "a".to_string(),
                readiness_probe: Some(Probe::default()),
                ..Default::default()
            }],
            ..Default::default()
        };
        assert!(validate_pod_template(&template_with(spec)).is_err());
    }

    #[test]
    fn rejects_host_path_volume() {
        let spec = PodSpec {
            containers: vec![Container { name: "a".to_string(), ..Default::default() }],
            volumes: Some(vec![Volume {
                name: "v".to_string(),
                host_path: Some(Default::default()),
                ..Default::default()
            }]),
            ..Default::default()
        };
        assert!(validate_pod_template(&template_with(spec)).is_err());
    }

    #[test]
    fn accepts_a_conforming_single_container_template() {
        let spec = PodSpec {
            containers: vec![Container { name: "a".to_string(), ..Default::default() }],
            ..Default::default()
        };
        assert!(validate_pod_template(&template_with(spec)).is_ok());
    }

    #[test]
    fn default_pod_template_sets_automount_false_when_unset() {
        let spec = PodSpec {
            containers: vec![Container { name: "a".to_string(), ..Default::default() }],
            ..Default::default()
        };
        let mut template = template_with(spec);
        default_pod_template(&mut template);
        assert_eq!(
            template.template.unwrap().spec.unwrap().automount_service_account_token,
            Some(false)
        );
    }

    #[test]
    fn validate_claim_spec_rejects_zero_replicas() {
        let spec = SandboxClaimSpec { replicas: 0, ..Default::default() };
        assert!(validate_sandbox_claim_spec(&spec).is_err());
    }

    #[test]
    fn validate_claim_spec_rejects_internal_label_keys() {
        let mut spec = SandboxClaimSpec { replicas: 1, ..Default::default() };
        spec.labels.insert("agents.kruise.io/owner".to_string(), "x".to_string());
        assert!(validate_sandbox_claim_spec(&spec).is_err());
    }

    #[test]
    fn validate_set_spec_accepts_zero_replicas() {
        let spec = SandboxSetSpec { replicas: 0, ..Default::default() };
        assert!(validate_sandbox_set_spec(&spec).is_ok());
    }
}
