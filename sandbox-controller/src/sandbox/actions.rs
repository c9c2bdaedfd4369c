use crate::util::{self, Error, patch::*};
use k8s_openapi::{
    api::core::v1::{Pod, PodSpec, PodTemplateSpec},
    apimachinery::pkg::apis::meta::v1::Time,
    jiff::Timestamp,
};
use kube::{
    Api, Client, ResourceExt,
    api::{ObjectMeta, Resource},
};
use sandbox_common::annotations;
use sandbox_types::{
    PersistentContentMode, Sandbox, SandboxPhase, inplace_update_reasons, paused_reasons,
    sandbox_condition_types as condition_types,
};
use std::collections::BTreeMap;

fn instance_name(instance: &Sandbox) -> Result<&str, Error> {
    instance
        .meta()
        .name
        .as_deref()
        .ok_or_else(|| Error::UserInput("Sandbox is missing metadata.name".to_string()))
}

fn instance_namespace(instance: &Sandbox) -> Result<&str, Error> {
    instance
        .meta()
        .namespace
        .as_deref()
        .ok_or_else(|| Error::UserInput("Sandbox is missing metadata.namespace".to_string()))
}

/// Builds the pod for `instance` from its inline template. A
/// `templateRef` is resolved by the caller before this is reached --
/// resolving named template objects is out of scope here, so an inline
/// template is required by the time we get to pod construction.
pub fn pod_resource(instance: &Sandbox) -> Result<Pod, Error> {
    let name = instance_name(instance)?.to_string();
    let namespace = instance_namespace(instance)?.to_string();

    // Defensive re-check of the admission-webhook's validation contract:
    // don't trust that every stored object actually passed through it.
    if let Err(reason) = sandbox_types::validate_pod_template(&instance.spec.pod) {
        return Err(Error::UserInput(format!("Sandbox '{name}' has an invalid pod template: {reason}")));
    }

    let mut pod_template = instance.spec.pod.clone();
    sandbox_types::default_pod_template(&mut pod_template);
    let template: PodTemplateSpec = pod_template
        .template
        .ok_or_else(|| Error::UserInput(format!("Sandbox '{name}' has no inline pod template")))?;

    let mut labels = template
        .metadata
        .as_ref()
        .and_then(|m| m.labels.clone())
        .unwrap_or_default();
    labels.insert(annotations::SANDBOX_NAME.to_string(), name.clone());
    labels.extend(instance.spec.extra_labels.clone());

    let mut pod_annotations: BTreeMap<String, String> = template
        .metadata
        .as_ref()
        .and_then(|m| m.annotations.clone())
        .unwrap_or_default();
    pod_annotations.insert(annotations::SPEC_HASH.to_string(), util::hash_spec(&instance.spec.pod));
    pod_annotations.extend(instance.spec.extra_annotations.clone());

    Ok(Pod {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(namespace),
            labels: Some(labels),
            annotations: Some(pod_annotations),
            owner_references: Some(vec![instance.controller_owner_ref(&()).unwrap()]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            restart_policy: Some("Never".to_string()),
            ..template.spec.unwrap_or_default()
        }),
        status: None,
    })
}

pub async fn create_pod(client: Client, instance: &Sandbox) -> Result<(), Error> {
    let pod = pod_resource(instance)?;
    let name = instance_name(instance)?;
    patch_status(client.clone(), instance, |status| {
        status.phase = SandboxPhase::Pending;
        status.template_hash = util::hash_spec(&instance.spec.pod);
        status.message = Some(format!("Creating pod '{name}'"));
    })
    .await?;
    let pods: Api<Pod> = Api::namespaced(client, instance_namespace(instance)?);
    match pods.create(&Default::default(), &pod).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

pub async fn delete_pod(client: Client, instance: &Sandbox) -> Result<(), Error> {
    let pods: Api<Pod> = Api::namespaced(client, instance_namespace(instance)?);
    match pods.delete(instance_name(instance)?, &Default::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

pub async fn mark_starting(client: Client, instance: &Sandbox, reason: String) -> Result<(), Error> {
    patch_status(client, instance, |status| {
        status.message = Some(reason);
        upsert_condition(&mut status.conditions, condition_types::READY, "False", "NotReady");
    })
    .await?;
    Ok(())
}

pub async fn mark_running(client: Client, instance: &Sandbox, pod: &Pod) -> Result<(), Error> {
    patch_status(client, instance, |status| {
        status.phase = SandboxPhase::Running;
        status.observed_generation = instance.metadata.generation.unwrap_or(0);
        status.pod_info.pod_ip = pod.status.as_ref().and_then(|s| s.pod_ip.clone());
        status.pod_info.pod_node = pod.spec.as_ref().and_then(|s| s.node_name.clone());
        status.pod_info.pod_uid = pod.metadata.uid.clone();
        status.pod_info.pod_annotations = pod.metadata.annotations.clone().unwrap_or_default();
        status.message = Some("Pod is Ready".to_string());
        upsert_condition(&mut status.conditions, condition_types::READY, "True", "PodReady");
    })
    .await?;
    Ok(())
}

pub async fn pause(client: Client, instance: &Sandbox, delete: bool) -> Result<(), Error> {
    if delete {
        delete_pod(client.clone(), instance).await?;
    } else {
        let pods: Api<Pod> = Api::namespaced(client.clone(), instance_namespace(instance)?);
        let patch = serde_json::json!({
            "metadata": {
                "annotations": {
                    annotations::POD_PAUSE: "true",
                    annotations::POD_RESERVE_INSTANCE: "true",
                }
            }
        });
        pods.patch(
            instance_name(instance)?,
            &kube::api::PatchParams::apply("sandbox-controller"),
            &kube::api::Patch::Merge(&patch),
        )
        .await?;
    }
    let reason = if delete {
        paused_reasons::DELETE_POD
    } else {
        paused_reasons::SET_PAUSE
    };
    patch_status(client, instance, |status| {
        status.phase = SandboxPhase::Paused;
        status.message = Some(format!("Paused (reason: {reason})"));
        upsert_condition(&mut status.conditions, condition_types::PAUSED, "True", reason);
    })
    .await?;
    Ok(())
}

pub async fn resume(client: Client, instance: &Sandbox, recreate_pod: bool) -> Result<(), Error> {
    if recreate_pod {
        create_pod(client.clone(), instance).await?;
    } else {
        let pods: Api<Pod> = Api::namespaced(client.clone(), instance_namespace(instance)?);
        let patch = serde_json::json!({
            "metadata": {
                "annotations": {
                    annotations::POD_PAUSE: "false",
                }
            }
        });
        pods.patch(
            instance_name(instance)?,
            &kube::api::PatchParams::apply("sandbox-controller"),
            &kube::api::Patch::Merge(&patch),
        )
        .await?;
    }
    patch_status(client, instance, |status| {
        status.phase = SandboxPhase::Resuming;
        status.message = Some("Resuming".to_string());
    })
    .await?;
    Ok(())
}

pub async fn mark_resumed(client: Client, instance: &Sandbox) -> Result<(), Error> {
    patch_status(client, instance, |status| {
        status.phase = SandboxPhase::Running;
        status.message = Some("Resumed".to_string());
        upsert_condition(&mut status.conditions, condition_types::RESUMED, "True", "Resumed");
    })
    .await?;
    Ok(())
}

pub async fn fail(client: Client, instance: &Sandbox, reason: String) -> Result<(), Error> {
    patch_status(client, instance, |status| {
        status.phase = SandboxPhase::Failed;
        status.message = Some(reason);
        upsert_condition(&mut status.conditions, condition_types::READY, "False", "Failed");
    })
    .await?;
    Ok(())
}

pub async fn begin_terminate(client: Client, instance: &Sandbox, reason: String) -> Result<(), Error> {
    patch_status(client, instance, |status| {
        status.phase = SandboxPhase::Terminating;
        status.message = Some(reason);
    })
    .await?;
    let api: Api<Sandbox> = Api::namespaced(client, instance_namespace(instance)?);
    api.delete(instance_name(instance)?, &Default::default()).await?;
    Ok(())
}

pub async fn inplace_update(client: Client, instance: &Sandbox, _pod: &Pod) -> Result<(), Error> {
    let desired = pod_resource(instance)?;
    let pods: Api<Pod> = Api::namespaced(client.clone(), instance_namespace(instance)?);
    let patch = serde_json::json!({
        "spec": { "containers": desired.spec.as_ref().map(|s| &s.containers) },
        "metadata": { "annotations": { annotations::SPEC_HASH: util::hash_spec(&instance.spec.pod) } }
    });
    pods.patch(
        instance_name(instance)?,
        &kube::api::PatchParams::apply("sandbox-controller"),
        &kube::api::Patch::Merge(&patch),
    )
    .await?;
    patch_status(client, instance, |status| {
        status.template_hash = util::hash_spec(&instance.spec.pod);
        upsert_condition(
            &mut status.conditions,
            condition_types::INPLACE_UPDATE,
            "True",
            inplace_update_reasons::UPDATING,
        );
    })
    .await?;
    Ok(())
}

/// Flips the `InplaceUpdate` condition to a terminal reason once the pod
/// has converged (or given up converging) on the patched template.
pub async fn resolve_inplace_update(client: Client, instance: &Sandbox, succeeded: bool) -> Result<(), Error> {
    let reason = if succeeded {
        inplace_update_reasons::SUCCEEDED
    } else {
        inplace_update_reasons::FAILED
    };
    let condition_status = if succeeded { "True" } else { "False" };
    patch_status(client, instance, |status| {
        upsert_condition(&mut status.conditions, condition_types::INPLACE_UPDATE, condition_status, reason);
    })
    .await?;
    Ok(())
}

pub fn supports_inplace_pause(modes: &[PersistentContentMode]) -> bool {
    modes.contains(&PersistentContentMode::Memory)
}

fn upsert_condition(
    conditions: &mut Vec<k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition>,
    type_: &str,
    status: &str,
    reason: &str,
) {
    let now = Time::from(Timestamp::now());
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == type_) {
        if existing.status != status {
            existing.last_transition_time = now;
        }
        existing.status = status.to_string();
        existing.reason = reason.to_string();
        existing.message = reason.to_string();
    } else {
        conditions.push(k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition {
            type_: type_.to_string(),
            status: status.to_string(),
            reason: reason.to_string(),
            message: reason.to_string(),
            observed_generation: None,
            last_transition_time: now,
        });
    }
}
