use crate::util::{self, Error, patch::*};
use kube::{
    Api, Client, ResourceExt,
    api::{ObjectMeta, Resource},
};
use sandbox_common::annotations;
use sandbox_types::{Sandbox, SandboxSet, SandboxSetSpec, SandboxSpec};

fn instance_name(instance: &SandboxSet) -> Result<&str, Error> {
    instance
        .meta()
        .name
        .as_deref()
        .ok_or_else(|| Error::UserInput("SandboxSet is missing metadata.name".to_string()))
}

fn instance_namespace(instance: &SandboxSet) -> Result<&str, Error> {
    instance
        .meta()
        .namespace
        .as_deref()
        .ok_or_else(|| Error::UserInput("SandboxSet is missing metadata.namespace".to_string()))
}

/// Builds one child `Sandbox` for `set`, stamped with the pool's
/// back-pointer label and owned (via `ownerReferences`) by the set so
/// that deleting the set garbage-collects its *unclaimed* children.
/// Claimed children have this owner reference severed by the Pick
/// Engine, which is what makes claim-time transfer safe against pool
/// scale-down.
pub fn sandbox_resource(set: &SandboxSet, name: &str, update_revision: &str) -> Result<Sandbox, Error> {
    let namespace = instance_namespace(set)?.to_string();
    let mut labels = set.spec.extra_labels.clone();
    labels.insert(annotations::SANDBOX_TEMPLATE.to_string(), instance_name(set)?.to_string());
    labels.insert(annotations::TEMPLATE_HASH.to_string(), update_revision.to_string());

    Ok(Sandbox {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace),
            labels: Some(labels),
            annotations: Some(set.spec.extra_annotations.clone()),
            owner_references: Some(vec![set.controller_owner_ref(&()).unwrap()]),
            ..Default::default()
        },
        spec: SandboxSpec {
            pod: set.spec.pod.clone(),
            extra_labels: set.spec.extra_labels.clone(),
            extra_annotations: set.spec.extra_annotations.clone(),
            ..Default::default()
        },
        status: None,
    })
}

pub async fn create_sandbox(client: Client, set: &SandboxSet, name: &str, update_revision: &str) -> Result<(), Error> {
    let sandbox = sandbox_resource(set, name, update_revision)?;
    let api: Api<Sandbox> = Api::namespaced(client, instance_namespace(set)?);
    match api.create(&Default::default(), &sandbox).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

pub async fn delete_sandbox(client: Client, set: &SandboxSet, name: &str) -> Result<(), Error> {
    let api: Api<Sandbox> = Api::namespaced(client, instance_namespace(set)?);
    match api.delete(name, &Default::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Returns the resource version of the patched `SandboxSet`, so the
/// caller can record a resource-version expectation and avoid acting on
/// a stale cache read of its own write.
pub async fn update_status(
    client: Client,
    set: &SandboxSet,
    replicas: i32,
    available_replicas: i32,
    update_revision: String,
) -> Result<String, Error> {
    let patched = patch_status(client, set, |status| {
        status.replicas = replicas;
        status.available_replicas = available_replicas;
        status.update_revision = update_revision.clone();
        status.selector = Some(format!(
            "{}={}",
            annotations::SANDBOX_TEMPLATE,
            instance_name(set).unwrap_or_default()
        ));
        status.message = Some(format!(
            "{available_replicas}/{replicas} sandboxes available"
        ));
    })
    .await?;
    Ok(patched.metadata.resource_version.unwrap_or_default())
}

/// Hashes only the pod template, not the whole `SandboxSetSpec` —
/// `replicas`/`scaleStrategy` changes shouldn't mark existing children
/// stale, and this must stay equal in meaning to the hash a pool-managed
/// `Sandbox`'s own `status.templateHash` is computed from
/// (`sandbox::actions::pod_resource`'s `util::hash_spec(&instance.spec.pod)`)
/// so `planner::partition_children`'s revision comparison is apples to
/// apples.
pub fn update_revision(spec: &SandboxSetSpec) -> String {
    util::hash_spec(&spec.pod)
}
