use k8s_openapi::{api::core::v1::Pod, jiff::Timestamp};
use kube::{Api, Client, ResourceExt, api::PostParams};
use rand::seq::SliceRandom;
use sandbox_common::annotations;
use sandbox_types::{Sandbox, SandboxClaim};
use std::time::{Duration, Instant};

use crate::cache::Cache;
use crate::util::{Error, pick_cache::PickCache};

/// Outcome of one Pick Engine attempt, distinguished so the claim
/// reconciler can tell "nothing to do right now" apart from a real
/// error.
pub enum PickOutcome {
    Claimed(Sandbox),
    PoolEmpty,
    Conflict,
    InitFailed(String),
}

/// Timing breakdown emitted per successful pick.
#[derive(Debug, Clone, Copy, Default)]
pub struct PickMetrics {
    pub pick_and_lock: Duration,
    pub init_runtime: Duration,
    pub total: Duration,
}

/// Runs one attempt of the Pick Engine: select a candidate, take a
/// process-local hold, compare-and-set it onto `claim`, sever the
/// pool's ownership, and (if requested) wait for the post-update Ready
/// condition. Returns `PickOutcome::PoolEmpty`/`Conflict`/`InitFailed`
/// rather than an `Error` for the negative-but-expected results the
/// taxonomy calls out — only transient store errors are surfaced as
/// `Error`.
pub async fn pick_one(
    client: &Client,
    cache: &Cache,
    pick_cache: &PickCache,
    claim: &SandboxClaim,
) -> Result<(PickOutcome, PickMetrics), Error> {
    let total_start = Instant::now();
    let mut candidates = cache.list_available_sandbox_in_pool(&claim.spec.template_name).await;
    if candidates.is_empty() {
        return Ok((PickOutcome::PoolEmpty, PickMetrics::default()));
    }

    // Randomize so concurrent claim workers across the process don't
    // all race on the lexicographically-first candidate.
    candidates.shuffle(&mut rand::rng());

    for candidate in candidates {
        let name = match &candidate.metadata.name {
            Some(n) => n.clone(),
            None => continue,
        };
        if !pick_cache.try_hold(&name).await {
            continue;
        }

        let pick_start = Instant::now();
        match try_claim(client, &candidate, claim).await {
            Ok(claimed) => {
                let pick_and_lock = pick_start.elapsed();
                let init_start = Instant::now();
                match warm_up(client, cache, claim, &claimed).await {
                    Ok(()) => {
                        pick_cache.release(&name).await;
                        let metrics = PickMetrics {
                            pick_and_lock,
                            init_runtime: init_start.elapsed(),
                            total: total_start.elapsed(),
                        };
                        return Ok((PickOutcome::Claimed(claimed), metrics));
                    }
                    Err(reason) => {
                        rollback(client, &claimed).await?;
                        pick_cache.release(&name).await;
                        return Ok((PickOutcome::InitFailed(reason), PickMetrics::default()));
                    }
                }
            }
            Err(TryClaimError::Conflict) => {
                pick_cache.release(&name).await;
                continue;
            }
            Err(TryClaimError::Store(e)) => {
                pick_cache.release(&name).await;
                return Err(e);
            }
        }
    }

    Ok((PickOutcome::Conflict, PickMetrics::default()))
}

enum TryClaimError {
    Conflict,
    Store(Error),
}

/// Compare-and-set: replaces `candidate` with its resource-version
/// intact, stamped with the claim's ownership and custom
/// labels/annotations, and with the pool's owner reference severed. A
/// 409 means another claimant's replace landed first.
async fn try_claim(client: &Client, candidate: &Sandbox, claim: &SandboxClaim) -> Result<Sandbox, TryClaimError> {
    let namespace = candidate.namespace().ok_or(TryClaimError::Conflict)?;
    let name = candidate.name_any();
    let api: Api<Sandbox> = Api::namespaced(client.clone(), &namespace);

    let mut desired = candidate.clone();
    if desired
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(annotations::SANDBOX_CLAIMED))
        .is_some_and(|v| v == "true")
    {
        return Err(TryClaimError::Conflict);
    }

    let claim_uid = claim.metadata.uid.clone().unwrap_or_default();
    let labels = desired.metadata.labels.get_or_insert_with(Default::default);
    labels.insert(annotations::SANDBOX_CLAIMED.to_string(), "true".to_string());
    labels.insert(annotations::CLAIM_NAME.to_string(), claim.name_any());
    labels.extend(claim.spec.labels.clone());

    let annos = desired.metadata.annotations.get_or_insert_with(Default::default);
    annos.insert(annotations::OWNER.to_string(), claim_uid);
    annos.insert(annotations::CLAIM_TIMESTAMP.to_string(), Timestamp::now().to_string());
    annos.extend(claim.spec.annotations.clone());

    if let Some(shutdown_time) = &claim.spec.shutdown_time {
        desired.spec.shutdown_time = Some(shutdown_time.clone());
    }

    // Sever the pool's parent-pointer so deleting the claim never
    // cascades into the sandbox, and scaling the pool down never
    // touches a sandbox that now belongs to a claimant.
    if let Some(owners) = desired.metadata.owner_references.as_mut() {
        owners.retain(|o| o.kind != "SandboxSet");
    }

    match api.replace(&name, &PostParams::default(), &desired).await {
        Ok(replaced) => Ok(replaced),
        Err(kube::Error::Api(ae)) if ae.code == 409 => Err(TryClaimError::Conflict),
        Err(e) => Err(TryClaimError::Store(e.into())),
    }
}

/// Reverts a claimed sandbox back to pool ownership after a failed
/// warm-up, freeing it for another claimant. Best-effort: failures here
/// are logged, not propagated, since the claim is already failing for
/// the original reason.
async fn rollback(client: &Client, claimed: &Sandbox) -> Result<(), Error> {
    let namespace = claimed.namespace().unwrap_or_default();
    let name = claimed.name_any();
    let api: Api<Sandbox> = Api::namespaced(client.clone(), &namespace);
    let current = match api.get(&name).await {
        Ok(c) => c,
        Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let mut reverted = current.clone();
    if let Some(labels) = reverted.metadata.labels.as_mut() {
        labels.remove(annotations::SANDBOX_CLAIMED);
        labels.remove(annotations::CLAIM_NAME);
    }
    if let Some(annos) = reverted.metadata.annotations.as_mut() {
        annos.remove(annotations::OWNER);
        annos.remove(annotations::CLAIM_TIMESTAMP);
    }
    match api.replace(&name, &PostParams::default(), &reverted).await {
        Ok(_) | Err(kube::Error::Api(_)) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Optional in-place update requested by the claim (new image and/or
/// env injection), waiting up to `waitReadyTimeout` for the Ready
/// condition to flip back `True` on the updated pod. A timeout or
/// error here is reported to the caller as an init failure so the pick
/// can be rolled back.
async fn warm_up(client: &Client, cache: &Cache, claim: &SandboxClaim, sandbox: &Sandbox) -> Result<(), String> {
    let Some(image) = claim.spec.image.as_ref() else {
        return Ok(());
    };
    let namespace = sandbox.namespace().unwrap_or_default();
    let name = sandbox.name_any();
    let pods: Api<Pod> = Api::namespaced(client.clone(), &namespace);

    let patch = serde_json::json!({
        "spec": { "containers": [{ "name": first_container_name(sandbox), "image": image }] }
    });
    pods.patch(
        &name,
        &kube::api::PatchParams::apply("sandboxclaim-controller"),
        &kube::api::Patch::Merge(&patch),
    )
    .await
    .map_err(|e| format!("failed to patch image: {e}"))?;

    let timeout = Duration::from_secs(claim.spec.wait_ready_timeout_seconds.unwrap_or(30));
    let deadline = Instant::now() + timeout;
    loop {
        if Instant::now() >= deadline {
            return Err(format!("sandbox '{name}' did not become Ready within {timeout:?}"));
        }
        let refreshed = cache
            .list_sandbox_in_pool(&claim.spec.template_name)
            .await
            .into_iter()
            .find(|s| s.name_any() == name);
        if let Some(s) = refreshed
            && crate::cache::is_ready(&s)
        {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

fn first_container_name(sandbox: &Sandbox) -> String {
    sandbox
        .spec
        .pod
        .template
        .as_ref()
        .and_then(|t| t.spec.as_ref())
        .and_then(|s| s.containers.first())
        .map(|c| c.name.clone())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, PodSpec};
    use sandbox_types::{PodTemplate, SandboxSpec};

    fn sandbox_with_containers(names: &[&str]) -> Sandbox {
        Sandbox {
            metadata: Default::default(),
            spec: SandboxSpec {
                pod: PodTemplate {
                    template: Some(k8s_openapi::api::core::v1::PodTemplateSpec {
                        spec: Some(PodSpec {
                            containers: names
                                .iter()
                                .map(|n| Container { name: n.to_string(), ..Default::default() })
                                .collect(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    template_ref: None,
                },
                ..Default::default()
            },
            status: None,
        }
    }

    #[test]
    fn first_container_name_picks_first_of_several() {
        let sandbox = sandbox_with_containers(&["main", "sidecar"]);
        assert_eq!(first_container_name(&sandbox), "main");
    }

    #[test]
    fn first_container_name_empty_when_no_template() {
        let sandbox = sandbox_with_containers(&[]);
        assert_eq!(first_container_name(&sandbox), "");
    }

    #[test]
    fn first_container_name_empty_when_template_ref_only() {
        let sandbox = Sandbox {
            metadata: Default::default(),
            spec: SandboxSpec {
                pod: PodTemplate { template: None, template_ref: Some("base-template".to_string()) },
                ..Default::default()
            },
            status: None,
        };
        assert_eq!(first_container_name(&sandbox), "");
    }
}
