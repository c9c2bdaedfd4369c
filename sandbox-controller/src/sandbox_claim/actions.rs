use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::jiff::Timestamp;
use kube::{Api, Client, ResourceExt};
use sandbox_types::{SandboxClaim, SandboxClaimPhase, SandboxClaimStatus, SandboxSet};

use crate::util::{Error, patch::*};

/// Returns `true` if the pool a claim targets still exists. A claim whose
/// pool was deleted out from under it fast-fails to `Completed` rather
/// than retrying forever against a target that will never come back.
pub async fn pool_exists(client: Client, namespace: &str, template_name: &str) -> Result<bool, Error> {
    let api: Api<SandboxSet> = Api::namespaced(client, namespace);
    match api.get(template_name).await {
        Ok(_) => Ok(true),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
        Err(e) => Err(e.into()),
    }
}

pub async fn mark_claiming(client: Client, claim: &SandboxClaim, claimed_replicas: i32) -> Result<(), Error> {
    patch_status::<SandboxClaimStatus, SandboxClaim>(client, claim, |status| {
        if status.claim_start_time.is_none() {
            status.claim_start_time = Some(Time::from(Timestamp::now()));
        }
        status.phase = SandboxClaimPhase::Claiming;
        status.claimed_replicas = claimed_replicas;
        status.message = Some(format!("{claimed_replicas}/{} sandboxes claimed", claim.spec.replicas));
    })
    .await?;
    Ok(())
}

/// Transitions a claim to `Completed`, recording `reason` (one of
/// [`sandbox_types::completion_reasons`]) both as the status message and
/// as a `Completed`-typed condition.
pub async fn mark_completed(
    client: Client,
    claim: &SandboxClaim,
    claimed_replicas: i32,
    reason: &'static str,
    message: String,
) -> Result<(), Error> {
    patch_status::<SandboxClaimStatus, SandboxClaim>(client, claim, |status| {
        status.phase = SandboxClaimPhase::Completed;
        status.claimed_replicas = claimed_replicas;
        status.completion_time = Some(Time::from(Timestamp::now()));
        status.message = Some(message);
        let completed = sandbox_types::sandbox_claim_condition_types::COMPLETED;
        status.conditions.retain(|c| c.type_ != completed);
        status.conditions.push(k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition {
            type_: completed.to_string(),
            status: "True".to_string(),
            reason: reason.to_string(),
            message: String::new(),
            last_transition_time: Time::from(Timestamp::now()),
            observed_generation: None,
        });
        if reason == sandbox_types::completion_reasons::TIMEOUT_REACHED {
            let timed_out = sandbox_types::sandbox_claim_condition_types::TIMED_OUT;
            status.conditions.retain(|c| c.type_ != timed_out);
            status.conditions.push(k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition {
                type_: timed_out.to_string(),
                status: "True".to_string(),
                reason: reason.to_string(),
                message: String::new(),
                last_transition_time: Time::from(Timestamp::now()),
                observed_generation: None,
            });
        }
    })
    .await?;
    Ok(())
}

pub async fn delete_claim(client: Client, claim: &SandboxClaim) -> Result<(), Error> {
    let namespace = claim.namespace().unwrap_or_default();
    let api: Api<SandboxClaim> = Api::namespaced(client, &namespace);
    match api.delete(&claim.name_any(), &Default::default()).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}
