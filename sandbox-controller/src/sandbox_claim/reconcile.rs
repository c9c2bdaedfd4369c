use futures::stream::{self, StreamExt};
use k8s_openapi::jiff::Timestamp;
use kube::{
    Client, ResourceExt,
    api::Resource,
    runtime::{
        Controller,
        controller::Action,
        events::{Recorder, Reporter},
    },
};
use kube_leader_election::{LeaseLock, LeaseLockParams, LeaseLockResult};
use owo_colors::OwoColorize;
use sandbox_types::{SandboxClaim, completion_reasons};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

use super::{actions, pick};
use crate::cache::Cache;
use crate::util::{
    Error,
    colors::{FG1, FG2},
    events::{EventReason, publish},
    pick_cache::PickCache,
};

#[cfg(feature = "metrics")]
use crate::util::metrics::PickEngineMetrics;

/// Entrypoint for the `SandboxClaim` controller, wired the same way as
/// the sandbox and set controllers: one leader-elected loop per process,
/// its own `Lease`. `max_batch_size` bounds how many sandboxes the Pick
/// Engine attempts concurrently per reconcile; `retry_interval` is the
/// requeue delay while a claim is still `Claiming`.
pub async fn run(client: Client, cache: Cache, max_batch_size: usize, retry_interval: Duration) -> Result<(), Error> {
    println!("{}", "⚙️ Starting SandboxClaim controller...".green());

    let context: Arc<ContextData> = Arc::new(ContextData::new(client.clone(), cache, max_batch_size, retry_interval));

    let lease_namespace = std::env::var("NAMESPACE").unwrap_or_else(|_| "default".to_string());
    let holder_id = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("sandboxclaim-controller-{}", uuid::Uuid::new_v4()));
    let leadership = LeaseLock::new(
        client.clone(),
        &lease_namespace,
        LeaseLockParams {
            holder_id,
            lease_name: "sandboxclaim-controller-lock".to_string(),
            lease_ttl: Duration::from_secs(15),
        },
    );

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        sandbox_common::shutdown::shutdown_signal().await;
        shutdown_signal.cancel();
    });

    // The pick cache only self-cleans entries that get looked up again
    // through `try_hold`'s lazy-expiry check; a candidate held once and
    // then never revisited (claimed, or dropped from the pool) would
    // otherwise sit in the map forever in a long-running process.
    let sweep_pick_cache = context.pick_cache.clone();
    let sweep_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let mut sweep_tick = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = sweep_shutdown.cancelled() => break,
                _ = sweep_tick.tick() => sweep_pick_cache.sweep().await,
            }
        }
    });

    let mut controller_task: Option<tokio::task::JoinHandle<()>> = None;
    let mut tick = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                if let Some(task) = controller_task.take() {
                    task.abort();
                    task.await.ok();
                }
                break Ok(())
            },
            _ = tick.tick() => {}
        }
        let lease = match leadership.try_acquire_or_renew().await {
            Ok(l) => l,
            Err(e) => {
                eprintln!("leader election renew/acquire failed: {e}");
                if let Some(task) = controller_task.take() {
                    task.abort();
                }
                continue;
            }
        };
        if matches!(lease, LeaseLockResult::Acquired(_)) {
            if controller_task.is_none() {
                println!("{}", "👑 Acquired leadership; starting SandboxClaim controller".green());
                let client_for_controller = client.clone();
                let context_for_controller = context.clone();
                let controller_namespace = lease_namespace.clone();
                let crd_api_for_controller: kube::Api<SandboxClaim> =
                    kube::Api::namespaced(client_for_controller, &controller_namespace);
                controller_task = Some(tokio::spawn(async move {
                    Controller::new(crd_api_for_controller, Default::default())
                        .run(reconcile, on_error, context_for_controller)
                        .for_each(|_res| async move {})
                        .await;
                }));
            }
        } else if let Some(task) = controller_task.take() {
            eprintln!("lost leadership; stopping SandboxClaim controller");
            task.abort();
        }
    }
}

struct ContextData {
    client: Client,
    cache: Cache,
    pick_cache: PickCache,
    reporter: Reporter,
    max_batch_size: usize,
    retry_interval: Duration,
    error_backoff: crate::util::wait::ErrorBackoff,
    #[cfg(feature = "metrics")]
    metrics: PickEngineMetrics,
}

impl ContextData {
    fn new(client: Client, cache: Cache, max_batch_size: usize, retry_interval: Duration) -> Self {
        let pick_cache = PickCache::new(Duration::from_secs(30));
        let reporter = Reporter::from("sandboxclaim-controller");
        let error_backoff = crate::util::wait::ErrorBackoff::new();
        #[cfg(feature = "metrics")]
        {
            let metrics = PickEngineMetrics::new();
            metrics.register(prometheus::default_registry());
            ContextData {
                client,
                cache,
                pick_cache,
                reporter,
                max_batch_size,
                retry_interval,
                error_backoff,
                metrics,
            }
        }
        #[cfg(not(feature = "metrics"))]
        {
            ContextData { client, cache, pick_cache, reporter, max_batch_size, retry_interval, error_backoff }
        }
    }
}

async fn reconcile(claim: Arc<SandboxClaim>, context: Arc<ContextData>) -> Result<Action, Error> {
    let client = context.client.clone();
    let namespace = claim
        .namespace()
        .ok_or_else(|| Error::UserInput("Expected SandboxClaim to be namespaced".to_string()))?;
    let name = claim.name_any();
    let claim_uid = claim.metadata.uid.clone().unwrap_or_default();

    if claim.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }

    // Defensive re-check of the admission-webhook's validation contract:
    // don't trust that every stored object actually passed through it.
    if let Err(reason) = sandbox_types::validate_sandbox_claim_spec(&claim.spec) {
        eprintln!("{}", format!("SandboxClaim {namespace}/{name} has an invalid spec, skipping: {reason}").red());
        return Ok(Action::await_change());
    }

    let recorder = Recorder::new(client.clone(), context.reporter.clone(), claim.object_ref(&()));

    let phase = claim.status.as_ref().map(|s| s.phase).unwrap_or_default();
    if phase == sandbox_types::SandboxClaimPhase::Completed {
        return reconcile_completed(&client, &recorder, &claim).await;
    }

    if !actions::pool_exists(client.clone(), &namespace, &claim.spec.template_name).await? {
        let already_claimed = context.cache.list_sandbox_with_user(&claim_uid).await.len() as i32;
        actions::mark_completed(
            client,
            &claim,
            already_claimed,
            completion_reasons::SANDBOX_SET_NOT_FOUND,
            format!("pool '{}' does not exist", claim.spec.template_name),
        )
        .await?;
        publish(
            &recorder,
            EventReason::SandboxSetNotFound,
            format!("pool '{}' not found", claim.spec.template_name),
            "Reconcile",
        )
        .await
        .ok();
        context.error_backoff.clear(&namespace, &name);
        return Ok(Action::requeue(context.retry_interval));
    }

    // Crash-recovery: a previous reconcile may have claimed sandboxes and
    // then died before writing status. Trust whichever count is higher so
    // a restart never re-claims what it already holds.
    let already_claimed = context.cache.list_sandbox_with_user(&claim_uid).await.len() as i32;
    let current = already_claimed.max(claim.status.as_ref().map(|s| s.claimed_replicas).unwrap_or(0));

    if current >= claim.spec.replicas {
        actions::mark_completed(
            client,
            &claim,
            current,
            completion_reasons::ALL_REPLICAS_CLAIMED,
            format!("{current}/{} sandboxes claimed", claim.spec.replicas),
        )
        .await?;
        publish(
            &recorder,
            EventReason::ClaimCompleted,
            format!("claimed all {current} requested sandboxes"),
            "Reconcile",
        )
        .await
        .ok();
        context.error_backoff.clear(&namespace, &name);
        return Ok(Action::requeue(ttl_after_completed(&claim)));
    }

    if claim_timed_out(&claim) {
        actions::mark_completed(
            client,
            &claim,
            current,
            completion_reasons::TIMEOUT_REACHED,
            format!("claimTimeout reached with {current}/{} sandboxes claimed", claim.spec.replicas),
        )
        .await?;
        publish(
            &recorder,
            EventReason::ClaimCompleted,
            format!("claim timed out with {current}/{} sandboxes claimed", claim.spec.replicas),
            "Reconcile",
        )
        .await
        .ok();
        context.error_backoff.clear(&namespace, &name);
        return Ok(Action::requeue(ttl_after_completed(&claim)));
    }

    let needed = ((claim.spec.replicas - current).max(0) as usize).min(context.max_batch_size);

    let mut newly_claimed = 0i32;
    let mut pool_empty = false;
    for window in crate::sandbox_set::planner::slow_start_windows(needed) {
        let outcomes: Vec<Result<(pick::PickOutcome, pick::PickMetrics), Error>> = stream::iter(0..window)
            .map(|_| {
                let client = client.clone();
                let cache = context.cache.clone();
                let pick_cache = context.pick_cache.clone();
                let claim = claim.clone();
                async move { pick::pick_one(&client, &cache, &pick_cache, &claim).await }
            })
            .buffer_unordered(window)
            .collect()
            .await;

        // Abort the remainder of the batch on the first error within a
        // window; picks already counted above stand.
        for outcome in outcomes {
            match outcome? {
                (pick::PickOutcome::Claimed(sandbox), metrics) => {
                    newly_claimed += 1;
                    #[cfg(feature = "metrics")]
                    {
                        context
                            .metrics
                            .picks_total
                            .with_label_values(&["claimed"])
                            .inc();
                        context
                            .metrics
                            .pick_and_lock_duration
                            .with_label_values(&["claimed"])
                            .observe(metrics.pick_and_lock.as_secs_f64());
                        context
                            .metrics
                            .init_runtime_duration
                            .with_label_values(&["claimed"])
                            .observe(metrics.init_runtime.as_secs_f64());
                        context
                            .metrics
                            .total_duration
                            .with_label_values(&["claimed"])
                            .observe(metrics.total.as_secs_f64());
                    }
                    #[cfg(not(feature = "metrics"))]
                    let _ = &metrics;
                    publish(
                        &recorder,
                        EventReason::SandboxClaimed,
                        format!("claimed sandbox '{}'", sandbox.name_any()),
                        "Reconcile",
                    )
                    .await
                    .ok();
                }
                (pick::PickOutcome::PoolEmpty, _) => {
                    pool_empty = true;
                    #[cfg(feature = "metrics")]
                    context.metrics.picks_total.with_label_values(&["pool_empty"]).inc();
                }
                (pick::PickOutcome::Conflict, _) => {
                    #[cfg(feature = "metrics")]
                    context.metrics.picks_total.with_label_values(&["conflict"]).inc();
                }
                (pick::PickOutcome::InitFailed(reason), _) => {
                    #[cfg(feature = "metrics")]
                    context.metrics.picks_total.with_label_values(&["init_failed"]).inc();
                    eprintln!(
                        "{}",
                        format!("SandboxClaim {namespace}/{name}: pick init failed: {reason}").red()
                    );
                }
            }
        }
    }

    let total_claimed = current + newly_claimed;
    if newly_claimed > 0 || claim.status.is_none() {
        println!(
            "🔧 {}{}{}{}{}",
            namespace.color(FG2),
            "/".color(FG1),
            name.color(FG2),
            " claimed: ".color(FG1),
            format!("{total_claimed}/{}", claim.spec.replicas).color(FG2),
        );
    }
    actions::mark_claiming(client, &claim, total_claimed).await?;
    context.error_backoff.clear(&namespace, &name);

    if pool_empty && newly_claimed == 0 {
        publish(
            &recorder,
            EventReason::NoAvailableSandboxes,
            format!("no available sandboxes in pool '{}'", claim.spec.template_name),
            "Reconcile",
        )
        .await
        .ok();
    }

    Ok(Action::requeue(context.retry_interval))
}

/// Once `Completed`, a claim is inert except for its own TTL-based
/// cleanup; claimed sandboxes are untouched by deleting the claim object.
async fn reconcile_completed(client: &Client, recorder: &Recorder, claim: &SandboxClaim) -> Result<Action, Error> {
    let namespace = claim.namespace().unwrap_or_default();
    let name = claim.name_any();
    let Some(completion_time) = claim.status.as_ref().and_then(|s| s.completion_time.as_ref()) else {
        return Ok(Action::await_change());
    };
    let ttl = parse_duration::parse(&claim.spec.ttl_after_completed)?;
    let elapsed: Duration = Timestamp::now()
        .duration_since(completion_time.0)
        .try_into()
        .unwrap_or(Duration::ZERO);
    if elapsed >= ttl {
        println!(
            "🔧 {}{}{}",
            namespace.color(FG2),
            "/".color(FG1),
            format!("{name} TTL elapsed, deleting claim").color(FG2),
        );
        publish(
            recorder,
            EventReason::SandboxClaimTtlDelete,
            "ttlAfterCompleted elapsed".to_string(),
            "Cleanup",
        )
        .await
        .ok();
        actions::delete_claim(client.clone(), claim).await?;
        return Ok(Action::await_change());
    }
    Ok(Action::requeue(ttl.saturating_sub(elapsed).max(Duration::from_secs(1))))
}

fn claim_timed_out(claim: &SandboxClaim) -> bool {
    let Some(start) = claim.status.as_ref().and_then(|s| s.claim_start_time.as_ref()) else {
        return false;
    };
    let Ok(timeout) = parse_duration::parse(&claim.spec.claim_timeout) else {
        return false;
    };
    let Ok(elapsed): Result<Duration, _> = Timestamp::now().duration_since(start.0).try_into() else {
        return false;
    };
    elapsed >= timeout
}

fn ttl_after_completed(claim: &SandboxClaim) -> Duration {
    parse_duration::parse(&claim.spec.ttl_after_completed).unwrap_or(Duration::from_secs(300))
}

fn on_error(claim: Arc<SandboxClaim>, error: &Error, context: Arc<ContextData>) -> Action {
    eprintln!(
        "{}",
        format!("SandboxClaim reconcile error for {}: {error:?}", claim.name_any()).red()
    );
    if let Error::Fatal(msg) = error {
        let recorder = Recorder::new(context.client.clone(), context.reporter.clone(), claim.object_ref(&()));
        let note = msg.clone();
        tokio::spawn(async move {
            publish(&recorder, EventReason::UnknownPhase, note, "Reconcile").await.ok();
        });
        return Action::await_change();
    }
    let namespace = claim.namespace().unwrap_or_default();
    let name = claim.name_any();
    Action::requeue(context.error_backoff.note_error(&namespace, &name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use sandbox_types::{SandboxClaimSpec, SandboxClaimStatus};

    fn claim_with(start_time: Option<Time>, claim_timeout: &str) -> SandboxClaim {
        SandboxClaim {
            metadata: Default::default(),
            spec: SandboxClaimSpec {
                claim_timeout: claim_timeout.to_string(),
                ..Default::default()
            },
            status: Some(SandboxClaimStatus { claim_start_time: start_time, ..Default::default() }),
        }
    }

    #[test]
    fn claim_timed_out_false_with_no_start_time() {
        let claim = claim_with(None, "60s");
        assert!(!claim_timed_out(&claim));
    }

    #[test]
    fn claim_timed_out_true_long_after_start() {
        let claim = claim_with(Some(Time(Timestamp::UNIX_EPOCH)), "60s");
        assert!(claim_timed_out(&claim));
    }

    #[test]
    fn claim_timed_out_false_just_started() {
        let claim = claim_with(Some(Time(Timestamp::now())), "60s");
        assert!(!claim_timed_out(&claim));
    }

    #[test]
    fn ttl_after_completed_parses_spec_value() {
        let mut claim = claim_with(None, "60s");
        claim.spec.ttl_after_completed = "5m".to_string();
        assert_eq!(ttl_after_completed(&claim), Duration::from_secs(300));
    }

    #[test]
    fn ttl_after_completed_falls_back_on_bad_value() {
        let mut claim = claim_with(None, "60s");
        claim.spec.ttl_after_completed = "not-a-duration".to_string();
        assert_eq!(ttl_after_completed(&claim), Duration::from_secs(300));
    }
}
