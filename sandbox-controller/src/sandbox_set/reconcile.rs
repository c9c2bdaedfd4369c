use futures::stream::{self, StreamExt};
use kube::{
    Api, Client, ResourceExt,
    api::Resource,
    runtime::{Controller, controller::Action, events::{Recorder, Reporter}},
};
use kube_leader_election::{LeaseLock, LeaseLockParams, LeaseLockResult};
use owo_colors::OwoColorize;
use sandbox_types::{Sandbox, SandboxSet};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

use super::{actions, planner};
use crate::cache::Cache;
use crate::util::{
    self, Error,
    colors::{FG1, FG2},
    events::{EventReason, publish},
    resource_version::ResourceVersionTable,
};

#[cfg(feature = "metrics")]
use crate::util::metrics::ControllerMetrics;

/// Entrypoint for the `SandboxSet` (pool) controller.
pub async fn run(client: Client, cache: Cache) -> Result<(), Error> {
    println!("{}", "⚙️ Starting SandboxSet controller...".green());

    let context: Arc<ContextData> = Arc::new(ContextData::new(client.clone(), cache));

    let lease_namespace = std::env::var("NAMESPACE").unwrap_or_else(|_| "default".to_string());
    let holder_id = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("sandboxset-controller-{}", uuid::Uuid::new_v4()));
    let leadership = LeaseLock::new(
        client.clone(),
        &lease_namespace,
        LeaseLockParams {
            holder_id,
            lease_name: "sandboxset-controller-lock".to_string(),
            lease_ttl: Duration::from_secs(15),
        },
    );

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        sandbox_common::shutdown::shutdown_signal().await;
        shutdown_signal.cancel();
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
                println!("{}", "👑 Acquired leadership; starting SandboxSet controller".green());
                let client_for_controller = client.clone();
                let context_for_controller = context.clone();
                let controller_namespace = lease_namespace.clone();
                let crd_api_for_controller: Api<SandboxSet> =
                    Api::namespaced(client_for_controller.clone(), &controller_namespace);
                controller_task = Some(tokio::spawn(async move {
                    Controller::new(crd_api_for_controller, Default::default())
                        .owns(
                            Api::<Sandbox>::namespaced(client_for_controller, &controller_namespace),
                            Default::default(),
                        )
                        .run(reconcile, on_error, context_for_controller)
                        .for_each(|_res| async move {})
                        .await;
                }));
            }
        } else if let Some(task) = controller_task.take() {
            eprintln!("lost leadership; stopping SandboxSet controller");
            task.abort();
        }
    }
}

struct ContextData {
    client: Client,
    cache: Cache,
    rv_table: ResourceVersionTable,
    error_backoff: util::wait::ErrorBackoff,
    reporter: Reporter,
    #[cfg(feature = "metrics")]
    metrics: ControllerMetrics,
}

impl ContextData {
    fn new(client: Client, cache: Cache) -> Self {
        let rv_table = ResourceVersionTable::new(Duration::from_secs(10));
        let error_backoff = util::wait::ErrorBackoff::new();
        let reporter = Reporter::from("sandboxset-controller");
        #[cfg(feature = "metrics")]
        {
            let metrics = ControllerMetrics::new("sandboxset");
            metrics.register(prometheus::default_registry());
            ContextData {
                client,
                cache,
                rv_table,
                error_backoff,
                reporter,
                metrics,
            }
        }
        #[cfg(not(feature = "metrics"))]
        {
            ContextData { client, cache, rv_table, error_backoff, reporter }
        }
    }
}

async fn reconcile(set: Arc<SandboxSet>, context: Arc<ContextData>) -> Result<Action, Error> {
    let client = context.client.clone();
    let name = set.name_any();
    let namespace = set.namespace().unwrap_or_default();

    #[cfg(feature = "metrics")]
    context.metrics.reconcile_counter.with_label_values(&[&name, ""]).inc();

    if set.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }

    // Defensive re-check of the admission-webhook's validation contract:
    // don't trust that every stored object actually passed through it.
    if let Err(reason) = sandbox_types::validate_sandbox_set_spec(&set.spec) {
        eprintln!("{}", format!("SandboxSet {namespace}/{name} has an invalid spec, skipping: {reason}").red());
        return Ok(Action::await_change());
    }

    // If our own last status write hasn't reached the cache yet, hold
    // off rather than recompute a diff against stale children.
    if context
        .rv_table
        .should_wait(&namespace, &name, set.resource_version().unwrap_or_default().as_str())
    {
        return Ok(Action::requeue(Duration::from_millis(200)));
    }

    let update_revision = actions::update_revision(&set.spec);
    let children = context.cache.list_sandbox_in_pool(&name).await;
    let partition = planner::partition_children(
        &children.iter().map(|s| (**s).clone()).collect::<Vec<_>>(),
        &update_revision,
    );

    let replicas = set.spec.replicas;
    let budget = set.spec.scale_strategy.max_unavailable.resolve(replicas);

    // Scale down: stale revisions and surplus unclaimed sandboxes are
    // removed unbudgeted.
    let surplus = (partition.current_revision.len() as i32 - replicas).max(0) as usize;
    let mut delete_names = partition.stale.clone();
    if surplus > 0 {
        let surplus_candidates: Vec<Sandbox> = children
            .iter()
            .filter(|s| partition.current_revision.contains(&s.name_any()))
            .map(|s| (**s).clone())
            .collect();
        delete_names.extend(planner::select_scale_down_candidates(&surplus_candidates, surplus));
    }
    if !delete_names.is_empty() {
        println!(
            "🔧 {}{}{}",
            name.color(FG2),
            " scaling down: ".color(FG1),
            delete_names.join(", ").color(FG2),
        );
    }
    for victim in &delete_names {
        actions::delete_sandbox(client.clone(), &set, victim).await?;
    }

    // Scale up, budgeted and slow-started.
    let diff = planner::compute_diff(replicas, partition.current_revision.len());
    if diff > 0 {
        let to_create = diff.min(budget).max(0) as usize;
        for window in planner::slow_start_windows(to_create) {
            let names: Vec<String> = (0..window)
                .map(|_| format!("{name}-{}", short_id()))
                .collect();
            let results: Vec<Result<(), Error>> = stream::iter(names.clone())
                .map(|n| {
                    let client = client.clone();
                    let set = set.clone();
                    let update_revision = update_revision.clone();
                    async move { actions::create_sandbox(client, &set, &n, &update_revision).await }
                })
                .buffer_unordered(window)
                .collect()
                .await;
            // Abort the remainder of the batch on the first failure
            // within a window.
            if let Some(Err(e)) = results.into_iter().find(|r| r.is_err()) {
                return Err(e);
            }
        }
    }

    let available = children
        .iter()
        .filter(|s| !crate::cache::is_claimed(s))
        .filter(|s| crate::cache::is_ready(s))
        .count() as i32;

    let new_rv = actions::update_status(client, &set, children.len() as i32, available, update_revision).await?;
    context.rv_table.record(&namespace, &name, new_rv);
    context.error_backoff.clear(&namespace, &name);

    let requeue = if diff != 0 || !delete_names.is_empty() {
        Action::requeue(Duration::from_secs(1))
    } else {
        Action::requeue(util::probe_interval())
    };
    Ok(requeue)
}

fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

fn on_error(set: Arc<SandboxSet>, error: &Error, context: Arc<ContextData>) -> Action {
    eprintln!(
        "{}",
        format!("SandboxSet reconcile error for {}: {error:?}", set.name_any())
            .red()
    );
    if let Error::Fatal(msg) = error {
        let recorder = Recorder::new(context.client.clone(), context.reporter.clone(), set.object_ref(&()));
        let note = msg.clone();
        tokio::spawn(async move {
            publish(&recorder, EventReason::UnknownPhase, note, "Reconcile").await.ok();
        });
        return Action::await_change();
    }
    let namespace = set.namespace().unwrap_or_default();
    let name = set.name_any();
    Action::requeue(context.error_backoff.note_error(&namespace, &name))
}
