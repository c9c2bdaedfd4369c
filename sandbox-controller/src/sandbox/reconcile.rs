use futures::stream::StreamExt;
use k8s_openapi::{api::core::v1::Pod, jiff::Timestamp};
use kube::{
    Api, ResourceExt,
    api::Resource,
    client::Client,
    runtime::{
        Controller,
        controller::Action,
        events::{Recorder, Reporter},
        finalizer::{Event as FinalizerEvent, finalizer},
    },
};
use kube_leader_election::{LeaseLock, LeaseLockParams, LeaseLockResult};
use owo_colors::OwoColorize;
use k8s_openapi::api::core::v1::ContainerStatus;
use sandbox_common::annotations;
use sandbox_types::{Sandbox, SandboxPhase, inplace_update_reasons, sandbox_condition_types as condition_types};
use std::{collections::HashMap, sync::Arc, time::Instant};
use tokio::{sync::Mutex, time::Duration};
use tokio_util::sync::CancellationToken;

use super::actions;
use crate::util::{
    self, Error,
    colors::{FG1, FG2},
    events::{EventReason, publish},
};

#[cfg(feature = "metrics")]
use crate::util::metrics::ControllerMetrics;

/// Entrypoint for the `Sandbox` controller. One leader-elected loop per
/// resource, via its own `LeaseLock`, used identically by the set and
/// claim controllers so that any of the three loops can be led by a
/// different replica.
pub async fn run(client: Client) -> Result<(), Error> {
    println!("{}", "⚙️ Starting Sandbox controller...".green());

    let context: Arc<ContextData> = Arc::new(ContextData::new(client.clone()));

    let lease_namespace = std::env::var("NAMESPACE").unwrap_or_else(|_| "default".to_string());
    let holder_id = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("sandbox-controller-{}", uuid::Uuid::new_v4()));
    let lease_name = "sandbox-controller-lock".to_string();
    let lease_ttl = Duration::from_secs(15);
    let renew_every = Duration::from_secs(5);
    let leadership = LeaseLock::new(
        client.clone(),
        &lease_namespace,
        LeaseLockParams {
            holder_id,
            lease_name,
            lease_ttl,
        },
    );

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        sandbox_common::shutdown::shutdown_signal().await;
        shutdown_signal.cancel();
    });
    sandbox_common::signal_ready();
    println!("{}", "🌱 Starting Sandbox controller...".green());

    let mut controller_task: Option<tokio::task::JoinHandle<()>> = None;
    let mut tick = tokio::time::interval(renew_every);
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
                    eprintln!("aborted controller due to leader election error");
                }
                continue;
            }
        };
        if matches!(lease, LeaseLockResult::Acquired(_)) {
            if controller_task.is_none() {
                println!("{}", "👑 Acquired leadership; starting controller".green());
                let client_for_controller = client.clone();
                let context_for_controller = context.clone();
                let controller_namespace = lease_namespace.clone();
                let crd_api_for_controller: Api<Sandbox> =
                    Api::namespaced(client_for_controller.clone(), &controller_namespace);
                controller_task = Some(tokio::spawn(async move {
                    println!("{}", "🚀 Sandbox controller started.".green());
                    Controller::new(crd_api_for_controller, Default::default())
                        .owns(
                            Api::<Pod>::namespaced(client_for_controller, &controller_namespace),
                            Default::default(),
                        )
                        .run(reconcile, on_error, context_for_controller)
                        .for_each(|_res| async move {})
                        .await;
                }));
            }
        } else if let Some(task) = controller_task.take() {
            eprintln!("lost leadership; stopping controller");
            task.abort();
        }
    }
}

struct ContextData {
    client: Client,
    #[cfg(feature = "metrics")]
    metrics: ControllerMetrics,
    last_action: Mutex<HashMap<(String, String), (SandboxAction, Instant)>>,
    error_backoff: util::wait::ErrorBackoff,
    reporter: Reporter,
}

impl ContextData {
    pub fn new(client: Client) -> Self {
        let reporter = Reporter::from("sandbox-controller");
        #[cfg(feature = "metrics")]
        {
            let metrics = ControllerMetrics::new("sandbox");
            metrics.register(prometheus::default_registry());
            ContextData {
                client,
                metrics,
                last_action: Mutex::new(HashMap::new()),
                error_backoff: util::wait::ErrorBackoff::new(),
                reporter,
            }
        }
        #[cfg(not(feature = "metrics"))]
        {
            ContextData {
                client,
                last_action: Mutex::new(HashMap::new()),
                error_backoff: util::wait::ErrorBackoff::new(),
                reporter,
            }
        }
    }
}

/// Action to be taken upon a `Sandbox` during one reconcile pass.
#[derive(Debug, PartialEq, Clone)]
enum SandboxAction {
    CreatePod,
    MarkStarting { reason: String },
    MarkRunning,
    Pause { delete: bool },
    Resume { recreate: bool },
    MarkResumed,
    Fail { reason: String },
    BeginTerminate { reason: String },
    InplaceUpdate,
    ResolveInplaceUpdate { succeeded: bool },
    NoOp,
    Requeue(Duration),
}

impl SandboxAction {
    fn to_str(&self) -> &str {
        match self {
            SandboxAction::CreatePod => "CreatePod",
            SandboxAction::MarkStarting { .. } => "MarkStarting",
            SandboxAction::MarkRunning => "MarkRunning",
            SandboxAction::Pause { .. } => "Pause",
            SandboxAction::Resume { .. } => "Resume",
            SandboxAction::MarkResumed => "MarkResumed",
            SandboxAction::Fail { .. } => "Fail",
            SandboxAction::BeginTerminate { .. } => "BeginTerminate",
            SandboxAction::InplaceUpdate => "InplaceUpdate",
            SandboxAction::ResolveInplaceUpdate { .. } => "ResolveInplaceUpdate",
            SandboxAction::NoOp => "NoOp",
            SandboxAction::Requeue(_) => "Requeue",
        }
    }
}

async fn reconcile(instance: Arc<Sandbox>, context: Arc<ContextData>) -> Result<Action, Error> {
    let client = context.client.clone();
    let namespace = instance
        .namespace()
        .ok_or_else(|| Error::UserInput("Expected Sandbox to be namespaced".to_string()))?;
    let name = instance.name_any();

    #[cfg(feature = "metrics")]
    context
        .metrics
        .reconcile_counter
        .with_label_values(&[&name, &namespace])
        .inc();

    let api: Api<Sandbox> = Api::namespaced(client.clone(), &namespace);
    let finalized = finalizer(&api, annotations::FINALIZER, instance.clone(), |event| async {
        match event {
            FinalizerEvent::Apply(instance) => apply(client.clone(), context.clone(), instance).await,
            FinalizerEvent::Cleanup(instance) => cleanup(client.clone(), instance).await,
        }
    })
    .await;

    // Unwrap the library's finalizer-specific wrapper so a `PodNotGone`
    // raised from `cleanup` still reaches `on_error` as itself, not
    // flattened into `Fatal` — it keeps the faster requeue the former
    // gets and is never treated as non-retryable.
    match finalized {
        Ok(action) => {
            context.error_backoff.clear(&namespace, &name);
            Ok(action)
        }
        Err(kube::runtime::finalizer::Error::ApplyFailed(e))
        | Err(kube::runtime::finalizer::Error::CleanupFailed(e)) => Err(e),
        Err(e) => Err(Error::Fatal(format!("finalizer error: {e}"))),
    }
}

async fn apply(client: Client, context: Arc<ContextData>, instance: Arc<Sandbox>) -> Result<Action, Error> {
    let namespace = instance.namespace().unwrap_or_default();
    let name = instance.name_any();

    #[cfg(feature = "metrics")]
    let start = std::time::Instant::now();

    let action = determine_action(client.clone(), &instance).await?;

    if action != SandboxAction::NoOp {
        let value = {
            let mut la = context.last_action.lock().await;
            la.insert((namespace.clone(), name.clone()), (action.clone(), Instant::now()))
        };
        if let Some((last_action, last_instant)) = value
            && (Some(&action) != Some(&last_action) || last_instant.elapsed() > Duration::from_secs(300))
        {
            println!(
                "🔧 {}{}{}{}{}",
                namespace.color(FG2),
                "/".color(FG1),
                name.color(FG2),
                " ACTION: ".color(FG1),
                format!("{:?}", action).color(FG2),
            );
        }
    }

    #[cfg(feature = "metrics")]
    context
        .metrics
        .read_histogram
        .with_label_values(&[&name, &namespace, action.to_str()])
        .observe(start.elapsed().as_secs_f64());

    #[cfg(feature = "metrics")]
    context
        .metrics
        .action_counter
        .with_label_values(&[&name, &namespace, action.to_str()])
        .inc();

    #[cfg(feature = "metrics")]
    let timer = match action {
        SandboxAction::NoOp => None,
        _ => Some(
            context
                .metrics
                .write_histogram
                .with_label_values(&[&name, &namespace, action.to_str()])
                .start_timer(),
        ),
    };

    let result = match action {
        SandboxAction::Requeue(d) => Action::requeue(d),
        SandboxAction::CreatePod => {
            actions::create_pod(client, &instance).await?;
            Action::await_change()
        }
        SandboxAction::MarkStarting { reason } => {
            actions::mark_starting(client, &instance, reason).await?;
            Action::requeue(Duration::from_secs(3))
        }
        SandboxAction::MarkRunning => {
            let pod = get_pod(client.clone(), &namespace, &name).await?.ok_or_else(|| {
                Error::Fatal("pod disappeared between read and write phase".to_string())
            })?;
            actions::mark_running(client, &instance, &pod).await?;
            Action::requeue(util::probe_interval())
        }
        SandboxAction::Pause { delete } => {
            actions::pause(client, &instance, delete).await?;
            Action::await_change()
        }
        SandboxAction::Resume { recreate } => {
            actions::resume(client, &instance, recreate).await?;
            Action::requeue(Duration::from_secs(2))
        }
        SandboxAction::MarkResumed => {
            actions::mark_resumed(client, &instance).await?;
            Action::requeue(util::probe_interval())
        }
        SandboxAction::Fail { reason } => {
            actions::fail(client, &instance, reason).await?;
            Action::await_change()
        }
        SandboxAction::BeginTerminate { reason } => {
            actions::begin_terminate(client, &instance, reason).await?;
            Action::await_change()
        }
        SandboxAction::InplaceUpdate => {
            let pod = get_pod(client.clone(), &namespace, &name).await?.ok_or_else(|| {
                Error::Fatal("pod disappeared between read and write phase".to_string())
            })?;
            actions::inplace_update(client, &instance, &pod).await?;
            Action::requeue(Duration::from_secs(5))
        }
        SandboxAction::ResolveInplaceUpdate { succeeded } => {
            actions::resolve_inplace_update(client, &instance, succeeded).await?;
            Action::requeue(util::probe_interval())
        }
        SandboxAction::NoOp => Action::requeue(util::probe_interval()),
    };

    #[cfg(feature = "metrics")]
    if let Some(timer) = timer {
        timer.observe_duration();
    }

    Ok(result)
}

/// Backing pod confirmed gone (or teardown delegated) before the
/// finalizer is allowed to come off.
async fn cleanup(client: Client, instance: Arc<Sandbox>) -> Result<Action, Error> {
    let namespace = instance.namespace().unwrap_or_default();
    let name = instance.name_any();

    if instance
        .annotations()
        .get(annotations::ENABLE_VK_DELETE_INSTANCE)
        .is_some_and(|v| v == "true")
    {
        // Pod teardown delegated to an external controller; we don't
        // wait for it, we just let our finalizer come off.
        return Ok(Action::await_change());
    }

    actions::delete_pod(client.clone(), &instance).await?;
    if get_pod(client, &namespace, &name).await?.is_some() {
        return Err(Error::PodNotGone);
    }
    Ok(Action::await_change())
}

/// Reads the current state of a `Sandbox` and decides the single next
/// action. Shutdown wins over pause when both apply in the same
/// reconcile.
async fn determine_action(client: Client, instance: &Sandbox) -> Result<SandboxAction, Error> {
    let namespace = instance
        .namespace()
        .ok_or_else(|| Error::UserInput("Expected Sandbox to be namespaced".to_string()))?;
    let name = instance.name_any();

    if shutdown_due(instance) {
        return Ok(SandboxAction::BeginTerminate {
            reason: "spec.shutdownTime has passed".to_string(),
        });
    }

    let phase = instance.status.as_ref().map(|s| s.phase).unwrap_or_default();
    let pod = get_pod(client, &namespace, &name).await?;

    // Pause/resume state machine takes priority over drift detection:
    // a sandbox mid-pause-transition shouldn't also race an in-place
    // update.
    match (instance.spec.paused, phase) {
        (true, SandboxPhase::Running) => {
            let delete = !actions::supports_inplace_pause(&instance.spec.persistent_contents);
            return Ok(SandboxAction::Pause { delete });
        }
        (false, SandboxPhase::Paused) => {
            return Ok(SandboxAction::Resume { recreate: pod.is_none() });
        }
        (false, SandboxPhase::Resuming) => {
            return Ok(match &pod {
                Some(p) if pod_ready(p) => SandboxAction::MarkResumed,
                Some(_) => SandboxAction::NoOp,
                None => SandboxAction::CreatePod,
            });
        }
        (true, SandboxPhase::Paused) => {
            // Steady state: already paused and still asked to stay paused.
            return Ok(SandboxAction::NoOp);
        }
        _ => {}
    }

    let Some(pod) = pod else {
        return Ok(SandboxAction::CreatePod);
    };

    if pod.metadata.deletion_timestamp.is_some() {
        return Ok(SandboxAction::MarkStarting {
            reason: format!("Pod '{}' is being deleted", pod.name_any()),
        });
    }

    if matches!(pod.status.as_ref().and_then(|s| s.phase.as_deref()), Some("Failed")) {
        return Ok(SandboxAction::Fail {
            reason: format!("Pod '{}' entered Failed phase", pod.name_any()),
        });
    }

    // Drift detection: only meaningful once the sandbox has a live,
    // running pod to patch in place.
    if matches!(phase, SandboxPhase::Running | SandboxPhase::Paused) {
        let desired_hash = util::hash_spec(&instance.spec.pod);
        let condition_updating = instance
            .status
            .as_ref()
            .and_then(|s| s.conditions.iter().find(|c| c.type_ == condition_types::INPLACE_UPDATE))
            .is_some_and(|c| c.status == "True" && c.reason == inplace_update_reasons::UPDATING);

        if condition_updating {
            // A patch is already in flight: resolve it before considering
            // a fresh one, the same way the pod is never re-patched while
            // the previous in-place update hasn't converged.
            if pod_hash_matches(&pod, &desired_hash) && pod_ready(&pod) {
                return Ok(SandboxAction::ResolveInplaceUpdate { succeeded: true });
            }
            if let Some(reason) = fatal_container_reason(&pod) {
                return Ok(SandboxAction::Fail {
                    reason: format!("in-place update did not converge: {reason}"),
                });
            }
        } else if instance.status.as_ref().map(|s| s.template_hash.as_str()) != Some(desired_hash.as_str())
            && !pod_hash_matches(&pod, &desired_hash)
        {
            return Ok(SandboxAction::InplaceUpdate);
        }
    }

    if pod_ready(&pod) {
        if phase != SandboxPhase::Running {
            return Ok(SandboxAction::MarkRunning);
        }
        return Ok(SandboxAction::NoOp);
    }

    Ok(SandboxAction::MarkStarting {
        reason: format!("Pod '{}' is not Ready", pod.name_any()),
    })
}

fn shutdown_due(instance: &Sandbox) -> bool {
    instance
        .spec
        .shutdown_time
        .as_ref()
        .is_some_and(|t| Timestamp::now() >= t.0)
}

fn pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .into_iter()
        .flatten()
        .any(|c| c.type_ == "Ready" && c.status == "True")
}

fn pod_hash_matches(pod: &Pod, desired_hash: &str) -> bool {
    pod.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(annotations::SPEC_HASH))
        .map(String::as_str)
        == Some(desired_hash)
}

/// Container waiting reasons that never resolve on their own -- the
/// in-place update that produced them is considered failed rather than
/// still converging.
const FATAL_WAITING: &[&str] = &[
    "ImagePullBackOff",
    "ErrImageNeverPull",
    "RegistryUnavailable",
    "CreateSandboxError",
    "ErrImagePull",
    "InvalidImageName",
    "CreateContainerConfigError",
    "CreateContainerError",
    "RunContainerError",
    "CrashLoopBackOff",
];

fn fatal_container_reason(pod: &Pod) -> Option<String> {
    let statuses: &[ContainerStatus] = pod.status.as_ref()?.container_statuses.as_ref()?;
    statuses.iter().find_map(|cs| {
        let reason = cs.state.as_ref()?.waiting.as_ref()?.reason.as_deref()?;
        if FATAL_WAITING.contains(&reason) {
            Some(format!("container '{}' is in {reason}", cs.name))
        } else {
            None
        }
    })
}

async fn get_pod(client: Client, namespace: &str, name: &str) -> Result<Option<Pod>, Error> {
    let api: Api<Pod> = Api::namespaced(client, namespace);
    match api.get(name).await {
        Ok(pod) => Ok(Some(pod)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn on_error(instance: Arc<Sandbox>, error: &Error, context: Arc<ContextData>) -> Action {
    eprintln!(
        "{}",
        format!("Sandbox reconcile error for {}: {error:?}", instance.name_any()).red()
    );
    let namespace = instance.namespace().unwrap_or_default();
    let name = instance.name_any();
    match error {
        Error::PodNotGone => Action::requeue(Duration::from_secs(3)),
        // A programming invariant was violated; retrying cannot fix it,
        // so we log (above), raise a Warning event, and stop requeuing
        // rather than spin forever against the same bug.
        Error::Fatal(msg) => {
            let recorder = Recorder::new(context.client.clone(), context.reporter.clone(), instance.object_ref(&()));
            let note = msg.clone();
            tokio::spawn(async move {
                publish(&recorder, EventReason::UnknownPhase, note, "Reconcile").await.ok();
            });
            Action::await_change()
        }
        _ => Action::requeue(context.error_backoff.note_error(&namespace, &name)),
    }
}
