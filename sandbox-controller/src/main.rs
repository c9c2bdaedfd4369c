mod cache;
mod sandbox;
mod sandbox_claim;
mod sandbox_set;
mod util;

#[cfg(feature = "metrics")]
mod metrics_server;

use clap::Parser;
use kube::Client;
use owo_colors::OwoColorize;
use std::time::Duration;

/// CLI configuration, following the flattened `clap`-derive shape used
/// throughout the sibling binaries in this workspace.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Namespace the leader-election `Lease` objects and watched CRDs
    /// live in. Defaults to the pod's own namespace via the downward API.
    #[arg(long, env = "NAMESPACE", default_value = "default")]
    namespace: String,

    /// Port the Prometheus `/metrics` endpoint listens on.
    #[arg(long, env = "METRICS_PORT", default_value_t = 8080)]
    metrics_port: u16,

    /// Upper bound on concurrent Pick Engine attempts per `SandboxClaim`
    /// reconcile.
    #[arg(long, env = "SANDBOXCLAIM_MAX_BATCH_SIZE", default_value_t = 20)]
    sandboxclaim_max_batch_size: usize,

    /// Requeue delay for a `SandboxClaim` still in `Claiming`.
    #[arg(long, env = "CLAIM_RETRY_INTERVAL", default_value = "2s")]
    claim_retry_interval: String,

    /// Requeue delay for a settled `Sandbox`/`SandboxSet`.
    #[arg(long, env = "PROBE_INTERVAL", default_value = "30s")]
    probe_interval: String,
}

#[tokio::main]
async fn main() -> Result<(), util::Error> {
    println!("{}", "🌱 sandbox-controller starting".green());

    let args = Args::parse();
    tracing_subscriber::fmt::init();

    // SAFETY net for operator error: an unparsable duration flag is a
    // startup-time config mistake, not a runtime condition to recover
    // from, so fail fast rather than silently falling back.
    let claim_retry_interval: Duration = parse_duration::parse(&args.claim_retry_interval)
        .map_err(|e| util::Error::UserInput(format!("invalid --claim-retry-interval: {e}")))?;
    let probe_interval: Duration = parse_duration::parse(&args.probe_interval)
        .map_err(|e| util::Error::UserInput(format!("invalid --probe-interval: {e}")))?;
    util::set_probe_interval(probe_interval);

    unsafe { std::env::set_var("NAMESPACE", &args.namespace) };

    let client = Client::try_default()
        .await
        .map_err(|e| util::Error::InitFailed(format!("failed to build kube client: {e}")))?;

    let (cache, indexer) = cache::Cache::new(client.clone());
    tokio::spawn(indexer);
    cache.wait_until_ready().await?;
    println!("{}", "✅ sandbox cache synced".green());

    #[cfg(feature = "metrics")]
    tokio::spawn(metrics_server::run(args.metrics_port, prometheus::default_registry()));

    sandbox_common::signal_ready();

    let sandbox_task = tokio::spawn(sandbox::run(client.clone()));
    let sandbox_set_task = tokio::spawn(sandbox_set::run(client.clone(), cache.clone()));
    let sandbox_claim_task = tokio::spawn(sandbox_claim::run(
        client,
        cache,
        args.sandboxclaim_max_batch_size,
        claim_retry_interval,
    ));

    let (sandbox_res, set_res, claim_res) = tokio::join!(sandbox_task, sandbox_set_task, sandbox_claim_task);
    sandbox_res.map_err(|e| util::Error::Fatal(format!("sandbox controller task panicked: {e}")))??;
    set_res.map_err(|e| util::Error::Fatal(format!("sandboxset controller task panicked: {e}")))??;
    claim_res.map_err(|e| util::Error::Fatal(format!("sandboxclaim controller task panicked: {e}")))??;

    Ok(())
}
