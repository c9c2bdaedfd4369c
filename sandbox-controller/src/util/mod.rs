use std::sync::OnceLock;
use std::time::Duration;

pub mod events;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod patch;
pub mod pick_cache;
pub mod resource_version;
pub mod revision;
pub mod wait;

pub(crate) mod colors;

mod error;

pub use error::*;

static PROBE_INTERVAL_OVERRIDE: OnceLock<Duration> = OnceLock::new();

/// The default interval for requeuing a managed resource once it has
/// reached a settled state. `--probe-interval` overrides this once, at
/// startup, before any reconciler reads it.
pub(crate) const PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// Sets the process-wide probe interval. Must be called, at most once,
/// before the reconcilers start; later calls are ignored.
pub fn set_probe_interval(interval: Duration) {
    let _ = PROBE_INTERVAL_OVERRIDE.set(interval);
}

/// The configured probe interval, falling back to [`PROBE_INTERVAL`] if
/// `--probe-interval` was never set.
pub(crate) fn probe_interval() -> Duration {
    *PROBE_INTERVAL_OVERRIDE.get().unwrap_or(&PROBE_INTERVAL)
}

/// Name of the kubernetes resource manager used for server-side apply.
pub(crate) const MANAGER_NAME: &str = "sandbox-controller";

pub use revision::hash_spec;
