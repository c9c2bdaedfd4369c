use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::{Duration, Instant},
};

/// A write we made but have not yet observed reflected back through the
/// cache. Recorded so a reconcile triggered by our own write (or a stale
/// watch replay) doesn't undo it by acting on data older than what we
/// wrote.
#[derive(Clone, Debug)]
struct Expectation {
    resource_version: String,
    written_at: Instant,
}

/// Process-global table of outstanding resource-version expectations,
/// one per (namespace, name) key. Same concurrent-map-with-expiry shape
/// as [`crate::util::pick_cache::PickCache`], applied to a different
/// problem: suppressing reconciles on stale cache reads rather than
/// de-duplicating concurrent picks.
#[derive(Clone)]
pub struct ResourceVersionTable {
    inner: Arc<RwLock<HashMap<(String, String), Expectation>>>,
    timeout: Duration,
}

impl ResourceVersionTable {
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            timeout,
        }
    }

    /// Records that we wrote `resource_version` for `(namespace, name)`.
    pub fn record(&self, namespace: &str, name: &str, resource_version: String) {
        self.inner.write().unwrap().insert(
            (namespace.to_string(), name.to_string()),
            Expectation {
                resource_version,
                written_at: Instant::now(),
            },
        );
    }

    /// Returns `true` if the caller should hold off reconciling because
    /// `observed_resource_version` is older than what we expect to see,
    /// and the expectation has not yet timed out. Clears the expectation
    /// once `observed_resource_version` catches up or the timeout elapses.
    pub fn should_wait(&self, namespace: &str, name: &str, observed_resource_version: &str) -> bool {
        let key = (namespace.to_string(), name.to_string());
        let mut map = self.inner.write().unwrap();
        let Some(expectation) = map.get(&key) else {
            return false;
        };
        if expectation.written_at.elapsed() > self.timeout {
            map.remove(&key);
            return false;
        }
        if resource_version_at_least(observed_resource_version, &expectation.resource_version) {
            map.remove(&key);
            return false;
        }
        true
    }
}

/// Kubernetes resource versions are opaque strings but, for the etcd
/// backend every real cluster and every example in this pack runs on,
/// they are monotonically increasing decimal integers. Compare
/// numerically when possible and fall back to a string compare (which at
/// worst produces a false "should wait", never a lost write) otherwise.
fn resource_version_at_least(observed: &str, expected: &str) -> bool {
    match (observed.parse::<u64>(), expected.parse::<u64>()) {
        (Ok(o), Ok(e)) => o >= e,
        _ => observed >= expected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn waits_until_observed_version_catches_up() {
        let table = ResourceVersionTable::new(Duration::from_secs(30));
        table.record("ns", "sbx-1", "105".to_string());
        assert!(table.should_wait("ns", "sbx-1", "104"));
        assert!(!table.should_wait("ns", "sbx-1", "105"));
    }

    #[test]
    fn expectation_clears_after_timeout_even_if_stale() {
        let table = ResourceVersionTable::new(Duration::from_millis(1));
        table.record("ns", "sbx-1", "105".to_string());
        std::thread::sleep(Duration::from_millis(5));
        assert!(!table.should_wait("ns", "sbx-1", "50"));
    }

    #[test]
    fn unrecorded_key_never_waits() {
        let table = ResourceVersionTable::new(Duration::from_secs(30));
        assert!(!table.should_wait("ns", "unknown", "1"));
    }
}
