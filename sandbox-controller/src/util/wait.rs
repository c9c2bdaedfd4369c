use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Exponential backoff with "full jitter": sleep for a random duration in
/// `[0, min(cap, base * 2^attempt)]`. Tends to behave well under
/// contention and avoids lockstep retries across claim workers hitting
/// the same empty pool.
pub fn backoff_full_jitter(base: Duration, cap: Duration, attempt: usize) -> Duration {
    let base_ms = base.as_millis() as u64;
    let cap_ms = cap.as_millis() as u64;

    let pow = if attempt >= 63 {
        u64::MAX
    } else {
        1u64 << attempt
    };

    let exp_ms = base_ms.saturating_mul(pow);
    let upper = exp_ms.min(cap_ms).max(1);

    let jitter_ms = rand::random_range(0..=upper);
    Duration::from_millis(jitter_ms)
}

/// Per-key attempt counter backing the work queue's exponential backoff
/// for transient reconcile errors. One instance lives in each
/// reconciler's `ContextData`; `note_error` is called from `on_error`,
/// `clear` from the top of a successful reconcile.
#[derive(Default)]
pub struct ErrorBackoff {
    attempts: Mutex<HashMap<(String, String), usize>>,
}

impl ErrorBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records another failure for `key` and returns how long to wait
    /// before retrying.
    pub fn note_error(&self, namespace: &str, name: &str) -> Duration {
        let key = (namespace.to_string(), name.to_string());
        let mut attempts = self.attempts.lock().unwrap();
        let count = attempts.entry(key).or_insert(0);
        let attempt = *count;
        *count = count.saturating_add(1);
        backoff_full_jitter(Duration::from_millis(500), Duration::from_secs(30), attempt)
    }

    /// Resets the failure count for `key`, e.g. after a reconcile
    /// succeeds.
    pub fn clear(&self, namespace: &str, name: &str) {
        self.attempts
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_never_exceeds_cap() {
        let cap = Duration::from_secs(10);
        for attempt in 0..20 {
            let d = backoff_full_jitter(Duration::from_millis(250), cap, attempt);
            assert!(d <= cap);
        }
    }

    #[test]
    fn error_backoff_grows_then_resets_on_clear() {
        let backoff = ErrorBackoff::new();
        // First failure is attempt 0: jittered in [0, base].
        let first = backoff.note_error("ns", "a");
        assert!(first <= Duration::from_millis(500));
        for _ in 0..10 {
            backoff.note_error("ns", "a");
        }
        // By now the attempt count has grown well past what it takes to
        // saturate at the cap.
        let later = backoff.note_error("ns", "a");
        assert!(later <= Duration::from_secs(30));

        backoff.clear("ns", "a");
        // After clearing, the next failure starts from attempt 0 again,
        // i.e. its upper bound collapses back down to `base`.
        let reset = backoff.note_error("ns", "a");
        assert!(reset <= Duration::from_millis(500));
    }
}
