use std::{collections::HashMap, sync::Arc, time::Instant};
use tokio::sync::Mutex;
use tokio::time::Duration;

/// Process-local, short-lived lock preventing two Pick Engine workers in
/// the same process from racing on the same candidate sandbox before the
/// store-side compare-and-set resolves. Not a replacement for the CAS —
/// a best-effort hint that narrows the race window, same role as the
/// `not_dispatched` check in the NATS-wait registry this is grounded on,
/// but backed by a plain expiring map instead of a Redis `SET NX EX`.
#[derive(Clone)]
pub struct PickCache {
    inner: Arc<Mutex<HashMap<String, Instant>>>,
    ttl: Duration,
}

impl PickCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    /// Attempts to take the hold for `name`. Returns `true` if the hold
    /// was free (and is now held by the caller), `false` if another
    /// worker is already holding it.
    pub async fn try_hold(&self, name: &str) -> bool {
        let now = Instant::now();
        let mut map = self.inner.lock().await;
        if let Some(expires_at) = map.get(name)
            && *expires_at > now
        {
            return false;
        }
        map.insert(name.to_string(), now + self.ttl);
        true
    }

    /// Releases a hold early, on success, failure, or attempt timeout —
    /// whichever resolves the candidate's fate before the TTL would have.
    pub async fn release(&self, name: &str) {
        self.inner.lock().await.remove(name);
    }

    /// Drops every entry whose hold has expired. Cheap enough to call
    /// opportunistically at the top of a pick cycle rather than run on a
    /// background ticker.
    pub async fn sweep(&self) {
        let now = Instant::now();
        self.inner.lock().await.retain(|_, expires_at| *expires_at > now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_holder_is_rejected_until_release() {
        let cache = PickCache::new(Duration::from_secs(5));
        assert!(cache.try_hold("sbx-1").await);
        assert!(!cache.try_hold("sbx-1").await);
        cache.release("sbx-1").await;
        assert!(cache.try_hold("sbx-1").await);
    }

    #[tokio::test]
    async fn hold_expires_after_ttl() {
        let cache = PickCache::new(Duration::from_millis(10));
        assert!(cache.try_hold("sbx-1").await);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cache.try_hold("sbx-1").await);
    }

    #[tokio::test]
    async fn sweep_removes_only_expired_entries() {
        let cache = PickCache::new(Duration::from_millis(10));
        cache.try_hold("expired").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        cache.try_hold("fresh").await;
        cache.sweep().await;
        assert!(cache.try_hold("expired").await);
        assert!(!cache.try_hold("fresh").await);
    }
}
