use futures::StreamExt;
use kube::runtime::{
    WatchStreamExt,
    reflector::{self, ObjectRef, Store},
    watcher::{self, Event},
};
use kube::{Api, Client, ResourceExt};
use sandbox_types::Sandbox;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};
use tokio::sync::RwLock;

use crate::util::Error;

type Index = RwLock<HashMap<String, HashSet<ObjectRef<Sandbox>>>>;

/// In-memory, concurrency-safe view of every `Sandbox` in the cluster,
/// built on `kube::runtime::reflector` — the idiomatic kube-rs caching
/// primitive, not a hand-rolled polling loop. Backs the two domain
/// queries every reconciler needs: which sandboxes belong to a pool, and
/// which sandboxes a given claim owns.
///
/// Readers never hold a lock across an `.await`: every public method
/// takes a read lock, clones what it needs, and releases it before
/// returning.
#[derive(Clone)]
pub struct Cache {
    store: Store<Sandbox>,
    by_label: Arc<Index>,
    by_owner_annotation: Arc<Index>,
}

impl Cache {
    pub fn new(client: Client) -> (Self, impl std::future::Future<Output = ()>) {
        let api: Api<Sandbox> = Api::all(client);
        let (store, writer) = reflector::store();
        let by_label: Arc<Index> = Arc::new(RwLock::new(HashMap::new()));
        let by_owner_annotation: Arc<Index> = Arc::new(RwLock::new(HashMap::new()));

        let cache = Cache {
            store,
            by_label: by_label.clone(),
            by_owner_annotation: by_owner_annotation.clone(),
        };

        let indexer = {
            let by_label = by_label.clone();
            let by_owner_annotation = by_owner_annotation.clone();
            async move {
                let stream = watcher::watcher(api, watcher::Config::default())
                    .default_backoff()
                    .reflect(writer);
                tokio::pin!(stream);
                while let Some(event) = stream.next().await {
                    let Ok(event) = event else { continue };
                    match event {
                        Event::Apply(obj) | Event::InitApply(obj) => {
                            index_one(&by_label, &by_owner_annotation, &obj).await;
                        }
                        Event::Delete(obj) => {
                            deindex_one(&by_label, &by_owner_annotation, &obj).await;
                        }
                        Event::Init | Event::InitDone => {}
                    }
                }
            }
        };

        (cache, indexer)
    }

    /// Blocks until the initial LIST has completed and the store has
    /// synced, following kube-rs's own documented controller-startup
    /// pattern. Returns [`Error::InitFailed`] on timeout.
    pub async fn wait_until_ready(&self) -> Result<(), Error> {
        tokio::time::timeout(Duration::from_secs(30), self.store.wait_until_ready())
            .await
            .map_err(|_| Error::InitFailed("sandbox cache did not sync within 30s".to_string()))?
            .map_err(|e| Error::InitFailed(format!("sandbox cache failed to sync: {e}")))
    }

    /// Every sandbox whose `sandbox-template` label matches `template`,
    /// regardless of claim state.
    pub async fn list_sandbox_in_pool(&self, template: &str) -> Vec<Arc<Sandbox>> {
        self.list_by_label(sandbox_common::annotations::SANDBOX_TEMPLATE, template)
            .await
    }

    /// Sandboxes in `template`'s pool that are not claimed, whose phase is
    /// Running or Paused, and whose Ready condition is True. Paused
    /// sandboxes are always claim-eligible — they are resumed as part of
    /// the Pick Engine's warm-up step.
    pub async fn list_available_sandbox_in_pool(&self, template: &str) -> Vec<Arc<Sandbox>> {
        self.list_sandbox_in_pool(template)
            .await
            .into_iter()
            .filter(|sbx| !is_claimed(sbx))
            .filter(|sbx| matches!(sbx.status.as_ref().map(|s| s.phase), Some(sandbox_types::SandboxPhase::Running) | Some(sandbox_types::SandboxPhase::Paused)))
            .filter(|sbx| is_ready(sbx))
            .collect()
    }

    /// Every sandbox annotated `owner=<user_uid>`.
    pub async fn list_sandbox_with_user(&self, user_uid: &str) -> Vec<Arc<Sandbox>> {
        let keys = {
            let index = self.by_owner_annotation.read().await;
            index.get(user_uid).cloned().unwrap_or_default()
        };
        keys.into_iter().filter_map(|k| self.store.get(&k)).collect()
    }

    async fn list_by_label(&self, key: &str, value: &str) -> Vec<Arc<Sandbox>> {
        let composite = format!("{key}={value}");
        let keys = {
            let index = self.by_label.read().await;
            index.get(&composite).cloned().unwrap_or_default()
        };
        keys.into_iter().filter_map(|k| self.store.get(&k)).collect()
    }
}

async fn index_one(by_label: &Index, by_owner_annotation: &Index, obj: &Sandbox) {
    let obj_ref = ObjectRef::from_obj(obj);

    {
        let mut index = by_label.write().await;
        // Drop any stale entries for this object before re-adding under
        // its current labels; a reflector replay can deliver the same
        // key with changed labels.
        for set in index.values_mut() {
            set.remove(&obj_ref);
        }
        for (k, v) in obj.labels() {
            index
                .entry(format!("{k}={v}"))
                .or_default()
                .insert(obj_ref.clone());
        }
    }

    {
        let mut index = by_owner_annotation.write().await;
        for set in index.values_mut() {
            set.remove(&obj_ref);
        }
        if let Some(owner) = obj
            .annotations()
            .get(sandbox_common::annotations::OWNER)
        {
            index.entry(owner.clone()).or_default().insert(obj_ref);
        }
    }
}

/// Removes every trace of a deleted object from both secondary indexes.
/// Without this, a sandbox's indexed keys would linger forever after
/// deletion since only `Apply`/`InitApply` events otherwise touch the
/// index, leaking one `ObjectRef` entry per label/owner per deleted
/// sandbox.
async fn deindex_one(by_label: &Index, by_owner_annotation: &Index, obj: &Sandbox) {
    let obj_ref = ObjectRef::from_obj(obj);
    {
        let mut index = by_label.write().await;
        for set in index.values_mut() {
            set.remove(&obj_ref);
        }
    }
    {
        let mut index = by_owner_annotation.write().await;
        for set in index.values_mut() {
            set.remove(&obj_ref);
        }
    }
}

pub fn is_claimed(sbx: &Sandbox) -> bool {
    sbx.labels()
        .get(sandbox_common::annotations::SANDBOX_CLAIMED)
        .is_some_and(|v| v == "true")
}

pub fn is_ready(sbx: &Sandbox) -> bool {
    sbx.status
        .as_ref()
        .map(|s| &s.conditions)
        .into_iter()
        .flatten()
        .any(|c| c.type_ == sandbox_types::sandbox_condition_types::READY && c.status == "True")
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
    use kube::api::ObjectMeta;
    use sandbox_types::{SandboxStatus, sandbox_condition_types};
    use std::collections::BTreeMap;

    fn sandbox(name: &str, labels: &[(&str, &str)], owner: Option<&str>) -> Sandbox {
        let mut meta_labels = BTreeMap::new();
        for (k, v) in labels {
            meta_labels.insert(k.to_string(), v.to_string());
        }
        let mut annotations = BTreeMap::new();
        if let Some(owner) = owner {
            annotations.insert(sandbox_common::annotations::OWNER.to_string(), owner.to_string());
        }
        Sandbox {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                labels: Some(meta_labels),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: Default::default(),
            status: None,
        }
    }

    #[tokio::test]
    async fn deindex_one_removes_all_trace_of_a_deleted_object() {
        let by_label: Index = RwLock::new(HashMap::new());
        let by_owner_annotation: Index = RwLock::new(HashMap::new());
        let sbx = sandbox("pool-abc", &[("sandbox-template", "pool")], Some("user-1"));

        index_one(&by_label, &by_owner_annotation, &sbx).await;
        assert_eq!(by_label.read().await.get("sandbox-template=pool").map(|s| s.len()), Some(1));
        assert_eq!(by_owner_annotation.read().await.get("user-1").map(|s| s.len()), Some(1));

        deindex_one(&by_label, &by_owner_annotation, &sbx).await;
        assert!(by_label.read().await.values().all(|s| s.is_empty()));
        assert!(by_owner_annotation.read().await.values().all(|s| s.is_empty()));
    }

    #[tokio::test]
    async fn index_one_drops_stale_label_entries_on_relabel() {
        let by_label: Index = RwLock::new(HashMap::new());
        let by_owner_annotation: Index = RwLock::new(HashMap::new());
        let sbx = sandbox("pool-abc", &[("sandbox-template", "pool-a")], None);
        index_one(&by_label, &by_owner_annotation, &sbx).await;

        let relabeled = sandbox("pool-abc", &[("sandbox-template", "pool-b")], None);
        index_one(&by_label, &by_owner_annotation, &relabeled).await;

        let index = by_label.read().await;
        assert!(index.get("sandbox-template=pool-a").map(|s| s.is_empty()).unwrap_or(true));
        assert_eq!(index.get("sandbox-template=pool-b").map(|s| s.len()), Some(1));
    }

    #[test]
    fn is_claimed_true_only_for_exact_string_true() {
        let claimed = sandbox("s", &[(sandbox_common::annotations::SANDBOX_CLAIMED, "true")], None);
        let unclaimed = sandbox("s", &[(sandbox_common::annotations::SANDBOX_CLAIMED, "false")], None);
        let no_label = sandbox("s", &[], None);
        assert!(is_claimed(&claimed));
        assert!(!is_claimed(&unclaimed));
        assert!(!is_claimed(&no_label));
    }

    #[test]
    fn is_ready_requires_true_ready_condition() {
        let mut ready = sandbox("s", &[], None);
        ready.status = Some(SandboxStatus {
            conditions: vec![Condition {
                type_: sandbox_condition_types::READY.to_string(),
                status: "True".to_string(),
                reason: "Probed".to_string(),
                message: String::new(),
                last_transition_time: Time(k8s_openapi::jiff::Timestamp::now()),
                observed_generation: None,
            }],
            ..Default::default()
        });
        assert!(is_ready(&ready));

        let no_status = sandbox("s", &[], None);
        assert!(!is_ready(&no_status));
    }
}
