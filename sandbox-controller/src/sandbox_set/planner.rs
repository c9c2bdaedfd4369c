use sandbox_types::{Sandbox, SandboxPhase};

use crate::cache;

/// `SandboxSet` children partitioned by disposition. A sandbox lands in
/// exactly one bucket, checked in priority order: terminating, then
/// claimed, then dead (Failed -- the pool controller replaces these but
/// does not restart them), then stale/current revision.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Partition {
    pub current_revision: Vec<String>,
    pub stale: Vec<String>,
    pub terminating: Vec<String>,
    pub claimed: Vec<String>,
    pub dead: Vec<String>,
}

pub fn partition_children(children: &[Sandbox], update_revision: &str) -> Partition {
    let mut p = Partition::default();
    for child in children {
        let name = match &child.metadata.name {
            Some(n) => n.clone(),
            None => continue,
        };
        if child.metadata.deletion_timestamp.is_some() {
            p.terminating.push(name);
            continue;
        }
        if cache::is_claimed(child) {
            p.claimed.push(name);
            continue;
        }
        let phase = child.status.as_ref().map(|s| s.phase).unwrap_or_default();
        if phase == SandboxPhase::Failed {
            // Not restarted, and not counted toward replicas either --
            // the pool's diff against `replicas` must see the gap so it
            // creates a replacement.
            p.dead.push(name);
            continue;
        }
        let hash = child
            .status
            .as_ref()
            .map(|s| s.template_hash.as_str())
            .unwrap_or("");
        if hash == update_revision {
            p.current_revision.push(name);
        } else {
            p.stale.push(name);
        }
    }
    p
}

/// Number of sandboxes still needed to reach `replicas`, not counting
/// claimed sandboxes (they belong to their claimant now) or sandboxes
/// already terminating.
pub fn compute_diff(replicas: i32, current_revision_count: usize) -> i32 {
    replicas - current_revision_count as i32
}

/// Splits a total number of creates into a slow-start batch schedule:
/// window 1, then 2, then 4, doubling up to what remains. Dampens
/// API-server storms under transient errors the same way the Pick
/// Engine's doubling-window scheduler does for concurrent picks.
pub fn slow_start_windows(total: usize) -> Vec<usize> {
    let mut windows = Vec::new();
    let mut remaining = total;
    let mut window = 1usize;
    while remaining > 0 {
        let take = window.min(remaining);
        windows.push(take);
        remaining -= take;
        window = window.saturating_mul(2);
    }
    windows
}

/// Ranks unclaimed sandboxes for scale-down: stale revisions first, then
/// Pending, then Paused, then Running. Ties break on lexicographically
/// smallest name for determinism across reconciles.
pub fn select_scale_down_candidates(candidates: &[Sandbox], count: usize) -> Vec<String> {
    let mut ranked: Vec<(u8, String)> = candidates
        .iter()
        .filter_map(|sbx| {
            let name = sbx.metadata.name.clone()?;
            Some((rank(sbx), name))
        })
        .collect();
    ranked.sort();
    ranked.into_iter().take(count).map(|(_, name)| name).collect()
}

fn rank(sbx: &Sandbox) -> u8 {
    match sbx.status.as_ref().map(|s| s.phase).unwrap_or_default() {
        SandboxPhase::Pending => 1,
        SandboxPhase::Paused => 2,
        SandboxPhase::Running => 3,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandbox_types::{SandboxSpec, SandboxStatus};

    fn sbx(name: &str, hash: &str, phase: SandboxPhase) -> Sandbox {
        Sandbox {
            metadata: kube::api::ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: SandboxSpec::default(),
            status: Some(SandboxStatus {
                phase,
                template_hash: hash.to_string(),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn partitions_by_revision_and_claim_state() {
        let children = vec![
            sbx("a", "h1", SandboxPhase::Running),
            sbx("b", "h0", SandboxPhase::Running),
        ];
        let p = partition_children(&children, "h1");
        assert_eq!(p.current_revision, vec!["a".to_string()]);
        assert_eq!(p.stale, vec!["b".to_string()]);
    }

    #[test]
    fn terminating_takes_priority_over_revision() {
        let mut child = sbx("a", "h1", SandboxPhase::Running);
        child.metadata.deletion_timestamp = Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
            k8s_openapi::jiff::Timestamp::now(),
        ));
        let p = partition_children(&[child], "h1");
        assert_eq!(p.terminating, vec!["a".to_string()]);
        assert!(p.current_revision.is_empty());
    }

    #[test]
    fn diff_ignores_claimed_sandboxes() {
        assert_eq!(compute_diff(5, 3), 2);
        assert_eq!(compute_diff(3, 5), -2);
    }

    #[test]
    fn failed_sandboxes_are_dead_not_current_revision() {
        let children = vec![
            sbx("a", "h1", SandboxPhase::Running),
            sbx("b", "h1", SandboxPhase::Failed),
        ];
        let p = partition_children(&children, "h1");
        assert_eq!(p.current_revision, vec!["a".to_string()]);
        assert_eq!(p.dead, vec!["b".to_string()]);
        // A Failed sandbox never counts toward replicas, so the pool's
        // diff against `replicas` sees the gap and creates a replacement.
        assert_eq!(compute_diff(2, p.current_revision.len()), 1);
    }

    #[test]
    fn slow_start_doubles_then_caps_at_remaining() {
        assert_eq!(slow_start_windows(7), vec![1, 2, 4]);
        assert_eq!(slow_start_windows(1), vec![1]);
        assert_eq!(slow_start_windows(0), Vec::<usize>::new());
        assert_eq!(slow_start_windows(10), vec![1, 2, 4, 3]);
    }

    #[test]
    fn scale_down_prefers_stale_then_pending_then_paused_then_running() {
        let candidates = vec![
            sbx("running-z", "h1", SandboxPhase::Running),
            sbx("pending-a", "h1", SandboxPhase::Pending),
            sbx("paused-a", "h1", SandboxPhase::Paused),
        ];
        let picked = select_scale_down_candidates(&candidates, 2);
        assert_eq!(picked, vec!["pending-a".to_string(), "paused-a".to_string()]);
    }

    #[test]
    fn scale_down_breaks_ties_lexicographically() {
        let candidates = vec![
            sbx("b", "h1", SandboxPhase::Running),
            sbx("a", "h1", SandboxPhase::Running),
        ];
        let picked = select_scale_down_candidates(&candidates, 1);
        assert_eq!(picked, vec!["a".to_string()]);
    }
}
