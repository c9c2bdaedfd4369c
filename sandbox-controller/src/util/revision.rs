pub fn hash_spec<T: serde::Serialize>(spec: &T) -> String {
    use sha2::{Digest, Sha256};
    let spec_bytes = serde_json::to_vec(spec).unwrap();
    let mut hasher = Sha256::new();
    hasher.update(&spec_bytes);
    let result = hasher.finalize();
    hex::encode(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandbox_types::{PodTemplate, SandboxSpec};

    #[test]
    fn hash_is_stable_under_key_reordering() {
        let a = serde_json::json!({"paused": false, "extraLabels": {"a": "1", "b": "2"}});
        let b = serde_json::json!({"extraLabels": {"b": "2", "a": "1"}, "paused": false});
        assert_eq!(hash_spec(&a), hash_spec(&b));
    }

    #[test]
    fn hash_differs_on_real_change() {
        let s1 = SandboxSpec {
            pod: PodTemplate::default(),
            paused: false,
            ..Default::default()
        };
        let s2 = SandboxSpec {
            paused: true,
            ..s1.clone()
        };
        assert_ne!(hash_spec(&s1), hash_spec(&s2));
    }
}
