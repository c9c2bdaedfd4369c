use k8s_openapi::api::core::v1::PodTemplateSpec;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What must survive a pause/resume cycle. Determines whether pausing is
/// implemented by annotating the live pod (in-place) or by deleting and
/// later recreating it.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum PersistentContentMode {
    Ip,
    Memory,
    Filesystem,
}

/// A pod template or a reference to one kept elsewhere. Exactly one of the
/// two should be set; the reconcilers treat an inline template as taking
/// precedence if both are somehow present.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct PodTemplate {
    pub template: Option<PodTemplateSpec>,
    pub template_ref: Option<String>,
}

/// `replicas` or a percentage of `replicas`, used for the scale-up budget.
#[derive(Clone, Debug, PartialEq, Eq, JsonSchema)]
pub enum MaxUnavailable {
    Count(i32),
    Percent(i32),
}

impl Default for MaxUnavailable {
    fn default() -> Self {
        MaxUnavailable::Percent(20)
    }
}

impl Serialize for MaxUnavailable {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            MaxUnavailable::Count(n) => serializer.serialize_i32(*n),
            MaxUnavailable::Percent(p) => serializer.serialize_str(&format!("{p}%")),
        }
    }
}

impl<'de> Deserialize<'de> for MaxUnavailable {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Int(i32),
            Str(String),
        }
        match Repr::deserialize(deserializer)? {
            Repr::Int(n) => Ok(MaxUnavailable::Count(n)),
            Repr::Str(s) => {
                let trimmed = s.trim();
                if let Some(pct) = trimmed.strip_suffix('%') {
                    pct.parse()
                        .map(MaxUnavailable::Percent)
                        .map_err(serde::de::Error::custom)
                } else {
                    trimmed
                        .parse()
                        .map(MaxUnavailable::Count)
                        .map_err(serde::de::Error::custom)
                }
            }
        }
    }
}

impl MaxUnavailable {
    /// Resolves the budget against a desired replica count, per the
    /// Kubernetes convention of rounding percentages up.
    pub fn resolve(&self, replicas: i32) -> i32 {
        match self {
            MaxUnavailable::Count(n) => (*n).max(0),
            MaxUnavailable::Percent(p) => {
                let replicas = replicas.max(0) as i64;
                let p = (*p).max(0) as i64;
                (((replicas * p) + 99) / 100) as i32
            }
        }
    }
}

/// Scaling knobs for a `SandboxSet`.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct ScaleStrategy {
    #[serde(default)]
    pub max_unavailable: MaxUnavailable,
}

impl Default for ScaleStrategy {
    fn default() -> Self {
        Self {
            max_unavailable: MaxUnavailable::default(),
        }
    }
}

pub type Labels = BTreeMap<String, String>;
