//! Resource policy documents
//!
//! Velero reads volume policies from a config map referenced by
//! `--resource-policies-configmap`. Policies are evaluated in order and the
//! first one whose conditions all match decides the action for a volume.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::k8s::storage::E2E_STORAGE_CLASS;

pub const POLICY_VERSION: &str = "v1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcePolicies {
    pub version: String,
    #[serde(rename = "volumePolicies")]
    pub volume_policies: Vec<VolumePolicy>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumePolicy {
    pub conditions: VolumeConditions,
    pub action: Action,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeConditions {
    /// `"min,max"` range; either bound may be empty
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<String>,
    #[serde(
        rename = "storageClass",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub storage_class: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub type_: ActionType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Skip,
}

impl ResourcePolicies {
    /// Skip volumes sized 2Gi to 3Gi, and volumes of the first e2e storage class.
    pub fn e2e_default() -> Self {
        Self {
            version: POLICY_VERSION.to_string(),
            volume_policies: vec![
                VolumePolicy {
                    conditions: VolumeConditions {
                        capacity: Some("2Gi,3Gi".to_string()),
                        storage_class: None,
                    },
                    action: Action {
                        type_: ActionType::Skip,
                    },
                },
                VolumePolicy {
                    conditions: VolumeConditions {
                        capacity: None,
                        storage_class: Some(vec![E2E_STORAGE_CLASS.to_string()]),
                    },
                    action: Action {
                        type_: ActionType::Skip,
                    },
                },
            ],
        }
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Action of the first policy matching a volume, if any.
    pub fn evaluate(&self, capacity: &str, storage_class: &str) -> Result<Option<ActionType>> {
        let size = parse_quantity(capacity)?;
        for policy in &self.volume_policies {
            if policy.conditions.matches(size, storage_class)? {
                return Ok(Some(policy.action.type_));
            }
        }
        Ok(None)
    }
}

impl VolumeConditions {
    fn matches(&self, size: f64, storage_class: &str) -> Result<bool> {
        if let Some(range) = &self.capacity {
            let (lower, upper) = parse_capacity_range(range)?;
            if size < lower || upper.is_some_and(|upper| size > upper) {
                return Ok(false);
            }
        }
        if let Some(classes) = &self.storage_class {
            if !classes.iter().any(|c| c == storage_class) {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Bounds of a `"min,max"` capacity condition in bytes. An empty upper bound
/// is unbounded.
pub fn parse_capacity_range(range: &str) -> Result<(f64, Option<f64>)> {
    let (lower, upper) = range.split_once(',').ok_or_else(|| {
        Error::ConfigError(format!("capacity condition {range:?} is not a \"min,max\" range"))
    })?;
    let lower = match lower.trim() {
        "" => 0.0,
        q => parse_quantity(q)?,
    };
    let upper = match upper.trim() {
        "" => None,
        q => Some(parse_quantity(q)?),
    };
    Ok((lower, upper))
}

/// Parse a Kubernetes resource quantity such as `1Gi`, `500M` or `1.5Ti` into bytes.
pub fn parse_quantity(quantity: &str) -> Result<f64> {
    let quantity = quantity.trim();
    let split = quantity
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(quantity.len());
    let (number, suffix) = quantity.split_at(split);

    let multiplier: f64 = match suffix {
        "" => 1.0,
        "Ki" => 1024.0,
        "Mi" => 1024f64.powi(2),
        "Gi" => 1024f64.powi(3),
        "Ti" => 1024f64.powi(4),
        "Pi" => 1024f64.powi(5),
        "Ei" => 1024f64.powi(6),
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        _ => {
            return Err(Error::ConfigError(format!(
                "unknown quantity suffix in {quantity:?}"
            )))
        }
    };
    let value: f64 = number
        .parse()
        .map_err(|_| Error::ConfigError(format!("invalid quantity {quantity:?}")))?;
    Ok(value * multiplier)
}
