//! Pool configuration tree
//!
//! Pool configurations form an inheritance chain: a node may name a parent
//! whose values it refines. Reconciliation flattens the chain into one
//! complete [`PoolConfig`] before doing anything else, and rejects chains
//! that are cyclic or that leave required parameters unset.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SpotherdError};

/// Unique identifier for a configuration node
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ConfigId(pub u32);

impl std::fmt::Display for ConfigId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One node of a configuration chain. Every value is optional; unset values
/// are inherited from the parent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolConfigNode {
    pub id: ConfigId,
    pub name: String,
    #[serde(default)]
    pub parent: Option<ConfigId>,

    /// Desired capacity in cores, not instances
    #[serde(default)]
    pub size: Option<u32>,
    /// Seconds after which every instance of the pool is recycled
    #[serde(default)]
    pub cycle_interval: Option<u64>,
    /// Name of the cloud provider implementation
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub allowed_regions: Option<Vec<String>>,
    #[serde(default)]
    pub instance_types: Option<Vec<String>>,
    /// Price ceiling per core-hour
    #[serde(default)]
    pub max_price: Option<f64>,
    /// Applied to every launched instance; merged across the chain
    #[serde(default)]
    pub tags: HashMap<String, String>,
    /// Launch-time user data template
    #[serde(default)]
    pub user_data: Option<Vec<u8>>,
    /// Macro values substituted into the user data; merged across the chain
    #[serde(default)]
    pub user_data_macros: HashMap<String, String>,
    #[serde(default)]
    pub image_name: Option<String>,
    #[serde(default)]
    pub key_name: Option<String>,
    #[serde(default)]
    pub security_groups: Option<Vec<String>>,
}

impl PoolConfigNode {
    /// Overlay this node's set values onto `base`. Scalars and lists are
    /// replaced; `tags` and `user_data_macros` merge with this node winning.
    fn overlay_onto(&self, base: &mut PoolConfigNode) {
        macro_rules! take {
            ($field:ident) => {
                if self.$field.is_some() {
                    base.$field = self.$field.clone();
                }
            };
        }
        take!(size);
        take!(cycle_interval);
        take!(provider);
        take!(allowed_regions);
        take!(instance_types);
        take!(max_price);
        take!(user_data);
        take!(image_name);
        take!(key_name);
        take!(security_groups);
        base.tags
            .extend(self.tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        base.user_data_macros
            .extend(self.user_data_macros.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    /// Names of required parameters the (flattened) node leaves unset.
    pub fn missing_parameters(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.size.is_none() {
            missing.push("size");
        }
        if self.cycle_interval.is_none() {
            missing.push("cycle_interval");
        }
        if self.provider.is_none() {
            missing.push("provider");
        }
        if self.allowed_regions.as_ref().is_none_or(|r| r.is_empty()) {
            missing.push("allowed_regions");
        }
        if self.instance_types.as_ref().is_none_or(|t| t.is_empty()) {
            missing.push("instance_types");
        }
        if self.max_price.is_none() {
            missing.push("max_price");
        }
        if self.image_name.is_none() {
            missing.push("image_name");
        }
        if self.user_data.is_none() {
            missing.push("user_data");
        }
        missing
    }

    /// Turn the flattened node into a complete configuration, or a
    /// `Config` error naming what is missing.
    pub fn into_config(self) -> Result<PoolConfig> {
        let missing = self.missing_parameters();
        if !missing.is_empty() {
            return Err(SpotherdError::Config(format!(
                "missing required parameters: {}",
                missing.join(", ")
            )));
        }
        Ok(PoolConfig {
            name: self.name,
            size: self.size.unwrap_or_default(),
            cycle_interval: self.cycle_interval.unwrap_or_default(),
            provider: self.provider.unwrap_or_default(),
            allowed_regions: self.allowed_regions.unwrap_or_default(),
            instance_types: self.instance_types.unwrap_or_default(),
            max_price: self.max_price.unwrap_or_default(),
            tags: self.tags,
            user_data: self.user_data.unwrap_or_default(),
            user_data_macros: self.user_data_macros,
            image_name: self.image_name.unwrap_or_default(),
            key_name: self.key_name,
            security_groups: self.security_groups.unwrap_or_default(),
        })
    }
}

/// Flatten a configuration chain into one node.
///
/// `chain` is ordered child first (the pool's own node at index 0, the
/// topmost ancestor last); children override their ancestors.
pub fn flatten_chain(chain: &[PoolConfigNode]) -> PoolConfigNode {
    let mut flat = PoolConfigNode::default();
    for node in chain.iter().rev() {
        node.overlay_onto(&mut flat);
    }
    if let Some(child) = chain.first() {
        flat.id = child.id;
        flat.name = child.name.clone();
        flat.parent = None;
    }
    flat
}

/// A fully resolved pool configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    pub name: String,
    /// Desired capacity in cores
    pub size: u32,
    /// Seconds between mandatory recycles of the whole pool
    pub cycle_interval: u64,
    pub provider: String,
    pub allowed_regions: Vec<String>,
    pub instance_types: Vec<String>,
    /// Price ceiling per core-hour
    pub max_price: f64,
    pub tags: HashMap<String, String>,
    pub user_data: Vec<u8>,
    pub user_data_macros: HashMap<String, String>,
    pub image_name: String,
    pub key_name: Option<String>,
    pub security_groups: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_node() -> PoolConfigNode {
        PoolConfigNode {
            id: ConfigId(1),
            name: "base".into(),
            size: Some(16),
            cycle_interval: Some(3600),
            provider: Some("EC2Spot".into()),
            allowed_regions: Some(vec!["us-east-1".into()]),
            instance_types: Some(vec!["c5.xlarge".into()]),
            max_price: Some(0.05),
            tags: HashMap::from([("team".to_string(), "fuzzing".to_string())]),
            user_data: Some(b"#!/bin/sh\n".to_vec()),
            image_name: Some("base-image".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_flatten_child_overrides_parent() {
        let parent = base_node();
        let child = PoolConfigNode {
            id: ConfigId(2),
            name: "child".into(),
            parent: Some(ConfigId(1)),
            size: Some(32),
            tags: HashMap::from([("owner".to_string(), "alice".to_string())]),
            ..Default::default()
        };

        let flat = flatten_chain(&[child, parent]);
        assert_eq!(flat.id, ConfigId(2));
        assert_eq!(flat.name, "child");
        assert_eq!(flat.size, Some(32));
        // inherited
        assert_eq!(flat.cycle_interval, Some(3600));
        assert_eq!(flat.image_name.as_deref(), Some("base-image"));
        // tag maps merge
        assert_eq!(flat.tags.get("team").unwrap(), "fuzzing");
        assert_eq!(flat.tags.get("owner").unwrap(), "alice");
    }

    #[test]
    fn test_tag_merge_child_wins() {
        let mut parent = base_node();
        parent
            .tags
            .insert("purpose".to_string(), "general".to_string());
        let child = PoolConfigNode {
            id: ConfigId(2),
            name: "child".into(),
            parent: Some(ConfigId(1)),
            tags: HashMap::from([("purpose".to_string(), "asan".to_string())]),
            ..Default::default()
        };

        let flat = flatten_chain(&[child, parent]);
        assert_eq!(flat.tags.get("purpose").unwrap(), "asan");
    }

    #[test]
    fn test_missing_parameters() {
        let node = PoolConfigNode {
            id: ConfigId(3),
            name: "incomplete".into(),
            size: Some(8),
            ..Default::default()
        };
        let missing = node.missing_parameters();
        assert!(missing.contains(&"provider"));
        assert!(missing.contains(&"max_price"));
        assert!(!missing.contains(&"size"));

        let err = node.into_config().unwrap_err();
        assert!(matches!(err, SpotherdError::Config(_)));
    }

    #[test]
    fn test_empty_lists_count_as_missing() {
        let mut node = base_node();
        node.instance_types = Some(Vec::new());
        assert!(node.missing_parameters().contains(&"instance_types"));
    }

    #[test]
    fn test_complete_config_builds() {
        let config = base_node().into_config().unwrap();
        assert_eq!(config.size, 16);
        assert_eq!(config.provider, "EC2Spot");
        assert_eq!(config.max_price, 0.05);
    }
}
