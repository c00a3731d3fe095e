use serde::{Deserialize, Serialize};

use crate::object::{impl_resource, ObjectMeta};

/// Cluster node. Only its labels matter to the scaler.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Node {
    pub metadata: ObjectMeta,
}

impl_resource!(Node, "/nodes/");

/// Per-node capacity policy derived from the node's size labels.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeInfo {
    pub name: String,
    pub models: Vec<ModelConstraints>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelConstraints {
    pub model: String,
    pub device_name: String,
    pub min_device: i64,
    pub max_device: i64,
}

impl NodeInfo {
    pub fn constraints(&self, model: &str) -> Option<&ModelConstraints> {
        self.models.iter().find(|m| m.model == model)
    }

    /// Lower bound for `model` on this node, 0 when the node sets none.
    pub fn min_devices(&self, model: &str) -> i64 {
        self.constraints(model).map(|c| c.min_device).unwrap_or(0)
    }

    /// Upper bound for `model`, `None` when unset or zero.
    pub fn max_devices(&self, model: &str) -> Option<i64> {
        self.constraints(model)
            .map(|c| c.max_device)
            .filter(|max| *max > 0)
    }
}
