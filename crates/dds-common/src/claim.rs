use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::condition::Condition;
use crate::object::{impl_resource, ObjectMeta};

/// Workload request for devices, as published by the cluster's allocator.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceClaim {
    pub metadata: ObjectMeta,

    #[serde(default)]
    pub status: ResourceClaimStatus,
}

impl_resource!(ResourceClaim, "/resourceclaims/");

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceClaimStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reserved_for: Vec<ConsumerReference>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocation: Option<AllocationResult>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<AllocatedDeviceStatus>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsumerReference {
    /// Plural resource name of the consumer, `pods` for workloads.
    #[serde(default)]
    pub resource: String,
    pub name: String,
    #[serde(default)]
    pub uid: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AllocationResult {
    #[serde(default)]
    pub results: Vec<DeviceRequestAllocationResult>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<NodeSelector>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRequestAllocationResult {
    #[serde(default)]
    pub request: String,
    pub driver: String,
    pub pool: String,
    pub device: String,

    /// Condition types that must become true before the device is usable.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub binding_conditions: Vec<String>,

    /// Condition types that, once true, mean binding will never succeed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub binding_failure_conditions: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AllocatedDeviceStatus {
    pub driver: String,
    pub pool: String,
    pub device: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodeSelector {
    #[serde(default)]
    pub node_selector_terms: Vec<NodeSelectorTerm>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodeSelectorTerm {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<NodeSelectorRequirement>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_fields: Vec<NodeSelectorRequirement>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeSelectorRequirement {
    pub key: String,
    pub operator: String,
    #[serde(default)]
    pub values: Vec<String>,
}

/// Where a claimed device stands, derived from its reported conditions.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DeviceState {
    /// No conditions reported: bound and serving.
    #[default]
    Healthy,
    Preparing,
    Reschedule,
    Failed,
}

impl DeviceState {
    /// Whether a device in this state still needs capacity on its node.
    pub fn counts_toward_capacity(self) -> bool {
        matches!(self, DeviceState::Healthy | DeviceState::Preparing)
    }
}

/// A reserved claim as seen by one reconcile cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClaimInfo {
    pub name: String,
    pub namespace: String,
    pub node_name: String,
    pub slice_name: String,
    pub created_at: Option<DateTime<Utc>>,
    pub devices: Vec<ClaimDevice>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClaimDevice {
    pub name: String,
    pub driver: String,
    pub pool: String,
    /// Catalog model name, empty when no catalog entry matches the device.
    pub model: String,
    pub state: DeviceState,
    /// False while the allocator is still waiting on a binding condition.
    pub binding_resolved: bool,
}

impl ClaimInfo {
    pub fn has_device_in(&self, state: DeviceState) -> bool {
        self.devices.iter().any(|d| d.state == state)
    }
}
