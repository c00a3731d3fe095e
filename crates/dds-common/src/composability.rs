use serde::{Deserialize, Serialize};

use crate::object::{impl_resource, ObjectMeta};

/// Provisioned device state meaning attached and usable.
pub const STATE_ONLINE: &str = "Online";

/// How many devices of one model are requested for one node.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ComposabilityRequest {
    pub metadata: ObjectMeta,
    pub spec: ComposabilityRequestSpec,

    #[serde(default)]
    pub status: ComposabilityRequestStatus,
}

impl_resource!(ComposabilityRequest, "/composabilityrequests/");

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ComposabilityRequestSpec {
    pub resource: ScalarResourceDetails,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScalarResourceDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub model: String,
    pub size: i64,

    #[serde(default)]
    pub target_node: String,

    #[serde(default)]
    pub force_detach: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ComposabilityRequestStatus {
    #[serde(default)]
    pub state: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl ComposabilityRequest {
    pub fn targets(&self, model: &str, node: &str) -> bool {
        self.spec.resource.model == model && self.spec.resource.target_node == node
    }
}

/// One instantiated device.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ComposableResource {
    pub metadata: ObjectMeta,
    pub spec: ComposableResourceSpec,

    #[serde(default)]
    pub status: ComposableResourceStatus,
}

impl_resource!(ComposableResource, "/composableresources/");

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ComposableResourceSpec {
    #[serde(rename = "type")]
    pub type_: String,
    pub model: String,
    pub target_node: String,

    #[serde(default)]
    pub force_detach: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ComposableResourceStatus {
    #[serde(default)]
    pub state: String,

    #[serde(rename = "deviceID", default)]
    pub device_id: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl ComposableResource {
    pub fn is_online(&self) -> bool {
        self.status.state == STATE_ONLINE
    }

    pub fn targets(&self, model: &str, node: &str) -> bool {
        self.spec.model == model && self.spec.target_node == node
    }
}
