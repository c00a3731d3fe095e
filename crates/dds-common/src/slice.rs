use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::object::{impl_resource, ObjectMeta};

/// Inventory of devices a driver publishes for one node and pool.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceSlice {
    pub metadata: ObjectMeta,
    pub spec: ResourceSliceSpec,
}

impl_resource!(ResourceSlice, "/resourceslices/");

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSliceSpec {
    pub driver: String,

    #[serde(default)]
    pub node_name: String,

    pub pool: ResourcePool,

    #[serde(default)]
    pub devices: Vec<Device>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourcePool {
    pub name: String,
    #[serde(default)]
    pub generation: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Device {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic: Option<BasicDevice>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BasicDevice {
    #[serde(default)]
    pub attributes: BTreeMap<String, DeviceAttribute>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceAttribute {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub string: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub int: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bool: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl DeviceAttribute {
    pub fn string(value: impl Into<String>) -> Self {
        Self {
            string: Some(value.into()),
            ..Default::default()
        }
    }
}

impl Device {
    pub fn string_attribute(&self, name: &str) -> Option<&str> {
        self.basic
            .as_ref()?
            .attributes
            .get(name)?
            .string
            .as_deref()
    }
}

/// Per-cycle view of one slice.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SliceInfo {
    pub name: String,
    pub node_name: String,
    pub created_at: Option<DateTime<Utc>>,
    pub driver: String,
    pub pool: String,
    pub devices: Vec<SliceDevice>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SliceDevice {
    pub name: String,
    pub uuid: String,
    /// Driver reports the device as faulty ("red") and due for replacement.
    pub degraded: bool,
}
