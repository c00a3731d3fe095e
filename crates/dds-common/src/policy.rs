use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Annotation suffix carrying the last time a degraded device served a workload.
pub const LAST_USED_TIME_SUFFIX: &str = "last-used-time";

/// Label suffixes carrying per-node size bounds.
pub const SIZE_MIN_SUFFIX: &str = "-size-min";
pub const SIZE_MAX_SUFFIX: &str = "-size-max";

/// One configured device model.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct DeviceCatalogEntry {
    pub index: i32,

    #[serde(rename = "cdi-model-name")]
    pub model_name: String,

    /// Attributes a slice device must carry to be this model.
    #[serde(rename = "dra-attributes", default)]
    pub attributes: BTreeMap<String, String>,

    #[serde(default)]
    pub label_key_model: String,

    #[serde(default)]
    pub driver_name: String,

    #[serde(rename = "k8s-device-name")]
    pub k8s_device_name: String,

    /// Catalog indexes that must not be installed alongside this model.
    #[serde(default)]
    pub cannot_coexist_with: BTreeSet<i32>,
}

/// Scaling policy, read once per cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicyConfig {
    pub label_prefix: String,
    pub devices: Vec<DeviceCatalogEntry>,
    pub fabric_id_range: Vec<i32>,
}

impl PolicyConfig {
    pub fn entry_by_device_name(&self, k8s_device_name: &str) -> Option<&DeviceCatalogEntry> {
        self.devices
            .iter()
            .find(|d| d.k8s_device_name == k8s_device_name)
    }

    /// `<prefix>/<suffix>`
    pub fn label_key(&self, suffix: &str) -> String {
        format!("{}/{}", self.label_prefix, suffix)
    }

    /// Capability label advertising that `entry` may be requested on a node.
    pub fn capability_label(&self, entry: &DeviceCatalogEntry) -> String {
        self.label_key(&entry.k8s_device_name)
    }

    pub fn last_used_annotation(&self) -> String {
        self.label_key(LAST_USED_TIME_SUFFIX)
    }
}
