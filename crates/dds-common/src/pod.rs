use serde::{Deserialize, Serialize};

use crate::object::{impl_resource, ObjectMeta};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pod {
    pub metadata: ObjectMeta,

    #[serde(default)]
    pub status: PodStatus,
}

impl_resource!(Pod, "/pods/");

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PodStatus {
    #[serde(default)]
    pub phase: PodPhase,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    #[default]
    #[serde(other)]
    Unknown,
}
