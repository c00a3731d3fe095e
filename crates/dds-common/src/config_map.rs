use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::object::{impl_resource, ObjectMeta};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfigMap {
    pub metadata: ObjectMeta,

    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl_resource!(ConfigMap, "/configmaps/");
