use std::collections::BTreeSet;

use dds_common::policy::{SIZE_MAX_SUFFIX, SIZE_MIN_SUFFIX};
use dds_common::{
    ClaimDevice, ClaimInfo, Condition, ConfigMap, DeviceCatalogEntry, DeviceState,
    ModelConstraints, Node, NodeInfo, NodeSelector, ObjectKey, PolicyConfig, ResourceClaim,
    ResourceSlice, SliceDevice, SliceInfo,
};
use dds_meta::ClusterApi;
use serde::de::DeserializeOwned;

use crate::error::ScalerError;
use crate::reschedule::{FAILED_CONDITION, RESCHEDULE_CONDITION};

/// Slice device attribute carrying the physical device ID.
pub const UUID_ATTRIBUTE: &str = "uuid";
/// Slice device attribute carrying the driver's health verdict.
pub const STATUS_ATTRIBUTE: &str = "status";

/// Everything one reconcile cycle decides on. Built fresh each cycle.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// Reserved claims only.
    pub claims: Vec<ClaimInfo>,
    /// Raw claim objects, kept for usage checks.
    pub claim_objects: Vec<ResourceClaim>,
    pub slices: Vec<SliceInfo>,
    pub nodes: Vec<NodeInfo>,
    pub policy: PolicyConfig,
}

/// Read claims, slices, the policy config map and nodes, in that order.
/// The first failure aborts collection.
pub async fn collect<C: ClusterApi>(
    cluster: &C,
    policy_source: &ObjectKey,
) -> Result<Snapshot, ScalerError> {
    let claim_objects = cluster
        .list::<ResourceClaim>()
        .await
        .map_err(ScalerError::transport("list resource claims"))?;
    let slice_objects = cluster
        .list::<ResourceSlice>()
        .await
        .map_err(ScalerError::transport("list resource slices"))?;

    let config = cluster
        .get::<ConfigMap>(policy_source)
        .await
        .map_err(ScalerError::transport("get policy config map"))?
        .ok_or_else(|| ScalerError::PolicyNotFound {
            namespace: policy_source.namespace.clone().unwrap_or_default(),
            name: policy_source.name.clone(),
        })?;
    let policy = parse_policy(&config)?;

    let node_objects = cluster
        .list::<Node>()
        .await
        .map_err(ScalerError::transport("list nodes"))?;
    let nodes = node_infos(&node_objects, &policy)?;

    Ok(Snapshot {
        claims: claim_infos(&claim_objects, &slice_objects, &policy),
        claim_objects,
        slices: slice_infos(&slice_objects),
        nodes,
        policy,
    })
}

fn yaml_field<T: DeserializeOwned + Default>(
    config: &ConfigMap,
    field: &'static str,
) -> Result<T, ScalerError> {
    match config.data.get(field).map(|raw| raw.trim()) {
        None | Some("") => Ok(T::default()),
        Some(raw) => {
            serde_yaml::from_str(raw).map_err(|source| ScalerError::MalformedPolicy { field, source })
        }
    }
}

pub fn parse_policy(config: &ConfigMap) -> Result<PolicyConfig, ScalerError> {
    let devices: Vec<DeviceCatalogEntry> = yaml_field(config, "device-info")?;
    let fabric_id_range: Vec<i32> = yaml_field(config, "fabric-id-range")?;
    let label_prefix = config
        .data
        .get("label-prefix")
        .map(|p| p.trim().to_string())
        .unwrap_or_default();

    let mut seen = BTreeSet::new();
    for entry in &devices {
        if !seen.insert(entry.index) {
            return Err(ScalerError::DuplicateCatalogIndex(entry.index));
        }
    }

    Ok(PolicyConfig {
        label_prefix,
        devices,
        fabric_id_range,
    })
}

/// Size bounds per model from `<prefix>/<device>-size-min|max` labels.
pub fn node_infos(nodes: &[Node], policy: &PolicyConfig) -> Result<Vec<NodeInfo>, ScalerError> {
    let prefix = format!("{}/", policy.label_prefix);
    let mut infos = Vec::with_capacity(nodes.len());

    for node in nodes {
        let mut info = NodeInfo {
            name: node.metadata.name.clone(),
            models: Vec::new(),
        };

        for (key, value) in &node.metadata.labels {
            let Some(suffix) = key.strip_prefix(&prefix) else {
                continue;
            };
            let (device_name, is_max) = if let Some(d) = suffix.strip_suffix(SIZE_MAX_SUFFIX) {
                (d, true)
            } else if let Some(d) = suffix.strip_suffix(SIZE_MIN_SUFFIX) {
                (d, false)
            } else {
                continue;
            };

            let bound: i64 = value
                .trim()
                .parse()
                .map_err(|source| ScalerError::InvalidInteger {
                    value: value.clone(),
                    source,
                })?;
            let entry = policy
                .entry_by_device_name(device_name)
                .ok_or_else(|| ScalerError::UnknownDeviceName(device_name.to_string()))?;

            let idx = match info.models.iter().position(|m| m.device_name == device_name) {
                Some(idx) => idx,
                None => {
                    info.models.push(ModelConstraints {
                        model: entry.model_name.clone(),
                        device_name: device_name.to_string(),
                        ..Default::default()
                    });
                    info.models.len() - 1
                }
            };
            let constraints = &mut info.models[idx];
            if is_max {
                constraints.max_device = bound;
            } else {
                constraints.min_device = bound;
            }
        }

        infos.push(info);
    }

    Ok(infos)
}

pub fn slice_infos(slices: &[ResourceSlice]) -> Vec<SliceInfo> {
    slices
        .iter()
        .map(|slice| SliceInfo {
            name: slice.metadata.name.clone(),
            node_name: slice.spec.node_name.clone(),
            created_at: slice.metadata.creation_timestamp,
            driver: slice.spec.driver.clone(),
            pool: slice.spec.pool.name.clone(),
            devices: slice
                .spec
                .devices
                .iter()
                .filter(|d| d.basic.is_some())
                .map(|d| SliceDevice {
                    name: d.name.clone(),
                    uuid: d.string_attribute(UUID_ATTRIBUTE).unwrap_or_default().to_string(),
                    degraded: d
                        .string_attribute(STATUS_ATTRIBUTE)
                        .is_some_and(|s| s.eq_ignore_ascii_case("red")),
                })
                .collect(),
        })
        .collect()
}

/// Map the full condition set of a claim device to its state.
/// Failed wins over Reschedule, which wins over any other condition.
pub fn classify_device_state(conditions: &[Condition]) -> DeviceState {
    let is_true = |kind: &str| conditions.iter().any(|c| c.type_ == kind && c.is_true());
    if is_true(FAILED_CONDITION) {
        DeviceState::Failed
    } else if is_true(RESCHEDULE_CONDITION) {
        DeviceState::Reschedule
    } else if !conditions.is_empty() {
        DeviceState::Preparing
    } else {
        DeviceState::Healthy
    }
}

/// True iff a condition with status True has a type listed in either
/// `binding` or `binding_failure`.
pub fn has_matching_binding_condition(
    conditions: &[Condition],
    binding: &[String],
    binding_failure: &[String],
) -> bool {
    conditions.iter().any(|c| {
        c.is_true() && (binding.contains(&c.type_) || binding_failure.contains(&c.type_))
    })
}

/// Node pinned by a `metadata.name In [...]` field selector, if any.
pub fn node_name_from_selector(selector: &NodeSelector) -> Option<&str> {
    selector
        .node_selector_terms
        .iter()
        .flat_map(|t| t.match_fields.iter())
        .find(|r| r.key == "metadata.name" && r.operator == "In")
        .and_then(|r| r.values.first())
        .map(String::as_str)
}

/// Catalog model of a slice device: the first entry whose attributes all
/// match and whose driver, if set, is the slice's driver.
pub fn resolve_model<'p>(
    policy: &'p PolicyConfig,
    driver: &str,
    device: &dds_common::Device,
) -> Option<&'p str> {
    policy
        .devices
        .iter()
        .find(|entry| {
            !entry.attributes.is_empty()
                && (entry.driver_name.is_empty() || entry.driver_name == driver)
                && entry
                    .attributes
                    .iter()
                    .all(|(k, v)| device.string_attribute(k) == Some(v.as_str()))
        })
        .map(|entry| entry.model_name.as_str())
}

struct RawDevice<'c> {
    driver: &'c str,
    pool: &'c str,
    device: &'c str,
    conditions: &'c [Condition],
    binding: &'c [String],
    binding_failure: &'c [String],
}

/// Allocation results when present, joined with the reported status of the
/// same device. Bare status entries otherwise.
fn raw_devices(claim: &ResourceClaim) -> Vec<RawDevice<'_>> {
    let status = &claim.status;
    match status.allocation.as_ref().filter(|a| !a.results.is_empty()) {
        Some(allocation) => allocation
            .results
            .iter()
            .map(|r| RawDevice {
                driver: &r.driver,
                pool: &r.pool,
                device: &r.device,
                conditions: status
                    .devices
                    .iter()
                    .find(|d| d.driver == r.driver && d.pool == r.pool && d.device == r.device)
                    .map(|d| d.conditions.as_slice())
                    .unwrap_or_default(),
                binding: &r.binding_conditions,
                binding_failure: &r.binding_failure_conditions,
            })
            .collect(),
        None => status
            .devices
            .iter()
            .map(|d| RawDevice {
                driver: &d.driver,
                pool: &d.pool,
                device: &d.device,
                conditions: &d.conditions,
                binding: &[],
                binding_failure: &[],
            })
            .collect(),
    }
}

pub fn claim_infos(
    claims: &[ResourceClaim],
    slices: &[ResourceSlice],
    policy: &PolicyConfig,
) -> Vec<ClaimInfo> {
    let mut infos = Vec::new();

    for claim in claims {
        if claim.status.reserved_for.is_empty() {
            continue;
        }

        let mut info = ClaimInfo {
            name: claim.metadata.name.clone(),
            namespace: claim.metadata.namespace.clone().unwrap_or_default(),
            created_at: claim.metadata.creation_timestamp,
            ..Default::default()
        };

        for raw in raw_devices(claim) {
            let found = slices.iter().find_map(|s| {
                (s.spec.driver == raw.driver && s.spec.pool.name == raw.pool)
                    .then(|| s.spec.devices.iter().find(|d| d.name == raw.device))
                    .flatten()
                    .map(|d| (s, d))
            });

            let mut model = String::new();
            if let Some((slice, device)) = found {
                if info.node_name.is_empty() {
                    info.node_name = slice.spec.node_name.clone();
                    info.slice_name = slice.metadata.name.clone();
                }
                model = resolve_model(policy, &slice.spec.driver, device)
                    .unwrap_or_default()
                    .to_string();
            }

            info.devices.push(ClaimDevice {
                name: raw.device.to_string(),
                driver: raw.driver.to_string(),
                pool: raw.pool.to_string(),
                model,
                state: classify_device_state(raw.conditions),
                binding_resolved: raw.binding.is_empty()
                    || has_matching_binding_condition(
                        raw.conditions,
                        raw.binding,
                        raw.binding_failure,
                    ),
            });
        }

        if info.node_name.is_empty() {
            if let Some(node) = claim
                .status
                .allocation
                .as_ref()
                .and_then(|a| a.node_selector.as_ref())
                .and_then(node_name_from_selector)
            {
                info.node_name = node.to_string();
            }
        }

        infos.push(info);
    }

    infos
}
