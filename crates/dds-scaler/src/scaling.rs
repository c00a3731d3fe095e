use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use dds_common::{
    ClaimInfo, ComposabilityRequest, ComposabilityRequestSpec, ComposableResource,
    DeviceCatalogEntry, NodeInfo, ObjectMeta, PolicyConfig, Resource, ScalarResourceDetails,
};
use dds_meta::ClusterApi;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::error::ScalerError;
use crate::metrics::SharedMetrics;
use crate::mutator::Mutator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    Create { size: i64 },
    Grow { from: i64, to: i64 },
    Shrink { from: i64, to: i64 },
    NoChange,
}

/// A non-trivial decision for one (node, model) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaleAction {
    pub node: String,
    pub model: String,
    pub request: String,
    pub decision: ScaleDecision,
    /// Shrink postponed by the no-removal grace period.
    pub deferred: bool,
}

pub fn decide(current: Option<i64>, configured: i64) -> ScaleDecision {
    match current {
        None if configured > 0 => ScaleDecision::Create { size: configured },
        None => ScaleDecision::NoChange,
        Some(from) if configured > from => ScaleDecision::Grow {
            from,
            to: configured,
        },
        Some(from) if configured < from => ScaleDecision::Shrink {
            from,
            to: configured,
        },
        Some(_) => ScaleDecision::NoChange,
    }
}

/// Distinct devices of `model` on `node` that still need capacity.
pub fn count_active_devices(claims: &[ClaimInfo], node: &str, model: &str) -> i64 {
    let devices: BTreeSet<(&str, &str, &str)> = claims
        .iter()
        .filter(|c| c.node_name == node)
        .flat_map(|c| c.devices.iter())
        .filter(|d| d.model == model && d.state.counts_toward_capacity())
        .map(|d| (d.driver.as_str(), d.pool.as_str(), d.name.as_str()))
        .collect();
    devices.len() as i64
}

/// Active count raised to the node's minimum for `model`.
pub fn target_count(node: &NodeInfo, model: &str, active: i64) -> i64 {
    active.max(node.min_devices(model))
}

/// Whether any device of `model` on `node` served a workload inside the
/// grace window.
pub fn removal_blocked(
    resources: &[ComposableResource],
    annotation: &str,
    model: &str,
    node: &str,
    now: DateTime<Utc>,
    grace: Duration,
) -> bool {
    let cutoff = now - grace;
    resources
        .iter()
        .filter(|r| r.targets(model, node))
        .filter_map(|r| r.metadata.annotations.get(annotation))
        .filter_map(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .any(|used| used.with_timezone(&Utc) > cutoff)
}

/// Deterministic request name for (entry, node): `<k8sDeviceName>-<node>`,
/// lowercased, anything but `[a-z0-9]` folded to `-`.
pub fn request_name(entry: &DeviceCatalogEntry, node: &str) -> String {
    format!("{}-{}", entry.k8s_device_name, node)
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect()
}

/// `base` with a short digest of the raw node name appended, for when the
/// folded name is held by another node's request.
pub fn suffixed_request_name(base: &str, node: &str) -> String {
    let digest = Sha256::digest(node.as_bytes());
    format!("{base}-{}", hex::encode(&digest[..4]))
}

/// Request `type` derived from the driver name.
pub fn driver_type(driver: &str) -> String {
    let label = driver.split('.').next().unwrap_or_default();
    if driver == "gpu.nvidia.com" || label.contains("gpu") {
        "gpu".to_string()
    } else {
        label.to_string()
    }
}

fn new_request(entry: &DeviceCatalogEntry, node: &str, size: i64) -> ComposabilityRequest {
    ComposabilityRequest {
        metadata: ObjectMeta::named(request_name(entry, node)),
        spec: ComposabilityRequestSpec {
            resource: ScalarResourceDetails {
                type_: driver_type(&entry.driver_name),
                model: entry.model_name.clone(),
                size,
                target_node: node.to_string(),
                force_detach: false,
            },
        },
        status: Default::default(),
    }
}

pub struct ScaleContext<'a> {
    pub policy: &'a PolicyConfig,
    pub metrics: &'a SharedMetrics,
    pub now: DateTime<Utc>,
    pub no_removal: Duration,
}

/// Bring every model's request on `node` in line with its remaining claims,
/// in catalog order.
pub async fn scale_node<C: ClusterApi>(
    cluster: &C,
    mutator: &Mutator<'_, C>,
    ctx: &ScaleContext<'_>,
    node: &NodeInfo,
    claims: &[ClaimInfo],
) -> Result<Vec<ScaleAction>, ScalerError> {
    let requests = cluster
        .list::<ComposabilityRequest>()
        .await
        .map_err(ScalerError::transport("list allocation requests"))?;
    let mut resources: Option<Vec<ComposableResource>> = None;
    let mut actions = Vec::new();

    for entry in &ctx.policy.devices {
        let model = entry.model_name.as_str();
        let active = count_active_devices(claims, &node.name, model);
        let configured = target_count(node, model, active);
        if let Some(max) = node.max_devices(model) {
            if configured > max {
                warn!(node=%node.name, model, configured, max, "device count above node maximum");
            }
        }

        let existing = requests.iter().find(|r| r.targets(model, &node.name));
        let decision = decide(existing.map(|r| r.spec.resource.size), configured);
        let request = existing
            .map(|r| r.name().to_string())
            .unwrap_or_else(|| request_name(entry, &node.name));
        let mut deferred = false;

        match decision {
            ScaleDecision::NoChange => continue,
            ScaleDecision::Create { size } => {
                mutator
                    .create_request(&new_request(entry, &node.name, size))
                    .await?;
                SharedMetrics::inc(&ctx.metrics.create_total);
            }
            ScaleDecision::Grow { from, to } => {
                info!(node=%node.name, model, from, to, "growing allocation request");
                if let Some(existing) = existing {
                    mutator.resize_request(&existing.key(), to).await?;
                }
                SharedMetrics::inc(&ctx.metrics.attach_total);
            }
            ScaleDecision::Shrink { from, to } => {
                if resources.is_none() {
                    resources = Some(
                        cluster
                            .list::<ComposableResource>()
                            .await
                            .map_err(ScalerError::transport("list provisioned devices"))?,
                    );
                }
                let blocked = removal_blocked(
                    resources.as_deref().unwrap_or_default(),
                    &ctx.policy.last_used_annotation(),
                    model,
                    &node.name,
                    ctx.now,
                    ctx.no_removal,
                );
                if blocked {
                    info!(node=%node.name, model, from, to, "device used within grace period, deferring shrink");
                    SharedMetrics::inc(&ctx.metrics.detach_deferred_total);
                    deferred = true;
                } else {
                    info!(node=%node.name, model, from, to, "shrinking allocation request");
                    if let Some(existing) = existing {
                        mutator.resize_request(&existing.key(), to).await?;
                    }
                    SharedMetrics::inc(&ctx.metrics.detach_total);
                }
            }
        }

        actions.push(ScaleAction {
            node: node.name.clone(),
            model: model.to_string(),
            request,
            decision,
            deferred,
        });
    }

    Ok(actions)
}
