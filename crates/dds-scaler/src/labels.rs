use std::collections::BTreeSet;

use dds_common::{ComposabilityRequest, ComposableResource, PolicyConfig};
use dds_meta::ClusterApi;

use crate::error::ScalerError;
use crate::metrics::SharedMetrics;
use crate::mutator::Mutator;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelDelta {
    pub add: Vec<String>,
    pub remove: Vec<String>,
}

/// Models with a non-zero request or an online device on `node`.
pub fn installed_models(
    node: &str,
    requests: &[ComposabilityRequest],
    resources: &[ComposableResource],
) -> BTreeSet<String> {
    let requested = requests
        .iter()
        .filter(|r| r.spec.resource.target_node == node && r.spec.resource.size > 0)
        .map(|r| r.spec.resource.model.clone());
    let online = resources
        .iter()
        .filter(|r| r.spec.target_node == node && r.is_online())
        .map(|r| r.spec.model.clone());
    requested.chain(online).collect()
}

/// Capability labels to set and clear given what is installed.
pub fn capability_labels(policy: &PolicyConfig, installed: &BTreeSet<String>) -> LabelDelta {
    let excluded: BTreeSet<i32> = policy
        .devices
        .iter()
        .filter(|d| installed.contains(&d.model_name))
        .flat_map(|d| d.cannot_coexist_with.iter().copied())
        .collect();

    let mut delta = LabelDelta::default();
    for entry in &policy.devices {
        let label = policy.capability_label(entry);
        if excluded.contains(&entry.index) {
            delta.remove.push(label);
        } else {
            delta.add.push(label);
        }
    }
    delta
}

/// Re-derive and apply the capability labels of `node`. Returns whether the
/// node was patched.
pub async fn reconcile_labels<C: ClusterApi>(
    cluster: &C,
    mutator: &Mutator<'_, C>,
    metrics: &SharedMetrics,
    policy: &PolicyConfig,
    node: &str,
) -> Result<bool, ScalerError> {
    let requests = cluster
        .list::<ComposabilityRequest>()
        .await
        .map_err(ScalerError::transport("list allocation requests"))?;
    let resources = cluster
        .list::<ComposableResource>()
        .await
        .map_err(ScalerError::transport("list provisioned devices"))?;

    let delta = capability_labels(policy, &installed_models(node, &requests, &resources));
    let patched = mutator
        .patch_node_labels(node, &delta.add, &delta.remove)
        .await?;
    if patched {
        SharedMetrics::inc(&metrics.label_patches_total);
    }
    Ok(patched)
}
