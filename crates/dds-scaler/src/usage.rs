use chrono::{DateTime, SecondsFormat, Utc};
use dds_common::{
    ComposableResource, ObjectKey, Pod, PodPhase, PolicyConfig, ResourceClaim, Resource,
    SliceDevice, SliceInfo,
};
use dds_meta::ClusterApi;
use tracing::debug;

use crate::error::ScalerError;
use crate::mutator::Mutator;

/// Slice and device entry for a physical device that the driver reports red.
pub fn find_degraded<'s>(
    device_id: &str,
    slices: &'s [SliceInfo],
) -> Option<(&'s SliceInfo, &'s SliceDevice)> {
    if device_id.is_empty() {
        return None;
    }
    slices.iter().find_map(|slice| {
        slice
            .devices
            .iter()
            .find(|d| d.uuid == device_id && d.degraded)
            .map(|d| (slice, d))
    })
}

/// Whether a reserved claim holds `device` and reserves a running pod.
pub async fn is_device_used<C: ClusterApi>(
    cluster: &C,
    claims: &[ResourceClaim],
    slice: &SliceInfo,
    device: &str,
) -> Result<bool, ScalerError> {
    for claim in claims {
        let holds_device = claim.status.allocation.as_ref().is_some_and(|a| {
            a.results
                .iter()
                .any(|r| r.driver == slice.driver && r.pool == slice.pool && r.device == device)
        });
        if !holds_device {
            continue;
        }

        let namespace = claim.metadata.namespace.clone().unwrap_or_default();
        for consumer in &claim.status.reserved_for {
            if !consumer.resource.is_empty() && consumer.resource != "pods" {
                continue;
            }
            let key = ObjectKey::namespaced(namespace.clone(), consumer.name.clone());
            let pod = cluster
                .get::<Pod>(&key)
                .await
                .map_err(ScalerError::transport("get pod"))?;
            if pod.is_some_and(|p| p.status.phase == PodPhase::Running) {
                return Ok(true);
            }
        }
    }
    Ok(false)
}

/// Stamp `<prefix>/last-used-time` on every online device that is red and
/// still in use. Returns the resources written.
pub async fn stamp_last_used<C: ClusterApi>(
    cluster: &C,
    mutator: &Mutator<'_, C>,
    claims: &[ResourceClaim],
    slices: &[SliceInfo],
    policy: &PolicyConfig,
    now: DateTime<Utc>,
) -> Result<Vec<ObjectKey>, ScalerError> {
    let resources = cluster
        .list::<ComposableResource>()
        .await
        .map_err(ScalerError::transport("list provisioned devices"))?;
    let annotation = policy.last_used_annotation();
    let stamp = now.to_rfc3339_opts(SecondsFormat::Secs, true);

    let mut stamped = Vec::new();
    for resource in resources.iter().filter(|r| r.is_online()) {
        let Some((slice, device)) = find_degraded(&resource.status.device_id, slices) else {
            continue;
        };
        if !is_device_used(cluster, claims, slice, &device.name).await? {
            continue;
        }
        debug!(resource=%resource.name(), device=%device.name, "degraded device still in use");
        let key = resource.key();
        if mutator.annotate_resource(&key, &annotation, &stamp).await? {
            stamped.push(key);
        }
    }
    Ok(stamped)
}
