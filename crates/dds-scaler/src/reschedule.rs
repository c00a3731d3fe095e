use chrono::{DateTime, Duration, Utc};
use dds_common::{ClaimInfo, DeviceState, ObjectKey};
use dds_meta::ClusterApi;
use tracing::info;

use crate::error::ScalerError;
use crate::metrics::SharedMetrics;
use crate::mutator::Mutator;

/// Claim device condition set by the provisioner when attaching failed.
pub const FAILED_CONDITION: &str = "FabricDeviceFailed";
/// Claim device condition asking the scheduler to place the workload again.
pub const RESCHEDULE_CONDITION: &str = "FabricDeviceReschedule";

/// Result of one pass: claims still counted for scaling, and claims a
/// reschedule signal was written to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pass {
    pub remaining: Vec<ClaimInfo>,
    pub signalled: Vec<ObjectKey>,
}

fn claim_key(claim: &ClaimInfo) -> ObjectKey {
    ObjectKey::namespaced(claim.namespace.clone(), claim.name.clone())
}

/// Returns false when the claim already carried the signal.
async fn signal<C: ClusterApi>(
    mutator: &Mutator<'_, C>,
    metrics: &SharedMetrics,
    key: &ObjectKey,
    now: DateTime<Utc>,
) -> Result<bool, ScalerError> {
    let written = mutator
        .signal_reschedule(key, RESCHEDULE_CONDITION, now)
        .await?;
    if written {
        SharedMetrics::inc(&metrics.reschedule_total);
    }
    Ok(written)
}

/// Drop claims with a failed device and signal them. Claims already waiting
/// on a reschedule are dropped without a new signal.
pub async fn reschedule_failed<C: ClusterApi>(
    mutator: &Mutator<'_, C>,
    metrics: &SharedMetrics,
    claims: &[ClaimInfo],
    now: DateTime<Utc>,
) -> Result<Pass, ScalerError> {
    let mut pass = Pass::default();
    for claim in claims {
        if claim.has_device_in(DeviceState::Failed) {
            let key = claim_key(claim);
            info!(claim=%key, node=%claim.node_name, "claim has a failed device, rescheduling");
            if signal(mutator, metrics, &key, now).await? {
                pass.signalled.push(key);
            }
        } else if !claim.has_device_in(DeviceState::Reschedule) {
            pass.remaining.push(claim.clone());
        }
    }
    Ok(pass)
}

/// Drop claims whose binding has been pending longer than `timeout` and
/// signal them.
pub async fn reschedule_timed_out<C: ClusterApi>(
    mutator: &Mutator<'_, C>,
    metrics: &SharedMetrics,
    claims: &[ClaimInfo],
    now: DateTime<Utc>,
    timeout: Duration,
) -> Result<Pass, ScalerError> {
    let mut pass = Pass::default();
    for claim in claims {
        if is_timed_out(claim, now, timeout) {
            let key = claim_key(claim);
            info!(claim=%key, node=%claim.node_name, "claim allocation timed out, rescheduling");
            if signal(mutator, metrics, &key, now).await? {
                pass.signalled.push(key);
            }
        } else {
            pass.remaining.push(claim.clone());
        }
    }
    Ok(pass)
}

pub fn is_timed_out(claim: &ClaimInfo, now: DateTime<Utc>, timeout: Duration) -> bool {
    let Some(created) = claim.created_at else {
        return false;
    };
    now - created > timeout && claim.devices.iter().any(|d| !d.binding_resolved)
}
