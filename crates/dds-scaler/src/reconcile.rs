use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dds_common::{ObjectKey, ResourceClaim, ResourceSlice};
use dds_meta::{ClusterApi, WatchEvent, WatchStream};
use futures_util::{FutureExt, StreamExt};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::collector::collect;
use crate::error::ScalerError;
use crate::labels::reconcile_labels;
use crate::metrics::SharedMetrics;
use crate::mutator::{Mutator, MAX_RETRIES};
use crate::reschedule::{reschedule_failed, reschedule_timed_out};
use crate::scaling::{scale_node, ScaleAction, ScaleContext, ScaleDecision};
use crate::usage::stamp_last_used;

#[derive(Debug, Clone)]
pub struct ReconcileSettings {
    /// Grace period after last use before a device may be removed.
    pub device_no_removal: chrono::Duration,
    /// How long a claim may wait for binding before it is rescheduled.
    pub device_no_allocation: chrono::Duration,
    /// Config map holding the policy.
    pub policy_source: ObjectKey,
    pub max_attempts: u32,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            device_no_removal: chrono::Duration::seconds(600),
            device_no_allocation: chrono::Duration::seconds(600),
            policy_source: ObjectKey::namespaced("composable-dra", "composable-dra-dds"),
            max_attempts: MAX_RETRIES,
        }
    }
}

/// What one cycle changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub actions: Vec<ScaleAction>,
    pub rescheduled: Vec<ObjectKey>,
    pub stamped: Vec<ObjectKey>,
    /// Nodes whose labels were patched.
    pub labelled: Vec<String>,
}

impl CycleReport {
    fn count(&self, pred: impl Fn(&ScaleAction) -> bool) -> usize {
        self.actions.iter().filter(|a| pred(a)).count()
    }

    pub fn creates(&self) -> usize {
        self.count(|a| matches!(a.decision, ScaleDecision::Create { .. }))
    }

    pub fn grows(&self) -> usize {
        self.count(|a| matches!(a.decision, ScaleDecision::Grow { .. }))
    }

    pub fn shrinks(&self) -> usize {
        self.count(|a| matches!(a.decision, ScaleDecision::Shrink { .. }) && !a.deferred)
    }

    pub fn deferred(&self) -> usize {
        self.count(|a| a.deferred)
    }

    /// True when the cycle wrote nothing.
    pub fn is_quiet(&self) -> bool {
        self.creates() + self.grows() + self.shrinks() == 0
            && self.rescheduled.is_empty()
            && self.stamped.is_empty()
            && self.labelled.is_empty()
    }
}

pub struct Reconciler<C> {
    cluster: C,
    settings: ReconcileSettings,
    metrics: Arc<SharedMetrics>,
}

impl<C: ClusterApi> Reconciler<C> {
    pub fn new(cluster: C, settings: ReconcileSettings, metrics: Arc<SharedMetrics>) -> Self {
        Self {
            cluster,
            settings,
            metrics,
        }
    }

    pub fn cluster(&self) -> &C {
        &self.cluster
    }

    /// One full pass over the cluster. Stops at the first error; nodes
    /// already handled keep their changes.
    pub async fn reconcile_once(&self, now: DateTime<Utc>) -> Result<CycleReport, ScalerError> {
        let snapshot = collect(&self.cluster, &self.settings.policy_source).await?;
        let policy = &snapshot.policy;
        debug!(fabric_id_range=?policy.fabric_id_range, devices=policy.devices.len(), "policy loaded");

        let mutator = Mutator::new(&self.cluster, self.settings.max_attempts, &self.metrics);
        let mut report = CycleReport {
            stamped: stamp_last_used(
                &self.cluster,
                &mutator,
                &snapshot.claim_objects,
                &snapshot.slices,
                policy,
                now,
            )
            .await?,
            ..Default::default()
        };

        let ctx = ScaleContext {
            policy,
            metrics: &self.metrics,
            now,
            no_removal: self.settings.device_no_removal,
        };

        for node in &snapshot.nodes {
            let claims: Vec<_> = snapshot
                .claims
                .iter()
                .filter(|c| c.node_name == node.name)
                .cloned()
                .collect();

            let failed = reschedule_failed(&mutator, &self.metrics, &claims, now).await?;
            let pending = reschedule_timed_out(
                &mutator,
                &self.metrics,
                &failed.remaining,
                now,
                self.settings.device_no_allocation,
            )
            .await?;
            report.rescheduled.extend(failed.signalled);
            report.rescheduled.extend(pending.signalled);

            let actions = scale_node(&self.cluster, &mutator, &ctx, node, &pending.remaining).await?;
            report.actions.extend(actions);

            if reconcile_labels(&self.cluster, &mutator, &self.metrics, policy, &node.name).await? {
                report.labelled.push(node.name.clone());
            }
        }

        Ok(report)
    }

    async fn run_cycle(&self) {
        SharedMetrics::inc(&self.metrics.reconcile_total);
        match self.reconcile_once(Utc::now()).await {
            Ok(report) => info!(
                creates = report.creates(),
                grows = report.grows(),
                shrinks = report.shrinks(),
                deferred = report.deferred(),
                rescheduled = report.rescheduled.len(),
                labelled = report.labelled.len(),
                "reconcile cycle finished"
            ),
            Err(e) => {
                SharedMetrics::inc(&self.metrics.reconcile_errors);
                warn!(error=%e, kind=?e.kind(), "reconcile cycle failed");
            }
        }
    }

    async fn open_triggers(&self) -> Option<Triggers> {
        let claims = self.cluster.watch::<ResourceClaim>().await;
        let slices = self.cluster.watch::<ResourceSlice>().await;
        match (claims, slices) {
            (Ok(claims), Ok(slices)) => Some(Triggers { claims, slices }),
            (Err(e), _) | (_, Err(e)) => {
                warn!(error=%e, "failed to watch claims and slices, running on timer only");
                None
            }
        }
    }

    /// Run a cycle at startup, then on every tick of `interval` and on claim
    /// or slice changes. Changes arriving within `debounce` of each other
    /// share one cycle. Never returns.
    pub async fn run(&self, interval: Duration, debounce: Duration) {
        info!(interval_secs = interval.as_secs(), "reconcile loop started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut triggers = self.open_triggers().await;

        loop {
            tokio::select! {
                biased;
                _ = ticker.tick() => {}
                event = next_event(&mut triggers) => match event {
                    Some(event) => {
                        debug!(key=%event.key, revision=event.revision, "change event");
                        tokio::time::sleep(debounce).await;
                        drain(&mut triggers);
                        ticker.reset();
                    }
                    None => {
                        warn!("watch stream ended, running on timer only");
                        triggers = None;
                        continue;
                    }
                },
            }

            self.run_cycle().await;

            if triggers.is_none() {
                triggers = self.open_triggers().await;
            }
        }
    }
}

/// Claim and slice watches. Losing either one drops both, so they are
/// reopened together.
struct Triggers {
    claims: WatchStream,
    slices: WatchStream,
}

/// Next change event. `None` once either watch has ended; pending forever
/// without watches.
async fn next_event(triggers: &mut Option<Triggers>) -> Option<WatchEvent> {
    match triggers {
        Some(t) => tokio::select! {
            event = t.claims.next() => event,
            event = t.slices.next() => event,
        },
        None => std::future::pending().await,
    }
}

/// Discard events that are already buffered. Drops the watches if one of
/// them ended meanwhile.
fn drain(triggers: &mut Option<Triggers>) {
    let Some(t) = triggers else {
        return;
    };
    if drain_stream(&mut t.claims) || drain_stream(&mut t.slices) {
        warn!("watch stream ended, running on timer only");
        *triggers = None;
    }
}

/// True when the stream has ended.
fn drain_stream(stream: &mut WatchStream) -> bool {
    loop {
        match stream.next().now_or_never() {
            Some(Some(_)) => continue,
            Some(None) => return true,
            None => return false,
        }
    }
}
