use std::future::Future;

use chrono::{DateTime, Utc};
use dds_common::{
    AllocatedDeviceStatus, ComposabilityRequest, ComposableResource, Condition, ConditionStatus,
    Node, ObjectKey, Resource, ResourceClaim,
};
use dds_meta::{ClusterApi, Patch, StoreError};
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::error::ScalerError;
use crate::metrics::SharedMetrics;
use crate::scaling::suffixed_request_name;

/// Attempts per mutation, first try included.
pub const MAX_RETRIES: u32 = 2;

#[derive(Debug)]
pub enum RetryError<E> {
    /// Not retryable, returned as soon as it was seen.
    Fatal(E),
    /// Every attempt hit a retryable error.
    Exhausted { attempts: u32, last: E },
}

/// Run `op` until it succeeds, fails with an error `is_retryable` rejects, or
/// `max_attempts` attempts have been made. `op` receives the 1-based attempt
/// number and must re-read whatever it writes.
pub async fn retry_on_conflict<T, E, P, F, Fut>(
    max_attempts: u32,
    is_retryable: P,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) if !is_retryable(&e) => return Err(RetryError::Fatal(e)),
            Err(e) if attempt >= max_attempts => {
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: e,
                })
            }
            Err(e) => {
                warn!(attempt, error=%e, "write conflict, retrying");
                attempt += 1;
            }
        }
    }
}

enum Created {
    New(ComposabilityRequest),
    Taken(ComposabilityRequest),
}

pub struct Mutator<'a, C> {
    cluster: &'a C,
    max_attempts: u32,
    metrics: &'a SharedMetrics,
}

impl<'a, C: ClusterApi> Mutator<'a, C> {
    pub fn new(cluster: &'a C, max_attempts: u32, metrics: &'a SharedMetrics) -> Self {
        Self {
            cluster,
            max_attempts,
            metrics,
        }
    }

    fn note_attempt(&self, attempt: u32) {
        if attempt > 1 {
            SharedMetrics::inc(&self.metrics.conflict_retries_total);
        }
    }

    async fn with_retry<T, F, Fut>(&self, action: &str, mut op: F) -> Result<T, ScalerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        retry_on_conflict(self.max_attempts, StoreError::is_conflict, |attempt| {
            self.note_attempt(attempt);
            op()
        })
        .await
        .map_err(|e| ScalerError::from_retry(action, e))
    }

    /// Create `request`. If it already exists, its size is set instead.
    pub async fn create_request(
        &self,
        request: &ComposabilityRequest,
    ) -> Result<ComposabilityRequest, ScalerError> {
        let res = &request.spec.resource;
        info!(
            name=%request.metadata.name,
            node=%res.target_node,
            model=%res.model,
            size=res.size,
            "creating allocation request"
        );
        let taken = match self.try_create(request).await? {
            Created::New(req) => return Ok(req),
            Created::Taken(existing) if existing.targets(&res.model, &res.target_node) => {
                info!(name=%request.metadata.name, "allocation request already exists, patching size");
                return self.resize_request(&existing.key(), res.size).await;
            }
            Created::Taken(existing) => existing,
        };

        let mut renamed = request.clone();
        renamed.metadata.name = suffixed_request_name(&request.metadata.name, &res.target_node);
        warn!(
            name=%request.metadata.name,
            owner=%taken.spec.resource.target_node,
            renamed=%renamed.metadata.name,
            "request name held by another node, creating under a suffixed name"
        );
        match self.try_create(&renamed).await? {
            Created::New(req) => Ok(req),
            Created::Taken(existing) if existing.targets(&res.model, &res.target_node) => {
                self.resize_request(&existing.key(), res.size).await
            }
            Created::Taken(existing) => Err(ScalerError::Mutation {
                action: "create allocation request".to_string(),
                source: StoreError::AlreadyExists {
                    key: existing.key().to_string(),
                },
            }),
        }
    }

    /// Create `request`, or return the object already holding its name.
    async fn try_create(&self, request: &ComposabilityRequest) -> Result<Created, ScalerError> {
        let created = retry_on_conflict(self.max_attempts, StoreError::is_conflict, |attempt| {
            self.note_attempt(attempt);
            self.cluster.create(request)
        })
        .await;

        match created {
            Ok(req) => Ok(Created::New(req)),
            Err(RetryError::Fatal(StoreError::AlreadyExists { key })) => self
                .cluster
                .get::<ComposabilityRequest>(&request.key())
                .await
                .map_err(|source| ScalerError::Mutation {
                    action: "read existing allocation request".to_string(),
                    source,
                })?
                .map(Created::Taken)
                .ok_or_else(|| ScalerError::Mutation {
                    action: "read existing allocation request".to_string(),
                    source: StoreError::NotFound { key },
                }),
            Err(e) => Err(ScalerError::from_retry("create allocation request", e)),
        }
    }

    /// Set `spec.resource.size` of an existing request.
    pub async fn resize_request(
        &self,
        key: &ObjectKey,
        size: i64,
    ) -> Result<ComposabilityRequest, ScalerError> {
        info!(name=%key, size, "patching allocation request size");
        self.with_retry("patch allocation request size", || async move {
            let current = self
                .cluster
                .get::<ComposabilityRequest>(key)
                .await?
                .ok_or_else(|| StoreError::NotFound {
                    key: key.to_string(),
                })?;
            if current.spec.resource.size == size {
                return Ok(current);
            }
            self.cluster
                .patch::<ComposabilityRequest>(
                    key,
                    &Patch::replace("/spec/resource/size", size),
                    current.metadata.resource_version,
                )
                .await
        })
        .await
    }

    /// Set one annotation. Returns false when it already had `value`.
    pub async fn annotate_resource(
        &self,
        key: &ObjectKey,
        annotation: &str,
        value: &str,
    ) -> Result<bool, ScalerError> {
        info!(name=%key, key=annotation, value, "patching provisioned device annotation");
        self.with_retry("patch provisioned device annotation", || async move {
            let current = self
                .cluster
                .get::<ComposableResource>(key)
                .await?
                .ok_or_else(|| StoreError::NotFound {
                    key: key.to_string(),
                })?;
            if current.metadata.annotations.get(annotation).map(String::as_str) == Some(value) {
                return Ok(false);
            }
            let patch = Patch::Merge(json!({"metadata": {"annotations": {annotation: value}}}));
            self.cluster
                .patch::<ComposableResource>(key, &patch, current.metadata.resource_version)
                .await?;
            Ok::<_, StoreError>(true)
        })
        .await
    }

    /// Add `add` as `"true"` and delete `remove` in one patch. Returns false
    /// when the node already matched.
    pub async fn patch_node_labels(
        &self,
        node: &str,
        add: &[String],
        remove: &[String],
    ) -> Result<bool, ScalerError> {
        let key = ObjectKey::cluster(node);
        let key = &key;
        self.with_retry("patch node labels", || async move {
            let current = self
                .cluster
                .get::<Node>(key)
                .await?
                .ok_or_else(|| StoreError::NotFound {
                    key: key.to_string(),
                })?;
            let labels = &current.metadata.labels;
            let in_sync = add
                .iter()
                .all(|l| labels.get(l).map(String::as_str) == Some("true"))
                && remove.iter().all(|l| !labels.contains_key(l));
            if in_sync {
                return Ok(false);
            }

            let mut delta = Map::new();
            for label in add {
                delta.insert(label.clone(), Value::from("true"));
            }
            for label in remove {
                delta.insert(label.clone(), Value::Null);
            }
            info!(%node, add=?add, remove=?remove, "patching node labels");
            let patch = Patch::Merge(json!({"metadata": {"labels": Value::Object(delta)}}));
            self.cluster
                .patch::<Node>(key, &patch, current.metadata.resource_version)
                .await?;
            Ok::<_, StoreError>(true)
        })
        .await
    }

    /// Set condition `condition_type` to True on every device of the claim.
    pub async fn signal_reschedule(
        &self,
        key: &ObjectKey,
        condition_type: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, ScalerError> {
        info!(claim=%key, condition=condition_type, "patching claim device conditions");
        self.with_retry("patch claim device conditions", || async move {
            let current = self
                .cluster
                .get::<ResourceClaim>(key)
                .await?
                .ok_or_else(|| StoreError::NotFound {
                    key: key.to_string(),
                })?;

            let devices = with_condition(&current, condition_type, now);
            if devices == current.status.devices {
                return Ok(false);
            }
            let devices = serde_json::to_value(&devices).map_err(|source| StoreError::Codec {
                key: key.to_string(),
                source,
            })?;
            let patch = Patch::Merge(json!({"status": {"devices": devices}}));
            self.cluster
                .patch::<ResourceClaim>(key, &patch, current.metadata.resource_version)
                .await?;
            Ok::<_, StoreError>(true)
        })
        .await
    }
}

/// Device status list with `condition_type=True` on every allocated device.
/// Devices allocated but not yet reporting status get an entry.
fn with_condition(
    claim: &ResourceClaim,
    condition_type: &str,
    now: DateTime<Utc>,
) -> Vec<AllocatedDeviceStatus> {
    let mut devices = claim.status.devices.clone();
    if let Some(allocation) = &claim.status.allocation {
        for result in &allocation.results {
            let known = devices.iter().any(|d| {
                d.driver == result.driver && d.pool == result.pool && d.device == result.device
            });
            if !known {
                devices.push(AllocatedDeviceStatus {
                    driver: result.driver.clone(),
                    pool: result.pool.clone(),
                    device: result.device.clone(),
                    conditions: Vec::new(),
                });
            }
        }
    }

    for device in &mut devices {
        let mut condition = Condition::new(condition_type, ConditionStatus::True);
        condition.last_transition_time = Some(now);
        match device
            .conditions
            .iter_mut()
            .find(|c| c.type_ == condition_type)
        {
            Some(existing) if existing.is_true() => {}
            Some(existing) => *existing = condition,
            None => device.conditions.push(condition),
        }
    }
    devices
}
