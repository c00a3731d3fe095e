use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dds_common::{
    AllocatedDeviceStatus, AllocationResult, BasicDevice, ComposabilityRequest,
    ComposabilityRequestSpec, ComposableResource, Condition, ConditionStatus, ConfigMap,
    ConsumerReference, Device, DeviceAttribute, DeviceRequestAllocationResult, Node, ObjectKey,
    ObjectMeta, Pod, PodPhase, Resource, ResourceClaim, ResourcePool, ResourceSlice, ResourceSliceSpec,
    ScalarResourceDetails,
};
use dds_meta::{
    ClusterApi, MemoryMetaStore, MetaStore, StoreCluster, StoreError, StoreResult, WatchStream,
};
use dds_scaler::reschedule::{FAILED_CONDITION, RESCHEDULE_CONDITION};
use dds_scaler::{ErrorKind, ReconcileSettings, Reconciler, SharedMetrics};

const PREFIX: &str = "composable.fsastech.com";
const A100_40: &str = "A100 40G";
const A100_80: &str = "A100 80G";

const DEVICE_INFO: &str = r#"
- index: 1
  cdi-model-name: A100 40G
  dra-attributes:
    productName: NVIDIA A100 40GB PCIe
  label-key-model: composable-a100-40G
  driver-name: gpu.nvidia.com
  k8s-device-name: nvidia-a100-40
  cannot-coexist-with: [2]
- index: 2
  cdi-model-name: A100 80G
  dra-attributes:
    productName: NVIDIA A100 80GB PCIe
  label-key-model: composable-a100-80G
  driver-name: gpu.nvidia.com
  k8s-device-name: nvidia-a100-80
  cannot-coexist-with: [1]
"#;

/// Store that fails compare-and-swap on keys under `prefix` while armed.
#[derive(Clone)]
struct ConflictingStore {
    inner: MemoryMetaStore,
    prefix: &'static str,
    remaining: Arc<AtomicU32>,
}

impl ConflictingStore {
    fn arm(&self, conflicts: u32) {
        self.remaining.store(conflicts, Ordering::SeqCst);
    }
}

#[async_trait]
impl MetaStore for ConflictingStore {
    async fn get(&self, key: &str) -> StoreResult<Option<(Vec<u8>, u64)>> {
        self.inner.get(key).await
    }

    async fn list_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>, u64)>> {
        self.inner.list_prefix(prefix).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_revision: u64,
        value: Vec<u8>,
    ) -> StoreResult<u64> {
        let armed = key.starts_with(self.prefix)
            && self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if armed {
            return Err(StoreError::Conflict {
                key: key.to_string(),
                expected: expected_revision,
                actual: expected_revision + 1,
            });
        }
        self.inner.compare_and_swap(key, expected_revision, value).await
    }

    async fn watch_prefix(&self, prefix: &str) -> StoreResult<WatchStream> {
        self.inner.watch_prefix(prefix).await
    }
}

struct Fixture<S: MetaStore> {
    reconciler: Reconciler<StoreCluster<S>>,
    metrics: Arc<SharedMetrics>,
    now: DateTime<Utc>,
}

async fn fixture_on<S: MetaStore>(store: S) -> Fixture<S> {
    let cluster = StoreCluster::new(store);
    let mut data = BTreeMap::new();
    data.insert("device-info".to_string(), DEVICE_INFO.to_string());
    data.insert("label-prefix".to_string(), PREFIX.to_string());
    data.insert("fabric-id-range".to_string(), "[1, 2]".to_string());
    cluster
        .create(&ConfigMap {
            metadata: ObjectMeta::namespaced("composable-dra", "composable-dra-dds"),
            data,
        })
        .await
        .unwrap();

    let metrics = Arc::new(SharedMetrics::default());
    Fixture {
        reconciler: Reconciler::new(cluster, ReconcileSettings::default(), metrics.clone()),
        metrics,
        now: Utc::now(),
    }
}

async fn fixture() -> Fixture<MemoryMetaStore> {
    fixture_on(MemoryMetaStore::new()).await
}

impl<S: MetaStore> Fixture<S> {
    fn cluster(&self) -> &StoreCluster<S> {
        self.reconciler.cluster()
    }

    async fn node(&self, name: &str, labels: &[(&str, &str)]) {
        let mut meta = ObjectMeta::named(name);
        meta.labels = labels
            .iter()
            .map(|(k, v)| (format!("{PREFIX}/{k}"), v.to_string()))
            .collect();
        self.cluster().create(&Node { metadata: meta }).await.unwrap();
    }

    async fn node_labels(&self, name: &str) -> BTreeMap<String, String> {
        self.cluster()
            .get::<Node>(&ObjectKey::cluster(name))
            .await
            .unwrap()
            .unwrap()
            .metadata
            .labels
    }

    /// Slice on `node` with `count` A100 80G devices `gpu-0..`. Devices in
    /// `red` report a red status.
    async fn slice(&self, node: &str, count: usize, red: &[usize]) {
        let devices = (0..count)
            .map(|i| Device {
                name: format!("gpu-{i}"),
                basic: Some(BasicDevice {
                    attributes: BTreeMap::from([
                        (
                            "productName".to_string(),
                            DeviceAttribute::string("NVIDIA A100 80GB PCIe"),
                        ),
                        (
                            "uuid".to_string(),
                            DeviceAttribute::string(format!("GPU-{node}-{i}")),
                        ),
                        (
                            "status".to_string(),
                            DeviceAttribute::string(if red.contains(&i) { "red" } else { "green" }),
                        ),
                    ]),
                }),
            })
            .collect();
        let slice = ResourceSlice {
            metadata: ObjectMeta::named(format!("{node}-gpu.nvidia.com")),
            spec: ResourceSliceSpec {
                driver: "gpu.nvidia.com".into(),
                node_name: node.into(),
                pool: ResourcePool {
                    name: node.into(),
                    generation: 1,
                },
                devices,
            },
        };
        self.cluster().create(&slice).await.unwrap();
    }

    /// Reserved claim holding `devices` from `node`'s pool.
    async fn claim(
        &self,
        name: &str,
        node: &str,
        devices: &[&str],
        conditions: Vec<Condition>,
        binding: &[&str],
        created_at: DateTime<Utc>,
    ) -> ObjectKey {
        let mut meta = ObjectMeta::namespaced("default", name);
        meta.creation_timestamp = Some(created_at);
        let mut claim = ResourceClaim {
            metadata: meta,
            ..Default::default()
        };
        claim.status.reserved_for = vec![ConsumerReference {
            resource: "pods".into(),
            name: format!("{name}-pod"),
            uid: format!("{name}-uid"),
        }];
        claim.status.allocation = Some(AllocationResult {
            results: devices
                .iter()
                .map(|d| DeviceRequestAllocationResult {
                    request: "gpu".into(),
                    driver: "gpu.nvidia.com".into(),
                    pool: node.into(),
                    device: d.to_string(),
                    binding_conditions: binding.iter().map(|b| b.to_string()).collect(),
                    binding_failure_conditions: vec![],
                })
                .collect(),
            node_selector: None,
        });
        if !conditions.is_empty() {
            claim.status.devices = devices
                .iter()
                .map(|d| AllocatedDeviceStatus {
                    driver: "gpu.nvidia.com".into(),
                    pool: node.into(),
                    device: d.to_string(),
                    conditions: conditions.clone(),
                })
                .collect();
        }
        self.cluster().create(&claim).await.unwrap().key()
    }

    async fn running_pod(&self, name: &str) {
        let mut pod = Pod {
            metadata: ObjectMeta::namespaced("default", name),
            ..Default::default()
        };
        pod.status.phase = PodPhase::Running;
        self.cluster().create(&pod).await.unwrap();
    }

    async fn request(&self, model: &str, node: &str, size: i64) {
        let req = ComposabilityRequest {
            metadata: ObjectMeta::named(format!("existing-{node}")),
            spec: ComposabilityRequestSpec {
                resource: ScalarResourceDetails {
                    type_: "gpu".into(),
                    model: model.into(),
                    size,
                    target_node: node.into(),
                    force_detach: false,
                },
            },
            status: Default::default(),
        };
        self.cluster().create(&req).await.unwrap();
    }

    async fn resource(&self, name: &str, node: &str, device_id: &str, last_used: Option<DateTime<Utc>>) {
        let mut res = ComposableResource {
            metadata: ObjectMeta::named(name),
            ..Default::default()
        };
        res.spec.type_ = "gpu".into();
        res.spec.model = A100_80.into();
        res.spec.target_node = node.into();
        res.status.state = "Online".into();
        res.status.device_id = device_id.into();
        if let Some(t) = last_used {
            res.metadata
                .annotations
                .insert(format!("{PREFIX}/last-used-time"), t.to_rfc3339());
        }
        self.cluster().create(&res).await.unwrap();
    }

    async fn request_size(&self, model: &str, node: &str) -> Option<i64> {
        self.cluster()
            .list::<ComposabilityRequest>()
            .await
            .unwrap()
            .into_iter()
            .find(|r| r.targets(model, node))
            .map(|r| r.spec.resource.size)
    }
}

fn condition(kind: &str) -> Condition {
    Condition::new(kind, ConditionStatus::True)
}

#[tokio::test]
async fn scenario_a_minimum_creates_request() {
    let f = fixture().await;
    f.node(
        "node1",
        &[("nvidia-a100-80-size-min", "2"), ("nvidia-a100-80-size-max", "6")],
    )
    .await;

    let report = f.reconciler.reconcile_once(f.now).await.unwrap();

    assert_eq!(report.creates(), 1);
    let created = f
        .cluster()
        .get::<ComposabilityRequest>(&ObjectKey::cluster("nvidia-a100-80-node1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(created.spec.resource.size, 2);
    assert_eq!(created.spec.resource.type_, "gpu");
    assert_eq!(created.spec.resource.target_node, "node1");
    assert_eq!(f.request_size(A100_40, "node1").await, None);
    assert_eq!(f.metrics.create_total.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn scenario_b_more_claims_grow_request() {
    let f = fixture().await;
    f.node("node1", &[]).await;
    f.slice("node1", 5, &[]).await;
    f.request(A100_80, "node1", 3).await;
    f.claim("train", "node1", &["gpu-0", "gpu-1", "gpu-2"], vec![], &[], f.now)
        .await;
    f.claim("infer", "node1", &["gpu-3", "gpu-4"], vec![], &[], f.now)
        .await;

    let report = f.reconciler.reconcile_once(f.now).await.unwrap();

    assert_eq!(report.grows(), 1);
    assert_eq!(f.request_size(A100_80, "node1").await, Some(5));
    assert_eq!(f.metrics.attach_total.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn scenario_c_recent_use_defers_shrink() {
    let f = fixture().await;
    f.node("node1", &[]).await;
    f.slice("node1", 5, &[]).await;
    f.request(A100_80, "node1", 5).await;
    f.claim("infer", "node1", &["gpu-0", "gpu-1"], vec![], &[], f.now)
        .await;
    f.resource("gpu-res-4", "node1", "GPU-node1-4", Some(f.now - Duration::seconds(60)))
        .await;

    let report = f.reconciler.reconcile_once(f.now).await.unwrap();

    assert_eq!(report.deferred(), 1);
    assert_eq!(report.shrinks(), 0);
    assert_eq!(f.request_size(A100_80, "node1").await, Some(5));
    assert_eq!(f.metrics.detach_deferred_total.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn shrink_proceeds_once_grace_period_passed() {
    let f = fixture().await;
    f.node("node1", &[]).await;
    f.slice("node1", 5, &[]).await;
    f.request(A100_80, "node1", 5).await;
    f.claim("infer", "node1", &["gpu-0", "gpu-1"], vec![], &[], f.now)
        .await;
    f.resource("gpu-res-4", "node1", "GPU-node1-4", Some(f.now - Duration::seconds(3600)))
        .await;

    let report = f.reconciler.reconcile_once(f.now).await.unwrap();

    assert_eq!(report.shrinks(), 1);
    assert_eq!(f.request_size(A100_80, "node1").await, Some(2));
    assert_eq!(f.metrics.detach_total.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn scenario_d_unknown_device_label_fails_collection() {
    let f = fixture().await;
    f.node("node1", &[("nvidia-a100-80-size-min", "2")]).await;
    f.node("node2", &[("nvidia-h200-size-min", "1")]).await;

    let err = f.reconciler.reconcile_once(f.now).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert_eq!(err.to_string(), "unknown device name: nvidia-h200");
    assert_eq!(f.request_size(A100_80, "node1").await, None);
    assert_eq!(f.node_labels("node1").await.len(), 1);
}

#[tokio::test]
async fn scenario_e_failed_device_is_rescheduled_and_not_counted() {
    let f = fixture().await;
    f.node("node1", &[]).await;
    f.slice("node1", 2, &[]).await;
    let key = f
        .claim(
            "broken",
            "node1",
            &["gpu-0"],
            vec![condition(FAILED_CONDITION)],
            &[],
            f.now,
        )
        .await;

    let report = f.reconciler.reconcile_once(f.now).await.unwrap();

    assert_eq!(report.rescheduled, vec![key.clone()]);
    assert_eq!(f.request_size(A100_80, "node1").await, None);

    let claim = f
        .cluster()
        .get::<ResourceClaim>(&key)
        .await
        .unwrap()
        .unwrap();
    let conditions = &claim.status.devices[0].conditions;
    assert!(conditions
        .iter()
        .any(|c| c.type_ == RESCHEDULE_CONDITION && c.is_true()));
    assert_eq!(f.metrics.reschedule_total.load(Ordering::Relaxed), 1);

    let again = f.reconciler.reconcile_once(f.now).await.unwrap();
    assert!(again.rescheduled.is_empty());
    assert_eq!(f.metrics.reschedule_total.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn already_rescheduled_claim_is_dropped_silently() {
    let f = fixture().await;
    f.node("node1", &[]).await;
    f.slice("node1", 2, &[]).await;
    f.claim(
        "moving",
        "node1",
        &["gpu-0"],
        vec![condition(RESCHEDULE_CONDITION)],
        &[],
        f.now,
    )
    .await;

    let report = f.reconciler.reconcile_once(f.now).await.unwrap();

    assert!(report.rescheduled.is_empty());
    assert_eq!(f.request_size(A100_80, "node1").await, None);
}

#[tokio::test]
async fn stuck_binding_times_out() {
    let f = fixture().await;
    f.node("node1", &[]).await;
    f.slice("node1", 2, &[]).await;
    let stuck = f
        .claim(
            "stuck",
            "node1",
            &["gpu-0"],
            vec![],
            &["FabricDeviceReady"],
            f.now - Duration::seconds(700),
        )
        .await;
    f.claim(
        "young",
        "node1",
        &["gpu-1"],
        vec![],
        &["FabricDeviceReady"],
        f.now - Duration::seconds(30),
    )
    .await;

    let report = f.reconciler.reconcile_once(f.now).await.unwrap();

    assert_eq!(report.rescheduled, vec![stuck]);
    assert_eq!(f.request_size(A100_80, "node1").await, Some(1));
}

#[tokio::test]
async fn nodes_with_colliding_request_names_keep_separate_requests() {
    let f = fixture().await;
    f.node("node-1", &[("nvidia-a100-80-size-min", "2")]).await;
    f.node("node.1", &[("nvidia-a100-80-size-min", "1")]).await;

    let report = f.reconciler.reconcile_once(f.now).await.unwrap();

    assert_eq!(report.creates(), 2);
    assert_eq!(f.request_size(A100_80, "node-1").await, Some(2));
    assert_eq!(f.request_size(A100_80, "node.1").await, Some(1));

    let names: Vec<String> = f
        .cluster()
        .list::<ComposabilityRequest>()
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.metadata.name)
        .collect();
    assert_eq!(names.len(), 2);
    assert!(names.contains(&"nvidia-a100-80-node-1".to_string()));

    let again = f.reconciler.reconcile_once(f.now).await.unwrap();
    assert!(again.is_quiet(), "unexpected changes: {again:?}");
    assert_eq!(f.request_size(A100_80, "node-1").await, Some(2));
}

#[tokio::test]
async fn existing_request_for_colliding_node_is_left_alone() {
    let f = fixture().await;
    f.node("node-1", &[]).await;
    f.node("node.1", &[("nvidia-a100-80-size-min", "1")]).await;
    f.cluster()
        .create(&ComposabilityRequest {
            metadata: ObjectMeta::named("nvidia-a100-80-node-1"),
            spec: ComposabilityRequestSpec {
                resource: ScalarResourceDetails {
                    type_: "gpu".into(),
                    model: A100_80.into(),
                    size: 4,
                    target_node: "node-1".into(),
                    force_detach: false,
                },
            },
            status: Default::default(),
        })
        .await
        .unwrap();
    f.slice("node-1", 4, &[]).await;
    f.claim("train", "node-1", &["gpu-0", "gpu-1", "gpu-2", "gpu-3"], vec![], &[], f.now)
        .await;

    f.reconciler.reconcile_once(f.now).await.unwrap();

    assert_eq!(f.request_size(A100_80, "node-1").await, Some(4));
    assert_eq!(f.request_size(A100_80, "node.1").await, Some(1));
}

#[tokio::test]
async fn second_cycle_without_changes_is_quiet() {
    let f = fixture().await;
    f.node("node1", &[("nvidia-a100-80-size-min", "1")]).await;
    f.node("node2", &[]).await;
    f.slice("node2", 3, &[]).await;
    f.claim("infer", "node2", &["gpu-0", "gpu-2"], vec![], &[], f.now)
        .await;

    let first = f.reconciler.reconcile_once(f.now).await.unwrap();
    assert!(!first.is_quiet());

    let second = f.reconciler.reconcile_once(f.now).await.unwrap();
    assert!(second.is_quiet(), "unexpected changes: {second:?}");
    assert_eq!(f.request_size(A100_80, "node2").await, Some(2));
}

#[tokio::test]
async fn configured_count_never_drops_below_minimum() {
    let f = fixture().await;
    let cases = [("n0", "0", 0usize), ("n1", "3", 1), ("n2", "1", 2), ("n3", "2", 2)];
    for (node, min, claimed) in cases {
        f.node(node, &[("nvidia-a100-80-size-min", min)]).await;
        f.slice(node, 4, &[]).await;
        let devices: Vec<String> = (0..claimed).map(|i| format!("gpu-{i}")).collect();
        let devices: Vec<&str> = devices.iter().map(String::as_str).collect();
        if !devices.is_empty() {
            f.claim(&format!("claim-{node}"), node, &devices, vec![], &[], f.now)
                .await;
        }
    }

    f.reconciler.reconcile_once(f.now).await.unwrap();

    for (node, min, claimed) in cases {
        let min: i64 = min.parse().unwrap();
        let expected = min.max(claimed as i64);
        let size = f.request_size(A100_80, node).await.unwrap_or(0);
        assert_eq!(size, expected, "node {node}");
        assert!(size >= min);
    }
}

#[tokio::test]
async fn labels_follow_coexistence_rules() {
    let f = fixture().await;
    f.node("node1", &[("nvidia-a100-40", "true")]).await;
    f.node("node2", &[]).await;
    f.resource("gpu-res-0", "node1", "GPU-attached-0", None).await;

    let report = f.reconciler.reconcile_once(f.now).await.unwrap();
    assert_eq!(report.labelled, vec!["node1".to_string(), "node2".to_string()]);

    let node1 = f.node_labels("node1").await;
    assert_eq!(node1.get(&format!("{PREFIX}/nvidia-a100-80")).map(String::as_str), Some("true"));
    assert!(!node1.contains_key(&format!("{PREFIX}/nvidia-a100-40")));

    let node2 = f.node_labels("node2").await;
    assert!(node2.contains_key(&format!("{PREFIX}/nvidia-a100-80")));
    assert!(node2.contains_key(&format!("{PREFIX}/nvidia-a100-40")));
}

#[tokio::test]
async fn degraded_device_in_use_is_stamped_and_kept() {
    let f = fixture().await;
    f.node("node1", &[]).await;
    f.slice("node1", 3, &[0]).await;
    f.request(A100_80, "node1", 3).await;
    f.resource("gpu-res-0", "node1", "GPU-node1-0", None).await;
    f.claim("infer", "node1", &["gpu-0"], vec![], &[], f.now)
        .await;
    f.running_pod("infer-pod").await;

    let report = f.reconciler.reconcile_once(f.now).await.unwrap();

    assert_eq!(report.stamped, vec![ObjectKey::cluster("gpu-res-0")]);
    assert_eq!(report.deferred(), 1);
    assert_eq!(f.request_size(A100_80, "node1").await, Some(3));

    let res = f
        .cluster()
        .get::<ComposableResource>(&ObjectKey::cluster("gpu-res-0"))
        .await
        .unwrap()
        .unwrap();
    let stamp = &res.metadata.annotations[&format!("{PREFIX}/last-used-time")];
    assert!(DateTime::parse_from_rfc3339(stamp).is_ok());
}

#[tokio::test]
async fn degraded_device_without_running_pod_is_not_stamped() {
    let f = fixture().await;
    f.node("node1", &[]).await;
    f.slice("node1", 1, &[0]).await;
    f.resource("gpu-res-0", "node1", "GPU-node1-0", None).await;
    f.claim("infer", "node1", &["gpu-0"], vec![], &[], f.now)
        .await;

    let report = f.reconciler.reconcile_once(f.now).await.unwrap();
    assert!(report.stamped.is_empty());
}

#[tokio::test]
async fn missing_policy_is_a_configuration_error() {
    let cluster = StoreCluster::new(MemoryMetaStore::new());
    let reconciler = Reconciler::new(
        cluster,
        ReconcileSettings::default(),
        Arc::new(SharedMetrics::default()),
    );
    let err = reconciler.reconcile_once(Utc::now()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

fn conflicting_store() -> ConflictingStore {
    ConflictingStore {
        inner: MemoryMetaStore::new(),
        prefix: "/nodes/",
        remaining: Arc::new(AtomicU32::new(0)),
    }
}

#[tokio::test]
async fn single_conflict_is_retried() {
    let store = conflicting_store();
    let f = fixture_on(store.clone()).await;
    f.node("node1", &[]).await;
    store.arm(1);

    let report = f.reconciler.reconcile_once(f.now).await.unwrap();

    assert_eq!(report.labelled, vec!["node1".to_string()]);
    assert_eq!(f.metrics.conflict_retries_total.load(Ordering::Relaxed), 1);
    assert_eq!(f.node_labels("node1").await.len(), 2);
}

#[tokio::test]
async fn persistent_conflicts_exhaust_retries() {
    let store = conflicting_store();
    let f = fixture_on(store.clone()).await;
    f.node("node1", &[]).await;
    store.arm(10);

    let err = f.reconciler.reconcile_once(f.now).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert!(err
        .to_string()
        .starts_with("max retries (2) reached, last error: conflict on /nodes/node1"));
}
