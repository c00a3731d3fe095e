pub mod object;

pub mod claim;
pub mod composability;
pub mod condition;
pub mod config_map;
pub mod node;
pub mod pod;
pub mod policy;
pub mod slice;

pub mod telemetry;

pub use claim::{
    AllocatedDeviceStatus, AllocationResult, ClaimDevice, ClaimInfo, ConsumerReference,
    DeviceRequestAllocationResult, DeviceState, NodeSelector, NodeSelectorRequirement,
    NodeSelectorTerm, ResourceClaim, ResourceClaimStatus,
};
pub use composability::{
    ComposabilityRequest, ComposabilityRequestSpec, ComposabilityRequestStatus,
    ComposableResource, ComposableResourceSpec, ComposableResourceStatus, ScalarResourceDetails,
    STATE_ONLINE,
};
pub use condition::{Condition, ConditionStatus};
pub use config_map::ConfigMap;
pub use node::{ModelConstraints, Node, NodeInfo};
pub use object::{ObjectKey, ObjectMeta, Resource};
pub use pod::{Pod, PodPhase, PodStatus};
pub use policy::{DeviceCatalogEntry, PolicyConfig};
pub use slice::{
    BasicDevice, Device, DeviceAttribute, ResourcePool, ResourceSlice, ResourceSliceSpec,
    SliceDevice, SliceInfo,
};
