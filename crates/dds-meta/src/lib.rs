pub mod cluster;
pub mod error;
pub mod etcd;
pub mod memory;
pub mod patch;
pub mod types;

pub use cluster::{ClusterApi, StoreCluster};
pub use error::{StoreError, StoreResult};
pub use etcd::EtcdMetaStore;
pub use memory::MemoryMetaStore;
pub use patch::{JsonPatchOp, Patch};
pub use types::{MetaStore, WatchEvent, WatchStream};
