use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;
use serde::{Deserialize, Serialize};

use crate::error::StoreResult;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchEvent {
    pub key: String,
    /// `None` for deletions.
    pub value: Option<Vec<u8>>,
    pub revision: u64,
}

pub type WatchStream = Pin<Box<dyn Stream<Item = WatchEvent> + Send>>;

/// Revisioned key/value storage backing the cluster objects.
///
/// Every key carries the revision of its last modification. An absent key
/// has revision 0, so `compare_and_swap(key, 0, ..)` creates.
#[async_trait]
pub trait MetaStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<(Vec<u8>, u64)>>;
    async fn list_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>, u64)>>;

    /// Write `value` only if the key is still at `expected_revision`.
    /// Fails with [`StoreError::Conflict`](crate::StoreError::Conflict) otherwise.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected_revision: u64,
        value: Vec<u8>,
    ) -> StoreResult<u64>;

    /// Changes under `prefix` from now on. The stream ends when the
    /// backend drops the watch.
    async fn watch_prefix(&self, prefix: &str) -> StoreResult<WatchStream>;
}
