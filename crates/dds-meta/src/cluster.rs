use async_trait::async_trait;
use chrono::Utc;
use dds_common::{ObjectKey, Resource};

use crate::error::{StoreError, StoreResult};
use crate::patch::Patch;
use crate::types::{MetaStore, WatchStream};

/// Typed access to cluster objects.
///
/// Every object returned carries the store revision it was read at in
/// `metadata.resource_version`.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn list<R: Resource>(&self) -> StoreResult<Vec<R>>;

    async fn get<R: Resource>(&self, key: &ObjectKey) -> StoreResult<Option<R>>;

    /// Create a new object. Fails with `AlreadyExists` if the key is taken.
    async fn create<R: Resource>(&self, obj: &R) -> StoreResult<R>;

    /// Apply `patch` to the stored object. With a precondition the write only
    /// happens if the object is still at that revision.
    async fn patch<R: Resource>(
        &self,
        key: &ObjectKey,
        patch: &Patch,
        precondition: Option<u64>,
    ) -> StoreResult<R>;

    /// Change notifications for every object of kind `R`.
    async fn watch<R: Resource>(&self) -> StoreResult<WatchStream>;
}

/// [`ClusterApi`] on top of any [`MetaStore`]. Objects are stored as JSON
/// under `R::PREFIX`.
#[derive(Debug, Clone)]
pub struct StoreCluster<S> {
    store: S,
}

impl<S: MetaStore> StoreCluster<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

fn decode<R: Resource>(key: &str, raw: &[u8], revision: u64) -> StoreResult<R> {
    let mut obj: R = serde_json::from_slice(raw).map_err(|source| StoreError::Codec {
        key: key.to_string(),
        source,
    })?;
    obj.meta_mut().resource_version = Some(revision);
    Ok(obj)
}

fn encode<R: Resource>(key: &str, obj: &R) -> StoreResult<Vec<u8>> {
    serde_json::to_vec(obj).map_err(|source| StoreError::Codec {
        key: key.to_string(),
        source,
    })
}

#[async_trait]
impl<S: MetaStore> ClusterApi for StoreCluster<S> {
    async fn list<R: Resource>(&self) -> StoreResult<Vec<R>> {
        let items = self.store.list_prefix(R::PREFIX).await?;
        items
            .iter()
            .map(|(key, raw, rev)| decode(key, raw, *rev))
            .collect()
    }

    async fn get<R: Resource>(&self, key: &ObjectKey) -> StoreResult<Option<R>> {
        let storage_key = key.storage_key(R::PREFIX);
        match self.store.get(&storage_key).await? {
            Some((raw, rev)) => decode(&storage_key, &raw, rev).map(Some),
            None => Ok(None),
        }
    }

    async fn create<R: Resource>(&self, obj: &R) -> StoreResult<R> {
        let storage_key = obj.key().storage_key(R::PREFIX);
        let mut obj = obj.clone();
        if obj.meta().creation_timestamp.is_none() {
            obj.meta_mut().creation_timestamp = Some(Utc::now());
        }
        let raw = encode(&storage_key, &obj)?;

        match self.store.compare_and_swap(&storage_key, 0, raw).await {
            Ok(rev) => {
                obj.meta_mut().resource_version = Some(rev);
                Ok(obj)
            }
            Err(StoreError::Conflict { .. }) => Err(StoreError::AlreadyExists { key: storage_key }),
            Err(e) => Err(e),
        }
    }

    async fn patch<R: Resource>(
        &self,
        key: &ObjectKey,
        patch: &Patch,
        precondition: Option<u64>,
    ) -> StoreResult<R> {
        let storage_key = key.storage_key(R::PREFIX);
        let Some((raw, rev)) = self.store.get(&storage_key).await? else {
            return Err(StoreError::NotFound { key: storage_key });
        };
        if let Some(expected) = precondition {
            if expected != rev {
                return Err(StoreError::Conflict {
                    key: storage_key,
                    expected,
                    actual: rev,
                });
            }
        }

        let mut doc: serde_json::Value =
            serde_json::from_slice(&raw).map_err(|source| StoreError::Codec {
                key: storage_key.clone(),
                source,
            })?;
        patch.apply(&mut doc).map_err(|reason| StoreError::Patch {
            key: storage_key.clone(),
            reason,
        })?;

        // Round-trip through the typed form so a patch cannot store an object
        // that no longer decodes.
        let mut obj: R = serde_json::from_value(doc).map_err(|source| StoreError::Codec {
            key: storage_key.clone(),
            source,
        })?;
        let raw = encode(&storage_key, &obj)?;
        let new_rev = self.store.compare_and_swap(&storage_key, rev, raw).await?;
        obj.meta_mut().resource_version = Some(new_rev);
        Ok(obj)
    }

    async fn watch<R: Resource>(&self) -> StoreResult<WatchStream> {
        self.store.watch_prefix(R::PREFIX).await
    }
}
