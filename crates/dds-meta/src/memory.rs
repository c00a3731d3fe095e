use std::{collections::BTreeMap, sync::Arc};

use tokio::sync::{broadcast, RwLock};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};

use crate::error::{StoreError, StoreResult};
use crate::types::{MetaStore, WatchEvent, WatchStream};

/// In-process store with the same revision and conflict rules as etcd.
/// Used by tests and local dry runs.
#[derive(Debug, Clone)]
pub struct MemoryMetaStore {
    inner: Arc<RwLock<Inner>>,
    tx: broadcast::Sender<WatchEvent>,
}

#[derive(Debug, Default)]
struct Inner {
    revision: u64,
    kv: BTreeMap<String, (Vec<u8>, u64)>,
}

impl Inner {
    fn next_revision(&mut self) -> u64 {
        self.revision = self.revision.saturating_add(1);
        self.revision
    }

    fn write(&mut self, key: &str, value: Vec<u8>) -> WatchEvent {
        let rev = self.next_revision();
        self.kv.insert(key.to_string(), (value.clone(), rev));
        WatchEvent {
            key: key.to_string(),
            value: Some(value),
            revision: rev,
        }
    }
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(1024);
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            tx,
        }
    }

    fn emit(&self, event: WatchEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for MemoryMetaStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl MetaStore for MemoryMetaStore {
    async fn get(&self, key: &str) -> StoreResult<Option<(Vec<u8>, u64)>> {
        let inner = self.inner.read().await;
        Ok(inner.kv.get(key).map(|(v, rev)| (v.clone(), *rev)))
    }

    async fn list_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>, u64)>> {
        let inner = self.inner.read().await;
        Ok(inner
            .kv
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, (v, rev))| (k.clone(), v.clone(), *rev))
            .collect())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_revision: u64,
        value: Vec<u8>,
    ) -> StoreResult<u64> {
        let event = {
            let mut inner = self.inner.write().await;
            let current = inner.kv.get(key).map(|(_, rev)| *rev).unwrap_or(0);
            if current != expected_revision {
                return Err(StoreError::Conflict {
                    key: key.to_string(),
                    expected: expected_revision,
                    actual: current,
                });
            }
            inner.write(key, value)
        };
        let rev = event.revision;
        self.emit(event);
        Ok(rev)
    }

    async fn watch_prefix(&self, prefix: &str) -> StoreResult<WatchStream> {
        let prefix = prefix.to_string();
        let rx = self.tx.subscribe();
        let stream = BroadcastStream::new(rx).filter_map(move |msg| match msg {
            Ok(ev) if ev.key.starts_with(&prefix) => Some(ev),
            _ => None,
        });

        Ok(Box::pin(stream))
    }
}
