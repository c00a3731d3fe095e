use std::sync::Arc;

use etcd_client::{Client, Compare, CompareOp, EventType, GetOptions, Txn, TxnOp, WatchOptions};
use tokio::sync::Mutex;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::{StoreError, StoreResult};
use crate::types::{MetaStore, WatchEvent, WatchStream};

#[derive(Clone)]
pub struct EtcdMetaStore {
    client: Arc<Mutex<Client>>,
}

impl EtcdMetaStore {
    pub async fn connect(endpoints: &[String]) -> StoreResult<Self> {
        let c = Client::connect(endpoints, None).await?;
        Ok(Self {
            client: Arc::new(Mutex::new(c)),
        })
    }
}

#[async_trait::async_trait]
impl MetaStore for EtcdMetaStore {
    async fn get(&self, key: &str) -> StoreResult<Option<(Vec<u8>, u64)>> {
        let mut cli = self.client.lock().await;
        let resp = cli.get(key, None).await?;
        Ok(resp
            .kvs()
            .first()
            .map(|kv| (kv.value().to_vec(), kv.mod_revision() as u64)))
    }

    async fn list_prefix(&self, prefix: &str) -> StoreResult<Vec<(String, Vec<u8>, u64)>> {
        let mut cli = self.client.lock().await;
        let opts = GetOptions::new().with_prefix();
        let resp = cli.get(prefix, Some(opts)).await?;

        Ok(resp
            .kvs()
            .iter()
            .map(|kv| {
                (
                    String::from_utf8_lossy(kv.key()).to_string(),
                    kv.value().to_vec(),
                    kv.mod_revision() as u64,
                )
            })
            .collect())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_revision: u64,
        value: Vec<u8>,
    ) -> StoreResult<u64> {
        let mut cli = self.client.lock().await;

        // A missing key has mod_revision 0, so expected 0 doubles as "create".
        let cmp = Compare::mod_revision(key, CompareOp::Equal, expected_revision as i64);
        let put = TxnOp::put(key, value, None);
        let txn = Txn::new()
            .when([cmp])
            .and_then([put])
            .or_else([TxnOp::get(key, None)]);
        let resp = cli.txn(txn).await?;

        if resp.succeeded() {
            let rev = resp.header().map(|h| h.revision()).unwrap_or_default();
            return Ok(rev as u64);
        }

        let actual = resp
            .op_responses()
            .into_iter()
            .find_map(|op| match op {
                etcd_client::TxnOpResponse::Get(get) => {
                    get.kvs().first().map(|kv| kv.mod_revision() as u64)
                }
                _ => None,
            })
            .unwrap_or(0);
        Err(StoreError::Conflict {
            key: key.to_string(),
            expected: expected_revision,
            actual,
        })
    }

    async fn watch_prefix(&self, prefix: &str) -> StoreResult<WatchStream> {
        let mut cli = self.client.lock().await;
        let opts = WatchOptions::new().with_prefix();
        let (watcher, mut stream) = cli.watch(prefix, Some(opts)).await?;

        let (tx, rx) = tokio::sync::mpsc::channel::<WatchEvent>(1024);
        tokio::spawn(async move {
            // Dropping the watcher cancels the server-side watch.
            let _watcher = watcher;
            while let Some(item) = stream.message().await.transpose() {
                let Ok(resp) = item else {
                    tracing::warn!("etcd watch stream failed, closing");
                    return;
                };

                for ev in resp.events() {
                    let Some(kv) = ev.kv() else {
                        continue;
                    };
                    let value = match ev.event_type() {
                        EventType::Put => Some(kv.value().to_vec()),
                        EventType::Delete => None,
                    };
                    let event = WatchEvent {
                        key: String::from_utf8_lossy(kv.key()).to_string(),
                        value,
                        revision: kv.mod_revision() as u64,
                    };
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}
