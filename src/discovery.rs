use anyhow::Result;
use tokio::sync::mpsc;

/// One raw discovery entry: an opaque backend key and the node payload.
#[derive(Debug, Clone)]
pub struct Entry {
    pub key: String,
    pub data: Vec<u8>,
}

impl Entry {
    pub fn new(key: &str, data: Vec<u8>) -> Self {
        Self {
            key: key.to_string(),
            data,
        }
    }
}

/// One change batch from the discovery backend. A batch-level error means
/// the backend could not report changes this round; entries are untouched.
#[derive(Debug, Default)]
pub struct WatchBatch {
    pub added: Vec<Entry>,
    pub removed: Vec<Entry>,
    pub error: Option<String>,
}

/// Discovery collaborator: a subscription yielding change batches until
/// the receiver is dropped or the cluster stops watching.
#[async_trait::async_trait]
pub trait DiscoveryBackend: Send + Sync {
    async fn watch(&self) -> Result<mpsc::Receiver<WatchBatch>>;
}
