use std::{collections::HashMap, sync::Arc, time::Duration};

use data_model::MetaId;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info};

use crate::context::{ClusterContext, ContextHandle};

struct UpgradeBatch {
    image_tag: String,
    waiters: Vec<oneshot::Sender<bool>>,
}

type UpgradeBatches = Arc<Mutex<HashMap<MetaId, UpgradeBatch>>>;

/// Delayed per-meta upgrade batcher. The first request for a meta arms a
/// single-shot timer; requests arriving inside the window join the batch.
/// Every waiter receives the batch outcome on its one-shot handle. The
/// entry stays in the map for the whole execution so admission keeps
/// rejecting concurrent lifecycle ops on the meta.
pub struct UpgradeCache {
    delay: Duration,
    context: Arc<ContextHandle>,
    batches: UpgradeBatches,
}

impl UpgradeCache {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            context: Arc::new(ContextHandle::new()),
            batches: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn bind(&self, context: std::sync::Weak<dyn ClusterContext>) {
        self.context.bind(context);
    }

    pub async fn contains(&self, meta_id: &MetaId) -> bool {
        self.batches.lock().await.contains_key(meta_id)
    }

    pub async fn upgrade(
        &self,
        meta_id: MetaId,
        image_tag: String,
        waiter: oneshot::Sender<bool>,
    ) {
        let mut batches = self.batches.lock().await;
        if let Some(batch) = batches.get_mut(&meta_id) {
            debug!(
                meta_id = meta_id.get(),
                image_tag, "joining pending upgrade batch"
            );
            batch.image_tag = image_tag;
            batch.waiters.push(waiter);
            return;
        }

        info!(
            meta_id = meta_id.get(),
            image_tag,
            delay_secs = self.delay.as_secs(),
            "upgrade scheduled"
        );
        batches.insert(
            meta_id.clone(),
            UpgradeBatch {
                image_tag,
                waiters: vec![waiter],
            },
        );
        tokio::spawn(run_batch(
            self.delay,
            self.context.clone(),
            self.batches.clone(),
            meta_id,
        ));
    }
}

async fn run_batch(
    delay: Duration,
    context: Arc<ContextHandle>,
    batches: UpgradeBatches,
    meta_id: MetaId,
) {
    tokio::time::sleep(delay).await;

    let image_tag = {
        let batches = batches.lock().await;
        let Some(batch) = batches.get(&meta_id) else {
            return;
        };
        batch.image_tag.clone()
    };

    let ok = match context.get() {
        Some(context) => context.execute_upgrade(&meta_id, &image_tag).await,
        None => false,
    };
    info!(meta_id = meta_id.get(), image_tag, ok, "upgrade batch finished");

    if let Some(batch) = batches.lock().await.remove(&meta_id) {
        for waiter in batch.waiters {
            let _ = waiter.send(ok);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use data_model::{MetaData, NodeData};

    use super::*;
    use crate::engine::Engine;

    #[derive(Default)]
    struct CountingContext {
        executions: AtomicUsize,
        outcome: AtomicBool,
    }

    #[async_trait::async_trait]
    impl ClusterContext for CountingContext {
        async fn node_data(&self, _ip: &str, _name: &str) -> Option<NodeData> {
            None
        }

        async fn has_live_engine(&self, _ip: &str, _name: &str) -> bool {
            false
        }

        async fn register_engine(&self, _engine: Arc<Engine>) {}

        async fn engine_offline(&self, _ip: &str, _name: &str) {}

        async fn list_meta_data(&self) -> Vec<MetaData> {
            vec![]
        }

        async fn group_engines(&self, _group_id: &str) -> Vec<Arc<Engine>> {
            vec![]
        }

        async fn recover_meta(&self, _meta_id: &MetaId) {}

        async fn execute_upgrade(&self, _meta_id: &MetaId, _image_tag: &str) -> bool {
            self.executions.fetch_add(1, Ordering::SeqCst);
            self.outcome.load(Ordering::SeqCst)
        }
    }

    fn bound_cache(delay: Duration) -> (UpgradeCache, Arc<CountingContext>) {
        let context = Arc::new(CountingContext::default());
        let cache = UpgradeCache::new(delay);
        let as_context: Arc<dyn ClusterContext> = context.clone();
        cache.bind(Arc::downgrade(&as_context));
        (cache, context)
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_in_window_share_one_batch() {
        let (cache, context) = bound_cache(Duration::from_secs(10));
        context.outcome.store(true, Ordering::SeqCst);
        let meta_id = MetaId::from("m1");

        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        cache.upgrade(meta_id.clone(), "v2".to_string(), tx1).await;
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(cache.contains(&meta_id).await);
        cache.upgrade(meta_id.clone(), "v3".to_string(), tx2).await;

        assert!(rx1.await.unwrap());
        assert!(rx2.await.unwrap());
        assert_eq!(context.executions.load(Ordering::SeqCst), 1);
        assert!(!cache.contains(&meta_id).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_batch_reports_false() {
        let (cache, _context) = bound_cache(Duration::from_millis(50));
        let (tx, rx) = oneshot::channel();
        cache.upgrade(MetaId::from("m1"), "v2".to_string(), tx).await;
        assert!(!rx.await.unwrap());
    }
}
