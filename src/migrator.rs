use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use data_model::MetaId;
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{debug, info};

use crate::context::{ClusterContext, ContextHandle};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MigrateKey {
    group_id: String,
    engine_key: String,
}

struct MigrateBatch {
    meta_ids: HashSet<MetaId>,
    handle: JoinHandle<()>,
}

type MigrateBatches = Arc<Mutex<HashMap<MigrateKey, MigrateBatch>>>;

/// Delayed per-(group, engine) migration batcher. Armed when an engine
/// referenced by the group goes offline; after the delay every meta the
/// engine hosted is recovered onto the remaining engines. Batches can be
/// cancelled when the engine returns or the group goes away.
pub struct MigrateCache {
    delay: Duration,
    context: Arc<ContextHandle>,
    batches: MigrateBatches,
}

impl MigrateCache {
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

    /// Whether any pending migration claims the meta. Gates the other
    /// lifecycle operations.
    pub async fn contains(&self, meta_id: &MetaId) -> bool {
        self.batches
            .lock()
            .await
            .values()
            .any(|batch| batch.meta_ids.contains(meta_id))
    }

    pub async fn start_engine_containers(
        &self,
        group_id: &str,
        engine_key: &str,
        meta_ids: Vec<MetaId>,
    ) {
        if meta_ids.is_empty() {
            return;
        }
        let key = MigrateKey {
            group_id: group_id.to_string(),
            engine_key: engine_key.to_string(),
        };
        let mut batches = self.batches.lock().await;
        if let Some(batch) = batches.get_mut(&key) {
            batch.meta_ids.extend(meta_ids);
            return;
        }

        info!(
            group_id,
            engine = engine_key,
            metas = meta_ids.len(),
            delay_secs = self.delay.as_secs(),
            "migration scheduled"
        );
        let handle = tokio::spawn(run_batch(
            self.delay,
            self.context.clone(),
            self.batches.clone(),
            key.clone(),
        ));
        batches.insert(
            key,
            MigrateBatch {
                meta_ids: meta_ids.into_iter().collect(),
                handle,
            },
        );
    }

    /// Cancels every pending migration for the engine, across groups.
    pub async fn cancel_engine(&self, engine_key: &str) {
        let mut batches = self.batches.lock().await;
        let keys: Vec<MigrateKey> = batches
            .keys()
            .filter(|key| key.engine_key == engine_key)
            .cloned()
            .collect();
        for key in keys {
            if let Some(batch) = batches.remove(&key) {
                debug!(group_id = %key.group_id, engine = %key.engine_key, "migration cancelled");
                batch.handle.abort();
            }
        }
    }

    /// Cancels one group's pending migration for the engine.
    pub async fn cancel(&self, group_id: &str, engine_key: &str) {
        let key = MigrateKey {
            group_id: group_id.to_string(),
            engine_key: engine_key.to_string(),
        };
        if let Some(batch) = self.batches.lock().await.remove(&key) {
            debug!(group_id, engine = engine_key, "migration cancelled");
            batch.handle.abort();
        }
    }

    /// Cancels all pending migrations for the group.
    pub async fn remove_group(&self, group_id: &str) {
        let mut batches = self.batches.lock().await;
        let keys: Vec<MigrateKey> = batches
            .keys()
            .filter(|key| key.group_id == group_id)
            .cloned()
            .collect();
        for key in keys {
            if let Some(batch) = batches.remove(&key) {
                batch.handle.abort();
            }
        }
    }
}

async fn run_batch(
    delay: Duration,
    context: Arc<ContextHandle>,
    batches: MigrateBatches,
    key: MigrateKey,
) {
    tokio::time::sleep(delay).await;

    // Drop the entry before recovering so the meta passes its own
    // migrating gate inside recovery.
    let Some(batch) = batches.lock().await.remove(&key) else {
        return;
    };
    let Some(context) = context.get() else {
        return;
    };
    info!(
        group_id = %key.group_id,
        engine = %key.engine_key,
        metas = batch.meta_ids.len(),
        "migrating containers off lost engine"
    );
    for meta_id in batch.meta_ids {
        context.recover_meta(&meta_id).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use data_model::{MetaData, NodeData};
    use tokio::sync::Mutex as AsyncMutex;

    use super::*;
    use crate::engine::Engine;

    #[derive(Default)]
    struct RecoveryLog {
        recovered: AsyncMutex<Vec<MetaId>>,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ClusterContext for RecoveryLog {
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

        async fn recover_meta(&self, meta_id: &MetaId) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.recovered.lock().await.push(meta_id.clone());
        }

        async fn execute_upgrade(&self, _meta_id: &MetaId, _image_tag: &str) -> bool {
            false
        }
    }

    fn bound_cache(delay: Duration) -> (MigrateCache, Arc<RecoveryLog>) {
        let log = Arc::new(RecoveryLog::default());
        let cache = MigrateCache::new(delay);
        let as_context: Arc<dyn ClusterContext> = log.clone();
        cache.bind(Arc::downgrade(&as_context));
        (cache, log)
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_recovers_metas_after_delay() {
        let (cache, log) = bound_cache(Duration::from_secs(30));
        cache
            .start_engine_containers("g1", "192.168.1.10", vec![MetaId::from("m1")])
            .await;
        // A second loss sighting inside the window joins the batch.
        cache
            .start_engine_containers(
                "g1",
                "192.168.1.10",
                vec![MetaId::from("m1"), MetaId::from("m2")],
            )
            .await;
        assert!(cache.contains(&MetaId::from("m2")).await);

        tokio::time::sleep(Duration::from_secs(31)).await;
        tokio::task::yield_now().await;
        assert_eq!(log.calls.load(Ordering::SeqCst), 2);
        assert!(!cache.contains(&MetaId::from("m1")).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_engine_stops_pending_batches() {
        let (cache, log) = bound_cache(Duration::from_secs(30));
        cache
            .start_engine_containers("g1", "192.168.1.10", vec![MetaId::from("m1")])
            .await;
        cache
            .start_engine_containers("g2", "192.168.1.10", vec![MetaId::from("m2")])
            .await;

        cache.cancel_engine("192.168.1.10").await;
        tokio::time::sleep(Duration::from_secs(40)).await;
        assert_eq!(log.calls.load(Ordering::SeqCst), 0);
        assert!(!cache.contains(&MetaId::from("m1")).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_group_cancels_only_that_group() {
        let (cache, log) = bound_cache(Duration::from_secs(30));
        cache
            .start_engine_containers("g1", "192.168.1.10", vec![MetaId::from("m1")])
            .await;
        cache
            .start_engine_containers("g2", "192.168.1.10", vec![MetaId::from("m2")])
            .await;

        cache.remove_group("g1").await;
        assert!(!cache.contains(&MetaId::from("m1")).await);
        assert!(cache.contains(&MetaId::from("m2")).await);

        tokio::time::sleep(Duration::from_secs(31)).await;
        tokio::task::yield_now().await;
        assert_eq!(log.calls.load(Ordering::SeqCst), 1);
    }
}
