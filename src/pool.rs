use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use data_model::select_ip_or_name;
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    client::EngineConnector,
    context::{ClusterContext, ContextHandle},
    engine::Engine,
};

const CONNECT_BACKOFF_INITIAL: Duration = Duration::from_secs(2);
const CONNECT_BACKOFF_MAX: Duration = Duration::from_secs(60);

type ConnectTasks = Arc<Mutex<HashMap<String, JoinHandle<()>>>>;

/// Schedules connection attempts for the servers that ought to be
/// engines. One cancellable connect task per server key; tasks retry with
/// bounded backoff until the engine goes Healthy or the task is removed.
pub struct EnginesPool {
    connector: Arc<dyn EngineConnector>,
    overcommit_ratio: f64,
    context: Arc<ContextHandle>,
    tasks: ConnectTasks,
}

impl EnginesPool {
    pub fn new(connector: Arc<dyn EngineConnector>, overcommit_ratio: f64) -> Self {
        Self {
            connector,
            overcommit_ratio,
            context: Arc::new(ContextHandle::new()),
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn bind(&self, context: std::sync::Weak<dyn ClusterContext>) {
        self.context.bind(context);
    }

    /// Idempotent: a server with a live engine or an in-flight connect
    /// task is left alone.
    pub async fn add_engine(&self, ip: &str, name: &str) {
        let Some(context) = self.context.get() else {
            return;
        };
        if context.has_live_engine(ip, name).await {
            return;
        }

        let key = select_ip_or_name(ip, name).to_string();
        if key.is_empty() {
            return;
        }
        let mut tasks = self.tasks.lock().await;
        if tasks.contains_key(&key) {
            return;
        }
        debug!(server = %key, "enqueueing engine connect");
        let handle = tokio::spawn(connect_loop(
            self.connector.clone(),
            self.overcommit_ratio,
            self.context.clone(),
            self.tasks.clone(),
            ip.to_string(),
            name.to_string(),
            key.clone(),
        ));
        tasks.insert(key, handle);
    }

    /// Cancels any pending connect and reports the engine gone.
    pub async fn remove_engine(&self, ip: &str, name: &str) {
        let key = select_ip_or_name(ip, name).to_string();
        if let Some(handle) = self.tasks.lock().await.remove(&key) {
            handle.abort();
        }
        if let Some(context) = self.context.get() {
            context.engine_offline(ip, name).await;
        }
    }

    /// Cancels every pending connect task.
    pub async fn release(&self) {
        let mut tasks = self.tasks.lock().await;
        for (key, handle) in tasks.drain() {
            debug!(server = %key, "cancelling engine connect");
            handle.abort();
        }
    }

    #[cfg(test)]
    async fn pending_connects(&self) -> usize {
        self.tasks.lock().await.len()
    }
}

async fn connect_loop(
    connector: Arc<dyn EngineConnector>,
    overcommit_ratio: f64,
    context: Arc<ContextHandle>,
    tasks: ConnectTasks,
    ip: String,
    name: String,
    key: String,
) {
    let mut backoff = CONNECT_BACKOFF_INITIAL;
    loop {
        let Some(context) = context.get() else {
            break;
        };
        match try_connect(connector.as_ref(), context.as_ref(), overcommit_ratio, &ip, &name).await
        {
            Ok(engine) => {
                info!(server = %key, "engine connected");
                context.register_engine(engine).await;
                break;
            }
            Err(err) => {
                warn!(server = %key, "engine connect failed: {err:#}");
            }
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(CONNECT_BACKOFF_MAX);
    }
    tasks.lock().await.remove(&key);
}

async fn try_connect(
    connector: &dyn EngineConnector,
    context: &dyn ClusterContext,
    overcommit_ratio: f64,
    ip: &str,
    name: &str,
) -> Result<Arc<Engine>> {
    let node = context
        .node_data(ip, name)
        .await
        .ok_or_else(|| anyhow!("server {} not discovered", select_ip_or_name(ip, name)))?;
    let client = connector.connect(&node).await?;
    Engine::handshake(&node, client, overcommit_ratio).await
}

#[cfg(test)]
mod tests {
    use data_model::{EngineState, MetaData, MetaId, NodeData};
    use tokio::sync::Mutex as AsyncMutex;

    use super::*;
    use crate::testing::MockConnector;

    /// Minimal fleet stub standing in for the aggregator.
    #[derive(Default)]
    struct StubFleet {
        nodes: AsyncMutex<HashMap<String, NodeData>>,
        engines: AsyncMutex<HashMap<String, Arc<Engine>>>,
        dropped: AsyncMutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl ClusterContext for StubFleet {
        async fn node_data(&self, ip: &str, name: &str) -> Option<NodeData> {
            let key = select_ip_or_name(ip, name);
            self.nodes.lock().await.get(key).cloned()
        }

        async fn has_live_engine(&self, ip: &str, name: &str) -> bool {
            let key = select_ip_or_name(ip, name);
            self.engines
                .lock()
                .await
                .get(key)
                .map(|e| e.state() != EngineState::Disconnected)
                .unwrap_or(false)
        }

        async fn register_engine(&self, engine: Arc<Engine>) {
            self.engines
                .lock()
                .await
                .insert(engine.key().to_string(), engine);
        }

        async fn engine_offline(&self, ip: &str, name: &str) {
            let key = select_ip_or_name(ip, name).to_string();
            if let Some(engine) = self.engines.lock().await.remove(&key) {
                engine.set_state(EngineState::Disconnected);
            }
            self.dropped.lock().await.push(key);
        }

        async fn list_meta_data(&self) -> Vec<MetaData> {
            vec![]
        }

        async fn group_engines(&self, _group_id: &str) -> Vec<Arc<Engine>> {
            vec![]
        }

        async fn recover_meta(&self, _meta_id: &MetaId) {}

        async fn execute_upgrade(&self, _meta_id: &MetaId, _image_tag: &str) -> bool {
            false
        }
    }

    async fn pool_with_fleet() -> (EnginesPool, Arc<StubFleet>, Arc<MockConnector>) {
        let connector = Arc::new(MockConnector::new());
        let fleet = Arc::new(StubFleet::default());
        let pool = EnginesPool::new(connector.clone(), 0.05);
        // The weak handle shares the fleet Arc's allocation, so it stays
        // upgradable for as long as the test holds `fleet`.
        let context: Arc<dyn ClusterContext> = fleet.clone();
        pool.bind(Arc::downgrade(&context));
        (pool, fleet, connector)
    }

    async fn wait_for_engine(fleet: &StubFleet, key: &str) -> Arc<Engine> {
        for _ in 0..200 {
            if let Some(engine) = fleet.engines.lock().await.get(key).cloned() {
                return engine;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("engine {key} never registered");
    }

    #[tokio::test]
    async fn test_add_engine_connects_and_registers() {
        let (pool, fleet, connector) = pool_with_fleet().await;
        let node = connector.seed_node("192.168.1.10", "node01").await;
        fleet
            .nodes
            .lock()
            .await
            .insert(node.key().to_string(), node.clone());

        pool.add_engine(&node.ip, &node.name).await;
        let engine = wait_for_engine(&fleet, "192.168.1.10").await;
        assert!(engine.is_healthy());
        while pool.pending_connects().await != 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // A second add for a live engine is a no-op.
        pool.add_engine(&node.ip, &node.name).await;
        assert_eq!(pool.pending_connects().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_retries_until_reachable() {
        let (pool, fleet, connector) = pool_with_fleet().await;
        let node = connector.seed_node("192.168.1.10", "node01").await;
        fleet
            .nodes
            .lock()
            .await
            .insert(node.key().to_string(), node.clone());
        connector.refuse(node.key(), true).await;

        pool.add_engine(&node.ip, &node.name).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(fleet.engines.lock().await.is_empty());

        connector.refuse(node.key(), false).await;
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(fleet.engines.lock().await.contains_key("192.168.1.10"));
    }

    #[tokio::test]
    async fn test_remove_engine_cancels_pending_connect() {
        let (pool, fleet, connector) = pool_with_fleet().await;
        let node = connector.seed_node("192.168.1.10", "node01").await;
        fleet
            .nodes
            .lock()
            .await
            .insert(node.key().to_string(), node.clone());
        connector.refuse(node.key(), true).await;

        pool.add_engine(&node.ip, &node.name).await;
        assert_eq!(pool.pending_connects().await, 1);

        pool.remove_engine(&node.ip, &node.name).await;
        assert_eq!(pool.pending_connects().await, 0);
        assert_eq!(fleet.dropped.lock().await.as_slice(), ["192.168.1.10"]);
    }
}
