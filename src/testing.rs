//! In-memory collaborators for exercising the cluster core: a scriptable
//! daemon per node, a connector that can refuse sessions, a hand-driven
//! discovery backend, and a notifier that records what it was told.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, bail, Result};
use data_model::{
    test_objects::tests::mock_node, Container, ContainerAction, ContainerConfig, ContainerInfo,
    MetaId, NodeData, WatchEngine,
};
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::{
    client::{EngineApiClient, EngineConnector, EngineInfo},
    cluster::Cluster,
    config::ClusterConfig,
    discovery::{DiscoveryBackend, Entry, WatchBatch},
    engine::Engine,
    notify::NotifySender,
};

const GIB: i64 = 1024 * 1024 * 1024;

/// One node's container daemon, held entirely in memory.
pub struct MockDaemon {
    id_prefix: String,
    cpus: i64,
    memory: i64,
    containers: RwLock<HashMap<String, Container>>,
    fail_create: AtomicBool,
    not_found_create: AtomicBool,
    fail_refresh: AtomicBool,
    next_id: AtomicU64,
}

impl MockDaemon {
    pub fn new(id_prefix: &str, cpus: i64, memory: i64) -> Self {
        Self {
            id_prefix: id_prefix.to_lowercase(),
            cpus,
            memory,
            containers: RwLock::new(HashMap::new()),
            fail_create: AtomicBool::new(false),
            not_found_create: AtomicBool::new(false),
            fail_refresh: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn fail_create_image_missing(&self, fail: bool) {
        self.not_found_create.store(fail, Ordering::SeqCst);
    }

    pub fn fail_refresh(&self, fail: bool) {
        self.fail_refresh.store(fail, Ordering::SeqCst);
    }

    pub async fn container_count(&self) -> usize {
        self.containers.read().await.len()
    }

    pub async fn container_ids(&self) -> Vec<String> {
        self.containers.read().await.keys().cloned().collect()
    }

    /// Wipes daemon state, as a host restart would.
    pub async fn clear_containers(&self) {
        self.containers.write().await.clear();
    }

    /// Seeds a container behind the engine's back, as an out-of-band
    /// creation on the host would.
    pub async fn insert_container(&self, container: Container) {
        self.containers
            .write()
            .await
            .insert(container.info.id.clone(), container);
    }
}

#[async_trait::async_trait]
impl EngineApiClient for MockDaemon {
    async fn info(&self) -> Result<EngineInfo> {
        Ok(EngineInfo {
            id: format!("daemon-{}", self.id_prefix),
            cpus: self.cpus,
            memory: self.memory,
            labels: HashMap::new(),
        })
    }

    async fn list_containers(&self) -> Result<Vec<Container>> {
        if self.fail_refresh.load(Ordering::SeqCst) {
            bail!("daemon unreachable");
        }
        Ok(self.containers.read().await.values().cloned().collect())
    }

    async fn create_container(&self, config: &ContainerConfig) -> Result<ContainerInfo> {
        if self.fail_create.load(Ordering::SeqCst) {
            bail!("daemon create failed");
        }
        if self.not_found_create.load(Ordering::SeqCst) {
            bail!("image {} not found", config.image);
        }
        let serial = self.next_id.fetch_add(1, Ordering::SeqCst);
        let info = ContainerInfo {
            id: format!("{}-{:04}", self.id_prefix, serial),
            state: "running".to_string(),
            image: config.image.clone(),
        };
        self.containers.write().await.insert(
            info.id.clone(),
            Container {
                info: info.clone(),
                config: config.clone(),
            },
        );
        Ok(info)
    }

    async fn remove_container(&self, container_id: &str) -> Result<()> {
        if self
            .containers
            .write()
            .await
            .remove(container_id)
            .is_none()
        {
            bail!("no such container {}", container_id);
        }
        Ok(())
    }

    async fn operate_container(&self, container_id: &str, action: ContainerAction) -> Result<()> {
        let mut containers = self.containers.write().await;
        let container = containers
            .get_mut(container_id)
            .ok_or_else(|| anyhow!("no such container {}", container_id))?;
        container.info.state = match action {
            ContainerAction::Stop | ContainerAction::Kill | ContainerAction::Pause => {
                "exited".to_string()
            }
            _ => "running".to_string(),
        };
        Ok(())
    }
}

/// Builds an engine straight from a daemon, bypassing the pool.
pub async fn mock_engine(ip: &str, name: &str, cpus: i64, memory: i64) -> Arc<Engine> {
    let daemon = Arc::new(MockDaemon::new(name, cpus, memory));
    Engine::handshake(&mock_node(ip, name), daemon, 0.05)
        .await
        .unwrap()
}

/// Connector over a fixed set of mock daemons, keyed by server identity.
pub struct MockConnector {
    daemons: RwLock<HashMap<String, Arc<MockDaemon>>>,
    nodes: RwLock<HashMap<String, NodeData>>,
    refused: RwLock<HashSet<String>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self {
            daemons: RwLock::new(HashMap::new()),
            nodes: RwLock::new(HashMap::new()),
            refused: RwLock::new(HashSet::new()),
        }
    }

    /// Registers a node with a default-size daemon (2 cpus, 4 GiB).
    /// Idempotent, so a restarted harness keeps its daemons.
    pub async fn seed_node(&self, ip: &str, name: &str) -> NodeData {
        self.seed_node_with(ip, name, 2, 4 * GIB).await
    }

    pub async fn seed_node_with(&self, ip: &str, name: &str, cpus: i64, memory: i64) -> NodeData {
        let mut node = mock_node(ip, name);
        node.cpus = cpus;
        node.memory = memory;
        let key = node.key().to_string();
        self.daemons
            .write()
            .await
            .entry(key.clone())
            .or_insert_with(|| Arc::new(MockDaemon::new(name, cpus, memory)));
        self.nodes.write().await.insert(key, node.clone());
        node
    }

    pub async fn daemon(&self, key: &str) -> Arc<MockDaemon> {
        self.daemons
            .read()
            .await
            .get(key)
            .cloned()
            .expect("daemon not seeded")
    }

    pub async fn node(&self, key: &str) -> NodeData {
        self.nodes
            .read()
            .await
            .get(key)
            .cloned()
            .expect("node not seeded")
    }

    pub async fn refuse(&self, key: &str, refused: bool) {
        let mut set = self.refused.write().await;
        if refused {
            set.insert(key.to_string());
        } else {
            set.remove(key);
        }
    }
}

#[async_trait::async_trait]
impl EngineConnector for MockConnector {
    async fn connect(&self, node: &NodeData) -> Result<Arc<dyn EngineApiClient>> {
        if self.refused.read().await.contains(node.key()) {
            bail!("connection refused by {}", node.key());
        }
        let daemon = self
            .daemons
            .read()
            .await
            .get(node.key())
            .cloned()
            .ok_or_else(|| anyhow!("unknown node {}", node.key()))?;
        Ok(daemon)
    }
}

/// Discovery backend driven by the test through a channel sender.
pub struct ScriptedDiscovery {
    tx: mpsc::Sender<WatchBatch>,
    rx: Mutex<Option<mpsc::Receiver<WatchBatch>>>,
}

impl ScriptedDiscovery {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(32);
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    pub fn sender(&self) -> mpsc::Sender<WatchBatch> {
        self.tx.clone()
    }
}

#[async_trait::async_trait]
impl DiscoveryBackend for ScriptedDiscovery {
    async fn watch(&self) -> Result<mpsc::Receiver<WatchBatch>> {
        self.rx
            .lock()
            .await
            .take()
            .ok_or_else(|| anyhow!("discovery watch already taken"))
    }
}

/// Records every notification for later assertions.
#[derive(Default)]
pub struct CaptureNotifier {
    pub engine_events: Mutex<Vec<WatchEngine>>,
    pub meta_events: Mutex<Vec<(String, Option<String>, MetaId)>>,
}

#[async_trait::async_trait]
impl NotifySender for CaptureNotifier {
    async fn notify_group_engines_watch_event(&self, _message: &str, events: &[WatchEngine]) {
        self.engine_events.lock().await.extend(events.to_vec());
    }

    async fn notify_group_meta_containers_event(
        &self,
        message: &str,
        error: Option<&anyhow::Error>,
        meta_id: &MetaId,
    ) {
        self.meta_events.lock().await.push((
            message.to_string(),
            error.map(|err| err.to_string()),
            meta_id.clone(),
        ));
    }
}

pub fn node_entry(node: &NodeData) -> Entry {
    Entry::new(
        &format!("nodes/{}", node.key()),
        serde_json::to_vec(node).unwrap(),
    )
}

/// A started cluster wired to mock collaborators.
pub struct TestCluster {
    pub cluster: Arc<Cluster>,
    pub connector: Arc<MockConnector>,
    pub notifier: Arc<CaptureNotifier>,
    pub discovery_tx: mpsc::Sender<WatchBatch>,
    config: ClusterConfig,
    _temp_dir: tempfile::TempDir,
}

impl TestCluster {
    pub async fn new() -> Result<Self> {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(adjust: impl FnOnce(&mut ClusterConfig)) -> Result<Self> {
        init_tracing();
        let temp_dir = tempfile::tempdir()?;
        let mut config = ClusterConfig {
            cacheroot: temp_dir
                .path()
                .join("cache")
                .to_str()
                .unwrap()
                .to_string(),
            upgradedelay: 0,
            migratedelay: 1,
            ..Default::default()
        };
        adjust(&mut config);

        let connector = Arc::new(MockConnector::new());
        Self::build(config, connector, temp_dir).await
    }

    async fn build(
        config: ClusterConfig,
        connector: Arc<MockConnector>,
        temp_dir: tempfile::TempDir,
    ) -> Result<Self> {
        let discovery = Arc::new(ScriptedDiscovery::new());
        let discovery_tx = discovery.sender();
        let notifier = Arc::new(CaptureNotifier::default());
        let cluster = Cluster::new(
            config.clone(),
            discovery,
            notifier.clone(),
            connector.clone(),
        )?;
        cluster.clone().start().await?;
        Ok(Self {
            cluster,
            connector,
            notifier,
            discovery_tx,
            config,
            _temp_dir: temp_dir,
        })
    }

    /// Stops the cluster and builds a fresh one over the same cache root
    /// and daemons, as a process restart would.
    pub async fn restart(self) -> Result<Self> {
        self.cluster.stop().await;
        Self::build(self.config.clone(), self.connector.clone(), self._temp_dir).await
    }

    /// Seeds the nodes and announces them through discovery.
    pub async fn add_nodes(&self, nodes: &[(&str, &str)]) -> Result<()> {
        let mut added = Vec::new();
        for (ip, name) in nodes {
            let node = self.connector.seed_node(ip, name).await;
            added.push(node_entry(&node));
        }
        self.discovery_tx
            .send(WatchBatch {
                added,
                removed: vec![],
                error: None,
            })
            .await?;
        Ok(())
    }

    /// Announces a node's removal through discovery.
    pub async fn remove_node(&self, key: &str) -> Result<()> {
        let node = self.connector.node(key).await;
        self.discovery_tx
            .send(WatchBatch {
                added: vec![],
                removed: vec![node_entry(&node)],
                error: None,
            })
            .await?;
        Ok(())
    }

    pub async fn wait_engines_healthy(&self, keys: &[&str]) {
        wait_until("engines healthy", || async move {
            for key in keys {
                match self.cluster.get_engine(key).await {
                    Some(engine) if engine.is_healthy() => {}
                    _ => return false,
                }
            }
            true
        })
        .await;
    }
}

pub async fn wait_until<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..500 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, Layer};
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing::subscriber::set_global_default(
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_filter(env_filter)),
    );
}
