use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
};

use anyhow::{bail, Context, Result};
use data_model::{
    select_ip_or_name, Container, ContainerAction, ContainerConfig, EngineState, MetaId, NodeData,
    Server,
};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::client::EngineApiClient;

/// A live client session to one server's container daemon.
///
/// The engine owns the last-observed container map for its host and keeps
/// it in sync with the ops it performs. All daemon I/O goes through the
/// injected [`EngineApiClient`].
pub struct Engine {
    pub id: String,
    pub name: String,
    pub ip: String,
    pub api_addr: String,
    pub cpus: i64,
    pub memory: i64,
    pub labels: HashMap<String, String>,
    overcommit_ratio: f64,
    state: AtomicU8,
    containers: RwLock<HashMap<String, Container>>,
    client: Arc<dyn EngineApiClient>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("ip", &self.ip)
            .field("api_addr", &self.api_addr)
            .field("cpus", &self.cpus)
            .field("memory", &self.memory)
            .field("labels", &self.labels)
            .field("overcommit_ratio", &self.overcommit_ratio)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Connects a discovered node: fetches the daemon identity, loads the
    /// container list, and reports the engine Healthy.
    pub async fn handshake(
        node: &NodeData,
        client: Arc<dyn EngineApiClient>,
        overcommit_ratio: f64,
    ) -> Result<Arc<Engine>> {
        let info = client
            .info()
            .await
            .with_context(|| format!("engine {} daemon info failed", node.key()))?;

        let engine = Arc::new(Engine {
            id: info.id,
            name: node.name.clone(),
            ip: node.ip.clone(),
            api_addr: node.api_addr.clone(),
            cpus: if info.cpus > 0 { info.cpus } else { node.cpus },
            memory: if info.memory > 0 {
                info.memory
            } else {
                node.memory
            },
            labels: info.labels,
            overcommit_ratio,
            state: AtomicU8::new(EngineState::Pending.as_u8()),
            containers: RwLock::new(HashMap::new()),
            client,
        });
        engine.refresh_containers().await?;
        engine.set_state(EngineState::Healthy);
        debug!(engine = engine.key(), "engine handshake complete");
        Ok(engine)
    }

    /// The engine's identity within the fleet: IP when known, name
    /// otherwise.
    pub fn key(&self) -> &str {
        select_ip_or_name(&self.ip, &self.name)
    }

    pub fn state(&self) -> EngineState {
        EngineState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn set_state(&self, state: EngineState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    pub fn is_healthy(&self) -> bool {
        self.state() == EngineState::Healthy
    }

    /// Effective capacity after overcommit: `(1 + o) × reported`.
    pub fn total_memory(&self) -> i64 {
        ((1.0 + self.overcommit_ratio) * self.memory as f64) as i64
    }

    pub fn total_cpus(&self) -> f64 {
        (1.0 + self.overcommit_ratio) * self.cpus as f64
    }

    pub async fn used_resources(&self) -> (i64, f64) {
        let containers = self.containers.read().await;
        let memory = containers.values().map(|c| c.config.memory).sum();
        let cpus = containers.values().map(|c| c.config.cpus).sum();
        (memory, cpus)
    }

    /// Remaining headroom `(memory, cpus)`; negative when the host is
    /// oversubscribed past its effective capacity.
    pub async fn free_resources(&self) -> (i64, f64) {
        let (used_memory, used_cpus) = self.used_resources().await;
        (
            self.total_memory() - used_memory,
            self.total_cpus() - used_cpus,
        )
    }

    fn ensure_operable(&self) -> Result<()> {
        let state = self.state();
        if state != EngineState::Healthy {
            bail!("engine state is {}", state);
        }
        Ok(())
    }

    pub async fn create_container(&self, config: ContainerConfig) -> Result<Container> {
        self.ensure_operable()?;
        let info = self.client.create_container(&config).await?;
        let container = Container { info, config };
        self.containers
            .write()
            .await
            .insert(container.info.id.clone(), container.clone());
        Ok(container)
    }

    pub async fn remove_container(&self, container_id: &str) -> Result<()> {
        self.ensure_operable()?;
        self.client.remove_container(container_id).await?;
        self.containers.write().await.remove(container_id);
        Ok(())
    }

    pub async fn operate_container(
        &self,
        action: ContainerAction,
        container_id: &str,
    ) -> Result<()> {
        self.ensure_operable()?;
        self.client.operate_container(container_id, action).await
    }

    /// Refetches the container list from the daemon. A failed refresh
    /// marks the engine Unhealthy; the next successful one restores it.
    pub async fn refresh_containers(&self) -> Result<()> {
        match self.client.list_containers().await {
            Ok(containers) => {
                let mut map = self.containers.write().await;
                map.clear();
                for container in containers {
                    map.insert(container.info.id.clone(), container);
                }
                if self.state() == EngineState::Unhealthy {
                    self.set_state(EngineState::Healthy);
                }
                Ok(())
            }
            Err(err) => {
                warn!(engine = self.key(), "containers refresh failed: {err:#}");
                self.set_state(EngineState::Unhealthy);
                Err(err).with_context(|| format!("engine {} refresh failed", self.key()))
            }
        }
    }

    /// Containers bound to the given meta.
    pub async fn containers(&self, meta_id: &MetaId) -> Vec<Container> {
        self.containers
            .read()
            .await
            .values()
            .filter(|c| c.meta_id().as_ref() == Some(meta_id))
            .cloned()
            .collect()
    }

    pub async fn container(&self, container_id: &str) -> Option<Container> {
        self.containers.read().await.get(container_id).cloned()
    }

    pub async fn all_containers(&self) -> Vec<Container> {
        self.containers.read().await.values().cloned().collect()
    }

    pub async fn has_meta(&self, meta_id: &MetaId) -> bool {
        self.containers
            .read()
            .await
            .values()
            .any(|c| c.meta_id().as_ref() == Some(meta_id))
    }

    pub async fn has_container(&self, container_id: &str) -> bool {
        self.containers.read().await.contains_key(container_id)
    }

    pub async fn container_count(&self, meta_id: &MetaId) -> usize {
        self.containers
            .read()
            .await
            .values()
            .filter(|c| c.meta_id().as_ref() == Some(meta_id))
            .count()
    }

    pub async fn summary(&self) -> EngineSummary {
        let (free_memory, free_cpus) = self.free_resources().await;
        EngineSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            ip: self.ip.clone(),
            api_addr: self.api_addr.clone(),
            cpus: self.cpus,
            memory: self.memory,
            free_cpus,
            free_memory,
            labels: self.labels.clone(),
            state: self.state().to_string(),
        }
    }
}

/// Snapshot of an engine for read APIs; also stands in for declared
/// servers that discovery has not observed.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct EngineSummary {
    #[serde(rename = "ID")]
    pub id: String,
    pub name: String,
    #[serde(rename = "IP")]
    pub ip: String,
    #[serde(rename = "APIAddr")]
    pub api_addr: String,
    pub cpus: i64,
    pub memory: i64,
    pub free_cpus: f64,
    pub free_memory: i64,
    pub labels: HashMap<String, String>,
    pub state: String,
}

impl EngineSummary {
    pub fn disconnected(server: &Server) -> Self {
        EngineSummary {
            id: String::new(),
            name: server.name.clone(),
            ip: server.ip.clone(),
            api_addr: String::new(),
            cpus: 0,
            memory: 0,
            free_cpus: 0.0,
            free_memory: 0,
            labels: HashMap::new(),
            state: EngineState::Disconnected.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use data_model::test_objects::tests::{mock_container_config, mock_node};

    use super::*;
    use crate::testing::MockDaemon;

    const GIB: i64 = 1024 * 1024 * 1024;

    async fn healthy_engine(overcommit: f64) -> (Arc<Engine>, Arc<MockDaemon>) {
        let daemon = Arc::new(MockDaemon::new("e1", 2, 4 * GIB));
        let engine = Engine::handshake(
            &mock_node("192.168.1.10", "node01"),
            daemon.clone(),
            overcommit,
        )
        .await
        .unwrap();
        (engine, daemon)
    }

    #[tokio::test]
    async fn test_handshake_reports_healthy() {
        let (engine, _daemon) = healthy_engine(0.05).await;
        assert!(engine.is_healthy());
        assert_eq!(engine.key(), "192.168.1.10");
        assert_eq!(engine.name, "NODE01");
    }

    #[tokio::test]
    async fn test_overcommit_scales_capacity() {
        let (engine, _daemon) = healthy_engine(0.5).await;
        assert_eq!(engine.total_memory(), 6 * GIB);
        assert_eq!(engine.total_cpus(), 3.0);

        let (undersubscribed, _daemon) = healthy_engine(-0.25).await;
        assert_eq!(undersubscribed.total_memory(), 3 * GIB);
        assert!(undersubscribed.total_memory() < undersubscribed.memory);
    }

    #[tokio::test]
    async fn test_create_and_remove_update_local_map() {
        let (engine, _daemon) = healthy_engine(0.05).await;
        let meta_id = MetaId::from("m1");
        let mut config = mock_container_config("web");
        config.set_cluster_identity("g1", &meta_id);

        let container = engine.create_container(config).await.unwrap();
        assert!(engine.has_container(&container.info.id).await);
        assert!(engine.has_meta(&meta_id).await);
        assert_eq!(engine.container_count(&meta_id).await, 1);

        let (free_memory, free_cpus) = engine.free_resources().await;
        assert!(free_memory < engine.total_memory());
        assert!(free_cpus < engine.total_cpus());

        engine.remove_container(&container.info.id).await.unwrap();
        assert!(!engine.has_meta(&meta_id).await);
    }

    #[tokio::test]
    async fn test_refresh_picks_up_daemon_sightings() {
        let (engine, daemon) = healthy_engine(0.05).await;
        let meta_id = MetaId::from("m1");
        daemon
            .insert_container(data_model::test_objects::tests::mock_placed_container(
                "c-ext", "g1", &meta_id, "web",
            ))
            .await;
        assert!(!engine.has_meta(&meta_id).await);

        engine.refresh_containers().await.unwrap();
        assert!(engine.has_container("c-ext").await);
        assert!(engine.has_meta(&meta_id).await);
    }

    #[tokio::test]
    async fn test_refresh_failure_marks_unhealthy_and_ops_fail_fast() {
        let (engine, daemon) = healthy_engine(0.05).await;
        daemon.fail_refresh(true);
        assert!(engine.refresh_containers().await.is_err());
        assert_eq!(engine.state(), EngineState::Unhealthy);

        let err = engine
            .create_container(mock_container_config("web"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("engine state is Unhealthy"));

        daemon.fail_refresh(false);
        engine.refresh_containers().await.unwrap();
        assert!(engine.is_healthy());
    }
}
