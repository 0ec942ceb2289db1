use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use data_model::{Container, ContainerAction, ContainerConfig, ContainerInfo, NodeData};

/// Identity and capacity reported by an engine's daemon on handshake.
#[derive(Debug, Clone, Default)]
pub struct EngineInfo {
    pub id: String,
    pub cpus: i64,
    pub memory: i64,
    pub labels: HashMap<String, String>,
}

/// Remote API of one server's container daemon. Transport, timeouts, and
/// request retries are the implementation's concern.
#[async_trait::async_trait]
pub trait EngineApiClient: Send + Sync {
    async fn info(&self) -> Result<EngineInfo>;

    async fn list_containers(&self) -> Result<Vec<Container>>;

    async fn create_container(&self, config: &ContainerConfig) -> Result<ContainerInfo>;

    async fn remove_container(&self, container_id: &str) -> Result<()>;

    async fn operate_container(&self, container_id: &str, action: ContainerAction) -> Result<()>;
}

/// Builds a daemon client session for a discovered node.
#[async_trait::async_trait]
pub trait EngineConnector: Send + Sync {
    async fn connect(&self, node: &NodeData) -> Result<Arc<dyn EngineApiClient>>;
}
