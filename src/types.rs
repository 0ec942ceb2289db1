//! Per-item response pairs returned by the batch lifecycle operations.
//! A failed item carries its error text in place without aborting the
//! rest of the batch.

use data_model::{Container, ContainerConfig, MetaId, WebHook};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct CreatedPair {
    #[serde(rename = "IP")]
    pub ip: String,
    pub host_name: String,
    pub container: ContainerConfig,
}

pub type CreatedContainers = Vec<CreatedPair>;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct OperatedPair {
    #[serde(rename = "IP")]
    pub ip: String,
    pub host_name: String,
    #[serde(rename = "ContainerID")]
    pub container_id: String,
    pub action: String,
    pub error: Option<String>,
}

pub type OperatedContainers = Vec<OperatedPair>;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RemovedPair {
    #[serde(rename = "IP")]
    pub ip: String,
    pub host_name: String,
    #[serde(rename = "ContainerID")]
    pub container_id: String,
    pub error: Option<String>,
}

pub type RemovedContainers = Vec<RemovedPair>;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct UpgradedPair {
    #[serde(rename = "IP")]
    pub ip: String,
    pub host_name: String,
    pub container: ContainerConfig,
}

pub type UpgradedContainers = Vec<UpgradedPair>;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct EngineContainer {
    #[serde(rename = "IP")]
    pub ip: String,
    pub host_name: String,
    pub container: Container,
}

/// Roll-up of one meta and the containers currently observed for it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct GroupContainer {
    #[serde(rename = "MetaID")]
    pub meta_id: MetaId,
    pub instances: usize,
    pub web_hooks: Vec<WebHook>,
    pub config: ContainerConfig,
    pub containers: Vec<EngineContainer>,
}

pub type GroupContainers = Vec<GroupContainer>;
