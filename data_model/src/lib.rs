pub mod test_objects;

use std::{
    collections::HashMap,
    fmt::{self, Display},
};

use serde::{Deserialize, Serialize};

/// Env variables injected into every container placed by the cluster.
pub const ENV_CLUSTER_GROUPID: &str = "HUMPBACK_CLUSTER_GROUPID";
pub const ENV_CLUSTER_METAID: &str = "HUMPBACK_CLUSTER_METAID";
pub const ENV_CLUSTER_CONTAINER_INDEX: &str = "HUMPBACK_CLUSTER_CONTAINER_INDEX";
pub const ENV_CLUSTER_CONTAINER_ORIGINALNAME: &str = "HUMPBACK_CLUSTER_CONTAINER_ORIGINALNAME";

/// Label keys carrying the meta identity on a placed container spec.
pub const LABEL_CLUSTER_GROUPID: &str = "HUMPBACK_CLUSTER_GROUPID";
pub const LABEL_CLUSTER_METAID: &str = "HUMPBACK_CLUSTER_METAID";

/// Prefix of every container name owned by the cluster.
pub const CLUSTER_CONTAINER_NAME_PREFIX: &str = "CLUSTER";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct MetaId(String);

impl MetaId {
    pub fn new(id: String) -> Self {
        Self(id)
    }

    /// Allocates a fresh globally unique meta id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

impl Display for MetaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for MetaId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Picks the identity of a server: IP when present, host name otherwise.
pub fn select_ip_or_name<'a>(ip: &'a str, name: &'a str) -> &'a str {
    if !ip.is_empty() {
        ip
    } else {
        name
    }
}

/// A declared member of a group. Either field may be empty; the server is
/// identified by whichever is set, IP preferred.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub struct Server {
    #[serde(rename = "IP")]
    pub ip: String,
    pub name: String,
}

impl Server {
    pub fn new(ip: &str, name: &str) -> Self {
        Self {
            ip: ip.to_string(),
            name: name.to_uppercase(),
        }
    }

    pub fn key(&self) -> &str {
        select_ip_or_name(&self.ip, &self.name)
    }
}

/// A named declarative set of servers that can host replicas of the metas
/// bound to it.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct Group {
    #[serde(rename = "ID")]
    pub id: String,
    pub name: String,
    pub is_cluster: bool,
    #[serde(rename = "ClusterLocation")]
    pub location: String,
    pub servers: Vec<Server>,
    pub contact_info: String,
}

/// Node identity decoded from a discovery entry.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct NodeData {
    #[serde(rename = "IP")]
    pub ip: String,
    pub name: String,
    #[serde(rename = "APIAddr")]
    pub api_addr: String,
    #[serde(default)]
    pub cpus: i64,
    #[serde(default)]
    pub memory: i64,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl NodeData {
    /// Decodes a discovery entry payload. Names are canonicalized to upper
    /// case on ingress.
    pub fn from_slice(data: &[u8]) -> anyhow::Result<Self> {
        let mut node: NodeData = serde_json::from_slice(data)?;
        node.name = node.name.to_uppercase();
        Ok(node)
    }

    pub fn key(&self) -> &str {
        select_ip_or_name(&self.ip, &self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub struct WebHook {
    #[serde(rename = "URL")]
    pub url: String,
    #[serde(default)]
    pub secret_token: String,
}

/// Declared container spec, as submitted with a deployment intent and as
/// stored in base configs. Once placed, the spec carries the meta identity
/// in its labels and env.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerConfig {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Memory reservation in bytes.
    #[serde(default)]
    pub memory: i64,
    /// CPU reservation in cores.
    #[serde(default)]
    pub cpus: f64,
    #[serde(default)]
    pub restart_policy: String,
}

impl ContainerConfig {
    /// Rewrites the image reference to carry `tag`, replacing any existing
    /// tag.
    pub fn with_image_tag(&self, tag: &str) -> Self {
        let mut config = self.clone();
        let repository = match config.image.rsplit_once(':') {
            // A colon inside the last path segment is a tag separator; a
            // colon before a slash belongs to a registry port.
            Some((repo, rest)) if !rest.contains('/') => repo.to_string(),
            _ => config.image.clone(),
        };
        config.image = format!("{}:{}", repository, tag);
        config
    }

    pub fn set_cluster_identity(&mut self, group_id: &str, meta_id: &MetaId) {
        self.labels
            .insert(LABEL_CLUSTER_GROUPID.to_string(), group_id.to_string());
        self.labels
            .insert(LABEL_CLUSTER_METAID.to_string(), meta_id.get().to_string());
    }

    /// The meta this spec belongs to, when it was placed by the cluster.
    pub fn meta_id(&self) -> Option<MetaId> {
        self.labels
            .get(LABEL_CLUSTER_METAID)
            .map(|id| MetaId::from(id.as_str()))
    }

    pub fn group_id(&self) -> Option<&str> {
        self.labels.get(LABEL_CLUSTER_GROUPID).map(String::as_str)
    }
}

/// Observed runtime facts about a container, as reported by the engine's
/// daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerInfo {
    #[serde(rename = "ID")]
    pub id: String,
    pub state: String,
    #[serde(default)]
    pub image: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "PascalCase")]
pub struct Container {
    pub info: ContainerInfo,
    pub config: ContainerConfig,
}

impl Container {
    pub fn meta_id(&self) -> Option<MetaId> {
        self.config.meta_id()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ContainerAction {
    Start,
    Stop,
    Restart,
    Kill,
    Pause,
    Unpause,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum EngineState {
    Pending,
    Healthy,
    Unhealthy,
    Disconnected,
}

impl EngineState {
    pub fn from_u8(value: u8) -> EngineState {
        match value {
            0 => EngineState::Pending,
            1 => EngineState::Healthy,
            2 => EngineState::Unhealthy,
            _ => EngineState::Disconnected,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            EngineState::Pending => 0,
            EngineState::Healthy => 1,
            EngineState::Unhealthy => 2,
            EngineState::Disconnected => 3,
        }
    }
}

/// One placed replica's durable record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "PascalCase")]
pub struct BaseConfig {
    #[serde(rename = "ID")]
    pub id: String,
    pub index: u32,
    pub config: ContainerConfig,
}

/// The canonical spec of a replicated workload.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct MetaBase {
    #[serde(rename = "MetaID")]
    pub meta_id: MetaId,
    #[serde(rename = "GroupID")]
    pub group_id: String,
    pub instances: usize,
    #[serde(default)]
    pub web_hooks: Vec<WebHook>,
    pub config: ContainerConfig,
}

/// A meta plus its current placement records.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct MetaData {
    #[serde(flatten)]
    pub base: MetaBase,
    #[serde(default)]
    pub base_configs: Vec<BaseConfig>,
}

impl MetaData {
    pub fn meta_id(&self) -> &MetaId {
        &self.base.meta_id
    }

    pub fn group_id(&self) -> &str {
        &self.base.group_id
    }

    pub fn config_name(&self) -> &str {
        &self.base.config.name
    }
}

/// Engine state transition observed by the discovery watcher, reported in
/// watch notifications.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct WatchEngine {
    #[serde(rename = "IP")]
    pub ip: String,
    pub name: String,
    pub state: EngineState,
}

impl WatchEngine {
    pub fn new(ip: &str, name: &str, state: EngineState) -> Self {
        Self {
            ip: ip.to_string(),
            name: name.to_string(),
            state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_ip_or_name() {
        assert_eq!(select_ip_or_name("192.168.1.10", "NODE01"), "192.168.1.10");
        assert_eq!(select_ip_or_name("", "NODE01"), "NODE01");
    }

    #[test]
    fn test_node_data_decode_uppercases_name() {
        let raw = br#"{"IP":"192.168.1.10","Name":"node01","APIAddr":"192.168.1.10:2375"}"#;
        let node = NodeData::from_slice(raw).unwrap();
        assert_eq!(node.name, "NODE01");
        assert_eq!(node.key(), "192.168.1.10");
    }

    #[test]
    fn test_node_data_decode_rejects_garbage() {
        assert!(NodeData::from_slice(b"{\"IP\":").is_err());
    }

    #[test]
    fn test_with_image_tag() {
        let config = ContainerConfig {
            image: "library/nginx:1.25".to_string(),
            ..Default::default()
        };
        assert_eq!(config.with_image_tag("1.27").image, "library/nginx:1.27");

        let untagged = ContainerConfig {
            image: "library/nginx".to_string(),
            ..Default::default()
        };
        assert_eq!(untagged.with_image_tag("v2").image, "library/nginx:v2");

        let with_port = ContainerConfig {
            image: "registry.local:5000/nginx".to_string(),
            ..Default::default()
        };
        assert_eq!(
            with_port.with_image_tag("v2").image,
            "registry.local:5000/nginx:v2"
        );
    }

    #[test]
    fn test_cluster_identity_labels() {
        let meta_id = MetaId::from("m1");
        let mut config = ContainerConfig::default();
        config.set_cluster_identity("g1", &meta_id);
        assert_eq!(config.meta_id(), Some(meta_id));
        assert_eq!(config.group_id(), Some("g1"));
    }

    #[test]
    fn test_container_action_strings() {
        assert_eq!(ContainerAction::Restart.to_string(), "restart");
        assert_eq!(
            "unpause".parse::<ContainerAction>().unwrap(),
            ContainerAction::Unpause
        );
    }

    #[test]
    fn test_engine_state_round_trip() {
        for state in [
            EngineState::Pending,
            EngineState::Healthy,
            EngineState::Unhealthy,
            EngineState::Disconnected,
        ] {
            assert_eq!(EngineState::from_u8(state.as_u8()), state);
        }
    }
}
