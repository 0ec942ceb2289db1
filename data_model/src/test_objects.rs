pub mod tests {
    use std::collections::HashMap;

    use crate::{
        Container, ContainerConfig, ContainerInfo, Group, MetaId, NodeData, Server, WebHook,
    };

    pub const TEST_GROUP_ID: &str = "7d8a1f02c6b34e59a0d3b1c4e5f60718";

    pub fn mock_server(ip: &str, name: &str) -> Server {
        Server::new(ip, name)
    }

    pub fn mock_group(id: &str, servers: Vec<Server>) -> Group {
        Group {
            id: id.to_string(),
            name: format!("group-{}", id),
            is_cluster: true,
            location: "local".to_string(),
            servers,
            contact_info: "ops@example.com".to_string(),
        }
    }

    pub fn mock_node(ip: &str, name: &str) -> NodeData {
        NodeData {
            ip: ip.to_string(),
            name: name.to_uppercase(),
            api_addr: format!("{}:2375", ip),
            cpus: 2,
            memory: 4 * 1024 * 1024 * 1024,
            labels: HashMap::new(),
        }
    }

    pub fn mock_container_config(name: &str) -> ContainerConfig {
        ContainerConfig {
            name: name.to_string(),
            image: "library/nginx:1.25".to_string(),
            command: vec![],
            env: vec![],
            labels: HashMap::new(),
            memory: 256 * 1024 * 1024,
            cpus: 0.5,
            restart_policy: "always".to_string(),
        }
    }

    pub fn mock_placed_container(id: &str, group_id: &str, meta_id: &MetaId, name: &str) -> Container {
        let mut config = mock_container_config(name);
        config.set_cluster_identity(group_id, meta_id);
        Container {
            info: ContainerInfo {
                id: id.to_string(),
                state: "running".to_string(),
                image: config.image.clone(),
            },
            config,
        }
    }

    pub fn mock_webhook(url: &str) -> WebHook {
        WebHook {
            url: url.to_string(),
            secret_token: "".to_string(),
        }
    }
}
