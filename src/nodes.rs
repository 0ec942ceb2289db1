use std::collections::HashMap;

use data_model::NodeData;
use tokio::sync::RwLock;

/// Last-known node identity per discovery key.
#[derive(Default)]
pub struct NodeCache {
    nodes: RwLock<HashMap<String, NodeData>>,
}

impl NodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, key: &str, node: NodeData) {
        self.nodes.write().await.insert(key.to_string(), node);
    }

    pub async fn remove(&self, key: &str) -> Option<NodeData> {
        self.nodes.write().await.remove(key)
    }

    /// Looks a node up by either of its identities.
    pub async fn get(&self, ip_or_name: &str) -> Option<NodeData> {
        self.nodes
            .read()
            .await
            .values()
            .find(|node| {
                (!node.ip.is_empty() && node.ip == ip_or_name)
                    || (!node.name.is_empty() && node.name == ip_or_name)
            })
            .cloned()
    }

    pub async fn snapshot(&self) -> Vec<NodeData> {
        self.nodes.read().await.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use data_model::test_objects::tests::mock_node;

    use super::*;

    #[tokio::test]
    async fn test_lookup_by_ip_or_name() {
        let cache = NodeCache::new();
        cache
            .add("nodes/192.168.1.10", mock_node("192.168.1.10", "node01"))
            .await;

        assert!(cache.get("192.168.1.10").await.is_some());
        assert!(cache.get("NODE01").await.is_some());
        assert!(cache.get("node02").await.is_none());

        cache.remove("nodes/192.168.1.10").await;
        assert!(cache.get("192.168.1.10").await.is_none());
    }
}
