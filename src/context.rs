use std::sync::{Arc, OnceLock, Weak};

use data_model::{MetaData, MetaId, NodeData};

use crate::engine::Engine;

/// Capability interface the sub-components (pool, restorer, upgrade and
/// migrate batchers) hold on the cluster aggregator. Injected as a weak
/// handle after construction so the ownership graph stays acyclic and the
/// components can be tested against a stub.
#[async_trait::async_trait]
pub trait ClusterContext: Send + Sync {
    /// Last-known discovery identity for a server, by IP or name.
    async fn node_data(&self, ip: &str, name: &str) -> Option<NodeData>;

    /// Whether an engine for the server exists in a connectable state.
    async fn has_live_engine(&self, ip: &str, name: &str) -> bool;

    /// Publishes a freshly connected engine.
    async fn register_engine(&self, engine: Arc<Engine>);

    /// Marks a server's engine as gone from the fleet.
    async fn engine_offline(&self, ip: &str, name: &str);

    async fn list_meta_data(&self) -> Vec<MetaData>;

    async fn group_engines(&self, group_id: &str) -> Vec<Arc<Engine>>;

    /// Reconciles one meta's placements back toward its declared instance
    /// count.
    async fn recover_meta(&self, meta_id: &MetaId);

    /// Recreates every container of the meta with the new image tag.
    /// Returns whether the batch succeeded.
    async fn execute_upgrade(&self, meta_id: &MetaId, image_tag: &str) -> bool;
}

/// Write-once slot for the weak back-pointer.
#[derive(Default)]
pub struct ContextHandle {
    slot: OnceLock<Weak<dyn ClusterContext>>,
}

impl ContextHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, context: Weak<dyn ClusterContext>) {
        let _ = self.slot.set(context);
    }

    pub fn get(&self) -> Option<Arc<dyn ClusterContext>> {
        self.slot.get().and_then(Weak::upgrade)
    }
}
