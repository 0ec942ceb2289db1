use std::{
    collections::{HashMap, HashSet},
    path::Path,
    sync::Arc,
};

use anyhow::anyhow;
use data_model::{
    select_ip_or_name, BaseConfig, Container, ContainerAction, ContainerConfig, EngineState,
    Group, MetaBase, MetaData, MetaId, NodeData, Server, WatchEngine, WebHook,
    CLUSTER_CONTAINER_NAME_PREFIX, ENV_CLUSTER_CONTAINER_INDEX,
    ENV_CLUSTER_CONTAINER_ORIGINALNAME, ENV_CLUSTER_GROUPID, ENV_CLUSTER_METAID,
};
use state_store::ContainersConfigCache;
use tokio::sync::{oneshot, watch, RwLock};
use tracing::{error, info, warn};

use crate::{
    client::EngineConnector,
    config::ClusterConfig,
    context::ClusterContext,
    discovery::{DiscoveryBackend, WatchBatch},
    engine::{Engine, EngineSummary},
    errors::ClusterError,
    hooks::{HooksProcessor, MetaEvent},
    migrator::MigrateCache,
    nodes::NodeCache,
    notify::NotifySender,
    placement::{select_engines, EnginesFilter},
    pool::EnginesPool,
    restorer::MetaRestorer,
    types::{
        CreatedContainers, CreatedPair, EngineContainer, GroupContainer, GroupContainers,
        OperatedContainers, OperatedPair, RemovedContainers, RemovedPair, UpgradedContainers,
        UpgradedPair,
    },
    upgrader::UpgradeCache,
};

/// A workload with a create/reduce/remove batch in flight. Keyed by the
/// workload name; gates admission of conflicting operations.
#[derive(Debug, Clone)]
struct PendingContainer {
    group_id: String,
    name: String,
}

#[derive(Default)]
struct ClusterInner {
    groups: HashMap<String, Group>,
    engines: HashMap<String, Arc<Engine>>,
    pending_containers: HashMap<String, PendingContainer>,
}

impl ClusterInner {
    fn engine_of_server(&self, server: &Server) -> Option<Arc<Engine>> {
        self.engine_by(&server.ip, &server.name)
    }

    fn engine_by(&self, ip: &str, name: &str) -> Option<Arc<Engine>> {
        if !ip.is_empty() {
            if let Some(engine) = self.engines.values().find(|e| e.ip == ip) {
                return Some(engine.clone());
            }
        }
        if !name.is_empty() {
            if let Some(engine) = self.engines.values().find(|e| e.name == name) {
                return Some(engine.clone());
            }
        }
        None
    }

    fn in_groups_contains(&self, ip: &str, name: &str) -> bool {
        for group in self.groups.values() {
            for server in &group.servers {
                if !ip.is_empty() && server.ip == ip {
                    return true;
                }
            }
        }
        for group in self.groups.values() {
            for server in &group.servers {
                if !name.is_empty() && server.name == name {
                    return true;
                }
            }
        }
        false
    }

    fn group_engines(&self, group_id: &str) -> Option<Vec<Arc<Engine>>> {
        let group = self.groups.get(group_id)?;
        let mut engines = Vec::new();
        let mut seen = HashSet::new();
        for server in &group.servers {
            if let Some(engine) = self.engine_of_server(server) {
                if seen.insert(engine.key().to_string()) {
                    engines.push(engine);
                }
            }
        }
        Some(engines)
    }
}

enum PlaceError {
    NoEngine,
    Create {
        engine_key: String,
        source: anyhow::Error,
    },
}

impl PlaceError {
    /// Terminal errors are not worth retrying for this instance: there is
    /// no candidate engine, or the daemon reported a missing image.
    fn is_terminal(&self) -> bool {
        match self {
            PlaceError::NoEngine => true,
            PlaceError::Create { source, .. } => source.to_string().contains(" not found"),
        }
    }

    fn into_error(self) -> anyhow::Error {
        match self {
            PlaceError::NoEngine => anyhow!("{}", ClusterError::NoEngineAvailable),
            PlaceError::Create { engine_key, source } => {
                anyhow!("engine {}: {:#}", engine_key, source)
            }
        }
    }
}

/// The cluster control core: owns groups, engines, and the pending-set,
/// and drives every lifecycle operation against the fleet. Reads snapshot
/// the guarded maps; no daemon I/O happens while a lock is held.
pub struct Cluster {
    pub location: String,
    create_retry: u32,
    pub(crate) node_cache: NodeCache,
    pub(crate) config_cache: Arc<ContainersConfigCache>,
    pub(crate) upgrader: Arc<UpgradeCache>,
    pub(crate) migrator: Arc<MigrateCache>,
    pub(crate) engines_pool: Arc<EnginesPool>,
    pub(crate) restorer: Arc<MetaRestorer>,
    hooks: Arc<HooksProcessor>,
    discovery: Arc<dyn DiscoveryBackend>,
    notifier: Arc<dyn NotifySender>,
    inner: RwLock<ClusterInner>,
    shutdown_tx: watch::Sender<()>,
}

impl Cluster {
    pub fn new(
        config: ClusterConfig,
        discovery: Arc<dyn DiscoveryBackend>,
        notifier: Arc<dyn NotifySender>,
        connector: Arc<dyn EngineConnector>,
    ) -> anyhow::Result<Arc<Cluster>> {
        let config = config.normalized();
        let cache_root = if config.cacheroot.is_empty() {
            None
        } else {
            Some(Path::new(config.cacheroot.as_str()))
        };
        let config_cache = Arc::new(ContainersConfigCache::new(cache_root)?);

        let (shutdown_tx, _) = watch::channel(());
        let cluster = Arc::new(Cluster {
            location: config.location.clone(),
            create_retry: config.create_retry(),
            node_cache: NodeCache::new(),
            config_cache,
            upgrader: Arc::new(UpgradeCache::new(config.upgrade_delay())),
            migrator: Arc::new(MigrateCache::new(config.migrate_delay())),
            engines_pool: Arc::new(EnginesPool::new(connector, config.overcommit)),
            restorer: Arc::new(MetaRestorer::new(config.recovery_interval())),
            hooks: Arc::new(HooksProcessor::new()),
            discovery,
            notifier,
            inner: RwLock::new(ClusterInner::default()),
            shutdown_tx,
        });

        let context = {
            let strong: Arc<dyn ClusterContext> = cluster.clone();
            Arc::downgrade(&strong)
        };
        cluster.engines_pool.bind(context.clone());
        cluster.restorer.bind(context.clone());
        cluster.upgrader.bind(context.clone());
        cluster.migrator.bind(context);
        Ok(cluster)
    }

    /// Rehydrates the config cache, opens the discovery watch, and starts
    /// the background loops.
    pub async fn start(self: Arc<Self>) -> Result<(), ClusterError> {
        if let Err(err) = self.config_cache.init().await {
            error!("containers config cache init failed: {err:#}");
        }
        if !self.location.is_empty() {
            info!(location = %self.location, "cluster location");
        }

        let mut watch_rx = self.discovery.watch().await.map_err(|err| {
            error!("discovery watch failed: {err:#}");
            ClusterError::DiscoveryInvalid
        })?;
        info!("discovery service watching");

        let cluster = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    batch = watch_rx.recv() => {
                        match batch {
                            Some(batch) => cluster.handle_discovery_batch(batch).await,
                            None => break,
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            info!("discovery watch loop stopped");
        });

        self.restorer.start(self.shutdown_tx.subscribe());
        self.hooks.start(self.shutdown_tx.subscribe());
        Ok(())
    }

    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(());
        self.engines_pool.release().await;
        info!("discovery service closed");
    }

    async fn handle_discovery_batch(&self, batch: WatchBatch) {
        if let Some(err) = batch.error {
            error!("discovery watch error: {err}");
            return;
        }
        if batch.added.is_empty() && batch.removed.is_empty() {
            return;
        }

        info!(
            removed = batch.removed.len(),
            added = batch.added.len(),
            "discovery watch changes"
        );
        let mut watch_events = Vec::new();
        for entry in &batch.removed {
            let node = match NodeData::from_slice(&entry.data) {
                Ok(node) => node,
                Err(err) => {
                    error!("discovery watch removed decode error: {err:#}");
                    continue;
                }
            };
            info!(ip = %node.ip, name = %node.name, "discovery watch, removing engine");
            watch_events.push(WatchEngine::new(
                &node.ip,
                &node.name,
                EngineState::Disconnected,
            ));
            self.engines_pool.remove_engine(&node.ip, &node.name).await;
            self.node_cache.remove(&entry.key).await;
        }

        for entry in &batch.added {
            let node = match NodeData::from_slice(&entry.data) {
                Ok(node) => node,
                Err(err) => {
                    error!("discovery watch added decode error: {err:#}");
                    continue;
                }
            };
            info!(ip = %node.ip, name = %node.name, "discovery watch, adding engine");
            watch_events.push(WatchEngine::new(&node.ip, &node.name, EngineState::Healthy));
            self.node_cache.add(&entry.key, node.clone()).await;
            self.engines_pool.add_engine(&node.ip, &node.name).await;
        }

        self.notifier
            .notify_group_engines_watch_event(
                "cluster discovery some engines state changed.",
                &watch_events,
            )
            .await;
    }

    // ---- read surface -------------------------------------------------

    pub async fn get_engine(&self, ip: &str) -> Option<Arc<Engine>> {
        self.inner.read().await.engines.get(ip).cloned()
    }

    pub async fn get_groups(&self) -> Vec<Group> {
        self.inner.read().await.groups.values().cloned().collect()
    }

    pub async fn get_group(&self, group_id: &str) -> Option<Group> {
        self.inner.read().await.groups.get(group_id).cloned()
    }

    /// Engines of the group that discovery has observed. `None` when the
    /// group itself is unknown.
    pub async fn get_group_engines(&self, group_id: &str) -> Option<Vec<Arc<Engine>>> {
        self.inner.read().await.group_engines(group_id)
    }

    /// Every declared server of the group, with Disconnected placeholders
    /// for the ones without a live engine.
    pub async fn get_group_all_engines(&self, group_id: &str) -> Option<Vec<EngineSummary>> {
        let (servers, engines) = {
            let inner = self.inner.read().await;
            let group = inner.groups.get(group_id)?;
            let engines: Vec<Option<Arc<Engine>>> = group
                .servers
                .iter()
                .map(|server| inner.engine_of_server(server))
                .collect();
            (group.servers.clone(), engines)
        };

        let mut summaries = Vec::new();
        let mut seen = HashSet::new();
        for (server, engine) in servers.iter().zip(engines) {
            let summary = match engine {
                Some(engine) => engine.summary().await,
                None => EngineSummary::disconnected(server),
            };
            let key = select_ip_or_name(&summary.ip, &summary.name).to_string();
            if seen.insert(key) {
                summaries.push(summary);
            }
        }
        Some(summaries)
    }

    pub async fn get_engine_groups(&self, engine: &Engine) -> Vec<Group> {
        let inner = self.inner.read().await;
        let mut groups = Vec::new();
        let mut seen = HashSet::new();
        for group in inner.groups.values() {
            let covers = group.servers.iter().any(|server| {
                (!server.ip.is_empty() && server.ip == engine.ip)
                    || (!server.name.is_empty() && server.name == engine.name)
            });
            if covers && seen.insert(group.id.clone()) {
                groups.push(group.clone());
            }
        }
        groups
    }

    pub async fn in_groups_contains(&self, ip: &str, name: &str) -> bool {
        self.inner.read().await.in_groups_contains(ip, name)
    }

    pub async fn get_meta_data(&self, meta_id: &MetaId) -> Option<MetaData> {
        self.config_cache.get_meta_data(meta_id).await
    }

    pub async fn get_meta_base(&self, meta_id: &MetaId) -> Option<MetaBase> {
        self.config_cache
            .get_meta_data(meta_id)
            .await
            .map(|meta| meta.base)
    }

    pub async fn get_meta_data_engines(
        &self,
        meta_id: &MetaId,
    ) -> Result<(MetaData, Vec<Arc<Engine>>), ClusterError> {
        let meta = self
            .config_cache
            .get_meta_data(meta_id)
            .await
            .ok_or(ClusterError::MetaDataNotFound)?;
        let engines = self
            .get_group_engines(meta.group_id())
            .await
            .ok_or(ClusterError::GroupNotFound)?;
        Ok((meta, engines))
    }

    /// Refetches container lists from the healthy engines, in parallel.
    pub async fn refresh_engines_containers(&self, engines: &[Arc<Engine>]) {
        let refreshes = engines
            .iter()
            .filter(|engine| engine.is_healthy())
            .map(|engine| async move {
                let _ = engine.refresh_containers().await;
            });
        futures::future::join_all(refreshes).await;
    }

    async fn get_meta_engines_containers(
        &self,
        meta: &MetaData,
        engines: &HashMap<String, Arc<Engine>>,
    ) -> GroupContainer {
        let mut containers = Vec::new();
        let base_configs = self
            .config_cache
            .get_meta_data_base_configs(meta.meta_id())
            .await;
        for base_config in &base_configs {
            for engine in engines.values() {
                if engine.is_healthy() && engine.has_meta(meta.meta_id()).await {
                    if let Some(container) = engine.container(&base_config.id).await {
                        containers.push(EngineContainer {
                            ip: engine.ip.clone(),
                            host_name: engine.name.clone(),
                            container,
                        });
                        break;
                    }
                }
            }
        }
        GroupContainer {
            meta_id: meta.meta_id().clone(),
            instances: meta.base.instances,
            web_hooks: meta.base.web_hooks.clone(),
            config: meta.base.config.clone(),
            containers,
        }
    }

    pub async fn get_group_all_containers(&self, group_id: &str) -> GroupContainers {
        let group_metas = self.config_cache.get_group_meta_data(group_id).await;
        let mut meta_engines: HashMap<String, Arc<Engine>> = HashMap::new();
        for meta in &group_metas {
            if let Ok((_, engines)) = self.get_meta_data_engines(meta.meta_id()).await {
                for engine in engines {
                    if engine.is_healthy() && engine.has_meta(meta.meta_id()).await {
                        meta_engines.insert(engine.key().to_string(), engine);
                    }
                }
            }
        }

        let engines: Vec<Arc<Engine>> = meta_engines.values().cloned().collect();
        self.refresh_engines_containers(&engines).await;

        let mut group_containers = GroupContainers::new();
        for meta in &group_metas {
            group_containers.push(self.get_meta_engines_containers(meta, &meta_engines).await);
        }
        group_containers
    }

    pub async fn get_group_containers(&self, meta_id: &MetaId) -> Option<GroupContainer> {
        let (meta, engines) = self.get_meta_data_engines(meta_id).await.ok()?;
        let mut meta_engines = HashMap::new();
        for engine in engines {
            if engine.is_healthy() && engine.has_meta(meta_id).await {
                meta_engines.insert(engine.key().to_string(), engine);
            }
        }
        let refresh: Vec<Arc<Engine>> = meta_engines.values().cloned().collect();
        self.refresh_engines_containers(&refresh).await;
        Some(self.get_meta_engines_containers(&meta, &meta_engines).await)
    }

    // ---- group membership ---------------------------------------------

    /// Creates or rewrites a group. Server additions are handed to the
    /// pool; removals only when no other group still declares the server.
    pub async fn set_group(&self, group: Group) {
        let mut group = group;
        for server in &mut group.servers {
            server.name = server.name.to_uppercase();
        }

        let nodes = self.node_cache.snapshot().await;
        let group_id = group.id.clone();
        let mut add_servers = Vec::new();
        let mut remove_servers = Vec::new();
        {
            let mut inner = self.inner.write().await;
            match inner.groups.get_mut(&group.id) {
                None => {
                    info!(
                        group_id = %group.id,
                        name = %group.name,
                        servers = group.servers.len(),
                        "group created"
                    );
                    for server in &group.servers {
                        if node_of(&nodes, server).is_some() {
                            add_servers.push(server.clone());
                        }
                    }
                    inner.groups.insert(group.id.clone(), group);
                }
                Some(existing) => {
                    let origins = existing.servers.clone();
                    *existing = group.clone();
                    info!(
                        group_id = %group.id,
                        name = %group.name,
                        servers = group.servers.len(),
                        "group changed"
                    );
                    for origin in &origins {
                        let kept = group
                            .servers
                            .iter()
                            .any(|server| servers_equivalent(&nodes, origin, server));
                        if !kept {
                            remove_servers.push(origin.clone());
                        }
                    }
                    for server in &group.servers {
                        let known = origins
                            .iter()
                            .any(|origin| servers_equivalent(&nodes, origin, server));
                        if !known {
                            add_servers.push(server.clone());
                        }
                    }
                }
            }
        }

        for server in remove_servers {
            let Some(node) = node_of(&nodes, &server) else {
                continue;
            };
            let still_covered = self
                .in_groups_contains(&node.ip, &node.name)
                .await;
            if !still_covered {
                info!(
                    group_id = %group_id,
                    ip = %server.ip,
                    name = %server.name,
                    "group removed server from pool"
                );
                self.engines_pool.remove_engine(&node.ip, &node.name).await;
            } else {
                // The server still serves other groups; only this group's
                // pending migration for it is now stale.
                self.migrator.cancel(&group_id, node.key()).await;
            }
        }

        for server in add_servers {
            info!(
                group_id = %group_id,
                ip = %server.ip,
                name = %server.name,
                "group appended server to pool"
            );
            let already_live = {
                let inner = self.inner.read().await;
                inner
                    .engine_by(&server.ip, &server.name)
                    .map(|engine| engine.is_healthy())
                    .unwrap_or(false)
            };
            self.engines_pool.add_engine(&server.ip, &server.name).await;
            if already_live {
                self.migrator.cancel(&group_id, server.key()).await;
            }
        }
    }

    /// Tears a group down: pending migrations, every meta's containers
    /// (parallel across metas), the group record, and any engine no other
    /// group covers.
    pub async fn remove_group(&self, group_id: &str) -> bool {
        let Some(engines) = self.get_group_engines(group_id).await else {
            warn!(group_id, "remove group not found");
            return false;
        };

        self.migrator.remove_group(group_id).await;

        let group_metas = self.config_cache.get_group_meta_data(group_id).await;
        let removals = group_metas.iter().map(|meta| async move {
            self.remove_meta_containers(meta, "").await;
            self.config_cache.remove_meta_data(meta.meta_id()).await;
            self.hooks.hook(meta, MetaEvent::Remove);
        });
        futures::future::join_all(removals).await;
        self.config_cache.remove_group_meta_data(group_id).await;

        {
            let mut inner = self.inner.write().await;
            inner.groups.remove(group_id);
            info!(group_id, "removed group");
        }

        for engine in engines {
            if engine.is_healthy() {
                let covered = self.in_groups_contains(&engine.ip, &engine.name).await;
                if !covered {
                    info!(
                        group_id,
                        ip = %engine.ip,
                        name = %engine.name,
                        "group removed engine from pool"
                    );
                    self.engines_pool
                        .remove_engine(&engine.ip, &engine.name)
                        .await;
                }
            }
        }
        true
    }

    // ---- lifecycle operations -----------------------------------------

    pub async fn create_containers(
        &self,
        group_id: &str,
        instances: usize,
        web_hooks: Vec<WebHook>,
        config: ContainerConfig,
    ) -> Result<(MetaId, CreatedContainers), ClusterError> {
        if instances == 0 {
            return Err(ClusterError::InstancesInvalid);
        }

        let engines = self.get_group_engines(group_id).await.ok_or_else(|| {
            error!(group_id, "create containers error: {}", ClusterError::GroupNotFound);
            ClusterError::GroupNotFound
        })?;
        if engines.is_empty() {
            error!(
                group_id,
                "create containers error: {}",
                ClusterError::NoEngineAvailable
            );
            return Err(ClusterError::NoEngineAvailable);
        }

        if !self
            .check_container_name_uniqueness(group_id, &config.name)
            .await
        {
            error!(
                group_id,
                name = %config.name,
                "create containers error: {}",
                ClusterError::CreateContainerNameConflict
            );
            return Err(ClusterError::CreateContainerNameConflict);
        }

        let meta = self
            .config_cache
            .create_meta_data(group_id, instances, web_hooks, config)
            .await
            .map_err(|err| {
                error!(group_id, "create containers error: {err:#}");
                ClusterError::MetaCreateFailure
            })?;

        let (created, result_err) = self
            .place_containers(&meta, instances, meta.base.config.clone())
            .await;
        if created.is_empty() {
            self.config_cache.remove_meta_data(meta.meta_id()).await;
            let reason = result_err
                .map(|err| format!("{err:#}"))
                .unwrap_or_else(|| "no replica placed".to_string());
            return Err(ClusterError::CreateContainerFailure { reason });
        }

        self.hooks.hook(&meta, MetaEvent::Create);
        Ok((meta.meta_id().clone(), created))
    }

    pub async fn update_containers(
        &self,
        meta_id: &MetaId,
        instances: usize,
        web_hooks: Vec<WebHook>,
    ) -> Result<CreatedContainers, ClusterError> {
        if instances == 0 {
            error!(
                meta_id = meta_id.get(),
                "update containers error: {}",
                ClusterError::InstancesInvalid
            );
            return Err(ClusterError::InstancesInvalid);
        }

        let (meta, engines) = self.validate_meta_data(meta_id).await.map_err(|err| {
            error!(meta_id = meta_id.get(), "update containers error: {err}");
            err
        })?;

        if let Err(err) = self
            .config_cache
            .set_meta_data(meta_id, instances, web_hooks)
            .await
        {
            error!(meta_id = meta_id.get(), "update containers error: {err:#}");
            return Err(ClusterError::MetaDataNotFound);
        }

        if !engines.is_empty() {
            let original = meta.base_configs.len();
            if original < instances {
                self.place_containers(&meta, instances - original, meta.base.config.clone())
                    .await;
            } else if original > instances {
                self.reduce_containers(&meta, original - instances).await;
            }
        }

        self.hooks.hook(&meta, MetaEvent::Update);

        let mut created = CreatedContainers::new();
        for engine in &engines {
            if engine.is_healthy() {
                for container in engine.containers(meta.meta_id()).await {
                    created.push(CreatedPair {
                        ip: engine.ip.clone(),
                        host_name: engine.name.clone(),
                        container: container.config,
                    });
                }
            }
        }
        Ok(created)
    }

    pub async fn upgrade_containers(
        &self,
        meta_id: &MetaId,
        image_tag: &str,
    ) -> Result<UpgradedContainers, ClusterError> {
        let (meta, engines) = self.validate_meta_data(meta_id).await.map_err(|err| {
            error!(meta_id = meta_id.get(), "upgrade containers error: {err}");
            err
        })?;

        let mut total = 0usize;
        for engine in &engines {
            total += engine.container_count(meta.meta_id()).await;
        }

        let mut upgraded = UpgradedContainers::new();
        if total == 0 {
            return Ok(upgraded);
        }

        let (tx, rx) = oneshot::channel();
        self.upgrader
            .upgrade(meta.meta_id().clone(), image_tag.to_string(), tx)
            .await;
        let ok = rx.await.unwrap_or(false);
        self.hooks.hook(&meta, MetaEvent::Upgrade);
        if !ok {
            return Err(ClusterError::UpgradeFailure {
                image_tag: image_tag.to_string(),
            });
        }

        for engine in &engines {
            if engine.is_healthy() {
                for container in engine.containers(meta.meta_id()).await {
                    upgraded.push(UpgradedPair {
                        ip: engine.ip.clone(),
                        host_name: engine.name.clone(),
                        container: container.config,
                    });
                }
            }
        }
        Ok(upgraded)
    }

    /// Resolves a bare container id to its meta and operates on it.
    pub async fn operate_container(
        &self,
        container_id: &str,
        action: ContainerAction,
    ) -> Result<(MetaId, OperatedContainers), ClusterError> {
        let meta = self
            .config_cache
            .get_meta_data_of_container(container_id)
            .await
            .ok_or(ClusterError::ContainerNotFound)?;
        let operated = self
            .operate_containers(meta.meta_id(), container_id, action)
            .await?;
        Ok((meta.meta_id().clone(), operated))
    }

    /// An empty container id targets every container of the meta.
    pub async fn operate_containers(
        &self,
        meta_id: &MetaId,
        container_id: &str,
        action: ContainerAction,
    ) -> Result<OperatedContainers, ClusterError> {
        let (meta, engines) = self.validate_meta_data(meta_id).await.map_err(|err| {
            error!(
                meta_id = meta_id.get(),
                action = %action,
                "operate containers error: {err}"
            );
            err
        })?;

        let mut operated = OperatedContainers::new();
        let mut found_container = false;
        for engine in &engines {
            if found_container {
                break;
            }
            for container in engine.containers(meta.meta_id()).await {
                if container_id.is_empty() || container.info.id == container_id {
                    let error = if engine.is_healthy() {
                        match engine.operate_container(action, &container.info.id).await {
                            Ok(()) => None,
                            Err(err) => {
                                error!(
                                    engine = engine.key(),
                                    action = %action,
                                    "operate container error: {err:#}"
                                );
                                Some(format!("{err:#}"))
                            }
                        }
                    } else {
                        Some(format!("engine state is {}", engine.state()))
                    };
                    operated.push(OperatedPair {
                        ip: engine.ip.clone(),
                        host_name: engine.name.clone(),
                        container_id: container.info.id.clone(),
                        action: action.to_string(),
                        error,
                    });
                }
                if container.info.id == container_id {
                    found_container = true;
                    break;
                }
            }
        }

        self.hooks.hook(&meta, MetaEvent::Operate);
        Ok(operated)
    }

    /// Resolves a bare container id to its meta and removes it.
    pub async fn remove_container(
        &self,
        container_id: &str,
    ) -> Result<(MetaId, RemovedContainers), ClusterError> {
        let meta = self
            .config_cache
            .get_meta_data_of_container(container_id)
            .await
            .ok_or(ClusterError::ContainerNotFound)?;
        let removed = self.remove_containers(meta.meta_id(), container_id).await?;
        Ok((meta.meta_id().clone(), removed))
    }

    /// An empty container id removes every container of the meta; a meta
    /// whose placement records drain away is deleted.
    pub async fn remove_containers(
        &self,
        meta_id: &MetaId,
        container_id: &str,
    ) -> Result<RemovedContainers, ClusterError> {
        let (meta, _) = self.validate_meta_data(meta_id).await.map_err(|err| {
            error!(meta_id = meta_id.get(), "remove containers error: {err}");
            err
        })?;

        let removed = self.remove_meta_containers(&meta, container_id).await;
        self.hooks.hook(&meta, MetaEvent::Remove);

        if let Some(meta) = self.config_cache.get_meta_data(meta.meta_id()).await {
            if meta.base_configs.is_empty() {
                self.config_cache.remove_meta_data(meta.meta_id()).await;
            }
        }
        Ok(removed)
    }

    /// Prunes placement records no engine backs, then converges the live
    /// replica count back to the declared instances.
    pub async fn recovery_containers(&self, meta_id: &MetaId) -> Result<(), ClusterError> {
        let (meta, engines) = self.validate_meta_data(meta_id).await.map_err(|err| {
            warn!(meta_id = meta_id.get(), "recovery containers error: {err}");
            err
        })?;

        let base_configs = self
            .config_cache
            .get_meta_data_base_configs(meta.meta_id())
            .await;
        for base_config in &base_configs {
            let mut found = false;
            for engine in &engines {
                if engine.is_healthy() && engine.has_container(&base_config.id).await {
                    found = true;
                    break;
                }
            }
            if !found {
                self.config_cache
                    .remove_container_base_config(meta.meta_id(), &base_config.id)
                    .await;
                warn!(
                    meta_id = meta.meta_id().get(),
                    container_id = %short_id(&base_config.id),
                    "recovery removed stale container record"
                );
            }
        }

        if !engines.is_empty() {
            if let Some(count) = self
                .config_cache
                .get_meta_data_base_configs_count(meta.meta_id())
                .await
            {
                if count != meta.base.instances {
                    let meta = self
                        .config_cache
                        .get_meta_data(meta.meta_id())
                        .await
                        .unwrap_or(meta);
                    let result_err = if meta.base.instances > count {
                        let (_, err) = self
                            .place_containers(
                                &meta,
                                meta.base.instances - count,
                                meta.base.config.clone(),
                            )
                            .await;
                        err
                    } else {
                        self.reduce_containers(&meta, count - meta.base.instances)
                            .await;
                        None
                    };
                    self.hooks.hook(&meta, MetaEvent::Recovery);
                    self.notifier
                        .notify_group_meta_containers_event(
                            "Cluster Meta Containers Recovered.",
                            result_err.as_ref(),
                            meta.meta_id(),
                        )
                        .await;
                }
            }
        }
        Ok(())
    }

    // ---- placement internals ------------------------------------------

    async fn place_containers(
        &self,
        meta: &MetaData,
        instances: usize,
        config: ContainerConfig,
    ) -> (CreatedContainers, Option<anyhow::Error>) {
        self.set_pending(meta.group_id(), &config.name).await;

        let mut created = CreatedContainers::new();
        let mut result_err = None;
        let mut filter = EnginesFilter::new();
        for _ in 0..instances {
            let Some(index) = self
                .config_cache
                .make_container_idle_index(meta.meta_id())
                .await
            else {
                continue;
            };

            let mut container_config = config.clone();
            let group_prefix = &meta.group_id()[..meta.group_id().len().min(8)];
            container_config.name = format!(
                "{}-{}-{}-{}",
                CLUSTER_CONTAINER_NAME_PREFIX, group_prefix, config.name, index
            );
            container_config
                .env
                .push(format!("{}={}", ENV_CLUSTER_GROUPID, meta.group_id()));
            container_config
                .env
                .push(format!("{}={}", ENV_CLUSTER_METAID, meta.meta_id()));
            container_config
                .env
                .push(format!("{}={}", ENV_CLUSTER_CONTAINER_INDEX, index));
            container_config.env.push(format!(
                "{}={}",
                ENV_CLUSTER_CONTAINER_ORIGINALNAME, container_config.name
            ));

            let mut attempt = self
                .place_container(meta, &mut filter, container_config.clone())
                .await;
            if matches!(&attempt, Err(err) if err.is_terminal()) {
                let err = attempt.unwrap_err().into_error();
                error!(container = %container_config.name, "create container error: {err:#}");
                result_err = Some(err);
                continue;
            }
            let mut retries = 0;
            while retries < self.create_retry && attempt.is_err() {
                attempt = self
                    .place_container(meta, &mut filter, container_config.clone())
                    .await;
                retries += 1;
            }

            match attempt {
                Ok((engine, container)) => {
                    self.config_cache
                        .set_container_base_config(
                            meta.meta_id(),
                            BaseConfig {
                                id: container.info.id.clone(),
                                index,
                                config: container.config.clone(),
                            },
                        )
                        .await;
                    created.push(CreatedPair {
                        ip: engine.ip.clone(),
                        host_name: engine.name.clone(),
                        container: container.config,
                    });
                }
                Err(err) => {
                    let err = err.into_error();
                    error!(container = %container_config.name, "create container error: {err:#}");
                    result_err = Some(err);
                }
            }
        }

        self.clear_pending(&config.name).await;
        (created, result_err)
    }

    async fn place_container(
        &self,
        meta: &MetaData,
        filter: &mut EnginesFilter,
        config: ContainerConfig,
    ) -> Result<(Arc<Engine>, Container), PlaceError> {
        let engines = self
            .get_group_engines(meta.group_id())
            .await
            .unwrap_or_default();
        if engines.is_empty() {
            return Err(PlaceError::NoEngine);
        }

        for engine in &engines {
            if engine.is_healthy() && engine.has_meta(meta.meta_id()).await {
                filter.set_alloc_engine(engine);
            }
        }

        let selected = select_engines(&engines, filter).await;
        let Some(engine) = selected.first().cloned() else {
            return Err(PlaceError::NoEngine);
        };

        match engine.create_container(config).await {
            Ok(container) => Ok((engine, container)),
            Err(source) => {
                filter.set_fail_engine(&engine);
                Err(PlaceError::Create {
                    engine_key: engine.key().to_string(),
                    source,
                })
            }
        }
    }

    async fn reduce_containers(&self, meta: &MetaData, instances: usize) {
        self.set_pending(meta.group_id(), meta.config_name()).await;
        for _ in 0..instances {
            if let Err(err) = self.reduce_container(meta).await {
                error!(name = meta.config_name(), "reduce container error: {err:#}");
            }
        }
        self.clear_pending(meta.config_name()).await;
    }

    /// Removes one replica from the engine currently hosting the most of
    /// them; counts are re-read every call so successive reductions spread
    /// across the heaviest engines.
    async fn reduce_container(&self, meta: &MetaData) -> anyhow::Result<()> {
        let engines = self
            .get_group_engines(meta.group_id())
            .await
            .unwrap_or_default();
        if engines.is_empty() {
            return Err(anyhow!("{}", ClusterError::NoEngineAvailable));
        }

        let mut candidates = Vec::new();
        for engine in engines {
            if engine.is_healthy() {
                let count = engine.container_count(meta.meta_id()).await;
                if count > 0 {
                    candidates.push((engine, count));
                }
            }
        }
        if candidates.is_empty() {
            return Err(anyhow!("{}", ClusterError::NoEngineAvailable));
        }
        candidates.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.name.cmp(&b.0.name)));
        let engine = candidates[0].0.clone();

        // Prefer dropping the replica with the highest index.
        let base_configs = self
            .config_cache
            .get_meta_data_base_configs(meta.meta_id())
            .await;
        let containers = engine.containers(meta.meta_id()).await;
        let victim = containers
            .iter()
            .max_by_key(|container| {
                base_configs
                    .iter()
                    .find(|base| base.id == container.info.id)
                    .map(|base| base.index)
                    .unwrap_or(0)
            })
            .cloned()
            .ok_or_else(|| anyhow!("engine {} has no containers for meta", engine.key()))?;

        engine.remove_container(&victim.info.id).await?;
        self.config_cache
            .remove_container_base_config(meta.meta_id(), &victim.info.id)
            .await;
        Ok(())
    }

    async fn remove_meta_containers(
        &self,
        meta: &MetaData,
        container_id: &str,
    ) -> RemovedContainers {
        self.set_pending(meta.group_id(), meta.config_name()).await;

        let mut removed = RemovedContainers::new();
        if let Some(engines) = self.get_group_engines(meta.group_id()).await {
            let mut found_container = false;
            for engine in &engines {
                if found_container {
                    break;
                }
                for container in engine.containers(meta.meta_id()).await {
                    if container_id.is_empty() || container.info.id == container_id {
                        let error = if engine.is_healthy() {
                            match engine.remove_container(&container.info.id).await {
                                Ok(()) => {
                                    self.config_cache
                                        .remove_container_base_config(
                                            meta.meta_id(),
                                            &container.info.id,
                                        )
                                        .await;
                                    None
                                }
                                Err(err) => {
                                    error!(
                                        engine = engine.key(),
                                        "remove container error: {err:#}"
                                    );
                                    Some(format!("{err:#}"))
                                }
                            }
                        } else {
                            Some(format!("engine state is {}", engine.state()))
                        };
                        removed.push(RemovedPair {
                            ip: engine.ip.clone(),
                            host_name: engine.name.clone(),
                            container_id: container.info.id.clone(),
                            error,
                        });
                    }
                    if container.info.id == container_id {
                        found_container = true;
                        break;
                    }
                }
            }
        }

        self.clear_pending(meta.config_name()).await;
        removed
    }

    // ---- admission ----------------------------------------------------

    async fn set_pending(&self, group_id: &str, name: &str) {
        self.inner.write().await.pending_containers.insert(
            name.to_string(),
            PendingContainer {
                group_id: group_id.to_string(),
                name: name.to_string(),
            },
        );
    }

    async fn clear_pending(&self, name: &str) {
        self.inner.write().await.pending_containers.remove(name);
    }

    async fn contains_pending_containers(&self, group_id: &str, name: &str) -> bool {
        self.inner
            .read()
            .await
            .pending_containers
            .values()
            .any(|pending| pending.group_id == group_id && pending.name == name)
    }

    async fn check_container_name_uniqueness(&self, group_id: &str, name: &str) -> bool {
        if self.contains_pending_containers(group_id, name).await {
            return false;
        }
        self.config_cache
            .get_meta_data_of_name(group_id, name)
            .await
            .is_none()
    }

    /// Gate for Update/Upgrade/Operate/Remove/Recovery: the meta must not
    /// be claimed by the upgrade batcher, the migrate batcher, or an
    /// in-flight create/reduce/remove batch.
    pub async fn validate_meta_data(
        &self,
        meta_id: &MetaId,
    ) -> Result<(MetaData, Vec<Arc<Engine>>), ClusterError> {
        let (meta, engines) = self.get_meta_data_engines(meta_id).await?;
        if self.upgrader.contains(meta.meta_id()).await {
            return Err(ClusterError::ContainersUpgrading);
        }
        if self.migrator.contains(meta.meta_id()).await {
            return Err(ClusterError::ContainersMigrating);
        }
        if self
            .contains_pending_containers(meta.group_id(), meta.config_name())
            .await
        {
            return Err(ClusterError::ContainersSetting);
        }
        Ok((meta, engines))
    }
}

#[async_trait::async_trait]
impl ClusterContext for Cluster {
    async fn node_data(&self, ip: &str, name: &str) -> Option<NodeData> {
        self.node_cache.get(select_ip_or_name(ip, name)).await
    }

    async fn has_live_engine(&self, ip: &str, name: &str) -> bool {
        self.inner
            .read()
            .await
            .engine_by(ip, name)
            .map(|engine| engine.state() != EngineState::Disconnected)
            .unwrap_or(false)
    }

    async fn register_engine(&self, engine: Arc<Engine>) {
        let key = engine.key().to_string();
        {
            let mut inner = self.inner.write().await;
            inner.engines.insert(key.clone(), engine.clone());
        }
        info!(engine = %key, name = %engine.name, "engine registered healthy");
        // An engine that came back no longer needs its containers moved.
        self.migrator.cancel_engine(&key).await;
    }

    async fn engine_offline(&self, ip: &str, name: &str) {
        let engine = {
            let mut inner = self.inner.write().await;
            let engine = inner.engine_by(ip, name);
            if let Some(engine) = &engine {
                engine.set_state(EngineState::Disconnected);
                if !inner.in_groups_contains(&engine.ip, &engine.name) {
                    inner.engines.remove(engine.key());
                    info!(engine = engine.key(), "engine removed from cluster");
                }
            }
            engine
        };
        let Some(engine) = engine else {
            return;
        };

        // Groups that still declare the server lose replicas with it;
        // schedule their metas for migration.
        let groups = self.get_engine_groups(&engine).await;
        if groups.is_empty() {
            return;
        }
        let containers = engine.all_containers().await;
        for group in groups {
            let mut meta_ids = Vec::new();
            for container in &containers {
                let Some(meta_id) = container.meta_id() else {
                    continue;
                };
                if meta_ids.contains(&meta_id) {
                    continue;
                }
                if let Some(meta) = self.config_cache.get_meta_data(&meta_id).await {
                    if meta.group_id() == group.id {
                        meta_ids.push(meta_id);
                    }
                }
            }
            self.migrator
                .start_engine_containers(&group.id, engine.key(), meta_ids)
                .await;
        }
    }

    async fn list_meta_data(&self) -> Vec<MetaData> {
        self.config_cache.list_meta_data().await
    }

    async fn group_engines(&self, group_id: &str) -> Vec<Arc<Engine>> {
        self.get_group_engines(group_id).await.unwrap_or_default()
    }

    async fn recover_meta(&self, meta_id: &MetaId) {
        if let Err(err) = self.recovery_containers(meta_id).await {
            warn!(meta_id = meta_id.get(), "recovery failed: {err}");
        }
    }

    /// Recreates every container of the meta with the new image tag,
    /// rewriting the placement records as it goes. Containers on
    /// non-healthy engines are skipped without failing the batch; a
    /// failure on a healthy engine fails it.
    async fn execute_upgrade(&self, meta_id: &MetaId, image_tag: &str) -> bool {
        let Ok((meta, engines)) = self.get_meta_data_engines(meta_id).await else {
            return false;
        };

        let base_configs = self
            .config_cache
            .get_meta_data_base_configs(meta.meta_id())
            .await;
        let mut upgraded_any = false;
        let mut failed_any = false;
        for engine in &engines {
            for container in engine.containers(meta.meta_id()).await {
                if !engine.is_healthy() {
                    warn!(
                        engine = engine.key(),
                        container_id = %short_id(&container.info.id),
                        "skipping upgrade, engine state is {}",
                        engine.state()
                    );
                    continue;
                }
                let index = base_configs
                    .iter()
                    .find(|base| base.id == container.info.id)
                    .map(|base| base.index)
                    .unwrap_or(0);
                let new_config = container.config.with_image_tag(image_tag);
                let replaced = async {
                    engine.remove_container(&container.info.id).await?;
                    engine.create_container(new_config).await
                }
                .await;
                match replaced {
                    Ok(new_container) => {
                        self.config_cache
                            .remove_container_base_config(meta.meta_id(), &container.info.id)
                            .await;
                        self.config_cache
                            .set_container_base_config(
                                meta.meta_id(),
                                BaseConfig {
                                    id: new_container.info.id.clone(),
                                    index,
                                    config: new_container.config.clone(),
                                },
                            )
                            .await;
                        upgraded_any = true;
                    }
                    Err(err) => {
                        error!(
                            engine = engine.key(),
                            container_id = %short_id(&container.info.id),
                            "upgrade container error: {err:#}"
                        );
                        failed_any = true;
                    }
                }
            }
        }

        if upgraded_any && !failed_any {
            let new_meta_config = meta.base.config.with_image_tag(image_tag);
            if let Err(err) = self
                .config_cache
                .set_meta_config(meta.meta_id(), new_meta_config)
                .await
            {
                warn!(meta_id = meta_id.get(), "failed to persist upgraded config: {err:#}");
            }
        }
        upgraded_any && !failed_any
    }
}

fn short_id(container_id: &str) -> &str {
    &container_id[..container_id.len().min(12)]
}

fn node_of(nodes: &[NodeData], server: &Server) -> Option<NodeData> {
    nodes
        .iter()
        .find(|node| {
            (!server.ip.is_empty() && node.ip == server.ip)
                || (!server.name.is_empty() && node.name == server.name)
        })
        .cloned()
}

/// Whether two declared servers refer to the same host, resolving partial
/// identities (IP-only vs name-only) through the discovery cache.
fn servers_equivalent(nodes: &[NodeData], a: &Server, b: &Server) -> bool {
    if !a.ip.is_empty() && a.ip == b.ip {
        return true;
    }
    if !a.name.is_empty() && a.name == b.name {
        return true;
    }
    match (node_of(nodes, a), node_of(nodes, b)) {
        (Some(node_a), Some(node_b)) => node_a.key() == node_b.key(),
        _ => false,
    }
}
