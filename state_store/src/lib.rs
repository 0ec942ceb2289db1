//! Durable store of meta records and their base configs.
//!
//! One JSON record per meta lives under the cache root; records are
//! replaced atomically (temp file + rename) so a torn write can never be
//! observed. Files that fail to parse on load are treated as partial
//! writes and discarded.

use std::{
    collections::{HashMap, HashSet},
    fs,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context, Result};
use data_model::{BaseConfig, MetaData, MetaId, WebHook};
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Default)]
struct CacheInner {
    metas: HashMap<MetaId, MetaData>,
    // GroupID -> {MetaID}
    group_index: HashMap<String, HashSet<MetaId>>,
    // (GroupID, Config.Name) -> MetaID
    name_index: HashMap<(String, String), MetaId>,
    // ContainerID -> MetaID
    container_index: HashMap<String, MetaId>,
}

impl CacheInner {
    fn index(&mut self, meta: &MetaData) {
        self.group_index
            .entry(meta.group_id().to_string())
            .or_default()
            .insert(meta.meta_id().clone());
        self.name_index.insert(
            (meta.group_id().to_string(), meta.config_name().to_string()),
            meta.meta_id().clone(),
        );
        for base_config in &meta.base_configs {
            // Later sighting wins for a duplicated container id.
            self.container_index
                .insert(base_config.id.clone(), meta.meta_id().clone());
        }
    }

    fn deindex(&mut self, meta: &MetaData) {
        if let Some(members) = self.group_index.get_mut(meta.group_id()) {
            members.remove(meta.meta_id());
            if members.is_empty() {
                self.group_index.remove(meta.group_id());
            }
        }
        self.name_index
            .remove(&(meta.group_id().to_string(), meta.config_name().to_string()));
        for base_config in &meta.base_configs {
            if self.container_index.get(&base_config.id) == Some(meta.meta_id()) {
                self.container_index.remove(&base_config.id);
            }
        }
    }
}

pub struct ContainersConfigCache {
    cache_root: Option<PathBuf>,
    inner: RwLock<CacheInner>,
}

impl ContainersConfigCache {
    /// An empty cache root keeps the store purely in memory.
    pub fn new(cache_root: Option<&Path>) -> Result<Self> {
        if let Some(root) = cache_root {
            fs::create_dir_all(root)
                .with_context(|| format!("failed to create cache root {}", root.display()))?;
        }
        Ok(Self {
            cache_root: cache_root.map(Path::to_path_buf),
            inner: RwLock::new(CacheInner::default()),
        })
    }

    /// Rehydrates the store from the cache root. The persisted state is
    /// authoritative until engines re-report their containers.
    pub async fn init(&self) -> Result<()> {
        let Some(root) = &self.cache_root else {
            return Ok(());
        };

        let mut inner = self.inner.write().await;
        let mut loaded = 0usize;
        for dir_entry in fs::read_dir(root)? {
            let path = dir_entry?.path();
            if path.extension().map(|e| e != "json").unwrap_or(true) {
                continue;
            }
            let meta: MetaData = match fs::read(&path)
                .map_err(anyhow::Error::from)
                .and_then(|data| serde_json::from_slice(&data).map_err(anyhow::Error::from))
            {
                Ok(meta) => meta,
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        "discarding unreadable meta record: {err:#}"
                    );
                    let _ = fs::remove_file(&path);
                    continue;
                }
            };
            inner.index(&meta);
            inner.metas.insert(meta.meta_id().clone(), meta);
            loaded += 1;
        }
        info!(loaded, root = %root.display(), "containers config cache initialized");
        Ok(())
    }

    pub async fn create_meta_data(
        &self,
        group_id: &str,
        instances: usize,
        web_hooks: Vec<WebHook>,
        config: data_model::ContainerConfig,
    ) -> Result<MetaData> {
        let mut inner = self.inner.write().await;
        let name_key = (group_id.to_string(), config.name.clone());
        if inner.name_index.contains_key(&name_key) {
            return Err(anyhow!(
                "meta {} already exists in group {}",
                config.name,
                group_id
            ));
        }

        let meta_id = MetaId::generate();
        let mut config = config;
        config.set_cluster_identity(group_id, &meta_id);
        let meta = MetaData {
            base: data_model::MetaBase {
                meta_id: meta_id.clone(),
                group_id: group_id.to_string(),
                instances,
                web_hooks,
                config,
            },
            base_configs: vec![],
        };
        self.write_record(&meta)?;
        inner.index(&meta);
        inner.metas.insert(meta_id, meta.clone());
        Ok(meta)
    }

    pub async fn set_meta_data(
        &self,
        meta_id: &MetaId,
        instances: usize,
        web_hooks: Vec<WebHook>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let meta = inner
            .metas
            .get_mut(meta_id)
            .ok_or_else(|| anyhow!("meta {} not found", meta_id))?;
        meta.base.instances = instances;
        meta.base.web_hooks = web_hooks;
        let meta = meta.clone();
        self.write_record(&meta)?;
        Ok(())
    }

    pub async fn remove_meta_data(&self, meta_id: &MetaId) -> bool {
        let mut inner = self.inner.write().await;
        let Some(meta) = inner.metas.remove(meta_id) else {
            return false;
        };
        inner.deindex(&meta);
        self.remove_record(meta_id);
        true
    }

    pub async fn remove_group_meta_data(&self, group_id: &str) {
        let mut inner = self.inner.write().await;
        let member_ids: Vec<MetaId> = inner
            .group_index
            .get(group_id)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default();
        for meta_id in member_ids {
            if let Some(meta) = inner.metas.remove(&meta_id) {
                inner.deindex(&meta);
                self.remove_record(&meta_id);
            }
        }
    }

    pub async fn get_meta_data(&self, meta_id: &MetaId) -> Option<MetaData> {
        self.inner.read().await.metas.get(meta_id).cloned()
    }

    pub async fn list_meta_data(&self) -> Vec<MetaData> {
        self.inner.read().await.metas.values().cloned().collect()
    }

    /// Replaces the declared container spec of a meta, e.g. after an image
    /// upgrade. Placement records are untouched.
    pub async fn set_meta_config(
        &self,
        meta_id: &MetaId,
        config: data_model::ContainerConfig,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let meta = inner
            .metas
            .get_mut(meta_id)
            .ok_or_else(|| anyhow!("meta {} not found", meta_id))?;
        // The workload name is part of the meta identity; it never changes.
        let mut config = config;
        config.name = meta.base.config.name.clone();
        meta.base.config = config;
        let meta = meta.clone();
        self.write_record(&meta)?;
        Ok(())
    }

    pub async fn get_meta_data_of_container(&self, container_id: &str) -> Option<MetaData> {
        let inner = self.inner.read().await;
        let meta_id = inner.container_index.get(container_id)?;
        inner.metas.get(meta_id).cloned()
    }

    pub async fn get_meta_data_of_name(&self, group_id: &str, name: &str) -> Option<MetaData> {
        let inner = self.inner.read().await;
        let meta_id = inner
            .name_index
            .get(&(group_id.to_string(), name.to_string()))?;
        inner.metas.get(meta_id).cloned()
    }

    pub async fn get_group_meta_data(&self, group_id: &str) -> Vec<MetaData> {
        let inner = self.inner.read().await;
        inner
            .group_index
            .get(group_id)
            .map(|members| {
                members
                    .iter()
                    .filter_map(|meta_id| inner.metas.get(meta_id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn get_meta_data_base_configs(&self, meta_id: &MetaId) -> Vec<BaseConfig> {
        self.inner
            .read()
            .await
            .metas
            .get(meta_id)
            .map(|meta| meta.base_configs.clone())
            .unwrap_or_default()
    }

    /// `None` when the meta is unknown, to tell "no meta" apart from "no
    /// placements yet".
    pub async fn get_meta_data_base_configs_count(&self, meta_id: &MetaId) -> Option<usize> {
        self.inner
            .read()
            .await
            .metas
            .get(meta_id)
            .map(|meta| meta.base_configs.len())
    }

    /// Returns the smallest non-negative index not currently assigned to a
    /// live base config of the meta. Indexes freed by removal are reused.
    pub async fn make_container_idle_index(&self, meta_id: &MetaId) -> Option<u32> {
        let inner = self.inner.read().await;
        let meta = inner.metas.get(meta_id)?;
        let in_use: HashSet<u32> = meta.base_configs.iter().map(|b| b.index).collect();
        let mut index = 0u32;
        while in_use.contains(&index) {
            index += 1;
        }
        Some(index)
    }

    pub async fn set_container_base_config(&self, meta_id: &MetaId, base_config: BaseConfig) {
        let mut inner = self.inner.write().await;
        let Some(meta) = inner.metas.get_mut(meta_id) else {
            return;
        };
        match meta
            .base_configs
            .iter_mut()
            .find(|existing| existing.id == base_config.id)
        {
            Some(existing) => *existing = base_config.clone(),
            None => meta.base_configs.push(base_config.clone()),
        }
        let meta = meta.clone();
        inner
            .container_index
            .insert(base_config.id, meta_id.clone());
        if let Err(err) = self.write_record(&meta) {
            warn!(meta_id = meta_id.get(), "failed to persist meta record: {err:#}");
        }
    }

    pub async fn remove_container_base_config(&self, meta_id: &MetaId, container_id: &str) {
        let mut inner = self.inner.write().await;
        let Some(meta) = inner.metas.get_mut(meta_id) else {
            return;
        };
        meta.base_configs.retain(|b| b.id != container_id);
        let meta = meta.clone();
        if inner.container_index.get(container_id) == Some(meta_id) {
            inner.container_index.remove(container_id);
        }
        if let Err(err) = self.write_record(&meta) {
            warn!(meta_id = meta_id.get(), "failed to persist meta record: {err:#}");
        }
    }

    fn record_path(&self, meta_id: &MetaId) -> Option<PathBuf> {
        self.cache_root
            .as_ref()
            .map(|root| root.join(format!("{}.json", meta_id.get())))
    }

    fn write_record(&self, meta: &MetaData) -> Result<()> {
        let Some(path) = self.record_path(meta.meta_id()) else {
            return Ok(());
        };
        let data = serde_json::to_vec_pretty(meta)?;
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, data)
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &path)
            .with_context(|| format!("failed to replace {}", path.display()))?;
        Ok(())
    }

    fn remove_record(&self, meta_id: &MetaId) {
        if let Some(path) = self.record_path(meta_id) {
            let _ = fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use data_model::test_objects::tests::{mock_container_config, mock_webhook, TEST_GROUP_ID};

    use super::*;

    fn base_config(id: &str, index: u32) -> BaseConfig {
        BaseConfig {
            id: id.to_string(),
            index,
            config: mock_container_config("web"),
        }
    }

    #[tokio::test]
    async fn test_create_meta_data_rejects_duplicate_name() {
        let cache = ContainersConfigCache::new(None).unwrap();
        cache
            .create_meta_data(TEST_GROUP_ID, 2, vec![], mock_container_config("web"))
            .await
            .unwrap();
        let err = cache
            .create_meta_data(TEST_GROUP_ID, 1, vec![], mock_container_config("web"))
            .await;
        assert!(err.is_err());

        // Same name in another group is fine.
        cache
            .create_meta_data("other-group", 1, vec![], mock_container_config("web"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_idle_index_reuses_freed_slots() {
        let cache = ContainersConfigCache::new(None).unwrap();
        let meta = cache
            .create_meta_data(TEST_GROUP_ID, 3, vec![], mock_container_config("web"))
            .await
            .unwrap();
        let meta_id = meta.meta_id().clone();

        for (id, index) in [("c0", 0), ("c1", 1), ("c2", 2)] {
            assert_eq!(
                cache.make_container_idle_index(&meta_id).await,
                Some(index)
            );
            cache
                .set_container_base_config(&meta_id, base_config(id, index))
                .await;
        }
        assert_eq!(cache.make_container_idle_index(&meta_id).await, Some(3));

        cache.remove_container_base_config(&meta_id, "c1").await;
        assert_eq!(cache.make_container_idle_index(&meta_id).await, Some(1));

        assert_eq!(
            cache
                .make_container_idle_index(&MetaId::from("missing"))
                .await,
            None
        );
    }

    #[tokio::test]
    async fn test_container_index_later_sighting_wins() {
        let cache = ContainersConfigCache::new(None).unwrap();
        let first = cache
            .create_meta_data(TEST_GROUP_ID, 1, vec![], mock_container_config("web"))
            .await
            .unwrap();
        let second = cache
            .create_meta_data(TEST_GROUP_ID, 1, vec![], mock_container_config("api"))
            .await
            .unwrap();

        cache
            .set_container_base_config(first.meta_id(), base_config("shared", 0))
            .await;
        cache
            .set_container_base_config(second.meta_id(), base_config("shared", 0))
            .await;

        let owner = cache.get_meta_data_of_container("shared").await.unwrap();
        assert_eq!(owner.meta_id(), second.meta_id());
    }

    #[tokio::test]
    async fn test_persist_and_reload_round_trip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let meta_id = {
            let cache = ContainersConfigCache::new(Some(temp_dir.path())).unwrap();
            let meta = cache
                .create_meta_data(
                    TEST_GROUP_ID,
                    2,
                    vec![mock_webhook("http://hooks.local/deploy")],
                    mock_container_config("web"),
                )
                .await
                .unwrap();
            cache
                .set_container_base_config(meta.meta_id(), base_config("c0", 0))
                .await;
            cache
                .set_container_base_config(meta.meta_id(), base_config("c1", 1))
                .await;
            meta.meta_id().clone()
        };

        let reloaded = ContainersConfigCache::new(Some(temp_dir.path())).unwrap();
        reloaded.init().await.unwrap();
        let meta = reloaded.get_meta_data(&meta_id).await.unwrap();
        assert_eq!(meta.base.instances, 2);
        assert_eq!(meta.base.web_hooks.len(), 1);
        assert_eq!(meta.base_configs.len(), 2);
        assert_eq!(
            reloaded
                .get_meta_data_of_name(TEST_GROUP_ID, "web")
                .await
                .unwrap()
                .meta_id(),
            &meta_id
        );
        assert!(reloaded.get_meta_data_of_container("c1").await.is_some());
    }

    #[tokio::test]
    async fn test_init_discards_partial_writes() {
        let temp_dir = tempfile::tempdir().unwrap();
        {
            let cache = ContainersConfigCache::new(Some(temp_dir.path())).unwrap();
            cache
                .create_meta_data(TEST_GROUP_ID, 1, vec![], mock_container_config("web"))
                .await
                .unwrap();
        }
        let torn = temp_dir.path().join("torn.json");
        fs::write(&torn, b"{\"MetaID\":\"torn\",\"Group").unwrap();

        let cache = ContainersConfigCache::new(Some(temp_dir.path())).unwrap();
        cache.init().await.unwrap();
        assert!(!torn.exists());
        assert_eq!(cache.get_group_meta_data(TEST_GROUP_ID).await.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_meta_data_clears_indexes_and_record() {
        let temp_dir = tempfile::tempdir().unwrap();
        let cache = ContainersConfigCache::new(Some(temp_dir.path())).unwrap();
        let meta = cache
            .create_meta_data(TEST_GROUP_ID, 1, vec![], mock_container_config("web"))
            .await
            .unwrap();
        cache
            .set_container_base_config(meta.meta_id(), base_config("c0", 0))
            .await;

        assert!(cache.remove_meta_data(meta.meta_id()).await);
        assert!(cache.get_meta_data(meta.meta_id()).await.is_none());
        assert!(cache.get_meta_data_of_container("c0").await.is_none());
        assert!(cache
            .get_meta_data_of_name(TEST_GROUP_ID, "web")
            .await
            .is_none());
        assert!(!temp_dir
            .path()
            .join(format!("{}.json", meta.meta_id().get()))
            .exists());
        assert!(!cache.remove_meta_data(meta.meta_id()).await);
    }
}
