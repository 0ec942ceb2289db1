use std::{cmp::Ordering, collections::HashSet, sync::Arc};

use rand::seq::SliceRandom;

use crate::engine::Engine;

/// Per-placement-attempt engine bookkeeping: engines already hosting the
/// meta (`alloc`) and engines that failed a create during this attempt
/// (`fail`). The blacklist lives only for the duration of one placement
/// loop.
#[derive(Default)]
pub struct EnginesFilter {
    alloc: Vec<Arc<Engine>>,
    failed: HashSet<String>,
}

impl EnginesFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_alloc_engine(&mut self, engine: &Arc<Engine>) {
        if !self.alloc.iter().any(|e| e.key() == engine.key()) {
            self.alloc.push(engine.clone());
        }
    }

    pub fn set_fail_engine(&mut self, engine: &Arc<Engine>) {
        self.failed.insert(engine.key().to_string());
    }

    pub fn filter(&self, engines: Vec<Arc<Engine>>) -> Vec<Arc<Engine>> {
        engines
            .into_iter()
            .filter(|engine| !self.failed.contains(engine.key()))
            .collect()
    }

    pub fn alloc_engines(&self) -> Vec<Arc<Engine>> {
        self.alloc.clone()
    }
}

/// Ranks the group's healthy engines for a placement: descending free
/// memory, then free cpus, engine name as the tie-break. Engines
/// blacklisted by the filter are dropped; when nothing survives, the
/// engines already hosting the meta are retried in randomized order.
pub async fn select_engines(
    engines: &[Arc<Engine>],
    filter: &EnginesFilter,
) -> Vec<Arc<Engine>> {
    let healthy: Vec<Arc<Engine>> = engines
        .iter()
        .filter(|engine| engine.is_healthy())
        .cloned()
        .collect();
    if healthy.is_empty() {
        return healthy;
    }

    let mut weighted = Vec::with_capacity(healthy.len());
    for engine in healthy {
        let free = engine.free_resources().await;
        weighted.push((engine, free));
    }
    weighted.sort_by(|a, b| {
        let (_, (a_memory, a_cpus)) = a;
        let (_, (b_memory, b_cpus)) = b;
        b_memory
            .cmp(a_memory)
            .then(b_cpus.partial_cmp(a_cpus).unwrap_or(Ordering::Equal))
            .then_with(|| a.0.name.cmp(&b.0.name))
    });
    let mut selected: Vec<Arc<Engine>> = weighted.into_iter().map(|(engine, _)| engine).collect();

    let filtered = filter.filter(selected.clone());
    if !filtered.is_empty() {
        selected = filtered;
    } else {
        let alloc = filter.alloc_engines();
        if !alloc.is_empty() {
            selected = alloc;
        }
        selected.shuffle(&mut rand::thread_rng());
    }
    selected
}

#[cfg(test)]
mod tests {
    use data_model::{test_objects::tests::mock_container_config, MetaId};

    use super::*;
    use crate::testing::mock_engine;

    const GIB: i64 = 1024 * 1024 * 1024;

    #[tokio::test]
    async fn test_weighting_prefers_free_memory_then_name() {
        let a = mock_engine("192.168.1.10", "NODE-A", 2, 4 * GIB).await;
        let b = mock_engine("192.168.1.11", "NODE-B", 2, 4 * GIB).await;
        let c = mock_engine("192.168.1.12", "NODE-C", 2, 8 * GIB).await;

        // Load NODE-A with one container so it falls behind NODE-B.
        let meta_id = MetaId::from("m1");
        let mut config = mock_container_config("web");
        config.set_cluster_identity("g1", &meta_id);
        a.create_container(config).await.unwrap();

        let filter = EnginesFilter::new();
        let engines = vec![a.clone(), b.clone(), c.clone()];
        let ranked = select_engines(&engines, &filter).await;
        let keys: Vec<&str> = ranked.iter().map(|e| e.key()).collect();
        assert_eq!(keys, vec![c.key(), b.key(), a.key()]);
    }

    #[tokio::test]
    async fn test_unhealthy_engines_are_dropped() {
        let a = mock_engine("192.168.1.10", "NODE-A", 2, 4 * GIB).await;
        let b = mock_engine("192.168.1.11", "NODE-B", 2, 4 * GIB).await;
        b.set_state(data_model::EngineState::Unhealthy);

        let ranked = select_engines(&[a.clone(), b], &EnginesFilter::new()).await;
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].key(), a.key());
    }

    #[tokio::test]
    async fn test_blacklist_falls_back_to_alloc_engines() {
        let a = mock_engine("192.168.1.10", "NODE-A", 2, 4 * GIB).await;
        let b = mock_engine("192.168.1.11", "NODE-B", 2, 4 * GIB).await;

        let mut filter = EnginesFilter::new();
        filter.set_alloc_engine(&a);
        filter.set_fail_engine(&a);
        filter.set_fail_engine(&b);

        let ranked = select_engines(&[a.clone(), b], &filter).await;
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].key(), a.key());
    }

    #[tokio::test]
    async fn test_empty_blacklist_fallback_retries_all() {
        // No alloc engines: the whole weighted set comes back (shuffled)
        // so the retry loop still has candidates.
        let a = mock_engine("192.168.1.10", "NODE-A", 2, 4 * GIB).await;
        let b = mock_engine("192.168.1.11", "NODE-B", 2, 4 * GIB).await;

        let mut filter = EnginesFilter::new();
        filter.set_fail_engine(&a);
        filter.set_fail_engine(&b);

        let ranked = select_engines(&[a, b], &filter).await;
        assert_eq!(ranked.len(), 2);
    }
}
