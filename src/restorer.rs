use std::{sync::Arc, time::Duration};

use tokio::sync::watch;
use tracing::{info, warn};

use crate::context::{ClusterContext, ContextHandle};

/// Periodic reconciliation loop. A meta whose group has healthy engines
/// is recovered when none of its recorded containers is reported by any
/// engine (orphaned, e.g. after a cache reload), or when it has no
/// placement records at all despite a non-zero instance target.
pub struct MetaRestorer {
    interval: Duration,
    context: Arc<ContextHandle>,
}

impl MetaRestorer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            context: Arc::new(ContextHandle::new()),
        }
    }

    pub fn bind(&self, context: std::sync::Weak<dyn ClusterContext>) {
        self.context.bind(context);
    }

    pub fn start(&self, mut shutdown_rx: watch::Receiver<()>) {
        let interval = self.interval;
        let context = self.context.clone();
        tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "meta restorer started");
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // the first tick fires immediately
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        run_tick(&context).await;
                    }
                    _ = shutdown_rx.changed() => {
                        info!("meta restorer shutting down");
                        break;
                    }
                }
            }
        });
    }

    pub async fn run_once(&self) {
        run_tick(&self.context).await;
    }
}

async fn run_tick(context: &ContextHandle) {
    let Some(context) = context.get() else {
        return;
    };
    for meta in context.list_meta_data().await {
        let engines = context.group_engines(meta.group_id()).await;
        let healthy: Vec<_> = engines.iter().filter(|e| e.is_healthy()).collect();
        if healthy.is_empty() {
            continue;
        }

        let orphaned = if meta.base_configs.is_empty() {
            meta.base.instances > 0
        } else {
            let mut seen = false;
            'engines: for engine in &healthy {
                for base_config in &meta.base_configs {
                    if engine.has_container(&base_config.id).await {
                        seen = true;
                        break 'engines;
                    }
                }
            }
            !seen
        };

        if orphaned {
            warn!(
                meta_id = meta.meta_id().get(),
                name = meta.config_name(),
                "meta has no live containers, recovering"
            );
            context.recover_meta(meta.meta_id()).await;
        }
    }
}
