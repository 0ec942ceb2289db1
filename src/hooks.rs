use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use data_model::{MetaBase, MetaData};
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MetaEvent {
    Create,
    Update,
    Upgrade,
    Remove,
    Operate,
    Recovery,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct HookPayload {
    sequence: u64,
    event: String,
    timestamp: u64,
    meta: MetaBase,
}

struct HookEntry {
    sequence: u64,
    event: MetaEvent,
    meta: MetaBase,
}

/// Fans meta lifecycle events out to the webhooks declared on the meta.
/// Delivery is asynchronous and best-effort; a failed endpoint is logged
/// and never surfaced to the operation that raised the event.
pub struct HooksProcessor {
    tx: mpsc::UnboundedSender<HookEntry>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<HookEntry>>>,
    sequence: AtomicU64,
}

impl HooksProcessor {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            sequence: AtomicU64::new(0),
        }
    }

    /// Enqueues one event for every webhook on the meta.
    pub fn hook(&self, meta: &MetaData, event: MetaEvent) {
        if meta.base.web_hooks.is_empty() {
            return;
        }
        let entry = HookEntry {
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
            event,
            meta: meta.base.clone(),
        };
        let _ = self.tx.send(entry);
    }

    pub fn start(&self, mut shutdown_rx: watch::Receiver<()>) {
        let Some(mut rx) = self.rx.try_lock().ok().and_then(|mut slot| slot.take()) else {
            return;
        };
        tokio::spawn(async move {
            let client = reqwest::Client::new();
            loop {
                tokio::select! {
                    entry = rx.recv() => {
                        match entry {
                            Some(entry) => deliver(&client, entry).await,
                            None => break,
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("hooks processor shutting down");
                        break;
                    }
                }
            }
        });
    }
}

impl Default for HooksProcessor {
    fn default() -> Self {
        Self::new()
    }
}

async fn deliver(client: &reqwest::Client, entry: HookEntry) {
    let payload = HookPayload {
        sequence: entry.sequence,
        event: entry.event.to_string(),
        timestamp: epoch_millis(),
        meta: entry.meta,
    };
    for hook in &payload.meta.web_hooks {
        let mut request = client.post(&hook.url).json(&payload);
        if !hook.secret_token.is_empty() {
            request = request.header("X-Humpback-Token", &hook.secret_token);
        }
        match request.send().await {
            Ok(response) if response.status().is_success() => {
                debug!(url = %hook.url, event = %payload.event, "webhook delivered");
            }
            Ok(response) => {
                warn!(
                    url = %hook.url,
                    status = %response.status(),
                    "webhook endpoint rejected event"
                );
            }
            Err(err) => {
                warn!(url = %hook.url, "webhook delivery failed: {err:#}");
            }
        }
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use data_model::test_objects::tests::{mock_container_config, mock_webhook};
    use data_model::MetaId;

    use super::*;

    fn meta_with_hooks(hooks: Vec<data_model::WebHook>) -> MetaData {
        MetaData {
            base: MetaBase {
                meta_id: MetaId::from("m1"),
                group_id: "g1".to_string(),
                instances: 1,
                web_hooks: hooks,
                config: mock_container_config("web"),
            },
            base_configs: vec![],
        }
    }

    #[tokio::test]
    async fn test_hook_without_webhooks_is_dropped() {
        let processor = HooksProcessor::new();
        processor.hook(&meta_with_hooks(vec![]), MetaEvent::Create);
        let mut rx = processor.rx.lock().await.take().unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_hook_entries_are_sequenced() {
        let processor = HooksProcessor::new();
        let meta = meta_with_hooks(vec![mock_webhook("http://hooks.local/deploy")]);
        processor.hook(&meta, MetaEvent::Create);
        processor.hook(&meta, MetaEvent::Operate);

        let mut rx = processor.rx.lock().await.take().unwrap();
        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(first.sequence, 0);
        assert_eq!(first.event, MetaEvent::Create);
        assert_eq!(second.sequence, 1);
        assert_eq!(second.event, MetaEvent::Operate);
    }
}
