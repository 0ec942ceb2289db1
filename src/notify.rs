use data_model::{MetaId, WatchEngine};

/// Notification collaborator. Deliveries are best-effort; the cluster
/// never fails an operation over a notification.
#[async_trait::async_trait]
pub trait NotifySender: Send + Sync {
    async fn notify_group_engines_watch_event(&self, message: &str, events: &[WatchEngine]);

    async fn notify_group_meta_containers_event(
        &self,
        message: &str,
        error: Option<&anyhow::Error>,
        meta_id: &MetaId,
    );
}

/// Discards every notification.
#[derive(Default)]
pub struct NullNotifySender;

#[async_trait::async_trait]
impl NotifySender for NullNotifySender {
    async fn notify_group_engines_watch_event(&self, _message: &str, _events: &[WatchEngine]) {}

    async fn notify_group_meta_containers_event(
        &self,
        _message: &str,
        _error: Option<&anyhow::Error>,
        _meta_id: &MetaId,
    ) {
    }
}
