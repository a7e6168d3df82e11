use async_trait::async_trait;
use futures::stream::{self, Stream};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::{self, error::RecvError};
use uuid::Uuid;

pub type ValueStream = Pin<Box<dyn Stream<Item = String> + Send>>;

/// Shared key/value store with change notifications, scoped to one origin.
///
/// A handle never receives notifications for its own writes. Values carry no
/// authority: they are hints between cooperating instances.
#[async_trait]
pub trait BroadcastStore: Send + Sync {
    async fn put(&self, key: &str, value: &str) -> anyhow::Result<()>;

    /// Removes the value. Clearing is not announced to subscribers.
    async fn clear(&self, key: &str) -> anyhow::Result<()>;

    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;

    /// Values written under `key` by other handles, from now on.
    async fn subscribe(&self, key: &str) -> anyhow::Result<ValueStream>;
}

#[derive(Debug, Clone)]
struct Notification {
    writer: Uuid,
    key: String,
    value: String,
}

const HUB_CAPACITY: usize = 64;

/// In-process bus standing in for the browser's per-origin storage. Every
/// instance sharing a hub sees the others' writes.
#[derive(Clone)]
pub struct LocalBroadcastHub {
    sender: broadcast::Sender<Notification>,
    values: Arc<Mutex<HashMap<String, String>>>,
}

impl Default for LocalBroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBroadcastHub {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(HUB_CAPACITY);
        Self {
            sender,
            values: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// A fresh handle with its own writer identity.
    pub fn handle(&self) -> LocalBroadcast {
        LocalBroadcast {
            hub: self.clone(),
            writer_id: Uuid::new_v4(),
        }
    }

    fn values(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.values.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct LocalBroadcast {
    hub: LocalBroadcastHub,
    writer_id: Uuid,
}

#[async_trait]
impl BroadcastStore for LocalBroadcast {
    async fn put(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.hub
            .values()
            .insert(key.to_string(), value.to_string());

        // No receivers is not an error: nobody else is listening yet
        let _ = self.hub.sender.send(Notification {
            writer: self.writer_id,
            key: key.to_string(),
            value: value.to_string(),
        });
        Ok(())
    }

    async fn clear(&self, key: &str) -> anyhow::Result<()> {
        self.hub.values().remove(key);
        Ok(())
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.hub.values().get(key).cloned())
    }

    async fn subscribe(&self, key: &str) -> anyhow::Result<ValueStream> {
        let rx = self.hub.sender.subscribe();
        let state = (rx, key.to_string(), self.writer_id);

        let values = stream::unfold(state, |(mut rx, key, own)| async move {
            loop {
                match rx.recv().await {
                    Ok(note) if note.writer != own && note.key == key => {
                        return Some((note.value, (rx, key, own)));
                    }
                    Ok(_) => continue,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("Broadcast subscriber lagged, {} notifications skipped", skipped);
                        continue;
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        });

        Ok(Box::pin(values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;

    #[tokio::test]
    async fn other_handles_see_writes() {
        let hub = LocalBroadcastHub::new();
        let first = hub.handle();
        let second = hub.handle();

        let mut updates = second.subscribe("active").await.unwrap();
        first.put("active", "hello").await.unwrap();

        let value = tokio::time::timeout(Duration::from_secs(1), updates.next())
            .await
            .unwrap();
        assert_eq!(value.as_deref(), Some("hello"));
        assert_eq!(second.get("active").await.unwrap().as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn own_writes_are_not_delivered() {
        let hub = LocalBroadcastHub::new();
        let writer = hub.handle();
        let other = hub.handle();

        let mut updates = writer.subscribe("active").await.unwrap();
        writer.put("active", "mine").await.unwrap();
        other.put("active", "theirs").await.unwrap();

        let value = tokio::time::timeout(Duration::from_secs(1), updates.next())
            .await
            .unwrap();
        assert_eq!(value.as_deref(), Some("theirs"));
    }

    #[tokio::test]
    async fn other_keys_are_filtered() {
        let hub = LocalBroadcastHub::new();
        let a = hub.handle();
        let b = hub.handle();

        let mut updates = b.subscribe("active").await.unwrap();
        a.put("unrelated", "x").await.unwrap();

        let result = tokio::time::timeout(Duration::from_millis(50), updates.next()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn clear_removes_value() {
        let hub = LocalBroadcastHub::new();
        let handle = hub.handle();
        handle.put("active", "v").await.unwrap();
        handle.clear("active").await.unwrap();
        assert!(handle.get("active").await.unwrap().is_none());
    }
}
