use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::broadcast::BroadcastStore;
use super::violations::IntegritySignal;

/// Value published under the broadcast key while an instance is active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceBeacon {
    pub session_id: String,
    pub instance_id: Uuid,
}

/// Detects a second concurrent instance of the same session sharing the
/// broadcast store. Detection is best-effort; the store carries no authority.
pub struct CrossTabSentinel {
    store: Arc<dyn BroadcastStore>,
    key: String,
    instance_id: Uuid,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl CrossTabSentinel {
    pub fn new(store: Arc<dyn BroadcastStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
            instance_id: Uuid::new_v4(),
            listener: Mutex::new(None),
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Starts listening for other instances, then announces this one. A beacon
    /// for the same session from a different instance is reported on `signals`
    /// as [`IntegritySignal::DuplicateSession`].
    pub async fn arm(
        &self,
        session_id: &str,
        signals: mpsc::UnboundedSender<IntegritySignal>,
    ) -> anyhow::Result<()> {
        let mut updates = self.store.subscribe(&self.key).await?;

        let own_session = session_id.to_string();
        let own_instance = self.instance_id;
        let handle = tokio::spawn(async move {
            while let Some(raw) = updates.next().await {
                let beacon: PresenceBeacon = match serde_json::from_str(&raw) {
                    Ok(beacon) => beacon,
                    Err(e) => {
                        tracing::debug!("Ignoring unreadable presence beacon: {}", e);
                        continue;
                    }
                };
                if beacon.session_id == own_session && beacon.instance_id != own_instance {
                    tracing::warn!(
                        "Duplicate instance detected: session={}, other={}",
                        own_session,
                        beacon.instance_id
                    );
                    if signals.send(IntegritySignal::DuplicateSession).is_err() {
                        break;
                    }
                }
            }
        });

        if let Some(previous) = self.slot().replace(handle) {
            previous.abort();
        }

        let beacon = serde_json::to_string(&PresenceBeacon {
            session_id: session_id.to_string(),
            instance_id: self.instance_id,
        })?;
        self.store.put(&self.key, &beacon).await?;

        tracing::debug!(
            "Sentinel armed: session={}, instance={}",
            session_id,
            self.instance_id
        );
        Ok(())
    }

    /// Stops listening and clears the beacon if it is still ours. Failures are
    /// logged and ignored.
    pub async fn disarm(&self) {
        if let Some(handle) = self.slot().take() {
            handle.abort();
        }

        let still_ours = match self.store.get(&self.key).await {
            Ok(Some(raw)) => serde_json::from_str::<PresenceBeacon>(&raw)
                .map(|beacon| beacon.instance_id == self.instance_id)
                .unwrap_or(false),
            Ok(None) => false,
            Err(e) => {
                tracing::debug!("Sentinel could not read beacon on disarm: {}", e);
                false
            }
        };

        if still_ours {
            if let Err(e) = self.store.clear(&self.key).await {
                tracing::debug!("Sentinel could not clear beacon: {}", e);
            }
        }
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.listener.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for CrossTabSentinel {
    fn drop(&mut self) {
        if let Some(handle) = self.slot().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attempt::broadcast::LocalBroadcastHub;
    use std::time::Duration;

    const KEY: &str = "proctor:attempt:active";

    #[tokio::test]
    async fn second_instance_of_same_session_is_reported() {
        let hub = LocalBroadcastHub::new();
        let first = CrossTabSentinel::new(Arc::new(hub.handle()), KEY);
        let second = CrossTabSentinel::new(Arc::new(hub.handle()), KEY);

        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        first.arm("s1", tx1).await.unwrap();
        second.arm("s1", tx2).await.unwrap();

        let signal = tokio::time::timeout(Duration::from_secs(1), rx1.recv())
            .await
            .unwrap();
        assert_eq!(signal, Some(IntegritySignal::DuplicateSession));

        // The later instance only saw its own write
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn different_sessions_do_not_conflict() {
        let hub = LocalBroadcastHub::new();
        let first = CrossTabSentinel::new(Arc::new(hub.handle()), KEY);
        let second = CrossTabSentinel::new(Arc::new(hub.handle()), KEY);

        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        first.arm("s1", tx1).await.unwrap();
        second.arm("s2", tx2).await.unwrap();

        let result = tokio::time::timeout(Duration::from_millis(50), rx1.recv()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn disarm_clears_only_own_beacon() {
        let hub = LocalBroadcastHub::new();
        let observer = hub.handle();
        let first = CrossTabSentinel::new(Arc::new(hub.handle()), KEY);
        let second = CrossTabSentinel::new(Arc::new(hub.handle()), KEY);

        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        first.arm("s1", tx1).await.unwrap();
        second.arm("s2", tx2).await.unwrap();

        first.disarm().await;
        assert!(observer.get(KEY).await.unwrap().is_some());

        second.disarm().await;
        assert!(observer.get(KEY).await.unwrap().is_none());
    }
}
