use anyhow::Context;
use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use super::broadcast::{BroadcastStore, ValueStream};

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    writer: Uuid,
    value: String,
}

/// Cross-process broadcast store on Redis. The value lives under `key` (last
/// writer wins); changes are published on a channel of the same name wrapped
/// in an envelope carrying the writer id, so a handle can drop its own writes.
pub struct RedisBroadcast {
    client: redis::Client,
    conn: ConnectionManager,
    writer_id: Uuid,
}

impl RedisBroadcast {
    pub async fn connect(redis_uri: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_uri).context("Invalid Redis URI")?;
        let conn = tokio::time::timeout(
            Duration::from_secs(10),
            ConnectionManager::new(client.clone()),
        )
        .await
        .map_err(|_| anyhow::anyhow!("Redis connection timeout after 10s"))?
        .context("Failed to connect to Redis")?;

        Ok(Self {
            client,
            conn,
            writer_id: Uuid::new_v4(),
        })
    }
}

#[async_trait]
impl BroadcastStore for RedisBroadcast {
    async fn put(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let envelope = serde_json::to_string(&Envelope {
            writer: self.writer_id,
            value: value.to_string(),
        })?;

        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async::<()>(&mut conn)
            .await
            .context("Failed to store broadcast value")?;

        redis::cmd("PUBLISH")
            .arg(key)
            .arg(envelope)
            .query_async::<i64>(&mut conn)
            .await
            .context("Failed to publish broadcast value")?;

        Ok(())
    }

    async fn clear(&self, key: &str) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<()>(&mut conn)
            .await
            .context("Failed to clear broadcast value")?;
        Ok(())
    }

    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .context("Failed to read broadcast value")?;
        Ok(value)
    }

    async fn subscribe(&self, key: &str) -> anyhow::Result<ValueStream> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .context("Failed to open Redis pub/sub connection")?;
        pubsub
            .subscribe(key)
            .await
            .context("Failed to subscribe to broadcast channel")?;

        let own = self.writer_id;
        let values = pubsub.into_on_message().filter_map(move |msg| async move {
            let payload: String = match msg.get_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::warn!("Unreadable broadcast payload: {}", e);
                    return None;
                }
            };
            match serde_json::from_str::<Envelope>(&payload) {
                Ok(envelope) if envelope.writer != own => Some(envelope.value),
                Ok(_) => None,
                Err(e) => {
                    tracing::warn!("Malformed broadcast envelope: {}", e);
                    None
                }
            }
        });

        Ok(Box::pin(values))
    }
}
