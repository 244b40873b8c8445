//! Redis-backed fabric implementation.
//!
//! KV commands ride on a `ConnectionManager` (auto-reconnecting multiplexed
//! connection). Each subscription owns a dedicated pub/sub connection driven
//! by a background task that re-subscribes with exponential backoff after a
//! disconnect — while disconnected, commands on that channel are simply not
//! deliverable.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{Broker, BrokerMessage, Result};

const RECONNECT_BASE: Duration = Duration::from_millis(500);
const RECONNECT_MAX: Duration = Duration::from_secs(30);

pub struct RedisBroker {
    client: redis::Client,
    manager: ConnectionManager,
}

impl RedisBroker {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        info!(url, "broker connected");
        Ok(Self { client, manager })
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let _receivers: i64 = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<BrokerMessage>> {
        let (tx, rx) = mpsc::channel(64);
        let client = self.client.clone();
        let channel = channel.to_string();

        tokio::spawn(async move {
            let mut backoff = RECONNECT_BASE;
            loop {
                match client.get_async_pubsub().await {
                    Ok(mut pubsub) => match pubsub.subscribe(&channel).await {
                        Ok(()) => {
                            debug!(channel = %channel, "subscribed");
                            backoff = RECONNECT_BASE;
                            let mut stream = pubsub.on_message();
                            while let Some(msg) = stream.next().await {
                                let payload: String = msg.get_payload().unwrap_or_default();
                                if tx
                                    .send(BrokerMessage {
                                        channel: channel.clone(),
                                        payload,
                                    })
                                    .await
                                    .is_err()
                                {
                                    return; // receiver dropped
                                }
                            }
                            warn!(channel = %channel, "pubsub stream ended, reconnecting");
                        }
                        Err(e) => warn!(channel = %channel, "subscribe failed: {e}"),
                    },
                    Err(e) => warn!(channel = %channel, "pubsub connect failed: {e}"),
                }

                if tx.is_closed() {
                    return;
                }
                let jitter = Duration::from_millis(rand::random::<u64>() % 250);
                tokio::time::sleep(backoff + jitter).await;
                backoff = (backoff * 2).min(RECONNECT_MAX);
            }
        });

        Ok(rx)
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool> {
        let mut conn = self.manager.clone();
        // SET key value NX EX ttl → "OK" when created, nil when the key exists
        let created: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await?;
        Ok(created.is_some())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.manager.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }
}
