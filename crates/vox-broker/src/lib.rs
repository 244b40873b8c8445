//! Command & event fabric: named pub/sub channels plus string keys with TTL
//! on a Redis-compatible broker.
//!
//! Delivery is at-least-once, so consumers deduplicate: cross-process
//! takeover commands pass through a fencing lock (`SET … NX EX`), in-band
//! data messages through a `(type, timestamp)` set. Subscribers survive
//! broker disconnects and re-subscribe with exponential backoff.

pub mod channels;
pub mod error;
pub mod memory;
pub mod payloads;
pub mod redis_broker;

pub use error::{BrokerError, Result};

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// One message delivered to a subscriber.
#[derive(Debug, Clone)]
pub struct BrokerMessage {
    pub channel: String,
    pub payload: String,
}

/// The operations every process needs from the broker. Matches the atomic
/// primitives the fabric relies on: `SET … NX EX`, `SET … EX`, `GET`, `DEL`,
/// `PUBLISH`, `SUBSCRIBE`.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    /// Subscribe to a channel. The returned receiver stays live across
    /// broker reconnects.
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<BrokerMessage>>;

    /// Atomic set-if-absent with TTL. Returns `true` iff the key was created.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool>;

    /// Unconditional set with TTL (heartbeats).
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn del(&self, key: &str) -> Result<()>;
}

/// Connect by URL: `memory://` for a single-process broker, anything else is
/// handed to the redis client.
pub async fn connect(url: &str) -> Result<Arc<dyn Broker>> {
    if url.starts_with("memory://") {
        Ok(Arc::new(memory::MemoryBroker::new()))
    } else {
        Ok(Arc::new(redis_broker::RedisBroker::connect(url).await?))
    }
}
