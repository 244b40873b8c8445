//! In-process broker for tests and single-process deployments.
//!
//! Semantics mirror the redis implementation: `set_nx_ex` is atomic per key,
//! TTLs expire lazily, publish fans out to every live subscriber.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};

use crate::{Broker, BrokerMessage, Result};

struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn live(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

#[derive(Default)]
pub struct MemoryBroker {
    keys: DashMap<String, Entry>,
    subscribers: Mutex<HashMap<String, Vec<mpsc::Sender<BrokerMessage>>>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut subs = self.subscribers.lock().unwrap();
        if let Some(senders) = subs.get_mut(channel) {
            senders.retain(|tx| {
                tx.try_send(BrokerMessage {
                    channel: channel.to_string(),
                    payload: payload.to_string(),
                })
                .is_ok()
                    || !tx.is_closed()
            });
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<BrokerMessage>> {
        let (tx, rx) = mpsc::channel(64);
        self.subscribers
            .lock()
            .unwrap()
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool> {
        let fresh = Entry {
            value: value.to_string(),
            expires_at: Instant::now() + Duration::from_secs(ttl_secs),
        };
        // The entry API keeps check-then-insert atomic per key.
        let created = match self.keys.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if occupied.get().live() {
                    false
                } else {
                    occupied.insert(fresh);
                    true
                }
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(fresh);
                true
            }
        };
        Ok(created)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        self.keys.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + Duration::from_secs(ttl_secs),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        match self.keys.get(key) {
            Some(e) if e.live() => Ok(Some(e.value.clone())),
            _ => Ok(None),
        }
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.keys.remove(key);
        Ok(())
    }
}
