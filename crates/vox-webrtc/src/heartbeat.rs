//! Worker liveness heartbeat. Its absence past TTL is how the cluster
//! supervisor declares a worker dead — nothing else prolongs the key.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use vox_broker::channels::KEY_WORKER_HEARTBEAT;
use vox_broker::Broker;
use vox_core::config::{HEARTBEAT_REFRESH_SECS, HEARTBEAT_TTL_SECS};

pub fn spawn_heartbeat(
    broker: Arc<dyn Broker>,
    worker_id: String,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(worker = %worker_id, "heartbeat started");
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(HEARTBEAT_REFRESH_SECS));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("heartbeat stopped");
                    return;
                }
                _ = interval.tick() => {
                    if let Err(e) = broker
                        .set_ex(KEY_WORKER_HEARTBEAT, &worker_id, HEARTBEAT_TTL_SECS)
                        .await
                    {
                        warn!("heartbeat write failed: {e}");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use vox_broker::memory::MemoryBroker;

    #[tokio::test]
    async fn heartbeat_writes_and_stops_on_cancel() {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let cancel = CancellationToken::new();
        let handle = spawn_heartbeat(broker.clone(), "worker-7".into(), cancel.clone());

        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while broker.get(KEY_WORKER_HEARTBEAT).await.unwrap().is_none() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("heartbeat never written");

        assert_eq!(
            broker.get(KEY_WORKER_HEARTBEAT).await.unwrap().as_deref(),
            Some("worker-7")
        );
        cancel.cancel();
        handle.await.unwrap();
    }
}
