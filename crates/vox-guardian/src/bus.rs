//! Command-bus listener: subscribes to the takeover channel and feeds
//! commands to the supervisor until cancelled.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use vox_broker::channels::CH_GUARDIAN_TAKEOVER;
use vox_broker::payloads::TakeoverCommand;
use vox_broker::Broker;

use crate::supervisor::GuardianSupervisor;

/// Spawn the listener task. The broker subscription survives disconnects;
/// malformed payloads are logged and skipped.
pub fn spawn_command_listener(
    broker: Arc<dyn Broker>,
    supervisor: Arc<GuardianSupervisor>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut rx = match broker.subscribe(CH_GUARDIAN_TAKEOVER).await {
            Ok(rx) => rx,
            Err(e) => {
                warn!("takeover channel subscribe failed: {e}");
                return;
            }
        };
        info!("guardian command listener started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("guardian command listener stopping");
                    return;
                }
                msg = rx.recv() => {
                    let Some(msg) = msg else {
                        warn!("takeover channel closed");
                        return;
                    };
                    match serde_json::from_str::<TakeoverCommand>(&msg.payload) {
                        Ok(cmd) => supervisor.handle_command(&cmd).await,
                        Err(e) => warn!("unparseable takeover command: {e}"),
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use vox_broker::memory::MemoryBroker;
    use vox_broker::payloads::CommandKind;
    use vox_core::config::GuardianSettings;
    use vox_core::types::{AgentConfigId, ConversationId};
    use vox_db::Database;

    #[tokio::test]
    async fn published_command_reaches_the_callback() {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let db = Arc::new(Database::open_in_memory().unwrap());
        let supervisor = Arc::new(GuardianSupervisor::new(
            broker.clone(),
            db,
            GuardianSettings::default(),
        ));

        let conv = ConversationId::from("c1");
        supervisor.open_session(&conv, &AgentConfigId::from("a1")).await;

        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        supervisor.register_callback(
            &conv,
            Arc::new(move |_mute| {
                let counter = counter.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            }),
        );

        let cancel = CancellationToken::new();
        let handle = spawn_command_listener(broker.clone(), supervisor, cancel.clone());
        // let the listener subscribe before publishing
        tokio::task::yield_now().await;

        let cmd = TakeoverCommand {
            conversation_id: conv,
            command: CommandKind::Takeover,
            timestamp: 7,
        };
        broker
            .publish(CH_GUARDIAN_TAKEOVER, &serde_json::to_string(&cmd).unwrap())
            .await
            .unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while calls.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("callback never fired");

        cancel.cancel();
        handle.await.unwrap();
    }
}
