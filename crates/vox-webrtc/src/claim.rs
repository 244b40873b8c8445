//! Room-claim client: the at-most-one-worker-per-room gate.
//!
//! Claiming is an idempotent HTTP call that writes the claim record iff
//! absent; release is a compare-and-delete. Contention is not an error —
//! the loser simply never joins the room.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use vox_broker::channels::room_claim_key;
use vox_broker::Broker;
use vox_core::config::ROOM_CLAIM_TTL_SECS;
use vox_core::types::{AgentInstanceId, RoomName};

use crate::error::{Result, WebrtcError};

const CLAIM_TIMEOUT: Duration = Duration::from_secs(5);

/// The claim operations a worker needs. [`RoomClaimClient`] is the HTTP
/// implementation; [`BrokerClaimService`] talks to the broker directly and
/// backs both the gateway's claim endpoints and single-process runs.
#[async_trait]
pub trait ClaimService: Send + Sync {
    async fn claim(&self, room: &RoomName, agent: &AgentInstanceId) -> Result<ClaimOutcome>;
    async fn release(&self, room: &RoomName, agent: &AgentInstanceId) -> Result<()>;
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClaimRequest<'a> {
    room_name: &'a str,
    agent_id: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimOutcome {
    pub claimed: bool,
    #[serde(default)]
    pub existing_agent_id: Option<String>,
}

pub struct RoomClaimClient {
    base_url: String,
    client: reqwest::Client,
}

impl RoomClaimClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Ok(Self {
            base_url: base_url.into(),
            client: reqwest::Client::builder().timeout(CLAIM_TIMEOUT).build()?,
        })
    }
}

#[async_trait]
impl ClaimService for RoomClaimClient {
    /// Attempt to claim `room` for this worker instance.
    async fn claim(&self, room: &RoomName, agent: &AgentInstanceId) -> Result<ClaimOutcome> {
        let resp = self
            .client
            .post(format!("{}/claim-room", self.base_url))
            .json(&ClaimRequest {
                room_name: room.as_str(),
                agent_id: agent.as_str(),
            })
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(WebrtcError::Claim(format!(
                "claim-room returned HTTP {}",
                resp.status().as_u16()
            )));
        }
        let outcome: ClaimOutcome = resp.json().await?;
        if outcome.claimed {
            info!(room = %room, agent = %agent, "room claimed");
        } else {
            debug!(
                room = %room,
                holder = outcome.existing_agent_id.as_deref().unwrap_or("?"),
                "room already claimed"
            );
        }
        Ok(outcome)
    }

    /// Release the claim iff this instance still holds it.
    async fn release(&self, room: &RoomName, agent: &AgentInstanceId) -> Result<()> {
        let resp = self
            .client
            .delete(format!("{}/claim-room", self.base_url))
            .json(&ClaimRequest {
                room_name: room.as_str(),
                agent_id: agent.as_str(),
            })
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(WebrtcError::Claim(format!(
                "claim release returned HTTP {}",
                resp.status().as_u16()
            )));
        }
        debug!(room = %room, agent = %agent, "room claim released");
        Ok(())
    }
}

/// Broker-backed claim semantics: `SET RoomClaim:<room> <agent> NX EX <ttl>`
/// to claim, compare-and-delete to release. The gateway's HTTP endpoints are
/// a thin wrapper around this.
pub struct BrokerClaimService {
    broker: Arc<dyn Broker>,
}

impl BrokerClaimService {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl ClaimService for BrokerClaimService {
    async fn claim(&self, room: &RoomName, agent: &AgentInstanceId) -> Result<ClaimOutcome> {
        let key = room_claim_key(room);
        let created = self
            .broker
            .set_nx_ex(&key, agent.as_str(), ROOM_CLAIM_TTL_SECS)
            .await
            .map_err(|e| WebrtcError::Claim(e.to_string()))?;
        if created {
            info!(room = %room, agent = %agent, "room claimed");
            return Ok(ClaimOutcome {
                claimed: true,
                existing_agent_id: None,
            });
        }
        let holder = self
            .broker
            .get(&key)
            .await
            .map_err(|e| WebrtcError::Claim(e.to_string()))?;
        Ok(ClaimOutcome {
            claimed: false,
            existing_agent_id: holder,
        })
    }

    async fn release(&self, room: &RoomName, agent: &AgentInstanceId) -> Result<()> {
        let key = room_claim_key(room);
        let holder = self
            .broker
            .get(&key)
            .await
            .map_err(|e| WebrtcError::Claim(e.to_string()))?;
        // compare-and-delete: only the recorded holder may release
        if holder.as_deref() == Some(agent.as_str()) {
            self.broker
                .del(&key)
                .await
                .map_err(|e| WebrtcError::Claim(e.to_string()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vox_broker::memory::MemoryBroker;

    #[test]
    fn claim_request_wire_format() {
        let body = serde_json::to_string(&ClaimRequest {
            room_name: "room-A",
            agent_id: "job-1:task-2",
        })
        .unwrap();
        assert_eq!(body, r#"{"roomName":"room-A","agentId":"job-1:task-2"}"#);
    }

    #[test]
    fn outcome_parses_contended_response() {
        let outcome: ClaimOutcome =
            serde_json::from_str(r#"{"claimed":false,"existingAgentId":"job-0:task-0"}"#).unwrap();
        assert!(!outcome.claimed);
        assert_eq!(outcome.existing_agent_id.as_deref(), Some("job-0:task-0"));

        let won: ClaimOutcome = serde_json::from_str(r#"{"claimed":true}"#).unwrap();
        assert!(won.claimed);
        assert!(won.existing_agent_id.is_none());
    }

    #[tokio::test]
    async fn broker_claim_admits_exactly_one_worker() {
        let service = BrokerClaimService::new(Arc::new(MemoryBroker::new()));
        let room = RoomName::from("room-A");
        let first = AgentInstanceId::from("job-1:task-1");
        let second = AgentInstanceId::from("job-2:task-1");

        assert!(service.claim(&room, &first).await.unwrap().claimed);
        let lost = service.claim(&room, &second).await.unwrap();
        assert!(!lost.claimed);
        assert_eq!(lost.existing_agent_id.as_deref(), Some("job-1:task-1"));
    }

    #[tokio::test]
    async fn release_is_compare_and_delete() {
        let service = BrokerClaimService::new(Arc::new(MemoryBroker::new()));
        let room = RoomName::from("room-A");
        let holder = AgentInstanceId::from("job-1:task-1");
        let imposter = AgentInstanceId::from("job-9:task-9");

        service.claim(&room, &holder).await.unwrap();
        // a non-holder release is a no-op
        service.release(&room, &imposter).await.unwrap();
        assert!(!service.claim(&room, &imposter).await.unwrap().claimed);

        service.release(&room, &holder).await.unwrap();
        assert!(service.claim(&room, &imposter).await.unwrap().claimed);
    }
}
