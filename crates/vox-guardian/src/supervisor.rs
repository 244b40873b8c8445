//! Per-session supervision: metric accumulation, risk events, the
//! auto-handoff decision, and takeover command handling.

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use serde_json::json;
use tracing::{debug, info, warn};

use vox_broker::channels::{takeover_lock_key, CH_GUARDIAN_ALERTS, CH_GUARDIAN_EVENTS, CH_GUARDIAN_TAKEOVER};
use vox_broker::payloads::{
    CommandKind, EventKind, GuardianAlert, GuardianEvent, TakeoverCommand,
};
use vox_broker::Broker;
use vox_core::config::{GuardianSettings, TAKEOVER_LOCK_TTL_SECS};
use vox_core::types::{AgentConfigId, ConversationId, RiskLevel};
use vox_db::Database;

use crate::risk::{RiskClassifier, RiskScore};
use crate::sentiment::compound_score;

/// Risk-event log cap per session.
const MAX_RISK_EVENTS: usize = 10;

/// Controller hook invoked on takeover (`mute = true`) and release
/// (`mute = false`).
pub type TakeoverCallback = Arc<dyn Fn(bool) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct RiskEvent {
    pub level: RiskLevel,
    pub matched_keywords: Vec<String>,
    pub category: String,
    pub timestamp: String,
}

/// Snapshot of a session's accumulator, for the admin surface and tests.
#[derive(Debug, Clone)]
pub struct SessionStats {
    pub message_count: u64,
    pub mean_sentiment: f64,
    pub max_risk_level: RiskLevel,
    pub human_active: bool,
    pub risk_events: usize,
}

struct SessionState {
    agent: AgentConfigId,
    message_count: u64,
    sentiment_sum: f64,
    sentiment_count: u64,
    max_risk: RiskLevel,
    events: VecDeque<RiskEvent>,
    human_active: bool,
    classifier: RiskClassifier,
    threshold: f64,
    auto_handoff: bool,
}

impl SessionState {
    fn mean_sentiment(&self) -> f64 {
        if self.sentiment_count == 0 {
            0.0
        } else {
            self.sentiment_sum / self.sentiment_count as f64
        }
    }
}

pub struct GuardianSupervisor {
    sessions: DashMap<ConversationId, SessionState>,
    callbacks: DashMap<ConversationId, TakeoverCallback>,
    /// Device-scoped fallback: one per SIP-bridge process, used when a
    /// command arrives for a conversation without its own callback.
    device_callback: std::sync::Mutex<Option<TakeoverCallback>>,
    /// At-most-once guard per `(conversation, command, timestamp)`.
    seen_commands: DashMap<(String, CommandKind, i64), ()>,
    broker: Arc<dyn Broker>,
    db: Arc<Database>,
    settings: GuardianSettings,
}

impl GuardianSupervisor {
    pub fn new(broker: Arc<dyn Broker>, db: Arc<Database>, settings: GuardianSettings) -> Self {
        Self {
            sessions: DashMap::new(),
            callbacks: DashMap::new(),
            device_callback: std::sync::Mutex::new(None),
            seen_commands: DashMap::new(),
            broker,
            db,
            settings,
        }
    }

    /// Open supervision for a conversation, loading the agent's keyword
    /// config. A load failure raises an alert and falls back to defaults —
    /// supervision never blocks a call from starting.
    pub async fn open_session(&self, conversation: &ConversationId, agent: &AgentConfigId) {
        let (classifier, threshold, auto_handoff) = match self.db.guardian_config(agent) {
            Ok(Some(row)) => (
                RiskClassifier::from_keywords(
                    row.critical_keywords,
                    row.high_risk_keywords,
                    row.medium_risk_keywords,
                ),
                row.auto_handoff_threshold,
                row.enabled,
            ),
            Ok(None) => (
                RiskClassifier::default(),
                self.settings.handoff_threshold,
                self.settings.enabled,
            ),
            Err(e) => {
                warn!(agent = %agent, "guardian config load failed: {e}");
                self.publish_alert(GuardianAlert::config_load_failed(agent, e.to_string()))
                    .await;
                (
                    RiskClassifier::default(),
                    self.settings.handoff_threshold,
                    self.settings.enabled,
                )
            }
        };

        self.sessions.insert(
            conversation.clone(),
            SessionState {
                agent: agent.clone(),
                message_count: 0,
                sentiment_sum: 0.0,
                sentiment_count: 0,
                max_risk: RiskLevel::Low,
                events: VecDeque::new(),
                human_active: false,
                classifier,
                threshold,
                auto_handoff,
            },
        );
        info!(conversation = %conversation, agent = %agent, "guardian session opened");
    }

    /// Analyse one final transcript. Returns the risk score, or `None` when
    /// the conversation has no open session.
    pub async fn record_transcript(
        &self,
        conversation: &ConversationId,
        speaker: &str,
        text: &str,
    ) -> Option<RiskScore> {
        // Mutate under the map guard, then publish after releasing it.
        let (agent, risk, mean, should_intervene, auto_handoff, threshold) = {
            let mut session = self.sessions.get_mut(conversation)?;

            let sentiment = compound_score(text);
            session.sentiment_sum += sentiment;
            session.sentiment_count += 1;
            session.message_count += 1;

            let risk = session.classifier.classify(text, sentiment);
            session.max_risk = session.max_risk.max(risk.level);

            if risk.level >= RiskLevel::High {
                session.events.push_back(RiskEvent {
                    level: risk.level,
                    matched_keywords: risk.matched_keywords.clone(),
                    category: risk.category.clone(),
                    timestamp: chrono::Utc::now().to_rfc3339(),
                });
                while session.events.len() > MAX_RISK_EVENTS {
                    session.events.pop_front();
                }
            }

            let should_intervene = !session.human_active
                && (risk.score >= session.threshold || risk.level == RiskLevel::Critical);

            (
                session.agent.clone(),
                risk,
                session.mean_sentiment(),
                should_intervene,
                session.auto_handoff,
                session.threshold,
            )
        };

        self.publish_event(
            EventKind::SentimentUpdate,
            conversation,
            &agent,
            json!({
                "speaker": speaker,
                "mean_sentiment": mean,
            }),
        )
        .await;

        if !risk.matched_keywords.is_empty() || risk.level >= RiskLevel::Medium {
            self.publish_event(
                EventKind::RiskDetected,
                conversation,
                &agent,
                json!({
                    "level": risk.level,
                    "score": risk.score,
                    "matched_keywords": risk.matched_keywords,
                    "category": risk.category,
                    "speaker": speaker,
                }),
            )
            .await;
        }

        if should_intervene {
            if auto_handoff {
                info!(
                    conversation = %conversation,
                    level = %risk.level,
                    score = risk.score,
                    threshold,
                    "auto-handoff triggered"
                );
                let command = TakeoverCommand {
                    conversation_id: conversation.clone(),
                    command: CommandKind::Takeover,
                    timestamp: chrono::Utc::now().timestamp_millis(),
                };
                if let Ok(payload) = serde_json::to_string(&command) {
                    if let Err(e) = self.broker.publish(CH_GUARDIAN_TAKEOVER, &payload).await {
                        warn!("takeover publish failed: {e}");
                    }
                }
            } else {
                self.publish_alert(GuardianAlert {
                    alert: "handoff_recommended".to_string(),
                    conversation_id: Some(conversation.clone()),
                    detail: format!(
                        "risk {} ({}) exceeded threshold with auto-handoff disabled",
                        risk.level, risk.category
                    ),
                    timestamp: chrono::Utc::now().to_rfc3339(),
                })
                .await;
            }
        }

        Some(risk)
    }

    /// Handle one operator command. At-most-once per
    /// `(conversation, command, timestamp)` within this process, and fenced
    /// across processes by the broker lock.
    pub async fn handle_command(&self, cmd: &TakeoverCommand) {
        let dedup_key = (
            cmd.conversation_id.as_str().to_string(),
            cmd.command,
            cmd.timestamp,
        );
        if self.seen_commands.insert(dedup_key, ()).is_some() {
            debug!(conversation = %cmd.conversation_id, "duplicate command dropped");
            return;
        }

        let lock_key = takeover_lock_key(&cmd.conversation_id);
        match self
            .broker
            .set_nx_ex(&lock_key, "1", TAKEOVER_LOCK_TTL_SECS)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(conversation = %cmd.conversation_id, "takeover lock held elsewhere, dropping command");
                return;
            }
            Err(e) => {
                warn!("takeover lock attempt failed: {e}");
                return;
            }
        }

        // Everything below runs inside the lock window; the deletes at the
        // end are unconditional.
        let mute = cmd.command == CommandKind::Takeover;

        let callback = self
            .callbacks
            .get(&cmd.conversation_id)
            .map(|cb| cb.clone())
            .or_else(|| self.device_callback.lock().unwrap().clone());

        match callback {
            Some(cb) => {
                cb(mute).await;
                let agent = self.set_human_active(&cmd.conversation_id, mute);
                if let Some(agent) = agent {
                    let kind = if mute {
                        EventKind::TakeoverInitiated
                    } else {
                        EventKind::TakeoverReleased
                    };
                    self.publish_event(
                        kind,
                        &cmd.conversation_id,
                        &agent,
                        json!({ "timestamp_ms": cmd.timestamp }),
                    )
                    .await;
                }
            }
            None => warn!(
                conversation = %cmd.conversation_id,
                "no callback registered for takeover command"
            ),
        }

        if let Err(e) = self.broker.del(&lock_key).await {
            warn!("takeover lock release failed: {e} (TTL will reap it)");
        }
    }

    /// Register the per-conversation takeover hook.
    pub fn register_callback(&self, conversation: &ConversationId, callback: TakeoverCallback) {
        self.callbacks.insert(conversation.clone(), callback);
    }

    /// Register the process-wide fallback hook (one per SIP-bridge process).
    pub fn register_device_callback(&self, callback: TakeoverCallback) {
        *self.device_callback.lock().unwrap() = Some(callback);
    }

    /// Mark whether a human currently owns the session's audio.
    /// Returns the agent id when the session exists.
    pub fn set_human_active(&self, conversation: &ConversationId, active: bool) -> Option<AgentConfigId> {
        let mut session = self.sessions.get_mut(conversation)?;
        session.human_active = active;
        Some(session.agent.clone())
    }

    pub fn stats(&self, conversation: &ConversationId) -> Option<SessionStats> {
        let session = self.sessions.get(conversation)?;
        Some(SessionStats {
            message_count: session.message_count,
            mean_sentiment: session.mean_sentiment(),
            max_risk_level: session.max_risk,
            human_active: session.human_active,
            risk_events: session.events.len(),
        })
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Close supervision. The lock delete is unconditional — it purges any
    /// orphan from a crashed holder; TTL is the last line of defense.
    pub async fn close_session(&self, conversation: &ConversationId) {
        if let Some((_, session)) = self.sessions.remove(conversation) {
            self.publish_event(
                EventKind::SessionEnded,
                conversation,
                &session.agent,
                json!({
                    "message_count": session.message_count,
                    "mean_sentiment": session.mean_sentiment(),
                    "max_risk_level": session.max_risk,
                }),
            )
            .await;
        }
        self.callbacks.remove(conversation);
        if let Err(e) = self.broker.del(&takeover_lock_key(conversation)).await {
            warn!("orphan lock purge failed: {e}");
        }
    }

    async fn publish_event(
        &self,
        event: EventKind,
        conversation: &ConversationId,
        agent: &AgentConfigId,
        data: serde_json::Value,
    ) {
        let envelope = GuardianEvent {
            event,
            conversation_id: conversation.clone(),
            agent_config_id: agent.clone(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            data,
        };
        if let Ok(payload) = serde_json::to_string(&envelope) {
            if let Err(e) = self.broker.publish(CH_GUARDIAN_EVENTS, &payload).await {
                debug!("event publish failed: {e}");
            }
        }
    }

    async fn publish_alert(&self, alert: GuardianAlert) {
        if let Ok(payload) = serde_json::to_string(&alert) {
            if let Err(e) = self.broker.publish(CH_GUARDIAN_ALERTS, &payload).await {
                debug!("alert publish failed: {e}");
            }
        }
        if let Some(url) = self.settings.alert_webhook_url.clone() {
            let body = serde_json::to_value(&alert).unwrap_or_default();
            tokio::spawn(async move {
                let client = reqwest::Client::new();
                if let Err(e) = client.post(&url).json(&body).send().await {
                    warn!("alert webhook delivery failed: {e}");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use vox_broker::memory::MemoryBroker;

    async fn supervisor() -> (Arc<GuardianSupervisor>, Arc<dyn Broker>) {
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let db = Arc::new(Database::open_in_memory().unwrap());
        (
            Arc::new(GuardianSupervisor::new(
                broker.clone(),
                db,
                GuardianSettings::default(),
            )),
            broker,
        )
    }

    fn counting_callback(counter: Arc<AtomicU32>) -> TakeoverCallback {
        Arc::new(move |_mute| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    #[tokio::test]
    async fn running_mean_is_exact_arithmetic_mean() {
        let (sup, _) = supervisor().await;
        let conv = ConversationId::from("c1");
        sup.open_session(&conv, &AgentConfigId::from("a1")).await;

        let texts = [
            "this is great",
            "this is terrible",
            "I love it",
            "the order number is 12",
        ];
        let mut scores = Vec::new();
        for t in texts {
            sup.record_transcript(&conv, "user", t).await.unwrap();
            scores.push(compound_score(t));
        }
        let expected: f64 = scores.iter().sum::<f64>() / scores.len() as f64;
        let stats = sup.stats(&conv).unwrap();
        assert_eq!(stats.mean_sentiment, expected);
        assert_eq!(stats.message_count, 4);
    }

    #[tokio::test]
    async fn max_risk_level_is_monotone() {
        let (sup, _) = supervisor().await;
        let conv = ConversationId::from("c1");
        sup.open_session(&conv, &AgentConfigId::from("a1")).await;

        let _ = sup.record_transcript(&conv, "user", "give me a manager now").await;
        assert_eq!(sup.stats(&conv).unwrap().max_risk_level, RiskLevel::High);

        // a calm utterance never lowers the max
        let _ = sup.record_transcript(&conv, "user", "thanks that helps").await;
        assert_eq!(sup.stats(&conv).unwrap().max_risk_level, RiskLevel::High);

        let _ = sup.record_transcript(&conv, "user", "I will sue").await;
        assert_eq!(sup.stats(&conv).unwrap().max_risk_level, RiskLevel::Critical);
    }

    #[tokio::test]
    async fn risk_event_log_caps_at_ten() {
        let (sup, _) = supervisor().await;
        let conv = ConversationId::from("c1");
        sup.open_session(&conv, &AgentConfigId::from("a1")).await;

        for _ in 0..15 {
            let _ = sup.record_transcript(&conv, "user", "I want a manager").await;
        }
        assert_eq!(sup.stats(&conv).unwrap().risk_events, 10);
    }

    #[tokio::test]
    async fn critical_utterance_emits_takeover_command() {
        let (sup, broker) = supervisor().await;
        let mut takeover_rx = broker.subscribe(CH_GUARDIAN_TAKEOVER).await.unwrap();
        let conv = ConversationId::from("c1");
        sup.open_session(&conv, &AgentConfigId::from("a1")).await;

        let risk = sup
            .record_transcript(&conv, "user", "I'm going to sue you if this isn't fixed.")
            .await
            .unwrap();
        assert_eq!(risk.level, RiskLevel::Critical);
        assert_eq!(risk.matched_keywords, vec!["sue"]);

        let msg = takeover_rx.recv().await.unwrap();
        let cmd: TakeoverCommand = serde_json::from_str(&msg.payload).unwrap();
        assert_eq!(cmd.conversation_id, conv);
        assert_eq!(cmd.command, CommandKind::Takeover);
    }

    #[tokio::test]
    async fn duplicate_commands_run_callback_at_most_once() {
        let (sup, _) = supervisor().await;
        let conv = ConversationId::from("c1");
        sup.open_session(&conv, &AgentConfigId::from("a1")).await;

        let calls = Arc::new(AtomicU32::new(0));
        sup.register_callback(&conv, counting_callback(calls.clone()));

        let cmd = TakeoverCommand {
            conversation_id: conv.clone(),
            command: CommandKind::Takeover,
            timestamp: 1_700_000_000_000,
        };
        sup.handle_command(&cmd).await;
        sup.handle_command(&cmd).await;
        sup.handle_command(&cmd).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(sup.stats(&conv).unwrap().human_active);
    }

    #[tokio::test]
    async fn lock_contention_drops_the_command() {
        let (sup, broker) = supervisor().await;
        let conv = ConversationId::from("c1");
        sup.open_session(&conv, &AgentConfigId::from("a1")).await;

        let calls = Arc::new(AtomicU32::new(0));
        sup.register_callback(&conv, counting_callback(calls.clone()));

        // another process holds the command window
        broker
            .set_nx_ex(&takeover_lock_key(&conv), "1", 30)
            .await
            .unwrap();

        sup.handle_command(&TakeoverCommand {
            conversation_id: conv.clone(),
            command: CommandKind::Takeover,
            timestamp: 1,
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn command_window_reopens_after_callback() {
        let (sup, broker) = supervisor().await;
        let conv = ConversationId::from("c1");
        sup.open_session(&conv, &AgentConfigId::from("a1")).await;

        let calls = Arc::new(AtomicU32::new(0));
        sup.register_callback(&conv, counting_callback(calls.clone()));

        sup.handle_command(&TakeoverCommand {
            conversation_id: conv.clone(),
            command: CommandKind::Takeover,
            timestamp: 1,
        })
        .await;
        // lock released in the finally path → a release command can run
        assert!(broker.get(&takeover_lock_key(&conv)).await.unwrap().is_none());

        sup.handle_command(&TakeoverCommand {
            conversation_id: conv.clone(),
            command: CommandKind::Release,
            timestamp: 2,
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!sup.stats(&conv).unwrap().human_active);
    }

    #[tokio::test]
    async fn device_callback_is_the_fallback() {
        let (sup, _) = supervisor().await;
        let conv = ConversationId::from("c-unknown");
        sup.open_session(&conv, &AgentConfigId::from("a1")).await;

        let calls = Arc::new(AtomicU32::new(0));
        sup.register_device_callback(counting_callback(calls.clone()));

        sup.handle_command(&TakeoverCommand {
            conversation_id: conv.clone(),
            command: CommandKind::Takeover,
            timestamp: 9,
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_session_purges_lock_and_emits_session_ended() {
        let (sup, broker) = supervisor().await;
        let mut events_rx = broker.subscribe(CH_GUARDIAN_EVENTS).await.unwrap();
        let conv = ConversationId::from("c1");
        sup.open_session(&conv, &AgentConfigId::from("a1")).await;

        // orphan lock from a crashed holder
        broker.set_nx_ex(&takeover_lock_key(&conv), "1", 30).await.unwrap();

        sup.close_session(&conv).await;
        assert!(broker.get(&takeover_lock_key(&conv)).await.unwrap().is_none());
        assert!(sup.stats(&conv).is_none());

        let msg = events_rx.recv().await.unwrap();
        let event: GuardianEvent = serde_json::from_str(&msg.payload).unwrap();
        assert!(matches!(event.event, EventKind::SessionEnded));
    }

    #[tokio::test]
    async fn intervention_respects_human_active() {
        let (sup, broker) = supervisor().await;
        let mut takeover_rx = broker.subscribe(CH_GUARDIAN_TAKEOVER).await.unwrap();
        let conv = ConversationId::from("c1");
        sup.open_session(&conv, &AgentConfigId::from("a1")).await;
        sup.set_human_active(&conv, true);

        let _ = sup.record_transcript(&conv, "user", "I will sue you").await;
        // human already owns the call — no second takeover
        assert!(takeover_rx.try_recv().is_err());
    }
}
