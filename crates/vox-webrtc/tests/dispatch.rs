// End-to-end dispatch flow against a scripted room: claim gating, in-band
// takeover/release, and disconnect cleanup.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use vox_broker::memory::MemoryBroker;
use vox_broker::Broker;
use vox_core::config::{GuardianSettings, ProvidersConfig};
use vox_core::types::{AgentConfigId, AgentInstanceId, RoomName};
use vox_db::types::{AgentConfig, ProviderSpec};
use vox_db::Database;
use vox_guardian::GuardianSupervisor;
use vox_providers::{
    AudioClip, ChatRequest, ChatResponse, LlmProvider, LlmRegistry, ProviderError, SessionFactory,
    SttProvider, SttRegistry, Synthesis, Transcription, TtsProvider, TtsRegistry,
};
use vox_webrtc::room::{GUARDIAN_COMMAND_TOPIC, GUARDIAN_STATUS_TOPIC};
use vox_webrtc::{
    AgentSessionController, AudioPublisher, BrokerClaimService, ClaimService, Dispatch, RoomClient,
    RoomEvent, RoomSession,
};

// ── scripted room ─────────────────────────────────────────────────────────────

#[derive(Default)]
struct RoomShared {
    connects: AtomicU32,
    published_tracks: Mutex<Vec<String>>,
    unpublish_calls: AtomicU32,
    data_out: Mutex<Vec<(String, Vec<u8>)>>,
    disconnects: AtomicU32,
}

struct FakeRoomClient {
    shared: Arc<RoomShared>,
    events: Mutex<Option<mpsc::Receiver<RoomEvent>>>,
}

#[async_trait]
impl RoomClient for FakeRoomClient {
    async fn connect(
        &self,
        _room: &RoomName,
        _identity: &str,
    ) -> vox_webrtc::Result<Box<dyn RoomSession>> {
        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeRoomSession {
            shared: self.shared.clone(),
            events: self.events.lock().unwrap().take(),
        }))
    }
}

struct FakeRoomSession {
    shared: Arc<RoomShared>,
    events: Option<mpsc::Receiver<RoomEvent>>,
}

#[async_trait]
impl RoomSession for FakeRoomSession {
    async fn publish_audio_track(
        &mut self,
        name: &str,
    ) -> vox_webrtc::Result<Box<dyn AudioPublisher>> {
        self.shared
            .published_tracks
            .lock()
            .unwrap()
            .push(name.to_string());
        Ok(Box::new(FakePublisher))
    }

    async fn unpublish_all(&mut self) -> vox_webrtc::Result<()> {
        self.shared.unpublish_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn publish_data(&mut self, topic: &str, payload: &[u8]) -> vox_webrtc::Result<()> {
        self.shared
            .data_out
            .lock()
            .unwrap()
            .push((topic.to_string(), payload.to_vec()));
        Ok(())
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<RoomEvent>> {
        self.events.take()
    }

    async fn disconnect(&mut self) -> vox_webrtc::Result<()> {
        self.shared.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FakePublisher;

#[async_trait]
impl AudioPublisher for FakePublisher {
    async fn write(&mut self, _samples: &[i16]) -> vox_webrtc::Result<()> {
        Ok(())
    }
}

// ── mock providers ────────────────────────────────────────────────────────────

struct MockStt;

#[async_trait]
impl SttProvider for MockStt {
    fn name(&self) -> &str {
        "mock"
    }
    async fn transcribe(&self, _a: &AudioClip) -> Result<Transcription, ProviderError> {
        Ok(Transcription {
            text: "hello".into(),
            confidence: 1.0,
            is_final: true,
        })
    }
}

#[derive(Debug)]
struct MockLlm;

#[async_trait]
impl LlmProvider for MockLlm {
    fn name(&self) -> &str {
        "mock"
    }
    async fn generate(&self, _req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        Ok(ChatResponse {
            content: "Sure, happy to help.".into(),
            model: "mock".into(),
            tokens_in: 0,
            tokens_out: 0,
            stop_reason: "stop".into(),
            tool_calls: vec![],
        })
    }
}

struct MockTts;

#[async_trait]
impl TtsProvider for MockTts {
    fn name(&self) -> &str {
        "mock"
    }
    async fn synthesize(&self, _text: &str) -> Result<Synthesis, ProviderError> {
        Ok(Synthesis {
            samples: vec![0; 960],
            sample_rate: 48_000,
        })
    }
}

fn mock_factory(db: Arc<Database>) -> Arc<SessionFactory> {
    let mut stt = SttRegistry::empty();
    stt.register("mock", Box::new(|_, _| Ok(Arc::new(MockStt))));
    let mut llm = LlmRegistry::empty();
    llm.register("mock", Box::new(|_, _| Ok(Arc::new(MockLlm))));
    let mut tts = TtsRegistry::empty();
    tts.register("mock", Box::new(|_, _| Ok(Arc::new(MockTts))));

    Arc::new(SessionFactory::new(ProvidersConfig::default(), db).with_registries(stt, llm, tts))
}

fn seed_agent(db: &Database) -> AgentConfigId {
    let id = AgentConfigId::from("agent-1");
    let spec = |p: &str| ProviderSpec {
        provider: p.into(),
        options: serde_json::json!({}),
    };
    db.insert_agent_config(&AgentConfig {
        id: id.clone(),
        name: "webrtc agent".into(),
        llm: spec("mock"),
        stt: spec("mock"),
        tts: spec("mock"),
        system_prompt: "Be helpful.".into(),
        tts_extras: None,
        created_at: String::new(),
        updated_at: String::new(),
    })
    .unwrap();
    id
}

struct Harness {
    controller: AgentSessionController,
    shared: Arc<RoomShared>,
    event_tx: mpsc::Sender<RoomEvent>,
    broker: Arc<dyn Broker>,
    agent_id: AgentConfigId,
}

fn harness() -> Harness {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let agent_id = seed_agent(&db);
    let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
    let supervisor = Arc::new(GuardianSupervisor::new(
        broker.clone(),
        db.clone(),
        GuardianSettings::default(),
    ));
    let shared = Arc::new(RoomShared::default());
    let (event_tx, event_rx) = mpsc::channel(64);
    let room_client = Arc::new(FakeRoomClient {
        shared: shared.clone(),
        events: Mutex::new(Some(event_rx)),
    });
    let claims: Arc<dyn ClaimService> = Arc::new(BrokerClaimService::new(broker.clone()));
    let controller = AgentSessionController::new(
        db.clone(),
        supervisor,
        mock_factory(db.clone()),
        room_client,
        claims,
    );
    Harness {
        controller,
        shared,
        event_tx,
        broker,
        agent_id,
    }
}

fn dispatch(agent: &AgentConfigId) -> Dispatch {
    Dispatch {
        job_id: "job-1".into(),
        task_id: "task-1".into(),
        room: RoomName::from("room-A"),
        agent_config_id: agent.clone(),
    }
}

fn guardian_msg(kind: &str, ts: i64) -> RoomEvent {
    RoomEvent::Data {
        topic: GUARDIAN_COMMAND_TOPIC.into(),
        payload: format!(r#"{{"type":"{kind}","timestamp":{ts}}}"#).into_bytes(),
    }
}

// ── tests ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn contended_dispatch_exits_without_connecting() {
    let h = harness();

    // another worker already owns the room
    let claims = BrokerClaimService::new(h.broker.clone());
    claims
        .claim(
            &RoomName::from("room-A"),
            &AgentInstanceId::from("job-0:task-0"),
        )
        .await
        .unwrap();

    let outcome = h.controller.handle_dispatch(&dispatch(&h.agent_id)).await.unwrap();
    assert_eq!(outcome, vox_webrtc::DispatchOutcome::AlreadyClaimed);
    // never connected, never published audio
    assert_eq!(h.shared.connects.load(Ordering::SeqCst), 0);
    assert!(h.shared.published_tracks.lock().unwrap().is_empty());
}

#[tokio::test]
async fn normal_session_claims_runs_and_releases() {
    let h = harness();
    h.event_tx.send(RoomEvent::Disconnected).await.unwrap();

    let outcome = h.controller.handle_dispatch(&dispatch(&h.agent_id)).await.unwrap();
    assert_eq!(outcome, vox_webrtc::DispatchOutcome::Completed);
    assert_eq!(h.shared.connects.load(Ordering::SeqCst), 1);
    assert_eq!(h.shared.disconnects.load(Ordering::SeqCst), 1);

    // claim was released: a fresh worker can claim the room again
    let claims = BrokerClaimService::new(h.broker.clone());
    assert!(claims
        .claim(
            &RoomName::from("room-A"),
            &AgentInstanceId::from("job-9:task-9")
        )
        .await
        .unwrap()
        .claimed);
}

#[tokio::test]
async fn takeover_unpublishes_and_release_rebuilds() {
    let h = harness();

    h.event_tx.send(guardian_msg("takeover", 1_000)).await.unwrap();
    // duplicate (type, timestamp) must be ignored
    h.event_tx.send(guardian_msg("takeover", 1_000)).await.unwrap();
    h.event_tx.send(guardian_msg("release", 2_000)).await.unwrap();
    h.event_tx.send(RoomEvent::Disconnected).await.unwrap();

    let outcome = h.controller.handle_dispatch(&dispatch(&h.agent_id)).await.unwrap();
    assert_eq!(outcome, vox_webrtc::DispatchOutcome::Completed);

    // exactly one takeover happened despite the duplicate
    assert_eq!(h.shared.unpublish_calls.load(Ordering::SeqCst), 1);

    let tracks = h.shared.published_tracks.lock().unwrap().clone();
    // initial agent track, hold line, rebuilt agent track — in that order
    assert_eq!(
        tracks,
        vec!["agent-audio", "hold-line", "agent-audio"]
    );

    // release published a status message
    let data = h.shared.data_out.lock().unwrap().clone();
    assert!(data.iter().any(|(topic, payload)| {
        topic == GUARDIAN_STATUS_TOPIC
            && serde_json::from_slice::<serde_json::Value>(payload)
                .map(|v| v["engine"] == "rebuilt")
                .unwrap_or(false)
    }));
}
