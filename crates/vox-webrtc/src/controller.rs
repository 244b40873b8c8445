//! Per-dispatch agent session: claim the room, join, run a turn engine
//! against the remote participant, and coordinate graceful takeover over the
//! in-band data channel.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use vox_audio::chameleon::{AdapterConfig, VibeVector, VoiceAdapter};
use vox_audio::{frame_samples, resample_any, WEBRTC_RATE};
use vox_broker::payloads::{CommandKind, GuardianDataMessage};
use vox_core::types::{
    AgentConfigId, AgentInstanceId, ConversationId, MessageRole, OriginChannel, RoomName,
};
use vox_db::types::AgentConfig;
use vox_db::Database;
use vox_guardian::GuardianSupervisor;
use vox_providers::{SessionFactory, TtsProvider};
use vox_tools::synthesizer::{SynthesizedTools, ToolSynthesizer};
use vox_tools::Tool;
use vox_turn::{
    CallMedia, MediaError, TurnEngine, TurnEngineConfig, TurnEvent, TurnHandle,
};

use crate::claim::ClaimService;
use crate::error::{Result, WebrtcError};
use crate::room::{
    AudioPublisher, RoomClient, RoomEvent, RoomSession, GUARDIAN_COMMAND_TOPIC,
    GUARDIAN_STATUS_TOPIC,
};

const AGENT_IDENTITY: &str = "voxnexus-agent";
const DEFAULT_GREETING: &str = "Hello! How can I help you today?";
const HOLD_LINE: &str = "Please hold for a moment while I connect you with a specialist.";
const RESUME_LINE: &str = "I'm back. Thanks for your patience.";

/// One worker dispatch for a room.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub job_id: String,
    pub task_id: String,
    pub room: RoomName,
    pub agent_config_id: AgentConfigId,
}

impl Dispatch {
    pub fn instance_id(&self) -> AgentInstanceId {
        AgentInstanceId::from_dispatch(&self.job_id, &self.task_id)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Ran the session to disconnect.
    Completed,
    /// Another worker holds the room; exited without connecting.
    AlreadyClaimed,
}

/// Adapts room audio to the turn engine's media contract: inbound chunks are
/// re-framed to 20 ms, outbound PCM is written to the published track in
/// 10 ms frames.
struct RoomMedia {
    frames_rx: mpsc::Receiver<Vec<i16>>,
    pending: Vec<i16>,
    publisher: Box<dyn AudioPublisher>,
}

#[async_trait::async_trait]
impl CallMedia for RoomMedia {
    fn sample_rate(&self) -> u32 {
        WEBRTC_RATE
    }

    async fn capture_frame(&mut self) -> std::result::Result<Option<Vec<i16>>, MediaError> {
        let frame_len = frame_samples(WEBRTC_RATE);
        while self.pending.len() < frame_len {
            match self.frames_rx.recv().await {
                Some(chunk) => self.pending.extend_from_slice(&chunk),
                None => return Ok(None),
            }
        }
        let rest = self.pending.split_off(frame_len);
        let frame = std::mem::replace(&mut self.pending, rest);
        Ok(Some(frame))
    }

    async fn play(&mut self, samples: &[i16], _rate: u32) -> std::result::Result<(), MediaError> {
        // 10 ms publishing cadence
        for chunk in samples.chunks(frame_samples(WEBRTC_RATE) / 2) {
            self.publisher
                .write(chunk)
                .await
                .map_err(|e| MediaError::Playback(e.to_string()))?;
        }
        Ok(())
    }

    async fn stop_playback(&mut self) -> std::result::Result<(), MediaError> {
        Ok(())
    }
}

struct EngineRuntime {
    handle: TurnHandle,
    audio_tx: mpsc::Sender<Vec<i16>>,
    engine_task: JoinHandle<()>,
    forwarder_task: JoinHandle<()>,
    tts: Arc<dyn TtsProvider>,
}

pub struct AgentSessionController {
    db: Arc<Database>,
    supervisor: Arc<GuardianSupervisor>,
    factory: Arc<SessionFactory>,
    synthesizer: ToolSynthesizer,
    room_client: Arc<dyn RoomClient>,
    claims: Arc<dyn ClaimService>,
}

impl AgentSessionController {
    pub fn new(
        db: Arc<Database>,
        supervisor: Arc<GuardianSupervisor>,
        factory: Arc<SessionFactory>,
        room_client: Arc<dyn RoomClient>,
        claims: Arc<dyn ClaimService>,
    ) -> Self {
        Self {
            synthesizer: ToolSynthesizer::new(db.clone()),
            db,
            supervisor,
            factory,
            room_client,
            claims,
        }
    }

    /// Run one dispatch to completion. Claim contention exits silently —
    /// no connect, no published audio, no retry.
    pub async fn handle_dispatch(&self, dispatch: &Dispatch) -> Result<DispatchOutcome> {
        let instance = dispatch.instance_id();
        let outcome = self.claims.claim(&dispatch.room, &instance).await?;
        if !outcome.claimed {
            info!(
                room = %dispatch.room,
                holder = outcome.existing_agent_id.as_deref().unwrap_or("?"),
                "dispatch skipped, room already has a worker"
            );
            return Ok(DispatchOutcome::AlreadyClaimed);
        }

        let result = self.run_session(dispatch).await;

        // The claim is released on every exit path; TTL covers a crash.
        if let Err(e) = self.claims.release(&dispatch.room, &instance).await {
            warn!(room = %dispatch.room, "claim release failed: {e}");
        }
        result?;
        Ok(DispatchOutcome::Completed)
    }

    async fn run_session(&self, dispatch: &Dispatch) -> Result<()> {
        let agent = self.db.get_agent_config(&dispatch.agent_config_id)?;
        let mut session = self
            .room_client
            .connect(&dispatch.room, AGENT_IDENTITY)
            .await?;
        let mut events = session
            .take_events()
            .ok_or_else(|| WebrtcError::Room("room session has no event stream".into()))?;

        let conversation = self.db.create_conversation(
            &agent.id,
            dispatch.room.as_str(),
            json!({ "channel": OriginChannel::Webrtc, "room": dispatch.room.as_str() }),
        )?;
        self.supervisor.open_session(&conversation.id, &agent.id).await;

        // Tools are compiled once per dispatch; an engine rebuilt on release
        // reuses them (adaptive-memory lessons are not reloaded mid-call).
        let tools = self
            .synthesizer
            .synthesize(&agent.id, self.factory.embeddings());

        let mut runtime = self
            .spawn_engine(&agent, &conversation.id, &tools, session.as_mut())
            .await?;

        let mut seen_commands: HashSet<(CommandKind, i64)> = HashSet::new();
        let mut torn_down = false;

        while let Some(event) = events.recv().await {
            match event {
                RoomEvent::AudioFrame { samples, .. } => {
                    if !torn_down {
                        let _ = runtime.audio_tx.send(samples).await;
                    }
                }
                RoomEvent::Data { topic, payload } if topic == GUARDIAN_COMMAND_TOPIC => {
                    let Ok(msg) = serde_json::from_slice::<GuardianDataMessage>(&payload) else {
                        warn!("unparseable guardian data message");
                        continue;
                    };
                    if !seen_commands.insert(msg.dedup_key()) {
                        debug!("duplicate guardian command ignored");
                        continue;
                    }
                    match msg.kind {
                        CommandKind::Takeover if !torn_down => {
                            self.takeover(&conversation.id, &mut runtime, session.as_mut())
                                .await;
                            torn_down = true;
                        }
                        CommandKind::Release if torn_down => {
                            runtime = self
                                .release(
                                    &agent,
                                    &conversation.id,
                                    &tools,
                                    runtime,
                                    session.as_mut(),
                                )
                                .await?;
                            torn_down = false;
                        }
                        _ => debug!(kind = %msg.kind, "guardian command in wrong state, ignored"),
                    }
                }
                RoomEvent::Data { .. } | RoomEvent::ParticipantJoined { .. } => {}
                RoomEvent::ParticipantLeft { .. } => {}
                RoomEvent::Disconnected => break,
            }
        }

        info!(conversation = %conversation.id, "room session ended");
        runtime.handle.stop();
        runtime.engine_task.abort();
        runtime.forwarder_task.abort();
        let _ = session.disconnect().await;

        let stats = self.supervisor.stats(&conversation.id);
        let metadata = match stats {
            Some(s) => json!({
                "message_count": s.message_count,
                "mean_sentiment": s.mean_sentiment,
                "max_risk_level": s.max_risk_level,
            }),
            None => json!({}),
        };
        if let Err(e) = self.db.end_conversation(&conversation.id, metadata) {
            warn!("conversation close failed: {e}");
        }
        self.supervisor.close_session(&conversation.id).await;
        Ok(())
    }

    /// Halt the AI, excuse ourselves, and hand the audio to the operator.
    /// After this returns no AI audio reaches the room.
    async fn takeover(
        &self,
        conversation: &ConversationId,
        runtime: &mut EngineRuntime,
        session: &mut dyn RoomSession,
    ) {
        info!(conversation = %conversation, "in-band takeover");
        runtime.handle.mute();

        // Short hold line on a dedicated track, then everything comes down.
        if let Ok(mut hold_track) = session.publish_audio_track("hold-line").await {
            say_on_track(hold_track.as_mut(), runtime.tts.as_ref(), HOLD_LINE).await;
        }

        runtime.handle.stop();
        if let Err(e) = session.unpublish_all().await {
            warn!("unpublish failed: {e}");
        }
        self.supervisor.set_human_active(conversation, true);
    }

    /// Rebuild the pipeline after the operator hands the call back.
    async fn release(
        &self,
        agent: &AgentConfig,
        conversation: &ConversationId,
        tools: &SynthesizedTools,
        old: EngineRuntime,
        session: &mut dyn RoomSession,
    ) -> Result<EngineRuntime> {
        info!(conversation = %conversation, "release, rebuilding engine");
        old.engine_task.abort();
        old.forwarder_task.abort();

        let runtime = self
            .spawn_engine_with_greeting(agent, conversation, tools, session, Some(RESUME_LINE))
            .await?;
        self.supervisor.set_human_active(conversation, false);

        let status = json!({
            "type": "status",
            "engine": "rebuilt",
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        if let Err(e) = session
            .publish_data(GUARDIAN_STATUS_TOPIC, status.to_string().as_bytes())
            .await
        {
            warn!("status publish failed: {e}");
        }
        Ok(runtime)
    }

    async fn spawn_engine(
        &self,
        agent: &AgentConfig,
        conversation: &ConversationId,
        tools: &SynthesizedTools,
        session: &mut dyn RoomSession,
    ) -> Result<EngineRuntime> {
        self.spawn_engine_with_greeting(agent, conversation, tools, session, Some(DEFAULT_GREETING))
            .await
    }

    async fn spawn_engine_with_greeting(
        &self,
        agent: &AgentConfig,
        conversation: &ConversationId,
        tools: &SynthesizedTools,
        session: &mut dyn RoomSession,
        greeting: Option<&str>,
    ) -> Result<EngineRuntime> {
        let pipeline = self.factory.assemble(agent)?;
        let tts = pipeline.tts.clone();
        let model = pipeline.model.clone();

        let publisher = session.publish_audio_track("agent-audio").await?;
        let (audio_tx, frames_rx) = mpsc::channel(256);
        let media = Box::new(RoomMedia {
            frames_rx,
            pending: Vec::new(),
            publisher,
        });

        let config = TurnEngineConfig {
            greeting: greeting.map(str::to_string),
            system_prompt: format!("{}{}", agent.system_prompt, tools.system_suffix),
            model,
            ..TurnEngineConfig::default()
        };

        let tool_set: Vec<Arc<dyn Tool>> = tools.tools.clone();
        let (engine, handle, mut events_rx) = TurnEngine::new(
            pipeline,
            tool_set,
            config,
            conversation.clone(),
            Some(self.db.clone()),
        );
        let engine = engine.with_voice_adapter(VoiceAdapter::new(AdapterConfig::default()));

        // Transcripts flow to the supervisor in emission order.
        let supervisor = self.supervisor.clone();
        let conv = conversation.clone();
        let vibe_handle = handle.clone();
        let forwarder_task = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                if let TurnEvent::Transcript { role, text } = event {
                    let speaker = match role {
                        MessageRole::User => "user",
                        _ => "assistant",
                    };
                    let risk = supervisor.record_transcript(&conv, speaker, &text).await;
                    // caller utterances steer the audio mirror
                    if role == MessageRole::User {
                        if let Some(risk) = risk {
                            let mean = supervisor
                                .stats(&conv)
                                .map(|s| s.mean_sentiment)
                                .unwrap_or(0.0);
                            vibe_handle
                                .set_vibe(VibeVector::from_signals(mean as f32, risk.score as f32));
                        }
                    }
                }
            }
        });

        let engine_task = tokio::spawn(engine.run(media));

        Ok(EngineRuntime {
            handle,
            audio_tx,
            engine_task,
            forwarder_task,
            tts,
        })
    }
}

/// Synthesize a line and push it straight onto a track at the room rate.
async fn say_on_track(track: &mut dyn AudioPublisher, tts: &dyn TtsProvider, text: &str) {
    match tts.synthesize(text).await {
        Ok(synthesis) => {
            let pcm = resample_any(&synthesis.samples, synthesis.sample_rate, WEBRTC_RATE);
            for chunk in pcm.chunks(frame_samples(WEBRTC_RATE) / 2) {
                if track.write(chunk).await.is_err() {
                    break;
                }
            }
        }
        Err(e) => warn!("hold line synthesis failed: {e}"),
    }
}
