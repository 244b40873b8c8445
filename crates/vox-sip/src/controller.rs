//! The per-call state machine and takeover swap.
//!
//! All session state lives on one event loop. Stack callbacks, operator
//! commands, and dynamic registration requests arrive as messages; handlers
//! run to completion before the next message, so ordering within a call is
//! exactly arrival order.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use vox_audio::chameleon::{AdapterConfig, VibeVector, VoiceAdapter};
use vox_audio::{resample_any, write_wav, TELEPHONY_RATE};
use vox_broker::channels::{CH_SIP_REGISTER, CH_SIP_UNREGISTER};
use vox_broker::payloads::{RegisterExtension, UnregisterExtension};
use vox_broker::Broker;
use vox_core::config::SipConfig;
use vox_core::types::{
    AgentConfigId, CallId, ConversationId, ExtensionId, MessageRole, OriginChannel, RoomName,
};
use vox_db::types::AgentConfig;
use vox_db::Database;
use vox_guardian::GuardianSupervisor;
use vox_providers::{SessionFactory, TtsProvider};
use vox_tools::synthesizer::{SynthesizedTools, ToolSynthesizer};
use vox_turn::{TurnEngine, TurnEngineConfig, TurnEvent, TurnHandle};
use vox_webrtc::RoomClient;

use crate::bridge::AudioBridge;
use crate::error::{Result, SipError};
use crate::registration::{account_config_for, RegState};
use crate::stack::{AccountId, CallHandle, SipEvent, SipStack};

const DEFAULT_GREETING: &str = "Hello, how can I help you today?";
const HOLD_LINE: &str = "Please hold for a moment while I connect you with a specialist.";

/// Everything known about one call, carried from answer to cleanup.
#[derive(Debug, Clone, Serialize)]
pub struct CallInfo {
    pub call_id: CallId,
    pub extension_id: ExtensionId,
    pub agent_config_id: AgentConfigId,
    pub direction: String,
    pub remote_uri: String,
    pub assigned_room_name: RoomName,
}

/// Live-call summary exposed on the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct CallSummary {
    pub call_id: CallId,
    pub extension_id: ExtensionId,
    pub conversation_id: ConversationId,
    pub remote_uri: String,
    pub takeover_active: bool,
}

/// Read-only mirror of controller state for HTTP handlers. Written only by
/// the controller loop.
#[derive(Default)]
pub struct ControllerSnapshot {
    pub devices: DashMap<ExtensionId, bool>,
    pub calls: DashMap<CallId, CallSummary>,
}

impl ControllerSnapshot {
    pub fn registered_count(&self) -> usize {
        self.devices.iter().filter(|e| *e.value()).count()
    }
}

enum Control {
    Takeover {
        conversation: ConversationId,
        mute: bool,
    },
    /// Device-scoped fallback: applies to the process's single active call.
    DeviceTakeover { mute: bool },
    Register { extension: ExtensionId },
    Unregister { extension: ExtensionId },
}

/// Cheap clonable handle for the gateway and the guardian callbacks.
#[derive(Clone)]
pub struct SipControllerHandle {
    control_tx: mpsc::Sender<Control>,
    snapshot: Arc<ControllerSnapshot>,
}

impl SipControllerHandle {
    pub fn snapshot(&self) -> &ControllerSnapshot {
        &self.snapshot
    }

    pub async fn register(&self, extension: ExtensionId) -> bool {
        self.control_tx
            .send(Control::Register { extension })
            .await
            .is_ok()
    }

    pub async fn unregister(&self, extension: ExtensionId) -> bool {
        self.control_tx
            .send(Control::Unregister { extension })
            .await
            .is_ok()
    }
}

struct EngineRuntime {
    handle: TurnHandle,
    engine_task: JoinHandle<()>,
    forwarder_task: JoinHandle<()>,
    tts: Arc<dyn TtsProvider>,
}

struct ActiveCall {
    info: CallInfo,
    conversation: ConversationId,
    agent: AgentConfig,
    greeting: Option<String>,
    tools: Option<Arc<SynthesizedTools>>,
    engine: Option<EngineRuntime>,
    recorder_path: Option<PathBuf>,
    bridge: Option<AudioBridge>,
}

pub struct SipSessionController {
    stack: Arc<dyn SipStack>,
    db: Arc<Database>,
    broker: Arc<dyn Broker>,
    supervisor: Arc<GuardianSupervisor>,
    factory: Arc<SessionFactory>,
    synthesizer: ToolSynthesizer,
    room_client: Arc<dyn RoomClient>,
    sip_cfg: SipConfig,

    control_tx: mpsc::Sender<Control>,
    control_rx: mpsc::Receiver<Control>,
    snapshot: Arc<ControllerSnapshot>,

    accounts: HashMap<AccountId, ExtensionId>,
    reg_states: HashMap<ExtensionId, RegState>,
    next_slot: u16,
    calls: HashMap<CallHandle, ActiveCall>,
    by_conversation: HashMap<ConversationId, CallHandle>,
}

impl SipSessionController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stack: Arc<dyn SipStack>,
        db: Arc<Database>,
        broker: Arc<dyn Broker>,
        supervisor: Arc<GuardianSupervisor>,
        factory: Arc<SessionFactory>,
        room_client: Arc<dyn RoomClient>,
        sip_cfg: SipConfig,
    ) -> (Self, SipControllerHandle) {
        let (control_tx, control_rx) = mpsc::channel(64);
        let snapshot = Arc::new(ControllerSnapshot::default());
        let handle = SipControllerHandle {
            control_tx: control_tx.clone(),
            snapshot: snapshot.clone(),
        };
        let controller = Self {
            synthesizer: ToolSynthesizer::new(db.clone()),
            stack,
            db,
            broker,
            supervisor,
            factory,
            room_client,
            sip_cfg,
            control_tx,
            control_rx,
            snapshot,
            accounts: HashMap::new(),
            reg_states: HashMap::new(),
            next_slot: 0,
            calls: HashMap::new(),
            by_conversation: HashMap::new(),
        };
        (controller, handle)
    }

    /// Run the controller loop until cancelled. `sip_events` is the queue
    /// the stack's threads post into.
    pub async fn run(mut self, mut sip_events: mpsc::Receiver<SipEvent>, cancel: CancellationToken) {
        // Process-wide fallback for commands without a per-conversation hook.
        let device_tx = self.control_tx.clone();
        self.supervisor.register_device_callback(Arc::new(move |mute| {
            let tx = device_tx.clone();
            Box::pin(async move {
                let _ = tx.send(Control::DeviceTakeover { mute }).await;
            })
        }));

        // Register every configured extension at startup.
        match self.db.list_devices() {
            Ok(devices) => {
                for device in devices {
                    if let Err(e) = self.register_extension(device.id.clone()).await {
                        warn!(extension = %device.id, "startup registration failed: {e}");
                    }
                }
            }
            Err(e) => error!("device load failed: {e}"),
        }

        let mut register_rx = self.subscribe_or_idle(CH_SIP_REGISTER).await;
        let mut unregister_rx = self.subscribe_or_idle(CH_SIP_UNREGISTER).await;

        info!("SIP session controller running");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(event) = sip_events.recv() => self.handle_sip_event(event).await,
                Some(control) = self.control_rx.recv() => self.handle_control(control).await,
                Some(msg) = register_rx.recv() => {
                    match serde_json::from_str::<RegisterExtension>(&msg.payload) {
                        Ok(cmd) => {
                            if let Err(e) = self.register_extension(cmd.extension_id.clone()).await {
                                warn!(extension = %cmd.extension_id, "dynamic registration failed: {e}");
                            }
                        }
                        Err(e) => warn!("bad register payload: {e}"),
                    }
                }
                Some(msg) = unregister_rx.recv() => {
                    match serde_json::from_str::<UnregisterExtension>(&msg.payload) {
                        Ok(cmd) => {
                            if let Err(e) = self.unregister_extension(&cmd.extension_id).await {
                                warn!(extension = %cmd.extension_id, "dynamic removal failed: {e}");
                            }
                        }
                        Err(e) => warn!("bad unregister payload: {e}"),
                    }
                }
                else => break,
            }
        }

        info!("SIP session controller stopping");
        let handles: Vec<CallHandle> = self.calls.keys().copied().collect();
        for call in handles {
            self.handle_call_ended(call).await;
        }
    }

    async fn subscribe_or_idle(&self, channel: &str) -> mpsc::Receiver<vox_broker::BrokerMessage> {
        match self.broker.subscribe(channel).await {
            Ok(rx) => rx,
            Err(e) => {
                warn!(channel, "subscribe failed, channel disabled: {e}");
                mpsc::channel(1).1
            }
        }
    }

    async fn handle_sip_event(&mut self, event: SipEvent) {
        match event {
            SipEvent::RegistrationState {
                account,
                registered,
                status_code,
                reason,
            } => self.handle_reg_state(account, registered, status_code, &reason),
            SipEvent::IncomingCall {
                account,
                call,
                remote_uri,
                remote_name,
            } => {
                if let Err(e) = self
                    .handle_incoming_call(account, call, &remote_uri, remote_name.as_deref())
                    .await
                {
                    error!(call, "incoming call setup failed: {e}");
                    let _ = self.stack.hangup(call).await;
                }
            }
            SipEvent::MediaActive { call } => {
                if let Err(e) = self.handle_media_active(call).await {
                    // call media fault kills this call's engine only; the
                    // SIP leg continues until hung up
                    error!(call, "media attach failed: {e}");
                }
            }
            SipEvent::CallEnded { call } => self.handle_call_ended(call).await,
        }
    }

    async fn handle_control(&mut self, control: Control) {
        match control {
            Control::Takeover { conversation, mute } => {
                let Some(&call) = self.by_conversation.get(&conversation) else {
                    warn!(conversation = %conversation, "takeover for unknown conversation");
                    return;
                };
                if mute {
                    self.takeover_swap(call).await;
                } else {
                    self.release_swap(call).await;
                }
            }
            Control::DeviceTakeover { mute } => {
                if self.calls.len() == 1 {
                    let call = *self.calls.keys().next().unwrap();
                    if mute {
                        self.takeover_swap(call).await;
                    } else {
                        self.release_swap(call).await;
                    }
                } else {
                    warn!(
                        active = self.calls.len(),
                        "device-scoped takeover needs exactly one active call"
                    );
                }
            }
            Control::Register { extension } => {
                if let Err(e) = self.register_extension(extension.clone()).await {
                    warn!(extension = %extension, "registration failed: {e}");
                }
            }
            Control::Unregister { extension } => {
                if let Err(e) = self.unregister_extension(&extension).await {
                    warn!(extension = %extension, "removal failed: {e}");
                }
            }
        }
    }

    // ── registration ──────────────────────────────────────────────────────────

    async fn register_extension(&mut self, extension: ExtensionId) -> Result<()> {
        let device = self
            .db
            .get_device(&extension)?
            .ok_or_else(|| SipError::ExtensionNotFound(extension.to_string()))?;

        let config = account_config_for(&device, &self.sip_cfg, self.next_slot);
        self.next_slot += 1;

        let account = self.stack.add_account(&config).await?;
        self.accounts.insert(account, extension.clone());
        self.reg_states.insert(extension.clone(), RegState::Registering);
        self.snapshot.devices.insert(extension.clone(), false);
        info!(extension = %extension, account, "extension registering");
        Ok(())
    }

    async fn unregister_extension(&mut self, extension: &ExtensionId) -> Result<()> {
        let account = self
            .accounts
            .iter()
            .find(|(_, ext)| *ext == extension)
            .map(|(id, _)| *id)
            .ok_or_else(|| SipError::ExtensionNotFound(extension.to_string()))?;

        self.stack.remove_account(account).await?;
        self.accounts.remove(&account);
        self.reg_states.remove(extension);
        self.snapshot.devices.remove(extension);
        if let Err(e) = self
            .db
            .update_device_status(extension, vox_core::types::DeviceStatus::Offline, None)
        {
            warn!("device status write failed: {e}");
        }
        info!(extension = %extension, "extension removed");
        Ok(())
    }

    fn handle_reg_state(&mut self, account: AccountId, registered: bool, code: u16, reason: &str) {
        let Some(extension) = self.accounts.get(&account).cloned() else {
            debug!(account, "registration callback for unknown account");
            return;
        };
        let prior = self
            .reg_states
            .get(&extension)
            .copied()
            .unwrap_or_default();
        let state = prior.on_callback(registered, code);
        self.reg_states.insert(extension.clone(), state);
        self.snapshot
            .devices
            .insert(extension.clone(), state == RegState::Registered);

        let last_error = (state == RegState::Failed).then(|| format!("{code} {reason}"));
        if let Err(e) =
            self.db
                .update_device_status(&extension, state.device_status(), last_error.as_deref())
        {
            warn!("device status write failed: {e}");
        }
        info!(extension = %extension, ?state, code, "registration state");
    }

    // ── call lifecycle ────────────────────────────────────────────────────────

    async fn handle_incoming_call(
        &mut self,
        account: AccountId,
        call: CallHandle,
        remote_uri: &str,
        remote_name: Option<&str>,
    ) -> Result<()> {
        let extension = self
            .accounts
            .get(&account)
            .cloned()
            .ok_or_else(|| SipError::ExtensionNotFound(format!("account {account}")))?;
        let device = self
            .db
            .get_device(&extension)?
            .ok_or_else(|| SipError::ExtensionNotFound(extension.to_string()))?;
        let agent = self.db.get_agent_config(&device.agent_config_id)?;

        // auto-answer
        self.stack.answer(call, 200).await?;

        let call_id = CallId::new();
        let room = RoomName::sip_bridge(&extension);
        self.db.create_call_log(
            &extension,
            &call_id,
            "inbound",
            Some(remote_uri),
            remote_name,
            Some(room.as_str()),
        )?;

        let conversation = self.db.create_conversation(
            &agent.id,
            call_id.as_str(),
            json!({ "channel": OriginChannel::Sip, "extension": extension.as_str() }),
        )?;
        self.supervisor.open_session(&conversation.id, &agent.id).await;

        // Per-conversation takeover hook: enqueue onto this loop.
        let tx = self.control_tx.clone();
        let conv = conversation.id.clone();
        self.supervisor.register_callback(
            &conversation.id,
            Arc::new(move |mute| {
                let tx = tx.clone();
                let conversation = conv.clone();
                Box::pin(async move {
                    let _ = tx.send(Control::Takeover { conversation, mute }).await;
                })
            }),
        );

        let info = CallInfo {
            call_id: call_id.clone(),
            extension_id: extension.clone(),
            agent_config_id: agent.id.clone(),
            direction: "inbound".to_string(),
            remote_uri: remote_uri.to_string(),
            assigned_room_name: room,
        };
        self.snapshot.calls.insert(
            call_id.clone(),
            CallSummary {
                call_id: call_id.clone(),
                extension_id: extension,
                conversation_id: conversation.id.clone(),
                remote_uri: remote_uri.to_string(),
                takeover_active: false,
            },
        );
        self.by_conversation.insert(conversation.id.clone(), call);
        self.calls.insert(
            call,
            ActiveCall {
                info,
                conversation: conversation.id,
                agent,
                greeting: device
                    .greeting_text
                    .clone()
                    .or_else(|| Some(DEFAULT_GREETING.to_string())),
                tools: None,
                engine: None,
                recorder_path: None,
                bridge: None,
            },
        );
        info!(call, remote = remote_uri, "incoming call answered");
        Ok(())
    }

    async fn handle_media_active(&mut self, call: CallHandle) -> Result<()> {
        let Some(active) = self.calls.get_mut(&call) else {
            debug!(call, "media for unknown call");
            return Ok(());
        };

        let bundle = self.stack.open_media(call).await?;
        self.db.mark_call_answered(&active.info.call_id)?;

        let tools = Arc::new(
            self.synthesizer
                .synthesize(&active.agent.id, self.factory.embeddings()),
        );
        active.tools = Some(tools.clone());
        active.recorder_path = Some(bundle.recorder_path.clone());

        let runtime = spawn_engine(
            &self.factory,
            &self.db,
            &self.supervisor,
            &active.agent,
            &active.conversation,
            active.greeting.clone(),
            &tools,
            bundle.media,
        )?;
        active.engine = Some(runtime);
        info!(call, "turn engine attached");
        Ok(())
    }

    /// The takeover swap. Within one call the order is fixed:
    /// mute → stop playback → announce → bridge up → bridge loop.
    async fn takeover_swap(&mut self, call: CallHandle) {
        let Some(active) = self.calls.get_mut(&call) else {
            return;
        };
        // duplicate takeover while the bridge is live is a no-op
        if active.bridge.is_some() {
            debug!(call, "takeover already active");
            return;
        }
        info!(call, conversation = %active.conversation, "takeover swap");

        if let Some(engine) = &active.engine {
            engine.handle.mute();
        }
        if let Err(e) = self.stack.stop_playback(call).await {
            warn!("stop playback failed: {e}");
        }

        // Hold announcement plays directly on the call media.
        if let Some(engine) = &active.engine {
            if let Err(e) = play_line_direct(
                &self.stack,
                &self.sip_cfg.audio_dir,
                call,
                engine.tts.as_ref(),
                HOLD_LINE,
            )
            .await
            {
                warn!("hold announcement failed: {e}");
            }
        }

        let Some(recorder) = active.recorder_path.clone() else {
            warn!(call, "no recorder, bridge unavailable");
            return;
        };
        match AudioBridge::start(
            self.room_client.as_ref(),
            active.info.assigned_room_name.clone(),
            recorder,
            self.stack.clone(),
            call,
            PathBuf::from(&self.sip_cfg.audio_dir),
        )
        .await
        {
            Ok(bridge) => {
                active.bridge = Some(bridge);
                if let Some(mut summary) = self.snapshot.calls.get_mut(&active.info.call_id) {
                    summary.takeover_active = true;
                }
            }
            Err(e) => error!(call, "bridge start failed: {e}"),
        }
    }

    /// The release path: bridge down → unpublish → disconnect, then
    /// unmute-or-recreate.
    async fn release_swap(&mut self, call: CallHandle) {
        let Some(active) = self.calls.get_mut(&call) else {
            return;
        };
        let Some(bridge) = active.bridge.take() else {
            debug!(call, "release without an active bridge");
            return;
        };
        info!(call, conversation = %active.conversation, "release swap");
        bridge.shutdown().await;

        let engine_alive = active
            .engine
            .as_ref()
            .map(|e| !e.handle.is_terminated())
            .unwrap_or(false);

        if engine_alive {
            if let Some(engine) = &active.engine {
                engine.handle.unmute();
            }
        } else {
            // Engine died while the human had the call: rebuild it from the
            // same config. Tools are reused; lessons are not reloaded here.
            info!(call, "engine gone, recreating");
            if let Some(old) = active.engine.take() {
                old.engine_task.abort();
                old.forwarder_task.abort();
            }
            match self.stack.open_media(call).await {
                Ok(bundle) => {
                    active.recorder_path = Some(bundle.recorder_path.clone());
                    let tools = active
                        .tools
                        .clone()
                        .unwrap_or_else(|| Arc::new(SynthesizedTools {
                            tools: Vec::new(),
                            system_suffix: String::new(),
                        }));
                    match spawn_engine(
                        &self.factory,
                        &self.db,
                        &self.supervisor,
                        &active.agent,
                        &active.conversation,
                        Some("I'm back. Thanks for your patience.".to_string()),
                        &tools,
                        bundle.media,
                    ) {
                        Ok(runtime) => active.engine = Some(runtime),
                        Err(e) => error!(call, "engine rebuild failed: {e}"),
                    }
                }
                Err(e) => error!(call, "media reattach failed: {e}"),
            }
        }

        if let Some(mut summary) = self.snapshot.calls.get_mut(&active.info.call_id) {
            summary.takeover_active = false;
        }
    }

    async fn handle_call_ended(&mut self, call: CallHandle) {
        let Some(active) = self.calls.remove(&call) else {
            return;
        };
        info!(call, conversation = %active.conversation, "call ended");

        if let Some(engine) = active.engine {
            engine.handle.stop();
            engine.engine_task.abort();
            engine.forwarder_task.abort();
        }
        if let Some(bridge) = active.bridge {
            bridge.shutdown().await;
        }

        self.by_conversation.remove(&active.conversation);
        self.snapshot.calls.remove(&active.info.call_id);

        let metadata = match self.supervisor.stats(&active.conversation) {
            Some(stats) => json!({
                "message_count": stats.message_count,
                "mean_sentiment": stats.mean_sentiment,
                "max_risk_level": stats.max_risk_level,
            }),
            None => json!({}),
        };
        // close_session also purges any takeover lock
        self.supervisor.close_session(&active.conversation).await;

        if let Err(e) = self.db.end_conversation(&active.conversation, metadata) {
            warn!("conversation close failed: {e}");
        }
        if let Err(e) = self.db.close_call_log(&active.info.call_id) {
            warn!("call log close failed: {e}");
        }
    }

}

/// Synthesize a line and play it straight on the call media (used for the
/// hold announcement, which must not route through the bridge).
async fn play_line_direct(
    stack: &Arc<dyn SipStack>,
    audio_dir: &str,
    call: CallHandle,
    tts: &dyn TtsProvider,
    text: &str,
) -> Result<()> {
    let synthesis = tts.synthesize(text).await?;
    let pcm = resample_any(&synthesis.samples, synthesis.sample_rate, TELEPHONY_RATE);
    let path = PathBuf::from(audio_dir).join(format!("announce-{call}.wav"));
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    write_wav(&path, &pcm, TELEPHONY_RATE)?;
    stack.play_wav(call, &path).await
}

/// Build a pipeline and launch the engine plus its transcript forwarder.
#[allow(clippy::too_many_arguments)]
fn spawn_engine(
    factory: &Arc<SessionFactory>,
    db: &Arc<Database>,
    supervisor: &Arc<GuardianSupervisor>,
    agent: &AgentConfig,
    conversation: &ConversationId,
    greeting: Option<String>,
    tools: &Arc<SynthesizedTools>,
    media: Box<dyn vox_turn::CallMedia>,
) -> Result<EngineRuntime> {
    let pipeline = factory.assemble(agent)?;
    let tts = pipeline.tts.clone();
    let model = pipeline.model.clone();

    let config = TurnEngineConfig {
        greeting,
        system_prompt: format!("{}{}", agent.system_prompt, tools.system_suffix),
        model,
        ..TurnEngineConfig::default()
    };

    let (engine, handle, mut events_rx) = TurnEngine::new(
        pipeline,
        tools.tools.clone(),
        config,
        conversation.clone(),
        Some(db.clone()),
    );
    let engine = engine.with_voice_adapter(VoiceAdapter::new(AdapterConfig::default()));

    let supervisor = supervisor.clone();
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
        engine_task,
        forwarder_task,
        tts,
    })
}
