//! The turn state machine.
//!
//! ```text
//! IDLE ──start──▶ GREETING ──played──▶ LISTENING
//! LISTENING ──end-of-utterance──▶ TRANSCRIBING ──empty──▶ LISTENING
//! TRANSCRIBING ──text──▶ THINKING ──▶ SPEAKING ──played──▶ LISTENING
//! any ──stop──▶ TERMINATED        mute ⇄ unmute: MUTED ⇄ LISTENING
//! ```
//!
//! While MUTED the engine keeps draining capture (the bridge owns the audio
//! then) but produces nothing: no STT past the guard, no LLM call, no TTS.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use vox_audio::chameleon::{VibeVector, VoiceAdapter};
use vox_audio::resample_any;
use vox_audio::vad::{UtteranceDetector, VadConfig};
use vox_core::types::{ConversationId, MessageRole};
use vox_db::Database;
use vox_providers::{
    AudioClip, ChatRequest, Message, ProviderError, Role, SessionPipeline, TtsProvider,
};
use vox_tools::{to_definitions, tool_loop::run_tool_loop, Tool};

use crate::media::CallMedia;
use crate::truncate::truncate_reply;

/// Fixed audible line for fatal provider configuration problems.
pub const FALLBACK_UTTERANCE: &str = "I'm sorry, the AI service is not configured.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Greeting,
    Listening,
    Transcribing,
    Thinking,
    Speaking,
    Muted,
    Terminated,
}

#[derive(Debug, Clone)]
pub enum TurnEvent {
    StateChanged(TurnState),
    /// A final transcript, in the order the supervisor must observe them.
    Transcript { role: MessageRole, text: String },
    GreetingPlayed,
}

#[derive(Debug, Clone)]
pub struct TurnEngineConfig {
    pub greeting: Option<String>,
    pub system_prompt: String,
    pub model: String,
    pub max_reply_tokens: u32,
    /// History presented to the LLM is trimmed to this many user/assistant
    /// turns; the system instruction always survives.
    pub history_turns: usize,
    pub vad: VadConfig,
}

impl Default for TurnEngineConfig {
    fn default() -> Self {
        Self {
            greeting: None,
            system_prompt: String::new(),
            model: "gpt-4o-mini".to_string(),
            max_reply_tokens: 100,
            history_turns: 6,
            vad: VadConfig::default(),
        }
    }
}

/// Control surface handed to the owning controller.
#[derive(Clone)]
pub struct TurnHandle {
    muted: Arc<AtomicBool>,
    cancel: CancellationToken,
    state_rx: watch::Receiver<TurnState>,
    vibe_tx: Arc<watch::Sender<VibeVector>>,
}

impl TurnHandle {
    pub fn mute(&self) {
        self.muted.store(true, Ordering::SeqCst);
    }

    /// Update the caller vibe driving the voice adapter. No-op when the
    /// engine runs without one.
    pub fn set_vibe(&self, vibe: VibeVector) {
        let _ = self.vibe_tx.send(vibe);
    }

    pub fn unmute(&self) {
        self.muted.store(false, Ordering::SeqCst);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn state(&self) -> TurnState {
        *self.state_rx.borrow()
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == TurnState::Terminated
    }
}

pub struct TurnEngine {
    pipeline: SessionPipeline,
    tools: Vec<Arc<dyn Tool>>,
    config: TurnEngineConfig,
    conversation: ConversationId,
    db: Option<Arc<Database>>,
    events: mpsc::UnboundedSender<TurnEvent>,
    history: Vec<Message>,
    muted: Arc<AtomicBool>,
    cancel: CancellationToken,
    state_tx: watch::Sender<TurnState>,
    /// Vibe-driven voice post-processing; replies pass through it before
    /// playback when present.
    adapter: Option<VoiceAdapter>,
    vibe_rx: watch::Receiver<VibeVector>,
}

impl TurnEngine {
    pub fn new(
        pipeline: SessionPipeline,
        tools: Vec<Arc<dyn Tool>>,
        config: TurnEngineConfig,
        conversation: ConversationId,
        db: Option<Arc<Database>>,
    ) -> (Self, TurnHandle, mpsc::UnboundedReceiver<TurnEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(TurnState::Idle);
        let (vibe_tx, vibe_rx) = watch::channel(VibeVector::default());
        let muted = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();

        let handle = TurnHandle {
            muted: muted.clone(),
            cancel: cancel.clone(),
            state_rx,
            vibe_tx: Arc::new(vibe_tx),
        };

        (
            Self {
                pipeline,
                tools,
                config,
                conversation,
                db,
                events,
                history: Vec::new(),
                muted,
                cancel,
                state_tx,
                adapter: None,
                vibe_rx,
            },
            handle,
            events_rx,
        )
    }

    /// Attach a voice adapter; the handle's [`TurnHandle::set_vibe`] then
    /// steers how replies sound.
    pub fn with_voice_adapter(mut self, adapter: VoiceAdapter) -> Self {
        self.adapter = Some(adapter);
        self
    }

    /// Drive the call until hangup or stop. Consumes the engine; the handle
    /// keeps working afterwards (its state reads TERMINATED).
    pub async fn run(mut self, mut media: Box<dyn CallMedia>) {
        info!(conversation = %self.conversation, "turn engine starting");

        self.set_state(TurnState::Greeting);
        if let Some(greeting) = self.config.greeting.clone() {
            if self.speak(media.as_mut(), &greeting).await {
                let _ = self.events.send(TurnEvent::GreetingPlayed);
            }
        }

        let mut detector = UtteranceDetector::new(self.config.vad.clone());
        self.set_state(TurnState::Listening);

        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => break,
                frame = media.capture_frame() => frame,
            };
            let Ok(Some(frame)) = frame else {
                debug!(conversation = %self.conversation, "media ended");
                break;
            };

            if self.muted.load(Ordering::SeqCst) {
                if *self.state_tx.borrow() != TurnState::Muted {
                    self.set_state(TurnState::Muted);
                    detector.reset();
                }
                continue;
            }
            if *self.state_tx.borrow() == TurnState::Muted {
                self.set_state(TurnState::Listening);
            }

            // end-pointing fires exactly once per utterance, so each
            // utterance schedules exactly one turn
            if let Some(utterance) = detector.push_frame(&frame) {
                self.process_turn(media.as_mut(), utterance).await;
                if !self.muted.load(Ordering::SeqCst) {
                    self.set_state(TurnState::Listening);
                }
            }
        }

        self.set_state(TurnState::Terminated);
        info!(conversation = %self.conversation, "turn engine terminated");
    }

    async fn process_turn(&mut self, media: &mut dyn CallMedia, utterance: Vec<i16>) {
        self.set_state(TurnState::Transcribing);

        let clip = AudioClip {
            samples: utterance,
            sample_rate: media.sample_rate(),
        };
        let text = match self.pipeline.stt.transcribe(&clip).await {
            Ok(t) => t.text,
            Err(ProviderError::Misconfigured(reason)) => {
                warn!(%reason, "STT misconfigured");
                self.speak(media, FALLBACK_UTTERANCE).await;
                return;
            }
            Err(e) => {
                warn!("transcription failed, resuming capture: {e}");
                return;
            }
        };

        // Near-empty transcripts never reach the LLM.
        let text = text.trim().to_string();
        if text.chars().filter(|c| !c.is_whitespace()).count() < 2 {
            debug!("empty transcript, resuming capture");
            return;
        }

        self.emit_transcript(MessageRole::User, &text);
        self.persist(MessageRole::User, &text);
        self.history.push(Message {
            role: Role::User,
            content: text,
        });

        if self.muted.load(Ordering::SeqCst) {
            return;
        }

        self.set_state(TurnState::Thinking);
        let request = ChatRequest {
            model: self.config.model.clone(),
            system: self.config.system_prompt.clone(),
            messages: self.trimmed_history(),
            max_tokens: self.config.max_reply_tokens,
            tools: to_definitions(&self.tools),
            raw_messages: None,
        };

        let response = if self.tools.is_empty() {
            self.pipeline.llm.generate(&request).await
        } else {
            run_tool_loop(self.pipeline.llm.as_ref(), request, &self.tools).await
        };

        let reply = match response {
            Ok(resp) if !resp.content.trim().is_empty() => resp.content.trim().to_string(),
            Ok(_) => {
                debug!("model produced no text, resuming capture");
                return;
            }
            Err(ProviderError::Misconfigured(reason)) => {
                warn!(%reason, "LLM misconfigured");
                FALLBACK_UTTERANCE.to_string()
            }
            Err(e) => {
                warn!("generation failed, skipping turn: {e}");
                return;
            }
        };

        self.emit_transcript(MessageRole::Assistant, &reply);
        self.persist(MessageRole::Assistant, &reply);
        self.history.push(Message {
            role: Role::Assistant,
            content: reply.clone(),
        });

        if self.muted.load(Ordering::SeqCst) {
            return;
        }

        self.set_state(TurnState::Speaking);
        let speech = truncate_reply(&reply);
        self.speak(media, &speech).await;
    }

    /// Last N turns presented to the LLM; the system prompt travels in its
    /// own request field and is never trimmed away.
    fn trimmed_history(&self) -> Vec<Message> {
        let max_messages = self.config.history_turns * 2;
        let start = self.history.len().saturating_sub(max_messages);
        self.history[start..].to_vec()
    }

    async fn speak(&mut self, media: &mut dyn CallMedia, text: &str) -> bool {
        let synthesis = match self.pipeline.tts.synthesize(text).await {
            Ok(s) => s,
            Err(e) => {
                warn!("synthesis failed, skipping line: {e}");
                return false;
            }
        };

        let samples = match self.adapter.as_mut() {
            Some(adapter) => {
                let vibe = *self.vibe_rx.borrow();
                adapter.process(&synthesis.samples, synthesis.sample_rate, vibe)
            }
            None => synthesis.samples,
        };

        let target = media.sample_rate();
        let pcm = resample_any(&samples, synthesis.sample_rate, target);
        match media.play(&pcm, target).await {
            Ok(()) => true,
            Err(e) => {
                warn!("playback failed: {e}");
                false
            }
        }
    }

    fn emit_transcript(&self, role: MessageRole, text: &str) {
        let _ = self.events.send(TurnEvent::Transcript {
            role,
            text: text.to_string(),
        });
    }

    /// Persistence failures never abort the conversation.
    fn persist(&self, role: MessageRole, text: &str) {
        if let Some(db) = &self.db {
            if let Err(e) = db.append_message(&self.conversation, role, text) {
                warn!(conversation = %self.conversation, "message write failed: {e}");
            }
        }
    }

    fn set_state(&self, state: TurnState) {
        if *self.state_tx.borrow() != state {
            debug!(conversation = %self.conversation, ?state, "state transition");
            let _ = self.state_tx.send(state);
            let _ = self.events.send(TurnEvent::StateChanged(state));
        }
    }
}
