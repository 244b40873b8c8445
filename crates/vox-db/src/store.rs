use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use vox_core::types::{
    AgentConfigId, CallId, ConversationId, ConversationStatus, DeviceStatus, ExtensionId,
    MessageRole,
};

use crate::db::init_db;
use crate::error::{DbError, Result};
use crate::types::{
    AgentConfig, AgentLesson, CallLog, Conversation, GuardianConfigRow, KnowledgeChunk,
    MessageRow, ProviderSpec, SipDevice, VoiceProfile, WebhookEndpoint,
};

/// Thread-safe handle over the single SQLite connection.
///
/// A `Mutex` is sufficient for the per-process write rates here (a handful
/// of rows per call); the broker carries everything latency-sensitive.
pub struct Database {
    db: Mutex<Connection>,
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

impl Database {
    /// Open (or create) the database file and initialise the schema.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    /// In-memory database for tests and ephemeral runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    // ── sip_devices ───────────────────────────────────────────────────────────

    pub fn list_devices(&self) -> Result<Vec<SipDevice>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, agent_config_id, server, username, password, port, transport,
                    display_name, realm, outbound_proxy, greeting_text, status,
                    last_error, registered_at, updated_at
             FROM sip_devices ORDER BY id",
        )?;
        let rows = stmt.query_map([], row_to_device)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn get_device(&self, id: &ExtensionId) -> Result<Option<SipDevice>> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT id, agent_config_id, server, username, password, port, transport,
                    display_name, realm, outbound_proxy, greeting_text, status,
                    last_error, registered_at, updated_at
             FROM sip_devices WHERE id = ?1",
            [id.as_str()],
            row_to_device,
        )
        .optional()
        .map_err(DbError::from)
    }

    /// Status writeback as registration callbacks fire. `registered_at` is
    /// stamped only on a successful registration.
    #[instrument(skip(self), fields(id = %id, status = %status))]
    pub fn update_device_status(
        &self,
        id: &ExtensionId,
        status: DeviceStatus,
        last_error: Option<&str>,
    ) -> Result<()> {
        let registered_at = matches!(status, DeviceStatus::Registered).then(now);
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE sip_devices
             SET status = ?1,
                 last_error = ?2,
                 registered_at = COALESCE(?3, registered_at),
                 updated_at = ?4
             WHERE id = ?5",
            rusqlite::params![status.to_string(), last_error, registered_at, now(), id.as_str()],
        )?;
        if n == 0 {
            return Err(DbError::NotFound {
                table: "sip_devices",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    /// Insert or replace a device row (dynamic `sip-bridge:register` path and
    /// external seeding).
    pub fn upsert_device(&self, device: &SipDevice) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO sip_devices
             (id, agent_config_id, server, username, password, port, transport,
              display_name, realm, outbound_proxy, greeting_text, status,
              last_error, registered_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)
             ON CONFLICT(id) DO UPDATE SET
               agent_config_id = excluded.agent_config_id,
               server = excluded.server,
               username = excluded.username,
               password = excluded.password,
               port = excluded.port,
               transport = excluded.transport,
               display_name = excluded.display_name,
               realm = excluded.realm,
               outbound_proxy = excluded.outbound_proxy,
               greeting_text = excluded.greeting_text,
               updated_at = excluded.updated_at",
            rusqlite::params![
                device.id.as_str(),
                device.agent_config_id.as_str(),
                device.server,
                device.username,
                device.password,
                device.port,
                device.transport,
                device.display_name,
                device.realm,
                device.outbound_proxy,
                device.greeting_text,
                device.status.to_string(),
                device.last_error,
                device.registered_at,
                now(),
            ],
        )?;
        Ok(())
    }

    // ── agent_configs ─────────────────────────────────────────────────────────

    pub fn get_agent_config(&self, id: &AgentConfigId) -> Result<AgentConfig> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT id, name, llm_config, stt_config, tts_config, system_prompt,
                    tts_config_json, created_at, updated_at
             FROM agent_configs WHERE id = ?1",
            [id.as_str()],
            row_to_agent_config,
        )
        .optional()?
        .ok_or_else(|| DbError::NotFound {
            table: "agent_configs",
            id: id.to_string(),
        })
    }

    pub fn insert_agent_config(&self, cfg: &AgentConfig) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO agent_configs
             (id, name, llm_config, stt_config, tts_config, system_prompt,
              tts_config_json, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?8)",
            rusqlite::params![
                cfg.id.as_str(),
                cfg.name,
                serde_json::to_string(&cfg.llm).unwrap_or_default(),
                serde_json::to_string(&cfg.stt).unwrap_or_default(),
                serde_json::to_string(&cfg.tts).unwrap_or_default(),
                cfg.system_prompt,
                cfg.tts_extras.as_ref().map(|v| v.to_string()),
                now(),
            ],
        )?;
        Ok(())
    }

    // ── conversations ─────────────────────────────────────────────────────────

    #[instrument(skip(self, metadata), fields(agent = %agent_config_id))]
    pub fn create_conversation(
        &self,
        agent_config_id: &AgentConfigId,
        session_id: &str,
        metadata: Value,
    ) -> Result<Conversation> {
        let id = ConversationId::new();
        let started = now();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO conversations
             (id, agent_config_id, session_id, status, started_at, metadata)
             VALUES (?1, ?2, ?3, 'active', ?4, ?5)",
            rusqlite::params![
                id.as_str(),
                agent_config_id.as_str(),
                session_id,
                started,
                metadata.to_string()
            ],
        )?;
        debug!(conversation = %id, "conversation opened");
        Ok(Conversation {
            id,
            agent_config_id: agent_config_id.clone(),
            session_id: session_id.to_string(),
            status: ConversationStatus::Active,
            started_at: started,
            ended_at: None,
            metadata,
        })
    }

    pub fn get_conversation(&self, id: &ConversationId) -> Result<Option<Conversation>> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT id, agent_config_id, session_id, status, started_at, ended_at, metadata
             FROM conversations WHERE id = ?1",
            [id.as_str()],
            row_to_conversation,
        )
        .optional()
        .map_err(DbError::from)
    }

    /// Close a conversation, merging `extra` keys into its metadata map.
    ///
    /// Idempotent: the call-ended and disconnect paths may both fire; only
    /// the first transition out of `active` takes effect.
    #[instrument(skip(self, extra), fields(conversation = %id))]
    pub fn end_conversation(&self, id: &ConversationId, extra: Value) -> Result<()> {
        let db = self.db.lock().unwrap();
        let existing: Option<(String, String)> = db
            .query_row(
                "SELECT status, metadata FROM conversations WHERE id = ?1",
                [id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((status, metadata_json)) = existing else {
            return Err(DbError::NotFound {
                table: "conversations",
                id: id.to_string(),
            });
        };
        if status != "active" {
            debug!("conversation already closed");
            return Ok(());
        }

        let mut metadata: Value =
            serde_json::from_str(&metadata_json).unwrap_or_else(|_| Value::Object(Default::default()));
        if let (Some(map), Some(extra_map)) = (metadata.as_object_mut(), extra.as_object()) {
            for (k, v) in extra_map {
                map.insert(k.clone(), v.clone());
            }
        }

        db.execute(
            "UPDATE conversations
             SET status = 'completed', ended_at = ?1, metadata = ?2
             WHERE id = ?3 AND status = 'active'",
            rusqlite::params![now(), metadata.to_string(), id.as_str()],
        )?;
        Ok(())
    }

    // ── messages ──────────────────────────────────────────────────────────────

    pub fn append_message(
        &self,
        conversation_id: &ConversationId,
        role: MessageRole,
        content: &str,
    ) -> Result<MessageRow> {
        let id = Uuid::now_v7().to_string();
        let created = now();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO messages (id, conversation_id, role, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![id, conversation_id.as_str(), role.to_string(), content, created],
        )?;
        Ok(MessageRow {
            id,
            conversation_id: conversation_id.clone(),
            role,
            content: content.to_string(),
            created_at: created,
        })
    }

    pub fn list_messages(&self, conversation_id: &ConversationId) -> Result<Vec<MessageRow>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, conversation_id, role, content, created_at
             FROM messages WHERE conversation_id = ?1 ORDER BY created_at",
        )?;
        let rows = stmt.query_map([conversation_id.as_str()], row_to_message)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn message_count(&self, conversation_id: &ConversationId) -> Result<u64> {
        let db = self.db.lock().unwrap();
        let count: i64 = db.query_row(
            "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1",
            [conversation_id.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    // ── sip_call_logs ─────────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub fn create_call_log(
        &self,
        device_id: &ExtensionId,
        call_id: &CallId,
        direction: &str,
        remote_uri: Option<&str>,
        remote_name: Option<&str>,
        livekit_room: Option<&str>,
    ) -> Result<CallLog> {
        let id = Uuid::now_v7().to_string();
        let started = now();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO sip_call_logs
             (id, sip_device_id, call_id, direction, remote_uri, remote_name,
              livekit_room, status, started_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,'ringing',?8)",
            rusqlite::params![
                id,
                device_id.as_str(),
                call_id.as_str(),
                direction,
                remote_uri,
                remote_name,
                livekit_room,
                started
            ],
        )?;
        Ok(CallLog {
            id,
            sip_device_id: device_id.clone(),
            call_id: call_id.clone(),
            direction: direction.to_string(),
            remote_uri: remote_uri.map(str::to_string),
            remote_name: remote_name.map(str::to_string),
            livekit_room: livekit_room.map(str::to_string),
            status: "ringing".to_string(),
            started_at: started,
            answered_at: None,
            ended_at: None,
            duration_secs: None,
        })
    }

    pub fn mark_call_answered(&self, call_id: &CallId) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE sip_call_logs SET status = 'answered', answered_at = ?1
             WHERE call_id = ?2 AND answered_at IS NULL",
            rusqlite::params![now(), call_id.as_str()],
        )?;
        Ok(())
    }

    /// Stamp end time and duration. Idempotent: re-closing a closed log is a
    /// no-op, so competing call-ended/disconnect paths are safe.
    pub fn close_call_log(&self, call_id: &CallId) -> Result<()> {
        let ended = now();
        let db = self.db.lock().unwrap();
        let row: Option<(String, Option<String>)> = db
            .query_row(
                "SELECT started_at, answered_at FROM sip_call_logs
                 WHERE call_id = ?1 AND ended_at IS NULL",
                [call_id.as_str()],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let Some((started_at, answered_at)) = row else {
            return Ok(());
        };

        let from = answered_at.unwrap_or(started_at);
        let duration = chrono::DateTime::parse_from_rfc3339(&from)
            .ok()
            .map(|t| (chrono::Utc::now() - t.with_timezone(&chrono::Utc)).num_seconds().max(0));

        db.execute(
            "UPDATE sip_call_logs
             SET status = 'ended', ended_at = ?1, duration_secs = ?2
             WHERE call_id = ?3 AND ended_at IS NULL",
            rusqlite::params![ended, duration, call_id.as_str()],
        )?;
        Ok(())
    }

    pub fn get_call_log(&self, call_id: &CallId) -> Result<Option<CallLog>> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT id, sip_device_id, call_id, direction, remote_uri, remote_name,
                    livekit_room, status, started_at, answered_at, ended_at, duration_secs
             FROM sip_call_logs WHERE call_id = ?1",
            [call_id.as_str()],
            row_to_call_log,
        )
        .optional()
        .map_err(DbError::from)
    }

    // ── knowledge_documents ───────────────────────────────────────────────────

    /// Chunks in `ready` status for this agent, embeddings decoded.
    pub fn ready_chunks(&self, agent_config_id: &AgentConfigId) -> Result<Vec<KnowledgeChunk>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, agent_config_id, filename, chunk_index, content, embedding, status
             FROM knowledge_documents
             WHERE agent_config_id = ?1 AND status = 'ready'
             ORDER BY filename, chunk_index",
        )?;
        let rows = stmt.query_map([agent_config_id.as_str()], row_to_chunk)?;
        Ok(rows
            .filter_map(|r| match r {
                Ok(c) => Some(c),
                Err(e) => {
                    warn!("skipping malformed knowledge row: {e}");
                    None
                }
            })
            .collect())
    }

    pub fn insert_knowledge_chunk(&self, chunk: &KnowledgeChunk) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO knowledge_documents
             (id, agent_config_id, filename, chunk_index, content, embedding, status)
             VALUES (?1,?2,?3,?4,?5,?6,?7)",
            rusqlite::params![
                chunk.id,
                chunk.agent_config_id.as_str(),
                chunk.filename,
                chunk.chunk_index,
                chunk.content,
                serde_json::to_string(&chunk.embedding).unwrap_or_default(),
                chunk.status
            ],
        )?;
        Ok(())
    }

    // ── webhook_endpoints ─────────────────────────────────────────────────────

    pub fn active_webhooks(&self, agent_config_id: &AgentConfigId) -> Result<Vec<WebhookEndpoint>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, agent_config_id, name, url, method, headers, secret,
                    timeout_ms, retry_count, is_active
             FROM webhook_endpoints
             WHERE agent_config_id = ?1 AND is_active = 1
             ORDER BY name",
        )?;
        let rows = stmt.query_map([agent_config_id.as_str()], row_to_webhook)?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn insert_webhook(&self, hook: &WebhookEndpoint) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO webhook_endpoints
             (id, agent_config_id, name, url, method, headers, secret,
              timeout_ms, retry_count, is_active)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
            rusqlite::params![
                hook.id,
                hook.agent_config_id.as_str(),
                hook.name,
                hook.url,
                hook.method,
                hook.headers.to_string(),
                hook.secret,
                hook.timeout_ms as i64,
                hook.retry_count,
                hook.is_active as i64
            ],
        )?;
        Ok(())
    }

    // ── voice_profiles ────────────────────────────────────────────────────────

    pub fn get_voice_profile(&self, id: &str) -> Result<Option<VoiceProfile>> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT id, reference_audio_url FROM voice_profiles WHERE id = ?1",
            [id],
            |row| {
                Ok(VoiceProfile {
                    id: row.get(0)?,
                    reference_audio_url: row.get(1)?,
                })
            },
        )
        .optional()
        .map_err(DbError::from)
    }

    pub fn insert_voice_profile(&self, profile: &VoiceProfile) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO voice_profiles (id, reference_audio_url) VALUES (?1, ?2)",
            rusqlite::params![profile.id, profile.reference_audio_url],
        )?;
        Ok(())
    }

    // ── agent_lessons ─────────────────────────────────────────────────────────

    /// Newest approved lessons first, capped.
    pub fn approved_lessons(
        &self,
        agent_config_id: &AgentConfigId,
        limit: usize,
    ) -> Result<Vec<AgentLesson>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, agent_config_id, improved_instruction, status, created_at
             FROM agent_lessons
             WHERE agent_config_id = ?1 AND status = 'approved'
             ORDER BY created_at DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![agent_config_id.as_str(), limit as i64],
            row_to_lesson,
        )?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }

    pub fn insert_lesson(&self, lesson: &AgentLesson) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO agent_lessons
             (id, agent_config_id, improved_instruction, status, created_at)
             VALUES (?1,?2,?3,?4,?5)",
            rusqlite::params![
                lesson.id,
                lesson.agent_config_id.as_str(),
                lesson.improved_instruction,
                lesson.status,
                lesson.created_at
            ],
        )?;
        Ok(())
    }

    // ── guardian_configs ──────────────────────────────────────────────────────

    pub fn guardian_config(
        &self,
        agent_config_id: &AgentConfigId,
    ) -> Result<Option<GuardianConfigRow>> {
        let db = self.db.lock().unwrap();
        db.query_row(
            "SELECT agent_config_id, critical_keywords, high_risk_keywords,
                    medium_risk_keywords, auto_handoff_threshold, enabled
             FROM guardian_configs WHERE agent_config_id = ?1",
            [agent_config_id.as_str()],
            row_to_guardian_config,
        )
        .optional()
        .map_err(DbError::from)
    }

    pub fn upsert_guardian_config(&self, cfg: &GuardianConfigRow) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO guardian_configs
             (agent_config_id, critical_keywords, high_risk_keywords,
              medium_risk_keywords, auto_handoff_threshold, enabled)
             VALUES (?1,?2,?3,?4,?5,?6)
             ON CONFLICT(agent_config_id) DO UPDATE SET
               critical_keywords = excluded.critical_keywords,
               high_risk_keywords = excluded.high_risk_keywords,
               medium_risk_keywords = excluded.medium_risk_keywords,
               auto_handoff_threshold = excluded.auto_handoff_threshold,
               enabled = excluded.enabled",
            rusqlite::params![
                cfg.agent_config_id.as_str(),
                serde_json::to_string(&cfg.critical_keywords).unwrap_or_default(),
                serde_json::to_string(&cfg.high_risk_keywords).unwrap_or_default(),
                serde_json::to_string(&cfg.medium_risk_keywords).unwrap_or_default(),
                cfg.auto_handoff_threshold,
                cfg.enabled as i64
            ],
        )?;
        Ok(())
    }
}

// ── row mappers ───────────────────────────────────────────────────────────────

fn row_to_device(row: &rusqlite::Row<'_>) -> rusqlite::Result<SipDevice> {
    let status: String = row.get(11)?;
    Ok(SipDevice {
        id: ExtensionId(row.get(0)?),
        agent_config_id: AgentConfigId(row.get(1)?),
        server: row.get(2)?,
        username: row.get(3)?,
        password: row.get(4)?,
        port: row.get::<_, i64>(5)? as u16,
        transport: row.get(6)?,
        display_name: row.get(7)?,
        realm: row.get(8)?,
        outbound_proxy: row.get(9)?,
        greeting_text: row.get(10)?,
        status: status.parse().unwrap_or_default(),
        last_error: row.get(12)?,
        registered_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

fn row_to_agent_config(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentConfig> {
    let parse_spec = |json: String| -> ProviderSpec {
        serde_json::from_str(&json).unwrap_or(ProviderSpec {
            provider: json,
            options: Value::Null,
        })
    };
    let tts_extras: Option<String> = row.get(6)?;
    Ok(AgentConfig {
        id: AgentConfigId(row.get(0)?),
        name: row.get(1)?,
        llm: parse_spec(row.get(2)?),
        stt: parse_spec(row.get(3)?),
        tts: parse_spec(row.get(4)?),
        system_prompt: row.get(5)?,
        tts_extras: tts_extras.and_then(|s| serde_json::from_str(&s).ok()),
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    let status: String = row.get(3)?;
    let metadata: String = row.get(6)?;
    Ok(Conversation {
        id: ConversationId(row.get(0)?),
        agent_config_id: AgentConfigId(row.get(1)?),
        session_id: row.get(2)?,
        status: status.parse().unwrap_or(ConversationStatus::Completed),
        started_at: row.get(4)?,
        ended_at: row.get(5)?,
        metadata: serde_json::from_str(&metadata).unwrap_or(Value::Null),
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    let role: String = row.get(2)?;
    Ok(MessageRow {
        id: row.get(0)?,
        conversation_id: ConversationId(row.get(1)?),
        role: role.parse().unwrap_or(MessageRole::User),
        content: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn row_to_call_log(row: &rusqlite::Row<'_>) -> rusqlite::Result<CallLog> {
    Ok(CallLog {
        id: row.get(0)?,
        sip_device_id: ExtensionId(row.get(1)?),
        call_id: CallId(row.get(2)?),
        direction: row.get(3)?,
        remote_uri: row.get(4)?,
        remote_name: row.get(5)?,
        livekit_room: row.get(6)?,
        status: row.get(7)?,
        started_at: row.get(8)?,
        answered_at: row.get(9)?,
        ended_at: row.get(10)?,
        duration_secs: row.get(11)?,
    })
}

fn row_to_chunk(row: &rusqlite::Row<'_>) -> rusqlite::Result<KnowledgeChunk> {
    let embedding_json: String = row.get(5)?;
    Ok(KnowledgeChunk {
        id: row.get(0)?,
        agent_config_id: AgentConfigId(row.get(1)?),
        filename: row.get(2)?,
        chunk_index: row.get(3)?,
        content: row.get(4)?,
        embedding: serde_json::from_str(&embedding_json).unwrap_or_default(),
        status: row.get(6)?,
    })
}

fn row_to_webhook(row: &rusqlite::Row<'_>) -> rusqlite::Result<WebhookEndpoint> {
    let headers: String = row.get(5)?;
    Ok(WebhookEndpoint {
        id: row.get(0)?,
        agent_config_id: AgentConfigId(row.get(1)?),
        name: row.get(2)?,
        url: row.get(3)?,
        method: row.get(4)?,
        headers: serde_json::from_str(&headers).unwrap_or(Value::Null),
        secret: row.get(6)?,
        timeout_ms: row.get::<_, i64>(7)? as u64,
        retry_count: row.get::<_, i64>(8)? as u32,
        is_active: row.get::<_, i64>(9)? != 0,
    })
}

fn row_to_lesson(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentLesson> {
    Ok(AgentLesson {
        id: row.get(0)?,
        agent_config_id: AgentConfigId(row.get(1)?),
        improved_instruction: row.get(2)?,
        status: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn row_to_guardian_config(row: &rusqlite::Row<'_>) -> rusqlite::Result<GuardianConfigRow> {
    let critical: String = row.get(1)?;
    let high: String = row.get(2)?;
    let medium: String = row.get(3)?;
    Ok(GuardianConfigRow {
        agent_config_id: AgentConfigId(row.get(0)?),
        critical_keywords: serde_json::from_str(&critical).unwrap_or_default(),
        high_risk_keywords: serde_json::from_str(&high).unwrap_or_default(),
        medium_risk_keywords: serde_json::from_str(&medium).unwrap_or_default(),
        auto_handoff_threshold: row.get(4)?,
        enabled: row.get::<_, i64>(5)? != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn seeded() -> (Database, AgentConfigId) {
        let db = Database::open_in_memory().unwrap();
        let agent_id = AgentConfigId::from("agent-1");
        db.insert_agent_config(&AgentConfig {
            id: agent_id.clone(),
            name: "support".into(),
            llm: ProviderSpec {
                provider: "openai".into(),
                options: json!({"model": "gpt-4o-mini"}),
            },
            stt: ProviderSpec {
                provider: "whisper".into(),
                options: Value::Null,
            },
            tts: ProviderSpec {
                provider: "openai".into(),
                options: json!({"voice": "alloy"}),
            },
            system_prompt: "You are a support agent.".into(),
            tts_extras: None,
            created_at: String::new(),
            updated_at: String::new(),
        })
        .unwrap();
        (db, agent_id)
    }

    #[test]
    fn agent_config_round_trip() {
        let (db, agent_id) = seeded();
        let cfg = db.get_agent_config(&agent_id).unwrap();
        assert_eq!(cfg.name, "support");
        assert_eq!(cfg.llm.provider, "openai");
        assert_eq!(cfg.llm.options["model"], "gpt-4o-mini");
    }

    #[test]
    fn missing_agent_config_is_not_found() {
        let (db, _) = seeded();
        let err = db.get_agent_config(&AgentConfigId::from("nope")).unwrap_err();
        assert!(matches!(err, DbError::NotFound { .. }));
    }

    #[test]
    fn conversation_lifecycle_with_metadata_merge() {
        let (db, agent_id) = seeded();
        let conv = db
            .create_conversation(&agent_id, "room-A", json!({"channel": "sip"}))
            .unwrap();
        assert_eq!(conv.status, ConversationStatus::Active);

        db.end_conversation(&conv.id, json!({"hangup": "remote"})).unwrap();
        let closed = db.get_conversation(&conv.id).unwrap().unwrap();
        assert_eq!(closed.status, ConversationStatus::Completed);
        assert_eq!(closed.metadata["channel"], "sip");
        assert_eq!(closed.metadata["hangup"], "remote");
        assert!(closed.ended_at.is_some());
    }

    #[test]
    fn end_conversation_is_idempotent() {
        let (db, agent_id) = seeded();
        let conv = db.create_conversation(&agent_id, "s", json!({})).unwrap();
        db.end_conversation(&conv.id, json!({"first": 1})).unwrap();
        // second close keeps the first close's metadata and timestamps
        db.end_conversation(&conv.id, json!({"second": 2})).unwrap();
        let closed = db.get_conversation(&conv.id).unwrap().unwrap();
        assert_eq!(closed.metadata["first"], 1);
        assert!(closed.metadata.get("second").is_none());
    }

    #[test]
    fn messages_are_append_only_and_ordered() {
        let (db, agent_id) = seeded();
        let conv = db.create_conversation(&agent_id, "s", json!({})).unwrap();
        db.append_message(&conv.id, MessageRole::User, "Hello.").unwrap();
        db.append_message(&conv.id, MessageRole::Assistant, "Hi there!").unwrap();

        let rows = db.list_messages(&conv.id).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].role, MessageRole::User);
        assert_eq!(rows[1].role, MessageRole::Assistant);
        assert_eq!(db.message_count(&conv.id).unwrap(), 2);
    }

    #[test]
    fn call_log_close_is_idempotent() {
        let (db, _) = seeded();
        let device = ExtensionId::from("ext-42");
        let call = CallId::from("call-1");
        db.create_call_log(&device, &call, "inbound", Some("sip:alice@pbx"), None, None)
            .unwrap();
        db.mark_call_answered(&call).unwrap();
        db.close_call_log(&call).unwrap();
        let log = db.get_call_log(&call).unwrap().unwrap();
        let first_ended = log.ended_at.clone();
        assert!(log.duration_secs.is_some());

        db.close_call_log(&call).unwrap();
        let log2 = db.get_call_log(&call).unwrap().unwrap();
        assert_eq!(log2.ended_at, first_ended);
    }

    #[test]
    fn device_status_writeback() {
        let (db, agent_id) = seeded();
        let device = SipDevice {
            id: ExtensionId::from("ext-42"),
            agent_config_id: agent_id,
            server: "pbx.example.com".into(),
            username: "42".into(),
            password: "secret".into(),
            port: 5060,
            transport: "udp".into(),
            display_name: None,
            realm: None,
            outbound_proxy: None,
            greeting_text: Some("Welcome to VoxNexus.".into()),
            status: DeviceStatus::Offline,
            last_error: None,
            registered_at: None,
            updated_at: String::new(),
        };
        db.upsert_device(&device).unwrap();

        db.update_device_status(&device.id, DeviceStatus::Registered, None)
            .unwrap();
        let row = db.get_device(&device.id).unwrap().unwrap();
        assert_eq!(row.status, DeviceStatus::Registered);
        assert!(row.registered_at.is_some());

        db.update_device_status(&device.id, DeviceStatus::Failed, Some("408 timeout"))
            .unwrap();
        let row = db.get_device(&device.id).unwrap().unwrap();
        assert_eq!(row.status, DeviceStatus::Failed);
        assert_eq!(row.last_error.as_deref(), Some("408 timeout"));
    }

    #[test]
    fn approved_lessons_newest_first_capped() {
        let (db, agent_id) = seeded();
        for i in 0..15 {
            db.insert_lesson(&AgentLesson {
                id: format!("lesson-{i}"),
                agent_config_id: agent_id.clone(),
                improved_instruction: format!("lesson {i}"),
                status: if i % 2 == 0 { "approved" } else { "pending" }.into(),
                created_at: format!("2026-01-{:02}T00:00:00Z", i + 1),
            })
            .unwrap();
        }
        let lessons = db.approved_lessons(&agent_id, 10).unwrap();
        assert_eq!(lessons.len(), 8); // 8 approved of 15
        assert_eq!(lessons[0].improved_instruction, "lesson 14");
    }

    #[test]
    fn guardian_config_round_trip() {
        let (db, agent_id) = seeded();
        assert!(db.guardian_config(&agent_id).unwrap().is_none());
        db.upsert_guardian_config(&GuardianConfigRow {
            agent_config_id: agent_id.clone(),
            critical_keywords: vec!["sue".into(), "lawyer".into()],
            high_risk_keywords: vec!["cancel".into()],
            medium_risk_keywords: vec!["unhappy".into()],
            auto_handoff_threshold: 0.8,
            enabled: true,
        })
        .unwrap();
        let cfg = db.guardian_config(&agent_id).unwrap().unwrap();
        assert_eq!(cfg.critical_keywords, vec!["sue", "lawyer"]);
        assert!((cfg.auto_handoff_threshold - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn knowledge_chunks_filter_by_status() {
        let (db, agent_id) = seeded();
        for (i, status) in ["ready", "processing", "ready"].iter().enumerate() {
            db.insert_knowledge_chunk(&KnowledgeChunk {
                id: format!("chunk-{i}"),
                agent_config_id: agent_id.clone(),
                filename: "faq.md".into(),
                chunk_index: i as i64,
                content: format!("chunk {i}"),
                embedding: vec![0.1, 0.2, 0.3],
                status: status.to_string(),
            })
            .unwrap();
        }
        let chunks = db.ready_chunks(&agent_id).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].embedding, vec![0.1, 0.2, 0.3]);
    }
}
