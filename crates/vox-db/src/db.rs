use rusqlite::{Connection, Result};

/// Initialise all tables. Safe to call on every startup (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    create_sip_devices(conn)?;
    create_agent_configs(conn)?;
    create_conversations(conn)?;
    create_messages(conn)?;
    create_sip_call_logs(conn)?;
    create_knowledge_documents(conn)?;
    create_webhook_endpoints(conn)?;
    create_voice_profiles(conn)?;
    create_agent_lessons(conn)?;
    create_guardian_configs(conn)?;
    Ok(())
}

fn create_sip_devices(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS sip_devices (
            id              TEXT PRIMARY KEY,
            agent_config_id TEXT NOT NULL,
            server          TEXT NOT NULL,
            username        TEXT NOT NULL,
            password        TEXT NOT NULL,
            port            INTEGER NOT NULL DEFAULT 5060,
            transport       TEXT NOT NULL DEFAULT 'udp',
            display_name    TEXT,
            realm           TEXT,
            outbound_proxy  TEXT,
            greeting_text   TEXT,
            status          TEXT NOT NULL DEFAULT 'offline',
            last_error      TEXT,
            registered_at   TEXT,
            updated_at      TEXT NOT NULL
        );",
    )
}

fn create_agent_configs(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS agent_configs (
            id              TEXT PRIMARY KEY,
            name            TEXT NOT NULL,
            llm_config      TEXT NOT NULL,
            stt_config      TEXT NOT NULL,
            tts_config      TEXT NOT NULL,
            system_prompt   TEXT NOT NULL DEFAULT '',
            tts_config_json TEXT,
            created_at      TEXT NOT NULL,
            updated_at      TEXT NOT NULL
        );",
    )
}

fn create_conversations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS conversations (
            id              TEXT PRIMARY KEY,
            agent_config_id TEXT NOT NULL,
            session_id      TEXT NOT NULL,
            status          TEXT NOT NULL DEFAULT 'active',
            started_at      TEXT NOT NULL,
            ended_at        TEXT,
            metadata        TEXT NOT NULL DEFAULT '{}'
        );
        CREATE INDEX IF NOT EXISTS idx_conversations_agent
            ON conversations(agent_config_id, started_at DESC);",
    )
}

fn create_messages(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS messages (
            id              TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL,
            role            TEXT NOT NULL,
            content         TEXT NOT NULL,
            created_at      TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, created_at);",
    )
}

fn create_sip_call_logs(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS sip_call_logs (
            id            TEXT PRIMARY KEY,
            sip_device_id TEXT NOT NULL,
            call_id       TEXT NOT NULL,
            direction     TEXT NOT NULL DEFAULT 'inbound',
            remote_uri    TEXT,
            remote_name   TEXT,
            livekit_room  TEXT,
            status        TEXT NOT NULL DEFAULT 'ringing',
            started_at    TEXT NOT NULL,
            answered_at   TEXT,
            ended_at      TEXT,
            duration_secs INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_call_logs_device
            ON sip_call_logs(sip_device_id, started_at DESC);",
    )
}

fn create_knowledge_documents(conn: &Connection) -> Result<()> {
    // `embedding` holds a JSON float array; similarity is computed in-process.
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS knowledge_documents (
            id              TEXT PRIMARY KEY,
            agent_config_id TEXT NOT NULL,
            filename        TEXT NOT NULL,
            chunk_index     INTEGER NOT NULL,
            content         TEXT NOT NULL,
            embedding       TEXT NOT NULL,
            status          TEXT NOT NULL DEFAULT 'ready'
        );
        CREATE INDEX IF NOT EXISTS idx_knowledge_agent
            ON knowledge_documents(agent_config_id, status);",
    )
}

fn create_webhook_endpoints(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS webhook_endpoints (
            id              TEXT PRIMARY KEY,
            agent_config_id TEXT NOT NULL,
            name            TEXT NOT NULL,
            url             TEXT NOT NULL,
            method          TEXT NOT NULL DEFAULT 'POST',
            headers         TEXT NOT NULL DEFAULT '{}',
            secret          TEXT,
            timeout_ms      INTEGER NOT NULL DEFAULT 10000,
            retry_count     INTEGER NOT NULL DEFAULT 0,
            is_active       INTEGER NOT NULL DEFAULT 1,
            UNIQUE(agent_config_id, name)
        );",
    )
}

fn create_voice_profiles(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS voice_profiles (
            id                  TEXT PRIMARY KEY,
            reference_audio_url TEXT NOT NULL
        );",
    )
}

fn create_agent_lessons(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS agent_lessons (
            id                   TEXT PRIMARY KEY,
            agent_config_id      TEXT NOT NULL,
            improved_instruction TEXT NOT NULL,
            status               TEXT NOT NULL DEFAULT 'pending',
            created_at           TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_lessons_agent
            ON agent_lessons(agent_config_id, status, created_at DESC);",
    )
}

fn create_guardian_configs(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS guardian_configs (
            agent_config_id        TEXT PRIMARY KEY,
            critical_keywords      TEXT NOT NULL DEFAULT '[]',
            high_risk_keywords     TEXT NOT NULL DEFAULT '[]',
            medium_risk_keywords   TEXT NOT NULL DEFAULT '[]',
            auto_handoff_threshold REAL NOT NULL DEFAULT 0.75,
            enabled                INTEGER NOT NULL DEFAULT 1
        );",
    )
}
