//! Session-start tool compilation.
//!
//! Reads the agent's knowledge chunks and webhook definitions, builds the
//! callable tool set, and assembles the system-prompt suffixes that
//! advertise each capability to the LLM.

use std::sync::Arc;

use tracing::{info, warn};

use vox_core::types::AgentConfigId;
use vox_db::Database;
use vox_providers::EmbeddingProvider;

use crate::knowledge::KnowledgeSearchTool;
use crate::lessons::load_lesson_suffix;
use crate::webhook::WebhookTool;
use crate::Tool;

const KNOWLEDGE_SUFFIX: &str = "\n\nKNOWLEDGE BASE\nYou have a search_knowledge_base tool over \
    this agent's documents. Search it before answering factual questions about the business; \
    cite what you find rather than guessing.";

const WEBHOOK_SUFFIX: &str = "\n\nACTIONS\nYou can perform real actions through the listed \
    webhook tools. Collect the details the caller gives you and pass them as named arguments. \
    If a tool reports an error, read it and tell the caller what went wrong.";

/// The compiled tool set plus the prompt suffix that goes with it.
pub struct SynthesizedTools {
    pub tools: Vec<Arc<dyn Tool>>,
    pub system_suffix: String,
}

pub struct ToolSynthesizer {
    db: Arc<Database>,
}

impl ToolSynthesizer {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Compile tools for one session. Degraded inputs (missing embeddings,
    /// a bad webhook row) shrink the tool set instead of failing the call.
    pub fn synthesize(
        &self,
        agent: &AgentConfigId,
        embeddings: Option<Arc<dyn EmbeddingProvider>>,
    ) -> SynthesizedTools {
        let mut tools: Vec<Arc<dyn Tool>> = Vec::new();
        let mut system_suffix = String::new();

        // Knowledge retrieval is exposed iff the agent has ready chunks and
        // an embedding model to query them with.
        if let Some(embeddings) = embeddings {
            match self.db.ready_chunks(agent) {
                Ok(chunks) if !chunks.is_empty() => {
                    info!(agent = %agent, chunks = chunks.len(), "knowledge retrieval enabled");
                    tools.push(Arc::new(KnowledgeSearchTool::new(chunks, embeddings)));
                    system_suffix.push_str(KNOWLEDGE_SUFFIX);
                }
                Ok(_) => {}
                Err(e) => warn!(agent = %agent, "knowledge chunk load failed: {e}"),
            }
        }

        match self.db.active_webhooks(agent) {
            Ok(hooks) if !hooks.is_empty() => {
                let mut names = Vec::new();
                for hook in hooks {
                    match WebhookTool::new(hook.clone()) {
                        Ok(tool) => {
                            names.push(tool.name().to_string());
                            tools.push(Arc::new(tool));
                        }
                        Err(e) => warn!(webhook = %hook.name, "webhook tool build failed: {e}"),
                    }
                }
                if !names.is_empty() {
                    system_suffix.push_str(WEBHOOK_SUFFIX);
                    system_suffix.push_str(&format!("\nAvailable actions: {}.", names.join(", ")));
                }
            }
            Ok(_) => {}
            Err(e) => warn!(agent = %agent, "webhook load failed: {e}"),
        }

        if let Some(lessons) = load_lesson_suffix(&self.db, agent) {
            system_suffix.push_str(&lessons);
        }

        SynthesizedTools {
            tools,
            system_suffix,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use vox_db::types::{AgentLesson, KnowledgeChunk, WebhookEndpoint};
    use vox_providers::ProviderError;

    struct NullEmbeddings;

    #[async_trait]
    impl EmbeddingProvider for NullEmbeddings {
        fn name(&self) -> &str {
            "null"
        }
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, ProviderError> {
            Ok(vec![1.0])
        }
    }

    fn db_with_agent() -> (Arc<Database>, AgentConfigId) {
        (Arc::new(Database::open_in_memory().unwrap()), AgentConfigId::from("a1"))
    }

    #[test]
    fn bare_agent_gets_no_tools_and_empty_suffix() {
        let (db, agent) = db_with_agent();
        let out = ToolSynthesizer::new(db).synthesize(&agent, Some(Arc::new(NullEmbeddings)));
        assert!(out.tools.is_empty());
        assert!(out.system_suffix.is_empty());
    }

    #[test]
    fn knowledge_tool_requires_chunks_and_embeddings() {
        let (db, agent) = db_with_agent();
        db.insert_knowledge_chunk(&KnowledgeChunk {
            id: "c1".into(),
            agent_config_id: agent.clone(),
            filename: "faq.md".into(),
            chunk_index: 0,
            content: "Opening hours are 9-5.".into(),
            embedding: vec![1.0],
            status: "ready".into(),
        })
        .unwrap();

        // chunks but no embedding model → not exposed
        let out = ToolSynthesizer::new(db.clone()).synthesize(&agent, None);
        assert!(out.tools.is_empty());

        // chunks + embeddings → exposed, with the knowledge suffix
        let out = ToolSynthesizer::new(db).synthesize(&agent, Some(Arc::new(NullEmbeddings)));
        assert_eq!(out.tools.len(), 1);
        assert_eq!(out.tools[0].name(), "search_knowledge_base");
        assert!(out.system_suffix.contains("KNOWLEDGE BASE"));
        assert!(!out.system_suffix.contains("ACTIONS"));
    }

    #[test]
    fn webhook_tools_get_snake_case_names_and_suffix() {
        let (db, agent) = db_with_agent();
        db.insert_webhook(&WebhookEndpoint {
            id: "wh1".into(),
            agent_config_id: agent.clone(),
            name: "Book Appointment".into(),
            url: "https://hooks.example.com/book".into(),
            method: "POST".into(),
            headers: serde_json::json!({}),
            secret: None,
            timeout_ms: 5000,
            retry_count: 0,
            is_active: true,
        })
        .unwrap();
        db.insert_webhook(&WebhookEndpoint {
            id: "wh2".into(),
            agent_config_id: agent.clone(),
            name: "disabled hook".into(),
            url: "https://hooks.example.com/x".into(),
            method: "POST".into(),
            headers: serde_json::json!({}),
            secret: None,
            timeout_ms: 5000,
            retry_count: 0,
            is_active: false,
        })
        .unwrap();

        let out = ToolSynthesizer::new(db).synthesize(&agent, None);
        assert_eq!(out.tools.len(), 1); // inactive hook excluded
        assert_eq!(out.tools[0].name(), "book_appointment");
        assert!(out.system_suffix.contains("ACTIONS"));
        assert!(out.system_suffix.contains("book_appointment"));
    }

    #[test]
    fn lesson_suffix_is_appended() {
        let (db, agent) = db_with_agent();
        db.insert_lesson(&AgentLesson {
            id: "l1".into(),
            agent_config_id: agent.clone(),
            improved_instruction: "Confirm spelling of names.".into(),
            status: "approved".into(),
            created_at: "2026-01-01T00:00:00Z".into(),
        })
        .unwrap();

        let out = ToolSynthesizer::new(db).synthesize(&agent, None);
        assert!(out.system_suffix.contains("ADAPTIVE MEMORY"));
        assert!(out.system_suffix.contains("Confirm spelling of names."));
    }
}
