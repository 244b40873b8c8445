//! Knowledge-base retrieval tool: cosine similarity over the agent's
//! embedded document chunks.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use vox_db::types::KnowledgeChunk;
use vox_providers::EmbeddingProvider;

use crate::{Tool, ToolResult};

const TOP_K: usize = 5;
const MIN_SIMILARITY: f32 = 0.7;

/// Fixed sentinel returned when nothing clears the similarity bar — never an
/// empty string, so the LLM has something concrete to read.
pub const NO_MATCH_SENTINEL: &str = "No relevant information found in the knowledge base.";

pub struct KnowledgeSearchTool {
    chunks: Vec<KnowledgeChunk>,
    embeddings: Arc<dyn EmbeddingProvider>,
}

impl KnowledgeSearchTool {
    pub fn new(chunks: Vec<KnowledgeChunk>, embeddings: Arc<dyn EmbeddingProvider>) -> Self {
        Self { chunks, embeddings }
    }
}

#[async_trait]
impl Tool for KnowledgeSearchTool {
    fn name(&self) -> &str {
        "search_knowledge_base"
    }

    fn description(&self) -> &str {
        "Search the agent's knowledge base for facts relevant to the caller's \
         question. Use this before answering questions about products, \
         policies, pricing, or anything the documents might cover. \
         Returns up to 5 matching passages with their source files."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "What to look up, phrased as keywords or a short question."
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        let query = match input.get("query").and_then(|v| v.as_str()) {
            Some(q) if !q.trim().is_empty() => q.trim().to_string(),
            _ => return ToolResult::error("missing required parameter: query"),
        };

        let query_embedding = match self.embeddings.embed(&query).await {
            Ok(v) => v,
            Err(e) => return ToolResult::error(format!("knowledge search failed: {e}")),
        };

        let mut scored: Vec<(f32, &KnowledgeChunk)> = self
            .chunks
            .iter()
            .map(|c| (cosine_similarity(&query_embedding, &c.embedding), c))
            .filter(|(score, _)| *score >= MIN_SIMILARITY)
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(TOP_K);

        debug!(query = %query, hits = scored.len(), "knowledge search");

        if scored.is_empty() {
            return ToolResult::success(NO_MATCH_SENTINEL);
        }

        let mut out = format!("Found {} relevant passage(s):\n\n", scored.len());
        for (score, chunk) in &scored {
            out.push_str(&format!(
                "[{} — {:.0}% match]\n{}\n\n",
                chunk.filename,
                score * 100.0,
                chunk.content.trim()
            ));
        }
        ToolResult::success(out.trim_end().to_string())
    }
}

/// Cosine similarity between two vectors; 0.0 for mismatched or zero-length
/// inputs.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b) {
        dot += x as f64 * y as f64;
        norm_a += x as f64 * x as f64;
        norm_b += y as f64 * y as f64;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())) as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use vox_core::types::AgentConfigId;
    use vox_providers::ProviderError;

    struct FixedEmbeddings(Vec<f32>);

    #[async_trait]
    impl EmbeddingProvider for FixedEmbeddings {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn embed(&self, _text: &str) -> Result<Vec<f32>, ProviderError> {
            Ok(self.0.clone())
        }
    }

    fn chunk(id: &str, filename: &str, embedding: Vec<f32>) -> KnowledgeChunk {
        KnowledgeChunk {
            id: id.into(),
            agent_config_id: AgentConfigId::from("a1"),
            filename: filename.into(),
            chunk_index: 0,
            content: format!("content of {id}"),
            embedding,
            status: "ready".into(),
        }
    }

    #[test]
    fn cosine_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[tokio::test]
    async fn below_threshold_returns_sentinel_not_empty() {
        let tool = KnowledgeSearchTool::new(
            vec![chunk("c1", "faq.md", vec![0.0, 1.0])],
            Arc::new(FixedEmbeddings(vec![1.0, 0.0])), // orthogonal → similarity 0
        );
        let result = tool.execute(serde_json::json!({"query": "hours"})).await;
        assert!(!result.is_error);
        assert_eq!(result.content, NO_MATCH_SENTINEL);
        assert!(!result.content.is_empty());
    }

    #[tokio::test]
    async fn matches_are_ranked_and_capped() {
        let mut chunks = Vec::new();
        for i in 0..8 {
            // decreasing similarity to [1, 0]: angle grows with i
            let angle = i as f32 * 0.08;
            chunks.push(chunk(
                &format!("c{i}"),
                &format!("doc{i}.md"),
                vec![angle.cos(), angle.sin()],
            ));
        }
        let tool = KnowledgeSearchTool::new(chunks, Arc::new(FixedEmbeddings(vec![1.0, 0.0])));
        let result = tool.execute(serde_json::json!({"query": "q"})).await;
        assert!(result.content.starts_with("Found 5 relevant passage(s):"));
        // best match first
        assert!(result.content.find("doc0.md").unwrap() < result.content.find("doc1.md").unwrap());
        // percentage shown
        assert!(result.content.contains("% match"));
    }

    #[tokio::test]
    async fn missing_query_is_an_error() {
        let tool = KnowledgeSearchTool::new(vec![], Arc::new(FixedEmbeddings(vec![1.0])));
        let result = tool.execute(serde_json::json!({})).await;
        assert!(result.is_error);
    }
}
