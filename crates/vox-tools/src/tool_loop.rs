//! Tool execution loop — the core agentic behavior.
//!
//! Flow: prompt → LLM → if tool_use → execute tools → inject results → LLM →
//! repeat. Stops when the stop_reason is not "tool_use", the iteration cap
//! is hit, or the provider errors.

use std::sync::Arc;

use tracing::{debug, info, warn};

use vox_providers::{ChatRequest, ChatResponse, LlmProvider, ProviderError, ToolCall};

use crate::{Tool, ToolResult};

/// Maximum tool loop iterations to prevent runaway agents. Phone turns are
/// short; anything past a handful of calls is a loop.
const MAX_ITERATIONS: usize = 8;

/// Run the full tool execution loop. Returns the final `ChatResponse` (the
/// one with `stop_reason != "tool_use"`).
pub async fn run_tool_loop(
    provider: &dyn LlmProvider,
    initial_request: ChatRequest,
    tools: &[Arc<dyn Tool>],
) -> Result<ChatResponse, ProviderError> {
    let mut raw_messages: Vec<serde_json::Value> =
        if let Some(ref raw) = initial_request.raw_messages {
            raw.clone()
        } else {
            initial_request
                .messages
                .iter()
                .map(|m| serde_json::json!({ "role": m.role, "content": m.content }))
                .collect()
        };

    let mut last_response: Option<ChatResponse> = None;

    for iteration in 0..MAX_ITERATIONS {
        let mut req = initial_request.clone();
        req.raw_messages = Some(raw_messages.clone());

        debug!(iteration, "tool loop iteration");

        let response = provider.generate(&req).await?;

        if response.tool_calls.is_empty() || response.stop_reason != "tool_use" {
            if iteration > 0 {
                info!(iteration, "tool loop complete");
            }
            return Ok(response);
        }

        // Assistant turn: any text content plus the tool_use blocks.
        let mut assistant_content: Vec<serde_json::Value> = Vec::new();
        if !response.content.is_empty() {
            assistant_content.push(serde_json::json!({
                "type": "text",
                "text": response.content,
            }));
        }
        for call in &response.tool_calls {
            assistant_content.push(serde_json::json!({
                "type": "tool_use",
                "id": call.id,
                "name": call.name,
                "input": call.input,
            }));
        }
        raw_messages.push(serde_json::json!({
            "role": "assistant",
            "content": assistant_content,
        }));

        // Execute each call and feed the results back as one user message.
        let mut tool_result_content: Vec<serde_json::Value> = Vec::new();
        for call in &response.tool_calls {
            let result = execute_tool(tools, call).await;
            tool_result_content.push(serde_json::json!({
                "type": "tool_result",
                "tool_use_id": call.id,
                "content": result.content,
                "is_error": result.is_error,
            }));
        }
        raw_messages.push(serde_json::json!({
            "role": "user",
            "content": tool_result_content,
        }));

        last_response = Some(response);
    }

    warn!(max_iterations = MAX_ITERATIONS, "tool loop hit iteration cap");

    last_response.ok_or_else(|| {
        ProviderError::Parse(format!(
            "tool loop exceeded {MAX_ITERATIONS} iterations without a final response"
        ))
    })
}

/// Find and execute the named tool. Unknown names produce an error result,
/// not a crash — the LLM sees the mistake and can correct itself.
async fn execute_tool(tools: &[Arc<dyn Tool>], call: &ToolCall) -> ToolResult {
    match tools.iter().find(|t| t.name() == call.name) {
        Some(tool) => {
            debug!(tool = %call.name, "executing tool");
            tool.execute(call.input.clone()).await
        }
        None => ToolResult::error(format!("unknown tool: {}", call.name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Debug)]
    struct ScriptedLlm {
        responses: Mutex<Vec<ChatResponse>>,
        calls: AtomicU32,
    }

    impl ScriptedLlm {
        fn new(mut responses: Vec<ChatResponse>) -> Self {
            responses.reverse();
            Self {
                responses: Mutex::new(responses),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedLlm {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn generate(&self, _req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| ProviderError::Unavailable("script exhausted".into()))
        }
    }

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echoes"
        }
        fn input_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn execute(&self, input: serde_json::Value) -> ToolResult {
            ToolResult::success(input["text"].as_str().unwrap_or("").to_string())
        }
    }

    fn text_response(content: &str) -> ChatResponse {
        ChatResponse {
            content: content.into(),
            model: "m".into(),
            tokens_in: 0,
            tokens_out: 0,
            stop_reason: "stop".into(),
            tool_calls: vec![],
        }
    }

    fn tool_call_response(name: &str) -> ChatResponse {
        ChatResponse {
            content: String::new(),
            model: "m".into(),
            tokens_in: 0,
            tokens_out: 0,
            stop_reason: "tool_use".into(),
            tool_calls: vec![ToolCall {
                id: "c1".into(),
                name: name.into(),
                input: serde_json::json!({"text": "hi"}),
            }],
        }
    }

    fn request() -> ChatRequest {
        ChatRequest {
            model: "m".into(),
            system: "s".into(),
            messages: vec![],
            max_tokens: 100,
            tools: vec![],
            raw_messages: None,
        }
    }

    #[tokio::test]
    async fn plain_response_short_circuits() {
        let llm = ScriptedLlm::new(vec![text_response("Hello!")]);
        let tools: Vec<Arc<dyn Tool>> = vec![Arc::new(EchoTool)];
        let out = run_tool_loop(&llm, request(), &tools).await.unwrap();
        assert_eq!(out.content, "Hello!");
        assert_eq!(llm.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn tool_call_round_trips_to_final_answer() {
        let llm = ScriptedLlm::new(vec![tool_call_response("echo"), text_response("Done.")]);
        let tools: Vec<Arc<dyn Tool>> = vec![Arc::new(EchoTool)];
        let out = run_tool_loop(&llm, request(), &tools).await.unwrap();
        assert_eq!(out.content, "Done.");
        assert_eq!(llm.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unknown_tool_feeds_error_back_to_llm() {
        let llm = ScriptedLlm::new(vec![tool_call_response("missing"), text_response("Sorry.")]);
        let tools: Vec<Arc<dyn Tool>> = vec![Arc::new(EchoTool)];
        let out = run_tool_loop(&llm, request(), &tools).await.unwrap();
        assert_eq!(out.content, "Sorry.");
    }

    #[tokio::test]
    async fn iteration_cap_returns_last_response() {
        let responses: Vec<ChatResponse> =
            (0..20).map(|_| tool_call_response("echo")).collect();
        let llm = ScriptedLlm::new(responses);
        let tools: Vec<Arc<dyn Tool>> = vec![Arc::new(EchoTool)];
        let out = run_tool_loop(&llm, request(), &tools).await.unwrap();
        assert_eq!(out.stop_reason, "tool_use");
        assert_eq!(llm.calls.load(Ordering::SeqCst), MAX_ITERATIONS as u32);
    }
}
