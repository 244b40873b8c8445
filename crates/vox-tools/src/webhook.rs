//! Outbound webhook tools — one per active definition on the agent.
//!
//! The tool name is the webhook name normalised to lowercase snake-case.
//! Invocation sends the LLM's keyword arguments as the JSON body (or query
//! string for GET), honours configured method/headers/timeout, signs the
//! canonical body when a secret is set, and returns HTTP failures as
//! descriptive strings so the LLM can read and recover.

use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, warn};

use vox_db::types::WebhookEndpoint;

use crate::{Tool, ToolResult};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

pub struct WebhookTool {
    definition: WebhookEndpoint,
    tool_name: String,
    client: reqwest::Client,
}

impl WebhookTool {
    pub fn new(definition: WebhookEndpoint) -> Result<Self, reqwest::Error> {
        let tool_name = snake_case(&definition.name);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(definition.timeout_ms.max(1)))
            .build()?;
        Ok(Self {
            definition,
            tool_name,
            client,
        })
    }

    async fn invoke(&self, input: &serde_json::Value) -> Result<String, String> {
        let method = self.definition.method.to_uppercase();
        let is_get = method == "GET";

        // Canonical body: the JSON body as sent; empty string for GET.
        let body = if is_get {
            String::new()
        } else {
            serde_json::to_string(input).map_err(|e| e.to_string())?
        };

        let url = if is_get {
            append_query(&self.definition.url, input)
        } else {
            self.definition.url.clone()
        };

        let http_method: reqwest::Method = method
            .parse()
            .map_err(|_| format!("unsupported HTTP method: {method}"))?;

        let mut req = self.client.request(http_method, &url);

        if let Some(headers) = self.definition.headers.as_object() {
            for (k, v) in headers {
                if let Some(value) = v.as_str() {
                    req = req.header(k, value);
                }
            }
        }

        if let Some(secret) = &self.definition.secret {
            req = req.header(SIGNATURE_HEADER, format!("sha256={}", sign(secret, &body)));
        }

        if !is_get {
            req = req
                .header("content-type", "application/json")
                .body(body.clone());
        }

        debug!(webhook = %self.definition.name, %url, %method, "invoking webhook");

        // retry_count is the definition's budget for transient failures
        let attempts = self.definition.retry_count + 1;
        let mut last_err = String::new();
        for attempt in 1..=attempts {
            let result = self
                .client
                .execute(
                    req.try_clone()
                        .ok_or_else(|| "request not cloneable".to_string())?
                        .build()
                        .map_err(|e| e.to_string())?,
                )
                .await;

            match result {
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    if status.is_success() {
                        return Ok(if text.is_empty() {
                            format!("webhook '{}' succeeded (HTTP {})", self.definition.name, status.as_u16())
                        } else {
                            text
                        });
                    }
                    last_err = format!(
                        "webhook '{}' returned HTTP {}: {}",
                        self.definition.name,
                        status.as_u16(),
                        truncate(&text, 300)
                    );
                    // only server errors are worth retrying
                    if !status.is_server_error() {
                        break;
                    }
                }
                Err(e) => {
                    last_err = format!("webhook '{}' request failed: {e}", self.definition.name);
                }
            }
            if attempt < attempts {
                warn!(webhook = %self.definition.name, attempt, "retrying webhook");
                tokio::time::sleep(Duration::from_millis(200 * attempt as u64)).await;
            }
        }
        Err(last_err)
    }
}

#[async_trait]
impl Tool for WebhookTool {
    fn name(&self) -> &str {
        &self.tool_name
    }

    fn description(&self) -> &str {
        "Call this agent's configured external endpoint with keyword arguments. \
         Use it when the caller asks for an action the endpoint performs \
         (booking, lookup, ticket creation). Pass every relevant detail as a \
         named argument."
    }

    fn input_schema(&self) -> serde_json::Value {
        // Open keyword-argument map: the webhook decides what it accepts.
        serde_json::json!({
            "type": "object",
            "additionalProperties": true
        })
    }

    async fn execute(&self, input: serde_json::Value) -> ToolResult {
        match self.invoke(&input).await {
            Ok(text) => ToolResult::success(text),
            // Descriptive string rather than a hard failure — the LLM may
            // rephrase or apologise based on what went wrong.
            Err(detail) => ToolResult::error(detail),
        }
    }
}

/// Compute the lowercase hex HMAC-SHA256 of `body` under `secret`.
pub fn sign(secret: &str, body: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(body.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Normalise a webhook name to a valid tool identifier.
pub fn snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut prev_underscore = true; // trims leading separators
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            prev_underscore = false;
        } else if !prev_underscore {
            out.push('_');
            prev_underscore = true;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

fn append_query(url: &str, input: &serde_json::Value) -> String {
    let Some(map) = input.as_object() else {
        return url.to_string();
    };
    if map.is_empty() {
        return url.to_string();
    }
    let query: Vec<String> = map
        .iter()
        .map(|(k, v)| {
            let value = match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            format!(
                "{}={}",
                urlencoding::encode(k),
                urlencoding::encode(&value)
            )
        })
        .collect();
    let sep = if url.contains('?') { '&' } else { '?' };
    format!("{url}{sep}{}", query.join("&"))
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        s
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        &s[..end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snake_case_normalisation() {
        assert_eq!(snake_case("Book Appointment"), "book_appointment");
        assert_eq!(snake_case("book_appointment"), "book_appointment");
        assert_eq!(snake_case("  CRM-Sync!!"), "crm_sync");
        assert_eq!(snake_case("check order #42"), "check_order_42");
    }

    #[test]
    fn signature_matches_known_vector() {
        // HMAC-SHA256("s3cr3t", body) — independently verifiable
        let body = r#"{"date":"2026-02-01","name":"Jane"}"#;
        let sig = sign("s3cr3t", body);
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));

        // verifies against the same secret and body
        let mut mac = HmacSha256::new_from_slice(b"s3cr3t").unwrap();
        mac.update(body.as_bytes());
        mac.verify_slice(&hex::decode(&sig).unwrap()).unwrap();
    }

    #[test]
    fn signature_for_get_covers_empty_body() {
        // canonical body for GET is the empty string
        assert_eq!(sign("k", ""), sign("k", ""));
        assert_ne!(sign("k", ""), sign("k", "{}"));
    }

    #[test]
    fn query_string_assembly() {
        let url = append_query(
            "https://api.example.com/orders",
            &serde_json::json!({"id": "42", "verbose": true}),
        );
        assert!(url.starts_with("https://api.example.com/orders?"));
        assert!(url.contains("id=42"));
        assert!(url.contains("verbose=true"));

        let url2 = append_query("https://api.example.com/orders?a=1", &serde_json::json!({"b": "2"}));
        assert!(url2.contains("?a=1&b=2"));
    }

    #[test]
    fn tool_name_comes_from_definition() {
        let tool = WebhookTool::new(sample_definition("Book Appointment")).unwrap();
        assert_eq!(tool.name(), "book_appointment");
    }

    fn sample_definition(name: &str) -> WebhookEndpoint {
        WebhookEndpoint {
            id: "wh-1".into(),
            agent_config_id: vox_core::types::AgentConfigId::from("a1"),
            name: name.into(),
            url: "https://hooks.example.com/book".into(),
            method: "POST".into(),
            headers: serde_json::json!({}),
            secret: Some("s3cr3t".into()),
            timeout_ms: 5_000,
            retry_count: 1,
            is_active: true,
        }
    }
}
