//! Google Generative Language ("Gemini") adapter.
//!
//! Implements the `generateContent` / `streamGenerateContent` REST API with
//! an API key passed as a `key=` query parameter. Handles Gemini's
//! `thoughtSignature` extended-thinking field and its function-call/
//! function-response content parts.

use crate::auth::AuthRotator;
use crate::traits::{ChatRequest, ChatResponse, EmbeddingsRequest, EmbeddingsResponse, LlmProvider};
use crate::util::from_reqwest;
use sa_domain::capability::LlmCapabilities;
use sa_domain::config::ProviderConfig;
use sa_domain::error::{Error, Result};
use sa_domain::message::{
    AssistantContentBlock, AssistantMessage, Message, ToolCall, ToolResultContentBlock,
    ToolResultMessage, UserContentBlock,
};
use sa_domain::stream::{BoxStream, StopReason, StreamEvent, Usage};
use sa_domain::tool::ToolDefinition;
use serde_json::Value;
use std::sync::Arc;

/// Models served through Gemini's OpenAI-shaped tool-call passthrough
/// (`claude-*`, `gpt-oss-*`) that require an explicit tool-call `id` field on
/// `functionCall`/`functionResponse` parts, unlike native Gemini models.
fn model_requires_tool_id(model: &str) -> bool {
    model.starts_with("claude-") || model.starts_with("gpt-oss-")
}

fn sanitize_call_id(id: &str) -> String {
    let cleaned: String = id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    let cleaned = if cleaned.is_empty() { "tool_call".to_string() } else { cleaned };
    cleaned.chars().take(64).collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter struct
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct GoogleProvider {
    id: String,
    base_url: String,
    auth: Arc<AuthRotator>,
    default_model: String,
    capabilities: LlmCapabilities,
    client: reqwest::Client,
}

impl GoogleProvider {
    pub fn from_config(cfg: &ProviderConfig) -> Result<Self> {
        let auth = Arc::new(AuthRotator::from_auth_config(&cfg.auth)?);
        let default_model = cfg.default_model.clone().unwrap_or_else(|| "gemini-2.0-flash".into());

        let capabilities = LlmCapabilities {
            supports_tools: sa_domain::capability::ToolSupport::Basic,
            supports_streaming: true,
            supports_json_mode: true,
            supports_vision: true,
            context_window_tokens: Some(1_000_000),
            max_output_tokens: Some(8_192),
        };

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(from_reqwest)?;

        Ok(Self { id: cfg.id.clone(), base_url: cfg.base_url.trim_end_matches('/').to_string(), auth, default_model, capabilities, client })
    }

    fn generate_url(&self, model: &str, api_key: &str) -> String {
        format!("{}/v1beta/models/{}:generateContent?key={}", self.base_url, model, api_key)
    }

    fn stream_url(&self, model: &str, api_key: &str) -> String {
        format!("{}/v1beta/models/{}:streamGenerateContent?alt=sse&key={}", self.base_url, model, api_key)
    }

    fn build_body(&self, req: &ChatRequest, model: &str) -> Value {
        let needs_id = model_requires_tool_id(model);
        let mut contents: Vec<Value> = Vec::new();

        for msg in &req.messages {
            match msg {
                Message::User(u) => contents.push(user_to_gemini(&u.content)),
                Message::Assistant(a) => contents.push(assistant_to_gemini(a, needs_id)),
                Message::ToolResult(t) => contents.push(tool_result_to_gemini(t, needs_id)),
                Message::CompactionSummary(c) => {
                    contents.push(serde_json::json!({
                        "role": "user",
                        "parts": [{"text": format!("[Conversation summary]\n{}", c.text)}],
                    }));
                }
            }
        }

        let mut body = serde_json::json!({ "contents": contents });

        if !req.tools.is_empty() {
            let function_declarations: Vec<Value> = req.tools.iter().map(tool_to_gemini).collect();
            body["tools"] = serde_json::json!([{ "functionDeclarations": function_declarations }]);
        }

        let mut gen_config = serde_json::json!({});
        if let Some(temp) = req.temperature {
            gen_config["temperature"] = serde_json::json!(temp);
        }
        if let Some(max) = req.max_tokens {
            gen_config["maxOutputTokens"] = serde_json::json!(max);
        }
        if req.json_mode {
            gen_config["responseMimeType"] = serde_json::json!("application/json");
        }
        if gen_config.as_object().is_some_and(|o| !o.is_empty()) {
            body["generationConfig"] = gen_config;
        }

        body
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message serialization helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn user_to_gemini(blocks: &[UserContentBlock]) -> Value {
    let parts: Vec<Value> = blocks
        .iter()
        .map(|b| match b {
            UserContentBlock::Text { text } => serde_json::json!({"text": text}),
            UserContentBlock::Image { url, media_type } => {
                let mt = media_type.as_deref().unwrap_or("image/png");
                serde_json::json!({"inlineData": {"mimeType": mt, "data": url}})
            }
        })
        .collect();
    serde_json::json!({ "role": "user", "parts": parts })
}

fn assistant_to_gemini(a: &AssistantMessage, needs_id: bool) -> Value {
    let mut parts: Vec<Value> = Vec::new();
    for block in &a.content {
        match block {
            AssistantContentBlock::Text { text, .. } => {
                parts.push(serde_json::json!({ "text": text }));
            }
            AssistantContentBlock::Thinking { text, signature } => {
                let mut part = serde_json::json!({ "text": text, "thought": true });
                if let Some(sig) = signature {
                    part["thoughtSignature"] = serde_json::json!(sig);
                }
                parts.push(part);
            }
            AssistantContentBlock::ToolCall(call) => {
                let args: Value = serde_json::from_str(&call.arguments).unwrap_or(Value::Null);
                let mut fc = serde_json::json!({ "name": call.name, "args": args });
                if needs_id {
                    fc["id"] = serde_json::json!(sanitize_call_id(&call.call_id));
                }
                parts.push(serde_json::json!({ "functionCall": fc }));
            }
        }
    }
    serde_json::json!({ "role": "model", "parts": parts })
}

fn tool_result_to_gemini(t: &ToolResultMessage, needs_id: bool) -> Value {
    let text = t
        .content
        .iter()
        .filter_map(|b| match b {
            ToolResultContentBlock::Text { text } => Some(text.as_str()),
            ToolResultContentBlock::Image { .. } => None,
        })
        .collect::<Vec<_>>()
        .join("\n");

    let mut fr = serde_json::json!({
        "name": t.tool_name,
        "response": { "content": text },
    });
    if needs_id {
        fr["id"] = serde_json::json!(sanitize_call_id(&t.call_id));
    }
    serde_json::json!({ "role": "user", "parts": [{"functionResponse": fr}] })
}

fn tool_to_gemini(tool: &ToolDefinition) -> Value {
    serde_json::json!({ "name": tool.name, "description": tool.description, "parameters": tool.parameters })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Response deserialization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn stop_reason_from_gemini(raw: Option<&str>, has_tool_calls: bool) -> StopReason {
    if has_tool_calls {
        return StopReason::ToolCalls;
    }
    match raw {
        Some("STOP") => StopReason::Stop,
        Some("MAX_TOKENS") => StopReason::Length,
        Some("SAFETY") => StopReason::Safety,
        Some("RECITATION") | Some("BLOCKLIST") => StopReason::ContentFilter,
        Some(_) => StopReason::Other,
        None => StopReason::Other,
    }
}

fn parse_gemini_response(provider_id: &str, body: &Value, model: &str) -> Result<ChatResponse> {
    let candidate = body
        .get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first())
        .ok_or_else(|| Error::Provider { provider: provider_id.to_string(), message: "no candidates in response".into() })?;

    let parts = candidate.get("content").and_then(|c| c.get("parts")).and_then(|p| p.as_array());

    let mut assistant = AssistantMessage::new(provider_id, "generative-language", model);

    if let Some(parts) = parts {
        for part in parts {
            let is_thought = part.get("thought").and_then(Value::as_bool).unwrap_or(false);
            if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
                if is_thought {
                    assistant.append_thinking(text);
                    if let Some(sig) = part.get("thoughtSignature").and_then(|v| v.as_str()) {
                        if let Some(AssistantContentBlock::Thinking { signature, .. }) = assistant.content.last_mut() {
                            *signature = Some(sig.to_string());
                        }
                    }
                } else {
                    assistant.append_text(text);
                }
            }
            if let Some(fc) = part.get("functionCall") {
                let name = fc.get("name").and_then(|v| v.as_str()).unwrap_or("").to_string();
                let arguments = fc
                    .get("args")
                    .cloned()
                    .unwrap_or(Value::Object(Default::default()))
                    .to_string();
                let call_id = fc
                    .get("id")
                    .and_then(|v| v.as_str())
                    .map(String::from)
                    .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4()));
                assistant.push_tool_call(ToolCall { call_id, name, arguments, signature: None });
            }
        }
    }

    let finish_reason = candidate.get("finishReason").and_then(|v| v.as_str());
    let stop_reason = stop_reason_from_gemini(finish_reason, !assistant.tool_calls.is_empty());
    let usage = body.get("usageMetadata").and_then(parse_gemini_usage);

    Ok(ChatResponse { message: assistant, usage, model: model.to_string(), stop_reason, response_id: None })
}

fn parse_gemini_usage(v: &Value) -> Option<Usage> {
    let input = v.get("promptTokenCount")?.as_u64()?;
    let output = v.get("candidatesTokenCount").and_then(Value::as_u64).unwrap_or(0);
    let total = v.get("totalTokenCount").and_then(Value::as_u64).unwrap_or(input + output);
    let cache_read = v.get("cachedContentTokenCount").and_then(Value::as_u64).unwrap_or(0);
    Some(Usage { input, output, cache_read, cache_write: 0, total })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
struct StreamState {
    next_tool_index: usize,
}

fn parse_gemini_sse_data(state: &mut StreamState, data: &str) -> Vec<Result<StreamEvent>> {
    let mut events = Vec::new();

    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => return vec![Err(Error::Json(e))],
    };

    let candidate = match v.get("candidates").and_then(|c| c.as_array()).and_then(|a| a.first()) {
        Some(c) => c,
        None => return events,
    };

    if let Some(parts) = candidate.get("content").and_then(|c| c.get("parts")).and_then(|p| p.as_array()) {
        for part in parts {
            let is_thought = part.get("thought").and_then(Value::as_bool).unwrap_or(false);
            if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
                if !text.is_empty() {
                    events.push(Ok(if is_thought {
                        StreamEvent::Thinking { text: text.to_string() }
                    } else {
                        StreamEvent::Token { text: text.to_string() }
                    }));
                }
            }
            if let Some(fc) = part.get("functionCall") {
                let name = fc.get("name").and_then(|v| v.as_str()).unwrap_or("").to_string();
                let arguments = fc.get("args").cloned().unwrap_or(Value::Object(Default::default())).to_string();
                let call_id = format!("call_{}", uuid::Uuid::new_v4());
                let index = state.next_tool_index;
                state.next_tool_index += 1;

                events.push(Ok(StreamEvent::ToolCallStarted { index, call_id: call_id.clone(), name: name.clone() }));
                events.push(Ok(StreamEvent::ToolCallFinished { index, call_id, name, arguments, signature: None }));
            }
        }
    }

    if let Some(fr) = candidate.get("finishReason").and_then(|v| v.as_str()) {
        let has_tool_calls = state.next_tool_index > 0;
        let stop = stop_reason_from_gemini(Some(fr), has_tool_calls);
        let usage = v.get("usageMetadata").and_then(parse_gemini_usage);
        events.push(Ok(StreamEvent::Done { usage, finish_reason: Some(format!("{stop:?}").to_lowercase()) }));
    }

    events
}

/// Mask the `key=` query parameter so it never reaches logs.
fn redact_url_key(url: &str) -> String {
    if let Some(idx) = url.find("key=") {
        let prefix = &url[..idx + 4];
        let rest = &url[idx + 4..];
        let end = rest.find('&').unwrap_or(rest.len());
        format!("{prefix}[REDACTED]{}", &rest[end..])
    } else {
        url.to_string()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl LlmProvider for GoogleProvider {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse> {
        let model = req.model.clone().unwrap_or_else(|| self.default_model.clone());
        let entry = self.auth.next_key();
        let url = self.generate_url(&model, &entry.key);
        let body = self.build_body(&req, &model);

        tracing::debug!(provider = %self.id, url = %redact_url_key(&url), "google chat request");

        let resp = self.client.post(&url).header("Content-Type", "application/json").json(&body).send().await.map_err(from_reqwest)?;

        let status = resp.status();
        let resp_text = resp.text().await.map_err(from_reqwest)?;

        if !status.is_success() {
            return Err(Error::Provider { provider: self.id.clone(), message: format!("HTTP {} - {}", status.as_u16(), resp_text) });
        }

        let resp_json: Value = serde_json::from_str(&resp_text)?;
        parse_gemini_response(&self.id, &resp_json, &model)
    }

    async fn chat_stream(&self, req: ChatRequest) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let model = req.model.clone().unwrap_or_else(|| self.default_model.clone());
        let entry = self.auth.next_key();
        let url = self.stream_url(&model, &entry.key);
        let body = self.build_body(&req, &model);
        let provider_id = self.id.clone();

        tracing::debug!(provider = %self.id, url = %redact_url_key(&url), "google stream request");

        let resp = self.client.post(&url).header("Content-Type", "application/json").json(&body).send().await.map_err(from_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            let err_text = resp.text().await.map_err(from_reqwest)?;
            return Err(Error::Provider { provider: provider_id, message: format!("HTTP {} - {}", status.as_u16(), err_text) });
        }

        let mut state = StreamState::default();
        Ok(crate::sse::sse_response_stream(resp, move |data| parse_gemini_sse_data(&mut state, data)))
    }

    async fn embeddings(&self, req: EmbeddingsRequest) -> Result<EmbeddingsResponse> {
        let model = req.model.clone().unwrap_or_else(|| "text-embedding-004".into());
        let entry = self.auth.next_key();
        let url = format!("{}/v1beta/models/{}:batchEmbedContents?key={}", self.base_url, model, entry.key);

        let requests: Vec<Value> = req
            .input
            .iter()
            .map(|text| serde_json::json!({ "model": format!("models/{}", model), "content": {"parts": [{"text": text}]} }))
            .collect();

        let body = serde_json::json!({ "requests": requests });

        let resp = self.client.post(&url).header("Content-Type", "application/json").json(&body).send().await.map_err(from_reqwest)?;

        let status = resp.status();
        let resp_text = resp.text().await.map_err(from_reqwest)?;

        if !status.is_success() {
            return Err(Error::Provider { provider: self.id.clone(), message: format!("HTTP {} - {}", status.as_u16(), resp_text) });
        }

        let resp_json: Value = serde_json::from_str(&resp_text)?;
        let embed_arr = resp_json
            .get("embeddings")
            .and_then(|e| e.as_array())
            .ok_or_else(|| Error::Provider { provider: self.id.clone(), message: "missing 'embeddings' array in response".into() })?;

        let embeddings: Vec<Vec<f32>> = embed_arr
            .iter()
            .filter_map(|item| {
                let values = item.get("values")?.as_array()?;
                Some(values.iter().filter_map(|v| v.as_f64().map(|f| f as f32)).collect())
            })
            .collect();

        Ok(EmbeddingsResponse { embeddings })
    }

    fn capabilities(&self) -> &LlmCapabilities {
        &self.capabilities
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_url_key_masks_query_param() {
        let url = "https://example/v1beta/models/gemini:generateContent?key=abc123&alt=sse";
        let redacted = redact_url_key(url);
        assert!(!redacted.contains("abc123"));
        assert!(redacted.contains("&alt=sse"));
    }

    #[test]
    fn model_requires_tool_id_for_openai_shaped_passthrough() {
        assert!(model_requires_tool_id("claude-sonnet-4"));
        assert!(model_requires_tool_id("gpt-oss-120b"));
        assert!(!model_requires_tool_id("gemini-2.0-flash"));
    }

    #[test]
    fn sanitize_call_id_caps_at_64_chars() {
        let long = "y".repeat(100);
        assert_eq!(sanitize_call_id(&long).len(), 64);
    }

    #[test]
    fn stop_reason_tool_calls_wins() {
        assert_eq!(stop_reason_from_gemini(Some("STOP"), true), StopReason::ToolCalls);
    }

    #[test]
    fn parse_gemini_response_extracts_thinking_signature() {
        let body = serde_json::json!({
            "candidates": [{
                "content": { "parts": [
                    {"text": "pondering", "thought": true, "thoughtSignature": "sig123"},
                    {"text": "answer"}
                ]},
                "finishReason": "STOP"
            }],
            "usageMetadata": { "promptTokenCount": 10, "candidatesTokenCount": 5, "totalTokenCount": 15 }
        });
        let resp = parse_gemini_response("google", &body, "gemini-2.0-flash").unwrap();
        assert_eq!(resp.message.message_text(), "answer");
        assert_eq!(resp.message.message_thinking(), "pondering");
        match resp.message.content.first().unwrap() {
            AssistantContentBlock::Thinking { signature, .. } => {
                assert_eq!(signature.as_deref(), Some("sig123"));
            }
            other => panic!("expected thinking block first, got {other:?}"),
        }
    }
}
