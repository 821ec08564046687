//! Anthropic Messages API adapter.
//!
//! Translates the canonical [`Message`] model to Anthropic's `/v1/messages`
//! wire format and back, including extended thinking blocks (with their
//! `signature` field) and tool calls. OAuth-authenticated sessions (Claude
//! Pro/Max "agentif_*" tokens) get the `anthropic-beta: oauth-2025-04-20`
//! header and an ephemeral cache-control block on the system prompt.

use crate::auth::AuthRotator;
use crate::sse::sse_response_stream;
use crate::traits::{ChatRequest, ChatResponse, EmbeddingsRequest, EmbeddingsResponse, LlmProvider};
use crate::util::from_reqwest;
use sa_domain::capability::{LlmCapabilities, ToolSupport};
use sa_domain::config::ProviderConfig;
use sa_domain::error::{Error, Result};
use sa_domain::message::{
    AssistantContentBlock, AssistantMessage, Message, ToolCall, ToolResultContentBlock,
    ToolResultMessage, UserContentBlock,
};
use sa_domain::stream::{BoxStream, StopReason, StreamEvent, Usage};
use sa_domain::tool::ToolDefinition;
use serde_json::{json, Value};
use std::sync::Arc;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicProvider {
    id: String,
    base_url: String,
    auth: Arc<AuthRotator>,
    is_oauth: bool,
    default_model: Option<String>,
    capabilities: LlmCapabilities,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn from_config(pc: &ProviderConfig) -> Result<Self> {
        let auth = Arc::new(AuthRotator::from_auth_config(&pc.auth)?);
        let client = reqwest::Client::builder().build().map_err(from_reqwest)?;

        Ok(Self {
            id: pc.id.clone(),
            base_url: pc.base_url.trim_end_matches('/').to_string(),
            auth,
            is_oauth: matches!(pc.auth.mode, sa_domain::config::AuthMode::OauthDevice),
            default_model: pc.default_model.clone(),
            capabilities: LlmCapabilities {
                supports_tools: ToolSupport::StrictJson,
                supports_streaming: true,
                supports_json_mode: false,
                supports_vision: true,
                context_window_tokens: None,
                max_output_tokens: None,
            },
            client,
        })
    }

    fn model_name(&self, req: &ChatRequest) -> Result<String> {
        req.model
            .clone()
            .or_else(|| self.default_model.clone())
            .ok_or_else(|| Error::MissingModel(self.id.clone()))
    }

    fn authed_post(&self, url: &str, key: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(url)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json");

        builder = if self.is_oauth {
            builder
                .header("authorization", format!("Bearer {key}"))
                .header("anthropic-beta", "oauth-2025-04-20")
        } else {
            builder.header("x-api-key", key)
        };

        builder
    }

    fn build_body(&self, req: &ChatRequest, model: &str, stream: bool) -> Value {
        let mut system_blocks: Vec<Value> = Vec::new();
        let mut messages: Vec<Value> = Vec::new();

        for msg in &req.messages {
            match msg {
                Message::User(u) => {
                    messages.push(json!({
                        "role": "user",
                        "content": user_content_to_anthropic(&u.content),
                    }));
                }
                Message::Assistant(a) => {
                    messages.push(json!({
                        "role": "assistant",
                        "content": assistant_content_to_anthropic(a),
                    }));
                }
                Message::ToolResult(t) => {
                    messages.push(json!({
                        "role": "user",
                        "content": [tool_result_to_anthropic(t)],
                    }));
                }
                Message::CompactionSummary(c) => {
                    messages.push(json!({
                        "role": "user",
                        "content": [{ "type": "text", "text": format!("[Conversation summary]\n{}", c.text) }],
                    }));
                }
            }
        }

        if self.is_oauth {
            // Ephemeral cache block keeps the OAuth system identity prompt
            // from being re-billed on every turn.
            system_blocks.push(json!({
                "type": "text",
                "text": "You are Claude Code, Anthropic's official CLI for Claude.",
                "cache_control": { "type": "ephemeral" },
            }));
        }
        if let Some(prompt) = &req.system_prompt {
            system_blocks.push(json!({ "type": "text", "text": prompt }));
        }

        let mut body = json!({
            "model": model,
            "max_tokens": req.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "messages": messages,
            "stream": stream,
        });

        if !system_blocks.is_empty() {
            body["system"] = Value::Array(system_blocks);
        }
        if let Some(t) = req.temperature {
            body["temperature"] = json!(t);
        }
        if !req.tools.is_empty() {
            body["tools"] = Value::Array(req.tools.iter().map(tool_to_anthropic).collect());
        }

        body
    }
}

/// Anthropic tool-use ids must be alphanumeric/`_`/`-` and are capped well
/// under the API's limit; provider-agnostic call ids may contain other
/// characters, so normalize before sending.
fn sanitize_tool_id(id: &str) -> String {
    let cleaned: String = id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if cleaned.is_empty() {
        "tool_call".to_string()
    } else {
        cleaned.chars().take(64).collect()
    }
}

fn user_content_to_anthropic(blocks: &[UserContentBlock]) -> Value {
    let parts: Vec<Value> = blocks
        .iter()
        .map(|b| match b {
            UserContentBlock::Text { text } => json!({ "type": "text", "text": text }),
            UserContentBlock::Image { url, media_type } => json!({
                "type": "image",
                "source": { "type": "url", "url": url, "media_type": media_type },
            }),
        })
        .collect();
    Value::Array(parts)
}

fn assistant_content_to_anthropic(a: &AssistantMessage) -> Value {
    let mut parts: Vec<Value> = Vec::new();
    for block in &a.content {
        match block {
            AssistantContentBlock::Text { text, .. } => {
                if !text.is_empty() {
                    parts.push(json!({ "type": "text", "text": text }));
                }
            }
            AssistantContentBlock::Thinking { text, signature } => {
                let mut v = json!({ "type": "thinking", "thinking": text });
                if let Some(sig) = signature {
                    v["signature"] = json!(sig);
                }
                parts.push(v);
            }
            AssistantContentBlock::ToolCall(call) => {
                parts.push(tool_call_to_anthropic(call));
            }
        }
    }
    Value::Array(parts)
}

fn tool_call_to_anthropic(call: &ToolCall) -> Value {
    let input: Value = serde_json::from_str(&call.arguments).unwrap_or(Value::Null);
    json!({
        "type": "tool_use",
        "id": sanitize_tool_id(&call.call_id),
        "name": call.name,
        "input": input,
    })
}

fn tool_result_to_anthropic(t: &ToolResultMessage) -> Value {
    let content: Vec<Value> = t
        .content
        .iter()
        .map(|b| match b {
            ToolResultContentBlock::Text { text } => json!({ "type": "text", "text": text }),
            ToolResultContentBlock::Image { url, media_type } => json!({
                "type": "image",
                "source": { "type": "url", "url": url, "media_type": media_type },
            }),
        })
        .collect();
    json!({
        "type": "tool_result",
        "tool_use_id": sanitize_tool_id(&t.call_id),
        "content": content,
        "is_error": t.is_error,
    })
}

fn tool_to_anthropic(def: &ToolDefinition) -> Value {
    json!({
        "name": def.name,
        "description": def.description,
        "input_schema": def.parameters,
    })
}

fn parse_usage(v: &Value) -> Usage {
    let input = v.get("input_tokens").and_then(Value::as_u64).unwrap_or(0);
    let output = v.get("output_tokens").and_then(Value::as_u64).unwrap_or(0);
    let cache_read = v
        .get("cache_read_input_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let cache_write = v
        .get("cache_creation_input_tokens")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    Usage {
        input,
        output,
        cache_read,
        cache_write,
        total: input + output,
    }
}

fn stop_reason_from_anthropic(raw: Option<&str>, has_tool_calls: bool) -> StopReason {
    // Tool calls always win, regardless of what the provider reports.
    if has_tool_calls {
        return StopReason::ToolCalls;
    }
    match raw {
        Some("end_turn") => StopReason::Stop,
        Some("tool_use") => StopReason::ToolCalls,
        Some("max_tokens") => StopReason::Length,
        Some("stop_sequence") => StopReason::Stop,
        Some("refusal") => StopReason::Safety,
        Some(_) => StopReason::Other,
        None => StopReason::Other,
    }
}

fn parse_response(model: &str, body: &Value) -> Result<ChatResponse> {
    let provider_content = body
        .get("content")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut assistant = AssistantMessage::new("anthropic", "messages", model);

    for block in &provider_content {
        let kind = block.get("type").and_then(Value::as_str).unwrap_or("");
        match kind {
            "text" => {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    assistant.append_text(text);
                }
            }
            "thinking" => {
                let text = block.get("thinking").and_then(Value::as_str).unwrap_or("");
                assistant.append_thinking(text);
                if let Some(AssistantContentBlock::Thinking { signature, .. }) =
                    assistant.content.last_mut()
                {
                    *signature = block
                        .get("signature")
                        .and_then(Value::as_str)
                        .map(String::from);
                }
            }
            "tool_use" => {
                let call_id = block
                    .get("id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let name = block
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let arguments = block
                    .get("input")
                    .cloned()
                    .unwrap_or(Value::Object(Default::default()))
                    .to_string();
                assistant.push_tool_call(ToolCall {
                    call_id,
                    name,
                    arguments,
                    signature: None,
                });
            }
            _ => {}
        }
    }

    let usage = body.get("usage").map(parse_usage);
    let raw_stop = body.get("stop_reason").and_then(Value::as_str);
    let stop_reason = stop_reason_from_anthropic(raw_stop, !assistant.tool_calls.is_empty());
    let response_id = body.get("id").and_then(Value::as_str).map(String::from);
    assistant.response_id = response_id.clone();

    Ok(ChatResponse {
        message: assistant,
        usage,
        model: model.to_string(),
        stop_reason,
        response_id,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SSE streaming
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
struct StreamState {
    /// index -> (call_id, name, arguments buffer)
    tool_calls: std::collections::HashMap<usize, (String, String, String)>,
    current_thinking_signature: Option<String>,
}

fn parse_sse_event(state: &mut StreamState, data: &str) -> Vec<Result<StreamEvent>> {
    if data == "[DONE]" {
        return Vec::new();
    }
    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => return vec![Err(Error::ProviderStream(format!("anthropic SSE parse: {e}")))],
    };

    let event_type = v.get("type").and_then(Value::as_str).unwrap_or("");
    match event_type {
        "content_block_start" => {
            let index = v.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
            let block = v.get("content_block").cloned().unwrap_or(Value::Null);
            match block.get("type").and_then(Value::as_str) {
                Some("tool_use") => {
                    let call_id = block
                        .get("id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    let name = block
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    state
                        .tool_calls
                        .insert(index, (call_id.clone(), name.clone(), String::new()));
                    vec![Ok(StreamEvent::ToolCallStarted { index, call_id, name })]
                }
                _ => Vec::new(),
            }
        }
        "content_block_delta" => {
            let index = v.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
            let delta = v.get("delta").cloned().unwrap_or(Value::Null);
            match delta.get("type").and_then(Value::as_str) {
                Some("text_delta") => {
                    let text = delta.get("text").and_then(Value::as_str).unwrap_or("");
                    vec![Ok(StreamEvent::Token { text: text.to_string() })]
                }
                Some("thinking_delta") => {
                    let text = delta.get("thinking").and_then(Value::as_str).unwrap_or("");
                    vec![Ok(StreamEvent::Thinking { text: text.to_string() })]
                }
                Some("signature_delta") => {
                    if let Some(sig) = delta.get("signature").and_then(Value::as_str) {
                        state.current_thinking_signature = Some(sig.to_string());
                    }
                    Vec::new()
                }
                Some("input_json_delta") => {
                    let fragment = delta
                        .get("partial_json")
                        .and_then(Value::as_str)
                        .unwrap_or("");
                    if let Some((_, _, buf)) = state.tool_calls.get_mut(&index) {
                        buf.push_str(fragment);
                    }
                    vec![Ok(StreamEvent::ToolCallDelta {
                        index,
                        arguments_fragment: fragment.to_string(),
                    })]
                }
                _ => Vec::new(),
            }
        }
        "content_block_stop" => {
            let index = v.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
            if let Some((call_id, name, arguments)) = state.tool_calls.remove(&index) {
                let signature = state.current_thinking_signature.take();
                vec![Ok(StreamEvent::ToolCallFinished {
                    index,
                    call_id,
                    name,
                    arguments,
                    signature,
                })]
            } else {
                Vec::new()
            }
        }
        "message_delta" => {
            let usage = v.get("usage").map(parse_usage);
            let raw_stop = v
                .get("delta")
                .and_then(|d| d.get("stop_reason"))
                .and_then(Value::as_str);
            let stop = stop_reason_from_anthropic(raw_stop, raw_stop == Some("tool_use"));
            vec![Ok(StreamEvent::Done {
                usage,
                finish_reason: Some(format!("{stop:?}").to_lowercase()),
            })]
        }
        "error" => {
            let message = v
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("unknown Anthropic stream error")
                .to_string();
            vec![Ok(StreamEvent::Error { message })]
        }
        _ => Vec::new(),
    }
}

#[async_trait::async_trait]
impl LlmProvider for AnthropicProvider {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse> {
        let model = self.model_name(&req)?;
        let key_entry = self.auth.next_key();
        let url = format!("{}/v1/messages", self.base_url);
        let body = self.build_body(&req, &model, false);

        let resp = self
            .authed_post(&url, &key_entry.key)
            .json(&body)
            .send()
            .await
            .map_err(from_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            self.auth.mark_failed(key_entry.index);
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::Provider {
                provider: self.id.clone(),
                message: format!("HTTP {}: {}", status.as_u16(), text),
            });
        }

        let body: Value = resp.json().await.map_err(from_reqwest)?;
        parse_response(&model, &body)
    }

    async fn chat_stream(
        &self,
        req: ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let model = self.model_name(&req)?;
        let key_entry = self.auth.next_key();
        let url = format!("{}/v1/messages", self.base_url);
        let body = self.build_body(&req, &model, true);

        let resp = self
            .authed_post(&url, &key_entry.key)
            .json(&body)
            .send()
            .await
            .map_err(from_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            self.auth.mark_failed(key_entry.index);
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::Provider {
                provider: self.id.clone(),
                message: format!("HTTP {}: {}", status.as_u16(), text),
            });
        }

        let mut state = StreamState::default();
        Ok(sse_response_stream(resp, move |data| {
            parse_sse_event(&mut state, data)
        }))
    }

    async fn embeddings(&self, _req: EmbeddingsRequest) -> Result<EmbeddingsResponse> {
        Err(Error::Unsupported(format!(
            "{} does not support embeddings",
            self.id
        )))
    }

    fn capabilities(&self) -> &LlmCapabilities {
        &self.capabilities
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_tool_id_strips_invalid_chars() {
        assert_eq!(sanitize_tool_id("abc!@#123"), "abc123");
        assert_eq!(sanitize_tool_id(""), "tool_call");
    }

    #[test]
    fn sanitize_tool_id_caps_length() {
        let long = "a".repeat(100);
        assert_eq!(sanitize_tool_id(&long).len(), 64);
    }

    #[test]
    fn stop_reason_tool_calls_always_wins() {
        assert_eq!(
            stop_reason_from_anthropic(Some("end_turn"), true),
            StopReason::ToolCalls
        );
    }

    #[test]
    fn stop_reason_maps_max_tokens_to_length() {
        assert_eq!(
            stop_reason_from_anthropic(Some("max_tokens"), false),
            StopReason::Length
        );
    }

    #[test]
    fn parse_usage_reads_cache_fields() {
        let v = json!({
            "input_tokens": 100,
            "output_tokens": 50,
            "cache_read_input_tokens": 20,
            "cache_creation_input_tokens": 5,
        });
        let usage = parse_usage(&v);
        assert_eq!(usage.input, 100);
        assert_eq!(usage.output, 50);
        assert_eq!(usage.cache_read, 20);
        assert_eq!(usage.cache_write, 5);
        assert_eq!(usage.total, 150);
    }

    #[test]
    fn parse_response_extracts_text_and_tool_calls() {
        let body = json!({
            "id": "msg_123",
            "content": [
                { "type": "text", "text": "Let me check that." },
                { "type": "tool_use", "id": "toolu_1", "name": "get_weather", "input": { "city": "SF" } }
            ],
            "stop_reason": "tool_use",
            "usage": { "input_tokens": 10, "output_tokens": 5 },
        });
        let resp = parse_response("claude-sonnet-4", &body).unwrap();
        assert_eq!(resp.stop_reason, StopReason::ToolCalls);
        assert_eq!(resp.response_id.as_deref(), Some("msg_123"));
        assert_eq!(resp.message.tool_calls.len(), 1);
        assert_eq!(resp.message.tool_calls[0].name, "get_weather");
    }

    #[test]
    fn parse_response_captures_thinking_signature() {
        let body = json!({
            "id": "msg_456",
            "content": [
                { "type": "thinking", "thinking": "reasoning...", "signature": "sig_abc" },
                { "type": "text", "text": "done" },
            ],
            "stop_reason": "end_turn",
        });
        let resp = parse_response("claude-opus-4", &body).unwrap();
        match &resp.message.content[0] {
            AssistantContentBlock::Thinking { signature, .. } => {
                assert_eq!(signature.as_deref(), Some("sig_abc"));
            }
            other => panic!("unexpected block {other:?}"),
        }
    }

    #[test]
    fn parse_sse_event_emits_text_delta() {
        let mut state = StreamState::default();
        let data = json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": { "type": "text_delta", "text": "hi" },
        })
        .to_string();
        let events = parse_sse_event(&mut state, &data);
        assert_eq!(events.len(), 1);
        match events.into_iter().next().unwrap().unwrap() {
            StreamEvent::Token { text } => assert_eq!(text, "hi"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn parse_sse_event_assembles_tool_call_across_deltas() {
        let mut state = StreamState::default();
        let start = json!({
            "type": "content_block_start",
            "index": 0,
            "content_block": { "type": "tool_use", "id": "toolu_1", "name": "search" },
        })
        .to_string();
        parse_sse_event(&mut state, &start);

        let delta = json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": { "type": "input_json_delta", "partial_json": "{\"q\":\"rust\"}" },
        })
        .to_string();
        parse_sse_event(&mut state, &delta);

        let stop = json!({ "type": "content_block_stop", "index": 0 }).to_string();
        let events = parse_sse_event(&mut state, &stop);
        match events.into_iter().next().unwrap().unwrap() {
            StreamEvent::ToolCallFinished { call_id, name, arguments, .. } => {
                assert_eq!(call_id, "toolu_1");
                assert_eq!(name, "search");
                assert_eq!(arguments, "{\"q\":\"rust\"}");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn done_sentinel_produces_no_events() {
        let mut state = StreamState::default();
        assert!(parse_sse_event(&mut state, "[DONE]").is_empty());
    }
}
