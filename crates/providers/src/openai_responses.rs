//! OpenAI Responses API adapter.
//!
//! Targets `/responses` rather than `/chat/completions`. Supports response
//! chaining via `previous_response_id` and surfaces reasoning-summary deltas
//! as [`StreamEvent::Thinking`] events.

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

/// The Responses API caps custom item ids at 40 characters.
const MAX_ITEM_ID_LEN: usize = 40;

fn sanitize_item_id(id: &str) -> String {
    let cleaned: String = id.chars().filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-').collect();
    let cleaned = if cleaned.is_empty() { "item".to_string() } else { cleaned };
    cleaned.chars().take(MAX_ITEM_ID_LEN).collect()
}

pub struct OpenAiResponsesProvider {
    id: String,
    base_url: String,
    auth: Arc<AuthRotator>,
    default_model: String,
    capabilities: LlmCapabilities,
    client: reqwest::Client,
}

impl OpenAiResponsesProvider {
    pub fn from_config(cfg: &ProviderConfig) -> Result<Self> {
        let auth = Arc::new(AuthRotator::from_auth_config(&cfg.auth)?);
        let default_model = cfg.default_model.clone().unwrap_or_else(|| "gpt-4.1".into());

        let capabilities = LlmCapabilities {
            supports_tools: sa_domain::capability::ToolSupport::StrictJson,
            supports_streaming: true,
            supports_json_mode: true,
            supports_vision: true,
            context_window_tokens: Some(128_000),
            max_output_tokens: Some(16_384),
        };

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(from_reqwest)?;

        Ok(Self { id: cfg.id.clone(), base_url: cfg.base_url.trim_end_matches('/').to_string(), auth, default_model, capabilities, client })
    }

    fn authed_post(&self, url: &str) -> reqwest::RequestBuilder {
        let entry = self.auth.next_key();
        self.client.post(url).bearer_auth(&entry.key).header("Content-Type", "application/json")
    }

    fn build_body(&self, req: &ChatRequest, model: &str, stream: bool) -> Value {
        let input: Vec<Value> = req.messages.iter().map(message_to_responses_item).collect();

        let mut body = serde_json::json!({
            "model": model,
            "input": input,
            "stream": stream,
        });

        if let Some(prev) = &req.previous_response_id {
            body["previous_response_id"] = serde_json::json!(prev);
        }
        if !req.tools.is_empty() {
            let tools: Vec<Value> = req.tools.iter().map(tool_to_responses).collect();
            body["tools"] = Value::Array(tools);
        }
        if let Some(temp) = req.temperature {
            body["temperature"] = serde_json::json!(temp);
        }
        if let Some(max) = req.max_tokens {
            body["max_output_tokens"] = serde_json::json!(max);
        }
        if req.json_mode {
            body["text"] = serde_json::json!({"format": {"type": "json_object"}});
        }
        body
    }
}

fn message_to_responses_item(msg: &Message) -> Value {
    match msg {
        Message::User(u) => {
            let content: Vec<Value> = u
                .content
                .iter()
                .map(|b| match b {
                    UserContentBlock::Text { text } => serde_json::json!({"type": "input_text", "text": text}),
                    UserContentBlock::Image { url, .. } => serde_json::json!({"type": "input_image", "image_url": url}),
                })
                .collect();
            serde_json::json!({ "role": "user", "content": content })
        }
        Message::Assistant(a) => {
            let content: Vec<Value> = a
                .content
                .iter()
                .filter_map(|b| match b {
                    AssistantContentBlock::Text { text, .. } => Some(serde_json::json!({"type": "output_text", "text": text})),
                    AssistantContentBlock::ToolCall(call) => Some(serde_json::json!({
                        "type": "function_call",
                        "call_id": sanitize_item_id(&call.call_id),
                        "name": call.name,
                        "arguments": call.arguments,
                    })),
                    AssistantContentBlock::Thinking { .. } => None,
                })
                .collect();
            serde_json::json!({ "role": "assistant", "content": content })
        }
        Message::ToolResult(t) => tool_result_to_responses(t),
        Message::CompactionSummary(c) => serde_json::json!({
            "role": "user",
            "content": [{"type": "input_text", "text": format!("[Conversation summary]\n{}", c.text)}],
        }),
    }
}

fn tool_result_to_responses(t: &ToolResultMessage) -> Value {
    let text = t
        .content
        .iter()
        .filter_map(|b| match b {
            ToolResultContentBlock::Text { text } => Some(text.as_str()),
            ToolResultContentBlock::Image { .. } => None,
        })
        .collect::<Vec<_>>()
        .join("\n");
    serde_json::json!({
        "type": "function_call_output",
        "call_id": sanitize_item_id(&t.call_id),
        "output": text,
    })
}

fn tool_to_responses(tool: &ToolDefinition) -> Value {
    serde_json::json!({
        "type": "function",
        "name": tool.name,
        "description": tool.description,
        "parameters": tool.parameters,
        "strict": tool.strict_schema,
    })
}

fn stop_reason_from_responses(status: Option<&str>, has_tool_calls: bool) -> StopReason {
    if has_tool_calls {
        return StopReason::ToolCalls;
    }
    match status {
        Some("completed") => StopReason::Stop,
        Some("incomplete") => StopReason::Length,
        Some("failed") => StopReason::Error,
        Some(_) => StopReason::Other,
        None => StopReason::Other,
    }
}

fn parse_response(provider_id: &str, model: &str, body: &Value) -> Result<ChatResponse> {
    let output = body
        .get("output")
        .and_then(|o| o.as_array())
        .ok_or_else(|| Error::Provider { provider: provider_id.to_string(), message: "missing 'output' array in response".into() })?;

    let mut assistant = AssistantMessage::new(provider_id, "responses", model);

    for item in output {
        match item.get("type").and_then(|v| v.as_str()) {
            Some("message") => {
                if let Some(parts) = item.get("content").and_then(|c| c.as_array()) {
                    for part in parts {
                        if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
                            assistant.append_text(text);
                        }
                    }
                }
            }
            Some("reasoning") => {
                if let Some(summary) = item.get("summary").and_then(|s| s.as_array()) {
                    for s in summary {
                        if let Some(text) = s.get("text").and_then(|v| v.as_str()) {
                            assistant.append_thinking(text);
                        }
                    }
                }
            }
            Some("function_call") => {
                let call_id = item.get("call_id").and_then(|v| v.as_str()).unwrap_or("").to_string();
                let name = item.get("name").and_then(|v| v.as_str()).unwrap_or("").to_string();
                let arguments = item.get("arguments").and_then(|v| v.as_str()).unwrap_or("{}").to_string();
                assistant.push_tool_call(ToolCall { call_id, name, arguments, signature: None });
            }
            _ => {}
        }
    }

    let status = body.get("status").and_then(|v| v.as_str());
    let stop_reason = stop_reason_from_responses(status, !assistant.tool_calls.is_empty());
    let usage = body.get("usage").and_then(parse_usage);
    let response_id = body.get("id").and_then(|v| v.as_str()).map(String::from);

    Ok(ChatResponse { message: assistant, usage, model: model.to_string(), stop_reason, response_id })
}

fn parse_usage(v: &Value) -> Option<Usage> {
    let input = v.get("input_tokens")?.as_u64()?;
    let output = v.get("output_tokens")?.as_u64()?;
    let total = v.get("total_tokens").and_then(Value::as_u64).unwrap_or(input + output);
    let cache_read = v
        .get("input_tokens_details")
        .and_then(|d| d.get("cached_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    Some(Usage { input, output, cache_read, cache_write: 0, total })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
struct StreamState {
    next_tool_index: usize,
    response_id: Option<String>,
}

fn parse_sse_event(state: &mut StreamState, data: &str) -> Vec<Result<StreamEvent>> {
    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => return vec![Err(Error::Json(e))],
    };

    let event_type = v.get("type").and_then(|t| t.as_str()).unwrap_or("");
    let mut events = Vec::new();

    match event_type {
        "response.created" => {
            state.response_id = v.get("response").and_then(|r| r.get("id")).and_then(|v| v.as_str()).map(String::from);
        }
        "response.output_text.delta" => {
            if let Some(delta) = v.get("delta").and_then(|v| v.as_str()) {
                events.push(Ok(StreamEvent::Token { text: delta.to_string() }));
            }
        }
        "response.reasoning_summary_text.delta" => {
            if let Some(delta) = v.get("delta").and_then(|v| v.as_str()) {
                events.push(Ok(StreamEvent::Thinking { text: delta.to_string() }));
            }
        }
        "response.output_item.added" => {
            if let Some(item) = v.get("item") {
                if item.get("type").and_then(|v| v.as_str()) == Some("function_call") {
                    let index = state.next_tool_index;
                    state.next_tool_index += 1;
                    let call_id = item.get("call_id").and_then(|v| v.as_str()).unwrap_or("").to_string();
                    let name = item.get("name").and_then(|v| v.as_str()).unwrap_or("").to_string();
                    events.push(Ok(StreamEvent::ToolCallStarted { index, call_id, name }));
                }
            }
        }
        "response.function_call_arguments.delta" => {
            let index = state.next_tool_index.saturating_sub(1);
            if let Some(delta) = v.get("delta").and_then(|v| v.as_str()) {
                events.push(Ok(StreamEvent::ToolCallDelta { index, arguments_fragment: delta.to_string() }));
            }
        }
        "response.output_item.done" => {
            if let Some(item) = v.get("item") {
                if item.get("type").and_then(|v| v.as_str()) == Some("function_call") {
                    let index = state.next_tool_index.saturating_sub(1);
                    let call_id = item.get("call_id").and_then(|v| v.as_str()).unwrap_or("").to_string();
                    let name = item.get("name").and_then(|v| v.as_str()).unwrap_or("").to_string();
                    let arguments = item.get("arguments").and_then(|v| v.as_str()).unwrap_or("{}").to_string();
                    events.push(Ok(StreamEvent::ToolCallFinished { index, call_id, name, arguments, signature: None }));
                }
            }
        }
        "response.completed" | "response.incomplete" | "response.failed" => {
            let status = v
                .get("response")
                .and_then(|r| r.get("status"))
                .and_then(|v| v.as_str())
                .or(Some(event_type.trim_start_matches("response.")));
            let usage = v.get("response").and_then(|r| r.get("usage")).and_then(parse_usage);
            let has_tool_calls = state.next_tool_index > 0;
            let stop = stop_reason_from_responses(status, has_tool_calls);
            events.push(Ok(StreamEvent::Done { usage, finish_reason: Some(format!("{stop:?}").to_lowercase()) }));
        }
        "error" => {
            let message = v.get("message").and_then(|v| v.as_str()).unwrap_or("unknown responses API error").to_string();
            events.push(Ok(StreamEvent::Error { message }));
        }
        _ => {}
    }

    events
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl LlmProvider for OpenAiResponsesProvider {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse> {
        let model = req.model.clone().unwrap_or_else(|| self.default_model.clone());
        let url = format!("{}/responses", self.base_url);
        let body = self.build_body(&req, &model, false);

        tracing::debug!(provider = %self.id, url = %url, "openai_responses chat request");

        let resp = self.authed_post(&url).json(&body).send().await.map_err(from_reqwest)?;
        let status = resp.status();
        let resp_text = resp.text().await.map_err(from_reqwest)?;

        if !status.is_success() {
            return Err(Error::Provider { provider: self.id.clone(), message: format!("HTTP {} - {}", status.as_u16(), resp_text) });
        }

        let resp_json: Value = serde_json::from_str(&resp_text)?;
        parse_response(&self.id, &model, &resp_json)
    }

    async fn chat_stream(&self, req: ChatRequest) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let model = req.model.clone().unwrap_or_else(|| self.default_model.clone());
        let url = format!("{}/responses", self.base_url);
        let body = self.build_body(&req, &model, true);
        let provider_id = self.id.clone();

        tracing::debug!(provider = %self.id, url = %url, "openai_responses stream request");

        let resp = self.authed_post(&url).json(&body).send().await.map_err(from_reqwest)?;
        let status = resp.status();
        if !status.is_success() {
            let err_text = resp.text().await.map_err(from_reqwest)?;
            return Err(Error::Provider { provider: provider_id, message: format!("HTTP {} - {}", status.as_u16(), err_text) });
        }

        let mut state = StreamState::default();
        Ok(crate::sse::sse_response_stream(resp, move |data| parse_sse_event(&mut state, data)))
    }

    async fn embeddings(&self, _req: EmbeddingsRequest) -> Result<EmbeddingsResponse> {
        Err(Error::Unsupported("embeddings are not available on the Responses API; configure a separate embeddings provider".into()))
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
    fn sanitize_item_id_caps_at_forty_chars() {
        let long = "z".repeat(100);
        assert_eq!(sanitize_item_id(&long).len(), MAX_ITEM_ID_LEN);
    }

    #[test]
    fn stop_reason_tool_calls_wins() {
        assert_eq!(stop_reason_from_responses(Some("completed"), true), StopReason::ToolCalls);
    }

    #[test]
    fn parse_response_extracts_text_and_reasoning() {
        let body = serde_json::json!({
            "id": "resp_1",
            "status": "completed",
            "output": [
                {"type": "reasoning", "summary": [{"text": "thinking it through"}]},
                {"type": "message", "content": [{"text": "final answer"}]}
            ],
            "usage": {"input_tokens": 10, "output_tokens": 4, "total_tokens": 14}
        });
        let resp = parse_response("openai", "gpt-4.1", &body).unwrap();
        assert_eq!(resp.message.message_text(), "final answer");
        assert_eq!(resp.message.message_thinking(), "thinking it through");
        assert_eq!(resp.response_id.as_deref(), Some("resp_1"));
    }

    #[test]
    fn parse_sse_event_emits_text_delta() {
        let mut state = StreamState::default();
        let data = serde_json::json!({"type": "response.output_text.delta", "delta": "hi"}).to_string();
        let events = parse_sse_event(&mut state, &data);
        match events.into_iter().next().unwrap().unwrap() {
            StreamEvent::Token { text } => assert_eq!(text, "hi"),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
