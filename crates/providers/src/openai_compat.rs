//! OpenAI-Completions adapter.
//!
//! Works with OpenAI's `/chat/completions` endpoint, Azure OpenAI, and the
//! many third-party endpoints (Ollama, vLLM, LM Studio, Together, DeepSeek,
//! MiniMax, Mistral, GitHub Copilot) that follow the same wire shape with
//! small per-vendor quirks tracked in [`CompatMatrix`].

use crate::auth::AuthRotator;
use crate::traits::{ChatRequest, ChatResponse, EmbeddingsRequest, EmbeddingsResponse, LlmProvider};
use crate::util::from_reqwest;
use sa_domain::capability::LlmCapabilities;
use sa_domain::config::{ProviderConfig, ProviderKind};
use sa_domain::error::{Error, Result};
use sa_domain::message::{
    AssistantContentBlock, AssistantMessage, Message, ToolCall, ToolResultContentBlock,
    ToolResultMessage, UserContentBlock,
};
use sa_domain::stream::{BoxStream, StopReason, StreamEvent, Usage};
use sa_domain::tool::ToolDefinition;
use serde_json::Value;
use std::sync::Arc;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Compatibility matrix
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-vendor deviations from the canonical OpenAI-Completions wire shape.
/// Selected by the provider id's vendor prefix in [`CompatMatrix::for_id`].
#[derive(Debug, Clone, Copy)]
pub struct CompatMatrix {
    pub supports_store: bool,
    pub supports_developer_role: bool,
    pub supports_reasoning_effort: bool,
    pub supports_usage_in_streaming: bool,
    pub max_tokens_field: &'static str,
    pub requires_tool_result_name: bool,
    pub requires_assistant_after_tool_result: bool,
    pub requires_thinking_as_text: bool,
    pub tool_id_style: ToolIdStyle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolIdStyle {
    /// Pass the call id through unchanged.
    Passthrough,
    /// MiniMax requires a purely numeric-looking id; we keep digits only,
    /// defaulting to "0" if that strips everything.
    Numeric,
    /// Mistral requires a 9-character alphanumeric id, zero-padded.
    Mistral9,
    /// GitHub Copilot's Claude passthrough sanitizes to `[A-Za-z0-9_-]`
    /// and caps at 64 characters.
    SanitizedCapped64,
}

impl CompatMatrix {
    fn default_openai() -> Self {
        Self {
            supports_store: true,
            supports_developer_role: true,
            supports_reasoning_effort: true,
            supports_usage_in_streaming: true,
            max_tokens_field: "max_completion_tokens",
            requires_tool_result_name: false,
            requires_assistant_after_tool_result: false,
            requires_thinking_as_text: false,
            tool_id_style: ToolIdStyle::Passthrough,
        }
    }

    /// Select a matrix from a provider id's vendor prefix (`"minimax"`,
    /// `"mistral"`, `"copilot"`/`"github"`, everything else defaults to the
    /// plain OpenAI shape).
    pub fn for_id(provider_id: &str) -> Self {
        let lower = provider_id.to_ascii_lowercase();
        if lower.contains("minimax") {
            Self {
                supports_reasoning_effort: false,
                max_tokens_field: "max_tokens",
                requires_tool_result_name: true,
                tool_id_style: ToolIdStyle::Numeric,
                ..Self::default_openai()
            }
        } else if lower.contains("mistral") {
            Self {
                supports_store: false,
                supports_developer_role: false,
                supports_reasoning_effort: false,
                max_tokens_field: "max_tokens",
                tool_id_style: ToolIdStyle::Mistral9,
                ..Self::default_openai()
            }
        } else if lower.contains("copilot") || lower.contains("github") {
            Self {
                supports_store: false,
                supports_usage_in_streaming: false,
                max_tokens_field: "max_tokens",
                requires_assistant_after_tool_result: true,
                requires_thinking_as_text: true,
                tool_id_style: ToolIdStyle::SanitizedCapped64,
                ..Self::default_openai()
            }
        } else if lower.contains("deepseek") {
            Self {
                supports_reasoning_effort: false,
                max_tokens_field: "max_tokens",
                ..Self::default_openai()
            }
        } else {
            Self::default_openai()
        }
    }
}

/// Normalize a call id according to the vendor's tool-id quirks.
fn normalize_tool_id(style: ToolIdStyle, id: &str) -> String {
    match style {
        ToolIdStyle::Passthrough => id.to_string(),
        ToolIdStyle::Numeric => {
            let digits: String = id.chars().filter(|c| c.is_ascii_digit()).collect();
            if digits.is_empty() {
                "0".to_string()
            } else {
                digits
            }
        }
        ToolIdStyle::Mistral9 => {
            let alnum: String = id.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
            if alnum.len() >= 9 {
                alnum.chars().take(9).collect()
            } else {
                format!("{:0>9}", alnum)
            }
        }
        ToolIdStyle::SanitizedCapped64 => {
            let cleaned: String = id
                .chars()
                .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
                .collect();
            let cleaned = if cleaned.is_empty() { "tool_call".to_string() } else { cleaned };
            cleaned.chars().take(64).collect()
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter struct
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An LLM provider adapter for any OpenAI-Completions-shaped API endpoint.
///
/// Also handles Azure OpenAI, which uses the same wire format but with a
/// different URL pattern (`/openai/deployments/{model}/chat/completions`)
/// and auth header (`api-key` instead of `Authorization: Bearer`).
pub struct OpenAiCompatProvider {
    id: String,
    base_url: String,
    auth: Arc<AuthRotator>,
    auth_header: String,
    auth_prefix: String,
    default_model: String,
    capabilities: LlmCapabilities,
    client: reqwest::Client,
    is_azure: bool,
    matrix: CompatMatrix,
}

impl OpenAiCompatProvider {
    pub fn from_config(cfg: &ProviderConfig) -> Result<Self> {
        let is_azure = cfg.kind == ProviderKind::AzureOpenai;
        let auth = Arc::new(AuthRotator::from_auth_config(&cfg.auth)?);

        let auth_header = cfg.auth.header.clone().unwrap_or_else(|| {
            if is_azure { "api-key".into() } else { "Authorization".into() }
        });
        let auth_prefix = cfg.auth.prefix.clone().unwrap_or_else(|| {
            if is_azure { String::new() } else { "Bearer ".into() }
        });

        let default_model = cfg.default_model.clone().unwrap_or_else(|| "gpt-4o".into());

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

        Ok(Self {
            matrix: CompatMatrix::for_id(&cfg.id),
            id: cfg.id.clone(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            auth,
            auth_header,
            auth_prefix,
            default_model,
            capabilities,
            client,
            is_azure,
        })
    }

    fn authed_post(&self, url: &str) -> reqwest::RequestBuilder {
        let entry = self.auth.next_key();
        let header_value = format!("{}{}", self.auth_prefix, entry.key);
        self.client
            .post(url)
            .header(&self.auth_header, &header_value)
            .header("Content-Type", "application/json")
    }

    fn effective_model(&self, req: &ChatRequest) -> String {
        req.model.clone().unwrap_or_else(|| self.default_model.clone())
    }

    fn azure_chat_url(&self, model: &str) -> String {
        format!(
            "{}/openai/deployments/{}/chat/completions?api-version=2024-10-21",
            self.base_url, model
        )
    }

    fn build_chat_body(&self, req: &ChatRequest, stream: bool) -> Value {
        let mut messages: Vec<Value> = Vec::new();
        if let Some(prompt) = &req.system_prompt {
            let role = if self.matrix.supports_developer_role { "developer" } else { "system" };
            messages.push(serde_json::json!({ "role": role, "content": prompt }));
        }
        messages.extend(messages_to_openai(&req.messages, &self.matrix));

        let mut body = serde_json::json!({
            "messages": messages,
            "stream": stream,
        });

        if !self.is_azure {
            body["model"] = Value::String(self.effective_model(req));
        }

        if !req.tools.is_empty() {
            let tools: Vec<Value> = req.tools.iter().map(tool_to_openai).collect();
            body["tools"] = Value::Array(tools);
        }
        if let Some(temp) = req.temperature {
            body["temperature"] = serde_json::json!(temp);
        }
        if let Some(max) = req.max_tokens {
            body[self.matrix.max_tokens_field] = serde_json::json!(max);
        }
        if req.json_mode {
            body["response_format"] = serde_json::json!({"type": "json_object"});
        }
        if self.matrix.supports_store {
            body["store"] = serde_json::json!(false);
        }
        if stream && self.matrix.supports_usage_in_streaming {
            body["stream_options"] = serde_json::json!({"include_usage": true});
        }
        body
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message serialization helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn messages_to_openai(messages: &[Message], matrix: &CompatMatrix) -> Vec<Value> {
    let mut out = Vec::with_capacity(messages.len());
    let mut last_was_tool_result = false;

    for msg in messages {
        match msg {
            Message::User(u) => {
                out.push(user_to_openai(u));
                last_was_tool_result = false;
            }
            Message::Assistant(a) => {
                out.push(assistant_to_openai(a, matrix));
                last_was_tool_result = false;
            }
            Message::ToolResult(t) => {
                out.push(tool_result_to_openai(t, matrix));
                last_was_tool_result = true;
            }
            Message::CompactionSummary(c) => {
                out.push(serde_json::json!({
                    "role": "user",
                    "content": format!("[Conversation summary]\n{}", c.text),
                }));
                last_was_tool_result = false;
            }
        }
    }

    // Some vendors (GitHub Copilot's Claude passthrough) reject a tool
    // message as the last entry in the conversation; pad with an empty
    // assistant turn so the request is accepted.
    if last_was_tool_result && matrix.requires_assistant_after_tool_result {
        out.push(serde_json::json!({ "role": "assistant", "content": "" }));
    }

    out
}

fn user_to_openai(u: &sa_domain::message::UserMessage) -> Value {
    if u.content.len() == 1 {
        if let UserContentBlock::Text { text } = &u.content[0] {
            return serde_json::json!({ "role": "user", "content": text });
        }
    }
    let parts: Vec<Value> = u
        .content
        .iter()
        .map(|b| match b {
            UserContentBlock::Text { text } => {
                serde_json::json!({ "type": "text", "text": text })
            }
            UserContentBlock::Image { url, .. } => {
                serde_json::json!({ "type": "image_url", "image_url": { "url": url } })
            }
        })
        .collect();
    serde_json::json!({ "role": "user", "content": parts })
}

fn assistant_to_openai(a: &AssistantMessage, matrix: &CompatMatrix) -> Value {
    let mut obj = serde_json::json!({ "role": "assistant" });
    let mut text_parts: Vec<String> = Vec::new();
    let mut tool_calls: Vec<Value> = Vec::new();

    for block in &a.content {
        match block {
            AssistantContentBlock::Text { text, .. } => text_parts.push(text.clone()),
            AssistantContentBlock::Thinking { text, .. } => {
                // Most OpenAI-compat vendors don't accept a `thinking` field
                // on replay; providers that require it as text get it
                // inlined, others drop it (the model re-derives its own).
                if matrix.requires_thinking_as_text {
                    text_parts.push(format!("<thinking>{text}</thinking>"));
                }
            }
            AssistantContentBlock::ToolCall(call) => {
                tool_calls.push(tool_call_to_openai(call, matrix.tool_id_style));
            }
        }
    }

    obj["content"] = if text_parts.is_empty() {
        Value::Null
    } else {
        Value::String(text_parts.join(""))
    };
    if !tool_calls.is_empty() {
        obj["tool_calls"] = Value::Array(tool_calls);
    }
    obj
}

fn tool_call_to_openai(call: &ToolCall, style: ToolIdStyle) -> Value {
    serde_json::json!({
        "id": normalize_tool_id(style, &call.call_id),
        "type": "function",
        "function": { "name": call.name, "arguments": call.arguments },
    })
}

fn tool_result_to_openai(t: &ToolResultMessage, matrix: &CompatMatrix) -> Value {
    let text = t
        .content
        .iter()
        .filter_map(|b| match b {
            ToolResultContentBlock::Text { text } => Some(text.as_str()),
            ToolResultContentBlock::Image { .. } => None,
        })
        .collect::<Vec<_>>()
        .join("\n");

    let mut obj = serde_json::json!({
        "role": "tool",
        "tool_call_id": normalize_tool_id(matrix.tool_id_style, &t.call_id),
        "content": text,
    });
    if matrix.requires_tool_result_name {
        obj["name"] = Value::String(t.tool_name.clone());
    }
    obj
}

fn tool_to_openai(tool: &ToolDefinition) -> Value {
    serde_json::json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        }
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Response deserialization helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn stop_reason_from_openai(raw: Option<&str>, has_tool_calls: bool) -> StopReason {
    if has_tool_calls {
        return StopReason::ToolCalls;
    }
    match raw {
        Some("stop") => StopReason::Stop,
        Some("tool_calls") => StopReason::ToolCalls,
        Some("length") => StopReason::Length,
        Some("content_filter") => StopReason::ContentFilter,
        Some(_) => StopReason::Other,
        None => StopReason::Other,
    }
}

fn parse_chat_response(provider_id: &str, body: &Value) -> Result<ChatResponse> {
    let choice = body
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first())
        .ok_or_else(|| Error::Provider {
            provider: provider_id.to_string(),
            message: "no choices in response".into(),
        })?;

    let message = choice.get("message").ok_or_else(|| Error::Provider {
        provider: provider_id.to_string(),
        message: "no message in choice".into(),
    })?;

    let model = body
        .get("model")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();

    let mut assistant = AssistantMessage::new(provider_id, "completions", &model);

    if let Some(text) = message.get("content").and_then(|v| v.as_str()) {
        if !text.is_empty() {
            assistant.append_text(text);
        }
    }
    if let Some(reasoning) = message.get("reasoning_content").and_then(|v| v.as_str()) {
        if !reasoning.is_empty() {
            assistant.append_thinking(reasoning);
        }
    }
    for call in parse_openai_tool_calls(message) {
        assistant.push_tool_call(call);
    }

    let finish_reason = choice.get("finish_reason").and_then(|v| v.as_str());
    let stop_reason = stop_reason_from_openai(finish_reason, !assistant.tool_calls.is_empty());
    let usage = body.get("usage").and_then(parse_openai_usage);

    Ok(ChatResponse {
        message: assistant,
        usage,
        model,
        stop_reason,
        response_id: body.get("id").and_then(|v| v.as_str()).map(String::from),
    })
}

fn parse_openai_tool_calls(message: &Value) -> Vec<ToolCall> {
    let arr = match message.get("tool_calls").and_then(|v| v.as_array()) {
        Some(a) => a,
        None => return Vec::new(),
    };
    arr.iter()
        .filter_map(|tc| {
            let call_id = tc.get("id")?.as_str()?.to_string();
            let func = tc.get("function")?;
            let name = func.get("name")?.as_str()?.to_string();
            let arguments = func.get("arguments")?.as_str().unwrap_or("{}").to_string();
            Some(ToolCall { call_id, name, arguments, signature: None })
        })
        .collect()
}

fn parse_openai_usage(v: &Value) -> Option<Usage> {
    let input = v.get("prompt_tokens")?.as_u64()?;
    let output = v.get("completion_tokens")?.as_u64()?;
    let total = v.get("total_tokens").and_then(Value::as_u64).unwrap_or(input + output);
    let cache_read = v
        .get("prompt_tokens_details")
        .and_then(|d| d.get("cached_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    Some(Usage { input, output, cache_read, cache_write: 0, total })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SSE streaming helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-stream state tracking in-flight tool-call argument assembly, keyed by
/// the provider's own `index` field.
#[derive(Default)]
struct StreamState {
    tool_call_ids: std::collections::HashMap<usize, (String, String)>,
}

fn parse_sse_data_vec(state: &mut StreamState, data: &str) -> Vec<Result<StreamEvent>> {
    if data.trim() == "[DONE]" {
        return vec![Ok(StreamEvent::Done { usage: None, finish_reason: Some("stop".into()) })];
    }

    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => return vec![Err(Error::Json(e))],
    };

    let choice = v.get("choices").and_then(|c| c.as_array()).and_then(|a| a.first());

    if choice.is_none() {
        if let Some(usage) = v.get("usage").and_then(parse_openai_usage) {
            return vec![Ok(StreamEvent::Done { usage: Some(usage), finish_reason: None })];
        }
        return Vec::new();
    }
    let choice = choice.unwrap();
    let delta = choice.get("delta").unwrap_or(&Value::Null);
    let mut events = Vec::new();

    if let Some(tc_arr) = delta.get("tool_calls").and_then(|v| v.as_array()) {
        for tc in tc_arr {
            let index = tc.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
            if let Some(id) = tc.get("id").and_then(|v| v.as_str()) {
                let name = tc
                    .get("function")
                    .and_then(|f| f.get("name"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string();
                state.tool_call_ids.insert(index, (id.to_string(), name.clone()));
                events.push(Ok(StreamEvent::ToolCallStarted {
                    index,
                    call_id: id.to_string(),
                    name,
                }));
            }
            if let Some(args) = tc
                .get("function")
                .and_then(|f| f.get("arguments"))
                .and_then(|v| v.as_str())
            {
                events.push(Ok(StreamEvent::ToolCallDelta {
                    index,
                    arguments_fragment: args.to_string(),
                }));
            }
        }
    }

    if let Some(text) = delta.get("reasoning_content").and_then(|v| v.as_str()) {
        if !text.is_empty() {
            events.push(Ok(StreamEvent::Thinking { text: text.to_string() }));
        }
    }

    if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
        if !text.is_empty() {
            events.push(Ok(StreamEvent::Token { text: text.to_string() }));
        }
    }

    if let Some(fr) = choice.get("finish_reason").and_then(|f| f.as_str()) {
        let usage = v.get("usage").and_then(parse_openai_usage);
        let has_tool_calls = !state.tool_call_ids.is_empty();
        let stop = stop_reason_from_openai(Some(fr), has_tool_calls);
        events.push(Ok(StreamEvent::Done {
            usage,
            finish_reason: Some(format!("{stop:?}").to_lowercase()),
        }));
    }

    events
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl LlmProvider for OpenAiCompatProvider {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse> {
        let url = if self.is_azure {
            self.azure_chat_url(&self.effective_model(&req))
        } else {
            format!("{}/chat/completions", self.base_url)
        };
        let body = self.build_chat_body(&req, false);

        tracing::debug!(provider = %self.id, url = %url, "openai_compat chat request");

        let resp = self.authed_post(&url).json(&body).send().await.map_err(from_reqwest)?;

        let status = resp.status();
        let resp_text = resp.text().await.map_err(from_reqwest)?;

        if !status.is_success() {
            return Err(Error::Provider {
                provider: self.id.clone(),
                message: format!("HTTP {} - {}", status.as_u16(), resp_text),
            });
        }

        let resp_json: Value = serde_json::from_str(&resp_text)?;
        parse_chat_response(&self.id, &resp_json)
    }

    async fn chat_stream(
        &self,
        req: ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let url = if self.is_azure {
            self.azure_chat_url(&self.effective_model(&req))
        } else {
            format!("{}/chat/completions", self.base_url)
        };
        let body = self.build_chat_body(&req, true);
        let provider_id = self.id.clone();

        tracing::debug!(provider = %self.id, url = %url, "openai_compat stream request");

        let resp = self.authed_post(&url).json(&body).send().await.map_err(from_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            let err_text = resp.text().await.map_err(from_reqwest)?;
            return Err(Error::Provider {
                provider: provider_id,
                message: format!("HTTP {} - {}", status.as_u16(), err_text),
            });
        }

        let mut state = StreamState::default();
        Ok(crate::sse::sse_response_stream(resp, move |data| {
            parse_sse_data_vec(&mut state, data)
        }))
    }

    async fn embeddings(&self, req: EmbeddingsRequest) -> Result<EmbeddingsResponse> {
        let model = req.model.unwrap_or_else(|| "text-embedding-3-small".into());

        let url = if self.is_azure {
            format!(
                "{}/openai/deployments/{}/embeddings?api-version=2024-10-21",
                self.base_url, model
            )
        } else {
            format!("{}/embeddings", self.base_url)
        };

        let body = if self.is_azure {
            serde_json::json!({ "input": req.input })
        } else {
            serde_json::json!({ "model": model, "input": req.input })
        };

        let resp = self.authed_post(&url).json(&body).send().await.map_err(from_reqwest)?;

        let status = resp.status();
        let resp_text = resp.text().await.map_err(from_reqwest)?;

        if !status.is_success() {
            return Err(Error::Provider {
                provider: self.id.clone(),
                message: format!("HTTP {} - {}", status.as_u16(), resp_text),
            });
        }

        let resp_json: Value = serde_json::from_str(&resp_text)?;
        let data = resp_json
            .get("data")
            .and_then(|d| d.as_array())
            .ok_or_else(|| Error::Provider {
                provider: self.id.clone(),
                message: "missing 'data' array in embeddings response".into(),
            })?;

        let embeddings: Vec<Vec<f32>> = data
            .iter()
            .filter_map(|item| {
                let embedding = item.get("embedding")?.as_array()?;
                Some(embedding.iter().filter_map(|v| v.as_f64().map(|f| f as f32)).collect())
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

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compat_matrix_defaults_to_openai_shape() {
        let m = CompatMatrix::for_id("openai-main");
        assert_eq!(m.max_tokens_field, "max_completion_tokens");
        assert_eq!(m.tool_id_style, ToolIdStyle::Passthrough);
    }

    #[test]
    fn compat_matrix_minimax_requires_numeric_ids() {
        let m = CompatMatrix::for_id("minimax-text");
        assert_eq!(m.tool_id_style, ToolIdStyle::Numeric);
        assert!(m.requires_tool_result_name);
    }

    #[test]
    fn normalize_tool_id_numeric_strips_non_digits() {
        assert_eq!(normalize_tool_id(ToolIdStyle::Numeric, "call_42abc"), "42");
        assert_eq!(normalize_tool_id(ToolIdStyle::Numeric, "call_abc"), "0");
    }

    #[test]
    fn normalize_tool_id_mistral_pads_to_nine_chars() {
        assert_eq!(normalize_tool_id(ToolIdStyle::Mistral9, "ab"), "0000000ab");
        assert_eq!(normalize_tool_id(ToolIdStyle::Mistral9, "abcdefghij"), "abcdefghi");
    }

    #[test]
    fn normalize_tool_id_sanitized_caps_at_64() {
        let long = "x".repeat(100);
        assert_eq!(normalize_tool_id(ToolIdStyle::SanitizedCapped64, &long).len(), 64);
    }

    #[test]
    fn parse_chat_response_extracts_tool_calls() {
        let body = serde_json::json!({
            "id": "chatcmpl-1",
            "model": "gpt-4o",
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "function": { "name": "lookup", "arguments": "{\"q\":\"rust\"}" }
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": { "prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15 }
        });
        let resp = parse_chat_response("openai", &body).unwrap();
        assert_eq!(resp.stop_reason, StopReason::ToolCalls);
        assert_eq!(resp.message.tool_calls[0].name, "lookup");
        assert_eq!(resp.usage.unwrap().total, 15);
    }

    #[test]
    fn stop_reason_tool_calls_wins_over_finish_reason() {
        assert_eq!(stop_reason_from_openai(Some("stop"), true), StopReason::ToolCalls);
    }

    #[test]
    fn parse_sse_data_vec_handles_done_sentinel() {
        let mut state = StreamState::default();
        let events = parse_sse_data_vec(&mut state, "[DONE]");
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn parse_sse_data_vec_emits_text_token() {
        let mut state = StreamState::default();
        let data = serde_json::json!({
            "choices": [{ "delta": { "content": "hi" } }]
        })
        .to_string();
        let events = parse_sse_data_vec(&mut state, &data);
        match events.into_iter().next().unwrap().unwrap() {
            StreamEvent::Token { text } => assert_eq!(text, "hi"),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
