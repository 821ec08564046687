//! Google "Gemini CLI" adapter.
//!
//! Targets the internal `/v1internal:streamGenerateContent` endpoint used by
//! the Gemini Code Assist CLI, authenticated via OAuth bearer token rather
//! than an API key. The project id comes from the OAuth credential JSON
//! rather than request config.

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
use serde::Deserialize;
use serde_json::Value;
use std::sync::RwLock;

/// The subset of the OAuth credential JSON we need: the access token and the
/// GCP project id the CLI was authorized against.
#[derive(Debug, Clone, Deserialize)]
struct CliCredential {
    access_token: String,
    #[serde(default)]
    project_id: Option<String>,
}

fn load_credential(path: &std::path::Path) -> Result<CliCredential> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| Error::Auth(format!("failed to read gemini-cli credential at {}: {e}", path.display())))?;
    serde_json::from_str(&raw).map_err(|e| Error::Auth(format!("malformed gemini-cli credential: {e}")))
}

pub struct GoogleGeminiCliProvider {
    id: String,
    base_url: String,
    credential_path: std::path::PathBuf,
    project_id_override: Option<String>,
    default_model: String,
    capabilities: LlmCapabilities,
    client: reqwest::Client,
    cached: RwLock<Option<CliCredential>>,
}

impl GoogleGeminiCliProvider {
    pub fn from_config(cfg: &ProviderConfig) -> Result<Self> {
        let credential_path = cfg
            .auth
            .account
            .as_ref()
            .map(std::path::PathBuf::from)
            .unwrap_or_else(|| {
                dirs_credential_path()
            });
        let default_model = cfg.default_model.clone().unwrap_or_else(|| "gemini-2.5-pro".into());

        let capabilities = LlmCapabilities {
            supports_tools: sa_domain::capability::ToolSupport::Basic,
            supports_streaming: true,
            supports_json_mode: false,
            supports_vision: true,
            context_window_tokens: Some(1_000_000),
            max_output_tokens: Some(8_192),
        };

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(from_reqwest)?;

        Ok(Self {
            id: cfg.id.clone(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            credential_path,
            project_id_override: cfg.auth.service.clone(),
            default_model,
            capabilities,
            client,
            cached: RwLock::new(None),
        })
    }

    fn credential(&self) -> Result<CliCredential> {
        if let Some(c) = self.cached.read().unwrap().clone() {
            return Ok(c);
        }
        let c = load_credential(&self.credential_path)?;
        *self.cached.write().unwrap() = Some(c.clone());
        Ok(c)
    }

    fn project_id(&self, cred: &CliCredential) -> Result<String> {
        self.project_id_override
            .clone()
            .or_else(|| cred.project_id.clone())
            .ok_or_else(|| Error::MissingProject("gemini-cli credential has no project_id and none was configured".into()))
    }

    fn stream_url(&self) -> String {
        format!("{}/v1internal:streamGenerateContent?alt=sse", self.base_url)
    }

    fn generate_url(&self) -> String {
        format!("{}/v1internal:generateContent", self.base_url)
    }

    fn build_body(&self, req: &ChatRequest, model: &str, project_id: &str) -> Value {
        let contents: Vec<Value> = req.messages.iter().map(message_to_gemini_content).collect();

        let mut request = serde_json::json!({ "contents": contents });
        if !req.tools.is_empty() {
            let fns: Vec<Value> = req.tools.iter().map(tool_to_gemini).collect();
            request["tools"] = serde_json::json!([{ "functionDeclarations": fns }]);
        }
        let mut gen_config = serde_json::json!({});
        if let Some(temp) = req.temperature {
            gen_config["temperature"] = serde_json::json!(temp);
        }
        if let Some(max) = req.max_tokens {
            gen_config["maxOutputTokens"] = serde_json::json!(max);
        }
        if gen_config.as_object().is_some_and(|o| !o.is_empty()) {
            request["generationConfig"] = gen_config;
        }

        serde_json::json!({
            "model": model,
            "project": project_id,
            "request": request,
        })
    }
}

fn dirs_credential_path() -> std::path::PathBuf {
    std::env::var("HOME")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| std::path::PathBuf::from("."))
        .join(".gemini")
        .join("oauth_creds.json")
}

fn message_to_gemini_content(msg: &Message) -> Value {
    match msg {
        Message::User(u) => {
            let parts: Vec<Value> = u
                .content
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
        Message::Assistant(a) => assistant_to_gemini(a),
        Message::ToolResult(t) => tool_result_to_gemini(t),
        Message::CompactionSummary(c) => serde_json::json!({
            "role": "user",
            "parts": [{"text": format!("[Conversation summary]\n{}", c.text)}],
        }),
    }
}

fn assistant_to_gemini(a: &AssistantMessage) -> Value {
    let mut parts: Vec<Value> = Vec::new();
    for block in &a.content {
        match block {
            AssistantContentBlock::Text { text, .. } => parts.push(serde_json::json!({"text": text})),
            AssistantContentBlock::Thinking { text, signature } => {
                // Gemini-3 gates multimodal thought replay behind a valid
                // signature; fall back to plain text when absent so the
                // turn still round-trips instead of being silently dropped.
                if signature.is_some() {
                    let mut part = serde_json::json!({"text": text, "thought": true});
                    part["thoughtSignature"] = serde_json::json!(signature);
                    parts.push(part);
                } else {
                    parts.push(serde_json::json!({"text": text}));
                }
            }
            AssistantContentBlock::ToolCall(call) => {
                let args: Value = serde_json::from_str(&call.arguments).unwrap_or(Value::Null);
                parts.push(serde_json::json!({"functionCall": {"name": call.name, "args": args}}));
            }
        }
    }
    serde_json::json!({ "role": "model", "parts": parts })
}

fn tool_result_to_gemini(t: &ToolResultMessage) -> Value {
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
        "role": "user",
        "parts": [{"functionResponse": {"name": t.tool_name, "response": {"content": text}}}],
    })
}

fn tool_to_gemini(tool: &ToolDefinition) -> Value {
    serde_json::json!({ "name": tool.name, "description": tool.description, "parameters": tool.parameters })
}

fn stop_reason_from_gemini(raw: Option<&str>, has_tool_calls: bool) -> StopReason {
    if has_tool_calls {
        return StopReason::ToolCalls;
    }
    match raw {
        Some("STOP") => StopReason::Stop,
        Some("MAX_TOKENS") => StopReason::Length,
        Some("SAFETY") => StopReason::Safety,
        Some(_) => StopReason::Other,
        None => StopReason::Other,
    }
}

fn parse_usage(v: &Value) -> Option<Usage> {
    let input = v.get("promptTokenCount")?.as_u64()?;
    let output = v.get("candidatesTokenCount").and_then(Value::as_u64).unwrap_or(0);
    let total = v.get("totalTokenCount").and_then(Value::as_u64).unwrap_or(input + output);
    Some(Usage { input, output, cache_read: 0, cache_write: 0, total })
}

fn unwrap_response_envelope(body: &Value) -> &Value {
    body.get("response").unwrap_or(body)
}

fn parse_response(provider_id: &str, model: &str, body: &Value) -> Result<ChatResponse> {
    let inner = unwrap_response_envelope(body);
    let candidate = inner
        .get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first())
        .ok_or_else(|| Error::Provider { provider: provider_id.to_string(), message: "no candidates in response".into() })?;

    let mut assistant = AssistantMessage::new(provider_id, "gemini-cli", model);

    if let Some(parts) = candidate.get("content").and_then(|c| c.get("parts")).and_then(|p| p.as_array()) {
        for part in parts {
            let is_thought = part.get("thought").and_then(Value::as_bool).unwrap_or(false);
            if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
                if is_thought {
                    assistant.append_thinking(text);
                } else {
                    assistant.append_text(text);
                }
            }
            if let Some(fc) = part.get("functionCall") {
                let name = fc.get("name").and_then(|v| v.as_str()).unwrap_or("").to_string();
                let arguments = fc.get("args").cloned().unwrap_or(Value::Object(Default::default())).to_string();
                let call_id = format!("call_{}", uuid::Uuid::new_v4());
                assistant.push_tool_call(ToolCall { call_id, name, arguments, signature: None });
            }
        }
    }

    let finish_reason = candidate.get("finishReason").and_then(|v| v.as_str());
    let stop_reason = stop_reason_from_gemini(finish_reason, !assistant.tool_calls.is_empty());
    let usage = inner.get("usageMetadata").and_then(parse_usage);

    Ok(ChatResponse { message: assistant, usage, model: model.to_string(), stop_reason, response_id: None })
}

#[derive(Default)]
struct StreamState {
    saw_tool_call: bool,
}

fn parse_sse_data(state: &mut StreamState, data: &str) -> Vec<Result<StreamEvent>> {
    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => return vec![Err(Error::Json(e))],
    };
    let inner = unwrap_response_envelope(&v);

    let candidate = match inner.get("candidates").and_then(|c| c.as_array()).and_then(|a| a.first()) {
        Some(c) => c,
        None => return Vec::new(),
    };

    let mut events = Vec::new();
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
                state.saw_tool_call = true;
                let name = fc.get("name").and_then(|v| v.as_str()).unwrap_or("").to_string();
                let arguments = fc.get("args").cloned().unwrap_or(Value::Object(Default::default())).to_string();
                let call_id = format!("call_{}", uuid::Uuid::new_v4());
                events.push(Ok(StreamEvent::ToolCallStarted { index: 0, call_id: call_id.clone(), name: name.clone() }));
                events.push(Ok(StreamEvent::ToolCallFinished { index: 0, call_id, name, arguments, signature: None }));
            }
        }
    }

    if let Some(fr) = candidate.get("finishReason").and_then(|v| v.as_str()) {
        let stop = stop_reason_from_gemini(Some(fr), state.saw_tool_call);
        let usage = inner.get("usageMetadata").and_then(parse_usage);
        events.push(Ok(StreamEvent::Done { usage, finish_reason: Some(format!("{stop:?}").to_lowercase()) }));
    }

    events
}

#[async_trait::async_trait]
impl LlmProvider for GoogleGeminiCliProvider {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse> {
        let cred = self.credential()?;
        let project_id = self.project_id(&cred)?;
        let model = req.model.clone().unwrap_or_else(|| self.default_model.clone());
        let body = self.build_body(&req, &model, &project_id);
        let url = self.generate_url();

        tracing::debug!(provider = %self.id, url = %url, "gemini-cli chat request");

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&cred.access_token)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(from_reqwest)?;

        let status = resp.status();
        let resp_text = resp.text().await.map_err(from_reqwest)?;
        if !status.is_success() {
            return Err(Error::Provider { provider: self.id.clone(), message: format!("HTTP {} - {}", status.as_u16(), resp_text) });
        }

        let resp_json: Value = serde_json::from_str(&resp_text)?;
        parse_response(&self.id, &model, &resp_json)
    }

    async fn chat_stream(&self, req: ChatRequest) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let cred = self.credential()?;
        let project_id = self.project_id(&cred)?;
        let model = req.model.clone().unwrap_or_else(|| self.default_model.clone());
        let body = self.build_body(&req, &model, &project_id);
        let url = self.stream_url();
        let provider_id = self.id.clone();

        tracing::debug!(provider = %self.id, url = %url, "gemini-cli stream request");

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&cred.access_token)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(from_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            let err_text = resp.text().await.map_err(from_reqwest)?;
            return Err(Error::Provider { provider: provider_id, message: format!("HTTP {} - {}", status.as_u16(), err_text) });
        }

        let mut state = StreamState::default();
        Ok(crate::sse::sse_response_stream(resp, move |data| parse_sse_data(&mut state, data)))
    }

    async fn embeddings(&self, _req: EmbeddingsRequest) -> Result<EmbeddingsResponse> {
        Err(Error::Unsupported("gemini-cli does not expose an embeddings endpoint".into()))
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
    fn parse_response_unwraps_response_envelope() {
        let body = serde_json::json!({
            "response": {
                "candidates": [{
                    "content": {"parts": [{"text": "hello"}]},
                    "finishReason": "STOP"
                }],
                "usageMetadata": {"promptTokenCount": 3, "candidatesTokenCount": 1, "totalTokenCount": 4}
            }
        });
        let resp = parse_response("gemini-cli", "gemini-2.5-pro", &body).unwrap();
        assert_eq!(resp.message.message_text(), "hello");
        assert_eq!(resp.usage.unwrap().total, 4);
    }

    #[test]
    fn assistant_to_gemini_falls_back_to_text_without_signature() {
        let mut a = AssistantMessage::new("gemini-cli", "gemini-cli", "gemini-2.5-pro");
        a.append_thinking("reasoning without signature");
        let v = assistant_to_gemini(&a);
        let part = &v["parts"][0];
        assert!(part.get("thought").is_none());
        assert_eq!(part["text"], "reasoning without signature");
    }

    #[test]
    fn stop_reason_tool_calls_wins() {
        assert_eq!(stop_reason_from_gemini(Some("STOP"), true), StopReason::ToolCalls);
    }
}
