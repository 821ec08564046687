//! Tool Registry & Invoker (§4.B): declaration, JSON-argument coercion, and
//! parallel-safe invocation of model-requested tools.
//!
//! Concrete tool *bodies* (filesystem, shell, web) are out of scope for this
//! crate; a `Tool` here wraps any `async fn(Value) -> Result<String, String>`
//! shaped closure, including ones a host process backs with the existing
//! process-session machinery in `sa-tools`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Instant;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::event::{Event, EventSink};
use crate::message::{Message, ToolCall};

pub type ToolFuture = Pin<Box<dyn Future<Output = std::result::Result<String, String>> + Send>>;

/// A tool declaration exposed to the LLM (§4.A schema renderer input).
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub strict_schema: bool,
    /// JSON-schema-shaped parameter description, e.g.
    /// `{"type":"object","properties":{...},"required":[...]}`.
    pub parameters: Value,
}

/// A registered tool: its declaration plus the function that runs it.
pub struct Tool {
    pub definition: ToolDefinition,
    body: Box<dyn Fn(Value) -> ToolFuture + Send + Sync>,
}

impl Tool {
    pub fn new<F>(definition: ToolDefinition, body: F) -> Self
    where
        F: Fn(Value) -> ToolFuture + Send + Sync + 'static,
    {
        Self {
            definition,
            body: Box::new(body),
        }
    }

    pub fn invoke(&self, args: Value) -> ToolFuture {
        (self.body)(args)
    }
}

/// Owned list of tools registered on an agent. Lookup is by exact name.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Tool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Tool) {
        self.tools.insert(tool.definition.name.clone(), tool);
    }

    pub fn get(&self, name: &str) -> Option<&Tool> {
        self.tools.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn definitions(&self) -> Vec<&ToolDefinition> {
        self.tools.values().map(|t| &t.definition).collect()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Argument parsing / coercion (§4.B)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Parse `raw_arguments` as JSON, require an object, and coerce each
/// declared parameter per the schema's rules:
/// - scalar types convert directly;
/// - a nullable/optional parameter accepts a missing key or JSON `null`;
/// - a `oneOf`/`anyOf` union accepts the first variant whose conversion
///   succeeds, trying non-null variants before null;
/// - any other type (object/array) passes through unchanged.
///
/// A missing non-nullable key, or a non-object top level, is a parse
/// failure.
pub fn parse_tool_arguments(schema: &Value, raw_arguments: &str) -> Result<Value> {
    let parsed: Value = serde_json::from_str(raw_arguments).map_err(|e| {
        Error::ToolArgParse(format!("invalid JSON: {e}"))
    })?;

    let obj = parsed
        .as_object()
        .ok_or_else(|| Error::ToolArgParse("arguments must be a JSON object".into()))?;

    let properties = schema.get("properties").and_then(Value::as_object);
    let required: Vec<&str> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    let mut out = serde_json::Map::new();
    if let Some(properties) = properties {
        for (key, prop_schema) in properties {
            let is_required = required.contains(&key.as_str());
            match obj.get(key) {
                Some(value) => {
                    out.insert(key.clone(), coerce_value(prop_schema, value)?);
                }
                None => {
                    if is_required && !accepts_null(prop_schema) {
                        return Err(Error::ToolArgParse(format!("missing required key: {key}")));
                    }
                    out.insert(key.clone(), Value::Null);
                }
            }
        }
    } else {
        // No declared schema: pass the object through unchanged.
        return Ok(parsed);
    }

    Ok(Value::Object(out))
}

fn accepts_null(schema: &Value) -> bool {
    if let Some(t) = schema.get("type") {
        if let Some(arr) = t.as_array() {
            return arr.iter().any(|v| v.as_str() == Some("null"));
        }
        return t.as_str() == Some("null");
    }
    schema.get("oneOf").or_else(|| schema.get("anyOf")).map(|variants| {
        variants
            .as_array()
            .map(|a| a.iter().any(accepts_null))
            .unwrap_or(false)
    }).unwrap_or(false)
}

fn coerce_value(schema: &Value, value: &Value) -> Result<Value> {
    if value.is_null() {
        return Ok(Value::Null);
    }

    if let Some(variants) = schema.get("oneOf").or_else(|| schema.get("anyOf")).and_then(Value::as_array) {
        // Try non-null variants first, then null variants.
        let (non_null, nullish): (Vec<&Value>, Vec<&Value>) =
            variants.iter().partition(|v| !matches!(v.get("type").and_then(Value::as_str), Some("null")));
        for variant in non_null.into_iter().chain(nullish) {
            if let Ok(coerced) = coerce_value(variant, value) {
                return Ok(coerced);
            }
        }
        return Err(Error::ToolArgParse("no union variant matched".into()));
    }

    match schema.get("type").and_then(Value::as_str) {
        Some("string") => value
            .as_str()
            .map(|s| Value::String(s.to_string()))
            .ok_or_else(|| Error::ToolArgParse("expected string".into())),
        Some("number") => value
            .as_f64()
            .map(|_| value.clone())
            .ok_or_else(|| Error::ToolArgParse("expected number".into())),
        Some("integer") => value
            .as_i64()
            .map(|_| value.clone())
            .ok_or_else(|| Error::ToolArgParse("expected integer".into())),
        Some("boolean") => value
            .as_bool()
            .map(Value::Bool)
            .ok_or_else(|| Error::ToolArgParse("expected boolean".into())),
        // object / array / unspecified: pass through unchanged.
        _ => Ok(value.clone()),
    }
}

/// Truncate `raw` to at most 500 chars for error messages, at a char
/// boundary.
fn truncate_raw(raw: &str) -> &str {
    if raw.len() <= 500 {
        return raw;
    }
    let mut end = 500;
    while end > 0 && !raw.is_char_boundary(end) {
        end -= 1;
    }
    &raw[..end]
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Invocation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Run a single pending tool call to completion, firing
/// `ToolExecutionStart`/`ToolExecutionEnd` and producing a `ToolResultMessage`.
/// Argument-parse failures and tool-body errors both become an error result
/// rather than propagating -- only a missing tool name is structural.
pub async fn invoke_tool_call(
    registry: &ToolRegistry,
    call: &ToolCall,
    sink: &dyn EventSink,
) -> Message {
    sink.on_event(Event::ToolExecutionStart { pending: call.clone() });
    let started = Instant::now();

    let result_text = match registry.get(&call.name) {
        None => format!("Unknown tool: {}", call.name),
        Some(tool) => match parse_tool_arguments(&tool.definition.parameters, &call.arguments) {
            Ok(args) => match tool.invoke(args).await {
                Ok(text) => text,
                Err(e) => e,
            },
            Err(e) => format!(
                "Failed to parse tool arguments: {e}\nRaw arguments: {}",
                truncate_raw(&call.arguments)
            ),
        },
    };

    let is_error = matches!(registry.get(&call.name), None)
        || result_text.starts_with("Failed to parse tool arguments:");
    let duration_ms = started.elapsed().as_millis() as u64;

    sink.on_event(Event::ToolExecutionEnd {
        pending: call.clone(),
        result: result_text.clone(),
        duration_ms,
    });

    Message::tool_result(call.call_id.clone(), call.name.clone(), result_text, is_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::NullSink;

    fn echo_schema() -> Value {
        serde_json::json!({
            "type": "object",
            "properties": { "text": { "type": "string" } },
            "required": ["text"],
        })
    }

    #[test]
    fn parse_tool_arguments_accepts_valid_object() {
        let parsed = parse_tool_arguments(&echo_schema(), r#"{"text":"hi"}"#).unwrap();
        assert_eq!(parsed["text"], "hi");
    }

    #[test]
    fn parse_tool_arguments_rejects_non_object() {
        let err = parse_tool_arguments(&echo_schema(), r#""just a string""#).unwrap_err();
        assert!(matches!(err, Error::ToolArgParse(_)));
    }

    #[test]
    fn parse_tool_arguments_rejects_missing_required_key() {
        let err = parse_tool_arguments(&echo_schema(), r#"{}"#).unwrap_err();
        assert!(matches!(err, Error::ToolArgParse(_)));
    }

    #[test]
    fn parse_tool_arguments_allows_missing_optional_key() {
        let schema = serde_json::json!({
            "type": "object",
            "properties": { "text": { "type": "string" }, "flag": { "type": ["boolean", "null"] } },
            "required": ["text"],
        });
        let parsed = parse_tool_arguments(&schema, r#"{"text":"hi"}"#).unwrap();
        assert_eq!(parsed["flag"], Value::Null);
    }

    #[test]
    fn coerce_union_tries_non_null_variant_first() {
        let schema = serde_json::json!({
            "oneOf": [{"type": "string"}, {"type": "null"}],
        });
        let coerced = coerce_value(&schema, &serde_json::json!("x")).unwrap();
        assert_eq!(coerced, "x");
    }

    #[tokio::test]
    async fn invoke_tool_call_produces_error_result_on_bad_json() {
        let registry = ToolRegistry::new();
        let call = ToolCall {
            call_id: "c1".into(),
            name: "missing_tool".into(),
            arguments: "{}".into(),
            signature: None,
        };
        let msg = invoke_tool_call(&registry, &call, &NullSink).await;
        let tr = msg.as_tool_result().unwrap();
        assert!(tr.is_error);
        assert!(tr.text().contains("Unknown tool"));
    }

    #[tokio::test]
    async fn invoke_tool_call_reports_parse_failure_as_error_result() {
        let mut registry = ToolRegistry::new();
        registry.register(Tool::new(
            ToolDefinition {
                name: "echo".into(),
                description: "echoes text".into(),
                strict_schema: true,
                parameters: echo_schema(),
            },
            |args| Box::pin(async move { Ok(args["text"].as_str().unwrap_or_default().to_string()) }),
        ));
        let call = ToolCall {
            call_id: "c1".into(),
            name: "echo".into(),
            arguments: "not json".into(),
            signature: None,
        };
        let msg = invoke_tool_call(&registry, &call, &NullSink).await;
        let tr = msg.as_tool_result().unwrap();
        assert!(tr.is_error);
        assert!(tr.text().starts_with("Failed to parse tool arguments:"));
    }

    #[tokio::test]
    async fn invoke_tool_call_returns_success_result() {
        let mut registry = ToolRegistry::new();
        registry.register(Tool::new(
            ToolDefinition {
                name: "echo".into(),
                description: "echoes text".into(),
                strict_schema: true,
                parameters: echo_schema(),
            },
            |args| Box::pin(async move { Ok(args["text"].as_str().unwrap_or_default().to_string()) }),
        ));
        let call = ToolCall {
            call_id: "c1".into(),
            name: "echo".into(),
            arguments: r#"{"text":"hi"}"#.into(),
            signature: None,
        };
        let msg = invoke_tool_call(&registry, &call, &NullSink).await;
        let tr = msg.as_tool_result().unwrap();
        assert!(!tr.is_error);
        assert_eq!(tr.text(), "hi");
    }
}
