//! Tool-call loop middleware (§4.I): fans out pending tool calls, waits,
//! re-injects results, and loops back into the inner handler.

use std::sync::Arc;

use sa_domain::agent_state::AgentState;
use sa_domain::error::Result;
use sa_domain::event::{Event, EventSink};
use sa_domain::message::Message;
use sa_domain::tool::{invoke_tool_call, ToolRegistry};

use crate::abort::AbortFlag;

/// Guards against a misbehaving model that never stops requesting tools;
/// hitting the bound ends the turn with an `other` stop reason instead of
/// looping forever.
pub const MAX_TOOL_LOOPS: usize = 50;

/// Run the tool-call loop (§4.I) around `inner`, which performs one
/// assistant turn (channel/steer/compaction/streaming stages, §4.H.7-10) and
/// returns the updated state.
///
/// `inner` is invoked once per loop iteration with the current turn input
/// (the original input on the first call, the collected tool results on
/// every call after).
pub async fn run_tool_call_loop<F, Fut>(
    registry: Arc<ToolRegistry>,
    sink: Arc<dyn EventSink>,
    abort: &AbortFlag,
    max_loops: usize,
    mut state: AgentState,
    mut turn_input: Vec<Message>,
    mut inner: F,
) -> Result<AgentState>
where
    F: FnMut(AgentState, Vec<Message>) -> Fut,
    Fut: std::future::Future<Output = Result<AgentState>>,
{
    for _ in 0..max_loops {
        abort.check()?;
        let turn_id = uuid::Uuid::new_v4().to_string();
        sink.on_event(Event::TurnStart { turn_id: turn_id.clone() });

        state = inner(state, turn_input).await?;

        if state.pending_tool_calls.is_empty() {
            sink.on_event(Event::TurnEnd {
                turn_id,
                last_assistant_message: state.last_assistant_message().cloned(),
                error: None,
            });
            return Ok(state);
        }

        // Dispatch every pending call concurrently on its own task; collect
        // results in call order so the next turn sees them in the order the
        // assistant requested them, not completion order.
        let calls = std::mem::take(&mut state.pending_tool_calls);
        let handles: Vec<_> = calls
            .into_iter()
            .map(|call| {
                let registry = registry.clone();
                let sink = sink.clone();
                tokio::spawn(async move { invoke_tool_call(&registry, &call, sink.as_ref()).await })
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            abort.check()?;
            match handle.await {
                Ok(msg) => results.push(msg),
                Err(e) => {
                    tracing::error!(error = %e, "tool task panicked");
                }
            }
        }

        sink.on_event(Event::TurnEnd {
            turn_id,
            last_assistant_message: state.last_assistant_message().cloned(),
            error: None,
        });

        turn_input = results;
    }

    state.most_recent_stop_reason = Some(sa_domain::stream::StopReason::Other);
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sa_domain::event::NullSink;
    use sa_domain::message::{AssistantMessage, ToolCall};
    use sa_domain::tool::{Tool, ToolDefinition};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn echo_registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(Tool::new(
            ToolDefinition {
                name: "echo".into(),
                description: "echoes text".into(),
                strict_schema: true,
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": { "text": { "type": "string" } },
                    "required": ["text"],
                }),
            },
            |args| Box::pin(async move { Ok(args["text"].as_str().unwrap_or_default().to_string()) }),
        ));
        registry
    }

    #[tokio::test]
    async fn empty_pending_calls_ends_after_one_invocation() {
        let registry = echo_registry();
        let abort = AbortFlag::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let result = run_tool_call_loop(
            Arc::new(registry),
            Arc::new(NullSink),
            &abort,
            MAX_TOOL_LOOPS,
            AgentState::new(),
            vec![Message::user_text("hi")],
            move |state, _input| {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                async move { Ok(state) }
            },
        )
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(result.pending_tool_calls.is_empty());
    }

    #[tokio::test]
    async fn single_tool_cycle_invokes_inner_twice_with_ordered_results() {
        let registry = echo_registry();
        let abort = AbortFlag::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();

        let result = run_tool_call_loop(
            Arc::new(registry),
            Arc::new(NullSink),
            &abort,
            MAX_TOOL_LOOPS,
            AgentState::new(),
            vec![Message::user_text("hi")],
            move |mut state, _input| {
                let n = calls_clone.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        let mut msg = AssistantMessage::new("anthropic", "messages", "claude");
                        msg.push_tool_call(ToolCall {
                            call_id: "c1".into(),
                            name: "echo".into(),
                            arguments: r#"{"text":"hi"}"#.into(),
                            signature: None,
                        });
                        state.pending_tool_calls = msg.tool_calls.clone();
                        state.push(Message::Assistant(msg));
                    }
                    Ok(state)
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(result.pending_tool_calls.is_empty());
    }

    #[tokio::test]
    async fn abort_between_tool_waits_raises_abort_evaluation() {
        let registry = echo_registry();
        let abort = AbortFlag::new();
        abort.set();

        let result = run_tool_call_loop(
            Arc::new(registry),
            Arc::new(NullSink),
            &abort,
            MAX_TOOL_LOOPS,
            AgentState::new(),
            vec![Message::user_text("hi")],
            |state, _input| async move { Ok(state) },
        )
        .await;

        assert!(result.unwrap_err().is_abort());
    }
}
