//! An `EventSink` that renders the event taxonomy (§4.C, §6) to stdout as
//! the evaluation runs, the way a terminal chat client would.

use std::io::Write;

use sa_domain::event::{Event, EventRole, EventSink, UpdateKind};

/// Streams assistant text/reasoning deltas to stdout as they arrive and
/// logs every other lifecycle event at `debug` via `tracing`.
pub struct StdoutSink;

impl EventSink for StdoutSink {
    fn on_event(&self, event: Event) {
        match event {
            Event::MessageUpdate { role: EventRole::Assistant, kind: UpdateKind::Text, delta, .. } => {
                print!("{delta}");
                let _ = std::io::stdout().flush();
            }
            Event::MessageEnd { role: EventRole::Assistant, .. } => {
                println!();
            }
            Event::ToolCallRequest { pending } => {
                tracing::info!(tool = %pending.name, call_id = %pending.call_id, "tool call requested");
            }
            Event::ToolExecutionEnd { pending, duration_ms, .. } => {
                tracing::info!(tool = %pending.name, duration_ms, "tool call finished");
            }
            Event::AgentError { error } => {
                tracing::error!(%error, "agent error");
            }
            other => {
                tracing::debug!(?other, "event");
            }
        }
    }
}
