//! The middleware chain interpreter (§4.H): ten named stages run in a fixed
//! order by `Evaluator::evaluate`, rather than nine-deep nested closures, so
//! cancellation and per-stage tracing stay uniform.

use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::mpsc;

use sa_domain::agent_state::AgentState;
use sa_domain::channel::Channel;
use sa_domain::error::{Error, Result};
use sa_domain::event::{Event, EventSink};
use sa_domain::message::Message;
use sa_domain::session::SessionStore;

use sa_providers::router::LlmRouter;

use crate::abort::AbortFlag;
use crate::agent::Agent;
use crate::channel_stage::{with_channel_close, ChannelSink};
use crate::compaction;
use crate::guardrail::{Guardrail, GuardrailGatedSink, GuardrailGate};
use crate::session_stage::run_session;
use crate::streaming::{self, ChatDefaults, StreamingContext};

pub const STAGE_ORDER: &[&str] = &[
    "queue",
    "evaluate",
    "skills",
    "input_guardrail",
    "session",
    "tool_call",
    "channel",
    "steer",
    "compaction",
    "streaming",
];

/// Drives one `Agent` through the full middleware chain (§4.H) for a given
/// session. Owns the queue/steer side channels a caller pushes onto while an
/// `evaluate` call is in flight.
pub struct Evaluator {
    pub agent: Arc<Agent>,
    pub router: Arc<LlmRouter>,
    pub store: Arc<dyn SessionStore>,
    pub channel: Option<Arc<dyn Channel>>,

    queue_tx: mpsc::UnboundedSender<Vec<Message>>,
    queue_rx: SyncMutex<mpsc::UnboundedReceiver<Vec<Message>>>,
    steer_tx: mpsc::UnboundedSender<Vec<Message>>,
    steer_rx: SyncMutex<mpsc::UnboundedReceiver<Vec<Message>>>,
}

impl Evaluator {
    pub fn new(
        agent: Arc<Agent>,
        router: Arc<LlmRouter>,
        store: Arc<dyn SessionStore>,
        channel: Option<Arc<dyn Channel>>,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (steer_tx, steer_rx) = mpsc::unbounded_channel();
        Self {
            agent,
            router,
            store,
            channel,
            queue_tx,
            queue_rx: SyncMutex::new(queue_rx),
            steer_tx,
            steer_rx: SyncMutex::new(steer_rx),
        }
    }

    /// Enqueue a turn-input to be picked up by the **queue** stage (§4.H.1)
    /// once the current evaluation's inner handler returns.
    pub fn queue_input(&self, input: Vec<Message>) {
        let _ = self.queue_tx.send(input);
    }

    /// Enqueue a turn-input to be picked up by the **steer** stage (§4.H.8)
    /// before the next tool-loop iteration's LLM call.
    pub fn steer_input(&self, input: Vec<Message>) {
        let _ = self.steer_tx.send(input);
    }

    /// Run the full chain once for `input` (§4.H.1's outermost "queue"
    /// stage): runs the evaluate stage, then drains any turn-inputs queued
    /// while it ran, running the evaluate stage again for each in turn.
    pub async fn evaluate(
        &self,
        sink: Arc<dyn EventSink>,
        abort: AbortFlag,
        session_id: String,
        input: Vec<Message>,
    ) -> Result<AgentState> {
        let mut state = self.run_evaluate_span(sink.clone(), &abort, &session_id, input).await?;

        loop {
            let queued = self.queue_rx.lock().try_recv().ok();
            let Some(queued) = queued else { break };
            state = self
                .run_evaluate_span(sink.clone(), &abort, &session_id, queued)
                .await?;
        }

        Ok(state)
    }

    /// Stage 2: **evaluate** (§4.H.2) — evaluation id + lifecycle events,
    /// with `AbortEvaluation` swallowed at this boundary.
    async fn run_evaluate_span(
        &self,
        sink: Arc<dyn EventSink>,
        abort: &AbortFlag,
        session_id: &str,
        input: Vec<Message>,
    ) -> Result<AgentState> {
        let evaluation_id = uuid::Uuid::new_v4().to_string();
        sink.on_event(Event::AgentEvaluateStart { evaluation_id: evaluation_id.clone() });

        let result = self.run_guardrail_stage(sink.clone(), abort, session_id, input).await;

        let state = match result {
            Ok(state) => state,
            Err(e) if e.is_abort() => {
                tracing::info!(%evaluation_id, "evaluation aborted, returning last known state");
                AgentState::with_session_id(session_id)
            }
            Err(e) => return Err(e),
        };

        sink.on_event(Event::AgentEvaluateEnd {
            evaluation_id,
            state: state.clone(),
        });
        Ok(state)
    }

    /// Stage 4: **input_guardrail** (§4.H.4).
    async fn run_guardrail_stage(
        &self,
        sink: Arc<dyn EventSink>,
        abort: &AbortFlag,
        session_id: &str,
        input: Vec<Message>,
    ) -> Result<AgentState> {
        let Some(guardrail) = self.agent.guardrail.clone() else {
            return self.run_session_stage(sink, abort, session_id, input).await;
        };

        let gate = GuardrailGate::new();
        let gated_sink: Arc<dyn EventSink> = Arc::new(GuardrailGatedSink::new(sink, gate.clone()));

        let text = Guardrail::input_text(&input).unwrap_or_default();
        let system_prompt = self.agent.effective_system_prompt();
        let router = self.router.clone();
        let gate_for_task = gate.clone();
        tokio::spawn(async move {
            let valid = guardrail.check(&router, &system_prompt, &text).await;
            gate_for_task.resolve(valid);
        });

        let result = self
            .run_session_stage(gated_sink, abort, session_id, input)
            .await;

        // Gate may not have resolved while events were still flowing; block
        // for the final, authoritative verdict before trusting the result.
        let valid = tokio::task::block_in_place(|| gate.wait());

        match result {
            Ok(state) if valid => Ok(state),
            Ok(_) => Err(Error::InvalidInput("guardrail rejected input".into())),
            Err(e) => Err(e),
        }
    }

    /// Stage 5: **session** (§4.H.5).
    async fn run_session_stage(
        &self,
        sink: Arc<dyn EventSink>,
        abort: &AbortFlag,
        session_id: &str,
        input: Vec<Message>,
    ) -> Result<AgentState> {
        let store = self.store.clone();
        let channel = self.channel.clone();
        let state = AgentState::with_session_id(session_id);

        run_session(store.as_ref(), session_id, channel.as_ref(), state, |state| {
            self.run_tool_call_stage(sink, abort, state, input)
        })
        .await
    }

    /// Stage 6: **tool_call** (§4.I), wrapping channel/steer/compaction/
    /// streaming (stages 7-10) as its per-iteration inner handler.
    async fn run_tool_call_stage(
        &self,
        sink: Arc<dyn EventSink>,
        abort: &AbortFlag,
        state: AgentState,
        input: Vec<Message>,
    ) -> Result<AgentState> {
        let tools = self.agent.tools.clone();
        let prev_input_tokens = Arc::new(SyncMutex::new(0u64));

        crate::tool_loop::run_tool_call_loop(
            tools,
            sink.clone(),
            abort,
            self.agent.max_tool_loops,
            state,
            input,
            move |state, turn_input| {
                let sink = sink.clone();
                let prev_input_tokens = prev_input_tokens.clone();
                async move {
                    self.run_channel_stage(sink, abort, prev_input_tokens, state, turn_input)
                        .await
                }
            },
        )
        .await
    }

    /// Stage 7: **channel** (§4.H.7) — re-wrapped fresh every tool-loop
    /// iteration, `close_channel` guaranteed on every exit from this
    /// iteration's scope.
    async fn run_channel_stage(
        &self,
        sink: Arc<dyn EventSink>,
        abort: &AbortFlag,
        prev_input_tokens: Arc<SyncMutex<u64>>,
        state: AgentState,
        turn_input: Vec<Message>,
    ) -> Result<AgentState> {
        match &self.channel {
            None => {
                self.run_steer_stage(sink, abort, prev_input_tokens, state, turn_input).await
            }
            Some(channel) => {
                let channel_sink: Arc<dyn EventSink> =
                    Arc::new(ChannelSink::new(sink, channel.clone()));
                with_channel_close(channel, async move {
                    self.run_steer_stage(channel_sink, abort, prev_input_tokens, state, turn_input)
                        .await
                })
                .await
            }
        }
    }

    /// Stage 8: **steer** (§4.H.8).
    async fn run_steer_stage(
        &self,
        sink: Arc<dyn EventSink>,
        abort: &AbortFlag,
        prev_input_tokens: Arc<SyncMutex<u64>>,
        mut state: AgentState,
        turn_input: Vec<Message>,
    ) -> Result<AgentState> {
        let mut drained = Vec::new();
        {
            let mut rx = self.steer_rx.lock();
            while let Ok(more) = rx.try_recv() {
                drained.push(more);
            }
        }

        let effective_input = if drained.is_empty() {
            turn_input
        } else {
            state.messages.extend(turn_input);
            let last = drained.pop().expect("checked non-empty above");
            for extra in drained {
                state.messages.extend(extra);
            }
            last
        };

        self.run_compaction_stage(sink, abort, prev_input_tokens, state, effective_input).await
    }

    /// Stage 9: **compaction** (§4.H.9/§4.J) — checked before each LLM call
    /// against the *previous* call's observed input-token count.
    async fn run_compaction_stage(
        &self,
        sink: Arc<dyn EventSink>,
        abort: &AbortFlag,
        prev_input_tokens: Arc<SyncMutex<u64>>,
        mut state: AgentState,
        turn_input: Vec<Message>,
    ) -> Result<AgentState> {
        let previous_tokens = *prev_input_tokens.lock();
        if compaction::should_compact(previous_tokens, &self.agent.compaction) {
            if let Some(summary) =
                compaction::compact(&self.router, &self.agent.compaction, &mut state.messages).await
            {
                state.last_compaction = Some(Message::CompactionSummary(summary));
            }
        }

        let streaming_ctx = StreamingContext {
            router: self.router.clone(),
            role: self.agent.role,
            tools: self.agent.tools.clone(),
            chat_defaults: self.agent.chat_defaults.clone(),
        };
        let system_prompt = self.agent.effective_system_prompt();

        let input_tokens: u64 =
            state.messages.iter().map(compaction::estimate_tokens).sum::<u64>()
                + turn_input.iter().map(compaction::estimate_tokens).sum::<u64>();

        let new_state = streaming::run_streaming_leaf(
            &streaming_ctx,
            &system_prompt,
            &ChatDefaults::default(),
            sink.as_ref(),
            abort,
            state,
            turn_input,
        )
        .await?;

        *prev_input_tokens.lock() = input_tokens;
        Ok(new_state)
    }
}
