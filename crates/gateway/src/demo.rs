//! Wires one `Agent` together from config and runs it through `sa-core`'s
//! `Evaluator` for a single prompt (§10.E).

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;

use sa_core::abort::AbortFlag;
use sa_core::agent::Agent;
use sa_core::middleware::Evaluator;
use sa_domain::capability::ModelRole;
use sa_domain::config::Config;
use sa_domain::error::Result;
use sa_domain::event::EventSink;
use sa_domain::message::Message;
use sa_domain::tool::{Tool, ToolDefinition, ToolRegistry};
use sa_providers::router::LlmRouter;
use sa_sessions::JsonlSessionStore;
use sa_skills::registry::SkillsRegistry;
use sa_tools::ProcessManager;

use crate::event_log::StdoutSink;

/// Build the exec tool (`sa-tools`' process-session machinery, §4.B) and
/// register it under the schema an LLM-facing tool call expects.
fn register_exec_tool(registry: &mut ToolRegistry, config: &Config) {
    let manager = Arc::new(ProcessManager::new(config.tools.exec.clone()));

    let definition = ToolDefinition {
        name: "exec".into(),
        description: "Run a shell command.".into(),
        strict_schema: false,
        parameters: json!({
            "type": "object",
            "properties": {
                "command": {"type": "string"},
                "background": {"type": "boolean"},
            },
            "required": ["command"],
        }),
    };

    registry.register(Tool::new(definition, move |args| {
        let manager = manager.clone();
        Box::pin(async move {
            let req: sa_tools::exec::ExecRequest =
                serde_json::from_value(args).map_err(|e| e.to_string())?;
            let resp = sa_tools::exec::exec(&manager, req).await;
            serde_json::to_string(&resp).map_err(|e| e.to_string())
        })
    }));
}

/// Run one evaluation for `prompt` against `session_id`, printing assistant
/// text to stdout as it streams and returning the final state.
pub async fn run_once(
    config: &Config,
    session_dir: PathBuf,
    session_id: String,
    prompt: String,
) -> Result<()> {
    let router = Arc::new(LlmRouter::from_config(&config.llm)?);
    let store: Arc<dyn sa_domain::session::SessionStore> =
        Arc::new(JsonlSessionStore::new(session_dir)?);

    let mut tools = ToolRegistry::new();
    register_exec_tool(&mut tools, config);

    let skills = SkillsRegistry::load(&config.skills.path).ok().map(Arc::new);

    let mut agent = Agent::new(
        "You are SerialAgent, a helpful coding assistant.",
        ModelRole::Executor,
        tools,
    );

    if let Some(skills) = skills {
        agent = agent.with_skills(skills);
    }

    let evaluator = Evaluator::new(Arc::new(agent), router, store, None);
    let sink: Arc<dyn EventSink> = Arc::new(StdoutSink);
    let abort = AbortFlag::new();

    evaluator
        .evaluate(sink, abort, session_id, vec![Message::user_text(prompt)])
        .await?;

    Ok(())
}
