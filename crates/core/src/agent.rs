//! `Agent`: the caller-facing configuration bundle consumed by `evaluate`.

use std::sync::Arc;

use sa_domain::capability::ModelRole;
use sa_domain::tool::ToolRegistry;
use sa_skills::registry::SkillsRegistry;

use crate::compaction::CompactionConfig;
use crate::guardrail::Guardrail;
use crate::streaming::ChatDefaults;
use crate::tool_loop::MAX_TOOL_LOOPS;

/// One agent's fixed configuration: everything `evaluate` needs besides the
/// per-call input and session id.
pub struct Agent {
    pub system_prompt: String,
    pub tools: Arc<ToolRegistry>,
    pub role: ModelRole,
    pub skills: Option<Arc<SkillsRegistry>>,
    pub guardrail: Option<Guardrail>,
    pub compaction: CompactionConfig,
    pub max_tool_loops: usize,
    pub chat_defaults: ChatDefaults,
}

impl Agent {
    pub fn new(system_prompt: impl Into<String>, role: ModelRole, tools: ToolRegistry) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            tools: Arc::new(tools),
            role,
            skills: None,
            guardrail: None,
            compaction: CompactionConfig::default(),
            max_tool_loops: MAX_TOOL_LOOPS,
            chat_defaults: ChatDefaults::default(),
        }
    }

    pub fn with_skills(mut self, skills: Arc<SkillsRegistry>) -> Self {
        self.skills = Some(skills);
        self
    }

    pub fn with_guardrail(mut self, guardrail: Guardrail) -> Self {
        self.guardrail = Some(guardrail);
        self
    }

    pub fn with_compaction(mut self, compaction: CompactionConfig) -> Self {
        self.compaction = compaction;
        self
    }

    pub fn with_chat_defaults(mut self, chat_defaults: ChatDefaults) -> Self {
        self.chat_defaults = chat_defaults;
        self
    }

    /// The system prompt seen by one inner call: the stored prompt plus a
    /// ready-skills index, when a skills registry is attached (§4.H.3).
    pub fn effective_system_prompt(&self) -> String {
        match &self.skills {
            Some(skills) => crate::skills_stage::augment_system_prompt(&self.system_prompt, skills),
            None => self.system_prompt.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_prompt_is_unchanged_without_skills() {
        let agent = Agent::new("be helpful", ModelRole::Executor, ToolRegistry::new());
        assert_eq!(agent.effective_system_prompt(), "be helpful");
    }

    #[test]
    fn effective_prompt_appends_skills_block_when_attached() {
        let agent = Agent::new("be helpful", ModelRole::Executor, ToolRegistry::new())
            .with_skills(Arc::new(SkillsRegistry::empty()));
        // An empty registry contributes nothing either way.
        assert_eq!(agent.effective_system_prompt(), "be helpful");
    }
}
