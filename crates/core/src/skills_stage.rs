//! Skills middleware (§4.H.3): appends the ready-skills index to the system
//! prompt for one inner call only -- the agent's stored prompt is untouched.

use sa_skills::registry::SkillsRegistry;

/// Builds the system prompt seen by the inner call: `base` followed by an
/// `<available_skills>` block, or `base` unchanged when the registry is
/// empty.
pub fn augment_system_prompt(base: &str, skills: &SkillsRegistry) -> String {
    let index = skills.render_ready_index();
    if index.trim().is_empty() {
        return base.to_string();
    }
    format!("{base}\n\n<available_skills>\n{index}\n</available_skills>")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_registry_leaves_prompt_unchanged() {
        let skills = SkillsRegistry::empty();
        assert_eq!(augment_system_prompt("base prompt", &skills), "base prompt");
    }
}
