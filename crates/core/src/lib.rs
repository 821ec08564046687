//! Evaluation core: the middleware chain that drives `Agent::evaluate`.
//!
//! Layered above `sa-domain` (pure types) and `sa-providers` (LLM adapters)
//! because the guardrail, compaction, and streaming stages all need to call
//! out to a model.

pub mod abort;
pub mod agent;
pub mod channel_stage;
pub mod compaction;
pub mod guardrail;
pub mod middleware;
pub mod session_stage;
pub mod skills_stage;
pub mod streaming;
pub mod tool_loop;
