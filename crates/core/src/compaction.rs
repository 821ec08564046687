//! Context-compaction engine (§4.J): cut-point selection, sub-agent
//! summarization, and in-place state rewrite.

use sa_domain::capability::ModelRole;
use sa_domain::message::{
    AssistantContentBlock, CompactionSummaryMessage, Message, ToolResultContentBlock,
};
use sa_providers::router::LlmRouter;
use sa_providers::ChatRequest;

/// Tunables driving the compaction trigger and cut-point search.
#[derive(Debug, Clone, Copy)]
pub struct CompactionConfig {
    pub context_window_tokens: u64,
    pub reserve_tokens: u64,
    pub keep_recent_tokens: u64,
    pub summarizer_role: ModelRole,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            context_window_tokens: 100_000,
            reserve_tokens: 16_384,
            keep_recent_tokens: 8_000,
            summarizer_role: ModelRole::Summarizer,
        }
    }
}

/// Rough token estimate: `ceil((text_bytes + argument_bytes) / 4)`, with a
/// flat 1000 per image block.
pub fn estimate_tokens(message: &Message) -> u64 {
    let bytes: u64 = match message {
        Message::User(m) => m
            .content
            .iter()
            .map(|b| match b {
                sa_domain::message::UserContentBlock::Text { text } => text.len() as u64,
                sa_domain::message::UserContentBlock::Image { .. } => 0,
            })
            .sum(),
        Message::Assistant(m) => m
            .content
            .iter()
            .map(|b| match b {
                AssistantContentBlock::Text { text, .. } => text.len() as u64,
                AssistantContentBlock::Thinking { text, .. } => text.len() as u64,
                AssistantContentBlock::ToolCall(tc) => {
                    (tc.name.len() + tc.arguments.len()) as u64
                }
            })
            .sum(),
        Message::ToolResult(m) => m
            .content
            .iter()
            .map(|b| match b {
                ToolResultContentBlock::Text { text } => text.len() as u64,
                ToolResultContentBlock::Image { .. } => 0,
            })
            .sum(),
        Message::CompactionSummary(m) => m.text.len() as u64,
    };
    let images = match message {
        Message::User(m) => m
            .content
            .iter()
            .filter(|b| matches!(b, sa_domain::message::UserContentBlock::Image { .. }))
            .count(),
        Message::ToolResult(m) => m
            .content
            .iter()
            .filter(|b| matches!(b, ToolResultContentBlock::Image { .. }))
            .count(),
        _ => 0,
    };
    bytes.div_ceil(4) + images as u64 * 1000
}

/// Find the cut point (§4.J.1): walk from the end accumulating a token
/// estimate until the suffix meets `keep_recent_tokens`, then advance to the
/// next `UserMessage` boundary so a tool-call/tool-result pair is never
/// split. Returns `None` if no such boundary exists (compaction is skipped).
pub fn find_cut_point(messages: &[Message], keep_recent_tokens: u64) -> Option<usize> {
    if messages.is_empty() {
        return None;
    }
    let mut acc = 0u64;
    let mut candidate = messages.len();
    for (i, m) in messages.iter().enumerate().rev() {
        acc += estimate_tokens(m);
        if acc >= keep_recent_tokens {
            candidate = i;
            break;
        }
        candidate = i;
    }
    // Advance forward to the next UserMessage boundary.
    while candidate < messages.len() && !messages[candidate].is_user() {
        candidate += 1;
    }
    if candidate >= messages.len() {
        None
    } else {
        Some(candidate)
    }
}

/// Discard range excludes a pre-existing leading `CompactionSummaryMessage`.
fn discard_range(messages: &[Message], cut: usize) -> std::ops::Range<usize> {
    let start = if messages.first().map(Message::is_compaction_summary).unwrap_or(false) {
        1
    } else {
        0
    };
    start..cut.max(start)
}

/// Format the discard set as a plain-text transcript for the summarizer.
fn format_discard_set(messages: &[Message]) -> String {
    let mut buf = String::new();
    for m in messages {
        match m {
            Message::User(u) => {
                for block in &u.content {
                    if let sa_domain::message::UserContentBlock::Text { text } = block {
                        buf.push_str("User: ");
                        buf.push_str(text);
                        buf.push('\n');
                    }
                }
            }
            Message::Assistant(a) => {
                let text = a.message_text();
                if !text.is_empty() {
                    buf.push_str("Assistant: ");
                    buf.push_str(&text);
                    buf.push('\n');
                }
                for tc in &a.tool_calls {
                    buf.push_str(&format!("Assistant called tool: {}({})\n", tc.name, tc.arguments));
                }
            }
            Message::ToolResult(tr) => {
                let text = tr.text();
                let truncated = if text.len() > 500 { &text[..500] } else { &text };
                let label = if tr.is_error { "error" } else { "result" };
                buf.push_str(&format!("Tool {} {}: {}\n", tr.tool_name, label, truncated));
            }
            Message::CompactionSummary(s) => {
                buf.push_str("Previous summary:\n");
                buf.push_str(&s.text);
                buf.push('\n');
            }
        }
    }
    buf
}

fn summary_prompt(transcript: &str, prior_summary: Option<&str>) -> String {
    match prior_summary {
        None => format!(
            "Summarize the conversation below into the following sections, each as a short paragraph or bullet list:\n\n\
             Goal:\n\
             Constraints & Preferences:\n\
             Progress:\n  Done:\n  In Progress:\n  Blocked:\n\
             Key Decisions:\n\
             Next Steps:\n\
             Critical Context:\n\n\
             CONVERSATION:\n{transcript}"
        ),
        Some(prior) => format!(
            "Update the existing structured summary below with the new conversation that follows. \
             Merge rather than append -- keep every section current and drop anything superseded.\n\n\
             EXISTING SUMMARY:\n{prior}\n\n\
             NEW CONVERSATION:\n{transcript}\n\n\
             Respond with the full updated summary using the same section headings: \
             Goal, Constraints & Preferences, Progress (Done/In Progress/Blocked), \
             Key Decisions, Next Steps, Critical Context."
        ),
    }
}

/// Run the full compaction flow (§4.J) against `messages`, rewriting them in
/// place on success. Returns the number of tokens discarded, or `None` if
/// compaction was skipped (no boundary found, or nothing to discard).
///
/// On summarizer failure this logs a warning and leaves `messages`
/// untouched -- compaction is not retried within the same turn.
pub async fn compact(
    router: &LlmRouter,
    config: &CompactionConfig,
    messages: &mut Vec<Message>,
) -> Option<CompactionSummaryMessage> {
    let cut = find_cut_point(messages, config.keep_recent_tokens)?;
    let range = discard_range(messages, cut);
    if range.is_empty() {
        return None;
    }

    let prior_summary = match messages.first() {
        Some(Message::CompactionSummary(s)) => Some(s.clone()),
        _ => None,
    };

    let discarded = &messages[range.clone()];
    let tokens_discarded: u64 = discarded.iter().map(estimate_tokens).sum();
    let tokens_before = tokens_discarded + prior_summary.as_ref().map(|s| s.tokens_before).unwrap_or(0);

    let transcript = format_discard_set(discarded);
    let prompt = summary_prompt(&transcript, prior_summary.as_ref().map(|s| s.text.as_str()));

    let req = ChatRequest {
        messages: vec![Message::user_text(prompt)],
        temperature: Some(0.1),
        max_tokens: Some(2000),
        ..Default::default()
    };

    let resp = match router.chat_for_role(config.summarizer_role, req).await {
        Ok(resp) => resp,
        Err(e) => {
            tracing::warn!(error = %e, "compaction summary generation failed, leaving state untouched");
            return None;
        }
    };

    let summary = CompactionSummaryMessage {
        text: resp.message.message_text(),
        tokens_before,
        compacted_at: unix_now(),
    };

    let kept = messages.split_off(cut);
    *messages = std::iter::once(Message::CompactionSummary(summary.clone()))
        .chain(kept)
        .collect();

    tracing::info!(tokens_before, discard_count = range.len(), "compacted conversation history");
    Some(summary)
}

/// Returns whether compaction should run given the previous call's observed
/// input token count (§4.J trigger condition).
pub fn should_compact(previous_input_tokens: u64, config: &CompactionConfig) -> bool {
    previous_input_tokens > config.context_window_tokens.saturating_sub(config.reserve_tokens)
}

fn unix_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(text: &str) -> Message {
        Message::user_text(text)
    }

    #[test]
    fn cut_point_on_single_user_message_is_zero() {
        let messages = vec![user("hello")];
        assert_eq!(find_cut_point(&messages, 10_000), Some(0));
    }

    #[test]
    fn cut_point_skips_to_next_user_boundary() {
        let messages = vec![
            user(&"a".repeat(40)),
            Message::tool_result("c1", "echo", "b".repeat(40), false),
            user(&"c".repeat(40)),
        ];
        // keep_recent_tokens small enough that the naive cut lands mid-way,
        // forcing an advance to the next UserMessage.
        let cut = find_cut_point(&messages, 5).unwrap();
        assert!(messages[cut].is_user());
    }

    #[test]
    fn no_user_boundary_skips_compaction() {
        let messages = vec![Message::tool_result("c1", "echo", "x", false)];
        assert_eq!(find_cut_point(&messages, 1), None);
    }

    #[test]
    fn discard_range_excludes_leading_summary() {
        let messages = vec![
            Message::CompactionSummary(CompactionSummaryMessage {
                text: "s".into(),
                tokens_before: 10,
                compacted_at: 0.0,
            }),
            user("a"),
            user("b"),
        ];
        let range = discard_range(&messages, 2);
        assert_eq!(range, 1..2);
    }

    #[test]
    fn should_compact_respects_threshold() {
        let config = CompactionConfig {
            context_window_tokens: 100_000,
            reserve_tokens: 16_384,
            keep_recent_tokens: 8_000,
            summarizer_role: ModelRole::Summarizer,
        };
        assert!(!should_compact(5_000, &config));
        assert!(should_compact(90_000, &config));
    }
}
