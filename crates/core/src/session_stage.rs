//! Session middleware (§4.H.5): hydrates state from the store before the
//! inner handler runs, writes exactly one journal entry after it returns.

use std::sync::Arc;

use sa_domain::agent_state::AgentState;
use sa_domain::channel::{channel_flags, Channel};
use sa_domain::error::Result;
use sa_domain::message::Message;
use sa_domain::session::{SessionEntry, SessionStore};

/// Runs `inner` with `state` hydrated from `store`, then appends one entry:
/// a compaction entry if `inner` left `state.last_compaction` set, a delta
/// entry of the newly appended messages otherwise.
pub async fn run_session<F, Fut>(
    store: &dyn SessionStore,
    session_id: &str,
    channel: Option<&Arc<dyn Channel>>,
    mut state: AgentState,
    inner: F,
) -> Result<AgentState>
where
    F: FnOnce(AgentState) -> Fut,
    Fut: std::future::Future<Output = Result<AgentState>>,
{
    let hydrated = store.load_session(session_id).await?;
    state.messages.splice(0..0, hydrated.messages);
    if state.session_id.is_none() {
        state.session_id = Some(session_id.to_string());
    }
    let boundary = state.messages.len();

    state = inner(state).await?;

    let now = unix_now();
    let entry = if let Some(summary) = state.last_compaction.take() {
        let _ = summary;
        SessionEntry::compaction(state.messages.clone(), now)
    } else {
        let delta: Vec<Message> = state.messages[boundary.min(state.messages.len())..].to_vec();
        if delta.is_empty() {
            return Ok(state);
        }
        SessionEntry::delta(delta, now)
    };

    let entry = match channel {
        Some(channel) => SessionEntry {
            channel_id: Some(channel.channel_id()),
            channel_flags: Some(channel_flags(channel.as_ref())),
            user_id: channel.get_current_user().map(|u| u.id),
            post_id: channel.source_message_id(),
            ..entry
        },
        None => entry,
    };

    store.append_session_entry(session_id, entry).await?;
    Ok(state)
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
    use sa_domain::session::InMemorySessionStore;

    #[tokio::test]
    async fn first_turn_writes_a_delta_entry() {
        let store = InMemorySessionStore::new();
        let state = AgentState::with_session_id("s1");

        let result = run_session(&store, "s1", None, state, |mut state| async move {
            state.push(Message::user_text("hi"));
            state.push(Message::Assistant(sa_domain::message::AssistantMessage::new(
                "anthropic", "messages", "claude",
            )));
            Ok(state)
        })
        .await
        .unwrap();

        assert_eq!(result.messages.len(), 2);
        assert_eq!(store.session_entry_count("s1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn second_turn_hydrates_prior_history() {
        let store = InMemorySessionStore::new();

        run_session(&store, "s1", None, AgentState::with_session_id("s1"), |mut state| async move {
            state.push(Message::user_text("first"));
            Ok(state)
        })
        .await
        .unwrap();

        let result = run_session(&store, "s1", None, AgentState::with_session_id("s1"), |mut state| async move {
            assert_eq!(state.messages.len(), 1);
            state.push(Message::user_text("second"));
            Ok(state)
        })
        .await
        .unwrap();

        assert_eq!(result.messages.len(), 2);
    }

    #[tokio::test]
    async fn compaction_result_writes_a_compaction_entry() {
        let store = InMemorySessionStore::new();
        let state = AgentState::with_session_id("s1");

        run_session(&store, "s1", None, state, |mut state| async move {
            state.push(Message::user_text("hi"));
            state.last_compaction = Some(Message::CompactionSummary(
                sa_domain::message::CompactionSummaryMessage {
                    text: "summary".into(),
                    tokens_before: 10,
                    compacted_at: 0.0,
                },
            ));
            Ok(state)
        })
        .await
        .unwrap();

        let entries = store.session_entries("s1", 0, None).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].is_compaction);
    }
}
