//! Channel (interface) — the frontend sink for streamed assistant output
//! (§4.E).
//!
//! The no-reply sentinel `U+2205` (EMPTY SET) suppresses an entire assistant
//! message before any byte reaches the channel: if the first text delta
//! begins with it, `start_streaming` is never called, every delta is
//! dropped, and `finish_streaming` is not called. `close_channel` must run
//! on every exit path including errors -- callers use the `finally` pattern
//! (a guard or explicit try/finally), never rely on `Drop` alone since
//! closing is async.

use async_trait::async_trait;

/// U+2205, EMPTY SET. First text delta starting with this character
/// suppresses the whole assistant message.
pub const NO_REPLY_SENTINEL: char = '\u{2205}';

pub fn is_no_reply(first_text_delta: &str) -> bool {
    first_text_delta.starts_with(NO_REPLY_SENTINEL)
}

#[derive(Debug, Clone, Default)]
pub struct User {
    pub id: String,
    pub display_name: Option<String>,
}

#[async_trait]
pub trait Channel: Send + Sync {
    async fn start_streaming(&self);
    async fn append_to_stream(&self, delta: &str);
    async fn finish_streaming(&self);
    async fn send_message(&self, message: &str);
    async fn close_channel(&self);

    fn channel_id(&self) -> String;
    fn is_group(&self) -> bool {
        false
    }
    fn is_private(&self) -> bool {
        false
    }
    fn get_current_user(&self) -> Option<User> {
        None
    }
    fn source_message_id(&self) -> Option<String> {
        None
    }
}

/// `channel_flags` bits persisted on a `SessionEntry` (§6). An absent flag
/// means "legacy / unrestricted".
pub const CHANNEL_FLAG_PRIVATE: u32 = 0x01;
pub const CHANNEL_FLAG_GROUP: u32 = 0x02;

pub fn channel_flags(channel: &dyn Channel) -> u32 {
    let mut flags = 0;
    if channel.is_private() {
        flags |= CHANNEL_FLAG_PRIVATE;
    }
    if channel.is_group() {
        flags |= CHANNEL_FLAG_GROUP;
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_detected_at_start_only() {
        assert!(is_no_reply("\u{2205} suppressed"));
        assert!(!is_no_reply("not suppressed \u{2205}"));
        assert!(!is_no_reply(""));
    }
}
