//! Channel middleware (§4.H.7): maps assistant-role message events onto a
//! [`Channel`]'s streaming surface, with no-reply sentinel suppression.

use std::sync::Arc;

use parking_lot::Mutex;

use sa_domain::channel::{is_no_reply, Channel};
use sa_domain::error::Result;
use sa_domain::event::{Event, EventRole, EventSink, UpdateKind};

#[derive(Default)]
struct MessageState {
    resolved: bool,
    suppressed: bool,
    started: bool,
}

/// Wraps a sink so that assistant message lifecycle events also drive
/// `channel`'s `start_streaming`/`append_to_stream`/`finish_streaming`.
///
/// `Channel`'s methods are async; `EventSink::on_event` is a synchronous
/// callback (§4.C). This bridges the two with `block_in_place` + a handle to
/// the current runtime, so the host must run evaluation on a multi-threaded
/// Tokio runtime.
pub struct ChannelSink {
    inner: Arc<dyn EventSink>,
    channel: Arc<dyn Channel>,
    current: Mutex<Option<MessageState>>,
}

impl ChannelSink {
    pub fn new(inner: Arc<dyn EventSink>, channel: Arc<dyn Channel>) -> Self {
        Self {
            inner,
            channel,
            current: Mutex::new(None),
        }
    }

    fn block_on<F: std::future::Future>(&self, fut: F) -> F::Output {
        tokio::task::block_in_place(|| tokio::runtime::Handle::current().block_on(fut))
    }
}

impl EventSink for ChannelSink {
    fn on_event(&self, event: Event) {
        match &event {
            Event::MessageStart { role: EventRole::Assistant, .. } => {
                *self.current.lock() = Some(MessageState::default());
            }
            Event::MessageUpdate {
                role: EventRole::Assistant,
                kind: UpdateKind::Text,
                delta,
                ..
            } => {
                let mut guard = self.current.lock();
                if let Some(state) = guard.as_mut() {
                    if !state.resolved {
                        state.resolved = true;
                        state.suppressed = is_no_reply(delta);
                        if !state.suppressed {
                            self.block_on(self.channel.start_streaming());
                            state.started = true;
                        }
                    }
                    if !state.suppressed && state.started {
                        self.block_on(self.channel.append_to_stream(delta));
                    }
                }
            }
            Event::MessageEnd { role: EventRole::Assistant, .. } => {
                let finished = {
                    let mut guard = self.current.lock();
                    guard.take()
                };
                if let Some(state) = finished {
                    if !state.suppressed && state.started {
                        self.block_on(self.channel.finish_streaming());
                    }
                }
            }
            _ => {}
        }
        self.inner.on_event(event);
    }
}

/// Runs `body`, closing `channel` on every exit path (§4.E) -- success,
/// error, or an abort.
pub async fn with_channel_close<T, F>(channel: &Arc<dyn Channel>, body: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    let result = body.await;
    channel.close_channel().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use sa_domain::event::RecordingSink;
    use sa_domain::message::Message;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct StreamTestChannel {
        started: AtomicUsize,
        deltas: Mutex<Vec<String>>,
        finished: AtomicUsize,
        closed: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Channel for StreamTestChannel {
        async fn start_streaming(&self) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }
        async fn append_to_stream(&self, delta: &str) {
            self.deltas.lock().push(delta.to_string());
        }
        async fn finish_streaming(&self) {
            self.finished.fetch_add(1, Ordering::SeqCst);
        }
        async fn send_message(&self, _message: &str) {}
        async fn close_channel(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
        fn channel_id(&self) -> String {
            "test".into()
        }
    }

    fn assistant_msg() -> Message {
        Message::Assistant(sa_domain::message::AssistantMessage::new("anthropic", "messages", "claude"))
    }

    #[tokio::test]
    async fn normal_message_streams_through_channel() {
        let recorder = Arc::new(RecordingSink::default());
        let test_channel = Arc::new(StreamTestChannel::default());
        let channel: Arc<dyn Channel> = test_channel.clone();
        let sink = ChannelSink::new(recorder, channel);

        sink.on_event(Event::MessageStart { role: EventRole::Assistant, message: assistant_msg() });
        sink.on_event(Event::MessageUpdate {
            role: EventRole::Assistant,
            message: assistant_msg(),
            kind: UpdateKind::Text,
            delta: "hello".into(),
            item_id: None,
        });
        sink.on_event(Event::MessageEnd { role: EventRole::Assistant, message: assistant_msg() });

        assert_eq!(test_channel.started.load(Ordering::SeqCst), 1);
        assert_eq!(test_channel.deltas.lock().clone(), vec!["hello".to_string()]);
        assert_eq!(test_channel.finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn no_reply_sentinel_suppresses_the_whole_message() {
        let recorder = Arc::new(RecordingSink::default());
        let test_channel = Arc::new(StreamTestChannel::default());
        let channel: Arc<dyn Channel> = test_channel.clone();
        let sink = ChannelSink::new(recorder, channel);

        sink.on_event(Event::MessageStart { role: EventRole::Assistant, message: assistant_msg() });
        sink.on_event(Event::MessageUpdate {
            role: EventRole::Assistant,
            message: assistant_msg(),
            kind: UpdateKind::Text,
            delta: "\u{2205} suppressed".into(),
            item_id: None,
        });
        sink.on_event(Event::MessageEnd { role: EventRole::Assistant, message: assistant_msg() });

        assert_eq!(test_channel.started.load(Ordering::SeqCst), 0);
        assert!(test_channel.deltas.lock().is_empty());
        assert_eq!(test_channel.finished.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn close_channel_runs_on_every_exit_path() {
        let test_channel = Arc::new(StreamTestChannel::default());
        let channel: Arc<dyn Channel> = test_channel.clone();
        let ok: Result<()> = with_channel_close(&channel, async { Ok(()) }).await;
        assert!(ok.is_ok());
        let err: Result<()> = with_channel_close(&channel, async {
            Err(sa_domain::error::Error::AbortEvaluation)
        })
        .await;
        assert!(err.is_err());
        assert_eq!(test_channel.closed.load(Ordering::SeqCst), 2);
    }
}
