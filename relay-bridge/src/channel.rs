//! Long-lived event source.
//!
//! A [`Channel`] owns an engine [`Endpoint`] and one
//! subscription per [`EventKind`]. Whatever thread the
//! engine fires on, the event is copied, queued on the
//! loopback and handed to the matching slot of the
//! channel's [`Handlers`] on the foreground thread, in
//! the order the engine fired it.
//!
//! Each channel drains its own inbox from a task on
//! the foreground pool. Its handlers never interleave
//! with each other, but an async handler waiting on
//! the consumer loop, say for a promise, does not hold
//! up anything else the loop has to run.

use crate::engine::{ChannelInfo, Endpoint, EndpointState, SendError, SubscriptionToken, Trampoline};
use crate::event::{ChannelEvent, ErrorInfo, EventKind, RawEvent};
use crate::handle::{Handle, WeakHandle};
use crate::handler::Handler;
use anyhow::Result;
use bytes::Bytes;
use relay_task::{Deferred, Handle as _, Loopback};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Dispatch table of a channel.
///
/// Every slot is optional. An event whose slot is
/// unset is reported and discarded, which is how a
/// channel declares it has no interest in that kind.
/// The table is fixed once the channel is built.
#[derive(Default)]
pub struct Handlers {
    opened: Option<Handler<()>>,
    closed: Option<Handler<()>>,
    errored: Option<Handler<ErrorInfo>>,
    data_message: Option<Handler<Bytes>>,
    text_message: Option<Handler<String>>,
    buffered_amount_low: Option<Handler<()>>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_opened(mut self, handler: Handler<()>) -> Self {
        self.opened = Some(handler);
        self
    }

    pub fn on_closed(mut self, handler: Handler<()>) -> Self {
        self.closed = Some(handler);
        self
    }

    pub fn on_errored(mut self, handler: Handler<ErrorInfo>) -> Self {
        self.errored = Some(handler);
        self
    }

    pub fn on_data_message(mut self, handler: Handler<Bytes>) -> Self {
        self.data_message = Some(handler);
        self
    }

    pub fn on_text_message(mut self, handler: Handler<String>) -> Self {
        self.text_message = Some(handler);
        self
    }

    pub fn on_buffered_amount_low(mut self, handler: Handler<()>) -> Self {
        self.buffered_amount_low = Some(handler);
        self
    }

    pub fn is_set(&self, kind: EventKind) -> bool {
        match kind {
            EventKind::Opened => self.opened.is_some(),
            EventKind::Closed => self.closed.is_some(),
            EventKind::Errored => self.errored.is_some(),
            EventKind::DataMessage => self.data_message.is_some(),
            EventKind::TextMessage => self.text_message.is_some(),
            EventKind::BufferedAmountLow => self.buffered_amount_low.is_some(),
        }
    }

    /// Returns `None` when the slot is unset.
    async fn dispatch(&mut self, event: ChannelEvent) -> Option<Result<()>> {
        match event {
            ChannelEvent::Opened => invoke(&mut self.opened, ()).await,
            ChannelEvent::Closed => invoke(&mut self.closed, ()).await,
            ChannelEvent::Errored(error) => invoke(&mut self.errored, error).await,
            ChannelEvent::DataMessage(data) => invoke(&mut self.data_message, data).await,
            ChannelEvent::TextMessage(text) => invoke(&mut self.text_message, text).await,
            ChannelEvent::BufferedAmountLow => invoke(&mut self.buffered_amount_low, ()).await,
        }
    }
}

async fn invoke<E: 'static>(slot: &mut Option<Handler<E>>, e: E) -> Option<Result<()>> {
    Some(slot.as_mut()?.call(e).await)
}

/// Ready state of a channel.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl From<EndpointState> for ReadyState {
    fn from(state: EndpointState) -> Self {
        match state {
            // A channel that the engine has not started
            // to connect yet is still reported connecting.
            EndpointState::New | EndpointState::Connecting => ReadyState::Connecting,
            EndpointState::Open => ReadyState::Open,
            EndpointState::Closing => ReadyState::Closing,
            EndpointState::Closed => ReadyState::Closed,
        }
    }
}

/// Snapshot of a channel's dispatch counters.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct ChannelStats {
    pub delivered: u64,
    pub unhandled: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    delivered: AtomicU64,
    unhandled: AtomicU64,
    failed: AtomicU64,
}

/// Events queued on the foreground, waiting for the
/// handler of the previous one to finish.
#[derive(Default)]
struct Inbox {
    events: VecDeque<ChannelEvent>,
    draining: bool,
}

pub struct Channel {
    endpoint: parking_lot::Mutex<Box<dyn Endpoint>>,
    tokens: Vec<SubscriptionToken>,
    inbox: parking_lot::Mutex<Inbox>,
    handlers: futures::lock::Mutex<Handlers>,
    info: ChannelInfo,
    counters: Counters,
}

impl Channel {
    /// Takes over the endpoint and subscribes to all of
    /// its event kinds.
    ///
    /// Events the engine fires before this returns have
    /// no channel to go to yet and are discarded.
    pub fn new(
        mut endpoint: Box<dyn Endpoint>,
        handlers: Handlers,
        loopback: Loopback,
    ) -> Handle<Channel> {
        let info = endpoint.info();
        let handle = Handle::new_cyclic(|weak| {
            let tokens = EventKind::ALL
                .iter()
                .map(|&kind| {
                    let trampoline = Channel::trampoline(kind, weak.clone(), loopback.clone());
                    endpoint.subscribe(kind, trampoline)
                })
                .collect();
            Channel {
                endpoint: parking_lot::Mutex::new(endpoint),
                tokens,
                inbox: parking_lot::Mutex::new(Inbox::default()),
                handlers: futures::lock::Mutex::new(handlers),
                info,
                counters: Counters::default(),
            }
        });
        tracing::debug!(label = %handle.info.label, "channel created");
        handle
    }

    fn trampoline(kind: EventKind, weak: WeakHandle<Channel>, loopback: Loopback) -> Trampoline {
        Arc::new(move |raw: RawEvent<'_>| {
            if raw.kind() != kind {
                tracing::warn!(
                    %kind,
                    fired = %raw.kind(),
                    "event on the wrong subscription dropped"
                );
                return;
            }
            // Copy first: the engine may reuse the memory
            // right after this callback returns.
            let event = raw.capture();
            let Some(channel) = weak.upgrade() else {
                tracing::trace!(%kind, "event after channel teardown ignored");
                return;
            };
            tracing::trace!(%kind, label = %channel.info.label, "event queued");
            let deferred = Deferred::from_fn(move || Channel::enqueue(channel, event));
            if loopback.defer(deferred).is_err() {
                tracing::warn!(%kind, "consumer loop closed, dropping event");
            }
        })
    }

    /// Runs on the foreground thread.
    fn enqueue(channel: Handle<Channel>, event: ChannelEvent) {
        let mut inbox = channel.inbox.lock();
        inbox.events.push_back(event);
        if inbox.draining {
            return;
        }
        inbox.draining = true;
        drop(inbox);
        relay_task::spawn_foreground(Channel::drain(channel)).detach();
    }

    /// Dispatches until the inbox is empty, keeping the
    /// channel alive meanwhile.
    async fn drain(channel: Handle<Channel>) {
        loop {
            let event = {
                let mut inbox = channel.inbox.lock();
                match inbox.events.pop_front() {
                    Some(event) => event,
                    None => {
                        inbox.draining = false;
                        return;
                    }
                }
            };
            channel.dispatch(event).await;
        }
    }

    async fn dispatch(&self, event: ChannelEvent) {
        let kind = event.kind();
        let label = &self.info.label;
        let outcome = self.handlers.lock().await.dispatch(event).await;
        match outcome {
            Some(Ok(())) => {
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Some(Err(err)) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(%kind, %label, error = %err, "channel handler failed");
            }
            None => {
                self.counters.unhandled.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(%kind, %label, "channel handler for {kind} not implemented");
            }
        }
    }

    pub fn info(&self) -> &ChannelInfo {
        &self.info
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            unhandled: self.counters.unhandled.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    pub fn ready_state(&self) -> ReadyState {
        self.endpoint.lock().state().into()
    }

    pub fn buffered_amount(&self) -> u64 {
        self.endpoint.lock().buffered_amount()
    }

    pub fn buffered_amount_low_threshold(&self) -> u64 {
        self.endpoint.lock().buffered_amount_low_threshold()
    }

    pub fn set_buffered_amount_low_threshold(&self, threshold: u64) {
        self.endpoint
            .lock()
            .set_buffered_amount_low_threshold(threshold);
    }

    pub fn send_data(&self, data: &[u8]) -> Result<(), SendError> {
        self.endpoint.lock().send_data(data)
    }

    pub fn send_string(&self, text: &str) -> Result<(), SendError> {
        self.endpoint.lock().send_string(text)
    }

    pub fn close(&self) {
        self.endpoint.lock().close();
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        let endpoint = self.endpoint.get_mut();
        for token in self.tokens.drain(..) {
            endpoint.unsubscribe(token);
        }
        tracing::debug!(label = %self.info.label, "channel torn down");
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("info", &self.info)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::Reply;
    use crate::memory::{
        MemoryEndpoint, MemoryEndpointRemote, MemoryEngine, MemoryPendingOperation,
    };
    use crate::promise::with_promise;
    use crate::testutil::{Fixture, Recorder};

    fn endpoint(label: &str) -> (Box<dyn Endpoint>, MemoryEndpointRemote) {
        let (endpoint, remote) = MemoryEndpoint::new(ChannelInfo::new(label));
        (Box::new(endpoint), remote)
    }

    fn recording_handlers(recorder: &Recorder) -> Handlers {
        Handlers::new()
            .on_opened(recorder.handler(|()| "opened".to_string()))
            .on_closed(recorder.handler(|()| "closed".to_string()))
            .on_errored(recorder.handler(|e: ErrorInfo| format!("errored:{}", e.message)))
            .on_data_message(recorder.handler(|d: Bytes| format!("data:{:?}", &d[..])))
            .on_text_message(recorder.handler(|t: String| format!("text:{t}")))
            .on_buffered_amount_low(recorder.handler(|()| "low".to_string()))
    }

    #[test]
    fn test_all_kinds_in_order() {
        let fx = Fixture::new();
        let recorder = Recorder::default();
        let (endpoint, remote) = endpoint("all");
        let channel = Channel::new(endpoint, recording_handlers(&recorder), fx.loopback());
        assert_eq!(remote.subscriptions(), 6);

        remote.emit(RawEvent::Opened);
        remote.emit(RawEvent::TextMessage("hi"));
        remote.emit(RawEvent::DataMessage(&[1, 2]));
        remote.emit(RawEvent::BufferedAmountLow);
        remote.emit(RawEvent::Errored {
            code: 1,
            domain: "sctp",
            message: "reset",
        });
        remote.emit(RawEvent::Closed);
        assert!(recorder.take().is_empty());

        fx.drain();
        assert_eq!(
            recorder.take(),
            vec!["opened", "text:hi", "data:[1, 2]", "low", "errored:reset", "closed"],
        );
        assert_eq!(channel.stats().delivered, 6);
    }

    #[test]
    fn test_unset_handler_is_a_notice() {
        let fx = Fixture::new();
        let recorder = Recorder::default();
        let handlers = Handlers::new()
            .on_opened(recorder.handler(|()| "opened".to_string()))
            .on_closed(recorder.handler(|()| "closed".to_string()));
        assert!(!handlers.is_set(EventKind::Errored));
        let (endpoint, remote) = endpoint("partial");
        let channel = Channel::new(endpoint, handlers, fx.loopback());

        remote.emit(RawEvent::Errored {
            code: 7,
            domain: "sctp",
            message: "lost",
        });
        fx.drain();
        assert_eq!(channel.stats().unhandled, 1);
        assert!(recorder.take().is_empty());

        remote.emit(RawEvent::Opened);
        fx.drain();
        assert_eq!(recorder.take(), vec!["opened"]);
        assert_eq!(
            channel.stats(),
            ChannelStats {
                delivered: 1,
                unhandled: 1,
                failed: 0,
            },
        );
    }

    #[test]
    fn test_failing_handler_does_not_stop_delivery() {
        let fx = Fixture::new();
        let recorder = Recorder::default();
        let texts = recorder.clone();
        let handlers = Handlers::new()
            .on_text_message(Handler::new_sync(move |t: String| {
                anyhow::ensure!(t != "bad", "refusing {t}");
                texts.push(t);
                Ok(())
            }))
            .on_data_message(Handler::new_sync_infallible(|_: Bytes| panic!("data handler")));
        let (endpoint, remote) = endpoint("failing");
        let channel = Channel::new(endpoint, handlers, fx.loopback());

        remote.emit(RawEvent::TextMessage("bad"));
        remote.emit(RawEvent::DataMessage(b"x"));
        remote.emit(RawEvent::TextMessage("good"));
        fx.drain();

        assert_eq!(recorder.take(), vec!["good"]);
        assert_eq!(
            channel.stats(),
            ChannelStats {
                delivered: 1,
                unhandled: 0,
                failed: 2,
            },
        );
    }

    #[test]
    fn test_async_handlers_do_not_interleave() {
        let fx = Fixture::new();
        let recorder = Recorder::default();
        let texts = recorder.clone();
        let handlers = Handlers::new().on_text_message(Handler::new_async(async move |t: String| {
            texts.push(format!("{t}:begin"));
            relay_task::background::spawn(async {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            })
            .await;
            texts.push(format!("{t}:end"));
            anyhow::Ok(())
        }));
        let (endpoint, remote) = endpoint("async");
        let channel = Channel::new(endpoint, handlers, fx.loopback());

        remote.emit(RawEvent::TextMessage("a"));
        remote.emit(RawEvent::TextMessage("b"));
        fx.run_until(recorder.wait_for(4));

        assert_eq!(recorder.take(), vec!["a:begin", "a:end", "b:begin", "b:end"]);
        assert_eq!(channel.stats().delivered, 2);
    }

    #[test]
    fn test_async_handler_awaits_promise() {
        let fx = Fixture::new();
        let recorder = Recorder::default();
        let texts = recorder.clone();
        let loopback = fx.loopback();
        let handlers = Handlers::new().on_text_message(Handler::new_async(async move |t: String| {
            let reply = with_promise(&MemoryEngine, loopback.clone(), |op| {
                let remote = op
                    .as_any()
                    .downcast_ref::<MemoryPendingOperation>()
                    .unwrap()
                    .remote();
                let answer = format!("{t}:answer");
                std::thread::spawn(move || remote.reply(Some(Reply::new(answer))));
            })
            .await?;
            texts.push(reply.map(|r| r.name).unwrap_or_default());
            anyhow::Ok(())
        }));
        let (endpoint, remote) = endpoint("request");
        let channel = Channel::new(endpoint, handlers, fx.loopback());

        remote.emit(RawEvent::TextMessage("a"));
        remote.emit(RawEvent::TextMessage("b"));
        fx.run_until(recorder.wait_for(2));

        assert_eq!(recorder.take(), vec!["a:answer", "b:answer"]);
        assert_eq!(channel.stats().delivered, 2);
    }

    #[test]
    fn test_suspended_handler_does_not_block_other_channels() {
        let fx = Fixture::new();
        let recorder = Recorder::default();
        let (release, released) = futures::channel::oneshot::channel::<()>();
        let mut released = Some(released);
        let slow = recorder.clone();
        let slow_handler = Handler::new_async(async move |t: String| {
            if let Some(released) = released.take() {
                let _ = released.await;
            }
            slow.push(format!("slow:{t}"));
            anyhow::Ok(())
        });
        let slow_handlers = Handlers::new().on_text_message(slow_handler);
        let (slow_endpoint, slow_remote) = endpoint("slow");
        let _slow = Channel::new(slow_endpoint, slow_handlers, fx.loopback());
        let (fast_endpoint, fast_remote) = endpoint("fast");
        let fast_handlers =
            Handlers::new().on_text_message(recorder.handler(|t: String| format!("fast:{t}")));
        let _fast = Channel::new(fast_endpoint, fast_handlers, fx.loopback());

        slow_remote.emit(RawEvent::TextMessage("1"));
        slow_remote.emit(RawEvent::TextMessage("2"));
        fast_remote.emit(RawEvent::TextMessage("1"));
        fx.drain();
        assert_eq!(recorder.take(), vec!["fast:1"]);

        release.send(()).unwrap();
        fx.drain();
        assert_eq!(recorder.take(), vec!["slow:1", "slow:2"]);
    }

    #[test]
    fn test_wrong_kind_is_dropped() {
        let fx = Fixture::new();
        let recorder = Recorder::default();
        let (endpoint, _remote) = endpoint("confused");
        let channel = Channel::new(endpoint, recording_handlers(&recorder), fx.loopback());

        let trampoline =
            Channel::trampoline(EventKind::Opened, Handle::downgrade(&channel), fx.loopback());
        trampoline(RawEvent::TextMessage("misrouted"));
        trampoline(RawEvent::Opened);
        fx.drain();

        assert_eq!(recorder.take(), vec!["opened"]);
        assert_eq!(channel.stats().delivered, 1);
    }

    #[test]
    fn test_queued_events_survive_last_drop() {
        let fx = Fixture::new();
        let recorder = Recorder::default();
        let (endpoint, remote) = endpoint("drop");
        let channel = Channel::new(endpoint, recording_handlers(&recorder), fx.loopback());

        for i in 0..5 {
            remote.emit(RawEvent::TextMessage(&i.to_string()));
        }
        drop(channel);
        // The queued events keep the channel alive.
        assert_eq!(remote.subscriptions(), 6);

        fx.drain();
        assert_eq!(recorder.take(), vec!["text:0", "text:1", "text:2", "text:3", "text:4"]);
        assert_eq!(remote.subscriptions(), 0);

        assert_eq!(remote.emit(RawEvent::TextMessage("late")), 0);
        fx.drain();
        assert!(recorder.take().is_empty());
    }

    #[test]
    fn test_teardown_only_touches_own_subscriptions() {
        let fx = Fixture::new();
        let recorder = Recorder::default();
        let (first, remote) = MemoryEndpoint::new(ChannelInfo::new("shared"));
        let second = first.clone();
        let first = Channel::new(Box::new(first), recording_handlers(&recorder), fx.loopback());
        let second = Channel::new(Box::new(second), recording_handlers(&recorder), fx.loopback());
        assert_eq!(remote.subscriptions(), 12);

        drop(first);
        assert_eq!(remote.subscriptions(), 6);

        remote.emit(RawEvent::Opened);
        fx.drain();
        assert_eq!(recorder.take(), vec!["opened"]);
        assert_eq!(second.stats().delivered, 1);
    }

    #[test]
    fn test_ready_state_and_passthrough() {
        let fx = Fixture::new();
        let (endpoint, remote) = endpoint("state");
        let channel = Channel::new(endpoint, Handlers::new(), fx.loopback());

        assert_eq!(channel.ready_state(), ReadyState::Connecting);
        assert_eq!(
            channel.send_string("early"),
            Err(SendError::NotOpen(EndpointState::New)),
        );
        remote.emit(RawEvent::Opened);
        assert_eq!(channel.ready_state(), ReadyState::Open);

        channel.set_buffered_amount_low_threshold(64);
        assert_eq!(channel.buffered_amount_low_threshold(), 64);
        assert_eq!(channel.buffered_amount(), 0);
        assert_eq!(channel.info().label, "state");

        channel.close();
        assert_eq!(channel.ready_state(), ReadyState::Closed);
        fx.drain();
        assert_eq!(channel.stats().unhandled, 2);
    }
}
