//! In-process engine.
//!
//! This engine keeps everything in memory, which makes
//! it suitable for tests and for wiring two channels
//! of the same process together. Its callbacks run on
//! whichever thread drives it: the caller of a remote
//! method, or a background worker for [`pair`].

use crate::engine::{
    ChangeNotify, ChannelInfo, Endpoint, EndpointState, PendingOperation, PromiseEngine,
    PromiseResult, Reply, SendError, SubscriptionToken, Trampoline,
};
use crate::event::{ChannelEvent, ErrorInfo, EventKind, RawEvent};
use bytes::Bytes;
use futures::StreamExt;
use futures::channel::mpsc::{UnboundedSender, unbounded};
use parking_lot::Mutex;
use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

const DOMAIN: &str = "memory";

/// Engine handing out in-memory pending operations.
#[derive(Clone, Copy, Default, Debug)]
pub struct MemoryEngine;

impl PromiseEngine for MemoryEngine {
    fn create_pending_operation(&self, on_change: ChangeNotify) -> Box<dyn PendingOperation> {
        Box::new(MemoryPendingOperation {
            shared: Arc::new(OperationShared {
                state: Mutex::new((PromiseResult::Pending, None)),
                on_change,
            }),
        })
    }
}

struct OperationShared {
    state: Mutex<(PromiseResult, Option<Reply>)>,
    on_change: ChangeNotify,
}

impl OperationShared {
    fn transition(&self, result: PromiseResult, reply: Option<Reply>) -> bool {
        {
            let mut state = self.state.lock();
            if state.0 != PromiseResult::Pending {
                return false;
            }
            *state = (result, reply);
        }
        (self.on_change)();
        true
    }
}

pub struct MemoryPendingOperation {
    shared: Arc<OperationShared>,
}

impl MemoryPendingOperation {
    /// The side of the operation that completes it.
    pub fn remote(&self) -> MemoryPromiseRemote {
        MemoryPromiseRemote {
            shared: self.shared.clone(),
        }
    }
}

impl PendingOperation for MemoryPendingOperation {
    fn result(&self) -> PromiseResult {
        self.shared.state.lock().0
    }

    fn reply(&self) -> Option<Reply> {
        self.shared.state.lock().1.clone()
    }

    fn interrupt(&self) {
        self.shared.transition(PromiseResult::Interrupted, None);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Completes an in-memory operation from any thread.
///
/// Each completion returns whether it took effect:
/// only the first one out of pending does, later ones
/// leave the operation and its listeners alone.
#[derive(Clone)]
pub struct MemoryPromiseRemote {
    shared: Arc<OperationShared>,
}

impl MemoryPromiseRemote {
    pub fn reply(&self, reply: Option<Reply>) -> bool {
        self.shared.transition(PromiseResult::Replied, reply)
    }

    pub fn expire(&self) -> bool {
        self.shared.transition(PromiseResult::Expired, None)
    }

    /// Fires the change callback without changing state.
    pub fn notify(&self) {
        (self.shared.on_change)();
    }

    pub fn result(&self) -> PromiseResult {
        self.shared.state.lock().0
    }
}

#[derive(Default)]
struct Subscribers {
    next: u64,
    entries: Vec<(SubscriptionToken, EventKind, Trampoline)>,
}

struct EndpointShared {
    subscribers: Mutex<Subscribers>,
    state: Mutex<EndpointState>,
    buffered_amount: AtomicU64,
    threshold: AtomicU64,
}

impl EndpointShared {
    fn new() -> Self {
        Self {
            subscribers: Mutex::new(Subscribers::default()),
            state: Mutex::new(EndpointState::New),
            buffered_amount: AtomicU64::new(0),
            threshold: AtomicU64::new(0),
        }
    }

    fn emit(&self, event: RawEvent<'_>) -> usize {
        match event {
            RawEvent::Opened => *self.state.lock() = EndpointState::Open,
            RawEvent::Closed => *self.state.lock() = EndpointState::Closed,
            _ => {}
        }
        let kind = event.kind();
        let trampolines: Vec<Trampoline> = self
            .subscribers
            .lock()
            .entries
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .map(|(_, _, trampoline)| trampoline.clone())
            .collect();
        // Call without the lock, so a trampoline is free
        // to unsubscribe or tear its channel down.
        for trampoline in &trampolines {
            trampoline(event);
        }
        trampolines.len()
    }
}

/// In-memory channel endpoint.
///
/// Clones refer to the same endpoint, each clone
/// managing only the subscriptions it has made.
#[derive(Clone)]
pub struct MemoryEndpoint {
    shared: Arc<EndpointShared>,
    info: ChannelInfo,
    peer: Option<UnboundedSender<ChannelEvent>>,
}

impl MemoryEndpoint {
    pub fn new(info: ChannelInfo) -> (Self, MemoryEndpointRemote) {
        let endpoint = Self {
            shared: Arc::new(EndpointShared::new()),
            info,
            peer: None,
        };
        let remote = endpoint.remote();
        (endpoint, remote)
    }

    pub fn remote(&self) -> MemoryEndpointRemote {
        MemoryEndpointRemote {
            shared: self.shared.clone(),
        }
    }

    fn check_open(&self) -> Result<(), SendError> {
        match *self.shared.state.lock() {
            EndpointState::Open => Ok(()),
            state => Err(SendError::NotOpen(state)),
        }
    }

    fn send(&self, event: ChannelEvent) -> Result<(), SendError> {
        self.check_open()?;
        let peer = self
            .peer
            .as_ref()
            .ok_or_else(|| ErrorInfo::new(1, DOMAIN, "endpoint has no peer"))?;
        peer.unbounded_send(event)
            .map_err(|_| ErrorInfo::new(2, DOMAIN, "peer is gone").into())
    }
}

impl Endpoint for MemoryEndpoint {
    fn subscribe(&mut self, kind: EventKind, trampoline: Trampoline) -> SubscriptionToken {
        let mut subscribers = self.shared.subscribers.lock();
        let token = SubscriptionToken(subscribers.next);
        subscribers.next += 1;
        subscribers.entries.push((token, kind, trampoline));
        token
    }

    fn unsubscribe(&mut self, token: SubscriptionToken) {
        self.shared
            .subscribers
            .lock()
            .entries
            .retain(|(t, _, _)| *t != token);
    }

    fn info(&self) -> ChannelInfo {
        self.info.clone()
    }

    fn state(&self) -> EndpointState {
        *self.shared.state.lock()
    }

    fn buffered_amount(&self) -> u64 {
        self.shared.buffered_amount.load(Ordering::Acquire)
    }

    fn buffered_amount_low_threshold(&self) -> u64 {
        self.shared.threshold.load(Ordering::Acquire)
    }

    fn set_buffered_amount_low_threshold(&mut self, threshold: u64) {
        self.shared.threshold.store(threshold, Ordering::Release);
    }

    fn send_data(&mut self, data: &[u8]) -> Result<(), SendError> {
        self.send(ChannelEvent::DataMessage(Bytes::copy_from_slice(data)))
    }

    fn send_string(&mut self, text: &str) -> Result<(), SendError> {
        self.send(ChannelEvent::TextMessage(text.to_owned()))
    }

    fn close(&mut self) {
        {
            let mut state = self.shared.state.lock();
            if *state == EndpointState::Closed {
                return;
            }
            *state = EndpointState::Closing;
        }
        if let Some(peer) = self.peer.as_ref() {
            if peer.unbounded_send(ChannelEvent::Closed).is_err() {
                tracing::trace!(label = %self.info.label, "peer gone, close not forwarded");
            }
        }
        self.shared.emit(RawEvent::Closed);
    }
}

/// Drives an in-memory endpoint from any thread.
#[derive(Clone)]
pub struct MemoryEndpointRemote {
    shared: Arc<EndpointShared>,
}

impl MemoryEndpointRemote {
    /// Fires the event to every matching subscription
    /// and returns how many there were.
    ///
    /// `Opened` and `Closed` also move the endpoint to
    /// the corresponding state.
    pub fn emit(&self, event: RawEvent<'_>) -> usize {
        self.shared.emit(event)
    }

    /// Updates the amount of queued outgoing data.
    ///
    /// Dropping from above the threshold to at or
    /// below it fires `BufferedAmountLow`.
    pub fn set_buffered_amount(&self, amount: u64) {
        let previous = self.shared.buffered_amount.swap(amount, Ordering::AcqRel);
        let threshold = self.shared.threshold.load(Ordering::Acquire);
        if previous > threshold && amount <= threshold {
            self.shared.emit(RawEvent::BufferedAmountLow);
        }
    }

    pub fn subscriptions(&self) -> usize {
        self.shared.subscribers.lock().entries.len()
    }

    pub fn state(&self) -> EndpointState {
        *self.shared.state.lock()
    }
}

/// Builds two endpoints connected to each other.
///
/// Whatever one side sends arrives on the other side
/// as a message event, fired by a task on the given
/// runtime, so it reaches the subscribers from a
/// worker thread in the order it was sent. Closing
/// either side closes both. Both endpoints start in
/// the new state; fire `Opened` on their remotes to
/// open them.
pub fn pair(
    runtime: &tokio::runtime::Handle,
    info: ChannelInfo,
) -> (MemoryEndpoint, MemoryEndpoint) {
    let (mut left, left_remote) = MemoryEndpoint::new(info.clone());
    let (mut right, right_remote) = MemoryEndpoint::new(info);
    left.peer = Some(link(runtime, right_remote));
    right.peer = Some(link(runtime, left_remote));
    (left, right)
}

fn link(
    runtime: &tokio::runtime::Handle,
    target: MemoryEndpointRemote,
) -> UnboundedSender<ChannelEvent> {
    let (send, mut recv) = unbounded::<ChannelEvent>();
    runtime.spawn(async move {
        while let Some(event) = recv.next().await {
            target.emit(event.as_raw());
        }
    });
    send
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::channel::{Channel, Handlers, ReadyState};
    use crate::testutil::{Fixture, Recorder};

    #[test]
    fn test_operation_completes_once() {
        let notified = Arc::new(AtomicU64::new(0));
        let counter = notified.clone();
        let op = MemoryEngine.create_pending_operation(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let remote = op
            .as_any()
            .downcast_ref::<MemoryPendingOperation>()
            .unwrap()
            .remote();

        assert!(remote.reply(Some(Reply::new("first"))));
        assert!(!remote.expire());
        op.interrupt();
        assert_eq!(op.result(), PromiseResult::Replied);
        assert_eq!(op.reply(), Some(Reply::new("first")));
        assert_eq!(notified.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_buffered_amount_low_edge() {
        let (mut endpoint, remote) = MemoryEndpoint::new(ChannelInfo::new("low"));
        let fired = Arc::new(AtomicU64::new(0));
        let counter = fired.clone();
        endpoint.set_buffered_amount_low_threshold(10);
        endpoint.subscribe(
            EventKind::BufferedAmountLow,
            Arc::new(move |_: RawEvent<'_>| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        remote.set_buffered_amount(50);
        remote.set_buffered_amount(20);
        remote.set_buffered_amount(5);
        remote.set_buffered_amount(0);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(endpoint.buffered_amount(), 0);
    }

    #[test]
    fn test_vanished_peer() {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let (mut left, _right) = pair(runtime.handle(), ChannelInfo::new("orphan"));
        let remote = left.remote();
        remote.emit(RawEvent::Opened);
        // Shutting the runtime down drops the forwarding tasks.
        drop(runtime);

        match left.send_string("anyone?") {
            Err(SendError::Engine(error)) => assert_eq!(error.domain, DOMAIN),
            other => panic!("unexpected send result: {other:?}"),
        }
        left.close();
        assert_eq!(remote.state(), EndpointState::Closed);
    }

    #[test]
    fn test_pair_round_trip() {
        let fx = Fixture::new();
        let recorder = Recorder::default();
        let (left, right) = pair(&relay_task::background(), ChannelInfo::new("pair"));
        let (left_remote, right_remote) = (left.remote(), right.remote());

        let left = Channel::new(
            Box::new(left),
            Handlers::new()
                .on_opened(recorder.handler(|()| "left:opened".to_string()))
                .on_text_message(recorder.handler(|t: String| format!("left:{t}")))
                .on_closed(recorder.handler(|()| "left:closed".to_string())),
            fx.loopback(),
        );
        let right = Channel::new(
            Box::new(right),
            Handlers::new()
                .on_data_message(recorder.handler(|d: Bytes| format!("right:{:?}", &d[..])))
                .on_text_message(recorder.handler(|t: String| format!("right:{t}")))
                .on_closed(recorder.handler(|()| "right:closed".to_string())),
            fx.loopback(),
        );

        left_remote.emit(RawEvent::Opened);
        right_remote.emit(RawEvent::Opened);
        assert_eq!(left.ready_state(), ReadyState::Open);

        left.send_string("ping").unwrap();
        left.send_data(&[9, 8]).unwrap();
        right.send_string("pong").unwrap();
        fx.run_until(recorder.wait_for(4));
        let mut seen = recorder.take();
        // The two directions are independent of each other.
        let right_side: Vec<_> = seen.iter().filter(|s| s.starts_with("right:")).cloned().collect();
        assert_eq!(right_side, vec!["right:ping", "right:[9, 8]"]);
        seen.retain(|s| s.starts_with("left:"));
        assert_eq!(seen, vec!["left:opened", "left:pong"]);

        left.close();
        fx.run_until(recorder.wait_for(2));
        let mut closed = recorder.take();
        closed.sort();
        assert_eq!(closed, vec!["left:closed", "right:closed"]);
        assert_eq!(right.ready_state(), ReadyState::Closed);
        assert!(matches!(left.send_string("late"), Err(SendError::NotOpen(_))));
    }
}
