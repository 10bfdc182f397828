use futures::FutureExt;
use futures::channel::mpsc::{UnboundedReceiver, UnboundedSender, unbounded};
use futures::future::LocalBoxFuture;
use futures::stream::StreamExt;
use std::panic::AssertUnwindSafe;
use thiserror::Error;

/// Deferred unit of work for the foreground thread.
///
/// The closure itself is built on whichever thread
/// enqueues it, so it must be `Send`. What it returns
/// is only ever polled on the foreground thread, so
/// the produced future is free to be `!Send`, which
/// allows handlers to capture `Rc` and friends.
pub struct Deferred {
    run: Box<dyn FnOnce() -> LocalBoxFuture<'static, ()> + Send>,
}

impl Deferred {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        Self {
            run: Box::new(move || Box::pin(f())),
        }
    }

    /// Wraps a synchronous closure.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::new(move || {
            f();
            futures::future::ready(())
        })
    }

    fn into_future(self) -> LocalBoxFuture<'static, ()> {
        (self.run)()
    }
}

/// The consumer loop has gone away.
///
/// Returned by [`Loopback::defer`] once the foreground
/// spawner owning the receiving side has been disposed.
/// The rejected work is handed back, so the caller
/// decides where its captured resources are released.
#[derive(Error)]
#[error("consumer loop is closed")]
pub struct LoopClosed(pub Deferred);

impl std::fmt::Debug for LoopClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LoopClosed")
    }
}

/// Producer side of the foreground queue.
///
/// Cheap to clone and safe to use from any thread.
/// Enqueueing never blocks: the queue is unbounded,
/// and work enqueued from the same thread is drained
/// in the order it was enqueued.
#[derive(Clone)]
pub struct Loopback {
    send: UnboundedSender<Deferred>,
}

impl Loopback {
    pub fn defer(&self, deferred: Deferred) -> Result<(), LoopClosed> {
        self.send
            .unbounded_send(deferred)
            .map_err(|err| LoopClosed(err.into_inner()))
    }

    /// Whether the foreground thread still accepts work.
    pub fn is_closed(&self) -> bool {
        self.send.is_closed()
    }
}

impl std::fmt::Debug for Loopback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loopback")
            .field("closed", &self.send.is_closed())
            .finish()
    }
}

pub(crate) fn channel() -> (Loopback, UnboundedReceiver<Deferred>) {
    let (send, recv) = unbounded();
    (Loopback { send }, recv)
}

/// Drains the queue one item at a time.
///
/// Each deferred future is polled to completion before
/// the next one is taken, so no two of them interleave
/// even when they suspend. A panic is contained here,
/// the rest of the queue is unaffected.
pub(crate) async fn pump(mut recv: UnboundedReceiver<Deferred>) {
    while let Some(deferred) = recv.next().await {
        // Building the future runs the closure, which may
        // panic as well, so it has to happen inside.
        let result = AssertUnwindSafe(async move { deferred.into_future().await })
            .catch_unwind()
            .await;
        if result.is_err() {
            tracing::error!("deferred task panicked on the foreground thread");
        }
    }
    tracing::debug!("foreground queue closed");
}
