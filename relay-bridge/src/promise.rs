//! One-shot asynchronous result holder.
//!
//! A [`Promise`] wraps an engine pending operation and
//! tells exactly one listener, exactly once, on the
//! foreground thread, that the operation has changed
//! state. The listener receives nothing: whatever the
//! operation produced is queried afterwards through
//! [`Promise::outcome`].

use crate::engine::{ChangeNotify, PendingOperation, PromiseEngine, PromiseResult, Reply};
use crate::event::ErrorInfo;
use crate::handle::{Handle, WeakHandle};
use crate::handler::panicked;
use parking_lot::Mutex;
use relay_task::{Deferred, Loopback};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

#[derive(Error, Clone, PartialEq, Eq, Debug)]
pub enum PromiseError {
    #[error("a listener is already registered")]
    ListenerAlreadyRegistered,
    #[error("operation is still pending")]
    Pending,
    #[error("operation was interrupted")]
    Interrupted,
    #[error("operation expired")]
    Expired,
    #[error("operation failed: {0}")]
    Rejected(ErrorInfo),
    #[error("promise was abandoned before it resolved")]
    Abandoned,
}

type Listener = Box<dyn FnOnce() + Send>;

enum ListenerSlot {
    Empty,
    Registered(Listener),
    Fired,
}

pub struct Promise {
    operation: Box<dyn PendingOperation>,
    resolved: AtomicBool,
    listener: Mutex<ListenerSlot>,
    this: WeakHandle<Promise>,
    loopback: Loopback,
}

impl Promise {
    /// Creates a pending promise bound to a fresh
    /// operation of the engine.
    ///
    /// Change notifications are delivered through the
    /// loopback, so the listener runs on the thread
    /// draining it. An engine that completes the
    /// operation before this returns is still observed.
    pub fn new(engine: &dyn PromiseEngine, loopback: Loopback) -> Handle<Promise> {
        let promise = Handle::new_cyclic(|weak| {
            let notify_weak = weak.clone();
            let notify_loopback = loopback.clone();
            let on_change: ChangeNotify =
                Arc::new(move || Promise::on_change(&notify_weak, &notify_loopback));
            Promise {
                operation: engine.create_pending_operation(on_change),
                resolved: AtomicBool::new(false),
                listener: Mutex::new(ListenerSlot::Empty),
                this: weak.clone(),
                loopback,
            }
        });
        // XXX: a notification fired during construction
        // could not upgrade the weak handle and is lost,
        // so look at the operation once more now.
        if promise.operation.result() != PromiseResult::Pending {
            Promise::enqueue(promise.clone(), Promise::deliver);
        }
        promise
    }

    /// Trampoline given to the engine, runs on any thread.
    fn on_change(weak: &WeakHandle<Promise>, loopback: &Loopback) {
        let Some(promise) = weak.upgrade() else {
            tracing::trace!("change notification after promise teardown ignored");
            return;
        };
        if loopback.defer(Deferred::from_fn(move || promise.deliver())).is_err() {
            tracing::warn!("consumer loop closed, dropping promise notification");
        }
    }

    fn enqueue(promise: Handle<Promise>, f: fn(&Promise)) {
        let loopback = promise.loopback.clone();
        if loopback.defer(Deferred::from_fn(move || f(&promise))).is_err() {
            tracing::warn!("consumer loop closed, dropping promise notification");
        }
    }

    /// Runs on the foreground thread.
    fn deliver(&self) {
        if self.resolved.swap(true, Ordering::AcqRel) {
            tracing::debug!("duplicate change notification ignored");
            return;
        }
        tracing::trace!(result = ?self.operation.result(), "promise resolved");
        self.fire_listener();
    }

    fn fire_listener(&self) {
        let listener = {
            let mut slot = self.listener.lock();
            match std::mem::replace(&mut *slot, ListenerSlot::Fired) {
                ListenerSlot::Registered(listener) => listener,
                other => {
                    *slot = other;
                    return;
                }
            }
        };
        if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(listener)) {
            tracing::error!(error = %panicked(payload), "promise listener failed");
        }
    }

    /// Registers the one listener of this promise.
    ///
    /// A second registration is rejected and the first
    /// listener stays in place. Registering on a promise
    /// that has already resolved queues the call on the
    /// foreground thread; the listener is never called
    /// from inside this method.
    pub fn register_listener<F>(&self, f: F) -> Result<(), PromiseError>
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut slot = self.listener.lock();
            if !matches!(*slot, ListenerSlot::Empty) {
                return Err(PromiseError::ListenerAlreadyRegistered);
            }
            *slot = ListenerSlot::Registered(Box::new(f));
        }
        // XXX: deliver() flips the flag before it looks
        // at the slot, and taking the listener out of the
        // slot is serialized by the lock, so whichever of
        // the two paths comes second finds nothing to fire.
        if self.is_resolved() {
            if let Some(promise) = self.this.upgrade() {
                Promise::enqueue(promise, Promise::fire_listener);
            }
        }
        Ok(())
    }

    /// Whether the change notification has been delivered.
    pub fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::Acquire)
    }

    pub fn result(&self) -> PromiseResult {
        self.operation.result()
    }

    pub fn reply(&self) -> Option<Reply> {
        self.operation.reply()
    }

    /// The operation's outcome as a result.
    pub fn outcome(&self) -> Result<Option<Reply>, PromiseError> {
        match self.operation.result() {
            PromiseResult::Pending => Err(PromiseError::Pending),
            PromiseResult::Interrupted => Err(PromiseError::Interrupted),
            PromiseResult::Expired => Err(PromiseError::Expired),
            PromiseResult::Replied => {
                let reply = self.operation.reply();
                match reply.as_ref().and_then(Reply::error) {
                    Some(error) => Err(PromiseError::Rejected(error)),
                    None => Ok(reply),
                }
            }
        }
    }

    pub fn interrupt(&self) {
        self.operation.interrupt();
    }

    /// The engine operation, to be attached to a request.
    pub fn operation(&self) -> &dyn PendingOperation {
        self.operation.as_ref()
    }
}

impl Drop for Promise {
    fn drop(&mut self) {
        if self.operation.result() == PromiseResult::Pending {
            tracing::debug!("interrupting pending operation of dropped promise");
            self.operation.interrupt();
        }
    }
}

impl std::fmt::Debug for Promise {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Promise")
            .field("result", &self.operation.result())
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

/// Runs an engine request and awaits its outcome.
///
/// A promise is created and its operation handed to
/// `f`, which attaches it to an engine request. The
/// returned future completes once the change has been
/// delivered on the foreground thread, so it must be
/// polled there too.
pub fn with_promise<F>(
    engine: &dyn PromiseEngine,
    loopback: Loopback,
    f: F,
) -> impl Future<Output = Result<Option<Reply>, PromiseError>> + 'static
where
    F: FnOnce(&dyn PendingOperation),
{
    let promise = Promise::new(engine, loopback);
    let (send, recv) = futures::channel::oneshot::channel::<()>();
    let registered = promise.register_listener(move || {
        let _ = send.send(());
    });
    f(promise.operation());
    async move {
        registered?;
        recv.await.map_err(|_| PromiseError::Abandoned)?;
        promise.outcome()
    }
}
