use anyhow::{Result, anyhow};
use futures::FutureExt;
use futures::future::LocalBoxFuture;
use std::any::Any;
use std::panic::AssertUnwindSafe;

/// AsyncHandlerTrait that is dyn-compatible.
///
/// The original AsyncFnMut(E) is not dyn-compatible,
/// but the dispatch table requires to dynamically
/// dispatch events to the handlers, so we must pay
/// the price of boxing the futures.
pub trait AsyncHandlerTrait<E> {
    fn call_mut_boxed(&mut self, e: E) -> LocalBoxFuture<'_, Result<()>>;
}

impl<E, F> AsyncHandlerTrait<E> for F
where
    F: AsyncFnMut(E) -> Result<()>,
    E: 'static,
{
    fn call_mut_boxed(&mut self, e: E) -> LocalBoxFuture<'_, Result<()>> {
        // This is the trick, we create an outer
        // future to unify the CallRefFuture types.
        Box::pin(async move { (*self)(e).await })
    }
}

/// Handler for dynamically dispatching events.
///
/// A handler is installed from whatever thread builds
/// the channel, so it must be `Send`, but it is only
/// ever called on the foreground thread. The future
/// of an async handler therefore needs not be `Send`.
pub enum Handler<E> {
    Sync(Box<dyn FnMut(E) -> Result<()> + Send>),
    Async(Box<dyn AsyncHandlerTrait<E> + Send>),
}

impl<E> Handler<E>
where
    E: 'static,
{
    pub fn new_sync<F>(f: F) -> Handler<E>
    where
        F: FnMut(E) -> Result<()> + Send + 'static,
    {
        Handler::Sync(Box::new(f))
    }

    pub fn new_sync_infallible<F>(mut f: F) -> Handler<E>
    where
        F: FnMut(E) + Send + 'static,
    {
        Handler::new_sync(move |e| {
            f(e);
            Ok(())
        })
    }

    pub fn new_async<F>(f: F) -> Handler<E>
    where
        F: AsyncFnMut(E) -> Result<()> + Send + 'static,
    {
        Handler::Async(Box::new(f))
    }

    /// Invokes the handler and waits for it to finish.
    ///
    /// A panic inside the handler is turned into an
    /// error, so the caller observes every failure
    /// the same way.
    pub async fn call(&mut self, e: E) -> Result<()> {
        match self {
            Handler::Sync(f) => std::panic::catch_unwind(AssertUnwindSafe(|| f(e)))
                .unwrap_or_else(|payload| Err(panicked(payload))),
            Handler::Async(f) => AssertUnwindSafe(async move { f.call_mut_boxed(e).await })
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| Err(panicked(payload))),
        }
    }
}

pub(crate) fn panicked(payload: Box<dyn Any + Send>) -> anyhow::Error {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    anyhow!("handler panicked: {message}")
}
