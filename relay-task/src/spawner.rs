use crate::loopback::{Deferred, Loopback};
use futures::FutureExt;
use futures::executor::{LocalPool, LocalSpawner};
use futures::future::RemoteHandle;
use futures::task::LocalSpawnExt;
use std::cell::RefCell;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::runtime::Runtime;

/// Task handle trait.
///
/// This handle is used to receive result from the
/// task, as well as controlling the task like
/// cancelling and detaching it:
///
/// - Awaiting this handle receives the result.
/// - Dropping this handle cancels the task.
/// - Calling `detach` consumes and detaches the task.
pub trait Handle<T>: Future<Output = T>
where
    T: 'static,
{
    fn detach(self);
}

struct TaskHandle<T>
where
    T: 'static,
{
    handle: RemoteHandle<T>,
}

impl<T> TaskHandle<T>
where
    T: 'static,
{
    pub fn new(handle: RemoteHandle<T>) -> Self {
        Self { handle }
    }
}

impl<T> Future for TaskHandle<T>
where
    T: 'static,
{
    type Output = T;
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.handle.poll_unpin(cx)
    }
}

impl<T> Handle<T> for TaskHandle<T>
where
    T: 'static,
{
    fn detach(self) {
        self.handle.forget();
    }
}

fn loopback_future<F, T>(loopback: &Loopback, future: F) -> TaskHandle<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let (remote, handle) = future.remote_handle();
    // XXX: the foreground spawner holds one sender for
    // as long as it lives, so this only fails while the
    // framework is being torn down. Awaiting the handle
    // then panics like any other cancelled remote.
    if loopback.defer(Deferred::new(move || remote)).is_err() {
        tracing::warn!("foreground loop closed, dropping loopback future");
    }
    TaskHandle::new(handle)
}

pub(crate) struct ForegroundSpawner {
    pub(crate) local_pool: RefCell<LocalPool>,
    pub(crate) local_spawner: LocalSpawner,
    pub(crate) tokio_runtime: Runtime,
    pub(crate) loopback: Loopback,
}

impl ForegroundSpawner {
    fn spawn_foreground<F, T>(&self, future: F) -> TaskHandle<T>
    where
        F: Future<Output = T> + 'static,
        T: 'static,
    {
        let (remote, handle) = future.remote_handle();
        // XXX: spawning on a LocalSpawner only fails once
        // the pool is gone, and the pool outlives us.
        if self.local_spawner.spawn_local(remote).is_err() {
            tracing::warn!("foreground pool shut down, dropping future");
        }
        TaskHandle::new(handle)
    }

    fn spawn_background<F, T>(&self, future: F) -> TaskHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        // XXX: The foreground thread does not have tokio
        // context initialized, so we will need to use
        // the tokio_runtime handle to create the task.
        let (remote, handle) = future.remote_handle();
        let _ = self.tokio_runtime.spawn(remote);
        TaskHandle::new(handle)
    }

    fn run_foreground(&self) {
        // XXX: This is okay since there's only one
        // foreground thread.
        self.local_pool.borrow_mut().run_until_stalled();
    }

    fn run_until<F>(&self, future: F) -> F::Output
    where
        F: Future,
    {
        self.local_pool.borrow_mut().run_until(future)
    }
}

pub(crate) struct BackgroundSpawner {
    pub(crate) loopback: Loopback,
    pub(crate) runtime: tokio::runtime::Handle,
}

impl BackgroundSpawner {
    fn spawn_background<F, T>(&self, future: F) -> TaskHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        // XXX: Every background thread will enter the
        // tokio context, so we can use tokio::spawn.
        let (remote, handle) = future.remote_handle();
        let _ = tokio::spawn(remote);
        TaskHandle::new(handle)
    }
}

/// Enumeration of the task / thread types.
///
/// Each thread is only allowed to execute one type
/// of task, so there's no ambiguity while querying
/// the type. Threads never touched by the framework,
/// such as an engine's own streaming threads, stay
/// `Uninit` and may only talk to the foreground
/// through a [`Loopback`] captured elsewhere.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum Type {
    Uninit,
    Foreground,
    Background,
}

pub(crate) enum Spawner {
    Uninit,
    Foreground(ForegroundSpawner),
    Background(BackgroundSpawner),
}

thread_local! {
    pub(crate) static SPAWNER: RefCell<Spawner> = const { RefCell::new(Spawner::Uninit) };
}

impl Spawner {
    fn panic_uninit<T>(&self) -> T {
        panic!("Task framework not initialized");
    }

    fn foreground(&self) -> &ForegroundSpawner {
        match self {
            Spawner::Foreground(fg) => fg,
            Spawner::Uninit => self.panic_uninit(),
            _ => {
                panic!("Not on foreground thread");
            }
        }
    }

    fn loopback(&self) -> &Loopback {
        match self {
            Spawner::Foreground(fg) => &fg.loopback,
            Spawner::Background(bg) => &bg.loopback,
            Spawner::Uninit => self.panic_uninit(),
        }
    }

    fn which_type(&self) -> Type {
        match self {
            Spawner::Foreground(_) => Type::Foreground,
            Spawner::Background(_) => Type::Background,
            Spawner::Uninit => Type::Uninit,
        }
    }
}

/// Spawn a foreground task from foreground thread.
///
/// This function can only be called from the foreground
/// thread. Actually, if a background thread want to run
/// a task in foreground thread, the Future must be Send,
/// while this method does not enforces it.
#[must_use = "Dropping the Handle is equivalent to canceling the future."]
pub fn spawn_foreground<F, T>(future: F) -> impl Handle<T>
where
    F: Future<Output = T> + 'static,
    T: 'static,
{
    SPAWNER.with_borrow(|w| w.foreground().spawn_foreground(future))
}

/// Spawns a background task.
///
/// This function can either be called from a foreground
/// thread or a background thread, and the future must be
/// Send since we are using tokio as the task executor,
/// which will possibly move tasks between threads.
#[must_use = "Dropping the Handle is equivalent to canceling the future."]
pub fn dispatch_background<F, T>(future: F) -> impl Handle<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    SPAWNER.with_borrow(|w| {
        // WARN: calling tokio::spawn requires tokio context, which
        // is available on background thread, while we must explicitly
        // call tokio_runtime.spawn on foreground thread.
        match w {
            Spawner::Foreground(fg) => fg.spawn_background(future),
            Spawner::Background(bg) => bg.spawn_background(future),
            Spawner::Uninit => w.panic_uninit(),
        }
    })
}

/// Spawns a foreground task.
///
/// This function can either be called from a foreground
/// thread or a background thread, and the future must be
/// Send since the future is sent to the foreground thread
/// through the loopback queue. The result will also need
/// to be moved to the calling thread.
///
/// Unlike [`spawn_foreground`], the future is queued
/// behind every piece of deferred work already sent to
/// the foreground thread, and runs exclusively until it
/// completes.
#[must_use = "Dropping the Handle is equivalent to canceling the future."]
pub fn dispatch_foreground<F, T>(future: F) -> impl Handle<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    SPAWNER.with_borrow(|w| loopback_future(w.loopback(), future))
}

/// Fetch the producer side of the foreground queue.
///
/// Must be called from the foreground thread or a
/// background thread. The returned [`Loopback`] may
/// then be moved to any thread, including threads
/// the framework knows nothing about.
pub fn loopback() -> Loopback {
    SPAWNER.with_borrow(|w| w.loopback().clone())
}

/// Fetch the handle of the background worker pool.
///
/// Must be called from the foreground thread or a
/// background thread.
pub fn background() -> tokio::runtime::Handle {
    SPAWNER.with_borrow(|w| match w {
        Spawner::Foreground(fg) => fg.tokio_runtime.handle().clone(),
        Spawner::Background(bg) => bg.runtime.clone(),
        Spawner::Uninit => w.panic_uninit(),
    })
}

/// Runs the foreground tasks until stalled.
///
/// This function must only be called from the
/// foreground thread, and not from inside one of
/// its tasks. It drains every piece of deferred work
/// queued so far and returns as soon as all
/// foreground tasks are stalled.
pub fn run_foreground() {
    SPAWNER.with_borrow(|w| {
        w.foreground().run_foreground();
    })
}

/// Runs the foreground tasks until the future is ready.
///
/// The foreground thread parks while there's nothing
/// to do, and is woken by the loopback queue when a
/// worker thread defers work to it. This function must
/// only be called from the foreground thread, and not
/// from inside one of its tasks.
pub fn run_until<F>(future: F) -> F::Output
where
    F: Future,
{
    SPAWNER.with_borrow(|w| w.foreground().run_until(future))
}

/// Returns the current task / thread type.
pub fn current_type() -> Type {
    SPAWNER.with_borrow(Spawner::which_type)
}
