use crate::handler::Handler;
use futures::task::AtomicWaker;
use parking_lot::Mutex;
use relay_task::Loopback;
use relay_task::framework::{Config, Framework, initialize};
use std::sync::Arc;
use std::task::Poll;

/// Task framework for a single test, with the test
/// thread as its foreground thread.
pub(crate) struct Fixture {
    framework: Framework,
}

impl Fixture {
    pub fn new() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        let framework = initialize(Config {
            num_background_threads: Some(2),
            pin_threads: Some(false),
            ..Config::default()
        })
        .unwrap();
        Self { framework }
    }

    pub fn loopback(&self) -> Loopback {
        self.framework.loopback()
    }

    /// Runs everything queued so far.
    pub fn drain(&self) {
        relay_task::run_foreground();
    }

    pub fn run_until<F: Future>(&self, future: F) -> F::Output {
        relay_task::run_until(future)
    }
}

/// Collects what the handlers observed.
#[derive(Clone, Default)]
pub(crate) struct Recorder {
    entries: Arc<Mutex<Vec<String>>>,
    waker: Arc<AtomicWaker>,
}

impl Recorder {
    pub fn push(&self, entry: impl Into<String>) {
        self.entries.lock().push(entry.into());
        self.waker.wake();
    }

    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.entries.lock())
    }

    pub fn handler<E, F>(&self, f: F) -> Handler<E>
    where
        E: 'static,
        F: Fn(E) -> String + Send + 'static,
    {
        let recorder = self.clone();
        Handler::new_sync_infallible(move |e| recorder.push(f(e)))
    }

    /// Resolves once `n` entries are waiting to be taken.
    pub fn wait_for(&self, n: usize) -> impl Future<Output = ()> + use<> {
        let recorder = self.clone();
        futures::future::poll_fn(move |cx| {
            recorder.waker.register(cx.waker());
            if recorder.entries.lock().len() >= n {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        })
    }
}
