//! Manipulation of the task framework itself.
//!
//! Normally the task module user does not need to care
//! about manipulating the task framework, so we move it
//! to a submodule to avoid overwhelming them.

use crate::foreground;
use crate::loopback::{self, Loopback, pump};
use crate::spawner::{BackgroundSpawner, ForegroundSpawner, SPAWNER, Spawner};
use anyhow::{Context, Result};
use core_affinity::{CoreId, get_core_ids, set_for_current};
use futures::executor::LocalPool;
use futures::task::LocalSpawnExt;
use rand::seq::IndexedRandom;
use std::cell::RefCell;
use std::cmp::{max, min};
use thread_priority::{ThreadPriority, set_current_thread_priority};

/// Configuration for the task framework.
#[derive(Default, Clone, Debug)]
pub struct Config {
    pub min_background_threads: Option<usize>,
    pub max_background_threads: Option<usize>,
    pub num_background_threads: Option<usize>,

    /// Whether to pin threads to cores and raise the
    /// foreground priority. Defaults to `true`.
    pub pin_threads: Option<bool>,
}

impl Config {
    /// Configuration overridden by the environment.
    ///
    /// `RELAY_BACKGROUND_THREADS` sets the exact number
    /// of background threads, `RELAY_PIN_THREADS` accepts
    /// `0`/`1`/`true`/`false`. Unset or empty variables
    /// leave the default in place.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Same as [`Config::from_env`], reading variables
    /// through `lookup` instead of the process environment.
    pub fn from_vars<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            let value = lookup(name)?;
            let value = value.trim();
            (!value.is_empty()).then(|| value.to_string())
        };
        let mut cfg = Self::default();
        if let Some(value) = var("RELAY_BACKGROUND_THREADS") {
            let threads = value
                .parse::<usize>()
                .with_context(|| format!("invalid RELAY_BACKGROUND_THREADS: {value:?}"))?;
            cfg.num_background_threads = Some(threads);
        }
        if let Some(value) = var("RELAY_PIN_THREADS") {
            cfg.pin_threads = Some(match value.as_str() {
                "1" | "true" => true,
                "0" | "false" => false,
                _ => anyhow::bail!("invalid RELAY_PIN_THREADS: {value:?}"),
            });
        }
        Ok(cfg)
    }
}

/// Currently initialized threading mode.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ThreadingMode {
    /// Disjoint mode is the ideal mode that
    /// multiple CPUs are available, and thus
    /// foreground thread and background threads
    /// may run on disjoint set of CPUs.
    ///
    /// This is the mode set whenever there're
    /// 2 or more CPUs permitted.
    Disjoint,

    /// Contended mode is the downgrade mode that
    /// only single CPU is available, and
    /// foreground thread and background threads
    /// have to run on that CPU.
    ///
    /// This mode is set when there's single CPU
    /// or we are unable to get permitted CPU set.
    Contended,

    /// Threads are left where the OS puts them.
    Unpinned,
}

/// Task framework initialization status.
pub struct Status {
    threading_mode: ThreadingMode,
    background_threads: usize,
}

impl Status {
    pub fn threading_mode(&self) -> ThreadingMode {
        self.threading_mode
    }

    pub fn background_threads(&self) -> usize {
        self.background_threads
    }
}

#[derive(Clone)]
enum ThreadInitializer {
    Disjoint { cores: Vec<CoreId> },
    Contended,
    Unpinned { cores: usize },
}

impl ThreadInitializer {
    fn detect(pin_threads: bool) -> Self {
        let cores = get_core_ids().unwrap_or_default();
        if !pin_threads {
            Self::Unpinned { cores: cores.len() }
        } else if cores.len() >= 2 {
            Self::Disjoint { cores }
        } else {
            Self::Contended
        }
    }

    fn configure_on_foreground(&self) {
        match self {
            Self::Disjoint { cores } => {
                set_for_current(cores[0]);
                let _ = set_current_thread_priority(ThreadPriority::Max);
                std::thread::yield_now();
            }
            Self::Contended => {
                let _ = set_current_thread_priority(ThreadPriority::Max);
            }
            Self::Unpinned { .. } => {}
        }
    }

    fn configure_on_background(&self) {
        match self {
            Self::Disjoint { cores } => {
                let mut rng = rand::rng();
                if let Some(core) = cores[1..].choose(&mut rng) {
                    set_for_current(*core);
                }
            }
            Self::Contended => {
                let _ = set_current_thread_priority(ThreadPriority::Min);
            }
            Self::Unpinned { .. } => {}
        }
    }

    fn recommend_num_backgrounds(&self) -> usize {
        match self {
            Self::Disjoint { cores } => cores.len() - 1,
            Self::Contended => 1,
            Self::Unpinned { cores } => cores.saturating_sub(1),
        }
    }

    fn threading_mode(&self) -> ThreadingMode {
        match self {
            Self::Disjoint { cores: _ } => ThreadingMode::Disjoint,
            Self::Contended => ThreadingMode::Contended,
            Self::Unpinned { .. } => ThreadingMode::Unpinned,
        }
    }
}

/// Initialized framework handle.
///
/// This handle is used to control the lifecycle
/// of the whole system. By dropping it, you
/// dispose the entire framework: the foreground
/// queue closes, deferred work still queued is
/// dropped without running, and the background
/// pool shuts down.
pub struct Framework {
    status: Status,
}

impl Framework {
    pub fn status(&self) -> &Status {
        &self.status
    }

    /// Producer side of this framework's foreground queue.
    pub fn loopback(&self) -> Loopback {
        crate::loopback()
    }
}

impl Drop for Framework {
    fn drop(&mut self) {
        foreground::assert();
        tracing::debug!("disposing task framework");
        drop(SPAWNER.replace(Spawner::Uninit))
    }
}

/// Initialize the task framework.
///
/// The calling thread becomes the foreground thread,
/// which is the only thread to ever run handlers of
/// deferred work. Initializing twice on the same
/// thread without dropping the first [`Framework`]
/// is an error.
pub fn initialize(cfg: Config) -> Result<Framework> {
    SPAWNER.with_borrow(|v| match v {
        Spawner::Uninit => Ok(()),
        _ => Err(anyhow::anyhow!("Initialized framework in use.")),
    })?;

    let initializer = ThreadInitializer::detect(cfg.pin_threads.unwrap_or(true));

    let mut num_workers = initializer.recommend_num_backgrounds();
    num_workers = max(1, num_workers);
    if let Some(min_background_threads) = cfg.min_background_threads {
        num_workers = max(min_background_threads, num_workers);
    }
    if let Some(max_background_threads) = cfg.max_background_threads {
        num_workers = min(max_background_threads, num_workers);
    }
    if let Some(num_background_threads) = cfg.num_background_threads {
        num_workers = num_background_threads;
    }
    num_workers = max(1, num_workers);

    let (loopback, loopback_recv) = loopback::channel();

    let thread_loopback = loopback.clone();
    let thread_initializer = initializer.clone();
    let tokio_runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_workers)
        .thread_name("relay-background")
        .on_thread_start(move || {
            thread_initializer.configure_on_background();
            SPAWNER.with_borrow_mut(|v| {
                *v = Spawner::Background(BackgroundSpawner {
                    loopback: thread_loopback.clone(),
                    runtime: tokio::runtime::Handle::current(),
                });
            })
        })
        .on_thread_stop(|| {
            SPAWNER.with_borrow_mut(|v| *v = Spawner::Uninit);
        })
        .enable_all()
        .build()
        .context("failed to build background runtime")?;

    initializer.configure_on_foreground();
    let local_pool = LocalPool::new();
    let local_spawner = local_pool.spawner();
    local_spawner
        .spawn_local(pump(loopback_recv))
        .context("failed to spawn foreground queue")?;
    SPAWNER.with_borrow_mut(|v| {
        *v = Spawner::Foreground(ForegroundSpawner {
            local_pool: RefCell::new(local_pool),
            local_spawner,
            tokio_runtime,
            loopback,
        });
    });

    tracing::debug!(
        background_threads = num_workers,
        threading_mode = ?initializer.threading_mode(),
        "task framework initialized",
    );
    Ok(Framework {
        status: Status {
            threading_mode: initializer.threading_mode(),
            background_threads: num_workers,
        },
    })
}
