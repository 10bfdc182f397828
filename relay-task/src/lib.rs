//! Async-based task framework for the event bridge.
//!
//! An engine fires its callbacks on whatever threads
//! it likes, while the application wants to observe
//! every one of them on a single thread, one at a
//! time, in the order they were fired. This crate
//! provides that single thread.
//!
//! The thread calling [`framework::initialize`]
//! becomes the foreground thread. It owns a local
//! executor plus the receiving side of an unbounded
//! queue, the loopback. Any thread holding a
//! [`Loopback`] may defer work to the foreground
//! thread without ever blocking, and the foreground
//! thread runs that work strictly one item after
//! another in arrival order.
//!
//! Beside the foreground thread, the framework runs
//! a tokio multi-thread pool for background work,
//! which never shares a thread with the foreground.
//! Whenever it's possible, the foreground thread and
//! the background threads are pinned on disjoint
//! CPUs, so that a busy pool does not delay the
//! delivery of events.

#[doc(hidden)]
pub mod spawner;
#[rustfmt::skip]
pub use spawner::{
    Handle, Type,
    spawn_foreground,
    dispatch_background,
    dispatch_foreground,
    loopback,
    background,
    run_foreground,
    run_until,
    current_type,
};

#[doc(hidden)]
pub mod loopback;
pub use loopback::{Deferred, LoopClosed, Loopback};

pub mod foreground {
    //! Task primitives in foreground thread flavour.
    //!
    //! This allows the function which is dedicated
    //! to a foreground thread to directly write
    //! `use relay_task::foreground`, and then
    //! `foreground::spawn` or `foreground::dispatch`.
    pub use super::dispatch_background as dispatch;
    pub use super::spawn_foreground as spawn;

    /// Assert current thread is a foreground thread.
    pub fn assert() {
        assert!(
            super::current_type() == super::Type::Foreground,
            "Not running on a foreground thread.",
        );
    }
}

pub mod background {
    //! Task primitives in background thread flavour.
    //!
    //! This allows the function which is dedicated
    //! to background threads to directly write
    //! `use relay_task::background`, and then
    //! `background::spawn` or `background::loopback`.
    pub use super::dispatch_background as spawn;
    pub use super::dispatch_foreground as loopback;

    /// Assert current thread is a background thread.
    pub fn assert() {
        assert!(
            super::current_type() == super::Type::Background,
            "Not running on a background thread.",
        );
    }
}

pub mod framework;
