//! Event bridge between an engine and a single consumer loop.
//!
//! Engines report progress from their own threads. The
//! bridge wraps each engine object into a reference
//! counted entity, a [`Promise`] or a [`Channel`], whose
//! engine callbacks only capture, enqueue and return.
//! The consumer loop of `relay_task` then delivers the
//! captured events to the application one at a time, in
//! the order the engine fired them.
//!
//! Dropping the last handle of an entity detaches it
//! from its engine object exactly once. Callbacks the
//! engine fires afterwards are silently ignored, while
//! events queued before remain deliverable, since every
//! queued event holds its entity alive.

#[doc(hidden)]
pub mod handle;
pub use handle::{Handle, WeakHandle};

#[doc(hidden)]
pub mod event;
pub use event::{ChannelEvent, ErrorInfo, EventKind, RawEvent};

pub mod engine;

#[doc(hidden)]
pub mod handler;
pub use handler::{AsyncHandlerTrait, Handler};

#[doc(hidden)]
pub mod promise;
pub use promise::{Promise, PromiseError, with_promise};

#[doc(hidden)]
pub mod channel;
pub use channel::{Channel, ChannelStats, Handlers, ReadyState};

pub mod memory;

#[cfg(test)]
mod testutil;
