//! Contracts between the bridge and an engine.
//!
//! The engine is a black box to the bridge. It hands
//! out pending operations and channel endpoints, and
//! reports their progress by calling back into the
//! closures the bridge gave it, on whatever thread it
//! happens to be running. Every callback handed to an
//! engine stays safe to call after the bridged entity
//! it belongs to is gone.

use crate::event::{ErrorInfo, EventKind, RawEvent};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::any::Any;
use std::sync::Arc;
use thiserror::Error;

/// Called by the engine whenever a pending operation
/// changes state.
pub type ChangeNotify = Arc<dyn Fn() + Send + Sync>;

/// Called by the engine whenever an endpoint fires an
/// event of the subscribed kind.
pub type Trampoline = Arc<dyn for<'a> Fn(RawEvent<'a>) + Send + Sync>;

/// State of an engine pending operation.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PromiseResult {
    Pending,
    Interrupted,
    Replied,
    Expired,
}

/// Structured reply of a pending operation.
///
/// A reply carrying an `error` field that decodes into
/// an [`ErrorInfo`] is a failed reply.
#[derive(Clone, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct Reply {
    pub name: String,
    pub fields: Map<String, Value>,
}

impl Reply {
    pub const ERROR_FIELD: &'static str = "error";

    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn with_error(self, error: &ErrorInfo) -> Self {
        // ErrorInfo is plain strings and integers,
        // which always serialize.
        let value = serde_json::to_value(error).unwrap_or(Value::Null);
        self.with_field(Self::ERROR_FIELD, value)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn error(&self) -> Option<ErrorInfo> {
        let value = self.fields.get(Self::ERROR_FIELD)?;
        match serde_json::from_value(value.clone()) {
            Ok(error) => Some(error),
            Err(err) => {
                tracing::warn!(reply = %self.name, %err, "undecodable error field in reply");
                Some(ErrorInfo::new(-1, "reply", value.to_string()))
            }
        }
    }
}

/// Engine side of an asynchronous operation.
pub trait PendingOperation: Send + Sync + 'static {
    fn result(&self) -> PromiseResult;

    fn reply(&self) -> Option<Reply>;

    /// Abandon the operation if it's still pending.
    fn interrupt(&self);

    /// Access to the concrete engine type, which an
    /// engine-specific request needs to attach itself
    /// to the operation.
    fn as_any(&self) -> &dyn Any;
}

/// Factory of pending operations.
pub trait PromiseEngine {
    fn create_pending_operation(&self, on_change: ChangeNotify) -> Box<dyn PendingOperation>;
}

/// Token identifying one endpoint subscription.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SubscriptionToken(pub u64);

/// Engine state of a channel endpoint.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EndpointState {
    New,
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Construct-time description of an endpoint.
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub label: String,
    pub id: Option<u16>,
    pub protocol: String,
    pub ordered: bool,
    pub negotiated: bool,
    pub max_retransmits: Option<u16>,
    pub max_packet_life_time: Option<u16>,
}

impl ChannelInfo {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ordered: true,
            ..Self::default()
        }
    }
}

#[derive(Error, Clone, PartialEq, Eq, Debug)]
pub enum SendError {
    #[error("endpoint is not open ({0:?})")]
    NotOpen(EndpointState),
    #[error(transparent)]
    Engine(#[from] ErrorInfo),
}

/// Engine side of a channel.
///
/// The bridge owns its endpoint exclusively and only
/// ever calls it with the endpoint lock held, so
/// methods may take `&mut self`. Trampolines, on the
/// other hand, are called by the engine from its own
/// threads, possibly concurrently with these methods.
pub trait Endpoint: Send + 'static {
    fn subscribe(&mut self, kind: EventKind, trampoline: Trampoline) -> SubscriptionToken;

    /// Once this returns, the engine must not start
    /// another call of the trampoline. A call already
    /// in flight may still complete.
    fn unsubscribe(&mut self, token: SubscriptionToken);

    fn info(&self) -> ChannelInfo;

    fn state(&self) -> EndpointState;

    fn buffered_amount(&self) -> u64;

    fn buffered_amount_low_threshold(&self) -> u64;

    fn set_buffered_amount_low_threshold(&mut self, threshold: u64);

    fn send_data(&mut self, data: &[u8]) -> Result<(), SendError>;

    fn send_string(&mut self, text: &str) -> Result<(), SendError>;

    fn close(&mut self);
}
