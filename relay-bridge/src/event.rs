//! Channel event kinds and payloads.
//!
//! An engine reports an event as a [`RawEvent`], which
//! only borrows memory owned by the engine for the
//! duration of its callback. The bridge copies it into
//! a [`ChannelEvent`] before the callback returns, and
//! only that owned copy travels to the foreground.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The six kinds of channel events.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum EventKind {
    Opened,
    Closed,
    Errored,
    DataMessage,
    TextMessage,
    BufferedAmountLow,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::Opened,
        EventKind::Closed,
        EventKind::Errored,
        EventKind::DataMessage,
        EventKind::TextMessage,
        EventKind::BufferedAmountLow,
    ];

    pub fn name(self) -> &'static str {
        match self {
            EventKind::Opened => "opened",
            EventKind::Closed => "closed",
            EventKind::Errored => "errored",
            EventKind::DataMessage => "data-message",
            EventKind::TextMessage => "text-message",
            EventKind::BufferedAmountLow => "buffered-amount-low",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Error reported by the engine.
///
/// This is ordinary payload data: the bridge delivers
/// it to the `errored` handler and never raises it.
#[derive(Error, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[error("{domain} error {code}: {message}")]
pub struct ErrorInfo {
    pub code: i32,
    pub domain: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: i32, domain: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            domain: domain.into(),
            message: message.into(),
        }
    }
}

/// Event as seen inside an engine callback.
#[derive(Clone, Copy, Debug)]
pub enum RawEvent<'a> {
    Opened,
    Closed,
    Errored {
        code: i32,
        domain: &'a str,
        message: &'a str,
    },
    DataMessage(&'a [u8]),
    TextMessage(&'a str),
    BufferedAmountLow,
}

impl RawEvent<'_> {
    pub fn kind(&self) -> EventKind {
        match self {
            RawEvent::Opened => EventKind::Opened,
            RawEvent::Closed => EventKind::Closed,
            RawEvent::Errored { .. } => EventKind::Errored,
            RawEvent::DataMessage(_) => EventKind::DataMessage,
            RawEvent::TextMessage(_) => EventKind::TextMessage,
            RawEvent::BufferedAmountLow => EventKind::BufferedAmountLow,
        }
    }

    /// Deep-copies the payload out of engine memory.
    pub fn capture(&self) -> ChannelEvent {
        match *self {
            RawEvent::Opened => ChannelEvent::Opened,
            RawEvent::Closed => ChannelEvent::Closed,
            RawEvent::Errored {
                code,
                domain,
                message,
            } => ChannelEvent::Errored(ErrorInfo::new(code, domain, message)),
            RawEvent::DataMessage(data) => ChannelEvent::DataMessage(Bytes::copy_from_slice(data)),
            RawEvent::TextMessage(text) => ChannelEvent::TextMessage(text.to_owned()),
            RawEvent::BufferedAmountLow => ChannelEvent::BufferedAmountLow,
        }
    }
}

/// Owned channel event, ready to cross threads.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum ChannelEvent {
    Opened,
    Closed,
    Errored(ErrorInfo),
    DataMessage(Bytes),
    TextMessage(String),
    BufferedAmountLow,
}

impl ChannelEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ChannelEvent::Opened => EventKind::Opened,
            ChannelEvent::Closed => EventKind::Closed,
            ChannelEvent::Errored(_) => EventKind::Errored,
            ChannelEvent::DataMessage(_) => EventKind::DataMessage,
            ChannelEvent::TextMessage(_) => EventKind::TextMessage,
            ChannelEvent::BufferedAmountLow => EventKind::BufferedAmountLow,
        }
    }

    /// Borrows this event the way an engine reports it.
    pub fn as_raw(&self) -> RawEvent<'_> {
        match self {
            ChannelEvent::Opened => RawEvent::Opened,
            ChannelEvent::Closed => RawEvent::Closed,
            ChannelEvent::Errored(error) => RawEvent::Errored {
                code: error.code,
                domain: &error.domain,
                message: &error.message,
            },
            ChannelEvent::DataMessage(data) => RawEvent::DataMessage(data),
            ChannelEvent::TextMessage(text) => RawEvent::TextMessage(text),
            ChannelEvent::BufferedAmountLow => RawEvent::BufferedAmountLow,
        }
    }
}
