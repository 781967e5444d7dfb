//! The message-framed connection the client talks through.

use std::time::Duration;

use crate::error::Result;
use crate::pdu::CloseEvent;

/// Kind of a single frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Text,
    Binary,
    Ping,
    Pong,
    Close,
}

/// Outcome of a read attempt that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// Data was read, possibly only part of a frame, or at least one
    /// frame was dispatched.
    Ok,
    /// No data was ready.
    WouldBlock,
    /// The deadline passed before any frame arrived.
    Timeout,
}

/// Notifications emitted by a [`Transport`].
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Open,
    Message { data: Vec<u8>, kind: FrameKind },
    Pong(Vec<u8>),
    /// Emitted exactly once per transport, however the connection ends.
    Close(CloseEvent),
}

/// Receiver of [`TransportEvent`]s.
///
/// Implementations must call it without holding any internal lock, so the
/// receiver may call back into the transport.
pub type EventSink<'a> = &'a mut dyn FnMut(TransportEvent);

/// Slice used by the default blocking [`Transport::read`].
pub const READ_SLICE: Duration = Duration::from_secs(1);

/// A connection to the service.
///
/// Implementations are internally synchronized: one thread may block in a
/// read while others send.
pub trait Transport: Send + Sync {
    /// Establishes the connection and emits [`TransportEvent::Open`].
    ///
    /// A failure is returned as a connection error; no `Close` event is
    /// emitted for a connection that never opened.
    fn connect(&self, url: &str, events: EventSink) -> Result<()>;

    /// Writes one complete frame.
    fn send(&self, payload: &[u8], kind: FrameKind, events: EventSink) -> Result<()>;

    /// Dispatches every frame that is available without blocking.
    ///
    /// Returns [`ReadStatus::Ok`] whenever bytes were consumed, even if they
    /// completed no frame yet.
    fn read_nonblock(&self, events: EventSink) -> Result<ReadStatus>;

    /// Like [`Transport::read`], bounded by `timeout`.
    ///
    /// A zero timeout performs a single non-blocking attempt.
    fn read_with_timeout(&self, timeout: Duration, events: EventSink) -> Result<ReadStatus>;

    /// Blocks until data was read.
    fn read(&self, events: EventSink) -> Result<ReadStatus> {
        loop {
            match self.read_with_timeout(READ_SLICE, events)? {
                ReadStatus::Ok => return Ok(ReadStatus::Ok),
                ReadStatus::WouldBlock | ReadStatus::Timeout => continue,
            }
        }
    }

    /// Closes the connection. Calling it again is a no-op.
    fn close(&self, code: u16, reason: &str, events: EventSink) -> Result<()>;

    fn is_open(&self) -> bool;
}
