//! [`Transport`] over a WebSocket, with TLS for `wss` endpoints.

use std::borrow::Cow;
use std::io;
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info};
use tungstenite::protocol::frame::coding::CloseCode;
use tungstenite::protocol::CloseFrame;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};

use crate::error::{Error, ErrorKind, Result};
use crate::pdu::{CloseEvent, CLOSE_ABNORMAL, CLOSE_NORMAL, CLOSE_NO_STATUS};
use crate::transport::{EventSink, FrameKind, ReadStatus, Transport, TransportEvent};

type Socket = WebSocket<MaybeTlsStream<TcpStream>>;

const SOCKET_CLOSED: &str = "Socket is closed";
const MAX_CLOSE_REASON: usize = 123;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Open,
    Closed,
}

struct Inner {
    state: State,
    socket: Option<Socket>,
    // A duplicate of the socket's descriptor, used to wait for readiness
    // without holding the lock.
    waiter: Option<Arc<TcpStream>>,
}

/// The default transport.
pub struct WebSocketTransport {
    inner: Mutex<Inner>,
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        WebSocketTransport {
            inner: Mutex::new(Inner {
                state: State::Idle,
                socket: None,
                waiter: None,
            }),
        }
    }
}

impl WebSocketTransport {
    pub fn new() -> Self {
        Self::default()
    }

    // Self-closes after an I/O failure, then hands the error back.
    fn fail<T>(&self, err: Error, events: EventSink) -> Result<T> {
        let closed = self
            .inner
            .lock()
            .release(CloseEvent::new(CLOSE_ABNORMAL, SOCKET_CLOSED));
        if let Some(ev) = closed {
            events(TransportEvent::Close(ev));
        }
        Err(err)
    }
}

fn not_open() -> Error {
    crate::context!(ErrorKind::abnormal("Connection is not open"))
}

fn ws_error(e: tungstenite::Error) -> Error {
    crate::context!(e, ErrorKind::abnormal(SOCKET_CLOSED))
}

fn would_block(e: &tungstenite::Error) -> bool {
    matches!(e, tungstenite::Error::Io(io) if io.kind() == io::ErrorKind::WouldBlock)
}

fn tcp_of(socket: &Socket) -> Option<&TcpStream> {
    match socket.get_ref() {
        MaybeTlsStream::Plain(s) => Some(s),
        MaybeTlsStream::Rustls(s) => Some(&s.sock),
        _ => None,
    }
}

fn truncate(reason: &str) -> &str {
    if reason.len() <= MAX_CLOSE_REASON {
        return reason;
    }
    let mut end = MAX_CLOSE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}

#[cfg(unix)]
fn wait_for(tcp: &TcpStream, writable: bool, timeout: Duration) -> Result<()> {
    use std::os::unix::io::AsRawFd;

    let mut fd = libc::pollfd {
        fd: tcp.as_raw_fd(),
        events: if writable { libc::POLLOUT } else { libc::POLLIN },
        revents: 0,
    };
    let millis = ((timeout.as_micros() + 999) / 1000).min(libc::c_int::MAX as u128) as libc::c_int;
    // SAFETY: `fd` is a single, initialized pollfd that outlives the call.
    let rc = unsafe { libc::poll(&mut fd, 1, millis) };
    if rc < 0 {
        let e = io::Error::last_os_error();
        if e.kind() != io::ErrorKind::Interrupted {
            return Err(e).map_err(crate::map_context!());
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn wait_for(_tcp: &TcpStream, _writable: bool, timeout: Duration) -> Result<()> {
    std::thread::sleep(timeout.min(Duration::from_millis(10)));
    Ok(())
}

// Completes a write that may have stopped on a full socket buffer.
fn complete_write(
    socket: &mut Socket,
    tcp: &TcpStream,
    first: tungstenite::Result<()>,
) -> Result<()> {
    let mut result = first;
    loop {
        match result {
            Ok(()) => return Ok(()),
            Err(ref e) if would_block(e) => {
                wait_for(tcp, true, Duration::from_secs(1))?;
                result = socket.flush();
            }
            Err(e) => return Err(ws_error(e)),
        }
    }
}

impl Inner {
    /// Drops the socket. Returns the close event only on the first close of
    /// an open connection.
    fn release(&mut self, ev: CloseEvent) -> Option<CloseEvent> {
        if self.state != State::Open {
            return None;
        }
        self.state = State::Closed;
        if let Some(tcp) = self.waiter.take() {
            let _ = tcp.shutdown(Shutdown::Both);
        }
        self.socket = None;
        Some(ev)
    }

    // Data is waiting in the socket buffer.
    fn readable(&self) -> bool {
        let mut byte = [0u8; 1];
        self.waiter
            .as_ref()
            .map_or(false, |tcp| matches!(tcp.peek(&mut byte), Ok(n) if n > 0))
    }

    fn write(&mut self, message: Message) -> Result<()> {
        let tcp = self.waiter.clone().ok_or_else(not_open)?;
        let socket = self.socket.as_mut().ok_or_else(not_open)?;
        let first = socket.send(message);
        complete_write(socket, &tcp, first)
    }

    // Reads every available frame. Events collected before a failure are
    // returned along with it.
    fn drain(&mut self, out: &mut Vec<TransportEvent>) -> (usize, Option<Error>) {
        let socket = match self.socket.as_mut() {
            Some(s) => s,
            None => return (0, Some(not_open())),
        };
        let mut frames = 0;
        let peer_close = loop {
            match socket.read() {
                Ok(message) => {
                    frames += 1;
                    match message {
                        Message::Text(s) => out.push(TransportEvent::Message {
                            data: s.into_bytes(),
                            kind: FrameKind::Text,
                        }),
                        Message::Binary(b) => out.push(TransportEvent::Message {
                            data: b,
                            kind: FrameKind::Binary,
                        }),
                        Message::Pong(p) => out.push(TransportEvent::Pong(p)),
                        // answered by tungstenite on the next read or flush
                        Message::Ping(_) | Message::Frame(_) => {}
                        Message::Close(frame) => {
                            break match frame {
                                Some(f) => CloseEvent::new(u16::from(f.code), f.reason.into_owned()),
                                None => CloseEvent::new(CLOSE_NO_STATUS, ""),
                            };
                        }
                    }
                }
                Err(ref e) if would_block(e) => return (frames, None),
                Err(e) => return (frames, Some(ws_error(e))),
            }
        };

        // flush the automatic close reply before letting go of the socket
        if let Err(e) = socket.flush() {
            debug!("fail to reply to close frame: {}", e);
        }
        if let Some(ev) = self.release(peer_close) {
            out.push(TransportEvent::Close(ev));
        }
        (frames, None)
    }
}

impl Transport for WebSocketTransport {
    fn connect(&self, url: &str, events: EventSink) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            if inner.state != State::Idle {
                return Err(crate::context!(ErrorKind::abnormal(
                    "Transport can only be connected once"
                )));
            }
            inner.state = State::Closed;

            let (socket, _response) = tungstenite::connect(url).map_err(|e| {
                let kind = ErrorKind::abnormal(e.to_string());
                crate::context!(e, kind)
            })?;
            let tcp = tcp_of(&socket)
                .ok_or_else(|| crate::context!(ErrorKind::abnormal("Unsupported stream")))?;
            let waiter = tcp
                .try_clone()
                .and_then(|w| tcp.set_nonblocking(true).map(|_| w))
                .map_err(|e| {
                    let kind = ErrorKind::abnormal(e.to_string());
                    crate::context!(e, kind)
                })?;

            inner.socket = Some(socket);
            inner.waiter = Some(Arc::new(waiter));
            inner.state = State::Open;
        }
        info!("websocket to {} is open", url);
        events(TransportEvent::Open);
        Ok(())
    }

    fn send(&self, payload: &[u8], kind: FrameKind, events: EventSink) -> Result<()> {
        let message = match kind {
            FrameKind::Text => Message::Text(String::from_utf8_lossy(payload).into_owned()),
            FrameKind::Binary => Message::Binary(payload.to_vec()),
            FrameKind::Ping => Message::Ping(payload.to_vec()),
            FrameKind::Pong => Message::Pong(payload.to_vec()),
            FrameKind::Close => {
                return self.close(CLOSE_NORMAL, &String::from_utf8_lossy(payload), events)
            }
        };

        let result = {
            let mut inner = self.inner.lock();
            if inner.state != State::Open {
                return Err(not_open());
            }
            inner.write(message)
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) => self.fail(e, events),
        }
    }

    fn read_nonblock(&self, events: EventSink) -> Result<ReadStatus> {
        let mut out = Vec::new();
        let (frames, readable, err) = {
            let mut inner = self.inner.lock();
            if inner.state != State::Open {
                return Err(not_open());
            }
            // bytes of a partial frame still count as read
            let readable = inner.readable();
            let (frames, err) = inner.drain(&mut out);
            (frames, readable, err)
        };

        for ev in out {
            events(ev);
        }
        if let Some(e) = err {
            return self.fail(e, events);
        }
        if frames > 0 || readable {
            Ok(ReadStatus::Ok)
        } else {
            Ok(ReadStatus::WouldBlock)
        }
    }

    fn read_with_timeout(&self, timeout: Duration, events: EventSink) -> Result<ReadStatus> {
        let deadline = match Instant::now().checked_add(timeout) {
            Some(d) => d,
            None => return self.read(events),
        };
        loop {
            if self.read_nonblock(events)? == ReadStatus::Ok {
                return Ok(ReadStatus::Ok);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(ReadStatus::Timeout);
            }
            let waiter = self.inner.lock().waiter.clone();
            match waiter {
                Some(tcp) => {
                    if let Err(e) = wait_for(&tcp, false, deadline - now) {
                        return self.fail(e, events);
                    }
                }
                None => return Err(not_open()),
            }
        }
    }

    fn close(&self, code: u16, reason: &str, events: EventSink) -> Result<()> {
        let closed = {
            let mut inner = self.inner.lock();
            if inner.state == State::Open {
                let tcp = inner.waiter.clone();
                if let (Some(socket), Some(tcp)) = (inner.socket.as_mut(), tcp) {
                    let close_code = CloseCode::from(code);
                    let frame = close_code.is_allowed().then(|| CloseFrame {
                        code: close_code,
                        reason: Cow::Owned(truncate(reason).to_string()),
                    });
                    let first = socket.close(frame);
                    if let Err(e) = complete_write(socket, &tcp, first) {
                        info!("fail to close socket: {}", e);
                    }
                }
            }
            inner.release(CloseEvent::new(code, reason))
        };
        if let Some(ev) = closed {
            events(TransportEvent::Close(ev));
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.inner.lock().state == State::Open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_reason_fits_in_a_control_frame() {
        assert_eq!(truncate("short"), "short");
        let long = "é".repeat(100);
        let cut = truncate(&long);
        assert!(cut.len() <= MAX_CLOSE_REASON);
        assert!(long.starts_with(cut));
    }

    #[test]
    fn idle_transport_refuses_io() {
        let t = WebSocketTransport::new();
        let mut seen = Vec::new();
        let mut sink = |ev: TransportEvent| seen.push(ev);
        assert!(!t.is_open());
        let err = t.send(b"x", FrameKind::Text, &mut sink).unwrap_err();
        assert!(err.kind().is_connection());
        let err = t.read_nonblock(&mut sink).unwrap_err();
        assert_eq!(err.close_code(), Some(CLOSE_ABNORMAL));
        t.close(CLOSE_NORMAL, "", &mut sink).unwrap();
        assert!(seen.is_empty());
    }

    #[test]
    fn refused_connection_is_abnormal() {
        // nothing listens on the discard port of localhost in the test sandbox
        let t = WebSocketTransport::new();
        let mut seen = Vec::new();
        let err = t
            .connect("ws://127.0.0.1:9/v2", &mut |ev| seen.push(ev))
            .unwrap_err();
        assert_eq!(err.close_code(), Some(CLOSE_ABNORMAL));
        assert!(seen.is_empty());
        assert!(!t.is_open());
    }
}
