//! Accepts new client transports and owns the resulting connections.
//!
//! Driven by a single `mio::Poll`, in the idiom of the teacher's
//! `client::reactor`: one [`mio::Token`] for the listening socket, one per
//! connection. No async runtime; handlers run to completion between
//! `poll()` calls, matching the single-threaded cooperative scheduling
//! required of the protocol core.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{self, Read};
use std::path::Path;
use std::rc::Rc;
use std::time::Duration;

use log::{info, warn};
use mio::net::{UnixListener, UnixStream};
use mio::{Events, Interest, Poll, Token};

use crate::command::FRAME_HEADER_SIZE;
use crate::connection::{Connection, ConnectionEvent};
use crate::cookie::Cookie;
use crate::mixer::SinkRegistry;
use crate::record::Record;
use crate::transport::{write_memblock_blocking, write_packet_blocking, InboundFrame, Transport};
use crate::command::FrameHeader;

const LISTENER_TOKEN: Token = Token(0);

/// A non-blocking [`Transport`] over a `mio::net::UnixStream`.
///
/// Frames may arrive split across multiple readiness notifications; bytes
/// read eagerly past a complete frame are held in `read_buf` until the next
/// `read_frame` call.
pub struct UnixStreamTransport {
    stream: UnixStream,
    read_buf: Vec<u8>,
}

impl UnixStreamTransport {
    /// Wraps an accepted stream.
    pub fn new(stream: UnixStream) -> UnixStreamTransport {
        UnixStreamTransport {
            stream,
            read_buf: Vec::new(),
        }
    }

    /// Pulls as many bytes as are currently available (non-blocking) into
    /// `read_buf`. Returns `false` on a clean EOF with nothing buffered;
    /// `true` otherwise (including the `WouldBlock` case, where the caller
    /// should wait for the next readiness notification).
    fn fill_available(&mut self) -> io::Result<bool> {
        let mut tmp = [0u8; 4096];
        loop {
            match self.stream.read(&mut tmp) {
                Ok(0) => return Ok(!self.read_buf.is_empty()),
                Ok(n) => self.read_buf.extend_from_slice(&tmp[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(true),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

impl UnixStreamTransport {
    /// Returns the next complete frame already sitting in `read_buf`,
    /// without touching the socket.
    fn try_take_frame(&mut self) -> io::Result<Option<InboundFrame>> {
        if self.read_buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let mut hdr_bytes = [0u8; FRAME_HEADER_SIZE];
        hdr_bytes.copy_from_slice(&self.read_buf[..FRAME_HEADER_SIZE]);
        let hdr = FrameHeader::decode(&hdr_bytes);
        let total = FRAME_HEADER_SIZE + hdr.length as usize;

        if self.read_buf.len() < total {
            return Ok(None);
        }

        let payload = self.read_buf[FRAME_HEADER_SIZE..total].to_vec();
        self.read_buf.drain(0..total);
        Ok(Some(if hdr.is_control() {
            InboundFrame::Packet(payload)
        } else {
            InboundFrame::Memblock {
                channel: hdr.channel,
                delta: hdr.delta,
                bytes: payload,
            }
        }))
    }
}

impl Transport for UnixStreamTransport {
    fn read_frame(&mut self) -> io::Result<Option<InboundFrame>> {
        if let Some(frame) = self.try_take_frame()? {
            return Ok(Some(frame));
        }

        let had_buffered = !self.read_buf.is_empty();
        if !self.fill_available()? {
            return if had_buffered {
                Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed mid-frame",
                ))
            } else {
                Ok(None)
            };
        }

        self.try_take_frame()
    }

    fn write_packet(&mut self, record: &Record<'_>) -> io::Result<()> {
        write_packet_blocking(&mut self.stream, record)
    }

    fn write_memblock(&mut self, channel: u32, delta: i32, bytes: &[u8]) -> io::Result<()> {
        write_memblock_blocking(&mut self.stream, channel, delta, bytes)
    }
}

/// Owns the listening socket and the set of connections accepted from it.
pub struct Listener<M: SinkRegistry> {
    cookie: Rc<Cookie>,
    public: bool,
    mixer: Rc<RefCell<M>>,
    listener: UnixListener,
    poll: Poll,
    events: Events,
    connections: HashMap<Token, Connection<UnixStreamTransport, M>>,
    next_token: usize,
    shutting_down: bool,
}

impl<M: SinkRegistry> Listener<M> {
    /// Binds a new listener on `path`.
    pub fn bind(path: &Path, cookie: Cookie, public: bool, mixer: M) -> io::Result<Listener<M>> {
        let mut listener = UnixListener::bind(path)?;
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        Ok(Listener {
            cookie: Rc::new(cookie),
            public,
            mixer: Rc::new(RefCell::new(mixer)),
            listener,
            poll,
            events: Events::with_capacity(128),
            connections: HashMap::new(),
            next_token: 1,
            shutting_down: false,
        })
    }

    /// Number of currently live connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Runs one iteration of the event loop: blocks (up to `timeout`) for
    /// readiness, accepts new connections, and drives existing ones.
    ///
    /// Returns `true` if the loop should keep running, `false` once an
    /// `EXIT` has been processed and every connection has been torn down.
    pub fn run_once(&mut self, timeout: Option<Duration>) -> io::Result<bool> {
        self.poll.poll(&mut self.events, timeout)?;

        let tokens: Vec<Token> = self.events.iter().map(|e| e.token()).collect();
        for token in tokens {
            if token == LISTENER_TOKEN {
                self.accept_all()?;
            } else {
                self.drive_connection(token);
            }
        }

        Ok(!self.shutting_down || !self.connections.is_empty())
    }

    fn accept_all(&mut self) -> io::Result<()> {
        loop {
            match self.listener.accept() {
                Ok((mut stream, _addr)) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;

                    self.poll
                        .registry()
                        .register(&mut stream, token, Interest::READABLE)?;

                    let conn = Connection::new(
                        UnixStreamTransport::new(stream),
                        self.mixer.clone(),
                        self.cookie.clone(),
                        self.public,
                    );
                    self.connections.insert(token, conn);
                    info!("accepted connection {}", token.0);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    fn drive_connection(&mut self, token: Token) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };

        match conn.poll() {
            Ok(ConnectionEvent::Continue) => {}
            Ok(ConnectionEvent::ExitRequested) => {
                // Best-effort/informational per §9: the ack was already
                // queued by the connection before this returned; we don't
                // wait to confirm the client received it.
                info!("connection {} requested exit", token.0);
                self.shutting_down = true;
            }
            Err(e) => {
                warn!("connection {} failed: {e}", token.0);
                self.remove_connection(token);
                return;
            }
        }

        if self.shutting_down {
            self.shutdown();
        }
    }

    fn remove_connection(&mut self, token: Token) {
        if let Some(mut conn) = self.connections.remove(&token) {
            conn.teardown();
        }
    }

    /// Frees every connection, then marks the listener as shut down.
    pub fn shutdown(&mut self) {
        let tokens: Vec<Token> = self.connections.keys().copied().collect();
        for token in tokens {
            self.remove_connection(token);
        }
        self.shutting_down = true;
    }
}
