//! External collaborator contract: the byte-oriented full-duplex stream
//! transport underneath a connection.
//!
//! Framing (header parsing, control-vs-memblock routing) is this crate's
//! job; the transport only has to move framed bytes. A production
//! implementation sits on `mio::net::UnixStream`/`TcpStream`; tests use an
//! in-memory double (see `testutil::ChannelTransport`).

use std::io;

use crate::command::{FrameHeader, FRAME_HEADER_SIZE};
use crate::record::Record;

/// One decoded inbound frame: either a command packet or a memblock
/// targeted at a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// A tagged-record packet payload, not yet parsed into a [`Command`].
    ///
    /// [`Command`]: crate::command::Command
    Packet(Vec<u8>),
    /// Audio bytes for the stream identified by `channel`.
    Memblock {
        /// Target stream's wire index.
        channel: u32,
        /// Silence gap to insert before `bytes`, per [`FrameHeader::delta`].
        delta: i32,
        /// The chunk itself.
        bytes: Vec<u8>,
    },
}

/// A framed, full-duplex byte channel to one connected client.
pub trait Transport {
    /// Reads exactly one frame, or `None` on a clean EOF (peer closed the
    /// connection without sending a partial frame).
    fn read_frame(&mut self) -> io::Result<Option<InboundFrame>>;

    /// Writes a control packet (a serialized [`Record`]).
    fn write_packet(&mut self, record: &Record<'_>) -> io::Result<()>;

    /// Writes a memblock frame for `channel`.
    fn write_memblock(&mut self, channel: u32, delta: i32, bytes: &[u8]) -> io::Result<()>;
}

/// Reads a [`FrameHeader`] and its payload from any `io::Read`, blocking
/// (or returning `WouldBlock`) until the whole frame is available.
///
/// Shared by production transport implementations so they don't each
/// reimplement header parsing.
pub fn read_frame_blocking<R: io::Read>(r: &mut R) -> io::Result<Option<InboundFrame>> {
    let mut hdr_buf = [0u8; FRAME_HEADER_SIZE];
    match read_exact_or_eof(r, &mut hdr_buf)? {
        false => return Ok(None),
        true => {}
    }
    let hdr = FrameHeader::decode(&hdr_buf);

    let mut payload = vec![0u8; hdr.length as usize];
    r.read_exact(&mut payload)?;

    if hdr.is_control() {
        Ok(Some(InboundFrame::Packet(payload)))
    } else {
        Ok(Some(InboundFrame::Memblock {
            channel: hdr.channel,
            delta: hdr.delta,
            bytes: payload,
        }))
    }
}

/// Like `Read::read_exact`, but returns `Ok(false)` instead of erroring if
/// zero bytes are available before any are read (a clean EOF at a frame
/// boundary), and errors as usual on a truncated frame.
fn read_exact_or_eof<R: io::Read>(r: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "truncated frame header",
                ))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

/// Writes a control packet to any `io::Write`.
pub fn write_packet_blocking<W: io::Write>(w: &mut W, record: &Record<'_>) -> io::Result<()> {
    let bytes = record.as_bytes();
    let hdr = FrameHeader {
        length: bytes.len() as u32,
        channel: crate::command::CONTROL_CHANNEL,
        delta: 0,
    };
    w.write_all(&hdr.encode())?;
    w.write_all(&bytes)
}

/// Writes a memblock frame to any `io::Write`.
pub fn write_memblock_blocking<W: io::Write>(
    w: &mut W,
    channel: u32,
    delta: i32,
    bytes: &[u8],
) -> io::Result<()> {
    let hdr = FrameHeader {
        length: bytes.len() as u32,
        channel,
        delta,
    };
    w.write_all(&hdr.encode())?;
    w.write_all(bytes)
}
