//! The command vocabulary exchanged over a connection, and the frame
//! header that precedes every record or memblock on the wire.
//!
//! Command ids are the real numeric values from the original protocol
//! (`protocol-native.c`'s `command_table`), narrowed to the surface this
//! crate actually dispatches.

use enum_primitive_derive::Primitive;
use num_traits::FromPrimitive;

use crate::cookie::COOKIE_LEN;
use crate::record::{Record, RecordError};
use crate::sample_spec::SampleSpec;

/// Header preceding every frame on the wire: 12 bytes, all big-endian.
///
/// Unlike the original protocol's 20-byte descriptor, this carries no SHM
/// offset or release/revoke flags — out of scope here (no SHM, no
/// versioning negotiation).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Length of the payload following this header, in bytes.
    pub length: u32,
    /// Stream index this frame targets, or `u32::MAX` for a control
    /// (packet) frame not bound to any stream.
    pub channel: u32,
    /// For memblock frames, the gap (in bytes) to fill with silence before
    /// this chunk; frame-aligned, signed. Zero for packet frames.
    pub delta: i32,
}

/// Sentinel `channel` value marking a frame as a command packet rather than
/// a memblock.
pub const CONTROL_CHANNEL: u32 = u32::MAX;

/// Size in bytes of an encoded [`FrameHeader`].
pub const FRAME_HEADER_SIZE: usize = 12;

impl FrameHeader {
    /// Encodes this header into a fixed-size buffer.
    pub fn encode(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.length.to_be_bytes());
        buf[4..8].copy_from_slice(&self.channel.to_be_bytes());
        buf[8..12].copy_from_slice(&self.delta.to_be_bytes());
        buf
    }

    /// Decodes a header from exactly [`FRAME_HEADER_SIZE`] bytes.
    pub fn decode(buf: &[u8; FRAME_HEADER_SIZE]) -> FrameHeader {
        FrameHeader {
            length: u32::from_be_bytes(buf[0..4].try_into().unwrap()),
            channel: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
            delta: i32::from_be_bytes(buf[8..12].try_into().unwrap()),
        }
    }

    /// True iff this header introduces a command packet rather than a
    /// memblock.
    pub fn is_control(&self) -> bool {
        self.channel == CONTROL_CHANNEL
    }
}

/// The wire identifier for a command, reply or sentinel.
///
/// Values match the original protocol's numbering so the dispatch table
/// stays a recognizable subset, not a renumbering.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Primitive)]
pub enum CommandTag {
    /// Sentinel: an error reply.
    Error = 0,
    /// Sentinel: a successful reply (payload, if any, is command-specific).
    Reply = 2,
    /// `CREATE_PLAYBACK_STREAM`.
    CreatePlaybackStream = 3,
    /// `DELETE_PLAYBACK_STREAM`.
    DeletePlaybackStream = 4,
    /// `EXIT`.
    Exit = 7,
    /// `AUTH`.
    Auth = 8,
    /// `SET_NAME` (originally `SET_CLIENT_NAME`).
    SetName = 9,
    /// `LOOKUP_SINK`.
    LookupSink = 10,
    /// `LOOKUP_SOURCE`.
    LookupSource = 11,
    /// `DRAIN_PLAYBACK_STREAM`.
    DrainPlaybackStream = 12,
    /// Server-initiated credit grant.
    Request = 61,
}

/// Arguments to [`CommandTag::CreatePlaybackStream`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatePlaybackStreamParams {
    /// Client-chosen diagnostic name for the stream.
    pub name: String,
    /// Format of the samples the client will send.
    pub sample_spec: SampleSpec,
    /// Target sink index, or [`DEFAULT_SINK`] for "the default sink".
    pub sink_index: u32,
    /// Hard cap on the stream's block queue, in bytes.
    pub maxlength: u32,
    /// Target fill level, in bytes.
    pub tlength: u32,
    /// Minimum fill before playback starts, in bytes.
    pub prebuf: u32,
    /// Minimum request grain, in bytes.
    pub minreq: u32,
}

/// Sentinel `sink_index` meaning "attach to the default sink".
pub const DEFAULT_SINK: u32 = u32::MAX;

/// Reply payload for a successful [`CommandTag::CreatePlaybackStream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreatePlaybackStreamReply {
    /// The stream's locally assigned wire channel.
    pub stream_index: u32,
    /// The mixer's handle for the newly registered sink input.
    pub sink_input_index: u32,
}

/// A fully decoded inbound command, paired with its `tag` in
/// [`crate::dispatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `AUTH(cookie)`.
    Auth(Vec<u8>),
    /// `SET_NAME(name)`.
    SetName(String),
    /// `EXIT()`.
    Exit,
    /// `LOOKUP_SINK(name)`.
    LookupSink(String),
    /// `LOOKUP_SOURCE(name)`.
    LookupSource(String),
    /// `CREATE_PLAYBACK_STREAM(...)`.
    CreatePlaybackStream(CreatePlaybackStreamParams),
    /// `DELETE_PLAYBACK_STREAM(channel)`.
    DeletePlaybackStream(u32),
    /// `DRAIN_PLAYBACK_STREAM(stream_index)`.
    DrainPlaybackStream(u32),
}

impl Command {
    /// The tag identifying this command's wire shape.
    pub fn tag(&self) -> CommandTag {
        match self {
            Command::Auth(_) => CommandTag::Auth,
            Command::SetName(_) => CommandTag::SetName,
            Command::Exit => CommandTag::Exit,
            Command::LookupSink(_) => CommandTag::LookupSink,
            Command::LookupSource(_) => CommandTag::LookupSource,
            Command::CreatePlaybackStream(_) => CommandTag::CreatePlaybackStream,
            Command::DeletePlaybackStream(_) => CommandTag::DeletePlaybackStream,
            Command::DrainPlaybackStream(_) => CommandTag::DrainPlaybackStream,
        }
    }

    /// Parses the tag + argument record of an inbound packet.
    ///
    /// Returns the reply tag and the decoded command. Callers MUST have
    /// already asserted `record.eof()` is false before calling; this
    /// asserts it's `true` after parsing (the handler's entire argument
    /// record must be consumed).
    pub fn read(record: &mut Record<'_>) -> Result<(u32, Command), CommandReadError> {
        let raw_tag = record.get_u32()?;
        let command_tag =
            CommandTag::from_u32(raw_tag).ok_or(CommandReadError::UnknownCommand(raw_tag))?;
        let seq = record.get_u32()?;

        let command = match command_tag {
            CommandTag::Auth => {
                let cookie = record.get_arbitrary_exact(COOKIE_LEN)?;
                Command::Auth(cookie)
            }
            CommandTag::SetName => Command::SetName(record.get_string()?),
            CommandTag::Exit => Command::Exit,
            CommandTag::LookupSink => Command::LookupSink(record.get_string()?),
            CommandTag::LookupSource => Command::LookupSource(record.get_string()?),
            CommandTag::CreatePlaybackStream => {
                let name = record.get_string()?;
                let sample_spec = record.get_sample_spec()?;
                let sink_index = record.get_u32()?;
                let maxlength = record.get_u32()?;
                let tlength = record.get_u32()?;
                let prebuf = record.get_u32()?;
                let minreq = record.get_u32()?;
                Command::CreatePlaybackStream(CreatePlaybackStreamParams {
                    name,
                    sample_spec,
                    sink_index,
                    maxlength,
                    tlength,
                    prebuf,
                    minreq,
                })
            }
            CommandTag::DeletePlaybackStream => {
                Command::DeletePlaybackStream(record.get_u32()?)
            }
            CommandTag::DrainPlaybackStream => {
                Command::DrainPlaybackStream(record.get_u32()?)
            }
            CommandTag::Error | CommandTag::Reply | CommandTag::Request => {
                return Err(CommandReadError::UnexpectedReserved(command_tag))
            }
        };

        record.expect_eof()?;
        Ok((seq, command))
    }

    /// Serializes this command as a full packet record (tag + seq +
    /// arguments), ready to be wrapped in a [`FrameHeader`].
    pub fn write(&self, seq: u32) -> Record<'static> {
        let mut r = Record::new();
        r.put_u32(self.tag() as u32);
        r.put_u32(seq);

        match self {
            Command::Auth(cookie) => r.put_arbitrary(cookie),
            Command::SetName(name) => r.put_string(name),
            Command::Exit => {}
            Command::LookupSink(name) => r.put_string(name),
            Command::LookupSource(name) => r.put_string(name),
            Command::CreatePlaybackStream(p) => {
                r.put_string(&p.name);
                r.put_sample_spec(&p.sample_spec);
                r.put_u32(p.sink_index);
                r.put_u32(p.maxlength);
                r.put_u32(p.tlength);
                r.put_u32(p.prebuf);
                r.put_u32(p.minreq);
            }
            Command::DeletePlaybackStream(channel) => r.put_u32(*channel),
            Command::DrainPlaybackStream(stream_index) => r.put_u32(*stream_index),
        }

        r
    }
}

/// Writes a successful reply with no extra payload ("simple-ack").
pub fn write_simple_ack(seq: u32) -> Record<'static> {
    let mut r = Record::new();
    r.put_u32(CommandTag::Reply as u32);
    r.put_u32(seq);
    r
}

/// Writes a `CREATE_PLAYBACK_STREAM` success reply.
pub fn write_create_playback_stream_reply(
    seq: u32,
    reply: CreatePlaybackStreamReply,
) -> Record<'static> {
    let mut r = Record::new();
    r.put_u32(CommandTag::Reply as u32);
    r.put_u32(seq);
    r.put_u32(reply.stream_index);
    r.put_u32(reply.sink_input_index);
    r
}

/// Writes a `LOOKUP_SINK`/`LOOKUP_SOURCE` success reply.
pub fn write_lookup_reply(seq: u32, index: u32) -> Record<'static> {
    let mut r = Record::new();
    r.put_u32(CommandTag::Reply as u32);
    r.put_u32(seq);
    r.put_u32(index);
    r
}

/// Writes an `ERROR(tag, code)` reply.
pub fn write_error(seq: u32, error: crate::error::PulseError) -> Record<'static> {
    let mut r = Record::new();
    r.put_u32(CommandTag::Error as u32);
    r.put_u32(seq);
    r.put_u32(error as u32);
    r
}

/// Writes a server-initiated `REQUEST(stream_index, bytes)` frame. Carries
/// no reply tag (`tag = 0xFFFFFFFF`, per the no-reply-expected contract).
pub fn write_request(stream_index: u32, bytes: u32) -> Record<'static> {
    let mut r = Record::new();
    r.put_u32(CommandTag::Request as u32);
    r.put_u32(u32::MAX);
    r.put_u32(stream_index);
    r.put_u32(bytes);
    r
}

impl From<CommandReadError> for crate::error::ProtocolError {
    fn from(e: CommandReadError) -> Self {
        match e {
            CommandReadError::Record(re) => crate::error::ProtocolError::Record(re),
            CommandReadError::UnknownCommand(id) => crate::error::ProtocolError::UnknownCommand(id),
            // A reserved sentinel in this position is, for dispatch purposes,
            // just as unrecognized as an unassigned command id.
            CommandReadError::UnexpectedReserved(tag) => {
                crate::error::ProtocolError::UnknownCommand(tag as u32)
            }
        }
    }
}

/// An error while parsing an inbound command packet.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CommandReadError {
    /// A field failed to decode.
    #[error(transparent)]
    Record(#[from] RecordError),
    /// The leading command id wasn't any known [`CommandTag`].
    #[error("unknown command id {0}")]
    UnknownCommand(u32),
    /// A reserved sentinel (`ERROR`/`REPLY`/`REQUEST`) arrived where a
    /// client-initiated command was expected.
    #[error("unexpected reserved command {0:?} in client packet")]
    UnexpectedReserved(CommandTag),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample_spec::SampleFormat;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    fn ss() -> SampleSpec {
        SampleSpec {
            format: SampleFormat::S16Le,
            channels: 2,
            rate: 44100,
        }
    }

    #[test]
    fn frame_header_round_trip() {
        let hdr = FrameHeader {
            length: 128,
            channel: 3,
            delta: -64,
        };
        assert_eq!(FrameHeader::decode(&hdr.encode()), hdr);
    }

    #[test]
    fn control_channel_is_recognized() {
        let hdr = FrameHeader {
            length: 0,
            channel: CONTROL_CHANNEL,
            delta: 0,
        };
        assert!(hdr.is_control());
    }

    #[test]
    fn auth_round_trip() {
        let cmd = Command::Auth(vec![1u8; COOKIE_LEN]);
        let record = cmd.write(7);
        let mut parsed = Record::from_bytes(&record.as_bytes());
        let (seq, decoded) = Command::read(&mut parsed).unwrap();
        assert_eq!(seq, 7);
        assert_eq!(decoded, cmd);
    }

    #[test]
    fn auth_with_wrong_length_cookie_is_rejected() {
        let cmd = Command::Auth(vec![1, 2, 3, 4]);
        let record = cmd.write(7);
        let mut parsed = Record::from_bytes(&record.as_bytes());
        assert_matches!(
            Command::read(&mut parsed),
            Err(CommandReadError::Record(RecordError::UnexpectedEof))
        );
    }

    #[test]
    fn create_playback_stream_round_trip() {
        let cmd = Command::CreatePlaybackStream(CreatePlaybackStreamParams {
            name: "music".into(),
            sample_spec: ss(),
            sink_index: DEFAULT_SINK,
            maxlength: 65536,
            tlength: 16384,
            prebuf: 4096,
            minreq: 1024,
        });
        let record = cmd.write(9);
        let mut parsed = Record::from_bytes(&record.as_bytes());
        let (seq, decoded) = Command::read(&mut parsed).unwrap();
        assert_eq!(seq, 9);
        assert_eq!(decoded, cmd);
    }

    #[test]
    fn trailing_data_is_rejected() {
        let mut r = Record::new();
        r.put_u32(CommandTag::Exit as u32);
        r.put_u32(1);
        r.put_u8(0); // Exit takes no arguments; this byte is trailing.
        let bytes = r.as_bytes();
        let mut parsed = Record::from_bytes(&bytes);
        assert!(matches!(
            Command::read(&mut parsed),
            Err(CommandReadError::Record(RecordError::TrailingData))
        ));
    }

    #[test]
    fn reserved_command_is_rejected() {
        let reply = write_simple_ack(3);
        let bytes = reply.as_bytes();
        let mut parsed = Record::from_bytes(&bytes);
        assert!(matches!(
            Command::read(&mut parsed),
            Err(CommandReadError::UnexpectedReserved(CommandTag::Reply))
        ));
    }
}
