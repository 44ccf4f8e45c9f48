//! Error types shared across the codec, dispatcher and connection layers.

use enum_primitive_derive::Primitive;
use thiserror::Error;

use crate::record::RecordError;

/// An error code sent to the client as the payload of an `ERROR` reply.
///
/// Numeric values are externally visible on the wire and must stay stable.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Primitive)]
pub enum PulseError {
    /// Client is not authenticated, or sent the wrong cookie.
    Access = 1,
    /// Unknown command id.
    Command = 2,
    /// Arguments were semantically rejected (e.g. stream creation failed).
    Invalid = 3,
    /// Referenced index does not exist.
    ///
    /// Named `Exist` for historical reasons; the actual semantics are
    /// "no such entity".
    Exist = 4,
    /// The default target (sink/source) is missing, or a pending operation
    /// was aborted by destruction of its target.
    NoEntity = 5,
    /// An outstanding request timed out waiting for a reply.
    Timeout = 8,
}

/// A protocol-level error: malformed frame or tagged record.
///
/// Always fatal to the connection that produced it; never sent back to the
/// client as a reply.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Malformed tagged record (tag mismatch, truncated field, etc).
    #[error("malformed tagged record: {0}")]
    Record(#[from] RecordError),
    /// A command id with no installed handler, or an unrecognized reserved
    /// command id in a position where it is not expected.
    #[error("unknown command id {0}")]
    UnknownCommand(u32),
    /// A memblock frame referenced a channel with no matching stream.
    #[error("memblock for unknown channel {0}")]
    UnknownChannel(u32),
    /// Arguments were fully parsed but left trailing bytes (`eof()` was
    /// false after a handler finished reading its arguments).
    #[error("trailing data after command arguments")]
    TrailingData,
    /// The frame's declared length doesn't fit the transport budget, or
    /// similar structural violations.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
    /// The underlying transport failed.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

/// The outcome of dispatching one inbound frame, per §7's error policy:
/// protocol violations kill the connection, semantic errors are reported
/// and the connection stays healthy.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Unrecoverable for this connection; the caller must tear it down
    /// without sending a reply.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// Reported to the client as `ERROR(tag, code)`; the connection remains
    /// open and healthy.
    #[error("command failed: {0:?}")]
    Reply(#[from] PulseError),
}
