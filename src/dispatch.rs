//! The packet dispatcher: decodes inbound packets into commands, routes
//! memblocks to the owning stream, and tracks outstanding server-initiated
//! requests awaiting a reply.
//!
//! Inbound command routing itself is a closed match over [`Command`] (see
//! `connection::Connection::handle_command`) rather than a runtime handler
//! table, since every command this crate dispatches is known at compile
//! time — the fixed-array-of-handlers and tagged-enum designs are
//! explicitly interchangeable for this. What genuinely needs to be
//! stateful is the table of requests this side has *sent* and is waiting
//! on a reply for.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::command::Command;
use crate::error::{PulseError, ProtocolError};
use crate::record::Record;

/// Parses one inbound control-packet payload into its reply tag and
/// decoded command.
///
/// A failure here is always a protocol error: the connection must be torn
/// down without a reply.
pub fn decode_packet(payload: &[u8]) -> Result<(u32, Command), ProtocolError> {
    let mut record = Record::from_bytes(payload);
    Command::read(&mut record).map_err(ProtocolError::from)
}

/// Raised when an inbound memblock names a stream channel this connection
/// doesn't own.
pub fn unknown_channel(channel: u32) -> ProtocolError {
    ProtocolError::UnknownChannel(channel)
}

type CompletionFn = Box<dyn FnOnce(Result<Record<'static>, PulseError>) + Send>;

struct OutstandingEntry {
    deadline: Instant,
    on_complete: CompletionFn,
}

/// Tracks requests this side has sent to its peer and is waiting on a
/// reply for, keyed by the `tag` chosen when the request was sent.
///
/// Reserved for server-initiated round trips; nothing in this crate's
/// current command surface needs one (`REQUEST` frames expect no reply),
/// but the table is exercised directly by its own tests and is where a
/// future server-initiated command would hook in.
#[derive(Default)]
pub struct OutstandingRequests {
    entries: HashMap<u32, OutstandingEntry>,
}

impl OutstandingRequests {
    /// Creates an empty table.
    pub fn new() -> OutstandingRequests {
        OutstandingRequests::default()
    }

    /// Registers a pending request under `tag`, expiring after `timeout`
    /// has elapsed past `now`.
    pub fn insert(
        &mut self,
        tag: u32,
        timeout: Duration,
        now: Instant,
        on_complete: impl FnOnce(Result<Record<'static>, PulseError>) + Send + 'static,
    ) {
        self.entries.insert(
            tag,
            OutstandingEntry {
                deadline: now + timeout,
                on_complete: Box::new(on_complete),
            },
        );
    }

    /// Completes a pending request with a successful reply record. Returns
    /// `true` if `tag` matched an outstanding entry.
    pub fn complete(&mut self, tag: u32, reply: Record<'static>) -> bool {
        match self.entries.remove(&tag) {
            Some(entry) => {
                (entry.on_complete)(Ok(reply));
                true
            }
            None => false,
        }
    }

    /// Completes a pending request with an error reply. Returns `true` if
    /// `tag` matched an outstanding entry.
    pub fn fail(&mut self, tag: u32, error: PulseError) -> bool {
        match self.entries.remove(&tag) {
            Some(entry) => {
                (entry.on_complete)(Err(error));
                true
            }
            None => false,
        }
    }

    /// Expires every entry whose deadline has passed as of `now`, firing
    /// each with a [`PulseError::Timeout`].
    pub fn expire(&mut self, now: Instant) {
        let expired: Vec<u32> = self
            .entries
            .iter()
            .filter(|(_, e)| e.deadline <= now)
            .map(|(tag, _)| *tag)
            .collect();

        for tag in expired {
            if let Some(entry) = self.entries.remove(&tag) {
                (entry.on_complete)(Err(PulseError::Timeout));
            }
        }
    }

    /// Number of requests currently outstanding.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True iff no requests are outstanding.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
