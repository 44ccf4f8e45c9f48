//! The playback stream: flow-control state machine bridging a client's
//! memblock frames to the mixer's pull-based sink input.

use std::sync::mpsc::Sender;

use crate::error::PulseError;
use crate::mixer::SinkInputCallbacks;
use crate::queue::{BlockQueue, BlockQueueConfig};
use crate::sample_spec::SampleSpec;

/// A frame a stream needs written to its connection's transport, without
/// the stream holding any reference back to the transport or connection
/// itself.
///
/// Mirrors the teacher's `client::reactor` outgoing-command channel: a
/// stream only ever has a `Sender` end, so a mixer callback firing on the
/// mixer's own thread/discipline can queue outbound frames without
/// reentering the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutgoingFrame {
    /// A credit grant for this stream.
    Request {
        /// This stream's wire index.
        stream_index: u32,
        /// Additional bytes the client may now send.
        bytes: u32,
    },
    /// Completes a pending drain successfully.
    DrainAck {
        /// The reply tag of the original `DRAIN_PLAYBACK_STREAM` command.
        tag: u32,
    },
    /// Completes a pending drain with an error (the stream was destroyed
    /// while the drain was outstanding).
    DrainError {
        /// The reply tag of the original `DRAIN_PLAYBACK_STREAM` command.
        tag: u32,
        /// Always [`PulseError::NoEntity`].
        error: PulseError,
    },
}

/// A playback stream: one client's audio pushed toward one sink input.
pub struct PlaybackStream {
    index: u32,
    sink_input_index: u32,
    sample_spec: SampleSpec,
    queue: BlockQueue,
    requested_bytes: u32,
    drain_tag: Option<u32>,
    outgoing: Sender<OutgoingFrame>,
}

impl PlaybackStream {
    /// Constructs a new stream and immediately grants its initial credit,
    /// matching §4.6's "initial credit is issued immediately after
    /// replying to `CREATE_PLAYBACK_STREAM`".
    pub fn new(
        index: u32,
        sink_input_index: u32,
        sample_spec: SampleSpec,
        queue_config: BlockQueueConfig,
        outgoing: Sender<OutgoingFrame>,
    ) -> PlaybackStream {
        let queue = BlockQueue::new(queue_config);
        let mut stream = PlaybackStream {
            index,
            sink_input_index,
            sample_spec,
            queue,
            requested_bytes: 0,
            drain_tag: None,
            outgoing,
        };
        stream.recompute_credit();
        stream
    }

    /// This stream's wire index.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// The mixer's handle for this stream's sink input.
    pub fn sink_input_index(&self) -> u32 {
        self.sink_input_index
    }

    /// Bytes currently outstanding as credit to the client.
    pub fn requested_bytes(&self) -> u32 {
        self.requested_bytes
    }

    fn recompute_credit(&mut self) {
        let want = self.queue.missing() as u32;
        if want > self.requested_bytes
            && (want - self.requested_bytes) >= self.queue.minreq() as u32
        {
            let delta = want - self.requested_bytes;
            self.requested_bytes += delta;
            let _ = self.outgoing.send(OutgoingFrame::Request {
                stream_index: self.index,
                bytes: delta,
            });
        }
    }

    /// Handles an inbound memblock for this stream: debits credit, then
    /// enqueues the bytes.
    pub fn push_memblock(&mut self, bytes: &[u8], delta: i32) {
        self.requested_bytes = self.requested_bytes.saturating_sub(bytes.len() as u32);
        // push_align failures (an empty, fully-misaligned chunk) are not a
        // protocol violation -- the client simply sent nothing useful.
        let _ = self.queue.push_align(bytes, delta as i64);
    }

    /// Handles `DRAIN_PLAYBACK_STREAM(tag)`.
    ///
    /// Returns `true` if the caller should send an immediate simple-ack
    /// (queue was already unreadable); otherwise the drain is recorded and
    /// will complete later from [`SinkInputCallbacks::drop`].
    pub fn request_drain(&mut self, tag: u32) -> bool {
        if !self.queue.is_readable() {
            return true;
        }
        self.drain_tag = Some(tag);
        false
    }

    /// Current queued latency, in microseconds.
    pub fn latency_usec(&self) -> u64 {
        self.sample_spec.bytes_to_usec(self.queue.length() as u64)
    }
}

impl SinkInputCallbacks for PlaybackStream {
    fn peek(&mut self) -> Option<Vec<u8>> {
        self.queue.peek(usize::MAX)
    }

    fn drop(&mut self, n: usize) {
        self.queue.drop_bytes(n);
        self.recompute_credit();

        if self.drain_tag.is_some() && !self.queue.is_readable() {
            let tag = self.drain_tag.take().unwrap();
            let _ = self.outgoing.send(OutgoingFrame::DrainAck { tag });
        }
    }

    fn kill(&mut self) {
        if let Some(tag) = self.drain_tag.take() {
            let _ = self.outgoing.send(OutgoingFrame::DrainError {
                tag,
                error: PulseError::NoEntity,
            });
        }
    }

    fn latency(&self) -> u64 {
        self.latency_usec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample_spec::SampleFormat;
    use pretty_assertions::assert_eq;
    use std::sync::mpsc::channel;

    fn queue_config() -> BlockQueueConfig {
        BlockQueueConfig {
            maxlength: 65536,
            tlength: 16384,
            prebuf: 4096,
            minreq: 1024,
            frame_size: 4,
        }
    }

    fn ss() -> SampleSpec {
        SampleSpec {
            format: SampleFormat::S16Le,
            channels: 2,
            rate: 44100,
        }
    }

    #[test]
    fn initial_credit_is_granted_on_construction() {
        let (tx, rx) = channel();
        let stream = PlaybackStream::new(3, 9, ss(), queue_config(), tx);

        assert_eq!(stream.requested_bytes(), 16384);
        match rx.try_recv().unwrap() {
            OutgoingFrame::Request {
                stream_index,
                bytes,
            } => {
                assert_eq!(stream_index, 3);
                assert_eq!(bytes, 16384);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn credit_cycle_on_drop() {
        let (tx, rx) = channel();
        let mut stream = PlaybackStream::new(3, 9, ss(), queue_config(), tx);
        let _ = rx.try_recv(); // initial REQUEST

        stream.push_memblock(&[0u8; 4096], 0);
        assert_eq!(stream.requested_bytes(), 16384 - 4096);

        stream.drop(4096);
        assert_eq!(stream.requested_bytes(), 16384);
        match rx.try_recv().unwrap() {
            OutgoingFrame::Request { bytes, .. } => assert_eq!(bytes, 4096),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn drain_on_empty_queue_is_immediate() {
        let (tx, _rx) = channel();
        let mut stream = PlaybackStream::new(3, 9, ss(), queue_config(), tx);
        assert!(stream.request_drain(42));
    }

    #[test]
    fn drain_with_pending_data_completes_on_drop() {
        let (tx, rx) = channel();
        let mut stream = PlaybackStream::new(3, 9, ss(), queue_config(), tx);
        let _ = rx.try_recv(); // initial REQUEST

        stream.push_memblock(&[0u8; 4096], 0);
        assert!(stream.queue.is_readable());

        assert!(!stream.request_drain(42));

        stream.drop(4096);
        let mut saw_drain_ack = false;
        while let Ok(frame) = rx.try_recv() {
            if frame == (OutgoingFrame::DrainAck { tag: 42 }) {
                saw_drain_ack = true;
            }
        }
        assert!(saw_drain_ack);
    }

    #[test]
    fn kill_with_pending_drain_sends_no_entity() {
        let (tx, rx) = channel();
        let mut stream = PlaybackStream::new(3, 9, ss(), queue_config(), tx);
        let _ = rx.try_recv(); // initial REQUEST

        stream.push_memblock(&[0u8; 4096], 0);
        assert!(!stream.request_drain(42));

        stream.kill();
        let mut saw_error = false;
        while let Ok(frame) = rx.try_recv() {
            if frame
                == (OutgoingFrame::DrainError {
                    tag: 42,
                    error: PulseError::NoEntity,
                })
            {
                saw_error = true;
            }
        }
        assert!(saw_error);
    }
}
