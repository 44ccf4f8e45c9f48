//! A bounded FIFO of audio frames with prebuffer/underrun semantics, used to
//! bridge flow-controlled network writes to a pull-based mixer sink input.
//!
//! Grounded directly on `pa_memblockq` as driven from `protocol-native.c`:
//! `maxlength`/`tlength`/`prebuf`/`minreq` play the same roles as the
//! matching `pa_memblockq_new` parameters, and `push_align`/`peek`/`drop`/
//! `missing`/`is_readable` mirror `pa_memblockq_push_align`,
//! `pa_memblockq_peek`, `pa_memblockq_drop`, `pa_memblockq_missing` and
//! `pa_memblockq_is_readable` respectively.

use std::collections::VecDeque;

use thiserror::Error;

/// An error raised while pushing data into a [`BlockQueue`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    /// The chunk, once frame-aligned, was empty.
    #[error("chunk has no complete frames")]
    EmptyChunk,
}

/// Tunables fixed at queue creation, matching `pa_memblockq_new`'s
/// parameter list (minus the SHM pool argument, out of scope here).
#[derive(Debug, Clone, Copy)]
pub struct BlockQueueConfig {
    /// Hard cap on the number of bytes the queue will hold.
    pub maxlength: usize,
    /// Target fill level; used to compute [`BlockQueue::missing`].
    pub tlength: usize,
    /// Bytes that must accumulate before playback starts (or resumes after
    /// an underrun). Zero disables prebuffering.
    pub prebuf: usize,
    /// Minimum batch size signaled to the peer via `missing`.
    pub minreq: usize,
    /// Bytes making up one frame; pushes are truncated to a whole number
    /// of frames.
    pub frame_size: usize,
}

/// The underrun state machine driving [`BlockQueue::is_readable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// Enough data has accumulated (or prebuffering is disabled); reads are
    /// served normally.
    Primed,
    /// Waiting for `prebuf` bytes to accumulate before resuming reads.
    Starving,
}

/// A bounded FIFO of frame-aligned audio bytes.
pub struct BlockQueue {
    config: BlockQueueConfig,
    chunks: VecDeque<Vec<u8>>,
    length: usize,
    state: QueueState,
}

impl BlockQueue {
    /// Creates an empty queue. Starts `Starving` if `prebuf > 0`, else
    /// `Primed` (matching `pa_memblockq_new`'s initial `in_prebuf` value).
    pub fn new(config: BlockQueueConfig) -> BlockQueue {
        let state = if config.prebuf > 0 {
            QueueState::Starving
        } else {
            QueueState::Primed
        };

        BlockQueue {
            config,
            chunks: VecDeque::new(),
            length: 0,
            state,
        }
    }

    fn align_down(&self, n: usize) -> usize {
        n - (n % self.config.frame_size)
    }

    /// Total bytes currently queued.
    pub fn length(&self) -> usize {
        self.length
    }

    /// Current underrun state.
    pub fn state(&self) -> QueueState {
        self.state
    }

    /// Bytes needed to reach `tlength`, saturating at zero.
    pub fn missing(&self) -> usize {
        self.config.tlength.saturating_sub(self.length)
    }

    /// True once enough data has accumulated to serve reads: not starving,
    /// and there's at least one full frame buffered.
    pub fn is_readable(&self) -> bool {
        self.state == QueueState::Primed && self.length >= self.config.frame_size
    }

    /// Removes bytes from the front of the queue, oldest first, to make
    /// room for a new push. Used internally when a push would exceed
    /// `maxlength`.
    fn trim_to(&mut self, target_len: usize) {
        while self.length > target_len {
            let over = self.length - target_len;
            let front_len = match self.chunks.front() {
                Some(c) => c.len(),
                None => break,
            };
            if front_len <= over {
                self.chunks.pop_front();
                self.length -= front_len;
            } else {
                let front = self.chunks.front_mut().unwrap();
                front.drain(0..over);
                self.length -= over;
            }
        }
    }

    /// Trims bytes from the *tail* of the queue (the most recently pushed
    /// data), used when `delta` is negative and the caller is rewriting
    /// data it already sent.
    fn trim_tail(&mut self, mut n: usize) {
        while n > 0 {
            let back_len = match self.chunks.back() {
                Some(c) => c.len(),
                None => break,
            };
            if back_len <= n {
                self.chunks.pop_back();
                self.length -= back_len;
                n -= back_len;
            } else {
                let back = self.chunks.back_mut().unwrap();
                let new_len = back_len - n;
                back.truncate(new_len);
                self.length -= n;
                n = 0;
            }
        }
    }

    /// Pushes `data` onto the queue, first seeking by `delta` bytes
    /// relative to the current write position.
    ///
    /// A positive `delta` inserts that many bytes of silence before `data`
    /// (a network gap, matching `pa_memblockq_push_align`'s hole-filling).
    /// A negative `delta` first discards `|delta|` bytes already queued at
    /// the tail, then appends `data` in their place (a client rewriting
    /// data it had already sent but that hasn't been read yet).
    ///
    /// `data` and `delta` are frame-aligned by truncating any trailing
    /// partial frame. If a push would exceed `maxlength`, the oldest
    /// queued bytes are dropped to make room.
    pub fn push_align(&mut self, data: &[u8], delta: i64) -> Result<(), QueueError> {
        if delta > 0 {
            let gap = self.align_down(delta as usize);
            if gap > 0 {
                self.push_silence(gap);
            }
        } else if delta < 0 {
            let trim = self.align_down((-delta) as usize);
            if trim > 0 {
                self.trim_tail(trim.min(self.length));
            }
        }

        let aligned_len = self.align_down(data.len());
        if aligned_len == 0 {
            return Err(QueueError::EmptyChunk);
        }

        self.chunks.push_back(data[..aligned_len].to_vec());
        self.length += aligned_len;

        if self.length > self.config.maxlength {
            self.trim_to(self.config.maxlength);
        }

        if self.state == QueueState::Starving && self.length >= self.config.prebuf {
            self.state = QueueState::Primed;
        }

        Ok(())
    }

    fn push_silence(&mut self, n: usize) {
        self.chunks.push_back(vec![0u8; n]);
        self.length += n;
        if self.length > self.config.maxlength {
            self.trim_to(self.config.maxlength);
        }
    }

    /// Returns the bytes at the front of the queue, up to `max_len`, without
    /// consuming them. Returns `None` if the queue is not currently
    /// readable (see [`is_readable`](Self::is_readable)).
    pub fn peek(&self, max_len: usize) -> Option<Vec<u8>> {
        if !self.is_readable() {
            return None;
        }

        let mut out = Vec::new();
        for chunk in &self.chunks {
            if out.len() >= max_len {
                break;
            }
            let take = chunk.len().min(max_len - out.len());
            out.extend_from_slice(&chunk[..take]);
        }
        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }

    /// Consumes `n` bytes from the front of the queue, frame-aligned down.
    ///
    /// If consuming drains the queue entirely and `prebuf > 0`, the state
    /// reverts to `Starving` (matching `pa_memblockq_drop`'s underrun
    /// transition once the queue runs dry).
    pub fn drop_bytes(&mut self, n: usize) {
        let n = self.align_down(n.min(self.length));
        self.trim_to(self.length.saturating_sub(n));

        if self.length == 0 && self.config.prebuf > 0 {
            self.state = QueueState::Starving;
        }
    }

    /// Discards all queued data and resets to the initial underrun state,
    /// as when a stream is flushed.
    pub fn flush(&mut self) {
        self.chunks.clear();
        self.length = 0;
        self.state = if self.config.prebuf > 0 {
            QueueState::Starving
        } else {
            QueueState::Primed
        };
    }

    /// The configured minimum request batch size.
    pub fn minreq(&self) -> usize {
        self.config.minreq
    }
}
