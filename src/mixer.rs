//! External collaborator contract: the mixing core.
//!
//! Everything this crate needs from the mixer is registering a stream's
//! queue as a pullable sink input and being called back on it. The mixer
//! itself — the sink/source registry, resampling, device I/O, the pull
//! loop — is out of scope; it is modeled here only as the trait surface
//! this crate drives and is driven by.

use crate::sample_spec::SampleSpec;

/// The mixer's handle for a registered sink input.
pub type SinkInputIndex = u32;

/// Arguments needed to attach a new sink input to the mixing graph.
#[derive(Debug, Clone)]
pub struct SinkInputParams {
    /// Diagnostic name, as supplied to `CREATE_PLAYBACK_STREAM`.
    pub name: String,
    /// Format the stream will deliver samples in.
    pub sample_spec: SampleSpec,
    /// Sink to attach to, or `None` for the default sink.
    pub sink_index: Option<u32>,
}

/// The mixing core's registry of sinks/sources and sink-input attachment
/// point.
///
/// A stream's sink input is registered under a `key` (the stream's own
/// wire index); the mixer passes that key back into
/// [`SinkInputCallbacks`] invocations instead of holding any owning
/// reference to the stream itself.
pub trait SinkRegistry {
    /// Looks up a sink's index by name.
    fn lookup_sink(&self, name: &str) -> Option<u32>;
    /// Looks up a source's index by name.
    fn lookup_source(&self, name: &str) -> Option<u32>;
    /// Resolves "the default sink", if the mixer has one configured.
    fn default_sink(&self) -> Option<u32>;
    /// Registers a new sink input. Returns the mixer-assigned sink-input
    /// index, or an error if `params.sink_index` doesn't resolve to a live
    /// sink.
    fn register_sink_input(&mut self, params: SinkInputParams, key: u32) -> Result<SinkInputIndex, ()>;
    /// Deregisters a previously registered sink input. Idempotent: calling
    /// it for an index that is already gone is not an error.
    fn remove_sink_input(&mut self, sink_input_index: SinkInputIndex);
}

/// The callback surface a sink input invokes on its owning stream, on the
/// mixer's own thread/serialization discipline.
///
/// Implementors MUST NOT call back into the owning connection from within
/// any of these methods — see the reentrancy-safety note on
/// [`crate::connection::Connection`].
pub trait SinkInputCallbacks {
    /// Returns the next contiguous chunk of audio without consuming it, or
    /// `None` if the stream has nothing readable right now (queue empty or
    /// still prebuffering).
    fn peek(&mut self) -> Option<Vec<u8>>;
    /// Consumes `n` bytes previously returned by `peek`.
    fn drop(&mut self, n: usize);
    /// The mixer is destroying this sink input; the stream must free
    /// itself and complete any pending drain with an error.
    fn kill(&mut self);
    /// Current queued latency, in microseconds.
    fn latency(&self) -> u64;
}
