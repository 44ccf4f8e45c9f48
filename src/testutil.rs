//! Test doubles for the external collaborators declared in `mixer` and
//! `transport`.
//!
//! Kept in their own module (rather than inline `#[cfg(test)]` blocks in
//! `connection`) since both doubles are shared across several modules'
//! test suites.

use std::collections::{HashMap, VecDeque};
use std::io;

use crate::mixer::{SinkInputIndex, SinkInputParams, SinkRegistry};
use crate::record::Record;
use crate::transport::{InboundFrame, Transport};

/// An in-memory [`Transport`]: inbound frames are queued by the test, and
/// outbound packets/memblocks are captured for assertions instead of going
/// anywhere.
#[derive(Default)]
pub struct ChannelTransport {
    inbound: VecDeque<InboundFrame>,
    pub outbound_packets: Vec<Vec<u8>>,
    pub outbound_memblocks: Vec<(u32, i32, Vec<u8>)>,
}

impl ChannelTransport {
    /// Creates an empty transport.
    pub fn new() -> ChannelTransport {
        ChannelTransport::default()
    }

    /// Queues a frame to be returned by the next [`Transport::read_frame`].
    pub fn push_inbound(&mut self, frame: InboundFrame) {
        self.inbound.push_back(frame);
    }

    /// Queues a control packet built from a [`Record`].
    pub fn push_inbound_packet(&mut self, record: &Record<'_>) {
        self.push_inbound(InboundFrame::Packet(record.as_bytes()));
    }

    /// Drains and returns every packet written so far, oldest first.
    pub fn take_outbound_packets(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.outbound_packets)
    }
}

impl Transport for ChannelTransport {
    fn read_frame(&mut self) -> io::Result<Option<InboundFrame>> {
        Ok(self.inbound.pop_front())
    }

    fn write_packet(&mut self, record: &Record<'_>) -> io::Result<()> {
        self.outbound_packets.push(record.as_bytes());
        Ok(())
    }

    fn write_memblock(&mut self, channel: u32, delta: i32, bytes: &[u8]) -> io::Result<()> {
        self.outbound_memblocks.push((channel, delta, bytes.to_vec()));
        Ok(())
    }
}

/// An in-memory [`SinkRegistry`]: a fixed set of named sinks/sources and a
/// counter for newly registered sink inputs.
#[derive(Default)]
pub struct FakeMixer {
    sinks: HashMap<String, u32>,
    sources: HashMap<String, u32>,
    default_sink: Option<u32>,
    next_sink_input: u32,
    /// sink_input_index -> the `key` it was registered with.
    sink_inputs: HashMap<SinkInputIndex, u32>,
}

impl FakeMixer {
    /// Creates a mixer with no sinks, sources, or default sink configured.
    pub fn new() -> FakeMixer {
        FakeMixer::default()
    }

    /// Registers a named sink and, if this is the first one, makes it the
    /// default.
    pub fn add_sink(&mut self, name: &str, index: u32) -> &mut Self {
        self.sinks.insert(name.to_string(), index);
        self.default_sink.get_or_insert(index);
        self
    }

    /// Registers a named source.
    pub fn add_source(&mut self, name: &str, index: u32) -> &mut Self {
        self.sources.insert(name.to_string(), index);
        self
    }

    /// True iff a sink input with this index is currently registered.
    pub fn has_sink_input(&self, index: SinkInputIndex) -> bool {
        self.sink_inputs.contains_key(&index)
    }

    /// Number of currently registered sink inputs.
    pub fn sink_input_count(&self) -> usize {
        self.sink_inputs.len()
    }
}

impl SinkRegistry for FakeMixer {
    fn lookup_sink(&self, name: &str) -> Option<u32> {
        self.sinks.get(name).copied()
    }

    fn lookup_source(&self, name: &str) -> Option<u32> {
        self.sources.get(name).copied()
    }

    fn default_sink(&self) -> Option<u32> {
        self.default_sink
    }

    fn register_sink_input(
        &mut self,
        params: SinkInputParams,
        key: u32,
    ) -> Result<SinkInputIndex, ()> {
        let resolved = params.sink_index.or(self.default_sink);
        if resolved.is_none() {
            return Err(());
        }

        let index = self.next_sink_input;
        self.next_sink_input += 1;
        self.sink_inputs.insert(index, key);
        Ok(index)
    }

    fn remove_sink_input(&mut self, sink_input_index: SinkInputIndex) {
        self.sink_inputs.remove(&sink_input_index);
    }
}
