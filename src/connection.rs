//! The per-client connection: authentication, stream ownership, and
//! command dispatch glued to one transport.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::sync::mpsc::{channel, Receiver, Sender};

use log::{debug, info, warn};

use crate::command::{
    self, Command, CreatePlaybackStreamReply, DEFAULT_SINK,
};
use crate::cookie::Cookie;
use crate::dispatch::{decode_packet, unknown_channel};
use crate::error::{DispatchError, ProtocolError, PulseError};
use crate::mixer::{SinkInputParams, SinkRegistry};
use crate::queue::BlockQueueConfig;
use crate::record::Record;
use crate::stream::{OutgoingFrame, PlaybackStream};
use crate::transport::{InboundFrame, Transport};

/// What the caller should do after a connection has processed one inbound
/// frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Keep the connection running.
    Continue,
    /// The client sent `EXIT`; the listener should begin shutting down.
    ///
    /// Per §9's second open question, the ack is queued before this event
    /// is returned; delivery to the client is best-effort, not guaranteed.
    ExitRequested,
}

/// One authenticated (or not-yet-authenticated) client session.
pub struct Connection<T: Transport, M: SinkRegistry> {
    transport: T,
    mixer: Rc<RefCell<M>>,
    cookie: Rc<Cookie>,
    authenticated: bool,
    client_name: Option<String>,
    streams: HashMap<u32, Rc<RefCell<PlaybackStream>>>,
    next_stream_index: u32,
    outgoing_tx: Sender<OutgoingFrame>,
    outgoing_rx: Receiver<OutgoingFrame>,
}

impl<T: Transport, M: SinkRegistry> Connection<T, M> {
    /// Constructs a new connection. `public` pre-authorizes it, matching
    /// the listener's public-mode flag.
    pub fn new(transport: T, mixer: Rc<RefCell<M>>, cookie: Rc<Cookie>, public: bool) -> Self {
        let (outgoing_tx, outgoing_rx) = channel();
        Connection {
            transport,
            mixer,
            cookie,
            authenticated: public,
            client_name: None,
            streams: HashMap::new(),
            next_stream_index: 0,
            outgoing_tx,
            outgoing_rx,
        }
    }

    /// True iff `AUTH` has succeeded (or the connection was constructed in
    /// public mode).
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// The name set by a prior `SET_NAME`, if any.
    pub fn client_name(&self) -> Option<&str> {
        self.client_name.as_deref()
    }

    /// Number of playback streams currently owned by this connection.
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Returns a weak handle to a stream, for a production mixer adapter
    /// to hold as its sink-input callback target. The mixer must never
    /// hold the strong `Rc` — only the connection does.
    pub fn stream_weak(&self, index: u32) -> Option<Weak<RefCell<PlaybackStream>>> {
        self.streams.get(&index).map(Rc::downgrade)
    }

    /// Reads and handles every frame currently available from the
    /// transport, writing replies and flushing any outgoing frames queued
    /// by streams along the way.
    ///
    /// Returns `Ok(ConnectionEvent::ExitRequested)` if the client asked to
    /// exit; an `Err` means the connection suffered a protocol violation
    /// and the caller must tear it down via [`Self::teardown`].
    pub fn poll(&mut self) -> Result<ConnectionEvent, ProtocolError> {
        loop {
            let frame = match self.transport.read_frame()? {
                Some(f) => f,
                None => return Ok(ConnectionEvent::Continue),
            };

            let event = self.process_frame(frame)?;
            self.flush_outgoing()?;
            if event == ConnectionEvent::ExitRequested {
                return Ok(event);
            }
        }
    }

    fn process_frame(&mut self, frame: InboundFrame) -> Result<ConnectionEvent, ProtocolError> {
        match frame {
            InboundFrame::Packet(payload) => {
                let (tag, command) = decode_packet(&payload)?;
                let (reply, event) = self.dispatch(tag, command)?;
                if let Some(record) = reply {
                    self.transport.write_packet(&record)?;
                }
                Ok(event)
            }
            InboundFrame::Memblock {
                channel,
                delta,
                bytes,
            } => {
                let stream = self
                    .streams
                    .get(&channel)
                    .cloned()
                    .ok_or_else(|| unknown_channel(channel))?;
                stream.borrow_mut().push_memblock(&bytes, delta);
                Ok(ConnectionEvent::Continue)
            }
        }
    }

    /// Runs one command through [`Self::handle_command`], per §7's error
    /// policy: a [`DispatchError::Reply`] is reported to the client and the
    /// connection stays open; a [`DispatchError::Protocol`] is fatal and
    /// propagates to the caller, which tears the connection down.
    fn dispatch(
        &mut self,
        tag: u32,
        command: Command,
    ) -> Result<(Option<Record<'static>>, ConnectionEvent), ProtocolError> {
        match self.handle_command(tag, command) {
            Ok(outcome) => Ok(outcome),
            Err(DispatchError::Reply(error)) => {
                Ok((Some(command::write_error(tag, error)), ConnectionEvent::Continue))
            }
            Err(DispatchError::Protocol(error)) => Err(error),
        }
    }

    fn require_auth(&self) -> Result<(), PulseError> {
        if self.authenticated {
            Ok(())
        } else {
            Err(PulseError::Access)
        }
    }

    fn handle_command(
        &mut self,
        tag: u32,
        command: Command,
    ) -> Result<(Option<Record<'static>>, ConnectionEvent), DispatchError> {
        match command {
            Command::Auth(candidate) => {
                if self.cookie.matches(&candidate) {
                    self.authenticated = true;
                    Ok((Some(command::write_simple_ack(tag)), ConnectionEvent::Continue))
                } else {
                    Err(DispatchError::Reply(PulseError::Access))
                }
            }

            Command::SetName(name) => {
                debug!("client set name to {name:?}");
                self.client_name = Some(name);
                Ok((Some(command::write_simple_ack(tag)), ConnectionEvent::Continue))
            }

            Command::Exit => {
                self.require_auth()?;
                info!("client requested exit");
                Ok((
                    Some(command::write_simple_ack(tag)),
                    ConnectionEvent::ExitRequested,
                ))
            }

            Command::LookupSink(name) => {
                self.require_auth()?;
                match self.mixer.borrow().lookup_sink(&name) {
                    Some(index) => Ok((
                        Some(command::write_lookup_reply(tag, index)),
                        ConnectionEvent::Continue,
                    )),
                    None => Err(DispatchError::Reply(PulseError::NoEntity)),
                }
            }

            Command::LookupSource(name) => {
                self.require_auth()?;
                match self.mixer.borrow().lookup_source(&name) {
                    Some(index) => Ok((
                        Some(command::write_lookup_reply(tag, index)),
                        ConnectionEvent::Continue,
                    )),
                    None => Err(DispatchError::Reply(PulseError::NoEntity)),
                }
            }

            Command::CreatePlaybackStream(params) => {
                self.require_auth()?;

                let sink_index = if params.sink_index == DEFAULT_SINK {
                    None
                } else {
                    Some(params.sink_index)
                };

                let stream_index = self.next_stream_index;

                let sink_input_index = self
                    .mixer
                    .borrow_mut()
                    .register_sink_input(
                        SinkInputParams {
                            name: params.name.clone(),
                            sample_spec: params.sample_spec,
                            sink_index,
                        },
                        stream_index,
                    )
                    .map_err(|()| DispatchError::Reply(PulseError::Invalid))?;

                self.next_stream_index += 1;

                let queue_config = BlockQueueConfig {
                    maxlength: params.maxlength as usize,
                    tlength: params.tlength as usize,
                    prebuf: params.prebuf as usize,
                    minreq: params.minreq as usize,
                    frame_size: params.sample_spec.frame_size(),
                };

                let stream = PlaybackStream::new(
                    stream_index,
                    sink_input_index,
                    params.sample_spec,
                    queue_config,
                    self.outgoing_tx.clone(),
                );
                self.streams.insert(stream_index, Rc::new(RefCell::new(stream)));

                Ok((
                    Some(command::write_create_playback_stream_reply(
                        tag,
                        CreatePlaybackStreamReply {
                            stream_index,
                            sink_input_index,
                        },
                    )),
                    ConnectionEvent::Continue,
                ))
            }

            Command::DeletePlaybackStream(channel) => {
                self.require_auth()?;
                self.free_stream(channel)
                    .ok_or(DispatchError::Reply(PulseError::Exist))?;
                Ok((Some(command::write_simple_ack(tag)), ConnectionEvent::Continue))
            }

            Command::DrainPlaybackStream(stream_index) => {
                self.require_auth()?;
                let stream = self
                    .streams
                    .get(&stream_index)
                    .cloned()
                    .ok_or(DispatchError::Reply(PulseError::NoEntity))?;

                if stream.borrow_mut().request_drain(tag) {
                    Ok((Some(command::write_simple_ack(tag)), ConnectionEvent::Continue))
                } else {
                    Ok((None, ConnectionEvent::Continue))
                }
            }
        }
    }

    /// Removes and fully frees a playback stream, per the REDESIGN
    /// FLAG: delete must actually free the stream, not just ack it.
    ///
    /// Removal from `self.streams` happens before the mixer deregistration
    /// call, so a same-thread reentrant callback into this connection
    /// (racing a manual delete with a mixer-initiated kill) observes the
    /// stream already gone instead of double-freeing it.
    fn free_stream(&mut self, index: u32) -> Option<()> {
        let stream = self.streams.remove(&index)?;
        // Aborts any pending drain (surfaced as NO_ENTITY) before the sink
        // input is torn down, matching §4.6's "if the stream is freed
        // while a drain is pending" rule for every free path, not just a
        // mixer-initiated kill.
        stream.borrow_mut().kill();
        let sink_input_index = stream.borrow().sink_input_index();
        self.mixer.borrow_mut().remove_sink_input(sink_input_index);
        Some(())
    }

    /// Writes every frame streams have queued since the last flush
    /// (`REQUEST` grants, deferred drain completions). `poll` calls this
    /// after every inbound frame; a production mixer adapter that invokes
    /// [`crate::mixer::SinkInputCallbacks`] methods outside of `poll` (via
    /// a [`Self::stream_weak`] handle) must call this afterward to
    /// actually deliver what those callbacks queued.
    pub fn flush_outgoing(&mut self) -> std::io::Result<()> {
        while let Ok(frame) = self.outgoing_rx.try_recv() {
            let record = match frame {
                OutgoingFrame::Request { stream_index, bytes } => {
                    command::write_request(stream_index, bytes)
                }
                OutgoingFrame::DrainAck { tag } => command::write_simple_ack(tag),
                OutgoingFrame::DrainError { tag, error } => command::write_error(tag, error),
            };
            self.transport.write_packet(&record)?;
        }
        Ok(())
    }

    /// Tears down the connection: frees every owned stream (deregistering
    /// its sink input) in index order, then drops the dispatcher state.
    ///
    /// Called on transport death or a protocol error surfaced by
    /// [`Self::poll`]; never re-entered from within a stream's own
    /// teardown since streams are removed from `self.streams` before the
    /// mixer is told about it (see [`Self::free_stream`]).
    pub fn teardown(&mut self) {
        let indices: Vec<u32> = self.streams.keys().copied().collect();
        for index in indices {
            self.free_stream(index);
        }
        if let Err(e) = self.flush_outgoing() {
            warn!("failed flushing outgoing frames during teardown: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cookie::COOKIE_LEN;
    use crate::sample_spec::{SampleFormat, SampleSpec};
    use crate::testutil::{ChannelTransport, FakeMixer};
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    fn cookie() -> Rc<Cookie> {
        Rc::new(Cookie::new([7u8; COOKIE_LEN]))
    }

    fn mixer_with_default_sink() -> Rc<RefCell<FakeMixer>> {
        let mut m = FakeMixer::new();
        m.add_sink("default", 0);
        Rc::new(RefCell::new(m))
    }

    fn ss() -> SampleSpec {
        SampleSpec {
            format: SampleFormat::S16Le,
            channels: 2,
            rate: 44100,
        }
    }

    fn new_conn(public: bool) -> Connection<ChannelTransport, FakeMixer> {
        Connection::new(ChannelTransport::new(), mixer_with_default_sink(), cookie(), public)
    }

    fn send_command(conn: &mut Connection<ChannelTransport, FakeMixer>, cmd: Command, tag: u32) {
        let record = cmd.write(tag);
        conn.transport_mut().push_inbound_packet(&record);
    }

    impl<M: SinkRegistry> Connection<ChannelTransport, M> {
        fn transport_mut(&mut self) -> &mut ChannelTransport {
            // Test-only accessor; production code never needs to reach
            // into the transport from outside `poll`/`teardown`.
            &mut self.transport
        }
    }

    #[test]
    fn auth_then_lookup_missing_sink() {
        let mut conn = new_conn(false);
        send_command(&mut conn, Command::Auth(vec![7u8; COOKIE_LEN]), 1);
        send_command(&mut conn, Command::LookupSink("missing".into()), 2);

        conn.poll().unwrap();
        let packets = conn.transport_mut().take_outbound_packets();
        assert_eq!(packets.len(), 2);

        let mut reply1 = Record::from_bytes(&packets[0]);
        assert_eq!(reply1.get_u32().unwrap(), crate::command::CommandTag::Reply as u32);
        assert_eq!(reply1.get_u32().unwrap(), 1);

        let mut reply2 = Record::from_bytes(&packets[1]);
        assert_eq!(reply2.get_u32().unwrap(), crate::command::CommandTag::Error as u32);
        assert_eq!(reply2.get_u32().unwrap(), 2);
        assert_eq!(reply2.get_u32().unwrap(), PulseError::NoEntity as u32);
    }

    #[test]
    fn unauthenticated_command_is_rejected_and_connection_stays_open() {
        let mut conn = new_conn(false);
        send_command(&mut conn, Command::Exit, 1);

        let event = conn.poll().unwrap();
        assert_eq!(event, ConnectionEvent::Continue);

        let packets = conn.transport_mut().take_outbound_packets();
        let mut reply = Record::from_bytes(&packets[0]);
        assert_eq!(reply.get_u32().unwrap(), crate::command::CommandTag::Error as u32);
        let _tag = reply.get_u32().unwrap();
        assert_eq!(reply.get_u32().unwrap(), PulseError::Access as u32);
    }

    #[test]
    fn credit_cycle_after_memblock_and_mixer_drop() {
        use crate::mixer::SinkInputCallbacks;

        let mut conn = new_conn(true);
        send_command(
            &mut conn,
            Command::CreatePlaybackStream(crate::command::CreatePlaybackStreamParams {
                name: "s".into(),
                sample_spec: ss(),
                sink_index: DEFAULT_SINK,
                maxlength: 65536,
                tlength: 16384,
                prebuf: 4096,
                minreq: 1024,
            }),
            1,
        );
        conn.poll().unwrap();

        let packets = conn.transport_mut().take_outbound_packets();
        assert_eq!(packets.len(), 2);

        let mut create_reply = Record::from_bytes(&packets[0]);
        create_reply.get_u32().unwrap();
        create_reply.get_u32().unwrap();
        let stream_index = create_reply.get_u32().unwrap();

        let mut initial_request = Record::from_bytes(&packets[1]);
        assert_eq!(
            initial_request.get_u32().unwrap(),
            crate::command::CommandTag::Request as u32
        );
        initial_request.get_u32().unwrap(); // tag = u32::MAX, no reply expected
        assert_eq!(initial_request.get_u32().unwrap(), stream_index);
        assert_eq!(initial_request.get_u32().unwrap(), 16384);

        // Client writes a 4096-byte memblock; no REQUEST yet (credit only
        // recomputes after the mixer drops bytes).
        conn.transport_mut().push_inbound(InboundFrame::Memblock {
            channel: stream_index,
            delta: 0,
            bytes: vec![0u8; 4096],
        });
        conn.poll().unwrap();
        assert!(conn.transport_mut().take_outbound_packets().is_empty());

        // The mixer pulls and drops 4096 bytes via its weak handle.
        let stream = conn.stream_weak(stream_index).unwrap().upgrade().unwrap();
        stream.borrow_mut().drop(4096);
        conn.flush_outgoing().unwrap();

        let packets = conn.transport_mut().take_outbound_packets();
        assert_eq!(packets.len(), 1);
        let mut request = Record::from_bytes(&packets[0]);
        assert_eq!(request.get_u32().unwrap(), crate::command::CommandTag::Request as u32);
        request.get_u32().unwrap();
        assert_eq!(request.get_u32().unwrap(), stream_index);
        assert_eq!(request.get_u32().unwrap(), 4096);
    }

    #[test]
    fn create_and_drain_empty_stream() {
        let mut conn = new_conn(true);
        send_command(
            &mut conn,
            Command::CreatePlaybackStream(crate::command::CreatePlaybackStreamParams {
                name: "s".into(),
                sample_spec: ss(),
                sink_index: DEFAULT_SINK,
                maxlength: 65536,
                tlength: 16384,
                prebuf: 4096,
                minreq: 1024,
            }),
            1,
        );
        conn.poll().unwrap();

        let packets = conn.transport_mut().take_outbound_packets();
        // CREATE reply, then the initial REQUEST the stream issues.
        assert_eq!(packets.len(), 2);
        let mut create_reply = Record::from_bytes(&packets[0]);
        assert_eq!(create_reply.get_u32().unwrap(), crate::command::CommandTag::Reply as u32);
        assert_eq!(create_reply.get_u32().unwrap(), 1);
        let stream_index = create_reply.get_u32().unwrap();
        let _sink_input_index = create_reply.get_u32().unwrap();

        send_command(&mut conn, Command::DrainPlaybackStream(stream_index), 2);
        conn.poll().unwrap();

        let packets = conn.transport_mut().take_outbound_packets();
        assert_eq!(packets.len(), 1);
        let mut drain_reply = Record::from_bytes(&packets[0]);
        assert_eq!(drain_reply.get_u32().unwrap(), crate::command::CommandTag::Reply as u32);
        assert_eq!(drain_reply.get_u32().unwrap(), 2);
    }

    #[test]
    fn delete_playback_stream_actually_frees_it() {
        let mixer = mixer_with_default_sink();
        let mut conn = Connection::new(ChannelTransport::new(), mixer.clone(), cookie(), true);

        send_command(
            &mut conn,
            Command::CreatePlaybackStream(crate::command::CreatePlaybackStreamParams {
                name: "s".into(),
                sample_spec: ss(),
                sink_index: DEFAULT_SINK,
                maxlength: 65536,
                tlength: 16384,
                prebuf: 4096,
                minreq: 1024,
            }),
            1,
        );
        conn.poll().unwrap();
        let packets = conn.transport_mut().take_outbound_packets();
        let mut create_reply = Record::from_bytes(&packets[0]);
        create_reply.get_u32().unwrap();
        create_reply.get_u32().unwrap();
        let stream_index = create_reply.get_u32().unwrap();

        assert_eq!(conn.stream_count(), 1);
        assert_eq!(mixer.borrow().sink_input_count(), 1);

        send_command(&mut conn, Command::DeletePlaybackStream(stream_index), 2);
        conn.poll().unwrap();
        assert_eq!(conn.stream_count(), 0);
        assert_eq!(mixer.borrow().sink_input_count(), 0);

        // Deleting again must report EXIST, not succeed a second time.
        send_command(&mut conn, Command::DeletePlaybackStream(stream_index), 3);
        conn.poll().unwrap();
        let packets = conn.transport_mut().take_outbound_packets();
        let mut reply = Record::from_bytes(&packets[0]);
        assert_eq!(reply.get_u32().unwrap(), crate::command::CommandTag::Error as u32);
        reply.get_u32().unwrap();
        assert_eq!(reply.get_u32().unwrap(), PulseError::Exist as u32);
    }

    #[test]
    fn protocol_violation_is_surfaced_to_caller() {
        let mut conn = new_conn(true);
        conn.transport_mut()
            .push_inbound(InboundFrame::Memblock {
                channel: 99,
                delta: 0,
                bytes: vec![1, 2, 3, 4],
            });

        assert_matches!(conn.poll(), Err(ProtocolError::UnknownChannel(99)));
    }
}
