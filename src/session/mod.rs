//! RTMP session state machine
//!
//! `RtmpSession` drives the client side of an RTMP connection: the
//! C0/C1/C2 handshake, the `connect()` application handshake, stream
//! creation, publish acknowledgement, acknowledgement accounting and
//! protocol control handling.
//!
//! The session is sans-io: the host event loop owns the socket and
//! calls `socket_connected` / `receive_data` / `socket_writable` /
//! `socket_error` / `socket_disconnected` as its notifications fire.
//! Outbound bytes flow through the [`pipeline::SendPipeline`] into the
//! [`pipeline::Transport`] the session was built with, and everything
//! the application needs to observe comes out of [`poll_event`].
//!
//! The command sequence for publishing, as observed from FMLE against
//! Twitch-style ingests:
//!
//! ```text
//! Clnt  3  0  connect({app, tcUrl, type, flashVer, swfUrl})
//! Srvr  2  0  WindowAckSize, SetPeerBandwidth, StreamBegin, SetChunkSize
//! Srvr  3  0  _result(...)
//! Clnt  3  0  releaseStream(key), FCPublish(key), createStream()
//! Srvr  3  0  _result(1)
//! Clnt  4  1  publish(key, "live")
//! Srvr  3  1  onStatus({code: NetStream.Publish.Start})
//! Clnt  4  1  @setDataFrame("onMetaData", {...}), then media data
//! Clnt  3  0  FCUnpublish(key); closeStream(); deleteStream(1)
//! ```
//!
//! nginx-rtmp never sends StreamBegin; nothing here waits on it.
//!
//! [`poll_event`]: RtmpSession::poll_event

pub mod pipeline;
mod publisher;

use std::collections::{HashMap, VecDeque};

use bytes::BytesMut;

use crate::amf::{self, AmfObject, AmfValue};
use crate::error::{Error, ErrorKind, Result};
use crate::protocol::chunk::{ChunkReader, ChunkWriter, InboundMessage};
use crate::protocol::constants::*;
use crate::protocol::handshake::ClientHandshake;
use crate::protocol::message::{self, RtmpMessage, UserControlEvent};
use crate::target::RtmpTarget;

use pipeline::{SendPipeline, Transport};
use publisher::PublisherState;

/// Connection progress, from TCP dial to RTMP readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// TCP established, handshake not started
    Connected,
    /// C0/C1 sent
    VersionSent,
    /// S0 validated
    VersionReceived,
    /// C2 sent
    AckSent,
    /// Handshake complete; RTMP traffic flows
    Initialized,
    Disconnecting,
}

/// Peer bandwidth limit types from SetPeerBandwidth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckLimitType {
    Hard,
    Soft,
    Dynamic,
}

/// Notifications surfaced to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connecting,
    Connected,
    /// Handshake complete
    Initialized,
    /// `connect()` command accepted
    ConnectedToApp,
    CreatedStream(u32),
    Disconnected,
    Error(ErrorKind),
    /// Every inbound AMF command, including the ones the session also
    /// handles itself
    ReceivedCommand { stream_id: u32, values: Vec<AmfValue> },
    /// The publish stream is ready for frames
    PublisherReady,
    /// The send path fully drained; the producer may write roughly
    /// `bytes_free` more bytes without the kernel buffering them
    DataRequest { bytes_free: usize },
}

pub struct RtmpSession<T: Transport> {
    target: RtmpTarget,
    state: ConnectionState,
    auto_initialize: bool,
    auto_app_connect: bool,
    version_string: String,

    handshake: ClientHandshake,
    in_buf: BytesMut,
    pipe: SendPipeline<T>,
    chunk_reader: ChunkReader,
    chunk_writer: ChunkWriter,

    // Flow control
    in_ack_win: u32,
    out_ack_win: u32,
    in_limit_type: AckLimitType,
    in_bytes_since_ack: u32,
    out_bytes_since_ack: u32,
    in_bytes_since_handshake: u32,

    next_transaction_ids: HashMap<u32, u32>,
    app_connected: bool,
    app_connect_tx_id: u32,
    creating_stream: bool,
    create_stream_tx_id: u32,
    publish_stream_id: u32,
    beginning_publish: bool,
    last_publish_ts: u32,

    pub(crate) publisher: Option<PublisherState>,
    events: VecDeque<SessionEvent>,
}

impl<T: Transport> RtmpSession<T> {
    pub fn new(target: RtmpTarget, transport: T) -> Self {
        Self {
            target,
            state: ConnectionState::Disconnected,
            auto_initialize: true,
            auto_app_connect: true,
            version_string: "FMLE/3.0 (compatible; FMSc/1.0)".to_string(),

            handshake: ClientHandshake::new(),
            in_buf: BytesMut::new(),
            pipe: SendPipeline::new(transport),
            chunk_reader: ChunkReader::new(),
            chunk_writer: ChunkWriter::new(),

            in_ack_win: DEFAULT_ACK_WINDOW,
            out_ack_win: DEFAULT_ACK_WINDOW,
            in_limit_type: AckLimitType::Hard,
            in_bytes_since_ack: 0,
            out_bytes_since_ack: 0,
            in_bytes_since_handshake: 0,

            next_transaction_ids: HashMap::new(),
            app_connected: false,
            app_connect_tx_id: 0,
            creating_stream: false,
            create_stream_tx_id: 0,
            publish_stream_id: 0,
            beginning_publish: false,
            last_publish_ts: 0,

            publisher: None,
            events: VecDeque::new(),
        }
    }

    // ------------------------------------------------------------------
    // Configuration

    pub fn remote_target(&self) -> &RtmpTarget {
        &self.target
    }

    pub fn set_remote_target(&mut self, target: RtmpTarget) {
        self.target = target;
    }

    /// Parse and set the target from a URL carrying the stream name as
    /// its last path segment.
    pub fn set_remote_target_url(&mut self, url: &str) -> Result<()> {
        let target = RtmpTarget::from_url(url, true)
            .ok_or_else(|| Error::Config(format!("invalid RTMP URL: {}", url)))?;
        self.target = target;
        Ok(())
    }

    /// Start the RTMP handshake automatically when the socket connects.
    pub fn set_auto_initialize(&mut self, auto: bool) {
        self.auto_initialize = auto;
    }

    /// Send `connect()` automatically when the handshake completes.
    pub fn set_auto_connect_to_app(&mut self, auto: bool) {
        self.auto_app_connect = auto;
    }

    /// The `flashVer` string sent in `connect()`.
    pub fn set_version_string(&mut self, version: impl Into<String>) {
        self.version_string = version.into();
    }

    pub fn version_string(&self) -> &str {
        &self.version_string
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_socket_connected(&self) -> bool {
        !matches!(
            self.state,
            ConnectionState::Disconnected | ConnectionState::Connecting
        )
    }

    /// Pop the next pending notification.
    pub fn poll_event(&mut self) -> Option<SessionEvent> {
        self.events.pop_front()
    }

    /// Bytes framed since the peer's last acknowledgement. Diagnostic
    /// only: outbound writes are never blocked on the peer's window,
    /// the kernel-buffer-aware pipeline handles congestion instead.
    pub fn out_bytes_since_ack(&self) -> u32 {
        self.out_bytes_since_ack
    }

    // ------------------------------------------------------------------
    // Connection control, driven by the host event loop

    /// Mark the session as dialling. The host owns the actual TCP
    /// connect and reports the outcome through `socket_connected` or
    /// `socket_error`.
    pub fn begin_connect(&mut self) -> Result<()> {
        if self.state != ConnectionState::Disconnected {
            return Err(Error::InvalidWrite);
        }
        self.state = ConnectionState::Connecting;
        self.handshake = ClientHandshake::new();
        self.in_buf.clear();
        self.pipe.clear();
        self.events.push_back(SessionEvent::Connecting);
        Ok(())
    }

    /// The TCP socket is established.
    pub fn socket_connected(&mut self) {
        debug_assert_eq!(self.state, ConnectionState::Connecting);
        self.state = ConnectionState::Connected;
        self.events.push_back(SessionEvent::Connected);

        // Gamer mode does its own packet pacing, so Nagle only gets in
        // the way; saturation mode re-enables it.
        if pipeline::gamer::enabled() {
            let _ = self.pipe.transport_mut().set_nodelay(true);
        }

        if self.auto_initialize {
            if let Err(err) = self.initialize() {
                tracing::warn!(%err, "failed to initiate the RTMP handshake");
                self.disconnect(true);
            }
        }
    }

    /// Begin the RTMP handshake: write C0 and C1.
    pub fn initialize(&mut self) -> Result<()> {
        let c0c1 = self.handshake.generate_c0c1()?;
        self.write(&c0c1)?;
        self.state = ConnectionState::VersionSent;
        Ok(())
    }

    /// Begin the application connection: SetChunkSize(4096) and the
    /// `connect()` command, coalesced into a single socket write.
    pub fn connect_to_app(&mut self) -> Result<()> {
        if self.app_connected {
            return Err(Error::InvalidWrite);
        }
        self.pipe.begin_force_buffer();
        let result = (|| {
            self.set_max_chunk_size(PUBLISH_CHUNK_SIZE)?;
            self.app_connect_tx_id = self.next_transaction_id(0);
            self.write_connect_msg(self.app_connect_tx_id)
        })();
        self.end_force_buffer_internal();
        result
    }

    /// Tear the connection down. A clean disconnect flushes buffered
    /// data first; an unclean one drops it so the host can abort the
    /// socket immediately.
    pub fn disconnect(&mut self, clean: bool) {
        if self.state == ConnectionState::Disconnected {
            return;
        }

        if self.pipe.force_depth() > 0 {
            tracing::warn!("disconnecting while still in forced buffer mode");
            while self.pipe.force_depth() > 0 {
                let _ = self.pipe.end_force_buffer();
            }
        }

        self.publisher = None;

        if clean {
            self.state = ConnectionState::Disconnecting;
            self.pipe.flush_for_close();
        } else {
            self.pipe.clear();
        }

        self.in_buf.clear();
        self.state = ConnectionState::Disconnected;
        self.events.push_back(SessionEvent::Disconnected);
    }

    /// The host observed the peer closing the connection.
    pub fn socket_disconnected(&mut self) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        self.publisher = None;
        self.pipe.clear();
        self.in_buf.clear();
        self.state = ConnectionState::Disconnected;
        self.events.push_back(SessionEvent::Disconnected);
    }

    /// The host observed a socket error.
    pub fn socket_error(&mut self, kind: ErrorKind) {
        tracing::warn!(%kind, "network socket error");
        self.events.push_back(SessionEvent::Error(kind));
        if self.state == ConnectionState::Connecting {
            // Never connected; nothing to flush
            self.state = ConnectionState::Disconnected;
            self.events.push_back(SessionEvent::Disconnected);
        }
    }

    /// The kernel send buffer can accept more data.
    pub fn socket_writable(&mut self) {
        if self.pipe.force_depth() > 0 {
            return;
        }
        match self.pipe.flush(true) {
            Ok(Some(bytes_free)) => {
                self.events.push_back(SessionEvent::DataRequest { bytes_free });
            }
            Ok(None) => {}
            Err(err) => {
                self.events.push_back(SessionEvent::Error(ErrorKind::from_io(&err)));
                self.disconnect(false);
            }
        }
    }

    /// True while the pipeline holds bytes the host should flush on the
    /// next writable notification.
    pub fn wants_writable(&self) -> bool {
        self.pipe.wants_writable()
    }

    // ------------------------------------------------------------------
    // Gamer mode

    /// Approximate upload speed in bytes per second that gamer mode
    /// throttles towards.
    pub fn gamer_set_average_upload(&mut self, bytes_per_sec: u32) {
        self.pipe.set_average_upload(bytes_per_sec);
    }

    /// Seconds without congestion before saturation mode exits.
    pub fn gamer_set_exit_sat_mode_time(&mut self, seconds: f32) {
        self.pipe.set_exit_sat_mode_time(seconds);
    }

    /// Must be called once per tick while gamer mode is enabled and the
    /// session is connected. `num_dropped` is how many ticks were
    /// missed since the last call.
    pub fn gamer_tick_event(&mut self, num_dropped: u32) {
        if !pipeline::gamer::enabled() || !self.is_socket_connected() {
            return;
        }
        if let Err(err) = self.pipe.gamer_tick(num_dropped) {
            self.events.push_back(SessionEvent::Error(ErrorKind::from_io(&err)));
            self.disconnect(false);
        }
    }

    // ------------------------------------------------------------------
    // OS buffer control

    /// Kernel send buffer size (`SO_SNDBUF`), used to bound how much
    /// data can be pending for transmission.
    pub fn os_write_buffer_size(&self) -> std::io::Result<usize> {
        self.pipe.transport().send_buffer_size()
    }

    pub fn set_os_write_buffer_size(&mut self, size: usize) -> std::io::Result<()> {
        self.pipe.transport_mut().set_send_buffer_size(size)
    }

    // ------------------------------------------------------------------
    // Abstracted RTMP commands

    /// Announce and apply a new outbound chunk size.
    pub fn set_max_chunk_size(&mut self, size: u32) -> Result<()> {
        self.write_message(
            0,
            MSG_SET_CHUNK_SIZE,
            0,
            &message::set_chunk_size_payload(size),
            CSID_PROTOCOL_CONTROL,
        )?;
        self.chunk_writer.set_max_chunk_size(size);
        Ok(())
    }

    /// Ask the peer to acknowledge every `size` received bytes.
    pub fn set_ack_win_size(&mut self, size: u32) -> Result<()> {
        self.write_message(
            0,
            MSG_WINDOW_ACK_SIZE,
            0,
            &message::window_ack_size_payload(size),
            CSID_PROTOCOL_CONTROL,
        )?;
        self.out_ack_win = size;
        Ok(())
    }

    /// Ask the peer to limit its output bandwidth.
    pub fn set_peer_bandwidth(&mut self, size: u32, limit_type: AckLimitType) -> Result<()> {
        let limit = match limit_type {
            AckLimitType::Hard => BANDWIDTH_LIMIT_HARD,
            AckLimitType::Soft => BANDWIDTH_LIMIT_SOFT,
            AckLimitType::Dynamic => BANDWIDTH_LIMIT_DYNAMIC,
        };
        self.write_message(
            0,
            MSG_SET_PEER_BANDWIDTH,
            0,
            &message::set_peer_bandwidth_payload(size, limit),
            CSID_PROTOCOL_CONTROL,
        )
    }

    // ------------------------------------------------------------------
    // Inbound data

    /// Feed bytes read from the socket. Events produced while
    /// processing queue up for `poll_event`.
    pub fn receive_data(&mut self, data: &[u8]) {
        if matches!(
            self.state,
            ConnectionState::Disconnected
                | ConnectionState::Connecting
                | ConnectionState::Connected
                | ConnectionState::Disconnecting
        ) {
            // No server data is legitimate in these states; drop it
            if !data.is_empty() {
                tracing::trace!(len = data.len(), state = ?self.state, "dropping inbound data");
            }
            return;
        }

        self.in_buf.extend_from_slice(data);

        if !self.handshake.is_done() {
            let response = match self.handshake.process(&mut self.in_buf) {
                Ok(r) => r,
                Err(err) => {
                    tracing::warn!(%err, "handshake failed");
                    self.events
                        .push_back(SessionEvent::Error(ErrorKind::UnexpectedResponse));
                    self.disconnect(true);
                    return;
                }
            };
            if let Some(c2) = response {
                if self.write(&c2).is_err() {
                    self.disconnect(true);
                    return;
                }
            }

            self.state = match self.handshake.state() {
                crate::protocol::handshake::HandshakeState::VersionSent => {
                    ConnectionState::VersionSent
                }
                crate::protocol::handshake::HandshakeState::VersionReceived => {
                    ConnectionState::VersionReceived
                }
                crate::protocol::handshake::HandshakeState::AckSent => ConnectionState::AckSent,
                crate::protocol::handshake::HandshakeState::Done => ConnectionState::Initialized,
                _ => self.state,
            };

            if self.handshake.is_done() {
                self.reset_protocol_state();
                self.events.push_back(SessionEvent::Initialized);
                if self.auto_app_connect {
                    if let Err(err) = self.connect_to_app() {
                        tracing::warn!(%err, "failed to initiate the application connection");
                        self.disconnect(true);
                        return;
                    }
                }
            } else {
                return; // Waiting on more handshake bytes
            }
        }

        // All other RTMP traffic: read every complete chunk available
        while self.state == ConnectionState::Initialized {
            let Some(read) = self.chunk_reader.read_chunk(&mut self.in_buf) else {
                break;
            };

            // Acknowledge received data as soon as the window fills
            self.in_bytes_since_handshake =
                self.in_bytes_since_handshake.wrapping_add(read.consumed as u32);
            self.in_bytes_since_ack += read.consumed as u32;
            if self.in_bytes_since_ack >= self.in_ack_win {
                let _ = self.write_acknowledge();
                // Reset rather than subtract, so a mid-session window
                // reduction cannot leave the counter permanently above
                // the window.
                self.in_bytes_since_ack = 0;
            }

            if let Some(msg) = read.message {
                self.process_message(msg);
            }
        }
    }

    // ------------------------------------------------------------------
    // Message dispatch

    fn process_message(&mut self, msg: InboundMessage) {
        let parsed = match RtmpMessage::parse(&msg) {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::warn!(%err, msg_type = msg.msg_type, "malformed message from server");
                self.protocol_violation();
                return;
            }
        };

        match parsed {
            RtmpMessage::SetChunkSize(size) => {
                self.chunk_reader.set_max_chunk_size(size);
            }
            RtmpMessage::Abort { csid } => {
                self.chunk_reader.abort(csid);
            }
            RtmpMessage::Acknowledgement { .. } => {
                // Outbound window enforcement is deliberately absent;
                // the kernel-buffer-aware write path handles congestion
                self.out_bytes_since_ack = 0;
            }
            RtmpMessage::UserControl(event) => self.process_user_control(event),
            RtmpMessage::WindowAckSize(size) => {
                self.in_ack_win = size;
            }
            RtmpMessage::SetPeerBandwidth { window, limit_type } => {
                self.process_set_peer_bandwidth(window, limit_type);
            }
            RtmpMessage::Command { values } => {
                self.process_command(msg.msg_stream_id, values);
            }
            RtmpMessage::Data { .. } => {
                tracing::trace!("ignoring data message from server");
            }
            RtmpMessage::Audio { len } | RtmpMessage::Video { len } => {
                // Publishers do not play; drop inbound media
                tracing::trace!(len, msg_type = msg.msg_type, "dropping inbound media");
            }
            RtmpMessage::Unknown { type_id, len } => {
                tracing::warn!(
                    type_id,
                    len,
                    stream_id = msg.msg_stream_id,
                    "received unknown message type"
                );
            }
        }
    }

    fn process_user_control(&mut self, event: UserControlEvent) {
        match event {
            UserControlEvent::PingRequest(timestamp) => {
                let _ = self.write_message(
                    0,
                    MSG_USER_CONTROL,
                    0,
                    &message::ping_response_payload(timestamp),
                    CSID_PROTOCOL_CONTROL,
                );
            }
            UserControlEvent::StreamBegin(_)
            | UserControlEvent::StreamEof(_)
            | UserControlEvent::StreamDry(_)
            | UserControlEvent::SetBufferLength { .. }
            | UserControlEvent::StreamIsRecorded(_)
            | UserControlEvent::PingResponse(_) => {}
            UserControlEvent::Unknown { event_type } => {
                tracing::warn!(event_type, "unknown user control message, ignoring");
            }
        }
    }

    fn process_set_peer_bandwidth(&mut self, window: u32, limit_type: u8) {
        match limit_type {
            BANDWIDTH_LIMIT_HARD => {
                self.in_limit_type = AckLimitType::Hard;
                let _ = self.set_ack_win_size(window);
            }
            BANDWIDTH_LIMIT_SOFT => {
                self.in_limit_type = AckLimitType::Soft;
                let limited = window.min(self.out_ack_win);
                if limited != self.out_ack_win {
                    let _ = self.set_ack_win_size(limited);
                }
            }
            BANDWIDTH_LIMIT_DYNAMIC => {
                // Hard iff the previous limit was Hard, else ignored; a
                // run of Dynamic messages only honours the first
                let was_hard = self.in_limit_type == AckLimitType::Hard;
                self.in_limit_type = AckLimitType::Dynamic;
                if was_hard {
                    let _ = self.set_ack_win_size(window);
                }
            }
            other => {
                tracing::warn!(limit_type = other, "unknown peer bandwidth limit type");
            }
        }
    }

    fn process_command(&mut self, stream_id: u32, values: Vec<AmfValue>) {
        if values.is_empty() {
            return;
        }

        self.events.push_back(SessionEvent::ReceivedCommand {
            stream_id,
            values: values.clone(),
        });

        let Some(name) = values[0].as_str() else {
            return;
        };

        if (name == CMD_RESULT || name == CMD_ERROR) && values.len() >= 4 {
            let is_error = name == CMD_ERROR;
            let Some(tx_id) = values[1].as_number() else {
                return;
            };
            let tx_id = tx_id as u32;

            if !self.app_connected && tx_id == self.app_connect_tx_id {
                if is_error {
                    tracing::warn!("RTMP application connection rejected");
                    self.events
                        .push_back(SessionEvent::Error(ErrorKind::RtmpConnectRejected));
                    self.disconnect(true);
                    return;
                }
                self.app_connected = true;
                self.events.push_back(SessionEvent::ConnectedToApp);
            } else if self.creating_stream && tx_id == self.create_stream_tx_id {
                self.creating_stream = false;
                self.create_stream_tx_id = 0;
                if is_error {
                    tracing::warn!("RTMP stream creation failed");
                    self.events
                        .push_back(SessionEvent::Error(ErrorKind::RtmpCreateStreamError));
                    self.disconnect(true);
                    return;
                }
                // The new stream id arrives as the fourth argument
                let Some(new_stream_id) = values[3].as_number() else {
                    self.protocol_violation();
                    return;
                };
                let new_stream_id = new_stream_id as u32;
                self.events.push_back(SessionEvent::CreatedStream(new_stream_id));

                // One publish stream per connection; begin immediately
                if self.publisher.is_some() {
                    self.publish_stream_id = new_stream_id;
                    let _ = self.write_publish_msg(new_stream_id);
                }
            }
        } else if self.beginning_publish
            && name == CMD_ON_STATUS
            && values.len() >= 4
            && stream_id == self.publish_stream_id
        {
            self.beginning_publish = false;
            self.last_publish_ts = 0;

            let code = values[3].get("code").and_then(|v| v.as_str());
            let Some(code) = code else {
                self.protocol_violation();
                return;
            };
            if code == NS_PUBLISH_START {
                if let Some(publisher) = self.publisher.as_mut() {
                    if publisher.set_ready(true) {
                        self.events.push_back(SessionEvent::PublisherReady);
                    }
                }
            } else {
                tracing::warn!(code, "server rejected publish");
                self.events
                    .push_back(SessionEvent::Error(ErrorKind::RtmpPublishRejected));
                self.disconnect(true);
            }
        }
    }

    /// Wire protocol violation: surface the error and tear down.
    fn protocol_violation(&mut self) {
        self.events
            .push_back(SessionEvent::Error(ErrorKind::UnexpectedResponse));
        self.disconnect(true);
    }

    // ------------------------------------------------------------------
    // Outbound writes

    /// Append raw bytes to the output pipeline. Only valid while the
    /// socket is connected.
    fn write(&mut self, data: &[u8]) -> Result<()> {
        match self.state {
            ConnectionState::Disconnected
            | ConnectionState::Connecting
            | ConnectionState::Disconnecting => {
                self.events.push_back(SessionEvent::Error(ErrorKind::InvalidWrite));
                return Err(Error::InvalidWrite);
            }
            _ => {}
        }
        self.pipe.write(data)?;
        Ok(())
    }

    /// Frame and queue one RTMP message.
    pub(crate) fn write_message(
        &mut self,
        msg_stream_id: u32,
        msg_type: u8,
        timestamp: u32,
        payload: &[u8],
        csid: u32,
    ) -> Result<()> {
        let mut out = BytesMut::with_capacity(payload.len() + 18);
        self.chunk_writer
            .write_message(&mut out, msg_stream_id, msg_type, timestamp, payload, csid)?;
        self.out_bytes_since_ack = self.out_bytes_since_ack.wrapping_add(out.len() as u32);
        self.write(&out)
    }

    /// Acknowledge everything received since the handshake.
    fn write_acknowledge(&mut self) -> Result<()> {
        self.write_message(
            0,
            MSG_ACKNOWLEDGEMENT,
            0,
            &message::acknowledgement_payload(self.in_bytes_since_handshake),
            CSID_PROTOCOL_CONTROL,
        )
    }

    fn write_connect_msg(&mut self, transaction_id: u32) -> Result<()> {
        // Shaped exactly like FMLE's connect object
        let app = if self.target.app_instance.is_empty() {
            // Providers without application instances: Twitch-style
            self.target.app_name.clone()
        } else {
            // Providers with application instances: Ustream-style
            format!("{}/{}", self.target.app_name, self.target.app_instance)
        };
        let url = self.target.as_url(false, false);
        let obj = AmfObject::new()
            .with("app", app)
            .with("tcUrl", url.clone())
            .with("type", "nonprivate")
            .with("flashVer", self.version_string.clone())
            .with("swfUrl", url);

        let payload = amf::encode_all(&[
            AmfValue::String(CMD_CONNECT.into()),
            AmfValue::Number(transaction_id as f64),
            AmfValue::Object(obj),
        ]);
        self.write_message(0, MSG_COMMAND_AMF0, 0, &payload, CSID_COMMAND)
    }

    /// releaseStream + FCPublish (when publishing) + createStream, as
    /// one coalesced socket write.
    pub(crate) fn write_create_stream_msg(&mut self) -> Result<()> {
        if self.creating_stream {
            return Err(Error::InvalidWrite); // One stream at a time
        }

        self.pipe.begin_force_buffer();
        let result = (|| {
            if self.publisher.is_some() {
                let stream_name = self.target.stream_name.clone();
                for cmd in [CMD_RELEASE_STREAM, CMD_FC_PUBLISH] {
                    let tx = self.next_transaction_id(0);
                    let payload = amf::encode_all(&[
                        AmfValue::String(cmd.into()),
                        AmfValue::Number(tx as f64),
                        AmfValue::Null,
                        AmfValue::String(stream_name.clone()),
                    ]);
                    self.write_message(0, MSG_COMMAND_AMF0, 0, &payload, CSID_COMMAND)?;
                }
            }

            self.creating_stream = true;
            self.create_stream_tx_id = self.next_transaction_id(0);
            let payload = amf::encode_all(&[
                AmfValue::String(CMD_CREATE_STREAM.into()),
                AmfValue::Number(self.create_stream_tx_id as f64),
                AmfValue::Null,
            ]);
            self.write_message(0, MSG_COMMAND_AMF0, 0, &payload, CSID_COMMAND)
        })();
        self.end_force_buffer_internal();

        if result.is_err() {
            self.creating_stream = false;
            self.create_stream_tx_id = 0;
        }
        result
    }

    /// FCUnpublish (for the publish stream) + closeStream +
    /// deleteStream. No acknowledgement exists for stream deletion, so
    /// success is assumed. Stream id zero selects the publish stream.
    pub(crate) fn write_delete_stream_msg(&mut self, stream_id: u32) -> Result<()> {
        let mut stream_id = stream_id;
        let mut close_timestamp = 0;
        if stream_id == 0 {
            if self.publisher.is_none() || self.publish_stream_id == 0 {
                return Err(Error::InvalidWrite);
            }
            stream_id = self.publish_stream_id;
            close_timestamp = self.last_publish_ts;
        }

        self.pipe.begin_force_buffer();
        let result = (|| {
            if stream_id == self.publish_stream_id {
                let tx = self.next_transaction_id(0);
                let payload = amf::encode_all(&[
                    AmfValue::String(CMD_FC_UNPUBLISH.into()),
                    AmfValue::Number(tx as f64),
                    AmfValue::Null,
                    AmfValue::String(self.target.stream_name.clone()),
                ]);
                self.write_message(0, MSG_COMMAND_AMF0, 0, &payload, CSID_COMMAND)?;
            }

            // closeStream goes out on the stream being closed, stamped
            // with the last media timestamp
            let payload = amf::encode_all(&[
                AmfValue::String(CMD_CLOSE_STREAM.into()),
                AmfValue::Number(0.0),
                AmfValue::Null,
            ]);
            self.write_message(
                stream_id,
                MSG_COMMAND_AMF0,
                close_timestamp,
                &payload,
                CSID_STREAM,
            )?;

            // FMLE sends no transaction id here but librtmp does, and
            // an id makes more sense
            let tx = self.next_transaction_id(0);
            let payload = amf::encode_all(&[
                AmfValue::String(CMD_DELETE_STREAM.into()),
                AmfValue::Number(tx as f64),
                AmfValue::Null,
                AmfValue::Number(stream_id as f64),
            ]);
            self.write_message(0, MSG_COMMAND_AMF0, 0, &payload, CSID_COMMAND)
        })();
        self.end_force_buffer_internal();

        self.next_transaction_ids.remove(&stream_id);
        if stream_id == self.publish_stream_id {
            self.publish_stream_id = 0;
        }
        result
    }

    fn write_publish_msg(&mut self, stream_id: u32) -> Result<()> {
        self.beginning_publish = true;
        let payload = amf::encode_all(&[
            AmfValue::String(CMD_PUBLISH.into()),
            AmfValue::Number(0.0), // No transaction id
            AmfValue::Null,
            AmfValue::String(self.target.stream_name.clone()),
            AmfValue::String("live".into()),
        ]);
        let result = self.write_message(stream_id, MSG_COMMAND_AMF0, 0, &payload, CSID_STREAM);
        if result.is_err() {
            self.beginning_publish = false;
        }
        result
    }

    pub(crate) fn write_video_data(&mut self, timestamp: u32, data: &[u8]) -> Result<()> {
        self.write_message(self.publish_stream_id, MSG_VIDEO, timestamp, data, CSID_STREAM)?;
        if timestamp > self.last_publish_ts {
            self.last_publish_ts = timestamp;
        }
        Ok(())
    }

    pub(crate) fn write_audio_data(&mut self, timestamp: u32, data: &[u8]) -> Result<()> {
        self.write_message(self.publish_stream_id, MSG_AUDIO, timestamp, data, CSID_STREAM)?;
        if timestamp > self.last_publish_ts {
            self.last_publish_ts = timestamp;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals

    /// Next transaction id for a message stream. Id 0 is reserved, so
    /// each stream's sequence starts at 1.
    fn next_transaction_id(&mut self, stream_id: u32) -> u32 {
        let next = self.next_transaction_ids.entry(stream_id).or_insert(1);
        let id = *next;
        *next += 1;
        id
    }

    /// Reset RTMP connection state after the handshake completes. An
    /// already-created publisher survives; it is only invalidated by
    /// disconnects.
    fn reset_protocol_state(&mut self) {
        self.chunk_reader = ChunkReader::new();
        self.chunk_writer = ChunkWriter::new();
        self.in_ack_win = DEFAULT_ACK_WINDOW;
        self.out_ack_win = DEFAULT_ACK_WINDOW;
        self.in_limit_type = AckLimitType::Hard;
        self.in_bytes_since_ack = 0;
        self.out_bytes_since_ack = 0;
        self.in_bytes_since_handshake = 0;
        self.next_transaction_ids.clear();
        self.app_connected = false;
        self.app_connect_tx_id = 0;
        self.creating_stream = false;
        self.create_stream_tx_id = 0;
        self.publish_stream_id = 0;
        self.beginning_publish = false;
        self.last_publish_ts = 0;
    }

    pub(crate) fn end_force_buffer_internal(&mut self) {
        if let Err(err) = self.pipe.end_force_buffer() {
            self.events.push_back(SessionEvent::Error(ErrorKind::from_io(&err)));
            self.disconnect(false);
        }
    }

    pub(crate) fn pipe(&self) -> &SendPipeline<T> {
        &self.pipe
    }

    pub(crate) fn pipe_mut(&mut self) -> &mut SendPipeline<T> {
        &mut self.pipe
    }
}

#[cfg(test)]
mod tests;
