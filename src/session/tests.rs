use bytes::{BufMut, BytesMut};

use crate::amf::{AmfObject, AmfValue};
use crate::error::ErrorKind;
use crate::protocol::chunk::{ChunkReader, ChunkWriter, InboundMessage};
use crate::protocol::constants::*;
use crate::protocol::message::{RtmpMessage, UserControlEvent};
use crate::target::RtmpTarget;

use super::pipeline::test_support::gamer_guard;
use super::pipeline::MockTransport;
use super::{ConnectionState, RtmpSession, SessionEvent};

const HS: usize = 1536;

fn target() -> RtmpTarget {
    RtmpTarget::from_url_with_stream("rtmp://ingest.example.com/live", "streamKey").unwrap()
}

fn drain_events(s: &mut RtmpSession<MockTransport>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Some(event) = s.poll_event() {
        events.push(event);
    }
    events
}

/// Parses the client's written bytes the way a server would and crafts
/// responses.
struct TestServer {
    reader: ChunkReader,
    writer: ChunkWriter,
    cursor: usize,
    /// Wire bytes this harness has fed the client since the handshake
    sent: usize,
}

impl TestServer {
    fn new(cursor: usize) -> Self {
        Self {
            reader: ChunkReader::new(),
            writer: ChunkWriter::new(),
            cursor,
            sent: 0,
        }
    }

    /// Read and parse every client message written since the last pump.
    fn pump(&mut self, s: &RtmpSession<MockTransport>) -> Vec<(InboundMessage, RtmpMessage)> {
        let written = &s.pipe().transport().written;
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&written[self.cursor..]);
        self.cursor = written.len();

        let mut messages = Vec::new();
        while let Some(read) = self.reader.read_chunk(&mut buf) {
            if let Some(msg) = read.message {
                let parsed = RtmpMessage::parse(&msg).expect("client sent parseable message");
                if let RtmpMessage::SetChunkSize(size) = &parsed {
                    self.reader.set_max_chunk_size(*size);
                }
                messages.push((msg, parsed));
            }
        }
        assert!(buf.is_empty(), "client left a partial chunk on the wire");
        messages
    }

    fn send(
        &mut self,
        s: &mut RtmpSession<MockTransport>,
        stream_id: u32,
        msg_type: u8,
        timestamp: u32,
        payload: &[u8],
        csid: u32,
    ) {
        let mut out = BytesMut::new();
        self.writer
            .write_message(&mut out, stream_id, msg_type, timestamp, payload, csid)
            .unwrap();
        self.sent += out.len();
        s.receive_data(&out);
    }

    fn send_command(
        &mut self,
        s: &mut RtmpSession<MockTransport>,
        stream_id: u32,
        values: &[AmfValue],
    ) {
        let payload = crate::amf::encode_all(values);
        self.send(s, stream_id, MSG_COMMAND_AMF0, 0, &payload, CSID_COMMAND);
    }
}

/// Dial and complete the wire handshake. Returns the session and a
/// server harness positioned after the client's C0/C1/C2.
fn initialized_session() -> (RtmpSession<MockTransport>, TestServer) {
    let mut s = RtmpSession::new(target(), MockTransport::new(1 << 20));
    s.begin_connect().unwrap();
    s.socket_connected();

    // C0 + C1 went out
    {
        let written = &s.pipe().transport().written;
        assert_eq!(written.len(), 1 + HS);
        assert_eq!(written[0], 3);
    }
    let nonce: Vec<u8> = s.pipe().transport().written[9..1 + HS].to_vec();

    // S0 + S1 + S2
    let mut resp = BytesMut::new();
    resp.put_u8(3);
    resp.put_u32(99); // S1 time
    resp.put_u32(0);
    let server_random: Vec<u8> = (0..1528).map(|i| ((i * 7 + 3) % 256) as u8).collect();
    resp.put_slice(&server_random);
    resp.put_u32(12345); // S2 times are not validated
    resp.put_u32(67890);
    resp.put_slice(&nonce);
    s.receive_data(&resp);

    assert_eq!(s.state(), ConnectionState::Initialized);

    // The client echoed S1 back as C2
    let written = &s.pipe().transport().written;
    assert_eq!(&written[1 + HS + 8..1 + HS + HS], &server_random[..]);

    (s, TestServer::new(1 + HS + HS))
}

fn connect_result_values(tx_id: f64) -> Vec<AmfValue> {
    vec![
        AmfValue::String("_result".into()),
        AmfValue::Number(tx_id),
        AmfValue::Object(AmfObject::new().with("fmsVer", "FMS/3,0,1,123")),
        AmfValue::Object(
            AmfObject::new()
                .with("level", "status")
                .with("code", "NetConnection.Connect.Success"),
        ),
    ]
}

/// Handshake plus the `connect()` exchange.
fn app_connected_session() -> (RtmpSession<MockTransport>, TestServer) {
    let (mut s, mut srv) = initialized_session();
    drain_events(&mut s);
    srv.pump(&s); // SetChunkSize + connect
    srv.send_command(&mut s, 0, &connect_result_values(1.0));
    let events = drain_events(&mut s);
    assert!(events.contains(&SessionEvent::ConnectedToApp));
    (s, srv)
}

/// Full path to a ready publisher on stream id 1.
fn publishing_session() -> (RtmpSession<MockTransport>, TestServer) {
    let (mut s, mut srv) = app_connected_session();
    s.create_publish_stream();
    s.begin_publishing().unwrap();

    let msgs = srv.pump(&s);
    let create_tx = match &msgs.last().unwrap().1 {
        RtmpMessage::Command { values } => values[1].as_number().unwrap(),
        other => panic!("expected createStream, got {:?}", other),
    };
    srv.send_command(
        &mut s,
        0,
        &[
            AmfValue::String("_result".into()),
            AmfValue::Number(create_tx),
            AmfValue::Null,
            AmfValue::Number(1.0),
        ],
    );

    // The client fires publish immediately; accept it
    srv.pump(&s);
    srv.send_command(
        &mut s,
        1,
        &[
            AmfValue::String("onStatus".into()),
            AmfValue::Number(0.0),
            AmfValue::Null,
            AmfValue::Object(
                AmfObject::new()
                    .with("level", "status")
                    .with("code", NS_PUBLISH_START),
            ),
        ],
    );
    let events = drain_events(&mut s);
    assert!(events.contains(&SessionEvent::PublisherReady));
    assert!(s.publisher_is_ready());
    (s, srv)
}

#[test]
fn test_connect_sequence_events_in_order() {
    let _g = gamer_guard(false, 1.0);
    let (mut s, _srv) = initialized_session();
    let events = drain_events(&mut s);
    assert_eq!(
        events,
        vec![
            SessionEvent::Connecting,
            SessionEvent::Connected,
            SessionEvent::Initialized,
        ]
    );
}

#[test]
fn test_handshake_echo_mismatch_disconnects() {
    let _g = gamer_guard(false, 1.0);
    let mut s = RtmpSession::new(target(), MockTransport::new(1 << 20));
    s.begin_connect().unwrap();
    s.socket_connected();

    let mut resp = BytesMut::new();
    resp.put_u8(3);
    resp.put_slice(&[0u8; HS]); // S1
    resp.put_slice(&[0xEEu8; HS]); // S2 with a wrong echo
    s.receive_data(&resp);

    let events = drain_events(&mut s);
    assert!(events.contains(&SessionEvent::Error(ErrorKind::UnexpectedResponse)));
    assert_eq!(events.last(), Some(&SessionEvent::Disconnected));
    assert_eq!(s.state(), ConnectionState::Disconnected);
}

#[test]
fn test_bad_server_version_disconnects() {
    let _g = gamer_guard(false, 1.0);
    let mut s = RtmpSession::new(target(), MockTransport::new(1 << 20));
    s.begin_connect().unwrap();
    s.socket_connected();

    s.receive_data(&[9u8]); // Not version 3
    let events = drain_events(&mut s);
    assert!(events.contains(&SessionEvent::Error(ErrorKind::UnexpectedResponse)));
    assert_eq!(s.state(), ConnectionState::Disconnected);
}

#[test]
fn test_app_connect_burst_shape() {
    let _g = gamer_guard(false, 1.0);
    let (mut s, mut srv) = initialized_session();
    drain_events(&mut s);

    let msgs = srv.pump(&s);
    assert_eq!(msgs.len(), 2);

    assert_eq!(msgs[0].1, RtmpMessage::SetChunkSize(4096));
    assert_eq!(msgs[0].0.csid, CSID_PROTOCOL_CONTROL);

    match &msgs[1].1 {
        RtmpMessage::Command { values } => {
            assert_eq!(values[0].as_str(), Some("connect"));
            assert_eq!(values[1].as_number(), Some(1.0));
            let obj = values[2].as_object().expect("connect object");
            assert_eq!(obj.get("app").and_then(|v| v.as_str()), Some("live"));
            assert_eq!(
                obj.get("tcUrl").and_then(|v| v.as_str()),
                Some("rtmp://ingest.example.com/live")
            );
            assert_eq!(obj.get("type").and_then(|v| v.as_str()), Some("nonprivate"));
            assert_eq!(
                obj.get("flashVer").and_then(|v| v.as_str()),
                Some("FMLE/3.0 (compatible; FMSc/1.0)")
            );
            assert_eq!(
                obj.get("swfUrl").and_then(|v| v.as_str()),
                Some("rtmp://ingest.example.com/live")
            );
            // Insertion order on the wire, like FMLE
            let keys: Vec<&str> = obj.iter().map(|(k, _)| k).collect();
            assert_eq!(keys, vec!["app", "tcUrl", "type", "flashVer", "swfUrl"]);
        }
        other => panic!("expected connect, got {:?}", other),
    }
    assert_eq!(msgs[1].0.csid, CSID_COMMAND);
    assert_eq!(msgs[1].0.msg_stream_id, 0);
}

#[test]
fn test_app_instance_joins_app_name() {
    let _g = gamer_guard(false, 1.0);
    let mut s = RtmpSession::new(
        RtmpTarget::from_url_with_stream("rtmp://ingest.example.com/live/east1", "key").unwrap(),
        MockTransport::new(1 << 20),
    );
    s.begin_connect().unwrap();
    s.socket_connected();

    let nonce: Vec<u8> = s.pipe().transport().written[9..1 + HS].to_vec();
    let mut resp = BytesMut::new();
    resp.put_u8(3);
    resp.put_slice(&[0u8; HS]);
    resp.put_u32(0);
    resp.put_u32(0);
    resp.put_slice(&nonce);
    s.receive_data(&resp);
    let mut srv = TestServer::new(1 + HS + HS);
    drain_events(&mut s);

    let msgs = srv.pump(&s);
    match &msgs[1].1 {
        RtmpMessage::Command { values } => {
            let obj = values[2].as_object().unwrap();
            assert_eq!(obj.get("app").and_then(|v| v.as_str()), Some("live/east1"));
            assert_eq!(
                obj.get("tcUrl").and_then(|v| v.as_str()),
                Some("rtmp://ingest.example.com/live/east1")
            );
        }
        other => panic!("expected connect, got {:?}", other),
    }
}

#[test]
fn test_connect_rejected() {
    let _g = gamer_guard(false, 1.0);
    let (mut s, mut srv) = initialized_session();
    drain_events(&mut s);
    srv.pump(&s);

    srv.send_command(
        &mut s,
        0,
        &[
            AmfValue::String("_error".into()),
            AmfValue::Number(1.0),
            AmfValue::Null,
            AmfValue::Object(AmfObject::new().with("code", "NetConnection.Connect.Rejected")),
        ],
    );

    let events = drain_events(&mut s);
    assert!(events.contains(&SessionEvent::Error(ErrorKind::RtmpConnectRejected)));
    assert!(!events.contains(&SessionEvent::ConnectedToApp));
    assert_eq!(events.last(), Some(&SessionEvent::Disconnected));
}

#[test]
fn test_create_stream_and_publish_flow() {
    let _g = gamer_guard(false, 1.0);
    let (mut s, mut srv) = app_connected_session();

    s.create_publish_stream();
    s.begin_publishing().unwrap();

    // releaseStream, FCPublish, createStream, transaction ids 2-4
    let msgs = srv.pump(&s);
    let names: Vec<String> = msgs
        .iter()
        .map(|(_, m)| match m {
            RtmpMessage::Command { values } => values[0].as_str().unwrap().to_string(),
            other => panic!("unexpected {:?}", other),
        })
        .collect();
    assert_eq!(names, vec!["releaseStream", "FCPublish", "createStream"]);
    for (i, (_, parsed)) in msgs.iter().enumerate() {
        if let RtmpMessage::Command { values } = parsed {
            assert_eq!(values[1].as_number(), Some((i + 2) as f64));
            assert!(values[2].is_null());
        }
    }
    // releaseStream and FCPublish carry the stream key
    for (_, parsed) in &msgs[..2] {
        if let RtmpMessage::Command { values } = parsed {
            assert_eq!(values[3].as_str(), Some("streamKey"));
        }
    }

    srv.send_command(
        &mut s,
        0,
        &[
            AmfValue::String("_result".into()),
            AmfValue::Number(4.0),
            AmfValue::Null,
            AmfValue::Number(1.0),
        ],
    );
    let events = drain_events(&mut s);
    assert!(events.contains(&SessionEvent::CreatedStream(1)));

    // publish goes out immediately on the new stream
    let msgs = srv.pump(&s);
    assert_eq!(msgs.len(), 1);
    let (raw, parsed) = &msgs[0];
    assert_eq!(raw.msg_stream_id, 1);
    assert_eq!(raw.csid, CSID_STREAM);
    match parsed {
        RtmpMessage::Command { values } => {
            assert_eq!(values[0].as_str(), Some("publish"));
            assert_eq!(values[1].as_number(), Some(0.0));
            assert_eq!(values[3].as_str(), Some("streamKey"));
            assert_eq!(values[4].as_str(), Some("live"));
        }
        other => panic!("expected publish, got {:?}", other),
    }
    assert!(!s.publisher_is_ready());

    srv.send_command(
        &mut s,
        1,
        &[
            AmfValue::String("onStatus".into()),
            AmfValue::Number(0.0),
            AmfValue::Null,
            AmfValue::Object(AmfObject::new().with("code", NS_PUBLISH_START)),
        ],
    );
    let events = drain_events(&mut s);
    assert!(events.contains(&SessionEvent::PublisherReady));
    assert!(s.publisher_is_ready());
}

#[test]
fn test_publish_rejected_disconnects() {
    let _g = gamer_guard(false, 1.0);
    let (mut s, mut srv) = app_connected_session();
    s.create_publish_stream();
    s.begin_publishing().unwrap();
    let msgs = srv.pump(&s);
    let create_tx = match &msgs.last().unwrap().1 {
        RtmpMessage::Command { values } => values[1].as_number().unwrap(),
        _ => unreachable!(),
    };
    srv.send_command(
        &mut s,
        0,
        &[
            AmfValue::String("_result".into()),
            AmfValue::Number(create_tx),
            AmfValue::Null,
            AmfValue::Number(1.0),
        ],
    );
    srv.pump(&s); // publish

    srv.send_command(
        &mut s,
        1,
        &[
            AmfValue::String("onStatus".into()),
            AmfValue::Number(0.0),
            AmfValue::Null,
            AmfValue::Object(AmfObject::new().with("code", "NetStream.Publish.BadName")),
        ],
    );
    let events = drain_events(&mut s);
    assert!(events.contains(&SessionEvent::Error(ErrorKind::RtmpPublishRejected)));
    assert_eq!(events.last(), Some(&SessionEvent::Disconnected));
    assert!(!s.has_publisher());
}

#[test]
fn test_create_stream_error_disconnects() {
    let _g = gamer_guard(false, 1.0);
    let (mut s, mut srv) = app_connected_session();
    s.create_publish_stream();
    s.begin_publishing().unwrap();
    srv.pump(&s);

    srv.send_command(
        &mut s,
        0,
        &[
            AmfValue::String("_error".into()),
            AmfValue::Number(4.0),
            AmfValue::Null,
            AmfValue::Object(AmfObject::new().with("code", "NetStream.Create.Failed")),
        ],
    );
    let events = drain_events(&mut s);
    assert!(events.contains(&SessionEvent::Error(ErrorKind::RtmpCreateStreamError)));
    assert_eq!(events.last(), Some(&SessionEvent::Disconnected));
}

#[test]
fn test_data_frame_and_media_shaping() {
    let _g = gamer_guard(false, 1.0);
    let (mut s, mut srv) = publishing_session();

    let metadata = AmfObject::new()
        .with("width", 854.0)
        .with("height", 480.0)
        .with("videocodecid", 7.0);
    s.write_data_frame(metadata).unwrap();

    let msgs = srv.pump(&s);
    assert_eq!(msgs.len(), 1);
    let (raw, parsed) = &msgs[0];
    assert_eq!(raw.msg_type, MSG_DATA_AMF0);
    assert_eq!(raw.msg_stream_id, 1);
    match parsed {
        RtmpMessage::Data { values } => {
            assert_eq!(values[0].as_str(), Some("@setDataFrame"));
            assert_eq!(values[1].as_str(), Some("onMetaData"));
            assert_eq!(values[2].get("width").and_then(|v| v.as_number()), Some(854.0));
        }
        other => panic!("expected data message, got {:?}", other),
    }

    // AVC config record: FLV tag header + record, timestamp 0
    let sps = [0x00, 0x00, 0x00, 0x01, 0x67, 0x64, 0x00, 0x1F, 0xAC];
    let pps = [0x00, 0x00, 0x00, 0x01, 0x68, 0xEE, 0x3C, 0x80];
    s.write_avc_config_record(&sps, &pps).unwrap();
    let msgs = srv.pump(&s);
    let (raw, _) = &msgs[0];
    assert_eq!(raw.msg_type, MSG_VIDEO);
    assert_eq!(raw.timestamp, 0);
    assert_eq!(&raw.payload[..5], &[0x17, 0x00, 0x00, 0x00, 0x00]);
    assert_eq!(raw.payload[5], 0x01); // configurationVersion
    assert_eq!(raw.payload[9], 0xFF); // 4-byte NAL lengths

    // AAC sequence header
    s.write_aac_sequence_header(&[0x12, 0x10]).unwrap();
    let msgs = srv.pump(&s);
    let (raw, _) = &msgs[0];
    assert_eq!(raw.msg_type, MSG_AUDIO);
    assert_eq!(&raw.payload[..], &[0xAF, 0x00, 0x12, 0x10]);

    // A video frame: NAL start codes become 4-byte lengths
    let header = [0x17, 0x01, 0x00, 0x00, 0x00];
    let nal = [0x00u8, 0x00, 0x00, 0x01, 0x65, 0x88, 0x80];
    s.write_video_frame(40, &header, &[&nal[..]]).unwrap();
    let msgs = srv.pump(&s);
    let (raw, _) = &msgs[0];
    assert_eq!(raw.msg_type, MSG_VIDEO);
    assert_eq!(raw.timestamp, 40);
    let mut expected = header.to_vec();
    expected.extend_from_slice(&[0x00, 0x00, 0x00, 0x03, 0x65, 0x88, 0x80]);
    assert_eq!(&raw.payload[..], &expected[..]);

    // An audio frame
    s.write_audio_frame(63, &[0xAF, 0x01], &[0x21, 0x43]).unwrap();
    let msgs = srv.pump(&s);
    let (raw, _) = &msgs[0];
    assert_eq!(raw.msg_type, MSG_AUDIO);
    assert_eq!(raw.timestamp, 63);
    assert_eq!(&raw.payload[..], &[0xAF, 0x01, 0x21, 0x43]);
}

#[test]
fn test_finish_publishing_teardown() {
    let _g = gamer_guard(false, 1.0);
    let (mut s, mut srv) = publishing_session();

    s.write_video_frame(40, &[0x17, 0x01, 0x00, 0x00, 0x00], &[&[0x65u8, 0x01][..]])
        .unwrap();
    s.write_audio_frame(57, &[0xAF, 0x01], &[0x00]).unwrap();
    srv.pump(&s);

    s.finish_publishing().unwrap();
    let msgs = srv.pump(&s);
    let names: Vec<String> = msgs
        .iter()
        .map(|(_, m)| match m {
            RtmpMessage::Command { values } => values[0].as_str().unwrap().to_string(),
            other => panic!("unexpected {:?}", other),
        })
        .collect();
    assert_eq!(names, vec!["FCUnpublish", "closeStream", "deleteStream"]);

    // FCUnpublish names the key, on stream 0
    assert_eq!(msgs[0].0.msg_stream_id, 0);

    // closeStream rides the data stream, stamped with the last media
    // timestamp (audio advanced it to 57)
    assert_eq!(msgs[1].0.msg_stream_id, 1);
    assert_eq!(msgs[1].0.csid, CSID_STREAM);
    assert_eq!(msgs[1].0.timestamp, 57);

    // deleteStream carries the stream id as its argument
    match &msgs[2].1 {
        RtmpMessage::Command { values } => {
            assert_eq!(values[3].as_number(), Some(1.0));
        }
        _ => unreachable!(),
    }
    assert_eq!(msgs[2].0.msg_stream_id, 0);

    // No response is awaited; the session stays connected
    assert_eq!(s.state(), ConnectionState::Initialized);
    let events = drain_events(&mut s);
    assert!(!events.contains(&SessionEvent::Disconnected));
}

#[test]
fn test_ping_request_gets_ping_response() {
    let _g = gamer_guard(false, 1.0);
    let (mut s, mut srv) = app_connected_session();

    let mut payload = BytesMut::new();
    payload.put_u16(UC_PING_REQUEST);
    payload.put_u32(0x0102_0304);
    srv.send(&mut s, 0, MSG_USER_CONTROL, 0, &payload, CSID_PROTOCOL_CONTROL);

    let msgs = srv.pump(&s);
    assert_eq!(msgs.len(), 1);
    assert_eq!(
        msgs[0].1,
        RtmpMessage::UserControl(UserControlEvent::PingResponse(0x0102_0304))
    );
    assert!(drain_events(&mut s)
        .iter()
        .all(|e| !matches!(e, SessionEvent::Error(_))));
}

#[test]
fn test_acknowledgement_after_window() {
    let _g = gamer_guard(false, 1.0);
    let (mut s, mut srv) = app_connected_session();

    let acks = |msgs: &[(InboundMessage, RtmpMessage)]| -> Vec<u32> {
        msgs.iter()
            .filter_map(|(_, m)| match m {
                RtmpMessage::Acknowledgement { sequence } => Some(*sequence),
                _ => None,
            })
            .collect()
    };

    // Shrink the ack window, then push enough media bytes through.
    // Nothing before the audio message comes near the window, so the
    // 600 payload bytes force exactly one acknowledgement.
    srv.send(
        &mut s,
        0,
        MSG_WINDOW_ACK_SIZE,
        0,
        &500u32.to_be_bytes(),
        CSID_PROTOCOL_CONTROL,
    );
    srv.send(&mut s, 1, MSG_AUDIO, 0, &[0x55u8; 600], CSID_STREAM);

    let first = acks(&srv.pump(&s));
    assert_eq!(first.len(), 1, "exactly one ack per filled window");
    // The ack carries the cumulative wire byte count since the
    // handshake, which at the crossing sits between the window size and
    // everything the server has sent
    assert!(first[0] >= 500);
    assert!((first[0] as usize) <= srv.sent);

    // The next window's ack is cumulative, not per-window
    srv.send(&mut s, 1, MSG_AUDIO, 40, &[0x55u8; 600], CSID_STREAM);
    let second = acks(&srv.pump(&s));
    assert_eq!(second.len(), 1);
    assert!(second[0] > first[0]);
    assert!((second[0] as usize) <= srv.sent);
}

#[test]
fn test_set_peer_bandwidth_policies() {
    let _g = gamer_guard(false, 1.0);
    let (mut s, mut srv) = app_connected_session();

    let window_acks = |msgs: &[(InboundMessage, RtmpMessage)]| -> Vec<u32> {
        msgs.iter()
            .filter_map(|(_, m)| match m {
                RtmpMessage::WindowAckSize(size) => Some(*size),
                _ => None,
            })
            .collect()
    };

    // Hard: adopt the window and answer with WindowAckSize
    let mut payload = 1000u32.to_be_bytes().to_vec();
    payload.push(BANDWIDTH_LIMIT_HARD);
    srv.send(&mut s, 0, MSG_SET_PEER_BANDWIDTH, 0, &payload, CSID_PROTOCOL_CONTROL);
    assert_eq!(window_acks(&srv.pump(&s)), vec![1000]);

    // Soft with a larger window: already below it, nothing to send
    let mut payload = 2000u32.to_be_bytes().to_vec();
    payload.push(BANDWIDTH_LIMIT_SOFT);
    srv.send(&mut s, 0, MSG_SET_PEER_BANDWIDTH, 0, &payload, CSID_PROTOCOL_CONTROL);
    assert_eq!(window_acks(&srv.pump(&s)), Vec::<u32>::new());

    // Soft with a smaller window: shrink to it
    let mut payload = 400u32.to_be_bytes().to_vec();
    payload.push(BANDWIDTH_LIMIT_SOFT);
    srv.send(&mut s, 0, MSG_SET_PEER_BANDWIDTH, 0, &payload, CSID_PROTOCOL_CONTROL);
    assert_eq!(window_acks(&srv.pump(&s)), vec![400]);

    // Dynamic after Soft: ignored
    let mut payload = 1200u32.to_be_bytes().to_vec();
    payload.push(BANDWIDTH_LIMIT_DYNAMIC);
    srv.send(&mut s, 0, MSG_SET_PEER_BANDWIDTH, 0, &payload, CSID_PROTOCOL_CONTROL);
    assert_eq!(window_acks(&srv.pump(&s)), Vec::<u32>::new());

    // Dynamic after Hard: behaves as Hard
    let mut payload = 900u32.to_be_bytes().to_vec();
    payload.push(BANDWIDTH_LIMIT_HARD);
    srv.send(&mut s, 0, MSG_SET_PEER_BANDWIDTH, 0, &payload, CSID_PROTOCOL_CONTROL);
    srv.pump(&s);
    let mut payload = 1200u32.to_be_bytes().to_vec();
    payload.push(BANDWIDTH_LIMIT_DYNAMIC);
    srv.send(&mut s, 0, MSG_SET_PEER_BANDWIDTH, 0, &payload, CSID_PROTOCOL_CONTROL);
    assert_eq!(window_acks(&srv.pump(&s)), vec![1200]);

    // A second consecutive Dynamic is evaluated against "Dynamic", not
    // against the Hard that preceded the run: no-op
    let mut payload = 1500u32.to_be_bytes().to_vec();
    payload.push(BANDWIDTH_LIMIT_DYNAMIC);
    srv.send(&mut s, 0, MSG_SET_PEER_BANDWIDTH, 0, &payload, CSID_PROTOCOL_CONTROL);
    assert_eq!(window_acks(&srv.pump(&s)), Vec::<u32>::new());
}

#[test]
fn test_server_chunk_size_change_applies() {
    let _g = gamer_guard(false, 1.0);
    let (mut s, mut srv) = app_connected_session();

    srv.send(
        &mut s,
        0,
        MSG_SET_CHUNK_SIZE,
        0,
        &4096u32.to_be_bytes(),
        CSID_PROTOCOL_CONTROL,
    );
    srv.writer.set_max_chunk_size(4096);

    // A 1000-byte command payload now arrives in a single chunk and
    // must still parse; garbage AMF would kill the session, so use a
    // real command the dispatcher ignores
    let mut big = AmfObject::new();
    big.insert("pad", "x".repeat(900));
    srv.send_command(
        &mut s,
        0,
        &[
            AmfValue::String("onBWDone".into()),
            AmfValue::Number(0.0),
            AmfValue::Null,
            AmfValue::Object(big),
        ],
    );

    let events = drain_events(&mut s);
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::ReceivedCommand { .. })));
    assert!(!events.iter().any(|e| matches!(e, SessionEvent::Error(_))));
    assert_eq!(s.state(), ConnectionState::Initialized);
}

#[test]
fn test_malformed_command_disconnects() {
    let _g = gamer_guard(false, 1.0);
    let (mut s, mut srv) = app_connected_session();

    // An AMF3 marker inside a command payload is undecodable
    srv.send(&mut s, 0, MSG_COMMAND_AMF0, 0, &[0x11, 0x09, 0x01], CSID_COMMAND);

    let events = drain_events(&mut s);
    assert!(events.contains(&SessionEvent::Error(ErrorKind::UnexpectedResponse)));
    assert_eq!(events.last(), Some(&SessionEvent::Disconnected));
}

#[test]
fn test_short_control_message_disconnects() {
    let _g = gamer_guard(false, 1.0);
    let (mut s, mut srv) = app_connected_session();
    srv.send(&mut s, 0, MSG_SET_CHUNK_SIZE, 0, &[0x10], CSID_PROTOCOL_CONTROL);

    let events = drain_events(&mut s);
    assert!(events.contains(&SessionEvent::Error(ErrorKind::UnexpectedResponse)));
    assert_eq!(s.state(), ConnectionState::Disconnected);
}

#[test]
fn test_inbound_media_is_dropped_quietly() {
    let _g = gamer_guard(false, 1.0);
    let (mut s, mut srv) = app_connected_session();
    srv.send(&mut s, 1, MSG_VIDEO, 10, &[0u8; 64], CSID_STREAM);
    srv.send(&mut s, 1, MSG_AUDIO, 10, &[0u8; 64], CSID_STREAM);

    let events = drain_events(&mut s);
    assert!(events.is_empty());
    assert_eq!(s.state(), ConnectionState::Initialized);
}

#[test]
fn test_received_commands_surface_to_listeners() {
    let _g = gamer_guard(false, 1.0);
    let (mut s, mut srv) = app_connected_session();
    srv.send_command(
        &mut s,
        0,
        &[
            AmfValue::String("onBWDone".into()),
            AmfValue::Number(0.0),
            AmfValue::Null,
        ],
    );
    let events = drain_events(&mut s);
    match &events[0] {
        SessionEvent::ReceivedCommand { stream_id, values } => {
            assert_eq!(*stream_id, 0);
            assert_eq!(values[0].as_str(), Some("onBWDone"));
        }
        other => panic!("expected command event, got {:?}", other),
    }
}

#[test]
fn test_writes_rejected_while_disconnected() {
    let _g = gamer_guard(false, 1.0);
    let mut s = RtmpSession::new(target(), MockTransport::new(1 << 20));
    assert!(s.set_max_chunk_size(4096).is_err());
    let events = drain_events(&mut s);
    assert_eq!(events, vec![SessionEvent::Error(ErrorKind::InvalidWrite)]);
}

#[test]
fn test_publisher_writes_rejected_before_ready() {
    let _g = gamer_guard(false, 1.0);
    let (mut s, _srv) = app_connected_session();
    s.create_publish_stream();
    assert!(!s.publisher_is_ready());
    assert!(s
        .write_video_frame(0, &[0x17u8, 0x01, 0, 0, 0], &[&[0x65u8][..]])
        .is_err());
    assert!(s.write_audio_frame(0, &[0xAFu8, 0x01], &[0]).is_err());
    assert!(s.finish_publishing().is_err());
}

#[test]
fn test_second_begin_publishing_rejected_while_creating() {
    let _g = gamer_guard(false, 1.0);
    let (mut s, _srv) = app_connected_session();
    s.create_publish_stream();
    s.begin_publishing().unwrap();
    assert!(s.begin_publishing().is_err());
}

#[test]
fn test_clean_disconnect_invalidates_publisher() {
    let _g = gamer_guard(false, 1.0);
    let (mut s, _srv) = publishing_session();
    assert!(s.has_publisher());

    s.disconnect(true);
    assert_eq!(s.state(), ConnectionState::Disconnected);
    assert!(!s.has_publisher());
    let events = drain_events(&mut s);
    assert_eq!(events.last(), Some(&SessionEvent::Disconnected));

    // Frame writes now fail outright
    assert!(s.write_audio_frame(0, &[0xAF, 0x01], &[0]).is_err());
}

#[test]
fn test_socket_error_while_connecting() {
    let _g = gamer_guard(false, 1.0);
    let mut s = RtmpSession::new(target(), MockTransport::new(1 << 20));
    s.begin_connect().unwrap();
    s.socket_error(ErrorKind::ConnectionRefused);

    let events = drain_events(&mut s);
    assert_eq!(
        events,
        vec![
            SessionEvent::Connecting,
            SessionEvent::Error(ErrorKind::ConnectionRefused),
            SessionEvent::Disconnected,
        ]
    );
    assert_eq!(s.state(), ConnectionState::Disconnected);
}

#[test]
fn test_data_request_after_drain() {
    let _g = gamer_guard(false, 1.0);
    let (mut s, mut srv) = publishing_session();

    // Choke the "kernel" so a frame backs up in the pipeline
    let queued_before = {
        let t = s.pipe_mut().transport_mut();
        t.sndbuf = 16;
        t.queued = 16;
        t.queued
    };
    assert_eq!(queued_before, 16);
    s.write_video_frame(100, &[0x17, 0x01, 0, 0, 0], &[&[0x65u8; 64][..]])
        .unwrap();
    assert!(s.wants_writable());

    // Kernel drains; the writable notification flushes and asks for
    // more data
    {
        let t = s.pipe_mut().transport_mut();
        t.sndbuf = 1 << 20;
        t.queued = 0;
    }
    s.socket_writable();
    let events = drain_events(&mut s);
    assert!(events
        .iter()
        .any(|e| matches!(e, SessionEvent::DataRequest { bytes_free } if *bytes_free >= 1)));
    assert!(!s.wants_writable());
    srv.pump(&s);
}
