//! RTMP message parsing and control-payload building
//!
//! Messages fall into protocol control (types 1-6), AMF0 command/data
//! (20/18) and media (8/9). A publishing client consumes control and
//! command traffic from the server and drops inbound media.

use bytes::{BufMut, Bytes, BytesMut};

use crate::amf::{self, AmfValue};
use crate::error::{ProtocolError, Result};
use crate::protocol::chunk::InboundMessage;
use crate::protocol::constants::*;

/// User control (type 4) events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserControlEvent {
    StreamBegin(u32),
    StreamEof(u32),
    StreamDry(u32),
    SetBufferLength { stream_id: u32, buffer_ms: u32 },
    StreamIsRecorded(u32),
    PingRequest(u32),
    PingResponse(u32),
    Unknown { event_type: u16 },
}

/// A parsed inbound RTMP message.
#[derive(Debug, Clone, PartialEq)]
pub enum RtmpMessage {
    SetChunkSize(u32),
    Abort { csid: u32 },
    Acknowledgement { sequence: u32 },
    UserControl(UserControlEvent),
    WindowAckSize(u32),
    SetPeerBandwidth { window: u32, limit_type: u8 },
    /// AMF0 command: the full decoded value sequence
    /// (name, transaction id, command object, arguments...)
    Command { values: Vec<AmfValue> },
    /// AMF0 data message (@setDataFrame and friends)
    Data { values: Vec<AmfValue> },
    /// Inbound media; not expected in the publisher role
    Audio { len: usize },
    Video { len: usize },
    Unknown { type_id: u8, len: usize },
}

impl RtmpMessage {
    /// Parse a reassembled message payload.
    ///
    /// Control messages shorter than their fixed layout and undecodable
    /// AMF are protocol errors; the session turns those into
    /// `UnexpectedResponse` and disconnects.
    pub fn parse(msg: &InboundMessage) -> Result<Self> {
        let payload = &msg.payload;
        match msg.msg_type {
            MSG_SET_CHUNK_SIZE => {
                let size = read_u32(payload, msg.msg_type)? & 0x7FFF_FFFF;
                Ok(RtmpMessage::SetChunkSize(size))
            }
            MSG_ABORT => Ok(RtmpMessage::Abort {
                csid: read_u32(payload, msg.msg_type)?,
            }),
            MSG_ACKNOWLEDGEMENT => Ok(RtmpMessage::Acknowledgement {
                sequence: read_u32(payload, msg.msg_type)?,
            }),
            MSG_USER_CONTROL => parse_user_control(payload),
            MSG_WINDOW_ACK_SIZE => Ok(RtmpMessage::WindowAckSize(read_u32(
                payload,
                msg.msg_type,
            )?)),
            MSG_SET_PEER_BANDWIDTH => {
                if payload.len() < 5 {
                    return Err(ProtocolError::ShortControlMessage(msg.msg_type).into());
                }
                let window = u32::from_be_bytes(payload[0..4].try_into().expect("4 bytes"));
                Ok(RtmpMessage::SetPeerBandwidth {
                    window,
                    limit_type: payload[4],
                })
            }
            MSG_COMMAND_AMF0 => {
                if payload.is_empty() {
                    return Err(ProtocolError::ShortControlMessage(msg.msg_type).into());
                }
                let values = amf::decode_all(payload)?;
                Ok(RtmpMessage::Command { values })
            }
            MSG_DATA_AMF0 => {
                let values = amf::decode_all(payload)?;
                Ok(RtmpMessage::Data { values })
            }
            MSG_AUDIO => Ok(RtmpMessage::Audio { len: payload.len() }),
            MSG_VIDEO => Ok(RtmpMessage::Video { len: payload.len() }),
            other => Ok(RtmpMessage::Unknown {
                type_id: other,
                len: payload.len(),
            }),
        }
    }
}

fn parse_user_control(payload: &[u8]) -> Result<RtmpMessage> {
    if payload.len() < 2 {
        return Err(ProtocolError::ShortControlMessage(MSG_USER_CONTROL).into());
    }
    let event_type = u16::from_be_bytes(payload[0..2].try_into().expect("2 bytes"));

    let arg = |off: usize| -> Result<u32> {
        if payload.len() < off + 4 {
            return Err(ProtocolError::ShortControlMessage(MSG_USER_CONTROL).into());
        }
        Ok(u32::from_be_bytes(
            payload[off..off + 4].try_into().expect("4 bytes"),
        ))
    };

    let event = match event_type {
        UC_STREAM_BEGIN => UserControlEvent::StreamBegin(arg(2)?),
        UC_STREAM_EOF => UserControlEvent::StreamEof(arg(2)?),
        UC_STREAM_DRY => UserControlEvent::StreamDry(arg(2)?),
        UC_SET_BUFFER_LENGTH => UserControlEvent::SetBufferLength {
            stream_id: arg(2)?,
            buffer_ms: arg(6)?,
        },
        UC_STREAM_IS_RECORDED => UserControlEvent::StreamIsRecorded(arg(2)?),
        UC_PING_REQUEST => UserControlEvent::PingRequest(arg(2)?),
        UC_PING_RESPONSE => UserControlEvent::PingResponse(arg(2)?),
        other => UserControlEvent::Unknown { event_type: other },
    };
    Ok(RtmpMessage::UserControl(event))
}

fn read_u32(payload: &[u8], msg_type: u8) -> Result<u32> {
    if payload.len() < 4 {
        return Err(ProtocolError::ShortControlMessage(msg_type).into());
    }
    Ok(u32::from_be_bytes(payload[0..4].try_into().expect("4 bytes")))
}

// ============================================================================
// Outbound payload builders
// ============================================================================

pub fn set_chunk_size_payload(size: u32) -> Bytes {
    Bytes::copy_from_slice(&(size & 0x7FFF_FFFF).to_be_bytes())
}

pub fn acknowledgement_payload(sequence: u32) -> Bytes {
    Bytes::copy_from_slice(&sequence.to_be_bytes())
}

pub fn window_ack_size_payload(size: u32) -> Bytes {
    Bytes::copy_from_slice(&size.to_be_bytes())
}

pub fn set_peer_bandwidth_payload(window: u32, limit_type: u8) -> Bytes {
    let mut buf = BytesMut::with_capacity(5);
    buf.put_u32(window);
    buf.put_u8(limit_type);
    buf.freeze()
}

pub fn ping_response_payload(timestamp: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(6);
    buf.put_u16(UC_PING_RESPONSE);
    buf.put_u32(timestamp);
    buf.freeze()
}
