//! RTMP protocol constants
//!
//! Reference: Adobe RTMP Specification (December 2012)

/// RTMP version number (always 3 for standard RTMP)
pub const RTMP_VERSION: u8 = 3;

/// Handshake packet size (C1/C2/S1/S2)
pub const HANDSHAKE_SIZE: usize = 1536;

/// Random-nonce portion of a handshake packet
pub const HANDSHAKE_NONCE_SIZE: usize = 1528;

/// Default chunk size until a SetChunkSize is exchanged
pub const DEFAULT_CHUNK_SIZE: u32 = 128;

/// Chunk size this client switches to before `connect()`, matching FMLE
pub const PUBLISH_CHUNK_SIZE: u32 = 4096;

/// Default acknowledgement window, matching librtmp
pub const DEFAULT_ACK_WINDOW: u32 = 2_500_000;

/// Chunk stream ids 0 and 1 encode the 2- and 3-byte basic header forms
pub const MIN_CHUNK_STREAM_ID: u32 = 2;

/// Largest id representable by a 3-byte basic header
pub const MAX_CHUNK_STREAM_ID: u32 = 65599;

/// Timestamps at or above this value escape to the extended field
pub const EXTENDED_TIMESTAMP_THRESHOLD: u32 = 0xFF_FFFF;

// ============================================================================
// Chunk Stream IDs used by the publisher role
// ============================================================================

/// Protocol control messages (SetChunkSize, Ack, WindowAckSize, ...)
pub const CSID_PROTOCOL_CONTROL: u32 = 2;

/// NetConnection commands (connect, createStream, releaseStream, ...)
pub const CSID_COMMAND: u32 = 3;

/// NetStream commands, metadata and media data
pub const CSID_STREAM: u32 = 4;

// ============================================================================
// Message Type IDs
// ============================================================================

pub const MSG_SET_CHUNK_SIZE: u8 = 1;
pub const MSG_ABORT: u8 = 2;
pub const MSG_ACKNOWLEDGEMENT: u8 = 3;
pub const MSG_USER_CONTROL: u8 = 4;
pub const MSG_WINDOW_ACK_SIZE: u8 = 5;
pub const MSG_SET_PEER_BANDWIDTH: u8 = 6;
pub const MSG_AUDIO: u8 = 8;
pub const MSG_VIDEO: u8 = 9;
pub const MSG_DATA_AMF3: u8 = 15;
pub const MSG_COMMAND_AMF3: u8 = 17;
pub const MSG_DATA_AMF0: u8 = 18;
pub const MSG_COMMAND_AMF0: u8 = 20;
pub const MSG_AGGREGATE: u8 = 22;

// ============================================================================
// User Control Event Types
// ============================================================================

pub const UC_STREAM_BEGIN: u16 = 0;
pub const UC_STREAM_EOF: u16 = 1;
pub const UC_STREAM_DRY: u16 = 2;
pub const UC_SET_BUFFER_LENGTH: u16 = 3;
pub const UC_STREAM_IS_RECORDED: u16 = 4;
pub const UC_PING_REQUEST: u16 = 6;
pub const UC_PING_RESPONSE: u16 = 7;

// ============================================================================
// Peer Bandwidth Limit Types
// ============================================================================

pub const BANDWIDTH_LIMIT_HARD: u8 = 0;
pub const BANDWIDTH_LIMIT_SOFT: u8 = 1;
pub const BANDWIDTH_LIMIT_DYNAMIC: u8 = 2;

// ============================================================================
// Command Names
// ============================================================================

pub const CMD_CONNECT: &str = "connect";
pub const CMD_CREATE_STREAM: &str = "createStream";
pub const CMD_DELETE_STREAM: &str = "deleteStream";
pub const CMD_CLOSE_STREAM: &str = "closeStream";
pub const CMD_PUBLISH: &str = "publish";
pub const CMD_RESULT: &str = "_result";
pub const CMD_ERROR: &str = "_error";
pub const CMD_ON_STATUS: &str = "onStatus";

// FMLE-compatibility commands sent around createStream/deleteStream
pub const CMD_RELEASE_STREAM: &str = "releaseStream";
pub const CMD_FC_PUBLISH: &str = "FCPublish";
pub const CMD_FC_UNPUBLISH: &str = "FCUnpublish";

// Data message handlers
pub const CMD_SET_DATA_FRAME: &str = "@setDataFrame";
pub const CMD_ON_METADATA: &str = "onMetaData";

// ============================================================================
// NetStream Status Codes
// ============================================================================

pub const NS_PUBLISH_START: &str = "NetStream.Publish.Start";
