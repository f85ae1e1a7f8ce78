//! Unified error types for rtmp-publish

use std::fmt;
use std::io;

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds surfaced to the application through session events.
///
/// Protocol-layer errors emit the event and disconnect the session.
/// Transient write-full conditions are absorbed by the send pipeline and
/// never appear here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Any other socket failure
    Unknown,
    /// TCP connection refused
    ConnectionRefused,
    /// Remote host closed the connection unexpectedly
    RemoteHostClosed,
    /// DNS lookup failed
    HostNotFound,
    /// Socket operation timed out
    Timeout,
    /// Transient network failure
    Network,
    /// RTMPS TLS handshake failed
    SslHandshakeFailed,
    /// Wire protocol violation (bad handshake echo, malformed AMF,
    /// short control message)
    UnexpectedResponse,
    /// Write attempted while disconnected, connecting or disconnecting
    InvalidWrite,
    /// Server replied `_error` to our `connect()`
    RtmpConnectRejected,
    /// Server replied `_error` to our `createStream()`
    RtmpCreateStreamError,
    /// Server's `onStatus` code was not `NetStream.Publish.Start`
    RtmpPublishRejected,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Unknown => "Unknown error",
            ErrorKind::ConnectionRefused => "Connection refused",
            ErrorKind::RemoteHostClosed => "Remote host closed connection",
            ErrorKind::HostNotFound => "Host address not found",
            ErrorKind::Timeout => "Timed out",
            ErrorKind::Network => "Network error",
            ErrorKind::SslHandshakeFailed => "SSL/TLS handshake failed",
            ErrorKind::UnexpectedResponse => "Unexpected response",
            ErrorKind::InvalidWrite => "Invalid write",
            ErrorKind::RtmpConnectRejected => "RTMP application connection rejected",
            ErrorKind::RtmpCreateStreamError => "RTMP stream creation failed",
            ErrorKind::RtmpPublishRejected => "Server rejected publish",
        };
        f.write_str(s)
    }
}

impl ErrorKind {
    /// Map an I/O error onto the kind surfaced to the application.
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => ErrorKind::ConnectionRefused,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => ErrorKind::RemoteHostClosed,
            io::ErrorKind::TimedOut => ErrorKind::Timeout,
            io::ErrorKind::NotFound | io::ErrorKind::AddrNotAvailable => ErrorKind::HostNotFound,
            io::ErrorKind::NotConnected => ErrorKind::Network,
            _ => ErrorKind::Unknown,
        }
    }
}

/// Unified error type for all RTMP operations
#[derive(Debug)]
pub enum Error {
    /// I/O error during network operations
    Io(io::Error),
    /// AMF encoding/decoding error
    Amf(AmfError),
    /// Handshake failure
    Handshake(HandshakeError),
    /// RTMP protocol violation
    Protocol(ProtocolError),
    /// Write attempted in a state that cannot accept one
    InvalidWrite,
    /// Connection was closed
    ConnectionClosed,
    /// Invalid configuration (bad target URL, missing stream name, ...)
    Config(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Amf(e) => write!(f, "AMF error: {}", e),
            Error::Handshake(e) => write!(f, "Handshake error: {}", e),
            Error::Protocol(e) => write!(f, "Protocol error: {}", e),
            Error::InvalidWrite => write!(f, "Invalid write"),
            Error::ConnectionClosed => write!(f, "Connection closed"),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<AmfError> for Error {
    fn from(err: AmfError) -> Self {
        Error::Amf(err)
    }
}

impl From<HandshakeError> for Error {
    fn from(err: HandshakeError) -> Self {
        Error::Handshake(err)
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error::Protocol(err)
    }
}

/// AMF encoding/decoding errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmfError {
    /// Marker byte is outside the supported AMF0 subset
    UnknownMarker(u8),
    /// Input ended before the value did
    UnexpectedEof,
    /// String payload is not valid UTF-8
    InvalidUtf8,
}

impl fmt::Display for AmfError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AmfError::UnknownMarker(m) => write!(f, "Unknown AMF marker: 0x{:02X}", m),
            AmfError::UnexpectedEof => write!(f, "Unexpected end of AMF data"),
            AmfError::InvalidUtf8 => write!(f, "Invalid UTF-8 in AMF string"),
        }
    }
}

impl std::error::Error for AmfError {}

/// Handshake-specific errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeError {
    /// Server sent an RTMP version other than 3
    InvalidVersion(u8),
    /// S2 did not echo our C1 nonce
    EchoMismatch,
    /// Operation does not apply to the current handshake state
    InvalidState,
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeError::InvalidVersion(v) => write!(f, "Invalid RTMP version: {}", v),
            HandshakeError::EchoMismatch => write!(f, "Handshake echo mismatch"),
            HandshakeError::InvalidState => write!(f, "Invalid handshake state"),
        }
    }
}

impl std::error::Error for HandshakeError {}

/// Protocol-level errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Chunk stream id outside 2..=65599
    InvalidChunkStreamId(u32),
    /// Control message payload shorter than its fixed layout
    ShortControlMessage(u8),
    /// AMF values consumed more bytes than the message contained
    AmfOverflow,
    /// Command message content violated the expected shape
    InvalidCommand(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::InvalidChunkStreamId(id) => {
                write!(f, "Invalid chunk stream ID: {}", id)
            }
            ProtocolError::ShortControlMessage(t) => {
                write!(f, "Short payload for control message type {}", t)
            }
            ProtocolError::AmfOverflow => write!(f, "Buffer overflow while decoding AMF message"),
            ProtocolError::InvalidCommand(msg) => write!(f, "Invalid command: {}", msg),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;

    #[test]
    fn test_error_kind_display() {
        assert_eq!(ErrorKind::ConnectionRefused.to_string(), "Connection refused");
        assert_eq!(
            ErrorKind::RtmpPublishRejected.to_string(),
            "Server rejected publish"
        );
        assert_eq!(ErrorKind::UnexpectedResponse.to_string(), "Unexpected response");
    }

    #[test]
    fn test_error_kind_from_io() {
        let err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert_eq!(ErrorKind::from_io(&err), ErrorKind::ConnectionRefused);

        let err = io::Error::new(io::ErrorKind::BrokenPipe, "pipe");
        assert_eq!(ErrorKind::from_io(&err), ErrorKind::RemoteHostClosed);

        let err = io::Error::new(io::ErrorKind::TimedOut, "timeout");
        assert_eq!(ErrorKind::from_io(&err), ErrorKind::Timeout);

        let err = io::Error::new(io::ErrorKind::Other, "other");
        assert_eq!(ErrorKind::from_io(&err), ErrorKind::Unknown);
    }

    #[test]
    fn test_error_display_and_source() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionReset, "connection reset");
        let err = Error::Io(io_err);
        assert!(err.to_string().contains("I/O error"));
        assert!(StdError::source(&err).is_some());

        let err = Error::Amf(AmfError::UnknownMarker(0x11));
        assert!(err.to_string().contains("0x11"));
        assert!(StdError::source(&err).is_none());

        let err = Error::Handshake(HandshakeError::EchoMismatch);
        assert!(err.to_string().contains("echo"));

        let err = Error::Protocol(ProtocolError::InvalidChunkStreamId(70000));
        assert!(err.to_string().contains("70000"));
    }

    #[test]
    fn test_from_conversions() {
        let err: Error = AmfError::UnexpectedEof.into();
        assert!(matches!(err, Error::Amf(_)));

        let err: Error = HandshakeError::InvalidVersion(5).into();
        assert!(matches!(err, Error::Handshake(_)));

        let err: Error = ProtocolError::ShortControlMessage(1).into();
        assert!(matches!(err, Error::Protocol(_)));

        let err: Error = io::Error::new(io::ErrorKind::TimedOut, "timeout").into();
        assert!(matches!(err, Error::Io(_)));
    }
}
