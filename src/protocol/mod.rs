//! RTMP wire protocol: handshake, chunk framing and message types
//!
//! Everything in this module is synchronous and sans-io; bytes go in and
//! out through `BytesMut` buffers so the layer can be driven from any
//! event loop and tested without sockets.

pub mod chunk;
pub mod constants;
pub mod handshake;
pub mod message;
