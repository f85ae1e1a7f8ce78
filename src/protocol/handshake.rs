//! RTMP client handshake
//!
//! ```text
//! Client                                   Server
//!   |------- C0 (1 byte: version 3) ------->|
//!   |------- C1 (time, zero, 1528 nonce) -->|
//!   |<------ S0 (1 byte: version) ----------|
//!   |<------ S1 (time, zero, 1528 random) --|
//!   |------- C2 (echo of S1) -------------->|
//!   |<------ S2 (echo of C1) ---------------|
//!   |          [Handshake Complete]         |
//! ```
//!
//! S2 must echo the 1528-byte nonce we sent in C1. The time fields are
//! not validated; nginx-rtmp among others sends values that violate the
//! specification and interop matters more than the letter of it.
//!
//! This is the "simple" handshake; the HMAC digest variant some CDNs use
//! for flash-player verification is not required for publishing.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::HandshakeError;
use crate::protocol::constants::{HANDSHAKE_NONCE_SIZE, HANDSHAKE_SIZE, RTMP_VERSION};

/// Handshake progress, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// C0/C1 not sent yet
    Initial,
    /// C0/C1 written, waiting for S0
    VersionSent,
    /// S0 validated, waiting for S1
    VersionReceived,
    /// C2 written, waiting for S2
    AckSent,
    /// S2 echo verified
    Done,
}

/// Client-side handshake state machine.
#[derive(Debug)]
pub struct ClientHandshake {
    state: HandshakeState,
    /// The 1528 random bytes sent in C1; S2 must echo these exactly
    nonce: [u8; HANDSHAKE_NONCE_SIZE],
}

impl ClientHandshake {
    pub fn new() -> Self {
        Self {
            state: HandshakeState::Initial,
            nonce: [0u8; HANDSHAKE_NONCE_SIZE],
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn is_done(&self) -> bool {
        self.state == HandshakeState::Done
    }

    /// Produce C0 + C1 (1 + 1536 bytes).
    pub fn generate_c0c1(&mut self) -> Result<Bytes, HandshakeError> {
        if self.state != HandshakeState::Initial {
            return Err(HandshakeError::InvalidState);
        }

        fill_nonce(&mut self.nonce);

        let mut buf = BytesMut::with_capacity(1 + HANDSHAKE_SIZE);
        buf.put_u8(RTMP_VERSION);
        buf.put_u32(current_time32());
        buf.put_u32(0);
        buf.put_slice(&self.nonce);

        self.state = HandshakeState::VersionSent;
        Ok(buf.freeze())
    }

    /// Consume server handshake bytes from `buf`. Returns C2 once S1 has
    /// arrived; returns `Ok(None)` while more data is needed. The caller
    /// keeps feeding the same buffer until `is_done()`.
    pub fn process(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, HandshakeError> {
        let mut response = None;
        loop {
            match self.state {
                HandshakeState::Initial | HandshakeState::Done => return Ok(response),
                HandshakeState::VersionSent => {
                    if buf.is_empty() {
                        return Ok(response);
                    }
                    let version = buf.get_u8();
                    if version != RTMP_VERSION {
                        return Err(HandshakeError::InvalidVersion(version));
                    }
                    self.state = HandshakeState::VersionReceived;
                }
                HandshakeState::VersionReceived => {
                    if buf.len() < HANDSHAKE_SIZE {
                        return Ok(response);
                    }
                    let server_time = buf.get_u32();
                    let _zero = buf.get_u32();
                    let mut echo = [0u8; HANDSHAKE_NONCE_SIZE];
                    buf.copy_to_slice(&mut echo);

                    let mut c2 = BytesMut::with_capacity(HANDSHAKE_SIZE);
                    c2.put_u32(server_time);
                    c2.put_u32(current_time32());
                    c2.put_slice(&echo);
                    response = Some(c2.freeze());

                    self.state = HandshakeState::AckSent;
                }
                HandshakeState::AckSent => {
                    if buf.len() < HANDSHAKE_SIZE {
                        return Ok(response);
                    }
                    let _time = buf.get_u32();
                    let _time2 = buf.get_u32();
                    let mut echo = [0u8; HANDSHAKE_NONCE_SIZE];
                    buf.copy_to_slice(&mut echo);
                    if echo != self.nonce {
                        return Err(HandshakeError::EchoMismatch);
                    }
                    self.state = HandshakeState::Done;
                }
            }
        }
    }
}

impl Default for ClientHandshake {
    fn default() -> Self {
        Self::new()
    }
}

/// Milliseconds since the epoch, truncated to the 32-bit wire field.
fn current_time32() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u32)
        .unwrap_or(0)
}

/// Fill the C1 nonce. RTMP only needs the bytes to be unpredictable
/// enough to detect a bad echo, so a time-seeded LCG avoids pulling in a
/// CSPRNG dependency.
fn fill_nonce(nonce: &mut [u8; HANDSHAKE_NONCE_SIZE]) {
    use std::sync::atomic::{AtomicU64, Ordering};
    // Distinguishes nonces generated within one clock tick
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let mut seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0x5DEECE66D)
        ^ COUNTER.fetch_add(1, Ordering::Relaxed).wrapping_mul(0x9E3779B97F4A7C15);
    for chunk in nonce.chunks_mut(8) {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let bytes = seed.to_le_bytes();
        let len = chunk.len().min(8);
        chunk[..len].copy_from_slice(&bytes[..len]);
    }
}
