//! Outbound send pipeline
//!
//! Three layered buffers sit between `write()` and the kernel:
//!
//! 1. A force-buffer scope (reference counted) coalesces a burst of
//!    small writes into one socket write so command handshakes don't
//!    leave as a swarm of tiny packets.
//! 2. An internal buffer holds whatever the kernel would not accept.
//!    Writes are capped at the best-known free space of the kernel send
//!    buffer so congestion stays visible at the kernel boundary instead
//!    of hiding in an unbounded userspace queue.
//! 3. An opt-in "gamer" buffer releases data once per host tick at a
//!    computed rate, keeping the uplink smooth enough that a running
//!    game on the same connection doesn't see latency spikes.
//!
//! When the kernel buffer fills anyway the pipeline drops into
//! saturation mode: Nagle's algorithm comes back on, the gamer buffer
//! drains into the internal buffer, and TCP flow control takes over
//! until the congestion clears for `exit_sat_mode_time` seconds.

use bytes::{Buf, BytesMut};
use std::io;

/// Throttle multiplier over the ideal per-tick average. Values between
/// 1.2 and 1.5 interoperate; lower starves the buffer near link
/// capacity, higher loses the interference reduction. Tuned on real
/// uplinks, do not change casually.
const GAMER_THROTTLE_MULTIPLY: f32 = 1.3;

/// Floor for the configured average upload rate, so a misconfigured
/// session still makes some progress.
const MIN_AVG_UPLOAD_BYTES: u32 = 5 * 1024;

/// Default average upload rate: effectively unthrottled.
const DEFAULT_AVG_UPLOAD_BYTES: u32 = 100 * 1024 * 1024;

/// Seconds without congestion before saturation mode exits.
const DEFAULT_EXIT_SAT_MODE_TIME: f32 = 10.0;

/// The socket contract the pipeline writes through.
///
/// `try_write` must be non-blocking: it returns how many bytes the
/// kernel accepted and `WouldBlock` when the send buffer is full.
pub trait Transport {
    fn try_write(&mut self, data: &[u8]) -> io::Result<usize>;
    /// Kernel send buffer size (`SO_SNDBUF`)
    fn send_buffer_size(&self) -> io::Result<usize>;
    fn set_send_buffer_size(&mut self, size: usize) -> io::Result<()>;
    /// Toggle `TCP_NODELAY`
    fn set_nodelay(&mut self, nodelay: bool) -> io::Result<()>;
}

/// Process-wide gamer mode settings.
///
/// Both settings must only be changed while no session is active; the
/// per-tick release math assumes a stable tick frequency for the life
/// of a connection.
pub mod gamer {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    static ENABLED: AtomicBool = AtomicBool::new(false);
    // f32 bits of 1.0
    static TICK_FREQ_BITS: AtomicU32 = AtomicU32::new(0x3F80_0000);

    /// Enable or disable gamer mode for the whole process.
    pub fn set_enabled(enabled: bool) {
        ENABLED.store(enabled, Ordering::Relaxed);
    }

    pub fn enabled() -> bool {
        ENABLED.load(Ordering::Relaxed)
    }

    /// Expected frequency of `tick_event` calls in Hz. Behaviour is
    /// undefined if the host ticks at a different rate without
    /// accounting for dropped ticks.
    pub fn set_tick_freq(freq: f32) {
        TICK_FREQ_BITS.store(freq.max(0.001).to_bits(), Ordering::Relaxed);
    }

    pub fn tick_freq() -> f32 {
        f32::from_bits(TICK_FREQ_BITS.load(Ordering::Relaxed))
    }
}

pub struct SendPipeline<T: Transport> {
    transport: T,
    /// Internal buffer between the library and the kernel send buffer
    pending: BytesMut,
    /// Force-buffer scope reference count
    force_depth: u32,
    /// Gamer buffer, drained by `gamer_tick`
    gamer_buf: BytesMut,
    avg_upload_bytes: u32,
    in_sat_mode: bool,
    sat_mode_timer: f32,
    exit_sat_mode_time: f32,
}

impl<T: Transport> SendPipeline<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            pending: BytesMut::new(),
            force_depth: 0,
            gamer_buf: BytesMut::new(),
            avg_upload_bytes: DEFAULT_AVG_UPLOAD_BYTES,
            in_sat_mode: false,
            sat_mode_timer: 0.0,
            exit_sat_mode_time: DEFAULT_EXIT_SAT_MODE_TIME,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Approximate upload rate gamer mode throttles towards.
    pub fn set_average_upload(&mut self, bytes_per_sec: u32) {
        self.avg_upload_bytes = bytes_per_sec.max(MIN_AVG_UPLOAD_BYTES);
    }

    /// Seconds of congestion-free ticks before saturation mode exits.
    pub fn set_exit_sat_mode_time(&mut self, seconds: f32) {
        self.exit_sat_mode_time = seconds;
    }

    pub fn in_saturation_mode(&self) -> bool {
        self.in_sat_mode
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn gamer_buffered_len(&self) -> usize {
        self.gamer_buf.len()
    }

    /// True while any layer holds bytes the host should flush on the
    /// next writable notification.
    pub fn wants_writable(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Begin a force-buffer scope: writes accumulate until the
    /// outermost scope ends.
    pub fn begin_force_buffer(&mut self) {
        self.force_depth += 1;
    }

    /// End a force-buffer scope, flushing once the count reaches zero.
    pub fn end_force_buffer(&mut self) -> io::Result<()> {
        if self.force_depth == 0 {
            return Ok(());
        }
        self.force_depth -= 1;
        if self.force_depth == 0 {
            self.flush(false)?;
        }
        Ok(())
    }

    pub fn force_depth(&self) -> u32 {
        self.force_depth
    }

    /// Will the next `write` buffer internally instead of reaching the
    /// OS? Publishers use this to drop frames cheaply.
    pub fn will_buffer(&self) -> bool {
        self.force_depth > 0 || !self.pending.is_empty()
    }

    /// Queue `data` for transmission.
    pub fn write(&mut self, data: &[u8]) -> io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        // Gamer mode owns the pacing unless the network is saturated,
        // in which case TCP flow control does a better job.
        if gamer::enabled() && !self.in_sat_mode {
            self.gamer_buf.extend_from_slice(data);
            return Ok(());
        }

        if self.force_depth > 0 {
            self.pending.extend_from_slice(data);
            return Ok(());
        }

        self.socket_write(data, false)?;
        Ok(())
    }

    /// Try to drain the internal buffer. Returns the data-request byte
    /// count to surface when the buffer fully drained,
    /// `emit_data_request` was set, and the gamer buffer is not the
    /// active path.
    pub fn flush(&mut self, emit_data_request: bool) -> io::Result<Option<usize>> {
        if self.pending.is_empty() {
            return Ok(None);
        }
        // In gamer mode a non-empty internal buffer implies saturation
        // mode; outside it the tick owns the draining.
        if gamer::enabled() && !self.in_sat_mode {
            return Ok(None);
        }
        self.socket_write(&[], emit_data_request)
    }

    /// Release throttled bytes for this host tick. `dropped` is how
    /// many ticks were missed since the last call.
    pub fn gamer_tick(&mut self, dropped: u32) -> io::Result<()> {
        if !gamer::enabled() {
            return Ok(());
        }
        if self.will_buffer() {
            return Ok(()); // Kernel buffer is full; flush happens on writable
        }

        let freq = gamer::tick_freq();
        if self.in_sat_mode {
            self.sat_mode_timer += (1 + dropped) as f32 / freq;
            if self.sat_mode_timer >= self.exit_sat_mode_time {
                self.exit_sat_mode()?;
            } else {
                return Ok(());
            }
        }

        if self.gamer_buf.is_empty() {
            return Ok(());
        }

        let max_avg = (self.avg_upload_bytes as f32 / freq) * (1 + dropped) as f32;
        let max_bytes = (max_avg * GAMER_THROTTLE_MULTIPLY) as usize;

        let out = if max_bytes >= self.gamer_buf.len() {
            self.gamer_buf.split()
        } else {
            self.gamer_buf.split_to(max_bytes)
        };
        self.socket_write(&out, false)?;
        Ok(())
    }

    /// Best-effort drain of every layer, for a clean disconnect.
    pub fn flush_for_close(&mut self) {
        let gamer_buf = self.gamer_buf.split();
        self.pending.extend_from_slice(&gamer_buf);
        while !self.pending.is_empty() {
            match self.transport.try_write(&self.pending[..]) {
                Ok(0) => break,
                Ok(n) => self.pending.advance(n),
                Err(_) => break,
            }
        }
        self.pending.clear();
    }

    /// Drop all buffered data (unclean disconnect or socket loss).
    pub fn clear(&mut self) {
        self.pending.clear();
        self.gamer_buf.clear();
        self.force_depth = 0;
        self.in_sat_mode = false;
        self.sat_mode_timer = 0.0;
    }

    /// Write pending data then `data` to the transport, capped at the
    /// best-known free space of the kernel send buffer. Anything not
    /// accepted lands in the internal buffer and flips saturation mode.
    ///
    /// Returns the data request to surface, when asked for and earned.
    fn socket_write(&mut self, data: &[u8], emit_data_request: bool) -> io::Result<Option<usize>> {
        debug_assert!(!(emit_data_request && !data.is_empty()));

        let sndbuf = self.transport.send_buffer_size().unwrap_or(64 * 1024);
        let mut free = sndbuf;

        if !self.pending.is_empty() {
            let want = self.pending.len().min(free);
            let written = self.try_write_some(want)?;
            free = free.saturating_sub(written);

            if !self.pending.is_empty() {
                // Could not fully drain: the new data queues behind it
                self.pending.extend_from_slice(data);
                self.enter_sat_mode()?;
                return Ok(None);
            }

            if emit_data_request {
                // Buffer fully drained by this flush; in gamer mode the
                // tick path owns its own buffer so no request is made.
                if !gamer::enabled() || self.in_sat_mode {
                    return Ok(Some(free.max(1)));
                }
                return Ok(None);
            }
        }

        if data.is_empty() {
            return Ok(None);
        }

        let want = data.len().min(free);
        let mut written = 0;
        if want > 0 {
            written = match self.transport.try_write(&data[..want]) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => 0,
                Err(e) => return Err(e),
            };
        }
        if written < data.len() {
            self.pending.extend_from_slice(&data[written..]);
            self.enter_sat_mode()?;
        }
        Ok(None)
    }

    /// Drain up to `want` bytes of the internal buffer. Returns how many
    /// bytes the kernel accepted; `WouldBlock` counts as zero.
    fn try_write_some(&mut self, want: usize) -> io::Result<usize> {
        if want == 0 {
            return Ok(0);
        }
        let written = match self.transport.try_write(&self.pending[..want]) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => 0,
            Err(e) => return Err(e),
        };
        self.pending.advance(written);
        Ok(written)
    }

    /// The kernel buffer filled up. Hand pacing back to TCP: re-enable
    /// Nagle and fold the gamer buffer into the internal buffer.
    fn enter_sat_mode(&mut self) -> io::Result<()> {
        if !gamer::enabled() {
            return Ok(());
        }

        // Every congestion signal resets the exit timer
        self.sat_mode_timer = 0.0;

        if self.in_sat_mode {
            return Ok(());
        }
        tracing::warn!("network congestion detected, entering saturation mode");
        self.in_sat_mode = true;
        let _ = self.transport.set_nodelay(false);

        if !self.gamer_buf.is_empty() {
            let buf = self.gamer_buf.split();
            // Recursion bottoms out: in_sat_mode is already set
            self.socket_write(&buf, false)?;
        }
        Ok(())
    }

    fn exit_sat_mode(&mut self) -> io::Result<()> {
        if !gamer::enabled() || !self.in_sat_mode {
            return Ok(());
        }
        tracing::info!("network congestion no longer detected, exiting saturation mode");
        self.in_sat_mode = false;
        self.sat_mode_timer = 0.0;
        let _ = self.transport.set_nodelay(true);
        Ok(())
    }
}


/// In-memory transport with a bounded "kernel buffer", for tests.
#[cfg(test)]
pub(crate) struct MockTransport {
    /// Every byte the kernel accepted, in order
    pub written: Vec<u8>,
    /// Simulated SO_SNDBUF size
    pub sndbuf: usize,
    /// Bytes currently sitting in the simulated kernel buffer
    pub queued: usize,
    /// Last TCP_NODELAY value set, if any
    pub nodelay: Option<bool>,
}

#[cfg(test)]
impl MockTransport {
    pub fn new(sndbuf: usize) -> Self {
        Self {
            written: Vec::new(),
            sndbuf,
            queued: 0,
            nodelay: None,
        }
    }

    /// Simulate the kernel transmitting `n` queued bytes.
    pub fn drain(&mut self, n: usize) {
        self.queued = self.queued.saturating_sub(n);
    }
}

#[cfg(test)]
impl Transport for MockTransport {
    fn try_write(&mut self, data: &[u8]) -> io::Result<usize> {
        let space = self.sndbuf.saturating_sub(self.queued);
        if space == 0 {
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "send buffer full"));
        }
        let n = data.len().min(space);
        self.written.extend_from_slice(&data[..n]);
        self.queued += n;
        Ok(n)
    }

    fn send_buffer_size(&self) -> io::Result<usize> {
        Ok(self.sndbuf)
    }

    fn set_send_buffer_size(&mut self, size: usize) -> io::Result<()> {
        self.sndbuf = size;
        Ok(())
    }

    fn set_nodelay(&mut self, nodelay: bool) -> io::Result<()> {
        self.nodelay = Some(nodelay);
        Ok(())
    }
}
