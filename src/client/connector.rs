//! Tokio publish client
//!
//! Owns the TCP socket and pumps the session state machine: inbound
//! bytes on readable, pipeline flushes on writable (armed only while
//! the pipeline holds data, since writes are explicitly flow
//! controlled), gamer ticks on an interval, and publisher commands from
//! a bounded channel so a fast producer backpressures instead of
//! racing the session.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, MissedTickBehavior};

use crate::amf::AmfObject;
use crate::error::{Error, ErrorKind, Result};
use crate::session::pipeline::{gamer, Transport};
use crate::session::{RtmpSession, SessionEvent};
use crate::target::TargetProtocol;

use super::config::ClientConfig;

/// [`Transport`] over a tokio `TcpStream`.
///
/// tokio does not expose `SO_SNDBUF` on a connected stream, so those
/// calls go through a `socket2::SockRef` borrow of the same fd.
pub struct TcpTransport {
    stream: Arc<TcpStream>,
}

impl TcpTransport {
    pub fn new(stream: Arc<TcpStream>) -> Self {
        Self { stream }
    }
}

impl Transport for TcpTransport {
    fn try_write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.stream.try_write(data)
    }

    fn send_buffer_size(&self) -> io::Result<usize> {
        let sock = socket2::SockRef::from(&*self.stream);
        sock.send_buffer_size()
    }

    fn set_send_buffer_size(&mut self, size: usize) -> io::Result<()> {
        let sock = socket2::SockRef::from(&*self.stream);
        sock.set_send_buffer_size(size)
    }

    fn set_nodelay(&mut self, nodelay: bool) -> io::Result<()> {
        self.stream.set_nodelay(nodelay)
    }
}

/// Publisher operations, applied on the driver task in order.
#[derive(Debug)]
pub enum PublishCommand {
    BeginPublishing,
    FinishPublishing,
    WriteDataFrame(AmfObject),
    WriteAvcConfigRecord { sps: Vec<u8>, pps: Vec<u8> },
    WriteAacSequenceHeader(Vec<u8>),
    WriteVideoFrame {
        timestamp: u32,
        header: Vec<u8>,
        nals: Vec<Vec<u8>>,
    },
    WriteAudioFrame {
        timestamp: u32,
        header: Vec<u8>,
        data: Vec<u8>,
    },
    BeginForceBuffer,
    EndForceBuffer,
    Disconnect { clean: bool },
}

/// Handle to a running publish connection.
///
/// Dropping the handle disconnects cleanly once queued commands have
/// been applied.
pub struct PublishClient {
    commands: mpsc::Sender<PublishCommand>,
}

impl PublishClient {
    /// Connect to the configured target and drive the session until it
    /// disconnects. Returns the command handle and the event stream;
    /// connection progress and failures arrive as events
    /// (`Connecting`, `Connected`, ..., `Error`, `Disconnected`).
    pub fn launch(config: ClientConfig) -> Result<(Self, mpsc::Receiver<SessionEvent>)> {
        if config.target.protocol == TargetProtocol::Rtmps {
            // The session core is transport agnostic; this driver only
            // speaks plain TCP. Drive RtmpSession over a TLS transport
            // for rtmps targets.
            return Err(Error::Config(
                "rtmps targets need a TLS transport; this driver is plain TCP".into(),
            ));
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(256);
        tokio::spawn(run(config, cmd_rx, event_tx));
        Ok((Self { commands: cmd_tx }, event_rx))
    }

    async fn send(&self, cmd: PublishCommand) -> Result<()> {
        self.commands
            .send(cmd)
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    pub async fn begin_publishing(&self) -> Result<()> {
        self.send(PublishCommand::BeginPublishing).await
    }

    pub async fn finish_publishing(&self) -> Result<()> {
        self.send(PublishCommand::FinishPublishing).await
    }

    pub async fn write_data_frame(&self, metadata: AmfObject) -> Result<()> {
        self.send(PublishCommand::WriteDataFrame(metadata)).await
    }

    pub async fn write_avc_config_record(&self, sps: Vec<u8>, pps: Vec<u8>) -> Result<()> {
        self.send(PublishCommand::WriteAvcConfigRecord { sps, pps }).await
    }

    pub async fn write_aac_sequence_header(&self, oob: Vec<u8>) -> Result<()> {
        self.send(PublishCommand::WriteAacSequenceHeader(oob)).await
    }

    pub async fn write_video_frame(
        &self,
        timestamp: u32,
        header: Vec<u8>,
        nals: Vec<Vec<u8>>,
    ) -> Result<()> {
        self.send(PublishCommand::WriteVideoFrame {
            timestamp,
            header,
            nals,
        })
        .await
    }

    pub async fn write_audio_frame(
        &self,
        timestamp: u32,
        header: Vec<u8>,
        data: Vec<u8>,
    ) -> Result<()> {
        self.send(PublishCommand::WriteAudioFrame {
            timestamp,
            header,
            data,
        })
        .await
    }

    pub async fn begin_force_buffer(&self) -> Result<()> {
        self.send(PublishCommand::BeginForceBuffer).await
    }

    pub async fn end_force_buffer(&self) -> Result<()> {
        self.send(PublishCommand::EndForceBuffer).await
    }

    pub async fn disconnect(&self, clean: bool) -> Result<()> {
        self.send(PublishCommand::Disconnect { clean }).await
    }
}

/// The driver task.
async fn run(
    config: ClientConfig,
    mut commands: mpsc::Receiver<PublishCommand>,
    events: mpsc::Sender<SessionEvent>,
) {
    let _ = events.send(SessionEvent::Connecting).await;

    let stream = match dial(&config).await {
        Ok(stream) => stream,
        Err(kind) => {
            tracing::warn!(%kind, "failed to connect");
            let _ = events.send(SessionEvent::Error(kind)).await;
            let _ = events.send(SessionEvent::Disconnected).await;
            return;
        }
    };

    let stream = Arc::new(stream);
    let mut session = RtmpSession::new(
        config.target.clone(),
        TcpTransport::new(Arc::clone(&stream)),
    );
    if let Some(version) = &config.version_string {
        session.set_version_string(version.clone());
    }
    if let Some(size) = config.os_write_buffer_size {
        if let Err(err) = session.set_os_write_buffer_size(size) {
            tracing::warn!(%err, "failed to set SO_SNDBUF");
        }
    }
    if let Some(avg) = config.average_upload {
        session.gamer_set_average_upload(avg);
    }
    if let Some(secs) = config.exit_sat_mode_time {
        session.gamer_set_exit_sat_mode_time(secs);
    }
    session.create_publish_stream();

    session.begin_connect().expect("fresh session");
    // The dial already surfaced Connecting; drop the duplicate
    let first = session.poll_event();
    debug_assert_eq!(first, Some(SessionEvent::Connecting));
    session.socket_connected();

    let mut tick = interval(Duration::from_secs_f32(1.0 / gamer::tick_freq().max(0.001)));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut read_buf = vec![0u8; 64 * 1024];
    loop {
        if forward_events(&mut session, &events).await {
            return; // Disconnected
        }

        tokio::select! {
            ready = stream.readable() => {
                if let Err(err) = ready {
                    session.socket_error(ErrorKind::from_io(&err));
                    session.socket_disconnected();
                    continue;
                }
                match stream.try_read(&mut read_buf) {
                    Ok(0) => session.socket_disconnected(),
                    Ok(n) => session.receive_data(&read_buf[..n]),
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                    Err(err) => {
                        session.socket_error(ErrorKind::from_io(&err));
                        session.socket_disconnected();
                    }
                }
            }
            ready = stream.writable(), if session.wants_writable() => {
                if ready.is_ok() {
                    session.socket_writable();
                }
            }
            _ = tick.tick(), if gamer::enabled() => {
                session.gamer_tick_event(0);
            }
            cmd = commands.recv() => {
                match cmd {
                    Some(cmd) => apply_command(&mut session, cmd),
                    None => {
                        // Handle dropped: clean shutdown
                        session.disconnect(true);
                    }
                }
            }
        }
    }
}

async fn dial(config: &ClientConfig) -> std::result::Result<TcpStream, ErrorKind> {
    let host = config.target.host.clone();
    let port = config.target.port;

    let dial = async {
        let mut addrs = tokio::net::lookup_host((host.as_str(), port))
            .await
            .map_err(|_| ErrorKind::HostNotFound)?;
        let addr = addrs.next().ok_or(ErrorKind::HostNotFound)?;
        TcpStream::connect(addr)
            .await
            .map_err(|err| ErrorKind::from_io(&err))
    };

    match timeout(config.connect_timeout, dial).await {
        Ok(result) => result,
        Err(_) => Err(ErrorKind::Timeout),
    }
}

fn apply_command(session: &mut RtmpSession<TcpTransport>, cmd: PublishCommand) {
    let result = match cmd {
        PublishCommand::BeginPublishing => session.begin_publishing(),
        PublishCommand::FinishPublishing => session.finish_publishing(),
        PublishCommand::WriteDataFrame(metadata) => session.write_data_frame(metadata),
        PublishCommand::WriteAvcConfigRecord { sps, pps } => {
            session.write_avc_config_record(&sps, &pps)
        }
        PublishCommand::WriteAacSequenceHeader(oob) => session.write_aac_sequence_header(&oob),
        PublishCommand::WriteVideoFrame {
            timestamp,
            header,
            nals,
        } => session.write_video_frame(timestamp, &header, &nals),
        PublishCommand::WriteAudioFrame {
            timestamp,
            header,
            data,
        } => session.write_audio_frame(timestamp, &header, &data),
        PublishCommand::BeginForceBuffer => {
            session.begin_force_buffer();
            Ok(())
        }
        PublishCommand::EndForceBuffer => {
            session.end_force_buffer();
            Ok(())
        }
        PublishCommand::Disconnect { clean } => {
            session.disconnect(clean);
            Ok(())
        }
    };
    if let Err(err) = result {
        tracing::debug!(%err, "publish command failed");
    }
}

/// Forward queued session events. Returns true once the session
/// reported Disconnected, which ends the driver.
async fn forward_events(
    session: &mut RtmpSession<TcpTransport>,
    events: &mpsc::Sender<SessionEvent>,
) -> bool {
    let mut done = false;
    while let Some(event) = session.poll_event() {
        if event == SessionEvent::Disconnected {
            done = true;
        }
        if events.send(event).await.is_err() {
            // Listener went away; tear down without flushing
            session.disconnect(false);
            return true;
        }
    }
    done
}
