//! Publisher facade
//!
//! A session becomes a publisher by calling
//! [`create_publish_stream`](RtmpSession::create_publish_stream); the
//! actual RTMP stream is not created until
//! [`begin_publishing`](RtmpSession::begin_publishing). Frames are
//! accepted once the server acknowledges the publish
//! (`SessionEvent::PublisherReady`).
//!
//! Publisher operations live on the session itself rather than on a
//! separately owned handle, so there is no pointer that dangles when a
//! disconnect tears the publisher down; the operations simply start
//! failing.

use crate::amf::{self, AmfObject, AmfValue};
use crate::error::{Error, Result};
use crate::media::{avc, flv};
use crate::protocol::constants::*;

use super::pipeline::Transport;
use super::RtmpSession;

/// Per-publisher state held by the session.
#[derive(Debug, Default)]
pub(crate) struct PublisherState {
    ready: bool,
    is_avc: bool,
}

impl PublisherState {
    /// Returns true when this call transitioned the publisher into the
    /// ready state.
    pub(crate) fn set_ready(&mut self, ready: bool) -> bool {
        if self.ready == ready {
            return false;
        }
        self.ready = ready;
        ready
    }
}

impl<T: Transport> RtmpSession<T> {
    /// Mark this session as a publisher. The RTMP stream itself is
    /// created by [`begin_publishing`](Self::begin_publishing).
    pub fn create_publish_stream(&mut self) {
        if self.publisher.is_none() {
            self.publisher = Some(PublisherState::default());
        }
    }

    /// Drop the publisher role. Does not tear down a live stream; call
    /// [`finish_publishing`](Self::finish_publishing) first for that.
    pub fn delete_publish_stream(&mut self) {
        self.publisher = None;
    }

    pub fn has_publisher(&self) -> bool {
        self.publisher.is_some()
    }

    /// True once the server has accepted the publish.
    pub fn publisher_is_ready(&self) -> bool {
        self.publisher.as_ref().map(|p| p.ready).unwrap_or(false)
    }

    /// Begin creating the publish stream. `SessionEvent::PublisherReady`
    /// fires when the server accepts.
    pub fn begin_publishing(&mut self) -> Result<()> {
        if self.publisher.is_none() {
            return Err(Error::InvalidWrite);
        }
        self.write_create_stream_msg()
    }

    /// Tear the publish stream down (FCUnpublish, closeStream,
    /// deleteStream). The session stays connected.
    pub fn finish_publishing(&mut self) -> Result<()> {
        if !self.publisher_is_ready() {
            return Err(Error::InvalidWrite);
        }
        self.write_delete_stream_msg(0)
    }

    /// Write the `@setDataFrame` stream metadata. Call before any video
    /// or audio frames.
    pub fn write_data_frame(&mut self, metadata: AmfObject) -> Result<()> {
        if !self.publisher_is_ready() || self.publish_stream_id() == 0 {
            return Err(Error::InvalidWrite);
        }
        let payload = amf::encode_all(&[
            AmfValue::String(CMD_SET_DATA_FRAME.into()),
            AmfValue::String(CMD_ON_METADATA.into()),
            AmfValue::Object(metadata),
        ]);
        let stream_id = self.publish_stream_id();
        self.write_message(stream_id, MSG_DATA_AMF0, 0, &payload, CSID_STREAM)
    }

    /// Write the AVCDecoderConfigurationRecord built from one SPS and
    /// one PPS. Must precede any H.264 frames or decoders like Flash
    /// cannot parse the stream. Start codes are stripped if present.
    pub fn write_avc_config_record(&mut self, sps: &[u8], pps: &[u8]) -> Result<()> {
        if !self.publisher_is_ready() {
            return Err(Error::InvalidWrite);
        }
        let record = avc::build_config_record(sps, pps)
            .ok_or_else(|| Error::Config("SPS/PPS too short for a config record".into()))?;

        if let Some(publisher) = self.publisher.as_mut() {
            publisher.is_avc = true;
        }

        let mut data = Vec::with_capacity(5 + record.len());
        data.extend_from_slice(&flv::avc_sequence_header_tag());
        data.extend_from_slice(&record);
        self.write_video_data(0, &data)
    }

    /// Write the AAC sequence header (AudioSpecificConfig).
    pub fn write_aac_sequence_header(&mut self, oob: &[u8]) -> Result<()> {
        if !self.publisher_is_ready() {
            return Err(Error::InvalidWrite);
        }
        let mut data = Vec::with_capacity(2 + oob.len());
        data.extend_from_slice(&flv::aac_sequence_header_tag());
        data.extend_from_slice(oob);
        self.write_audio_data(0, &data)
    }

    /// Write one video frame: the caller's FLV VideoTagHeader followed
    /// by the frame's NAL units. For H.264 each NAL is rewritten from
    /// Annex-B to a 4-byte length prefix; for other codecs the packets
    /// are concatenated untouched.
    pub fn write_video_frame<N: AsRef<[u8]>>(
        &mut self,
        timestamp: u32,
        header: &[u8],
        packets: &[N],
    ) -> Result<()> {
        let Some(publisher) = self.publisher.as_ref() else {
            return Err(Error::InvalidWrite);
        };
        if !publisher.ready {
            return Err(Error::InvalidWrite);
        }

        let data = if publisher.is_avc {
            avc::wrap_avc_sample(header, packets)
        } else {
            let mut size = header.len();
            for pkt in packets {
                size += pkt.as_ref().len();
            }
            let mut data = Vec::with_capacity(size);
            data.extend_from_slice(header);
            for pkt in packets {
                data.extend_from_slice(pkt.as_ref());
            }
            data.into()
        };
        self.write_video_data(timestamp, &data)
    }

    /// Write one audio frame: the caller's FLV AudioTagHeader followed
    /// by the access unit.
    pub fn write_audio_frame(&mut self, timestamp: u32, header: &[u8], data: &[u8]) -> Result<()> {
        if !self.publisher_is_ready() {
            return Err(Error::InvalidWrite);
        }
        let mut frame = Vec::with_capacity(header.len() + data.len());
        frame.extend_from_slice(header);
        frame.extend_from_slice(data);
        self.write_audio_data(timestamp, &frame)
    }

    /// Coalesce subsequent writes into one socket write until the
    /// matching [`end_force_buffer`](Self::end_force_buffer). Used to
    /// keep a frame's tags in a single packet.
    pub fn begin_force_buffer(&mut self) {
        self.pipe_mut().begin_force_buffer();
    }

    pub fn end_force_buffer(&mut self) {
        self.end_force_buffer_internal();
    }

    /// Will the next write buffer internally instead of reaching the
    /// OS? When true, a producer under pressure should drop frames
    /// rather than queue more.
    pub fn will_write_buffer(&self) -> bool {
        self.pipe().will_buffer()
    }

    pub fn publish_stream_id(&self) -> u32 {
        self.publish_stream_id
    }
}
