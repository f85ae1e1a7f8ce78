//! H.264/AVC sample shaping
//!
//! Encoders hand over Annex-B NAL units (optionally prefixed with a
//! `00 00 01` or `00 00 00 01` start code); RTMP carries AVCC: each NAL
//! prefixed with a big-endian length. The length field size is
//! advertised in the AVCDecoderConfigurationRecord; this implementation
//! always uses 4 bytes (`lengthSizeMinusOne = 3`).
//!
//! Record layout (ISO/IEC 14496-15:2004 §5.2.4.1):
//! ```text
//! configurationVersion(1) AVCProfileIndication(1) profile_compatibility(1)
//! AVCLevelIndication(1) lengthSizeMinusOne(1) numOfSPS(1)
//! { spsLength(2) spsNALUnit }  numOfPPS(1)  { ppsLength(2) ppsNALUnit }
//! ```

use bytes::{BufMut, Bytes, BytesMut};

/// Strip a leading Annex-B start code from a NAL unit, if present.
///
/// Tolerates any run of zero bytes before the `01`, which covers both
/// the 3- and 4-byte forms and the zero-padded variants some encoders
/// emit.
pub fn strip_start_code(nal: &[u8]) -> &[u8] {
    let mut off = 0;
    while off + 1 < nal.len() && nal[off] == 0 {
        off += 1;
    }
    if off > 0 && nal[off] == 0x01 {
        off += 1;
    }
    &nal[off..]
}

/// Build the AVCDecoderConfigurationRecord from one SPS and one PPS.
///
/// Start codes are stripped first. Returns `None` when the SPS is too
/// short to carry the profile/compatibility/level bytes the record
/// echoes.
pub fn build_config_record(sps: &[u8], pps: &[u8]) -> Option<Bytes> {
    let sps = strip_start_code(sps);
    let pps = strip_start_code(pps);
    if sps.len() <= 3 || pps.is_empty() {
        return None;
    }

    let mut buf = BytesMut::with_capacity(11 + sps.len() + pps.len());
    buf.put_u8(0x01); // configurationVersion
    buf.put_u8(sps[1]); // AVCProfileIndication
    buf.put_u8(sps[2]); // profile_compatibility
    buf.put_u8(sps[3]); // AVCLevelIndication
    buf.put_u8(0xFC | (4 - 1)); // lengthSizeMinusOne, reserved bits set
    buf.put_u8(0xE0 | 1); // numOfSequenceParameterSets, reserved bits set
    buf.put_u16(sps.len() as u16);
    buf.put_slice(sps);
    buf.put_u8(1); // numOfPictureParameterSets
    buf.put_u16(pps.len() as u16);
    buf.put_slice(pps);
    Some(buf.freeze())
}

/// Wrap NAL units into an AVC sample: the caller's FLV tag header
/// followed by each NAL with its start code replaced by a 4-byte
/// big-endian length prefix.
pub fn wrap_avc_sample<N: AsRef<[u8]>>(header: &[u8], nals: &[N]) -> Bytes {
    let mut size = header.len();
    for nal in nals {
        size += nal.as_ref().len() + 4;
    }
    let mut buf = BytesMut::with_capacity(size);
    buf.put_slice(header);
    for nal in nals {
        let nal = strip_start_code(nal.as_ref());
        buf.put_u32(nal.len() as u32);
        buf.put_slice(nal);
    }
    buf.freeze()
}
