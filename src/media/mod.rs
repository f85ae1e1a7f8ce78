//! FLV frame shaping for the publisher
//!
//! RTMP audio/video messages are FLV tag bodies: a 1-5 byte tag header
//! describing codec and frame type followed by codec data. For H.264 the
//! codec data is AVCC format (length-prefixed NAL units) and the stream
//! must open with an AVCDecoderConfigurationRecord.

pub mod avc;
pub mod flv;
