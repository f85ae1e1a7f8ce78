//! AMF0 value types and codec
//!
//! RTMP command arguments are encoded with AMF0. Only the subset of
//! markers that publishing clients and reference servers actually
//! exchange is implemented: Number, Boolean, String/LongString, Object,
//! EcmaArray, Null and Undefined. Everything else (typed objects,
//! references, dates, XML, strict arrays, AMF3) fails decoding.

pub mod amf0;
pub mod value;

pub use amf0::{decode, decode_all, encode, encode_all};
pub use value::{AmfObject, AmfValue};
