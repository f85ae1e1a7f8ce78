//! AMF0 encoder and decoder
//!
//! Binary layout of the supported subset:
//!
//! ```text
//! 0x00 Number      big-endian IEEE 754 double (8 bytes)
//! 0x01 Boolean     1 byte, 0 = false
//! 0x02 String      u16 length + UTF-8 bytes
//! 0x03 Object      (u16 key length, key, value)* then end marker
//! 0x05 Null        no payload
//! 0x06 Undefined   no payload
//! 0x08 EcmaArray   u32 associative count, then same body as Object
//! 0x09 Object end  preceded by an empty key (u16 = 0)
//! 0x0C LongString  u32 length + UTF-8 bytes
//! ```
//!
//! The encoder switches String to LongString automatically when the
//! UTF-8 byte length exceeds 65535. The decoder reports exactly how many
//! bytes it consumed; malformed input fails without producing a partial
//! value and without consuming anything.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::AmfError;

use super::value::{AmfObject, AmfValue};

const MARKER_NUMBER: u8 = 0x00;
const MARKER_BOOLEAN: u8 = 0x01;
const MARKER_STRING: u8 = 0x02;
const MARKER_OBJECT: u8 = 0x03;
const MARKER_NULL: u8 = 0x05;
const MARKER_UNDEFINED: u8 = 0x06;
const MARKER_ECMA_ARRAY: u8 = 0x08;
const MARKER_OBJECT_END: u8 = 0x09;
const MARKER_LONG_STRING: u8 = 0x0C;

/// Encode a single value into `buf`.
pub fn encode_into(buf: &mut BytesMut, value: &AmfValue) {
    match value {
        AmfValue::Number(n) => {
            buf.put_u8(MARKER_NUMBER);
            buf.put_slice(&n.to_be_bytes());
        }
        AmfValue::Boolean(b) => {
            buf.put_u8(MARKER_BOOLEAN);
            buf.put_u8(u8::from(*b));
        }
        AmfValue::String(s) => {
            if s.len() > 0xFFFF {
                buf.put_u8(MARKER_LONG_STRING);
                buf.put_u32(s.len() as u32);
            } else {
                buf.put_u8(MARKER_STRING);
                buf.put_u16(s.len() as u16);
            }
            buf.put_slice(s.as_bytes());
        }
        AmfValue::Object(obj) => {
            buf.put_u8(MARKER_OBJECT);
            encode_object_body(buf, obj);
        }
        AmfValue::EcmaArray { associative_count, entries } => {
            buf.put_u8(MARKER_ECMA_ARRAY);
            buf.put_u32(*associative_count);
            encode_object_body(buf, entries);
        }
        AmfValue::Null => buf.put_u8(MARKER_NULL),
        AmfValue::Undefined => buf.put_u8(MARKER_UNDEFINED),
    }
}

fn encode_object_body(buf: &mut BytesMut, obj: &AmfObject) {
    for (key, value) in obj.iter() {
        buf.put_u16(key.len() as u16);
        buf.put_slice(key.as_bytes());
        encode_into(buf, value);
    }
    buf.put_u16(0); // "UTF-8-empty"
    buf.put_u8(MARKER_OBJECT_END);
}

/// Encode a single value.
pub fn encode(value: &AmfValue) -> Bytes {
    let mut buf = BytesMut::with_capacity(32);
    encode_into(&mut buf, value);
    buf.freeze()
}

/// Encode a sequence of values back to back, the layout of an AMF0
/// command or data message payload.
pub fn encode_all(values: &[AmfValue]) -> Bytes {
    let mut buf = BytesMut::with_capacity(64);
    for value in values {
        encode_into(&mut buf, value);
    }
    buf.freeze()
}

/// Decode one value from the front of `data`.
///
/// Returns the value and the exact number of bytes consumed.
pub fn decode(data: &[u8]) -> Result<(AmfValue, usize), AmfError> {
    if data.is_empty() {
        return Err(AmfError::UnexpectedEof);
    }
    let marker = data[0];
    let (value, len) = decode_body(marker, &data[1..])?;
    Ok((value, 1 + len))
}

/// Decode values until `data` is exhausted.
pub fn decode_all(data: &[u8]) -> Result<Vec<AmfValue>, AmfError> {
    let mut values = Vec::new();
    let mut off = 0;
    while off < data.len() {
        let (value, consumed) = decode(&data[off..])?;
        values.push(value);
        off += consumed;
    }
    Ok(values)
}

fn decode_body(marker: u8, data: &[u8]) -> Result<(AmfValue, usize), AmfError> {
    match marker {
        MARKER_NUMBER => {
            let bytes = take(data, 0, 8)?;
            let n = f64::from_be_bytes(bytes.try_into().expect("8 bytes"));
            Ok((AmfValue::Number(n), 8))
        }
        MARKER_BOOLEAN => {
            let bytes = take(data, 0, 1)?;
            Ok((AmfValue::Boolean(bytes[0] != 0), 1))
        }
        MARKER_STRING => {
            let (s, len) = decode_key(data)?;
            Ok((AmfValue::String(s), len))
        }
        MARKER_LONG_STRING => {
            let len_bytes = take(data, 0, 4)?;
            let len = u32::from_be_bytes(len_bytes.try_into().expect("4 bytes")) as usize;
            let bytes = take(data, 4, len)?;
            let s = std::str::from_utf8(bytes).map_err(|_| AmfError::InvalidUtf8)?;
            Ok((AmfValue::String(s.to_string()), 4 + len))
        }
        MARKER_OBJECT => {
            let (obj, len) = decode_object_body(data)?;
            Ok((AmfValue::Object(obj), len))
        }
        MARKER_ECMA_ARRAY => {
            let count_bytes = take(data, 0, 4)?;
            let associative_count = u32::from_be_bytes(count_bytes.try_into().expect("4 bytes"));
            let (entries, len) = decode_object_body(&data[4..])?;
            Ok((AmfValue::EcmaArray { associative_count, entries }, 4 + len))
        }
        MARKER_NULL => Ok((AmfValue::Null, 0)),
        MARKER_UNDEFINED => Ok((AmfValue::Undefined, 0)),
        other => Err(AmfError::UnknownMarker(other)),
    }
}

fn decode_object_body(data: &[u8]) -> Result<(AmfObject, usize), AmfError> {
    let mut obj = AmfObject::new();
    let mut off = 0;
    loop {
        let (key, key_len) = decode_key(&data[off.min(data.len())..])?;
        off += key_len;

        // The end marker follows the empty key; checking the byte is
        // unambiguous because 0x09 is not a value marker.
        let next = *take(data, off, 1)?.first().expect("1 byte");
        if next == MARKER_OBJECT_END {
            off += 1;
            return Ok((obj, off));
        }

        let (value, value_len) = decode_body(next, &data[off + 1..])?;
        off += 1 + value_len;
        obj.insert(key, value);
    }
}

fn decode_key(data: &[u8]) -> Result<(String, usize), AmfError> {
    let len_bytes = take(data, 0, 2)?;
    let len = u16::from_be_bytes(len_bytes.try_into().expect("2 bytes")) as usize;
    let bytes = take(data, 2, len)?;
    let s = std::str::from_utf8(bytes).map_err(|_| AmfError::InvalidUtf8)?;
    Ok((s.to_string(), 2 + len))
}

fn take(data: &[u8], off: usize, len: usize) -> Result<&[u8], AmfError> {
    if data.len() < off + len {
        return Err(AmfError::UnexpectedEof);
    }
    Ok(&data[off..off + len])
}
