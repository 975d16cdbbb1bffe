//! AMF0 encoder and decoder
//!
//! AMF0 is the original Action Message Format used by RTMP command and data
//! messages.
//!
//! Type Markers:
//! ```text
//! 0x00 - Number (IEEE 754 double)
//! 0x01 - Boolean
//! 0x02 - String (UTF-8, 16-bit length prefix)
//! 0x03 - Object (key-value pairs until 0x000009)
//! 0x05 - Null
//! 0x06 - Undefined
//! 0x08 - ECMA Array (associative array with count hint)
//! 0x09 - Object End (0x000009 sequence)
//! 0x0A - Strict Array (dense array)
//! 0x0B - Date (double + timezone)
//! 0x0C - Long String (UTF-8, 32-bit length prefix)
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::value::{Amf0Object, AmfValue};
use crate::error::AmfError;

const MARKER_NUMBER: u8 = 0x00;
const MARKER_BOOLEAN: u8 = 0x01;
const MARKER_STRING: u8 = 0x02;
const MARKER_OBJECT: u8 = 0x03;
const MARKER_NULL: u8 = 0x05;
const MARKER_UNDEFINED: u8 = 0x06;
const MARKER_ECMA_ARRAY: u8 = 0x08;
const MARKER_OBJECT_END: u8 = 0x09;
const MARKER_STRICT_ARRAY: u8 = 0x0A;
const MARKER_DATE: u8 = 0x0B;
const MARKER_LONG_STRING: u8 = 0x0C;

/// Decode a single AMF0 value from the buffer
pub fn read_any(buf: &mut Bytes) -> Result<AmfValue, AmfError> {
    if buf.is_empty() {
        return Err(AmfError::UnexpectedEof);
    }

    let marker = buf.get_u8();
    read_value(marker, buf)
}

/// Decode all values from the buffer until exhausted
pub fn read_all(buf: &mut Bytes) -> Result<Vec<AmfValue>, AmfError> {
    let mut values = Vec::new();
    while buf.has_remaining() {
        values.push(read_any(buf)?);
    }
    Ok(values)
}

/// Decode a string; fails on any other marker
pub fn read_string(buf: &mut Bytes) -> Result<String, AmfError> {
    match expect_marker(buf, MARKER_STRING)? {
        MARKER_LONG_STRING => read_utf8_long(buf),
        _ => read_utf8(buf),
    }
}

/// Decode a number; fails on any other marker
pub fn read_number(buf: &mut Bytes) -> Result<f64, AmfError> {
    expect_marker(buf, MARKER_NUMBER)?;
    if buf.remaining() < 8 {
        return Err(AmfError::UnexpectedEof);
    }
    Ok(buf.get_f64())
}

/// Decode a boolean; fails on any other marker
pub fn read_boolean(buf: &mut Bytes) -> Result<bool, AmfError> {
    expect_marker(buf, MARKER_BOOLEAN)?;
    if buf.is_empty() {
        return Err(AmfError::UnexpectedEof);
    }
    Ok(buf.get_u8() != 0)
}

/// Decode a null; fails on any other marker
pub fn read_null(buf: &mut Bytes) -> Result<(), AmfError> {
    expect_marker(buf, MARKER_NULL)?;
    Ok(())
}

/// Decode an undefined; fails on any other marker
pub fn read_undefined(buf: &mut Bytes) -> Result<(), AmfError> {
    expect_marker(buf, MARKER_UNDEFINED)?;
    Ok(())
}

/// Decode an object; fails on any other marker
pub fn read_object(buf: &mut Bytes) -> Result<Amf0Object, AmfError> {
    expect_marker(buf, MARKER_OBJECT)?;
    read_properties(buf)
}

// Long strings satisfy read_string; everything else must match exactly.
fn expect_marker(buf: &mut Bytes, expected: u8) -> Result<u8, AmfError> {
    if buf.is_empty() {
        return Err(AmfError::UnexpectedEof);
    }
    let marker = buf.get_u8();
    if marker != expected && !(expected == MARKER_STRING && marker == MARKER_LONG_STRING) {
        return Err(AmfError::MarkerMismatch { expected, actual: marker });
    }
    Ok(marker)
}

fn read_value(marker: u8, buf: &mut Bytes) -> Result<AmfValue, AmfError> {
    match marker {
        MARKER_NUMBER => {
            if buf.remaining() < 8 {
                return Err(AmfError::UnexpectedEof);
            }
            Ok(AmfValue::Number(buf.get_f64()))
        }
        MARKER_BOOLEAN => {
            if buf.is_empty() {
                return Err(AmfError::UnexpectedEof);
            }
            Ok(AmfValue::Boolean(buf.get_u8() != 0))
        }
        MARKER_STRING => Ok(AmfValue::String(read_utf8(buf)?)),
        MARKER_LONG_STRING => Ok(AmfValue::String(read_utf8_long(buf)?)),
        MARKER_OBJECT => Ok(AmfValue::Object(read_properties(buf)?)),
        MARKER_NULL => Ok(AmfValue::Null),
        MARKER_UNDEFINED => Ok(AmfValue::Undefined),
        MARKER_ECMA_ARRAY => {
            if buf.remaining() < 4 {
                return Err(AmfError::UnexpectedEof);
            }
            // count is a hint only; properties still end with 0x000009
            let _count = buf.get_u32();
            Ok(AmfValue::EcmaArray(read_properties(buf)?))
        }
        MARKER_STRICT_ARRAY => {
            if buf.remaining() < 4 {
                return Err(AmfError::UnexpectedEof);
            }
            let count = buf.get_u32() as usize;
            let mut elements = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                elements.push(read_any(buf)?);
            }
            Ok(AmfValue::StrictArray(elements))
        }
        MARKER_DATE => {
            if buf.remaining() < 10 {
                return Err(AmfError::UnexpectedEof);
            }
            let timestamp = buf.get_f64();
            let timezone = buf.get_i16();
            Ok(AmfValue::Date { timestamp, timezone })
        }
        _ => Err(AmfError::UnknownMarker(marker)),
    }
}

fn read_properties(buf: &mut Bytes) -> Result<Amf0Object, AmfError> {
    let mut object = Amf0Object::new();

    loop {
        let key = read_utf8(buf)?;

        if key.is_empty() {
            if buf.is_empty() {
                return Err(AmfError::UnexpectedEof);
            }
            if buf.get_u8() != MARKER_OBJECT_END {
                return Err(AmfError::InvalidObjectEnd);
            }
            break;
        }

        let value = read_any(buf)?;
        object.set(key, value);
    }

    Ok(object)
}

/// Read a UTF-8 string body with a 16-bit length prefix (no marker)
fn read_utf8(buf: &mut Bytes) -> Result<String, AmfError> {
    if buf.remaining() < 2 {
        return Err(AmfError::UnexpectedEof);
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(AmfError::UnexpectedEof);
    }
    let bytes = buf.copy_to_bytes(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| AmfError::InvalidUtf8)
}

/// Read a UTF-8 string body with a 32-bit length prefix (no marker)
fn read_utf8_long(buf: &mut Bytes) -> Result<String, AmfError> {
    if buf.remaining() < 4 {
        return Err(AmfError::UnexpectedEof);
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(AmfError::UnexpectedEof);
    }
    let bytes = buf.copy_to_bytes(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| AmfError::InvalidUtf8)
}

/// Serialized size of a value, marker included
pub fn size_of(value: &AmfValue) -> usize {
    match value {
        AmfValue::Number(_) => 1 + 8,
        AmfValue::Boolean(_) => 1 + 1,
        AmfValue::String(s) => size_of_string(s),
        AmfValue::Object(o) => 1 + size_of_properties(o),
        AmfValue::Null | AmfValue::Undefined => 1,
        AmfValue::EcmaArray(o) => 1 + 4 + size_of_properties(o),
        AmfValue::StrictArray(elements) => {
            1 + 4 + elements.iter().map(size_of).sum::<usize>()
        }
        AmfValue::Date { .. } => 1 + 8 + 2,
    }
}

/// Serialized size of a string value, marker included
pub fn size_of_string(s: &str) -> usize {
    if s.len() > 0xFFFF {
        1 + 4 + s.len()
    } else {
        1 + 2 + s.len()
    }
}

/// Serialized size of `1 + 8` bytes for a number value
pub const NUMBER_SIZE: usize = 9;

/// Serialized size of the one-byte null value
pub const NULL_SIZE: usize = 1;

/// Serialized size of the one-byte undefined value
pub const UNDEFINED_SIZE: usize = 1;

fn size_of_properties(object: &Amf0Object) -> usize {
    let props: usize = object
        .iter()
        .map(|(k, v)| 2 + k.len() + size_of(v))
        .sum();
    props + 3 // 0x00 0x00 0x09
}

/// Encode a single AMF0 value
pub fn write_any(buf: &mut BytesMut, value: &AmfValue) {
    match value {
        AmfValue::Number(n) => write_number(buf, *n),
        AmfValue::Boolean(b) => write_boolean(buf, *b),
        AmfValue::String(s) => write_string(buf, s),
        AmfValue::Object(o) => {
            buf.put_u8(MARKER_OBJECT);
            write_properties(buf, o);
        }
        AmfValue::Null => write_null(buf),
        AmfValue::Undefined => write_undefined(buf),
        AmfValue::EcmaArray(o) => {
            buf.put_u8(MARKER_ECMA_ARRAY);
            buf.put_u32(o.len() as u32);
            write_properties(buf, o);
        }
        AmfValue::StrictArray(elements) => {
            buf.put_u8(MARKER_STRICT_ARRAY);
            buf.put_u32(elements.len() as u32);
            for elem in elements {
                write_any(buf, elem);
            }
        }
        AmfValue::Date { timestamp, timezone } => {
            buf.put_u8(MARKER_DATE);
            buf.put_f64(*timestamp);
            buf.put_i16(*timezone);
        }
    }
}

/// Encode a string value
pub fn write_string(buf: &mut BytesMut, s: &str) {
    if s.len() > 0xFFFF {
        buf.put_u8(MARKER_LONG_STRING);
        buf.put_u32(s.len() as u32);
    } else {
        buf.put_u8(MARKER_STRING);
        buf.put_u16(s.len() as u16);
    }
    buf.put_slice(s.as_bytes());
}

/// Encode a number value
pub fn write_number(buf: &mut BytesMut, n: f64) {
    buf.put_u8(MARKER_NUMBER);
    buf.put_f64(n);
}

/// Encode a boolean value
pub fn write_boolean(buf: &mut BytesMut, b: bool) {
    buf.put_u8(MARKER_BOOLEAN);
    buf.put_u8(if b { 1 } else { 0 });
}

/// Encode a null value
pub fn write_null(buf: &mut BytesMut) {
    buf.put_u8(MARKER_NULL);
}

/// Encode an undefined value
pub fn write_undefined(buf: &mut BytesMut) {
    buf.put_u8(MARKER_UNDEFINED);
}

/// Encode an object value
pub fn write_object(buf: &mut BytesMut, object: &Amf0Object) {
    buf.put_u8(MARKER_OBJECT);
    write_properties(buf, object);
}

fn write_properties(buf: &mut BytesMut, object: &Amf0Object) {
    for (key, value) in object.iter() {
        buf.put_u16(key.len() as u16);
        buf.put_slice(key.as_bytes());
        write_any(buf, value);
    }
    buf.put_u16(0);
    buf.put_u8(MARKER_OBJECT_END);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: &AmfValue) -> AmfValue {
        let mut buf = BytesMut::new();
        write_any(&mut buf, value);
        assert_eq!(buf.len(), size_of(value), "size_of must match encoding");
        let mut bytes = buf.freeze();
        let decoded = read_any(&mut bytes).unwrap();
        assert!(bytes.is_empty(), "decoder must consume the full encoding");
        decoded
    }

    #[test]
    fn test_scalar_roundtrips() {
        assert_eq!(roundtrip(&AmfValue::Number(42.5)), AmfValue::Number(42.5));
        assert_eq!(roundtrip(&AmfValue::Boolean(true)), AmfValue::Boolean(true));
        assert_eq!(
            roundtrip(&AmfValue::String("hello world".into())),
            AmfValue::String("hello world".into())
        );
        assert_eq!(roundtrip(&AmfValue::Null), AmfValue::Null);
        assert_eq!(roundtrip(&AmfValue::Undefined), AmfValue::Undefined);
        assert_eq!(
            roundtrip(&AmfValue::Date { timestamp: 1234.0, timezone: 0 }),
            AmfValue::Date { timestamp: 1234.0, timezone: 0 }
        );
    }

    #[test]
    fn test_object_roundtrip_keeps_order() {
        let mut obj = Amf0Object::new();
        obj.set("name", "test");
        obj.set("value", 123.0);
        obj.set("flag", true);

        let decoded = roundtrip(&AmfValue::Object(obj.clone()));
        assert_eq!(decoded, AmfValue::Object(obj));
    }

    #[test]
    fn test_ecma_array_roundtrip() {
        let mut obj = Amf0Object::new();
        obj.set("duration", 0.0);
        obj.set("width", 1920.0);
        obj.set("height", 1080.0);

        let decoded = roundtrip(&AmfValue::EcmaArray(obj.clone()));
        assert_eq!(decoded, AmfValue::EcmaArray(obj));
    }

    #[test]
    fn test_strict_array_roundtrip() {
        let value = AmfValue::StrictArray(vec![
            AmfValue::Number(1.0),
            AmfValue::String("two".into()),
            AmfValue::Boolean(true),
        ]);
        assert_eq!(roundtrip(&value), value);
    }

    #[test]
    fn test_long_string() {
        let long = "x".repeat(70000);
        let value = AmfValue::String(long.clone());
        assert_eq!(roundtrip(&value), AmfValue::String(long));
    }

    #[test]
    fn test_typed_reader_mismatch() {
        let mut buf = BytesMut::new();
        write_number(&mut buf, 1.0);
        let mut bytes = buf.freeze();

        let err = read_string(&mut bytes).unwrap_err();
        assert!(matches!(err, AmfError::MarkerMismatch { expected: 0x02, actual: 0x00 }));
    }

    #[test]
    fn test_typed_readers() {
        let mut buf = BytesMut::new();
        write_string(&mut buf, "connect");
        write_number(&mut buf, 1.0);
        write_null(&mut buf);
        write_undefined(&mut buf);
        let mut bytes = buf.freeze();

        assert_eq!(read_string(&mut bytes).unwrap(), "connect");
        assert_eq!(read_number(&mut bytes).unwrap(), 1.0);
        read_null(&mut bytes).unwrap();
        read_undefined(&mut bytes).unwrap();
        assert!(bytes.is_empty());
    }

    #[test]
    fn test_truncated_input() {
        let mut bytes = Bytes::from_static(&[0x00, 0x40, 0x45]); // number cut short
        assert!(matches!(read_any(&mut bytes), Err(AmfError::UnexpectedEof)));

        let mut bytes = Bytes::from_static(&[0x02, 0x00, 0x10, b'a']); // string cut short
        assert!(matches!(read_any(&mut bytes), Err(AmfError::UnexpectedEof)));

        let mut bytes = Bytes::new();
        assert!(matches!(read_any(&mut bytes), Err(AmfError::UnexpectedEof)));
    }

    #[test]
    fn test_unknown_marker() {
        let mut bytes = Bytes::from_static(&[0x0D]);
        assert!(matches!(read_any(&mut bytes), Err(AmfError::UnknownMarker(0x0D))));
    }

    #[test]
    fn test_read_all() {
        let mut buf = BytesMut::new();
        write_string(&mut buf, "onMetaData");
        let mut obj = Amf0Object::new();
        obj.set("framerate", 25.0);
        write_any(&mut buf, &AmfValue::EcmaArray(obj));
        let mut bytes = buf.freeze();

        let values = read_all(&mut bytes).unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(values[0].as_str(), Some("onMetaData"));
        assert_eq!(values[1].get_number("framerate"), Some(25.0));
    }
}
