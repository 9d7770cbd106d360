//! AMF0 primitives, limited to the types RTMP command messages need.

use bytes::{BufMut, BytesMut};

const MARKER_NUMBER: u8 = 0x00;
const MARKER_BOOLEAN: u8 = 0x01;
const MARKER_STRING: u8 = 0x02;
const MARKER_OBJECT: u8 = 0x03;
const MARKER_NULL: u8 = 0x05;
const MARKER_UNDEFINED: u8 = 0x06;
const MARKER_ECMA_ARRAY: u8 = 0x08;
const MARKER_OBJECT_END: u8 = 0x09;

#[derive(Debug, thiserror::Error)]
pub enum AmfError {
    #[error("Unexpected end of AMF data")]
    UnexpectedEof,

    #[error("Unsupported AMF marker 0x{0:02x}")]
    UnsupportedMarker(u8),

    #[error("AMF string is not valid UTF-8")]
    InvalidString,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Amf0Value {
    Number(f64),
    Boolean(bool),
    String(String),
    Object(Vec<(String, Amf0Value)>),
    Null,
}

impl Amf0Value {
    pub fn write(&self, out: &mut BytesMut) {
        match self {
            Amf0Value::Number(n) => {
                out.put_u8(MARKER_NUMBER);
                out.put_f64(*n);
            }
            Amf0Value::Boolean(b) => {
                out.put_u8(MARKER_BOOLEAN);
                out.put_u8(*b as u8);
            }
            Amf0Value::String(s) => {
                out.put_u8(MARKER_STRING);
                put_utf8(out, s);
            }
            Amf0Value::Object(fields) => {
                out.put_u8(MARKER_OBJECT);
                for (key, value) in fields {
                    put_utf8(out, key);
                    value.write(out);
                }
                out.put_u16(0);
                out.put_u8(MARKER_OBJECT_END);
            }
            Amf0Value::Null => out.put_u8(MARKER_NULL),
        }
    }

    /// Reads one value, advancing `buf` past it. Undefined decodes as `Null`;
    /// ECMA arrays decode as objects so server replies can be skipped over.
    pub fn read(buf: &mut &[u8]) -> Result<Amf0Value, AmfError> {
        let marker = take_u8(buf)?;

        match marker {
            MARKER_NUMBER => {
                let raw = take(buf, 8)?;
                Ok(Amf0Value::Number(f64::from_be_bytes(
                    raw.try_into().unwrap(),
                )))
            }
            MARKER_BOOLEAN => Ok(Amf0Value::Boolean(take_u8(buf)? != 0)),
            MARKER_STRING => Ok(Amf0Value::String(take_utf8(buf)?)),
            MARKER_OBJECT => Ok(Amf0Value::Object(read_fields(buf)?)),
            MARKER_ECMA_ARRAY => {
                take(buf, 4)?; // approximate length, not trusted
                Ok(Amf0Value::Object(read_fields(buf)?))
            }
            MARKER_NULL | MARKER_UNDEFINED => Ok(Amf0Value::Null),
            other => Err(AmfError::UnsupportedMarker(other)),
        }
    }

    /// Reads every value left in `buf`.
    pub fn read_all(mut buf: &[u8]) -> Result<Vec<Amf0Value>, AmfError> {
        let mut values = Vec::new();
        while !buf.is_empty() {
            values.push(Amf0Value::read(&mut buf)?);
        }
        Ok(values)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Amf0Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Looks up an object field by key.
    pub fn field(&self, name: &str) -> Option<&Amf0Value> {
        match self {
            Amf0Value::Object(fields) => fields
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value),
            _ => None,
        }
    }
}

fn read_fields(buf: &mut &[u8]) -> Result<Vec<(String, Amf0Value)>, AmfError> {
    let mut fields = Vec::new();

    loop {
        let key = take_utf8(buf)?;
        if key.is_empty() {
            let marker = take_u8(buf)?;
            if marker == MARKER_OBJECT_END {
                return Ok(fields);
            }
            return Err(AmfError::UnsupportedMarker(marker));
        }

        fields.push((key, Amf0Value::read(buf)?));
    }
}

fn put_utf8(out: &mut BytesMut, s: &str) {
    out.put_u16(s.len() as u16);
    out.put_slice(s.as_bytes());
}

fn take<'a>(buf: &mut &'a [u8], n: usize) -> Result<&'a [u8], AmfError> {
    if buf.len() < n {
        return Err(AmfError::UnexpectedEof);
    }
    let (head, tail) = buf.split_at(n);
    *buf = tail;
    Ok(head)
}

fn take_u8(buf: &mut &[u8]) -> Result<u8, AmfError> {
    Ok(take(buf, 1)?[0])
}

fn take_utf8(buf: &mut &[u8]) -> Result<String, AmfError> {
    let len = u16::from_be_bytes(take(buf, 2)?.try_into().unwrap()) as usize;
    let raw = take(buf, len)?;
    String::from_utf8(raw.to_vec()).map_err(|_| AmfError::InvalidString)
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;

    fn encode(value: &Amf0Value) -> Vec<u8> {
        let mut out = BytesMut::new();
        value.write(&mut out);
        out.to_vec()
    }

    #[test]
    fn writes_primitives() {
        assert_eq!(
            vec![0x00, 0x3F, 0xF0, 0, 0, 0, 0, 0, 0],
            encode(&Amf0Value::Number(1.0))
        );
        assert_eq!(vec![0x01, 0x01], encode(&Amf0Value::Boolean(true)));
        assert_eq!(
            vec![0x02, 0x00, 0x03, b'a', b'p', b'p'],
            encode(&Amf0Value::String("app".into()))
        );
        assert_eq!(vec![0x05], encode(&Amf0Value::Null));
    }

    #[test]
    fn object_is_terminated() {
        let object = Amf0Value::Object(vec![(
            "app".to_string(),
            Amf0Value::String("live".to_string()),
        )]);

        let bytes = encode(&object);
        assert_eq!(0x03, bytes[0]);
        assert_eq!(&[0x00, 0x00, 0x09], &bytes[bytes.len() - 3..]);
    }

    #[test]
    fn round_trip_command() {
        let values = vec![
            Amf0Value::String("connect".to_string()),
            Amf0Value::Number(1.0),
            Amf0Value::Object(vec![
                ("app".to_string(), Amf0Value::String("live".to_string())),
                ("fpad".to_string(), Amf0Value::Boolean(false)),
                ("audioCodecs".to_string(), Amf0Value::Number(4071.0)),
            ]),
            Amf0Value::Null,
        ];

        let mut out = BytesMut::new();
        for value in &values {
            value.write(&mut out);
        }

        assert_eq!(values, Amf0Value::read_all(&out).unwrap());
    }

    #[test]
    fn reads_ecma_array_as_object() {
        let mut bytes = vec![0x08, 0, 0, 0, 1];
        bytes.extend_from_slice(&[0x00, 0x04]);
        bytes.extend_from_slice(b"code");
        bytes.extend_from_slice(&[0x02, 0x00, 0x02, b'o', b'k']);
        bytes.extend_from_slice(&[0x00, 0x00, 0x09]);

        let value = Amf0Value::read(&mut &bytes[..]).unwrap();
        assert_eq!(Some("ok"), value.field("code").and_then(|v| v.as_str()));
    }

    #[test]
    fn rejects_unknown_marker() {
        let bytes = [0x0B, 0x00];
        assert_matches!(
            Amf0Value::read(&mut &bytes[..]),
            Err(AmfError::UnsupportedMarker(0x0B))
        );
    }

    #[test]
    fn truncated_input() {
        let bytes = [0x00, 0x3F, 0xF0];
        assert_matches!(
            Amf0Value::read(&mut &bytes[..]),
            Err(AmfError::UnexpectedEof)
        );
    }
}
