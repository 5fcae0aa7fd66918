//! External Term Format (`encoding=etf`).
//!
//! Terms are mapped onto `serde_json::Value` so the rest of the gateway sees
//! one payload shape regardless of encoding:
//!
//! | Term | Value |
//! |---|---|
//! | atom `nil` / `null` | `Null` |
//! | atom `true` / `false` | `Bool` |
//! | other atoms, binaries | `String` |
//! | small int, int, small/large big (64-bit) | `Number` |
//! | float, new float | `Number` (f64) |
//! | list, nil, tuple, string | `Array` |
//! | map | `Object` (keys stringified) |

use std::io::{self, Read};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde_json::{Map, Number, Value};
use thiserror::Error;

use super::{CodecError, EncodedFrame, PayloadCodec};
use crate::{configs::Encoding, gateway::payload::GatewayPayload};

const FORMAT_VERSION: u8 = 131;

const NEW_FLOAT_EXT: u8 = 70;
const SMALL_INTEGER_EXT: u8 = 97;
const INTEGER_EXT: u8 = 98;
const FLOAT_EXT: u8 = 99;
const ATOM_EXT: u8 = 100;
const SMALL_TUPLE_EXT: u8 = 104;
const LARGE_TUPLE_EXT: u8 = 105;
const NIL_EXT: u8 = 106;
const STRING_EXT: u8 = 107;
const LIST_EXT: u8 = 108;
const BINARY_EXT: u8 = 109;
const SMALL_BIG_EXT: u8 = 110;
const LARGE_BIG_EXT: u8 = 111;
const SMALL_ATOM_EXT: u8 = 115;
const MAP_EXT: u8 = 116;
const ATOM_UTF8_EXT: u8 = 118;
const SMALL_ATOM_UTF8_EXT: u8 = 119;

const MAX_DEPTH: usize = 128;

#[derive(Debug, Error)]
pub enum EtfError {
    #[error("unsupported format version {0}")]
    Version(u8),
    #[error("unsupported term tag {0}")]
    UnsupportedTag(u8),
    #[error("unexpected end of input")]
    Truncated,
    #[error("{0} trailing bytes after the term")]
    Trailing(usize),
    #[error("integer does not fit in 64 bits")]
    IntegerOverflow,
    #[error("invalid float literal")]
    InvalidFloat,
    #[error("invalid map key")]
    InvalidKey,
    #[error("terms nested deeper than {MAX_DEPTH}")]
    TooDeep,
    #[error("invalid UTF-8 in binary")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error(transparent)]
    Io(io::Error),
}

impl From<io::Error> for EtfError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            Self::Truncated
        } else {
            Self::Io(e)
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct EtfCodec;

impl PayloadCodec for EtfCodec {
    fn encoding(&self) -> Encoding {
        Encoding::Etf
    }

    fn decode_slice(&self, bytes: &[u8]) -> Result<GatewayPayload, CodecError> {
        Ok(serde_json::from_value(decode(bytes)?)?)
    }

    fn encode(&self, payload: &GatewayPayload) -> Result<EncodedFrame, CodecError> {
        let value = serde_json::to_value(payload)?;
        Ok(EncodedFrame::Binary(encode(&value)?))
    }
}

pub fn decode(bytes: &[u8]) -> Result<Value, EtfError> {
    let mut input = bytes;
    let version = input.read_u8()?;
    if version != FORMAT_VERSION {
        return Err(EtfError::Version(version));
    }
    let value = read_term(&mut input, 0)?;
    if !input.is_empty() {
        return Err(EtfError::Trailing(input.len()));
    }
    Ok(value)
}

fn read_bytes(input: &mut &[u8], len: usize) -> Result<Vec<u8>, EtfError> {
    if input.len() < len {
        return Err(EtfError::Truncated);
    }
    let mut out = vec![0u8; len];
    input.read_exact(&mut out)?;
    Ok(out)
}

fn atom_value(name: String) -> Value {
    match name.as_str() {
        "nil" | "null" => Value::Null,
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::String(name),
    }
}

fn latin1(bytes: Vec<u8>) -> String {
    bytes.into_iter().map(char::from).collect()
}

fn read_big(input: &mut &[u8], digits: usize) -> Result<Value, EtfError> {
    let negative = input.read_u8()? != 0;
    let raw = read_bytes(input, digits)?;
    if raw.iter().skip(8).any(|&b| b != 0) {
        return Err(EtfError::IntegerOverflow);
    }
    let magnitude = raw
        .iter()
        .take(8)
        .enumerate()
        .fold(0u64, |acc, (i, &b)| acc | (u64::from(b) << (8 * i)));

    if !negative {
        return Ok(Value::from(magnitude));
    }
    if magnitude > i64::MAX as u64 + 1 {
        return Err(EtfError::IntegerOverflow);
    }
    Ok(Value::from((magnitude as i64).wrapping_neg()))
}

fn read_array(input: &mut &[u8], len: usize, depth: usize) -> Result<Vec<Value>, EtfError> {
    let mut items = Vec::with_capacity(len.min(input.len()));
    for _ in 0..len {
        items.push(read_term(input, depth + 1)?);
    }
    Ok(items)
}

fn map_key(key: Value) -> Result<String, EtfError> {
    match key {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Null => Ok("nil".to_string()),
        _ => Err(EtfError::InvalidKey),
    }
}

fn read_term(input: &mut &[u8], depth: usize) -> Result<Value, EtfError> {
    if depth > MAX_DEPTH {
        return Err(EtfError::TooDeep);
    }

    let tag = input.read_u8()?;
    let value = match tag {
        SMALL_INTEGER_EXT => Value::from(input.read_u8()?),
        INTEGER_EXT => Value::from(input.read_i32::<BigEndian>()?),
        NEW_FLOAT_EXT => float_value(input.read_f64::<BigEndian>()?)?,
        FLOAT_EXT => {
            let raw = read_bytes(input, 31)?;
            let text = String::from_utf8(raw)?;
            let parsed = text
                .trim_end_matches('\0')
                .trim()
                .parse::<f64>()
                .map_err(|_| EtfError::InvalidFloat)?;
            float_value(parsed)?
        }
        ATOM_EXT => {
            let len = input.read_u16::<BigEndian>()? as usize;
            atom_value(latin1(read_bytes(input, len)?))
        }
        SMALL_ATOM_EXT => {
            let len = input.read_u8()? as usize;
            atom_value(latin1(read_bytes(input, len)?))
        }
        ATOM_UTF8_EXT => {
            let len = input.read_u16::<BigEndian>()? as usize;
            atom_value(String::from_utf8(read_bytes(input, len)?)?)
        }
        SMALL_ATOM_UTF8_EXT => {
            let len = input.read_u8()? as usize;
            atom_value(String::from_utf8(read_bytes(input, len)?)?)
        }
        SMALL_TUPLE_EXT => {
            let len = input.read_u8()? as usize;
            Value::Array(read_array(input, len, depth)?)
        }
        LARGE_TUPLE_EXT => {
            let len = input.read_u32::<BigEndian>()? as usize;
            Value::Array(read_array(input, len, depth)?)
        }
        NIL_EXT => Value::Array(Vec::new()),
        STRING_EXT => {
            let len = input.read_u16::<BigEndian>()? as usize;
            Value::Array(read_bytes(input, len)?.into_iter().map(Value::from).collect())
        }
        LIST_EXT => {
            let len = input.read_u32::<BigEndian>()? as usize;
            let mut items = read_array(input, len, depth)?;
            match read_term(input, depth + 1)? {
                Value::Array(tail) if tail.is_empty() => {}
                tail => items.push(tail),
            }
            Value::Array(items)
        }
        BINARY_EXT => {
            let len = input.read_u32::<BigEndian>()? as usize;
            Value::String(String::from_utf8(read_bytes(input, len)?)?)
        }
        SMALL_BIG_EXT => {
            let digits = input.read_u8()? as usize;
            read_big(input, digits)?
        }
        LARGE_BIG_EXT => {
            let digits = input.read_u32::<BigEndian>()? as usize;
            read_big(input, digits)?
        }
        MAP_EXT => {
            let arity = input.read_u32::<BigEndian>()? as usize;
            let mut map = Map::new();
            for _ in 0..arity {
                let key = map_key(read_term(input, depth + 1)?)?;
                let value = read_term(input, depth + 1)?;
                map.insert(key, value);
            }
            Value::Object(map)
        }
        other => return Err(EtfError::UnsupportedTag(other)),
    };
    Ok(value)
}

fn float_value(f: f64) -> Result<Value, EtfError> {
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or(EtfError::InvalidFloat)
}

pub fn encode(value: &Value) -> Result<Vec<u8>, EtfError> {
    let mut out = vec![FORMAT_VERSION];
    write_term(&mut out, value)?;
    Ok(out)
}

fn write_atom(out: &mut Vec<u8>, name: &str) -> Result<(), EtfError> {
    out.write_u8(SMALL_ATOM_UTF8_EXT)?;
    out.write_u8(name.len() as u8)?;
    out.extend_from_slice(name.as_bytes());
    Ok(())
}

fn write_small_big(out: &mut Vec<u8>, negative: bool, magnitude: u64) -> Result<(), EtfError> {
    let bytes = magnitude.to_le_bytes();
    let digits = 8 - (magnitude.leading_zeros() / 8) as usize;
    out.write_u8(SMALL_BIG_EXT)?;
    out.write_u8(digits as u8)?;
    out.write_u8(u8::from(negative))?;
    out.extend_from_slice(&bytes[..digits]);
    Ok(())
}

fn write_term(out: &mut Vec<u8>, value: &Value) -> Result<(), EtfError> {
    match value {
        Value::Null => write_atom(out, "nil")?,
        Value::Bool(b) => write_atom(out, if *b { "true" } else { "false" })?,
        Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                if u <= u64::from(u8::MAX) {
                    out.write_u8(SMALL_INTEGER_EXT)?;
                    out.write_u8(u as u8)?;
                } else if u <= i32::MAX as u64 {
                    out.write_u8(INTEGER_EXT)?;
                    out.write_i32::<BigEndian>(u as i32)?;
                } else {
                    write_small_big(out, false, u)?;
                }
            } else if let Some(i) = n.as_i64() {
                if i >= i64::from(i32::MIN) {
                    out.write_u8(INTEGER_EXT)?;
                    out.write_i32::<BigEndian>(i as i32)?;
                } else {
                    write_small_big(out, true, i.unsigned_abs())?;
                }
            } else {
                let f = n.as_f64().ok_or(EtfError::InvalidFloat)?;
                out.write_u8(NEW_FLOAT_EXT)?;
                out.write_f64::<BigEndian>(f)?;
            }
        }
        Value::String(s) => {
            out.write_u8(BINARY_EXT)?;
            out.write_u32::<BigEndian>(s.len() as u32)?;
            out.extend_from_slice(s.as_bytes());
        }
        Value::Array(items) => {
            if !items.is_empty() {
                out.write_u8(LIST_EXT)?;
                out.write_u32::<BigEndian>(items.len() as u32)?;
                for item in items {
                    write_term(out, item)?;
                }
            }
            out.write_u8(NIL_EXT)?;
        }
        Value::Object(map) => {
            out.write_u8(MAP_EXT)?;
            out.write_u32::<BigEndian>(map.len() as u32)?;
            for (key, item) in map {
                out.write_u8(BINARY_EXT)?;
                out.write_u32::<BigEndian>(key.len() as u32)?;
                out.extend_from_slice(key.as_bytes());
                write_term(out, item)?;
            }
        }
    }
    Ok(())
}
