//! Data section encoding and decoding
//!
//! Implements the MaxMind DB data type specification: a control byte whose
//! top three bits carry the type and whose low five bits carry the payload
//! size, optional extended type byte, optional size extension bytes, then
//! the payload itself.
//!
//! # Supported Types
//!
//! - **Pointer** (1): reference to another item in the same section, resolved while decoding
//! - **String** (2): UTF-8 text data
//! - **Double** (3): 64-bit floating point (IEEE 754)
//! - **Bytes** (4): raw byte arrays
//! - **Uint16** (5), **Uint32** (6), **Uint64** (9), **Uint128** (10)
//! - **Map** (7): key-value pairs (string keys)
//! - **Int32** (8): signed 32-bit integers
//! - **Array** (11): ordered lists of values
//! - **Bool** (14): boolean values (no payload)
//! - **Float** (15): 32-bit floating point (IEEE 754)
//!
//! Types 8 and above are "extended": the control byte type is 0 and the
//! following byte holds `type - 7`.
//!
//! See: https://maxmind.github.io/MaxMind-DB/

use crate::mmdb::MmdbError;
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};
use std::collections::HashMap;

/// Data value stored in an MMDB data section
///
/// Pointers never appear here: the decoder resolves them in place.
#[derive(Debug, Clone, PartialEq)]
pub enum DataValue {
    /// UTF-8 string
    String(String),
    /// IEEE 754 double precision float
    Double(f64),
    /// Raw byte array
    Bytes(Vec<u8>),
    /// Unsigned 16-bit integer
    Uint16(u16),
    /// Unsigned 32-bit integer
    Uint32(u32),
    /// Key-value map in the order the keys were encountered
    Map(Vec<(String, DataValue)>),
    /// Signed 32-bit integer
    Int32(i32),
    /// Unsigned 64-bit integer
    Uint64(u64),
    /// Unsigned 128-bit integer
    Uint128(u128),
    /// Array of values
    Array(Vec<DataValue>),
    /// Boolean value
    Bool(bool),
    /// IEEE 754 single precision float
    Float(f32),
}

impl DataValue {
    /// Build a map value from `(key, value)` pairs, keeping their order
    pub fn map<K: Into<String>>(pairs: impl IntoIterator<Item = (K, DataValue)>) -> Self {
        DataValue::Map(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Shorthand for `DataValue::String`
    pub fn string(s: impl Into<String>) -> Self {
        DataValue::String(s.into())
    }

    /// Get a map entry by key (first match wins)
    pub fn get(&self, key: &str) -> Option<&DataValue> {
        match self {
            DataValue::Map(pairs) => pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    /// Follow a path of map keys, e.g. `["country", "iso_code"]`
    pub fn get_path(&self, path: &[&str]) -> Option<&DataValue> {
        path.iter().try_fold(self, |value, key| value.get(key))
    }

    /// String contents, if this is a string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            DataValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Any unsigned (or non-negative signed) integer that fits in a `u64`
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            DataValue::Uint16(n) => Some(*n as u64),
            DataValue::Uint32(n) => Some(*n as u64),
            DataValue::Uint64(n) => Some(*n),
            DataValue::Uint128(n) => u64::try_from(*n).ok(),
            DataValue::Int32(n) => u64::try_from(*n).ok(),
            _ => None,
        }
    }
}

impl Serialize for DataValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            DataValue::String(s) => serializer.serialize_str(s),
            DataValue::Double(d) => serializer.serialize_f64(*d),
            DataValue::Bytes(b) => {
                let mut seq = serializer.serialize_seq(Some(b.len()))?;
                for byte in b {
                    seq.serialize_element(byte)?;
                }
                seq.end()
            }
            DataValue::Uint16(n) => serializer.serialize_u16(*n),
            DataValue::Uint32(n) => serializer.serialize_u32(*n),
            DataValue::Map(pairs) => {
                let mut map = serializer.serialize_map(Some(pairs.len()))?;
                for (k, v) in pairs {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
            DataValue::Int32(n) => serializer.serialize_i32(*n),
            DataValue::Uint64(n) => serializer.serialize_u64(*n),
            DataValue::Uint128(n) => serializer.serialize_u128(*n),
            DataValue::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            DataValue::Bool(b) => serializer.serialize_bool(*b),
            DataValue::Float(f) => serializer.serialize_f32(*f),
        }
    }
}

const TYPE_EXTENDED: u8 = 0;
const TYPE_POINTER: u8 = 1;
const TYPE_STRING: u8 = 2;
const TYPE_DOUBLE: u8 = 3;
const TYPE_BYTES: u8 = 4;
const TYPE_UINT16: u8 = 5;
const TYPE_UINT32: u8 = 6;
const TYPE_MAP: u8 = 7;
const TYPE_INT32: u8 = 8;
const TYPE_UINT64: u8 = 9;
const TYPE_UINT128: u8 = 10;
const TYPE_ARRAY: u8 = 11;
const TYPE_DATA_CACHE: u8 = 12;
const TYPE_END_MARKER: u8 = 13;
const TYPE_BOOL: u8 = 14;
const TYPE_FLOAT: u8 = 15;

/// Bounds that keep decoding of hostile input finite
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeLimits {
    /// Maximum nesting of containers and pointer hops
    pub max_depth: usize,
    /// Maximum pointers followed while decoding one top-level value
    pub max_pointer_follows: usize,
}

impl Default for DecodeLimits {
    fn default() -> Self {
        Self {
            max_depth: 512,
            max_pointer_follows: 65_536,
        }
    }
}

/// Decode the value at `offset`, returning it with the number of bytes consumed
///
/// Pointers are resolved relative to the start of `bytes`. A pointer at
/// `offset` consumes only its own bytes.
pub fn decode(bytes: &[u8], offset: usize) -> Result<(DataValue, usize), MmdbError> {
    DataDecoder::new(bytes).decode_with_size(offset)
}

/// Data section decoder
///
/// Holds no mutable state; one decoder may be shared by many threads.
#[derive(Debug, Clone, Copy)]
pub struct DataDecoder<'a> {
    buffer: &'a [u8],
    limits: DecodeLimits,
}

/// Per-call bookkeeping
struct DecodeState {
    pointer_follows: usize,
}

impl<'a> DataDecoder<'a> {
    /// Create a decoder over a data section (or metadata section)
    pub fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            limits: DecodeLimits::default(),
        }
    }

    /// Replace the default decode limits
    pub fn with_limits(mut self, limits: DecodeLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Decode a value at the given offset
    pub fn decode(&self, offset: usize) -> Result<DataValue, MmdbError> {
        self.decode_with_size(offset).map(|(value, _)| value)
    }

    /// Decode a value and report how many bytes it occupies at `offset`
    pub fn decode_with_size(&self, offset: usize) -> Result<(DataValue, usize), MmdbError> {
        let mut state = DecodeState { pointer_follows: 0 };
        let mut cursor = offset;
        let value = self.decode_at(&mut cursor, 0, &mut state)?;
        Ok((value, cursor - offset))
    }

    fn decode_at(
        &self,
        cursor: &mut usize,
        depth: usize,
        state: &mut DecodeState,
    ) -> Result<DataValue, MmdbError> {
        if depth > self.limits.max_depth {
            return Err(MmdbError::corrupt(*cursor, "maximum nesting depth exceeded"));
        }

        let start = *cursor;
        let ctrl = self.read_byte(cursor)?;
        let type_id = self.read_type(ctrl, cursor)?;

        if type_id == TYPE_POINTER {
            let target = self.decode_pointer(cursor, ctrl)?;
            return self.follow_pointer(start, target, depth, state);
        }

        let size = self.decode_size(cursor, ctrl & 0x1F)?;

        match type_id {
            TYPE_STRING => {
                let bytes = self.take(cursor, size)?;
                let s = std::str::from_utf8(bytes)
                    .map_err(|_| MmdbError::corrupt(start, "invalid UTF-8 in string"))?;
                Ok(DataValue::String(s.to_string()))
            }
            TYPE_DOUBLE => {
                if size != 8 {
                    return Err(MmdbError::corrupt(start, format!("double of size {}", size)));
                }
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(self.take(cursor, 8)?);
                Ok(DataValue::Double(f64::from_be_bytes(bytes)))
            }
            TYPE_BYTES => Ok(DataValue::Bytes(self.take(cursor, size)?.to_vec())),
            TYPE_UINT16 => Ok(DataValue::Uint16(self.read_uint(cursor, size, 2)? as u16)),
            TYPE_UINT32 => Ok(DataValue::Uint32(self.read_uint(cursor, size, 4)? as u32)),
            TYPE_MAP => self.decode_map(cursor, size, depth, state),
            TYPE_INT32 => Ok(DataValue::Int32(self.read_uint(cursor, size, 4)? as u32 as i32)),
            TYPE_UINT64 => Ok(DataValue::Uint64(self.read_uint(cursor, size, 8)? as u64)),
            TYPE_UINT128 => Ok(DataValue::Uint128(self.read_uint(cursor, size, 16)?)),
            TYPE_ARRAY => self.decode_array(cursor, size, depth, state),
            TYPE_BOOL => match size {
                0 => Ok(DataValue::Bool(false)),
                1 => Ok(DataValue::Bool(true)),
                _ => Err(MmdbError::corrupt(start, format!("boolean of size {}", size))),
            },
            TYPE_FLOAT => {
                if size != 4 {
                    return Err(MmdbError::corrupt(start, format!("float of size {}", size)));
                }
                let mut bytes = [0u8; 4];
                bytes.copy_from_slice(self.take(cursor, 4)?);
                Ok(DataValue::Float(f32::from_be_bytes(bytes)))
            }
            TYPE_DATA_CACHE | TYPE_END_MARKER => Err(MmdbError::corrupt(
                start,
                format!("type {} is not valid in a data record", type_id),
            )),
            _ => Err(MmdbError::corrupt(start, format!("unknown type {}", type_id))),
        }
    }

    /// Resolve the type number, consuming the extended type byte if present
    fn read_type(&self, ctrl: u8, cursor: &mut usize) -> Result<u8, MmdbError> {
        let type_id = ctrl >> 5;
        if type_id != TYPE_EXTENDED {
            return Ok(type_id);
        }

        let at = *cursor;
        let ext = self.read_byte(cursor)?;
        let ext_type = (ext as u16) + 7;
        if ext_type < TYPE_INT32 as u16 || ext_type > TYPE_FLOAT as u16 {
            return Err(MmdbError::corrupt(
                at,
                format!("invalid extended type byte {:#04x}", ext),
            ));
        }
        Ok(ext_type as u8)
    }

    fn follow_pointer(
        &self,
        start: usize,
        target: usize,
        depth: usize,
        state: &mut DecodeState,
    ) -> Result<DataValue, MmdbError> {
        state.pointer_follows += 1;
        if state.pointer_follows > self.limits.max_pointer_follows {
            return Err(MmdbError::corrupt(start, "too many pointers followed"));
        }

        let target_ctrl = *self.buffer.get(target).ok_or_else(|| {
            MmdbError::corrupt(start, format!("pointer target {} out of bounds", target))
        })?;
        if target_ctrl >> 5 == TYPE_POINTER {
            return Err(MmdbError::corrupt(
                start,
                format!("pointer to pointer at {}", target),
            ));
        }

        let mut target_cursor = target;
        self.decode_at(&mut target_cursor, depth + 1, state)
    }

    fn decode_pointer(&self, cursor: &mut usize, ctrl: u8) -> Result<usize, MmdbError> {
        let size_class = (ctrl >> 3) & 0x3;
        let value_bits = (ctrl & 0x7) as usize;

        let pointer = match size_class {
            0 => {
                let b = self.take(cursor, 1)?;
                (value_bits << 8) | b[0] as usize
            }
            1 => {
                let b = self.take(cursor, 2)?;
                ((value_bits << 16) | (b[0] as usize) << 8 | b[1] as usize) + 2048
            }
            2 => {
                let b = self.take(cursor, 3)?;
                ((value_bits << 24) | (b[0] as usize) << 16 | (b[1] as usize) << 8 | b[2] as usize)
                    + 526_336
            }
            _ => {
                let b = self.take(cursor, 4)?;
                u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as usize
            }
        };

        Ok(pointer)
    }

    fn decode_map(
        &self,
        cursor: &mut usize,
        count: usize,
        depth: usize,
        state: &mut DecodeState,
    ) -> Result<DataValue, MmdbError> {
        // Every entry needs at least two bytes, so cap the preallocation
        let remaining = self.buffer.len().saturating_sub(*cursor);
        let mut pairs = Vec::with_capacity(count.min(remaining / 2));

        for _ in 0..count {
            let key_at = *cursor;
            let key = match self.decode_at(cursor, depth + 1, state)? {
                DataValue::String(s) => s,
                _ => return Err(MmdbError::corrupt(key_at, "map key is not a string")),
            };
            let value = self.decode_at(cursor, depth + 1, state)?;
            pairs.push((key, value));
        }

        Ok(DataValue::Map(pairs))
    }

    fn decode_array(
        &self,
        cursor: &mut usize,
        count: usize,
        depth: usize,
        state: &mut DecodeState,
    ) -> Result<DataValue, MmdbError> {
        let remaining = self.buffer.len().saturating_sub(*cursor);
        let mut items = Vec::with_capacity(count.min(remaining));

        for _ in 0..count {
            items.push(self.decode_at(cursor, depth + 1, state)?);
        }

        Ok(DataValue::Array(items))
    }

    /// Big-endian unsigned integer of `size` bytes (0 bytes means zero)
    fn read_uint(&self, cursor: &mut usize, size: usize, max: usize) -> Result<u128, MmdbError> {
        if size > max {
            return Err(MmdbError::corrupt(
                *cursor,
                format!("integer payload of {} bytes exceeds {}", size, max),
            ));
        }
        let bytes = self.take(cursor, size)?;
        Ok(bytes.iter().fold(0u128, |acc, &b| (acc << 8) | b as u128))
    }

    fn decode_size(&self, cursor: &mut usize, size_bits: u8) -> Result<usize, MmdbError> {
        match size_bits {
            0..=28 => Ok(size_bits as usize),
            29 => {
                let b = self.take(cursor, 1)?;
                Ok(29 + b[0] as usize)
            }
            30 => {
                let b = self.take(cursor, 2)?;
                Ok(285 + u16::from_be_bytes([b[0], b[1]]) as usize)
            }
            _ => {
                let b = self.take(cursor, 3)?;
                Ok(65_821 + ((b[0] as usize) << 16 | (b[1] as usize) << 8 | b[2] as usize))
            }
        }
    }

    fn read_byte(&self, cursor: &mut usize) -> Result<u8, MmdbError> {
        let byte = *self
            .buffer
            .get(*cursor)
            .ok_or_else(|| MmdbError::corrupt(*cursor, "unexpected end of data"))?;
        *cursor += 1;
        Ok(byte)
    }

    fn take(&self, cursor: &mut usize, len: usize) -> Result<&'a [u8], MmdbError> {
        let end = cursor
            .checked_add(len)
            .filter(|&end| end <= self.buffer.len())
            .ok_or_else(|| {
                MmdbError::corrupt(
                    *cursor,
                    format!("{} byte payload overruns the buffer", len),
                )
            })?;
        let bytes = &self.buffer[*cursor..end];
        *cursor = end;
        Ok(bytes)
    }
}

/// Data section encoder
///
/// Builds a data section by encoding values and tracking offsets.
/// Identical top-level values share one offset, and repeated strings,
/// maps and arrays nested inside later values are written as pointers.
pub struct DataEncoder {
    /// Encoded data buffer
    buffer: Vec<u8>,
    /// Map from standalone serialization to offset (for deduplication)
    dedup_map: HashMap<Vec<u8>, u32>,
}

impl DataEncoder {
    /// Create a new encoder
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            dedup_map: HashMap::new(),
        }
    }

    /// Encode a value and return its offset
    pub fn encode(&mut self, value: &DataValue) -> u32 {
        let mut standalone = Vec::new();
        Self::encode_to_buffer(value, &mut standalone);

        if let Some(&offset) = self.dedup_map.get(&standalone) {
            return offset;
        }

        let offset = self.buffer.len() as u32;
        self.write_value(value);
        self.dedup_map.insert(standalone, offset);
        offset
    }

    /// Get the final encoded data section
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    /// Get current buffer size
    pub fn size(&self) -> usize {
        self.buffer.len()
    }

    fn write_value(&mut self, value: &DataValue) {
        match value {
            DataValue::Map(pairs) => {
                Self::encode_with_size(TYPE_MAP, pairs.len(), &mut self.buffer);
                for (key, child) in pairs {
                    self.write_child(&DataValue::String(key.clone()));
                    self.write_child(child);
                }
            }
            DataValue::Array(items) => {
                Self::encode_with_size(TYPE_ARRAY, items.len(), &mut self.buffer);
                for child in items {
                    self.write_child(child);
                }
            }
            other => Self::encode_to_buffer(other, &mut self.buffer),
        }
    }

    /// Write a nested value, replacing it with a pointer if it was seen before
    fn write_child(&mut self, value: &DataValue) {
        let pointable = matches!(
            value,
            DataValue::String(_) | DataValue::Map(_) | DataValue::Array(_) | DataValue::Bytes(_)
        );
        if !pointable {
            Self::encode_to_buffer(value, &mut self.buffer);
            return;
        }

        let mut standalone = Vec::new();
        Self::encode_to_buffer(value, &mut standalone);
        // A pointer costs at least two bytes
        if standalone.len() <= 3 {
            self.buffer.extend_from_slice(&standalone);
            return;
        }

        if let Some(&offset) = self.dedup_map.get(&standalone) {
            Self::encode_pointer(offset, &mut self.buffer);
            return;
        }

        let offset = self.buffer.len() as u32;
        self.write_value(value);
        self.dedup_map.insert(standalone, offset);
    }

    /// Encode a value to a buffer without any pointers
    fn encode_to_buffer(value: &DataValue, buffer: &mut Vec<u8>) {
        match value {
            DataValue::String(s) => {
                Self::encode_with_size(TYPE_STRING, s.len(), buffer);
                buffer.extend_from_slice(s.as_bytes());
            }
            DataValue::Double(d) => {
                Self::encode_with_size(TYPE_DOUBLE, 8, buffer);
                buffer.extend_from_slice(&d.to_be_bytes());
            }
            DataValue::Bytes(b) => {
                Self::encode_with_size(TYPE_BYTES, b.len(), buffer);
                buffer.extend_from_slice(b);
            }
            DataValue::Uint16(n) => Self::encode_uint(TYPE_UINT16, *n as u128, buffer),
            DataValue::Uint32(n) => Self::encode_uint(TYPE_UINT32, *n as u128, buffer),
            DataValue::Map(pairs) => {
                Self::encode_with_size(TYPE_MAP, pairs.len(), buffer);
                for (key, child) in pairs {
                    Self::encode_to_buffer(&DataValue::String(key.clone()), buffer);
                    Self::encode_to_buffer(child, buffer);
                }
            }
            DataValue::Int32(n) => {
                Self::encode_with_size(TYPE_INT32, 4, buffer);
                buffer.extend_from_slice(&n.to_be_bytes());
            }
            DataValue::Uint64(n) => Self::encode_uint(TYPE_UINT64, *n as u128, buffer),
            DataValue::Uint128(n) => Self::encode_uint(TYPE_UINT128, *n, buffer),
            DataValue::Array(items) => {
                Self::encode_with_size(TYPE_ARRAY, items.len(), buffer);
                for child in items {
                    Self::encode_to_buffer(child, buffer);
                }
            }
            DataValue::Bool(b) => Self::encode_with_size(TYPE_BOOL, *b as usize, buffer),
            DataValue::Float(f) => {
                Self::encode_with_size(TYPE_FLOAT, 4, buffer);
                buffer.extend_from_slice(&f.to_be_bytes());
            }
        }
    }

    /// Unsigned integers are written with leading zero bytes stripped
    fn encode_uint(type_id: u8, n: u128, buffer: &mut Vec<u8>) {
        let bytes = n.to_be_bytes();
        let skip = bytes.iter().take_while(|&&b| b == 0).count();
        Self::encode_with_size(type_id, bytes.len() - skip, buffer);
        buffer.extend_from_slice(&bytes[skip..]);
    }

    /// Type 1: Pointer, using the smallest size class that fits
    fn encode_pointer(offset: u32, buffer: &mut Vec<u8>) {
        let offset = offset as usize;
        if offset < 2048 {
            buffer.push(0x20 | ((offset >> 8) & 0x7) as u8);
            buffer.push((offset & 0xFF) as u8);
        } else if offset < 2048 + 524_288 {
            let v = offset - 2048;
            buffer.push(0x28 | ((v >> 16) & 0x7) as u8);
            buffer.push(((v >> 8) & 0xFF) as u8);
            buffer.push((v & 0xFF) as u8);
        } else if offset < 526_336 + 134_217_728 {
            let v = offset - 526_336;
            buffer.push(0x30 | ((v >> 24) & 0x7) as u8);
            buffer.push(((v >> 16) & 0xFF) as u8);
            buffer.push(((v >> 8) & 0xFF) as u8);
            buffer.push((v & 0xFF) as u8);
        } else {
            buffer.push(0x38);
            buffer.extend_from_slice(&(offset as u32).to_be_bytes());
        }
    }

    /// Encode control byte(s) with size; extended types get their type byte
    fn encode_with_size(type_id: u8, size: usize, buffer: &mut Vec<u8>) {
        let (type_bits, ext) = if type_id >= TYPE_INT32 {
            (0u8, Some(type_id - 7))
        } else {
            (type_id << 5, None)
        };

        let (size_bits, extra): (u8, Vec<u8>) = if size < 29 {
            (size as u8, Vec::new())
        } else if size < 285 {
            (29, vec![(size - 29) as u8])
        } else if size < 65_821 {
            (30, ((size - 285) as u16).to_be_bytes().to_vec())
        } else {
            (31, ((size - 65_821) as u32).to_be_bytes()[1..].to_vec())
        };

        buffer.push(type_bits | size_bits);
        if let Some(ext) = ext {
            buffer.push(ext);
        }
        buffer.extend_from_slice(&extra);
    }
}

impl Default for DataEncoder {
    fn default() -> Self {
        Self::new()
    }
}
