//! Values bound to statements and values read back from rows.
//!
//! Bound values are passed already serialized: the driver does not know the
//! column types of an unprepared statement, so callers pick the wire
//! representation through the `From` conversions below.

use crate::frame::frame_errors::{LowLevelDeserializationError, RequestSerializationError};
use crate::frame::types;
use bytes::{BufMut, Bytes};
use std::convert::TryInto;
use std::net::IpAddr;
use uuid::Uuid;

/// A single serialized statement value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Null,
    /// Leaves the column untouched (protocol v4+).
    Unset,
    Bytes(Bytes),
}

impl Value {
    fn write(&self, buf: &mut impl BufMut) -> Result<(), RequestSerializationError> {
        match self {
            Value::Null => types::write_int(-1, buf),
            Value::Unset => types::write_int(-2, buf),
            Value::Bytes(bytes) => types::write_bytes(bytes, buf)?,
        }
        Ok(())
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Bytes(Bytes::copy_from_slice(&v.to_be_bytes()))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Bytes(Bytes::copy_from_slice(&v.to_be_bytes()))
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bytes(Bytes::copy_from_slice(&[v as u8]))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Bytes(Bytes::copy_from_slice(v.as_bytes()))
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Bytes(Bytes::from(v.into_bytes()))
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Value::Bytes(Bytes::copy_from_slice(v.as_bytes()))
    }
}

impl From<IpAddr> for Value {
    fn from(v: IpAddr) -> Self {
        match v {
            IpAddr::V4(v4) => Value::Bytes(Bytes::copy_from_slice(&v4.octets())),
            IpAddr::V6(v6) => Value::Bytes(Bytes::copy_from_slice(&v6.octets())),
        }
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(Bytes::from(v))
    }
}

impl From<Bytes> for Value {
    fn from(v: Bytes) -> Self {
        Value::Bytes(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// Positional values bound to one statement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SerializedValues {
    values: Vec<Value>,
}

impl SerializedValues {
    pub const EMPTY: &'static SerializedValues = &SerializedValues { values: Vec::new() };

    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_value(&mut self, value: impl Into<Value>) {
        self.values.push(value.into());
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.values.iter()
    }

    /// Writes `<n><value_1>...<value_n>`.
    pub fn write_to_request(&self, buf: &mut impl BufMut) -> Result<(), RequestSerializationError> {
        let len: u16 = self
            .values
            .len()
            .try_into()
            .map_err(|_| RequestSerializationError::TooManyValues(self.values.len()))?;
        types::write_short(len, buf);
        for value in &self.values {
            value.write(buf)?;
        }
        Ok(())
    }

    pub fn new_from_frame(buf: &mut &[u8]) -> Result<Self, LowLevelDeserializationError> {
        let count = types::read_short(buf)?;
        let mut values = Vec::with_capacity(types::capacity_hint(count.into(), buf, 4));
        for _ in 0..count {
            let len = types::read_int(buf)?;
            let value = match len {
                -2 => Value::Unset,
                -1 => Value::Null,
                len if len >= 0 => Value::Bytes(Bytes::copy_from_slice(
                    types::read_raw_bytes(len as usize, buf)?,
                )),
                len => return Err(LowLevelDeserializationError::InvalidValueLength(len)),
            };
            values.push(value);
        }
        Ok(Self { values })
    }
}

impl<V: Into<Value>> FromIterator<V> for SerializedValues {
    fn from_iter<I: IntoIterator<Item = V>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().map(Into::into).collect(),
        }
    }
}

/// Column types of a result set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnType {
    Custom(String),
    Ascii,
    BigInt,
    Blob,
    Boolean,
    Counter,
    Int,
    Text,
    Timestamp,
    Uuid,
    Varchar,
    Timeuuid,
    Inet,
    List(Box<ColumnType>),
    Map(Box<ColumnType>, Box<ColumnType>),
    Set(Box<ColumnType>),
    /// A type whose values are kept as raw bytes.
    Other(u16),
}

impl ColumnType {
    /// Reads an `[option]` describing a column type.
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, LowLevelDeserializationError> {
        let id = types::read_short(buf)?;
        let typ = match id {
            0x0000 => ColumnType::Custom(types::read_string(buf)?.to_owned()),
            0x0001 => ColumnType::Ascii,
            0x0002 => ColumnType::BigInt,
            0x0003 => ColumnType::Blob,
            0x0004 => ColumnType::Boolean,
            0x0005 => ColumnType::Counter,
            0x0009 => ColumnType::Int,
            0x000A => ColumnType::Text,
            0x000B => ColumnType::Timestamp,
            0x000C => ColumnType::Uuid,
            0x000D => ColumnType::Varchar,
            0x000F => ColumnType::Timeuuid,
            0x0010 => ColumnType::Inet,
            0x0020 => ColumnType::List(Box::new(ColumnType::deserialize(buf)?)),
            0x0021 => {
                let key = ColumnType::deserialize(buf)?;
                let value = ColumnType::deserialize(buf)?;
                ColumnType::Map(Box::new(key), Box::new(value))
            }
            0x0022 => ColumnType::Set(Box::new(ColumnType::deserialize(buf)?)),
            // Types with nested options (UDTs, tuples) cannot be skipped
            // without understanding them.
            0x0030 | 0x0031 => return Err(LowLevelDeserializationError::UnknownColumnType(id)),
            other => ColumnType::Other(other),
        };
        Ok(typ)
    }

    /// Writes this type as an `[option]`.
    pub fn serialize(&self, buf: &mut impl BufMut) -> Result<(), std::num::TryFromIntError> {
        match self {
            ColumnType::Custom(name) => {
                types::write_short(0x0000, buf);
                types::write_string(name, buf)?;
            }
            ColumnType::Ascii => types::write_short(0x0001, buf),
            ColumnType::BigInt => types::write_short(0x0002, buf),
            ColumnType::Blob => types::write_short(0x0003, buf),
            ColumnType::Boolean => types::write_short(0x0004, buf),
            ColumnType::Counter => types::write_short(0x0005, buf),
            ColumnType::Int => types::write_short(0x0009, buf),
            ColumnType::Text => types::write_short(0x000A, buf),
            ColumnType::Timestamp => types::write_short(0x000B, buf),
            ColumnType::Uuid => types::write_short(0x000C, buf),
            ColumnType::Varchar => types::write_short(0x000D, buf),
            ColumnType::Timeuuid => types::write_short(0x000F, buf),
            ColumnType::Inet => types::write_short(0x0010, buf),
            ColumnType::List(elem) => {
                types::write_short(0x0020, buf);
                elem.serialize(buf)?;
            }
            ColumnType::Map(key, value) => {
                types::write_short(0x0021, buf);
                key.serialize(buf)?;
                value.serialize(buf)?;
            }
            ColumnType::Set(elem) => {
                types::write_short(0x0022, buf);
                elem.serialize(buf)?;
            }
            ColumnType::Other(id) => types::write_short(*id, buf),
        }
        Ok(())
    }
}

/// A value read from a row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CqlValue {
    Ascii(String),
    Boolean(bool),
    Blob(Vec<u8>),
    Counter(i64),
    Int(i32),
    BigInt(i64),
    Text(String),
    /// Milliseconds since the unix epoch.
    Timestamp(i64),
    Uuid(Uuid),
    Timeuuid(Uuid),
    Inet(IpAddr),
    List(Vec<CqlValue>),
    Set(Vec<CqlValue>),
    Map(Vec<(CqlValue, CqlValue)>),
    Raw(Bytes),
}

impl CqlValue {
    pub fn as_text(&self) -> Option<&String> {
        match self {
            Self::Ascii(s) | Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn into_string(self) -> Option<String> {
        match self {
            Self::Ascii(s) | Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bigint(&self) -> Option<i64> {
        match self {
            Self::BigInt(i) | Self::Counter(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Self::Uuid(u) | Self::Timeuuid(u) => Some(*u),
            _ => None,
        }
    }

    pub fn as_inet(&self) -> Option<IpAddr> {
        match self {
            Self::Inet(a) => Some(*a),
            _ => None,
        }
    }

    /// Elements of a list or a set.
    pub fn into_vec(self) -> Option<Vec<CqlValue>> {
        match self {
            Self::List(v) | Self::Set(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_pair_vec(self) -> Option<Vec<(CqlValue, CqlValue)>> {
        match self {
            Self::Map(v) => Some(v),
            _ => None,
        }
    }

    /// Decodes one non-null cell of the given type.
    pub fn deserialize(
        typ: &ColumnType,
        buf: &mut &[u8],
    ) -> Result<CqlValue, LowLevelDeserializationError> {
        let value = match typ {
            ColumnType::Ascii => CqlValue::Ascii(std::str::from_utf8(buf)?.to_owned()),
            ColumnType::Text | ColumnType::Varchar => {
                CqlValue::Text(std::str::from_utf8(buf)?.to_owned())
            }
            ColumnType::Boolean => CqlValue::Boolean(types::read_byte(buf)? != 0),
            ColumnType::Blob => CqlValue::Blob(buf.to_vec()),
            ColumnType::Int => CqlValue::Int(types::read_int(buf)?),
            ColumnType::BigInt => CqlValue::BigInt(types::read_long(buf)?),
            ColumnType::Counter => CqlValue::Counter(types::read_long(buf)?),
            ColumnType::Timestamp => CqlValue::Timestamp(types::read_long(buf)?),
            ColumnType::Uuid => CqlValue::Uuid(types::read_uuid(buf)?),
            ColumnType::Timeuuid => CqlValue::Timeuuid(types::read_uuid(buf)?),
            ColumnType::Inet => {
                let addr = match buf.len() {
                    4 => {
                        let raw: [u8; 4] = (*buf).try_into()?;
                        IpAddr::from(raw)
                    }
                    16 => {
                        let raw: [u8; 16] = (*buf).try_into()?;
                        IpAddr::from(raw)
                    }
                    len => {
                        return Err(LowLevelDeserializationError::InvalidInetLength(len as u8))
                    }
                };
                CqlValue::Inet(addr)
            }
            ColumnType::List(elem) => CqlValue::List(Self::deserialize_elements(elem, buf)?),
            ColumnType::Set(elem) => CqlValue::Set(Self::deserialize_elements(elem, buf)?),
            ColumnType::Map(key_type, value_type) => {
                let len = types::read_int_length(buf)?;
                let mut pairs = Vec::with_capacity(types::capacity_hint(len, buf, 8));
                for _ in 0..len {
                    let key = Self::deserialize_element(key_type, buf)?;
                    let value = Self::deserialize_element(value_type, buf)?;
                    pairs.push((key, value));
                }
                CqlValue::Map(pairs)
            }
            ColumnType::Custom(_) | ColumnType::Other(_) => {
                CqlValue::Raw(Bytes::copy_from_slice(buf))
            }
        };
        Ok(value)
    }

    fn deserialize_elements(
        elem: &ColumnType,
        buf: &mut &[u8],
    ) -> Result<Vec<CqlValue>, LowLevelDeserializationError> {
        let len = types::read_int_length(buf)?;
        let mut elements = Vec::with_capacity(types::capacity_hint(len, buf, 4));
        for _ in 0..len {
            elements.push(Self::deserialize_element(elem, buf)?);
        }
        Ok(elements)
    }

    fn deserialize_element(
        typ: &ColumnType,
        buf: &mut &[u8],
    ) -> Result<CqlValue, LowLevelDeserializationError> {
        let mut raw = types::read_bytes(buf)?;
        Self::deserialize(typ, &mut raw)
    }

    /// Encodes this value as a cell body, without the length prefix.
    pub fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), std::num::TryFromIntError> {
        match self {
            CqlValue::Ascii(s) | CqlValue::Text(s) => buf.put_slice(s.as_bytes()),
            CqlValue::Boolean(b) => buf.put_u8(*b as u8),
            CqlValue::Blob(b) => buf.put_slice(b),
            CqlValue::Int(i) => buf.put_i32(*i),
            CqlValue::BigInt(i) | CqlValue::Counter(i) | CqlValue::Timestamp(i) => buf.put_i64(*i),
            CqlValue::Uuid(u) | CqlValue::Timeuuid(u) => types::write_uuid(u, buf),
            CqlValue::Inet(IpAddr::V4(v4)) => buf.put_slice(&v4.octets()),
            CqlValue::Inet(IpAddr::V6(v6)) => buf.put_slice(&v6.octets()),
            CqlValue::List(elements) | CqlValue::Set(elements) => {
                types::write_int(elements.len().try_into()?, buf);
                for element in elements {
                    Self::serialize_element(element, buf)?;
                }
            }
            CqlValue::Map(pairs) => {
                types::write_int(pairs.len().try_into()?, buf);
                for (key, value) in pairs {
                    Self::serialize_element(key, buf)?;
                    Self::serialize_element(value, buf)?;
                }
            }
            CqlValue::Raw(raw) => buf.put_slice(raw),
        }
        Ok(())
    }

    fn serialize_element(element: &CqlValue, buf: &mut Vec<u8>) -> Result<(), std::num::TryFromIntError> {
        let mut cell = Vec::new();
        element.serialize(&mut cell)?;
        types::write_bytes(&cell, buf)
    }
}
