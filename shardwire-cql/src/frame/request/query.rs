use std::borrow::Cow;

use crate::frame::frame_errors::{
    LowLevelDeserializationError, RequestDeserializationError, RequestSerializationError,
};
use crate::frame::types::{self, SerialConsistency};
use crate::frame::ProtocolVersion;
use crate::value::SerializedValues;
use bytes::{BufMut, Bytes};

use crate::frame::request::{DeserializableRequest, RequestOpcode, SerializableRequest};

// Query flags
const FLAG_VALUES: u32 = 0x01;
const FLAG_SKIP_METADATA: u32 = 0x02;
const FLAG_PAGE_SIZE: u32 = 0x04;
const FLAG_WITH_PAGING_STATE: u32 = 0x08;
const FLAG_WITH_SERIAL_CONSISTENCY: u32 = 0x10;
const FLAG_WITH_DEFAULT_TIMESTAMP: u32 = 0x20;

#[derive(Debug, PartialEq, Eq)]
pub struct Query<'q> {
    pub contents: Cow<'q, str>,
    pub parameters: QueryParameters<'q>,
}

impl SerializableRequest for Query<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Query;

    fn serialize(
        &self,
        version: ProtocolVersion,
        buf: &mut Vec<u8>,
    ) -> Result<(), RequestSerializationError> {
        types::write_long_string(&self.contents, buf)?;
        self.parameters.serialize(version, buf)?;
        Ok(())
    }
}

impl DeserializableRequest for Query<'_> {
    fn deserialize(
        version: ProtocolVersion,
        buf: &mut &[u8],
    ) -> Result<Self, RequestDeserializationError> {
        let contents = Cow::Owned(types::read_long_string(buf)?.to_owned());
        let parameters = QueryParameters::deserialize(version, buf)?;

        Ok(Self {
            contents,
            parameters,
        })
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct QueryParameters<'a> {
    pub consistency: types::Consistency,
    pub serial_consistency: Option<types::SerialConsistency>,
    pub timestamp: Option<i64>,
    pub page_size: Option<i32>,
    pub paging_state: Option<Bytes>,
    pub skip_metadata: bool,
    pub values: Cow<'a, SerializedValues>,
}

impl Default for QueryParameters<'_> {
    fn default() -> Self {
        Self {
            consistency: Default::default(),
            serial_consistency: None,
            timestamp: None,
            page_size: None,
            paging_state: None,
            skip_metadata: false,
            values: Cow::Borrowed(SerializedValues::EMPTY),
        }
    }
}

pub(crate) fn write_flags(flags: u32, version: ProtocolVersion, buf: &mut impl BufMut) {
    if version.has_int_query_flags() {
        buf.put_u32(flags);
    } else {
        buf.put_u8(flags as u8);
    }
}

pub(crate) fn read_flags(
    version: ProtocolVersion,
    buf: &mut &[u8],
) -> Result<u32, LowLevelDeserializationError> {
    if version.has_int_query_flags() {
        Ok(types::read_int(buf)? as u32)
    } else {
        Ok(types::read_byte(buf)? as u32)
    }
}

impl QueryParameters<'_> {
    pub fn serialize(
        &self,
        version: ProtocolVersion,
        buf: &mut Vec<u8>,
    ) -> Result<(), RequestSerializationError> {
        types::write_consistency(self.consistency, buf);

        let mut flags = 0;
        if !self.values.is_empty() {
            flags |= FLAG_VALUES;
        }

        if self.skip_metadata {
            flags |= FLAG_SKIP_METADATA;
        }

        if self.page_size.is_some() {
            flags |= FLAG_PAGE_SIZE;
        }

        if self.paging_state.is_some() {
            flags |= FLAG_WITH_PAGING_STATE;
        }

        if self.serial_consistency.is_some() {
            flags |= FLAG_WITH_SERIAL_CONSISTENCY;
        }

        if self.timestamp.is_some() {
            flags |= FLAG_WITH_DEFAULT_TIMESTAMP;
        }

        write_flags(flags, version, buf);

        if !self.values.is_empty() {
            self.values.write_to_request(buf)?;
        }

        if let Some(page_size) = self.page_size {
            types::write_int(page_size, buf);
        }

        if let Some(paging_state) = &self.paging_state {
            types::write_bytes(paging_state, buf)?;
        }

        if let Some(serial_consistency) = self.serial_consistency {
            types::write_serial_consistency(serial_consistency, buf);
        }

        if let Some(timestamp) = self.timestamp {
            types::write_long(timestamp, buf);
        }

        Ok(())
    }

    pub fn deserialize(
        version: ProtocolVersion,
        buf: &mut &[u8],
    ) -> Result<QueryParameters<'static>, RequestDeserializationError> {
        let consistency = types::read_consistency(buf)?;

        let flags = read_flags(version, buf)?;
        let values = Cow::Owned(if flags & FLAG_VALUES != 0 {
            SerializedValues::new_from_frame(buf)?
        } else {
            SerializedValues::new()
        });

        let page_size = if flags & FLAG_PAGE_SIZE != 0 {
            Some(types::read_int(buf).map_err(LowLevelDeserializationError::from)?)
        } else {
            None
        };
        let paging_state = if flags & FLAG_WITH_PAGING_STATE != 0 {
            Some(Bytes::copy_from_slice(types::read_bytes(buf)?))
        } else {
            None
        };
        let serial_consistency = if flags & FLAG_WITH_SERIAL_CONSISTENCY != 0 {
            let raw = types::read_short(buf).map_err(LowLevelDeserializationError::from)?;
            Some(
                SerialConsistency::try_from(raw)
                    .map_err(LowLevelDeserializationError::UnknownConsistency)?,
            )
        } else {
            None
        };
        let timestamp = if flags & FLAG_WITH_DEFAULT_TIMESTAMP != 0 {
            Some(types::read_long(buf).map_err(LowLevelDeserializationError::from)?)
        } else {
            None
        };

        Ok(QueryParameters {
            consistency,
            serial_consistency,
            timestamp,
            page_size,
            paging_state,
            skip_metadata: flags & FLAG_SKIP_METADATA != 0,
            values,
        })
    }
}
