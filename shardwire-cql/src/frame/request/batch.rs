use std::borrow::Cow;
use std::convert::TryInto;

use bytes::BufMut;

use crate::frame::frame_errors::RequestSerializationError;
use crate::frame::request::query::write_flags;
use crate::frame::request::{RequestOpcode, SerializableRequest};
use crate::frame::{types, ProtocolVersion};
use crate::value::SerializedValues;

// Batch flags
const FLAG_WITH_SERIAL_CONSISTENCY: u32 = 0x10;
const FLAG_WITH_DEFAULT_TIMESTAMP: u32 = 0x20;

/// A BATCH of unprepared statements, each with its own bound values.
pub struct Batch<'b> {
    pub statements: Cow<'b, [BatchStatement<'b>]>,
    pub batch_type: BatchType,
    pub consistency: types::Consistency,
    pub serial_consistency: Option<types::SerialConsistency>,
    pub timestamp: Option<i64>,
}

/// The type of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchType {
    #[default]
    Logged = 0,
    Unlogged = 1,
    Counter = 2,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchStatement<'a> {
    pub text: Cow<'a, str>,
    pub values: Cow<'a, SerializedValues>,
}

impl SerializableRequest for Batch<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Batch;

    fn serialize(
        &self,
        version: ProtocolVersion,
        buf: &mut Vec<u8>,
    ) -> Result<(), RequestSerializationError> {
        buf.put_u8(self.batch_type as u8);

        let statement_count: u16 = self
            .statements
            .len()
            .try_into()
            .map_err(|_| RequestSerializationError::TooManyStatements(self.statements.len()))?;
        types::write_short(statement_count, buf);

        for statement in self.statements.iter() {
            // Kind 0: the statement is a query string, not a prepared id.
            buf.put_u8(0);
            types::write_long_string(&statement.text, buf)?;
            statement.values.write_to_request(buf)?;
        }

        types::write_consistency(self.consistency, buf);

        let mut flags = 0;
        if self.serial_consistency.is_some() {
            flags |= FLAG_WITH_SERIAL_CONSISTENCY;
        }
        if self.timestamp.is_some() {
            flags |= FLAG_WITH_DEFAULT_TIMESTAMP;
        }
        write_flags(flags, version, buf);

        if let Some(serial_consistency) = self.serial_consistency {
            types::write_serial_consistency(serial_consistency, buf);
        }
        if let Some(timestamp) = self.timestamp {
            types::write_long(timestamp, buf);
        }

        Ok(())
    }
}
