use crate::errors::{DbError, ErrorReasonMap, FailureReason, WriteType};
use crate::frame::frame_errors::{LowLevelDeserializationError, ResponseParseError};
use crate::frame::{types, ProtocolVersion};
use bytes::Bytes;

/// An ERROR response: a typed error plus the server's message.
#[derive(Debug, Clone)]
pub struct Error {
    pub error: DbError,
    pub reason: String,
}

fn make_error_field_err(
    db_error: &'static str,
    field: &'static str,
    err: impl Into<LowLevelDeserializationError>,
) -> ResponseParseError {
    ResponseParseError::MalformedErrorField {
        db_error,
        field,
        err: err.into(),
    }
}

// Before v5: <numfailures>. From v5 on: <reasonmap>, and the failure count is its size.
fn read_failures(
    version: ProtocolVersion,
    db_error: &'static str,
    buf: &mut &[u8],
) -> Result<(i32, ErrorReasonMap), ResponseParseError> {
    if !version.has_failure_reason_map() {
        let numfailures =
            types::read_int(buf).map_err(|err| make_error_field_err(db_error, "NUM_FAILURES", err))?;
        return Ok((numfailures, ErrorReasonMap::new()));
    }

    let count =
        types::read_int(buf).map_err(|err| make_error_field_err(db_error, "REASON_MAP", err))?;
    // An IPv4 endpoint and a reason code.
    let mut reasons =
        ErrorReasonMap::with_capacity(types::capacity_hint(count.max(0) as usize, buf, 7));
    for _ in 0..count {
        let endpoint = types::read_inetaddr(buf)
            .map_err(|err| make_error_field_err(db_error, "REASON_MAP", err))?;
        let code = types::read_short(buf)
            .map_err(|err| make_error_field_err(db_error, "REASON_MAP", err))?;
        reasons.insert(endpoint, FailureReason::from(code));
    }
    Ok((count, reasons))
}

fn read_bool(
    db_error: &'static str,
    field: &'static str,
    buf: &mut &[u8],
) -> Result<bool, ResponseParseError> {
    Ok(types::read_byte(buf).map_err(|err| make_error_field_err(db_error, field, err))? != 0)
}

impl Error {
    pub fn deserialize(
        version: ProtocolVersion,
        buf: &mut &[u8],
    ) -> Result<Self, ResponseParseError> {
        let code = types::read_int(buf)
            .map_err(|err| make_error_field_err("ERROR", "CODE", err))?;
        let reason = types::read_string(buf)
            .map_err(|err| make_error_field_err("ERROR", "REASON", err))?
            .to_owned();

        let error: DbError = match code {
            0x0000 => DbError::ServerError,
            0x000A => DbError::ProtocolError,
            0x0100 => DbError::AuthenticationError,
            0x1000 => DbError::Unavailable {
                consistency: types::read_consistency(buf)
                    .map_err(|err| make_error_field_err("UNAVAILABLE", "CONSISTENCY", err))?,
                required: types::read_int(buf)
                    .map_err(|err| make_error_field_err("UNAVAILABLE", "REQUIRED", err))?,
                alive: types::read_int(buf)
                    .map_err(|err| make_error_field_err("UNAVAILABLE", "ALIVE", err))?,
            },
            0x1001 => DbError::Overloaded,
            0x1002 => DbError::IsBootstrapping,
            0x1003 => DbError::TruncateError,
            0x1100 => DbError::WriteTimeout {
                consistency: types::read_consistency(buf)
                    .map_err(|err| make_error_field_err("WRITE_TIMEOUT", "CONSISTENCY", err))?,
                received: types::read_int(buf)
                    .map_err(|err| make_error_field_err("WRITE_TIMEOUT", "RECEIVED", err))?,
                required: types::read_int(buf)
                    .map_err(|err| make_error_field_err("WRITE_TIMEOUT", "REQUIRED", err))?,
                write_type: WriteType::from(
                    types::read_string(buf)
                        .map_err(|err| make_error_field_err("WRITE_TIMEOUT", "WRITE_TYPE", err))?,
                ),
            },
            0x1200 => DbError::ReadTimeout {
                consistency: types::read_consistency(buf)
                    .map_err(|err| make_error_field_err("READ_TIMEOUT", "CONSISTENCY", err))?,
                received: types::read_int(buf)
                    .map_err(|err| make_error_field_err("READ_TIMEOUT", "RECEIVED", err))?,
                required: types::read_int(buf)
                    .map_err(|err| make_error_field_err("READ_TIMEOUT", "REQUIRED", err))?,
                data_present: read_bool("READ_TIMEOUT", "DATA_PRESENT", buf)?,
            },
            0x1300 => {
                let consistency = types::read_consistency(buf)
                    .map_err(|err| make_error_field_err("READ_FAILURE", "CONSISTENCY", err))?;
                let received = types::read_int(buf)
                    .map_err(|err| make_error_field_err("READ_FAILURE", "RECEIVED", err))?;
                let required = types::read_int(buf)
                    .map_err(|err| make_error_field_err("READ_FAILURE", "REQUIRED", err))?;
                let (numfailures, reasons) = read_failures(version, "READ_FAILURE", buf)?;
                DbError::ReadFailure {
                    consistency,
                    received,
                    required,
                    numfailures,
                    reasons,
                    data_present: read_bool("READ_FAILURE", "DATA_PRESENT", buf)?,
                }
            }
            0x1400 => DbError::FunctionFailure {
                keyspace: types::read_string(buf)
                    .map_err(|err| make_error_field_err("FUNCTION_FAILURE", "KEYSPACE", err))?
                    .to_string(),
                function: types::read_string(buf)
                    .map_err(|err| make_error_field_err("FUNCTION_FAILURE", "FUNCTION", err))?
                    .to_string(),
                arg_types: types::read_string_list(buf)
                    .map_err(|err| make_error_field_err("FUNCTION_FAILURE", "ARG_TYPES", err))?,
            },
            0x1500 => {
                let consistency = types::read_consistency(buf)
                    .map_err(|err| make_error_field_err("WRITE_FAILURE", "CONSISTENCY", err))?;
                let received = types::read_int(buf)
                    .map_err(|err| make_error_field_err("WRITE_FAILURE", "RECEIVED", err))?;
                let required = types::read_int(buf)
                    .map_err(|err| make_error_field_err("WRITE_FAILURE", "REQUIRED", err))?;
                let (numfailures, reasons) = read_failures(version, "WRITE_FAILURE", buf)?;
                DbError::WriteFailure {
                    consistency,
                    received,
                    required,
                    numfailures,
                    reasons,
                    write_type: WriteType::from(
                        types::read_string(buf).map_err(|err| {
                            make_error_field_err("WRITE_FAILURE", "WRITE_TYPE", err)
                        })?,
                    ),
                }
            }
            0x2000 => DbError::SyntaxError,
            0x2100 => DbError::Unauthorized,
            0x2200 => DbError::Invalid,
            0x2300 => DbError::ConfigError,
            0x2400 => DbError::AlreadyExists {
                keyspace: types::read_string(buf)
                    .map_err(|err| make_error_field_err("ALREADY_EXISTS", "KEYSPACE", err))?
                    .to_string(),
                table: types::read_string(buf)
                    .map_err(|err| make_error_field_err("ALREADY_EXISTS", "TABLE", err))?
                    .to_string(),
            },
            0x2500 => DbError::Unprepared {
                statement_id: Bytes::from(
                    types::read_short_bytes(buf)
                        .map_err(|err| make_error_field_err("UNPREPARED", "STATEMENT_ID", err))?
                        .to_owned(),
                ),
            },
            _ => DbError::Other(code),
        };

        Ok(Error { error, reason })
    }

    /// Encodes an ERROR body for test servers.
    ///
    /// Fields are written for the errors a coordinator commonly returns
    /// (unavailable, timeouts, already exists). Other errors carry only
    /// their code and message.
    pub fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), std::num::TryFromIntError> {
        types::write_int(self.error.code(), buf);
        types::write_string(&self.reason, buf)?;
        match &self.error {
            DbError::Unavailable {
                consistency,
                required,
                alive,
            } => {
                types::write_consistency(*consistency, buf);
                types::write_int(*required, buf);
                types::write_int(*alive, buf);
            }
            DbError::ReadTimeout {
                consistency,
                received,
                required,
                data_present,
            } => {
                types::write_consistency(*consistency, buf);
                types::write_int(*received, buf);
                types::write_int(*required, buf);
                buf.push(*data_present as u8);
            }
            DbError::WriteTimeout {
                consistency,
                received,
                required,
                write_type,
            } => {
                types::write_consistency(*consistency, buf);
                types::write_int(*received, buf);
                types::write_int(*required, buf);
                types::write_string(write_type.as_str(), buf)?;
            }
            DbError::AlreadyExists { keyspace, table } => {
                types::write_string(keyspace, buf)?;
                types::write_string(table, buf)?;
            }
            _ => {}
        }
        Ok(())
    }
}
