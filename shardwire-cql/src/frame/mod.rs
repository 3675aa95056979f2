//! Frame header handling and request/response bodies.

pub mod frame_errors;
pub mod request;
pub mod response;
pub mod server_event_type;
pub mod types;

use crate::frame::frame_errors::{FrameError, RequestSerializationError};
use bytes::{Buf, BufMut, Bytes};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

use std::collections::HashMap;
use std::convert::TryFrom;

use request::SerializableRequest;
use response::ResponseOpcode;

pub const HEADER_SIZE: usize = 9;

/// Frames with bodies larger than this are rejected (256 MiB).
pub const MAX_BODY_LEN: usize = 256 * 1024 * 1024;

// Frame flags
pub const FLAG_COMPRESSION: u8 = 0x01;
pub const FLAG_TRACING: u8 = 0x02;
pub const FLAG_CUSTOM_PAYLOAD: u8 = 0x04;
pub const FLAG_WARNING: u8 = 0x08;

/// Version of the binary protocol spoken on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum ProtocolVersion {
    V3 = 3,
    #[default]
    V4 = 4,
    V5 = 5,
}

impl ProtocolVersion {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// `READ_FAILURE` and `WRITE_FAILURE` carry a per-replica reason map
    /// instead of a bare failure count from v5 on.
    pub fn has_failure_reason_map(self) -> bool {
        self >= ProtocolVersion::V5
    }

    /// Query and batch flags are an `[int]` from v5 on, a `[byte]` before.
    pub(crate) fn has_int_query_flags(self) -> bool {
        self >= ProtocolVersion::V5
    }
}

impl TryFrom<u8> for ProtocolVersion {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            3 => Ok(ProtocolVersion::V3),
            4 => Ok(ProtocolVersion::V4),
            5 => Ok(ProtocolVersion::V5),
            other => Err(FrameError::VersionNotSupported(other)),
        }
    }
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.as_u8())
    }
}

/// A request serialized together with its frame header, waiting for a stream id.
#[derive(Debug, Clone)]
pub struct SerializedRequest {
    data: Vec<u8>,
}

impl SerializedRequest {
    pub fn make<R: SerializableRequest>(
        req: &R,
        version: ProtocolVersion,
        custom_payload: Option<&HashMap<String, Option<Bytes>>>,
        tracing: bool,
    ) -> Result<SerializedRequest, RequestSerializationError> {
        let mut flags = 0;
        let mut data = vec![0; HEADER_SIZE];

        if let Some(payload) = custom_payload {
            flags |= FLAG_CUSTOM_PAYLOAD;
            types::write_bytes_map(payload, &mut data)?;
        }
        req.serialize(version, &mut data)?;

        if tracing {
            flags |= FLAG_TRACING;
        }

        data[0] = version.as_u8();
        data[1] = flags;
        // Leave space for the stream number
        data[4] = R::OPCODE as u8;

        let req_size: u32 = (data.len() - HEADER_SIZE).try_into()?;
        data[5..9].copy_from_slice(&req_size.to_be_bytes());

        Ok(Self { data })
    }

    pub fn set_stream(&mut self, stream: i16) {
        self.data[2..4].copy_from_slice(&stream.to_be_bytes());
    }

    pub fn get_data(&self) -> &[u8] {
        &self.data[..]
    }
}

// Parts of the frame header which are not determined by the request/response type.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameParams {
    pub version: u8,
    pub flags: u8,
    pub stream: i16,
}

impl Default for FrameParams {
    fn default() -> Self {
        Self {
            version: ProtocolVersion::V4.as_u8(),
            flags: 0x00,
            stream: 0,
        }
    }
}

impl FrameParams {
    /// Header parameters of the response to a request sent with these parameters.
    pub fn for_response(&self) -> Self {
        Self {
            version: self.version | 0x80,
            flags: 0x00,
            stream: self.stream,
        }
    }
}

/// Direction of a frame, encoded in the highest bit of the version byte.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FrameType {
    Request,
    Response,
}

async fn read_frame(
    reader: &mut (impl AsyncRead + Unpin),
    frame_type: FrameType,
) -> Result<(FrameParams, u8, Bytes), FrameError> {
    let mut raw_header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut raw_header[..]).await?;

    let mut buf = &raw_header[..];

    let version = buf.get_u8();
    match (frame_type, version & 0x80 == 0x80) {
        (FrameType::Response, false) => return Err(FrameError::FrameFromClient),
        (FrameType::Request, true) => return Err(FrameError::FrameFromServer),
        _ => {}
    }
    ProtocolVersion::try_from(version & 0x7F)?;

    let flags = buf.get_u8();
    let stream = buf.get_i16();

    let frame_params = FrameParams {
        version,
        flags,
        stream,
    };

    let opcode = buf.get_u8();

    let length = buf.get_u32() as usize;
    if length > MAX_BODY_LEN {
        return Err(FrameError::BodyTooLarge(length));
    }

    let mut raw_body = Vec::with_capacity(length).limit(length);
    while raw_body.has_remaining_mut() {
        let n = reader.read_buf(&mut raw_body).await?;
        if n == 0 {
            // EOF, too early
            return Err(FrameError::ConnectionClosed(
                raw_body.remaining_mut(),
                length,
            ));
        }
    }

    Ok((frame_params, opcode, raw_body.into_inner().into()))
}

/// Reads one frame sent by the server.
pub async fn read_response_frame(
    reader: &mut (impl AsyncRead + Unpin),
) -> Result<(FrameParams, ResponseOpcode, Bytes), FrameError> {
    let (params, opcode, body) = read_frame(reader, FrameType::Response).await?;
    let opcode = ResponseOpcode::try_from(opcode)?;
    Ok((params, opcode, body))
}

/// Reads one frame sent by a client. Used by in-process test servers.
pub async fn read_request_frame(
    reader: &mut (impl AsyncRead + Unpin),
) -> Result<(FrameParams, u8, Bytes), FrameError> {
    read_frame(reader, FrameType::Request).await
}

/// Builds a complete frame out of header parameters, an opcode and a body.
pub fn make_frame(params: FrameParams, opcode: u8, body: &[u8]) -> Result<Vec<u8>, FrameError> {
    if body.len() > MAX_BODY_LEN {
        return Err(FrameError::BodyTooLarge(body.len()));
    }
    let mut data = Vec::with_capacity(HEADER_SIZE + body.len());
    data.put_u8(params.version);
    data.put_u8(params.flags);
    data.put_i16(params.stream);
    data.put_u8(opcode);
    data.put_u32(body.len() as u32);
    data.extend_from_slice(body);
    Ok(data)
}

pub struct ResponseBodyWithExtensions {
    pub trace_id: Option<Uuid>,
    pub warnings: Vec<String>,
    pub body: Bytes,
    pub custom_payload: Option<HashMap<String, Option<Bytes>>>,
}

pub fn parse_response_body_extensions(
    flags: u8,
    mut body: Bytes,
) -> Result<ResponseBodyWithExtensions, FrameError> {
    if flags & FLAG_COMPRESSION != 0 {
        return Err(FrameError::CompressionNotSupported);
    }

    let trace_id = if flags & FLAG_TRACING != 0 {
        let buf = &mut &*body;
        let trace_id = types::read_uuid(buf).map_err(FrameError::BodyExtensions)?;
        body.advance(16);
        Some(trace_id)
    } else {
        None
    };

    let warnings = if flags & FLAG_WARNING != 0 {
        let body_len = body.len();
        let buf = &mut &*body;
        let warnings = types::read_string_list(buf).map_err(FrameError::BodyExtensions)?;
        let buf_len = buf.len();
        body.advance(body_len - buf_len);
        warnings
    } else {
        Vec::new()
    };

    let custom_payload = if flags & FLAG_CUSTOM_PAYLOAD != 0 {
        let body_len = body.len();
        let buf = &mut &*body;
        let payload_map = types::read_bytes_map(buf).map_err(FrameError::BodyExtensions)?;
        let buf_len = buf.len();
        body.advance(body_len - buf_len);
        Some(payload_map)
    } else {
        None
    };

    Ok(ResponseBodyWithExtensions {
        trace_id,
        warnings,
        body,
        custom_payload,
    })
}

/// An error type for parsing an enum value from a primitive.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("No discriminant in enum `{enum_name}` matches the value `{primitive:?}`")]
pub struct TryFromPrimitiveError<T: Copy + std::fmt::Debug> {
    enum_name: &'static str,
    primitive: T,
}
