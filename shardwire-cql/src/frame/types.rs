//! Primitive notations of the CQL binary protocol (`[int]`, `[string]`,
//! `[bytes]`, `[inet]` and friends) and the consistency enums.
//!
//! Readers take `&mut &[u8]` and advance it past what they consumed.
//! Writers report lengths that do not fit their wire width as
//! [`TryFromIntError`].

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use byteorder::{BigEndian, ReadBytesExt};
use bytes::{BufMut, Bytes};
use std::num::TryFromIntError;
use uuid::Uuid;

use super::frame_errors::LowLevelDeserializationError;
use super::TryFromPrimitiveError;

/// Declares a `#[repr(u16)]` enum along with its `TryFrom<u16>`.
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $($(#[$vmeta:meta])* $variant:ident = $code:literal,)+
        }
    ) => {
        $(#[$meta])*
        #[repr(u16)]
        pub enum $name {
            $($(#[$vmeta])* $variant = $code,)+
        }

        impl TryFrom<u16> for $name {
            type Error = TryFromPrimitiveError<u16>;

            fn try_from(value: u16) -> Result<Self, Self::Error> {
                $(if value == $code {
                    return Ok($name::$variant);
                })+
                Err(TryFromPrimitiveError {
                    enum_name: stringify!($name),
                    primitive: value,
                })
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                std::fmt::Debug::fmt(self, f)
            }
        }
    };
}

wire_enum! {
    #[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub enum Consistency {
        Any = 0x0000,
        One = 0x0001,
        Two = 0x0002,
        Three = 0x0003,
        Quorum = 0x0004,
        All = 0x0005,
        #[default]
        LocalQuorum = 0x0006,
        EachQuorum = 0x0007,
        /// Only valid for reads, which then go through Paxos.
        Serial = 0x0008,
        LocalSerial = 0x0009,
        LocalOne = 0x000A,
    }
}

impl Consistency {
    pub fn is_serial(&self) -> bool {
        matches!(self, Consistency::Serial | Consistency::LocalSerial)
    }

    /// Satisfied by replicas of the coordinator's datacenter alone.
    pub fn is_dc_local(&self) -> bool {
        matches!(
            self,
            Consistency::LocalOne | Consistency::LocalQuorum | Consistency::LocalSerial
        )
    }
}

wire_enum! {
    /// Consistency of the Paxos phase of conditional updates.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub enum SerialConsistency {
        Serial = 0x0008,
        LocalSerial = 0x0009,
    }
}

pub(crate) fn read_raw_bytes<'a>(
    count: usize,
    buf: &mut &'a [u8],
) -> Result<&'a [u8], LowLevelDeserializationError> {
    if buf.len() < count {
        return Err(LowLevelDeserializationError::TooFewBytesReceived {
            expected: count,
            received: buf.len(),
        });
    }
    let (head, tail) = buf.split_at(count);
    *buf = tail;
    Ok(head)
}

fn read_array<const N: usize>(buf: &mut &[u8]) -> Result<[u8; N], LowLevelDeserializationError> {
    Ok(read_raw_bytes(N, buf)?.try_into()?)
}

pub fn read_byte(buf: &mut &[u8]) -> Result<u8, std::io::Error> {
    buf.read_u8()
}

pub fn read_short(buf: &mut &[u8]) -> Result<u16, std::io::Error> {
    buf.read_u16::<BigEndian>()
}

pub fn read_int(buf: &mut &[u8]) -> Result<i32, std::io::Error> {
    buf.read_i32::<BigEndian>()
}

pub fn read_long(buf: &mut &[u8]) -> Result<i64, std::io::Error> {
    buf.read_i64::<BigEndian>()
}

pub fn write_short(v: u16, buf: &mut impl BufMut) {
    buf.put_u16(v);
}

pub fn write_int(v: i32, buf: &mut impl BufMut) {
    buf.put_i32(v);
}

pub fn write_long(v: i64, buf: &mut impl BufMut) {
    buf.put_i64(v);
}

pub(crate) fn read_short_length(buf: &mut &[u8]) -> Result<usize, std::io::Error> {
    read_short(buf).map(usize::from)
}

/// A negative `[int]` length is an error here; use [`read_bytes_opt`] where
/// it stands for null.
pub fn read_int_length(buf: &mut &[u8]) -> Result<usize, LowLevelDeserializationError> {
    Ok(usize::try_from(read_int(buf)?)?)
}

pub(crate) fn write_short_length(v: usize, buf: &mut impl BufMut) -> Result<(), TryFromIntError> {
    write_short(u16::try_from(v)?, buf);
    Ok(())
}

pub(crate) fn write_int_length(v: usize, buf: &mut impl BufMut) -> Result<(), TryFromIntError> {
    write_int(i32::try_from(v)?, buf);
    Ok(())
}

/// `[bytes]`, where a negative length encodes null.
pub fn read_bytes_opt<'a>(
    buf: &mut &'a [u8],
) -> Result<Option<&'a [u8]>, LowLevelDeserializationError> {
    match usize::try_from(read_int(buf)?) {
        Ok(len) => read_raw_bytes(len, buf).map(Some),
        Err(_) => Ok(None),
    }
}

pub fn read_bytes<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], LowLevelDeserializationError> {
    let len = read_int_length(buf)?;
    read_raw_bytes(len, buf)
}

pub fn read_short_bytes<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], LowLevelDeserializationError> {
    let len = read_short_length(buf)?;
    read_raw_bytes(len, buf)
}

pub fn write_bytes(v: &[u8], buf: &mut impl BufMut) -> Result<(), TryFromIntError> {
    write_int_length(v.len(), buf)?;
    buf.put_slice(v);
    Ok(())
}

pub fn write_bytes_opt(
    v: Option<impl AsRef<[u8]>>,
    buf: &mut impl BufMut,
) -> Result<(), TryFromIntError> {
    match v {
        Some(v) => write_bytes(v.as_ref(), buf),
        None => {
            write_int(-1, buf);
            Ok(())
        }
    }
}

pub fn write_short_bytes(v: &[u8], buf: &mut impl BufMut) -> Result<(), TryFromIntError> {
    write_short_length(v.len(), buf)?;
    buf.put_slice(v);
    Ok(())
}

pub fn read_string<'a>(buf: &mut &'a [u8]) -> Result<&'a str, LowLevelDeserializationError> {
    Ok(std::str::from_utf8(read_short_bytes(buf)?)?)
}

pub fn read_long_string<'a>(buf: &mut &'a [u8]) -> Result<&'a str, LowLevelDeserializationError> {
    Ok(std::str::from_utf8(read_bytes(buf)?)?)
}

pub fn write_string(v: &str, buf: &mut impl BufMut) -> Result<(), TryFromIntError> {
    write_short_bytes(v.as_bytes(), buf)
}

pub fn write_long_string(v: &str, buf: &mut impl BufMut) -> Result<(), TryFromIntError> {
    write_bytes(v.as_bytes(), buf)
}

/// Preallocation for `count` entries read from `buf`, each taking at least
/// `min_entry_size` bytes. A count the buffer cannot hold does not
/// reserve memory up front; reading the entries then fails on short input.
pub(crate) fn capacity_hint(count: usize, buf: &[u8], min_entry_size: usize) -> usize {
    count.min(buf.len() / min_entry_size.max(1))
}

/// Reads a `[short]` count followed by that many entries.
fn read_counted<'a, T>(
    buf: &mut &'a [u8],
    mut read_entry: impl FnMut(&mut &'a [u8]) -> Result<T, LowLevelDeserializationError>,
) -> Result<Vec<T>, LowLevelDeserializationError> {
    let count = read_short_length(buf)?;
    (0..count).map(|_| read_entry(buf)).collect()
}

fn write_counted<B: BufMut, I: ExactSizeIterator>(
    entries: I,
    buf: &mut B,
    mut write_entry: impl FnMut(I::Item, &mut B) -> Result<(), TryFromIntError>,
) -> Result<(), TryFromIntError> {
    write_short_length(entries.len(), buf)?;
    entries
        .into_iter()
        .try_for_each(|entry| write_entry(entry, buf))
}

pub fn read_string_list(buf: &mut &[u8]) -> Result<Vec<String>, LowLevelDeserializationError> {
    read_counted(buf, |b| read_string(b).map(str::to_owned))
}

pub fn write_string_list(v: &[String], buf: &mut impl BufMut) -> Result<(), TryFromIntError> {
    write_counted(v.iter(), buf, |s, b| write_string(s, b))
}

pub fn read_string_map(
    buf: &mut &[u8],
) -> Result<HashMap<String, String>, LowLevelDeserializationError> {
    let entries = read_counted(buf, |b| {
        Ok((read_string(b)?.to_owned(), read_string(b)?.to_owned()))
    })?;
    Ok(entries.into_iter().collect())
}

pub fn write_string_map(
    v: &HashMap<impl AsRef<str>, impl AsRef<str>>,
    buf: &mut impl BufMut,
) -> Result<(), TryFromIntError> {
    write_counted(v.iter(), buf, |(key, val), b| {
        write_string(key.as_ref(), b)?;
        write_string(val.as_ref(), b)
    })
}

pub fn read_string_multimap(
    buf: &mut &[u8],
) -> Result<HashMap<String, Vec<String>>, LowLevelDeserializationError> {
    let entries = read_counted(buf, |b| {
        Ok((read_string(b)?.to_owned(), read_string_list(b)?))
    })?;
    Ok(entries.into_iter().collect())
}

pub fn write_string_multimap(
    v: &HashMap<String, Vec<String>>,
    buf: &mut impl BufMut,
) -> Result<(), TryFromIntError> {
    write_counted(v.iter(), buf, |(key, values), b| {
        write_string(key, b)?;
        write_string_list(values, b)
    })
}

/// `[bytes map]`, used for custom payloads. Values may be null.
pub fn read_bytes_map(
    buf: &mut &[u8],
) -> Result<HashMap<String, Option<Bytes>>, LowLevelDeserializationError> {
    let entries = read_counted(buf, |b| {
        let key = read_string(b)?.to_owned();
        Ok((key, read_bytes_opt(b)?.map(Bytes::copy_from_slice)))
    })?;
    Ok(entries.into_iter().collect())
}

pub fn write_bytes_map(
    v: &HashMap<String, Option<Bytes>>,
    buf: &mut impl BufMut,
) -> Result<(), TryFromIntError> {
    write_counted(v.iter(), buf, |(key, val), b| {
        write_string(key, b)?;
        write_bytes_opt(val.as_ref(), b)
    })
}

pub fn read_uuid(buf: &mut &[u8]) -> Result<Uuid, LowLevelDeserializationError> {
    read_array(buf).map(Uuid::from_bytes)
}

pub fn write_uuid(uuid: &Uuid, buf: &mut impl BufMut) {
    buf.put_slice(uuid.as_bytes());
}

pub fn read_consistency(buf: &mut &[u8]) -> Result<Consistency, LowLevelDeserializationError> {
    Ok(Consistency::try_from(read_short(buf)?)?)
}

pub fn write_consistency(c: Consistency, buf: &mut impl BufMut) {
    write_short(c as u16, buf);
}

pub fn write_serial_consistency(c: SerialConsistency, buf: &mut impl BufMut) {
    write_short(c as u16, buf);
}

/// `[inetaddr]`: one length byte, then 4 or 16 address bytes.
pub fn read_inetaddr(buf: &mut &[u8]) -> Result<IpAddr, LowLevelDeserializationError> {
    match read_byte(buf)? {
        4 => read_array::<4>(buf).map(IpAddr::from),
        16 => read_array::<16>(buf).map(IpAddr::from),
        len => Err(LowLevelDeserializationError::InvalidInetLength(len)),
    }
}

pub fn write_inetaddr(addr: IpAddr, buf: &mut impl BufMut) {
    match addr {
        IpAddr::V4(v4) => {
            buf.put_u8(4);
            buf.put_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            buf.put_u8(16);
            buf.put_slice(&v6.octets());
        }
    }
}

/// `[inet]`: an `[inetaddr]` and an `[int]` port.
pub fn read_inet(buf: &mut &[u8]) -> Result<SocketAddr, LowLevelDeserializationError> {
    let ip = read_inetaddr(buf)?;
    let port = read_int(buf)?;
    Ok(SocketAddr::new(ip, port as u16))
}

pub fn write_inet(addr: SocketAddr, buf: &mut impl BufMut) {
    write_inetaddr(addr.ip(), buf);
    write_int(addr.port().into(), buf);
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, Ipv6Addr};

    use bytes::BytesMut;

    use super::*;

    #[test]
    fn integers_are_big_endian() {
        let mut buf = Vec::new();
        write_short(0x0102, &mut buf);
        write_int(-2, &mut buf);
        write_long(0x0102030405060708, &mut buf);
        assert_eq!(
            buf,
            [1, 2, 0xff, 0xff, 0xff, 0xfe, 1, 2, 3, 4, 5, 6, 7, 8]
        );

        let mut rest = &buf[..];
        assert_eq!(read_short(&mut rest).unwrap(), 0x0102);
        assert_eq!(read_int(&mut rest).unwrap(), -2);
        assert_eq!(read_long(&mut rest).unwrap(), 0x0102030405060708);
        assert!(rest.is_empty());
    }

    #[test]
    fn negative_bytes_length_is_null() {
        let mut buf = Vec::new();
        write_bytes_opt(None::<&[u8]>, &mut buf).unwrap();
        write_bytes_opt(Some(b"ab"), &mut buf).unwrap();

        let mut rest = &buf[..];
        assert_eq!(read_bytes_opt(&mut rest).unwrap(), None);
        assert_eq!(read_bytes_opt(&mut rest).unwrap(), Some(&b"ab"[..]));

        // Where null is not allowed, a negative length is an error.
        assert!(read_bytes(&mut &buf[..]).is_err());
    }

    #[test]
    fn short_input_reports_missing_bytes() {
        let buf = [0u8, 5, b'a', b'b'];
        match read_string(&mut &buf[..]) {
            Err(LowLevelDeserializationError::TooFewBytesReceived { expected, received }) => {
                assert_eq!((expected, received), (5, 2));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn capacity_hint_is_bounded_by_input() {
        assert_eq!(capacity_hint(3, &[0; 100], 4), 3);
        assert_eq!(capacity_hint(usize::MAX, &[0; 10], 4), 2);
        assert_eq!(capacity_hint(5, &[0; 10], 0), 5);
    }

    #[test]
    fn bytes_map_keeps_null_values() {
        let mut val = HashMap::new();
        val.insert("".to_owned(), Some(Bytes::new()));
        val.insert("a".to_owned(), Some(Bytes::from_static(&[10, 20])));
        val.insert("b".to_owned(), None);
        let mut buf = BytesMut::new();
        write_bytes_map(&val, &mut buf).unwrap();
        assert_eq!(read_bytes_map(&mut &*buf).unwrap(), val);
    }

    #[test]
    fn supported_options_multimap() {
        let mut val = HashMap::new();
        val.insert("SCYLLA_NR_SHARDS".to_owned(), vec!["4".to_owned()]);
        val.insert(
            "CQL_VERSION".to_owned(),
            vec!["3.0.0".to_owned(), "3.4.5".to_owned()],
        );
        val.insert("empty".to_owned(), vec![]);
        let mut buf = Vec::new();
        write_string_multimap(&val, &mut buf).unwrap();
        assert_eq!(read_string_multimap(&mut &buf[..]).unwrap(), val);
    }

    #[test]
    fn unknown_consistency_is_named_in_error() {
        let mut buf = Vec::new();
        write_consistency(Consistency::EachQuorum, &mut buf);
        assert_eq!(
            read_consistency(&mut &buf[..]).unwrap(),
            Consistency::EachQuorum
        );

        buf.clear();
        buf.put_u16(0x1234);
        let err = read_consistency(&mut &buf[..]).unwrap_err();
        assert!(err.to_string().contains("4660"), "{err}");
    }

    #[test]
    fn inet_both_families() {
        let v4 = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)), 9042);
        let v6 = SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 19042);
        let mut buf = Vec::new();
        write_inet(v4, &mut buf);
        write_inet(v6, &mut buf);
        assert_eq!(buf.len(), (1 + 4 + 4) + (1 + 16 + 4));

        let mut rest = &buf[..];
        assert_eq!(read_inet(&mut rest).unwrap(), v4);
        assert_eq!(read_inet(&mut rest).unwrap(), v6);
    }

    #[test]
    fn bad_inet_length_and_truncation() {
        assert!(matches!(
            read_inetaddr(&mut &[5u8, 1, 2, 3, 4, 5][..]),
            Err(LowLevelDeserializationError::InvalidInetLength(5))
        ));
        assert!(read_inetaddr(&mut &[4u8, 127, 0][..]).is_err());
    }
}
