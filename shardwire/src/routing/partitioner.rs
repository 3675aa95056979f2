//! Partitioners compute the token of a partition key.
//!
//! Only Murmur3 is implemented. It reproduces the server's variant of
//! MurmurHash3 x64/128, which sign-extends tail bytes and keeps the first
//! 64 bits of the result.

use std::num::Wrapping;

use shardwire_cql::value::{SerializedValues, Value};
use thiserror::Error;

use crate::routing::Token;

#[derive(Clone, PartialEq, Eq, Debug, Default)]
#[non_exhaustive]
pub enum PartitionerName {
    #[default]
    Murmur3,
    /// A partitioner the driver cannot compute tokens for.
    Other(String),
}

impl PartitionerName {
    pub(crate) fn from_class_name(name: &str) -> Self {
        if name.ends_with("Murmur3Partitioner") {
            PartitionerName::Murmur3
        } else {
            PartitionerName::Other(name.to_owned())
        }
    }
}

/// Errors of computing a token out of bound values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TokenCalculationError {
    #[error("Value of length {0} is too long to be a partition key component")]
    ValueTooLong(usize),
    #[error("Partition key component {0} is unset")]
    UnsetComponent(usize),
    #[error("Partitioner {0} is not supported for routing")]
    UnsupportedPartitioner(String),
}

pub struct Murmur3Partitioner;

const C1: Wrapping<i64> = Wrapping(0x87c3_7b91_1142_53d5_u64 as i64);
const C2: Wrapping<i64> = Wrapping(0x4cf5_ad43_2745_937f_u64 as i64);

#[inline]
fn rotl(v: Wrapping<i64>, n: u32) -> Wrapping<i64> {
    Wrapping(v.0.rotate_left(n))
}

#[inline]
fn fmix(mut k: Wrapping<i64>) -> Wrapping<i64> {
    k ^= Wrapping((k.0 as u64 >> 33) as i64);
    k *= Wrapping(0xff51_afd7_ed55_8ccd_u64 as i64);
    k ^= Wrapping((k.0 as u64 >> 33) as i64);
    k *= Wrapping(0xc4ce_b9fe_1a85_ec53_u64 as i64);
    k ^= Wrapping((k.0 as u64 >> 33) as i64);
    k
}

#[inline]
fn mix_k1(k1: Wrapping<i64>) -> Wrapping<i64> {
    rotl(k1 * C1, 31) * C2
}

#[inline]
fn mix_k2(k2: Wrapping<i64>) -> Wrapping<i64> {
    rotl(k2 * C2, 33) * C1
}

impl Murmur3Partitioner {
    /// Computes the token of a serialized partition key.
    pub fn hash(&self, key: &[u8]) -> Token {
        let mut h1 = Wrapping(0_i64);
        let mut h2 = Wrapping(0_i64);

        let mut blocks = key.chunks_exact(16);
        for block in &mut blocks {
            let mut lo = [0u8; 8];
            let mut hi = [0u8; 8];
            lo.copy_from_slice(&block[..8]);
            hi.copy_from_slice(&block[8..]);

            h1 ^= mix_k1(Wrapping(i64::from_le_bytes(lo)));
            h1 = rotl(h1, 27) + h2;
            h1 = h1 * Wrapping(5) + Wrapping(0x52dc_e729);

            h2 ^= mix_k2(Wrapping(i64::from_le_bytes(hi)));
            h2 = rotl(h2, 31) + h1;
            h2 = h2 * Wrapping(5) + Wrapping(0x3849_5ab5);
        }

        // Tail bytes are sign-extended, matching the server.
        let tail = blocks.remainder();
        let fold = |bytes: &[u8]| {
            bytes
                .iter()
                .enumerate()
                .fold(Wrapping(0_i64), |acc, (i, b)| {
                    acc ^ (Wrapping(*b as i8 as i64) << (i * 8))
                })
        };
        if tail.len() > 8 {
            h2 ^= mix_k2(fold(&tail[8..]));
        }
        if !tail.is_empty() {
            h1 ^= mix_k1(fold(&tail[..tail.len().min(8)]));
        }

        let len = Wrapping(key.len() as i64);
        h1 ^= len;
        h2 ^= len;

        h1 += h2;
        h2 += h1;

        h1 = fmix(h1);
        h2 = fmix(h2);

        h1 += h2;

        Token::new(h1.0)
    }
}

/// Serializes partition key components the way the server does before
/// hashing: a single component is hashed as is, a composite key as
/// `(u16 length, bytes, 0x00)` per component.
pub fn serialize_partition_key(values: &SerializedValues) -> Result<Vec<u8>, TokenCalculationError> {
    let mut components = Vec::with_capacity(values.len());
    for (i, value) in values.iter().enumerate() {
        match value {
            Value::Bytes(bytes) => components.push(&bytes[..]),
            Value::Null => components.push(&[][..]),
            Value::Unset => return Err(TokenCalculationError::UnsetComponent(i)),
        }
    }

    if let [single] = components.as_slice() {
        return Ok(single.to_vec());
    }

    let mut key = Vec::new();
    for component in components {
        let len: u16 = component
            .len()
            .try_into()
            .map_err(|_| TokenCalculationError::ValueTooLong(component.len()))?;
        key.extend_from_slice(&len.to_be_bytes());
        key.extend_from_slice(component);
        key.push(0);
    }
    Ok(key)
}

/// Computes the token for the given partition key values and partitioner.
///
/// The values must form the complete partition key, in the order of the
/// table definition.
pub fn calculate_token_for_partition_key(
    partition_key: &SerializedValues,
    partitioner: &PartitionerName,
) -> Result<Token, TokenCalculationError> {
    match partitioner {
        PartitionerName::Murmur3 => {
            let key = serialize_partition_key(partition_key)?;
            Ok(Murmur3Partitioner.hash(&key))
        }
        PartitionerName::Other(name) => {
            Err(TokenCalculationError::UnsupportedPartitioner(name.clone()))
        }
    }
}
