//! Utilities for binary serialization/deserialization.
//!
//! The [`LeSer`] trait lets us define data structures that match the
//! records exchanged between the WAL proxy and the safekeepers: fixed
//! field order, fixed integer widths, little-endian byte order, no
//! packing. The encoding is defined here, not by anyone's in-memory
//! struct layout, so both sides agree on the wire format regardless of
//! platform.

#![warn(missing_docs)]

use bincode::Options;
use serde::{de::DeserializeOwned, Serialize};
use std::io::{Read, Write};
use thiserror::Error;

/// An error that occurred during a deserialize operation
///
/// This could happen because the input data was too short,
/// or because an invalid value was encountered.
#[derive(Debug, Error)]
#[error("deserialize error")]
pub struct DeserializeError;

/// An error that occurred during a serialize operation
///
/// This probably means our [`Write`] failed, e.g. we tried
/// to write beyond the end of a buffer.
#[derive(Debug, Error)]
#[error("serialize error")]
pub struct SerializeError;

/// A shortcut that configures little-endian binary serialization
///
/// Properties:
/// - Little endian
/// - Fixed integer encoding (i.e. 1u32 is 01000000 not 01)
/// - Allow trailing bytes: this means we don't throw an error
///   if the deserializer is passed a buffer with more data
///   past the end.
pub fn le_coder() -> impl Options {
    bincode::DefaultOptions::new()
        .with_little_endian()
        .with_fixint_encoding()
        .allow_trailing_bytes()
}

/// Binary serialize/deserialize helper functions (little-endian)
pub trait LeSer: Serialize + DeserializeOwned {
    /// Serialize into a borrowed writer
    fn ser_into<W: Write>(&self, w: &mut W) -> Result<(), SerializeError> {
        le_coder().serialize_into(w, &self).or(Err(SerializeError))
    }

    /// Serialize into a new heap-allocated buffer
    fn ser(&self) -> Result<Vec<u8>, SerializeError> {
        le_coder().serialize(&self).or(Err(SerializeError))
    }

    /// Deserialize from a byte slice
    fn des(buf: &[u8]) -> Result<Self, DeserializeError> {
        le_coder().deserialize(buf).or(Err(DeserializeError))
    }

    /// Deserialize from a reader
    ///
    /// tip: `&[u8]` implements `Read`
    fn des_from<R: Read>(r: R) -> Result<Self, DeserializeError> {
        le_coder().deserialize_from(r).or(Err(DeserializeError))
    }
}

impl<T> LeSer for T where T: Serialize + DeserializeOwned {}

#[cfg(test)]
mod tests {
    use super::LeSer;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    pub struct ShortStruct {
        a: u8,
        b: u32,
    }

    #[test]
    fn le_short() {
        let x = ShortStruct { a: 7, b: 65536 };

        let encoded = x.ser().unwrap();

        assert_eq!(encoded, vec![7, 0, 0, 1, 0]);

        let raw = [8u8, 0, 0, 3, 7];
        let decoded = ShortStruct::des(&raw).unwrap();

        assert_eq!(
            decoded,
            ShortStruct {
                a: 8,
                b: 0x07030000
            }
        );

        // has trailing data
        let raw = [8u8, 0, 0, 3, 7, 0xFF, 0xFF, 0xFF];
        let _ = ShortStruct::des(&raw).unwrap();

        // short read must fail, not succeed with zeroes
        let raw = [8u8, 0, 0];
        ShortStruct::des(&raw).unwrap_err();
    }

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    pub struct IdentRecord {
        term: u64,
        id: [u8; 16],
    }

    #[test]
    fn le_record() {
        let rec = IdentRecord {
            term: 0x1000_2000_3000_4000,
            id: *b"0123456789abcdef",
        };

        let encoded = rec.ser().unwrap();
        let expected = hex_literal::hex!(
            "0040 0030 0020 0010 3031 3233 3435 3637 3839 6162 6364 6566"
        );
        assert_eq!(encoded, expected);

        let rec2 = IdentRecord::des(&encoded).unwrap();
        assert_eq!(rec, rec2);
    }
}
