use std::fmt;
use std::str::FromStr;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::TypeError;

/// Content-addressed identifier of a fragment.
///
/// An `ObjectId` is the first 16 bytes of the SHA-256 digest of a fragment's
/// canonical JSON body, rendered on the wire as 32 lowercase hex characters.
/// Identical content always produces the same id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; 16]);

impl ObjectId {
    /// Number of raw bytes in an id.
    pub const LEN: usize = 16;

    /// Number of hex characters in the wire form of an id.
    pub const HEX_LEN: usize = 32;

    /// Create an `ObjectId` from its raw bytes.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Truncate a full 32-byte digest to an id.
    pub fn from_digest(digest: &[u8; 32]) -> Self {
        let mut arr = [0u8; 16];
        arr.copy_from_slice(&digest[..16]);
        Self(arr)
    }

    /// The null object ID (all zeros). Represents "no object".
    pub const fn null() -> Self {
        Self([0u8; 16])
    }

    /// Returns `true` if this is the null object ID.
    pub fn is_null(&self) -> bool {
        self.0 == [0u8; 16]
    }

    /// The raw 16-byte id.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Hex-encoded wire representation.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short hex representation (first 8 characters), for logs.
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Parse from the 32-character hex wire form.
    pub fn from_hex(s: &str) -> Result<Self, TypeError> {
        if s.len() != Self::HEX_LEN {
            return Err(TypeError::InvalidLength {
                expected: Self::HEX_LEN,
                actual: s.len(),
            });
        }
        let bytes = hex::decode(s).map_err(|e| TypeError::InvalidHex(e.to_string()))?;
        let mut arr = [0u8; 16];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.short_hex())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for ObjectId {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl From<[u8; 16]> for ObjectId {
    fn from(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }
}

impl From<ObjectId> for [u8; 16] {
    fn from(id: ObjectId) -> Self {
        id.0
    }
}

impl Serialize for ObjectId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

struct ObjectIdVisitor;

impl<'de> Visitor<'de> for ObjectIdVisitor {
    type Value = ObjectId;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a 32-character hex object id")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
        ObjectId::from_hex(v).map_err(E::custom)
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_str(ObjectIdVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ObjectId {
        ObjectId::from_bytes([
            0x0a, 0x1b, 0x2c, 0x3d, 0x4e, 0x5f, 0x60, 0x71, 0x82, 0x93, 0xa4, 0xb5, 0xc6, 0xd7,
            0xe8, 0xf9,
        ])
    }

    #[test]
    fn null_is_all_zeros() {
        let null = ObjectId::null();
        assert!(null.is_null());
        assert_eq!(null.as_bytes(), &[0u8; 16]);
        assert!(!sample().is_null());
    }

    #[test]
    fn hex_roundtrip() {
        let id = sample();
        let hex = id.to_hex();
        assert_eq!(hex, "0a1b2c3d4e5f60718293a4b5c6d7e8f9");
        assert_eq!(ObjectId::from_hex(&hex).unwrap(), id);
    }

    #[test]
    fn from_digest_keeps_prefix() {
        let mut digest = [0u8; 32];
        for (i, b) in digest.iter_mut().enumerate() {
            *b = i as u8;
        }
        let id = ObjectId::from_digest(&digest);
        assert_eq!(id.as_bytes()[..], digest[..16]);
        assert_eq!(id.to_hex(), hex::encode(&digest[..16]));
    }

    #[test]
    fn rejects_wrong_length() {
        let err = ObjectId::from_hex("abcd").unwrap_err();
        assert_eq!(
            err,
            TypeError::InvalidLength {
                expected: 32,
                actual: 4
            }
        );
    }

    #[test]
    fn rejects_non_hex() {
        let bad = "zz".repeat(16);
        assert!(matches!(
            ObjectId::from_hex(&bad),
            Err(TypeError::InvalidHex(_))
        ));
    }

    #[test]
    fn short_hex_is_8_chars() {
        assert_eq!(sample().short_hex(), "0a1b2c3d");
    }

    #[test]
    fn display_is_full_hex() {
        let display = format!("{}", sample());
        assert_eq!(display.len(), 32);
        assert_eq!(display, sample().to_hex());
    }

    #[test]
    fn serde_as_hex_string() {
        let id = sample();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.to_hex()));
        let parsed: ObjectId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn parse_via_from_str() {
        let parsed: ObjectId = sample().to_hex().parse().unwrap();
        assert_eq!(parsed, sample());
    }

    #[test]
    fn ordering_is_consistent() {
        let id1 = ObjectId::from_bytes([0; 16]);
        let id2 = ObjectId::from_bytes([1; 16]);
        assert!(id1 < id2);
    }
}
