//! Generational Hashing
//!
//! A deterministic 128-bit content hash over cluster documents, used as an
//! opaque version token during diff negotiation. Equal documents hash equal
//! on any host and any run; distinct documents collide only with
//! cryptographic improbability. Determinism rests on the documents using
//! ordered maps, so their canonical JSON encoding is unique.

use crate::error::{VolmeshError, VolmeshResult};
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Opaque 128-bit version token for a specific document version
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GenerationHash([u8; 16]);

impl GenerationHash {
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for GenerationHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl FromStr for GenerationHash {
    type Err = VolmeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || VolmeshError::InvalidArgument {
            name: "generation".to_string(),
            reason: format!("not a 32-character hex string: {s:?}"),
        };
        if s.len() != 32 {
            return Err(invalid());
        }
        let mut bytes = [0u8; 16];
        for (i, chunk) in bytes.iter_mut().enumerate() {
            *chunk = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).map_err(|_| invalid())?;
        }
        Ok(Self(bytes))
    }
}

impl Serialize for GenerationHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for GenerationHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct HexVisitor;

        impl Visitor<'_> for HexVisitor {
            type Value = GenerationHash;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a 32-character hex string")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
                value.parse().map_err(|_| E::custom("invalid generation hash"))
            }
        }

        deserializer.deserialize_str(HexVisitor)
    }
}

/// Hash a document to its generation token.
///
/// The hash is the first 16 bytes of SHA-256 over the document's canonical
/// JSON encoding.
pub fn generation_hash<T: Serialize>(document: &T) -> VolmeshResult<GenerationHash> {
    let canonical = serde_json::to_vec(document)?;
    let digest = Sha256::digest(&canonical);
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Ok(GenerationHash(bytes))
}
