//! Primitive cryptographic types

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::str::FromStr;

/// A tree digest (32 bytes regardless of the digest function)
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest([u8; 32]);

// Serialized as lowercase hex, the form used in every payload
impl Serialize for Digest {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let hex_str = String::deserialize(deserializer)?;
        Self::from_hex(&hex_str).map_err(serde::de::Error::custom)
    }
}

impl Digest {
    pub const LEN: usize = 32;

    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        if slice.len() != Self::LEN {
            return Err(Error::InvalidDigestLength {
                expected: Self::LEN,
                actual: slice.len(),
            });
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)?;
        Self::from_slice(&bytes)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Digest function applied at every tree level and binding step.
///
/// The serialized name is the `op` tag of the proof ops array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum HashFunction {
    #[default]
    #[serde(rename = "sha-256")]
    Sha256,
    #[serde(rename = "sha-256-x2")]
    Sha256x2,
    #[serde(rename = "blake3")]
    Blake3,
}

impl HashFunction {
    pub fn tag(&self) -> &'static str {
        match self {
            HashFunction::Sha256 => "sha-256",
            HashFunction::Sha256x2 => "sha-256-x2",
            HashFunction::Blake3 => "blake3",
        }
    }

    /// Digest the concatenation of `parts`
    pub fn digest(&self, parts: &[&[u8]]) -> Digest {
        match self {
            HashFunction::Sha256 => Digest::new(sha256(parts)),
            HashFunction::Sha256x2 => {
                let once = sha256(parts);
                Digest::new(sha256(&[&once]))
            }
            HashFunction::Blake3 => {
                let mut hasher = blake3::Hasher::new();
                for part in parts {
                    hasher.update(part);
                }
                Digest::new(*hasher.finalize().as_bytes())
            }
        }
    }

    /// Hash a pair of nodes: H(left || right)
    pub fn hash_pair(&self, left: &Digest, right: &Digest) -> Digest {
        self.digest(&[left.as_bytes(), right.as_bytes()])
    }
}

fn sha256(parts: &[&[u8]]) -> [u8; 32] {
    use sha2::Digest as _;

    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

impl FromStr for HashFunction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sha-256" => Ok(HashFunction::Sha256),
            "sha-256-x2" => Ok(HashFunction::Sha256x2),
            "blake3" => Ok(HashFunction::Blake3),
            other => Err(Error::UnsupportedHashFunction(other.to_string())),
        }
    }
}

impl fmt::Display for HashFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_digest_roundtrip() {
        let digest = Digest::new([42u8; 32]);
        let hex = digest.to_hex();
        let parsed = Digest::from_hex(&hex).unwrap();
        assert_eq!(digest, parsed);
    }

    #[test]
    fn test_sha256_known_vector() {
        let digest = HashFunction::Sha256.digest(&[b"abc"]);
        assert_eq!(
            digest.to_hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_digest_concatenates_parts() {
        for f in [HashFunction::Sha256, HashFunction::Sha256x2, HashFunction::Blake3] {
            assert_eq!(f.digest(&[b"ab", b"c"]), f.digest(&[b"abc"]));
        }
    }

    #[test]
    fn test_sha256x2_is_double_hash() {
        let once = HashFunction::Sha256.digest(&[b"abc"]);
        let twice = HashFunction::Sha256.digest(&[once.as_bytes()]);
        assert_eq!(HashFunction::Sha256x2.digest(&[b"abc"]), twice);
    }

    #[test]
    fn test_hash_function_tags() {
        for f in [HashFunction::Sha256, HashFunction::Sha256x2, HashFunction::Blake3] {
            assert_eq!(f.tag().parse::<HashFunction>().unwrap(), f);
            let json = serde_json::to_string(&f).unwrap();
            assert_eq!(json, format!("\"{}\"", f.tag()));
        }
        assert!("sha-512".parse::<HashFunction>().is_err());
    }

    prop_compose! {
        fn arb_digest()(bytes in prop::array::uniform32(any::<u8>())) -> Digest {
            Digest::new(bytes)
        }
    }

    proptest! {
        #[test]
        fn prop_hash_pair_non_commutative(a in arb_digest(), b in arb_digest()) {
            prop_assume!(a != b);
            let f = HashFunction::Sha256;
            prop_assert_ne!(f.hash_pair(&a, &b), f.hash_pair(&b, &a));
        }

        #[test]
        fn prop_digest_from_slice_validates_len(
            bytes in prop::collection::vec(any::<u8>(), 0..128)
        ) {
            if bytes.len() != 32 {
                prop_assert!(Digest::from_slice(&bytes).is_err());
            } else {
                prop_assert!(Digest::from_slice(&bytes).is_ok());
            }
        }

        #[test]
        fn prop_digest_from_hex_validates(s in "[0-9a-fA-F]{0,100}") {
            match Digest::from_hex(&s) {
                Ok(_) => prop_assert_eq!(s.len(), 64),
                Err(_) => prop_assert_ne!(s.len(), 64),
            }
        }
    }
}
