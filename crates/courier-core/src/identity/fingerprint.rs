//! Identity fingerprints
//!
//! Format: 64 lowercase hex characters (BLAKE3 digest of the public key).
//!
//! The fingerprint is the public handle for an identity. Every DHT key this
//! crate touches is derived from one, so it must be stable, cheap to compare
//! and safe to embed in key derivation input.

use crate::error::CourierError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Length of a fingerprint in bytes
pub const FINGERPRINT_LEN: usize = 32;

/// Hash-derived identifier of a public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint([u8; FINGERPRINT_LEN]);

impl Fingerprint {
    /// Derive the fingerprint of a serialized public key.
    pub fn from_public_key(public_key: &[u8]) -> Self {
        Self(*blake3::hash(public_key).as_bytes())
    }

    /// Wrap raw digest bytes.
    pub fn from_bytes(bytes: [u8; FINGERPRINT_LEN]) -> Self {
        Self(bytes)
    }

    /// Raw digest bytes
    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_LEN] {
        &self.0
    }

    /// Full hex rendering
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 8 hex chars, for logs
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Parse a fingerprint from its hex rendering.
    pub fn parse(s: &str) -> Result<Self, CourierError> {
        let s = s.trim();
        if s.len() != FINGERPRINT_LEN * 2 {
            return Err(CourierError::Param(format!(
                "fingerprint must be {} hex chars, got {}",
                FINGERPRINT_LEN * 2,
                s.len()
            )));
        }
        let bytes = hex::decode(s)
            .map_err(|e| CourierError::Param(format!("fingerprint is not hex: {}", e)))?;
        let mut out = [0u8; FINGERPRINT_LEN];
        out.copy_from_slice(&bytes);
        Ok(Self(out))
    }

    /// True if `public_key` hashes to this fingerprint.
    pub fn matches(&self, public_key: &[u8]) -> bool {
        Self::from_public_key(public_key) == *self
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

impl FromStr for Fingerprint {
    type Err = CourierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = CourierError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<Fingerprint> for String {
    fn from(fp: Fingerprint) -> Self {
        fp.to_hex()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_deterministic() {
        let a = Fingerprint::from_public_key(b"public key bytes");
        let b = Fingerprint::from_public_key(b"public key bytes");
        assert_eq!(a, b);
        assert_ne!(a, Fingerprint::from_public_key(b"other key"));
    }

    #[test]
    fn test_fingerprint_hex_parse() {
        let fp = Fingerprint::from_public_key(b"key");
        let hex = fp.to_hex();
        assert_eq!(hex.len(), 64);

        let parsed: Fingerprint = hex.parse().expect("should parse");
        assert_eq!(parsed, fp);
        assert!(fp.matches(b"key"));
    }

    #[test]
    fn test_fingerprint_rejects_bad_input() {
        assert!(Fingerprint::parse("abc").is_err());
        assert!(Fingerprint::parse(&"zz".repeat(32)).is_err());
        assert!(matches!(
            Fingerprint::parse(""),
            Err(CourierError::Param(_))
        ));
    }

    #[test]
    fn test_fingerprint_serde_as_string() {
        let fp = Fingerprint::from_public_key(b"serde");
        let json = serde_json::to_string(&fp).unwrap();
        assert_eq!(json, format!("\"{}\"", fp.to_hex()));

        let back: Fingerprint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, fp);

        assert!(serde_json::from_str::<Fingerprint>("\"nothex\"").is_err());
    }
}
