//! Core types for SHA-256d mining
//!
//! Work as advertised by the server, the queued [`WorkUnit`] built from it and
//! the [`NonceRange`] slices handed to kernels.

use crate::crypto;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::str::FromStr;
use std::sync::Arc;

/// Size of the block header material carried by a work unit
pub const HEADER_SIZE: usize = 80;

/// Offset of the nonce slot inside the header
pub const NONCE_OFFSET: usize = 76;

/// Largest nonce space a unit may advertise (the nonce is 32 bits wide)
pub const MAX_NONCES: u64 = 1 << 32;

/// Mining target, a 256-bit little-endian threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Target([u8; 32]);

impl Target {
    /// Create a target from its little-endian bytes
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Create target from a byte slice (32 bytes, little-endian)
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let array: [u8; 32] = bytes.try_into().map_err(|_| {
            Error::target(format!(
                "Invalid target length: expected 32 bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(array))
    }

    /// Little-endian bytes of the target
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Check if a hash (little-endian) meets this target
    pub fn is_met_by(&self, hash: &[u8; 32]) -> bool {
        crypto::check_target(hash, &self.0)
    }

    /// Convert to hexadecimal string (big-endian for display)
    pub fn to_hex_be(&self) -> String {
        let mut be = self.0;
        be.reverse();
        hex::encode(be)
    }

    /// Maximum possible target (easiest difficulty)
    pub fn max() -> Self {
        Self([0xff; 32])
    }
}

impl FromStr for Target {
    type Err = Error;

    /// Parse a big-endian hex string, as targets are usually displayed
    fn from_str(s: &str) -> Result<Self> {
        if s.len() != 64 {
            return Err(Error::target(format!(
                "Invalid target hex length: expected 64 chars, got {}",
                s.len()
            )));
        }
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| Error::target(format!("Invalid hex in target: {}", e)))?;
        bytes.reverse();
        Ok(Self(bytes))
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex_be())
    }
}

impl Serialize for Target {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex_be())
    }
}

impl<'de> Deserialize<'de> for Target {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Target::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Opaque token naming the block (work epoch) a unit belongs to
///
/// Two units with equal identifiers are work for the same block.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockId(String);

impl BlockId {
    /// Create a new block identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the identifier as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for BlockId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for BlockId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Work exactly as a connection received it from the server
///
/// Nothing here is validated; [`WorkUnit::from_advertised`] does that.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisedWork {
    /// Header material (at least 80 bytes, getwork word order)
    pub data: Vec<u8>,
    /// 256-bit little-endian target
    pub target: Vec<u8>,
    /// Exponent of the nonce space (`nonces = 2^mask`)
    pub mask: u32,
    /// Block this work belongs to
    pub identifier: BlockId,
}

/// A queued unit of work: one header and its whole nonce space
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkUnit {
    /// 76 static header bytes followed by the nonce slot
    pub data: [u8; HEADER_SIZE],
    /// Difficulty threshold
    pub target: Target,
    /// SHA-256 state after the first 64 bytes of the hash input
    pub midstate: [u8; 32],
    /// Size of the addressable nonce space
    pub nonces: u64,
    /// Block this unit belongs to
    pub identifier: BlockId,
}

impl WorkUnit {
    /// Build a unit from advertised work, rejecting malformed fields
    pub fn from_advertised(work: &AdvertisedWork) -> Result<Self> {
        if work.data.len() < HEADER_SIZE {
            return Err(Error::work(format!(
                "Header too short: expected {} bytes, got {}",
                HEADER_SIZE,
                work.data.len()
            )));
        }
        if work.mask > 32 {
            return Err(Error::work(format!(
                "Nonce space exponent {} exceeds the 32-bit nonce",
                work.mask
            )));
        }

        let mut data = [0u8; HEADER_SIZE];
        data.copy_from_slice(&work.data[..HEADER_SIZE]);
        let target = Target::from_bytes(&work.target)?;

        Ok(Self {
            midstate: crypto::calculate_midstate(&data),
            data,
            target,
            nonces: 1u64 << work.mask,
            identifier: work.identifier.clone(),
        })
    }
}

/// A slice of a unit's nonce space, handed out to exactly one kernel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonceRange {
    unit: Arc<WorkUnit>,
    base: u64,
    size: u64,
}

impl NonceRange {
    pub(crate) fn new(unit: Arc<WorkUnit>, base: u64, size: u64) -> Self {
        debug_assert!(base + size <= unit.nonces);
        Self { unit, base, size }
    }

    /// The unit this range was carved from
    pub fn unit(&self) -> &Arc<WorkUnit> {
        &self.unit
    }

    /// First nonce of the range
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Number of nonces to test
    pub fn size(&self) -> u64 {
        self.size
    }

    /// One past the last nonce of the range
    pub fn end(&self) -> u64 {
        self.base + self.size
    }

    /// The nonces covered by this range
    pub fn nonces(&self) -> Range<u64> {
        self.base..self.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn advertised(data_len: usize, target_len: usize, mask: u32) -> AdvertisedWork {
        AdvertisedWork {
            data: vec![0u8; data_len],
            target: vec![0xff; target_len],
            mask,
            identifier: BlockId::from("block-1"),
        }
    }

    #[test]
    fn test_target_hex_conversion() {
        let hex = "00000000ffff0000000000000000000000000000000000000000000000000000";
        let target = Target::from_str(hex).unwrap();
        assert_eq!(target.to_hex_be(), hex);
        assert_eq!(target.as_bytes()[28], 0x00);
        assert_eq!(target.as_bytes()[27], 0xff);
    }

    #[test]
    fn test_target_length_validation() {
        assert!(Target::from_bytes(&[0u8; 31]).is_err());
        assert!(Target::from_str("abcd").is_err());
        assert!(Target::from_bytes(&[0u8; 32]).is_ok());
    }

    #[test]
    fn test_unit_from_advertised() {
        let unit = WorkUnit::from_advertised(&advertised(128, 32, 32)).unwrap();
        assert_eq!(unit.nonces, MAX_NONCES);
        assert_eq!(unit.identifier.as_str(), "block-1");
        assert_eq!(unit.target, Target::max());
    }

    #[test]
    fn test_unit_rejects_malformed_work() {
        assert!(WorkUnit::from_advertised(&advertised(79, 32, 32)).is_err());
        assert!(WorkUnit::from_advertised(&advertised(80, 16, 32)).is_err());
        assert!(WorkUnit::from_advertised(&advertised(80, 32, 33)).is_err());
    }

    #[test]
    fn test_range_bounds() {
        let unit = Arc::new(WorkUnit::from_advertised(&advertised(80, 32, 16)).unwrap());
        let range = NonceRange::new(unit, 256, 1024);
        assert_eq!(range.end(), 1280);
        assert_eq!(range.nonces().count(), 1024);
    }
}
