#![forbid(unsafe_code)]
//! Identifier and unit types shared across the shardbuf workspace.
//!
//! Everything here is a small copyable newtype. The wrappers exist to keep
//! device ids, block numbers, slot indices, and recency stamps from being
//! mixed up at call sites; none of them carry behavior beyond validation
//! and unit conversion.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Stable identifier for a block device.
///
/// Assigned by whatever volume layer sits above the cache; the cache only
/// ever compares these for equality and routes on the block number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

/// The (device, block) pair a cache slot is keyed by.
///
/// At most one in-use slot system-wide holds a given key at a time; that
/// uniqueness is the cache's central invariant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockKey {
    pub device: DeviceId,
    pub block: BlockNumber,
}

impl BlockKey {
    #[must_use]
    pub fn new(device: DeviceId, block: BlockNumber) -> Self {
        Self { device, block }
    }
}

impl fmt::Display for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev {} block {}", self.device.0, self.block.0)
    }
}

/// Index of a slot in the cache's fixed slot pool.
///
/// Slots are allocated once at startup and never deallocated, so an index
/// is stable for the lifetime of the cache even as the slot's identity is
/// rewritten by eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotIndex(pub usize);

/// Monotonic recency stamp recorded when a slot becomes free.
///
/// Lower stamps are older and evicted first. A slot that has never been
/// used carries [`FreeStamp::NEVER_USED`], which ranks below every real
/// stamp (real stamps start at 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FreeStamp(pub u64);

impl FreeStamp {
    /// Sentinel for a slot that has never transitioned in-use -> free.
    pub const NEVER_USED: Self = Self(0);

    #[must_use]
    pub fn is_never_used(self) -> bool {
        self == Self::NEVER_USED
    }
}

/// Validated block size (must be a power of two in 512..=65536).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

/// Rejected [`BlockSize`] value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid block size {value}: must be a power of two in 512..=65536")]
pub struct InvalidBlockSize {
    pub value: u32,
}

impl BlockSize {
    /// Create a `BlockSize` if `value` is a power of two in [512, 65536].
    pub fn new(value: u32) -> Result<Self, InvalidBlockSize> {
        if !value.is_power_of_two() || !(512..=65536).contains(&value) {
            return Err(InvalidBlockSize { value });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    /// Block size as a `usize` buffer length.
    #[must_use]
    pub fn as_usize(self) -> usize {
        // Always fits: the validated range tops out at 65536.
        self.0 as usize
    }

    /// Byte offset of `block` on a device with this block size.
    ///
    /// Returns `None` on overflow.
    #[must_use]
    pub fn block_to_byte(self, block: BlockNumber) -> Option<u64> {
        block.0.checked_mul(u64::from(self.0))
    }
}

impl Default for BlockSize {
    fn default() -> Self {
        Self(4096)
    }
}
