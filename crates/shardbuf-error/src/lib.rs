#![forbid(unsafe_code)]
//! Error types for the shardbuf block cache.
//!
//! # Error Taxonomy
//!
//! [`CacheError`] is the single user-facing error type for the whole
//! workspace. Two of its variants are *unrecoverable by policy*:
//!
//! | Variant | Meaning | Recovery |
//! |---------|---------|----------|
//! | `Exhausted` | Every slot in every shard is referenced | None: resource leak or undersized pool |
//! | `ContractViolation` | A caller broke an API precondition (e.g. unbalanced unpin) | None: programming error |
//! | `Io` | The device adapter failed a load/store | Caller's policy |
//! | `OutOfRange` | Block number past the end of the device | Caller bug or bad geometry |
//! | `UnknownDevice` | Store asked about a device it does not back | Caller bug or bad wiring |
//! | `ReadOnly` | Write through a read-only store | Caller's policy |
//! | `Config` | Invalid construction parameters | Fix configuration |
//!
//! There is deliberately no transient, retryable class at this layer: a
//! caller that sees [`CacheError::is_unrecoverable`] return `true` must not
//! retry or continue, since cache invariants may already be broken.
//!
//! This crate stays independent of `shardbuf-types` so that the types crate
//! can grow validation errors of its own without a dependency cycle.

use thiserror::Error;

/// Unified error type for all shardbuf operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Operating system I/O error from a device adapter.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No free slot in any shard: every slot is currently referenced.
    ///
    /// Signals a reference leak or an undersized pool, not a transient
    /// condition; retrying cannot succeed until references are released.
    #[error("cache exhausted: all {total_slots} slots are referenced")]
    Exhausted { total_slots: usize },

    /// A caller broke an API precondition.
    ///
    /// Indicates a programming error in the caller (unpin without a
    /// matching pin, unpin of a non-resident block), never an environment
    /// fault. The operation stopped before mutating cache state.
    #[error("cache contract violation: {0}")]
    ContractViolation(String),

    /// Invalid construction parameters.
    #[error("invalid cache configuration: {0}")]
    Config(String),

    /// Block number does not exist on the backing device.
    #[error("block out of range: block {block} of {block_count}")]
    OutOfRange { block: u64, block_count: u64 },

    /// The store does not back the requested device.
    #[error("unknown device: {device}")]
    UnknownDevice { device: u32 },

    /// Write attempted through a read-only store.
    #[error("store is read-only")]
    ReadOnly,
}

impl CacheError {
    /// Whether this error means the caller must stop rather than retry.
    ///
    /// True exactly for [`CacheError::Exhausted`] and
    /// [`CacheError::ContractViolation`]. Continuing after either risks
    /// silently violating cache invariants.
    #[must_use]
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, Self::Exhausted { .. } | Self::ContractViolation(_))
    }

    /// Shorthand constructor for contract violations.
    #[must_use]
    pub fn contract(detail: impl Into<String>) -> Self {
        Self::ContractViolation(detail.into())
    }
}

/// Result alias using `CacheError`.
pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrecoverable_policy_covers_exhaustion_and_contract() {
        assert!(CacheError::Exhausted { total_slots: 8 }.is_unrecoverable());
        assert!(CacheError::contract("unpin without pin").is_unrecoverable());

        assert!(!CacheError::Io(std::io::Error::other("disk gone")).is_unrecoverable());
        assert!(
            !CacheError::OutOfRange {
                block: 9,
                block_count: 8
            }
            .is_unrecoverable()
        );
        assert!(!CacheError::UnknownDevice { device: 3 }.is_unrecoverable());
        assert!(!CacheError::ReadOnly.is_unrecoverable());
        assert!(!CacheError::Config("zero shards".into()).is_unrecoverable());
    }

    #[test]
    fn display_formatting() {
        let err = CacheError::Exhausted { total_slots: 30 };
        assert_eq!(err.to_string(), "cache exhausted: all 30 slots are referenced");

        let err = CacheError::contract("unpin of non-resident block");
        assert_eq!(
            err.to_string(),
            "cache contract violation: unpin of non-resident block"
        );

        let err = CacheError::OutOfRange {
            block: 12,
            block_count: 8,
        };
        assert_eq!(err.to_string(), "block out of range: block 12 of 8");
    }
}
