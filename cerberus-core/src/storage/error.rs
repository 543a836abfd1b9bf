//! Error types for the record store and the media beneath it.

use thiserror::Error;

use crate::error::ErrorClass;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors raised by the record store, durable slots and slot media.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The underlying medium failed to read, write, rename or remove.
    #[error("medium error: {0}")]
    Medium(String),

    /// A record failed authentication and was not returned.
    #[error("integrity check failed for {0}")]
    Integrity(String),

    /// A committed frame is malformed and no staged copy could replace it.
    #[error("corrupted record: {0}")]
    Corrupted(String),

    /// Serialization/deserialization failures.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Cryptographic failures (AEAD, key wrapping).
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Unsupported key envelope version.
    #[error("unsupported envelope version: {0}")]
    UnsupportedEnvelopeVersion(u32),

    /// The record is protected and storage is locked.
    #[error("storage is locked")]
    Locked,

    /// The key belongs to the namespace reserved for the core.
    #[error("key {0:#06x} is reserved")]
    ReservedKey(u16),

    /// The value does not fit in a single record.
    #[error("value of {len} bytes exceeds the {max} byte record limit")]
    ValueTooLarge {
        /// Length of the rejected value.
        len: usize,
        /// Largest accepted value length.
        max: usize,
    },

    /// The operation needs a public record but the key is protected.
    #[error("key {0:#06x} is not public")]
    NotPublic(u16),

    /// Storage has no key envelope yet.
    #[error("storage not initialized")]
    NotInitialized,
}

impl StorageError {
    /// Helper to build a corrupted-record error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted(message.into())
    }

    /// Helper to build a medium error from any displayable failure.
    pub fn medium(err: impl std::fmt::Display) -> Self {
        Self::Medium(err.to_string())
    }

    /// Returns the recovery class of this error.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Integrity(_)
            | Self::Corrupted(_)
            | Self::Serialization(_)
            | Self::Crypto(_)
            | Self::UnsupportedEnvelopeVersion(_)
            | Self::Medium(_) => ErrorClass::Corruption,
            Self::ReservedKey(_) | Self::ValueTooLarge { .. } | Self::NotPublic(_) => {
                ErrorClass::User
            }
            Self::Locked | Self::NotInitialized => ErrorClass::Process,
        }
    }
}
