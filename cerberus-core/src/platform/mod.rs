//! Platform abstraction traits.
//!
//! This module defines the board-provided capabilities the security core
//! depends on. The firmware image wires in flash, removable-media, secure
//! element and UI drivers; the host emulator and tests use the
//! implementations in [`memory`] and [`fs`].
//!
//! - [`SlotMedium`]: Named-file store backing durable slots (internal flash)
//! - [`RemovableMedium`]: Slot medium that can be absent (SD card)
//! - [`Clock`]: Monotonic time source and blocking sleep
//! - [`SecureElement`]: Attestation key slot and certificate storage
//! - [`BootloaderState`]: Whether the bootloader is locked
//! - [`ConfirmationPrompt`]: On-device user confirmation

pub mod fs;
pub mod memory;

use thiserror::Error;

use crate::storage::StorageResult;

/// Named-file store used by durable slots.
///
/// Paths are absolute, `/`-separated and never contain `..`. `write` is not
/// required to be atomic; `rename` and `replace` must be.
pub trait SlotMedium: Send + Sync {
    /// Reads the file at `path`, if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn read(&self, path: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Creates or truncates `path` and writes `bytes` to it.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails. The file may then hold a prefix
    /// of `bytes`.
    fn write(&self, path: &str, bytes: &[u8]) -> StorageResult<()>;

    /// Atomically renames `from` to `to`. `to` must not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if `from` is missing or the rename fails, in which
    /// case both files are left untouched.
    fn rename(&self, from: &str, to: &str) -> StorageResult<()>;

    /// Atomically renames `from` over `to`, replacing `to` if it exists.
    ///
    /// # Errors
    ///
    /// Returns an error if `from` is missing or the rename fails, in which
    /// case both files are left untouched.
    fn replace(&self, from: &str, to: &str) -> StorageResult<()>;

    /// Removes `path`. Returns whether a file was removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be removed.
    fn remove(&self, path: &str) -> StorageResult<bool>;

    /// Lists the file names directly inside directory `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read. A missing
    /// directory yields an empty list.
    fn list(&self, dir: &str) -> StorageResult<Vec<String>>;

    /// Creates `dir` and all missing parents.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be created.
    fn create_dir_all(&self, dir: &str) -> StorageResult<()>;
}

/// Slot medium that may be removed from the device.
pub trait RemovableMedium: SlotMedium {
    /// Returns whether the medium is inserted and mounted.
    fn is_present(&self) -> bool;
}

/// Monotonic time source.
pub trait Clock: Send + Sync {
    /// Milliseconds since an arbitrary fixed origin.
    fn now_ms(&self) -> u64;

    /// Blocks for `ms` milliseconds.
    fn sleep_ms(&self, ms: u64);
}

/// Errors reported by the secure element.
#[derive(Debug, Error)]
pub enum SecureElementError {
    /// The key slot refused to sign.
    #[error("signing inaccessible")]
    SigningInaccessible,
    /// The secure element did not respond or returned garbage.
    #[error("secure element failure: {0}")]
    Device(String),
}

/// Secure element holding the attestation key and certificate chain.
pub trait SecureElement: Send + Sync {
    /// Signs a 32-byte digest with the key in `key_slot`.
    ///
    /// # Errors
    ///
    /// Returns [`SecureElementError::SigningInaccessible`] if the slot is
    /// locked or empty.
    fn sign(&self, key_slot: u8, digest: &[u8; 32]) -> Result<Vec<u8>, SecureElementError>;

    /// Reads the raw concatenated DER certificate chain stored in `cert_slot`.
    ///
    /// # Errors
    ///
    /// Returns an error if the slot cannot be read.
    fn certificate(&self, cert_slot: u8) -> Result<Vec<u8>, SecureElementError>;
}

/// Reports the bootloader lock state.
pub trait BootloaderState: Send + Sync {
    /// Returns whether the bootloader is locked against unsigned firmware.
    fn is_locked(&self) -> bool;
}

/// Outcome of a confirmation prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The user approved.
    Confirmed,
    /// The user declined or the prompt was dismissed.
    Cancelled,
}

/// Text shown on a confirmation prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmationRequest {
    /// Screen title.
    pub title: &'static str,
    /// Body text.
    pub body: String,
}

/// On-device confirmation UI.
pub trait ConfirmationPrompt: Send + Sync {
    /// Shows `request` and waits for the user's decision.
    fn confirm(&self, request: &ConfirmationRequest) -> Decision;
}
